//! Decoding of compressed image frames into native pixel data.
//!
//! HealthImaging stores every frame as an HTJ2K (High-Throughput JPEG 2000)
//! code stream, regardless of the transfer syntax of the imported instance.
//! The default decoder here relies on OpenJPEG,
//! which also accepts classic JPEG 2000 code streams.
use snafu::{ensure, Snafu};
use tracing::warn;

/// An error which may occur when decoding a frame.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    /// The blob is not a valid code stream
    #[snafu(display("Could not decode code stream: {}", message))]
    InvalidCodeStream { message: String },
    /// The code stream decoded into an image without components
    NoComponents,
    /// Samples are too wide to be stored as native pixel data
    #[snafu(display("Unsupported sample precision of {} bits", precision))]
    UnsupportedPrecision { precision: u32 },
}

/// A decoder of single compressed frames into native pixel data.
///
/// Implementations must be stateless:
/// the same decoder is shared by every frame fetch worker.
pub trait FrameDecoder: Send + Sync {
    /// Decode one compressed frame blob into
    /// interleaved, little endian native pixel data.
    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

impl<F> FrameDecoder for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DecodeError> + Send + Sync,
{
    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
        self(blob)
    }
}

/// Frame decoder for HTJ2K and JPEG 2000 code streams.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Jpeg2000Decoder;

impl FrameDecoder for Jpeg2000Decoder {
    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let image = jpeg2k::Image::from_bytes(blob).map_err(|e| DecodeError::InvalidCodeStream {
            message: e.to_string(),
        })?;

        let components = image.components();
        ensure!(!components.is_empty(), NoComponentsSnafu);

        let precision = components
            .iter()
            .map(|c| c.precision())
            .max()
            .unwrap_or(8);
        ensure!(precision <= 16, UnsupportedPrecisionSnafu { precision });
        let bytes_per_sample = if precision <= 8 { 1 } else { 2 };

        let samples_per_pixel = components.len();
        let pixel_count = components[0].data().len();
        let mut dst = vec![0_u8; pixel_count * samples_per_pixel * bytes_per_sample];

        // write each component in standard (interleaved) layout
        for (component_i, component) in components.iter().enumerate() {
            if component.data().len() != pixel_count {
                warn!(
                    "JPEG 2000 component {} has {} samples, expected {}",
                    component_i,
                    component.data().len(),
                    pixel_count
                );
            }
            for (i, sample) in component.data().iter().take(pixel_count).enumerate() {
                let offset = (i * samples_per_pixel + component_i) * bytes_per_sample;
                dst[offset..offset + bytes_per_sample]
                    .copy_from_slice(&sample.to_le_bytes()[..bytes_per_sample]);
            }
        }

        Ok(dst)
    }
}
