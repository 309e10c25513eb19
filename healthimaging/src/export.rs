//! Writing converted instances to disk.
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::mapper::DicomInstance;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ExportError {
    #[snafu(display("Could not create directory {}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Could not write DICOM file {}", path.display()))]
    WriteDicom {
        path: PathBuf,
        source: dicom_object::WriteError,
    },
    #[cfg(feature = "png")]
    /// Could not decode pixel data
    DecodePixelData { source: dicom_pixeldata::Error },
    #[cfg(feature = "png")]
    /// Could not convert pixel data to an image
    ConvertImage { source: dicom_pixeldata::Error },
    #[cfg(feature = "png")]
    #[snafu(display("Could not write image {}", path.display()))]
    WriteImage {
        path: PathBuf,
        source: image::ImageError,
    },
}

fn create_dir(dir: &Path) -> Result<(), ExportError> {
    std::fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })
}

/// Write an instance as a DICOM file named after its SOP Instance UID
/// in the given directory, which is created if missing.
///
/// Returns the path of the new file.
pub fn save_as_dicom(instance: &DicomInstance, dir: impl AsRef<Path>) -> Result<PathBuf, ExportError> {
    let dir = dir.as_ref();
    create_dir(dir)?;
    let path = dir.join(format!("{}.dcm", instance.sop_instance_uid()));
    instance
        .object()
        .write_to_file(&path)
        .context(WriteDicomSnafu { path: &path })?;
    debug!("Saved {}", path.display());
    Ok(path)
}

/// Render the first frame of an instance into an image file.
/// The image format follows the file extension (usually `.png`).
#[cfg(feature = "png")]
pub fn save_as_png(instance: &DicomInstance, path: impl AsRef<Path>) -> Result<(), ExportError> {
    use dicom_pixeldata::PixelDecoder;

    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir(parent)?;
    }
    let pixel = instance
        .object()
        .decode_pixel_data()
        .context(DecodePixelDataSnafu)?;
    let image = pixel.to_dynamic_image(0).context(ConvertImageSnafu)?;
    image.save(path).context(WriteImageSnafu { path })?;
    debug!("Saved {}", path.display());
    Ok(())
}
