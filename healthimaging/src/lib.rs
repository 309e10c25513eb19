//! This crate converts image sets stored in AWS HealthImaging
//! into DICOM objects.
//!
//! An image set is described by a single gzip compressed JSON document
//! (see the [`metadata`] module),
//! while the pixel data of each instance is stored as a list of
//! HTJ2K encoded image frames.
//! Conversion fetches and decodes the frames of every instance
//! through a pool of frame fetch workers,
//! and maps the metadata onto a data set
//! through a pool of assembly workers (see [`mapper`]).
//! The resulting instances carry native pixel data
//! in the _Explicit VR Little Endian_ transfer syntax.
//!
//! Image sets are retrieved through an [`ImageSetSource`],
//! either the [`HealthImagingClient`] or an in-memory source.
//!
//! # Example
//!
//! ```no_run
//! use dicom_healthimaging::{save_as_dicom, AhiToDicom, HealthImagingClient};
//! # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = HealthImagingClient::with_region("us-east-1");
//! client.set_bearer_token("token");
//!
//! let converter = AhiToDicom::new(client);
//! for summary in converter.list_series("datastore", "imageset").await? {
//!     println!("{} ({})", summary.series_instance_uid, summary.modality);
//! }
//! let instances = converter.convert_series("datastore", "imageset", None).await?;
//! for instance in &instances {
//!     save_as_dicom(instance, "out")?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Conversion failures of individual instances are logged
//! and leave the instance out of the result;
//! only failing to obtain the image set metadata is reported as an error.
pub mod assemble;
pub mod client;
pub mod decode;
pub mod export;
pub mod fetch;
pub mod mapper;
pub mod metadata;
pub mod pipeline;
pub mod source;

pub use client::HealthImagingClient;
pub use decode::{DecodeError, FrameDecoder, Jpeg2000Decoder};
#[cfg(feature = "png")]
pub use export::save_as_png;
pub use export::{save_as_dicom, ExportError};
pub use mapper::{build_dataset, DicomInstance, VrList};
pub use metadata::{ImageSetMetadata, SeriesSummary};
pub use pipeline::{AhiToDicom, AhiToDicomOptions, Error};
pub use source::{ImageSetSource, InMemoryImageSetSource, SourceError};
