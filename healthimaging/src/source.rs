//! Abstraction over the origin of image set metadata and frame blobs.
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use snafu::{OptionExt, ResultExt, Snafu};

/// An error returned by an image set source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SourceError {
    #[snafu(display("Failed to perform HTTP request to {}", url))]
    RequestFailed { url: String, source: reqwest::Error },
    #[snafu(display("HTTP status code {} from {} indicates failure", status_code, url))]
    HttpStatusFailure { url: String, status_code: StatusCode },
    #[snafu(display("Failed to read response body from {}", url))]
    ReadBody { url: String, source: reqwest::Error },
    #[snafu(display("Failed to deserialize response from server"))]
    DeserializationFailed { source: reqwest::Error },
    #[snafu(display("No such {}", what))]
    NotFound { what: String },
    #[snafu(display("Could not compress metadata"))]
    CompressMetadata { source: std::io::Error },
}

/// A provider of image set metadata and compressed image frames.
///
/// Implementations are shared across every frame fetch worker
/// of a conversion, hence the `Send + Sync` requirement.
pub trait ImageSetSource: Send + Sync + 'static {
    /// Retrieve the gzip compressed JSON metadata of an image set.
    fn get_image_set_metadata(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> impl Future<Output = Result<Bytes, SourceError>> + Send;

    /// Retrieve one compressed (HTJ2K) image frame.
    fn get_image_frame(
        &self,
        datastore_id: &str,
        image_set_id: &str,
        image_frame_id: &str,
    ) -> impl Future<Output = Result<Bytes, SourceError>> + Send;

    /// Look up the identifiers of all image sets
    /// belonging to the study with the given Study Instance UID.
    fn search_image_sets(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;
}

/// An image set source backed by blobs held in memory.
///
/// Frame identifiers are unique within a data store,
/// so frames are keyed by data store and frame identifier only.
#[derive(Debug, Default, Clone)]
pub struct InMemoryImageSetSource {
    metadata: HashMap<(String, String), Bytes>,
    frames: HashMap<(String, String), Bytes>,
    frame_delays: HashMap<String, Duration>,
    studies: HashMap<(String, String), Vec<String>>,
}

impl InMemoryImageSetSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already compressed metadata blob.
    pub fn with_metadata_blob(
        mut self,
        datastore_id: &str,
        image_set_id: &str,
        blob: impl Into<Bytes>,
    ) -> Self {
        self.metadata.insert(
            (datastore_id.to_string(), image_set_id.to_string()),
            blob.into(),
        );
        self
    }

    /// Register the metadata of an image set,
    /// compressing it the way the service does.
    pub fn with_metadata_json(
        self,
        datastore_id: &str,
        image_set_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<Self, SourceError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(metadata.to_string().as_bytes())
            .context(CompressMetadataSnafu)?;
        let blob = encoder.finish().context(CompressMetadataSnafu)?;
        Ok(self.with_metadata_blob(datastore_id, image_set_id, blob))
    }

    /// Register a compressed image frame.
    pub fn with_frame(
        mut self,
        datastore_id: &str,
        image_frame_id: &str,
        blob: impl Into<Bytes>,
    ) -> Self {
        self.frames.insert(
            (datastore_id.to_string(), image_frame_id.to_string()),
            blob.into(),
        );
        self
    }

    /// Make every retrieval of the given frame take at least `delay`.
    pub fn with_frame_delay(mut self, image_frame_id: &str, delay: Duration) -> Self {
        self.frame_delays.insert(image_frame_id.to_string(), delay);
        self
    }

    /// Declare an image set as part of a study.
    pub fn with_study_image_set(
        mut self,
        datastore_id: &str,
        study_instance_uid: &str,
        image_set_id: &str,
    ) -> Self {
        self.studies
            .entry((datastore_id.to_string(), study_instance_uid.to_string()))
            .or_default()
            .push(image_set_id.to_string());
        self
    }
}

impl ImageSetSource for InMemoryImageSetSource {
    async fn get_image_set_metadata(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> Result<Bytes, SourceError> {
        self.metadata
            .get(&(datastore_id.to_string(), image_set_id.to_string()))
            .cloned()
            .context(NotFoundSnafu {
                what: format!("image set {}", image_set_id),
            })
    }

    async fn get_image_frame(
        &self,
        datastore_id: &str,
        _image_set_id: &str,
        image_frame_id: &str,
    ) -> Result<Bytes, SourceError> {
        if let Some(delay) = self.frame_delays.get(image_frame_id) {
            tokio::time::sleep(*delay).await;
        }
        self.frames
            .get(&(datastore_id.to_string(), image_frame_id.to_string()))
            .cloned()
            .context(NotFoundSnafu {
                what: format!("image frame {}", image_frame_id),
            })
    }

    async fn search_image_sets(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<String>, SourceError> {
        Ok(self
            .studies
            .get(&(datastore_id.to_string(), study_instance_uid.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
