//! HTTP client for the AWS HealthImaging runtime API.
//!
//! Request signing is not performed here:
//! callers either provide a bearer token
//! or extra headers (such as those produced by a signing proxy).
use bytes::Bytes;
pub use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use snafu::ResultExt;
use tracing::debug;

use crate::source::{
    DeserializationFailedSnafu, HttpStatusFailureSnafu, ImageSetSource, ReadBodySnafu,
    RequestFailedSnafu, SourceError,
};

#[derive(Debug, Clone)]
pub struct HealthImagingClient {
    endpoint: String,
    // Bearer Token
    pub(crate) bearer_token: Option<String>,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,

    pub(crate) client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchImageSetsResponse {
    #[serde(default)]
    image_sets_metadata_summaries: Vec<ImageSetSummary>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageSetSummary {
    image_set_id: String,
}

impl HealthImagingClient {
    /// Create a client for the given service endpoint,
    /// such as `https://runtime-medical-imaging.us-east-1.amazonaws.com`.
    pub fn with_endpoint(endpoint: &str) -> HealthImagingClient {
        HealthImagingClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bearer_token: None,
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a client for the public runtime endpoint of an AWS region.
    pub fn with_region(region: &str) -> HealthImagingClient {
        Self::with_endpoint(&format!(
            "https://runtime-medical-imaging.{region}.amazonaws.com"
        ))
    }

    pub fn set_bearer_token(&mut self, token: &str) -> &Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    /// Add a header to every request.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> &Self {
        self.headers.push((name, value));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<reqwest::Response, SourceError> {
        let mut request = self.client.post(url).query(query).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }

        let response = request
            .send()
            .await
            .context(RequestFailedSnafu { url })?;

        snafu::ensure!(
            response.status().is_success(),
            HttpStatusFailureSnafu {
                url,
                status_code: response.status(),
            }
        );
        Ok(response)
    }

    async fn post_for_bytes(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<Bytes, SourceError> {
        self.post(url, &[], body)
            .await?
            .bytes()
            .await
            .context(ReadBodySnafu { url })
    }
}

impl ImageSetSource for HealthImagingClient {
    async fn get_image_set_metadata(
        &self,
        datastore_id: &str,
        image_set_id: &str,
    ) -> Result<Bytes, SourceError> {
        let base_url = &self.endpoint;
        let url = format!(
            "{base_url}/datastore/{datastore_id}/imageSet/{image_set_id}/getImageSetMetadata"
        );
        debug!("Retrieving metadata of image set {}", image_set_id);
        self.post_for_bytes(&url, json!({})).await
    }

    async fn get_image_frame(
        &self,
        datastore_id: &str,
        image_set_id: &str,
        image_frame_id: &str,
    ) -> Result<Bytes, SourceError> {
        let base_url = &self.endpoint;
        let url =
            format!("{base_url}/datastore/{datastore_id}/imageSet/{image_set_id}/getImageFrame");
        self.post_for_bytes(&url, json!({ "imageFrameId": image_frame_id }))
            .await
    }

    async fn search_image_sets(
        &self,
        datastore_id: &str,
        study_instance_uid: &str,
    ) -> Result<Vec<String>, SourceError> {
        let base_url = &self.endpoint;
        let url = format!("{base_url}/datastore/{datastore_id}/searchImageSets");
        let body = json!({
            "searchCriteria": {
                "filters": [{
                    "values": [{ "DICOMStudyInstanceUID": study_instance_uid }],
                    "operator": "EQUAL"
                }]
            }
        });

        let mut image_set_ids = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let query: Vec<(&str, &str)> = next_token
                .as_deref()
                .map(|token| vec![("nextToken", token)])
                .unwrap_or_default();
            let page: SearchImageSetsResponse = self
                .post(&url, &query, body.clone())
                .await?
                .json()
                .await
                .context(DeserializationFailedSnafu)?;

            image_set_ids.extend(
                page.image_sets_metadata_summaries
                    .into_iter()
                    .map(|summary| summary.image_set_id),
            );
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        debug!(
            "Study {} has {} image set(s)",
            study_instance_uid,
            image_set_ids.len()
        );
        Ok(image_set_ids)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn region_endpoint() {
        let client = HealthImagingClient::with_region("eu-west-1");
        assert_eq!(
            client.endpoint(),
            "https://runtime-medical-imaging.eu-west-1.amazonaws.com"
        );
    }

    #[tokio::test]
    async fn retrieve_metadata_test() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/datastore/ds1/imageSet/is1/getImageSetMetadata"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x1f_u8, 0x8b, 0x08]))
            .mount(&mock_server)
            .await;

        let mut client = HealthImagingClient::with_endpoint(&mock_server.uri());
        client.set_bearer_token("secret");
        let blob = client.get_image_set_metadata("ds1", "is1").await.unwrap();
        assert_eq!(&blob[..], &[0x1f, 0x8b, 0x08]);
    }

    #[tokio::test]
    async fn retrieve_frame_test() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/datastore/ds1/imageSet/is1/getImageFrame"))
            .and(body_json(json!({ "imageFrameId": "frame-a" })))
            .and(header("x-amz-security-token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9_u8, 8, 7]))
            .mount(&mock_server)
            .await;

        let mut client = HealthImagingClient::with_endpoint(&mock_server.uri());
        client.set_header(
            HeaderName::from_static("x-amz-security-token"),
            HeaderValue::from_static("tok"),
        );
        let frame = client.get_image_frame("ds1", "is1", "frame-a").await.unwrap();
        assert_eq!(&frame[..], &[9, 8, 7]);
    }

    #[tokio::test]
    async fn failure_status_is_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let client = HealthImagingClient::with_endpoint(&mock_server.uri());
        let err = client
            .get_image_frame("ds1", "is1", "frame-a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::HttpStatusFailure { status_code, .. } if status_code.as_u16() == 403
        ));
    }

    #[tokio::test]
    async fn search_follows_next_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/datastore/ds1/searchImageSets"))
            .and(query_param("nextToken", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "imageSetsMetadataSummaries": [{ "imageSetId": "is3" }]
            })))
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/datastore/ds1/searchImageSets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "imageSetsMetadataSummaries": [{ "imageSetId": "is1" }, { "imageSetId": "is2" }],
                "nextToken": "page2"
            })))
            .with_priority(2)
            .mount(&mock_server)
            .await;

        let client = HealthImagingClient::with_endpoint(&mock_server.uri());
        let ids = client.search_image_sets("ds1", "1.2.3").await.unwrap();
        assert_eq!(ids, vec!["is1", "is2", "is3"]);
    }
}
