//! Client for the remote metadata service.
//!
//! The service does the real work: it reads embedded metadata and rewrites
//! images without it. This module only knows its HTTP boundary:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | inspect | `POST {base}/metadata`, multipart field `file` | JSON [`ImageMetadata`] |
//! | strip | `POST {base}/strip`, multipart field `file` | raw image bytes |
//! | health | `GET {base}/health` | liveness text |
//!
//! Failures carry `{"error": "..."}`. HTTP 429 becomes
//! [`ServiceError::RateLimited`] so callers can treat it like a local denial.

use anyhow::Context;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::codec::FileHandle;
use crate::config::ServiceConfig;

const INSPECT_FAILED: &str = "Failed to extract metadata";
const STRIP_FAILED: &str = "Failed to strip metadata";
const HEALTH_FAILED: &str = "API is not available";

/// Metadata report returned by the inspect call.
///
/// Groups the service could not fill are `None` or have `has_data == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: String,
    /// Every tag as `"<directory> - <tag>" → description`.
    #[serde(default, deserialize_with = "lenient_map")]
    pub exif_data: BTreeMap<String, String>,
    #[serde(default)]
    pub has_metadata: bool,
    #[serde(default)]
    pub camera_info: Option<MetadataGroup>,
    #[serde(default)]
    pub location_info: Option<MetadataGroup>,
    #[serde(default)]
    pub date_time_info: Option<MetadataGroup>,
    #[serde(default)]
    pub image_info: Option<MetadataGroup>,
    #[serde(default)]
    pub other_info: Option<MetadataGroup>,
}

/// A named set of related metadata fields (camera, location, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataGroup {
    #[serde(default)]
    pub group_name: String,
    #[serde(default, deserialize_with = "lenient_map")]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub has_data: bool,
}

impl ImageMetadata {
    /// Groups that carry data, in display order.
    pub fn groups(&self) -> impl Iterator<Item = &MetadataGroup> {
        [
            &self.camera_info,
            &self.location_info,
            &self.date_time_info,
            &self.image_info,
            &self.other_info,
        ]
        .into_iter()
        .flatten()
        .filter(|g| g.has_data)
    }

    /// Whether the service found location data, the field users most
    /// often want gone.
    pub fn has_location(&self) -> bool {
        self.location_info.as_ref().is_some_and(|g| g.has_data)
    }
}

/// Tag descriptions may be null or non-string; keep them displayable.
fn lenient_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The service answered 429.
    #[error("Too many requests")]
    RateLimited,
    /// Anything else, with the service's own message when it sent one.
    #[error("{0}")]
    Failed(String),
}

/// The remote metadata service.
///
/// [`HttpMetadataService`] talks to the real thing; tests substitute a
/// scripted implementation.
#[async_trait::async_trait]
pub trait MetadataService: Send + Sync {
    /// Display name for logs.
    fn name(&self) -> &str;
    /// Extract embedded metadata from `file`.
    async fn inspect(&self, file: &FileHandle) -> Result<ImageMetadata, ServiceError>;
    /// Produce a metadata-free replacement of `file`.
    async fn strip(&self, file: &FileHandle) -> Result<Vec<u8>, ServiceError>;
    /// Liveness probe for a connectivity indicator.
    async fn health(&self) -> Result<String, ServiceError>;
}

/// HTTP implementation of [`MetadataService`].
pub struct HttpMetadataService {
    base_url: String,
    client: Client,
}

impl HttpMetadataService {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn form(file: &FileHandle) -> Form {
        let part = Part::bytes(file.bytes.clone()).file_name(file.name.clone());
        let part = match part.mime_str(&file.mime_type) {
            Ok(part) => part,
            Err(_) => {
                log::debug!("Unusable MIME type {:?}, sending without one", file.mime_type);
                Part::bytes(file.bytes.clone()).file_name(file.name.clone())
            }
        };
        Form::new().part("file", part)
    }

    async fn post_file(
        &self,
        endpoint: &str,
        file: &FileHandle,
        fallback: &str,
    ) -> Result<reqwest::Response, ServiceError> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .multipart(Self::form(file))
            .send()
            .await
            .map_err(|e| {
                log::warn!("{endpoint} request failed: {e}");
                ServiceError::Failed(fallback.to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, fallback))
    }
}

#[async_trait::async_trait]
impl MetadataService for HttpMetadataService {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn inspect(&self, file: &FileHandle) -> Result<ImageMetadata, ServiceError> {
        let resp = self.post_file("metadata", file, INSPECT_FAILED).await?;
        let text = resp
            .text()
            .await
            .map_err(|_| ServiceError::Failed(INSPECT_FAILED.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            log::warn!("Metadata response did not match the expected shape: {e}");
            log::debug!("Raw metadata response:\n{text}");
            ServiceError::Failed(INSPECT_FAILED.to_string())
        })
    }

    async fn strip(&self, file: &FileHandle) -> Result<Vec<u8>, ServiceError> {
        let resp = self.post_file("strip", file, STRIP_FAILED).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|_| ServiceError::Failed(STRIP_FAILED.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn health(&self) -> Result<String, ServiceError> {
        let resp = self
            .client
            .get(self.url("health"))
            .send()
            .await
            .map_err(|_| ServiceError::Failed(HEALTH_FAILED.to_string()))?;

        if !resp.status().is_success() {
            return Err(ServiceError::Failed(HEALTH_FAILED.to_string()));
        }
        resp.text()
            .await
            .map_err(|_| ServiceError::Failed(HEALTH_FAILED.to_string()))
    }
}

/// Map a non-success response to a [`ServiceError`].
fn classify_failure(status: StatusCode, body: &str, fallback: &str) -> ServiceError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ServiceError::RateLimited;
    }
    let message = error_message(body).unwrap_or_else(|| fallback.to_string());
    log::debug!("Service answered {status}: {message}");
    ServiceError::Failed(message)
}

/// The `error` field of a JSON error body, if there is one.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("error")?.as_str()?.trim();
    if message.is_empty() { None } else { Some(message.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "fileName": "IMG_0042.jpg",
        "fileSize": 2048,
        "mimeType": "image/jpeg",
        "exifData": {
            "Exif IFD0 - Make": "Canon",
            "GPS - GPS Latitude": "48° 51' 29.6\"",
            "Exif SubIFD - Flash": null
        },
        "hasMetadata": true,
        "cameraInfo": {
            "groupName": "Camera Information",
            "data": { "Exif IFD0 - Make": "Canon", "Exif SubIFD - Flash": null },
            "hasData": true
        },
        "locationInfo": {
            "groupName": "Location Information",
            "data": { "GPS - GPS Latitude": "48° 51' 29.6\"" },
            "hasData": true
        },
        "dateTimeInfo": { "groupName": "Date & Time Information", "data": {}, "hasData": false },
        "imageInfo": null
    }"#;

    #[test]
    fn parse_metadata_response() {
        let meta: ImageMetadata = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(meta.file_name, "IMG_0042.jpg");
        assert_eq!(meta.file_size, 2048);
        assert!(meta.has_metadata);
        assert_eq!(meta.exif_data.len(), 3);
        assert_eq!(meta.exif_data["Exif SubIFD - Flash"], "");
        assert!(meta.image_info.is_none());
        assert!(meta.other_info.is_none());
        assert!(meta.has_location());
    }

    #[test]
    fn groups_skip_empty() {
        let meta: ImageMetadata = serde_json::from_str(SAMPLE).unwrap();
        let names: Vec<&str> = meta.groups().map(|g| g.group_name.as_str()).collect();
        assert_eq!(names, ["Camera Information", "Location Information"]);
    }

    #[test]
    fn parse_minimal_response() {
        let meta: ImageMetadata =
            serde_json::from_str(r#"{"fileName": "a.png", "fileSize": 1, "mimeType": "image/png", "hasMetadata": false}"#)
                .unwrap();
        assert!(!meta.has_metadata);
        assert!(meta.exif_data.is_empty());
        assert_eq!(meta.groups().count(), 0);
        assert!(!meta.has_location());
    }

    #[test]
    fn non_string_values_are_stringified() {
        let group: MetadataGroup =
            serde_json::from_str(r#"{"groupName": "Other", "data": {"Count": 3, "Flag": true}, "hasData": true}"#)
                .unwrap();
        assert_eq!(group.data["Count"], "3");
        assert_eq!(group.data["Flag"], "true");
    }

    #[test]
    fn metadata_survives_store_round_trip() {
        let meta: ImageMetadata = serde_json::from_str(SAMPLE).unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        let back: ImageMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        let err = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": "Too many requests. Please try again later.", "retryAfter": 60}"#,
            INSPECT_FAILED,
        );
        assert_eq!(err, ServiceError::RateLimited);
    }

    #[test]
    fn error_field_passed_through() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error": "Unsupported file format", "status": 400}"#,
            STRIP_FAILED,
        );
        assert_eq!(err, ServiceError::Failed("Unsupported file format".into()));
    }

    #[test]
    fn missing_error_field_uses_fallback() {
        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "<html>oops</html>", STRIP_FAILED);
        assert_eq!(err, ServiceError::Failed(STRIP_FAILED.into()));

        let err = classify_failure(StatusCode::BAD_GATEWAY, r#"{"error": "  "}"#, INSPECT_FAILED);
        assert_eq!(err, ServiceError::Failed(INSPECT_FAILED.into()));
    }

    #[test]
    fn urls_join_without_double_slash() {
        let service =
            HttpMetadataService::new("http://localhost:8080/api/images/".into(), Duration::from_secs(5))
                .unwrap();
        assert_eq!(service.url("strip"), "http://localhost:8080/api/images/strip");
    }

    // ── HttpMetadataService against a mock server ────────────────────

    use wiremock::matchers::{body_string_contains, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpMetadataService {
        HttpMetadataService::new(format!("{}/api/images", server.uri()), Duration::from_secs(5)).unwrap()
    }

    fn upload() -> FileHandle {
        FileHandle::new("IMG_0042.jpg", "image/jpeg", b"fake-jpeg-bytes".to_vec(), 0)
    }

    #[tokio::test]
    async fn inspect_posts_multipart_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images/metadata"))
            .and(header_regex("content-type", "^multipart/form-data"))
            .and(body_string_contains("name=\"file\""))
            .and(body_string_contains("filename=\"IMG_0042.jpg\""))
            .and(body_string_contains("fake-jpeg-bytes"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(SAMPLE, "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let meta = client_for(&server).inspect(&upload()).await.unwrap();
        assert_eq!(meta.file_name, "IMG_0042.jpg");
        assert!(meta.has_location());
    }

    #[tokio::test]
    async fn inspect_unexpected_body_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server).inspect(&upload()).await.unwrap_err();
        assert_eq!(err, ServiceError::Failed(INSPECT_FAILED.into()));
    }

    #[tokio::test]
    async fn inspect_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images/metadata"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": "Too many requests. Please try again later.",
                "status": 429
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).inspect(&upload()).await.unwrap_err();
        assert_eq!(err, ServiceError::RateLimited);
    }

    #[tokio::test]
    async fn strip_returns_response_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images/strip"))
            .and(body_string_contains("name=\"file\""))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = client_for(&server).strip(&upload()).await.unwrap();
        assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn strip_error_body_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images/strip"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "Unsupported file format",
                "status": 400
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).strip(&upload()).await.unwrap_err();
        assert_eq!(err, ServiceError::Failed("Unsupported file format".into()));
    }

    #[tokio::test]
    async fn health_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/images/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Metadata Stripper API is running"))
            .mount(&server)
            .await;

        let text = client_for(&server).health().await.unwrap();
        assert_eq!(text, "Metadata Stripper API is running");
    }

    #[tokio::test]
    async fn health_failure_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/images/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).health().await.unwrap_err();
        assert_eq!(err, ServiceError::Failed(HEALTH_FAILED.into()));
    }
}
