//! Upload sink for finished recordings.
//!
//! The clip is posted once as JSON. There is no retry: a failure is logged
//! and the local download artifact stays the source of truth.

use crate::error::UploadError;
use crate::recording::Blob;
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::time::Duration;

/// Receives the finalized recording
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Send `blob`, returning the HTTP status the endpoint answered with
    async fn upload(&self, blob: &Blob) -> Result<u16, UploadError>;
}

#[derive(Serialize)]
struct UploadBody {
    data: String,
}

/// `data:<media-type>;base64,<payload>`
pub fn data_url(blob: &Blob) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(blob.data());
    format!("data:{};base64,{}", blob.media_type(), encoded)
}

/// Posts `{ "data": <data URL> }` to a fixed endpoint
pub struct HttpUploadSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploadSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UploadSink for HttpUploadSink {
    async fn upload(&self, blob: &Blob) -> Result<u16, UploadError> {
        tracing::info!("Uploading {} bytes to {}", blob.size(), self.endpoint);

        let body = serde_json::to_vec(&UploadBody {
            data: data_url(blob),
        })?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        // Any answer counts as sent; the status is only reported
        let status = response.status();
        if status.is_success() {
            tracing::info!("Upload finished with status {}", status.as_u16());
        } else {
            tracing::warn!("Upload answered with status {}", status.as_u16());
        }
        Ok(status.as_u16())
    }
}
