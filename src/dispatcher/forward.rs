//! Synchronous forwarding of a conversion to a live backend.

use async_trait::async_trait;
use reqwest::{header, multipart, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Credentials;
use crate::converter::ConvertedFile;
use crate::job::{sanitize_filename, ConvertRequest};
use crate::registry::ServiceInstance;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("failed to reach backend: {0}")]
    Transport(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendForwarder: Send + Sync {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &ConvertRequest,
    ) -> Result<ConvertedFile, ForwardError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Pulls the filename out of an `attachment; filename="..."` header.
pub fn attachment_filename(content_disposition: &str) -> Option<String> {
    content_disposition.split(';').find_map(|part| {
        let value = part.trim().strip_prefix("filename=")?;
        sanitize_filename(value.trim_matches('"'))
    })
}

/// Forwards over HTTP with the shared credentials, as multipart `file` +
/// `target_format` to `{scheme}://{address}:{port}/convert`.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    scheme: String,
    credentials: Credentials,
}

impl HttpForwarder {
    pub fn new(
        scheme: impl Into<String>,
        timeout: Duration,
        accept_invalid_certs: bool,
        credentials: Credentials,
    ) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            credentials,
        })
    }
}

#[async_trait]
impl BackendForwarder for HttpForwarder {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &ConvertRequest,
    ) -> Result<ConvertedFile, ForwardError> {
        let url = format!("{}/convert", instance.base_url(&self.scheme));

        let part = multipart::Part::bytes(request.payload.to_vec())
            .file_name(request.filename.clone())
            .mime_str(request.source.mime_type())
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("target_format", request.target.to_string());

        debug!(url = %url, filename = %request.filename, "Forwarding conversion");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Transport(format!("timed out waiting for {}", url))
                } else {
                    ForwardError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(ForwardError::Rejected { status, message });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_filename)
            .unwrap_or_else(|| format!("{}.{}", request.stem(), request.target));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        Ok(ConvertedFile::new(bytes, filename, content_type))
    }
}
