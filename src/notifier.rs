//! Pushes finished conversions back to the caller's callback endpoint.

use async_trait::async_trait;
use reqwest::{multipart, Client, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::converter::ConvertedFile;

/// Default bound on a single callback POST.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("callback delivery to {url} failed: {reason}")]
    CallbackDeliveryFailed { url: String, reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// Delivers `file` to `url` exactly once; no retries.
    async fn notify(&self, url: &Url, file: &ConvertedFile) -> Result<(), NotifyError>;
}

/// Multipart POST notifier, the file in the `file` field.
#[derive(Debug, Clone)]
pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            NotifyError::CallbackDeliveryFailed {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            }
        })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, url: &Url, file: &ConvertedFile) -> Result<(), NotifyError> {
        let failed = |reason: String| NotifyError::CallbackDeliveryFailed {
            url: url.to_string(),
            reason,
        };

        let part = multipart::Part::bytes(file.bytes.to_vec())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .map_err(|e| failed(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        debug!(url = %url, filename = %file.filename, "Posting callback");
        let response = self
            .client
            .post(url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    failed("timed out".to_string())
                } else {
                    failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status)));
        }

        info!(url = %url, filename = %file.filename, bytes = file.bytes.len(), "Callback delivered");
        Ok(())
    }
}
