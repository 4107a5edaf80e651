//! Conversion requests and the queued job wire format.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::capability::{Format, UnknownTarget};

/// Errors raised while building or decoding a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no file was provided")]
    MissingFile,

    #[error("uploaded file is empty")]
    EmptyFile,

    #[error("filename '{0}' is empty after sanitization")]
    InvalidFilename(String),

    #[error("no target_format was provided")]
    MissingTarget,

    #[error(transparent)]
    UnknownTarget(#[from] UnknownTarget),

    #[error("unrecognized source format for '{0}'")]
    UnknownSource(String),

    #[error("callback_url '{url}' is invalid: {reason}")]
    InvalidCallback { url: String, reason: String },

    #[error("malformed job message: {0}")]
    Malformed(String),
}

/// Strips path components and unsafe characters from a caller filename.
///
/// Keeps `[A-Za-z0-9._-]`, maps whitespace to `_`, and drops leading dots
/// and underscores so the result can never name a hidden or parent path.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                Some(c)
            } else {
                None
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses a callback URL, requiring an absolute http(s) URL with a host.
pub fn parse_callback_url(raw: &str) -> Result<Url, JobError> {
    let invalid = |reason: &str| JobError::InvalidCallback {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

/// A validated conversion: what to convert and into what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub filename: String,
    pub payload: Bytes,
    pub source: Format,
    pub target: Format,
}

impl ConvertRequest {
    /// Validates raw caller input into a request.
    ///
    /// The source format is derived from the sanitized filename's extension.
    pub fn new(raw_filename: &str, payload: Bytes, target: &str) -> Result<Self, JobError> {
        if payload.is_empty() {
            return Err(JobError::EmptyFile);
        }
        if target.trim().is_empty() {
            return Err(JobError::MissingTarget);
        }
        let target: Format = target.parse()?;
        let filename = sanitize_filename(raw_filename)
            .ok_or_else(|| JobError::InvalidFilename(raw_filename.to_string()))?;
        let source = Format::from_filename(&filename)
            .ok_or_else(|| JobError::UnknownSource(filename.clone()))?;
        Ok(Self {
            filename,
            payload,
            source,
            target,
        })
    }

    /// Filename without its extension, used to name outputs.
    pub fn stem(&self) -> &str {
        self.filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.filename)
    }
}

/// A conversion handed to a backend through the queue.
///
/// Self-contained: any consumer, in any process, can run it without
/// reference to the dispatcher that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub request: ConvertRequest,
    pub callback_url: Url,
    pub enqueued_at: DateTime<Utc>,
}

/// JSON shape of a queued job.
#[derive(Debug, Serialize, Deserialize)]
struct WireJob {
    filename: String,
    file_bytes: String,
    target_format: String,
    callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enqueued_at: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn new(request: ConvertRequest, callback_url: Url) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            callback_url,
            enqueued_at: Utc::now(),
        }
    }

    /// Serializes to the queue wire format, base64-encoding the payload.
    pub fn to_wire(&self) -> Result<String, JobError> {
        let wire = WireJob {
            filename: self.request.filename.clone(),
            file_bytes: BASE64.encode(&self.request.payload),
            target_format: self.request.target.to_string(),
            callback_url: self.callback_url.to_string(),
            job_id: Some(self.job_id),
            enqueued_at: Some(self.enqueued_at),
        };
        serde_json::to_string(&wire).map_err(|e| JobError::Malformed(e.to_string()))
    }

    /// Decodes a queue message back into a job.
    ///
    /// Messages without `job_id` get a fresh one so logs can still be
    /// correlated from this point on.
    pub fn from_wire(raw: &str) -> Result<Self, JobError> {
        let wire: WireJob =
            serde_json::from_str(raw).map_err(|e| JobError::Malformed(e.to_string()))?;
        let payload = BASE64
            .decode(wire.file_bytes.as_bytes())
            .map_err(|e| JobError::Malformed(format!("file_bytes is not base64: {}", e)))?;
        let request = ConvertRequest::new(&wire.filename, Bytes::from(payload), &wire.target_format)?;
        let callback_url = parse_callback_url(&wire.callback_url)?;
        Ok(Self {
            job_id: wire.job_id.unwrap_or_else(Uuid::new_v4),
            request,
            callback_url,
            enqueued_at: wire.enqueued_at.unwrap_or_else(Utc::now),
        })
    }

    /// Milliseconds between enqueue and now.
    pub fn age_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.enqueued_at)
            .num_milliseconds()
    }
}
