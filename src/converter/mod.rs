//! The opaque `Convert(bytes, source, target)` operation and its backends.
//!
//! - `raster`: image re-encoding between jpg, png and gif
//! - `document`: docx/pdf conversions through LibreOffice and poppler
//! - `pages`: bounded per-page fan-out and ordered bundling

pub mod document;
pub mod raster;
pub mod pages;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::capability::{self, CapabilityClass, Format};
use crate::job::ConvertRequest;

pub use self::document::{DocumentConverter, DocumentToolsConfig};
pub use self::raster::ImageConverter;

/// Errors that can occur during conversion.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The converter does not handle this pair.
    #[error("conversion {from} -> {to} is not supported here")]
    Unsupported { from: Format, to: Format },

    #[error("failed to decode input: {0}")]
    Decode(String),

    #[error("failed to encode output: {0}")]
    Encode(String),

    #[error("conversion tool not found: {}", path.display())]
    ToolNotFound { path: PathBuf },

    #[error("{tool} exited with {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout_secs} seconds")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("document produced no pages")]
    NoPages,

    #[error("failed to bundle pages: {0}")]
    Bundle(String),

    #[error("conversion task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a conversion, ready to be sent back to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedFile {
    pub bytes: Bytes,
    pub filename: String,
    pub content_type: String,
}

impl ConvertedFile {
    pub fn new(
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
            content_type: content_type.into(),
        }
    }
}

/// A conversion backend for one capability class.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    fn class(&self) -> CapabilityClass;

    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertedFile, ConvertError>;
}

/// Rejects pairs that do not route to `class`.
pub fn ensure_supported(class: CapabilityClass, request: &ConvertRequest) -> Result<(), ConvertError> {
    if capability::route(request.source, request.target) == Some(class) {
        Ok(())
    } else {
        Err(ConvertError::Unsupported {
            from: request.source,
            to: request.target,
        })
    }
}

/// Converter serving `class` in this process.
pub fn for_class(class: CapabilityClass, tools: DocumentToolsConfig) -> Arc<dyn Converter> {
    match class {
        CapabilityClass::Document => Arc::new(DocumentConverter::new(tools)),
        CapabilityClass::Image => Arc::new(ImageConverter::new()),
    }
}
