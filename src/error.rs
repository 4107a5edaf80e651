//! Errors reported synchronously to HTTP callers.
//!
//! Anything that goes wrong before a job is enqueued (or while a sync
//! conversion is forwarded) surfaces here and is rendered as JSON
//! `{"error": message}` with the matching status code.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::converter::ConvertError;
use crate::job::JobError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    NoRouteAvailable(String),

    #[error("{0}")]
    RegistryUnavailable(String),

    #[error("{0}")]
    DispatchFailed(String),

    /// The backend refused or failed the conversion.
    #[error("{message}")]
    ConvertFailed { status: StatusCode, message: String },
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::NoRouteAvailable(_) => StatusCode::NOT_FOUND,
            DispatchError::RegistryUnavailable(_) | DispatchError::DispatchFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::ConvertFailed { status, .. } => *status,
        }
    }

    /// Short label used in logs and spans.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Unauthorized => "unauthorized",
            DispatchError::PayloadTooLarge(_) => "payload_too_large",
            DispatchError::NoRouteAvailable(_) => "no_route",
            DispatchError::RegistryUnavailable(_) => "registry_unavailable",
            DispatchError::DispatchFailed(_) => "dispatch_failed",
            DispatchError::ConvertFailed { .. } => "convert_failed",
        }
    }
}

impl From<JobError> for DispatchError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::UnknownSource(_) => DispatchError::NoRouteAvailable(err.to_string()),
            other => DispatchError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => DispatchError::NoRouteAvailable(err.to_string()),
            RegistryError::Unavailable(_) => DispatchError::RegistryUnavailable(err.to_string()),
        }
    }
}

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        DispatchError::DispatchFailed(err.to_string())
    }
}

impl From<ConvertError> for DispatchError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Unsupported { .. } => DispatchError::InvalidRequest(err.to_string()),
            other => DispatchError::ConvertFailed {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if matches!(self, DispatchError::Unauthorized) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"conversion\""),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityClass, Format};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DispatchError::InvalidRequest("x".into()), 400),
            (DispatchError::Unauthorized, 401),
            (DispatchError::PayloadTooLarge("x".into()), 413),
            (DispatchError::NoRouteAvailable("x".into()), 404),
            (DispatchError::RegistryUnavailable("x".into()), 500),
            (DispatchError::DispatchFailed("x".into()), 500),
            (
                DispatchError::ConvertFailed {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    message: "x".into(),
                },
                422,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{}", err.kind());
        }
    }

    #[test]
    fn test_conversions() {
        assert!(matches!(
            DispatchError::from(JobError::UnknownSource("notes.txt".into())),
            DispatchError::NoRouteAvailable(_)
        ));
        assert!(matches!(
            DispatchError::from(JobError::EmptyFile),
            DispatchError::InvalidRequest(_)
        ));
        assert!(matches!(
            DispatchError::from(RegistryError::NotFound(CapabilityClass::Image)),
            DispatchError::NoRouteAvailable(_)
        ));
        assert!(matches!(
            DispatchError::from(RegistryError::Unavailable("down".into())),
            DispatchError::RegistryUnavailable(_)
        ));
        assert!(matches!(
            DispatchError::from(ConvertError::Unsupported {
                from: Format::Gif,
                to: Format::Pdf
            }),
            DispatchError::InvalidRequest(_)
        ));
        assert_eq!(
            DispatchError::from(ConvertError::NoPages).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_response_asks_for_basic_auth() {
        let response = DispatchError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
