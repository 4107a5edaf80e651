//! HTTP surfaces of the dispatcher and the backends.
//!
//! Both expose `POST /convert` behind basic auth and an open `GET /health`.

pub mod auth;
pub mod backend;
pub mod dispatcher;

use axum::extract::Multipart;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::converter::ConvertedFile;
use crate::dispatcher::IngressRequest;
use crate::error::DispatchError;

pub use self::auth::basic_auth;

/// Liveness probe polled by the registry.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Reads the conversion form: `file`, `target_format` (or the older
/// `format`), and an optional `callback_url`.
pub async fn read_convert_form(mut multipart: Multipart) -> Result<IngressRequest, DispatchError> {
    let mut ingress = IngressRequest::default();
    let invalid = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            DispatchError::PayloadTooLarge(e.body_text())
        } else {
            DispatchError::InvalidRequest(format!("malformed multipart body: {}", e.body_text()))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                ingress.filename = field.file_name().map(str::to_string);
                ingress.payload = Some(field.bytes().await.map_err(invalid)?);
            }
            "target_format" => ingress.target_format = Some(field.text().await.map_err(invalid)?),
            "format" => {
                let value = field.text().await.map_err(invalid)?;
                ingress.target_format.get_or_insert(value);
            }
            "callback_url" => ingress.callback_url = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }
    Ok(ingress)
}

/// Converted bytes as an attachment.
pub fn file_response(file: ConvertedFile) -> Response {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file.filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.bytes,
    )
        .into_response()
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
