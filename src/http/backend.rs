//! Backend conversion routes.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{basic_auth, file_response, health, read_convert_form};
use crate::config::Credentials;
use crate::converter::{ConvertError, Converter};
use crate::error::DispatchError;

async fn convert(
    State(converter): State<Arc<dyn Converter>>,
    multipart: Multipart,
) -> Result<Response, DispatchError> {
    let request = read_convert_form(multipart)
        .await?
        .convert_request()
        .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

    let file = converter.convert(&request).await.map_err(|e| {
        if !matches!(e, ConvertError::Unsupported { .. }) {
            error!(filename = %request.filename, target = %request.target, error = %e, "Conversion failed");
        }
        DispatchError::from(e)
    })?;

    info!(
        filename = %request.filename,
        output = %file.filename,
        bytes = file.bytes.len(),
        "Served synchronous conversion"
    );
    Ok(file_response(file))
}

/// `POST /convert` (authenticated) and `GET /health` for one converter.
pub fn router(converter: Arc<dyn Converter>, credentials: Credentials, max_upload_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/convert", post(convert))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(middleware::from_fn_with_state(Arc::new(credentials), basic_auth))
        .with_state(converter);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}
