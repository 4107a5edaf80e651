//! Dispatcher ingress routes.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{basic_auth, file_response, health, read_convert_form};
use crate::config::Credentials;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::DispatchError;

async fn convert(
    State(dispatcher): State<Arc<Dispatcher>>,
    multipart: Multipart,
) -> Result<Response, DispatchError> {
    let ingress = read_convert_form(multipart).await?;
    match dispatcher.dispatch(ingress).await? {
        DispatchOutcome::Converted(file) => Ok(file_response(file)),
        DispatchOutcome::Accepted { job_id, queue } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "job_id": job_id,
                "queue": queue,
            })),
        )
            .into_response()),
    }
}

/// `POST /convert` (authenticated) and `GET /health`.
pub fn router(dispatcher: Arc<Dispatcher>, credentials: Credentials, max_upload_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/convert", post(convert))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(middleware::from_fn_with_state(Arc::new(credentials), basic_auth))
        .with_state(dispatcher);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
}
