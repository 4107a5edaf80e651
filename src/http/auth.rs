//! HTTP Basic authentication against the single shared credential pair.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

use crate::config::Credentials;
use crate::error::DispatchError;

/// Decodes an `Authorization: Basic ...` header into `(user, password)`.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Credentials {
    pub fn matches(&self, user: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(user.as_bytes(), self.username.as_bytes());
        let password_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        user_ok & password_ok
    }
}

/// Rejects requests without the shared credentials with 401.
pub async fn basic_auth(
    State(credentials): State<Arc<Credentials>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, DispatchError> {
    match parse_basic_auth(request.headers()) {
        Some((user, password)) if credentials.matches(&user, &password) => {
            Ok(next.run(request).await)
        }
        Some((user, _)) => {
            debug!(user = %user, path = %request.uri().path(), "Rejected credentials");
            Err(DispatchError::Unauthorized)
        }
        None => Err(DispatchError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    async fn dummy_handler() -> &'static str {
        "OK"
    }

    fn app() -> Router {
        let credentials = Arc::new(Credentials::new("admin", "s3cret"));
        Router::new()
            .route("/test", get(dummy_handler))
            .layer(middleware::from_fn_with_state(credentials, basic_auth))
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
    }

    async fn status_with(authorization: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri("/test");
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }
        let response = app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_valid_credentials_pass() {
        assert_eq!(status_with(Some(&basic("admin", "s3cret"))).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_credentials_are_rejected() {
        assert_eq!(
            status_with(Some(&basic("admin", "guess"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_with(Some(&basic("root", "s3cret"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_with(Some("Bearer s3cret")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("Basic !!!")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_password_may_contain_colons() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            basic("admin", "a:b:c").parse().unwrap(),
        );
        assert_eq!(
            parse_basic_auth(&headers),
            Some(("admin".to_string(), "a:b:c".to_string()))
        );
    }
}
