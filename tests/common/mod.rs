//! Common test utilities for in-process dispatcher/backend testing.
//!
//! Everything runs inside the test process: backends are real axum servers
//! on ephemeral ports, the queue is a `MemoryQueue`, and the registry is a
//! fixed table of instances.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tokio::sync::mpsc;
use tower::ServiceExt;

use conversion_dispatch::capability::CapabilityClass;
use conversion_dispatch::config::Credentials;
use conversion_dispatch::converter::{Converter, ConvertedFile};
use conversion_dispatch::dispatcher::{Dispatcher, HttpForwarder};
use conversion_dispatch::http;
use conversion_dispatch::queue::MemoryQueue;
use conversion_dispatch::registry::{RegistryError, ServiceInstance, ServiceRegistry};

pub const USER: &str = "admin";
pub const PASSWORD: &str = "test_password";

pub fn credentials() -> Credentials {
    Credentials::new(USER, PASSWORD)
}

pub fn basic_auth_header() -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", USER, PASSWORD)))
}

/// Registry answering from a fixed table.
#[derive(Default)]
pub struct StaticRegistry {
    instances: HashMap<CapabilityClass, ServiceInstance>,
}

impl StaticRegistry {
    pub fn with(mut self, class: CapabilityClass, addr: SocketAddr) -> Self {
        self.instances.insert(
            class,
            ServiceInstance {
                id: format!("{}-test", class.service_name()),
                name: class.service_name().to_string(),
                address: addr.ip().to_string(),
                port: addr.port(),
                tags: class.registry_tags(),
            },
        );
        self
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn resolve(&self, class: CapabilityClass) -> Result<ServiceInstance, RegistryError> {
        self.instances
            .get(&class)
            .cloned()
            .ok_or(RegistryError::NotFound(class))
    }
}

/// Serves `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Starts a backend for `converter` and returns its address.
pub async fn spawn_backend(converter: Arc<dyn Converter>) -> SocketAddr {
    serve(http::backend::router(converter, credentials(), 10 * 1024 * 1024)).await
}

/// Dispatcher router wired to `registry` and `queue`.
pub fn dispatcher_router(registry: StaticRegistry, queue: &MemoryQueue) -> Router {
    let forwarder =
        HttpForwarder::new("http", Duration::from_secs(10), false, credentials()).unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(queue.clone()),
        Arc::new(forwarder),
    );
    http::dispatcher::router(Arc::new(dispatcher), credentials(), 10 * 1024 * 1024)
}

/// One field of a multipart form.
pub enum Field<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a [u8]),
}

const BOUNDARY: &str = "----conversion-test-boundary";

pub fn multipart_body(fields: &[Field<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for field in fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match field {
            Field::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Field::File(filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// Response from a test request.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Sends `POST /convert` with the given fields.
pub async fn post_convert(router: &Router, fields: &[Field<'_>], authorized: bool) -> TestResponse {
    let mut request = Request::builder()
        .method("POST")
        .uri("/convert")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if authorized {
        request = request.header(header::AUTHORIZATION, basic_auth_header());
    }
    let request = request.body(Body::from(multipart_body(fields))).unwrap();
    send(router, request).await
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let header_str = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let content_type = header_str(header::CONTENT_TYPE);
    let content_disposition = header_str(header::CONTENT_DISPOSITION);
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        content_type,
        content_disposition,
        body,
    }
}

/// A small PNG with a transparent half.
pub fn sample_png() -> Vec<u8> {
    let mut img = RgbaImage::new(8, 8);
    for (x, _, px) in img.enumerate_pixels_mut() {
        *px = if x < 4 {
            Rgba([0, 128, 255, 255])
        } else {
            Rgba([0, 0, 0, 0])
        };
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// A file received by a callback endpoint.
#[derive(Debug, Clone)]
pub struct Received {
    pub filename: String,
    pub bytes: Bytes,
}

async fn callback(State(tx): State<mpsc::UnboundedSender<Received>>, mut multipart: Multipart) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.unwrap_or_default();
            let _ = tx.send(Received { filename, bytes });
        }
    }
    StatusCode::OK
}

/// Starts a caller-side `POST /callback` receiver.
pub async fn spawn_callback_receiver() -> (String, mpsc::UnboundedReceiver<Received>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = Router::new().route("/callback", post(callback)).with_state(tx);
    let addr = serve(router).await;
    (format!("http://{}/callback", addr), rx)
}

/// Document converter standing in for LibreOffice/poppler: renders a
/// fixed number of pages through the real page pool, later pages first.
pub struct FakePageRenderer {
    pub pages: usize,
}

#[async_trait]
impl Converter for FakePageRenderer {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Document
    }

    async fn convert(
        &self,
        request: &conversion_dispatch::job::ConvertRequest,
    ) -> Result<ConvertedFile, conversion_dispatch::converter::ConvertError> {
        use conversion_dispatch::converter::pages;

        conversion_dispatch::converter::ensure_supported(self.class(), request)?;
        let total = self.pages;
        let rendered = pages::render_pages(total, pages::DEFAULT_PAGE_CONCURRENCY, move |index| async move {
            tokio::time::sleep(Duration::from_millis(3 * (total + 1 - index) as u64)).await;
            Ok(Bytes::from(format!("page {}", index)))
        })
        .await?;
        pages::bundle_pages(request.stem(), rendered)
    }
}
