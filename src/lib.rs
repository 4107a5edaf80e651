//! Conversion Dispatch Library
//!
//! Routes file-conversion requests to specialized backends, either
//! synchronously (the caller waits for the converted file) or through a
//! durable queue with the result pushed to a caller-supplied callback URL.
//!
//! ## Module Overview
//!
//! - `capability`: format tags and the static routing table
//! - `job`: request validation and the queued job wire format
//! - `registry`: Consul-backed service registry client
//! - `queue`: durable job queue (Redis, plus an in-process variant)
//! - `dispatcher`: ingress validation, routing, forwarding and enqueueing
//! - `consumer`: backend queue consumer with reconnect and ack-after-process
//! - `converter`: image and document conversion backends
//! - `notifier`: callback delivery
//! - `http`: axum routers for the dispatcher and backends
//! - `config`: layered configuration via figment
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use conversion_dispatch::{
//!     capability::{self, Format},
//!     job::{ConvertRequest, JobRequest},
//!     queue::{JobPublisher, MemoryQueue},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let request = ConvertRequest::new("report.docx", b"PK..".to_vec().into(), "png").unwrap();
//!     let class = capability::route(request.source, Format::Png).unwrap();
//!
//!     let job = JobRequest::new(
//!         request,
//!         "http://caller.local/callback".parse().unwrap(),
//!     );
//!     let queue = MemoryQueue::new();
//!     queue.publish(class.queue_name(), &job).await.unwrap();
//! }
//! ```

pub mod capability;
pub mod config;
pub mod consumer;
pub mod converter;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod job;
pub mod notifier;
pub mod queue;
pub mod registry;
pub mod telemetry;
