//! Ingress dispatch: validate, route, then forward or enqueue.
//!
//! With a callback URL the job is published to the capability class's
//! queue and the caller gets an acknowledgement straight away; without one
//! the request is forwarded to a live backend and the converted bytes are
//! returned as they came back.

pub mod forward;

use axum::http::StatusCode;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::{self, CapabilityClass};
use crate::converter::ConvertedFile;
use crate::error::DispatchError;
use crate::job::{parse_callback_url, ConvertRequest, JobError, JobRequest};
use crate::queue::JobPublisher;
use crate::registry::ServiceRegistry;
use crate::telemetry;

pub use self::forward::{BackendForwarder, ForwardError, HttpForwarder};

/// Raw fields of an ingress call, before validation.
#[derive(Debug, Clone, Default)]
pub struct IngressRequest {
    pub filename: Option<String>,
    pub payload: Option<Bytes>,
    pub target_format: Option<String>,
    pub callback_url: Option<String>,
}

impl IngressRequest {
    /// Validates the file and target into a [`ConvertRequest`].
    pub fn convert_request(&self) -> Result<ConvertRequest, JobError> {
        let payload = self.payload.clone().ok_or(JobError::MissingFile)?;
        let target = self
            .target_format
            .as_deref()
            .ok_or(JobError::MissingTarget)?;
        let filename = self.filename.as_deref().unwrap_or_default();
        ConvertRequest::new(filename, payload, target)
    }

    fn callback(&self) -> Option<&str> {
        self.callback_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Synchronous conversion result.
    Converted(ConvertedFile),
    /// Job queued; the result will be pushed to the callback URL.
    Accepted { job_id: Uuid, queue: &'static str },
}

impl From<ForwardError> for DispatchError {
    fn from(err: ForwardError) -> Self {
        match err {
            // the caller already authenticated; the dispatcher's own
            // credentials are wrong for the backend
            ForwardError::Rejected { status, message }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                DispatchError::DispatchFailed(format!(
                    "backend refused dispatcher credentials ({}): {}",
                    status, message
                ))
            }
            ForwardError::Rejected { status, message } => {
                DispatchError::ConvertFailed { status, message }
            }
            ForwardError::Transport(reason) => DispatchError::DispatchFailed(reason),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<dyn ServiceRegistry>,
    publisher: Arc<dyn JobPublisher>,
    forwarder: Arc<dyn BackendForwarder>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        publisher: Arc<dyn JobPublisher>,
        forwarder: Arc<dyn BackendForwarder>,
    ) -> Self {
        Self {
            registry,
            publisher,
            forwarder,
        }
    }

    /// Dispatches one authenticated request.
    pub async fn dispatch(&self, ingress: IngressRequest) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let mode = if ingress.callback().is_some() { "async" } else { "sync" };

        let mut class = None;
        let result = self.dispatch_inner(&ingress, &mut class).await;

        let outcome = match &result {
            Ok(DispatchOutcome::Converted(_)) => "converted",
            Ok(DispatchOutcome::Accepted { .. }) => "accepted",
            Err(e) => e.kind(),
        };
        telemetry::record_dispatch_telemetry(
            mode,
            class,
            outcome,
            started.elapsed().as_millis() as i64,
        );
        result
    }

    async fn dispatch_inner(
        &self,
        ingress: &IngressRequest,
        class_out: &mut Option<CapabilityClass>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let request = ingress.convert_request()?;
        let callback = ingress.callback().map(parse_callback_url).transpose()?;

        let class = capability::route(request.source, request.target).ok_or_else(|| {
            DispatchError::NoRouteAvailable(format!(
                "no backend converts {} to {}",
                request.source, request.target
            ))
        })?;
        *class_out = Some(class);

        let instance = self.registry.resolve(class).await?;

        match callback {
            Some(callback_url) => {
                let job = JobRequest::new(request, callback_url);
                let queue = class.queue_name();
                self.publisher.publish(queue, &job).await.map_err(|e| {
                    warn!(job_id = %job.job_id, queue = queue, error = %e, "Failed to enqueue job");
                    DispatchError::from(e)
                })?;
                info!(
                    job_id = %job.job_id,
                    queue = queue,
                    filename = %job.request.filename,
                    target = %job.request.target,
                    "Job enqueued"
                );
                Ok(DispatchOutcome::Accepted {
                    job_id: job.job_id,
                    queue,
                })
            }
            None => {
                let file = self.forwarder.forward(&instance, &request).await?;
                info!(
                    backend = %instance.id,
                    filename = %request.filename,
                    output = %file.filename,
                    bytes = file.bytes.len(),
                    "Conversion forwarded"
                );
                Ok(DispatchOutcome::Converted(file))
            }
        }
    }
}
