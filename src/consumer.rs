//! Backend job consumer.
//!
//! A supervised loop that keeps one subscription to the backend's queue
//! alive, reconnecting after a fixed delay whenever the broker goes away:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed <-> Processing
//!       ^              |             |
//!       +--------------+-------------+   (connect / receive / ack failure)
//! ```
//!
//! Every delivery is acknowledged once it has been handled, whether or not
//! the conversion or the callback succeeded. A job that fails is logged and
//! dropped instead of being redelivered forever.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::CapabilityClass;
use crate::converter::Converter;
use crate::notifier::CallbackNotifier;
use crate::queue::{Delivery, JobSubscription, QueueConnector, QueueError};
use crate::telemetry::{self, JobReport};

/// Observable consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Processing,
    /// Shut down; the loop has returned.
    Stopped,
}

/// Fixed-delay reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed connects before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// How a single delivery was handled. Every outcome is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    ConvertFailed,
    CallbackFailed,
    Malformed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Delivered => "delivered",
            JobOutcome::ConvertFailed => "convert_failed",
            JobOutcome::CallbackFailed => "callback_failed",
            JobOutcome::Malformed => "malformed",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("gave up connecting to queue '{queue}' after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        queue: String,
        attempts: u32,
        last_error: QueueError,
    },
}

pub struct JobConsumer<C: QueueConnector> {
    connector: C,
    queue: String,
    class: CapabilityClass,
    converter: Arc<dyn Converter>,
    notifier: Arc<dyn CallbackNotifier>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConsumerState>,
}

impl<C: QueueConnector> JobConsumer<C> {
    /// Consumer for the queue of the converter's capability class.
    pub fn new(
        connector: C,
        converter: Arc<dyn Converter>,
        notifier: Arc<dyn CallbackNotifier>,
    ) -> Self {
        let class = converter.class();
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            connector,
            queue: class.queue_name().to_string(),
            class,
            converter,
            notifier,
            policy: ReconnectPolicy::default(),
            state,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(queue = %self.queue, from = ?previous, to = ?state, "Consumer state changed");
        }
    }

    /// Runs until `cancel` fires, or until the reconnect policy gives up.
    ///
    /// A job already being processed when `cancel` fires is finished and
    /// acknowledged first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let mut failures = 0u32;
        info!(queue = %self.queue, capability = %self.class, "Job consumer started");

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConsumerState::Connecting);
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                result = self.connector.subscribe(&self.queue) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    failures = 0;
                    self.set_state(ConsumerState::Subscribed);
                    info!(queue = %self.queue, "Subscribed to queue");

                    match self.consume(subscription, &cancel).await {
                        Ok(()) => break Ok(()),
                        Err(e) => {
                            self.set_state(ConsumerState::Disconnected);
                            warn!(queue = %self.queue, error = %e, "Lost queue subscription");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.set_state(ConsumerState::Disconnected);
                    if self.policy.exhausted(failures) {
                        error!(queue = %self.queue, attempts = failures, error = %e, "Giving up on queue");
                        break Err(ConsumerError::ReconnectExhausted {
                            queue: self.queue.clone(),
                            attempts: failures,
                            last_error: e,
                        });
                    }
                    warn!(
                        queue = %self.queue,
                        attempt = failures,
                        retry_in_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "Failed to connect to queue"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        };

        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.queue, "Job consumer stopped");
        result
    }

    /// Drains a subscription. `Ok` means cancelled; `Err` means the
    /// subscription broke and must be reopened.
    async fn consume(
        &self,
        mut subscription: C::Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = subscription.next() => next?,
            };
            let Some(delivery) = next else {
                continue;
            };

            self.set_state(ConsumerState::Processing);
            let outcome = self.process_delivery(&delivery).await;
            subscription.ack(&delivery).await?;
            debug!(queue = %self.queue, outcome = %outcome, "Acknowledged delivery");
            self.set_state(ConsumerState::Subscribed);
        }
    }

    /// Decodes, converts and delivers one message. Never fails: every
    /// problem is logged and folded into the outcome.
    pub async fn process_delivery(&self, delivery: &Delivery) -> JobOutcome {
        let job = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                telemetry::record_malformed_message(&self.queue, &e.to_string());
                return JobOutcome::Malformed;
            }
        };

        let started = Instant::now();
        info!(
            job_id = %job.job_id,
            filename = %job.request.filename,
            source = %job.request.source,
            target = %job.request.target,
            queue_age_ms = job.age_ms(),
            "Processing job"
        );

        let (outcome, error) = match self.converter.convert(&job.request).await {
            Ok(file) => match self.notifier.notify(&job.callback_url, &file).await {
                Ok(()) => (JobOutcome::Delivered, None),
                Err(e) => (JobOutcome::CallbackFailed, Some(e.to_string())),
            },
            Err(e) => (JobOutcome::ConvertFailed, Some(e.to_string())),
        };

        telemetry::record_job_telemetry(&JobReport {
            job: &job,
            class: self.class,
            outcome,
            duration_ms: started.elapsed().as_millis() as i64,
            error,
        });
        outcome
    }
}
