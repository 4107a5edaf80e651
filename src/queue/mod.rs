//! Durable job queue abstraction.
//!
//! Publishing and consuming are split: the dispatcher only needs a
//! [`JobPublisher`], while a backend consumer opens a [`JobSubscription`]
//! through a [`QueueConnector`]. A subscription hands out at most one
//! unacknowledged [`Delivery`] at a time; anything not acknowledged before
//! the subscription goes away is delivered again to the next subscriber
//! with the same consumer name.

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{JobError, JobRequest};

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to queue broker: {0}")]
    Connect(String),

    #[error("failed to publish to queue '{queue}': {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("failed to receive from queue '{queue}': {reason}")]
    Receive { queue: String, reason: String },

    #[error("failed to acknowledge message on queue '{queue}': {reason}")]
    Ack { queue: String, reason: String },

    #[error(transparent)]
    Encode(#[from] JobError),
}

/// One message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    raw: String,
}

impl Delivery {
    pub fn new(raw: String) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn decode(&self) -> Result<JobRequest, JobError> {
        JobRequest::from_wire(&self.raw)
    }
}

/// Writes jobs onto named durable queues. Must tolerate concurrent use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, queue: &str, job: &JobRequest) -> Result<(), QueueError>;
}

/// Opens subscriptions for a consumer.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    type Subscription: JobSubscription;

    /// Connects and subscribes; messages left unacknowledged by a previous
    /// subscription of the same consumer are made available again first.
    async fn subscribe(&self, queue: &str) -> Result<Self::Subscription, QueueError>;
}

/// Prefetch-one subscription to a single queue.
#[async_trait]
pub trait JobSubscription: Send {
    /// Waits for the next message; `Ok(None)` when the poll window elapsed
    /// without one. Must not be called again before the previous delivery
    /// is acknowledged.
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Removes a delivered message from the queue for good.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;
}
