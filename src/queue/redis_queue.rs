//! Redis-backed job queue.
//!
//! Uses the reliable-queue pattern: `BLMOVE` atomically moves a message from
//! the queue into a per-consumer processing list, and acknowledgement is an
//! `LREM` from that list. Whatever is still in the processing list when a
//! consumer resubscribes was never acknowledged and is pushed back to the
//! head of the queue.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Delivery, JobPublisher, JobSubscription, QueueConnector, QueueError};
use crate::job::JobRequest;

/// Default blocking window for a single receive.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

fn processing_key(queue: &str, consumer: &str) -> String {
    format!("{}:processing:{}", queue, consumer)
}

async fn open(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| QueueError::Connect(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::Connect(e.to_string()))
}

/// Publishing side of the Redis queue.
///
/// The connection manager multiplexes one connection and is cheap to clone,
/// so a single instance serves concurrent publishers.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        Ok(Self::new(open(redis_url).await?))
    }

    /// Number of messages waiting on `queue` (excluding in-flight ones).
    pub async fn queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        conn.llen(queue).await.map_err(|e| QueueError::Receive {
            queue: queue.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl JobPublisher for RedisJobQueue {
    async fn publish(&self, queue: &str, job: &JobRequest) -> Result<(), QueueError> {
        let raw = job.to_wire()?;
        let mut conn = self.conn.clone();

        // RPUSH + LEFT-side receive keeps FIFO order
        conn.rpush::<_, _, ()>(queue, &raw)
            .await
            .map_err(|e| QueueError::PublishFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        info!(
            job_id = %job.job_id,
            queue = queue,
            bytes = raw.len(),
            "Published job"
        );
        Ok(())
    }
}

/// Opens Redis subscriptions under a stable consumer name.
///
/// The name must survive process restarts for un-acked messages to be
/// recovered; two live consumers must never share one.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    redis_url: String,
    consumer_name: String,
    poll_timeout: Duration,
}

impl RedisConnector {
    pub fn new(redis_url: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            consumer_name: consumer_name.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

#[async_trait]
impl QueueConnector for RedisConnector {
    type Subscription = RedisSubscription;

    async fn subscribe(&self, queue: &str) -> Result<RedisSubscription, QueueError> {
        let mut subscription = RedisSubscription {
            conn: open(&self.redis_url).await?,
            queue: queue.to_string(),
            processing: processing_key(queue, &self.consumer_name),
            poll_timeout: self.poll_timeout,
        };
        let recovered = subscription.recover().await?;
        if recovered > 0 {
            warn!(
                queue = queue,
                consumer = %self.consumer_name,
                recovered = recovered,
                "Re-queued unacknowledged messages from previous session"
            );
        }
        Ok(subscription)
    }
}

pub struct RedisSubscription {
    conn: ConnectionManager,
    queue: String,
    processing: String,
    poll_timeout: Duration,
}

impl RedisSubscription {
    fn receive_error(&self, e: redis::RedisError) -> QueueError {
        QueueError::Receive {
            queue: self.queue.clone(),
            reason: e.to_string(),
        }
    }

    /// Moves every entry of the processing list back to the queue head.
    async fn recover(&mut self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut self.conn)
                .await
                .map_err(|e| self.receive_error(e))?;
            match moved {
                Some(_) => recovered += 1,
                None => return Ok(recovered),
            }
        }
    }
}

#[async_trait]
impl JobSubscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(self.poll_timeout.as_secs_f64())
            .query_async(&mut self.conn)
            .await
            .map_err(|e| self.receive_error(e))?;

        if raw.is_some() {
            debug!(queue = %self.queue, "Received message");
        }
        Ok(raw.map(Delivery::new))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let removed: i64 = self
            .conn
            .lrem(&self.processing, 1, delivery.raw())
            .await
            .map_err(|e| QueueError::Ack {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })?;
        if removed == 0 {
            warn!(queue = %self.queue, "Acknowledged message was not in the processing list");
        }
        Ok(())
    }
}
