//! In-process queue with the same delivery semantics as the Redis queue.
//!
//! Useful for tests and single-process runs. Un-acked messages are tracked
//! per consumer name and handed back to the head of the queue when that
//! consumer subscribes again.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, JobPublisher, JobSubscription, QueueConnector, QueueError};
use crate::job::JobRequest;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    in_flight: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
    offline: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates a broker outage: every operation fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    pub fn connector(&self, consumer_name: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            queue: self.clone(),
            consumer: consumer_name.into(),
            poll_timeout: Duration::from_millis(100),
        }
    }

    /// Messages waiting to be delivered.
    pub fn len(&self, queue: &str) -> usize {
        self.queues().get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Messages delivered but not yet acknowledged, across all consumers.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.queues()
            .get(queue)
            .map(|q| q.in_flight.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Pushes a raw message, bypassing job encoding.
    pub fn push_raw(&self, queue: &str, raw: impl Into<String>) {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(raw.into());
        self.inner.published.notify_waiters();
    }
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish(&self, queue: &str, job: &JobRequest) -> Result<(), QueueError> {
        if self.is_offline() {
            return Err(QueueError::PublishFailed {
                queue: queue.to_string(),
                reason: "broker offline".to_string(),
            });
        }
        self.push_raw(queue, job.to_wire()?);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    queue: MemoryQueue,
    consumer: String,
    poll_timeout: Duration,
}

impl MemoryConnector {
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    type Subscription = MemorySubscription;

    async fn subscribe(&self, queue: &str) -> Result<MemorySubscription, QueueError> {
        if self.queue.is_offline() {
            return Err(QueueError::Connect("broker offline".to_string()));
        }
        {
            let mut queues = self.queue.queues();
            let state = queues.entry(queue.to_string()).or_default();
            if let Some(pending) = state.in_flight.remove(&self.consumer) {
                for raw in pending.into_iter().rev() {
                    state.ready.push_front(raw);
                }
            }
        }
        Ok(MemorySubscription {
            queue: self.queue.clone(),
            name: queue.to_string(),
            consumer: self.consumer.clone(),
            poll_timeout: self.poll_timeout,
        })
    }
}

pub struct MemorySubscription {
    queue: MemoryQueue,
    name: String,
    consumer: String,
    poll_timeout: Duration,
}

impl MemorySubscription {
    fn try_take(&self) -> Option<String> {
        let mut queues = self.queue.queues();
        let state = queues.entry(self.name.clone()).or_default();
        let raw = state.ready.pop_front()?;
        state
            .in_flight
            .entry(self.consumer.clone())
            .or_default()
            .push(raw.clone());
        Some(raw)
    }
}

#[async_trait]
impl JobSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            let notified = self.queue.inner.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.queue.is_offline() {
                return Err(QueueError::Receive {
                    queue: self.name.clone(),
                    reason: "broker offline".to_string(),
                });
            }
            if let Some(raw) = self.try_take() {
                return Ok(Some(Delivery::new(raw)));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.queue.is_offline() {
            return Err(QueueError::Ack {
                queue: self.name.clone(),
                reason: "broker offline".to_string(),
            });
        }
        let mut queues = self.queue.queues();
        if let Some(pending) = queues
            .get_mut(&self.name)
            .and_then(|state| state.in_flight.get_mut(&self.consumer))
        {
            if let Some(pos) = pending.iter().position(|raw| raw == delivery.raw()) {
                pending.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{parse_callback_url, ConvertRequest};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn job(name: &str) -> JobRequest {
        JobRequest::new(
            ConvertRequest::new(name, Bytes::from_static(b"\x89PNG\r\n"), "jpg").unwrap(),
            parse_callback_url("http://caller/callback").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_publish_then_consume_round_trip() {
        let queue = MemoryQueue::new();
        let original = job("a.png");
        queue.publish("q", &original).await.unwrap();

        let mut sub = queue.connector("c").subscribe("q").await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();

        assert_eq!(delivery.decode().unwrap(), original);
        assert_eq!(queue.in_flight("q"), 1);
        sub.ack(&delivery).await.unwrap();
        assert_eq!(queue.in_flight("q"), 0);
        assert!(queue.is_empty("q"));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new();
        for name in ["1.png", "2.png", "3.png"] {
            queue.publish("q", &job(name)).await.unwrap();
        }
        let mut sub = queue.connector("c").subscribe("q").await.unwrap();
        let mut seen = Vec::new();
        while let Some(d) = sub.next().await.unwrap() {
            seen.push(d.decode().unwrap().request.filename);
            sub.ack(&d).await.unwrap();
        }
        assert_eq!(seen, vec!["1.png", "2.png", "3.png"]);
    }

    #[tokio::test]
    async fn test_unacked_delivery_returns_on_resubscribe() {
        let queue = MemoryQueue::new();
        queue.publish("q", &job("first.png")).await.unwrap();
        queue.publish("q", &job("second.png")).await.unwrap();

        let connector = queue.connector("worker-1");
        {
            let mut sub = connector.subscribe("q").await.unwrap();
            let d = sub.next().await.unwrap().unwrap();
            assert_eq!(d.decode().unwrap().request.filename, "first.png");
            // crash: no ack
        }

        let mut sub = connector.subscribe("q").await.unwrap();
        let d = sub.next().await.unwrap().unwrap();
        assert_eq!(d.decode().unwrap().request.filename, "first.png");
    }

    #[tokio::test]
    async fn test_next_times_out_when_empty() {
        let queue = MemoryQueue::new();
        let mut sub = queue
            .connector("c")
            .with_poll_timeout(Duration::from_millis(20))
            .subscribe("q")
            .await
            .unwrap();
        assert!(sub.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let queue = MemoryQueue::new();
        let mut sub = queue
            .connector("c")
            .with_poll_timeout(Duration::from_secs(5))
            .subscribe("q")
            .await
            .unwrap();

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", &job("late.gif")).await.unwrap();
        });

        let d = sub.next().await.unwrap().unwrap();
        assert_eq!(d.decode().unwrap().request.filename, "late.gif");
    }

    #[tokio::test]
    async fn test_offline_broker_fails_operations() {
        let queue = MemoryQueue::new();
        queue.set_offline(true);
        assert!(matches!(
            queue.publish("q", &job("a.png")).await,
            Err(QueueError::PublishFailed { .. })
        ));
        assert!(matches!(
            queue.connector("c").subscribe("q").await,
            Err(QueueError::Connect(_))
        ));
    }
}
