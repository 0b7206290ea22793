//! Message channel interface and in-process at-least-once implementation

use crate::error::ChannelError;
use crate::types::JobEnvelope;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often an idle subscription rechecks for expired leases
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Envelopes [`InMemoryChannel::published`] keeps per topic by default
pub const DEFAULT_PUBLISH_LOG: usize = 4096;

/// One delivery of a job to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: u64,
    pub topic: String,
    pub envelope: JobEnvelope,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_attempt: u32,
}

/// At-least-once topic transport
///
/// Subscribers to the same topic compete for its jobs. A delivery that is
/// not acknowledged before its lease expires, or that is nacked, is
/// delivered again.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn publish(&self, topic: &str, envelope: JobEnvelope) -> Result<(), ChannelError>;

    /// Lazy stream of deliveries; ends when the channel closes
    fn subscribe(&self, topic: &str) -> BoxStream<'static, Delivery>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Return the delivery for immediate redelivery
    async fn nack(&self, delivery: &Delivery) -> Result<(), ChannelError>;
}

#[derive(Debug)]
struct Pending {
    envelope: JobEnvelope,
    attempt: u32,
}

#[derive(Debug)]
struct Leased {
    envelope: JobEnvelope,
    attempt: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct TopicState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, Leased>,
    published: VecDeque<JobEnvelope>,
}

#[derive(Debug)]
struct Topic {
    name: String,
    state: Mutex<TopicState>,
    notify: Notify,
    closed: AtomicBool,
}

impl Topic {
    fn new(name: &str, closed: bool) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(closed),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requeue expired leases, then lease the next ready job
    fn take(&self, next_id: &AtomicU64, lease: Duration) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = state.in_flight.remove(&id) {
                debug!(topic = %self.name, job_id = %leased.envelope.job_id, "lease expired, redelivering");
                state.ready.push_back(Pending {
                    envelope: leased.envelope,
                    attempt: leased.attempt + 1,
                });
            }
        }

        let pending = state.ready.pop_front()?;
        let delivery_id = next_id.fetch_add(1, Ordering::Relaxed);
        state.in_flight.insert(
            delivery_id,
            Leased {
                envelope: pending.envelope.clone(),
                attempt: pending.attempt,
                deadline: now + lease,
            },
        );
        Some(Delivery {
            delivery_id,
            topic: self.name.clone(),
            envelope: pending.envelope,
            delivery_attempt: pending.attempt,
        })
    }
}

/// In-process channel with leases and redelivery
#[derive(Debug)]
pub struct InMemoryChannel {
    topics: DashMap<String, Arc<Topic>>,
    next_delivery: Arc<AtomicU64>,
    lease: Duration,
    /// Most recent envelopes kept per topic for inspection
    publish_log: usize,
    closed: AtomicBool,
    /// Published but not yet acked, across all topics
    unacked: AtomicUsize,
}

impl InMemoryChannel {
    /// Create new channel with the given delivery lease
    #[must_use]
    pub fn new(lease: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            next_delivery: Arc::new(AtomicU64::new(1)),
            lease,
            publish_log: DEFAULT_PUBLISH_LOG,
            closed: AtomicBool::new(false),
            unacked: AtomicUsize::new(0),
        }
    }

    /// Keep only the last `limit` envelopes per topic; 0 disables the log
    #[must_use]
    pub fn with_publish_log(mut self, limit: usize) -> Self {
        self.publish_log = limit;
        self
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.closed.load(Ordering::Acquire))))
            .clone()
    }

    /// End every subscription stream
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for topic in self.topics.iter() {
            topic.closed.store(true, Ordering::Release);
            topic.notify.notify_waiters();
        }
    }

    /// Jobs waiting for delivery plus jobs leased but not acknowledged
    #[must_use]
    pub fn outstanding(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| {
            let state = t.state.lock();
            state.ready.len() + state.in_flight.len()
        })
    }

    /// Whether every published job has been acked
    ///
    /// A handler publishes its follow-up job before its own delivery is
    /// acked, so a chain of jobs never reads as idle halfway through.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.unacked.load(Ordering::Acquire) == 0
    }

    /// Wait until no topic has outstanding work
    ///
    /// Returns `false` if `timeout` passes first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Recent envelopes published to `topic`, oldest first
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<JobEnvelope> {
        self.topics
            .get(topic)
            .map(|t| t.state.lock().published.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn settle(&self, delivery: &Delivery) -> Result<(Arc<Topic>, Leased), ChannelError> {
        let topic = self
            .topics
            .get(&delivery.topic)
            .map(|t| Arc::clone(&t))
            .ok_or(ChannelError::UnknownDelivery(delivery.delivery_id))?;
        let leased = topic
            .state
            .lock()
            .in_flight
            .remove(&delivery.delivery_id)
            .ok_or(ChannelError::UnknownDelivery(delivery.delivery_id))?;
        Ok((topic, leased))
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn publish(&self, topic: &str, envelope: JobEnvelope) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let topic = self.topic(topic);
        self.unacked.fetch_add(1, Ordering::AcqRel);
        {
            let mut state = topic.state.lock();
            if self.publish_log > 0 {
                if state.published.len() == self.publish_log {
                    state.published.pop_front();
                }
                state.published.push_back(envelope.clone());
            }
            state.ready.push_back(Pending {
                envelope,
                attempt: 1,
            });
        }
        topic.notify.notify_one();
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> BoxStream<'static, Delivery> {
        let topic = self.topic(topic);
        let next_id = Arc::clone(&self.next_delivery);
        let lease = self.lease;
        stream::unfold((topic, next_id), move |(topic, next_id)| async move {
            loop {
                if topic.is_closed() {
                    return None;
                }
                if let Some(delivery) = topic.take(&next_id, lease) {
                    return Some((delivery, (topic, next_id)));
                }
                // woken by a publish, or time out to sweep expired leases
                let _ = tokio::time::timeout(IDLE_POLL, topic.notify.notified()).await;
            }
        })
        .boxed()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.settle(delivery)?;
        self.unacked.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let (topic, leased) = self.settle(delivery).map_err(|e| {
            warn!(delivery_id = delivery.delivery_id, "nack for unknown delivery");
            e
        })?;
        topic.state.lock().ready.push_back(Pending {
            envelope: leased.envelope,
            attempt: leased.attempt + 1,
        });
        topic.notify.notify_one();
        Ok(())
    }
}
