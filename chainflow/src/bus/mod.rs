//! Topic-based message bus used by the queue consumer and producer stages.
//!
//! [`InMemoryBus`] keeps an append-only log per topic and a committed offset
//! per `(group, topic)`. Consumers in the same group share offsets, so each
//! message is delivered to one of them.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors from the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus no longer accepts messages.
    #[error("message bus is closed")]
    Closed,

    /// A subscription named no topics.
    #[error("subscription needs at least one topic")]
    NoTopics,

    /// Backend-specific failure.
    #[error("message bus error: {0}")]
    Backend(String),
}

/// A message read from a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Partitioning key, if any.
    pub key: Option<String>,
    /// Message body.
    pub payload: Value,
    /// Position in the topic log.
    pub offset: u64,
}

/// Publish/subscribe access to named topics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends a message to a topic and returns its offset.
    async fn publish(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Value,
    ) -> Result<u64, BusError>;

    /// Streams messages from `topics` for a consumer group.
    ///
    /// The stream ends when the bus shuts down and the group has caught up.
    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<BoxStream<'static, BusMessage>, BusError>;
}

#[derive(Debug, Default)]
struct BusInner {
    topics: DashMap<String, Vec<BusMessage>>,
    offsets: DashMap<(String, String), u64>,
    closed: AtomicBool,
    notify: Notify,
}

impl BusInner {
    /// Takes the next message for a group, advancing its offset.
    fn next_for(&self, group: &str, topic: &str) -> Option<BusMessage> {
        let log = self.topics.get(topic)?;
        let mut offset = self
            .offsets
            .entry((group.to_string(), topic.to_string()))
            .or_insert(0);
        let message = log.get(usize::try_from(*offset).ok()?)?.clone();
        *offset += 1;
        Some(message)
    }
}

/// A message bus held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting messages and lets subscriptions finish once drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Every message published to `topic`, in order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .topics
            .get(topic)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    fn topic_stream(&self, topic: String, group: String) -> BoxStream<'static, BusMessage> {
        let inner = Arc::clone(&self.inner);
        stream::unfold((inner, topic, group), |(inner, topic, group)| async move {
            loop {
                let next = {
                    let notified = inner.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    match inner.next_for(&group, &topic) {
                        Some(message) => Some(message),
                        None if inner.closed.load(Ordering::SeqCst) => None,
                        None => {
                            notified.await;
                            continue;
                        }
                    }
                };
                return next.map(|message| (message, (inner, topic, group)));
            }
        })
        .boxed()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Value,
    ) -> Result<u64, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let offset = {
            let mut log = self.inner.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as u64;
            log.push(BusMessage {
                topic: topic.to_string(),
                key,
                payload,
                offset,
            });
            offset
        };
        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<BoxStream<'static, BusMessage>, BusError> {
        if topics.is_empty() {
            return Err(BusError::NoTopics);
        }
        let streams = topics
            .iter()
            .map(|topic| self.topic_stream(topic.clone(), group.to_string()));
        Ok(stream::select_all(streams).boxed())
    }
}
