// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event sources.
//!
//! An [`EventSource`] hands out one message at a time from a per-source
//! buffer, waiting at most `timeout` for one to arrive. The consume loop and
//! the dependency look-ahead both pull from the same source, so a message
//! consumed while waiting for a parent is never read twice.
//!
//! Two implementations ship with the crate:
//! - [`RedisEventSource`](crate::stream::RedisEventSource) for production
//! - [`InMemoryEventSource`] for embedding and tests

use crate::error::{BoxFuture, Result};
use crate::event::EventMessage;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

/// A buffered stream of CDC messages for one source system.
///
/// `Sync` because the consume loop holds `&self` across awaits inside a
/// spawned task.
pub trait EventSource: Send + Sync {
    /// Name used in logs and metrics.
    fn source_name(&self) -> &str;

    /// Next message, or `None` if nothing arrived within `timeout`.
    ///
    /// A zero timeout returns only what is already available.
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Option<EventMessage>>;
}

/// Queue-backed event source.
///
/// Messages pushed through the paired [`InMemoryPublisher`] become visible
/// to `poll` in push order.
pub struct InMemoryEventSource {
    name: String,
    backlog: VecDeque<EventMessage>,
    rx: mpsc::UnboundedReceiver<EventMessage>,
    closed: bool,
}

/// Sending half of an [`InMemoryEventSource`].
#[derive(Clone)]
pub struct InMemoryPublisher {
    tx: mpsc::UnboundedSender<EventMessage>,
}

impl InMemoryPublisher {
    /// Publish a raw envelope received now. Returns false once the source is gone.
    pub fn publish(&self, raw_payload: impl Into<String>) -> bool {
        self.publish_event(EventMessage::new(raw_payload))
    }

    pub fn publish_event(&self, event: EventMessage) -> bool {
        self.tx.send(event).is_ok()
    }
}

impl InMemoryEventSource {
    /// Create a source and its publisher.
    pub fn channel(name: impl Into<String>) -> (InMemoryPublisher, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InMemoryPublisher { tx },
            Self {
                name: name.into(),
                backlog: VecDeque::new(),
                rx,
                closed: false,
            },
        )
    }

    /// Create a source pre-loaded with messages and no live publisher.
    pub fn from_messages<I>(name: impl Into<String>, messages: I) -> Self
    where
        I: IntoIterator<Item = EventMessage>,
    {
        let (_publisher, mut source) = Self::channel(name);
        source.backlog.extend(messages);
        source
    }

    /// Messages buffered but not yet polled.
    pub fn pending(&self) -> usize {
        self.backlog.len() + self.rx.len()
    }

    async fn next(&mut self, timeout: Duration) -> Option<EventMessage> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if let Ok(event) = self.rx.try_recv() {
            return Some(event);
        }
        if self.closed || timeout.is_zero() {
            if self.closed && !timeout.is_zero() {
                tokio::time::sleep(timeout).await;
            }
            return None;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                // All publishers dropped; behave like an idle broker from now on.
                self.closed = true;
                None
            }
            Err(_) => None,
        }
    }
}

impl EventSource for InMemoryEventSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Option<EventMessage>> {
        Box::pin(async move { Ok::<_, crate::error::SyncError>(self.next(timeout).await) })
    }
}

/// Drain everything available right now, up to `limit` messages.
pub async fn drain_available(source: &mut dyn EventSource, limit: usize) -> Result<Vec<EventMessage>> {
    let mut out = Vec::new();
    while out.len() < limit {
        match source.poll(Duration::ZERO).await? {
            Some(event) => out.push(event),
            None => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_poll_in_order() {
        let (publisher, mut source) = InMemoryEventSource::channel("legacy");
        assert!(publisher.publish("a"));
        assert!(publisher.publish("b"));
        assert_eq!(source.pending(), 2);

        let first = source.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = source.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.raw_payload(), "a");
        assert_eq!(second.raw_payload(), "b");
        assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_messages() {
        let mut source = InMemoryEventSource::from_messages(
            "modern",
            vec![EventMessage::new("x"), EventMessage::new("y")],
        );
        assert_eq!(source.source_name(), "modern");
        let drained = drain_available(&mut source, 10).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(source.poll(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_respects_limit() {
        let (publisher, mut source) = InMemoryEventSource::channel("legacy");
        for i in 0..5 {
            publisher.publish(format!("m{i}"));
        }
        let drained = drain_available(&mut source, 3).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(source.pending(), 2);
    }

    #[tokio::test]
    async fn test_poll_waits_for_late_publish() {
        let (publisher, mut source) = InMemoryEventSource::channel("legacy");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("late");
        });
        let event = source.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.unwrap().raw_payload(), "late");
    }

    #[tokio::test]
    async fn test_publisher_dropped_source_idles() {
        let (publisher, mut source) = InMemoryEventSource::channel("legacy");
        drop(publisher);
        assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_none());
        assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_none());
    }
}
