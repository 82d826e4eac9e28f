//! BookVibe event system
//!
//! Provides shared event definitions and the EventBus used to stream
//! resolution progress from the orchestrator to SSE subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// BookVibe event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BookVibeEvent {
    /// A resolution batch started (one event per `resolve_batch` call)
    ResolveBatchStarted {
        batch_id: Uuid,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// A record entered a new resolution stage
    ///
    /// `stage` is a human-readable label ("searching", "generating via paid",
    /// "generating via free (Pollinations.ai)", ...). Intermediate only;
    /// never emitted after the record reached a terminal status.
    ResolveProgress {
        batch_id: Uuid,
        index: usize,
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// A record reached a terminal status
    ///
    /// `fallback` is true when every provider tier failed and the URL is the
    /// deterministic placeholder. Exactly one per (batch, index).
    ResolveCompleted {
        batch_id: Uuid,
        index: usize,
        image_url: String,
        fallback: bool,
        timestamp: DateTime<Utc>,
    },

    /// Every record of the batch reached a terminal status
    ResolveBatchCompleted {
        batch_id: Uuid,
        resolved: usize,
        fallbacks: usize,
        timestamp: DateTime<Utc>,
    },
}

impl BookVibeEvent {
    /// Event type name for SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            BookVibeEvent::ResolveBatchStarted { .. } => "ResolveBatchStarted",
            BookVibeEvent::ResolveProgress { .. } => "ResolveProgress",
            BookVibeEvent::ResolveCompleted { .. } => "ResolveCompleted",
            BookVibeEvent::ResolveBatchCompleted { .. } => "ResolveBatchCompleted",
        }
    }

    /// Batch this event belongs to
    pub fn batch_id(&self) -> Uuid {
        match self {
            BookVibeEvent::ResolveBatchStarted { batch_id, .. }
            | BookVibeEvent::ResolveProgress { batch_id, .. }
            | BookVibeEvent::ResolveCompleted { batch_id, .. }
            | BookVibeEvent::ResolveBatchCompleted { batch_id, .. } => *batch_id,
        }
    }
}

/// Central event distribution bus
///
/// Wraps tokio::broadcast, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BookVibeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Old events are dropped once more than `capacity` events are buffered
    /// for a lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<BookVibeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)`; `Err` when no subscriber is listening,
    /// which is not an error condition for the resolver (the batch state is
    /// authoritative, events are advisory).
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: BookVibeEvent,
    ) -> Result<usize, broadcast::error::SendError<BookVibeEvent>> {
        self.tx.send(event)
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(batch_id: Uuid) -> BookVibeEvent {
        BookVibeEvent::ResolveProgress {
            batch_id,
            index: 2,
            stage: "generating via paid".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let batch_id = Uuid::new_v4();

        bus.emit(progress_event(batch_id)).unwrap();

        match rx.recv().await.unwrap() {
            BookVibeEvent::ResolveProgress { index, stage, .. } => {
                assert_eq!(index, 2);
                assert_eq!(stage, "generating via paid");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_err_not_panic() {
        let bus = EventBus::new(4);
        assert!(bus.emit(progress_event(Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BookVibeEvent::ResolveCompleted {
            batch_id: Uuid::new_v4(),
            index: 0,
            image_url: "https://picsum.photos/seed/42/600/400".to_string(),
            fallback: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"ResolveCompleted""#));
        assert!(json.contains(r#""fallback":true"#));
        assert_eq!(event.event_type(), "ResolveCompleted");
    }
}
