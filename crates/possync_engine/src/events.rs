//! Typed session events.

use crate::state::SessionState;
use possync_protocol::ConflictRecord;
use std::time::Duration;
use tokio::sync::broadcast;

/// Everything a replication session reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved between states.
    StateChanged {
        /// Collection name.
        collection: String,
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// A pull batch was applied locally.
    PullCompleted {
        /// Collection name.
        collection: String,
        /// Changes read from the remote.
        docs_read: u64,
        /// Revisions written locally.
        docs_written: u64,
    },
    /// The remote confirmed it holds these documents.
    PushAcknowledged {
        /// Collection name.
        collection: String,
        /// Acknowledged ids.
        ids: Vec<String>,
    },
    /// Local copies were tombstoned after acknowledgement.
    Purged {
        /// Collection name.
        collection: String,
        /// Purged ids.
        ids: Vec<String>,
    },
    /// A conflict was resolved.
    ConflictResolved {
        /// Collection name.
        collection: String,
        /// What was resolved and how.
        record: ConflictRecord,
    },
    /// A conflict was left in place and will be retried.
    ConflictUnresolved {
        /// Collection name.
        collection: String,
        /// Conflicted id.
        doc_id: String,
        /// Failure description.
        reason: String,
    },
    /// A transient failure will be retried.
    RetryScheduled {
        /// Collection name.
        collection: String,
        /// Consecutive failures so far.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// The session failed.
    Error {
        /// Collection name.
        collection: String,
        /// Failure description.
        error: String,
    },
}

impl SessionEvent {
    /// Collection the event belongs to.
    pub fn collection(&self) -> &str {
        match self {
            SessionEvent::StateChanged { collection, .. }
            | SessionEvent::PullCompleted { collection, .. }
            | SessionEvent::PushAcknowledged { collection, .. }
            | SessionEvent::Purged { collection, .. }
            | SessionEvent::ConflictResolved { collection, .. }
            | SessionEvent::ConflictUnresolved { collection, .. }
            | SessionEvent::RetryScheduled { collection, .. }
            | SessionEvent::Error { collection, .. } => collection,
        }
    }
}

/// Publish/subscribe bus for one event type.
///
/// Subscribers that fall behind by more than the capacity miss events;
/// publishing never blocks.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event; returns how many subscribers received it.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new(4);
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::PushAcknowledged {
            collection: "orders".into(),
            ids: vec!["o1".into()],
        });
        bus.publish(SessionEvent::Purged {
            collection: "orders".into(),
            ids: vec!["o1".into()],
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::PushAcknowledged { .. }
        ));
        let purged = rx.recv().await.unwrap();
        assert!(matches!(purged, SessionEvent::Purged { .. }));
        assert_eq!(purged.collection(), "orders");
    }
}
