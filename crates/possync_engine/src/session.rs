//! Replication session handle.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SessionEvent};
use crate::options::SyncOptions;
use crate::state::SessionState;
use crate::status::StatusRegistry;
use parking_lot::{Mutex, RwLock};
use possync_protocol::{Checkpoint, Direction};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Counters accumulated over a session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Revisions written locally by pulls.
    pub docs_pulled: u64,
    /// Revisions written remotely by pushes.
    pub docs_pushed: u64,
    /// Documents rejected by either side.
    pub doc_write_failures: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Local copies purged after acknowledgement.
    pub purged: u64,
    /// Retries scheduled.
    pub retries: u64,
}

/// One collection's replication, as seen by its owner.
///
/// The session's task is driven by the coordinator; this handle exposes
/// state, checkpoints and cooperative cancellation.
pub struct ReplicationSession {
    id: Uuid,
    collection: String,
    options: SyncOptions,
    state: watch::Sender<SessionState>,
    pull_checkpoint: RwLock<Checkpoint>,
    push_checkpoint: RwLock<Checkpoint>,
    last_error: RwLock<Option<SyncError>>,
    stats: RwLock<SessionStats>,
    pending_conflicts: Mutex<BTreeSet<String>>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<SessionEvent>,
    status: Arc<StatusRegistry>,
}

impl ReplicationSession {
    pub(crate) fn new(
        collection: impl Into<String>,
        options: SyncOptions,
        events: EventBus<SessionEvent>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            options,
            state,
            pull_checkpoint: RwLock::new(Checkpoint::zero()),
            push_checkpoint: RwLock::new(Checkpoint::zero()),
            last_error: RwLock::new(None),
            stats: RwLock::new(SessionStats::default()),
            pending_conflicts: Mutex::new(BTreeSet::new()),
            cancel,
            task: Mutex::new(None),
            events,
            status,
        }
    }

    /// Unique session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Options the session runs with.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Replication direction.
    pub fn direction(&self) -> Direction {
        self.options.direction
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Waits until the state satisfies `predicate`, returning that state.
    pub async fn wait_for_state(&self, predicate: impl Fn(SessionState) -> bool) -> SessionState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(|state| predicate(*state)).await.map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Waits up to `timeout` for the state to satisfy `predicate`.
    pub async fn wait_for_state_timeout(
        &self,
        predicate: impl Fn(SessionState) -> bool,
        timeout: Duration,
    ) -> Option<SessionState> {
        tokio::time::timeout(timeout, self.wait_for_state(predicate))
            .await
            .ok()
    }

    /// Last session-fatal error.
    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.read().clone()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    /// Next remote sequence to pull from.
    pub fn pull_checkpoint(&self) -> Checkpoint {
        self.pull_checkpoint.read().clone()
    }

    /// Next local sequence to push from.
    pub fn push_checkpoint(&self) -> Checkpoint {
        self.push_checkpoint.read().clone()
    }

    pub(crate) fn set_pull_checkpoint(&self, checkpoint: Checkpoint) {
        *self.pull_checkpoint.write() = checkpoint;
    }

    pub(crate) fn set_push_checkpoint(&self, checkpoint: Checkpoint) {
        *self.push_checkpoint.write() = checkpoint;
    }

    /// Starts from another session's progress.
    pub(crate) fn resume_from(&self, previous: &ReplicationSession) {
        self.set_pull_checkpoint(previous.pull_checkpoint());
        self.set_push_checkpoint(previous.push_checkpoint());
        self.pending_conflicts
            .lock()
            .extend(previous.pending_conflicts());
    }

    /// Ids whose conflict resolution failed and will be retried.
    pub fn pending_conflicts(&self) -> Vec<String> {
        self.pending_conflicts.lock().iter().cloned().collect()
    }

    pub(crate) fn mark_pending(&self, id: &str) {
        self.pending_conflicts.lock().insert(id.to_string());
    }

    pub(crate) fn clear_pending(&self, id: &str) {
        self.pending_conflicts.lock().remove(id);
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut SessionStats)) {
        update(&mut self.stats.write());
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        self.events.publish(event);
    }

    /// Moves to `next`, publishing the change. Staying in the current state
    /// is a no-op.
    pub(crate) fn set_state(&self, next: SessionState) -> SyncResult<()> {
        let mut outcome = Ok(None);
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match current.transition(next) {
                Ok(state) => {
                    outcome = Ok(Some(*current));
                    *current = state;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });

        if let Some(from) = outcome? {
            debug!(collection = %self.collection, %from, to = %next, "session state changed");
            self.status
                .update(&self.collection, next.is_active(), None);
            self.events.publish(SessionEvent::StateChanged {
                collection: self.collection.clone(),
                from,
                to: next,
            });
        }
        Ok(())
    }

    /// Ends the session in `Error` and surfaces `err`.
    pub(crate) fn fail(&self, err: SyncError) {
        error!(collection = %self.collection, error = %err, "replication session failed");
        if let Err(transition) = self.set_state(SessionState::Error) {
            warn!(collection = %self.collection, error = %transition, "failure after session ended");
        }
        let message = err.to_string();
        *self.last_error.write() = Some(err);
        self.status
            .update(&self.collection, false, Some(message.clone()));
        self.events.publish(SessionEvent::Error {
            collection: self.collection.clone(),
            error: message,
        });
    }

    /// Returns true once [`stop`](Self::stop) was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `delay`; returns false if cancelled first.
    pub(crate) async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancelled() => false,
        }
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    /// Returns true while the session's task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the session and waits for its task.
    ///
    /// In-flight store calls finish first. Stopping a session that already
    /// ended is a no-op.
    pub async fn stop(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.send_replace(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(collection = %self.collection, error = %err, "session task ended abnormally");
            }
        }

        if !self.state().is_terminal() {
            if let Err(err) = self.set_state(SessionState::Cancelled) {
                warn!(collection = %self.collection, error = %err, "could not cancel session");
            }
        }
    }
}

impl std::fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("state", &self.state())
            .field("pull_checkpoint", &self.pull_checkpoint())
            .field("push_checkpoint", &self.push_checkpoint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ReplicationSession, tokio::sync::broadcast::Receiver<SessionEvent>, Arc<StatusRegistry>) {
        let events = EventBus::new(16);
        let rx = events.subscribe();
        let status = Arc::new(StatusRegistry::new());
        let session = ReplicationSession::new("orders", SyncOptions::orders(), events, status.clone());
        (session, rx, status)
    }

    #[tokio::test]
    async fn transitions_publish_events() {
        let (session, mut rx, status) = session();
        session.set_state(SessionState::Connecting).unwrap();
        session.set_state(SessionState::Connecting).unwrap();
        session.set_state(SessionState::Active).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::StateChanged {
                collection: "orders".into(),
                from: SessionState::Idle,
                to: SessionState::Connecting,
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::StateChanged { to: SessionState::Active, .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(status.get("orders").is_active);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (session, _rx, _) = session();
        let err = session.set_state(SessionState::Active).unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidStateTransition {
                from: SessionState::Idle,
                to: SessionState::Active,
            }
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn fail_surfaces_error() {
        let (session, _rx, status) = session();
        session.set_state(SessionState::Connecting).unwrap();
        session.fail(SyncError::Unauthorized("bad password".into()));

        assert_eq!(session.state(), SessionState::Error);
        assert!(session.last_error().is_some());
        let entry = status.get("orders");
        assert!(!entry.is_active);
        assert!(entry.last_error.unwrap().contains("bad password"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (session, _rx, _) = session();
        session.set_state(SessionState::Connecting).unwrap();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Cancelled);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.check_cancelled().is_err());
    }

    #[test]
    fn pending_conflicts_carry_over() {
        let (first, _rx, _) = session();
        first.mark_pending("o2");
        first.mark_pending("o1");
        first.set_push_checkpoint(Checkpoint::from(7));

        let (second, _rx2, _) = session();
        second.resume_from(&first);
        assert_eq!(second.pending_conflicts(), vec!["o1".to_string(), "o2".to_string()]);
        assert_eq!(second.push_checkpoint(), Checkpoint::from(7));

        second.clear_pending("o1");
        assert_eq!(second.pending_conflicts(), vec!["o2".to_string()]);
    }
}
