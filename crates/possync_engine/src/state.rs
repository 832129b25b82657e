//! Replication session state machine.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current state of a replication session.
///
/// ```text
/// Idle -> Connecting -> Active <-> Paused
///              |           \        /
///              +--> Paused  Connecting (retry wait)
///
/// any -> Error          (denied, retries exhausted)
/// any non-terminal -> Cancelled   (stop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, not started.
    Idle,
    /// Reaching the stores, or waiting to retry after a transient failure.
    Connecting,
    /// Transferring documents.
    Active,
    /// Caught up; waiting for new changes.
    Paused,
    /// Stopped by a terminal failure.
    Error,
    /// Stopped on request.
    Cancelled,
}

impl SessionState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Cancelled)
    }

    /// Returns true if the session is working rather than waiting.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Error) | (_, Cancelled) => true,
            (Idle, Connecting) => true,
            (Connecting, Active) | (Connecting, Paused) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Connecting) | (Paused, Connecting) => true,
            _ => false,
        }
    }

    /// Validates a transition to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] for illegal moves.
    pub fn transition(self, next: SessionState) -> SyncResult<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SyncError::InvalidStateTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn state_checks() {
        assert!(Error.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Paused.is_terminal());

        assert!(Connecting.is_active());
        assert!(Active.is_active());
        assert!(!Paused.is_active());
    }

    #[test]
    fn legal_transitions() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Paused));
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Connecting));
        assert!(Idle.can_transition_to(Error));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Idle.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Paused));
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Cancelled.can_transition_to(Error));

        let err = Cancelled.transition(Active).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    }
}
