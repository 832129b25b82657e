//! Replication directions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local to remote only.
    Push,
    /// Remote to local only.
    Pull,
    /// Pull then push, every cycle.
    Bidirectional,
}

impl Direction {
    /// Returns true if sessions in this direction read the remote feed.
    pub fn pulls(&self) -> bool {
        matches!(self, Direction::Pull | Direction::Bidirectional)
    }

    /// Returns true if sessions in this direction write to the remote.
    pub fn pushes(&self) -> bool {
        matches!(self, Direction::Push | Direction::Bidirectional)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

/// Which way a single document is crossing the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// Outbound, local to remote.
    Push,
    /// Inbound, remote to local.
    Pull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_capabilities() {
        assert!(Direction::Push.pushes());
        assert!(!Direction::Push.pulls());
        assert!(Direction::Pull.pulls());
        assert!(Direction::Bidirectional.pulls());
        assert!(Direction::Bidirectional.pushes());
    }

    #[test]
    fn direction_serde() {
        let json = serde_json::to_string(&Direction::Bidirectional).unwrap();
        assert_eq!(json, "\"bidirectional\"");
    }
}
