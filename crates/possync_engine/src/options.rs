//! Per-collection sync options.

use crate::filter::{ChangeFilter, CollectionFilter};
use crate::purge::RetentionPolicy;
use crate::resolver::ConflictStrategy;
use possync_protocol::Direction;
use std::fmt;
use std::sync::Arc;

/// How one collection is replicated.
#[derive(Clone)]
pub struct SyncOptions {
    /// Replication direction.
    pub direction: Direction,
    /// Keep replicating as changes arrive; otherwise run one cycle.
    pub live: bool,
    /// Conflict strategy for bidirectional sessions.
    pub strategy: ConflictStrategy,
    /// Document filter.
    pub filter: Arc<dyn ChangeFilter>,
    /// What happens to local copies after push acknowledgement.
    pub retention: RetentionPolicy,
}

impl SyncOptions {
    /// Live options for `direction`: remote wins, no filter, keep documents.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            live: true,
            strategy: ConflictStrategy::RemoteWins,
            filter: Arc::new(CollectionFilter::pass_through()),
            retention: RetentionPolicy::Keep,
        }
    }

    /// Orders: push-only, terminal orders only, purged once acknowledged.
    pub fn orders() -> Self {
        Self::new(Direction::Push)
            .with_filter(CollectionFilter::terminal_orders())
            .with_retention(RetentionPolicy::terminal_orders())
    }

    /// Products: bidirectional, remote wins except `stock`, which each side
    /// keeps for itself.
    pub fn products() -> Self {
        Self::new(Direction::Bidirectional)
            .with_strategy(ConflictStrategy::products())
            .with_filter(CollectionFilter::products())
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Sets live mode.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: impl ChangeFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Sets the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(Direction::Bidirectional)
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("direction", &self.direction)
            .field("live", &self.live)
            .field("strategy", &self.strategy)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_protocol::{Document, Flow};
    use serde_json::json;

    #[test]
    fn presets() {
        let orders = SyncOptions::orders();
        assert_eq!(orders.direction, Direction::Push);
        assert!(orders.live);
        let open = Document::from_value("o1", json!({"status": "OPEN"}));
        assert!(!orders.filter.should_replicate(Flow::Push, &open));

        let products = SyncOptions::products();
        assert_eq!(products.direction, Direction::Bidirectional);
        assert_eq!(products.strategy.name(), "fields");
        assert_eq!(products.retention, RetentionPolicy::Keep);
    }
}
