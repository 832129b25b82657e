//! Per-batch replication accounting.

use serde::{Deserialize, Serialize};

/// Counters reported for one or more replicated batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Documents read from the source.
    pub docs_read: u64,
    /// Documents newly written to the destination.
    pub docs_written: u64,
    /// Documents the destination rejected.
    pub doc_write_failures: u64,
    /// Per-document failure messages.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchResult {
    /// Records a rejected document.
    pub fn record_failure(&mut self, id: &str, reason: impl std::fmt::Display) {
        self.doc_write_failures += 1;
        self.errors.push(format!("{id}: {reason}"));
    }

    /// Adds the counters of `other` to this result.
    pub fn absorb(&mut self, other: BatchResult) {
        self.docs_read += other.docs_read;
        self.docs_written += other.docs_written;
        self.doc_write_failures += other.doc_write_failures;
        self.errors.extend(other.errors);
    }

    /// A batch is ok unless every attempted write was rejected.
    pub fn ok(&self) -> bool {
        self.doc_write_failures == 0 || self.docs_written > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_stays_ok() {
        let mut result = BatchResult {
            docs_read: 3,
            docs_written: 2,
            ..Default::default()
        };
        result.record_failure("o3", "missing total");
        assert!(result.ok());
        assert_eq!(result.errors, vec!["o3: missing total".to_string()]);
    }

    #[test]
    fn total_failure_is_not_ok() {
        let mut result = BatchResult::default();
        result.record_failure("o1", "bad");
        assert!(!result.ok());
    }

    #[test]
    fn absorb_sums() {
        let mut a = BatchResult {
            docs_read: 1,
            docs_written: 1,
            ..Default::default()
        };
        a.absorb(BatchResult {
            docs_read: 2,
            docs_written: 0,
            doc_write_failures: 1,
            errors: vec!["x".into()],
        });
        assert_eq!(a.docs_read, 3);
        assert_eq!(a.docs_written, 1);
        assert_eq!(a.doc_write_failures, 1);
    }
}
