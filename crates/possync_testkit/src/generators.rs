//! Property-based test generators using proptest.
//!
//! Provides strategies for generating documents and revisions that
//! satisfy store invariants (valid ids, non-zero generations).

use possync_protocol::{Document, Payload, Revision};
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for generating valid document ids.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating revisions.
pub fn revision_strategy() -> impl Strategy<Value = Revision> {
    (
        1u64..20,
        prop::string::string_regex("[0-9a-f]{8}").expect("Invalid regex"),
    )
        .prop_map(|(generation, digest)| Revision::new(generation, digest))
}

/// Strategy for generating flat JSON payloads.
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            prop::string::string_regex("[a-zA-Z ]{0,16}")
                .expect("Invalid regex")
                .prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ],
        0..6,
    )
    .prop_map(|map| map.into_iter().collect())
}

/// Strategy for generating conflicting leaves of one document.
///
/// Every leaf carries a distinct revision; none is deleted.
pub fn conflicting_leaves_strategy(id: &'static str) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::btree_map(revision_strategy(), payload_strategy(), 2..5).prop_map(
        move |leaves| {
            leaves
                .into_iter()
                .map(|(rev, payload)| Document::new(id, payload).with_revision(rev))
                .collect()
        },
    )
}

/// Strategy for generating an order status.
pub fn order_status_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("OPEN"),
        Just("PENDING"),
        Just("COMPLETED"),
        Just("CANCELLED"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn leaves_have_distinct_revisions(leaves in conflicting_leaves_strategy("p1")) {
            let mut revs: Vec<_> = leaves.iter().map(|d| d.revision.clone()).collect();
            revs.dedup();
            prop_assert_eq!(revs.len(), leaves.len());
        }

        #[test]
        fn ids_are_accepted_by_stores(id in doc_id_strategy()) {
            prop_assert!(!id.is_empty());
            prop_assert!(!id.starts_with('_'));
        }
    }
}
