//! Declarative field-level merging.
//!
//! A [`FieldMergePolicy`] names which side each field is taken from when two
//! revisions of a document conflict. Fields without a rule follow the
//! policy's default side.

use possync_protocol::{Document, Payload};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Combines the local and remote values of one field; `None` drops it.
pub type FieldMergeFn =
    Arc<dyn Fn(Option<&Value>, Option<&Value>) -> Option<Value> + Send + Sync>;

/// Side a value is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local revision.
    Local,
    /// The remote revision.
    Remote,
}

/// Rule for one field.
#[derive(Clone)]
pub enum FieldRule {
    /// Keep the local value.
    Local,
    /// Take the remote value.
    Remote,
    /// Compute the value.
    Custom(FieldMergeFn),
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRule::Local => f.write_str("Local"),
            FieldRule::Remote => f.write_str("Remote"),
            FieldRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-field merge descriptor.
#[derive(Debug, Clone)]
pub struct FieldMergePolicy {
    default: Side,
    fields: BTreeMap<String, FieldRule>,
}

impl FieldMergePolicy {
    /// Every field from the remote side.
    pub fn remote_wins() -> Self {
        Self {
            default: Side::Remote,
            fields: BTreeMap::new(),
        }
    }

    /// Every field from the local side.
    pub fn local_wins() -> Self {
        Self {
            default: Side::Local,
            fields: BTreeMap::new(),
        }
    }

    /// Remote wins for every field except `fields`, which stay local.
    pub fn remote_wins_except<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        fields
            .into_iter()
            .fold(Self::remote_wins(), |policy, field| {
                policy.with_field(field, FieldRule::Local)
            })
    }

    /// Sets the rule for one field.
    pub fn with_field(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(field.into(), rule);
        self
    }

    /// Returns the default side.
    pub fn default_side(&self) -> Side {
        self.default
    }

    /// Returns true if any rule runs caller-supplied code.
    pub fn has_custom_rules(&self) -> bool {
        self.fields
            .values()
            .any(|rule| matches!(rule, FieldRule::Custom(_)))
    }

    /// Merges two payloads.
    pub fn merge(&self, local: &Document, remote: &Document) -> Payload {
        let mut merged = match self.default {
            Side::Local => local.payload.clone(),
            Side::Remote => remote.payload.clone(),
        };
        for (field, rule) in &self.fields {
            let value = match rule {
                FieldRule::Local => local.field(field).cloned(),
                FieldRule::Remote => remote.field(field).cloned(),
                FieldRule::Custom(f) => f(local.field(field), remote.field(field)),
            };
            match value {
                Some(value) => {
                    merged.insert(field.clone(), value);
                }
                None => {
                    merged.remove(field);
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_wins_except_stock() {
        let local = Document::from_value("p1", json!({"name": "Aspirin", "stock": 10}));
        let remote = Document::from_value("p1", json!({"name": "Aspirin 500mg", "stock": 7}));

        let merged = FieldMergePolicy::remote_wins_except(["stock"]).merge(&local, &remote);
        assert_eq!(merged["name"], "Aspirin 500mg");
        assert_eq!(merged["stock"], 10);
    }

    #[test]
    fn missing_local_field_is_dropped() {
        let local = Document::from_value("p1", json!({"name": "Aspirin"}));
        let remote = Document::from_value("p1", json!({"name": "Aspirin", "stock": 7}));

        let merged = FieldMergePolicy::remote_wins_except(["stock"]).merge(&local, &remote);
        assert!(!merged.contains_key("stock"));
    }

    #[test]
    fn custom_field_rule() {
        let max: FieldMergeFn = Arc::new(|l, r| {
            let l = l.and_then(Value::as_i64).unwrap_or(0);
            let r = r.and_then(Value::as_i64).unwrap_or(0);
            Some(Value::from(l.max(r)))
        });
        let policy = FieldMergePolicy::local_wins().with_field("points", FieldRule::Custom(max));
        assert!(policy.has_custom_rules());

        let local = Document::from_value("c1", json!({"name": "Ana", "points": 3}));
        let remote = Document::from_value("c1", json!({"name": "Ana M.", "points": 9}));
        let merged = policy.merge(&local, &remote);
        assert_eq!(merged["name"], "Ana");
        assert_eq!(merged["points"], 9);
    }
}
