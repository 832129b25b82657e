//! Revision-tracked documents.

use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::{Revision, REVS_LIMIT};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The JSON body of a document, without any store metadata.
pub type Payload = Map<String, Value>;

/// A document as held by a local or remote store.
///
/// `revision` is `None` only for documents that were never written.
/// `history` lists the ancestors of `revision`, newest first, and is what
/// allows a receiving store to tell whether an incoming revision extends
/// one of its leaves or starts a conflicting branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique id within the collection.
    pub id: String,
    /// Current revision.
    pub revision: Option<Revision>,
    /// Deletion marker (tombstone).
    #[serde(default)]
    pub deleted: bool,
    /// Document body.
    #[serde(default)]
    pub payload: Payload,
    /// Ancestor revisions, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Revision>,
}

impl Document {
    /// Creates an unwritten document.
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            revision: None,
            deleted: false,
            payload,
            history: Vec::new(),
        }
    }

    /// Creates an unwritten document from a JSON object.
    ///
    /// Non-object values produce an empty payload.
    pub fn from_value(id: impl Into<String>, value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        Self::new(id, payload)
    }

    /// Creates a tombstone that deletes `revision`.
    pub fn tombstone(id: impl Into<String>, revision: Revision) -> Self {
        Self {
            id: id.into(),
            revision: Some(revision),
            deleted: true,
            payload: Payload::new(),
            history: Vec::new(),
        }
    }

    /// Sets the revision.
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Returns a field of the payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Returns a string field of the payload.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Returns an integer field of the payload.
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(Value::as_i64)
    }

    /// Sets a payload field.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.payload.insert(name.into(), value);
    }

    /// Removes a payload field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.payload.remove(name)
    }

    /// Returns the edit timestamp: `updated_at`, else `created_at`.
    ///
    /// Both RFC 3339 strings and integer epoch milliseconds are accepted.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.field("updated_at")
            .and_then(parse_timestamp)
            .or_else(|| self.field("created_at").and_then(parse_timestamp))
    }

    /// Returns true if both documents carry the same body and deletion state.
    pub fn same_content(&self, other: &Document) -> bool {
        self.deleted == other.deleted && self.payload == other.payload
    }

    /// Returns the current revision followed by its ancestors.
    pub fn lineage(&self) -> impl Iterator<Item = &Revision> {
        self.revision.iter().chain(self.history.iter())
    }

    /// Records `parent` as the newest ancestor and trims to [`REVS_LIMIT`].
    pub fn push_ancestor(&mut self, parent: Revision, parent_history: &[Revision]) {
        let mut history = Vec::with_capacity(parent_history.len() + 1);
        history.push(parent);
        history.extend(parent_history.iter().cloned());
        history.truncate(REVS_LIMIT);
        self.history = history;
    }

    /// Encodes the document in CouchDB wire form.
    ///
    /// Metadata is carried in `_id`, `_rev`, `_deleted` and `_revisions`
    /// next to the payload fields.
    pub fn to_couch_json(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert("_id".into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.revision {
            map.insert("_rev".into(), Value::String(rev.to_string()));
            if !self.history.is_empty() {
                let ids: Vec<&str> = self.lineage().map(Revision::digest).collect();
                map.insert(
                    "_revisions".into(),
                    json!({ "start": rev.generation(), "ids": ids }),
                );
            }
        }
        if self.deleted {
            map.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(map)
    }

    /// Decodes a document from CouchDB wire form.
    pub fn from_couch_json(value: Value) -> ProtocolResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::InvalidDocument("expected object".into()));
        };

        let id = match map.remove("_id") {
            Some(Value::String(id)) => id,
            _ => return Err(ProtocolError::InvalidDocument("missing _id".into())),
        };
        let revision = match map.remove("_rev") {
            Some(Value::String(rev)) => Some(rev.parse::<Revision>()?),
            _ => None,
        };
        let deleted = matches!(map.remove("_deleted"), Some(Value::Bool(true)));

        let mut history = Vec::new();
        if let Some(Value::Object(revisions)) = map.remove("_revisions") {
            let start = revisions.get("start").and_then(Value::as_u64).unwrap_or(0);
            if let Some(Value::Array(ids)) = revisions.get("ids") {
                for (offset, digest) in ids.iter().enumerate().skip(1) {
                    let generation = start.saturating_sub(offset as u64);
                    if generation == 0 {
                        break;
                    }
                    if let Some(digest) = digest.as_str() {
                        history.push(Revision::new(generation, digest));
                    }
                }
            }
        }

        // Remaining underscore fields (_conflicts, _attachments, ...) are store metadata.
        map.retain(|key, _| !key.starts_with('_'));

        Ok(Self {
            id,
            revision,
            deleted,
            payload: map,
            history,
        })
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_prefers_updated_at() {
        let doc = Document::from_value(
            "p1",
            json!({
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-03-01T12:00:00+02:00",
            }),
        );
        let ts = doc.timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn timestamp_accepts_epoch_millis() {
        let doc = Document::from_value("p1", json!({ "created_at": 1_700_000_000_000i64 }));
        assert_eq!(doc.timestamp().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn timestamp_missing() {
        let doc = Document::from_value("p1", json!({ "name": "x" }));
        assert!(doc.timestamp().is_none());
    }

    #[test]
    fn couch_json_roundtrip_keeps_history() {
        let mut doc = Document::from_value("o1", json!({ "status": "COMPLETED" }))
            .with_revision(Revision::new(3, "ccc"));
        doc.history = vec![Revision::new(2, "bbb"), Revision::new(1, "aaa")];

        let wire = doc.to_couch_json();
        assert_eq!(wire["_id"], "o1");
        assert_eq!(wire["_rev"], "3-ccc");
        assert_eq!(wire["_revisions"]["ids"], json!(["ccc", "bbb", "aaa"]));

        let decoded = Document::from_couch_json(wire).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn couch_json_tombstone() {
        let doc = Document::tombstone("o1", Revision::new(4, "ddd"));
        let decoded = Document::from_couch_json(doc.to_couch_json()).unwrap();
        assert!(decoded.deleted);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn couch_json_strips_metadata_fields() {
        let decoded = Document::from_couch_json(json!({
            "_id": "p1",
            "_rev": "1-a",
            "_conflicts": ["1-b"],
            "name": "Aspirin",
        }))
        .unwrap();
        assert_eq!(decoded.payload.len(), 1);
        assert_eq!(decoded.str_field("name"), Some("Aspirin"));
    }

    #[test]
    fn couch_json_requires_id() {
        assert!(Document::from_couch_json(json!({ "name": "x" })).is_err());
        assert!(Document::from_couch_json(json!([1, 2])).is_err());
    }

    #[test]
    fn push_ancestor_trims() {
        let mut doc = Document::from_value("p1", json!({}));
        let long: Vec<Revision> = (1..=(REVS_LIMIT as u64 + 5))
            .rev()
            .map(|g| Revision::new(g, "x"))
            .collect();
        doc.push_ancestor(Revision::new(200, "y"), &long);
        assert_eq!(doc.history.len(), REVS_LIMIT);
        assert_eq!(doc.history[0], Revision::new(200, "y"));
    }
}
