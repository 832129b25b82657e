//! Change filters: which documents replicate, and in what shape.

use parking_lot::RwLock;
use possync_protocol::{Document, Flow};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Decides which documents cross between stores and how they are shaped.
///
/// # Invariants
///
/// - Every method is pure; the same input always gives the same output
/// - `transform` never changes the id or revision
pub trait ChangeFilter: Send + Sync {
    /// Returns true if `doc` should be replicated in `flow`.
    fn should_replicate(&self, flow: Flow, doc: &Document) -> bool;

    /// Reshapes `doc` before it is written to the destination.
    ///
    /// `current` is the destination's winner for the same id, when
    /// [`reads_destination`](Self::reads_destination) asked for it.
    fn transform(&self, flow: Flow, doc: Document, current: Option<&Document>) -> Document;

    /// Returns true if `transform` needs the destination's winner in `flow`.
    fn reads_destination(&self, _flow: Flow) -> bool {
        false
    }
}

/// Predicate over a document.
pub type DocPredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Which documents a [`CollectionFilter`] lets through.
#[derive(Clone, Default)]
pub enum Predicate {
    /// Everything.
    #[default]
    All,
    /// Documents whose string field is one of `values`.
    FieldIn {
        /// Field name.
        field: String,
        /// Accepted values.
        values: Vec<String>,
    },
    /// Arbitrary predicate.
    Custom(DocPredicate),
}

impl Predicate {
    /// Creates a field-membership predicate.
    pub fn field_in<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::FieldIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluates the predicate.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::All => true,
            Predicate::FieldIn { field, values } => doc
                .str_field(field)
                .is_some_and(|value| values.iter().any(|v| v == value)),
            Predicate::Custom(f) => f(doc),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("All"),
            Predicate::FieldIn { field, values } => f
                .debug_struct("FieldIn")
                .field("field", field)
                .field("values", values)
                .finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Declarative per-collection filter.
#[derive(Debug, Clone, Default)]
pub struct CollectionFilter {
    push: Predicate,
    pull: Predicate,
    pinned_on_push: Vec<String>,
    pinned_on_pull: Vec<String>,
}

impl CollectionFilter {
    /// A filter that passes everything unchanged.
    pub fn pass_through() -> Self {
        Self::default()
    }

    /// Orders: only terminal orders leave the terminal; everything is pulled.
    pub fn terminal_orders() -> Self {
        Self::pass_through().with_push(Predicate::field_in("status", ["COMPLETED", "CANCELLED"]))
    }

    /// Products: local stock never leaves the terminal, and pushes keep
    /// whatever stock the remote holds.
    pub fn products() -> Self {
        Self::pass_through().pin_on_push("stock")
    }

    /// Sets the push predicate.
    pub fn with_push(mut self, predicate: Predicate) -> Self {
        self.push = predicate;
        self
    }

    /// Sets the pull predicate.
    pub fn with_pull(mut self, predicate: Predicate) -> Self {
        self.pull = predicate;
        self
    }

    /// Pushed documents carry the remote's value of `field`, or none if the
    /// remote has no live copy.
    pub fn pin_on_push(mut self, field: impl Into<String>) -> Self {
        self.pinned_on_push.push(field.into());
        self
    }

    /// Pulled documents carry the local value of `field`, or none if the
    /// terminal has no live copy.
    pub fn pin_on_pull(mut self, field: impl Into<String>) -> Self {
        self.pinned_on_pull.push(field.into());
        self
    }

    fn pinned(&self, flow: Flow) -> &[String] {
        match flow {
            Flow::Push => &self.pinned_on_push,
            Flow::Pull => &self.pinned_on_pull,
        }
    }
}

impl ChangeFilter for CollectionFilter {
    fn should_replicate(&self, flow: Flow, doc: &Document) -> bool {
        match flow {
            Flow::Push => self.push.matches(doc),
            Flow::Pull => self.pull.matches(doc),
        }
    }

    fn transform(&self, flow: Flow, mut doc: Document, current: Option<&Document>) -> Document {
        if doc.deleted {
            return doc;
        }
        let current = current.filter(|c| !c.deleted);
        for field in self.pinned(flow) {
            match current.and_then(|c| c.field(field)) {
                Some(value) => doc.set_field(field.clone(), value.clone()),
                None => {
                    doc.remove_field(field);
                }
            }
        }
        doc
    }

    fn reads_destination(&self, flow: Flow) -> bool {
        !self.pinned(flow).is_empty()
    }
}

/// Filters keyed by collection; unknown collections pass everything.
#[derive(Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, Arc<dyn ChangeFilter>>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the filter for `collection`.
    pub fn register(&self, collection: &str, filter: Arc<dyn ChangeFilter>) {
        self.filters.write().insert(collection.to_string(), filter);
    }

    /// Returns the filter for `collection`.
    pub fn get(&self, collection: &str) -> Arc<dyn ChangeFilter> {
        self.filters
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_else(|| Arc::new(CollectionFilter::pass_through()))
    }

    /// Applies the collection's predicate.
    pub fn should_replicate(&self, collection: &str, flow: Flow, doc: &Document) -> bool {
        self.get(collection).should_replicate(flow, doc)
    }

    /// Applies the collection's transform.
    pub fn transform(
        &self,
        collection: &str,
        flow: Flow,
        doc: Document,
        current: Option<&Document>,
    ) -> Document {
        self.get(collection).transform(flow, doc, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_protocol::Revision;
    use serde_json::json;

    fn order(status: &str) -> Document {
        Document::from_value("o1", json!({"status": status, "total": 12}))
    }

    #[test]
    fn orders_push_only_terminal() {
        let filter = CollectionFilter::terminal_orders();
        assert!(filter.should_replicate(Flow::Push, &order("COMPLETED")));
        assert!(filter.should_replicate(Flow::Push, &order("CANCELLED")));
        assert!(!filter.should_replicate(Flow::Push, &order("OPEN")));
        assert!(filter.should_replicate(Flow::Pull, &order("OPEN")));

        let tombstone = Document::tombstone("o1", Revision::new(2, "aaa"));
        assert!(!filter.should_replicate(Flow::Push, &tombstone));
    }

    #[test]
    fn products_push_keeps_remote_stock() {
        let filter = CollectionFilter::products();
        assert!(filter.reads_destination(Flow::Push));
        assert!(!filter.reads_destination(Flow::Pull));

        let doc = Document::from_value("p1", json!({"name": "Aspirin 500mg", "stock": 10}))
            .with_revision(Revision::new(3, "abc"));
        let remote = Document::from_value("p1", json!({"name": "Aspirin", "stock": 12}))
            .with_revision(Revision::new(2, "def"));

        let pushed = filter.transform(Flow::Push, doc.clone(), Some(&remote));
        assert_eq!(pushed.i64_field("stock"), Some(12));
        assert_eq!(pushed.str_field("name"), Some("Aspirin 500mg"));
        assert_eq!(pushed.revision, doc.revision);

        // A product the remote never had carries no stock at all.
        let new_product = filter.transform(Flow::Push, doc.clone(), None);
        assert!(new_product.field("stock").is_none());

        let pulled = filter.transform(Flow::Pull, doc, Some(&remote));
        assert_eq!(pulled.i64_field("stock"), Some(10));
    }

    #[test]
    fn pinned_fields_leave_tombstones_alone() {
        let filter = CollectionFilter::products();
        let tombstone = Document::tombstone("p1", Revision::new(4, "abc"));
        let remote = Document::from_value("p1", json!({"stock": 12}));

        let pushed = filter.transform(Flow::Push, tombstone, Some(&remote));
        assert!(pushed.deleted);
        assert!(pushed.payload.is_empty());
    }

    #[test]
    fn custom_predicate() {
        let filter = CollectionFilter::pass_through()
            .with_pull(Predicate::Custom(Arc::new(|doc| doc.i64_field("total") > Some(10))));
        assert!(filter.should_replicate(Flow::Pull, &order("OPEN")));
    }

    #[test]
    fn registry_defaults_to_pass_through() {
        let registry = FilterRegistry::new();
        registry.register("orders", Arc::new(CollectionFilter::terminal_orders()));

        assert!(!registry.should_replicate("orders", Flow::Push, &order("OPEN")));
        assert!(registry.should_replicate("customers", Flow::Push, &order("OPEN")));
    }
}
