//! CouchDB-compatible remote store.
//!
//! [`HttpStore`] speaks the CouchDB replication endpoints through any
//! [`HttpClient`]; [`crate::ReqwestClient`] is the production client and
//! tests plug in scripted ones.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    BulkMode, ChangesRequest, DocWriteResult, DocumentLeaves, DocumentStore, WriteStatus,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use possync_protocol::{ChangeEvent, ChangesBatch, Checkpoint, Document, Revision};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Extra time given to a long-poll request beyond the server-side timeout.
const LONGPOLL_GRACE: Duration = Duration::from_secs(10);

/// HTTP verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
}

/// A JSON request relative to the server base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Path below the base URL, already percent-encoded.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// Per-request timeout overriding the client default.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    fn new(method: HttpMethod, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A decoded JSON response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body; `Null` when empty or not JSON.
    pub body: Value,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for HTTP client implementations.
///
/// This allows plugging in different HTTP libraries (reqwest, a test
/// double, an in-process router).
///
/// Implementations return `Err` only when no response was received; any
/// status code, including errors, is returned as a response.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> StoreResult<HttpResponse>;
}

/// A [`DocumentStore`] backed by a CouchDB database.
pub struct HttpStore<C: HttpClient> {
    /// Database name, also the first path segment.
    db: String,
    client: C,
    /// Last transport or server error.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpStore<C> {
    /// Creates a store for database `db`.
    pub fn new(db: impl Into<String>, client: C) -> Self {
        Self {
            db: db.into(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn set_error(&self, err: &StoreError) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn db_path(&self, endpoint: &str) -> String {
        format!("{}/{}", encode_segment(&self.db), endpoint)
    }

    fn doc_path(&self, id: &str) -> String {
        self.db_path(&encode_segment(id))
    }

    /// Sends a request and maps non-2xx statuses to errors about `id`.
    async fn call(&self, request: HttpRequest, id: &str) -> StoreResult<Value> {
        let method = request.method;
        let path = request.path.clone();
        let result = match self.client.send(request).await {
            Ok(response) if response.is_success() => Ok(response.body),
            Ok(response) => Err(status_error(response.status, &response.body, id)),
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => self.clear_error(),
            Err(err) if err.is_not_found() || err.is_conflict() => {}
            Err(err) => {
                debug!(db = %self.db, ?method, %path, error = %err, "request failed");
                self.set_error(err);
            }
        }
        result
    }
}

/// Maps an error status to a store error.
fn status_error(status: u16, body: &Value, id: &str) -> StoreError {
    let reason = body
        .get("reason")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("no reason given")
        .to_string();

    match status {
        401 | 403 => StoreError::Unauthorized(reason),
        404 => StoreError::not_found(id),
        409 => StoreError::conflict(id),
        400 | 412 | 415 => StoreError::invalid(id, reason),
        408 | 500..=599 => StoreError::Unavailable(format!("HTTP {status}: {reason}")),
        _ => StoreError::Protocol(format!("unexpected status {status}: {reason}")),
    }
}

/// Percent-encodes one path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn parse_rev(value: &Value, id: &str) -> StoreResult<Revision> {
    value
        .get("rev")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Protocol(format!("response for {id} carries no rev")))?
        .parse()
        .map_err(StoreError::from)
}

fn parse_seq(value: Option<&Value>) -> Checkpoint {
    match value {
        Some(Value::Number(n)) => Checkpoint::new(n.to_string()),
        Some(Value::String(s)) => Checkpoint::new(s.clone()),
        _ => Checkpoint::zero(),
    }
}

/// Returns a copy of `doc` carrying `revision` and no history, for edits.
fn edit_body(doc: &Document, revision: Option<&Revision>) -> Value {
    Document {
        id: doc.id.clone(),
        revision: revision.cloned(),
        deleted: doc.deleted,
        payload: doc.payload.clone(),
        history: Vec::new(),
    }
    .to_couch_json()
}

fn sort_leaves(leaves: &mut [Document]) {
    leaves.sort_by(|a, b| {
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| b.revision.cmp(&a.revision))
    });
}

fn entry_status(entry: &Value, id: &str, fallback: Option<&Revision>) -> WriteStatus {
    if let Some(error) = entry.get("error").and_then(Value::as_str) {
        let reason = entry
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or(error)
            .to_string();
        return match error {
            "conflict" => WriteStatus::Rejected(StoreError::conflict(id)),
            "unauthorized" | "forbidden" => WriteStatus::Rejected(StoreError::Unauthorized(reason)),
            _ => WriteStatus::Rejected(StoreError::invalid(id, reason)),
        };
    }
    match parse_rev(entry, id) {
        Ok(rev) => WriteStatus::Written(rev),
        Err(err) => match fallback {
            Some(rev) => WriteStatus::Written(rev.clone()),
            None => WriteStatus::Rejected(err),
        },
    }
}

#[async_trait]
impl<C: HttpClient> DocumentStore for HttpStore<C> {
    fn name(&self) -> &str {
        &self.db
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        let body = self
            .call(HttpRequest::new(HttpMethod::Get, self.doc_path(id)), id)
            .await?;
        let doc = Document::from_couch_json(body)?;
        if doc.deleted {
            return Err(StoreError::not_found(id));
        }
        Ok(doc)
    }

    async fn put(&self, doc: Document, expected: Option<&Revision>) -> StoreResult<Revision> {
        let request = HttpRequest::new(HttpMethod::Put, self.doc_path(&doc.id))
            .body(edit_body(&doc, expected));
        let body = self.call(request, &doc.id).await?;
        parse_rev(&body, &doc.id)
    }

    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<DocumentLeaves>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let request = HttpRequest::new(HttpMethod::Get, self.doc_path(id))
                .query("open_revs", "all")
                .query("revs", "true");
            let leaves = match self.call(request, id).await {
                Ok(Value::Array(entries)) => {
                    let mut leaves = Vec::with_capacity(entries.len());
                    for entry in entries {
                        if let Some(doc) = entry.get("ok") {
                            leaves.push(Document::from_couch_json(doc.clone())?);
                        }
                    }
                    sort_leaves(&mut leaves);
                    leaves
                }
                Ok(other) => {
                    return Err(StoreError::Protocol(format!(
                        "open_revs for {id} returned {other}"
                    )))
                }
                Err(err) if err.is_not_found() => Vec::new(),
                Err(err) => return Err(err),
            };
            out.push(DocumentLeaves {
                id: id.clone(),
                leaves,
            });
        }
        Ok(out)
    }

    async fn bulk_put(
        &self,
        docs: Vec<Document>,
        mode: BulkMode,
    ) -> StoreResult<Vec<DocWriteResult>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<Value> = docs
            .iter()
            .map(|doc| match mode {
                BulkMode::NewEdits => edit_body(doc, doc.revision.as_ref()),
                BulkMode::Replicate => doc.to_couch_json(),
            })
            .collect();
        let request = HttpRequest::new(HttpMethod::Post, self.db_path("_bulk_docs")).body(json!({
            "docs": bodies,
            "new_edits": mode == BulkMode::NewEdits,
        }));

        let entries = match self.call(request, "_bulk_docs").await? {
            Value::Array(entries) => entries,
            other => {
                return Err(StoreError::Protocol(format!(
                    "_bulk_docs returned {other}"
                )))
            }
        };

        // Replicated writes report only failures, keyed by id.
        if entries.len() != docs.len() {
            let mut by_id: HashMap<String, VecDeque<Value>> = HashMap::new();
            for entry in entries {
                if let Some(id) = entry.get("id").and_then(Value::as_str) {
                    by_id.entry(id.to_string()).or_default().push_back(entry);
                }
            }
            return Ok(docs
                .into_iter()
                .map(|doc| {
                    let status = match by_id.get_mut(&doc.id).and_then(VecDeque::pop_front) {
                        Some(entry) => entry_status(&entry, &doc.id, doc.revision.as_ref()),
                        None if mode == BulkMode::Replicate => match doc.revision {
                            Some(rev) => WriteStatus::Written(rev),
                            None => WriteStatus::Rejected(StoreError::invalid(
                                &doc.id,
                                "replicated document has no revision",
                            )),
                        },
                        None => WriteStatus::Rejected(StoreError::Protocol(format!(
                            "no _bulk_docs result for {}",
                            doc.id
                        ))),
                    };
                    DocWriteResult { id: doc.id, status }
                })
                .collect());
        }

        Ok(docs
            .into_iter()
            .zip(entries)
            .map(|(doc, entry)| {
                let fallback = match mode {
                    BulkMode::Replicate => doc.revision.as_ref(),
                    BulkMode::NewEdits => None,
                };
                let status = entry_status(&entry, &doc.id, fallback);
                if let WriteStatus::Rejected(err) = &status {
                    warn!(db = %self.db, doc_id = %doc.id, error = %err, "document rejected");
                }
                DocWriteResult { id: doc.id, status }
            })
            .collect())
    }

    async fn remove(&self, id: &str, revision: &Revision) -> StoreResult<Revision> {
        let request =
            HttpRequest::new(HttpMethod::Delete, self.doc_path(id)).query("rev", revision);
        let body = self.call(request, id).await?;
        parse_rev(&body, id)
    }

    async fn revs_diff(&self, revs: &[(String, Revision)]) -> StoreResult<Vec<(String, Revision)>> {
        if revs.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = Map::new();
        for (id, rev) in revs {
            let entry = query
                .entry(id.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(Value::String(rev.to_string()));
            }
        }

        let request = HttpRequest::new(HttpMethod::Post, self.db_path("_revs_diff"))
            .body(Value::Object(query));
        let body = self.call(request, "_revs_diff").await?;

        let mut missing: HashSet<(String, String)> = HashSet::new();
        if let Value::Object(map) = body {
            for (id, entry) in map {
                if let Some(Value::Array(list)) = entry.get("missing") {
                    for rev in list.iter().filter_map(Value::as_str) {
                        missing.insert((id.clone(), rev.to_string()));
                    }
                }
            }
        }

        Ok(revs
            .iter()
            .filter(|(id, rev)| missing.contains(&(id.clone(), rev.to_string())))
            .cloned()
            .collect())
    }

    async fn changes(
        &self,
        since: &Checkpoint,
        request: ChangesRequest,
    ) -> StoreResult<ChangesBatch> {
        let mut http = HttpRequest::new(HttpMethod::Get, self.db_path("_changes"))
            .query("since", since)
            .query("limit", request.limit.max(1))
            .query("style", "all_docs");
        if request.live {
            http = http
                .query("feed", "longpoll")
                .query("timeout", request.timeout.as_millis());
            http.timeout = Some(request.timeout + LONGPOLL_GRACE);
        } else {
            http = http.query("feed", "normal");
        }

        let body = self.call(http, "_changes").await?;
        let rows = match body.get("results") {
            Some(Value::Array(rows)) => rows.clone(),
            _ => {
                return Err(StoreError::Protocol(
                    "_changes response has no results".into(),
                ))
            }
        };

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.get("id").and_then(Value::as_str) else {
                continue;
            };
            let mut revs = Vec::new();
            if let Some(Value::Array(changes)) = row.get("changes") {
                for change in changes {
                    revs.push(parse_rev(change, id)?);
                }
            }
            if revs.is_empty() {
                continue;
            }
            let revision = revs.remove(0);
            results.push(ChangeEvent {
                seq: parse_seq(row.get("seq")),
                id: id.to_string(),
                revision,
                deleted: row.get("deleted").and_then(Value::as_bool).unwrap_or(false),
                conflicts: revs,
            });
        }

        let last_seq = match body.get("last_seq") {
            Some(value) => parse_seq(Some(value)),
            None => since.clone(),
        };
        Ok(ChangesBatch {
            results,
            last_seq,
            pending: body.get("pending").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}
