//! Remote store contract and document codec.
//!
//! # Responsibility
//! - Define the per-user remote collection the engine pulls from and
//!   pushes to.
//! - Convert records to and from remote JSON documents.
//!
//! # Invariants
//! - `upsert` is idempotent: the last write at an id wins.
//! - The owner field is added on encode and ignored on decode.

use crate::model::record::{RecordId, SyncRecord};
use crate::sync::env::Subscription;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Field-level remote document.
pub type Document = Map<String, Value>;

/// Remote collection contents keyed by record id.
pub type RemoteSnapshot = BTreeMap<RecordId, Document>;

/// Callback invoked after the remote collection changed.
pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Scopes remote reads and subscriptions to one user's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerFilter<'a> {
    /// Document field holding the owner id.
    pub field: &'a str,
    pub owner: &'a str,
}

impl OwnerFilter<'_> {
    pub fn matches(&self, document: &Document) -> bool {
        document.get(self.field).and_then(Value::as_str) == Some(self.owner)
    }
}

/// Remote operation failure. Never surfaced to mutation callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failed or the backend is unreachable.
    Network(String),
    /// Backend rejected the caller.
    Permission(String),
    /// A document could not be encoded or decoded.
    InvalidDocument { id: RecordId, message: String },
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(message) => write!(f, "remote unavailable: {message}"),
            Self::Permission(message) => write!(f, "remote permission denied: {message}"),
            Self::InvalidDocument { id, message } => {
                write!(f, "invalid remote document {id}: {message}")
            }
        }
    }
}

impl Error for RemoteError {}

/// Authoritative remote collection store.
pub trait RemoteStore: Send + Sync {
    /// Fetches every document of `collection` owned by `filter.owner`.
    fn query(&self, collection: &str, filter: OwnerFilter<'_>) -> Result<RemoteSnapshot, RemoteError>;

    /// Writes `document` at `id`, replacing whatever was there.
    fn upsert(&self, collection: &str, id: RecordId, document: Document) -> Result<(), RemoteError>;

    /// Calls `listener` whenever a document owned by `filter.owner` changes.
    fn subscribe(
        &self,
        collection: &str,
        filter: OwnerFilter<'_>,
        listener: ChangeListener,
    ) -> Result<Subscription, RemoteError>;
}

/// Serializes `record` and stamps the owner field.
pub fn encode_document<R: SyncRecord>(
    record: &R,
    filter: OwnerFilter<'_>,
) -> Result<Document, RemoteError> {
    let mut document = record_fields(record).map_err(|message| RemoteError::InvalidDocument {
        id: record.id(),
        message,
    })?;
    document.insert(filter.field.to_string(), Value::String(filter.owner.to_string()));
    Ok(document)
}

/// Decodes the document stored at `id`.
///
/// # Errors
/// - `InvalidDocument` when the fields do not form an `R` or the decoded
///   record carries a different id.
pub fn decode_document<R: SyncRecord>(
    id: RecordId,
    document: &Document,
    owner_field: &str,
) -> Result<R, RemoteError> {
    let mut fields = document.clone();
    fields.remove(owner_field);
    from_fields(id, fields)
}

/// Shallow merge: every remote field replaces the local one, fields the
/// remote document lacks keep their local value.
pub fn overlay_document<R: SyncRecord>(
    local: &R,
    remote: &Document,
    owner_field: &str,
) -> Result<R, RemoteError> {
    let id = local.id();
    let mut fields = record_fields(local)
        .map_err(|message| RemoteError::InvalidDocument { id, message })?;
    for (key, value) in remote {
        if key != owner_field {
            fields.insert(key.clone(), value.clone());
        }
    }
    from_fields(id, fields)
}

fn record_fields<R: SyncRecord>(record: &R) -> Result<Document, String> {
    match serde_json::to_value(record).map_err(|err| err.to_string())? {
        Value::Object(fields) => Ok(fields),
        other => Err(format!("record serialized to non-object json: {other}")),
    }
}

fn from_fields<R: SyncRecord>(id: RecordId, fields: Document) -> Result<R, RemoteError> {
    let record: R = serde_json::from_value(Value::Object(fields)).map_err(|err| {
        RemoteError::InvalidDocument {
            id,
            message: err.to_string(),
        }
    })?;
    if record.id() != id {
        return Err(RemoteError::InvalidDocument {
            id,
            message: format!("document carries id {}", record.id()),
        });
    }
    Ok(record)
}
