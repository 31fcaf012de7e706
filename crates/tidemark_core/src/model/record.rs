//! Generic synchronized record contract.
//!
//! # Responsibility
//! - Define the identity and lifecycle surface the sync engine relies on.
//! - Let each entity type decide how a save composes its next value.
//!
//! # Invariants
//! - `id` is client generated and never reused for another record.
//! - Deletion flips `status` to `Deleted`; records are never removed.
//! - `created_at` is fixed by the first save of a record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

/// Stable identifier for every synchronized record.
///
/// Kept as a type alias to make semantic intent explicit in signatures.
pub type RecordId = Uuid;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Visible record.
    #[default]
    Active,
    /// Soft-delete tombstone, kept so the deletion can propagate.
    Deleted,
}

impl RecordStatus {
    pub fn is_deleted(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Merges two observed states of the same record; a tombstone on either
    /// side wins.
    pub fn merge(self, other: Self) -> Self {
        if self.is_deleted() || other.is_deleted() {
            Self::Deleted
        } else {
            Self::Active
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }
}

/// Save-time validation failures. A failing save writes nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Record type requires a parent and none was given.
    MissingParent,
    /// Referenced parent does not exist or is tombstoned.
    ParentNotFound(RecordId),
    /// Referenced parent offers no allowed values for the constrained field.
    EmptyConstraintSet(RecordId),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingParent => write!(f, "record requires a parent reference"),
            Self::ParentNotFound(id) => write!(f, "parent not found: {id}"),
            Self::EmptyConstraintSet(id) => {
                write!(f, "parent {id} has no allowed values configured")
            }
        }
    }
}

impl Error for ValidationError {}

/// Partial record accepted by a save.
pub trait RecordPatch: Debug + Clone + Send + 'static {
    /// Explicit identifier; `None` means "create with a fresh id".
    fn id(&self) -> Option<RecordId>;

    /// Requested value for the parent-constrained field, if any.
    fn constrained_value(&self) -> Option<&str> {
        None
    }
}

/// Everything a record type needs to build the value written by a save.
#[derive(Debug, Clone)]
pub struct Draft<R: SyncRecord> {
    pub id: RecordId,
    pub parent_id: Option<RecordId>,
    /// Current local value at `id`, including tombstones.
    pub previous: Option<R>,
    pub patch: R::Patch,
    /// Already resolved against the parent's allowed set.
    pub constrained_value: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Contract implemented by every synchronized entity type.
///
/// Records travel as JSON documents: the serialized form is what gets
/// persisted locally, pushed remotely and shallow-merged on reconcile.
pub trait SyncRecord:
    Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Patch: RecordPatch;

    /// Remote collection name; also the local blob key.
    const COLLECTION: &'static str;
    /// Saves must reference an existing parent.
    const REQUIRES_PARENT: bool = false;
    /// One field must hold a value from the parent's allowed set.
    const CONSTRAINED_BY_PARENT: bool = false;

    fn id(&self) -> RecordId;
    fn status(&self) -> RecordStatus;
    fn set_status(&mut self, status: RecordStatus);
    /// Epoch milliseconds of the first save.
    fn created_at(&self) -> i64;
    /// Epoch milliseconds of the last mutation or merge point.
    fn updated_at(&self) -> Option<i64>;
    fn set_updated_at(&mut self, at_ms: i64);

    fn parent_id(&self) -> Option<RecordId> {
        None
    }

    fn constrained_value(&self) -> Option<&str> {
        None
    }

    /// Builds the record written by a save. Must set `status = Active`.
    fn compose(draft: Draft<Self>) -> Self;

    fn is_active(&self) -> bool {
        self.status() == RecordStatus::Active
    }
}

/// Constraints a parent imposes on records saved under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSpec {
    pub id: RecordId,
    /// Allowed values for the child's constrained field, in preference order.
    pub allowed_values: Vec<String>,
}

/// Resolves parent references at save time.
pub trait ParentLookup: Send + Sync {
    /// Returns the active parent at `id`; tombstoned parents are absent.
    fn parent(&self, id: RecordId) -> Option<ParentSpec>;
}

/// Record type that can act as a parent for another collection.
pub trait ParentRecord: SyncRecord {
    fn allowed_values(&self) -> &[String];
}

/// Picks the constrained value for a save.
///
/// Order: requested value if allowed, else previous value if still allowed,
/// else the first allowed value. Returns `None` only for an empty set.
pub fn resolve_constrained_value(
    requested: Option<&str>,
    previous: Option<&str>,
    allowed: &[String],
) -> Option<String> {
    let is_allowed = |value: &&str| allowed.iter().any(|candidate| candidate.as_str() == *value);
    requested
        .filter(is_allowed)
        .or_else(|| previous.filter(is_allowed))
        .map(str::to_string)
        .or_else(|| allowed.first().cloned())
}

/// Generates a fresh record identifier.
pub fn new_record_id() -> RecordId {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::{resolve_constrained_value, RecordStatus};

    fn allowed() -> Vec<String> {
        vec!["todo".to_string(), "done".to_string()]
    }

    #[test]
    fn requested_value_wins_when_allowed() {
        let value = resolve_constrained_value(Some("done"), Some("todo"), &allowed());
        assert_eq!(value.as_deref(), Some("done"));
    }

    #[test]
    fn unknown_value_falls_back_to_previous_then_first() {
        let value = resolve_constrained_value(Some("archived"), Some("done"), &allowed());
        assert_eq!(value.as_deref(), Some("done"));

        let value = resolve_constrained_value(Some("archived"), None, &allowed());
        assert_eq!(value.as_deref(), Some("todo"));

        let value = resolve_constrained_value(Some("archived"), Some("gone"), &allowed());
        assert_eq!(value.as_deref(), Some("todo"));
    }

    #[test]
    fn empty_set_resolves_to_none() {
        assert!(resolve_constrained_value(Some("todo"), None, &[]).is_none());
    }

    #[test]
    fn tombstone_dominates_status_merge() {
        use RecordStatus::{Active, Deleted};
        assert_eq!(Active.merge(Active), Active);
        assert_eq!(Active.merge(Deleted), Deleted);
        assert_eq!(Deleted.merge(Active), Deleted);
    }
}
