//! Task board and task entities.
//!
//! # Responsibility
//! - Define task boards, which own the completion-status vocabulary.
//! - Define tasks, which live on exactly one board.
//!
//! # Invariants
//! - `Task::completion_status` is always a member of the owning board's
//!   `status_types` at the time of the last save.
//! - Board status types are trimmed, non-empty and unique, in the order the
//!   user configured them.

use crate::model::record::{
    Draft, ParentRecord, RecordId, RecordPatch, RecordStatus, SyncRecord,
};
use crate::model::tags::normalize_tags;
use serde::{Deserialize, Serialize};

/// Status vocabulary assigned to boards created without one.
pub const DEFAULT_STATUS_TYPES: &[&str] = &["todo", "in_progress", "done"];

/// A named group of tasks with its own completion-status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBoard {
    pub uuid: RecordId,
    #[serde(default)]
    pub name: String,
    /// Allowed `Task::completion_status` values; the first one is the default.
    #[serde(default)]
    pub status_types: Vec<String>,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Partial board accepted by `save`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskBoardPatch {
    pub uuid: Option<RecordId>,
    pub name: Option<String>,
    pub status_types: Option<Vec<String>>,
}

impl RecordPatch for TaskBoardPatch {
    fn id(&self) -> Option<RecordId> {
        self.uuid
    }
}

impl SyncRecord for TaskBoard {
    type Patch = TaskBoardPatch;

    const COLLECTION: &'static str = "task_boards";

    fn id(&self) -> RecordId {
        self.uuid
    }

    fn status(&self) -> RecordStatus {
        self.status
    }

    fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn updated_at(&self) -> Option<i64> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at_ms: i64) {
        self.updated_at = Some(at_ms);
    }

    fn compose(draft: Draft<Self>) -> Self {
        let Draft {
            id,
            previous,
            patch,
            created_at,
            updated_at,
            ..
        } = draft;

        let name = patch
            .name
            .or_else(|| previous.as_ref().map(|board| board.name.clone()))
            .unwrap_or_default();
        let status_types = match (patch.status_types, previous) {
            (Some(values), _) => normalize_status_types(&values),
            (None, Some(board)) => board.status_types,
            (None, None) => DEFAULT_STATUS_TYPES
                .iter()
                .map(|value| value.to_string())
                .collect(),
        };

        Self {
            uuid: id,
            name,
            status_types,
            status: RecordStatus::Active,
            created_at,
            updated_at: Some(updated_at),
        }
    }
}

impl ParentRecord for TaskBoard {
    fn allowed_values(&self) -> &[String] {
        &self.status_types
    }
}

/// Trims, drops blanks and deduplicates while keeping first occurrence order.
pub fn normalize_status_types(values: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() || normalized.iter().any(|seen| seen == trimmed) {
            continue;
        }
        normalized.push(trimmed.to_string());
    }
    normalized
}

/// An actionable item living on one task board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub uuid: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_board_uuid: RecordId,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
    /// Optional deadline in epoch milliseconds.
    #[serde(default)]
    pub ends_at: Option<i64>,
    #[serde(default)]
    pub completion_status: String,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial task accepted by `save`.
///
/// `ends_at: Some(None)` clears the deadline; `None` keeps the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub uuid: Option<RecordId>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub ends_at: Option<Option<i64>>,
    pub completion_status: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl RecordPatch for TaskPatch {
    fn id(&self) -> Option<RecordId> {
        self.uuid
    }

    fn constrained_value(&self) -> Option<&str> {
        self.completion_status.as_deref()
    }
}

impl SyncRecord for Task {
    type Patch = TaskPatch;

    const COLLECTION: &'static str = "tasks";
    const REQUIRES_PARENT: bool = true;
    const CONSTRAINED_BY_PARENT: bool = true;

    fn id(&self) -> RecordId {
        self.uuid
    }

    fn status(&self) -> RecordStatus {
        self.status
    }

    fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn updated_at(&self) -> Option<i64> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at_ms: i64) {
        self.updated_at = Some(at_ms);
    }

    fn parent_id(&self) -> Option<RecordId> {
        Some(self.task_board_uuid)
    }

    fn constrained_value(&self) -> Option<&str> {
        Some(self.completion_status.as_str())
    }

    fn compose(draft: Draft<Self>) -> Self {
        let Draft {
            id,
            parent_id,
            previous,
            patch,
            constrained_value,
            created_at,
            updated_at,
        } = draft;
        let previous = previous.as_ref();

        let tags = match patch.tags {
            Some(tags) => normalize_tags(&tags),
            None => previous.map(|task| task.tags.clone()).unwrap_or_default(),
        };

        Self {
            uuid: id,
            name: patch
                .name
                .or_else(|| previous.map(|task| task.name.clone()))
                .unwrap_or_default(),
            description: patch
                .description
                .or_else(|| previous.map(|task| task.description.clone()))
                .unwrap_or_default(),
            task_board_uuid: parent_id
                .or_else(|| previous.map(|task| task.task_board_uuid))
                .unwrap_or_default(),
            created_at,
            updated_at: Some(updated_at),
            ends_at: match patch.ends_at {
                Some(value) => value,
                None => previous.and_then(|task| task.ends_at),
            },
            completion_status: constrained_value.unwrap_or_default(),
            status: RecordStatus::Active,
            tags,
        }
    }
}
