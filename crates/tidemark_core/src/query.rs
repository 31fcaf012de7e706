//! Read-side queries over local collections.
//!
//! All queries read local state only and never include tombstones.

use crate::model::note::Note;
use crate::model::record::{RecordId, SyncRecord};
use crate::model::tags::normalize_tag;
use crate::model::task::Task;
use crate::store::collection::Collection;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Default cap for `relevant_notes`.
pub const DEFAULT_RELEVANT_NOTES_LIMIT: usize = 10;

/// Returns every active record, in id order.
pub fn active<R: SyncRecord>(collection: &Collection<R>) -> Vec<R> {
    collection.list(|record| record.is_active())
}

/// Returns the active tasks of one board, oldest first.
pub fn tasks_for_board(tasks: &Collection<Task>, board_id: RecordId) -> Vec<Task> {
    let mut found = tasks.list(|task| task.is_active() && task.task_board_uuid == board_id);
    found.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.uuid.cmp(&right.uuid))
    });
    found
}

/// Returns active notes that are not past their deadline.
///
/// Notes with a deadline come first, nearest deadline first; the rest follow
/// by most recent `updated_at`. The order is total, so the result does not
/// depend on the order records are listed in. `limit` defaults to
/// `DEFAULT_RELEVANT_NOTES_LIMIT`.
pub fn relevant_notes(notes: &Collection<Note>, now_ms: i64, limit: Option<usize>) -> Vec<Note> {
    let mut found = notes.list(|note| {
        note.is_active() && note.ends_at.map_or(true, |ends_at| ends_at > now_ms)
    });
    found.sort_by(compare_relevance);
    found.truncate(limit.unwrap_or(DEFAULT_RELEVANT_NOTES_LIMIT));
    found
}

/// Case-insensitive substring search over title and content, most recently
/// updated first. Blank input matches every active note.
pub fn search_notes(notes: &Collection<Note>, text: &str) -> Vec<Note> {
    let needle = text.trim().to_lowercase();
    let mut found = notes.list(|note| {
        note.is_active()
            && (needle.is_empty()
                || note.title.to_lowercase().contains(&needle)
                || note.content.to_lowercase().contains(&needle))
    });
    found.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    found
}

/// Active notes and tasks carrying one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedRecords {
    pub notes: Vec<Note>,
    pub tasks: Vec<Task>,
}

impl TaggedRecords {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.tasks.is_empty()
    }
}

/// Returns every distinct tag used by an active note or task, sorted.
///
/// Derived from the records on each call, so tags of deleted records drop
/// out without any cleanup.
pub fn all_tags(notes: &Collection<Note>, tasks: &Collection<Task>) -> Vec<String> {
    let mut tags = BTreeSet::new();
    for note in active(notes) {
        tags.extend(note.tags);
    }
    for task in active(tasks) {
        tags.extend(task.tags);
    }
    tags.into_iter().collect()
}

/// Returns the tags of the active note or task at `id`; empty when neither
/// collection holds an active record there.
pub fn tags_of(notes: &Collection<Note>, tasks: &Collection<Task>, id: RecordId) -> Vec<String> {
    if let Some(note) = notes.get(id).filter(|note| note.is_active()) {
        return note.tags;
    }
    tasks
        .get(id)
        .filter(|task| task.is_active())
        .map(|task| task.tags)
        .unwrap_or_default()
}

/// Returns the active notes and tasks tagged with `tag`, in id order. The
/// tag is normalized the same way saved tags are.
pub fn tagged_with(notes: &Collection<Note>, tasks: &Collection<Task>, tag: &str) -> TaggedRecords {
    let Some(tag) = normalize_tag(tag) else {
        return TaggedRecords::default();
    };
    TaggedRecords {
        notes: notes.list(|note| note.is_active() && note.tags.contains(&tag)),
        tasks: tasks.list(|task| task.is_active() && task.tags.contains(&tag)),
    }
}

fn compare_relevance(left: &Note, right: &Note) -> Ordering {
    match (left.ends_at, right.ends_at) {
        (Some(left_end), Some(right_end)) => left_end.cmp(&right_end),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => right.updated_at.cmp(&left.updated_at),
    }
    .then_with(|| left.uuid.cmp(&right.uuid))
}
