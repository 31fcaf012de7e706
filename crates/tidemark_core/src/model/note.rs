//! Note entity and markdown preview projection.
//!
//! # Responsibility
//! - Define free-form markdown notes with optional deadlines.
//! - Derive `preview_text` / `preview_image` from content on every save.
//!
//! # Invariants
//! - Preview fields are recomputed from `content`, never set by callers.
//! - Notes have no parent.

use crate::model::record::{Draft, RecordId, RecordPatch, RecordStatus, SyncRecord};
use crate::model::tags::normalize_tags;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const PREVIEW_TEXT_MAX_CHARS: usize = 100;

static MARKDOWN_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*]\(([^)]+)\)").expect("valid image regex"));
static MARKDOWN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("valid link regex"));
static MARKDOWN_SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\*_`#>~\-\[\]\(\)!]+"#).expect("valid markdown symbol regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Markdown note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub uuid: RecordId,
    #[serde(default)]
    pub title: String,
    /// Raw markdown source.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub preview_text: Option<String>,
    #[serde(default)]
    pub preview_image: Option<String>,
    /// Optional due date in epoch milliseconds.
    #[serde(default)]
    pub ends_at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Partial note accepted by `save`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub uuid: Option<RecordId>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub ends_at: Option<Option<i64>>,
    pub tags: Option<Vec<String>>,
}

impl RecordPatch for NotePatch {
    fn id(&self) -> Option<RecordId> {
        self.uuid
    }
}

impl SyncRecord for Note {
    type Patch = NotePatch;

    const COLLECTION: &'static str = "notes";

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
        let previous = previous.as_ref();

        let content = patch
            .content
            .or_else(|| previous.map(|note| note.content.clone()))
            .unwrap_or_default();
        let preview = derive_markdown_preview(content.as_str());

        Self {
            uuid: id,
            title: patch
                .title
                .or_else(|| previous.map(|note| note.title.clone()))
                .unwrap_or_default(),
            content,
            preview_text: preview.preview_text,
            preview_image: preview.preview_image,
            ends_at: match patch.ends_at {
                Some(value) => value,
                None => previous.and_then(|note| note.ends_at),
            },
            tags: match patch.tags {
                Some(tags) => normalize_tags(&tags),
                None => previous.map(|note| note.tags.clone()).unwrap_or_default(),
            },
            status: RecordStatus::Active,
            created_at,
            updated_at: Some(updated_at),
        }
    }
}

/// Markdown-derived preview projection for notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownPreview {
    /// Sanitized summary text.
    pub preview_text: Option<String>,
    /// First markdown image path.
    pub preview_image: Option<String>,
}

/// Derives note preview fields from markdown content.
///
/// Rules:
/// - `preview_image`: first markdown image path matched by regex.
/// - `preview_text`: markdown symbols removed, whitespace normalized, first
///   100 chars retained.
pub fn derive_markdown_preview(content: &str) -> MarkdownPreview {
    let preview_image = MARKDOWN_IMAGE_RE
        .captures(content)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|value| !value.is_empty());

    let without_images = MARKDOWN_IMAGE_RE.replace_all(content, " ");
    let without_links = MARKDOWN_LINK_RE.replace_all(&without_images, "$1");
    let without_symbols = MARKDOWN_SYMBOL_RE.replace_all(&without_links, " ");
    let normalized = WHITESPACE_RE.replace_all(&without_symbols, " ");
    let trimmed = normalized.trim();
    let preview_text = if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(PREVIEW_TEXT_MAX_CHARS).collect())
    };

    MarkdownPreview {
        preview_text,
        preview_image,
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_markdown_preview, Note, NotePatch};
    use crate::model::record::{new_record_id, Draft, SyncRecord};

    #[test]
    fn preview_extracts_first_image_path() {
        let preview = derive_markdown_preview("x ![a](one.png) y ![b](two.png)");
        assert_eq!(preview.preview_image.as_deref(), Some("one.png"));
    }

    #[test]
    fn preview_strips_markdown_symbols_and_limits_length() {
        let source = "# groceries\n\n- [shop](https://example.com)\n**milk** `eggs`";
        let preview = derive_markdown_preview(source);
        let text = preview.preview_text.expect("preview_text should exist");
        assert!(!text.contains('#'));
        assert!(!text.contains('*'));
        assert!(text.starts_with("groceries"));
        assert!(text.chars().count() <= 100);
    }

    #[test]
    fn compose_recomputes_preview_from_previous_content() {
        let id = new_record_id();
        let first = Note::compose(Draft {
            id,
            parent_id: None,
            previous: None,
            patch: NotePatch {
                title: Some("Trip".to_string()),
                content: Some("![map](map.png) pack **boots**".to_string()),
                ..NotePatch::default()
            },
            constrained_value: None,
            created_at: 3,
            updated_at: 3,
        });
        assert_eq!(first.preview_image.as_deref(), Some("map.png"));

        let retitled = Note::compose(Draft {
            id,
            parent_id: None,
            previous: Some(first.clone()),
            patch: NotePatch {
                title: Some("Trip 2".to_string()),
                ..NotePatch::default()
            },
            constrained_value: None,
            created_at: 3,
            updated_at: 9,
        });
        assert_eq!(retitled.title, "Trip 2");
        assert_eq!(retitled.content, first.content);
        assert_eq!(retitled.preview_image.as_deref(), Some("map.png"));
        assert_eq!(retitled.updated_at, Some(9));
    }
}
