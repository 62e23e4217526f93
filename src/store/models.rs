use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of text unit a document is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DocumentKind {
    /// A chapter scene, always lives inside a Group
    Chapter,
    /// Reference entry about a character
    PersonRef,
    /// Reference entry about a location
    PlaceRef,
    /// Reference entry about an object
    ThingRef,
}

impl DocumentKind {
    pub fn is_chapter(&self) -> bool {
        matches!(self, DocumentKind::Chapter)
    }

    /// All reference kinds, in their fixed display order
    pub fn reference_kinds() -> [DocumentKind; 3] {
        [
            DocumentKind::PersonRef,
            DocumentKind::PlaceRef,
            DocumentKind::ThingRef,
        ]
    }
}

/// Embedded review state reported by the remote backend for a file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewArtifacts {
    pub has_comments: bool,
    pub comment_count: u32,
    pub has_tracked_changes: bool,
}

/// A single editable text unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Stable local id (temporary until first successful remote write,
    /// but never reassigned)
    pub id: Uuid,
    pub title: String,
    /// Body text; empty until `content_loaded` is true
    pub body: String,
    pub word_count: usize,
    pub char_count: usize,
    pub kind: DocumentKind,
    /// Set iff kind == Chapter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    /// Ordering within its container
    pub position: usize,
    /// Remote file id; None until the first successful write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file_id: Option<String>,
    /// Remote modified-time as last observed (conflict detection baseline)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_remote_modified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub content_loaded: bool,
    /// Cached review state from the last backend check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewArtifacts>,
}

impl Document {
    pub fn new(title: String, kind: DocumentKind, group_id: Option<Uuid>) -> Self {
        debug_assert_eq!(kind.is_chapter(), group_id.is_some());
        Self {
            id: Uuid::new_v4(),
            title,
            body: String::new(),
            word_count: 0,
            char_count: 0,
            kind,
            group_id,
            position: 0,
            remote_file_id: None,
            last_known_remote_modified_at: None,
            updated_at: Utc::now(),
            // A locally created document has nothing to fetch
            content_loaded: true,
            review: None,
        }
    }

    /// Replace the body and recompute word/char counts
    pub fn set_body(&mut self, body: String) {
        self.word_count = count_words(&body);
        self.char_count = body.chars().count();
        self.body = body;
        self.updated_at = Utc::now();
    }
}

/// Count words the way the progress meter does: whitespace-separated runs
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// An ordered container of chapter documents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub title: String,
    pub color: String,
    pub position: usize,
    /// Ordered chapter ids; order is significant and preserved verbatim
    pub document_ids: Vec<Uuid>,
    /// Remote subfolder id; None until the folder has been created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_folder_id: Option<String>,
}

impl Group {
    pub fn new(title: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            color: "#8a8a8a".to_string(),
            position: 0,
            document_ids: Vec::new(),
            remote_folder_id: None,
        }
    }
}

/// Per-story settings and ordering (one per loaded story)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_goal: Option<u32>,
    /// Ordered group ids
    pub group_ids: Vec<Uuid>,
    /// Flat ordered document ids across all kinds
    pub document_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_document_id: Option<Uuid>,
    /// Current list filter text, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Project {
    pub fn new(title: String) -> Self {
        Self {
            title,
            word_goal: None,
            group_ids: Vec::new(),
            document_ids: Vec::new(),
            active_document_id: None,
            filter: None,
        }
    }
}

/// Read-only rendering snapshot of the document tree
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryTree {
    pub title: String,
    pub groups: Vec<GroupView>,
    pub references: Vec<DocumentView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_document_id: Option<Uuid>,
    pub total_word_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: Uuid,
    pub title: String,
    pub color: String,
    pub documents: Vec<DocumentView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub id: Uuid,
    pub title: String,
    pub kind: DocumentKind,
    pub word_count: usize,
    pub content_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewArtifacts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_body_recounts() {
        let mut doc = Document::new("Scene 1".into(), DocumentKind::Chapter, Some(Uuid::new_v4()));
        doc.set_body("the quick  brown fox".into());
        assert_eq!(doc.word_count, 4);
        assert_eq!(doc.char_count, 20);
    }

    #[test]
    fn test_empty_body_counts_zero() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("   \n\t "), 0);
    }
}
