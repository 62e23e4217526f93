//! Synchronization engine: merge, conflict detection, save pipeline,
//! durable queue, lazy loading

pub mod conflict;
pub mod flush;
pub mod loader;
pub mod locks;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod queue;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::remote::RemoteError;
use crate::store::{DocumentKind, StoreError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fixed folder name for chapter subfolders
pub const CHAPTERS_FOLDER_NAME: &str = "Chapters";

/// Category folder name for a reference kind
pub fn category_folder_name(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Chapter => CHAPTERS_FOLDER_NAME,
        DocumentKind::PersonRef => "People",
        DocumentKind::PlaceRef => "Places",
        DocumentKind::ThingRef => "Things",
    }
}

/// Resolved remote folder ids for the loaded story
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    pub story_folder_id: String,
    pub chapters_folder_id: Option<String>,
    pub reference_folder_ids: Vec<(DocumentKind, String)>,
}

impl RemoteLayout {
    pub fn new(story_folder_id: String) -> Self {
        Self {
            story_folder_id,
            chapters_folder_id: None,
            reference_folder_ids: Vec::new(),
        }
    }

    pub fn folder_for_kind(&self, kind: DocumentKind) -> Option<&str> {
        if kind.is_chapter() {
            return self.chapters_folder_id.as_deref();
        }
        self.reference_folder_ids
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
    }
}

/// Layout shared between the pipeline, flusher, and engine; None until a
/// story has been loaded
pub type SharedLayout = Arc<Mutex<Option<RemoteLayout>>>;
