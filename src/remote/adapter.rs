use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ReviewArtifacts;

/// Errors at the storage-backend boundary.
///
/// Every call site classifies: `NotFound` means the remote object is gone
/// (clear the cached id and re-create), `Transient` means retry later via
/// the sync queue, the rest are surfaced as log lines and degraded behavior.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Transient backend error: {0}")]
    Transient(String),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Invalid backend response: {0}")]
    Invalid(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Mime type the backend reports for folders
pub const FOLDER_MIME: &str = "application/vnd.storage.folder";

/// One entry from a folder listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_at: DateTime<Utc>,
    pub trashed: bool,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

/// File contents plus the modified-time observed at read
#[derive(Debug, Clone)]
pub struct RemoteContent {
    pub content: String,
    pub modified_at: DateTime<Utc>,
}

/// Lightweight attributes fetched without downloading content
#[derive(Debug, Clone)]
pub struct RemoteAttributes {
    pub modified_at: DateTime<Utc>,
    pub trashed: bool,
}

/// Boundary interface to the cloud file-storage backend.
///
/// All calls are async and may fail with a distinguishable `NotFound`
/// (triggers re-create-as-new) versus other errors (retry/queue).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the direct children of a folder (trashed entries included,
    /// callers filter)
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Read a file's content and its current modified-time
    async fn read(&self, file_id: &str) -> Result<RemoteContent, RemoteError>;

    /// Fetch attributes only (cheaper than `read` for change detection)
    async fn stat(&self, file_id: &str) -> Result<RemoteAttributes, RemoteError>;

    /// Create-or-update: overwrites `existing_file_id` when given, creates a
    /// new file under `parent_folder_id` otherwise. Returns the file id.
    async fn write(
        &self,
        name: &str,
        content: &str,
        existing_file_id: Option<&str>,
        parent_folder_id: &str,
        content_type: &str,
    ) -> Result<String, RemoteError>;

    async fn rename(&self, file_id: &str, new_name: &str) -> Result<(), RemoteError>;

    /// Move a file or folder to the backend trash
    async fn delete(&self, file_id: &str) -> Result<(), RemoteError>;

    /// Create a subfolder, returning its id
    async fn create_folder(
        &self,
        name: &str,
        parent_folder_id: &str,
    ) -> Result<String, RemoteError>;

    /// Probe for embedded review artifacts (comments, tracked changes)
    async fn check_review_artifacts(
        &self,
        file_id: &str,
    ) -> Result<ReviewArtifacts, RemoteError>;
}
