use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::store::DocumentStore;

use super::SyncError;

/// A divergence between the local body and the remote file, surfaced to the
/// user for resolution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub document_id: Uuid,
    pub local_content: String,
    pub local_modified_at: DateTime<Utc>,
    pub remote_content: String,
    pub remote_modified_at: DateTime<Utc>,
}

/// The user's choice when presented with a [`Conflict`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Local wins: overwrite the remote with the local body
    KeepLocal,
    /// Remote wins: replace the local body with the remote content
    TakeRemote,
    /// Abort the navigation that triggered the check; decide later
    Cancel,
}

/// Checks a document for out-of-band remote edits.
///
/// Cheap stat first, full read only when the remote looks newer. A newer
/// modified-time with identical text (metadata-only touch, trailing
/// whitespace drift) is absorbed silently by advancing the stored baseline.
pub struct ConflictDetector {
    store: Arc<Mutex<DocumentStore>>,
    remote: Arc<dyn RemoteStore>,
}

impl ConflictDetector {
    pub fn new(store: Arc<Mutex<DocumentStore>>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { store, remote }
    }

    /// Returns a conflict when the remote file changed behind our back and
    /// its text differs from the local body. Returns None for documents that
    /// have never been written remotely.
    pub async fn detect(&self, document_id: Uuid) -> Result<Option<Conflict>, SyncError> {
        let (file_id, last_known, local_body, local_modified_at) = {
            let store = self.store.lock().unwrap();
            let doc = store.document(document_id)?;
            let Some(file_id) = doc.remote_file_id.clone() else {
                return Ok(None);
            };
            (
                file_id,
                doc.last_known_remote_modified_at,
                doc.body.clone(),
                doc.updated_at,
            )
        };

        let attrs = match self.remote.stat(&file_id).await {
            Ok(attrs) => attrs,
            Err(e) if e.is_not_found() => {
                // Gone remotely; the save path recreates it, nothing to diff
                log::debug!("Conflict: remote file for {} is gone", document_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(last_known) = last_known else {
            // First observation of this file's remote time: record it as the
            // baseline rather than flagging pre-existing history
            let mut store = self.store.lock().unwrap();
            store.set_last_known_remote_modified(document_id, attrs.modified_at)?;
            return Ok(None);
        };

        if attrs.modified_at <= last_known {
            return Ok(None);
        }

        let remote = self.remote.read(&file_id).await?;
        if remote.content.trim() == local_body.trim() {
            // Same text, newer timestamp: absorb the touch
            let mut store = self.store.lock().unwrap();
            store.set_last_known_remote_modified(document_id, remote.modified_at)?;
            return Ok(None);
        }

        log::info!(
            "Conflict: {} changed remotely at {} (baseline {})",
            document_id,
            attrs.modified_at,
            last_known,
        );
        Ok(Some(Conflict {
            document_id,
            local_content: local_body,
            local_modified_at,
            remote_content: remote.content,
            remote_modified_at: remote.modified_at,
        }))
    }
}
