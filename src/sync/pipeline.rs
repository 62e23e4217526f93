use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::store::{DocumentKind, DocumentStore};

use super::locks::{wait_for_group_folder, DocumentLocks, FOLDER_WAIT};
use super::metadata::MetadataWriter;
use super::queue::SyncQueue;
use super::{SharedLayout, SyncError};

/// Inactivity delay before a typing burst is committed and saved
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Content type used for document bodies
const BODY_CONTENT_TYPE: &str = "text/plain";

/// User-visible save status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveState {
    Idle,
    Typing,
    Saving,
    Saved,
}

/// Snapshot for the save-status indicator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
    pub state: SaveState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    /// Queued writes not yet delivered ("unsaved changes" indicator)
    pub pending_sync: usize,
}

/// How a write left the pipeline
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Delivered to the remote
    Written,
    /// Handed to the background sync queue for later delivery
    Queued,
}

struct PipelineInner {
    state: SaveState,
    /// Bumped on every input and on every flush; a debounce timer or an
    /// in-flight save holding an older generation has been superseded
    generation: u64,
    saved_at: Option<DateTime<Utc>>,
    pending_text: Option<String>,
}

/// The per-edit save orchestrator: debounced commit, remote write,
/// queue-on-failure.
///
/// State machine: Idle → Typing → Saving → Saved. A remote failure still
/// lands on Saved from the user's point of view — the in-memory state is
/// authoritative and the queued write will eventually sync.
pub struct SavePipeline {
    store: Arc<Mutex<DocumentStore>>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<Mutex<SyncQueue>>,
    queue_path: PathBuf,
    locks: Arc<DocumentLocks>,
    metadata: Arc<MetadataWriter>,
    layout: SharedLayout,
    inner: Mutex<PipelineInner>,
}

impl SavePipeline {
    pub fn new(
        store: Arc<Mutex<DocumentStore>>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<Mutex<SyncQueue>>,
        queue_path: PathBuf,
        locks: Arc<DocumentLocks>,
        metadata: Arc<MetadataWriter>,
        layout: SharedLayout,
    ) -> Self {
        Self {
            store,
            remote,
            queue,
            queue_path,
            locks,
            metadata,
            layout,
            inner: Mutex::new(PipelineInner {
                state: SaveState::Idle,
                generation: 0,
                saved_at: None,
                pending_text: None,
            }),
        }
    }

    pub fn status(&self) -> SaveStatus {
        let inner = self.inner.lock().unwrap();
        SaveStatus {
            state: inner.state,
            saved_at: inner.saved_at,
            pending_sync: self.queue.lock().unwrap().pending_count(),
        }
    }

    /// Record an input event: hold the text, (re)start the debounce timer
    pub fn note_input(self: &Arc<Self>, text: String) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_text = Some(text);
            inner.state = SaveState::Typing;
            inner.generation += 1;
            inner.generation
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            this.debounce_fired(generation).await;
        });
    }

    /// Commit any pending editor text into the store without waiting for
    /// the debounce, superseding the pending timer. Returns the document the
    /// text went to. Used on navigation so no edit is lost across a switch.
    pub fn flush_pending(&self) -> Option<Uuid> {
        let text = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.state = SaveState::Idle;
            inner.pending_text.take()
        };
        let mut store = self.store.lock().unwrap();
        let active = store.project.active_document_id?;
        if let Some(text) = text {
            if let Err(e) = store.commit_body(active, text) {
                log::error!("Save: flush commit failed: {}", e);
                return None;
            }
        }
        Some(active)
    }

    async fn debounce_fired(&self, generation: u64) {
        let text = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation || inner.state != SaveState::Typing {
                // A newer input or a flush superseded this timer
                return;
            }
            inner.state = SaveState::Saving;
            inner.pending_text.take()
        };

        let active = {
            let store = self.store.lock().unwrap();
            store.project.active_document_id
        };
        let Some(active) = active else {
            self.inner.lock().unwrap().state = SaveState::Idle;
            return;
        };

        if let Some(text) = text {
            let mut store = self.store.lock().unwrap();
            if let Err(e) = store.commit_body(active, text) {
                log::error!("Save: commit failed: {}", e);
            }
        }

        let result = self.write_document(active).await;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation == generation {
                // Only the newest save owns the user-visible state
                inner.state = SaveState::Saved;
                inner.saved_at = Some(Utc::now());
            }
        }

        match result {
            Ok(_) => {
                // Structure/word counts changed; persist the metadata record
                // (batched inside the writer)
                self.metadata.persist().await;
            }
            Err(e) => log::error!("Save: write for {} failed: {}", active, e),
        }
    }

    /// Save a document in the background (used for the document being left
    /// on navigation). Failures are logged, never surfaced — the in-memory
    /// state already has the edit.
    pub async fn save_document(&self, id: Uuid) {
        match self.write_document(id).await {
            Ok(WriteOutcome::Written) => {
                self.metadata.persist().await;
            }
            Ok(WriteOutcome::Queued) => {
                log::info!("Save: background save of {} queued for later delivery", id);
            }
            Err(e) => log::warn!("Save: background save of {} failed: {}", id, e),
        }
    }

    /// Write one document's current body to the remote.
    ///
    /// Serialized per document: if a write for this document is already in
    /// flight the new content is queued rather than raced. Remote failures
    /// are classified — NotFound re-creates once and adopts the new id,
    /// anything else queues the snapshot for the background flusher.
    pub async fn write_document(&self, id: Uuid) -> Result<WriteOutcome, SyncError> {
        let Some(_lock) = self.locks.try_acquire(id) else {
            log::debug!("Save: {} busy, queueing instead of racing", id);
            self.enqueue_snapshot(id, None).await?;
            return Ok(WriteOutcome::Queued);
        };

        let (title, body, remote_file_id, kind, group_id) = {
            let store = self.store.lock().unwrap();
            let doc = store.document(id)?;
            (
                doc.title.clone(),
                doc.body.clone(),
                doc.remote_file_id.clone(),
                doc.kind,
                doc.group_id,
            )
        };
        let name = format!("{}.txt", title);
        let parent = self.resolve_parent(kind, group_id).await;

        match self
            .remote
            .write(&name, &body, remote_file_id.as_deref(), &parent, BODY_CONTENT_TYPE)
            .await
        {
            Ok(file_id) => {
                let mut store = self.store.lock().unwrap();
                store.set_remote_file_id(id, file_id)?;
                Ok(WriteOutcome::Written)
            }
            Err(e) if e.is_not_found() && remote_file_id.is_some() => {
                // The remote object was deleted out-of-band: fall back to
                // create-new and adopt the fresh id
                log::info!("Save: remote file for {} is gone, recreating", id);
                self.store.lock().unwrap().clear_remote_file_id(id)?;
                match self
                    .remote
                    .write(&name, &body, None, &parent, BODY_CONTENT_TYPE)
                    .await
                {
                    Ok(file_id) => {
                        {
                            let mut store = self.store.lock().unwrap();
                            store.set_remote_file_id(id, file_id.clone())?;
                        }
                        // A snapshot queued against the dead id would
                        // recreate a second copy on delivery
                        let updated = self.queue.lock().unwrap().update_remote_file_id(id, &file_id);
                        if updated {
                            if let Err(e) = self.queue.lock().unwrap().save(&self.queue_path) {
                                log::error!("Save: could not persist sync queue: {}", e);
                            }
                        }
                        Ok(WriteOutcome::Written)
                    }
                    Err(e) => {
                        log::warn!("Save: recreate for {} failed: {} — queueing", id, e);
                        self.enqueue_snapshot(id, Some(parent)).await?;
                        Ok(WriteOutcome::Queued)
                    }
                }
            }
            Err(e) => {
                log::warn!("Save: write for {} failed: {} — queueing", id, e);
                self.enqueue_snapshot(id, Some(parent)).await?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    /// Capture the document's current state into the durable queue
    async fn enqueue_snapshot(&self, id: Uuid, parent: Option<String>) -> Result<(), SyncError> {
        let (title, body, remote_file_id, kind, group_id) = {
            let store = self.store.lock().unwrap();
            let doc = store.document(id)?;
            (
                doc.title.clone(),
                doc.body.clone(),
                doc.remote_file_id.clone(),
                doc.kind,
                doc.group_id,
            )
        };
        let parent = match parent {
            Some(p) => p,
            None => self.resolve_parent(kind, group_id).await,
        };
        {
            let mut queue = self.queue.lock().unwrap();
            queue.enqueue(id, title, body, remote_file_id, parent);
        }
        if let Err(e) = self.queue.lock().unwrap().save(&self.queue_path) {
            log::error!("Save: could not persist sync queue: {}", e);
        }
        Ok(())
    }

    /// Pick the parent folder for a document's remote file. A chapter whose
    /// group folder is still being created waits (bounded), then degrades to
    /// the chapters folder, then to the story folder.
    async fn resolve_parent(&self, kind: DocumentKind, group_id: Option<Uuid>) -> String {
        let layout = self.layout.lock().unwrap().clone();
        let Some(layout) = layout else {
            log::warn!("Save: no story layout attached, write will be queued");
            return String::new();
        };

        if let Some(group_id) = group_id {
            if let Some(folder) = wait_for_group_folder(&self.store, group_id, FOLDER_WAIT).await {
                return folder;
            }
        }
        layout
            .folder_for_kind(kind)
            .map(String::from)
            .unwrap_or_else(|| layout.story_folder_id.clone())
    }
}
