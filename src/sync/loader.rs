use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::store::DocumentStore;

use super::SyncError;

/// Documents fetched concurrently per batch
const LOAD_BATCH_SIZE: usize = 5;
/// Minimum interval between intermediate progress emissions
const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Progress of a background content sweep
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    pub loaded: usize,
    pub total: usize,
    /// Running total across all documents, for the progress meter
    pub total_word_count: usize,
}

/// Fetches document bodies lazily after a story opens.
///
/// Opening a story loads structure only; the active document is fetched
/// synchronously and everything else streams in here, in small concurrent
/// batches. One sweep at a time. A document whose fetch fails stays
/// unloaded and is picked up by the next sweep.
pub struct ContentLoader {
    store: Arc<Mutex<DocumentStore>>,
    remote: Arc<dyn RemoteStore>,
    progress: mpsc::Sender<LoadProgress>,
    loading: AtomicBool,
}

impl ContentLoader {
    pub fn new(
        store: Arc<Mutex<DocumentStore>>,
        remote: Arc<dyn RemoteStore>,
        progress: mpsc::Sender<LoadProgress>,
    ) -> Self {
        Self {
            store,
            remote,
            progress,
            loading: AtomicBool::new(false),
        }
    }

    /// Fetch one document's body now (used for the active document on open
    /// and on navigation to an unloaded document).
    pub async fn load_document(&self, id: Uuid) -> Result<(), SyncError> {
        let file_id = {
            let store = self.store.lock().unwrap();
            store.document(id)?.remote_file_id.clone()
        };
        let Some(file_id) = file_id else {
            // Never written remotely; there is no body to fetch
            let mut store = self.store.lock().unwrap();
            store.mark_content_loaded(id)?;
            return Ok(());
        };
        let content = self.remote.read(&file_id).await?;
        let mut store = self.store.lock().unwrap();
        store.apply_loaded_content(id, content.content, content.modified_at)?;
        Ok(())
    }

    /// Sweep all unloaded documents in the background. A sweep already in
    /// progress makes this a no-op.
    pub async fn load_remaining(self: Arc<Self>) {
        if self.loading.swap(true, Ordering::SeqCst) {
            log::debug!("Loader: sweep already running, skipping");
            return;
        }
        self.sweep().await;
        self.loading.store(false, Ordering::SeqCst);
    }

    async fn sweep(&self) {
        let pending: Vec<Uuid> = {
            let store = self.store.lock().unwrap();
            store
                .documents_ordered()
                .iter()
                .filter(|d| !d.content_loaded)
                .map(|d| d.id)
                .collect()
        };
        let total = pending.len();
        if total == 0 {
            return;
        }
        log::info!("Loader: fetching content for {} documents", total);

        let mut loaded = 0;
        let mut last_emit = tokio::time::Instant::now();
        for batch in pending.chunks(LOAD_BATCH_SIZE) {
            let results = join_all(batch.iter().map(|id| self.load_document(*id))).await;
            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => loaded += 1,
                    // Left unloaded for the next sweep to retry
                    Err(e) => log::warn!("Loader: fetch for {} failed: {}", id, e),
                }
            }

            let now = tokio::time::Instant::now();
            if now.duration_since(last_emit) >= PROGRESS_THROTTLE {
                last_emit = now;
                self.emit(loaded, total);
            }
        }
        // Final emission always fires so the meter lands on its true state
        self.emit(loaded, total);
        log::info!("Loader: sweep done, {}/{} loaded", loaded, total);
    }

    fn emit(&self, loaded: usize, total: usize) {
        let total_word_count = self.store.lock().unwrap().total_word_count();
        let _ = self.progress.try_send(LoadProgress {
            loaded,
            total,
            total_word_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::{Document, DocumentKind};
    use chrono::Utc;

    fn setup() -> (
        Arc<Mutex<DocumentStore>>,
        Arc<MemoryRemote>,
        Arc<ContentLoader>,
        mpsc::Receiver<LoadProgress>,
    ) {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(Mutex::new(DocumentStore::new("Story".into())));
        let (tx, rx) = mpsc::channel(64);
        let loader = Arc::new(ContentLoader::new(
            Arc::clone(&store),
            remote.clone() as Arc<dyn RemoteStore>,
            tx,
        ));
        (store, remote, loader, rx)
    }

    fn add_unloaded(
        store: &Arc<Mutex<DocumentStore>>,
        remote: &MemoryRemote,
        title: &str,
        body: &str,
    ) -> Uuid {
        let file_id = remote.seed_file(&format!("{}.txt", title), body, "root", Utc::now());
        let mut s = store.lock().unwrap();
        let mut doc = Document::new(title.into(), DocumentKind::PersonRef, None);
        doc.content_loaded = false;
        doc.remote_file_id = Some(file_id);
        s.insert_document(doc).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_loads_all_pending_bodies() {
        let (store, remote, loader, mut rx) = setup();
        let ids: Vec<Uuid> = (0..7)
            .map(|i| add_unloaded(&store, &remote, &format!("Doc{}", i), "one two three"))
            .collect();

        loader.load_remaining().await;

        let s = store.lock().unwrap();
        for id in &ids {
            let doc = s.document(*id).unwrap();
            assert!(doc.content_loaded);
            assert_eq!(doc.body, "one two three");
            assert_eq!(doc.word_count, 3);
        }
        // Final progress emission reports everything loaded
        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.loaded, 7);
        assert_eq!(last.total, 7);
        assert_eq!(last.total_word_count, 21);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_document_unloaded_for_retry() {
        let (store, remote, loader, _rx) = setup();
        let ok = add_unloaded(&store, &remote, "Good", "text");
        let bad = add_unloaded(&store, &remote, "Bad", "text");
        let bad_file = store
            .lock()
            .unwrap()
            .document(bad)
            .unwrap()
            .remote_file_id
            .clone()
            .unwrap();
        remote.fail_read_for(&bad_file);

        Arc::clone(&loader).load_remaining().await;
        {
            let s = store.lock().unwrap();
            assert!(s.document(ok).unwrap().content_loaded);
            assert!(!s.document(bad).unwrap().content_loaded);
        }

        // Injection was one-shot, so the next sweep picks it up
        loader.load_remaining().await;
        assert!(store.lock().unwrap().document(bad).unwrap().content_loaded);
    }

    #[tokio::test]
    async fn test_document_without_remote_file_is_marked_loaded() {
        let (store, _, loader, _rx) = setup();
        let id = {
            let mut s = store.lock().unwrap();
            let mut doc = Document::new("Fresh".into(), DocumentKind::PersonRef, None);
            doc.content_loaded = false;
            s.insert_document(doc).unwrap()
        };

        loader.load_remaining().await;
        assert!(store.lock().unwrap().document(id).unwrap().content_loaded);
    }

    #[tokio::test]
    async fn test_loaded_content_does_not_count_as_local_edit() {
        let (store, remote, loader, _rx) = setup();
        let id = add_unloaded(&store, &remote, "Doc", "body");
        let before = store.lock().unwrap().document(id).unwrap().updated_at;

        loader.load_document(id).await.unwrap();

        let s = store.lock().unwrap();
        let doc = s.document(id).unwrap();
        assert_eq!(doc.updated_at, before);
        assert!(doc.last_known_remote_modified_at.is_some());
    }
}
