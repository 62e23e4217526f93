use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::store::DocumentStore;

use super::locks::DocumentLocks;
use super::queue::{create_batches, SyncQueue, SyncQueueEntry};

/// How long a flush waits for a document busy with a foreground save
const FLUSH_LOCK_WAIT: Duration = Duration::from_millis(1000);

/// Progress events emitted while draining the queue
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SyncEvent {
    EntryStarted { document_id: Uuid },
    EntrySucceeded { document_id: Uuid },
    EntryFailed { document_id: Uuid, error: String },
    BatchComplete { succeeded: usize, failed: usize },
    FlushComplete { remaining: usize },
}

/// Outcome of one flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub delivered: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Drains the durable sync queue in parallel batches.
///
/// One flush at a time; a second call while one is running is a no-op so
/// connectivity-restored and manual-retry triggers can both fire freely.
/// Entries that fail stay queued with their error recorded.
pub struct QueueFlusher {
    store: Arc<Mutex<DocumentStore>>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<Mutex<SyncQueue>>,
    queue_path: PathBuf,
    locks: Arc<DocumentLocks>,
    events: mpsc::Sender<SyncEvent>,
    flushing: AtomicBool,
}

impl QueueFlusher {
    pub fn new(
        store: Arc<Mutex<DocumentStore>>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<Mutex<SyncQueue>>,
        queue_path: PathBuf,
        locks: Arc<DocumentLocks>,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            remote,
            queue,
            queue_path,
            locks,
            events,
            flushing: AtomicBool::new(false),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Drain the queue. Returns None when a flush was already running.
    pub async fn flush(&self) -> Option<FlushSummary> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            log::debug!("Flush: already running, skipping");
            return None;
        }
        let summary = self.run().await;
        self.flushing.store(false, Ordering::SeqCst);
        Some(summary)
    }

    async fn run(&self) -> FlushSummary {
        let entries = self.queue.lock().unwrap().entries.clone();
        if entries.is_empty() {
            let _ = self.events.try_send(SyncEvent::FlushComplete { remaining: 0 });
            return FlushSummary { delivered: 0, failed: 0, remaining: 0 };
        }
        log::info!("Flush: draining {} queued writes", entries.len());

        let mut delivered = 0;
        let mut failed = 0;
        for batch in create_batches(&entries) {
            let results = join_all(batch.iter().map(|e| self.deliver_entry(e))).await;

            let mut batch_ok = 0;
            let mut batch_err = 0;
            {
                let mut queue = self.queue.lock().unwrap();
                for (entry, result) in batch.iter().zip(results) {
                    match result {
                        Ok(()) => {
                            queue.complete(entry.id);
                            batch_ok += 1;
                        }
                        Err(error) => {
                            queue.fail(entry.id, error);
                            batch_err += 1;
                        }
                    }
                }
            }
            if let Err(e) = self.queue.lock().unwrap().save(&self.queue_path) {
                log::error!("Flush: could not persist sync queue: {}", e);
            }
            delivered += batch_ok;
            failed += batch_err;
            let _ = self.events.try_send(SyncEvent::BatchComplete {
                succeeded: batch_ok,
                failed: batch_err,
            });
        }

        let remaining = self.queue.lock().unwrap().pending_count();
        log::info!(
            "Flush: done, {} delivered, {} failed, {} remaining",
            delivered,
            failed,
            remaining,
        );
        let _ = self.events.try_send(SyncEvent::FlushComplete { remaining });
        FlushSummary { delivered, failed, remaining }
    }

    /// Deliver one snapshot. The document lock is held across the write so a
    /// foreground save never races the same file; if the document stays busy
    /// beyond the wait the entry is left queued for the next pass.
    async fn deliver_entry(&self, entry: &SyncQueueEntry) -> Result<(), String> {
        let document_id = entry.document_id;
        let _ = self.events.try_send(SyncEvent::EntryStarted { document_id });

        let Some(_lock) = self.locks.acquire(document_id, FLUSH_LOCK_WAIT).await else {
            log::debug!("Flush: {} busy, leaving entry queued", document_id);
            let _ = self.events.try_send(SyncEvent::EntryFailed {
                document_id,
                error: "document busy".to_string(),
            });
            return Err("document busy".to_string());
        };

        let name = format!("{}.txt", entry.title);
        let result = self
            .remote
            .write(
                &name,
                &entry.content_snapshot,
                entry.remote_file_id.as_deref(),
                &entry.parent_folder_id,
                "text/plain",
            )
            .await;

        let outcome = match result {
            Ok(file_id) => Ok(file_id),
            Err(e) if e.is_not_found() && entry.remote_file_id.is_some() => {
                // Target deleted since the snapshot was queued: create-new
                // exactly once and adopt the id
                log::info!("Flush: remote file for {} is gone, recreating", document_id);
                self.remote
                    .write(&name, &entry.content_snapshot, None, &entry.parent_folder_id, "text/plain")
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(file_id) => {
                {
                    let mut store = self.store.lock().unwrap();
                    // The document may have been deleted locally since;
                    // delivering the write is still correct, adopting is not
                    if store.contains_document(document_id) {
                        let _ = store.set_remote_file_id(document_id, file_id);
                    }
                }
                let _ = self.events.try_send(SyncEvent::EntrySucceeded { document_id });
                Ok(())
            }
            Err(error) => {
                log::warn!("Flush: delivery for {} failed: {}", document_id, error);
                let _ = self.events.try_send(SyncEvent::EntryFailed {
                    document_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::{Document, DocumentKind};

    struct Fixture {
        flusher: QueueFlusher,
        store: Arc<Mutex<DocumentStore>>,
        remote: Arc<MemoryRemote>,
        queue: Arc<Mutex<SyncQueue>>,
        locks: Arc<DocumentLocks>,
        events: mpsc::Receiver<SyncEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(Mutex::new(DocumentStore::new("Story".into())));
        let queue = Arc::new(Mutex::new(SyncQueue::new()));
        let locks = Arc::new(DocumentLocks::new());
        let (tx, events) = mpsc::channel(64);
        let flusher = QueueFlusher::new(
            Arc::clone(&store),
            remote.clone() as Arc<dyn RemoteStore>,
            Arc::clone(&queue),
            dir.path().join("sync_queue.json"),
            Arc::clone(&locks),
            tx,
        );
        Fixture { flusher, store, remote, queue, locks, events, _dir: dir }
    }

    fn add_reference(store: &Arc<Mutex<DocumentStore>>, title: &str) -> Uuid {
        let mut s = store.lock().unwrap();
        s.insert_document(Document::new(title.into(), DocumentKind::PersonRef, None))
            .unwrap()
    }

    #[tokio::test]
    async fn test_delivers_queued_snapshot_and_adopts_file_id() {
        let mut fx = fixture();
        let id = add_reference(&fx.store, "Ada");
        fx.queue
            .lock()
            .unwrap()
            .enqueue(id, "Ada".into(), "offline edit".into(), None, "root".into());

        let summary = fx.flusher.flush().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.remaining, 0);

        let file_id = fx.store.lock().unwrap().document(id).unwrap().remote_file_id.clone().unwrap();
        assert_eq!(fx.remote.file_content(&file_id).unwrap(), "offline edit");
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            SyncEvent::EntryStarted { .. }
        ));
    }

    #[tokio::test]
    async fn test_deleted_remote_target_is_recreated_exactly_once() {
        let fx = fixture();
        let id = add_reference(&fx.store, "Ada");
        let stale = fx.remote.seed_file("Ada.txt", "v1", "root", chrono::Utc::now());
        fx.remote.delete_out_of_band(&stale);
        fx.queue.lock().unwrap().enqueue(
            id,
            "Ada".into(),
            "v2".into(),
            Some(stale.clone()),
            "root".into(),
        );

        let summary = fx.flusher.flush().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(fx.remote.file_count(), 1, "exactly one file after recreate");
        assert_eq!(fx.remote.write_call_count(), 2, "one failed overwrite, one create");

        let adopted = fx.store.lock().unwrap().document(id).unwrap().remote_file_id.clone().unwrap();
        assert_ne!(adopted, stale);
        assert_eq!(fx.remote.file_content(&adopted).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_failed_entries_stay_queued_while_others_deliver() {
        let fx = fixture();
        let a = add_reference(&fx.store, "Ada");
        let b = add_reference(&fx.store, "Brin");
        {
            let mut q = fx.queue.lock().unwrap();
            q.enqueue(a, "Ada".into(), "a".into(), None, "root".into());
            q.enqueue(b, "Brin".into(), "b".into(), None, "missing-folder".into());
        }

        let summary = fx.flusher.flush().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.remaining, 1);

        let queue = fx.queue.lock().unwrap();
        assert_eq!(queue.entries[0].document_id, b);
        assert_eq!(queue.entries[0].retries, 1);
        assert!(queue.entries[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_second_flush_while_running_is_a_no_op() {
        let fx = Arc::new(fixture());
        let id = add_reference(&fx.store, "Ada");
        fx.queue
            .lock()
            .unwrap()
            .enqueue(id, "Ada".into(), "text".into(), None, "root".into());

        // Hold the document lock so the first flush parks on acquire
        let held = fx.locks.try_acquire(id).unwrap();
        let first = {
            let fx = Arc::clone(&fx);
            tokio::spawn(async move { fx.flusher.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.flusher.is_flushing());
        assert!(fx.flusher.flush().await.is_none(), "re-entrant flush skipped");

        drop(held);
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(!fx.flusher.is_flushing());
    }

    #[tokio::test]
    async fn test_empty_queue_flush_reports_nothing_remaining() {
        let fx = fixture();
        let summary = fx.flusher.flush().await.unwrap();
        assert_eq!(summary, FlushSummary { delivered: 0, failed: 0, remaining: 0 });
    }
}
