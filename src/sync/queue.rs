use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Maximum entries per delivery batch
pub const BATCH_SIZE: usize = 10;
/// Entries enqueued more than this long after a batch's first entry start a
/// new batch
pub const BATCH_WINDOW_MS: i64 = 5000;

/// A write that failed or was made while offline, waiting for redelivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    /// Unique ID for this queue entry
    pub id: Uuid,
    pub document_id: Uuid,
    /// Document title at enqueue time (names the file on create-new)
    pub title: String,
    /// Full body text captured at enqueue time
    pub content_snapshot: String,
    /// Remote file to overwrite; None means create-new
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file_id: Option<String>,
    pub parent_folder_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Durable queue of pending document writes
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncQueue {
    pub entries: Vec<SyncQueueEntry>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Queue a write, superseding any older entry for the same document —
    /// the newest snapshot is the only one worth delivering.
    pub fn enqueue(
        &mut self,
        document_id: Uuid,
        title: String,
        content_snapshot: String,
        remote_file_id: Option<String>,
        parent_folder_id: String,
    ) {
        self.entries.retain(|e| e.document_id != document_id);
        self.entries.push(SyncQueueEntry {
            id: Uuid::new_v4(),
            document_id,
            title,
            content_snapshot,
            remote_file_id,
            parent_folder_id,
            enqueued_at: Utc::now(),
            retries: 0,
            last_error: None,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Remove a delivered entry
    pub fn complete(&mut self, entry_id: Uuid) {
        self.entries.retain(|e| e.id != entry_id);
    }

    /// Record a delivery failure; the entry stays queued
    pub fn fail(&mut self, entry_id: Uuid, error: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == entry_id) {
            entry.retries += 1;
            entry.last_error = Some(error);
        }
    }

    /// Adopt a new remote file id after a create-new fallback; true if any
    /// entry was pointed at the new file
    pub fn update_remote_file_id(&mut self, document_id: Uuid, file_id: &str) -> bool {
        let mut changed = false;
        for entry in self.entries.iter_mut() {
            if entry.document_id == document_id {
                entry.remote_file_id = Some(file_id.to_string());
                changed = true;
            }
        }
        changed
    }

    pub fn remove_document(&mut self, document_id: Uuid) {
        self.entries.retain(|e| e.document_id != document_id);
    }

    /// Load queue from file (empty when missing)
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save queue to file
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
    }
}

/// Partition entries into delivery batches: contiguous runs sorted by
/// enqueue time, each capped at [`BATCH_SIZE`] entries and a
/// [`BATCH_WINDOW_MS`] span from the batch's first entry.
pub fn create_batches(entries: &[SyncQueueEntry]) -> Vec<Vec<SyncQueueEntry>> {
    let mut sorted: Vec<SyncQueueEntry> = entries.to_vec();
    sorted.sort_by_key(|e| e.enqueued_at);

    let window = Duration::milliseconds(BATCH_WINDOW_MS);
    let mut batches: Vec<Vec<SyncQueueEntry>> = Vec::new();
    for entry in sorted {
        let start_new = match batches.last() {
            Some(batch) => {
                batch.len() >= BATCH_SIZE
                    || entry.enqueued_at > batch[0].enqueued_at + window
            }
            None => true,
        };
        if start_new {
            batches.push(Vec::new());
        }
        batches.last_mut().unwrap().push(entry);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(offset_ms: i64) -> SyncQueueEntry {
        SyncQueueEntry {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            title: "Doc".to_string(),
            content_snapshot: String::new(),
            remote_file_id: None,
            parent_folder_id: "root".to_string(),
            enqueued_at: DateTime::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap(),
            retries: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_enqueue_supersedes_older_entry_for_same_document() {
        let mut queue = SyncQueue::new();
        let doc = Uuid::new_v4();
        queue.enqueue(doc, "Doc".into(), "old".into(), None, "root".into());
        queue.enqueue(doc, "Doc".into(), "new".into(), None, "root".into());
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.entries[0].content_snapshot, "new");
    }

    #[test]
    fn test_batches_split_on_size() {
        // 25 entries 1ms apart: [10, 10, 5]
        let entries: Vec<SyncQueueEntry> = (0..25).map(entry_at).collect();
        let batches = create_batches(&entries);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_batches_split_on_time_window() {
        let mut entries: Vec<SyncQueueEntry> = vec![entry_at(0), entry_at(1000)];
        entries.push(entry_at(BATCH_WINDOW_MS + 1));
        let batches = create_batches(&entries);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_batches_sort_by_enqueue_time() {
        let entries = vec![entry_at(500), entry_at(0), entry_at(250)];
        let batches = create_batches(&entries);
        assert_eq!(batches.len(), 1);
        let times: Vec<_> = batches[0].iter().map(|e| e.enqueued_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_queue_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_queue.json");

        let mut queue = SyncQueue::new();
        queue.enqueue(Uuid::new_v4(), "Doc".into(), "text".into(), Some("f-1".into()), "root".into());
        queue.save(&path).unwrap();

        let loaded = SyncQueue::load(&path).unwrap();
        assert_eq!(loaded.pending_count(), 1);
        assert_eq!(loaded.entries[0].remote_file_id.as_deref(), Some("f-1"));
    }
}
