use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::store::DocumentStore;

/// How long a dependent write waits for an in-flight folder creation
pub const FOLDER_WAIT: Duration = Duration::from_millis(2500);
const FOLDER_POLL: Duration = Duration::from_millis(100);
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Per-document busy locks.
///
/// Two in-flight remote writes for the same document would race and could
/// leave the remote object holding the older content; a write must hold the
/// document's lock for its full duration. Waiting is bounded — callers that
/// time out queue the write instead of blocking.
pub struct DocumentLocks {
    busy: Mutex<HashSet<Uuid>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Acquire immediately or not at all
    pub fn try_acquire(self: &Arc<Self>, id: Uuid) -> Option<DocumentLock> {
        let mut busy = self.busy.lock().unwrap();
        if busy.insert(id) {
            Some(DocumentLock {
                locks: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }

    /// Acquire with a bounded wait; None on timeout
    pub async fn acquire(self: &Arc<Self>, id: Uuid, timeout: Duration) -> Option<DocumentLock> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lock) = self.try_acquire(id) {
                return Some(lock);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    pub fn is_busy(&self, id: Uuid) -> bool {
        self.busy.lock().unwrap().contains(&id)
    }

    fn release(&self, id: Uuid) {
        self.busy.lock().unwrap().remove(&id);
    }
}

impl Default for DocumentLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one remote write; releases on drop
pub struct DocumentLock {
    locks: Arc<DocumentLocks>,
    id: Uuid,
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        self.locks.release(self.id);
    }
}

/// Wait (bounded) for a group's remote folder to come into existence.
///
/// Folder creation for a new group is fire-and-forget relative to the UI;
/// a write that needs the folder id polls for it instead of failing, and on
/// timeout proceeds with a degraded fallback parent chosen by the caller.
pub async fn wait_for_group_folder(
    store: &Arc<Mutex<DocumentStore>>,
    group_id: Uuid,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let store = store.lock().unwrap();
            if let Ok(group) = store.group(group_id) {
                if let Some(folder_id) = &group.remote_folder_id {
                    return Some(folder_id.clone());
                }
            } else {
                // Group vanished while waiting
                return None;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            log::warn!(
                "Locks: timed out waiting for folder of group {}, falling back",
                group_id,
            );
            return None;
        }
        tokio::time::sleep(FOLDER_POLL).await;
    }
}
