use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::ReviewArtifacts;

use super::adapter::{
    RemoteAttributes, RemoteContent, RemoteEntry, RemoteError, RemoteStore, FOLDER_MIME,
};

#[derive(Debug, Clone)]
struct FileNode {
    name: String,
    parent: String,
    content: String,
    content_type: String,
    modified_at: DateTime<Utc>,
    trashed: bool,
    review: ReviewArtifacts,
}

#[derive(Debug, Clone)]
struct FolderNode {
    name: String,
    parent: Option<String>,
}

#[derive(Default)]
struct Injections {
    /// Fail the next N write calls with a transient error
    fail_writes: usize,
    /// Folder ids whose listing fails transiently
    fail_list: Vec<String>,
    /// File ids whose read fails transiently
    fail_read: Vec<String>,
}

/// In-memory storage backend.
///
/// Reference implementation of [`RemoteStore`] used throughout the test
/// suite; supports failure injection and out-of-band edits so conflict and
/// retry paths can be exercised without a network.
pub struct MemoryRemote {
    files: Mutex<HashMap<String, FileNode>>,
    folders: Mutex<HashMap<String, FolderNode>>,
    injections: Mutex<Injections>,
    next_id: AtomicU64,
    write_calls: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let remote = Self {
            files: Mutex::new(HashMap::new()),
            folders: Mutex::new(HashMap::new()),
            injections: Mutex::new(Injections::default()),
            next_id: AtomicU64::new(1),
            write_calls: AtomicU64::new(0),
        };
        remote.folders.lock().unwrap().insert(
            "root".to_string(),
            FolderNode {
                name: "root".to_string(),
                parent: None,
            },
        );
        remote
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // ===== Test controls =====

    /// Fail the next `n` write calls with a transient error
    pub fn fail_next_writes(&self, n: usize) {
        self.injections.lock().unwrap().fail_writes = n;
    }

    /// Make listing a specific folder fail transiently
    pub fn fail_list_for(&self, folder_id: &str) {
        self.injections.lock().unwrap().fail_list.push(folder_id.to_string());
    }

    /// Make reading a specific file fail transiently
    pub fn fail_read_for(&self, file_id: &str) {
        self.injections.lock().unwrap().fail_read.push(file_id.to_string());
    }

    /// Simulate an out-of-band edit from another device
    pub fn edit_out_of_band(&self, file_id: &str, content: &str, at: DateTime<Utc>) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get_mut(file_id) {
            file.content = content.to_string();
            file.modified_at = at;
        }
    }

    /// Simulate a metadata-only touch (modified-time bump, same content)
    pub fn touch(&self, file_id: &str, at: DateTime<Utc>) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get_mut(file_id) {
            file.modified_at = at;
        }
    }

    /// Simulate an out-of-band hard deletion (id becomes unknown)
    pub fn delete_out_of_band(&self, file_id: &str) {
        self.files.lock().unwrap().remove(file_id);
    }

    pub fn set_review(&self, file_id: &str, review: ReviewArtifacts) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get_mut(file_id) {
            file.review = review;
        }
    }

    // ===== Test inspection =====

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().values().filter(|f| !f.trashed).count()
    }

    pub fn write_call_count(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn file_content(&self, file_id: &str) -> Option<String> {
        self.files.lock().unwrap().get(file_id).map(|f| f.content.clone())
    }

    pub fn file_name(&self, file_id: &str) -> Option<String> {
        self.files.lock().unwrap().get(file_id).map(|f| f.name.clone())
    }

    pub fn is_trashed(&self, file_id: &str) -> bool {
        self.files.lock().unwrap().get(file_id).map(|f| f.trashed).unwrap_or(false)
    }

    /// Find a live file id by name within a folder
    pub fn find_file(&self, parent_folder_id: &str, name: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|(_, f)| f.parent == parent_folder_id && f.name == name && !f.trashed)
            .map(|(id, _)| id.clone())
    }

    /// Seed a file directly, returning its id (bypasses failure injection)
    pub fn seed_file(
        &self,
        name: &str,
        content: &str,
        parent_folder_id: &str,
        modified_at: DateTime<Utc>,
    ) -> String {
        let id = self.fresh_id("file");
        self.files.lock().unwrap().insert(
            id.clone(),
            FileNode {
                name: name.to_string(),
                parent: parent_folder_id.to_string(),
                content: content.to_string(),
                content_type: "text/plain".to_string(),
                modified_at,
                trashed: false,
                review: ReviewArtifacts::default(),
            },
        );
        id
    }

    /// Seed a folder directly, returning its id
    pub fn seed_folder(&self, name: &str, parent_folder_id: &str) -> String {
        let id = self.fresh_id("folder");
        self.folders.lock().unwrap().insert(
            id.clone(),
            FolderNode {
                name: name.to_string(),
                parent: Some(parent_folder_id.to_string()),
            },
        );
        id
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        {
            let mut inj = self.injections.lock().unwrap();
            if let Some(pos) = inj.fail_list.iter().position(|f| f == folder_id) {
                inj.fail_list.remove(pos);
                return Err(RemoteError::Transient(format!(
                    "injected list failure for {}",
                    folder_id
                )));
            }
        }
        if !self.folders.lock().unwrap().contains_key(folder_id) {
            return Err(RemoteError::NotFound(folder_id.to_string()));
        }

        let mut entries: Vec<RemoteEntry> = Vec::new();
        for (id, folder) in self.folders.lock().unwrap().iter() {
            if folder.parent.as_deref() == Some(folder_id) {
                entries.push(RemoteEntry {
                    id: id.clone(),
                    name: folder.name.clone(),
                    mime_type: FOLDER_MIME.to_string(),
                    modified_at: Utc::now(),
                    trashed: false,
                });
            }
        }
        for (id, file) in self.files.lock().unwrap().iter() {
            if file.parent == folder_id {
                entries.push(RemoteEntry {
                    id: id.clone(),
                    name: file.name.clone(),
                    mime_type: file.content_type.clone(),
                    modified_at: file.modified_at,
                    trashed: file.trashed,
                });
            }
        }
        // Listing order is id order (stable across calls)
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn read(&self, file_id: &str) -> Result<RemoteContent, RemoteError> {
        {
            let mut inj = self.injections.lock().unwrap();
            if let Some(pos) = inj.fail_read.iter().position(|f| f == file_id) {
                inj.fail_read.remove(pos);
                return Err(RemoteError::Transient(format!(
                    "injected read failure for {}",
                    file_id
                )));
            }
        }
        let files = self.files.lock().unwrap();
        let file = files
            .get(file_id)
            .filter(|f| !f.trashed)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        Ok(RemoteContent {
            content: file.content.clone(),
            modified_at: file.modified_at,
        })
    }

    async fn stat(&self, file_id: &str) -> Result<RemoteAttributes, RemoteError> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(file_id)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        Ok(RemoteAttributes {
            modified_at: file.modified_at,
            trashed: file.trashed,
        })
    }

    async fn write(
        &self,
        name: &str,
        content: &str,
        existing_file_id: Option<&str>,
        parent_folder_id: &str,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut inj = self.injections.lock().unwrap();
            if inj.fail_writes > 0 {
                inj.fail_writes -= 1;
                return Err(RemoteError::Transient("injected write failure".to_string()));
            }
        }

        let mut files = self.files.lock().unwrap();
        if let Some(existing) = existing_file_id {
            let file = files
                .get_mut(existing)
                .filter(|f| !f.trashed)
                .ok_or_else(|| RemoteError::NotFound(existing.to_string()))?;
            file.content = content.to_string();
            file.modified_at = Utc::now();
            return Ok(existing.to_string());
        }

        if !self.folders.lock().unwrap().contains_key(parent_folder_id) {
            return Err(RemoteError::NotFound(parent_folder_id.to_string()));
        }
        let id = self.fresh_id("file");
        files.insert(
            id.clone(),
            FileNode {
                name: name.to_string(),
                parent: parent_folder_id.to_string(),
                content: content.to_string(),
                content_type: content_type.to_string(),
                modified_at: Utc::now(),
                trashed: false,
                review: ReviewArtifacts::default(),
            },
        );
        Ok(id)
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> Result<(), RemoteError> {
        if let Some(file) = self.files.lock().unwrap().get_mut(file_id) {
            file.name = new_name.to_string();
            return Ok(());
        }
        if let Some(folder) = self.folders.lock().unwrap().get_mut(file_id) {
            folder.name = new_name.to_string();
            return Ok(());
        }
        Err(RemoteError::NotFound(file_id.to_string()))
    }

    async fn delete(&self, file_id: &str) -> Result<(), RemoteError> {
        if let Some(file) = self.files.lock().unwrap().get_mut(file_id) {
            file.trashed = true;
            return Ok(());
        }
        if self.folders.lock().unwrap().remove(file_id).is_some() {
            return Ok(());
        }
        Err(RemoteError::NotFound(file_id.to_string()))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_folder_id: &str,
    ) -> Result<String, RemoteError> {
        let mut folders = self.folders.lock().unwrap();
        if !folders.contains_key(parent_folder_id) {
            return Err(RemoteError::NotFound(parent_folder_id.to_string()));
        }
        let id = self.fresh_id("folder");
        folders.insert(
            id.clone(),
            FolderNode {
                name: name.to_string(),
                parent: Some(parent_folder_id.to_string()),
            },
        );
        Ok(id)
    }

    async fn check_review_artifacts(
        &self,
        file_id: &str,
    ) -> Result<ReviewArtifacts, RemoteError> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(file_id)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        Ok(file.review.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_with_existing_id_overwrites() {
        let remote = MemoryRemote::new();
        let id = remote
            .write("a.txt", "one", None, "root", "text/plain")
            .await
            .unwrap();
        let id2 = remote
            .write("a.txt", "two", Some(&id), "root", "text/plain")
            .await
            .unwrap();
        assert_eq!(id, id2);
        assert_eq!(remote.file_count(), 1);
        assert_eq!(remote.file_content(&id).unwrap(), "two");
    }

    #[tokio::test]
    async fn test_write_to_deleted_id_is_not_found() {
        let remote = MemoryRemote::new();
        let id = remote
            .write("a.txt", "one", None, "root", "text/plain")
            .await
            .unwrap();
        remote.delete_out_of_band(&id);
        let err = remote
            .write("a.txt", "two", Some(&id), "root", "text/plain")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_moves_to_trash() {
        let remote = MemoryRemote::new();
        let id = remote
            .write("a.txt", "one", None, "root", "text/plain")
            .await
            .unwrap();
        remote.delete(&id).await.unwrap();
        assert!(remote.is_trashed(&id));
        assert!(remote.read(&id).await.unwrap_err().is_not_found());
    }
}
