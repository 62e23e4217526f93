use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::store::{Document, DocumentKind, DocumentStore, Group};

/// File name of the structure/ordering record inside a story folder
pub const STORY_METADATA_NAME: &str = "story.json";
/// File name of the project settings record
pub const PROJECT_RECORD_NAME: &str = "project.json";
/// File name of the goal state record
pub const GOAL_RECORD_NAME: &str = "goal.json";

/// Persisted shape of a document (body lives in its own remote file)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: Uuid,
    pub title: String,
    pub kind: DocumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file_id: Option<String>,
    pub word_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_remote_modified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Document> for DocumentMeta {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id,
            title: doc.title.clone(),
            kind: doc.kind,
            group_id: doc.group_id,
            position: doc.position,
            remote_file_id: doc.remote_file_id.clone(),
            word_count: doc.word_count,
            last_known_remote_modified_at: doc.last_known_remote_modified_at,
            updated_at: doc.updated_at,
        }
    }
}

impl DocumentMeta {
    /// Rehydrate into a store document; the body stays empty until the
    /// content loader fills it in
    pub fn into_document(self) -> Document {
        Document {
            id: self.id,
            title: self.title,
            body: String::new(),
            word_count: self.word_count,
            char_count: 0,
            kind: self.kind,
            group_id: self.group_id,
            position: self.position,
            remote_file_id: self.remote_file_id,
            last_known_remote_modified_at: self.last_known_remote_modified_at,
            updated_at: self.updated_at,
            content_loaded: false,
            review: None,
        }
    }
}

/// Persisted shape of a group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMeta {
    pub id: Uuid,
    pub title: String,
    pub color: String,
    pub position: usize,
    pub document_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_folder_id: Option<String>,
}

impl From<&Group> for GroupMeta {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id,
            title: group.title.clone(),
            color: group.color.clone(),
            position: group.position,
            document_ids: group.document_ids.clone(),
            remote_folder_id: group.remote_folder_id.clone(),
        }
    }
}

impl GroupMeta {
    pub fn into_group(self) -> Group {
        Group {
            id: self.id,
            title: self.title,
            color: self.color,
            position: self.position,
            document_ids: self.document_ids,
            remote_folder_id: self.remote_folder_id,
        }
    }
}

/// The structural/ordering record: authoritative for structure and order,
/// never for content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryMetadata {
    #[serde(default)]
    pub groups: Vec<GroupMeta>,
    #[serde(default)]
    pub documents: Vec<DocumentMeta>,
}

impl StoryMetadata {
    pub fn from_store(store: &DocumentStore) -> Self {
        Self {
            groups: store.groups_ordered().into_iter().map(GroupMeta::from).collect(),
            documents: store
                .documents_ordered()
                .into_iter()
                .map(DocumentMeta::from)
                .collect(),
        }
    }

    pub fn total_words(&self) -> usize {
        self.documents.iter().map(|d| d.word_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.groups.is_empty()
    }
}

/// One parsed candidate when a story folder holds duplicate metadata records
#[derive(Debug, Clone)]
pub struct MetadataCandidate {
    pub file_id: String,
    pub modified_at: DateTime<Utc>,
    pub metadata: StoryMetadata,
}

/// Pick the winning record among duplicates: most documents, then most
/// words, then most recently modified. Returns the winner index and the
/// file ids safe to delete — losers are deleted only when the winner holds
/// real data, so an all-empty duplicate set is left untouched.
pub fn pick_metadata_winner(candidates: &[MetadataCandidate]) -> Option<(usize, Vec<String>)> {
    let winner = candidates.iter().enumerate().max_by(|(_, a), (_, b)| {
        (a.metadata.documents.len(), a.metadata.total_words(), a.modified_at).cmp(&(
            b.metadata.documents.len(),
            b.metadata.total_words(),
            b.modified_at,
        ))
    })?;
    let (index, best) = winner;
    let deletable = if best.metadata.documents.is_empty() && best.metadata.total_words() == 0 {
        Vec::new()
    } else {
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, c)| c.file_id.clone())
            .collect()
    };
    Some((index, deletable))
}

/// Persisted project settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_goal: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_document_id: Option<Uuid>,
}

impl ProjectRecord {
    pub fn from_store(store: &DocumentStore) -> Self {
        Self {
            title: store.project.title.clone(),
            word_goal: store.project.word_goal,
            active_document_id: store.project.active_document_id,
        }
    }
}

/// Writes the structural metadata record, serialized globally.
///
/// The record is one shared remote resource: only one write may be in
/// flight at a time. A persist request arriving mid-flight is never
/// dropped — the in-flight writer notices the dirty flag and re-issues
/// with the latest in-memory snapshot before finishing.
pub struct MetadataWriter {
    store: Arc<Mutex<DocumentStore>>,
    remote: Arc<dyn RemoteStore>,
    story_folder_id: Mutex<Option<String>>,
    file_id: Mutex<Option<String>>,
    dirty: AtomicBool,
    in_flight: AtomicBool,
}

impl MetadataWriter {
    pub fn new(store: Arc<Mutex<DocumentStore>>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            story_folder_id: Mutex::new(None),
            file_id: Mutex::new(None),
            dirty: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Point the writer at the loaded story and its existing record, if any
    pub fn attach(&self, story_folder_id: String, existing_file_id: Option<String>) {
        *self.story_folder_id.lock().unwrap() = Some(story_folder_id);
        *self.file_id.lock().unwrap() = existing_file_id;
    }

    pub fn file_id(&self) -> Option<String> {
        self.file_id.lock().unwrap().clone()
    }

    /// Request a metadata persist. Batched: concurrent requests while a
    /// write is in flight collapse into one trailing write with the latest
    /// snapshot.
    pub async fn persist(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        loop {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                // The in-flight writer re-checks the dirty flag after its write
                return;
            }

            let mut failed = false;
            while self.dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.write_once().await {
                    log::warn!("Metadata: persist failed, will retry on next request: {}", e);
                    // Leave the record stale; the next persist request retries.
                    failed = true;
                    break;
                }
            }
            self.in_flight.store(false, Ordering::SeqCst);
            // A request that landed between the last dirty check and the
            // release above would otherwise be dropped: its persist call saw
            // in_flight still set and returned. Take over for it.
            if failed || !self.dirty.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn write_once(&self) -> Result<(), crate::remote::RemoteError> {
        let folder_id = match self.story_folder_id.lock().unwrap().clone() {
            Some(id) => id,
            None => {
                log::debug!("Metadata: no story attached, skipping persist");
                return Ok(());
            }
        };
        let snapshot = {
            let store = self.store.lock().unwrap();
            StoryMetadata::from_store(&store)
        };
        let body = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| crate::remote::RemoteError::Invalid(e.to_string()))?;

        let existing = self.file_id.lock().unwrap().clone();
        let result = self
            .remote
            .write(
                STORY_METADATA_NAME,
                &body,
                existing.as_deref(),
                &folder_id,
                "application/json",
            )
            .await;

        let new_id = match result {
            Ok(id) => id,
            Err(e) if e.is_not_found() && existing.is_some() => {
                // Record was deleted out-of-band: recreate as a new file
                log::info!("Metadata: record missing on remote, recreating");
                *self.file_id.lock().unwrap() = None;
                self.remote
                    .write(STORY_METADATA_NAME, &body, None, &folder_id, "application/json")
                    .await?
            }
            Err(e) => return Err(e),
        };
        *self.file_id.lock().unwrap() = Some(new_id);
        log::debug!(
            "Metadata: persisted {} documents, {} groups",
            snapshot.documents.len(),
            snapshot.groups.len(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{
        MemoryRemote, RemoteAttributes, RemoteContent, RemoteEntry, RemoteError,
    };
    use crate::store::DocumentStore;

    fn candidate(file_id: &str, docs: usize, words: usize, age_secs: i64) -> MetadataCandidate {
        let documents = (0..docs)
            .map(|i| DocumentMeta {
                id: Uuid::new_v4(),
                title: format!("d{}", i),
                kind: DocumentKind::PersonRef,
                group_id: None,
                position: i,
                remote_file_id: None,
                word_count: if i == 0 { words } else { 0 },
                last_known_remote_modified_at: None,
                updated_at: Utc::now(),
            })
            .collect();
        MetadataCandidate {
            file_id: file_id.to_string(),
            modified_at: Utc::now() - chrono::Duration::seconds(age_secs),
            metadata: StoryMetadata { groups: vec![], documents },
        }
    }

    #[test]
    fn test_winner_is_record_with_most_documents() {
        let candidates = vec![candidate("a", 1, 10, 0), candidate("b", 3, 5, 100)];
        let (winner, deletable) = pick_metadata_winner(&candidates).unwrap();
        assert_eq!(winner, 1);
        assert_eq!(deletable, vec!["a".to_string()]);
    }

    #[test]
    fn test_empty_winner_deletes_nothing() {
        let candidates = vec![candidate("a", 0, 0, 0), candidate("b", 0, 0, 100)];
        let (_, deletable) = pick_metadata_winner(&candidates).unwrap();
        assert!(deletable.is_empty());
    }

    #[test]
    fn test_document_count_ties_break_on_words_then_recency() {
        let candidates = vec![candidate("a", 2, 50, 100), candidate("b", 2, 50, 0)];
        let (winner, _) = pick_metadata_winner(&candidates).unwrap();
        assert_eq!(winner, 1, "more recently modified record wins the tie");
    }

    /// Delegates to a [`MemoryRemote`] but holds every write long enough for
    /// another persist request to land mid-flight
    struct SlowRemote(Arc<MemoryRemote>);

    #[async_trait::async_trait]
    impl RemoteStore for SlowRemote {
        async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
            self.0.list(folder_id).await
        }
        async fn read(&self, file_id: &str) -> Result<RemoteContent, RemoteError> {
            self.0.read(file_id).await
        }
        async fn stat(&self, file_id: &str) -> Result<RemoteAttributes, RemoteError> {
            self.0.stat(file_id).await
        }
        async fn write(
            &self,
            name: &str,
            content: &str,
            existing_file_id: Option<&str>,
            parent_folder_id: &str,
            content_type: &str,
        ) -> Result<String, RemoteError> {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            self.0
                .write(name, content, existing_file_id, parent_folder_id, content_type)
                .await
        }
        async fn rename(&self, file_id: &str, new_name: &str) -> Result<(), RemoteError> {
            self.0.rename(file_id, new_name).await
        }
        async fn delete(&self, file_id: &str) -> Result<(), RemoteError> {
            self.0.delete(file_id).await
        }
        async fn create_folder(
            &self,
            name: &str,
            parent_folder_id: &str,
        ) -> Result<String, RemoteError> {
            self.0.create_folder(name, parent_folder_id).await
        }
        async fn check_review_artifacts(
            &self,
            file_id: &str,
        ) -> Result<crate::store::ReviewArtifacts, RemoteError> {
            self.0.check_review_artifacts(file_id).await
        }
    }

    #[tokio::test]
    async fn test_persist_requested_mid_write_still_lands_latest_snapshot() {
        let mem = Arc::new(MemoryRemote::new());
        let store = Arc::new(Mutex::new(DocumentStore::new("Story".into())));
        let writer = Arc::new(MetadataWriter::new(
            Arc::clone(&store),
            Arc::new(SlowRemote(Arc::clone(&mem))),
        ));
        writer.attach("root".into(), None);

        let first = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.persist().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The first write is still in flight; this request must not be lost
        store
            .lock()
            .unwrap()
            .insert_document(Document::new("Ada".into(), DocumentKind::PersonRef, None))
            .unwrap();
        writer.persist().await;

        first.await.unwrap();
        let content = mem.file_content(&writer.file_id().unwrap()).unwrap();
        assert!(content.contains("Ada"), "trailing write carries the newest snapshot");
    }

    #[tokio::test]
    async fn test_persist_recreates_record_deleted_out_of_band() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(Mutex::new(DocumentStore::new("Story".into())));
        let writer = MetadataWriter::new(store, remote.clone());
        writer.attach("root".into(), None);

        writer.persist().await;
        let first_id = writer.file_id().unwrap();

        remote.delete_out_of_band(&first_id);
        writer.persist().await;
        let second_id = writer.file_id().unwrap();
        assert_ne!(first_id, second_id);
        assert!(remote.file_content(&second_id).is_some());
    }
}
