use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::goals::Goal;

use super::models::{
    Document, DocumentKind, DocumentView, Group, GroupView, Project, ReviewArtifacts, StoryTree,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),
    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),
    #[error("A chapter document requires a group")]
    ChapterWithoutGroup,
}

/// The in-memory document tree for one loaded story.
///
/// Exclusively owned by the engine: UI code gets read-only snapshots and
/// mutates only through the operations here, so ordering and membership
/// invariants stay enforceable.
#[derive(Debug)]
pub struct DocumentStore {
    pub project: Project,
    documents: HashMap<Uuid, Document>,
    groups: HashMap<Uuid, Group>,
    pub goal: Option<Goal>,
}

impl DocumentStore {
    pub fn new(title: String) -> Self {
        Self {
            project: Project::new(title),
            documents: HashMap::new(),
            groups: HashMap::new(),
            goal: None,
        }
    }

    // ===== Lookup =====

    pub fn document(&self, id: Uuid) -> Result<&Document, StoreError> {
        self.documents.get(&id).ok_or(StoreError::DocumentNotFound(id))
    }

    pub fn group(&self, id: Uuid) -> Result<&Group, StoreError> {
        self.groups.get(&id).ok_or(StoreError::GroupNotFound(id))
    }

    pub fn contains_document(&self, id: Uuid) -> bool {
        self.documents.contains_key(&id)
    }

    /// Documents in project order
    pub fn documents_ordered(&self) -> Vec<&Document> {
        self.project
            .document_ids
            .iter()
            .filter_map(|id| self.documents.get(id))
            .collect()
    }

    /// Groups in project order
    pub fn groups_ordered(&self) -> Vec<&Group> {
        self.project
            .group_ids
            .iter()
            .filter_map(|id| self.groups.get(id))
            .collect()
    }

    /// Chapter documents of a group, in the group's order
    pub fn group_documents(&self, group_id: Uuid) -> Vec<&Document> {
        self.groups
            .get(&group_id)
            .map(|g| {
                g.document_ids
                    .iter()
                    .filter_map(|id| self.documents.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reference documents of one kind, in project order
    pub fn documents_of_kind(&self, kind: DocumentKind) -> Vec<&Document> {
        self.documents_ordered()
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect()
    }

    pub fn total_word_count(&self) -> usize {
        self.documents.values().map(|d| d.word_count).sum()
    }

    // ===== Mutation operations =====

    /// Insert a freshly created document at the end of its container
    pub fn insert_document(&mut self, mut document: Document) -> Result<Uuid, StoreError> {
        if document.kind.is_chapter() {
            let group_id = document.group_id.ok_or(StoreError::ChapterWithoutGroup)?;
            let group = self
                .groups
                .get_mut(&group_id)
                .ok_or(StoreError::GroupNotFound(group_id))?;
            document.position = group.document_ids.len();
            group.document_ids.push(document.id);
        } else {
            document.group_id = None;
            document.position = self.documents_of_kind(document.kind).len();
        }
        let id = document.id;
        self.project.document_ids.push(id);
        self.documents.insert(id, document);
        Ok(id)
    }

    /// Insert a group at the end of the project order
    pub fn insert_group(&mut self, mut group: Group) -> Uuid {
        group.position = self.project.group_ids.len();
        let id = group.id;
        self.project.group_ids.push(id);
        self.groups.insert(id, group);
        id
    }

    /// Commit new body text into a document, recounting words/chars
    pub fn commit_body(&mut self, id: Uuid, body: String) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.set_body(body);
        Ok(())
    }

    /// Record content fetched from the remote without bumping `updated_at`
    /// (a background load is not a local edit)
    pub fn apply_loaded_content(
        &mut self,
        id: Uuid,
        body: String,
        remote_modified_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.word_count = super::models::count_words(&body);
        doc.char_count = body.chars().count();
        doc.body = body;
        doc.content_loaded = true;
        doc.last_known_remote_modified_at = Some(remote_modified_at);
        Ok(())
    }

    /// Mark a document loaded without touching its body (used for documents
    /// that have no remote counterpart to fetch)
    pub fn mark_content_loaded(&mut self, id: Uuid) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.content_loaded = true;
        Ok(())
    }

    pub fn set_remote_file_id(&mut self, id: Uuid, file_id: String) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.remote_file_id = Some(file_id);
        Ok(())
    }

    pub fn clear_remote_file_id(&mut self, id: Uuid) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.remote_file_id = None;
        Ok(())
    }

    pub fn set_last_known_remote_modified(
        &mut self,
        id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.last_known_remote_modified_at = Some(at);
        Ok(())
    }

    pub fn set_review(&mut self, id: Uuid, review: ReviewArtifacts) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.review = Some(review);
        Ok(())
    }

    pub fn set_group_folder_id(&mut self, id: Uuid, folder_id: String) -> Result<(), StoreError> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or(StoreError::GroupNotFound(id))?;
        group.remote_folder_id = Some(folder_id);
        Ok(())
    }

    pub fn rename_document(&mut self, id: Uuid, title: String) -> Result<(), StoreError> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        doc.title = title;
        doc.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn rename_group(&mut self, id: Uuid, title: String) -> Result<(), StoreError> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or(StoreError::GroupNotFound(id))?;
        group.title = title;
        Ok(())
    }

    /// Remove a document from the store and every index that references it.
    /// Returns the removed document (the caller owns remote-side cleanup).
    pub fn remove_document(&mut self, id: Uuid) -> Result<Document, StoreError> {
        let doc = self
            .documents
            .remove(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        self.project.document_ids.retain(|d| *d != id);
        if self.project.active_document_id == Some(id) {
            self.project.active_document_id = None;
        }
        if let Some(group_id) = doc.group_id {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.document_ids.retain(|d| *d != id);
            }
        }
        Ok(doc)
    }

    /// Remove a group and all of its chapter documents.
    /// Returns the removed group and documents for remote-side cleanup.
    pub fn remove_group(&mut self, id: Uuid) -> Result<(Group, Vec<Document>), StoreError> {
        let group = self.groups.remove(&id).ok_or(StoreError::GroupNotFound(id))?;
        self.project.group_ids.retain(|g| *g != id);
        let mut removed = Vec::new();
        for doc_id in &group.document_ids {
            if let Some(doc) = self.documents.remove(doc_id) {
                self.project.document_ids.retain(|d| d != doc_id);
                if self.project.active_document_id == Some(*doc_id) {
                    self.project.active_document_id = None;
                }
                removed.push(doc);
            }
        }
        Ok((group, removed))
    }

    /// Replace the whole tree with a merge result, preserving the given order
    pub fn replace_tree(&mut self, groups: Vec<Group>, documents: Vec<Document>) {
        self.groups.clear();
        self.documents.clear();
        self.project.group_ids = groups.iter().map(|g| g.id).collect();
        self.project.document_ids = documents.iter().map(|d| d.id).collect();
        for group in groups {
            self.groups.insert(group.id, group);
        }
        for doc in documents {
            self.documents.insert(doc.id, doc);
        }
        if let Some(active) = self.project.active_document_id {
            if !self.documents.contains_key(&active) {
                self.project.active_document_id = None;
            }
        }
    }

    // ===== Snapshots =====

    pub fn story_tree(&self) -> StoryTree {
        let groups = self
            .groups_ordered()
            .into_iter()
            .map(|g| GroupView {
                id: g.id,
                title: g.title.clone(),
                color: g.color.clone(),
                documents: self
                    .group_documents(g.id)
                    .into_iter()
                    .map(document_view)
                    .collect(),
            })
            .collect();
        let references = self
            .documents_ordered()
            .into_iter()
            .filter(|d| !d.kind.is_chapter())
            .map(document_view)
            .collect();
        StoryTree {
            title: self.project.title.clone(),
            groups,
            references,
            active_document_id: self.project.active_document_id,
            total_word_count: self.total_word_count(),
        }
    }
}

fn document_view(d: &Document) -> DocumentView {
    DocumentView {
        id: d.id,
        title: d.title.clone(),
        kind: d.kind,
        word_count: d.word_count,
        content_loaded: d.content_loaded,
        review: d.review.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::DocumentKind;

    #[test]
    fn test_chapter_requires_group() {
        let mut store = DocumentStore::new("Story".into());
        let mut doc = Document::new(
            "Scene".into(),
            DocumentKind::Chapter,
            Some(uuid::Uuid::new_v4()),
        );
        doc.group_id = None;
        assert!(matches!(
            store.insert_document(doc),
            Err(StoreError::ChapterWithoutGroup)
        ));
    }

    #[test]
    fn test_remove_document_clears_indices() {
        let mut store = DocumentStore::new("Story".into());
        let group_id = store.insert_group(Group::new("Act I".into()));
        let doc = Document::new("Scene".into(), DocumentKind::Chapter, Some(group_id));
        let id = store.insert_document(doc).unwrap();
        store.project.active_document_id = Some(id);

        store.remove_document(id).unwrap();
        assert!(!store.contains_document(id));
        assert!(store.group(group_id).unwrap().document_ids.is_empty());
        assert!(!store.project.document_ids.contains(&id));
        assert_eq!(store.project.active_document_id, None);
    }

    #[test]
    fn test_total_word_count_sums_all_kinds() {
        let mut store = DocumentStore::new("Story".into());
        let group_id = store.insert_group(Group::new("Act I".into()));
        let chapter = Document::new("Scene".into(), DocumentKind::Chapter, Some(group_id));
        let chapter_id = store.insert_document(chapter).unwrap();
        let person = Document::new("Ada".into(), DocumentKind::PersonRef, None);
        let person_id = store.insert_document(person).unwrap();

        store.commit_body(chapter_id, "one two three".into()).unwrap();
        store.commit_body(person_id, "four five".into()).unwrap();
        assert_eq!(store.total_word_count(), 5);
    }
}
