use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{Document, DocumentKind, Group};

use super::metadata::{DocumentMeta, StoryMetadata};

/// One live file from a folder listing
#[derive(Debug, Clone)]
pub struct LiveFile {
    pub id: String,
    pub name: String,
    pub modified_at: DateTime<Utc>,
}

/// A live chapter subfolder and its files
#[derive(Debug, Clone)]
pub struct LiveChapterFolder {
    pub folder_id: String,
    pub name: String,
    pub files: Vec<LiveFile>,
}

/// The live folder listing, grouped by category.
///
/// Folders whose listing failed are simply absent; the merge proceeds with
/// whatever was retrieved.
#[derive(Debug, Clone, Default)]
pub struct LiveListing {
    pub chapter_folders: Vec<LiveChapterFolder>,
    pub references: Vec<(DocumentKind, Vec<LiveFile>)>,
}

impl LiveListing {
    fn reference_files(&self, kind: DocumentKind) -> &[LiveFile] {
        self.references
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, files)| files.as_slice())
            .unwrap_or(&[])
    }
}

/// Result of reconciling the metadata record with the live listing
#[derive(Debug)]
pub struct MergeOutcome {
    /// Groups in final display order
    pub groups: Vec<Group>,
    /// Documents in final display order (survivors first, new appended)
    pub documents: Vec<Document>,
    /// Metadata documents dropped as stale or superseded
    pub rejected: Vec<Uuid>,
}

/// Filename minus its extension
pub fn title_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Pairing of existing documents with live files inside one container
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// (document id, index into `files`)
    pub pairs: Vec<(Uuid, usize)>,
    /// Indices of files with no existing document
    pub unmatched_files: Vec<usize>,
    /// Ids of documents with no live file
    pub unmatched_documents: Vec<Uuid>,
}

/// Two-phase document/file matcher, pure for testability.
///
/// Phase 1 pairs by exact `remote_file_id`. Phase 2 pairs remaining
/// documents that have no `remote_file_id` yet by case-insensitive title
/// against still-unclaimed files — a document that already owns a file id
/// never adopts a different file. When several files carry the same title,
/// the one with the earliest modified-time wins (ties broken by file id),
/// so the pairing is deterministic.
pub fn match_documents(candidates: &[&DocumentMeta], files: &[LiveFile]) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut claimed: HashSet<usize> = HashSet::new();

    // Phase 1: exact remote id
    for doc in candidates {
        if let Some(remote_id) = &doc.remote_file_id {
            if let Some(index) = files
                .iter()
                .position(|f| &f.id == remote_id)
                .filter(|i| !claimed.contains(i))
            {
                claimed.insert(index);
                outcome.pairs.push((doc.id, index));
            } else {
                outcome.unmatched_documents.push(doc.id);
            }
        }
    }

    // Phase 2: case-insensitive title, only for documents not yet bound to
    // a remote file
    for doc in candidates {
        if doc.remote_file_id.is_some() {
            continue;
        }
        let title = doc.title.to_lowercase();
        let best = files
            .iter()
            .enumerate()
            .filter(|(i, f)| {
                !claimed.contains(i) && title_stem(&f.name).to_lowercase() == title
            })
            .min_by(|(_, a), (_, b)| (a.modified_at, &a.id).cmp(&(b.modified_at, &b.id)));
        match best {
            Some((index, _)) => {
                claimed.insert(index);
                outcome.pairs.push((doc.id, index));
            }
            None => outcome.unmatched_documents.push(doc.id),
        }
    }

    for index in 0..files.len() {
        if !claimed.contains(&index) {
            outcome.unmatched_files.push(index);
        }
    }
    outcome
}

/// Reconcile the persisted metadata record (authoritative for structure and
/// ordering) with the live folder listing (authoritative for content) into
/// one canonical `(groups, documents)` pair.
pub fn merge(metadata: &StoryMetadata, listing: &LiveListing) -> MergeOutcome {
    let mut rejected: Vec<Uuid> = Vec::new();

    // Group set: persisted order wins; a lost/empty metadata record is
    // recovered by synthesizing one group per live subfolder.
    let mut groups: Vec<Group> = if metadata.groups.is_empty() {
        listing
            .chapter_folders
            .iter()
            .map(|folder| {
                let mut group = Group::new(folder.name.clone());
                group.remote_folder_id = Some(folder.folder_id.clone());
                group
            })
            .collect()
    } else {
        let mut groups: Vec<Group> = metadata
            .groups
            .iter()
            .cloned()
            .map(|g| g.into_group())
            .collect();

        // Attach live folders: by folder id first, then by title for groups
        // not yet bound to a folder; leftovers become new groups at the end.
        let mut claimed: HashSet<usize> = HashSet::new();
        for group in groups.iter() {
            if let Some(folder_id) = &group.remote_folder_id {
                if let Some(index) = listing
                    .chapter_folders
                    .iter()
                    .position(|f| &f.folder_id == folder_id)
                {
                    claimed.insert(index);
                }
            }
        }
        for group in groups.iter_mut() {
            if group.remote_folder_id.is_some() {
                continue;
            }
            let title = group.title.to_lowercase();
            if let Some(index) = listing
                .chapter_folders
                .iter()
                .enumerate()
                .position(|(i, f)| !claimed.contains(&i) && f.name.to_lowercase() == title)
            {
                claimed.insert(index);
                group.remote_folder_id = Some(listing.chapter_folders[index].folder_id.clone());
            }
        }
        for (index, folder) in listing.chapter_folders.iter().enumerate() {
            if !claimed.contains(&index) {
                let mut group = Group::new(folder.name.clone());
                group.remote_folder_id = Some(folder.folder_id.clone());
                groups.push(group);
            }
        }
        groups
    };

    if metadata.groups.is_empty() && !groups.is_empty() {
        log::info!(
            "Merge: metadata had no groups, synthesized {} from folder structure",
            groups.len(),
        );
    }

    let mut documents: Vec<Document> = Vec::new();
    let mut appended: Vec<Document> = Vec::new();

    // Chapters, per group
    let known_group_ids: HashSet<Uuid> = groups.iter().map(|g| g.id).collect();
    for group in groups.iter_mut() {
        let candidates: Vec<&DocumentMeta> = metadata
            .documents
            .iter()
            .filter(|d| d.kind.is_chapter() && d.group_id == Some(group.id))
            .collect();
        let files: &[LiveFile] = group
            .remote_folder_id
            .as_ref()
            .and_then(|folder_id| {
                listing
                    .chapter_folders
                    .iter()
                    .find(|f| &f.folder_id == folder_id)
            })
            .map(|f| f.files.as_slice())
            .unwrap_or(&[]);

        let (survivors, new_docs, dropped) =
            resolve_container(&candidates, files, DocumentKind::Chapter, Some(group.id));
        rejected.extend(dropped);

        // Within-group ordering: persisted order for surviving ids, new
        // files appended at the end — never re-sorted.
        let mut ordered = order_by_persisted(survivors, &group.document_ids);
        ordered.extend(new_docs);
        group.document_ids = ordered.iter().map(|d| d.id).collect();
        for (position, doc) in ordered.iter_mut().enumerate() {
            doc.position = position;
        }
        documents.extend(ordered);
    }

    // A chapter pointing at a group that no longer exists cannot be kept
    // without breaking the chapter/group invariant.
    for doc in metadata
        .documents
        .iter()
        .filter(|d| d.kind.is_chapter())
        .filter(|d| d.group_id.map(|g| !known_group_ids.contains(&g)).unwrap_or(true))
    {
        log::warn!("Merge: dropping chapter '{}' with unknown group", doc.title);
        rejected.push(doc.id);
    }

    // Reference documents, per kind
    for kind in DocumentKind::reference_kinds() {
        let candidates: Vec<&DocumentMeta> = metadata
            .documents
            .iter()
            .filter(|d| d.kind == kind)
            .collect();
        let files = listing.reference_files(kind);
        let (survivors, new_docs, dropped) = resolve_container(&candidates, files, kind, None);
        rejected.extend(dropped);

        let persisted_order: Vec<Uuid> = candidates.iter().map(|d| d.id).collect();
        let mut ordered = order_by_persisted(survivors, &persisted_order);
        ordered.extend(new_docs);
        for (position, doc) in ordered.iter_mut().enumerate() {
            doc.position = position;
        }
        appended.extend(ordered);
    }
    documents.extend(appended);

    // Group positions follow final order
    for (position, group) in groups.iter_mut().enumerate() {
        group.position = position;
    }

    if !rejected.is_empty() {
        log::info!("Merge: rejected {} stale document(s)", rejected.len());
    }
    log::info!(
        "Merge: produced {} groups, {} documents",
        groups.len(),
        documents.len(),
    );

    MergeOutcome {
        groups,
        documents,
        rejected,
    }
}

/// Match one container's documents against its live files and build the
/// resulting document set: (survivors, synthesized-new, dropped ids)
fn resolve_container(
    candidates: &[&DocumentMeta],
    files: &[LiveFile],
    kind: DocumentKind,
    group_id: Option<Uuid>,
) -> (Vec<Document>, Vec<Document>, Vec<Uuid>) {
    let outcome = match_documents(candidates, files);
    let mut survivors = Vec::new();
    let mut dropped = Vec::new();

    for (doc_id, file_index) in &outcome.pairs {
        let meta = candidates.iter().find(|d| d.id == *doc_id).unwrap();
        let mut doc = (*meta).clone().into_document();
        let file = &files[*file_index];
        if doc.remote_file_id.is_none() {
            log::debug!("Merge: adopting file '{}' for document '{}'", file.name, doc.title);
            doc.remote_file_id = Some(file.id.clone());
        }
        survivors.push(doc);
    }

    for doc_id in &outcome.unmatched_documents {
        let meta = candidates.iter().find(|d| d.id == *doc_id).unwrap();
        if meta.remote_file_id.is_some() {
            // A bound document whose file is not in this story's listing
            // belongs to another story's stale metadata.
            log::debug!("Merge: rejecting stale document '{}'", meta.title);
            dropped.push(meta.id);
        } else if files.is_empty() {
            // Backward compatibility: an unwritten document survives only
            // when its container has no live files at all.
            survivors.push((*meta).clone().into_document());
        } else {
            log::debug!("Merge: dropping unwritten document '{}'", meta.title);
            dropped.push(meta.id);
        }
    }

    let new_docs = outcome
        .unmatched_files
        .iter()
        .map(|index| {
            let file = &files[*index];
            let mut doc = Document::new(title_stem(&file.name).to_string(), kind, group_id);
            doc.remote_file_id = Some(file.id.clone());
            doc.last_known_remote_modified_at = Some(file.modified_at);
            doc.content_loaded = false;
            doc
        })
        .collect();

    (survivors, new_docs, dropped)
}

/// Order `docs` by the position of their ids in `persisted`; ids not in the
/// persisted order keep their relative order and go last
fn order_by_persisted(mut docs: Vec<Document>, persisted: &[Uuid]) -> Vec<Document> {
    docs.sort_by_key(|d| {
        persisted
            .iter()
            .position(|id| *id == d.id)
            .unwrap_or(usize::MAX)
    });
    docs
}
