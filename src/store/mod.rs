//! In-memory document tree for one loaded story

mod document_store;
mod models;

pub use document_store::{DocumentStore, StoreError};
pub use models::{
    count_words, Document, DocumentKind, DocumentView, Group, GroupView, Project,
    ReviewArtifacts, StoryTree,
};
