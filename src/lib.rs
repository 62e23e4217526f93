//! Sync engine for a chapter-based writing app.
//!
//! A story lives as plain files in a cloud storage backend: one folder per
//! chapter group under `Chapters/`, flat `People/`, `Places/` and `Things/`
//! reference folders, and a `story.json` record that is authoritative for
//! structure and ordering but never for content. [`StoryEngine`] is the
//! entry point; [`remote::RemoteStore`] is the boundary a backend
//! implements.

pub mod engine;
pub mod goals;
pub mod remote;
pub mod store;
pub mod sync;

pub use engine::{StoryEngine, SwitchOutcome};
pub use goals::{Goal, GoalMode, GoalProgress};
pub use remote::{MemoryRemote, RemoteEntry, RemoteError, RemoteStore};
pub use store::{Document, DocumentKind, DocumentStore, Group, StoryTree};
pub use sync::conflict::{Conflict, ConflictResolution};
pub use sync::flush::{FlushSummary, SyncEvent};
pub use sync::loader::LoadProgress;
pub use sync::pipeline::{SaveState, SaveStatus};
pub use sync::SyncError;
