//! Boundary to the cloud file-storage backend

mod adapter;
mod memory;

pub use adapter::{
    RemoteAttributes, RemoteContent, RemoteEntry, RemoteError, RemoteStore, FOLDER_MIME,
};
pub use memory::MemoryRemote;
