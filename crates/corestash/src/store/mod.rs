//! Persistent storage for core dumps, executables and shared libraries.
//!
//! The store is one of the two narrow capability sets of the indexer (the
//! other being [`crate::index`]): a content-addressed blob store with three
//! namespaces. Cores are keyed by uid, executables by the SHA-1 of their
//! bytes, and shared libraries by `(executable hash, base name)` since
//! libraries are scoped to the executable that declared them.
//!
//! All operations are blocking I/O and safe for concurrent callers on
//! distinct keys. Two concurrent writes of the same executable hash carry
//! identical bytes by the hash precondition, so the last writer winning is
//! harmless and no locking is needed.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;

mod filesystem;

pub use filesystem::FileStore;

/// Errors produced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested entry does not exist.
    #[error("no such entry")]
    NotFound,

    /// The caller supplied a key that cannot name an entry.
    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Maps `io::ErrorKind::NotFound` onto the dedicated variant.
    fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Blob storage for everything the indexer persists besides the index
/// itself.
///
/// Writes stream from the reader to the backing medium; a failure partway
/// may leave a partial entry behind, which callers treat as fatal for the
/// request that produced it. Deletions of absent entries report
/// [`StoreError::NotFound`]; cleanup treats that as success.
pub trait Store: Send + Sync {
    fn put_core(&self, uid: &str, src: &mut dyn Read) -> Result<u64, StoreError>;
    fn core(&self, uid: &str) -> Result<File, StoreError>;
    /// Local filesystem path of a stored core, for external debuggers.
    fn core_path(&self, uid: &str) -> PathBuf;
    fn delete_core(&self, uid: &str) -> Result<(), StoreError>;

    fn put_executable(&self, hash: &str, src: &mut dyn Read) -> Result<u64, StoreError>;
    fn executable(&self, hash: &str) -> Result<File, StoreError>;
    /// Local filesystem path of a stored executable, for external debuggers.
    fn executable_path(&self, hash: &str) -> PathBuf;
    fn executable_exists(&self, hash: &str) -> Result<bool, StoreError>;
    /// Size in bytes of a stored executable.
    fn stat_executable(&self, hash: &str) -> Result<u64, StoreError>;
    fn delete_executable(&self, hash: &str) -> Result<(), StoreError>;

    fn put_link(&self, hash: &str, name: &str, src: &mut dyn Read) -> Result<u64, StoreError>;
    fn link(&self, hash: &str, name: &str) -> Result<File, StoreError>;
    /// Removes every stored library of the given executable.
    fn delete_links(&self, hash: &str) -> Result<(), StoreError>;
}

/// Opens the store implementation selected by `kind`.
///
/// This is the extension point for alternative backends; `file` is the only
/// one shipped today.
pub fn open(kind: &str, root: &Path) -> anyhow::Result<Arc<dyn Store>> {
    match kind {
        "file" => Ok(Arc::new(FileStore::open(root)?)),
        _ => bail!("unknown store type {kind:?}"),
    }
}
