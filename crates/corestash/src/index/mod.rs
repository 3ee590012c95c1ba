//! The searchable document store over indexed core dumps.
//!
//! The index holds one document per received core, keyed by uid, and
//! answers the query-string searches behind the search API, the recovery
//! sweep (`analyzed:F*`), the retention sweep (`dumped_at:<"..."`) and
//! executable reclamation (`executable_hash:"..."`).
//!
//! Metadata is free-form: the `metadata` map of a document is flattened
//! into `meta.<key>` fields at write time so the backend only ever deals
//! with flat scalar fields, and reassembled into the map at read time. The
//! query language refers to those fields as `meta.<key>:value`.

use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use corestash_common::Coredump;

mod query;
mod sqlite;

pub use sqlite::SqliteIndex;

/// Errors produced by index implementations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// No document with the requested uid.
    #[error("document not found")]
    NotFound,

    /// The query string or sort key could not be understood.
    #[error("invalid query: {0}")]
    Query(String),

    /// The backend returned data the document model cannot hold, e.g. a
    /// non-string metadata value. Indicates a corrupted index.
    #[error("corrupted index: {0}")]
    Schema(String),

    /// Any other backend failure.
    #[error("index backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl IndexError {
    fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        IndexError::Backend(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound)
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::backend(err)
    }
}

/// Document store with query-string search.
///
/// `sort` is the sort field name, descending when prefixed with `-`. Only
/// `dumped_at` and `hostname` are sortable; handlers validate before calling.
pub trait Index: Send + Sync {
    /// Inserts or replaces the document with the coredump's uid.
    ///
    /// Write-backs from the analyzer go through here as well: the backend
    /// does not support partial updates, so callers read the full document,
    /// mutate it and index it again.
    fn index(&self, core: &Coredump) -> Result<(), IndexError>;

    fn find(&self, uid: &str) -> Result<Coredump, IndexError>;

    /// Removes the document; removing an absent document is not an error.
    fn delete(&self, uid: &str) -> Result<(), IndexError>;

    /// Runs a query-string search, returning one page of matches and the
    /// total match count independent of pagination.
    fn search(
        &self,
        query: &str,
        sort: &str,
        size: usize,
        from: usize,
    ) -> Result<(Vec<Coredump>, u64), IndexError>;
}

/// Opens the index implementation selected by `kind`.
///
/// This is the extension point for alternative backends; `sqlite` is the
/// only one shipped today.
pub fn open(kind: &str, dir: &Path) -> anyhow::Result<Arc<dyn Index>> {
    match kind {
        "sqlite" => Ok(Arc::new(SqliteIndex::open(dir)?)),
        _ => bail!("unknown index type {kind:?}"),
    }
}
