//! Removal of cores past their life and reclamation of orphaned
//! executables.

use anyhow::{Context, Result};
use corestash_common::Coredump;

use crate::index::{Index, IndexError};
use crate::store::{Store, StoreError};

/// Deletes one core: index document first, then stored files.
///
/// The order matters. Removing the index row first means a crash between
/// the steps leaves an orphaned file (a leak an operator can reclaim), not
/// a dangling document whose search hits would point at nothing.
///
/// Entries that are already gone count as removed, so a re-issued delete
/// finishes a half-cleaned core instead of failing on it.
pub fn cleanup(core: &Coredump, index: &dyn Index, store: &dyn Store) -> Result<()> {
    index
        .delete(&core.uid)
        .context("removing indexed document")?;

    ignore_missing(store.delete_core(&core.uid)).context("removing core file")?;

    if !referenced(&core.executable_hash, index).context("searching for sibling cores")? {
        ignore_missing(store.delete_executable(&core.executable_hash))
            .context("removing executable file")?;
        ignore_missing(store.delete_links(&core.executable_hash))
            .context("removing library files")?;
    }

    Ok(())
}

/// Whether any surviving document still references the executable.
fn referenced(hash: &str, index: &dyn Index) -> Result<bool, IndexError> {
    let (_, total) = index.search(
        &format!("executable_hash:\"{hash}\""),
        "dumped_at",
        0,
        0,
    )?;
    Ok(total != 0)
}

fn ignore_missing(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
