//! ELF inspection and a compact emulation of the Linux dynamic loader.
//!
//! The forwarder uses this crate to enumerate the shared libraries a crashed
//! executable would load at runtime, so it can ship them alongside the
//! executable. The indexer uses the section listing for language detection.
//!
//! The resolver is read-only and deterministic given the file contents, the
//! directories present on disk, and the environment. Nothing is dlopen'ed or
//! executed.

mod auxv;
mod expand;
mod file;
mod resolver;

pub use expand::expand;
pub use file::ElfInfo;
pub use resolver::Resolver;

/// Errors produced while inspecting ELF files or resolving libraries.
#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("reading file")]
    Io(#[from] std::io::Error),

    #[error("parsing object file")]
    Object(#[from] object::read::Error),

    #[error("not an ELF file")]
    NotElf,

    #[error("expanding path token ${0}")]
    Expand(String),
}
