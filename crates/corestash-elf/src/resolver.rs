//! Shared-library resolution following the dynamic loader's search rules.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use corestash_common::Link;

use crate::{auxv, expand, ElfError, ElfInfo};

/// Default search directories, as compiled into the loader.
#[cfg(target_pointer_width = "64")]
const DEFAULT_DIRS: &[&str] = &["/lib64", "/usr/lib64", "/lib", "/usr/lib"];
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_DIRS: &[&str] = &["/lib", "/usr/lib"];

/// Resolves library names to paths the way `ld-linux.so` would.
///
/// The search order is described in the ld.so manual: slash-containing names
/// are paths; everything else goes through `DT_RPATH`, `LD_LIBRARY_PATH`,
/// `DT_RUNPATH`, then the default directories. `DT_RPATH` is ignored when
/// the file carries a `DT_RUNPATH`.
#[derive(Debug, Clone)]
pub struct Resolver {
    library_path: Vec<String>,
    default_dirs: Vec<String>,
}

impl Resolver {
    /// A resolver using `LD_LIBRARY_PATH` from the environment.
    pub fn from_env() -> Self {
        Self::new(std::env::var("LD_LIBRARY_PATH").ok().as_deref())
    }

    /// A resolver with an explicit `LD_LIBRARY_PATH` value.
    pub fn new(library_path: Option<&str>) -> Self {
        Resolver {
            library_path: parse_library_path(library_path),
            default_dirs: DEFAULT_DIRS.iter().map(|d| d.to_string()).collect(),
        }
    }

    /// Overrides the compile-time default directories. Test hook.
    pub fn with_default_dirs(mut self, dirs: Vec<String>) -> Self {
        self.default_dirs = dirs;
        self
    }

    /// Resolves one library name for `file`.
    ///
    /// Returns the chosen path and whether a file exists there. The path is
    /// meaningful even when nothing was found: it is the last candidate (or
    /// the bare name when no directory applied), matching what the record in
    /// the upload header reports.
    pub fn resolve(&self, file: &ElfInfo, name: &str) -> Result<(String, bool), ElfError> {
        // Names containing a slash bypass the directory search entirely.
        if name.contains('/') {
            let path = if Path::new(name).is_absolute() {
                PathBuf::from(name)
            } else {
                file.origin().join(name)
            };
            let found = exists(&path)?;
            return Ok((path.to_string_lossy().into_owned(), found));
        }

        // DT_RUNPATH shadows DT_RPATH when present.
        let (rpath, runpath): (&[String], &[String]) = if file.runpath.is_empty() {
            (&file.rpath, &[])
        } else {
            (&[], &file.runpath)
        };

        for dirs in [
            rpath,
            self.library_path.as_slice(),
            runpath,
            self.default_dirs.as_slice(),
        ] {
            for dir in dirs {
                let dir = self.expand_entry(file, dir)?;
                let path = Path::new(&dir).join(name);
                if exists(&path)? {
                    return Ok((path.to_string_lossy().into_owned(), true));
                }
            }
        }

        Ok((name.to_owned(), false))
    }

    /// Resolves the full transitive dependency set of the executable at
    /// `path`.
    ///
    /// Produces one [`Link`] per attempted name in resolution order, whether
    /// or not it was found. Dependencies of resolved libraries are appended
    /// to the work list, with a seen-set preventing cycles. A statically
    /// linked executable yields an empty list.
    pub fn resolve_links(&self, path: impl AsRef<Path>) -> Result<Vec<Link>, ElfError> {
        let file = ElfInfo::open(path)?;

        let mut seen: HashSet<String> = file.needed.iter().cloned().collect();
        let mut pending: Vec<String> = file.needed.clone();
        let mut links = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let name = pending.remove(0);

            let (path, found, error) = match self.resolve(&file, &name) {
                Ok((path, found)) => (path, found, String::new()),
                Err(err) => (name.clone(), false, err.to_string()),
            };
            let link = Link {
                name,
                path,
                found,
                error,
            };
            let usable = link.shipped();
            let resolved = link.path.clone();
            links.push(link);

            if !usable {
                continue;
            }

            // Pick up the dependencies the resolved library itself declares.
            let lib = ElfInfo::open(&resolved)?;
            for parent in lib.needed {
                if seen.insert(parent.clone()) {
                    pending.push(parent);
                }
            }
        }

        Ok(links)
    }

    fn expand_entry(&self, file: &ElfInfo, dir: &str) -> Result<String, ElfError> {
        expand(dir, |token| match token {
            "ORIGIN" => Ok(Some(file.origin().to_string_lossy().into_owned())),
            "LIB" => Ok(Some(
                if file.is_64 { "lib64" } else { "lib" }.to_owned(),
            )),
            "PLATFORM" => auxv::platform()
                .map(Some)
                .ok_or_else(|| ElfError::Expand("PLATFORM".to_owned())),
            _ => Ok(None),
        })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Existence check distinguishing "not there" from real I/O failures.
fn exists(path: &Path) -> Result<bool, ElfError> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Splits an `LD_LIBRARY_PATH` value, deduplicating and mapping empty
/// entries to the current directory.
fn parse_library_path(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if raw.is_empty() {
        return Vec::new();
    }

    let mut dirs = Vec::new();
    let mut met = HashSet::new();
    for dir in raw.split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        if met.insert(dir.to_owned()) {
            dirs.push(dir.to_owned());
        }
    }
    dirs
}
