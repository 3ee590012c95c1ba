//! The filesystem-backed store.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::{Store, StoreError};

/// Store keeping every blob as a plain file under its own namespace
/// directory.
///
/// ```text
/// <root>/
///   cores/<uid>
///   executables/<hash>
///   links/<hash>/<name>
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store rooted at `root`, creating the namespace directories
    /// if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = FileStore { root: root.into() };
        for dir in [
            store.root.clone(),
            store.root.join("cores"),
            store.root.join("executables"),
            store.root.join("links"),
        ] {
            make_dir(&dir)?;
        }
        Ok(store)
    }

    fn cores(&self) -> PathBuf {
        self.root.join("cores")
    }

    fn executables(&self) -> PathBuf {
        self.root.join("executables")
    }

    fn links(&self, hash: &str) -> PathBuf {
        self.root.join("links").join(hash)
    }

    fn write(&self, path: &Path, src: &mut dyn Read) -> Result<u64, StoreError> {
        let mut file = File::create(path)?;
        let written = io::copy(src, &mut file)?;
        Ok(written)
    }
}

/// Keys become file names verbatim, so anything that would escape the
/// namespace directory is rejected.
fn checked(name: &str) -> Result<&str, StoreError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(name)
}

fn make_dir(path: &Path) -> Result<(), StoreError> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o774);
    }
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Store for FileStore {
    fn put_core(&self, uid: &str, src: &mut dyn Read) -> Result<u64, StoreError> {
        self.write(&self.cores().join(checked(uid)?), src)
    }

    fn core(&self, uid: &str) -> Result<File, StoreError> {
        File::open(self.cores().join(checked(uid)?)).map_err(StoreError::from_io)
    }

    fn core_path(&self, uid: &str) -> PathBuf {
        self.cores().join(uid)
    }

    fn delete_core(&self, uid: &str) -> Result<(), StoreError> {
        fs::remove_file(self.cores().join(checked(uid)?)).map_err(StoreError::from_io)
    }

    fn put_executable(&self, hash: &str, src: &mut dyn Read) -> Result<u64, StoreError> {
        self.write(&self.executables().join(checked(hash)?), src)
    }

    fn executable(&self, hash: &str) -> Result<File, StoreError> {
        File::open(self.executables().join(checked(hash)?)).map_err(StoreError::from_io)
    }

    fn executable_path(&self, hash: &str) -> PathBuf {
        self.executables().join(hash)
    }

    fn executable_exists(&self, hash: &str) -> Result<bool, StoreError> {
        match fs::metadata(self.executables().join(checked(hash)?)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn stat_executable(&self, hash: &str) -> Result<u64, StoreError> {
        fs::metadata(self.executables().join(checked(hash)?))
            .map(|meta| meta.len())
            .map_err(StoreError::from_io)
    }

    fn delete_executable(&self, hash: &str) -> Result<(), StoreError> {
        fs::remove_file(self.executables().join(checked(hash)?)).map_err(StoreError::from_io)
    }

    fn put_link(&self, hash: &str, name: &str, src: &mut dyn Read) -> Result<u64, StoreError> {
        let dir = self.links(checked(hash)?);
        make_dir(&dir)?;
        self.write(&dir.join(checked(name)?), src)
    }

    fn link(&self, hash: &str, name: &str) -> Result<File, StoreError> {
        File::open(self.links(checked(hash)?).join(checked(name)?)).map_err(StoreError::from_io)
    }

    fn delete_links(&self, hash: &str) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.links(checked(hash)?)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}
