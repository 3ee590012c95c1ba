//! Parsed view of an ELF file: sections and dynamic-linking metadata.

use std::path::{Path, PathBuf};

use object::{Object, ObjectSection};

use crate::ElfError;

// Dynamic-section tags we care about, per the ELF gABI.
const DT_NULL: i64 = 0;
const DT_NEEDED: i64 = 1;
const DT_RPATH: i64 = 15;
const DT_RUNPATH: i64 = 29;

/// The dynamic-linking metadata of one ELF file.
///
/// Only the pieces the resolver needs are retained: the absolute path, the
/// file class, the section names, and the `DT_NEEDED` / `DT_RPATH` /
/// `DT_RUNPATH` entries of the dynamic section. A statically linked
/// executable simply has all three lists empty.
#[derive(Debug, Clone)]
pub struct ElfInfo {
    /// Absolute path the file was opened from.
    pub path: PathBuf,
    /// Whether this is a 64-bit ELF (selects `lib64` for `$LIB`).
    pub is_64: bool,
    /// All section names, in file order.
    pub sections: Vec<String>,
    /// Libraries named by `DT_NEEDED`, in file order.
    pub needed: Vec<String>,
    /// Directories from `DT_RPATH`, already split on `:`.
    pub rpath: Vec<String>,
    /// Directories from `DT_RUNPATH`, already split on `:`.
    pub runpath: Vec<String>,
}

impl ElfInfo {
    /// Opens and parses the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let path = std::path::absolute(path.as_ref())?;
        let data = std::fs::read(&path)?;
        Self::parse(path, &data)
    }

    /// Parses raw file contents. `path` is recorded for `$ORIGIN` expansion.
    pub fn parse(path: PathBuf, data: &[u8]) -> Result<Self, ElfError> {
        let obj = object::File::parse(data)?;
        if !matches!(obj, object::File::Elf32(_) | object::File::Elf64(_)) {
            return Err(ElfError::NotElf);
        }

        let is_64 = obj.is_64();
        let little = obj.is_little_endian();

        let mut sections = Vec::new();
        let mut dynamic = None;
        let mut dynstr: &[u8] = &[];
        for section in obj.sections() {
            let name = section.name().unwrap_or_default().to_owned();
            match name.as_str() {
                ".dynamic" => dynamic = Some(section.data()?),
                ".dynstr" => dynstr = section.data()?,
                _ => {}
            }
            sections.push(name);
        }

        let mut needed = Vec::new();
        let mut rpath = Vec::new();
        let mut runpath = Vec::new();
        if let Some(dynamic) = dynamic {
            for (tag, value) in parse_dynamic(dynamic, is_64, little) {
                let Some(s) = str_at(dynstr, value) else {
                    continue;
                };
                match tag {
                    DT_NEEDED => needed.push(s),
                    DT_RPATH => rpath.extend(split_dirs(&s)),
                    DT_RUNPATH => runpath.extend(split_dirs(&s)),
                    _ => {}
                }
            }
        }

        Ok(ElfInfo {
            path,
            is_64,
            sections,
            needed,
            rpath,
            runpath,
        })
    }

    /// Whether the file contains a section with the given name.
    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s == name)
    }

    /// The directory containing the file, for `$ORIGIN`.
    pub fn origin(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// Decodes dynamic-section entries up to the terminating `DT_NULL`.
fn parse_dynamic(data: &[u8], is_64: bool, little: bool) -> Vec<(i64, u64)> {
    let entry_size = if is_64 { 16 } else { 8 };
    let mut entries = Vec::new();

    for chunk in data.chunks_exact(entry_size) {
        let (tag, value) = if is_64 {
            let tag = read_u64(&chunk[..8], little) as i64;
            let value = read_u64(&chunk[8..], little);
            (tag, value)
        } else {
            let tag = read_u32(&chunk[..4], little) as i32 as i64;
            let value = read_u32(&chunk[4..], little) as u64;
            (tag, value)
        };

        if tag == DT_NULL {
            break;
        }
        entries.push((tag, value));
    }

    entries
}

fn read_u64(bytes: &[u8], little: bool) -> u64 {
    let arr: [u8; 8] = bytes.try_into().expect("8-byte slice");
    if little {
        u64::from_le_bytes(arr)
    } else {
        u64::from_be_bytes(arr)
    }
}

fn read_u32(bytes: &[u8], little: bool) -> u32 {
    let arr: [u8; 4] = bytes.try_into().expect("4-byte slice");
    if little {
        u32::from_le_bytes(arr)
    } else {
        u32::from_be_bytes(arr)
    }
}

/// NUL-terminated string at `offset` in the dynamic string table.
fn str_at(dynstr: &[u8], offset: u64) -> Option<String> {
    let start = usize::try_from(offset).ok()?;
    let rest = dynstr.get(start..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Splits a `DT_RPATH`/`DT_RUNPATH` value into directories.
///
/// There is no escape character in PATH-like lists; glibc splits on bare
/// colons and so do we. Empty entries mean the current directory.
fn split_dirs(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(|d| if d.is_empty() { ".".to_owned() } else { d.to_owned() })
        .collect()
}
