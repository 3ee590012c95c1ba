//! Types shared between the corestash indexer and the forwarder.
//!
//! Everything in here crosses a process boundary: the upload header sent by
//! the forwarder, the indexed document returned by the search API, and the
//! JSON error body used by every endpoint.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The language a crashed executable was (probably) written in.
///
/// Detection is deliberately coarse: it only needs to be good enough to pick
/// the right debugger for trace extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Go,
}

impl Language {
    /// Stable identifier used for analyzer template lookup and file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared library the forwarder attempted to resolve for an executable.
///
/// The upload body contains the library file only when `found` is true and
/// `error` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Name as it appears in the executable's `DT_NEEDED` entries.
    pub name: String,
    /// Path the resolver settled on, whether or not the file exists there.
    pub path: String,
    /// Whether the file was found on the crashing host.
    pub found: bool,
    /// I/O error encountered during resolution, empty if none.
    #[serde(default)]
    pub error: String,
}

impl Link {
    /// Whether the upload body carries the file for this link.
    pub fn shipped(&self) -> bool {
        self.found && self.error.is_empty()
    }
}

/// First segment of every upload: the JSON header describing the rest of
/// the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadHeader {
    pub dumped_at: DateTime<Utc>,
    pub hostname: String,
    pub executable_path: String,
    pub executable_hash: String,
    pub include_executable: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub forwarder_version: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// One indexed core dump.
///
/// Created by the upload pipeline, mutated only by the analyzer (which fills
/// in the `lang`/`trace`/`analyzed*` fields), removed by cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coredump {
    pub uid: String,
    pub dumped_at: DateTime<Utc>,
    pub hostname: String,
    /// Base name of the crashed executable.
    pub executable: String,
    /// Absolute path of the executable on the crashing host.
    pub executable_path: String,
    pub executable_hash: String,
    pub executable_size: u64,
    /// Size of the core dump in bytes.
    pub size: u64,
    #[serde(default)]
    pub lang: Option<Language>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub forwarder_version: String,
    pub indexer_version: String,
}

/// Response body of the search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub results: Vec<Coredump>,
    /// Total number of matching documents, independent of pagination.
    pub total: u64,
}

/// Response body of the about endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct About {
    pub version: String,
    pub commit: String,
    pub built_at: String,
}

/// JSON error body returned by every endpoint on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}
