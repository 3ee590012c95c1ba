use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::analysis;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other).
    Auto,
    /// With colors.
    Pretty,
    /// Simplified log output.
    Simplified,
    /// Dump out JSON lines.
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The default log level when `RUST_LOG` is not set.
    pub level: String,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
    /// Log into this file instead of standard output.
    pub file: Option<PathBuf>,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: "info".to_owned(),
            format: LogFormat::Auto,
            enable_backtraces: true,
            file: None,
        }
    }
}

/// Per-language analyzer command templates, as argv token lists.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Analyzers {
    #[serde(rename = "c.analyzer")]
    pub c: Vec<String>,
    #[serde(rename = "go.analyzer")]
    pub go: Vec<String>,
}

impl Default for Analyzers {
    fn default() -> Self {
        let tokens = |t: &[&str]| t.iter().map(|s| s.to_string()).collect();
        Analyzers {
            c: tokens(analysis::DEFAULT_C_ANALYZER),
            go: tokens(analysis::DEFAULT_GO_ANALYZER),
        }
    }
}

/// The indexer configuration.
///
/// Values are resolved command line over configuration file over defaults;
/// the merge with the command line happens in [`crate::cli`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP server to.
    pub bind: String,

    /// Directory holding the store, the index and the analyzer scripts.
    pub data_dir: PathBuf,

    /// Directory holding the web UI assets, if any.
    pub assets_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Histogram buckets for received core sizes, in megabytes.
    pub size_buckets: Vec<f64>,

    /// Age after which cores are reaped. Zero disables the sweep.
    #[serde(with = "humantime_serde")]
    pub retention_duration: Duration,

    /// Which index implementation to use.
    pub index_type: String,

    /// Which store implementation to use.
    pub store_type: String,

    /// Analyzer command templates keyed by language.
    pub analyzers: Analyzers,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "localhost:1105".to_owned(),
            data_dir: PathBuf::from("/var/lib/corestash"),
            assets_dir: None,
            logging: Logging::default(),
            size_buckets: vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0],
            retention_duration: Duration::ZERO,
            index_type: "sqlite".to_owned(),
            store_type: "file".to_owned(),
            analyzers: Analyzers::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                std::fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_yaml::from_reader(reader).context("failed to parse YAML")
    }
}
