//! Command line and configuration file handling.
//!
//! The forwarder is registered in `core_pattern`, so its positional
//! arguments follow the kernel's placeholder conventions: `%E` passes the
//! executable path with `/` replaced by `!`, `%t` the dump time as seconds
//! since the epoch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_DEST: &str = "http://localhost:1105";

/// Ships one core dump and its debugging companions to the indexer.
#[derive(Debug, Parser)]
#[command(name = "corestash-forwarder", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Address of the indexer.
    #[arg(long, value_name = "URL")]
    dest: Option<String>,

    /// Path of the core dump to send ("-" for stdin).
    #[arg(long, value_name = "FILE")]
    src: Option<String>,

    /// Metadata to send alongside the dump (key=value pairs, `;`-separated,
    /// repeatable).
    #[arg(long, value_name = "KEY=VALUE;...", action = clap::ArgAction::Append)]
    metadata: Vec<String>,

    /// Path of the file to log into ("-" for stdout).
    #[arg(long, value_name = "FILE")]
    filelog: Option<PathBuf>,

    /// Configuration file to load.
    #[arg(long = "conf", short = 'c', value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Executable path as substituted by `%E` (with `!` for `/`).
    executable: String,

    /// Dump timestamp as substituted by `%t` (seconds since the epoch).
    timestamp: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    dest: Option<String>,
    src: Option<String>,
    metadata: BTreeMap<String, String>,
    filelog: Option<PathBuf>,
}

impl ConfigFile {
    fn parse(path: &Path, explicit: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw).context("parsing configuration file"),
            // The default configuration path may simply not exist.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
                Ok(Self::default())
            }
            Err(err) => Err(err).context(format!(
                "reading configuration file {}",
                path.display()
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub dest: String,
    pub src: String,
    pub metadata: BTreeMap<String, String>,
    pub filelog: Option<PathBuf>,
    /// Executable path, `!` separators already translated back.
    pub executable: String,
    pub timestamp: i64,
}

impl Settings {
    pub fn get() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let default_conf = PathBuf::from("/etc/corestash/forwarder.conf");
        let (conf_path, explicit) = match &cli.conf {
            Some(path) => (path.clone(), true),
            None => (default_conf, false),
        };
        let file = ConfigFile::parse(&conf_path, explicit)?;

        // File entries first, command line entries override them.
        let mut metadata = file.metadata;
        for raw in &cli.metadata {
            parse_metadata(raw, &mut metadata);
        }

        let filelog = cli
            .filelog
            .or(file.filelog)
            .filter(|path| path != &PathBuf::from("-"));

        Ok(Settings {
            dest: cli
                .dest
                .or(file.dest)
                .unwrap_or_else(|| DEFAULT_DEST.to_owned()),
            src: cli.src.or(file.src).unwrap_or_else(|| "-".to_owned()),
            metadata,
            filelog,
            executable: cli.executable.replace('!', "/"),
            timestamp: cli.timestamp,
        })
    }
}

/// Parses a raw metadata flag value into the map.
///
/// Pairs are separated by `;`, keys from values by the first `=`. A pair
/// without `=` maps the key to the empty string. No escaping: the command
/// line and the configuration file already provide a quoting layer each.
fn parse_metadata(raw: &str, into: &mut BTreeMap<String, String>) {
    for pair in raw.split(';') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => into.insert(key.to_owned(), value.to_owned()),
            None => into.insert(pair.to_owned(), String::new()),
        };
    }
}
