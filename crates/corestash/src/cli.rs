//! Exposes the command line application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::Config;
use crate::logging;
use crate::server;

const LONG_VERSION: &str = concat!(
    "version: ",
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("CORESTASH_GIT_COMMIT"),
    "\nbuilt at: ",
    env!("CORESTASH_BUILT_AT"),
);

/// Aggregates, stores, analyzes and indexes core dumps across a fleet of
/// hosts.
///
/// Options given on the command line take precedence over the
/// configuration file, which takes precedence over the built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "corestash",
    version = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION,
)]
struct Cli {
    /// Address to listen to.
    #[arg(long, value_name = "HOST:PORT")]
    bind: Option<String>,

    /// Directory to store the data into.
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Directory holding the web UI assets.
    #[arg(long = "assets-dir", value_name = "DIR")]
    assets_dir: Option<PathBuf>,

    /// Path of the file to log into ("-" for stdout).
    #[arg(long, value_name = "FILE")]
    filelog: Option<PathBuf>,

    /// Histogram buckets for the received core sizes, in megabytes.
    #[arg(long = "size-buckets", value_name = "MB,MB,...", value_delimiter = ',')]
    size_buckets: Option<Vec<f64>>,

    /// Duration to keep cores in the index and the store ("0" to disable).
    #[arg(long = "retention-duration", value_name = "DURATION")]
    retention_duration: Option<humantime::Duration>,

    /// Type of index to use.
    #[arg(long = "index-type", value_name = "TYPE")]
    index_type: Option<String>,

    /// Type of store to use.
    #[arg(long = "store-type", value_name = "TYPE")]
    store_type: Option<String>,

    /// Analyzer command for C-ish cores (whitespace-separated argv).
    #[arg(long = "c.analyzer", value_name = "COMMAND")]
    c_analyzer: Option<String>,

    /// Analyzer command for Go cores (whitespace-separated argv).
    #[arg(long = "go.analyzer", value_name = "COMMAND")]
    go_analyzer: Option<String>,

    /// Configuration file to load.
    #[arg(long = "conf", short = 'c', value_name = "FILE")]
    conf: Option<PathBuf>,
}

impl Cli {
    /// Overlays the command line options onto the loaded configuration.
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(assets_dir) = self.assets_dir {
            config.assets_dir = Some(assets_dir);
        }
        if let Some(filelog) = self.filelog {
            // "-" keeps the default stdout logger, matching core_pattern
            // conventions elsewhere on the CLI.
            config.logging.file = (filelog != PathBuf::from("-")).then_some(filelog);
        }
        if let Some(size_buckets) = self.size_buckets {
            config.size_buckets = size_buckets;
        }
        if let Some(retention) = self.retention_duration {
            config.retention_duration = retention.into();
        }
        if let Some(index_type) = self.index_type {
            config.index_type = index_type;
        }
        if let Some(store_type) = self.store_type {
            config.store_type = store_type;
        }
        if let Some(c_analyzer) = self.c_analyzer {
            config.analyzers.c = split_command(&c_analyzer);
        }
        if let Some(go_analyzer) = self.go_analyzer {
            config.analyzers.go = split_command(&go_analyzer);
        }
    }
}

/// Splits a flag value into argv tokens. Templates with paths containing
/// whitespace belong in the configuration file, where they are real lists.
fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        Config::get(cli.conf.as_deref()).context("failed loading config")?;
    cli.apply(&mut config);

    logging::init(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "corestash starting");

    server::run(config).context("failed to run the server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_config() {
        let cli = Cli::parse_from([
            "corestash",
            "--bind",
            "0.0.0.0:2000",
            "--retention-duration",
            "7d",
            "--c.analyzer",
            "gdb --batch {executable} {core}",
        ]);

        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.bind, "0.0.0.0:2000");
        assert_eq!(
            config.retention_duration,
            std::time::Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(
            config.analyzers.c,
            vec!["gdb", "--batch", "{executable}", "{core}"]
        );
        // Untouched values keep their defaults.
        assert_eq!(config.index_type, "sqlite");
    }

    #[test]
    fn filelog_dash_means_stdout() {
        let cli = Cli::parse_from(["corestash", "--filelog", "-"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(config.logging.file.is_none());
    }
}
