use std::env;
use std::sync::Arc;

use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{Config, LogFormat};

fn default_rust_log(level: &str) -> String {
    format!("{level},hyper=warn,h2=warn,tower=warn")
}

/// Initializes logging for the indexer.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the
/// level specified in the configuration. Additionally, this toggles
/// `RUST_BACKTRACE` based on the `enable_backtraces` config value.
pub fn init(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", default_rust_log(&config.logging.level));
    }

    let filter = EnvFilter::from_default_env();

    let format = match (config.logging.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => LogFormat::Pretty,
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => LogFormat::Simplified,
        (LogFormat::Json, _) => LogFormat::Json,
    };

    let layer = match &config.logging.file {
        None => format_layer(format, console::user_attended(), std::io::stdout),
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("opening log file");
            format_layer(format, false, Arc::new(file))
        }
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();
}

fn format_layer<W>(
    format: LogFormat,
    ansi: bool,
    writer: W,
) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_ansi(ansi).with_writer(writer);
    match format {
        LogFormat::Auto | LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Simplified => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Logs an error to the configured logger, or `stderr` if logging failed to
/// come up.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::event_enabled!(tracing::Level::ERROR) {
        tracing::error!("{error:#}");
    } else {
        eprintln!("{error:#}");
    }
}
