//! Corestash forwarder.
//!
//! Invoked by the kernel once per crash (via `core_pattern`), with the core
//! dump on standard input. It hashes the crashed executable, asks the
//! indexer whether that binary is already known, resolves the shared
//! libraries the executable would load, and streams everything to the
//! indexer as one compressed multi-segment upload.

#![warn(clippy::all)]

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use corestash_common::{ApiError, Link, UploadHeader};
use corestash_elf::Resolver;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha1::{Digest as _, Sha1};

use crate::settings::Settings;
use crate::stream::UploadBody;

mod settings;
mod stream;

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            tracing::error!("{error:#}");
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let settings = Settings::get()?;
    init_logging(&settings.filelog);
    tracing::debug!(executable = settings.executable, "starting");

    let dumped_at = DateTime::from_timestamp(settings.timestamp, 0)
        .context("timestamp out of range")?;
    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let client = Client::new();

    // Hashing or lookup failing must not lose the dump: fall back to
    // shipping the executable as if it were unknown.
    let mut include_executable = true;
    let mut executable_hash = String::new();
    match hash_executable(&settings.executable) {
        Err(err) => tracing::error!("hashing executable: {err:#}"),
        Ok(hash) => {
            match lookup_executable(&client, &settings.dest, &hash) {
                Err(err) => tracing::error!("looking up executable: {err:#}"),
                Ok(found) => include_executable = !found,
            }
            executable_hash = hash;
        }
    }

    // Libraries only matter when the indexer does not have the executable
    // yet; they are scoped to it on the server.
    let mut links: Vec<Link> = Vec::new();
    if include_executable {
        match Resolver::from_env().resolve_links(&settings.executable) {
            Ok(resolved) => links = resolved,
            Err(err) => tracing::error!("resolving imported libraries: {err:#}"),
        }
    }

    let header = UploadHeader {
        dumped_at,
        hostname,
        executable_path: settings.executable.clone(),
        executable_hash,
        include_executable,
        metadata: settings.metadata.clone(),
        forwarder_version: env!("CARGO_PKG_VERSION").to_owned(),
        links: links.clone(),
    };

    let core: Box<dyn Read + Send> = if settings.src == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(
            File::open(&settings.src)
                .with_context(|| format!("opening core dump {}", settings.src))?,
        )
    };

    let executable_path = include_executable.then(|| PathBuf::from(&settings.executable));
    let body = UploadBody::new(&header, core, executable_path.as_deref(), &links)
        .context("assembling upload")?;

    tracing::debug!("sending request");
    send(&client, &settings.dest, body).context("sending core")?;
    tracing::debug!("done");

    Ok(())
}

fn init_logging(filelog: &Option<PathBuf>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);

    match filelog {
        None => builder.init(),
        Some(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => builder.with_writer(Arc::new(file)).init(),
            Err(err) => {
                builder.init();
                tracing::error!("opening log file {}: {err}", path.display());
            }
        },
    }
}

fn hash_executable(path: &str) -> Result<String> {
    let mut file = File::open(path).context("opening executable")?;
    let mut hasher = Sha1::new();
    std::io::copy(&mut file, &mut hasher).context("hashing executable")?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Asks the indexer whether it already stores the executable.
fn lookup_executable(client: &Client, dest: &str, hash: &str) -> Result<bool> {
    let response = client
        .head(format!("{dest}/executables/{hash}"))
        .send()
        .context("executing request")?;

    match response.status() {
        StatusCode::OK => Ok(true),
        StatusCode::NOT_FOUND => Ok(false),
        status => bail!("unexpected response status {status}"),
    }
}

fn send(client: &Client, dest: &str, body: UploadBody) -> Result<()> {
    let response = client
        .post(format!("{dest}/cores"))
        .body(reqwest::blocking::Body::new(body))
        .send()
        .context("executing request")?;

    if response.status() != StatusCode::OK {
        let status = response.status();
        let detail = response
            .json::<ApiError>()
            .map(|err| err.error)
            .unwrap_or_else(|_| "no error detail".to_owned());
        bail!("unexpected response status {status}: {detail}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_matches_known_vectors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bin");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            hash_executable(path.to_str().unwrap()).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn hashing_missing_file_fails() {
        assert!(hash_executable("/definitely/not/here").is_err());
    }
}
