//! Ingestion of one core dump upload.
//!
//! The request body is a concatenation of independent gzip streams:
//!
//! 1. the JSON [`UploadHeader`],
//! 2. the core dump,
//! 3. the executable, when the header says it is included,
//! 4. one stream per resolved library, in the order of the header's `links`.
//!
//! Each segment ends at its own gzip trailer. Decoding uses one
//! [`GzDecoder`] per segment over a shared [`BufReader`]: the decoder stops
//! at the end of its member and leaves the underlying reader positioned at
//! the start of the next one, which is the same trick the forwarder's
//! single-pass encoder relies on.
//!
//! The pipeline is strictly sequential and short-circuits on the first
//! error. A failure after the core was stored leaves the file on disk but
//! un-indexed; startup scans will not pick it up and an operator can remove
//! it. Nothing is ever indexed for a failed upload.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use corestash_common::{Coredump, UploadHeader};
use flate2::bufread::GzDecoder;

use crate::index::Index;
use crate::store::Store;

/// Runs the whole ingestion pipeline for one request body.
///
/// On success the returned document is already indexed; the caller is
/// responsible for enqueueing it for analysis.
pub fn process(
    body: impl Read,
    uid: String,
    store: &dyn Store,
    index: &dyn Index,
    indexer_version: &str,
) -> Result<Coredump> {
    let mut body = BufReader::new(body);

    let header = read_header(&mut body).context("reading header")?;
    let mut core = new_coredump(uid, &header, indexer_version);

    core.size = store
        .put_core(&core.uid, &mut segment(&mut body))
        .context("reading core")?;

    // The executable is only in the body when the forwarder didn't find it
    // on the server already; otherwise the stored blob provides the size.
    core.executable_size = if header.include_executable {
        store
            .put_executable(&core.executable_hash, &mut segment(&mut body))
            .context("reading executable")?
    } else {
        store
            .stat_executable(&core.executable_hash)
            .context("locating known executable")?
    };

    for link in header.links.iter().filter(|link| link.shipped()) {
        store
            .put_link(&core.executable_hash, &link.name, &mut segment(&mut body))
            .with_context(|| format!("reading link {:?}", link.name))?;
    }

    index.index(&core).context("indexing core")?;

    Ok(core)
}

/// Decodes the next gzip segment of the body.
fn segment<R: BufRead>(body: &mut R) -> GzDecoder<&mut R> {
    GzDecoder::new(body)
}

fn read_header<R: BufRead>(body: &mut R) -> Result<UploadHeader> {
    // The segment is drained fully (not just until the end of the JSON
    // value) so the reader ends up at the next gzip member.
    let mut raw = Vec::new();
    segment(body)
        .read_to_end(&mut raw)
        .context("decompressing")?;
    serde_json::from_slice(&raw).context("parsing")
}

/// The indexed document as derived from the header.
///
/// The executable hash is taken from the header as-is; the streamed bytes
/// are not re-hashed, so a misbehaving forwarder can make hash and content
/// diverge. Known limitation.
fn new_coredump(uid: String, header: &UploadHeader, indexer_version: &str) -> Coredump {
    Coredump {
        uid,
        dumped_at: header.dumped_at,
        hostname: header.hostname.clone(),
        executable: basename(&header.executable_path),
        executable_path: header.executable_path.clone(),
        executable_hash: header.executable_hash.clone(),
        executable_size: 0,
        size: 0,
        lang: None,
        trace: None,
        analyzed: false,
        analyzed_at: None,
        metadata: header.metadata.clone(),
        forwarder_version: header.forwarder_version.clone(),
        indexer_version: indexer_version.to_owned(),
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}
