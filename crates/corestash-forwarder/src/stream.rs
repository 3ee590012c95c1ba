//! The upload body: a lazy concatenation of independent gzip streams.
//!
//! Dumps can measure in gigabytes, so nothing is buffered whole: each
//! segment is compressed on the fly as the HTTP client pulls bytes, and the
//! request goes out with chunked transfer encoding. The indexer decodes the
//! segments one gzip member at a time, in the same order they are appended
//! here: header, core, optional executable, then one segment per shipped
//! link.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use corestash_common::{Link, UploadHeader};
use flate2::read::GzEncoder;
use flate2::Compression;

type Segment = Box<dyn Read + Send>;

pub struct UploadBody {
    pending: VecDeque<Segment>,
    current: Option<GzEncoder<Segment>>,
}

impl UploadBody {
    /// Assembles the body for one upload.
    ///
    /// Files are opened up front so a vanished library fails the upload
    /// before anything is sent, rather than truncating the stream halfway.
    pub fn new(
        header: &UploadHeader,
        core: Segment,
        executable: Option<&Path>,
        links: &[Link],
    ) -> Result<Self> {
        let mut pending: VecDeque<Segment> = VecDeque::new();

        let raw = serde_json::to_vec(header).context("encoding header")?;
        pending.push_back(Box::new(Cursor::new(raw)));
        pending.push_back(core);

        if let Some(path) = executable {
            let file = File::open(path)
                .with_context(|| format!("opening executable {}", path.display()))?;
            pending.push_back(Box::new(file));
        }

        for link in links.iter().filter(|link| link.shipped()) {
            let file = File::open(&link.path)
                .with_context(|| format!("opening library {}", link.path))?;
            pending.push_back(Box::new(file));
        }

        Ok(UploadBody {
            pending,
            current: None,
        })
    }
}

impl Read for UploadBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(encoder) = &mut self.current {
                let n = encoder.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                // Segment exhausted, trailer included; move on.
                self.current = None;
            }

            match self.pending.pop_front() {
                Some(segment) => {
                    self.current = Some(GzEncoder::new(segment, Compression::default()));
                }
                None => return Ok(0),
            }
        }
    }
}
