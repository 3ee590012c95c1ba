//! Helpers for testing the pipeline and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//! - Call [`setup`] first so console output is captured by the test runner.
//! - Hold on to the [`Env`] or the returned `TempDir` for the whole test;
//!   dropping it deletes the backing directories under the store.
//! - [`Server`] binds an ephemeral port and stops serving when dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use corestash_common::{Coredump, UploadHeader};
use flate2::write::GzEncoder;
use tempfile::TempDir;

use crate::config::{Analyzers, Config};
use crate::endpoints;
use crate::index::{Index, SqliteIndex};
use crate::service::CoreService;
use crate::store::{FileStore, Store};

/// Sets up the test environment logger.
pub(crate) fn setup() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "corestash=debug".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub(crate) fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A store and an index over a scratch data directory.
pub(crate) struct Env {
    pub dir: PathBuf,
    pub store: Arc<dyn Store>,
    pub index: Arc<dyn Index>,
    _guard: Option<TempDir>,
}

pub(crate) fn env() -> Env {
    let tmp = tempdir();
    let mut env = env_at(tmp.path());
    env._guard = Some(tmp);
    env
}

/// Opens an [`Env`] over an existing data directory, using the same layout
/// the service uses. Lets tests seed state "from a previous run".
pub(crate) fn env_at(dir: &Path) -> Env {
    std::fs::create_dir_all(dir).unwrap();
    Env {
        dir: dir.to_path_buf(),
        store: Arc::new(FileStore::open(dir.join("store")).unwrap()),
        index: Arc::new(SqliteIndex::open(&dir.join("index")).unwrap()),
        _guard: None,
    }
}

/// A config suitable for tests: scratch data dir, ephemeral port, no
/// retention, no analyzers.
pub(crate) fn config(data_dir: &Path) -> Config {
    Config {
        bind: "127.0.0.1:0".to_owned(),
        data_dir: data_dir.to_path_buf(),
        analyzers: Analyzers {
            c: Vec::new(),
            go: Vec::new(),
        },
        ..Config::default()
    }
}

/// Stores and indexes one un-analyzed core with a small valid executable.
pub(crate) fn seed_core(env: &Env, uid: &str, hash: &str) -> Coredump {
    env.store.put_core(uid, &mut &b"COREDATA"[..]).unwrap();
    let elf = elf_fixture(&[".text", ".data"]);
    env.store.put_executable(hash, &mut &elf[..]).unwrap();

    let core = Coredump {
        uid: uid.to_owned(),
        dumped_at: "2020-05-01T10:00:00Z".parse().unwrap(),
        hostname: "h1".to_owned(),
        executable: "x".to_owned(),
        executable_path: "/bin/x".to_owned(),
        executable_hash: hash.to_owned(),
        executable_size: elf.len() as u64,
        size: 8,
        lang: None,
        trace: None,
        analyzed: false,
        analyzed_at: None,
        metadata: Default::default(),
        forwarder_version: "0.1.0".to_owned(),
        indexer_version: "0.3.0".to_owned(),
    };
    env.index.index(&core).unwrap();
    core
}

/// A minimal ELF with the given section names, for language detection and
/// executable fixtures.
pub(crate) fn elf_fixture(sections: &[&str]) -> Vec<u8> {
    let mut obj = object::write::Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    );
    for name in sections {
        let id = obj.add_section(
            Vec::new(),
            name.as_bytes().to_vec(),
            object::SectionKind::ReadOnlyData,
        );
        obj.append_section_data(id, b"\x00", 1);
    }
    obj.write().unwrap()
}

/// Builds an upload body: the gzipped header followed by one gzip stream
/// per payload segment.
pub(crate) fn upload_body(header: &UploadHeader, segments: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    push_segment(&mut body, &serde_json::to_vec(header).unwrap());
    for segment in segments {
        push_segment(&mut body, segment);
    }
    body
}

fn push_segment(body: &mut Vec<u8>, data: &[u8]) {
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    body.extend_from_slice(&encoder.finish().unwrap());
}

/// Polls a condition until it holds, panicking after a few seconds.
pub(crate) async fn wait_until<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

/// A test server bound to a random port, stopped on drop.
pub(crate) struct Server {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Server {
    pub async fn with_service(service: CoreService) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = endpoints::create_app(service);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Server { addr, handle }
    }

    /// Returns a full URL pointing at the given path.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spins up a whole service plus HTTP server over a scratch directory.
///
/// The background workers are detached; they stop with the test runtime.
pub(crate) async fn server() -> (TempDir, CoreService, Server) {
    server_with(|_| {}).await
}

/// Like [`server`], with a hook to adjust the config first.
pub(crate) async fn server_with(adjust: impl FnOnce(&mut Config)) -> (TempDir, CoreService, Server) {
    setup();
    let tmp = tempdir();
    let mut config = self::config(tmp.path());
    adjust(&mut config);
    let (service, _workers) = CoreService::create(config).unwrap();
    let server = Server::with_service(service.clone()).await;
    (tmp, service, server)
}
