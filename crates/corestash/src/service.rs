//! The service behind the HTTP handlers: shared state, the two work
//! queues, and the long-lived workers consuming them.
//!
//! Startup order is leaves first: store, index, analyzer templates, then
//! the analysis worker, the recovery task (which re-enqueues documents left
//! un-analyzed by a previous run), the cleanup worker and the retention
//! sweeper. On shutdown the HTTP server stops first; dropping the service
//! closes the queue senders, the workers drain what is left and exit, and
//! [`Workers::shutdown`] awaits them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use corestash_common::Coredump;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::{self, AnalyzerTemplates};
use crate::cleanup;
use crate::config::Config;
use crate::index::{self, Index};
use crate::metrics::Metrics;
use crate::store::{self, Store};

/// Queue capacity for both internal queues. A full analysis queue blocks
/// the upload handler, which is the backpressure the ingestion path wants.
const QUEUE_CAPACITY: usize = 1024;

/// How often the retention sweeper looks for expired cores.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Page size used by the recovery and retention sweeps.
const SWEEP_PAGE: usize = 100;

/// The shared state of the indexer. Cheap to clone.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: Config,
    store: Arc<dyn Store>,
    index: Arc<dyn Index>,
    metrics: Metrics,
    analysis_tx: mpsc::Sender<Coredump>,
    cleanup_tx: mpsc::Sender<Coredump>,
}

/// Handles on the background tasks, for orderly shutdown.
pub struct Workers {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Stops the periodic tasks and waits for the queue workers to drain.
    ///
    /// The queue workers exit once every queue sender is gone, so the
    /// service (and the router holding it) must be dropped before calling
    /// this.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(worker = name, error = %err, "worker task failed");
            }
        }
    }
}

impl CoreService {
    /// Opens the store and the index and starts the background workers.
    ///
    /// Must run inside a tokio runtime.
    pub fn create(config: Config) -> Result<(CoreService, Workers)> {
        std::fs::create_dir_all(&config.data_dir).context("creating data directory")?;

        let store = store::open(&config.store_type, &config.data_dir.join("store"))
            .context("opening store")?;
        let index = index::open(&config.index_type, &config.data_dir.join("index"))
            .context("opening index")?;
        let templates = AnalyzerTemplates::init(
            &config.data_dir,
            config.analyzers.c.clone(),
            config.analyzers.go.clone(),
        )
        .context("preparing analyzer templates")?;
        let metrics =
            Metrics::new(config.size_buckets.clone()).context("registering metrics")?;

        let (analysis_tx, analysis_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (cleanup_tx, cleanup_rx) = mpsc::channel(QUEUE_CAPACITY);
        let token = CancellationToken::new();

        let mut handles = Vec::new();
        handles.push((
            "analysis",
            tokio::spawn(analysis_worker(
                analysis_rx,
                store.clone(),
                index.clone(),
                templates,
                metrics.clone(),
            )),
        ));
        handles.push((
            "recovery",
            tokio::spawn(recovery(
                index.clone(),
                analysis_tx.clone(),
                token.clone(),
            )),
        ));
        handles.push((
            "cleanup",
            tokio::spawn(cleanup_worker(
                cleanup_rx,
                store.clone(),
                index.clone(),
                metrics.clone(),
            )),
        ));
        if !config.retention_duration.is_zero() {
            handles.push((
                "retention",
                tokio::spawn(retention_sweeper(
                    config.retention_duration,
                    index.clone(),
                    cleanup_tx.clone(),
                    token.clone(),
                )),
            ));
        }

        let service = CoreService {
            inner: Arc::new(ServiceInner {
                config,
                store,
                index,
                metrics,
                analysis_tx,
                cleanup_tx,
            }),
        };

        Ok((service, Workers { token, handles }))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    pub fn index(&self) -> Arc<dyn Index> {
        self.inner.index.clone()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Queues a document for analysis; blocks when the queue is full.
    pub async fn enqueue_analysis(&self, core: Coredump) -> Result<()> {
        self.inner
            .analysis_tx
            .send(core)
            .await
            .context("analysis queue closed")
    }

    /// Queues a document for cleanup; blocks when the queue is full.
    pub async fn enqueue_cleanup(&self, core: Coredump) -> Result<()> {
        self.inner
            .cleanup_tx
            .send(core)
            .await
            .context("cleanup queue closed")
    }
}

/// Single consumer of the analysis queue. Analyses never interleave their
/// index write-backs because there is exactly one of these.
async fn analysis_worker(
    mut rx: mpsc::Receiver<Coredump>,
    store: Arc<dyn Store>,
    index: Arc<dyn Index>,
    templates: AnalyzerTemplates,
    metrics: Metrics,
) {
    while let Some(core) = rx.recv().await {
        let uid = core.uid.clone();
        let store = store.clone();
        let index = index.clone();
        let templates = templates.clone();

        let result = tokio::task::spawn_blocking(move || {
            analysis::analyze(&uid, store.as_ref(), index.as_ref(), &templates)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                metrics.observe_analysis(true);
                tracing::debug!(uid = %core.uid, "analysis done");
            }
            Ok(Err(err)) => {
                metrics.observe_analysis(false);
                tracing::error!(uid = %core.uid, "analysis failed: {err:#}");
            }
            Err(err) => {
                metrics.observe_analysis(false);
                tracing::error!(uid = %core.uid, error = %err, "analysis task panicked");
            }
        }
    }
    tracing::debug!("analysis queue drained");
}

/// Single consumer of the cleanup queue.
async fn cleanup_worker(
    mut rx: mpsc::Receiver<Coredump>,
    store: Arc<dyn Store>,
    index: Arc<dyn Index>,
    metrics: Metrics,
) {
    while let Some(core) = rx.recv().await {
        let store = store.clone();
        let index = index.clone();
        let cleaned = core.clone();

        let result = tokio::task::spawn_blocking(move || {
            cleanup::cleanup(&cleaned, index.as_ref(), store.as_ref())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                metrics.observe_cleanup(true);
                tracing::debug!(uid = %core.uid, "cleanup done");
            }
            Ok(Err(err)) => {
                metrics.observe_cleanup(false);
                tracing::error!(uid = %core.uid, "cleanup failed: {err:#}");
            }
            Err(err) => {
                metrics.observe_cleanup(false);
                tracing::error!(uid = %core.uid, error = %err, "cleanup task panicked");
            }
        }
    }
    tracing::debug!("cleanup queue drained");
}

/// Re-enqueues every document a previous run left un-analyzed.
///
/// All pages are collected before anything is enqueued: analysis shrinks
/// the `analyzed:F*` result set while it runs, which would make paging over
/// live results skip documents.
async fn recovery(
    index: Arc<dyn Index>,
    tx: mpsc::Sender<Coredump>,
    token: CancellationToken,
) {
    let mut pending = Vec::new();
    let mut from = 0;
    loop {
        let index = index.clone();
        let page = tokio::task::spawn_blocking(move || {
            index.search("analyzed:F*", "dumped_at", SWEEP_PAGE, from)
        })
        .await;

        let cores = match page {
            Ok(Ok((cores, _))) => cores,
            Ok(Err(err)) => {
                tracing::error!("recovery search failed: {err:#}");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "recovery task panicked");
                return;
            }
        };
        if cores.is_empty() {
            break;
        }
        from += cores.len();
        pending.extend(cores);
    }

    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "recovering unanalyzed cores");
    }
    for core in pending {
        tokio::select! {
            _ = token.cancelled() => return,
            result = tx.send(core) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

/// Periodically reaps cores older than the retention duration.
async fn retention_sweeper(
    retention: Duration,
    index: Arc<dyn Index>,
    tx: mpsc::Sender<Coredump>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Err(err) = sweep(retention, &index, &tx, &token).await {
            tracing::error!("retention sweep failed: {err:#}");
        }
    }
}

/// One sweep: search expired cores and enqueue them until a fresh read
/// comes back empty.
///
/// Deletion happens in the cleanup worker, so each pass re-reads from
/// scratch instead of paging over a result set that is shrinking under it.
/// The pause between passes gives the worker time to catch up rather than
/// re-finding the same documents.
async fn sweep(
    retention: Duration,
    index: &Arc<dyn Index>,
    tx: &mpsc::Sender<Coredump>,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).context("retention out of range")?;
        let query = format!("dumped_at:<\"{}\"", cutoff.to_rfc3339());

        let search_index = index.clone();
        let (cores, total) = tokio::task::spawn_blocking(move || {
            search_index.search(&query, "dumped_at", SWEEP_PAGE, 0)
        })
        .await
        .context("sweep task")?
        .context("searching for expired cores")?;

        if cores.is_empty() {
            return Ok(());
        }
        tracing::info!(total, "sweeping expired cores");

        for core in cores {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = tx.send(core) => {
                    result.context("cleanup queue closed")?;
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
}
