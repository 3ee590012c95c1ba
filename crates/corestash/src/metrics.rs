//! Provides access to the metrics system.
//!
//! Counters live in a process-wide registry exposed in the Prometheus text
//! format on `GET /metrics`. Everything is updated from handlers and
//! workers through the cheap clonable [`Metrics`] handle.

use corestash_common::Coredump;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

const MEGABYTE: f64 = 1024.0 * 1024.0;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    received: IntCounterVec,
    received_sizes: HistogramVec,
    analyses: IntCounterVec,
    cleanups: IntCounterVec,
}

impl Metrics {
    pub fn new(mut size_buckets: Vec<f64>) -> Result<Self, prometheus::Error> {
        if size_buckets.is_empty() {
            size_buckets = vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0];
        }

        let registry = Registry::new();

        // Lets restarts show up even when the service never receives
        // anything.
        let started = IntGauge::new(
            "corestash_start_time_seconds",
            "unix time at which the service started",
        )?;
        started.set(chrono::Utc::now().timestamp());
        registry.register(Box::new(started))?;

        let received = IntCounterVec::new(
            Opts::new("corestash_received_total", "number of core dumps received"),
            &["hostname", "executable"],
        )?;
        registry.register(Box::new(received.clone()))?;

        let received_sizes = HistogramVec::new(
            HistogramOpts::new(
                "corestash_received_size_megabytes",
                "size of the received core dumps",
            )
            .buckets(size_buckets),
            &["hostname", "executable"],
        )?;
        registry.register(Box::new(received_sizes.clone()))?;

        let analyses = IntCounterVec::new(
            Opts::new("corestash_analyses_total", "number of analyses run"),
            &["outcome"],
        )?;
        registry.register(Box::new(analyses.clone()))?;

        let cleanups = IntCounterVec::new(
            Opts::new("corestash_cleanups_total", "number of cleanups run"),
            &["outcome"],
        )?;
        registry.register(Box::new(cleanups.clone()))?;

        Ok(Metrics {
            registry,
            received,
            received_sizes,
            analyses,
            cleanups,
        })
    }

    pub fn observe_received(&self, core: &Coredump) {
        let labels = [core.hostname.as_str(), core.executable.as_str()];
        self.received.with_label_values(&labels).inc();
        self.received_sizes
            .with_label_values(&labels)
            .observe(core.size as f64 / MEGABYTE);
    }

    pub fn observe_analysis(&self, ok: bool) {
        self.analyses
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn observe_cleanup(&self, ok: bool) {
        self.cleanups
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
