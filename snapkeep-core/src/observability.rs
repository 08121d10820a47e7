/*!
Observability infrastructure for Snapkeep.

This module provides:
- Structured logging setup (human readable or JSON)
- Prometheus metrics for download sessions and pruning (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapkeepError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<SnapkeepMetrics> = OnceLock::new();

/// Metrics collection for Snapkeep operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SnapkeepMetrics {
    /// Download sessions currently held by the registry
    pub downloads_tracked: Gauge,
    pub downloads_total: Counter,
    pub download_errors_total: Counter,
    /// Archive sizes in bytes
    pub archive_size_bytes: Histogram,
    pub pruned_snapshots_total: Counter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> SnapkeepError {
    SnapkeepError::validation(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl SnapkeepMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let downloads_tracked = Gauge::new(
            "snapkeep_download_tracked_count",
            "Download sessions currently tracked",
        )
        .map_err(|e| metric_error("download_tracked_count", e))?;

        let downloads_total = Counter::new(
            "snapkeep_downloads_total",
            "Archive downloads that ran to completion or failure",
        )
        .map_err(|e| metric_error("downloads_total", e))?;

        let download_errors_total = Counter::new(
            "snapkeep_download_errors_total",
            "Archive downloads that finished with an error",
        )
        .map_err(|e| metric_error("download_errors_total", e))?;

        let archive_size_bytes = Histogram::with_opts(
            HistogramOpts::new("snapkeep_archive_size_bytes", "Size of streamed archives in bytes")
                .buckets(prometheus::exponential_buckets(1024.0 * 1024.0, 4.0, 10).map_err(
                    |e| metric_error("archive_size_bytes", e),
                )?),
        )
        .map_err(|e| metric_error("archive_size_bytes", e))?;

        let pruned_snapshots_total = Counter::new(
            "snapkeep_pruned_snapshots_total",
            "Snapshot directories removed by pruning",
        )
        .map_err(|e| metric_error("pruned_snapshots_total", e))?;

        registry
            .register(Box::new(downloads_tracked.clone()))
            .map_err(|e| metric_error("download_tracked_count", e))?;
        registry
            .register(Box::new(downloads_total.clone()))
            .map_err(|e| metric_error("downloads_total", e))?;
        registry
            .register(Box::new(download_errors_total.clone()))
            .map_err(|e| metric_error("download_errors_total", e))?;
        registry
            .register(Box::new(archive_size_bytes.clone()))
            .map_err(|e| metric_error("archive_size_bytes", e))?;
        registry
            .register(Box::new(pruned_snapshots_total.clone()))
            .map_err(|e| metric_error("pruned_snapshots_total", e))?;

        Ok(Self {
            downloads_tracked,
            downloads_total,
            download_errors_total,
            archive_size_bytes,
            pruned_snapshots_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static SnapkeepMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize Snapkeep metrics"))
    }

    pub fn set_tracked_downloads(&self, count: usize) {
        self.downloads_tracked.set(count as f64);
    }

    /// Record the end of an archive pass
    pub fn record_download(&self, bytes: u64, success: bool) {
        self.downloads_total.inc();
        if success {
            self.archive_size_bytes.observe(bytes as f64);
        } else {
            self.download_errors_total.inc();
        }
    }

    pub fn record_pruned(&self) {
        self.pruned_snapshots_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metric_error("encoder", e))?;

        String::from_utf8(buffer)
            .map_err(|e| SnapkeepError::validation(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Install the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` overrides the default directive, which is `snapkeep=info`
/// (or `snapkeep=debug` when `verbose` is set).
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    SnapkeepMetrics::global();

    let default_level = if verbose { "snapkeep=debug" } else { "snapkeep=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        SnapkeepError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Snapkeep observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(false, false)
}
