/*!
Periodic pruning.

The first pass runs shortly after start (a tenth of the interval), later
passes every interval. Every delay is jittered so that several processes
sharing a snapshot root do not prune in lockstep.
*/

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::format_duration;
use crate::pruner::{prune, PruneOptions, PruneReport};
use crate::{Result, SnapkeepError};

/// Lower bound for any delay between passes
pub const MIN_DELAY: Duration = Duration::from_secs(1);

const JITTER_RANGE: std::ops::Range<f64> = 0.9..1.1;

/// Scale `base` by a random factor in `[0.9, 1.1)`, clamped to [`MIN_DELAY`].
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_RANGE);
    base.mul_f64(factor).max(MIN_DELAY)
}

pub struct Autopruner {
    interval: Duration,
    options: PruneOptions,
}

impl Autopruner {
    pub fn new(interval: Duration, options: PruneOptions) -> Result<Self> {
        if interval.is_zero() {
            return Err(SnapkeepError::validation(
                "autoprune interval must be larger than zero",
            ));
        }
        options.validate()?;
        Ok(Self { interval, options })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn options(&self) -> &PruneOptions {
        &self.options
    }

    /// Run one prune pass on the blocking pool.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<PruneReport> {
        let options = self.options.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || prune(&options, &cancel))
            .await
            .map_err(|e| SnapkeepError::Io(std::io::Error::other(format!("prune task failed: {e}"))))?
    }

    /// Prune periodically until `cancel` fires.
    ///
    /// Failed passes are logged and the loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            path = %self.options.root.display(),
            interval = ?self.interval,
            keep_within = %format_duration(self.options.keep_within),
            "Starting autopruner"
        );

        let mut base = self.interval / 10;
        loop {
            let delay = jittered(base);
            debug!(delay = ?delay, "Next prune scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.run_once(&cancel).await {
                Ok(report) => {
                    if !report.deleted.is_empty() || !report.vetoed.is_empty() {
                        info!(
                            deleted = report.deleted.len(),
                            vetoed = report.vetoed.len(),
                            "Autoprune pass finished"
                        );
                    }
                }
                Err(e) if e.is_canceled() => break,
                Err(e) => error!(error = %e, "Failed to prune snapshots"),
            }

            base = self.interval;
        }

        info!("Autopruner stopped");
    }
}
