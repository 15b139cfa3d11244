//! Eviction Sweeper
//!
//! Periodically bounds the preview store. When aggregate size exceeds the
//! budget, the oldest artifacts (by last write time) are removed until the
//! newest ones fit under `max_bytes * target_fraction`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::store::ArtifactStore;

/// Default budget: 10 GB
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1_000_000_000;

/// Default fraction of the budget kept after an eviction pass
pub const DEFAULT_TARGET_FRACTION: f64 = 0.80;

/// Default time between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Size budget for the store
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityPolicy {
    /// Budget that triggers eviction when exceeded
    pub max_bytes: u64,
    /// Fraction of `max_bytes` to shrink down to
    pub target_fraction: f64,
}

impl CapacityPolicy {
    /// Policy with the default 80% target
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            target_fraction: DEFAULT_TARGET_FRACTION,
        }
    }

    /// Size the newest artifacts are allowed to add up to after eviction
    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_fraction) as u64
    }
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

/// Outcome of a sweep that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Aggregate size before the sweep
    pub total_before: u64,
    /// Names of removed artifacts, newest first
    pub removed: Vec<String>,
    /// Bytes freed
    pub freed: u64,
}

/// Sweep failures. Both abort the current pass only.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Failed to enumerate preview store: {0}")]
    Enumerate(#[source] io::Error),

    #[error("Failed to remove artifact {name} after removing {removed} others: {source}")]
    Remove {
        name: String,
        removed: usize,
        #[source]
        source: io::Error,
    },
}

/// Run one eviction pass over `store`.
///
/// The running size is accumulated over the full pre-deletion listing, so
/// the cutoff is stable regardless of which deletions succeed. The first
/// deletion failure stops the pass; artifacts not yet visited are left alone.
pub fn sweep<S: ArtifactStore + ?Sized>(
    store: &S,
    policy: &CapacityPolicy,
) -> Result<SweepReport, SweepError> {
    let mut artifacts = store.list_all().map_err(SweepError::Enumerate)?;
    let total: u64 = artifacts.iter().map(|a| a.size).sum();

    let mut report = SweepReport {
        total_before: total,
        ..SweepReport::default()
    };

    if total <= policy.max_bytes {
        debug!(total = total, max = policy.max_bytes, "Preview store within budget");
        return Ok(report);
    }

    info!(
        total_mb = total / 1_000_000,
        max_mb = policy.max_bytes / 1_000_000,
        "Preview store exceeds budget, evicting oldest artifacts"
    );

    // Most recently modified first
    artifacts.sort_by(|a, b| b.modified.cmp(&a.modified));

    let target = policy.target_bytes();
    let mut running: u64 = 0;
    for artifact in artifacts {
        running += artifact.size;
        if running <= target {
            continue;
        }
        if let Err(source) = store.remove(&artifact.name) {
            return Err(SweepError::Remove {
                name: artifact.name,
                removed: report.removed.len(),
                source,
            });
        }
        debug!(name = %artifact.name, size = artifact.size, "Evicted artifact");
        report.freed += artifact.size;
        report.removed.push(artifact.name);
    }

    info!(
        removed = report.removed.len(),
        freed_mb = report.freed / 1_000_000,
        "Eviction pass complete"
    );
    Ok(report)
}

/// Spawn the scheduled sweeper.
///
/// The first sweep happens one `interval` after start. The task exits once
/// `shutdown` flips to `true` (or its sender is dropped).
pub fn spawn_sweeper<S>(
    store: Arc<S>,
    policy: CapacityPolicy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: ArtifactStore + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Eviction sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let store = Arc::clone(&store);
            let result = tokio::task::spawn_blocking(move || sweep(store.as_ref(), &policy)).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Eviction sweep failed, retrying next interval"),
                Err(e) => error!(error = %e, "Eviction sweep task panicked"),
            }
        }

        info!("Eviction sweeper stopped");
    })
}
