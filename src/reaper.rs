//! Background reclamation of expired leases.
//!
//! The reaper wakes on a fixed interval, walks a snapshot of the table's
//! keys and expires each due lease under its own key lock, so a sweep never
//! blocks assignments for more than one key at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{SystemTimeSource, TimeSource};
use crate::config::Config;
use crate::error::Result;
use crate::events::EventSink;
use crate::manager::LeaseManager;
use crate::store::LeaseSession;

/// Outcome of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys visited.
    pub examined: usize,
    /// Expired leases removed from the table.
    pub reclaimed: usize,
    /// Expiry events the sink failed to accept.
    pub sink_failures: usize,
}

/// Periodic task that removes expired leases and frees their addresses.
pub struct ExpiryReaper {
    manager: Arc<LeaseManager>,
    interval: Duration,
}

impl ExpiryReaper {
    /// Creates a reaper running at the manager's configured interval.
    pub fn new(manager: Arc<LeaseManager>) -> Self {
        let interval = manager.config().reaper_interval();
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Expires every due lease once.
    ///
    /// Failures on one entry are logged and the sweep moves on.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self.manager.table().keys().await {
            report.examined += 1;

            let Some(change) = self.manager.expire_if_due(key).await else {
                continue;
            };
            report.reclaimed += 1;

            if let Some(error) = change.sink_error {
                report.sink_failures += 1;
                warn!(%key, "Expired lease but could not report it: {}", error);
            }
        }

        let compacted = self.manager.table().compact().await;
        debug!(
            examined = report.examined,
            reclaimed = report.reclaimed,
            compacted,
            "Reaper sweep finished"
        );

        report
    }

    /// Spawns the reaper loop onto the tokio runtime.
    ///
    /// The task stops when `shutdown` becomes `true` or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Expiry reaper running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report.reclaimed > 0 {
                        info!(
                            reclaimed = report.reclaimed,
                            sink_failures = report.sink_failures,
                            "Reclaimed expired leases"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Expiry reaper stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Reaper for a `leases_file` shared with other processes.
///
/// Each tick opens a [`LeaseSession`], sweeps it and commits, so leases
/// written by other commands between ticks are picked up and never lost.
pub struct StoreReaper {
    config: Arc<Config>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn TimeSource>,
    interval: Duration,
}

impl StoreReaper {
    pub fn new(config: Arc<Config>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_time_source(config, sink, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: Arc<Config>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let interval = config.reaper_interval();
        Self {
            config,
            sink,
            clock,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Loads the store, expires every due lease and saves the result.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let session = LeaseSession::open_with_time_source(
            Arc::clone(&self.config),
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
        )
        .await?;

        let report = ExpiryReaper::new(Arc::clone(session.manager())).sweep().await;
        session.commit().await?;
        Ok(report)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Lease store reaper running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.reclaimed > 0 => {
                            info!(
                                reclaimed = report.reclaimed,
                                sink_failures = report.sink_failures,
                                "Reclaimed expired leases"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => error!("Lease store sweep failed: {}", error),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lease store reaper stopping");
                        break;
                    }
                }
            }
        }
    }
}
