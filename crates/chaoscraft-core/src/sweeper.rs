//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Background task enforcing duration bounds and recovering abandoned transitions."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleEngine;

/// Counts produced by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_stopped: usize,
    pub stale_recovered: usize,
}

/// Periodically stops expired experiments and, when enabled, fails
/// experiments left in flight by a crashed writer.
#[derive(Debug, Clone)]
pub struct MaintenanceSweeper {
    engine: Arc<LifecycleEngine>,
    interval: Duration,
    stale_after: Option<Duration>,
}

impl MaintenanceSweeper {
    pub fn new(engine: Arc<LifecycleEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            stale_after: None,
        }
    }

    pub fn with_stale_recovery(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Execute one sweep immediately.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        match self.engine.stop_expired(Utc::now()).await {
            Ok(stopped) => report.expired_stopped = stopped.len(),
            Err(err) => warn!(error = %err, "expiry sweep failed"),
        }
        if let Some(stale_after) = self.stale_after {
            match self.engine.recover_stale(stale_after).await {
                Ok(recovered) => report.stale_recovered = recovered.len(),
                Err(err) => warn!(error = %err, "stale transition recovery failed"),
            }
        }
        if report != SweepReport::default() {
            info!(
                expired_stopped = report.expired_stopped,
                stale_recovered = report.stale_recovered,
                "maintenance sweep completed"
            );
        }
        report
    }

    /// Run sweeps on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("maintenance sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
