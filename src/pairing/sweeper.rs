//! Reclamation sweeper: periodic removal of dead codes and credentials.
//!
//! The sweeper only bounds memory. Every request path re-checks expiry on its
//! own, so a late or skipped sweep never lets a stale entry through.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::service::PairingService;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired or used pairing codes removed.
    pub codes: usize,
    /// Expired credentials removed.
    pub credentials: usize,
}

impl SweepStats {
    pub fn is_empty(&self) -> bool {
        self.codes == 0 && self.credentials == 0
    }
}

/// Background task that calls [`PairingService::sweep_now`] on an interval.
pub struct Sweeper {
    service: PairingService,
    interval: Duration,
}

impl Sweeper {
    pub fn new(service: PairingService, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Spawn the sweep loop. It exits when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }

            tracing::info!(interval_secs = self.interval.as_secs(), "Auth sweeper started");

            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            timer.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        let stats = self.service.sweep_now().await;
                        if !stats.is_empty() {
                            tracing::debug!(
                                codes = stats.codes,
                                credentials = stats.credentials,
                                "Swept expired auth entries"
                            );
                        }
                    }
                }
            }

            tracing::info!("Auth sweeper stopped");
        })
    }
}
