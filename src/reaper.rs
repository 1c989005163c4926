//! Lease expiry for abandoned transactions.
//!
//! The `LeaseReaper` runs as a background task, periodically rolling back
//! transactions that stayed in progress past their lease and removing
//! records that finished transactions left behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LeaseConfig;
use crate::mediator::{ExpiryReport, MediatorClient, Result};

/// Background task for expiring abandoned transactions.
pub struct LeaseReaper {
    mediator: Arc<dyn MediatorClient>,
    ttl: Duration,
    interval: Duration,
}

impl LeaseReaper {
    /// Create a new lease reaper.
    ///
    /// # Arguments
    /// * `mediator` - The coordination protocol to sweep
    /// * `ttl` - Maximum age of a transaction
    pub fn new(mediator: Arc<dyn MediatorClient>, ttl: Duration) -> Self {
        Self {
            mediator,
            ttl,
            interval: Duration::from_secs(crate::config::DEFAULT_LEASE_INTERVAL_SECS),
        }
    }

    /// Create a reaper from lease configuration.
    pub fn from_config(mediator: Arc<dyn MediatorClient>, lease: &LeaseConfig) -> Self {
        Self::new(mediator, Duration::from_secs(lease.ttl_secs))
            .with_interval(Duration::from_secs(lease.interval_secs.max(1)))
    }

    /// Set custom sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the reaper as a background task.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(report) if !report.rolled_back.is_empty() || !report.cleared.is_empty() => {
                        info!(
                            rolled_back = report.rolled_back.len(),
                            cleared = report.cleared.len(),
                            ttl_secs = self.ttl.as_secs(),
                            "Lease reaper expired abandoned transactions"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Lease reaper sweep failed");
                    }
                }
            }
        })
    }

    /// Run one sweep.
    pub async fn run_once(&self) -> Result<ExpiryReport> {
        self.mediator.expire_abandoned(self.ttl).await
    }
}
