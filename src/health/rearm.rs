//! Operator-requested clearing of critical latches.
//!
//! Another service writes `healthd_rearm = "1"`; the coordinator clears every asserted
//! critical latch it knows about and writes the flag back to `"0"`. Clearing a latch fires
//! nothing, so a metric still over its limit asserts (and reacts) again on its next poll.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{HealthdError, HealthdResult};
use crate::hardware::capabilities::FlagStore;
use crate::health::threshold::ThresholdSet;
use crate::limits::KEY_HEALTHD_REARM;

/// A group of latches that a rearm request may clear.
pub trait LatchGroup: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Clear asserted critical latches, returning how many were cleared.
    fn rearm_critical(&self) -> usize;
}

impl LatchGroup for ThresholdSet {
    fn name(&self) -> &str {
        ThresholdSet::name(self)
    }

    fn rearm_critical(&self) -> usize {
        ThresholdSet::rearm_critical(self)
    }
}

/// Polls the rearm flag and clears registered latch groups.
pub struct RearmCoordinator {
    store: Arc<dyn FlagStore>,
    groups: Vec<Arc<dyn LatchGroup>>,
    interval: Duration,
}

impl RearmCoordinator {
    /// Coordinator polling `store` every `interval`.
    pub fn new(store: Arc<dyn FlagStore>, interval: Duration) -> Self {
        Self {
            store,
            groups: Vec::new(),
            interval,
        }
    }

    /// Register a latch group.
    pub fn register(&mut self, group: Arc<dyn LatchGroup>) {
        self.groups.push(group);
    }

    /// Number of registered groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Check the flag once. Returns whether a request was served.
    pub async fn poll_once(&self) -> HealthdResult<bool> {
        let request = self
            .store
            .read_flag(KEY_HEALTHD_REARM)
            .await
            .map_err(|e| store_error(&e))?;
        if request.as_deref() != Some("1") {
            return Ok(false);
        }

        for group in &self.groups {
            let cleared = group.rearm_critical();
            if cleared > 0 {
                tracing::info!(group = group.name(), cleared, "critical latches rearmed");
            }
        }

        self.store
            .persist_flag(KEY_HEALTHD_REARM, "0")
            .await
            .map_err(|e| store_error(&e))?;
        Ok(true)
    }

    /// Poll forever. Store failures are retried at the next interval.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.poll_once().await {
                tracing::debug!(error = %e, "rearm check skipped");
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

fn store_error(e: &anyhow::Error) -> HealthdError {
    HealthdError::Store {
        key: KEY_HEALTHD_REARM.to_string(),
        message: e.to_string(),
    }
}
