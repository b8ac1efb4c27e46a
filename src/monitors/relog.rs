//! Regeneration of latched assertions.
//!
//! Latched faults are only logged on their assert edge. So that a long-standing fault shows
//! up again after the log has been rotated or cleared, this monitor periodically clears every
//! threshold latch and zeroes the aggregate bitmap without writing the health flag. Faults
//! still present re-assert, re-log and re-raise the flag on their next poll.
//!
//! Besides the periodic timer, an unhealthy-to-healthy change of the persisted flag that the
//! daemon did not make (an operator cleared the log) also triggers a regeneration.

use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::FlagStore;
use crate::health::aggregate::AggregateFaultBitmap;
use crate::health::threshold::ThresholdSet;
use crate::limits::{DEFAULT_MONITOR_INTERVAL, HEALTHY, KEY_BMC_HEALTH};

/// Watches the persisted health flag and regenerates latches.
pub struct RelogMonitor {
    store: Arc<dyn FlagStore>,
    bitmap: Arc<AggregateFaultBitmap>,
    groups: Vec<Arc<ThresholdSet>>,
    criteria: u64,
    cycles: u64,
    last_healthy: bool,
    interval: Duration,
}

impl RelogMonitor {
    /// Monitor regenerating every `criteria` cycles.
    pub fn new(
        store: Arc<dyn FlagStore>,
        bitmap: Arc<AggregateFaultBitmap>,
        criteria: u64,
    ) -> Self {
        Self {
            store,
            bitmap,
            groups: Vec::new(),
            criteria,
            cycles: 0,
            last_healthy: true,
            interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    /// Time between flag reads.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Add a threshold set whose latches are regenerated.
    pub fn register(&mut self, group: Arc<ThresholdSet>) {
        self.groups.push(group);
    }

    async fn read_healthy(&self) -> bool {
        match self.store.read_flag(KEY_BMC_HEALTH).await {
            Ok(Some(value)) => value.trim() == HEALTHY,
            Ok(None) => {
                tracing::debug!(key = KEY_BMC_HEALTH, "health flag not set yet");
                false
            }
            Err(e) => {
                tracing::error!(
                    key = KEY_BMC_HEALTH,
                    error = %e,
                    "kv get bmc_health status failed"
                );
                false
            }
        }
    }

    /// Read the flag once. Returns whether latches were regenerated.
    pub async fn poll_once(&mut self) -> bool {
        let healthy = self.read_healthy().await;
        let cleared_externally = !self.last_healthy && healthy;
        let regenerate = self.cycles >= self.criteria || cleared_externally;

        if regenerate {
            let cleared: usize = self.groups.iter().map(|g| g.clear_all()).sum();
            self.bitmap.reset().await;
            self.cycles = 0;
            tracing::info!(cleared, cleared_externally, "latched assertions regenerated");
        }

        self.last_healthy = healthy;
        self.cycles += 1;
        regenerate
    }

    /// Poll forever.
    pub async fn run(mut self) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
