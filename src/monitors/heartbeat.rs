//! Heartbeat LED.

use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::{FlagStore, RecoveryActions};
use crate::limits::DEFAULT_HEARTBEAT_INTERVAL;
use crate::monitors::mark_ready;

/// Blinks the heartbeat LED while the daemon is alive.
pub struct HeartbeatMonitor {
    actions: Arc<dyn RecoveryActions>,
    half_period: Duration,
}

impl HeartbeatMonitor {
    /// Heartbeat driven through `actions`.
    pub fn new(actions: Arc<dyn RecoveryActions>) -> Self {
        Self {
            actions,
            half_period: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Time the LED stays in each state.
    pub fn with_half_period(mut self, half_period: Duration) -> Self {
        self.half_period = half_period;
        self
    }

    async fn set(&self, on: bool) {
        if let Err(e) = self.actions.set_heartbeat_led(on).await {
            tracing::debug!(on, error = %e, "heartbeat LED update failed");
        }
    }

    /// One on/off period.
    pub async fn blink_once(&self) {
        self.set(true).await;
        tokio::time::sleep(self.half_period).await;
        self.set(false).await;
        tokio::time::sleep(self.half_period).await;
    }

    /// Blink forever.
    pub async fn run(self, store: Arc<dyn FlagStore>) {
        mark_ready(store.as_ref(), "hb_led").await;
        loop {
            self.blink_once().await;
        }
    }
}
