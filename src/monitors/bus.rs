//! I2C bus-crash monitor.
//!
//! Every enabled bus has its own [`BitfieldLatch`] over [`I2C_BUS_CONDITIONS`]. A bus whose
//! status cannot be read is skipped for the cycle without touching its latch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::{RecoveryActions, StatusUnit, StatusWordSource};
use crate::health::bitfield::{BitfieldLatch, LatchOutcome, I2C_BUS_CONDITIONS};
use crate::health::threshold::{log_at, Severity};
use crate::limits::BUS_POLL_INTERVAL;

/// Polls the crash status of a set of I2C buses.
pub struct BusMonitor {
    status: Arc<dyn StatusWordSource>,
    actions: Arc<dyn RecoveryActions>,
    latches: BTreeMap<u8, BitfieldLatch>,
    interval: Duration,
}

impl BusMonitor {
    /// Monitor of `busses` (ids base 0).
    pub fn new(
        busses: impl IntoIterator<Item = u8>,
        status: Arc<dyn StatusWordSource>,
        actions: Arc<dyn RecoveryActions>,
    ) -> Self {
        Self {
            status,
            actions,
            latches: busses.into_iter().map(|bus| (bus, BitfieldLatch::new())).collect(),
            interval: BUS_POLL_INTERVAL,
        }
    }

    /// Time between scans.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Monitored bus ids, ascending.
    pub fn busses(&self) -> impl Iterator<Item = u8> + '_ {
        self.latches.keys().copied()
    }

    /// Latch state of `bus`.
    pub fn latch(&self, bus: u8) -> Option<&BitfieldLatch> {
        self.latches.get(&bus)
    }

    /// Scan every bus once. Returns how many buses were read.
    pub async fn poll_once(&mut self) -> usize {
        let mut read = 0;
        for (&bus, latch) in self.latches.iter_mut() {
            let word = match self.status.read_status(StatusUnit::I2cBus(bus)).await {
                Ok(word) => word,
                Err(e) => {
                    tracing::debug!(bus, error = %e, "I2C status unavailable");
                    continue;
                }
            };
            read += 1;
            let outcome = latch.evaluate(&I2C_BUS_CONDITIONS, word);
            report(self.actions.as_ref(), bus, &outcome).await;
        }
        read
    }

    /// Scan forever.
    pub async fn run(mut self) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}

async fn report(actions: &dyn RecoveryActions, bus: u8, outcome: &LatchOutcome) {
    if outcome.recovered {
        log_at(
            Severity::Critical,
            &format!("DEASSERT: I2C({bus}) Bus recoveried. (I2C bus index base 0)"),
        );
        if let Err(e) = actions.bus_recovered(bus).await {
            tracing::warn!(bus, error = %e, "bus recovered hook failed");
        }
        return;
    }

    for condition in &outcome.newly_latched {
        log_at(
            Severity::Critical,
            &format!("ASSERT: I2C({bus}) {} (I2C bus index base 0)", condition.text),
        );
    }
    for condition in &outcome.informational {
        log_at(
            Severity::Critical,
            &format!("I2C({bus}) {} (I2C bus index base 0)", condition.text),
        );
    }
    if outcome.undefined_latched {
        log_at(
            Severity::Critical,
            &format!(
                "ASSERT: I2C({bus}) {} (I2C bus index base 0)",
                I2C_BUS_CONDITIONS.undefined_text
            ),
        );
    }

    if outcome.needs_recovery_assist() {
        if let Err(e) = actions.bus_recovery_assist(bus).await {
            tracing::error!(bus, error = %e, "bus recovery assist failed");
        }
    }
}
