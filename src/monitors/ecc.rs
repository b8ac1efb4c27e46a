//! Memory-controller ECC counter monitor.
//!
//! The controller keeps two saturating counters in one status word: recoverable errors in
//! bits 16..23 and unrecoverable errors in bits 12..15. Thresholds are percentages of the
//! counter maximum and, since the counters only grow, assertions never deassert on their
//! own.

use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::{FlagStore, StatusUnit, StatusWordSource};
use crate::health::reaction::ReactionDispatcher;
use crate::health::threshold::ThresholdSet;
use crate::limits::{DEFAULT_MONITOR_INTERVAL, ECC_READ_FAILURE_LOG_EVERY, ECC_READ_RETRY_DELAY};
use crate::monitors::mark_ready;

/// Metric name of the recoverable counter.
pub const RECOVERABLE_ECC_NAME: &str = "ECC Recoverable Error";

/// Metric name of the unrecoverable counter.
pub const UNRECOVERABLE_ECC_NAME: &str = "ECC Unrecoverable Error";

/// Counters decoded from one status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EccCounts {
    /// Recoverable error counter (8 bits)
    pub recoverable: u32,
    /// Unrecoverable error counter (4 bits)
    pub unrecoverable: u32,
}

impl EccCounts {
    /// Decode the memory-controller status word.
    pub fn decode(word: u32) -> Self {
        Self {
            recoverable: (word >> 16) & 0xFF,
            unrecoverable: (word >> 12) & 0xF,
        }
    }
}

/// Thresholds and reactions of one counter.
pub struct EccChannel {
    thresholds: Arc<ThresholdSet>,
    dispatcher: ReactionDispatcher,
    counter_max: u32,
}

impl EccChannel {
    /// Channel whose limits are percentages of `counter_max`.
    pub fn new(
        thresholds: Arc<ThresholdSet>,
        dispatcher: ReactionDispatcher,
        counter_max: u32,
    ) -> Self {
        Self {
            thresholds,
            dispatcher,
            counter_max,
        }
    }

    /// Threshold set shared with the rearm and relog coordinators.
    pub fn thresholds(&self) -> &Arc<ThresholdSet> {
        &self.thresholds
    }
}

/// Polls the ECC status word and evaluates both counters.
pub struct EccMonitor {
    status: Arc<dyn StatusWordSource>,
    recoverable: EccChannel,
    unrecoverable: EccChannel,
    address_log: bool,
    interval: Duration,
    read_failures: u32,
}

impl EccMonitor {
    /// Monitor reading from `status`.
    pub fn new(
        status: Arc<dyn StatusWordSource>,
        recoverable: EccChannel,
        unrecoverable: EccChannel,
    ) -> Self {
        Self {
            status,
            recoverable,
            unrecoverable,
            address_log: false,
            interval: DEFAULT_MONITOR_INTERVAL,
            read_failures: 0,
        }
    }

    /// Include the error address in assertion lines.
    pub fn with_address_log(mut self, enabled: bool) -> Self {
        self.address_log = enabled;
        self
    }

    /// Time between reads.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Recoverable channel.
    pub fn recoverable(&self) -> &EccChannel {
        &self.recoverable
    }

    /// Unrecoverable channel.
    pub fn unrecoverable(&self) -> &EccChannel {
        &self.unrecoverable
    }

    /// Read the status word once and evaluate both counters.
    ///
    /// Returns `None` when the register could not be read.
    pub async fn poll_once(&mut self) -> Option<EccCounts> {
        let word = match self.status.read_status(StatusUnit::MemoryController).await {
            Ok(word) => word,
            Err(e) => {
                self.read_failures += 1;
                if self.read_failures >= ECC_READ_FAILURE_LOG_EVERY {
                    tracing::error!(error = %e, "cannot read memory controller ECC status");
                    self.read_failures = 0;
                }
                return None;
            }
        };
        self.read_failures = 0;

        let counts = EccCounts::decode(word);
        self.evaluate(false, counts.recoverable).await;
        self.evaluate(true, counts.unrecoverable).await;
        Some(counts)
    }

    async fn evaluate(&self, unrecoverable: bool, count: u32) {
        let (channel, name, unit, address_label) = if unrecoverable {
            (
                &self.unrecoverable,
                UNRECOVERABLE_ECC_NAME,
                StatusUnit::FirstUnrecoverableEccAddress,
                "first unrecoverable",
            )
        } else {
            (
                &self.recoverable,
                RECOVERABLE_ECC_NAME,
                StatusUnit::LastRecoverableEccAddress,
                "last recoverable",
            )
        };

        let moved = channel.thresholds.evaluate_counter(count, channel.counter_max);
        if moved.is_empty() {
            return;
        }

        let address = if self.address_log {
            match self.status.read_status(unit).await {
                Ok(address) => Some(address),
                Err(e) => {
                    tracing::debug!(%unit, error = %e, "ECC address unavailable");
                    None
                }
            }
        } else {
            None
        };

        for (spec, transition) in moved {
            let over = spec.limit as i64;
            let message = match address {
                Some(address) => format!(
                    "{name} occurred (over {over}%) Counter = {count} Address of {address_label} ECC error = 0x{:x}",
                    address >> 4
                ),
                None => format!("ECC occurred (over {over}%): {name} Counter = {count}"),
            };
            channel.dispatcher.dispatch(&spec, transition, &message).await;
        }
    }

    /// Poll forever, retrying failed reads after a short delay.
    pub async fn run(mut self, store: Arc<dyn FlagStore>) {
        mark_ready(store.as_ref(), "ecc").await;
        loop {
            let delay = match self.poll_once().await {
                Some(_) => self.interval,
                None => ECC_READ_RETRY_DELAY,
            };
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ActionCall, MemoryFlagStore, MockStatusWords, RecordingActions};
    use crate::health::aggregate::{AggregateFaultBitmap, FaultBit};
    use crate::health::threshold::{ReactionKind, Severity, ThresholdSpec};
    use crate::limits::{KEY_BMC_HEALTH, MAX_ECC_RECOVERABLE_COUNTER, MAX_ECC_UNRECOVERABLE_COUNTER};
    use tracing_test::traced_test;

    struct Harness {
        status: Arc<MockStatusWords>,
        store: Arc<MemoryFlagStore>,
        actions: Arc<RecordingActions>,
        monitor: EccMonitor,
    }

    fn spec(limit: f64) -> ThresholdSpec {
        ThresholdSpec::new(limit, 0.0, Severity::Critical)
            .with_reaction(ReactionKind::Log)
            .with_reaction(ReactionKind::ErrorTrigger)
    }

    fn harness(recov: Vec<ThresholdSpec>, unrec: Vec<ThresholdSpec>) -> Harness {
        let status = Arc::new(MockStatusWords::new());
        let store = Arc::new(MemoryFlagStore::new());
        let actions = Arc::new(RecordingActions::new());
        let bitmap = Arc::new(AggregateFaultBitmap::new(store.clone()));
        let channel = |name: &str, bit, specs, max| {
            EccChannel::new(
                Arc::new(ThresholdSet::new(name, specs)),
                ReactionDispatcher::new(name, Some(bit), bitmap.clone(), actions.clone()),
                max,
            )
        };
        let monitor = EccMonitor::new(
            status.clone(),
            channel(
                RECOVERABLE_ECC_NAME,
                FaultBit::RecoverableEcc,
                recov,
                MAX_ECC_RECOVERABLE_COUNTER,
            ),
            channel(
                UNRECOVERABLE_ECC_NAME,
                FaultBit::UnrecoverableEcc,
                unrec,
                MAX_ECC_UNRECOVERABLE_COUNTER,
            ),
        );
        Harness {
            status,
            store,
            actions,
            monitor,
        }
    }

    fn word(recoverable: u32, unrecoverable: u32) -> u32 {
        (recoverable << 16) | (unrecoverable << 12)
    }

    #[test]
    fn decodes_both_counters() {
        let counts = EccCounts::decode(0x00ab_f000 | 0xfff);
        assert_eq!(counts.recoverable, 0xab);
        assert_eq!(counts.unrecoverable, 0xf);
    }

    #[tokio::test]
    #[traced_test]
    async fn recoverable_counter_asserts_once_above_limit() {
        // 255 * 50 / 100 = 127
        let mut h = harness(vec![spec(50.0)], vec![]);
        h.status.push(StatusUnit::MemoryController, word(127, 0));
        h.status.push(StatusUnit::MemoryController, word(128, 0));
        h.status.push(StatusUnit::MemoryController, word(200, 0));

        h.monitor.poll_once().await;
        assert!(h.store.writes_for(KEY_BMC_HEALTH).is_empty());

        h.monitor.poll_once().await;
        h.monitor.poll_once().await;
        assert_eq!(h.store.writes_for(KEY_BMC_HEALTH), ["0"]);
        assert_eq!(
            h.actions.count(&ActionCall::ErrorEnable(RECOVERABLE_ECC_NAME.into())),
            1
        );
        assert!(logs_contain(
            "ECC occurred (over 50%): ECC Recoverable Error Counter = 128"
        ));
    }

    #[tokio::test]
    async fn counter_drop_does_not_deassert() {
        let mut h = harness(vec![], vec![spec(40.0)]);
        h.status.push(StatusUnit::MemoryController, word(0, 7));
        h.status.push(StatusUnit::MemoryController, word(0, 0));

        h.monitor.poll_once().await;
        h.monitor.poll_once().await;
        assert!(h.monitor.unrecoverable().thresholds().snapshot()[0].is_asserted());
        assert_eq!(h.store.writes_for(KEY_BMC_HEALTH), ["0"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn address_log_uses_matching_register() {
        let mut h = harness(vec![spec(10.0)], vec![]);
        h.monitor = h.monitor.with_address_log(true);
        h.status.set(StatusUnit::MemoryController, word(30, 0));
        h.status.set(StatusUnit::LastRecoverableEccAddress, 0x1230);

        h.monitor.poll_once().await;
        assert!(logs_contain(
            "ECC Recoverable Error occurred (over 10%) Counter = 30 Address of last recoverable ECC error = 0x123"
        ));
        assert_eq!(h.status.reads_of(StatusUnit::FirstUnrecoverableEccAddress), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn read_failures_are_logged_periodically() {
        let mut h = harness(vec![spec(10.0)], vec![]);
        for _ in 0..ECC_READ_FAILURE_LOG_EVERY {
            h.status.push_failure(StatusUnit::MemoryController);
        }

        for _ in 1..ECC_READ_FAILURE_LOG_EVERY {
            assert_eq!(h.monitor.poll_once().await, None);
        }
        assert!(!logs_contain("cannot read memory controller ECC status"));
        assert_eq!(h.monitor.poll_once().await, None);
        assert!(logs_contain("cannot read memory controller ECC status"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_failed_reads_quickly() {
        let h = harness(vec![], vec![]);
        h.status.push_failure(StatusUnit::MemoryController);
        h.status.set(StatusUnit::MemoryController, 0);
        let monitor = h.monitor.with_interval(Duration::from_secs(10));

        let store: Arc<dyn FlagStore> = h.store.clone();
        let _ = tokio::time::timeout(Duration::from_secs(13), monitor.run(store)).await;

        // t=0 fails, t=2 succeeds, t=12 succeeds
        assert_eq!(h.status.reads_of(StatusUnit::MemoryController), 3);
        assert_eq!(h.store.value("flag_healthd_ecc").as_deref(), Some("1"));
    }
}
