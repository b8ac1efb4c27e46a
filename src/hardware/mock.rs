//! Mock Collaborator Implementations
//!
//! Provides scripted, in-memory collaborators for tests and for `run --simulate`.
//! All mocks are cheap to share behind an `Arc` and use `parking_lot` locks that are never
//! held across an `.await`.
//!
//! # Available Mocks
//!
//! - `MockMetrics` - scripted CPU/memory fractions with a steady fallback
//! - `MockStatusWords` - scripted status words per unit
//! - `MockCompanion` - companion-controller power, update and check results
//! - `MockNodeManager` - node-manager self-test answers per FRU
//! - `MemoryFlagStore` - key-value store with a write history
//! - `RecordingActions` - records every hook call, optionally failing chosen hooks

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::hardware::capabilities::{
    CompanionCheck, CompanionLink, FlagStore, Metric, MetricSource, NodeManagerLink,
    RecoveryActions, StatusUnit, StatusWordSource,
};

// =============================================================================
// MockMetrics
// =============================================================================

/// Scripted utilization source.
///
/// Queued samples are served first (`None` entries fail the read); once a metric's queue
/// is empty its steady value is returned, or an error if none is set.
#[derive(Debug, Default)]
pub struct MockMetrics {
    scripted: Mutex<HashMap<Metric, VecDeque<Option<f64>>>>,
    steady: Mutex<HashMap<Metric, f64>>,
}

impl MockMetrics {
    /// Source with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set_steady`](Self::set_steady).
    pub fn with_steady(self, metric: Metric, fraction: f64) -> Self {
        self.set_steady(metric, fraction);
        self
    }

    /// Value returned once the script for `metric` is exhausted.
    pub fn set_steady(&self, metric: Metric, fraction: f64) {
        self.steady.lock().insert(metric, fraction);
    }

    /// Queue samples for `metric`.
    pub fn push(&self, metric: Metric, fractions: impl IntoIterator<Item = f64>) {
        self.scripted
            .lock()
            .entry(metric)
            .or_default()
            .extend(fractions.into_iter().map(Some));
    }

    /// Queue `count` failed reads for `metric`.
    pub fn push_failures(&self, metric: Metric, count: usize) {
        self.scripted
            .lock()
            .entry(metric)
            .or_default()
            .extend(std::iter::repeat(None).take(count));
    }
}

#[async_trait]
impl MetricSource for MockMetrics {
    async fn sample(&self, metric: Metric) -> Result<f64> {
        let scripted = self
            .scripted
            .lock()
            .get_mut(&metric)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(anyhow!("scripted read failure for {}", metric.name())),
            None => self
                .steady
                .lock()
                .get(&metric)
                .copied()
                .ok_or_else(|| anyhow!("no sample configured for {}", metric.name())),
        }
    }
}

// =============================================================================
// MockStatusWords
// =============================================================================

/// Scripted status registers, same queue-then-steady behaviour as [`MockMetrics`].
#[derive(Debug, Default)]
pub struct MockStatusWords {
    scripted: Mutex<HashMap<StatusUnit, VecDeque<Option<u32>>>>,
    steady: Mutex<HashMap<StatusUnit, u32>>,
    reads: Mutex<HashMap<StatusUnit, usize>>,
}

impl MockStatusWords {
    /// Source with nothing configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Steady word of `unit`.
    pub fn set(&self, unit: StatusUnit, word: u32) {
        self.steady.lock().insert(unit, word);
    }

    /// Queue one word for `unit`.
    pub fn push(&self, unit: StatusUnit, word: u32) {
        self.scripted.lock().entry(unit).or_default().push_back(Some(word));
    }

    /// Queue one failed read for `unit`.
    pub fn push_failure(&self, unit: StatusUnit) {
        self.scripted.lock().entry(unit).or_default().push_back(None);
    }

    /// Number of reads issued against `unit`.
    pub fn reads_of(&self, unit: StatusUnit) -> usize {
        self.reads.lock().get(&unit).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StatusWordSource for MockStatusWords {
    async fn read_status(&self, unit: StatusUnit) -> Result<u32> {
        *self.reads.lock().entry(unit).or_default() += 1;
        let scripted = self
            .scripted
            .lock()
            .get_mut(&unit)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Some(word)) => Ok(word),
            Some(None) => Err(anyhow!("scripted read failure for {unit}")),
            None => self
                .steady
                .lock()
                .get(&unit)
                .copied()
                .ok_or_else(|| anyhow!("{unit} is not present")),
        }
    }
}

// =============================================================================
// MockCompanion
// =============================================================================

/// Companion controller whose checks all pass until told otherwise.
#[derive(Debug)]
pub struct MockCompanion {
    power_good: Mutex<Option<bool>>,
    updating: Mutex<bool>,
    results: Mutex<HashMap<CompanionCheck, VecDeque<bool>>>,
    runs: Mutex<Vec<CompanionCheck>>,
}

impl Default for MockCompanion {
    fn default() -> Self {
        Self {
            power_good: Mutex::new(Some(true)),
            updating: Mutex::new(false),
            results: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
        }
    }
}

impl MockCompanion {
    /// Powered, idle companion with passing checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// 12 V state; `None` makes the power read fail.
    pub fn set_power_good(&self, state: Option<bool>) {
        *self.power_good.lock() = state;
    }

    /// Firmware-update state.
    pub fn set_updating(&self, updating: bool) {
        *self.updating.lock() = updating;
    }

    /// Queue results for `check`; the last queued result sticks.
    pub fn script(&self, check: CompanionCheck, results: impl IntoIterator<Item = bool>) {
        self.results.lock().entry(check).or_default().extend(results);
    }

    /// Checks run so far, in order.
    pub fn runs(&self) -> Vec<CompanionCheck> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl CompanionLink for MockCompanion {
    async fn power_good(&self, fru: u8) -> Result<bool> {
        (*self.power_good.lock()).ok_or_else(|| anyhow!("cannot read 12V state of FRU {fru}"))
    }

    async fn update_in_progress(&self, _fru: u8) -> Result<bool> {
        Ok(*self.updating.lock())
    }

    async fn run_check(&self, _fru: u8, check: CompanionCheck) -> Result<bool> {
        self.runs.lock().push(check);
        let mut results = self.results.lock();
        let queue = results.entry(check).or_default();
        let result = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        Ok(result.unwrap_or(true))
    }
}

// =============================================================================
// MockNodeManager
// =============================================================================

/// Node managers in every server slot answer `55 00` unless overridden.
#[derive(Debug, Default)]
pub struct MockNodeManager {
    server_slots: Mutex<HashSet<u8>>,
    updating: Mutex<HashSet<u8>>,
    answers: Mutex<HashMap<u8, Option<[u8; 2]>>>,
    tests: Mutex<Vec<u8>>,
}

impl MockNodeManager {
    /// Node managers in `server_slots`.
    pub fn new(server_slots: impl IntoIterator<Item = u8>) -> Self {
        Self {
            server_slots: Mutex::new(server_slots.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Self-test answer of `fru`; `None` means no response.
    pub fn set_answer(&self, fru: u8, answer: Option<[u8; 2]>) {
        self.answers.lock().insert(fru, answer);
    }

    /// Firmware-update state of `fru`.
    pub fn set_updating(&self, fru: u8, updating: bool) {
        let mut set = self.updating.lock();
        if updating {
            set.insert(fru);
        } else {
            set.remove(&fru);
        }
    }

    /// FRUs self-tested so far, in order.
    pub fn tested(&self) -> Vec<u8> {
        self.tests.lock().clone()
    }
}

#[async_trait]
impl NodeManagerLink for MockNodeManager {
    async fn is_server_slot(&self, fru: u8) -> Result<bool> {
        Ok(self.server_slots.lock().contains(&fru))
    }

    async fn update_ongoing(&self, fru: u8) -> Result<bool> {
        Ok(self.updating.lock().contains(&fru))
    }

    async fn self_test(&self, fru: u8) -> Result<[u8; 2]> {
        self.tests.lock().push(fru);
        match self.answers.lock().get(&fru) {
            Some(Some(answer)) => Ok(*answer),
            Some(None) => Err(anyhow!("no response from node manager on slot{fru}")),
            None => Ok([0x55, 0x00]),
        }
    }
}

// =============================================================================
// MemoryFlagStore
// =============================================================================

/// In-memory [`FlagStore`] recording every write.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    values: Mutex<HashMap<String, String>>,
    history: Mutex<Vec<(String, String)>>,
    fail_reads: Mutex<bool>,
    fail_writes: Mutex<bool>,
}

impl MemoryFlagStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `key` as another service would, without recording a write.
    pub fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    /// Current value of `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// Values written to `key` through [`FlagStore::persist_flag`], oldest first.
    pub fn writes_for(&self, key: &str) -> Vec<String> {
        self.history
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Make reads fail.
    pub fn fail_reads(&self, fail: bool) {
        *self.fail_reads.lock() = fail;
    }

    /// Make writes fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn read_flag(&self, key: &str) -> Result<Option<String>> {
        if *self.fail_reads.lock() {
            return Err(anyhow!("kv store unavailable"));
        }
        Ok(self.value(key))
    }

    async fn persist_flag(&self, key: &str, value: &str) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(anyhow!("kv store unavailable"));
        }
        self.set(key, value);
        self.history.lock().push((key.to_string(), value.to_string()));
        Ok(())
    }
}

// =============================================================================
// RecordingActions
// =============================================================================

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionCall {
    /// [`RecoveryActions::reboot`]
    Reboot,
    /// [`RecoveryActions::hardware_reset`]
    HardwareReset(u8),
    /// [`RecoveryActions::error_enable`]
    ErrorEnable(String),
    /// [`RecoveryActions::error_disable`]
    ErrorDisable(String),
    /// [`RecoveryActions::mem_clear`]
    MemClear,
    /// [`RecoveryActions::bus_recovery_assist`]
    BusRecoveryAssist(u8),
    /// [`RecoveryActions::bus_recovered`]
    BusRecovered(u8),
    /// [`RecoveryActions::set_heartbeat_led`]
    HeartbeatLed(bool),
    /// [`RecoveryActions::tune_memory`]
    TuneMemory {
        /// Panic on OOM requested
        panic_on_oom: bool,
        /// Reserved free memory
        min_free_kbytes: Option<u32>,
    },
}

impl ActionCall {
    /// Hook name used with [`RecordingActions::fail_hook`].
    pub fn hook(&self) -> &'static str {
        match self {
            ActionCall::Reboot => "reboot",
            ActionCall::HardwareReset(_) => "hardware_reset",
            ActionCall::ErrorEnable(_) => "error_enable",
            ActionCall::ErrorDisable(_) => "error_disable",
            ActionCall::MemClear => "mem_clear",
            ActionCall::BusRecoveryAssist(_) => "bus_recovery_assist",
            ActionCall::BusRecovered(_) => "bus_recovered",
            ActionCall::HeartbeatLed(_) => "set_heartbeat_led",
            ActionCall::TuneMemory { .. } => "tune_memory",
        }
    }
}

/// [`RecoveryActions`] that records calls instead of touching the system.
#[derive(Debug, Default)]
pub struct RecordingActions {
    calls: Mutex<Vec<ActionCall>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingActions {
    /// Recorder where every hook succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `hook` fail (it is still recorded).
    pub fn fail_hook(&self, hook: &'static str) {
        self.failing.lock().insert(hook);
    }

    /// Let `hook` succeed again.
    pub fn heal_hook(&self, hook: &'static str) {
        self.failing.lock().remove(hook);
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &ActionCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: ActionCall) -> Result<()> {
        tracing::debug!(?call, "hook invoked");
        let hook = call.hook();
        self.calls.lock().push(call);
        if self.failing.lock().contains(hook) {
            return Err(anyhow!("{hook} failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryActions for RecordingActions {
    async fn reboot(&self) -> Result<()> {
        self.record(ActionCall::Reboot)
    }

    async fn hardware_reset(&self, fru: u8) -> Result<()> {
        self.record(ActionCall::HardwareReset(fru))
    }

    async fn error_enable(&self, tag: &str) -> Result<()> {
        self.record(ActionCall::ErrorEnable(tag.to_string()))
    }

    async fn error_disable(&self, tag: &str) -> Result<()> {
        self.record(ActionCall::ErrorDisable(tag.to_string()))
    }

    async fn mem_clear(&self) -> Result<()> {
        self.record(ActionCall::MemClear)
    }

    async fn bus_recovery_assist(&self, bus: u8) -> Result<()> {
        self.record(ActionCall::BusRecoveryAssist(bus))
    }

    async fn bus_recovered(&self, bus: u8) -> Result<()> {
        self.record(ActionCall::BusRecovered(bus))
    }

    async fn set_heartbeat_led(&self, on: bool) -> Result<()> {
        self.record(ActionCall::HeartbeatLed(on))
    }

    async fn tune_memory(&self, panic_on_oom: bool, min_free_kbytes: Option<u32>) -> Result<()> {
        self.record(ActionCall::TuneMemory {
            panic_on_oom,
            min_free_kbytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_serve_script_then_steady_value() {
        let metrics = MockMetrics::new().with_steady(Metric::CpuUtilization, 0.5);
        metrics.push(Metric::CpuUtilization, [0.9]);
        metrics.push_failures(Metric::CpuUtilization, 1);

        assert_eq!(metrics.sample(Metric::CpuUtilization).await.unwrap(), 0.9);
        assert!(metrics.sample(Metric::CpuUtilization).await.is_err());
        assert_eq!(metrics.sample(Metric::CpuUtilization).await.unwrap(), 0.5);
        assert!(metrics.sample(Metric::MemoryUtilization).await.is_err());
    }

    #[tokio::test]
    async fn status_words_count_reads() {
        let words = MockStatusWords::new();
        words.set(StatusUnit::I2cBus(1), 0);
        words.push(StatusUnit::I2cBus(1), 0x11);

        assert_eq!(words.read_status(StatusUnit::I2cBus(1)).await.unwrap(), 0x11);
        assert_eq!(words.read_status(StatusUnit::I2cBus(1)).await.unwrap(), 0);
        assert!(words.read_status(StatusUnit::I2cBus(2)).await.is_err());
        assert_eq!(words.reads_of(StatusUnit::I2cBus(1)), 2);
    }

    #[tokio::test]
    async fn companion_last_scripted_result_sticks() {
        let companion = MockCompanion::new();
        companion.script(CompanionCheck::Heartbeat, [true, false]);

        assert!(companion.run_check(1, CompanionCheck::Heartbeat).await.unwrap());
        assert!(!companion.run_check(1, CompanionCheck::Heartbeat).await.unwrap());
        assert!(!companion.run_check(1, CompanionCheck::Heartbeat).await.unwrap());
        assert!(companion.run_check(1, CompanionCheck::Ipmb).await.unwrap());
    }

    #[tokio::test]
    async fn flag_store_records_writes_but_not_seeds() {
        let store = MemoryFlagStore::new();
        store.set("bmc_health", "1");
        store.persist_flag("bmc_health", "0").await.unwrap();

        assert_eq!(store.writes_for("bmc_health"), ["0"]);
        assert_eq!(store.read_flag("bmc_health").await.unwrap().as_deref(), Some("0"));

        store.fail_reads(true);
        assert!(store.read_flag("bmc_health").await.is_err());
    }

    #[tokio::test]
    async fn failing_hook_is_still_recorded() {
        let actions = RecordingActions::new();
        actions.fail_hook("hardware_reset");

        assert!(actions.hardware_reset(2).await.is_err());
        assert!(actions.mem_clear().await.is_ok());
        assert_eq!(actions.count(&ActionCall::HardwareReset(2)), 1);

        actions.heal_hook("hardware_reset");
        assert!(actions.hardware_reset(2).await.is_ok());
    }
}
