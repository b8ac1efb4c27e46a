//! Node-manager (ME) self-test monitor.
//!
//! Every server slot's node manager is asked for its self-test result. `55 00` is normal.
//! A missing answer and an abnormal answer each have their own retry counter; once a
//! counter reaches the configured threshold its condition asserts, once. A normal answer
//! deasserts both and resets the counters.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::hardware::capabilities::NodeManagerLink;
use crate::health::rearm::LatchGroup;
use crate::health::threshold::{log_at, Severity};
use crate::limits::{DEFAULT_MAX_FRUS, DEFAULT_MONITOR_INTERVAL, NM_SELFTEST_OK};

/// Result of one FRU's self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestOutcome {
    /// Not a server slot, or a firmware update is ongoing
    Skipped,
    /// Answered `55 00`
    Normal,
    /// Answered something else
    Abnormal([u8; 2]),
    /// Did not answer
    NoResponse,
}

#[derive(Debug, Default, Clone, Copy)]
struct FruState {
    no_response_retry: u8,
    abnormal_retry: u8,
    unavailable: bool,
    degraded: bool,
}

/// Per-FRU retry counters and latches, shared with the rearm coordinator.
#[derive(Debug, Default)]
pub struct NodeManagerLatches {
    frus: Mutex<BTreeMap<u8, FruState>>,
}

impl NodeManagerLatches {
    /// No FRU latched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `fru` has the "Controller Unavailable" condition asserted.
    pub fn is_unavailable(&self, fru: u8) -> bool {
        self.frus.lock().get(&fru).is_some_and(|s| s.unavailable)
    }

    /// Whether `fru` has the "Controller Access Degraded or Unavailable" condition asserted.
    pub fn is_degraded(&self, fru: u8) -> bool {
        self.frus.lock().get(&fru).is_some_and(|s| s.degraded)
    }
}

impl LatchGroup for NodeManagerLatches {
    fn name(&self) -> &str {
        "ME Status"
    }

    fn rearm_critical(&self) -> usize {
        let mut cleared = 0;
        for state in self.frus.lock().values_mut() {
            cleared += usize::from(std::mem::take(&mut state.unavailable));
            cleared += usize::from(std::mem::take(&mut state.degraded));
        }
        cleared
    }
}

/// Scans FRUs `1..=max_frus` for node-manager health.
pub struct NodeManagerMonitor {
    link: Arc<dyn NodeManagerLink>,
    latches: Arc<NodeManagerLatches>,
    retry_threshold: u8,
    max_frus: u8,
    interval: Duration,
}

impl NodeManagerMonitor {
    /// Monitor asserting after `retry_threshold` consecutive non-normal answers.
    pub fn new(link: Arc<dyn NodeManagerLink>, retry_threshold: u8) -> Self {
        Self {
            link,
            latches: Arc::new(NodeManagerLatches::new()),
            retry_threshold,
            max_frus: DEFAULT_MAX_FRUS,
            interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    /// Highest FRU scanned.
    pub fn with_max_frus(mut self, max_frus: u8) -> Self {
        self.max_frus = max_frus;
        self
    }

    /// Time between scans.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Latches to register with the rearm coordinator.
    pub fn latches(&self) -> Arc<NodeManagerLatches> {
        Arc::clone(&self.latches)
    }

    /// Self-test one FRU and update its conditions.
    pub async fn self_test_fru(&self, fru: u8) -> SelfTestOutcome {
        match self.link.is_server_slot(fru).await {
            Ok(true) => {}
            Ok(false) => return SelfTestOutcome::Skipped,
            Err(e) => {
                tracing::debug!(fru, error = %e, "slot type unavailable");
                return SelfTestOutcome::Skipped;
            }
        }
        match self.link.update_ongoing(fru).await {
            Ok(true) => return SelfTestOutcome::Skipped,
            Ok(false) => {}
            Err(e) => tracing::debug!(fru, error = %e, "update state unavailable, testing anyway"),
        }

        let outcome = match self.link.self_test(fru).await {
            Ok(answer) if answer == NM_SELFTEST_OK => SelfTestOutcome::Normal,
            Ok(answer) => SelfTestOutcome::Abnormal(answer),
            Err(e) => {
                tracing::debug!(fru, error = %e, "node manager self-test got no response");
                SelfTestOutcome::NoResponse
            }
        };
        let fru_name = self.link.fru_name(fru);
        tracing::debug!(
            fru_name = %fru_name,
            fru,
            ?outcome,
            retry_threshold = self.retry_threshold,
            "node manager self-test"
        );
        self.record(fru, &fru_name, outcome);
        outcome
    }

    fn record(&self, fru: u8, fru_name: &str, outcome: SelfTestOutcome) {
        let mut frus = self.latches.frus.lock();
        let state = frus.entry(fru).or_default();
        match outcome {
            SelfTestOutcome::Skipped => {}
            SelfTestOutcome::NoResponse => {
                if state.no_response_retry >= self.retry_threshold {
                    if !state.unavailable {
                        state.unavailable = true;
                        log_at(
                            Severity::Critical,
                            &format!("ASSERT: ME Status - Controller Unavailable on the {fru_name}"),
                        );
                    }
                } else {
                    state.no_response_retry += 1;
                }
            }
            SelfTestOutcome::Abnormal([first, second]) => {
                if state.abnormal_retry >= self.retry_threshold {
                    if !state.degraded {
                        state.degraded = true;
                        log_at(
                            Severity::Critical,
                            &format!(
                                "ASSERT: ME Status - Controller Access Degraded or Unavailable on the {fru_name}, result: {first:02X}h, {second:02X}h"
                            ),
                        );
                    }
                } else {
                    state.abnormal_retry += 1;
                }
            }
            SelfTestOutcome::Normal => {
                if state.degraded {
                    log_at(
                        Severity::Critical,
                        &format!(
                            "DEASSERT: ME Status - Controller Access Degraded or Unavailable on the {fru_name}"
                        ),
                    );
                }
                if state.unavailable {
                    log_at(
                        Severity::Critical,
                        &format!("DEASSERT: ME Status - Controller Unavailable on the {fru_name}"),
                    );
                }
                *state = FruState::default();
            }
        }
    }

    /// Self-test every FRU once.
    pub async fn poll_once(&self) -> Vec<(u8, SelfTestOutcome)> {
        let mut outcomes = Vec::with_capacity(usize::from(self.max_frus));
        for fru in 1..=self.max_frus {
            outcomes.push((fru, self.self_test_fru(fru).await));
        }
        outcomes
    }

    /// Scan forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockNodeManager;
    use tracing_test::traced_test;

    fn monitor(threshold: u8) -> (NodeManagerMonitor, Arc<MockNodeManager>) {
        let link = Arc::new(MockNodeManager::new([1, 3]));
        (NodeManagerMonitor::new(link.clone(), threshold), link)
    }

    #[tokio::test]
    async fn scans_only_idle_server_slots() {
        let (monitor, link) = monitor(0);
        link.set_updating(3, true);

        let outcomes = monitor.poll_once().await;
        assert_eq!(
            outcomes,
            [
                (1, SelfTestOutcome::Normal),
                (2, SelfTestOutcome::Skipped),
                (3, SelfTestOutcome::Skipped),
                (4, SelfTestOutcome::Skipped),
            ]
        );
        assert_eq!(link.tested(), [1]);
    }

    #[tokio::test]
    #[traced_test]
    async fn no_response_asserts_after_retries_then_deasserts() {
        let (monitor, link) = monitor(2);
        link.set_answer(1, None);

        for _ in 0..2 {
            monitor.self_test_fru(1).await;
            assert!(!monitor.latches().is_unavailable(1));
        }
        monitor.self_test_fru(1).await;
        monitor.self_test_fru(1).await;
        assert!(monitor.latches().is_unavailable(1));
        assert!(logs_contain("ASSERT: ME Status - Controller Unavailable on the slot1"));

        link.set_answer(1, Some(NM_SELFTEST_OK));
        assert_eq!(monitor.self_test_fru(1).await, SelfTestOutcome::Normal);
        assert!(!monitor.latches().is_unavailable(1));
        assert!(logs_contain("DEASSERT: ME Status - Controller Unavailable on the slot1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn abnormal_answer_reports_result_bytes() {
        let (monitor, link) = monitor(0);
        link.set_answer(3, Some([0x56, 0x02]));

        assert_eq!(
            monitor.self_test_fru(3).await,
            SelfTestOutcome::Abnormal([0x56, 0x02])
        );
        assert!(monitor.latches().is_degraded(3));
        assert!(logs_contain(
            "ASSERT: ME Status - Controller Access Degraded or Unavailable on the slot3, result: 56h, 02h"
        ));
    }

    #[tokio::test]
    async fn rearm_clears_both_latches_so_they_relog() {
        let (monitor, link) = monitor(0);
        let latches = monitor.latches();
        link.set_answer(1, None);
        link.set_answer(3, Some([0x57, 0x00]));
        monitor.poll_once().await;

        assert_eq!(latches.rearm_critical(), 2);
        assert!(!latches.is_unavailable(1));
        assert!(!latches.is_degraded(3));

        monitor.poll_once().await;
        assert!(latches.is_unavailable(1));
        assert!(latches.is_degraded(3));
    }
}
