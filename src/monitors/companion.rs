//! Companion-controller (BIC) health monitor.
//!
//! Each cycle runs the ordered checks against the companion controller of one FRU and stops
//! at the first failing one. Consecutive failed cycles feed an [`EscalationCounter`]; at the
//! limit the controller is hard-reset once and the failure history is logged.

use std::sync::Arc;
use std::time::Duration;

use crate::error::HealthdError;
use crate::hardware::capabilities::{CompanionCheck, CompanionLink, FlagStore, RecoveryActions};
use crate::health::escalation::EscalationCounter;
use crate::health::threshold::{log_at, Severity};
use crate::limits::{DEFAULT_BIC_ESCALATION_LIMIT, DEFAULT_BIC_INTERVAL};
use crate::monitors::mark_ready;
use crate::monitors::node_manager::NodeManagerMonitor;

/// Default check order.
pub const DEFAULT_CHECKS: [CompanionCheck; 3] = [
    CompanionCheck::Ready,
    CompanionCheck::Heartbeat,
    CompanionCheck::Ipmb,
];

/// What one cycle observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// 12 V off or unreadable; nothing was checked
    PoweredOff,
    /// Firmware update running; the failure streak was cleared
    Updating,
    /// Every check passed
    Healthy,
    /// This check failed first
    Failed(CompanionCheck),
}

/// Result of [`CompanionMonitor::poll_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanionCycle {
    /// Observation of this cycle
    pub status: CycleStatus,
    /// The controller was reset during this cycle
    pub escalated: bool,
}

/// Health checks and escalation for the companion controller of one FRU.
pub struct CompanionMonitor {
    fru: u8,
    link: Arc<dyn CompanionLink>,
    actions: Arc<dyn RecoveryActions>,
    checks: Vec<CompanionCheck>,
    counter: EscalationCounter<CompanionCheck>,
    node_manager: Option<Arc<NodeManagerMonitor>>,
    interval: Duration,
}

impl CompanionMonitor {
    /// Monitor of the companion controller in `fru`.
    pub fn new(fru: u8, link: Arc<dyn CompanionLink>, actions: Arc<dyn RecoveryActions>) -> Self {
        Self {
            fru,
            link,
            actions,
            checks: DEFAULT_CHECKS.to_vec(),
            counter: EscalationCounter::new(DEFAULT_BIC_ESCALATION_LIMIT),
            node_manager: None,
            interval: DEFAULT_BIC_INTERVAL,
        }
    }

    /// Failed cycles before the reset.
    pub fn with_escalation_limit(mut self, limit: u32) -> Self {
        self.counter = EscalationCounter::new(limit);
        self
    }

    /// Replace the check order.
    pub fn with_checks(mut self, checks: impl IntoIterator<Item = CompanionCheck>) -> Self {
        self.checks = checks.into_iter().collect();
        self
    }

    /// Run the node-manager self-test of this FRU after every healthy cycle.
    pub fn with_node_manager(mut self, node_manager: Arc<NodeManagerMonitor>) -> Self {
        self.node_manager = Some(node_manager);
        self
    }

    /// Time between cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Escalation state.
    pub fn counter(&self) -> &EscalationCounter<CompanionCheck> {
        &self.counter
    }

    /// Run one cycle.
    pub async fn poll_once(&mut self) -> CompanionCycle {
        let fru = self.fru;
        let powered = match self.link.power_good(fru).await {
            Ok(on) => on,
            Err(e) => {
                tracing::debug!(fru, error = %e, "12V state unavailable");
                false
            }
        };

        let status = if powered {
            if self.link.update_in_progress(fru).await.unwrap_or(false) {
                self.counter.reset();
                return CompanionCycle {
                    status: CycleStatus::Updating,
                    escalated: false,
                };
            }
            self.run_checks().await
        } else {
            CycleStatus::PoweredOff
        };

        let escalated = self.escalate_if_due().await;
        CompanionCycle { status, escalated }
    }

    async fn run_checks(&mut self) -> CycleStatus {
        let fru = self.fru;
        for &check in &self.checks {
            let passed = match self.link.run_check(fru, check).await {
                Ok(passed) => passed,
                Err(e) => {
                    tracing::debug!(fru, %check, error = %e, "check could not run");
                    false
                }
            };
            if !passed {
                let failures = self.counter.failures() + 1;
                tracing::warn!(fru, %check, failures, "BIC health check failed");
                self.counter.record_failure(check);
                return CycleStatus::Failed(check);
            }
        }

        self.counter.record_success();
        if let Some(node_manager) = &self.node_manager {
            node_manager.self_test_fru(fru).await;
        }
        CycleStatus::Healthy
    }

    async fn escalate_if_due(&mut self) -> bool {
        if !self.counter.should_escalate() {
            return false;
        }
        if let Err(e) = self.actions.hardware_reset(self.fru).await {
            let e = HealthdError::hook("hardware_reset", &e);
            tracing::error!(fru = self.fru, error = %e, "BIC reset failed, retrying next cycle");
            return false;
        }
        let reasons = self.counter.escalation_succeeded();
        let order = reasons
            .iter()
            .map(CompanionCheck::label)
            .collect::<Vec<_>>()
            .join(", ");
        log_at(
            Severity::Critical,
            &format!(
                "FRU {} BIC reset by BIC health monitor due to health check failed in following order: {order}",
                self.fru
            ),
        );
        true
    }

    /// Cycle forever.
    pub async fn run(mut self, store: Arc<dyn FlagStore>) {
        mark_ready(store.as_ref(), "bic_health").await;
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
