//! Reaction dispatch for threshold transitions.
//!
//! Monitors evaluate their [`ThresholdSet`](crate::health::threshold::ThresholdSet) and hand
//! every edge to a [`ReactionDispatcher`] together with the pre-formatted log line. Hook
//! failures are logged and never stop the dispatch.

use std::sync::Arc;
use std::time::Duration;

use crate::error::HealthdError;
use crate::hardware::capabilities::RecoveryActions;
use crate::health::aggregate::{AggregateFaultBitmap, FaultBit};
use crate::health::threshold::{log_at, ReactionKind, ThresholdSpec, Transition};

/// Pause between the reboot log line and the reboot request.
const REBOOT_LOG_GRACE: Duration = Duration::from_secs(1);

/// Runs the configured reactions of one metric.
#[derive(Clone)]
pub struct ReactionDispatcher {
    name: String,
    fault_bit: Option<FaultBit>,
    bitmap: Arc<AggregateFaultBitmap>,
    actions: Arc<dyn RecoveryActions>,
}

impl ReactionDispatcher {
    /// Dispatcher for metric `name`, owning `fault_bit` in the aggregate bitmap if any.
    pub fn new(
        name: impl Into<String>,
        fault_bit: Option<FaultBit>,
        bitmap: Arc<AggregateFaultBitmap>,
        actions: Arc<dyn RecoveryActions>,
    ) -> Self {
        Self {
            name: name.into(),
            fault_bit,
            bitmap,
            actions,
        }
    }

    /// Metric name, also the tag passed to the error hooks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the reactions for `transition` of `spec`.
    ///
    /// `message` is the line logged by the `Log` reaction. If `spec` carries `Reboot` on an
    /// assert edge this never returns.
    pub async fn dispatch(&self, spec: &ThresholdSpec, transition: Transition, message: &str) {
        if transition.newly_asserted {
            self.on_assert(spec, message).await;
        } else if transition.newly_deasserted {
            self.on_deassert(spec, message).await;
        }
    }

    async fn on_assert(&self, spec: &ThresholdSpec, message: &str) {
        if spec.has(ReactionKind::Log) {
            log_at(spec.severity, message);
        }
        if spec.has(ReactionKind::Reboot) {
            self.reboot(spec).await;
        }
        if spec.has(ReactionKind::ErrorTrigger) {
            if let Some(bit) = self.fault_bit {
                self.bitmap.set_bit(bit).await;
                if let Err(e) = self.actions.error_enable(&self.name).await {
                    let e = HealthdError::hook("error_enable", &e);
                    tracing::warn!(metric = %self.name, error = %e, "error enable hook failed");
                }
            }
        }
        if spec.has(ReactionKind::MemClear) {
            if let Err(e) = self.actions.mem_clear().await {
                let e = HealthdError::hook("mem_clear", &e);
                tracing::error!(error = %e, "Clear BMC Memory failed");
            }
        }
    }

    async fn on_deassert(&self, spec: &ThresholdSpec, message: &str) {
        if spec.has(ReactionKind::Log) {
            log_at(spec.severity, message);
        }
        if spec.has(ReactionKind::ErrorTrigger) {
            if let Some(bit) = self.fault_bit {
                self.bitmap.clear_bit(bit).await;
                if let Err(e) = self.actions.error_disable(&self.name).await {
                    let e = HealthdError::hook("error_disable", &e);
                    tracing::warn!(metric = %self.name, error = %e, "error disable hook failed");
                }
            }
        }
    }

    async fn reboot(&self, spec: &ThresholdSpec) {
        log_at(
            spec.severity,
            &format!("Rebooting BMC; latest uptime: {} sec", sysinfo::System::uptime()),
        );
        tokio::time::sleep(REBOOT_LOG_GRACE).await;
        if let Err(e) = self.actions.reboot().await {
            let e = HealthdError::hook("reboot", &e);
            tracing::error!(error = %e, "reboot request failed");
        }
        // The reboot terminates the process; nothing else may run for this metric.
        std::future::pending::<()>().await;
    }
}

impl std::fmt::Debug for ReactionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactionDispatcher")
            .field("name", &self.name)
            .field("fault_bit", &self.fault_bit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ActionCall, MemoryFlagStore, RecordingActions};
    use crate::health::threshold::Severity;
    use crate::limits::KEY_BMC_HEALTH;
    use tracing_test::traced_test;

    struct Harness {
        dispatcher: ReactionDispatcher,
        store: Arc<MemoryFlagStore>,
        actions: Arc<RecordingActions>,
    }

    fn harness(bit: Option<FaultBit>) -> Harness {
        let store = Arc::new(MemoryFlagStore::new());
        let actions = Arc::new(RecordingActions::new());
        let bitmap = Arc::new(AggregateFaultBitmap::new(store.clone()));
        Harness {
            dispatcher: ReactionDispatcher::new(
                "BMC CPU utilization",
                bit,
                bitmap,
                actions.clone(),
            ),
            store,
            actions,
        }
    }

    fn asserted(spec: &mut ThresholdSpec) -> Transition {
        spec.evaluate(spec.limit)
    }

    #[tokio::test]
    #[traced_test]
    async fn log_reaction_uses_spec_severity() {
        let h = harness(None);
        let mut spec =
            ThresholdSpec::new(90.0, 5.0, Severity::Critical).with_reaction(ReactionKind::Log);
        let edge = asserted(&mut spec);
        h.dispatcher.dispatch(&spec, edge, "ASSERT: cpu high").await;
        assert!(logs_contain("ASSERT: cpu high"));
        assert!(logs_contain("critical"));
        assert!(h.actions.calls().is_empty());
    }

    #[tokio::test]
    async fn error_trigger_sets_and_clears_the_bit() {
        let h = harness(Some(FaultBit::Cpu));
        let mut spec = ThresholdSpec::new(90.0, 5.0, Severity::Warning)
            .with_reaction(ReactionKind::ErrorTrigger);

        let edge = asserted(&mut spec);
        h.dispatcher.dispatch(&spec, edge, "").await;
        assert_eq!(h.store.writes_for(KEY_BMC_HEALTH), ["0"]);

        let edge = spec.evaluate(10.0);
        h.dispatcher.dispatch(&spec, edge, "").await;
        assert_eq!(h.store.writes_for(KEY_BMC_HEALTH), ["0", "1"]);
        assert_eq!(
            h.actions.calls(),
            [
                ActionCall::ErrorEnable("BMC CPU utilization".into()),
                ActionCall::ErrorDisable("BMC CPU utilization".into())
            ]
        );
    }

    #[tokio::test]
    async fn error_trigger_without_a_bit_is_inert() {
        let h = harness(None);
        let mut spec = ThresholdSpec::new(90.0, 5.0, Severity::Warning)
            .with_reaction(ReactionKind::ErrorTrigger);
        let edge = asserted(&mut spec);
        h.dispatcher.dispatch(&spec, edge, "").await;
        assert!(h.store.writes_for(KEY_BMC_HEALTH).is_empty());
        assert!(h.actions.calls().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn mem_clear_failure_is_logged() {
        let h = harness(None);
        h.actions.fail_hook("mem_clear");
        let mut spec =
            ThresholdSpec::new(90.0, 0.0, Severity::Warning).with_reaction(ReactionKind::MemClear);
        let edge = asserted(&mut spec);
        h.dispatcher.dispatch(&spec, edge, "").await;
        assert_eq!(h.actions.count(&ActionCall::MemClear), 1);
        assert!(logs_contain("Clear BMC Memory failed"));
        assert!(logs_contain("mem_clear failed: mem_clear failed"));

        // deassert does not clear memory again
        let edge = spec.evaluate(0.0);
        h.dispatcher.dispatch(&spec, edge, "").await;
        assert_eq!(h.actions.count(&ActionCall::MemClear), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn reboot_logs_uptime_then_blocks() {
        let h = harness(Some(FaultBit::Cpu));
        let mut spec = ThresholdSpec::new(90.0, 0.0, Severity::Critical)
            .with_reaction(ReactionKind::Reboot)
            .with_reaction(ReactionKind::ErrorTrigger);
        let edge = asserted(&mut spec);

        let blocked = tokio::time::timeout(
            Duration::from_secs(5),
            h.dispatcher.dispatch(&spec, edge, ""),
        )
        .await;

        assert!(blocked.is_err(), "dispatch must not return after a reboot");
        assert_eq!(h.actions.calls(), [ActionCall::Reboot]);
        assert!(h.store.writes_for(KEY_BMC_HEALTH).is_empty(), "nothing after reboot");
        assert!(logs_contain("Rebooting BMC; latest uptime:"));
    }
}
