//! Shared constants for the health daemon.
//!
//! This module centralizes:
//! - Default poll intervals and retry budgets
//! - Hardware counter maxima and bus cardinality
//! - Persisted key names shared with other BMC services
//!
//! Using centralized constants keeps the monitor tasks and the configuration
//! defaults in agreement.

use std::time::Duration;

// =============================================================================
// Poll Intervals
// =============================================================================

/// Default poll interval for CPU, memory, ECC and relog monitors.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval of the I2C bus-crash monitor.
pub const BUS_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default poll interval of the companion-controller (BIC) health monitor.
pub const DEFAULT_BIC_INTERVAL: Duration = Duration::from_secs(60);

/// Poll interval of the rearm coordinator.
pub const REARM_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Delay before the CPU monitor takes its first sample, letting the BMC reach idle.
pub const DEFAULT_CPU_SETTLE_DELAY: Duration = Duration::from_secs(180);

/// Delay between attempts to read the memory-controller status word.
pub const ECC_READ_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default heartbeat LED half-period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Default period after which latched assertions are cleared so they log again.
pub const DEFAULT_REGEN_INTERVAL: Duration = Duration::from_secs(1200);

/// Upper bound on any acquisition command (hooks are not bounded).
pub const ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Sampling
// =============================================================================

/// Default moving-average window, in samples.
pub const DEFAULT_WINDOW_SIZE: usize = 120;

/// Consecutive acquisition failures tolerated before a utilization monitor stops.
pub const MAX_ACQUISITION_RETRY: u32 = 10;

/// Consecutive ECC read failures between two "cannot read" error lines.
pub const ECC_READ_FAILURE_LOG_EVERY: u32 = 600;

/// Safe range for CPU and memory utilization limits, in percent.
pub const MIN_UTILIZATION_LIMIT: f64 = 60.0;
/// Upper end of the safe utilization range, in percent.
pub const MAX_UTILIZATION_LIMIT: f64 = 95.0;

// =============================================================================
// Hardware
// =============================================================================

/// Number of I2C buses on the controller; bus ids at or above this are ignored.
pub const I2C_BUS_COUNT: u8 = 14;

/// Maximum value of the recoverable ECC error counter (8 bits).
pub const MAX_ECC_RECOVERABLE_COUNTER: u32 = 255;

/// Maximum value of the unrecoverable ECC error counter (4 bits).
pub const MAX_ECC_UNRECOVERABLE_COUNTER: u32 = 15;

/// Consecutive failed cycles before the companion controller is reset.
pub const DEFAULT_BIC_ESCALATION_LIMIT: u32 = 3;

/// Number of FRU slots scanned by the node-manager self-test monitor.
pub const DEFAULT_MAX_FRUS: u8 = 4;

/// Self-test answer of a healthy node manager.
pub const NM_SELFTEST_OK: [u8; 2] = [0x55, 0x00];

// =============================================================================
// Persisted Keys
// =============================================================================

/// Aggregate health flag shared with the log utilities.
pub const KEY_BMC_HEALTH: &str = "bmc_health";

/// Rearm request flag.
pub const KEY_HEALTHD_REARM: &str = "healthd_rearm";

/// Value written to [`KEY_BMC_HEALTH`] when no aggregated fault is active.
pub const HEALTHY: &str = "1";

/// Value written to [`KEY_BMC_HEALTH`] while any aggregated fault is active.
pub const NOT_HEALTHY: &str = "0";

/// Readiness flag key for a monitor, e.g. `flag_healthd_cpu`.
pub fn ready_flag_key(monitor: &str) -> String {
    format!("flag_healthd_{monitor}")
}
