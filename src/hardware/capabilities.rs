//! Collaborator Capabilities
//!
//! This module defines the narrow capability traits the monitors consume. Instead of one
//! monolithic "platform" object, each monitor depends only on the capabilities it actually
//! uses:
//!
//! - The CPU and memory monitors need a `MetricSource`
//! - The ECC and bus monitors need a `StatusWordSource`
//! - The companion monitor needs a `CompanionLink`
//! - Every monitor that reacts needs `RecoveryActions` and a `FlagStore`
//!
//! This approach enables:
//! - Scripted in-memory collaborators in tests (see [`crate::hardware::mock`])
//! - Swapping the command-driven platform layer without touching monitor logic
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! An `Err` from an acquisition method is the "unavailable" signal: the caller skips
//! evaluation for that cycle and never treats it as a zero reading.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

// =============================================================================
// Acquisition
// =============================================================================

/// Averaged utilization metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Fraction of CPU time spent non-idle since the previous sample
    CpuUtilization,
    /// Fraction of physical memory in use
    MemoryUtilization,
}

impl Metric {
    /// Display name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::CpuUtilization => "BMC CPU utilization",
            Metric::MemoryUtilization => "BMC Memory utilization",
        }
    }
}

/// Capability: Scalar Metric Sampling
///
/// # Contract
/// - Returns a fraction in `0.0..=1.0`; monitors scale to percent after averaging
/// - `Err` means the sample is unavailable this cycle
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Take one sample of `metric`.
    async fn sample(&self, metric: Metric) -> Result<f64>;
}

/// Hardware registers read as raw status words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusUnit {
    /// Bus-lock/recovery status of one I2C bus (base 0)
    I2cBus(u8),
    /// Memory-controller ECC status (error counters)
    MemoryController,
    /// Address register of the last recoverable ECC error
    LastRecoverableEccAddress,
    /// Address register of the first unrecoverable ECC error
    FirstUnrecoverableEccAddress,
}

impl fmt::Display for StatusUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUnit::I2cBus(bus) => write!(f, "I2C({bus})"),
            StatusUnit::MemoryController => write!(f, "memory controller"),
            StatusUnit::LastRecoverableEccAddress => write!(f, "last recoverable ECC address"),
            StatusUnit::FirstUnrecoverableEccAddress => {
                write!(f, "first unrecoverable ECC address")
            }
        }
    }
}

/// Capability: Status Word Acquisition
///
/// Reads a multi-bit hardware status register.
#[async_trait]
pub trait StatusWordSource: Send + Sync {
    /// Read the current word of `unit`.
    async fn read_status(&self, unit: StatusUnit) -> Result<u32>;
}

/// Ordered liveness checks run against the companion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompanionCheck {
    /// Ready signal asserted
    Ready,
    /// Heartbeat toggling
    Heartbeat,
    /// IPMB transport self-test answered
    Ipmb,
}

impl CompanionCheck {
    /// Label used in the escalation log line.
    pub fn label(&self) -> &'static str {
        match self {
            CompanionCheck::Ready => "BIC ready",
            CompanionCheck::Heartbeat => "heartbeat",
            CompanionCheck::Ipmb => "IPMB",
        }
    }
}

impl fmt::Display for CompanionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capability: Companion Controller Probing
///
/// # Contract
/// - `run_check` returns `Ok(false)` for a failed check; `Err` is treated the same way
///   by the monitor (a check that cannot run has not passed)
#[async_trait]
pub trait CompanionLink: Send + Sync {
    /// Whether the 12 V rail of the server in `fru` is on.
    async fn power_good(&self, fru: u8) -> Result<bool>;

    /// Whether a firmware update of `fru` is currently in progress.
    async fn update_in_progress(&self, fru: u8) -> Result<bool>;

    /// Run one liveness check.
    async fn run_check(&self, fru: u8, check: CompanionCheck) -> Result<bool>;
}

/// Capability: Node Manager Self-Test
#[async_trait]
pub trait NodeManagerLink: Send + Sync {
    /// Whether `fru` holds a server (only servers host a node manager).
    async fn is_server_slot(&self, fru: u8) -> Result<bool>;

    /// Whether a firmware update of `fru` is ongoing.
    async fn update_ongoing(&self, fru: u8) -> Result<bool>;

    /// Issue the self-test command; `Err` means no response.
    async fn self_test(&self, fru: u8) -> Result<[u8; 2]>;

    /// Name of `fru` for log lines.
    fn fru_name(&self, fru: u8) -> String {
        format!("slot{fru}")
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Capability: Persisted Key-Value Flags
///
/// Durable store shared with other management services. Keys are opaque strings and each
/// key has a single writer.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Read `key`; `Ok(None)` when it has never been written.
    async fn read_flag(&self, key: &str) -> Result<Option<String>>;

    /// Write `key`.
    async fn persist_flag(&self, key: &str, value: &str) -> Result<()>;
}

/// Capability: Side-Effecting Recovery Hooks
///
/// # Contract
/// - Every hook is idempotent and individually fallible
/// - Callers log a failed hook and carry on; the core never retries a hook
/// - Hooks are not bounded by a timeout
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    /// Reboot the controller.
    async fn reboot(&self) -> Result<()>;

    /// Hard-reset the companion controller of `fru`.
    async fn hardware_reset(&self, fru: u8) -> Result<()>;

    /// Raise the front-panel error indication for `tag`.
    async fn error_enable(&self, tag: &str) -> Result<()>;

    /// Clear the front-panel error indication for `tag`.
    async fn error_disable(&self, tag: &str) -> Result<()>;

    /// Drop page caches.
    async fn mem_clear(&self) -> Result<()>;

    /// Ask the platform to help recover a locked bus.
    async fn bus_recovery_assist(&self, bus: u8) -> Result<()>;

    /// Notify that a previously locked bus recovered.
    async fn bus_recovered(&self, _bus: u8) -> Result<()> {
        Ok(())
    }

    /// Drive the heartbeat LED.
    async fn set_heartbeat_led(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Apply kernel memory tuning for the memory monitor.
    async fn tune_memory(&self, _panic_on_oom: bool, _min_free_kbytes: Option<u32>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl NodeManagerLink for Fixed {
        async fn is_server_slot(&self, _fru: u8) -> Result<bool> {
            Ok(true)
        }

        async fn update_ongoing(&self, _fru: u8) -> Result<bool> {
            Ok(false)
        }

        async fn self_test(&self, _fru: u8) -> Result<[u8; 2]> {
            Ok([0x55, 0x00])
        }
    }

    #[tokio::test]
    async fn default_fru_name_uses_slot_prefix() {
        let link = Fixed;
        assert_eq!(link.fru_name(3), "slot3");
        assert_eq!(link.self_test(3).await.unwrap(), [0x55, 0x00]);
    }

    #[test]
    fn companion_labels_match_escalation_log() {
        let labels: Vec<_> = [
            CompanionCheck::Ready,
            CompanionCheck::Heartbeat,
            CompanionCheck::Ipmb,
        ]
        .iter()
        .map(CompanionCheck::label)
        .collect();
        assert_eq!(labels, ["BIC ready", "heartbeat", "IPMB"]);
    }

    #[test]
    fn status_unit_display() {
        assert_eq!(StatusUnit::I2cBus(4).to_string(), "I2C(4)");
        assert_eq!(Metric::CpuUtilization.name(), "BMC CPU utilization");
    }
}
