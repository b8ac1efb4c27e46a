//! Monitor tasks.
//!
//! One long-lived task per metric family. Every monitor exposes `poll_once()` for a single
//! acquire/evaluate cycle and `run()` for the endless `poll -> sleep` loop the daemon spawns.
//!
//! - [`utilization`]: averaged CPU and memory utilization
//! - [`ecc`]: memory-controller ECC counters
//! - [`bus`]: I2C bus-crash status words
//! - [`companion`]: companion-controller (BIC) liveness with escalation to a hard reset
//! - [`node_manager`]: node-manager self-test per server slot
//! - [`relog`]: periodic regeneration of latched assertions
//! - [`heartbeat`]: heartbeat LED

pub mod bus;
pub mod companion;
pub mod ecc;
pub mod heartbeat;
pub mod node_manager;
pub mod relog;
pub mod utilization;

pub use bus::BusMonitor;
pub use companion::CompanionMonitor;
pub use ecc::EccMonitor;
pub use heartbeat::HeartbeatMonitor;
pub use node_manager::{NodeManagerLatches, NodeManagerMonitor};
pub use relog::RelogMonitor;
pub use utilization::UtilizationMonitor;

use crate::hardware::capabilities::FlagStore;
use crate::limits::ready_flag_key;

/// Persist `flag_healthd_<monitor> = "1"` so other services know the monitor is up.
pub(crate) async fn mark_ready(store: &dyn FlagStore, monitor: &str) {
    let key = ready_flag_key(monitor);
    if let Err(e) = store.persist_flag(&key, "1").await {
        tracing::warn!(key = %key, error = %e, "failed to set readiness flag");
    }
}
