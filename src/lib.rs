//! # BMC Health Daemon Library
//!
//! This crate is the core of `bmc-healthd`, the resident health monitor of a baseboard
//! management controller. It samples CPU and memory utilization, ECC counters, I2C bus-crash
//! status and companion-controller liveness, turns the samples into latched assertions and
//! fans the transitions out to reactions (log, reboot, aggregate health flag, recovery hooks).
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-backed configuration (`HealthdConfig`) and its validation.
//! - **`daemon`**: `HealthDaemon`, which spawns one task per enabled monitor and waits for a
//!   termination signal.
//! - **`error`**: the `HealthdError` enum.
//! - **`hardware`**: capability traits for every collaborator, with command-driven platform
//!   implementations and in-memory mocks.
//! - **`health`**: the evaluation primitives (thresholds, moving average, bitfield latches,
//!   escalation counters, aggregate bitmap, reaction dispatch, rearm).
//! - **`limits`**: shared constants and persisted key names.
//! - **`logging`**: tracing-subscriber setup.
//! - **`monitors`**: the monitor tasks built from the primitives.

pub mod config;
pub mod daemon;
pub mod error;
pub mod hardware;
pub mod health;
pub mod limits;
pub mod logging;
pub mod monitors;

pub use config::HealthdConfig;
pub use daemon::{Collaborators, HealthDaemon};
pub use error::{HealthdError, HealthdResult};
