//! Hardware and system collaborators.
//!
//! Monitors only see the traits in [`capabilities`]. [`platform`] implements them against the
//! running controller; [`mock`] implements them in memory for tests and simulation.

pub mod capabilities;
pub mod mock;
pub mod platform;

pub use capabilities::{
    CompanionCheck, CompanionLink, FlagStore, Metric, MetricSource, NodeManagerLink,
    RecoveryActions, StatusUnit, StatusWordSource,
};
