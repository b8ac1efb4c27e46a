//! Fault-evaluation primitives shared by the monitor tasks.
//!
//! - [`threshold`]: latched limits with hysteresis
//! - [`sampler`]: moving average over a fixed window
//! - [`bitfield`]: status-word decoding into latched sub-conditions
//! - [`escalation`]: consecutive-failure counting with one-shot escalation
//! - [`aggregate`]: the process-wide fault bitmap behind the `bmc_health` flag
//! - [`reaction`]: reaction dispatch for threshold transitions
//! - [`rearm`]: operator-requested clearing of critical latches

pub mod aggregate;
pub mod bitfield;
pub mod escalation;
pub mod reaction;
pub mod rearm;
pub mod sampler;
pub mod threshold;

pub use aggregate::{AggregateFaultBitmap, FaultBit};
pub use reaction::ReactionDispatcher;
pub use threshold::{ReactionKind, Severity, ThresholdSet, ThresholdSpec, Transition};
