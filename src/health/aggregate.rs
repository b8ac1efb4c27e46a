//! Process-wide aggregate of monitors' fault state.
//!
//! Every monitor with an `ErrorTrigger` reaction owns one bit. The persisted health flag
//! only changes on the `0 -> nonzero` and `nonzero -> 0` edges of the whole bitmap.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::hardware::capabilities::FlagStore;
use crate::limits::{HEALTHY, KEY_BMC_HEALTH, NOT_HEALTHY};

/// Bit owned by one monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultBit {
    /// CPU utilization
    Cpu = 0,
    /// Memory utilization
    Memory = 1,
    /// Recoverable ECC errors
    RecoverableEcc = 2,
    /// Unrecoverable ECC errors
    UnrecoverableEcc = 3,
}

impl FaultBit {
    /// Mask of this bit.
    pub fn mask(self) -> u32 {
        1 << self as u32
    }
}

/// Shared fault bitmap backing the persisted `bmc_health` flag.
///
/// The lock is held across the conditional flag write so two monitors can never persist
/// out of order; hooks are always invoked by the caller after the lock is released.
pub struct AggregateFaultBitmap {
    bits: Mutex<u32>,
    store: Arc<dyn FlagStore>,
}

impl AggregateFaultBitmap {
    /// Empty bitmap persisting through `store`.
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            bits: Mutex::new(0),
            store,
        }
    }

    /// Current bitmap value.
    pub async fn value(&self) -> u32 {
        *self.bits.lock().await
    }

    /// Set `bit`. Returns whether the unhealthy flag was written.
    pub async fn set_bit(&self, bit: FaultBit) -> bool {
        let mut bits = self.bits.lock().await;
        let was_zero = *bits == 0;
        *bits |= bit.mask();
        if was_zero {
            self.persist(NOT_HEALTHY).await;
        }
        was_zero
    }

    /// Clear `bit`. Returns whether the healthy flag was written.
    pub async fn clear_bit(&self, bit: FaultBit) -> bool {
        let mut bits = self.bits.lock().await;
        let was_nonzero = *bits != 0;
        *bits &= !bit.mask();
        let now_zero = was_nonzero && *bits == 0;
        if now_zero {
            self.persist(HEALTHY).await;
        }
        now_zero
    }

    /// Zero the bitmap without touching the persisted flag.
    ///
    /// Used when latches are regenerated: the faults that are still present set their bits
    /// again, and the first one rewrites the unhealthy flag.
    pub async fn reset(&self) {
        *self.bits.lock().await = 0;
    }

    async fn persist(&self, value: &str) {
        if let Err(e) = self.store.persist_flag(KEY_BMC_HEALTH, value).await {
            tracing::error!(
                key = KEY_BMC_HEALTH,
                value,
                error = %e,
                "failed to persist health flag"
            );
        }
    }
}

impl fmt::Debug for AggregateFaultBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateFaultBitmap").finish_non_exhaustive()
    }
}
