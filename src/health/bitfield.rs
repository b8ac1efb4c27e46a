//! Declarative decoding of multi-bit status words into latched sub-conditions.
//!
//! A [`ConditionTable`] lists the named bit positions of one kind of status register in
//! priority order. [`BitfieldLatch::evaluate`] walks the table, latching each newly set
//! fault bit once and reporting informational bits every time they are seen. Any set bit
//! outside the table latches a shared "undefined" condition.

/// How a named bit is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Fault: latched and logged once until the word returns to zero
    Latching,
    /// Self-recovered event: logged whenever seen, never latched
    Informational,
}

/// One named bit of a status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionDef {
    /// Bit position
    pub bit: u8,
    /// Stable identifier
    pub id: &'static str,
    /// Latching or informational
    pub kind: ConditionKind,
    /// Log text for the transition
    pub text: &'static str,
}

impl ConditionDef {
    fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

/// Ordered bit table of one status-word family.
#[derive(Debug)]
pub struct ConditionTable {
    /// Named bits, in evaluation order
    pub conditions: &'static [ConditionDef],
    /// Log text of the undefined-bits condition
    pub undefined_text: &'static str,
}

impl ConditionTable {
    /// Union of all named bits.
    pub fn named_mask(&self) -> u32 {
        self.conditions.iter().fold(0, |mask, c| mask | c.mask())
    }
}

/// Bus-lock and slave-dead recovery status of an I2C controller.
pub static I2C_BUS_CONDITIONS: ConditionTable = ConditionTable {
    conditions: &[
        ConditionDef {
            bit: 0,
            id: "bus_lock_recover_error",
            kind: ConditionKind::Latching,
            text: "bus is locked (Master Lock or Slave Clock Stretch). Recovery error.",
        },
        ConditionDef {
            bit: 1,
            id: "bus_lock_recover_timeout",
            kind: ConditionKind::Latching,
            text: "bus is locked (Master Lock or Slave Clock Stretch). Recovery timed out.",
        },
        ConditionDef {
            bit: 2,
            id: "bus_lock_recover_success",
            kind: ConditionKind::Informational,
            text: "bus had been locked (Master Lock or Slave Clock Stretch) and has been recoveried successfully.",
        },
        ConditionDef {
            bit: 4,
            id: "slave_dead_recover_error",
            kind: ConditionKind::Latching,
            text: "Slave is dead (SDA keeps low). Bus recovery error.",
        },
        ConditionDef {
            bit: 5,
            id: "slave_dead_recover_timeout",
            kind: ConditionKind::Latching,
            text: "Slave is dead (SDAs keep low). Bus recovery timed out.",
        },
        ConditionDef {
            bit: 6,
            id: "slave_dead_recover_success",
            kind: ConditionKind::Informational,
            text: "Slave was dead. and bus has been recoveried successfully.",
        },
    ],
    undefined_text: "Undefined case.",
};

/// What one evaluation changed.
#[derive(Debug, Default, PartialEq)]
pub struct LatchOutcome {
    /// Fault conditions latched by this word, in table order
    pub newly_latched: Vec<&'static ConditionDef>,
    /// Informational conditions present in this word
    pub informational: Vec<&'static ConditionDef>,
    /// The undefined condition latched by this word
    pub undefined_latched: bool,
    /// Word returned to zero while something was latched; everything is now clear
    pub recovered: bool,
}

impl LatchOutcome {
    /// Whether this cycle needs the recovery-assist hook.
    pub fn needs_recovery_assist(&self) -> bool {
        !self.newly_latched.is_empty() || self.undefined_latched
    }
}

/// Latched sub-conditions of one status-word unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitfieldLatch {
    latched: u32,
    undefined: bool,
}

impl BitfieldLatch {
    /// Nothing latched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any condition is latched.
    pub fn any_latched(&self) -> bool {
        self.latched != 0 || self.undefined
    }

    /// Whether `condition` is latched.
    pub fn is_latched(&self, condition: &ConditionDef) -> bool {
        self.latched & condition.mask() != 0
    }

    /// Whether the undefined condition is latched.
    pub fn undefined_latched(&self) -> bool {
        self.undefined
    }

    /// Decode `word` against `table`.
    ///
    /// Individual bits clearing do not deassert their condition; only a zero word clears
    /// the unit.
    pub fn evaluate(&mut self, table: &'static ConditionTable, word: u32) -> LatchOutcome {
        let mut outcome = LatchOutcome::default();

        if word == 0 {
            outcome.recovered = self.any_latched();
            *self = Self::default();
            return outcome;
        }

        for condition in table.conditions {
            if word & condition.mask() == 0 {
                continue;
            }
            match condition.kind {
                ConditionKind::Informational => outcome.informational.push(condition),
                ConditionKind::Latching if !self.is_latched(condition) => {
                    self.latched |= condition.mask();
                    outcome.newly_latched.push(condition);
                }
                ConditionKind::Latching => {}
            }
        }

        if word & !table.named_mask() != 0 && !self.undefined {
            self.undefined = true;
            outcome.undefined_latched = true;
        }
        outcome
    }
}
