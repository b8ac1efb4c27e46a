//! Consecutive-failure counting with one-shot escalation.

use std::collections::VecDeque;

/// Counts consecutive failed cycles of a unit and decides when to escalate.
///
/// Reasons for the failures are kept in a bounded queue (oldest dropped first) so the
/// escalation log can list what went wrong since the last reset.
#[derive(Debug, Clone)]
pub struct EscalationCounter<R> {
    consecutive_failures: u32,
    limit: u32,
    already_escalated: bool,
    reasons: VecDeque<R>,
}

impl<R: Clone> EscalationCounter<R> {
    /// Counter escalating after `limit` consecutive failures (at least one).
    pub fn new(limit: u32) -> Self {
        let limit = limit.max(1);
        Self {
            consecutive_failures: 0,
            limit,
            already_escalated: false,
            reasons: VecDeque::with_capacity(limit as usize),
        }
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Configured limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether the escalation already ran for the current failure streak.
    pub fn already_escalated(&self) -> bool {
        self.already_escalated
    }

    /// Reasons collected since the last reset, oldest first.
    pub fn reasons(&self) -> impl Iterator<Item = &R> {
        self.reasons.iter()
    }

    /// Count one failed cycle.
    pub fn record_failure(&mut self, reason: R) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.reasons.len() == self.limit as usize {
            self.reasons.pop_front();
        }
        self.reasons.push_back(reason);
    }

    /// A fully passing cycle: clears the streak and re-enables escalation.
    pub fn record_success(&mut self) {
        self.reset();
        self.already_escalated = false;
    }

    /// Whether the escalation action should run now.
    pub fn should_escalate(&self) -> bool {
        !self.already_escalated && self.consecutive_failures >= self.limit
    }

    /// Mark a successful escalation and hand back the reasons that led to it.
    ///
    /// A failed escalation must not call this so the next cycle retries it.
    pub fn escalation_succeeded(&mut self) -> Vec<R> {
        self.already_escalated = true;
        self.consecutive_failures = 0;
        self.reasons.drain(..).collect()
    }

    /// Clear the streak and reasons without touching `already_escalated`.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.reasons.clear();
    }
}
