//! Threshold-with-hysteresis evaluation.
//!
//! A [`ThresholdSpec`] is a latched fault condition over one metric. It asserts when a
//! sample reaches `limit` and only deasserts once a sample drops below
//! `limit - hysteresis`; between the two bounds the latch is sticky.
//!
//! Evaluation is pure: it only flips the latch and reports the edge as a [`Transition`].
//! Running the configured reactions for that edge is the job of
//! [`crate::health::reaction::ReactionDispatcher`].

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;

/// Log severity attached to a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Severity {
    /// Degraded but functional
    #[default]
    Warning,
    /// Requires operator attention; cleared by a rearm request
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Emit `message` to the system log at `severity`.
pub fn log_at(severity: Severity, message: &str) {
    match severity {
        Severity::Warning => tracing::warn!(severity = "warning", "{message}"),
        Severity::Critical => tracing::error!(severity = "critical", "{message}"),
    }
}

/// Reaction fired on an assert (and, for some, deassert) edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReactionKind {
    /// Log the transition at the threshold's severity
    Log,
    /// Reboot the controller, then block
    Reboot,
    /// Raise this metric's bit in the aggregate fault bitmap
    ErrorTrigger,
    /// Drop page caches
    MemClear,
}

/// Edge produced by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    /// Latch went `false -> true`
    pub newly_asserted: bool,
    /// Latch went `true -> false`
    pub newly_deasserted: bool,
}

impl Transition {
    /// No edge.
    pub const NONE: Transition = Transition {
        newly_asserted: false,
        newly_deasserted: false,
    };

    const ASSERTED: Transition = Transition {
        newly_asserted: true,
        newly_deasserted: false,
    };

    const DEASSERTED: Transition = Transition {
        newly_asserted: false,
        newly_deasserted: true,
    };

    /// Whether either edge fired.
    pub fn is_edge(&self) -> bool {
        self.newly_asserted || self.newly_deasserted
    }
}

/// One latched limit on a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    /// Assertion limit (percent for utilization and ECC counters)
    pub limit: f64,
    /// Dead-band below `limit` that must be crossed to deassert
    pub hysteresis: f64,
    /// Severity used for log reactions and rearm eligibility
    pub severity: Severity,
    /// Reactions run on transitions
    pub reactions: BTreeSet<ReactionKind>,
    asserted: bool,
}

impl ThresholdSpec {
    /// Create an unasserted spec with no reactions.
    pub fn new(limit: f64, hysteresis: f64, severity: Severity) -> Self {
        Self {
            limit,
            hysteresis,
            severity,
            reactions: BTreeSet::new(),
            asserted: false,
        }
    }

    /// Add a reaction.
    pub fn with_reaction(mut self, reaction: ReactionKind) -> Self {
        self.reactions.insert(reaction);
        self
    }

    /// Whether `reaction` is configured.
    pub fn has(&self, reaction: ReactionKind) -> bool {
        self.reactions.contains(&reaction)
    }

    /// Current latch state.
    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Whether a rearm request may clear this latch.
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Evaluate a sample against the hysteresis band.
    ///
    /// Plain floating-point comparisons: asserts on `sample >= limit`, deasserts on
    /// `sample < limit - hysteresis`. A NaN sample never changes the latch.
    pub fn evaluate(&mut self, sample: f64) -> Transition {
        if !self.asserted && sample >= self.limit {
            self.asserted = true;
            return Transition::ASSERTED;
        }
        if self.asserted && sample < self.limit - self.hysteresis {
            self.asserted = false;
            return Transition::DEASSERTED;
        }
        Transition::NONE
    }

    /// Counter value above which [`evaluate_counter`](Self::evaluate_counter) asserts.
    ///
    /// `limit` is read as a percentage of `counter_max`, truncated toward zero.
    pub fn counter_limit(&self, counter_max: u32) -> u32 {
        (f64::from(counter_max) * self.limit / 100.0) as u32
    }

    /// Evaluate a saturating hardware error counter.
    ///
    /// Asserts once the counter strictly exceeds [`counter_limit`](Self::counter_limit).
    /// Counters never count down, so this never deasserts; only a rearm or relog clears it.
    pub fn evaluate_counter(&mut self, count: u32, counter_max: u32) -> Transition {
        if !self.asserted && count > self.counter_limit(counter_max) {
            self.asserted = true;
            return Transition::ASSERTED;
        }
        Transition::NONE
    }

    /// Reset the latch without firing any reaction. Returns whether it was asserted.
    pub fn clear_latch(&mut self) -> bool {
        std::mem::replace(&mut self.asserted, false)
    }
}

/// The ordered thresholds of one metric, shared between its monitor task and the
/// rearm/relog coordinators.
///
/// The lock is only held while latches are read or flipped, never across a reaction.
#[derive(Debug)]
pub struct ThresholdSet {
    name: String,
    specs: Mutex<Vec<ThresholdSpec>>,
}

impl ThresholdSet {
    /// Wrap the specs of metric `name`.
    pub fn new(name: impl Into<String>, specs: Vec<ThresholdSpec>) -> Self {
        Self {
            name: name.into(),
            specs: Mutex::new(specs),
        }
    }

    /// Metric name, e.g. `BMC CPU utilization`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of specs.
    pub fn len(&self) -> usize {
        self.specs.lock().len()
    }

    /// Whether the set holds no specs.
    pub fn is_empty(&self) -> bool {
        self.specs.lock().is_empty()
    }

    /// Evaluate every spec against `sample`, returning a snapshot of each spec that moved.
    pub fn evaluate(&self, sample: f64) -> Vec<(ThresholdSpec, Transition)> {
        self.apply(|spec| spec.evaluate(sample))
    }

    /// Evaluate every spec against a saturating counter.
    pub fn evaluate_counter(
        &self,
        count: u32,
        counter_max: u32,
    ) -> Vec<(ThresholdSpec, Transition)> {
        self.apply(|spec| spec.evaluate_counter(count, counter_max))
    }

    /// Clear every asserted critical latch. Returns how many were cleared.
    pub fn rearm_critical(&self) -> usize {
        self.specs
            .lock()
            .iter_mut()
            .filter(|spec| spec.is_critical())
            .map(ThresholdSpec::clear_latch)
            .filter(|cleared| *cleared)
            .count()
    }

    /// Clear every asserted latch regardless of severity.
    pub fn clear_all(&self) -> usize {
        self.specs
            .lock()
            .iter_mut()
            .map(ThresholdSpec::clear_latch)
            .filter(|cleared| *cleared)
            .count()
    }

    /// Copy of the current specs.
    pub fn snapshot(&self) -> Vec<ThresholdSpec> {
        self.specs.lock().clone()
    }

    fn apply(
        &self,
        mut eval: impl FnMut(&mut ThresholdSpec) -> Transition,
    ) -> Vec<(ThresholdSpec, Transition)> {
        let mut specs = self.specs.lock();
        specs
            .iter_mut()
            .filter_map(|spec| {
                let transition = eval(spec);
                transition.is_edge().then(|| (spec.clone(), transition))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_spec() -> ThresholdSpec {
        ThresholdSpec::new(95.0, 5.0, Severity::Critical).with_reaction(ReactionKind::Log)
    }

    #[test]
    fn asserts_and_deasserts_across_the_band() {
        let mut spec = cpu_spec();
        let samples = [90.0, 96.0, 97.0, 92.0, 89.0];
        let edges: Vec<Transition> = samples.iter().map(|s| spec.evaluate(*s)).collect();

        assert_eq!(edges[0], Transition::NONE);
        assert!(edges[1].newly_asserted);
        assert_eq!(edges[2], Transition::NONE);
        assert_eq!(edges[3], Transition::NONE, "92 is inside the dead-band");
        assert!(edges[4].newly_deasserted);
        assert!(!spec.is_asserted());
    }

    #[test]
    fn exact_limit_asserts_and_exact_lower_bound_holds() {
        let mut spec = cpu_spec();
        assert!(spec.evaluate(95.0).newly_asserted);
        // 90.0 is not < 90.0
        assert_eq!(spec.evaluate(90.0), Transition::NONE);
        assert!(spec.evaluate(89.999).newly_deasserted);
    }

    #[test]
    fn repeated_sample_fires_only_once() {
        let mut spec = cpu_spec();
        assert!(spec.evaluate(99.0).newly_asserted);
        for _ in 0..5 {
            assert_eq!(spec.evaluate(99.0), Transition::NONE);
        }
    }

    #[test]
    fn nan_sample_is_ignored() {
        let mut spec = cpu_spec();
        assert_eq!(spec.evaluate(f64::NAN), Transition::NONE);
        spec.evaluate(99.0);
        assert_eq!(spec.evaluate(f64::NAN), Transition::NONE);
        assert!(spec.is_asserted());
    }

    #[test]
    fn latch_matches_reference_model_for_long_sequence() {
        // Deterministic pseudo-random walk through and around the band.
        let mut spec = ThresholdSpec::new(80.0, 10.0, Severity::Warning);
        let mut last_high: Option<usize> = None;
        let mut last_low: Option<usize> = None;
        let mut x: u64 = 0x2545_f491;
        for i in 0..2_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let sample = (x % 1000) as f64 / 10.0;
            spec.evaluate(sample);
            if sample >= 80.0 {
                last_high = Some(i);
            }
            if sample < 70.0 {
                last_low = Some(i);
            }
            let expected = match (last_high, last_low) {
                (Some(h), Some(l)) => h > l,
                (Some(_), None) => true,
                _ => false,
            };
            assert_eq!(spec.is_asserted(), expected, "diverged at sample {i} ({sample})");
        }
    }

    #[test]
    fn counter_threshold_is_strictly_greater_and_sticky() {
        // 15 * 40 / 100 = 6.0 -> 6
        let mut spec = ThresholdSpec::new(40.0, 0.0, Severity::Critical);
        assert_eq!(spec.counter_limit(15), 6);
        assert_eq!(spec.evaluate_counter(6, 15), Transition::NONE);
        assert!(spec.evaluate_counter(7, 15).newly_asserted);
        assert_eq!(spec.evaluate_counter(0, 15), Transition::NONE);
        assert!(spec.is_asserted());
    }

    #[test]
    fn counter_limit_truncates() {
        // 255 * 50 / 100 = 127.5 -> 127
        let spec = ThresholdSpec::new(50.0, 0.0, Severity::Warning);
        assert_eq!(spec.counter_limit(255), 127);
    }

    #[test]
    fn rearm_only_touches_asserted_critical_specs() {
        let set = ThresholdSet::new(
            "BMC CPU utilization",
            vec![
                ThresholdSpec::new(70.0, 5.0, Severity::Warning),
                ThresholdSpec::new(90.0, 5.0, Severity::Critical),
                ThresholdSpec::new(99.0, 5.0, Severity::Critical),
            ],
        );
        let moved = set.evaluate(95.0);
        assert_eq!(moved.len(), 2);

        assert_eq!(set.rearm_critical(), 1);
        let specs = set.snapshot();
        assert!(specs[0].is_asserted(), "warning latch survives rearm");
        assert!(!specs[1].is_asserted());
        assert!(!specs[2].is_asserted());

        assert_eq!(set.rearm_critical(), 0, "second rearm is a no-op");
        assert_eq!(set.clear_all(), 1);
    }

    #[test]
    fn evaluate_reports_snapshots_of_moved_specs_only() {
        let set = ThresholdSet::new(
            "BMC Memory utilization",
            vec![
                ThresholdSpec::new(70.0, 0.0, Severity::Warning),
                ThresholdSpec::new(90.0, 0.0, Severity::Critical),
            ],
        );
        let moved = set.evaluate(75.0);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0.limit, 70.0);
        assert!(moved[0].0.is_asserted());
        assert!(moved[0].1.newly_asserted);
    }
}
