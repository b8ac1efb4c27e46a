//! Averaged CPU and memory utilization monitors.
//!
//! Each poll takes one sample into a [`MovingAverageSampler`]. Nothing is evaluated until the
//! window has been filled once; from then on the trailing average, in percent, is evaluated
//! against every threshold of the metric.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{HealthdError, HealthdResult};
use crate::hardware::capabilities::{FlagStore, Metric, MetricSource, RecoveryActions};
use crate::health::reaction::ReactionDispatcher;
use crate::health::sampler::MovingAverageSampler;
use crate::health::threshold::{log_at, Severity, ThresholdSet};
use crate::limits::{DEFAULT_MONITOR_INTERVAL, MAX_ACQUISITION_RETRY};
use crate::monitors::mark_ready;

/// Moving-average monitor of one utilization metric.
pub struct UtilizationMonitor {
    metric: Metric,
    source: Arc<dyn MetricSource>,
    sampler: MovingAverageSampler,
    thresholds: Arc<ThresholdSet>,
    dispatcher: ReactionDispatcher,
    interval: Duration,
    settle_delay: Duration,
    failures: u32,
    max_retry: u32,
}

impl UtilizationMonitor {
    /// Monitor of `metric` averaging over `window_size` samples.
    pub fn new(
        metric: Metric,
        window_size: usize,
        thresholds: Arc<ThresholdSet>,
        source: Arc<dyn MetricSource>,
        dispatcher: ReactionDispatcher,
    ) -> Self {
        Self {
            metric,
            source,
            sampler: MovingAverageSampler::new(window_size),
            thresholds,
            dispatcher,
            interval: DEFAULT_MONITOR_INTERVAL,
            settle_delay: Duration::ZERO,
            failures: 0,
            max_retry: MAX_ACQUISITION_RETRY,
        }
    }

    /// Time between samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait before the first sample.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Consecutive acquisition failures tolerated before the monitor stops.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Threshold set shared with the rearm and relog coordinators.
    pub fn thresholds(&self) -> &Arc<ThresholdSet> {
        &self.thresholds
    }

    fn ready_name(&self) -> &'static str {
        match self.metric {
            Metric::CpuUtilization => "cpu",
            Metric::MemoryUtilization => "mem",
        }
    }

    /// Take one sample and evaluate the average if the window is full.
    ///
    /// Returns the evaluated average in percent, `None` while filling or after a failed
    /// sample. Fails once the retry budget is exhausted; the task must then stop.
    pub async fn poll_once(&mut self) -> HealthdResult<Option<f64>> {
        let name = self.metric.name();
        let fraction = match self.source.sample(self.metric).await {
            Ok(fraction) => fraction,
            Err(e) => {
                self.failures += 1;
                tracing::warn!(
                    monitor = name,
                    attempt = self.failures,
                    error = %e,
                    "Failed to get sys info"
                );
                if self.failures > self.max_retry {
                    log_at(
                        Severity::Critical,
                        &format!("Cannot get sysinfo. Stop the {name} monitor"),
                    );
                    return Err(HealthdError::AcquisitionExhausted {
                        monitor: name.to_string(),
                        attempts: self.failures,
                    });
                }
                return Ok(None);
            }
        };
        self.failures = 0;

        let Some(average) = self.sampler.push(fraction) else {
            return Ok(None);
        };
        let percent = average * 100.0;

        for (spec, transition) in self.thresholds.evaluate(percent) {
            let message = if transition.newly_asserted {
                format!(
                    "ASSERT: {name} ({percent:.2}%) exceeds the threshold ({:.2}%).",
                    spec.limit
                )
            } else {
                format!(
                    "DEASSERT: {name} ({percent:.2}%) is under the threshold ({:.2}%).",
                    spec.limit
                )
            };
            self.dispatcher.dispatch(&spec, transition, &message).await;
        }
        Ok(Some(percent))
    }

    /// Sample forever. Returns only when acquisition is exhausted.
    pub async fn run(mut self, store: Arc<dyn FlagStore>) -> HealthdResult<()> {
        tokio::time::sleep(self.settle_delay).await;
        mark_ready(store.as_ref(), self.ready_name()).await;
        loop {
            self.poll_once().await?;
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Apply the memory monitor's kernel tuning before it starts sampling.
pub async fn apply_memory_tuning(
    actions: &dyn RecoveryActions,
    panic_on_oom: bool,
    min_free_kbytes: Option<u32>,
) {
    let min_free_kbytes = min_free_kbytes.filter(|k| *k > 0);
    if !panic_on_oom && min_free_kbytes.is_none() {
        return;
    }
    if let Err(e) = actions.tune_memory(panic_on_oom, min_free_kbytes).await {
        tracing::error!(error = %e, "memory tuning failed");
    }
}
