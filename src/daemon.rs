//! Daemon assembly.
//!
//! [`HealthDaemon`] turns a validated [`HealthdConfig`] into one task per enabled monitor,
//! wires the shared latch registries (rearm, relog) and waits for a termination signal.
//! There is no cooperative shutdown: on a signal the final line is logged and every task
//! is aborted where it stands.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::{HealthdConfig, PlatformConfig};
use crate::error::{HealthdError, HealthdResult};
use crate::hardware::capabilities::{
    CompanionLink, FlagStore, Metric, MetricSource, NodeManagerLink, RecoveryActions,
    StatusUnit, StatusWordSource,
};
use crate::hardware::mock::{
    MemoryFlagStore, MockCompanion, MockMetrics, MockNodeManager, MockStatusWords,
    RecordingActions,
};
use crate::hardware::platform::{CommandActions, CommandQueries, FileFlagStore, SysinfoMetrics};
use crate::health::aggregate::{AggregateFaultBitmap, FaultBit};
use crate::health::reaction::ReactionDispatcher;
use crate::health::rearm::RearmCoordinator;
use crate::health::threshold::{log_at, Severity, ThresholdSet};
use crate::limits::{DEFAULT_CPU_SETTLE_DELAY, I2C_BUS_COUNT, REARM_CHECK_INTERVAL};
use crate::monitors::ecc::{EccChannel, RECOVERABLE_ECC_NAME, UNRECOVERABLE_ECC_NAME};
use crate::monitors::utilization::apply_memory_tuning;
use crate::monitors::{
    BusMonitor, CompanionMonitor, EccMonitor, HeartbeatMonitor, NodeManagerMonitor,
    RelogMonitor, UtilizationMonitor,
};

/// Every collaborator the monitors use.
#[derive(Clone)]
pub struct Collaborators {
    /// CPU and memory utilization
    pub metrics: Arc<dyn MetricSource>,
    /// ECC and I2C status registers
    pub status: Arc<dyn StatusWordSource>,
    /// Companion-controller checks
    pub companion: Arc<dyn CompanionLink>,
    /// Node-manager self-test
    pub node_manager: Arc<dyn NodeManagerLink>,
    /// Recovery hooks
    pub actions: Arc<dyn RecoveryActions>,
    /// Persisted flags
    pub store: Arc<dyn FlagStore>,
}

impl Collaborators {
    /// Collaborators of the running controller.
    pub fn platform(config: &PlatformConfig) -> Self {
        let config = Arc::new(config.clone());
        let queries = Arc::new(CommandQueries::new(Arc::clone(&config)));
        Self {
            metrics: Arc::new(SysinfoMetrics::new()),
            status: queries.clone(),
            companion: queries.clone(),
            node_manager: queries,
            actions: Arc::new(CommandActions::new(Arc::clone(&config))),
            store: Arc::new(FileFlagStore::new(config.kv_store_dir.clone())),
        }
    }

    /// In-memory collaborators describing a healthy, idle controller.
    pub fn simulated() -> Self {
        let metrics = MockMetrics::new()
            .with_steady(Metric::CpuUtilization, 0.25)
            .with_steady(Metric::MemoryUtilization, 0.40);
        let status = MockStatusWords::new();
        status.set(StatusUnit::MemoryController, 0);
        for bus in 0..I2C_BUS_COUNT {
            status.set(StatusUnit::I2cBus(bus), 0);
        }
        Self {
            metrics: Arc::new(metrics),
            status: Arc::new(status),
            companion: Arc::new(MockCompanion::new()),
            node_manager: Arc::new(MockNodeManager::new(1..=4)),
            actions: Arc::new(RecordingActions::new()),
            store: Arc::new(MemoryFlagStore::new()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

type TaskOutcome = (&'static str, HealthdResult<()>);

/// The health daemon: monitors, shared state and their tasks.
pub struct HealthDaemon {
    config: HealthdConfig,
    collaborators: Collaborators,
    bitmap: Arc<AggregateFaultBitmap>,
    tasks: JoinSet<TaskOutcome>,
    running: Vec<&'static str>,
}

impl HealthDaemon {
    /// Daemon for `config` using `collaborators`.
    pub fn new(config: HealthdConfig, collaborators: Collaborators) -> Self {
        let bitmap = Arc::new(AggregateFaultBitmap::new(Arc::clone(&collaborators.store)));
        Self {
            config,
            collaborators,
            bitmap,
            tasks: JoinSet::new(),
            running: Vec::new(),
        }
    }

    /// Aggregate fault bitmap shared by the monitors.
    pub fn bitmap(&self) -> Arc<AggregateFaultBitmap> {
        Arc::clone(&self.bitmap)
    }

    /// Names of the spawned monitors, in start order.
    pub fn running(&self) -> &[&'static str] {
        &self.running
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = HealthdResult<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
        self.running.push(name);
        tracing::debug!(monitor = name, "monitor started");
    }

    fn dispatcher(&self, name: &str, bit: FaultBit) -> ReactionDispatcher {
        ReactionDispatcher::new(
            name,
            Some(bit),
            Arc::clone(&self.bitmap),
            Arc::clone(&self.collaborators.actions),
        )
    }

    /// Validate the configuration and start every enabled monitor.
    pub fn start(&mut self) -> HealthdResult<()> {
        self.config.validate()?;
        if !self.running.is_empty() {
            return Err(HealthdError::Configuration("daemon already started".into()));
        }

        let config = self.config.clone();
        let c = self.collaborators.clone();
        let mut rearm = RearmCoordinator::new(Arc::clone(&c.store), REARM_CHECK_INTERVAL);
        let mut relog = RelogMonitor::new(
            Arc::clone(&c.store),
            Arc::clone(&self.bitmap),
            config.bmc_health.relog_criteria(),
        )
        .with_interval(config.bmc_health.poll_interval());

        if config.heartbeat.enabled {
            let heartbeat = HeartbeatMonitor::new(Arc::clone(&c.actions))
                .with_half_period(config.heartbeat.half_period());
            let store = Arc::clone(&c.store);
            self.spawn("heartbeat", async move {
                heartbeat.run(store).await;
                Ok(())
            });
        }

        for (metric, section, bit) in [
            (Metric::CpuUtilization, &config.bmc_cpu_utilization, FaultBit::Cpu),
            (Metric::MemoryUtilization, &config.bmc_mem_utilization, FaultBit::Memory),
        ] {
            if !section.is_active() {
                continue;
            }
            let name = metric.name();
            let thresholds = Arc::new(ThresholdSet::new(name, section.specs(name)));
            rearm.register(thresholds.clone());
            relog.register(thresholds.clone());

            let default_settle = match metric {
                Metric::CpuUtilization => DEFAULT_CPU_SETTLE_DELAY,
                Metric::MemoryUtilization => std::time::Duration::ZERO,
            };
            let monitor = UtilizationMonitor::new(
                metric,
                section.window_size,
                thresholds,
                Arc::clone(&c.metrics),
                self.dispatcher(name, bit),
            )
            .with_interval(section.poll_interval())
            .with_settle_delay(section.settle_delay_or(default_settle));

            let store = Arc::clone(&c.store);
            match metric {
                Metric::CpuUtilization => self.spawn("cpu", monitor.run(store)),
                Metric::MemoryUtilization => {
                    let actions = Arc::clone(&c.actions);
                    let (panic_on_oom, min_free) =
                        (section.enable_panic_on_oom, section.min_free_kbytes);
                    self.spawn("mem", async move {
                        apply_memory_tuning(actions.as_ref(), panic_on_oom, min_free).await;
                        monitor.run(store).await
                    });
                }
            }
        }

        if config.i2c.is_active() {
            let busses = config.i2c.active_busses();
            if busses.is_empty() {
                tracing::warn!("no supported I2C bus configured, bus monitor disabled");
            } else {
                let monitor =
                    BusMonitor::new(busses, Arc::clone(&c.status), Arc::clone(&c.actions));
                self.spawn("i2c", async move {
                    monitor.run().await;
                    Ok(())
                });
            }
        }

        if config.ecc_monitoring.enabled {
            let ecc = &config.ecc_monitoring;
            let recoverable = Arc::new(ThresholdSet::new(
                RECOVERABLE_ECC_NAME,
                ecc.recoverable_specs(RECOVERABLE_ECC_NAME),
            ));
            let unrecoverable = Arc::new(ThresholdSet::new(
                UNRECOVERABLE_ECC_NAME,
                ecc.unrecoverable_specs(UNRECOVERABLE_ECC_NAME),
            ));
            for set in [&recoverable, &unrecoverable] {
                rearm.register(set.clone());
                relog.register(set.clone());
            }
            let monitor = EccMonitor::new(
                Arc::clone(&c.status),
                EccChannel::new(
                    recoverable,
                    self.dispatcher(RECOVERABLE_ECC_NAME, FaultBit::RecoverableEcc),
                    ecc.recov_max_counter,
                ),
                EccChannel::new(
                    unrecoverable,
                    self.dispatcher(UNRECOVERABLE_ECC_NAME, FaultBit::UnrecoverableEcc),
                    ecc.unrec_max_counter,
                ),
            )
            .with_address_log(ecc.ecc_address_log)
            .with_interval(ecc.poll_interval());
            let store = Arc::clone(&c.store);
            self.spawn("ecc", async move {
                monitor.run(store).await;
                Ok(())
            });
        }

        let node_manager = config.nm_monitor.enabled.then(|| {
            Arc::new(
                NodeManagerMonitor::new(
                    Arc::clone(&c.node_manager),
                    config.nm_monitor.retry_threshold,
                )
                .with_max_frus(config.nm_monitor.max_frus)
                .with_interval(config.nm_monitor.poll_interval()),
            )
        });
        if let Some(nm) = &node_manager {
            rearm.register(nm.latches());
            if !config.nm_monitor.nm_transmission_via_bic {
                let nm = Arc::clone(nm);
                self.spawn("nm_monitor", async move {
                    nm.run().await;
                    Ok(())
                });
            }
        }

        if config.bic_health.enabled {
            let fru = config.bic_health.fru.ok_or_else(|| {
                HealthdError::Configuration("bic_health: fru is required".into())
            })?;
            let mut monitor =
                CompanionMonitor::new(fru, Arc::clone(&c.companion), Arc::clone(&c.actions))
                    .with_escalation_limit(config.bic_health.escalation_limit)
                    .with_interval(config.bic_health.poll_interval());
            if let Some(nm) = node_manager.filter(|_| config.nm_monitor.nm_transmission_via_bic) {
                monitor = monitor.with_node_manager(nm);
            }
            let store = Arc::clone(&c.store);
            self.spawn("bic_health", async move {
                monitor.run(store).await;
                Ok(())
            });
        }

        if config.bmc_health.enabled {
            self.spawn("bmc_health", async move {
                relog.run().await;
                Ok(())
            });
        }

        if config.log_rearm {
            self.spawn("log_rearm", async move {
                rearm.run().await;
                Ok(())
            });
        }

        tracing::info!(monitors = ?self.running, "BMC health daemon started");
        Ok(())
    }

    /// Start the monitors and run until `shutdown` completes.
    ///
    /// A monitor that stops (acquisition exhausted) is logged; the others keep running.
    pub async fn run_until<S>(mut self, shutdown: S) -> HealthdResult<()>
    where
        S: Future<Output = ()>,
    {
        self.start()?;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok((name, Ok(()))) => tracing::info!(monitor = name, "monitor exited"),
                    Ok((name, Err(e))) => {
                        tracing::error!(monitor = name, error = %e, "monitor stopped");
                    }
                    Err(e) => {
                        let e = HealthdError::from(e);
                        tracing::error!(error = %e, "monitor task ended abnormally");
                    }
                },
            }
        }
        log_at(Severity::Critical, "BMC health daemon stopped.");
        self.tasks.abort_all();
        Ok(())
    }

    /// Start the monitors and run until SIGTERM, SIGALRM or ctrl-c.
    pub async fn run(self) -> HealthdResult<()> {
        self.run_until(async {
            match termination_signal().await {
                Ok(signal) => tracing::debug!(signal, "termination signal received"),
                Err(e) => tracing::error!(error = %e, "signal handling unavailable"),
            }
        })
        .await
    }
}

#[cfg(unix)]
async fn termination_signal() -> HealthdResult<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut alarm = signal(SignalKind::alarm())?;
    tokio::select! {
        _ = term.recv() => Ok("SIGTERM"),
        _ = alarm.recv() => Ok("SIGALRM"),
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT").map_err(HealthdError::from),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> HealthdResult<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
