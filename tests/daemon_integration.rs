//! Daemon lifecycle against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use bmc_healthd::config::{
    BicHealthConfig, BmcHealthConfig, EccConfig, HealthdConfig, I2cConfig, ThresholdConfig,
    UtilizationConfig,
};
use bmc_healthd::hardware::mock::{
    ActionCall, MemoryFlagStore, MockCompanion, MockMetrics, MockStatusWords, RecordingActions,
};
use bmc_healthd::hardware::{CompanionCheck, Metric, StatusUnit};
use bmc_healthd::limits::{ready_flag_key, KEY_BMC_HEALTH};
use bmc_healthd::{Collaborators, HealthDaemon};
use tracing_test::traced_test;

fn utilization(limit: f64, actions: &[&str]) -> UtilizationConfig {
    UtilizationConfig {
        enabled: true,
        window_size: 2,
        settle_delay: Some(0),
        threshold: Some(vec![ThresholdConfig {
            value: limit,
            hysteresis: 5.0,
            action: actions.iter().map(|a| a.to_string()).collect(),
        }]),
        ..UtilizationConfig::default()
    }
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_simulated_daemon_runs_until_shutdown() {
    let store = Arc::new(MemoryFlagStore::new());
    let collaborators = Collaborators {
        store: store.clone(),
        ..Collaborators::simulated()
    };
    let config = HealthdConfig {
        bmc_cpu_utilization: utilization(85.0, &["log-critical", "bmc-error-trigger"]),
        ecc_monitoring: EccConfig {
            enabled: true,
            ..EccConfig::default()
        },
        i2c: I2cConfig {
            enabled: true,
            busses: vec![0, 1, 2],
        },
        ..HealthdConfig::default()
    };

    HealthDaemon::new(config, collaborators)
        .run_until(tokio::time::sleep(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(logs_contain("BMC health daemon started"));
    assert!(logs_contain("BMC health daemon stopped."));
    for monitor in ["cpu", "ecc"] {
        assert_eq!(store.value(&ready_flag_key(monitor)).as_deref(), Some("1"));
    }
    assert!(store.writes_for(KEY_BMC_HEALTH).is_empty(), "idle controller stays healthy");
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_exhausted_monitor_stops_while_others_continue() {
    let metrics = Arc::new(MockMetrics::new().with_steady(Metric::CpuUtilization, 0.97));
    let store = Arc::new(MemoryFlagStore::new());
    let actions = Arc::new(RecordingActions::new());
    let collaborators = Collaborators {
        metrics,
        store: store.clone(),
        actions: actions.clone(),
        ..Collaborators::simulated()
    };
    let config = HealthdConfig {
        bmc_cpu_utilization: utilization(90.0, &["log-critical", "bmc-error-trigger"]),
        bmc_mem_utilization: utilization(90.0, &["log-critical"]),
        ..HealthdConfig::default()
    };

    HealthDaemon::new(config, collaborators)
        .run_until(tokio::time::sleep(Duration::from_secs(30)))
        .await
        .unwrap();

    assert!(logs_contain("Cannot get sysinfo. Stop the BMC Memory utilization monitor"));
    assert!(logs_contain("monitor stopped"));
    assert!(logs_contain("ASSERT: BMC CPU utilization (97.00%) exceeds the threshold (90.00%)."));
    assert_eq!(store.writes_for(KEY_BMC_HEALTH), ["0"]);
    assert_eq!(
        actions.count(&ActionCall::ErrorEnable("BMC CPU utilization".into())),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_memory_tuning_applied_before_sampling() {
    let actions = Arc::new(RecordingActions::new());
    let collaborators = Collaborators {
        actions: actions.clone(),
        ..Collaborators::simulated()
    };
    let config = HealthdConfig {
        bmc_mem_utilization: UtilizationConfig {
            enable_panic_on_oom: true,
            min_free_kbytes: Some(8192),
            ..utilization(90.0, &["log-warning"])
        },
        ..HealthdConfig::default()
    };

    HealthDaemon::new(config, collaborators)
        .run_until(tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(
        actions.calls().first(),
        Some(&ActionCall::TuneMemory {
            panic_on_oom: true,
            min_free_kbytes: Some(8192),
        })
    );
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_companion_escalates_after_consecutive_failures() {
    let companion = Arc::new(MockCompanion::new());
    companion.script(CompanionCheck::Heartbeat, [false, false, false]);
    let actions = Arc::new(RecordingActions::new());
    let collaborators = Collaborators {
        companion: companion.clone(),
        actions: actions.clone(),
        ..Collaborators::simulated()
    };
    let config = HealthdConfig {
        log_rearm: false,
        bic_health: BicHealthConfig {
            enabled: true,
            fru: Some(2),
            monitor_interval: 1,
            escalation_limit: 3,
        },
        ..HealthdConfig::default()
    };

    HealthDaemon::new(config, collaborators)
        .run_until(tokio::time::sleep(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(actions.count(&ActionCall::HardwareReset(2)), 1);
    assert!(logs_contain("FRU 2 BIC reset by BIC health monitor"));
}

#[tokio::test(start_paused = true)]
async fn test_relog_regenerates_ecc_assertion() {
    let status = Arc::new(MockStatusWords::new());
    status.set(StatusUnit::MemoryController, 1 << 16);
    let store = Arc::new(MemoryFlagStore::new());
    let collaborators = Collaborators {
        status,
        store: store.clone(),
        ..Collaborators::simulated()
    };
    let config = HealthdConfig {
        log_rearm: false,
        ecc_monitoring: EccConfig {
            enabled: true,
            recov_threshold: vec![ThresholdConfig {
                value: 0.0,
                hysteresis: 0.0,
                action: vec!["log-critical".into(), "bmc-error-trigger".into()],
            }],
            ..EccConfig::default()
        },
        bmc_health: BmcHealthConfig {
            enabled: true,
            monitor_interval: 1,
            regenerating_interval: 5,
        },
        ..HealthdConfig::default()
    };

    HealthDaemon::new(config, collaborators)
        .run_until(tokio::time::sleep(Duration::from_secs(12)))
        .await
        .unwrap();

    let writes = store.writes_for(KEY_BMC_HEALTH);
    assert!(writes.len() >= 2, "fault re-reported after regeneration: {writes:?}");
    assert!(writes.iter().all(|w| w == "0"));
}
