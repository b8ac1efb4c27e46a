//! Configuration loading and validation against real documents.

use std::path::{Path, PathBuf};

use bmc_healthd::config::HealthdConfig;
use bmc_healthd::health::{ReactionKind, Severity};
use bmc_healthd::logging::OutputFormat;
use bmc_healthd::HealthdError;
use tempfile::TempDir;

fn sample_config() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/healthd-config.json")
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_sample_config_loads_and_validates() {
    let config = HealthdConfig::load_from(sample_config()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.version.as_deref(), Some("1.0"));
    assert_eq!(
        config.enabled_monitors(),
        [
            "heartbeat",
            "cpu",
            "mem",
            "i2c",
            "ecc",
            "bmc_health",
            "bic_health",
            "log_rearm"
        ],
        "node manager is tunnelled through the BIC monitor"
    );
    assert_eq!(config.i2c.active_busses().len(), 14);
    assert_eq!(config.bic_health.fru, Some(1));
    assert_eq!(config.bmc_health.relog_criteria(), 600);
}

#[test]
fn test_sample_thresholds_become_runtime_specs() {
    let config = HealthdConfig::load_from(sample_config()).unwrap();
    let specs = config.bmc_mem_utilization.specs("BMC Memory utilization");

    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].severity, Severity::Warning);
    assert_eq!(specs[1].severity, Severity::Critical);
    assert!(specs[1].has(ReactionKind::ErrorTrigger));
    assert!(specs[1].has(ReactionKind::MemClear));
    assert!(!specs[0].has(ReactionKind::ErrorTrigger));
}

#[test]
fn test_toml_document_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "healthd.toml",
        r#"
log_rearm = false

[logging]
level = "debug"
format = "json"

[bmc_cpu_utilization]
enabled = true
window_size = 30
settle_delay = 0

[[bmc_cpu_utilization.threshold]]
value = 99.0
hysteresis = 2.0
action = ["log-critical", "reboot"]
"#,
    );

    let config = HealthdConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.logging.format, OutputFormat::Json);
    assert_eq!(config.enabled_monitors(), ["cpu"]);

    let specs = config.bmc_cpu_utilization.specs("BMC CPU utilization");
    assert_eq!(specs[0].limit, 95.0, "limit is clamped into the safe range");
    assert!(specs[0].has(ReactionKind::Reboot));
}

#[test]
fn test_missing_file_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let err = HealthdConfig::load_from(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, HealthdError::Io(_)));
    assert!(err.to_string().contains("absent.json"));
    assert!(!err.is_fatal_to_process(), "the daemon falls back to defaults");

    let fallback = HealthdConfig::default();
    fallback.validate().unwrap();
    assert_eq!(fallback.enabled_monitors(), ["log_rearm"]);
}

#[test]
fn test_directory_path_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    assert!(HealthdConfig::load_from(dir.path()).is_err());
}

#[test]
fn test_malformed_json_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "broken.json", "{ \"bmc_cpu_utilization\": ");
    let err = HealthdConfig::load_from(path).unwrap_err();
    assert!(matches!(err, HealthdError::Config(_)));
    assert!(!err.is_fatal_to_process(), "the daemon falls back to defaults");
}

#[test]
fn test_cpu_monitor_without_threshold_list_is_disabled() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "healthd.json",
        r#"{ "bmc_cpu_utilization": { "enabled": true, "window_size": 10 } }"#,
    );
    let config = HealthdConfig::load_from(path).unwrap();
    assert!(!config.enabled_monitors().contains(&"cpu"));
}

#[test]
fn test_invalid_log_level_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "healthd.json", r#"{ "logging": { "level": "chatty" } }"#);
    let err = HealthdConfig::load_from(path).unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("Invalid log level"));
}

#[test]
fn test_zero_window_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "healthd.json",
        r#"{ "bmc_mem_utilization": { "enabled": true, "window_size": 0, "threshold": [] } }"#,
    );
    let err = HealthdConfig::load_from(path).unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("window_size"));
}

#[test]
fn test_bic_monitor_requires_fru_and_escalation_limit() {
    let dir = TempDir::new().unwrap();
    let missing_fru = write(&dir, "a.json", r#"{ "bic_health": { "enabled": true } }"#);
    let zero_limit = write(
        &dir,
        "b.json",
        r#"{ "bic_health": { "enabled": true, "fru": 2, "escalation_limit": 0 } }"#,
    );

    let err = HealthdConfig::load_from(missing_fru).unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("fru is required"));
    let err = HealthdConfig::load_from(zero_limit).unwrap().validate().unwrap_err();
    assert!(err.to_string().contains("escalation_limit"));
}

#[test]
fn test_unsupported_busses_are_ignored() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "healthd.json",
        r#"{ "i2c": { "enabled": true, "busses": [3, 14, 20, 7] } }"#,
    );
    let config = HealthdConfig::load_from(path).unwrap();
    assert_eq!(config.i2c.active_busses(), [3, 7]);
}

#[test]
fn test_empty_bus_list_disables_bus_monitor() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "healthd.json", r#"{ "i2c": { "enabled": true, "busses": [] } }"#);
    let config = HealthdConfig::load_from(path).unwrap();
    assert!(!config.enabled_monitors().contains(&"i2c"));
}
