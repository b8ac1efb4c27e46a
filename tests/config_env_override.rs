//! Environment overrides on top of the configuration document.
//!
//! Kept in its own test binary: it mutates the process environment.

use bmc_healthd::config::HealthdConfig;
use tempfile::TempDir;

#[test]
fn test_env_overrides_nested_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("healthd.json");
    std::fs::write(
        &path,
        r#"{ "bic_health": { "enabled": false, "fru": 1 }, "logging": { "level": "info" } }"#,
    )
    .unwrap();

    std::env::set_var("HEALTHD_BIC_HEALTH__ENABLED", "true");
    std::env::set_var("HEALTHD_LOGGING__LEVEL", "debug");
    let config = HealthdConfig::load_from(&path);
    std::env::remove_var("HEALTHD_BIC_HEALTH__ENABLED");
    std::env::remove_var("HEALTHD_LOGGING__LEVEL");

    let config = config.unwrap();
    assert!(config.bic_health.enabled);
    assert_eq!(config.bic_health.fru, Some(1));
    assert_eq!(config.logging.level, "debug");
}
