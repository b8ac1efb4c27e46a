//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the daemon. Configuration is
//! loaded from:
//! 1. The configuration document (JSON when the path ends in `.json`, TOML otherwise)
//! 2. Environment variables prefixed with `HEALTHD_`, nested with `__`
//!    (e.g. `HEALTHD_BIC_HEALTH__ENABLED=true`)
//!
//! Every section is optional and defaults to a disabled monitor, so a partial document is
//! valid. [`HealthdConfig::validate`] rejects semantically invalid values; threshold limits
//! outside the safe utilization range are clamped with a warning when the specs are built.
//!
//! # Example
//! ```no_run
//! use bmc_healthd::config::HealthdConfig;
//!
//! let config = HealthdConfig::load_from("/etc/healthd-config.json")?;
//! config.validate()?;
//! # Ok::<(), bmc_healthd::error::HealthdError>(())
//! ```

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HealthdError, HealthdResult};
use crate::health::threshold::{ReactionKind, Severity, ThresholdSpec};
use crate::limits::{
    DEFAULT_BIC_ESCALATION_LIMIT, DEFAULT_BIC_INTERVAL, DEFAULT_CPU_SETTLE_DELAY,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_FRUS, DEFAULT_MONITOR_INTERVAL,
    DEFAULT_REGEN_INTERVAL, DEFAULT_WINDOW_SIZE, I2C_BUS_COUNT, MAX_ECC_RECOVERABLE_COUNTER,
    MAX_ECC_UNRECOVERABLE_COUNTER, MAX_UTILIZATION_LIMIT, MIN_UTILIZATION_LIMIT,
};
use crate::logging::{parse_log_level, LoggingConfig};

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/healthd-config.json";

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthdConfig {
    /// Document version, logged on load
    #[serde(default)]
    pub version: Option<String>,
    /// Run the rearm coordinator
    #[serde(default = "default_true")]
    pub log_rearm: bool,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Heartbeat LED
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// CPU utilization monitor
    #[serde(default)]
    pub bmc_cpu_utilization: UtilizationConfig,
    /// Memory utilization monitor
    #[serde(default)]
    pub bmc_mem_utilization: UtilizationConfig,
    /// I2C bus-crash monitor
    #[serde(default)]
    pub i2c: I2cConfig,
    /// ECC counter monitor
    #[serde(default)]
    pub ecc_monitoring: EccConfig,
    /// Aggregate-health relog monitor
    #[serde(default)]
    pub bmc_health: BmcHealthConfig,
    /// Node-manager self-test monitor
    #[serde(default)]
    pub nm_monitor: NmMonitorConfig,
    /// Companion-controller health monitor
    #[serde(default)]
    pub bic_health: BicHealthConfig,
    /// Platform command table
    #[serde(default)]
    pub platform: PlatformConfig,
}

impl Default for HealthdConfig {
    fn default() -> Self {
        Self {
            version: None,
            log_rearm: default_true(),
            logging: LoggingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            bmc_cpu_utilization: UtilizationConfig::default(),
            bmc_mem_utilization: UtilizationConfig::default(),
            i2c: I2cConfig::default(),
            ecc_monitoring: EccConfig::default(),
            bmc_health: BmcHealthConfig::default(),
            nm_monitor: NmMonitorConfig::default(),
            bic_health: BicHealthConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

/// Heartbeat LED configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Toggle the LED
    #[serde(default)]
    pub enabled: bool,
    /// Half-period in milliseconds
    #[serde(default = "default_heartbeat_ms")]
    pub interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_heartbeat_ms(),
        }
    }
}

impl HeartbeatConfig {
    /// LED half-period.
    pub fn half_period(&self) -> Duration {
        if self.interval == 0 {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            Duration::from_millis(self.interval)
        }
    }
}

/// One configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Limit in percent
    pub value: f64,
    /// Dead-band below the limit
    #[serde(default)]
    pub hysteresis: f64,
    /// Actions: log-warning, log-critical, reboot, bmc-error-trigger, bmc-mem-clear
    #[serde(default)]
    pub action: Vec<String>,
}

impl ThresholdConfig {
    /// Build the runtime spec of metric `name`.
    ///
    /// With `clamp`, the limit is forced into the safe utilization range.
    pub fn to_spec(&self, name: &str, clamp: bool) -> ThresholdSpec {
        let mut limit = self.value;
        if clamp {
            if limit > MAX_UTILIZATION_LIMIT {
                tracing::warn!(
                    "user setting {name} threshold {limit} is too high and set threshold as {MAX_UTILIZATION_LIMIT}"
                );
                limit = MAX_UTILIZATION_LIMIT;
            }
            if limit < MIN_UTILIZATION_LIMIT {
                tracing::warn!(
                    "user setting {name} threshold {limit} is too low and set threshold as {MIN_UTILIZATION_LIMIT}"
                );
                limit = MIN_UTILIZATION_LIMIT;
            }
        }

        let mut spec = ThresholdSpec::new(limit, self.hysteresis, Severity::Warning);
        for action in &self.action {
            match action.as_str() {
                "log-warning" => {
                    spec.severity = Severity::Warning;
                    spec = spec.with_reaction(ReactionKind::Log);
                }
                "log-critical" => {
                    spec.severity = Severity::Critical;
                    spec = spec.with_reaction(ReactionKind::Log);
                }
                "reboot" => spec = spec.with_reaction(ReactionKind::Reboot),
                "bmc-error-trigger" => spec = spec.with_reaction(ReactionKind::ErrorTrigger),
                "bmc-mem-clear" => spec = spec.with_reaction(ReactionKind::MemClear),
                other => {
                    tracing::warn!(
                        metric = name,
                        action = other,
                        "ignoring unknown threshold action"
                    );
                }
            }
        }
        spec
    }
}

fn build_specs(name: &str, thresholds: &[ThresholdConfig], clamp: bool) -> Vec<ThresholdSpec> {
    thresholds.iter().map(|t| t.to_spec(name, clamp)).collect()
}

fn validate_thresholds(section: &str, thresholds: &[ThresholdConfig]) -> HealthdResult<()> {
    for (i, t) in thresholds.iter().enumerate() {
        if !t.value.is_finite() {
            return Err(HealthdError::Configuration(format!(
                "{section}: threshold[{i}] value must be a finite number"
            )));
        }
        if !t.hysteresis.is_finite() || t.hysteresis < 0.0 {
            return Err(HealthdError::Configuration(format!(
                "{section}: threshold[{i}] hysteresis must be a non-negative number, got {}",
                t.hysteresis
            )));
        }
    }
    Ok(())
}

/// CPU or memory utilization monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// Moving-average window in samples
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Seconds between samples (0 selects the default)
    #[serde(default = "default_interval_secs")]
    pub monitor_interval: u64,
    /// Seconds to wait before the first sample
    #[serde(default)]
    pub settle_delay: Option<u64>,
    /// Thresholds; the monitor is disabled without them
    #[serde(default)]
    pub threshold: Option<Vec<ThresholdConfig>>,
    /// Memory only: set `vm.panic_on_oom`
    #[serde(default)]
    pub enable_panic_on_oom: bool,
    /// Memory only: reserve free memory
    #[serde(default)]
    pub min_free_kbytes: Option<u32>,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: default_window_size(),
            monitor_interval: default_interval_secs(),
            settle_delay: None,
            threshold: None,
            enable_panic_on_oom: false,
            min_free_kbytes: None,
        }
    }
}

impl UtilizationConfig {
    /// Enabled and carrying a threshold list.
    pub fn is_active(&self) -> bool {
        self.enabled && self.threshold.is_some()
    }

    /// Sampling period.
    pub fn poll_interval(&self) -> Duration {
        interval_or_default(self.monitor_interval, DEFAULT_MONITOR_INTERVAL)
    }

    /// Delay before the first sample, falling back to `default`.
    pub fn settle_delay_or(&self, default: Duration) -> Duration {
        self.settle_delay.map_or(default, Duration::from_secs)
    }

    /// Runtime specs of metric `name`, clamped into the safe range.
    pub fn specs(&self, name: &str) -> Vec<ThresholdSpec> {
        build_specs(name, self.threshold.as_deref().unwrap_or_default(), true)
    }
}

/// I2C bus-crash monitor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct I2cConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// Bus ids to poll (base 0)
    #[serde(default)]
    pub busses: Vec<u32>,
}

impl I2cConfig {
    /// Supported bus ids, warning about the rest.
    pub fn active_busses(&self) -> Vec<u8> {
        let mut busses = Vec::new();
        for &bus in &self.busses {
            match u8::try_from(bus) {
                Ok(id) if id < I2C_BUS_COUNT => {
                    if !busses.contains(&id) {
                        busses.push(id);
                    }
                }
                _ => tracing::warn!("HEALTHD: Warning: Ignoring unsupported I2C Bus:{bus}"),
            }
        }
        busses
    }

    /// Enabled with at least one configured bus.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.busses.is_empty()
    }
}

/// ECC monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EccConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// Include the error address in assertion lines
    #[serde(default)]
    pub ecc_address_log: bool,
    /// Seconds between reads (0 selects the default)
    #[serde(default = "default_interval_secs")]
    pub monitor_interval: u64,
    /// Saturation value of the recoverable counter
    #[serde(default = "default_recov_max")]
    pub recov_max_counter: u32,
    /// Saturation value of the unrecoverable counter
    #[serde(default = "default_unrec_max")]
    pub unrec_max_counter: u32,
    /// Recoverable thresholds, in percent of the counter maximum
    #[serde(default)]
    pub recov_threshold: Vec<ThresholdConfig>,
    /// Unrecoverable thresholds, in percent of the counter maximum
    #[serde(default)]
    pub unrec_threshold: Vec<ThresholdConfig>,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ecc_address_log: false,
            monitor_interval: default_interval_secs(),
            recov_max_counter: default_recov_max(),
            unrec_max_counter: default_unrec_max(),
            recov_threshold: Vec::new(),
            unrec_threshold: Vec::new(),
        }
    }
}

impl EccConfig {
    /// Read period.
    pub fn poll_interval(&self) -> Duration {
        interval_or_default(self.monitor_interval, DEFAULT_MONITOR_INTERVAL)
    }

    /// Recoverable specs of metric `name`.
    pub fn recoverable_specs(&self, name: &str) -> Vec<ThresholdSpec> {
        build_specs(name, &self.recov_threshold, false)
    }

    /// Unrecoverable specs of metric `name`.
    pub fn unrecoverable_specs(&self, name: &str) -> Vec<ThresholdSpec> {
        build_specs(name, &self.unrec_threshold, false)
    }
}

/// Aggregate-health relog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmcHealthConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between flag reads (0 selects the default)
    #[serde(default = "default_interval_secs")]
    pub monitor_interval: u64,
    /// Seconds between forced relogs
    #[serde(default = "default_regen_secs")]
    pub regenerating_interval: u64,
}

impl Default for BmcHealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monitor_interval: default_interval_secs(),
            regenerating_interval: default_regen_secs(),
        }
    }
}

impl BmcHealthConfig {
    /// Read period.
    pub fn poll_interval(&self) -> Duration {
        interval_or_default(self.monitor_interval, DEFAULT_MONITOR_INTERVAL)
    }

    /// Cycles between forced relogs.
    pub fn relog_criteria(&self) -> u64 {
        self.regenerating_interval / self.poll_interval().as_secs().max(1)
    }
}

/// Node-manager self-test configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmMonitorConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between scans (0 selects the default)
    #[serde(default = "default_interval_secs")]
    pub monitor_interval: u64,
    /// Non-normal answers tolerated before asserting
    #[serde(default)]
    pub retry_threshold: u8,
    /// Self-test travels through the companion controller; run it from that monitor instead
    #[serde(default)]
    pub nm_transmission_via_bic: bool,
    /// Highest FRU scanned
    #[serde(default = "default_max_frus")]
    pub max_frus: u8,
}

impl Default for NmMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monitor_interval: default_interval_secs(),
            retry_threshold: 0,
            nm_transmission_via_bic: false,
            max_frus: default_max_frus(),
        }
    }
}

impl NmMonitorConfig {
    /// Scan period.
    pub fn poll_interval(&self) -> Duration {
        interval_or_default(self.monitor_interval, DEFAULT_MONITOR_INTERVAL)
    }
}

/// Companion-controller health configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BicHealthConfig {
    /// Run the monitor
    #[serde(default)]
    pub enabled: bool,
    /// FRU hosting the companion controller
    #[serde(default)]
    pub fru: Option<u8>,
    /// Seconds between cycles (0 selects the default)
    #[serde(default = "default_bic_interval_secs")]
    pub monitor_interval: u64,
    /// Failed cycles before the controller is reset
    #[serde(default = "default_escalation_limit")]
    pub escalation_limit: u32,
}

impl Default for BicHealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fru: None,
            monitor_interval: default_bic_interval_secs(),
            escalation_limit: default_escalation_limit(),
        }
    }
}

impl BicHealthConfig {
    /// Cycle period.
    pub fn poll_interval(&self) -> Duration {
        interval_or_default(self.monitor_interval, DEFAULT_BIC_INTERVAL)
    }
}

/// Shell commands and paths used by the platform collaborators
///
/// Placeholders: `{bus}`, `{fru}`, `{tag}`, `{on}`, `{kbytes}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Directory of the file-per-key flag store
    pub kv_store_dir: PathBuf,
    /// Prints the status word of I2C bus `{bus}`
    pub i2c_status_cmd: Option<String>,
    /// Prints the memory-controller ECC status word
    pub ecc_status_cmd: Option<String>,
    /// Prints the last recoverable ECC error address
    pub ecc_recoverable_addr_cmd: Option<String>,
    /// Prints the first unrecoverable ECC error address
    pub ecc_unrecoverable_addr_cmd: Option<String>,
    /// Exits 0 when the 12 V rail of `{fru}` is on
    pub power_good_cmd: Option<String>,
    /// Exits 0 while a firmware update of `{fru}` is running
    pub fw_update_cmd: Option<String>,
    /// Exits 0 when `{fru}` holds a server
    pub server_slot_cmd: Option<String>,
    /// Companion ready check
    pub bic_ready_cmd: Option<String>,
    /// Companion heartbeat check
    pub bic_heartbeat_cmd: Option<String>,
    /// Companion IPMB self-test
    pub bic_ipmb_cmd: Option<String>,
    /// Prints the two self-test bytes of the node manager on `{fru}`
    pub nm_selftest_cmd: Option<String>,
    /// Reboots the controller
    pub reboot_cmd: Option<String>,
    /// Hard-resets the companion controller of `{fru}`
    pub bic_reset_cmd: Option<String>,
    /// Raises the error indication for `{tag}`
    pub error_enable_cmd: Option<String>,
    /// Clears the error indication for `{tag}`
    pub error_disable_cmd: Option<String>,
    /// Drops page caches
    pub mem_clear_cmd: Option<String>,
    /// Assists recovery of bus `{bus}`
    pub bus_recovery_assist_cmd: Option<String>,
    /// Notifies recovery of bus `{bus}`
    pub bus_recovered_cmd: Option<String>,
    /// Drives the heartbeat LED to `{on}` (1/0)
    pub heartbeat_led_cmd: Option<String>,
    /// Sets `vm.min_free_kbytes` to `{kbytes}`
    pub min_free_kbytes_cmd: Option<String>,
    /// Path of the `panic_on_oom` sysctl
    pub panic_on_oom_path: PathBuf,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kv_store_dir: PathBuf::from("/tmp/cache_store"),
            i2c_status_cmd: None,
            ecc_status_cmd: None,
            ecc_recoverable_addr_cmd: None,
            ecc_unrecoverable_addr_cmd: None,
            power_good_cmd: None,
            fw_update_cmd: None,
            server_slot_cmd: None,
            bic_ready_cmd: None,
            bic_heartbeat_cmd: None,
            bic_ipmb_cmd: None,
            nm_selftest_cmd: None,
            reboot_cmd: Some("/sbin/reboot".to_string()),
            bic_reset_cmd: None,
            error_enable_cmd: None,
            error_disable_cmd: None,
            mem_clear_cmd: Some("sync; /sbin/sysctl vm.drop_caches=3 > /dev/null".to_string()),
            bus_recovery_assist_cmd: None,
            bus_recovered_cmd: None,
            heartbeat_led_cmd: None,
            min_free_kbytes_cmd: Some(
                "/sbin/sysctl -w vm.min_free_kbytes={kbytes} > /dev/null".to_string(),
            ),
            panic_on_oom_path: PathBuf::from("/proc/sys/vm/panic_on_oom"),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_interval_secs() -> u64 {
    DEFAULT_MONITOR_INTERVAL.as_secs()
}

fn default_bic_interval_secs() -> u64 {
    DEFAULT_BIC_INTERVAL.as_secs()
}

fn default_regen_secs() -> u64 {
    DEFAULT_REGEN_INTERVAL.as_secs()
}

fn default_recov_max() -> u32 {
    MAX_ECC_RECOVERABLE_COUNTER
}

fn default_unrec_max() -> u32 {
    MAX_ECC_UNRECOVERABLE_COUNTER
}

fn default_escalation_limit() -> u32 {
    DEFAULT_BIC_ESCALATION_LIMIT
}

fn default_max_frus() -> u8 {
    DEFAULT_MAX_FRUS
}

fn interval_or_default(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}

impl HealthdConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> HealthdResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing or unreadable file is an error; callers decide whether to fall back to
    /// [`HealthdConfig::default`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> HealthdResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HealthdError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file {} not found", path.display()),
            )));
        }
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let figment = if is_json {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        Ok(figment
            .merge(Env::prefixed("HEALTHD_").split("__"))
            .extract()?)
    }

    /// Validate semantic constraints after loading.
    pub fn validate(&self) -> HealthdResult<()> {
        parse_log_level(&self.logging.level).map_err(HealthdError::Configuration)?;

        for (section, cfg) in [
            ("bmc_cpu_utilization", &self.bmc_cpu_utilization),
            ("bmc_mem_utilization", &self.bmc_mem_utilization),
        ] {
            if cfg.window_size == 0 {
                return Err(HealthdError::Configuration(format!(
                    "{section}: window_size must be at least 1"
                )));
            }
            validate_thresholds(section, cfg.threshold.as_deref().unwrap_or_default())?;
        }

        let ecc = &self.ecc_monitoring;
        validate_thresholds("ecc_monitoring.recov_threshold", &ecc.recov_threshold)?;
        validate_thresholds("ecc_monitoring.unrec_threshold", &ecc.unrec_threshold)?;

        if self.bic_health.enabled {
            if self.bic_health.fru.is_none() {
                return Err(HealthdError::Configuration(
                    "bic_health: fru is required when the monitor is enabled".into(),
                ));
            }
            if self.bic_health.escalation_limit == 0 {
                return Err(HealthdError::Configuration(
                    "bic_health: escalation_limit must be at least 1".into(),
                ));
            }
        }

        Ok(())
    }

    /// Names of the monitors that will run.
    pub fn enabled_monitors(&self) -> Vec<&'static str> {
        let mut monitors = Vec::new();
        if self.heartbeat.enabled {
            monitors.push("heartbeat");
        }
        if self.bmc_cpu_utilization.is_active() {
            monitors.push("cpu");
        }
        if self.bmc_mem_utilization.is_active() {
            monitors.push("mem");
        }
        if self.i2c.is_active() {
            monitors.push("i2c");
        }
        if self.ecc_monitoring.enabled {
            monitors.push("ecc");
        }
        if self.bmc_health.enabled {
            monitors.push("bmc_health");
        }
        if self.nm_monitor.enabled && !self.nm_monitor.nm_transmission_via_bic {
            monitors.push("nm_monitor");
        }
        if self.bic_health.enabled {
            monitors.push("bic_health");
        }
        if self.log_rearm {
            monitors.push("log_rearm");
        }
        monitors
    }
}
