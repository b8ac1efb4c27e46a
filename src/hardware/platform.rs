//! Platform collaborators for a real controller.
//!
//! - [`SysinfoMetrics`]: CPU and memory utilization through `sysinfo`
//! - [`FileFlagStore`]: one file per key under a cache directory
//! - [`CommandQueries`] / [`CommandActions`]: register reads, checks and hooks delegated to
//!   configured shell commands, so one binary serves boards with different tooling
//!
//! Command templates may contain `{bus}`, `{fru}`, `{tag}`, `{on}` and `{kbytes}`
//! placeholders. Acquisition commands are bounded by [`ACQUISITION_TIMEOUT`]; hook commands
//! are not.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use sysinfo::System;
use tokio::process::Command;

use crate::config::PlatformConfig;
use crate::hardware::capabilities::{
    CompanionCheck, CompanionLink, FlagStore, Metric, MetricSource, NodeManagerLink,
    RecoveryActions, StatusUnit, StatusWordSource,
};
use crate::limits::ACQUISITION_TIMEOUT;

// =============================================================================
// SysinfoMetrics
// =============================================================================

/// CPU and memory utilization of the local system.
pub struct SysinfoMetrics {
    system: Mutex<System>,
}

impl SysinfoMetrics {
    /// Create the source and take the baseline CPU reading.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for SysinfoMetrics {
    async fn sample(&self, metric: Metric) -> Result<f64> {
        let mut system = self.system.lock();
        match metric {
            Metric::CpuUtilization => {
                system.refresh_cpu_usage();
                Ok(f64::from(system.global_cpu_usage()) / 100.0)
            }
            Metric::MemoryUtilization => {
                system.refresh_memory();
                let total = system.total_memory();
                if total == 0 {
                    bail!("total memory reported as zero");
                }
                Ok(total.saturating_sub(system.free_memory()) as f64 / total as f64)
            }
        }
    }
}

// =============================================================================
// FileFlagStore
// =============================================================================

/// Key-value store keeping each key in its own file.
#[derive(Debug, Clone)]
pub struct FileFlagStore {
    dir: PathBuf,
}

impl FileFlagStore {
    /// Store rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            bail!("invalid key '{key}'");
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl FlagStore for FileFlagStore {
    async fn read_flag(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path(key)?).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading key '{key}'")),
        }
    }

    async fn persist_flag(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        tokio::fs::create_dir_all(&self.dir).await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        tokio::fs::write(&path, value).await
            .with_context(|| format!("writing key '{key}'"))
    }
}

// =============================================================================
// Shell commands
// =============================================================================

fn render(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |cmd, (name, value)| {
        cmd.replace(&format!("{{{name}}}"), value)
    })
}

async fn run_shell(command: &str) -> Result<Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output().await
        .with_context(|| format!("spawning '{command}'"))
}

async fn run_acquisition(command: &str) -> Result<Output> {
    tokio::time::timeout(ACQUISITION_TIMEOUT, run_shell(command)).await
        .map_err(|_| anyhow!("'{command}' timed out after {ACQUISITION_TIMEOUT:?}"))?
}

/// Parse a register value printed as decimal or `0x` hex.
pub fn parse_word(text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("unparseable status word '{text}'"))
}

/// Parse a two-byte self-test answer such as `55 00` or `0x55 0x00`.
pub fn parse_selftest(text: &str) -> Result<[u8; 2]> {
    let bytes = text
        .split_whitespace()
        .map(|b| u8::from_str_radix(b.trim_start_matches("0x").trim_start_matches("0X"), 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .with_context(|| format!("unparseable self-test answer '{}'", text.trim()))?;
    match bytes.as_slice() {
        [first, second, ..] => Ok([*first, *second]),
        _ => bail!("self-test answer too short: '{}'", text.trim()),
    }
}

/// Acquisitions backed by shell commands.
#[derive(Debug, Clone)]
pub struct CommandQueries {
    config: Arc<PlatformConfig>,
}

impl CommandQueries {
    /// Queries using the commands in `config`.
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }

    async fn stdout_of(
        &self,
        template: Option<&str>,
        what: &str,
        vars: &[(&str, String)],
    ) -> Result<String> {
        let template = template.ok_or_else(|| anyhow!("no command configured for {what}"))?;
        let output = run_acquisition(&render(template, vars)).await?;
        if !output.status.success() {
            bail!("{what} command exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn succeeds(
        &self,
        template: Option<&str>,
        what: &str,
        vars: &[(&str, String)],
    ) -> Result<bool> {
        let template = template.ok_or_else(|| anyhow!("no command configured for {what}"))?;
        Ok(run_acquisition(&render(template, vars)).await?.status.success())
    }
}

#[async_trait]
impl StatusWordSource for CommandQueries {
    async fn read_status(&self, unit: StatusUnit) -> Result<u32> {
        let c = &self.config;
        let (template, vars) = match unit {
            StatusUnit::I2cBus(bus) => {
                (c.i2c_status_cmd.as_deref(), vec![("bus", bus.to_string())])
            }
            StatusUnit::MemoryController => (c.ecc_status_cmd.as_deref(), vec![]),
            StatusUnit::LastRecoverableEccAddress => {
                (c.ecc_recoverable_addr_cmd.as_deref(), vec![])
            }
            StatusUnit::FirstUnrecoverableEccAddress => {
                (c.ecc_unrecoverable_addr_cmd.as_deref(), vec![])
            }
        };
        let stdout = self.stdout_of(template, &unit.to_string(), &vars).await?;
        parse_word(&stdout)
    }
}

#[async_trait]
impl CompanionLink for CommandQueries {
    async fn power_good(&self, fru: u8) -> Result<bool> {
        let vars = [("fru", fru.to_string())];
        self.succeeds(self.config.power_good_cmd.as_deref(), "12V power", &vars).await
    }

    async fn update_in_progress(&self, fru: u8) -> Result<bool> {
        match self.config.fw_update_cmd.as_deref() {
            Some(cmd) => Ok(run_acquisition(&render(cmd, &[("fru", fru.to_string())]))
                .await?
                .status
                .success()),
            None => Ok(false),
        }
    }

    async fn run_check(&self, fru: u8, check: CompanionCheck) -> Result<bool> {
        let template = match check {
            CompanionCheck::Ready => self.config.bic_ready_cmd.as_deref(),
            CompanionCheck::Heartbeat => self.config.bic_heartbeat_cmd.as_deref(),
            CompanionCheck::Ipmb => self.config.bic_ipmb_cmd.as_deref(),
        };
        self.succeeds(template, check.label(), &[("fru", fru.to_string())]).await
    }
}

#[async_trait]
impl NodeManagerLink for CommandQueries {
    async fn is_server_slot(&self, fru: u8) -> Result<bool> {
        match self.config.server_slot_cmd.as_deref() {
            Some(cmd) => Ok(run_acquisition(&render(cmd, &[("fru", fru.to_string())]))
                .await?
                .status
                .success()),
            None => Ok(true),
        }
    }

    async fn update_ongoing(&self, fru: u8) -> Result<bool> {
        CompanionLink::update_in_progress(self, fru).await
    }

    async fn self_test(&self, fru: u8) -> Result<[u8; 2]> {
        let stdout = self
            .stdout_of(
                self.config.nm_selftest_cmd.as_deref(),
                "node manager self-test",
                &[("fru", fru.to_string())],
            )
            .await?;
        parse_selftest(&stdout)
    }
}

/// Recovery hooks backed by shell commands.
#[derive(Debug, Clone)]
pub struct CommandActions {
    config: Arc<PlatformConfig>,
}

impl CommandActions {
    /// Hooks using the commands in `config`.
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }

    async fn hook(
        &self,
        name: &str,
        template: Option<&str>,
        vars: &[(&str, String)],
    ) -> Result<()> {
        let Some(template) = template else {
            tracing::debug!(hook = name, "no command configured, skipping");
            return Ok(());
        };
        let command = render(template, vars);
        let output = run_shell(&command).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{name} exited with {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }

    async fn set_panic_on_oom(&self) -> Result<()> {
        let path = &self.config.panic_on_oom_path;
        let current = tokio::fs::read_to_string(path).await
            .with_context(|| format!("failed to read file: {}", path.display()))?;
        if current.trim() == "0" {
            tokio::fs::write(path, "1").await
                .with_context(|| format!("failed to write to file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryActions for CommandActions {
    async fn reboot(&self) -> Result<()> {
        self.hook("reboot", self.config.reboot_cmd.as_deref(), &[]).await
    }

    async fn hardware_reset(&self, fru: u8) -> Result<()> {
        let vars = [("fru", fru.to_string())];
        self.hook("hardware_reset", self.config.bic_reset_cmd.as_deref(), &vars).await
    }

    async fn error_enable(&self, tag: &str) -> Result<()> {
        let vars = [("tag", tag.to_string())];
        self.hook("error_enable", self.config.error_enable_cmd.as_deref(), &vars).await
    }

    async fn error_disable(&self, tag: &str) -> Result<()> {
        let vars = [("tag", tag.to_string())];
        self.hook("error_disable", self.config.error_disable_cmd.as_deref(), &vars).await
    }

    async fn mem_clear(&self) -> Result<()> {
        self.hook("mem_clear", self.config.mem_clear_cmd.as_deref(), &[]).await
    }

    async fn bus_recovery_assist(&self, bus: u8) -> Result<()> {
        self.hook(
            "bus_recovery_assist",
            self.config.bus_recovery_assist_cmd.as_deref(),
            &[("bus", bus.to_string())],
        )
        .await
    }

    async fn bus_recovered(&self, bus: u8) -> Result<()> {
        let vars = [("bus", bus.to_string())];
        self.hook("bus_recovered", self.config.bus_recovered_cmd.as_deref(), &vars).await
    }

    async fn set_heartbeat_led(&self, on: bool) -> Result<()> {
        let vars = [("on", if on { "1" } else { "0" }.to_string())];
        self.hook("set_heartbeat_led", self.config.heartbeat_led_cmd.as_deref(), &vars).await
    }

    async fn tune_memory(&self, panic_on_oom: bool, min_free_kbytes: Option<u32>) -> Result<()> {
        let mut failures = Vec::new();
        if panic_on_oom {
            if let Err(e) = self.set_panic_on_oom().await {
                failures.push(format!("{e:#}"));
            }
        }
        if let Some(kbytes) = min_free_kbytes.filter(|k| *k > 0) {
            if let Err(e) = self
                .hook(
                    "min_free_kbytes",
                    self.config.min_free_kbytes_cmd.as_deref(),
                    &[("kbytes", kbytes.to_string())],
                )
                .await
            {
                failures.push(format!("set min_free_kbytes failed: {e:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }
}
