//! CLI Entry Point for bmc-healthd
//!
//! # Usage
//!
//! Start the daemon:
//! ```bash
//! bmc-healthd run --config /etc/healthd-config.json
//! ```
//!
//! Start against in-memory collaborators (development):
//! ```bash
//! bmc-healthd run --config config/healthd-config.json --simulate
//! ```
//!
//! Validate a configuration document:
//! ```bash
//! bmc-healthd check-config --config /etc/healthd-config.json
//! ```

use anyhow::Result;
use bmc_healthd::config::{HealthdConfig, DEFAULT_CONFIG_PATH};
use bmc_healthd::health::threshold::{log_at, Severity};
use bmc_healthd::{logging, Collaborators, HealthDaemon};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bmc-healthd")]
#[command(about = "BMC health monitoring daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until SIGTERM, SIGALRM or ctrl-c
    Run {
        /// Configuration document (JSON or TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Use in-memory collaborators instead of the platform
        #[arg(long)]
        simulate: bool,
    },

    /// Load and validate a configuration, then print the monitors it enables
    CheckConfig {
        /// Configuration document (JSON or TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => run_daemon(config, simulate).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run_daemon(path: PathBuf, simulate: bool) -> Result<()> {
    let loaded = HealthdConfig::load_from(&path);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => HealthdConfig::default(),
    };
    logging::init(&config.logging).map_err(anyhow::Error::msg)?;

    match loaded {
        Ok(config) => tracing::info!(
            "Loaded configuration version: {}",
            config.version.as_deref().unwrap_or("unknown")
        ),
        Err(e) => {
            log_at(Severity::Critical, "HEALTHD configuration load failed");
            tracing::error!(path = %path.display(), error = %e, "continuing with defaults");
        }
    }

    let collaborators = if simulate {
        tracing::warn!("running against simulated collaborators");
        Collaborators::simulated()
    } else {
        Collaborators::platform(&config.platform)
    };

    if let Err(e) = HealthDaemon::new(config, collaborators).run().await {
        if e.is_fatal_to_process() {
            log_at(Severity::Critical, &format!("HEALTHD configuration rejected: {e}"));
        }
        return Err(e.into());
    }
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = HealthdConfig::load_from(&path)?;
    config.validate()?;

    let summary = serde_json::json!({
        "path": path.display().to_string(),
        "version": config.version,
        "monitors": config.enabled_monitors(),
        "i2c_busses": config.i2c.active_busses(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
