//! Gattlink CLI Configuration Management
//!
//! Configuration is read from a TOML file: the path given with `--config`,
//! otherwise `<config dir>/gattlink/gattlink.toml` when it exists, otherwise
//! built-in defaults. Missing sections and fields fall back to their defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use gattlink_ble::BleSessionConfig;
use gattlink_core::ServiceConfig;

use crate::error::{CliError, Result};

/// File name of the persisted settings inside the state directory
pub const SETTINGS_FILE: &str = "settings.json";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the gattlink CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Connection manager configuration
    pub service: ServiceConfig,
    /// Adapter selection
    pub ble: BleSessionConfig,
    /// CLI behaviour
    pub cli: CliConfig,
    /// Where persisted settings live
    pub state: StateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Service used when `--service` is not given
    pub default_service: Option<Uuid>,
    /// Upper bound on waiting for the link or an operation result
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Overrides the platform data directory
    pub state_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_service: None,
            wait_timeout_secs: 30,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::load_from_file(path),
                _ => {
                    info!("Using default configuration");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)?;

        config.validate()?;
        Ok(config)
    }

    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gattlink").join("gattlink.toml"))
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.cli.wait_timeout_secs == 0 {
            return Err(CliError::Config(
                "cli.wait_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.service.queue.watchdog_checks == 0 {
            return Err(CliError::Config(
                "service.queue.watchdog_checks must be greater than 0".to_string(),
            ));
        }

        if self.service.status_capacity == 0 {
            return Err(CliError::Config(
                "service.status_capacity must be greater than 0".to_string(),
            ));
        }

        if self.service.settings_key.trim().is_empty() {
            return Err(CliError::Config(
                "service.settings_key must not be empty".to_string(),
            ));
        }

        let machine = &self.service.machine;
        if machine.scan_timeout.is_zero()
            || machine.connect_timeout.is_zero()
            || machine.operation_timeout.is_zero()
        {
            return Err(CliError::Config(
                "service.machine timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Service from the command line, else the configured default
    pub fn resolve_service(&self, flag: Option<Uuid>) -> Result<Uuid> {
        flag.or(self.cli.default_service)
            .ok_or(CliError::MissingService)
    }

    /// Directory holding the settings file, created on demand
    pub fn get_state_dir(&self) -> Result<PathBuf> {
        let dir = match &self.state.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .map(|dir| dir.join("gattlink"))
                .ok_or_else(|| CliError::Config("No data directory on this platform".into()))?,
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn settings_path(&self) -> Result<PathBuf> {
        Ok(self.get_state_dir()?.join(SETTINGS_FILE))
    }

    /// Create example configuration file content
    pub fn example_config() -> String {
        let example = AppConfig {
            cli: CliConfig {
                default_service: Some(Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb)),
                wait_timeout_secs: 30,
            },
            ..Default::default()
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
