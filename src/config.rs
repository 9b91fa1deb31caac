use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::external::VBoxManageConfig;
use crate::hypervisor::LaunchMode;
use crate::waiter::WaitOptions;

const DEFAULT_CONFIG_FILE: &str = "poweroff-waiter.toml";

/// Main configuration structure for the power-off waiter
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WaiterConfig {
    pub wait: WaitConfig,
    pub vboxmanage: VBoxManageSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Machine to wait for when none is given on the command line
    pub machine: Option<String>,
    /// Longest block on a single event poll; negative blocks indefinitely
    pub poll_timeout_ms: i64,
    /// Deadline for the launch operation; negative waits indefinitely
    pub launch_timeout_ms: i64,
    pub launch_mode: LaunchMode,
    /// Extra `NAME=value` pairs passed to the machine's process
    pub launch_env: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VBoxManageSettings {
    /// Path or name of the VBoxManage binary
    pub path: String,
    /// Interval between machine state probes
    pub state_probe_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, overridden by RUST_LOG
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            machine: None,
            poll_timeout_ms: 10_000,
            launch_timeout_ms: -1,
            launch_mode: LaunchMode::Gui,
            launch_env: Vec::new(),
        }
    }
}

impl Default for VBoxManageSettings {
    fn default() -> Self {
        Self {
            path: "VBoxManage".to_string(),
            state_probe_interval_ms: 500,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Convert a millisecond setting where a negative value means "no limit"
pub fn optional_timeout(name: &str, millis: i64) -> Result<Option<Duration>> {
    match millis {
        0 => bail!("{name} must be positive, or negative to wait indefinitely"),
        ms if ms < 0 => Ok(None),
        ms => Ok(Some(Duration::from_millis(ms as u64))),
    }
}

impl WaiterConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`path`, or poweroff-waiter.toml if present)
    /// 3. Environment variables (prefixed with POWEROFF_WAITER_, `__` between sections)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("POWEROFF_WAITER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: WaiterConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load .env file if it exists. Runs before logging is set up.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
        }
        Ok(())
    }

    /// Machine to wait for, from the command line or `wait.machine`
    pub fn required_machine(&self) -> Result<&str> {
        self.wait
            .machine
            .as_deref()
            .context("no machine given: pass MACHINE or set wait.machine in the config")
    }

    pub fn validate(&self) -> Result<()> {
        optional_timeout("wait.poll_timeout_ms", self.wait.poll_timeout_ms)?;
        optional_timeout("wait.launch_timeout_ms", self.wait.launch_timeout_ms)?;
        if self.vboxmanage.state_probe_interval_ms == 0 {
            bail!("vboxmanage.state_probe_interval_ms must be positive");
        }
        if let Some(bad) = self.wait.launch_env.iter().find(|v| !v.contains('=')) {
            bail!("wait.launch_env entry '{bad}' is not of the form NAME=value");
        }
        Ok(())
    }

    pub fn wait_options(&self) -> Result<WaitOptions> {
        Ok(WaitOptions {
            poll_timeout: optional_timeout("wait.poll_timeout_ms", self.wait.poll_timeout_ms)?,
            launch_timeout: optional_timeout(
                "wait.launch_timeout_ms",
                self.wait.launch_timeout_ms,
            )?,
            launch_mode: self.wait.launch_mode,
            launch_env: self.wait.launch_env.clone(),
        })
    }

    pub fn vboxmanage(&self) -> VBoxManageConfig {
        VBoxManageConfig {
            program: self.vboxmanage.path.clone(),
            state_probe_interval: Duration::from_millis(self.vboxmanage.state_probe_interval_ms),
        }
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
