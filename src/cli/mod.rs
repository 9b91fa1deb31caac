use clap::Parser;
use std::path::PathBuf;

use crate::config::WaiterConfig;
use crate::hypervisor::LaunchMode;

#[derive(Parser, Debug)]
#[command(name = "poweroff-waiter")]
#[command(about = "Start a VirtualBox machine and wait until it powers off")]
#[command(long_about = "Looks up a VirtualBox machine by name, launches it, and blocks until the \
                       machine reports that it has powered off. There is no overall deadline; \
                       press Ctrl-C to give up.")]
pub struct Cli {
    /// Machine to start and wait for (falls back to wait.machine in the config)
    pub machine: Option<String>,

    /// Configuration file (defaults to ./poweroff-waiter.toml when present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Longest block on a single event poll; negative blocks indefinitely
    #[arg(long, allow_negative_numbers = true)]
    pub poll_timeout_ms: Option<i64>,

    /// Deadline for the launch to complete; negative waits indefinitely
    #[arg(long, allow_negative_numbers = true)]
    pub launch_timeout_ms: Option<i64>,

    /// Frontend to launch the machine with
    #[arg(long, value_enum)]
    pub mode: Option<LaunchMode>,

    /// Extra NAME=value pair for the machine's process (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE")]
    pub launch_env: Vec<String>,

    /// Path to the VBoxManage binary
    #[arg(long)]
    pub vboxmanage: Option<String>,

    /// Print the wait report as JSON on success
    #[arg(long)]
    pub json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Apply command-line overrides on top of file and environment settings
    pub fn apply_to(&self, config: &mut WaiterConfig) {
        if let Some(machine) = &self.machine {
            config.wait.machine = Some(machine.clone());
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.wait.poll_timeout_ms = ms;
        }
        if let Some(ms) = self.launch_timeout_ms {
            config.wait.launch_timeout_ms = ms;
        }
        if let Some(mode) = self.mode {
            config.wait.launch_mode = mode;
        }
        if !self.launch_env.is_empty() {
            config.wait.launch_env = self.launch_env.clone();
        }
        if let Some(path) = &self.vboxmanage {
            config.vboxmanage.path = path.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positional_machine() {
        let cli = Cli::try_parse_from(["poweroff-waiter", "vmfuse-test"]).unwrap();
        assert_eq!(cli.machine.as_deref(), Some("vmfuse-test"));
        assert!(!cli.json);
    }

    #[test]
    fn test_overrides_win_over_config() {
        let cli = Cli::try_parse_from([
            "poweroff-waiter",
            "build-box",
            "--poll-timeout-ms",
            "-1",
            "--mode",
            "headless",
            "--env",
            "DISPLAY=:0",
            "--vboxmanage",
            "/opt/vbox/VBoxManage",
        ])
        .unwrap();

        let mut config = WaiterConfig::default();
        config.wait.machine = Some("from-config".to_string());
        cli.apply_to(&mut config);

        assert_eq!(config.wait.machine.as_deref(), Some("build-box"));
        assert_eq!(config.wait.poll_timeout_ms, -1);
        assert_eq!(config.wait.launch_timeout_ms, -1);
        assert_eq!(config.wait.launch_mode, LaunchMode::Headless);
        assert_eq!(config.wait.launch_env, vec!["DISPLAY=:0".to_string()]);
        assert_eq!(config.vboxmanage.path, "/opt/vbox/VBoxManage");
    }

    #[test]
    fn test_machine_can_come_from_config() {
        let cli = Cli::try_parse_from(["poweroff-waiter", "--json"]).unwrap();
        let mut config = WaiterConfig::default();
        config.wait.machine = Some("from-config".to_string());
        cli.apply_to(&mut config);

        assert!(cli.json);
        assert_eq!(config.wait.machine.as_deref(), Some("from-config"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["poweroff-waiter", "vm", "--mode", "vnc"]).is_err());
    }
}
