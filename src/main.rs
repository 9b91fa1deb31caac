use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use poweroff_waiter::cli::Cli;
use poweroff_waiter::{
    init_telemetry, PowerOffWaiter, ProcessCommandExecutor, ShutdownCoordinator, VBoxManageService,
    WaitError, WaiterConfig,
};

const EXIT_SETUP_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if cli.print_config {
        return match config.to_toml() {
            Ok(rendered) => {
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration error: {e:#}");
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
        };
    }

    let machine = match config.required_machine() {
        Ok(machine) => machine.to_string(),
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            return ExitCode::from(EXIT_SETUP_FAILURE);
        }
    };

    match runtime.block_on(wait_command(&cli, &config, &machine)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(failure_exit_code(&e))
        }
    }
}

/// Exit status for a failure once configuration has been accepted
fn failure_exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<WaitError>() {
        Some(WaitError::Cancelled { .. }) => EXIT_CANCELLED,
        _ => EXIT_SETUP_FAILURE,
    }
}

fn load_config(cli: &Cli) -> Result<WaiterConfig> {
    WaiterConfig::load_env_file()?;
    let mut config = WaiterConfig::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

async fn wait_command(cli: &Cli, config: &WaiterConfig, machine: &str) -> Result<()> {
    init_telemetry(&config.observability)?;

    let options = config.wait_options()?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers()?;

    let service = Arc::new(VBoxManageService::new(
        Arc::new(ProcessCommandExecutor),
        config.vboxmanage(),
    ));
    let waiter = PowerOffWaiter::new(service, options);

    let report = waiter.wait_for_power_off(machine, &shutdown.token()).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let elapsed = report.finished_at - report.started_at;
        println!(
            "Done! '{}' powered off after {}s ({} polls)",
            report.machine.name,
            elapsed.num_seconds(),
            report.polls
        );
    }
    Ok(())
}
