// Power-off waiter library - start a virtual machine and wait for it to power off
// This exposes the core components for testing and integration

pub mod cli;
pub mod config;
pub mod external;
pub mod hypervisor;
pub mod shutdown;
pub mod telemetry;
pub mod waiter;

// Re-export key types for easy access
pub use config::WaiterConfig;
pub use external::{CommandExecutor, ProcessCommandExecutor, VBoxManageConfig, VBoxManageService};
pub use hypervisor::{HypervisorError, LaunchMode, MachineState, VirtualizationService};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_wait_span, generate_correlation_id, init_telemetry};
pub use waiter::{PowerOffWaiter, WaitError, WaitOptions, WaitReport, WaitStep};
