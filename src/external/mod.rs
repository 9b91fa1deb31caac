//! External tool abstractions
//!
//! Trait-based wrappers around the command-line tools the waiter shells out
//! to, so the hypervisor backend can be tested with canned command output.

pub mod command;
pub mod vboxmanage;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use vboxmanage::{VBoxManageConfig, VBoxManageService};
