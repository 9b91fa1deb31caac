use thiserror::Error;

use super::types::EventKind;
use crate::external::CommandError;

/// Failures reported by a virtualization service
#[derive(Debug, Error, Clone)]
pub enum HypervisorError {
    #[error("Machine not found: {name}")]
    NotFound { name: String },
    #[error("Launch failed: {message}")]
    Launch { message: String },
    #[error("Operation did not complete within {timeout_ms}ms")]
    OperationTimeout { timeout_ms: u64 },
    #[error("Event of kind {actual} cannot be narrowed to {expected}")]
    Narrowing { expected: EventKind, actual: EventKind },
    #[error("Unexpected output from {command}: {message}")]
    Parse { command: String, message: String },
    #[error("Unknown {kind} handle")]
    UnknownHandle { kind: &'static str },
    #[error("Backend error: {source}")]
    Backend {
        #[from]
        source: CommandError,
    },
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }
}
