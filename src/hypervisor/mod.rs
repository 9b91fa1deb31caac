// Hypervisor Module - virtualization service interface and in-memory backend
//
// The waiter only ever talks to a `VirtualizationService`; concrete backends
// live in `crate::external` (VBoxManage) and `scripted` (tests and demos).

pub mod errors;
pub mod scripted;
pub mod traits;
pub mod types;


pub use errors::HypervisorError;
pub use scripted::{ScriptStep, ScriptedService, ServiceCall};
pub use traits::VirtualizationService;
pub use types::{
    Event, EventKind, EventSourceHandle, LaunchMode, ListenerHandle, MachineRef, MachineState,
    ProgressHandle, SessionHandle, StateChangedEvent,
};
