// Capability interface the waiter consumes - separating the hypervisor from the wait logic

use async_trait::async_trait;
use std::time::Duration;

use super::errors::HypervisorError;
use super::types::*;

/// Narrow view of a virtualization management service
///
/// Constructed once by the caller and passed explicitly to whatever needs it.
/// Timeouts are `Option<Duration>`; `None` blocks until the service answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VirtualizationService: Send + Sync {
    /// Look up a registered machine by name
    async fn find_machine(&self, name: &str) -> Result<MachineRef, HypervisorError>;

    /// Open a session for interacting with `machine`
    async fn open_session(&self, machine: &MachineRef) -> Result<SessionHandle, HypervisorError>;

    /// Ask the service to start the machine's process
    async fn launch_vm_process(
        &self,
        session: &SessionHandle,
        mode: LaunchMode,
        env: &[String],
    ) -> Result<ProgressHandle, HypervisorError>;

    /// Block until an asynchronous operation reports completion
    async fn wait_for_completion(
        &self,
        progress: &ProgressHandle,
        timeout: Option<Duration>,
    ) -> Result<(), HypervisorError>;

    /// Event source of the session's console
    async fn event_source(
        &self,
        session: &SessionHandle,
    ) -> Result<EventSourceHandle, HypervisorError>;

    async fn create_listener(
        &self,
        source: &EventSourceHandle,
    ) -> Result<ListenerHandle, HypervisorError>;

    /// Subscribe `listener` to `kinds`. With `auto_deregister` false the
    /// caller owns the call to `unregister_listener`.
    async fn register_listener(
        &self,
        source: &EventSourceHandle,
        listener: &ListenerHandle,
        kinds: &[EventKind],
        auto_deregister: bool,
    ) -> Result<(), HypervisorError>;

    /// Next event for `listener`, or `None` if nothing arrived within `timeout`
    async fn get_event(
        &self,
        source: &EventSourceHandle,
        listener: &ListenerHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Event>, HypervisorError>;

    async fn unregister_listener(
        &self,
        source: &EventSourceHandle,
        listener: &ListenerHandle,
    ) -> Result<(), HypervisorError>;

    async fn close_session(&self, session: &SessionHandle) -> Result<(), HypervisorError>;

    /// Narrow an event to a state change
    fn query_state_changed(&self, event: Event) -> Result<StateChangedEvent, HypervisorError> {
        match event {
            Event::StateChanged(changed) => Ok(changed),
            other => Err(HypervisorError::Narrowing {
                expected: EventKind::StateChanged,
                actual: other.kind(),
            }),
        }
    }
}
