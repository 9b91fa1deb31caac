//! In-memory virtualization service
//!
//! Replays a fixed script of poll results and records every call it receives,
//! so wait behaviour can be exercised without a hypervisor installed.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::errors::HypervisorError;
use super::traits::VirtualizationService;
use super::types::*;

/// One scripted answer to `get_event`
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// The poll window elapsed without an event
    Timeout,
    Deliver(Event),
}

impl ScriptStep {
    pub fn state(state: MachineState) -> Self {
        ScriptStep::Deliver(Event::StateChanged(StateChangedEvent::new(state)))
    }
}

/// Calls observed by the scripted service, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    FindMachine { name: String },
    OpenSession,
    LaunchVmProcess { mode: LaunchMode, env: Vec<String> },
    WaitForCompletion { timeout: Option<Duration> },
    EventSource,
    CreateListener,
    RegisterListener { kinds: Vec<EventKind>, auto_deregister: bool },
    GetEvent { timeout: Option<Duration> },
    UnregisterListener,
    CloseSession,
}

#[derive(Debug)]
pub struct ScriptedService {
    machines: Vec<String>,
    launch_failure: Option<String>,
    launch_pending: bool,
    script: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<ServiceCall>>,
}

impl ScriptedService {
    pub fn new(machine: &str, script: Vec<ScriptStep>) -> Self {
        Self {
            machines: vec![machine.to_string()],
            launch_failure: None,
            launch_pending: false,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every launch report failure with `message`
    pub fn with_launch_failure(mut self, message: &str) -> Self {
        self.launch_failure = Some(message.to_string());
        self
    }

    /// Make every launch wait forever, as if the frontend never came up
    pub fn with_launch_pending(mut self) -> Self {
        self.launch_pending = true;
        self
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&ServiceCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn remaining_steps(&self) -> usize {
        self.script.lock().expect("script poisoned").len()
    }

    fn record(&self, call: ServiceCall) {
        self.calls.lock().expect("call log poisoned").push(call);
    }

    fn next_step(&self) -> Option<ScriptStep> {
        self.script.lock().expect("script poisoned").pop_front()
    }
}

#[async_trait]
impl VirtualizationService for ScriptedService {
    async fn find_machine(&self, name: &str) -> Result<MachineRef, HypervisorError> {
        self.record(ServiceCall::FindMachine {
            name: name.to_string(),
        });
        if self.machines.iter().any(|m| m == name) {
            Ok(MachineRef {
                id: format!("scripted-{name}"),
                name: name.to_string(),
            })
        } else {
            Err(HypervisorError::NotFound {
                name: name.to_string(),
            })
        }
    }

    async fn open_session(&self, machine: &MachineRef) -> Result<SessionHandle, HypervisorError> {
        self.record(ServiceCall::OpenSession);
        Ok(SessionHandle {
            id: Uuid::new_v4(),
            machine: machine.clone(),
        })
    }

    async fn launch_vm_process(
        &self,
        _session: &SessionHandle,
        mode: LaunchMode,
        env: &[String],
    ) -> Result<ProgressHandle, HypervisorError> {
        self.record(ServiceCall::LaunchVmProcess {
            mode,
            env: env.to_vec(),
        });
        Ok(ProgressHandle(Uuid::new_v4()))
    }

    async fn wait_for_completion(
        &self,
        _progress: &ProgressHandle,
        timeout: Option<Duration>,
    ) -> Result<(), HypervisorError> {
        self.record(ServiceCall::WaitForCompletion { timeout });
        if self.launch_pending {
            std::future::pending::<()>().await;
        }
        match &self.launch_failure {
            Some(message) => Err(HypervisorError::Launch {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn event_source(
        &self,
        session: &SessionHandle,
    ) -> Result<EventSourceHandle, HypervisorError> {
        self.record(ServiceCall::EventSource);
        Ok(EventSourceHandle {
            session: session.id,
        })
    }

    async fn create_listener(
        &self,
        _source: &EventSourceHandle,
    ) -> Result<ListenerHandle, HypervisorError> {
        self.record(ServiceCall::CreateListener);
        Ok(ListenerHandle(Uuid::new_v4()))
    }

    async fn register_listener(
        &self,
        _source: &EventSourceHandle,
        _listener: &ListenerHandle,
        kinds: &[EventKind],
        auto_deregister: bool,
    ) -> Result<(), HypervisorError> {
        self.record(ServiceCall::RegisterListener {
            kinds: kinds.to_vec(),
            auto_deregister,
        });
        Ok(())
    }

    async fn get_event(
        &self,
        _source: &EventSourceHandle,
        _listener: &ListenerHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Event>, HypervisorError> {
        self.record(ServiceCall::GetEvent { timeout });
        match self.next_step() {
            Some(ScriptStep::Timeout) => Ok(None),
            Some(ScriptStep::Deliver(event)) => Ok(Some(event)),
            // Script exhausted: behave like a quiet event source
            None => match timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
                None => std::future::pending().await,
            },
        }
    }

    async fn unregister_listener(
        &self,
        _source: &EventSourceHandle,
        _listener: &ListenerHandle,
    ) -> Result<(), HypervisorError> {
        self.record(ServiceCall::UnregisterListener);
        Ok(())
    }

    async fn close_session(&self, _session: &SessionHandle) -> Result<(), HypervisorError> {
        self.record(ServiceCall::CloseSession);
        Ok(())
    }
}
