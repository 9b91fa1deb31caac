//! VirtualBox backend driven through the `VBoxManage` command-line front end
//!
//! `VBoxManage` exposes no event bus, so listeners registered here probe the
//! machine's `VMState` at a fixed interval and report a `StateChanged` event
//! whenever it differs from the last state they reported. The first probe
//! after registration always reports the current state. A failed probe is
//! logged and retried on the next tick; it only surfaces as an empty poll once
//! the poll window runs out.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{CommandError, CommandExecutor, CommandOutput};
use crate::hypervisor::{
    Event, EventKind, EventSourceHandle, HypervisorError, LaunchMode, ListenerHandle, MachineRef,
    MachineState, ProgressHandle, SessionHandle, StateChangedEvent, VirtualizationService,
};

static MACHINE_READABLE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^"?([^"=]+)"?="?(.*?)"?$"#).expect("machine-readable line pattern is valid")
});

const NOT_FOUND_MARKERS: &[&str] = &[
    "VBOX_E_OBJECT_NOT_FOUND",
    "Could not find a registered machine",
];

#[derive(Debug, Clone)]
pub struct VBoxManageConfig {
    /// Path or name of the VBoxManage binary
    pub program: String,
    /// Delay between two `VMState` probes of a listener
    pub state_probe_interval: Duration,
}

impl Default for VBoxManageConfig {
    fn default() -> Self {
        Self {
            program: "VBoxManage".to_string(),
            state_probe_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct ListenerState {
    machine_id: String,
    kinds: Vec<EventKind>,
    registered: bool,
    last_state: Option<MachineState>,
}

type LaunchTask = JoinHandle<Result<CommandOutput, CommandError>>;

/// A running `startvm` and the session that started it. Dropping it aborts
/// the task, which kills the child process.
struct Launch {
    session: Uuid,
    task: LaunchTask,
}

impl Drop for Launch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct VBoxManageService {
    executor: Arc<dyn CommandExecutor>,
    config: VBoxManageConfig,
    sessions: Mutex<HashMap<Uuid, MachineRef>>,
    launches: Mutex<HashMap<Uuid, Launch>>,
    listeners: Mutex<HashMap<Uuid, ListenerState>>,
}

impl VBoxManageService {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: VBoxManageConfig) -> Self {
        Self {
            executor,
            config,
            sessions: Mutex::new(HashMap::new()),
            launches: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput, HypervisorError> {
        Ok(self.executor.execute(&self.config.program, args).await?)
    }

    async fn show_vm_info(
        &self,
        machine: &str,
    ) -> Result<HashMap<String, String>, HypervisorError> {
        let output = self.run(&["showvminfo", machine, "--machinereadable"]).await?;
        if !output.success() {
            if NOT_FOUND_MARKERS.iter().any(|m| output.stderr.contains(m)) {
                return Err(HypervisorError::NotFound {
                    name: machine.to_string(),
                });
            }
            return Err(CommandError::ExecutionFailed {
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(parse_machine_readable(&output.stdout))
    }

    async fn probe_state(&self, machine_id: &str) -> Result<MachineState, HypervisorError> {
        let info = self.show_vm_info(machine_id).await?;
        let raw = info.get("VMState").ok_or_else(|| HypervisorError::Parse {
            command: "showvminfo".to_string(),
            message: "missing VMState".to_string(),
        })?;
        let state = MachineState::from_vboxmanage(raw);
        if state == MachineState::Null {
            debug!(vm_state = %raw, "Unrecognised VMState");
        }
        Ok(state)
    }

    async fn session_machine(&self, session: &Uuid) -> Result<MachineRef, HypervisorError> {
        self.sessions
            .lock()
            .await
            .get(session)
            .cloned()
            .ok_or(HypervisorError::UnknownHandle { kind: "session" })
    }

    #[cfg(test)]
    async fn held_launches(&self) -> usize {
        self.launches.lock().await.len()
    }
}

/// Parse `key="value"` lines from `--machinereadable` output
pub fn parse_machine_readable(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| MACHINE_READABLE_LINE.captures(line.trim()))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl VirtualizationService for VBoxManageService {
    async fn find_machine(&self, name: &str) -> Result<MachineRef, HypervisorError> {
        let info = self.show_vm_info(name).await?;
        let id = info.get("UUID").cloned().ok_or_else(|| HypervisorError::Parse {
            command: "showvminfo".to_string(),
            message: "missing UUID".to_string(),
        })?;
        let name = info.get("name").cloned().unwrap_or_else(|| name.to_string());
        debug!(machine = %name, id = %id, "Resolved machine");
        Ok(MachineRef { id, name })
    }

    async fn open_session(&self, machine: &MachineRef) -> Result<SessionHandle, HypervisorError> {
        let id = Uuid::new_v4();
        self.sessions.lock().await.insert(id, machine.clone());
        Ok(SessionHandle {
            id,
            machine: machine.clone(),
        })
    }

    async fn launch_vm_process(
        &self,
        session: &SessionHandle,
        mode: LaunchMode,
        env: &[String],
    ) -> Result<ProgressHandle, HypervisorError> {
        let machine = self.session_machine(&session.id).await?;

        let mut args = vec![
            "startvm".to_string(),
            machine.id.clone(),
            "--type".to_string(),
            mode.as_str().to_string(),
        ];
        for var in env {
            args.push("--putenv".to_string());
            args.push(var.clone());
        }

        info!(machine = %machine.name, mode = %mode, "Launching machine process");
        let executor = Arc::clone(&self.executor);
        let program = self.config.program.clone();
        let task = tokio::spawn(async move {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            executor.execute(&program, &args).await
        });

        let progress = ProgressHandle(Uuid::new_v4());
        self.launches.lock().await.insert(
            progress.0,
            Launch {
                session: session.id,
                task,
            },
        );
        Ok(progress)
    }

    async fn wait_for_completion(
        &self,
        progress: &ProgressHandle,
        timeout: Option<Duration>,
    ) -> Result<(), HypervisorError> {
        let mut launch = self
            .launches
            .lock()
            .await
            .remove(&progress.0)
            .ok_or(HypervisorError::UnknownHandle { kind: "progress" })?;

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut launch.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Still running; keep it until the caller waits again or closes the session
                    self.launches.lock().await.insert(progress.0, launch);
                    return Err(HypervisorError::OperationTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => (&mut launch.task).await,
        };

        let output = joined
            .map_err(|e| CommandError::ExecutionFailed {
                message: e.to_string(),
            })??;
        if output.success() {
            Ok(())
        } else {
            let message = output.stderr.trim();
            Err(HypervisorError::Launch {
                message: if message.is_empty() {
                    format!("startvm exited with status {}", output.status_code)
                } else {
                    message.to_string()
                },
            })
        }
    }

    async fn event_source(
        &self,
        session: &SessionHandle,
    ) -> Result<EventSourceHandle, HypervisorError> {
        self.session_machine(&session.id).await?;
        Ok(EventSourceHandle {
            session: session.id,
        })
    }

    async fn create_listener(
        &self,
        source: &EventSourceHandle,
    ) -> Result<ListenerHandle, HypervisorError> {
        let machine = self.session_machine(&source.session).await?;
        let listener = ListenerHandle(Uuid::new_v4());
        self.listeners.lock().await.insert(
            listener.0,
            ListenerState {
                machine_id: machine.id,
                kinds: Vec::new(),
                registered: false,
                last_state: None,
            },
        );
        Ok(listener)
    }

    async fn register_listener(
        &self,
        _source: &EventSourceHandle,
        listener: &ListenerHandle,
        kinds: &[EventKind],
        auto_deregister: bool,
    ) -> Result<(), HypervisorError> {
        let mut listeners = self.listeners.lock().await;
        let state = listeners
            .get_mut(&listener.0)
            .ok_or(HypervisorError::UnknownHandle { kind: "listener" })?;
        if auto_deregister {
            debug!("Ignoring auto-deregister; probe listeners are released explicitly");
        }
        state.kinds = kinds.to_vec();
        state.registered = true;
        Ok(())
    }

    async fn get_event(
        &self,
        _source: &EventSourceHandle,
        listener: &ListenerHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Event>, HypervisorError> {
        let (machine_id, mut last_state) = {
            let listeners = self.listeners.lock().await;
            let state = listeners
                .get(&listener.0)
                .ok_or(HypervisorError::UnknownHandle { kind: "listener" })?;
            if !state.registered || !state.kinds.contains(&EventKind::StateChanged) {
                (None, state.last_state)
            } else {
                (Some(state.machine_id.clone()), state.last_state)
            }
        };

        // Only state changes can be observed through VBoxManage
        let Some(machine_id) = machine_id else {
            sleep_or_pending(timeout).await;
            return Ok(None);
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.probe_state(&machine_id).await {
                Ok(state) if last_state != Some(state) => {
                    last_state = Some(state);
                    if let Some(entry) = self.listeners.lock().await.get_mut(&listener.0) {
                        entry.last_state = last_state;
                    }
                    return Ok(Some(Event::StateChanged(StateChangedEvent::new(state))));
                }
                Ok(_) => {}
                // Transient while the machine changes state; try again next tick
                Err(e) => warn!(machine_id = %machine_id, error = %e, "State probe failed"),
            }

            let mut pause = self.config.state_probe_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    async fn unregister_listener(
        &self,
        _source: &EventSourceHandle,
        listener: &ListenerHandle,
    ) -> Result<(), HypervisorError> {
        self.listeners
            .lock()
            .await
            .remove(&listener.0)
            .map(|_| ())
            .ok_or(HypervisorError::UnknownHandle { kind: "listener" })
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<(), HypervisorError> {
        self.launches.lock().await.retain(|progress, launch| {
            let keep = launch.session != session.id;
            if !keep && !launch.task.is_finished() {
                debug!(progress = %progress, "Aborting unfinished launch");
            }
            keep
        });

        if self.sessions.lock().await.remove(&session.id).is_none() {
            warn!(session = %session.id, "Closing a session that is not open");
            return Err(HypervisorError::UnknownHandle { kind: "session" });
        }
        Ok(())
    }
}
