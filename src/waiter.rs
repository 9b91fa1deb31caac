//! Power-off waiter
//!
//! Launches a named machine and blocks until the hypervisor reports that it
//! has powered off. Poll timeouts and events of the wrong kind are absorbed
//! inside the loop; setup failures end the call. The session and listener
//! are released on every exit path once the session has been opened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::hypervisor::{
    EventKind, EventSourceHandle, HypervisorError, LaunchMode, ListenerHandle, MachineRef,
    MachineState, SessionHandle, VirtualizationService,
};
use crate::telemetry::{create_wait_span, generate_correlation_id};

/// Setup and polling steps, used to say where a wait failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    Resolve,
    OpenSession,
    Launch,
    Subscribe,
    Poll,
}

impl fmt::Display for WaitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            WaitStep::Resolve => "resolving the machine",
            WaitStep::OpenSession => "opening a session",
            WaitStep::Launch => "launching the machine",
            WaitStep::Subscribe => "subscribing to state changes",
            WaitStep::Poll => "polling for events",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("resolving the machine failed: no machine named '{name}'")]
    NotFound { name: String },
    #[error("launching the machine '{machine}' failed: {message}")]
    Launch { machine: String, message: String },
    #[error("wait for machine '{machine}' was cancelled")]
    Cancelled { machine: String },
    #[error("{step} failed: {source}")]
    Service {
        step: WaitStep,
        #[source]
        source: HypervisorError,
    },
}

impl WaitError {
    fn service(step: WaitStep) -> impl FnOnce(HypervisorError) -> WaitError {
        move |source| WaitError::Service { step, source }
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Longest block on a single poll; `None` blocks until an event arrives
    pub poll_timeout: Option<Duration>,
    /// Deadline for the launch operation; `None` waits as long as it takes
    pub launch_timeout: Option<Duration>,
    pub launch_mode: LaunchMode,
    /// Extra `NAME=value` pairs for the machine's process
    pub launch_env: Vec<String>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Some(Duration::from_secs(10)),
            launch_timeout: None,
            launch_mode: LaunchMode::Gui,
            launch_env: Vec::new(),
        }
    }
}

/// Outcome of a successful wait
#[derive(Debug, Clone, Serialize)]
pub struct WaitReport {
    pub machine: MachineRef,
    pub final_state: MachineState,
    /// Every state reported before the machine powered off, in delivery order
    pub intermediate_states: Vec<MachineState>,
    pub polls: u64,
    pub poll_timeouts: u64,
    /// Events skipped because they were not state changes
    pub ignored_events: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PollCounters {
    polls: u64,
    timeouts: u64,
    ignored: u64,
    states: Vec<MachineState>,
}

pub struct PowerOffWaiter<S: VirtualizationService + ?Sized> {
    service: Arc<S>,
    options: WaitOptions,
}

impl<S: VirtualizationService + ?Sized> PowerOffWaiter<S> {
    pub fn new(service: Arc<S>, options: WaitOptions) -> Self {
        Self { service, options }
    }

    pub fn options(&self) -> &WaitOptions {
        &self.options
    }

    /// Launch `machine_name` and wait until it powers off.
    ///
    /// There is no overall deadline. Raising `cancel` while the launch is
    /// pending or while polling ends the call with [`WaitError::Cancelled`].
    pub async fn wait_for_power_off(
        &self,
        machine_name: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitReport, WaitError> {
        let correlation_id = generate_correlation_id();
        let span = create_wait_span(machine_name, &correlation_id);
        self.run(machine_name, cancel).instrument(span).await
    }

    async fn run(
        &self,
        machine_name: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitReport, WaitError> {
        let started_at = Utc::now();

        let machine = self
            .service
            .find_machine(machine_name)
            .await
            .map_err(|e| match e {
                HypervisorError::NotFound { name } => WaitError::NotFound { name },
                other => WaitError::Service {
                    step: WaitStep::Resolve,
                    source: other,
                },
            })?;

        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled {
                machine: machine.name,
            });
        }

        let session = self
            .service
            .open_session(&machine)
            .await
            .map_err(WaitError::service(WaitStep::OpenSession))?;

        let mut subscription = None;
        let result = self
            .launch_and_watch(&session, &mut subscription, cancel)
            .await;
        self.release(&session, subscription.as_ref()).await;

        let counters = result?;
        let finished_at = Utc::now();
        info!(
            machine = %machine.name,
            polls = counters.polls,
            poll_timeouts = counters.timeouts,
            "Machine powered off"
        );
        Ok(WaitReport {
            machine,
            final_state: MachineState::PoweredOff,
            intermediate_states: counters.states,
            polls: counters.polls,
            poll_timeouts: counters.timeouts,
            ignored_events: counters.ignored,
            started_at,
            finished_at,
        })
    }

    async fn launch_and_watch(
        &self,
        session: &SessionHandle,
        subscription: &mut Option<(EventSourceHandle, ListenerHandle)>,
        cancel: &CancellationToken,
    ) -> Result<PollCounters, WaitError> {
        let machine = &session.machine;
        let launch_error = |e: HypervisorError| match e {
            HypervisorError::Launch { message } => WaitError::Launch {
                machine: machine.name.clone(),
                message,
            },
            other => WaitError::Service {
                step: WaitStep::Launch,
                source: other,
            },
        };
        let cancelled = || WaitError::Cancelled {
            machine: machine.name.clone(),
        };

        let progress = self
            .service
            .launch_vm_process(session, self.options.launch_mode, &self.options.launch_env)
            .await
            .map_err(launch_error)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            completed = self
                .service
                .wait_for_completion(&progress, self.options.launch_timeout) =>
            {
                completed.map_err(launch_error)?;
            }
        }
        info!(machine = %machine.name, mode = %self.options.launch_mode, "Machine launched");

        let source = self
            .service
            .event_source(session)
            .await
            .map_err(WaitError::service(WaitStep::Subscribe))?;
        let listener = self
            .service
            .create_listener(&source)
            .await
            .map_err(WaitError::service(WaitStep::Subscribe))?;
        *subscription = Some((source.clone(), listener));
        self.service
            .register_listener(&source, &listener, &[EventKind::StateChanged], false)
            .await
            .map_err(WaitError::service(WaitStep::Subscribe))?;

        let mut counters = PollCounters::default();
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                polled = self
                    .service
                    .get_event(&source, &listener, self.options.poll_timeout) => polled,
            };
            counters.polls += 1;

            let Some(event) = polled.map_err(WaitError::service(WaitStep::Poll))? else {
                counters.timeouts += 1;
                debug!(polls = counters.polls, "No event within poll window");
                continue;
            };

            match self.service.query_state_changed(event) {
                Ok(changed) if changed.state().is_powered_off() => return Ok(counters),
                Ok(changed) => {
                    debug!(state = %changed.state(), "Machine changed state");
                    counters.states.push(changed.state());
                }
                Err(e) => {
                    counters.ignored += 1;
                    debug!(error = %e, "Skipping event");
                }
            }
        }
    }

    async fn release(
        &self,
        session: &SessionHandle,
        subscription: Option<&(EventSourceHandle, ListenerHandle)>,
    ) {
        if let Some((source, listener)) = subscription {
            if let Err(e) = self.service.unregister_listener(source, listener).await {
                warn!(error = %e, "Failed to unregister event listener");
            }
        }
        if let Err(e) = self.service.close_session(session).await {
            warn!(error = %e, "Failed to close session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::traits::MockVirtualizationService;
    use crate::hypervisor::{Event, ScriptStep, ScriptedService, ServiceCall};
    use tokio_test::{assert_err, assert_ok};

    const VM: &str = "vmfuse-test";

    fn waiter(service: &Arc<ScriptedService>) -> PowerOffWaiter<ScriptedService> {
        PowerOffWaiter::new(Arc::clone(service), WaitOptions::default())
    }

    fn is_get_event(call: &ServiceCall) -> bool {
        matches!(call, ServiceCall::GetEvent { .. })
    }

    #[tokio::test]
    async fn test_direct_power_off_stops_polling() {
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![
                ScriptStep::state(MachineState::PoweredOff),
                ScriptStep::state(MachineState::Running),
            ],
        ));

        let report = assert_ok!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert_eq!(report.final_state, MachineState::PoweredOff);
        assert_eq!(report.polls, 1);
        assert_eq!(service.count_calls(is_get_event), 1);
        assert_eq!(service.remaining_steps(), 1);
    }

    #[tokio::test]
    async fn test_intermediate_states_do_not_end_wait() {
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![
                ScriptStep::state(MachineState::Starting),
                ScriptStep::state(MachineState::Running),
                ScriptStep::state(MachineState::Stopping),
                ScriptStep::state(MachineState::PoweredOff),
            ],
        ));

        let report = assert_ok!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert_eq!(
            report.intermediate_states,
            vec![MachineState::Starting, MachineState::Running, MachineState::Stopping]
        );
        assert_eq!(report.polls, 4);
        assert_eq!(service.remaining_steps(), 0);
    }

    #[tokio::test]
    async fn test_poll_timeouts_are_not_errors() {
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![
                ScriptStep::Timeout,
                ScriptStep::state(MachineState::Running),
                ScriptStep::Timeout,
                ScriptStep::Timeout,
                ScriptStep::state(MachineState::Stopping),
                ScriptStep::Timeout,
                ScriptStep::state(MachineState::PoweredOff),
            ],
        ));

        let report = assert_ok!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert_eq!(report.poll_timeouts, 4);
        assert_eq!(report.polls, 7);
    }

    #[tokio::test]
    async fn test_other_event_kinds_are_skipped() {
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![
                ScriptStep::Deliver(Event::MachineDataChanged {
                    machine_id: "scripted-vmfuse-test".to_string(),
                }),
                ScriptStep::Deliver(Event::GuestPropertyChanged {
                    name: "/VirtualBox/GuestInfo/Net/Count".to_string(),
                    value: "1".to_string(),
                }),
                ScriptStep::state(MachineState::PoweredOff),
            ],
        ));

        let report = assert_ok!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert_eq!(report.ignored_events, 2);
        assert!(report.intermediate_states.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_machine_never_opens_session() {
        let service = Arc::new(ScriptedService::new(VM, vec![]));

        let err = assert_err!(
            waiter(&service)
                .wait_for_power_off("nope", &CancellationToken::new())
                .await
        );
        assert!(matches!(err, WaitError::NotFound { ref name } if name == "nope"));
        assert_eq!(
            service.calls(),
            vec![ServiceCall::FindMachine {
                name: "nope".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_launch_failure_never_registers_listener() {
        let service = Arc::new(
            ScriptedService::new(VM, vec![ScriptStep::state(MachineState::PoweredOff)])
                .with_launch_failure("VBOX_E_INVALID_OBJECT_STATE"),
        );

        let err = assert_err!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert!(matches!(
            err,
            WaitError::Launch { ref message, .. } if message == "VBOX_E_INVALID_OBJECT_STATE"
        ));
        assert_eq!(
            service.count_calls(|c| matches!(c, ServiceCall::RegisterListener { .. })),
            0
        );
        assert_eq!(service.count_calls(is_get_event), 0);
        // Session is still released
        assert_eq!(service.calls().last(), Some(&ServiceCall::CloseSession));
    }

    #[tokio::test]
    async fn test_launch_request_and_subscription_shape() {
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![ScriptStep::state(MachineState::PoweredOff)],
        ));

        assert_ok!(
            waiter(&service)
                .wait_for_power_off(VM, &CancellationToken::new())
                .await
        );
        assert_eq!(
            service.calls(),
            vec![
                ServiceCall::FindMachine { name: VM.to_string() },
                ServiceCall::OpenSession,
                ServiceCall::LaunchVmProcess { mode: LaunchMode::Gui, env: vec![] },
                ServiceCall::WaitForCompletion { timeout: None },
                ServiceCall::EventSource,
                ServiceCall::CreateListener,
                ServiceCall::RegisterListener {
                    kinds: vec![EventKind::StateChanged],
                    auto_deregister: false,
                },
                ServiceCall::GetEvent { timeout: Some(Duration::from_secs(10)) },
                ServiceCall::UnregisterListener,
                ServiceCall::CloseSession,
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_runs_give_same_result() {
        let script = vec![
            ScriptStep::state(MachineState::Starting),
            ScriptStep::Timeout,
            ScriptStep::state(MachineState::Running),
            ScriptStep::state(MachineState::PoweredOff),
        ];

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let service = Arc::new(ScriptedService::new(VM, script.clone()));
            let report = assert_ok!(
                waiter(&service)
                    .wait_for_power_off(VM, &CancellationToken::new())
                    .await
            );
            outcomes.push((
                report.final_state,
                report.intermediate_states,
                report.polls,
                report.poll_timeouts,
            ));
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_listener_and_session() {
        // Script never powers off; the exhausted script blocks each poll for the timeout
        let service = Arc::new(ScriptedService::new(
            VM,
            vec![ScriptStep::state(MachineState::Running)],
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let err = assert_err!(waiter(&service).wait_for_power_off(VM, &cancel).await);
        assert!(matches!(err, WaitError::Cancelled { .. }));
        let calls = service.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail, &[ServiceCall::UnregisterListener, ServiceCall::CloseSession]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_launch_closes_session() {
        let service = Arc::new(
            ScriptedService::new(VM, vec![ScriptStep::state(MachineState::PoweredOff)])
                .with_launch_pending(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = assert_err!(waiter(&service).wait_for_power_off(VM, &cancel).await);
        assert!(matches!(err, WaitError::Cancelled { ref machine } if machine == VM));
        assert_eq!(
            service.count_calls(|c| matches!(c, ServiceCall::RegisterListener { .. })),
            0
        );
        assert_eq!(service.count_calls(is_get_event), 0);
        // Nothing was subscribed, so only the session is released
        let calls = service.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail,
            &[
                ServiceCall::WaitForCompletion { timeout: None },
                ServiceCall::CloseSession,
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_opens_nothing() {
        let service = Arc::new(ScriptedService::new(VM, vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = assert_err!(waiter(&service).wait_for_power_off(VM, &cancel).await);
        assert!(matches!(err, WaitError::Cancelled { .. }));
        assert_eq!(service.count_calls(|c| matches!(c, ServiceCall::OpenSession)), 0);
    }

    #[tokio::test]
    async fn test_resolve_backend_failure_reports_step() {
        let mut mock = MockVirtualizationService::new();
        mock.expect_find_machine().times(1).returning(|_| {
            Err(HypervisorError::Parse {
                command: "showvminfo".to_string(),
                message: "missing UUID".to_string(),
            })
        });
        mock.expect_open_session().never();

        let waiter = PowerOffWaiter::new(Arc::new(mock), WaitOptions::default());
        let err = assert_err!(waiter.wait_for_power_off(VM, &CancellationToken::new()).await);
        assert!(matches!(err, WaitError::Service { step: WaitStep::Resolve, .. }));
        assert!(err.to_string().starts_with("resolving the machine failed"));
    }

    #[tokio::test]
    async fn test_lost_listener_is_fatal_and_cleans_up() {
        let mut mock = MockVirtualizationService::new();
        mock.expect_find_machine().returning(|name| {
            Ok(MachineRef {
                id: "id-1".to_string(),
                name: name.to_string(),
            })
        });
        mock.expect_open_session().returning(|machine| {
            Ok(SessionHandle {
                id: uuid::Uuid::new_v4(),
                machine: machine.clone(),
            })
        });
        mock.expect_launch_vm_process()
            .returning(|_, _, _| Ok(crate::hypervisor::ProgressHandle(uuid::Uuid::new_v4())));
        mock.expect_wait_for_completion().returning(|_, _| Ok(()));
        mock.expect_event_source()
            .returning(|session| Ok(EventSourceHandle { session: session.id }));
        mock.expect_create_listener()
            .returning(|_| Ok(ListenerHandle(uuid::Uuid::new_v4())));
        mock.expect_register_listener().returning(|_, _, _, _| Ok(()));
        mock.expect_get_event().times(1).returning(|_, _, _| {
            Err(HypervisorError::UnknownHandle { kind: "listener" })
        });
        mock.expect_unregister_listener().times(1).returning(|_, _| Ok(()));
        mock.expect_close_session().times(1).returning(|_| Ok(()));

        let waiter = PowerOffWaiter::new(Arc::new(mock), WaitOptions::default());
        let err = assert_err!(waiter.wait_for_power_off(VM, &CancellationToken::new()).await);
        assert!(matches!(
            err,
            WaitError::Service {
                step: WaitStep::Poll,
                source: HypervisorError::UnknownHandle { kind: "listener" },
            }
        ));
    }
}
