// Core types shared by every virtualization backend

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle states a machine can report, mirroring VirtualBox's `MachineState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Null,
    PoweredOff,
    Saved,
    Teleported,
    Aborted,
    Running,
    Paused,
    Stuck,
    Teleporting,
    LiveSnapshotting,
    Starting,
    Stopping,
    Saving,
    Restoring,
    TeleportingPausedVm,
    TeleportingIn,
    DeletingSnapshotOnline,
    DeletingSnapshotPaused,
    OnlineSnapshotting,
    RestoringSnapshot,
    DeletingSnapshot,
    SettingUp,
    Snapshotting,
}

impl MachineState {
    /// The state that ends a power-off wait
    pub fn is_powered_off(&self) -> bool {
        matches!(self, MachineState::PoweredOff)
    }

    /// Map a `VMState` value from `VBoxManage showvminfo --machinereadable`.
    /// Values this crate does not know about map to `Null`.
    pub fn from_vboxmanage(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "poweroff" | "poweredoff" => MachineState::PoweredOff,
            "saved" => MachineState::Saved,
            "teleported" => MachineState::Teleported,
            "aborted" | "aborted-saved" => MachineState::Aborted,
            "running" => MachineState::Running,
            "paused" => MachineState::Paused,
            "gurumeditation" | "stuck" => MachineState::Stuck,
            "teleporting" => MachineState::Teleporting,
            "livesnapshotting" => MachineState::LiveSnapshotting,
            "starting" => MachineState::Starting,
            "stopping" => MachineState::Stopping,
            "saving" => MachineState::Saving,
            "restoring" => MachineState::Restoring,
            "teleportingpausedvm" => MachineState::TeleportingPausedVm,
            "teleportingin" => MachineState::TeleportingIn,
            "deletingsnapshotlive" => MachineState::DeletingSnapshotOnline,
            "deletingsnapshotlivepaused" => MachineState::DeletingSnapshotPaused,
            "onlinesnapshotting" => MachineState::OnlineSnapshotting,
            "restoringsnapshot" => MachineState::RestoringSnapshot,
            "deletingsnapshot" => MachineState::DeletingSnapshot,
            "settingup" => MachineState::SettingUp,
            "snapshotting" => MachineState::Snapshotting,
            _ => MachineState::Null,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How the machine's frontend process is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Interactive window
    #[default]
    Gui,
    Headless,
    Sdl,
    /// Detachable UI
    Separate,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Gui => "gui",
            LaunchMode::Headless => "headless",
            LaunchMode::Sdl => "sdl",
            LaunchMode::Separate => "separate",
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of notification an event source can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateChanged,
    MachineDataChanged,
    GuestPropertyChanged,
    SessionStateChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Opaque reference to a machine registered with the virtualization service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineRef {
    pub id: String,
    pub name: String,
}

/// This process's interaction with one machine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: Uuid,
    pub machine: MachineRef,
}

/// Asynchronous operation started by the service (e.g. a launch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressHandle(pub Uuid);

/// Event source of a session's console
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSourceHandle {
    pub session: Uuid,
}

/// Subscription created on an event source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub Uuid);

/// A notification delivered to a listener
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(StateChangedEvent),
    MachineDataChanged { machine_id: String },
    GuestPropertyChanged { name: String, value: String },
    SessionStateChanged { machine_id: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StateChanged(_) => EventKind::StateChanged,
            Event::MachineDataChanged { .. } => EventKind::MachineDataChanged,
            Event::GuestPropertyChanged { .. } => EventKind::GuestPropertyChanged,
            Event::SessionStateChanged { .. } => EventKind::SessionStateChanged,
        }
    }
}

/// The machine's new lifecycle state at the moment of transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChangedEvent {
    state: MachineState,
}

impl StateChangedEvent {
    pub fn new(state: MachineState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }
}
