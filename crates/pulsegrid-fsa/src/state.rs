//! Controller states, FSA inputs, and the actions subsystems can request.

use std::fmt;

/// Where the controller currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Booting, subsystems not yet wired.
    Startup,
    /// Campaigning for, or yielding, the coordinator role.
    Election,
    /// Coordinator is absorbing join state from the membership.
    Integration,
    /// Coordinator is waiting for the scheduler to compute a placement.
    AwaitingPlacement,
    /// Executing a computed transition graph.
    Transition,
    /// Nothing to do until the next cluster event.
    Idle,
    /// Shutting down; no new work is accepted.
    Stopping,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Startup => "startup",
            ControllerState::Election => "election",
            ControllerState::Integration => "integration",
            ControllerState::AwaitingPlacement => "awaiting-placement",
            ControllerState::Transition => "transition",
            ControllerState::Idle => "idle",
            ControllerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Inputs that drive FSA transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsaInput {
    /// Something went wrong; the FSA decides how hard to recover.
    Error,
    /// A subsystem failed in a way that is recoverable by retrying.
    Fail,
    /// The coordinator role must be (re)established.
    Election,
    /// An orderly shutdown was requested.
    Terminate,
}

/// Why an input or message was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsaCause {
    /// Generated by controller-internal logic.
    Internal,
    /// Triggered by an IPC message from a peer daemon.
    IpcMessage,
    /// A timer popped.
    Timer,
}

/// Actions the FSA dispatches back to subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsaAction {
    StartScheduler,
    StopScheduler,
    InvokeScheduler,
}

/// How the controller process ends.
///
/// The code doubles as the process exit status, and the supervisor keys off
/// it: anything at or above [`ExitStatus::FatalNoRespawn`] means "do not
/// restart me".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    Error,
    FatalNoRespawn,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::Error => 1,
            ExitStatus::FatalNoRespawn => 100,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Ok => write!(f, "ok (0)"),
            ExitStatus::Error => write!(f, "error (1)"),
            ExitStatus::FatalNoRespawn => write!(f, "fatal, no respawn (100)"),
        }
    }
}
