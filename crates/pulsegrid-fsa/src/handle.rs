//! The shared handle subsystems drive the FSA through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use pulsegrid_ipc::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::{ControllerState, ExitStatus, FsaAction, FsaCause, FsaInput};

/// One unit of work for the controller event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum FsaEvent {
    /// An input to transition on. `prepend` queues it ahead of everything
    /// already pending, for inputs that must win the next dispatch.
    Input {
        cause: FsaCause,
        input: FsaInput,
        prepend: bool,
    },
    /// A subsystem asks the FSA to schedule one of its own actions again.
    Action(FsaAction),
    /// The current action cannot make progress yet; re-dispatch later.
    Stall,
    /// Something changed; re-evaluate pending work.
    Trigger,
    /// A peer daemon message the FSA must route to its handler.
    Route { cause: FsaCause, message: Envelope },
}

/// Process exit hook. Production wires this to [`std::process::exit`]; tests
/// substitute a recorder.
pub type ExitFn = Arc<dyn Fn(ExitStatus) + Send + Sync>;

struct FsaShared {
    coordinator: AtomicBool,
    shutting_down: AtomicBool,
    cib_consistent: AtomicBool,
    state: RwLock<ControllerState>,
}

/// Cloneable handle to the controller FSA.
///
/// Everything here is safe to call from any task. Events are queued for the
/// single controller loop; flags are read-mostly state the loop maintains
/// and subsystems consult in their guards.
#[derive(Clone)]
pub struct FsaHandle {
    events: mpsc::UnboundedSender<FsaEvent>,
    shared: Arc<FsaShared>,
    exit: ExitFn,
}

impl FsaHandle {
    /// Handle whose exit path terminates the process.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FsaEvent>) {
        Self::with_exit_handler(Arc::new(|status: ExitStatus| {
            std::process::exit(status.code())
        }))
    }

    /// Handle with a custom exit path.
    pub fn with_exit_handler(exit: ExitFn) -> (Self, mpsc::UnboundedReceiver<FsaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: tx,
                shared: Arc::new(FsaShared {
                    coordinator: AtomicBool::new(false),
                    shutting_down: AtomicBool::new(false),
                    cib_consistent: AtomicBool::new(false),
                    state: RwLock::new(ControllerState::Startup),
                }),
                exit,
            },
            rx,
        )
    }

    fn push(&self, event: FsaEvent) {
        if self.events.send(event).is_err() {
            debug!("fsa event dropped, controller loop is gone");
        }
    }

    /// Escalate an error. Error inputs jump the queue so recovery is
    /// dispatched before any work that was already pending.
    pub fn register_error(&self, cause: FsaCause, input: FsaInput) {
        self.push(FsaEvent::Input {
            cause,
            input,
            prepend: true,
        });
    }

    /// Queue an input behind everything already pending.
    pub fn register_input(&self, cause: FsaCause, input: FsaInput) {
        self.push(FsaEvent::Input {
            cause,
            input,
            prepend: false,
        });
    }

    /// Queue an input ahead of everything already pending.
    pub fn register_input_before(&self, cause: FsaCause, input: FsaInput) {
        self.push(FsaEvent::Input {
            cause,
            input,
            prepend: true,
        });
    }

    /// Ask the FSA to schedule `action` again on a later dispatch.
    pub fn register_action(&self, action: FsaAction) {
        self.push(FsaEvent::Action(action));
    }

    /// Report that the current action cannot complete yet.
    pub fn stall(&self) {
        self.push(FsaEvent::Stall);
    }

    /// Wake the loop to re-evaluate pending work.
    pub fn trigger(&self) {
        self.push(FsaEvent::Trigger);
    }

    /// Hand a peer message to the FSA's routing layer.
    pub fn route_message(&self, cause: FsaCause, message: Envelope) {
        self.push(FsaEvent::Route { cause, message });
    }

    pub fn state(&self) -> ControllerState {
        *self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, next: ControllerState) {
        let mut state = self
            .shared
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = %*state, to = %next, "controller state change");
            *state = next;
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.shared.coordinator.load(Ordering::SeqCst)
    }

    pub fn set_coordinator(&self, coordinator: bool) {
        self.shared.coordinator.store(coordinator, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shared
            .shutting_down
            .store(shutting_down, Ordering::SeqCst);
    }

    /// Whether the local CIB replica is known to be in sync.
    pub fn cib_consistent(&self) -> bool {
        self.shared.cib_consistent.load(Ordering::SeqCst)
    }

    pub fn set_cib_consistent(&self, consistent: bool) {
        self.shared
            .cib_consistent
            .store(consistent, Ordering::SeqCst);
    }

    /// Terminate the controller process with `status`.
    pub fn exit(&self, status: ExitStatus) {
        warn!(%status, "controller process exit requested");
        (self.exit)(status);
    }
}
