//! Tunables and protocol constants for the scheduler subsystem.

use std::path::PathBuf;
use std::time::Duration;

/// Operation code of a placement computation request; replies reuse it.
pub const OP_CALC: &str = "pe_calc";

/// Envelope system name the controller signs requests with while it is the
/// coordinator.
pub const SYS_CONTROLLER: &str = "dc";

/// Well-known IPC service name of the scheduler daemon.
pub const SCHEDULER_SERVICE: &str = "pengine";

/// How long to wait for a placement reply before treating the scheduler as
/// unresponsive. Firing this deadline as coordinator is fatal.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Receive bound for scheduler traffic. Placement replies carry whole
/// transition graphs, far beyond ordinary daemon chatter.
pub const MAX_RX_BYTES: usize = 5 * 1024 * 1024;

/// Settings for one [`SchedulerSubsystem`](crate::SchedulerSubsystem).
///
/// `Default` carries the external contract constants; deployments normally
/// override only `state_dir`.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// IPC service to connect to.
    pub service: String,
    /// Directory crash snapshots are written into.
    pub state_dir: PathBuf,
    /// Reply deadline, armed per transmitted request.
    pub reply_timeout: Duration,
    /// Inbound IPC frame bound.
    pub max_rx_bytes: usize,
    /// How long a crash-snapshot query may run before the deferred
    /// escalation is raised without it.
    pub snapshot_grace: Duration,
    /// Pause before re-invoking when other cluster-state callbacks are
    /// still outstanding.
    pub reinvoke_delay: Duration,
}

impl SchedConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            service: SCHEDULER_SERVICE.to_string(),
            state_dir: PathBuf::from("/var/lib/pulsegrid/scheduler"),
            reply_timeout: REPLY_TIMEOUT,
            max_rx_bytes: MAX_RX_BYTES,
            snapshot_grace: Duration::from_secs(5),
            reinvoke_delay: Duration::from_secs(1),
        }
    }
}
