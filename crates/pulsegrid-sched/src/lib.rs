//! Scheduler invocation subsystem for the PulseGrid controller.
//!
//! The controller delegates placement computation to a separate scheduler
//! daemon over IPC. This crate owns that relationship end to end:
//!
//! - connection lifecycle: bring the link up on the FSA's start action, tear
//!   it down on stop, and tell a crash from a planned release
//! - invocation pipeline: snapshot the cluster state, stamp coordinator-only
//!   facts onto it, submit it as a placement request, and keep only the
//!   latest request current when cycles overlap
//! - reply deadline: a single 120 s watch per transmitted request; a
//!   coordinator that hits it exits with a no-respawn status so fencing and
//!   re-election can recover the cluster
//! - crash diagnostics: capture the crash-time cluster state to a compressed
//!   file before escalating the connection loss
//!
//! The subsystem never blocks and never retries on its own; every failure is
//! escalated through the FSA handle, which decides how hard to recover.

pub mod config;
mod reply;
pub mod subsystem;

pub use config::{
    SchedConfig, MAX_RX_BYTES, OP_CALC, REPLY_TIMEOUT, SCHEDULER_SERVICE, SYS_CONTROLLER,
};
pub use subsystem::{SchedEvent, SchedulerSubsystem};
