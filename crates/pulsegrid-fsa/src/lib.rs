//! Controller finite state automaton surface.
//!
//! The controller daemon runs one FSA event loop; every subsystem influences
//! it exclusively through an [`FsaHandle`]. The handle carries:
//!
//! - the event queue ([`FsaEvent`]): inputs, requested actions, stalls, and
//!   routed peer messages
//! - shared controller flags (coordinator role, shutdown, CIB consistency)
//!   and the current [`ControllerState`]
//! - the process exit path, pluggable so tests can observe self-fencing
//!   instead of dying
//!
//! [`ClusterView`] is the companion membership snapshot: quorum history,
//! node caches, and watchdog presence, shared read-mostly across subsystems.

pub mod cluster;
pub mod handle;
pub mod state;

pub use cluster::{ClusterView, SharedClusterView};
pub use handle::{ExitFn, FsaEvent, FsaHandle};
pub use state::{ControllerState, ExitStatus, FsaAction, FsaCause, FsaInput};
