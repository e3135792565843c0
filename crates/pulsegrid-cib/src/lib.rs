//! Cluster information base (CIB) access for PulseGrid controllers.
//!
//! The CIB is the replicated document describing cluster configuration and
//! resource status. This crate provides:
//!
//! - [`CibDocument`]: the typed document model, including the cluster
//!   property sets that controllers stamp before handing state to the
//!   scheduler
//! - [`CibConn`]: an asynchronous query client with call-id correlation and
//!   an outstanding-call gauge, so consumers can tell when the CIB is busy
//! - [`snapshot`]: compressed on-disk captures of the document for
//!   post-mortem analysis
//!
//! Queries are answered by whichever CIB service the daemon wires in; in
//! standalone mode that is an in-memory task, in a cluster it is the CIB
//! daemon's IPC bridge.

pub mod client;
pub mod document;
pub mod error;
pub mod snapshot;

pub use client::{cib_channel, CallId, CibConn, CibReply, CibRequest, CibScope};
pub use document::{keys, CibDocument, CibNode, Configuration, NvPair, PropertySet};
pub use error::{CibError, CibResult};
