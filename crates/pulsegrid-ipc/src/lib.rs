//! IPC client abstraction for PulseGrid daemons.
//!
//! Controller subsystems talk to their worker daemons over a message-based
//! IPC link. This crate defines the transport-agnostic surface:
//!
//! - [`IpcConnect`] / [`IpcSession`]: connect to a named service and push
//!   length-checked messages to it
//! - [`IpcEvent`]: inbound messages and the exactly-once disconnect
//!   notification, delivered through a caller-supplied callback
//! - [`Envelope`]: the JSON request/reply frame with per-request reference
//!   strings used for reply correlation
//! - [`LoopbackConnector`]: an in-process transport used by tests and by
//!   `pulsed standalone`, faithful to the exactly-once disconnect contract
//!
//! Real socket transports implement [`IpcConnect`] outside this crate; the
//! subsystems only ever see the traits.

pub mod client;
pub mod envelope;
pub mod error;
pub mod loopback;

pub use client::{IpcClientConfig, IpcConnect, IpcEvent, IpcEventFn, IpcSession};
pub use envelope::Envelope;
pub use error::{IpcError, IpcResult};
pub use loopback::{LoopbackConnector, LoopbackPeer};
