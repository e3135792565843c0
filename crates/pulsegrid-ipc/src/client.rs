//! Transport-agnostic IPC client surface.
//!
//! A subsystem owns one [`IpcSession`] per worker daemon it drives. Inbound
//! traffic is pushed through an [`IpcEventFn`] callback registered at connect
//! time, so the owning event loop never blocks on the link.

use std::fmt;
use std::sync::Arc;

use crate::error::IpcResult;

/// Default receive buffer limit. Scheduler inputs serialize the whole cluster
/// state document, which comfortably exceeds ordinary daemon chatter.
pub const DEFAULT_MAX_RX_BYTES: usize = 5 * 1024 * 1024;

/// Inbound notifications from an IPC link.
///
/// `Disconnected` is delivered exactly once per session, whether the peer
/// hung up, the transport failed, or the client dropped the session itself.
/// Consumers decide from their own state whether the loss was planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEvent {
    /// A complete message frame arrived from the peer.
    Message(Vec<u8>),
    /// The link is gone. No further events follow.
    Disconnected,
}

/// Callback invoked for every inbound [`IpcEvent`] on a session.
pub type IpcEventFn = Arc<dyn Fn(IpcEvent) + Send + Sync>;

/// Per-connection settings handed to [`IpcConnect::connect`].
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    /// Well-known name of the target service, e.g. `"pengine"`.
    pub service: String,
    /// Inbound frames larger than this are rejected by the transport.
    pub max_rx_bytes: usize,
}

impl IpcClientConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            max_rx_bytes: DEFAULT_MAX_RX_BYTES,
        }
    }

    pub fn with_max_rx_bytes(mut self, max_rx_bytes: usize) -> Self {
        self.max_rx_bytes = max_rx_bytes;
        self
    }
}

/// Connector for a family of IPC transports.
///
/// Implementations hand out live [`IpcSession`]s and, where the platform
/// runs worker daemons under a supervisor, expose a best-effort stop hook
/// for peers that should not outlive their client.
pub trait IpcConnect: Send + Sync {
    /// Open a session to `config.service`, registering `on_event` for all
    /// inbound traffic. Returns an error when the service is unreachable.
    fn connect(
        &self,
        config: &IpcClientConfig,
        on_event: IpcEventFn,
    ) -> IpcResult<Box<dyn IpcSession>>;

    /// Whether this connector can ask a supervisor to stop peer daemons.
    fn supervises_peers(&self) -> bool {
        false
    }

    /// Request that the supervisor stop the named peer service. Only
    /// meaningful when [`Self::supervises_peers`] returns true; the default
    /// does nothing.
    fn request_peer_stop(&self, _service: &str) {}
}

/// A live connection to one peer service.
///
/// Dropping the session tears the link down and delivers the final
/// [`IpcEvent::Disconnected`] through the registered callback, unless the
/// peer side already did.
pub trait IpcSession: Send {
    /// Queue one message frame for delivery. Returns the number of bytes
    /// accepted; zero or an error means the frame was not queued.
    fn send(&mut self, bytes: &[u8]) -> IpcResult<usize>;

    /// Process id of the peer, when the transport knows it.
    fn peer_pid(&self) -> Option<u32>;
}

impl fmt::Debug for dyn IpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcSession")
            .field("peer_pid", &self.peer_pid())
            .finish()
    }
}
