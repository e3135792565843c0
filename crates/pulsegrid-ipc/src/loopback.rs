//! In-process IPC transport.
//!
//! Backs `pulsed standalone` and the test suites: the "peer daemon" is just a
//! task holding a [`LoopbackPeer`]. The transport honors the same contracts a
//! socket implementation must: inbound frames above the configured limit are
//! rejected, and [`IpcEvent::Disconnected`] fires exactly once per session no
//! matter which side tears the link down first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{IpcClientConfig, IpcConnect, IpcEvent, IpcEventFn, IpcSession};
use crate::error::{IpcError, IpcResult};

/// State shared by the two ends of one loopback link.
struct LinkState {
    service: String,
    on_event: IpcEventFn,
    max_rx_bytes: usize,
    disconnected: AtomicBool,
}

impl LinkState {
    /// Deliver the final `Disconnected` event, first caller wins.
    fn emit_disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            (self.on_event)(IpcEvent::Disconnected);
        }
    }

    fn is_down(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// Connector that pairs every [`IpcConnect::connect`] call with a
/// [`LoopbackPeer`] handed out through an accept channel.
pub struct LoopbackConnector {
    refuse: bool,
    supervises: bool,
    accepted: mpsc::UnboundedSender<LoopbackPeer>,
    stop_log: Mutex<Vec<String>>,
}

impl LoopbackConnector {
    /// Connector that accepts connections. The receiver yields one
    /// [`LoopbackPeer`] per successful connect.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                refuse: false,
                supervises: false,
                accepted: tx,
                stop_log: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Connector that refuses every connection attempt.
    pub fn refusing() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            refuse: true,
            supervises: false,
            accepted: tx,
            stop_log: Mutex::new(Vec::new()),
        }
    }

    /// Like [`Self::new`], but reports supervisor support and records
    /// peer-stop requests for inspection.
    pub fn supervising() -> (Self, mpsc::UnboundedReceiver<LoopbackPeer>) {
        let (mut connector, rx) = Self::new();
        connector.supervises = true;
        (connector, rx)
    }

    /// Services whose stop was requested, in order.
    pub fn stop_requests(&self) -> Vec<String> {
        self.stop_log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl IpcConnect for LoopbackConnector {
    fn connect(
        &self,
        config: &IpcClientConfig,
        on_event: IpcEventFn,
    ) -> IpcResult<Box<dyn IpcSession>> {
        if self.refuse {
            return Err(IpcError::ConnectRefused(config.service.clone()));
        }
        let state = Arc::new(LinkState {
            service: config.service.clone(),
            on_event,
            max_rx_bytes: config.max_rx_bytes,
            disconnected: AtomicBool::new(false),
        });
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            state: Arc::clone(&state),
            inbox: Some(from_client),
        };
        // Nobody accepting peers means the service is not running.
        self.accepted
            .send(peer)
            .map_err(|_| IpcError::ServiceUnavailable(config.service.clone()))?;
        debug!(service = %config.service, "loopback link established");
        Ok(Box::new(LoopbackSession { state, to_peer }))
    }

    fn supervises_peers(&self) -> bool {
        self.supervises
    }

    fn request_peer_stop(&self, service: &str) {
        info!(%service, "requesting supervisor stop of peer service");
        if let Ok(mut log) = self.stop_log.lock() {
            log.push(service.to_string());
        }
    }
}

/// Client half of a loopback link.
struct LoopbackSession {
    state: Arc<LinkState>,
    to_peer: mpsc::UnboundedSender<Vec<u8>>,
}

impl IpcSession for LoopbackSession {
    fn send(&mut self, bytes: &[u8]) -> IpcResult<usize> {
        if self.state.is_down() {
            return Err(IpcError::LinkDown(self.state.service.clone()));
        }
        self.to_peer
            .send(bytes.to_vec())
            .map_err(|_| IpcError::LinkDown(self.state.service.clone()))?;
        Ok(bytes.len())
    }

    fn peer_pid(&self) -> Option<u32> {
        // Peer tasks share our process.
        Some(std::process::id())
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.state.emit_disconnect();
    }
}

/// Peer half of a loopback link, held by the task playing the worker daemon.
pub struct LoopbackPeer {
    state: Arc<LinkState>,
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LoopbackPeer {
    /// Name of the service this peer is standing in for.
    pub fn service(&self) -> &str {
        &self.state.service
    }

    /// Await the next frame from the client. `None` once the client side is
    /// gone or the inbox was closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.inbox.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbox.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Push one frame to the client. Frames above the client's receive limit
    /// are rejected without being delivered.
    pub fn send(&self, bytes: &[u8]) -> IpcResult<()> {
        if self.state.is_down() {
            return Err(IpcError::LinkDown(self.state.service.clone()));
        }
        if bytes.len() > self.state.max_rx_bytes {
            warn!(
                service = %self.state.service,
                len = bytes.len(),
                max = self.state.max_rx_bytes,
                "dropping oversized inbound frame"
            );
            return Err(IpcError::MessageTooLarge {
                len: bytes.len(),
                max: self.state.max_rx_bytes,
            });
        }
        (self.state.on_event)(IpcEvent::Message(bytes.to_vec()));
        Ok(())
    }

    /// Tear the link down from the peer side, as a crashing daemon would.
    pub fn hang_up(&self) {
        self.state.emit_disconnect();
    }

    /// Stop consuming client frames. Subsequent client sends fail.
    pub fn close_inbox(&mut self) {
        self.inbox = None;
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.state.emit_disconnect();
    }
}
