//! Asynchronous CIB query client.
//!
//! Consumers hold a cheap, cloneable [`CibConn`]. Queries are fire-and-forget
//! sends tagged with a process-unique call id; the backing service answers
//! with [`CibReply`] messages that the owning event loop routes back by call
//! id. The connection tracks how many calls are still in flight so callers
//! can defer work while the CIB is busy.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::document::CibDocument;
use crate::error::{CibError, CibResult};

/// Process-unique identifier of one CIB call.
pub type CallId = u64;

/// Which copy of the CIB a query should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CibScope {
    /// This node's replica. Cheap, and sufficient once the local copy is
    /// known to be in sync.
    Local,
    /// The authoritative primary replica.
    Primary,
}

/// A query on its way to the CIB service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CibRequest {
    pub call: CallId,
    pub scope: CibScope,
}

/// The service's answer to one [`CibRequest`].
#[derive(Debug)]
pub struct CibReply {
    pub call: CallId,
    pub result: CibResult<CibDocument>,
}

/// Client handle to the CIB service.
#[derive(Clone)]
pub struct CibConn {
    requests: mpsc::UnboundedSender<CibRequest>,
    next_call: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl CibConn {
    /// Issue an asynchronous read of the whole document. The returned call
    /// id will appear on the matching [`CibReply`].
    pub fn query(&self, scope: CibScope) -> CibResult<CallId> {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.requests.send(CibRequest { call, scope }).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(CibError::Disconnected);
        }
        trace!(call, ?scope, "cib query dispatched");
        Ok(call)
    }

    /// Mark a call as answered. Completion handlers settle their own call
    /// only after finishing, so the in-flight gauge still counts them while
    /// they run.
    pub fn settle(&self, call: CallId) {
        let settled = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match settled {
            Ok(before) => trace!(call, in_flight = before - 1, "cib call settled"),
            Err(_) => trace!(call, "settle on idle connection ignored"),
        }
    }

    /// Number of calls issued but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Create a connection and the request stream its service end consumes.
pub fn cib_channel() -> (CibConn, mpsc::UnboundedReceiver<CibRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CibConn {
            requests: tx,
            next_call: Arc::new(AtomicU64::new(1)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        },
        rx,
    )
}
