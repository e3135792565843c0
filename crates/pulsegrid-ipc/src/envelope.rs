//! JSON request/reply framing shared by controller subsystems and workers.
//!
//! Every request carries a `reference` string that is unique for the life of
//! the sending process; replies echo it back verbatim. Correlation by
//! reference is what lets a subsystem discriminate the reply it is waiting
//! for from stragglers belonging to an earlier request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{IpcError, IpcResult};

static REFERENCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// One framed IPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation name, e.g. `"pe_calc"`.
    pub op: String,
    /// Correlation token. Requests mint a fresh one; replies echo it.
    pub reference: String,
    /// Subsystem that produced the message.
    pub sys_from: String,
    /// Subsystem the message is addressed to.
    pub sys_to: String,
    /// Operation-specific body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a request with a freshly minted reference.
    pub fn request(
        op: impl Into<String>,
        sys_from: impl Into<String>,
        sys_to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let op = op.into();
        let reference = mint_reference(&op);
        Self {
            op,
            reference,
            sys_from: sys_from.into(),
            sys_to: sys_to.into(),
            payload,
        }
    }

    /// Build a reply to `request`, echoing its reference.
    pub fn reply_to(request: &Envelope, op: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            op: op.into(),
            reference: request.reference.clone(),
            sys_from: request.sys_to.clone(),
            sys_to: request.sys_from.clone(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> IpcResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IpcError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> IpcResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| IpcError::Decode(e.to_string()))
    }
}

/// References combine the operation, a process-wide sequence number, and a
/// millisecond timestamp: unique within the process and still meaningful in
/// logs on their own.
fn mint_reference(op: &str) -> String {
    let seq = REFERENCE_SEQ.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{op}-{seq}-{millis}")
}
