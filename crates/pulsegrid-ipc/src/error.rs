//! Error types for IPC connections and message framing.

use thiserror::Error;

pub type IpcResult<T> = Result<T, IpcError>;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("connection to service '{0}' refused")]
    ConnectRefused(String),

    #[error("service '{0}' is not reachable")]
    ServiceUnavailable(String),

    #[error("send to service '{0}' failed: link is down")]
    LinkDown(String),

    #[error("message of {len} bytes exceeds the {max} byte receive limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}
