//! Error types for CIB queries and snapshots.

use thiserror::Error;

pub type CibResult<T> = Result<T, CibError>;

#[derive(Error, Debug)]
pub enum CibError {
    #[error("cluster information base connection is down")]
    Disconnected,

    #[error("cluster information base query timed out")]
    Timeout,

    #[error("no cluster state matched the query")]
    NotFound,

    #[error("failed to serialize cluster state: {0}")]
    Serialize(String),

    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
}
