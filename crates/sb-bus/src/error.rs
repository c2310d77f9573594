use std::time::Duration;

/// Transport-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker link dropped while a reply was outstanding, or before a
    /// queued command could be flushed.
    #[error("broker connection lost")]
    ConnectionLost,
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("invalid broker message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Wire(#[from] sb_proto::WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
