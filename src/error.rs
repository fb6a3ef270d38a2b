use thiserror::Error;

/// Errors raised by the capabilities and workers.
///
/// None of these cross a worker boundary: each worker logs its own failure
/// and reports it through [`crate::shutdown::WorkerExit`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Upstream unreachable, handshake failed, or not connected.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    /// A single value read failed or returned the wrong type.
    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("send error: {0}")]
    Send(String),

    /// Malformed frame or JSON on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The cancellation token fired while a call was in flight.
    #[error("cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Protocol(e.to_string())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
