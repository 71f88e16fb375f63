use thiserror::Error;

/// Main error type for robustsockets
#[derive(Error, Debug)]
pub enum RobustSocketError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection closed unexpectedly
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation attempted in a ready state that forbids it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// `close` called with arguments the physical connection rejects
    #[error("Invalid close arguments: {0}")]
    InvalidCloseArgs(String),

    /// Message id outside the buffered range
    #[error("Message id {id} out of range: buffer holds {floor}..{next}")]
    IdOutOfRange { id: u64, floor: u64, next: u64 },

    /// The first frame of a resumed session was not a valid resume marker
    #[error("Resume handshake failed: {0}")]
    HandshakeFailed(String),

    /// A control frame matched the expected shape but could not be decoded
    #[error("Malformed control frame: {0}")]
    MalformedControlFrame(String),

    /// Reconnection gave up at the deadline
    #[error("Reconnection failed after {attempts} attempts: {reason}")]
    ReconnectFailed { attempts: usize, reason: String },

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

/// Result type for robustsockets operations
pub type Result<T> = std::result::Result<T, RobustSocketError>;
