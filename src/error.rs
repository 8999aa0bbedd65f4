use thiserror::Error;

/// Errors produced by the RTSP codec, client, server and streaming pipeline.
///
/// Protocol variants (`MalformedStartLine`, `InvalidStatusCode`,
/// `MalformedHeader`, `ConnectionClosed`) end the connection they occurred on.
/// `Handshake` and `NoAvailablePorts` surface from `start()` of the ingest.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    #[error("invalid status code: {0:?}")]
    InvalidStatusCode(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid URL {0:?}")]
    InvalidUrl(String),

    #[error("{method} failed: {status} {reason}")]
    Handshake {
        method: String,
        status: u16,
        reason: String,
    },

    #[error("no free UDP port pair in {start}..{end}")]
    NoAvailablePorts { start: u16, end: u16 },

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("unsupported stream type: {0}")]
    UnsupportedStreamType(String),

    #[error("packet source is not running or its channel was already taken")]
    NoPacketSource,

    #[error("handler error: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// True for failures that mean the RTSP byte stream can no longer be trusted.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedStartLine(_)
                | RelayError::InvalidStatusCode(_)
                | RelayError::MalformedHeader(_)
                | RelayError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
