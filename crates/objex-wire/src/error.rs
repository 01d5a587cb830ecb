//! Error types for the wire layer

use thiserror::Error;

/// Wire-level error types
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("truncated frame")]
    FrameTruncated,

    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    ProtocolLimit { size: usize, max: usize },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl WireError {
    /// Check if this error represents a normal connection close
    /// (EOF, connection reset, etc.)
    pub fn is_connection_closed(&self) -> bool {
        match self {
            WireError::ConnectionClosed => true,
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
