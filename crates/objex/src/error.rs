//! Error types for the object layer

use thiserror::Error;

pub use objex_wire::WireError;

/// Object-layer error types
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    UnknownMember(String),

    #[error("no overload of {member} takes {parameters} parameters")]
    ArityMismatch { member: String, parameters: u16 },

    #[error("invocation failed: {message}")]
    Invocation {
        message: String,
        inner: Option<String>,
    },

    #[error("remote exception: {message}")]
    Remote {
        message: String,
        inner: Option<String>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("session closed")]
    SessionClosed,

    #[error("dispatch queue overflow")]
    Congestion,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("value error: {0}")]
    Value(String),
}

impl Error {
    pub(crate) fn invocation(message: impl Into<String>) -> Self {
        Error::Invocation {
            message: message.into(),
            inner: None,
        }
    }

    /// The message and one level of inner message, as serialized into an
    /// exception envelope.
    pub fn summary(&self) -> (String, Option<String>) {
        match self {
            Error::Invocation { message, inner } | Error::Remote { message, inner } => {
                (message.clone(), inner.clone())
            }
            Error::Wire(e) => (e.to_string(), None),
            other => (other.to_string(), None),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
