use std::io;

use crate::{frames, types::sasl::SaslCode};

/// Errors raised by a transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stream-level read/write failure
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The peer's protocol header is incompatible
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Authentication or TLS verification was rejected
    #[error("Security error: {0}")]
    Security(String),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Max frame size exceeded")]
    MaxFrameSizeExceeded,
}

impl Error {
    /// Whether the failure is worth retrying on an alternate endpoint
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Handshake(_) | Error::IdleTimeout
        )
    }

    pub(crate) fn sasl_outcome(code: SaslCode) -> Self {
        Error::Security(format!("SASL authentication failed with code {:?}", code))
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
            Error::Handshake(msg) => Error::Handshake(msg.clone()),
            Error::Security(msg) => Error::Security(msg.clone()),
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::IdleTimeout => Error::IdleTimeout,
            Error::MaxFrameSizeExceeded => Error::MaxFrameSizeExceeded,
        }
    }
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
