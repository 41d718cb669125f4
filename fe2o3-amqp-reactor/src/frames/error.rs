use std::io;

/// Errors raised while encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    #[error("Decode Error: {0}")]
    DecodeError(String),

    #[error("Encode Error: {0}")]
    EncodeError(String),

    #[error("Unexpected frame type {0:#x}")]
    UnexpectedFrameType(u8),

    #[error("Malformed frame header")]
    MalformedHeader,
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        match err {
            serde_amqp::Error::Io(e) => Self::Io(e),
            e => Self::DecodeError(e.to_string()),
        }
    }
}
