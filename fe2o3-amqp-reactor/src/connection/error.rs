use crate::{link, session, transport, types::definitions};

/// Errors associated with a connection
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed and could not be recovered
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// Every reconnect attempt failed
    #[error("Reconnect gave up after {attempts} attempts, last error: {source}")]
    ReconnectExhausted {
        attempts: u32,
        source: transport::Error,
    },

    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    /// The peer closed the connection with an error
    #[error("Remote closed with error {0}")]
    RemoteClosedWithError(definitions::Error),

    /// The peer violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection is closing or closed
    #[error("Illegal local state")]
    IllegalState,

    /// Every channel up to channel-max is in use
    #[error("Channel max reached")]
    ChannelMaxReached,

    #[error(transparent)]
    Session(#[from] session::Error),

    #[error(transparent)]
    Link(#[from] link::Error),

    /// A callback panicked and the connection was closed
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}
