use std::io;

use crate::{connection, link};

/// Errors raised by a container and its handle
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Building the runtime or binding a listener failed
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Connection(#[from] connection::Error),

    #[error(transparent)]
    Link(#[from] link::Error),

    /// The container has been stopped
    #[error("Container is stopped")]
    Stopped,
}
