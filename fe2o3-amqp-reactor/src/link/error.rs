//! Errors associated with links

use crate::types::definitions::{self, ErrorCondition};

/// Errors associated with a link
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No link with this id exists on the connection
    #[error("Link not found")]
    NotFound,

    /// The operation does not apply to the link in its current state or role
    #[error("Illegal local state")]
    IllegalState,

    /// The link has been detached, possibly with an error
    #[error("Link is detached {0:?}")]
    Detached(Option<definitions::Error>),

    /// The peer refused the attach, e.g. the address does not exist
    #[error("Remote refused attach {0:?}")]
    RemoteRefused(Option<definitions::Error>),

    /// The delivery belongs to a transport that has since been replaced
    #[error("Delivery is stale")]
    Stale,

    /// A transfer arrived without link credit
    #[error("Transfer limit exceeded")]
    TransferLimitExceeded,

    /// A frame violated the link protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message could not be encoded or decoded
    #[error("Message codec error: {0}")]
    MessageCodec(String),
}

impl Error {
    /// The AMQP error sent in a detach caused by this error, if any
    pub(crate) fn to_amqp_error(&self) -> Option<definitions::Error> {
        let (condition, description) = match self {
            Error::TransferLimitExceeded => (ErrorCondition::TransferLimitExceeded, None),
            Error::Protocol(description) => {
                (ErrorCondition::IllegalState, Some(description.clone()))
            }
            Error::MessageCodec(description) => {
                (ErrorCondition::DecodeError, Some(description.clone()))
            }
            _ => return None,
        };
        Some(definitions::Error::new(condition, description))
    }
}
