use crate::types::definitions::{self, ErrorCondition};

/// Errors associated with a session
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A frame referred to a handle that is not attached
    #[error("Unattached handle {0}")]
    UnattachedHandle(u32),

    /// The peer attached a second link on a handle in use
    #[error("Handle {0} is already in use")]
    HandleInUse(u32),

    /// The handle-max of the session has been reached
    #[error("Handle max reached")]
    HandleMaxReached,

    /// A transfer arrived while the incoming window was zero
    #[error("Incoming window violated")]
    WindowViolation,

    /// The session is not in a state that allows the operation
    #[error("Illegal local state")]
    IllegalState,

    /// The peer ended the session, possibly with an error
    #[error("Session ended {0:?}")]
    Ended(Option<definitions::Error>),
}

impl Error {
    /// The AMQP error sent in the `end` caused by this error
    pub(crate) fn to_amqp_error(&self) -> Option<definitions::Error> {
        let condition = match self {
            Error::UnattachedHandle(_) => ErrorCondition::UnattachedHandle,
            Error::HandleInUse(_) => ErrorCondition::HandleInUse,
            Error::HandleMaxReached => ErrorCondition::ResourceLimitExceeded,
            Error::WindowViolation => ErrorCondition::WindowViolation,
            Error::IllegalState => ErrorCondition::IllegalState,
            Error::Ended(_) => return None,
        };
        Some(definitions::Error::new(condition, self.to_string()))
    }
}
