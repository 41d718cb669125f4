//! Deliveries received on a receiver link and trackers of deliveries sent on a sender link

use crate::{
    link::LinkId,
    types::{
        definitions::{DeliveryNumber, DeliveryTag, Error},
        messaging::{DeliveryState, Modified, Rejected},
    },
};

/// The settlement state of a delivery as seen by this end of the link
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No terminal outcome has been decided yet
    Unsettled,

    /// The message was accepted
    Accepted,

    /// The message was rejected, optionally with the reason
    Rejected(Option<Error>),

    /// The message was released and may be redelivered
    Released,

    /// The message was modified
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },

    /// Settled without an outcome, for example a message sent pre-settled
    Settled,

    /// The transport failed before the peer reported an outcome, or the message could not be
    /// framed for transfer
    Unknown,
}

impl Outcome {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Unsettled)
    }

    pub(crate) fn from_state(state: Option<&DeliveryState>) -> Self {
        match state {
            Some(DeliveryState::Accepted(_)) => Outcome::Accepted,
            Some(DeliveryState::Rejected(rejected)) => Outcome::Rejected(rejected.error.clone()),
            Some(DeliveryState::Released(_)) => Outcome::Released,
            Some(DeliveryState::Modified(modified)) => Outcome::Modified {
                delivery_failed: modified.delivery_failed.unwrap_or(false),
                undeliverable_here: modified.undeliverable_here.unwrap_or(false),
            },
            Some(DeliveryState::Received(_)) | None => Outcome::Unsettled,
        }
    }

    /// Moves to `next` unless already terminal. Returns whether the outcome changed
    pub(crate) fn transition(&mut self, next: Outcome) -> bool {
        if self.is_terminal() || !next.is_terminal() {
            return false;
        }
        *self = next;
        true
    }

    pub(crate) fn into_state(self) -> Option<DeliveryState> {
        use crate::types::messaging::{Accepted, Released};

        match self {
            Outcome::Accepted => Some(DeliveryState::Accepted(Accepted {})),
            Outcome::Rejected(error) => Some(DeliveryState::Rejected(Rejected { error })),
            Outcome::Released => Some(DeliveryState::Released(Released {})),
            Outcome::Modified {
                delivery_failed,
                undeliverable_here,
            } => Some(DeliveryState::Modified(Modified {
                delivery_failed: Some(delivery_failed),
                undeliverable_here: Some(undeliverable_here),
                message_annotations: None,
            })),
            Outcome::Unsettled | Outcome::Settled | Outcome::Unknown => None,
        }
    }
}

/// A message received on a receiver link
///
/// Settling it is done through [`crate::Context`] or the settle handle of a
/// [`crate::link::Deliveries`] stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub(crate) link: LinkId,
    pub(crate) tag: DeliveryTag,
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) epoch: u64,
    pub(crate) settled: bool,
}

impl Delivery {
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Whether the sender already settled the delivery
    pub fn is_remotely_settled(&self) -> bool {
        self.settled
    }
}

/// Tracks a message sent on a sender link
#[derive(Debug, Clone, PartialEq)]
pub struct Tracker {
    pub(crate) link: LinkId,
    pub(crate) tag: DeliveryTag,
    pub(crate) delivery_id: Option<DeliveryNumber>,
    pub(crate) outcome: Outcome,
}

impl Tracker {
    pub(crate) fn new(link: LinkId, tag: DeliveryTag) -> Self {
        Self {
            link,
            tag,
            delivery_id: None,
            outcome: Outcome::Unsettled,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// The delivery tag, unique within the link
    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    /// The delivery id, assigned once the first transfer frame is sent
    pub fn delivery_id(&self) -> Option<DeliveryNumber> {
        self.delivery_id
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{
        definitions::{Error, ErrorCondition},
        messaging::{Accepted, DeliveryState, Rejected},
    };

    use super::Outcome;

    #[test]
    fn test_terminal_outcome_never_changes() {
        let mut outcome = Outcome::Unsettled;
        assert!(outcome.transition(Outcome::Accepted));
        assert!(!outcome.transition(Outcome::Released));
        assert!(!outcome.transition(Outcome::Unknown));
        assert_eq!(outcome, Outcome::Accepted);
    }

    #[test]
    fn test_non_terminal_transition_is_ignored() {
        let mut outcome = Outcome::Unsettled;
        assert!(!outcome.transition(Outcome::Unsettled));
        assert!(!outcome.is_terminal());
    }

    #[test]
    fn test_outcome_from_state() {
        let state = DeliveryState::Accepted(Accepted {});
        assert_eq!(Outcome::from_state(Some(&state)), Outcome::Accepted);

        let error = Error::from(ErrorCondition::InternalError);
        let state = DeliveryState::Rejected(Rejected {
            error: Some(error.clone()),
        });
        assert_eq!(
            Outcome::from_state(Some(&state)),
            Outcome::Rejected(Some(error))
        );
        assert_eq!(Outcome::from_state(None), Outcome::Unsettled);
    }
}
