//! Sender and receiver links

use crate::types::{
    definitions::{self, Handle, ReceiverSettleMode, Role, SenderSettleMode},
    messaging::{Source, Target},
    performatives::{Attach, Detach},
};

pub mod error;
pub mod options;
pub(crate) mod receiver;
pub(crate) mod sender;
pub(crate) mod state;

pub use error::Error;
pub use options::{CreditMode, ReceiverOptions, SenderOptions};
pub use receiver::{Deliveries, IncomingDelivery};
pub use state::LinkState;

use receiver::ReceiverLink;
use sender::SenderLink;
use state::LinkFlowState;

/// Identifies a link within a connection.
///
/// The id stays valid across a reconnect as the link is re-attached on the same
/// channel with the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId {
    pub(crate) channel: u16,
    pub(crate) handle: Handle,
}

impl LinkId {
    /// The session the link belongs to
    pub fn session(&self) -> crate::session::SessionId {
        crate::session::SessionId(self.channel)
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.handle)
    }
}

#[derive(Debug)]
pub(crate) enum LinkRole {
    Sender(SenderLink),
    Receiver(ReceiverLink),
}

/// One link endpoint, owned by its session
#[derive(Debug)]
pub(crate) struct Link {
    pub id: LinkId,
    pub name: String,
    pub state: LinkState,
    pub remote_handle: Option<Handle>,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub flow: LinkFlowState,
    pub role: LinkRole,
    pub properties: Option<definitions::Fields>,
    pub max_message_size: Option<u64>,
}

impl Link {
    pub fn sender(id: LinkId, name: String, options: SenderOptions) -> Self {
        Self {
            id,
            name,
            state: LinkState::Unattached,
            remote_handle: None,
            source: Some(Source::default()),
            target: Some(options.target_terminus()),
            snd_settle_mode: options.snd_settle_mode,
            rcv_settle_mode: ReceiverSettleMode::First,
            flow: LinkFlowState::sender(0),
            properties: options.properties.clone(),
            role: LinkRole::Sender(SenderLink::new(options)),
            max_message_size: None,
        }
    }

    pub fn receiver(id: LinkId, name: String, options: ReceiverOptions) -> Self {
        Self {
            id,
            name,
            state: LinkState::Unattached,
            remote_handle: None,
            source: Some(options.source_terminus()),
            target: Some(Target::default()),
            snd_settle_mode: SenderSettleMode::Mixed,
            rcv_settle_mode: options.rcv_settle_mode(),
            flow: LinkFlowState::receiver(options.credit_mode.initial_credit()),
            properties: options.properties.clone(),
            role: LinkRole::Receiver(ReceiverLink::new(options)),
            max_message_size: None,
        }
    }

    /// A link created in reply to an attach from the peer. The local role is the reverse
    /// of the remote one and the termini are taken from the remote attach
    pub fn from_remote_attach(
        id: LinkId,
        attach: &Attach,
        sender_options: SenderOptions,
        receiver_options: ReceiverOptions,
    ) -> Self {
        let mut link = match attach.role {
            Role::Receiver => Self::sender(id, attach.name.clone(), sender_options),
            Role::Sender => Self::receiver(id, attach.name.clone(), receiver_options),
        };
        link.source = attach.source.as_deref().cloned();
        link.target = attach.target.as_deref().cloned();
        link.snd_settle_mode = attach.snd_settle_mode;
        link.rcv_settle_mode = attach.rcv_settle_mode;
        link
    }

    pub fn role(&self) -> Role {
        match self.role {
            LinkRole::Sender(_) => Role::Sender,
            LinkRole::Receiver(_) => Role::Receiver,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Attached)
    }

    /// The local attach. A sender advertises its current delivery-count so that it carries
    /// on across a re-attach
    pub fn attach(&mut self) -> Attach {
        let initial_delivery_count = match self.role {
            LinkRole::Sender(_) => {
                self.flow.initial_delivery_count = self.flow.delivery_count;
                Some(self.flow.delivery_count)
            }
            LinkRole::Receiver(_) => None,
        };
        self.state = match self.state {
            LinkState::Unattached => LinkState::AttachSent,
            state => state,
        };

        Attach {
            name: self.name.clone(),
            handle: self.id.handle,
            role: self.role(),
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source.clone().map(Box::new),
            target: self.target.clone().map(Box::new),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size: self.max_message_size,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.properties.clone(),
        }
    }

    /// Handles the peer's attach. A peer that refuses a link replies with a null terminus
    /// and follows up with a closing detach
    pub fn on_incoming_attach(&mut self, attach: &Attach) -> Result<(), Error> {
        self.remote_handle = Some(attach.handle);

        let refused = match self.role {
            LinkRole::Sender(_) => attach.target.is_none(),
            LinkRole::Receiver(_) => attach.source.is_none(),
        };
        if refused {
            return Err(Error::RemoteRefused(None));
        }

        if let LinkRole::Receiver(_) = self.role {
            if let Some(delivery_count) = attach.initial_delivery_count {
                self.flow.delivery_count = delivery_count;
            }
        }
        if let Some(max_message_size) = attach.max_message_size {
            self.max_message_size = Some(max_message_size).filter(|size| *size > 0);
        }

        match self.state {
            LinkState::AttachSent | LinkState::Unattached => {
                self.state = LinkState::Attached;
                Ok(())
            }
            _ => Err(Error::IllegalState),
        }
    }

    /// The closing detach sent by this end
    pub fn detach(&mut self, error: Option<definitions::Error>) -> Detach {
        self.state = match self.state {
            LinkState::CloseReceived => LinkState::Closed,
            _ => LinkState::CloseSent,
        };
        Detach {
            handle: self.id.handle,
            closed: true,
            error,
        }
    }

    pub fn as_sender_mut(&mut self) -> Result<(&mut SenderLink, &mut LinkFlowState), Error> {
        match &mut self.role {
            LinkRole::Sender(sender) => Ok((sender, &mut self.flow)),
            LinkRole::Receiver(_) => Err(Error::IllegalState),
        }
    }

    pub fn as_receiver_mut(&mut self) -> Result<(&mut ReceiverLink, &mut LinkFlowState), Error> {
        match &mut self.role {
            LinkRole::Receiver(receiver) => Ok((receiver, &mut self.flow)),
            LinkRole::Sender(_) => Err(Error::IllegalState),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{definitions::Role, messaging::Target};

    use super::{Error, Link, LinkId, LinkState, ReceiverOptions, SenderOptions};

    fn link_id() -> LinkId {
        LinkId {
            channel: 1,
            handle: 2,
        }
    }

    #[test]
    fn test_sender_attach_carries_delivery_count() {
        let mut link = Link::sender(
            link_id(),
            String::from("sender"),
            SenderOptions::new().target("examples"),
        );
        link.flow.delivery_count = 42;
        let attach = link.attach();
        assert_eq!(attach.role, Role::Sender);
        assert_eq!(attach.initial_delivery_count, Some(42));
        assert_eq!(attach.target.unwrap().address(), Some("examples"));
        assert_eq!(link.state, LinkState::AttachSent);
    }

    #[test]
    fn test_refused_attach() {
        let mut link = Link::sender(link_id(), String::from("sender"), SenderOptions::new());
        let mut remote = link.attach();
        remote.role = Role::Receiver;
        remote.target = None;
        assert!(matches!(
            link.on_incoming_attach(&remote),
            Err(Error::RemoteRefused(None))
        ));
    }

    #[test]
    fn test_receiver_learns_delivery_count() {
        let mut link = Link::receiver(link_id(), String::from("receiver"), ReceiverOptions::new());
        let mut remote = link.attach();
        remote.role = Role::Sender;
        remote.target = Some(Box::new(Target::default()));
        remote.initial_delivery_count = Some(7);
        link.on_incoming_attach(&remote).unwrap();
        assert!(link.is_open());
        assert_eq!(link.flow.delivery_count, 7);
    }
}
