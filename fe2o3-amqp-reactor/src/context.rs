//! Access to a connection from its callbacks and work queue closures

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    connection::{self, Connection, ConnectionState},
    container::ContainerHandle,
    delivery::{Delivery, Outcome, Tracker},
    handler::Event,
    link::{self, Deliveries, LinkId, ReceiverOptions, SenderOptions},
    session::SessionId,
    thread_safe::ThreadSafeSender,
    types::{definitions, message::Message},
    work_queue::WorkQueue,
};

/// The connection a callback runs for.
///
/// Operations take effect on the connection right away. Frames they produce are written
/// once the callback returns.
pub struct Context<'a> {
    pub(crate) connection: &'a mut Connection,
    pub(crate) work_queue: &'a WorkQueue,
    pub(crate) container: &'a ContainerHandle,
}

impl<'a> std::fmt::Debug for Context<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("container_id", &self.connection.container_id())
            .field("state", &self.connection.state)
            .field("connected_url", &self.connected_url().map(Url::as_str))
            .finish()
    }
}

impl<'a> Context<'a> {
    pub fn container(&self) -> &ContainerHandle {
        self.container
    }

    /// A handle to run closures on this connection from other threads
    pub fn work_queue(&self) -> WorkQueue {
        self.work_queue.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state
    }

    /// The endpoint that accepted the current transport
    pub fn connected_url(&self) -> Option<&Url> {
        self.connection.connected_url.as_ref()
    }

    /// Whether the current transport replaced a lost one
    pub fn is_reconnect(&self) -> bool {
        self.connection.is_reconnect
    }

    /* --------------------------- Sessions and links --------------------------- */

    pub fn begin_session(&mut self) -> Result<SessionId, connection::Error> {
        self.connection.begin_session()
    }

    pub fn end_session(&mut self, session: SessionId) -> Result<(), connection::Error> {
        self.connection.end_session(session, None)
    }

    /// Opens a sender on the connection's default session
    pub fn open_sender(&mut self, options: SenderOptions) -> Result<LinkId, connection::Error> {
        self.connection.open_sender(None, options)
    }

    pub fn open_sender_on(
        &mut self,
        session: SessionId,
        options: SenderOptions,
    ) -> Result<LinkId, connection::Error> {
        self.connection.open_sender(Some(session), options)
    }

    /// Opens a receiver on the connection's default session
    pub fn open_receiver(&mut self, options: ReceiverOptions) -> Result<LinkId, connection::Error> {
        self.connection.open_receiver(None, options)
    }

    pub fn open_receiver_on(
        &mut self,
        session: SessionId,
        options: ReceiverOptions,
    ) -> Result<LinkId, connection::Error> {
        self.connection.open_receiver(Some(session), options)
    }

    pub fn close_link(&mut self, link: LinkId) -> Result<(), link::Error> {
        self.connection.close_link(link, None)
    }

    /// Closes a link with an error, e.g. to refuse a link attached by the peer
    pub fn close_link_with_error(
        &mut self,
        link: LinkId,
        error: definitions::Error,
    ) -> Result<(), link::Error> {
        self.connection.close_link(link, Some(error))
    }

    /// Closes the connection once queued deliveries have been sent and settled
    pub fn close(&mut self) {
        self.connection.close(None)
    }

    pub fn close_with_error(&mut self, error: definitions::Error) {
        self.connection.close(Some(error))
    }

    /* -------------------------------- Sending -------------------------------- */

    /// Queues a message on a sender. It is transferred as soon as the link has credit
    pub fn send(&mut self, link: LinkId, message: impl Into<Message>) -> Result<Tracker, link::Error> {
        let payload = message
            .into()
            .encode()
            .map_err(|err| link::Error::MessageCodec(err.to_string()))?;
        self.send_encoded(link, payload)
    }

    pub(crate) fn send_encoded(&mut self, link: LinkId, payload: Bytes) -> Result<Tracker, link::Error> {
        self.connection.send(link, payload)
    }

    /// Credit of a sender left after its queued messages, or the outstanding credit of a
    /// receiver
    pub fn credit(&mut self, link: LinkId) -> Result<u32, link::Error> {
        self.connection.credit(link)
    }

    /// Settles a delivery of a sender that does not settle automatically
    pub fn settle(&mut self, tracker: &Tracker) -> Result<(), link::Error> {
        self.connection.settle_tracker(tracker)
    }

    /// A sender handle that may be used from other threads
    pub fn thread_safe_sender(&mut self, link: LinkId) -> Result<ThreadSafeSender, link::Error> {
        let gate = self.connection.sender_gate(link, self.work_queue)?;
        Ok(ThreadSafeSender::new(gate, false))
    }

    /* ------------------------------- Receiving ------------------------------- */

    pub fn accept(&mut self, delivery: &Delivery) -> Result<(), link::Error> {
        self.settle_delivery(delivery, Outcome::Accepted)
    }

    pub fn reject(
        &mut self,
        delivery: &Delivery,
        error: Option<definitions::Error>,
    ) -> Result<(), link::Error> {
        self.settle_delivery(delivery, Outcome::Rejected(error))
    }

    pub fn release(&mut self, delivery: &Delivery) -> Result<(), link::Error> {
        self.settle_delivery(delivery, Outcome::Released)
    }

    pub fn modify(
        &mut self,
        delivery: &Delivery,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), link::Error> {
        self.settle_delivery(
            delivery,
            Outcome::Modified {
                delivery_failed,
                undeliverable_here,
            },
        )
    }

    /// Settles a received delivery. Settling it again has no effect
    pub fn settle_delivery(&mut self, delivery: &Delivery, outcome: Outcome) -> Result<(), link::Error> {
        self.connection.settle_delivery(delivery, outcome)
    }

    pub fn add_credit(&mut self, link: LinkId, credit: u32) -> Result<(), link::Error> {
        self.connection.add_credit(link, credit)
    }

    /// Asks the sender to use up or give back the outstanding credit
    pub fn drain(&mut self, link: LinkId) -> Result<(), link::Error> {
        self.connection.drain(link)
    }

    /// Hands an error of an operation nobody waits on to `on_link_error`
    pub(crate) fn report_link_error(&mut self, link: LinkId, error: link::Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(link = %link, error = %error, "Link operation failed");
        #[cfg(feature = "log")]
        log::warn!("Link operation failed link={}, error={}", link, error);
        self.connection.out.event(Event::LinkError(link, error));
    }

    /// Routes the deliveries of a receiver to a stream instead of `on_message`
    pub fn deliveries(&mut self, link: LinkId) -> Result<Deliveries, link::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection.set_deliveries_sink(link, tx)?;
        Ok(Deliveries::new(rx, link, self.work_queue.clone(), false))
    }
}
