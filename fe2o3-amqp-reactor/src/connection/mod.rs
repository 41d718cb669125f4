//! Connection endpoint
//!
//! [`Connection`] is a state machine without I/O: incoming frames and local operations
//! update it and leave frames to write and events to dispatch in its [`Outbox`]. The
//! [`engine`] drives it over a transport.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use serde_amqp::primitives::Array;
use slab::Slab;
use tokio::{sync::mpsc, time::Instant};
use url::Url;

use crate::{
    delivery::{Delivery, Outcome, Tracker},
    endpoint::Outbox,
    frames::amqp::{Frame, FrameBody},
    handler::Event,
    link::{self, receiver::ReceiverLink, IncomingDelivery, Link, LinkId, LinkRole, ReceiverOptions, SenderOptions},
    session::{self, Session, SessionId, SessionState},
    thread_safe::{SendError, SendGate},
    types::{
        definitions::{self, MIN_MAX_FRAME_SIZE},
        performatives::{Begin, Close, Open},
    },
    work_queue::WorkQueue,
};

pub(crate) mod engine;
pub mod error;
mod heartbeat;
pub mod options;
pub(crate) mod reconnect;

pub use error::Error;
pub use options::{ConnectionOptions, ReconnectOptions};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport has been established yet
    Unopened,

    /// The transport is up and the local `open` has been sent or is awaited
    Opening,

    /// Both `open`s have been exchanged
    Open,

    /// A local close waits for queued deliveries to drain
    Closing,

    /// Both `close`s have been exchanged, or the transport ended while closing
    Closed,

    /// The transport failed. A reconnect may follow
    Failed,
}

#[derive(Debug)]
pub(crate) struct Connection {
    container_id: String,
    hostname: Option<String>,
    pub options: ConnectionOptions,
    is_server: bool,
    pub state: ConnectionState,

    sessions: Slab<Session>,
    remote_channels: BTreeMap<u16, u16>,
    default_session: Option<SessionId>,

    remote_max_frame_size: usize,
    remote_channel_max: u16,
    pub remote_idle_timeout: Option<Duration>,

    open_sent: bool,
    close_sent: bool,
    close_error: Option<definitions::Error>,
    pub drain_deadline: Option<Instant>,

    /// Incremented for every lost transport
    pub epoch: u64,
    pub connected_url: Option<Url>,
    pub is_reconnect: bool,
    opened_once: bool,
    error_reported: bool,

    next_link_name: u64,
    pub out: Outbox,
}

impl Connection {
    pub fn new(
        container_id: String,
        hostname: Option<String>,
        options: ConnectionOptions,
        is_server: bool,
    ) -> Self {
        Self {
            container_id,
            hostname,
            remote_max_frame_size: options.max_frame_size as usize,
            options,
            is_server,
            state: ConnectionState::Unopened,
            sessions: Slab::new(),
            remote_channels: BTreeMap::new(),
            default_session: None,
            remote_channel_max: u16::MAX,
            remote_idle_timeout: None,
            open_sent: false,
            close_sent: false,
            close_error: None,
            drain_deadline: None,
            epoch: 0,
            connected_url: None,
            is_reconnect: false,
            opened_once: false,
            error_reported: false,
            next_link_name: 0,
            out: Outbox::default(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) || self.close_sent
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    /* ------------------------------ Open and close ------------------------------ */

    /// Starts the protocol on a new transport. Sessions and links that were open on a lost
    /// transport are begun and attached again
    pub fn start(&mut self, url: Option<Url>) {
        self.is_reconnect = self.opened_once;
        self.connected_url = url;
        self.state = ConnectionState::Opening;
        self.open_sent = false;
        self.close_sent = false;

        #[cfg(feature = "tracing")]
        tracing::debug!(container_id = %self.container_id, reconnect = self.is_reconnect, "Connection opening");
        #[cfg(feature = "log")]
        log::debug!("Connection opening container_id={}, reconnect={}", self.container_id, self.is_reconnect);

        if !self.is_server {
            self.send_open();
            self.restart_sessions();
        }
    }

    fn send_open(&mut self) {
        let offered_capabilities = match self.options.offered_capabilities.is_empty() {
            true => None,
            false => Some(Array::from(self.options.offered_capabilities.clone())),
        };
        let open = Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: Some(self.options.max_frame_size),
            channel_max: Some(self.options.channel_max),
            idle_time_out: self.options.idle_time_out,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities,
            desired_capabilities: None,
            properties: self.options.properties.clone(),
        };
        self.out.frame(0, FrameBody::Open(open));
        self.open_sent = true;
    }

    fn restart_sessions(&mut self) {
        for (_, session) in self.sessions.iter_mut() {
            if !session.is_ended() {
                session.restart(&mut self.out);
            }
        }
    }

    fn on_incoming_open(&mut self, open: Open) -> Result<(), Error> {
        if !matches!(self.state, ConnectionState::Opening) {
            return Err(Error::Protocol(String::from("Unexpected open")));
        }

        let remote_max = open.max_frame_size().min(self.options.max_frame_size);
        self.remote_max_frame_size = (remote_max as usize).max(MIN_MAX_FRAME_SIZE);
        self.remote_channel_max = open.channel_max();
        self.remote_idle_timeout = open
            .idle_time_out
            .filter(|millis| *millis > 0)
            .map(|millis| Duration::from_millis(millis as u64));

        if self.is_server {
            self.send_open();
        }
        self.state = ConnectionState::Open;
        self.opened_once = true;

        for (_, session) in self.sessions.iter_mut() {
            session.max_frame_size = self.remote_max_frame_size;
            session.epoch = self.epoch;
        }
        if self.is_server {
            self.restart_sessions();
        }

        #[cfg(feature = "tracing")]
        tracing::info!(remote_container_id = %open.container_id, url = ?self.connected_url.as_ref().map(Url::as_str), "Connection opened");
        #[cfg(feature = "log")]
        log::info!("Connection opened remote_container_id={}, url={:?}", open.container_id, self.connected_url.as_ref().map(Url::as_str));

        self.out.event(Event::ConnectionOpen);
        Ok(())
    }

    /// Starts a graceful close. The `close` is sent once every session is idle or the close
    /// timeout has elapsed
    pub fn close(&mut self, error: Option<definitions::Error>) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => return,
            ConnectionState::Unopened | ConnectionState::Failed => {
                self.state = ConnectionState::Closed;
                self.shutdown(SendError::ConnectionClosed);
                self.out.event(Event::ConnectionClose);
                return;
            }
            ConnectionState::Opening | ConnectionState::Open => {}
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(error = ?error, "Connection closing");
        #[cfg(feature = "log")]
        log::debug!("Connection closing error={:?}", error);

        let deadline = Instant::now() + self.options.close_timeout;
        self.state = ConnectionState::Closing;
        self.close_error = error;
        self.drain_deadline = Some(deadline);
        self.try_finish_close();
    }

    /// Sends the `close` of a closing connection once nothing is left to transfer
    pub fn try_finish_close(&mut self) {
        if matches!(self.state, ConnectionState::Closing) && !self.close_sent && self.is_idle() {
            self.send_close();
        }
    }

    /// Sends the `close` regardless of queued deliveries
    pub fn force_close(&mut self) {
        if matches!(self.state, ConnectionState::Closing) && !self.close_sent {
            #[cfg(feature = "tracing")]
            tracing::warn!("Close timeout elapsed with deliveries in flight");
            #[cfg(feature = "log")]
            log::warn!("Close timeout elapsed with deliveries in flight");
            self.send_close();
        }
    }

    fn send_close(&mut self) {
        let error = self.close_error.take();
        self.drain_deadline = None;
        if self.open_sent {
            self.out.frame(0, FrameBody::Close(Close { error }));
            self.close_sent = true;
            // Deadline for the peer's close
            self.drain_deadline = Some(Instant::now() + self.options.close_timeout);
        } else {
            self.state = ConnectionState::Closed;
            self.shutdown(SendError::ConnectionClosed);
            self.out.event(Event::ConnectionClose);
        }
    }

    fn on_incoming_close(&mut self, close: Close) {
        if matches!(self.state, ConnectionState::Opening | ConnectionState::Open) {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection closing by peer");
            #[cfg(feature = "log")]
            log::debug!("Connection closing by peer");
            self.state = ConnectionState::Closing;
        }
        // Nothing drains once the peer has closed
        for (_, session) in self.sessions.iter_mut() {
            session.on_remote_close(&mut self.out);
        }

        if !self.close_sent {
            if !self.open_sent {
                self.send_open();
            }
            self.out.frame(0, FrameBody::Close(Close { error: None }));
            self.close_sent = true;
        }
        self.state = ConnectionState::Closed;
        self.drain_deadline = None;

        #[cfg(feature = "tracing")]
        tracing::info!(error = ?close.error, "Connection closed");
        #[cfg(feature = "log")]
        log::info!("Connection closed error={:?}", close.error);

        let send_error = match &close.error {
            Some(error) => SendError::LinkClosed(Some(error.clone())),
            None => SendError::ConnectionClosed,
        };
        self.shutdown(send_error);
        if let Some(error) = close.error {
            self.out.event(Event::ConnectionError(error));
        }
        self.out.event(Event::ConnectionClose);
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Closes right away after a protocol violation by the peer and fails the connection
    pub fn abort(&mut self, error: Error) {
        if self.open_sent && !self.close_sent {
            let condition = match &error {
                Error::Protocol(_) => definitions::ErrorCondition::FramingError,
                _ => definitions::ErrorCondition::InternalError,
            };
            let amqp_error = definitions::Error::new(condition, error.to_string());
            self.out.frame(0, FrameBody::Close(Close { error: Some(amqp_error) }));
            self.close_sent = true;
        }
        self.fail(error);
    }

    /// Wakes every thread blocked on a sender of this connection
    fn shutdown(&mut self, error: SendError) {
        for (_, session) in self.sessions.iter() {
            session.raise_send_error(&error);
        }
    }

    /// Marks the connection as failed for good. The error is reported once
    pub fn fail(&mut self, error: Error) {
        self.state = ConnectionState::Failed;
        self.drain_deadline = None;
        self.shutdown(SendError::ConnectionFailed(error.to_string()));
        if !self.error_reported {
            self.error_reported = true;

            #[cfg(feature = "tracing")]
            tracing::error!(error = %error, "Connection failed");
            #[cfg(feature = "log")]
            log::error!("Connection failed error={}", error);

            self.out.event(Event::Error(error));
        }
    }

    /// Resets the protocol state after the transport was lost.
    ///
    /// Returns `false` if the connection was closing, in which case it is now closed.
    pub fn on_transport_lost(&mut self) -> bool {
        let was_closing = self.is_closing();
        self.epoch += 1;
        self.out.frames.clear();
        self.remote_channels.clear();
        self.open_sent = false;
        self.close_sent = false;
        self.drain_deadline = None;

        let epoch = self.epoch;
        for (_, session) in self.sessions.iter_mut() {
            session.on_transport_lost(epoch, &mut self.out);
        }
        self.reap_sessions();

        match was_closing {
            true => {
                self.state = ConnectionState::Closed;
                self.shutdown(SendError::ConnectionClosed);
                self.out.event(Event::ConnectionClose);
                false
            }
            false => {
                self.state = ConnectionState::Failed;
                true
            }
        }
    }

    /* ------------------------------ Incoming frames ------------------------------ */

    pub fn on_incoming_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let Frame { channel, body } = frame;

        #[cfg(feature = "tracing")]
        tracing::trace!(channel, frame = ?body, "RECV");
        #[cfg(feature = "log")]
        log::trace!("RECV channel={}, frame={:?}", channel, body);

        match body {
            FrameBody::Open(open) => return self.on_incoming_open(open),
            FrameBody::Close(close) => {
                self.on_incoming_close(close);
                return Ok(());
            }
            FrameBody::Empty => return Ok(()),
            _ => {}
        }

        if !matches!(self.state, ConnectionState::Open | ConnectionState::Closing) {
            return Err(Error::Protocol(format!(
                "Unexpected {} in state {:?}",
                body.name(),
                self.state
            )));
        }

        if let FrameBody::Begin(begin) = body {
            return self.on_incoming_begin(channel, begin);
        }

        let local = *self
            .remote_channels
            .get(&channel)
            .ok_or_else(|| Error::Protocol(format!("{} on unmapped channel {}", body.name(), channel)))?;
        let Self {
            sessions,
            options,
            out,
            ..
        } = self;
        let Some(session) = sessions.get_mut(local as usize) else {
            return Err(Error::Protocol(format!("Unknown channel {}", channel)));
        };

        let result = match body {
            FrameBody::Attach(attach) => {
                session.on_incoming_attach(attach, &options.sender, &options.receiver, out)
            }
            FrameBody::Flow(flow) => session.on_incoming_flow(flow, out),
            FrameBody::Transfer {
                performative,
                payload,
            } => session.on_incoming_transfer(performative, payload, out),
            FrameBody::Disposition(disposition) => {
                session.on_incoming_disposition(disposition, out);
                Ok(())
            }
            FrameBody::Detach(detach) => session.on_incoming_detach(detach, out),
            FrameBody::End(end) => {
                session.on_incoming_end(end, out);
                Ok(())
            }
            FrameBody::Open(_) | FrameBody::Close(_) | FrameBody::Begin(_) | FrameBody::Empty => Ok(()),
        };

        if let Err(err) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(channel = local, error = %err, "Ending session");
            #[cfg(feature = "log")]
            log::warn!("Ending session channel={}, error={}", local, err);
            session.end(err.to_amqp_error(), out);
        }

        self.reap_sessions();
        Ok(())
    }

    fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> Result<(), Error> {
        if self.remote_channels.contains_key(&channel) {
            return Err(Error::Protocol(format!("Channel {} is already in use", channel)));
        }

        let local = match begin.remote_channel {
            Some(local) => {
                if !self.sessions.contains(local as usize) {
                    return Err(Error::Protocol(format!(
                        "Begin refers to unknown channel {}",
                        local
                    )));
                }
                local
            }
            // The peer begins the session
            None => self.allocate_session()?.0,
        };
        self.remote_channels.insert(channel, local);

        if let Some(session) = self.sessions.get_mut(local as usize) {
            session.on_incoming_begin(channel, begin, &mut self.out);
        }
        Ok(())
    }

    fn allocate_session(&mut self) -> Result<SessionId, Error> {
        let channel_max = self.options.channel_max.min(self.remote_channel_max) as usize;
        let entry = self.sessions.vacant_entry();
        if entry.key() > channel_max {
            return Err(Error::ChannelMaxReached);
        }
        let id = SessionId(entry.key() as u16);
        let mut session = Session::new(id, self.options.session.clone(), self.remote_max_frame_size);
        session.epoch = self.epoch;
        entry.insert(session);
        Ok(id)
    }

    /// Drops sessions whose end handshake is complete
    fn reap_sessions(&mut self) {
        let ended: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, session)| matches!(session.state, SessionState::Ended))
            .map(|(key, _)| key)
            .collect();
        for key in ended {
            let session = self.sessions.remove(key);
            if let Some(remote) = session.remote_channel {
                self.remote_channels.remove(&remote);
            }
            if self.default_session == Some(session.id) {
                self.default_session = None;
            }
        }
    }

    /* --------------------------------- Sessions --------------------------------- */

    /// Begins a new session. No session may be begun once the connection is closing
    pub fn begin_session(&mut self) -> Result<SessionId, Error> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) || self.close_sent
        {
            return Err(Error::IllegalState);
        }
        let id = self.allocate_session()?;
        if self.open_sent {
            if let Some(session) = self.sessions.get_mut(id.0 as usize) {
                session.begin(&mut self.out);
            }
        }
        Ok(id)
    }

    pub fn end_session(&mut self, id: SessionId, error: Option<definitions::Error>) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(id.0 as usize)
            .ok_or(Error::Session(session::Error::IllegalState))?;
        session.end(error, &mut self.out);
        self.reap_sessions();
        Ok(())
    }

    fn default_session(&mut self) -> Result<SessionId, Error> {
        if let Some(id) = self.default_session {
            if self.sessions.contains(id.0 as usize) {
                return Ok(id);
            }
        }
        let id = self.begin_session()?;
        self.default_session = Some(id);
        Ok(id)
    }

    fn link_name(&mut self, name: Option<String>) -> String {
        name.unwrap_or_else(|| {
            self.next_link_name += 1;
            format!("{}-link-{}", self.container_id, self.next_link_name)
        })
    }

    /* ---------------------------------- Links ---------------------------------- */

    pub fn open_sender(&mut self, session: Option<SessionId>, options: SenderOptions) -> Result<LinkId, Error> {
        let session = match session {
            Some(session) => session,
            None => self.default_session()?,
        };
        let name = self.link_name(options.name.clone());
        let session = self
            .sessions
            .get_mut(session.0 as usize)
            .ok_or(Error::Session(session::Error::IllegalState))?;
        let id = session.attach_link(|id| Link::sender(id, name, options), &mut self.out)?;
        Ok(id)
    }

    pub fn open_receiver(
        &mut self,
        session: Option<SessionId>,
        options: ReceiverOptions,
    ) -> Result<LinkId, Error> {
        let session = match session {
            Some(session) => session,
            None => self.default_session()?,
        };
        let name = self.link_name(options.name.clone());
        let session = self
            .sessions
            .get_mut(session.0 as usize)
            .ok_or(Error::Session(session::Error::IllegalState))?;
        let id = session.attach_link(|id| Link::receiver(id, name, options), &mut self.out)?;
        Ok(id)
    }

    fn link_mut(&mut self, link: LinkId) -> Result<&mut Link, link::Error> {
        self.sessions
            .get_mut(link.channel as usize)
            .and_then(|session| session.links.get_mut(link.handle as usize))
            .ok_or(link::Error::NotFound)
    }

    fn receiver_mut(&mut self, link: LinkId) -> Result<&mut ReceiverLink, link::Error> {
        let (receiver, _) = self.link_mut(link)?.as_receiver_mut()?;
        Ok(receiver)
    }

    pub fn close_link(&mut self, link: LinkId, error: Option<definitions::Error>) -> Result<(), link::Error> {
        let session = self
            .sessions
            .get_mut(link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.close_link(link.handle, error, &mut self.out)
    }

    /// Credit of a sender left after its queued deliveries, or the credit of a receiver
    pub fn credit(&mut self, link: LinkId) -> Result<u32, link::Error> {
        let link = self.link_mut(link)?;
        let credit = match &link.role {
            LinkRole::Sender(sender) => sender.spare_credit(&link.flow),
            LinkRole::Receiver(_) => link.flow.link_credit,
        };
        Ok(credit)
    }

    pub fn send(&mut self, link: LinkId, payload: Bytes) -> Result<Tracker, link::Error> {
        if self.is_closing() || matches!(self.state, ConnectionState::Failed) && !self.can_reconnect() {
            return Err(link::Error::IllegalState);
        }
        let session = self
            .sessions
            .get_mut(link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.send(link.handle, payload, &mut self.out)
    }

    fn can_reconnect(&self) -> bool {
        self.options.reconnect.is_some() && !self.error_reported
    }

    /// Settles a received delivery. A delivery from a lost transport is stale and is not
    /// settled
    pub fn settle_delivery(&mut self, delivery: &Delivery, outcome: Outcome) -> Result<(), link::Error> {
        if delivery.epoch != self.epoch {
            #[cfg(feature = "tracing")]
            tracing::warn!(link = %delivery.link, delivery_id = delivery.delivery_id, "Stale delivery");
            #[cfg(feature = "log")]
            log::warn!("Stale delivery link={}, delivery_id={}", delivery.link, delivery.delivery_id);
            return Err(link::Error::Stale);
        }
        let session = self
            .sessions
            .get_mut(delivery.link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.settle_delivery(delivery, outcome, &mut self.out)
    }

    pub fn settle_tracker(&mut self, tracker: &Tracker) -> Result<(), link::Error> {
        let session = self
            .sessions
            .get_mut(tracker.link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.settle_tracker(tracker, &mut self.out)
    }

    pub fn add_credit(&mut self, link: LinkId, credit: u32) -> Result<(), link::Error> {
        let session = self
            .sessions
            .get_mut(link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.add_credit(link.handle, credit, &mut self.out)
    }

    pub fn drain(&mut self, link: LinkId) -> Result<(), link::Error> {
        let session = self
            .sessions
            .get_mut(link.channel as usize)
            .ok_or(link::Error::NotFound)?;
        session.drain(link.handle, &mut self.out)
    }

    /// Routes future deliveries of a receiver to a stream instead of `on_message`
    pub fn set_deliveries_sink(
        &mut self,
        link: LinkId,
        sink: mpsc::UnboundedSender<IncomingDelivery>,
    ) -> Result<(), link::Error> {
        self.receiver_mut(link)?.deliveries = Some(sink);
        Ok(())
    }

    pub fn deliveries_sink(&mut self, link: LinkId) -> Option<mpsc::UnboundedSender<IncomingDelivery>> {
        self.receiver_mut(link).ok()?.deliveries.clone()
    }

    pub fn drop_deliveries_sink(&mut self, link: LinkId) {
        if let Ok(receiver) = self.receiver_mut(link) {
            receiver.deliveries = None;
        }
    }

    pub fn auto_accept(&mut self, link: LinkId) -> bool {
        self.receiver_mut(link)
            .map(|receiver| receiver.options.auto_accept)
            .unwrap_or(false)
    }

    /// The gate shared with threads sending on `link`, created on first use
    pub fn sender_gate(&mut self, link: LinkId, work_queue: &WorkQueue) -> Result<Arc<SendGate>, link::Error> {
        let link_ref = self.link_mut(link)?;
        let (sender, flow) = link_ref.as_sender_mut()?;
        let gate = sender
            .gate
            .get_or_insert_with(|| Arc::new(SendGate::new(work_queue.clone(), link)))
            .clone();
        sender.sync_gate(flow);
        Ok(gate)
    }

    /* ---------------------------------- Misc ---------------------------------- */

    /// Completes drains requested by the peer whose drain start has been dispatched
    pub fn complete_pending_drains(&mut self) {
        for (_, session) in self.sessions.iter_mut() {
            session.complete_drains(&mut self.out);
        }
    }

    /// Nothing left to transfer and no outgoing delivery waiting for an outcome
    pub fn is_idle(&self) -> bool {
        self.sessions.iter().all(|(_, session)| session.is_idle())
    }

    #[cfg(test)]
    pub(crate) fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        container::Container,
        context::Context,
        delivery::Outcome,
        frames::amqp::FrameBody,
        handler::Event,
        link::{self, CreditMode, IncomingDelivery, ReceiverOptions, SenderOptions},
        types::message::Message,
        work_queue::WorkQueue,
    };

    use super::{Connection, ConnectionOptions, ConnectionState};

    fn client() -> Connection {
        Connection::new(
            String::from("client"),
            Some(String::from("localhost")),
            ConnectionOptions::default(),
            false,
        )
    }

    fn server() -> Connection {
        Connection::new(String::from("server"), None, ConnectionOptions::default(), true)
    }

    /// Moves frames between both ends until neither has anything left to say
    fn exchange(a: &mut Connection, b: &mut Connection) {
        loop {
            let mut moved = false;
            while let Some(frame) = a.out.frames.pop_front() {
                b.on_incoming_frame(frame).unwrap();
                moved = true;
            }
            while let Some(frame) = b.out.frames.pop_front() {
                a.on_incoming_frame(frame).unwrap();
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn opened_pair() -> (Connection, Connection) {
        let mut client = client();
        let mut server = server();
        client.start(None);
        server.start(None);
        exchange(&mut client, &mut server);
        assert_eq!(client.state, ConnectionState::Open);
        assert_eq!(server.state, ConnectionState::Open);
        (client, server)
    }

    fn messages(connection: &mut Connection) -> Vec<crate::delivery::Delivery> {
        connection
            .out
            .events
            .drain(..)
            .filter_map(|event| match event {
                Event::Message(delivery, _) => Some(delivery),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_handshake_reports_both_ends() {
        let (mut client, mut server) = opened_pair();
        assert!(matches!(client.out.events.pop_front(), Some(Event::ConnectionOpen)));
        assert!(matches!(server.out.events.pop_front(), Some(Event::ConnectionOpen)));
    }

    #[test]
    fn test_messages_flow_to_remote_initiated_receiver() {
        let (mut client, mut server) = opened_pair();
        let link = client
            .open_sender(None, SenderOptions::new().target("queue"))
            .unwrap();
        exchange(&mut client, &mut server);

        for i in 0..3 {
            let payload = Message::from(format!("m{}", i).as_str()).encode().unwrap();
            client.send(link, payload).unwrap();
        }
        exchange(&mut client, &mut server);

        let deliveries = messages(&mut server);
        assert_eq!(deliveries.len(), 3);
        for delivery in &deliveries {
            server.settle_delivery(delivery, Outcome::Accepted).unwrap();
        }
        exchange(&mut client, &mut server);

        let settled = client
            .out
            .events
            .iter()
            .filter(|event| matches!(event, Event::Settled(t) if *t.outcome() == Outcome::Accepted))
            .count();
        assert_eq!(settled, 3);
        assert!(client.is_idle());
    }

    #[test]
    fn test_close_waits_for_outcomes() {
        let (mut client, mut server) = opened_pair();
        let link = client.open_sender(None, SenderOptions::new()).unwrap();
        exchange(&mut client, &mut server);
        client
            .send(link, Message::from("last").encode().unwrap())
            .unwrap();
        exchange(&mut client, &mut server);

        client.close(None);
        assert_eq!(client.state, ConnectionState::Closing);
        assert!(!client
            .out
            .frames
            .iter()
            .any(|frame| matches!(frame.body, FrameBody::Close(_))));
        assert!(matches!(
            client.send(link, Message::from("late").encode().unwrap()),
            Err(link::Error::IllegalState)
        ));

        let delivery = messages(&mut server).pop().unwrap();
        server.settle_delivery(&delivery, Outcome::Accepted).unwrap();
        exchange(&mut client, &mut server);
        client.try_finish_close();
        exchange(&mut client, &mut server);

        assert_eq!(client.state, ConnectionState::Closed);
        assert_eq!(server.state, ConnectionState::Closed);
    }

    #[test]
    fn test_settling_after_transport_lost_is_stale() {
        let (mut client, mut server) = opened_pair();
        client
            .open_receiver(None, ReceiverOptions::new().source("queue"))
            .unwrap();
        exchange(&mut client, &mut server);

        let server_link = server
            .out
            .events
            .iter()
            .find_map(|event| match event {
                Event::LinkOpen(link) => Some(*link),
                _ => None,
            })
            .unwrap();
        server
            .send(server_link, Message::from("m").encode().unwrap())
            .unwrap();
        exchange(&mut client, &mut server);
        let delivery = messages(&mut client).pop().unwrap();

        assert!(client.on_transport_lost());
        assert_eq!(client.state, ConnectionState::Failed);
        assert!(matches!(
            client.settle_delivery(&delivery, Outcome::Accepted),
            Err(link::Error::Stale)
        ));
        assert!(client.out.frames.is_empty());
    }

    #[test]
    fn test_drain_finishes_once_sender_gives_back_credit() {
        let (mut client, mut server) = opened_pair();
        let link = client
            .open_receiver(
                None,
                ReceiverOptions::new()
                    .source("queue")
                    .credit_mode(CreditMode::Manual(3)),
            )
            .unwrap();
        exchange(&mut client, &mut server);

        let server_link = server
            .out
            .events
            .iter()
            .find_map(|event| match event {
                Event::LinkOpen(link) => Some(*link),
                _ => None,
            })
            .unwrap();
        server
            .send(server_link, Message::from("m").encode().unwrap())
            .unwrap();
        exchange(&mut client, &mut server);
        assert_eq!(messages(&mut client).len(), 1);
        assert_eq!(client.credit(link).unwrap(), 2);
        server.out.events.clear();

        client.drain(link).unwrap();
        exchange(&mut client, &mut server);
        assert!(server
            .out
            .events
            .iter()
            .any(|event| matches!(event, Event::SenderDrainStart(l) if *l == server_link)));
        assert!(!client
            .out
            .events
            .iter()
            .any(|event| matches!(event, Event::ReceiverDrainFinish(_))));

        server.complete_pending_drains();
        let drained = server
            .out
            .frames
            .iter()
            .find_map(|frame| match &frame.body {
                FrameBody::Flow(flow) => Some(flow.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(drained.link_credit, Some(0));
        exchange(&mut client, &mut server);

        assert!(client
            .out
            .events
            .iter()
            .any(|event| matches!(event, Event::ReceiverDrainFinish(l) if *l == link)));
        assert_eq!(client.credit(link).unwrap(), 0);
        assert_eq!(server.credit(server_link).unwrap(), 0);
    }

    #[test]
    fn test_deferred_settle_of_stale_delivery_reaches_handler() {
        let (mut client, mut server) = opened_pair();
        let link = client
            .open_receiver(None, ReceiverOptions::new().source("queue"))
            .unwrap();
        exchange(&mut client, &mut server);

        let server_link = server
            .out
            .events
            .iter()
            .find_map(|event| match event {
                Event::LinkOpen(link) => Some(*link),
                _ => None,
            })
            .unwrap();
        server
            .send(server_link, Message::from("m").encode().unwrap())
            .unwrap();
        exchange(&mut client, &mut server);
        let delivery = messages(&mut client).pop().unwrap();
        assert!(client.on_transport_lost());
        client.out.events.clear();

        let (work_queue, mut work_rx) = WorkQueue::new();
        let incoming = IncomingDelivery {
            delivery,
            message: Message::from("m"),
            work_queue: work_queue.clone(),
        };
        incoming.accept().unwrap();

        let container = Container::new().unwrap();
        let handle = container.handle();
        let work = work_rx.try_recv().unwrap();
        let mut ctx = Context {
            connection: &mut client,
            work_queue: &work_queue,
            container: &handle,
        };
        work(&mut ctx);

        assert!(client.out.frames.is_empty());
        assert!(client.out.events.iter().any(|event| matches!(
            event,
            Event::LinkError(errored, link::Error::Stale) if *errored == link
        )));
    }

    #[test]
    fn test_remote_close_settles_in_flight_as_unknown() {
        let (mut client, mut server) = opened_pair();
        let link = client.open_sender(None, SenderOptions::new()).unwrap();
        exchange(&mut client, &mut server);
        let in_flight = client
            .send(link, Message::from("m").encode().unwrap())
            .unwrap();
        exchange(&mut client, &mut server);
        client.out.events.clear();

        server.close(None);
        exchange(&mut client, &mut server);

        assert_eq!(client.state, ConnectionState::Closed);
        assert_eq!(server.state, ConnectionState::Closed);
        let events: Vec<_> = client.out.events.drain(..).collect();
        let settled = events.iter().position(|event| {
            matches!(event, Event::Settled(t) if t.tag == in_flight.tag && *t.outcome() == Outcome::Unknown)
        });
        let closed = events
            .iter()
            .position(|event| matches!(event, Event::ConnectionClose));
        assert!(settled.unwrap() < closed.unwrap());
        assert!(client.is_idle());
    }

    #[test]
    fn test_no_session_while_closing() {
        let (mut client, _server) = opened_pair();
        client.close(None);
        assert!(matches!(client.begin_session(), Err(super::Error::IllegalState)));
    }
}
