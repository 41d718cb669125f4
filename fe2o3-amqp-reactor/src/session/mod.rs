//! Session endpoint: multiplexes links over one channel and enforces the session windows

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use slab::Slab;

use crate::{
    delivery::{Delivery, Outcome, Tracker},
    endpoint::Outbox,
    frames::amqp::{split_transfer, FrameBody},
    handler::Event,
    link::{
        self,
        sender::DispositionUpdate,
        state::LinkState,
        Link, LinkId, LinkRole, ReceiverOptions, SenderOptions,
    },
    thread_safe::SendError,
    types::{
        definitions::{self, DeliveryNumber, Handle, Role, SenderSettleMode, TransferNumber},
        performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
    },
};

pub mod error;

pub use error::Error;

/// Default incoming and outgoing window, counted in transfer frames
pub const DEFAULT_WINDOW: u32 = 2048;

/// Identifies a session within a connection by its local channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u16);

impl SessionId {
    pub fn channel(&self) -> u16 {
        self.0
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No begin has been exchanged on the current transport
    Unmapped,

    /// A begin has been sent
    BeginSent,

    /// Both begins have been exchanged
    Mapped,

    /// An end has been sent
    EndSent,

    /// An end has been received
    EndReceived,

    /// Both ends have been exchanged
    Ended,
}

/// Options of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Handle,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: Handle::MAX,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub remote_channel: Option<u16>,
    options: SessionOptions,

    // session flow control
    next_outgoing_id: TransferNumber,
    incoming_window: u32,
    next_incoming_id: TransferNumber,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,

    next_delivery_id: DeliveryNumber,
    pub links: Slab<Link>,
    remote_handles: BTreeMap<Handle, Handle>,
    outgoing_deliveries: BTreeMap<DeliveryNumber, Handle>,
    incoming_deliveries: BTreeMap<DeliveryNumber, Handle>,
    pending_transfers: VecDeque<(Transfer, Bytes)>,

    pub max_frame_size: usize,
    pub epoch: u64,
}

impl Session {
    pub fn new(id: SessionId, options: SessionOptions, max_frame_size: usize) -> Self {
        Self {
            id,
            state: SessionState::Unmapped,
            remote_channel: None,
            incoming_window: options.incoming_window,
            options,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            next_delivery_id: 0,
            links: Slab::new(),
            remote_handles: BTreeMap::new(),
            outgoing_deliveries: BTreeMap::new(),
            incoming_deliveries: BTreeMap::new(),
            pending_transfers: VecDeque::new(),
            max_frame_size,
            epoch: 0,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.state, SessionState::Mapped)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.state, SessionState::Ended)
    }

    fn channel(&self) -> u16 {
        self.id.0
    }

    fn local_begin(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.options.outgoing_window,
            handle_max: Some(self.options.handle_max),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    /// Sends a begin, either initiating the session or replying to the peer's begin
    pub fn begin(&mut self, out: &mut Outbox) {
        self.incoming_window = self.options.incoming_window;
        out.frame(self.channel(), FrameBody::Begin(self.local_begin()));
        if let SessionState::Unmapped = self.state {
            self.state = SessionState::BeginSent;
        }
    }

    /// Begins the session and attaches every link again on a new transport
    pub fn restart(&mut self, out: &mut Outbox) {
        self.begin(out);
        for (_, link) in self.links.iter_mut() {
            let attach = link.attach();
            out.frame(self.id.0, FrameBody::Attach(attach));
        }
    }

    pub fn on_incoming_begin(&mut self, remote_channel: u16, begin: Begin, out: &mut Outbox) {
        self.remote_channel = Some(remote_channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;

        match self.state {
            SessionState::BeginSent => self.state = SessionState::Mapped,
            SessionState::Unmapped => {
                self.begin(out);
                self.state = SessionState::Mapped;
            }
            _ => return,
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = self.channel(), remote_channel, "Session mapped");
        #[cfg(feature = "log")]
        log::debug!("Session mapped channel={}, remote_channel={}", self.channel(), remote_channel);

        out.event(Event::SessionOpen(self.id));
    }

    /// Ends the session. Calling it again once an end was sent has no effect
    pub fn end(&mut self, error: Option<definitions::Error>, out: &mut Outbox) {
        match self.state {
            SessionState::EndSent | SessionState::Ended => return,
            SessionState::Unmapped => {
                self.state = SessionState::Ended;
                self.close_all_links(None, out);
                out.event(Event::SessionClose(self.id, error));
                return;
            }
            SessionState::EndReceived => self.state = SessionState::Ended,
            SessionState::BeginSent | SessionState::Mapped => self.state = SessionState::EndSent,
        }
        out.frame(self.channel(), FrameBody::End(End { error }));
    }

    pub fn on_incoming_end(&mut self, end: End, out: &mut Outbox) {
        match self.state {
            SessionState::EndSent => self.state = SessionState::Ended,
            SessionState::Ended | SessionState::EndReceived => return,
            _ => {
                self.state = SessionState::EndReceived;
                self.end(None, out);
            }
        }
        self.close_all_links(end.error.clone(), out);
        out.event(Event::SessionClose(self.id, end.error));
    }

    /* --------------------------------- Links --------------------------------- */

    /// Adds a link created locally. The attach is sent right away if the session has been
    /// begun on the current transport
    pub fn attach_link(
        &mut self,
        create: impl FnOnce(LinkId) -> Link,
        out: &mut Outbox,
    ) -> Result<LinkId, Error> {
        let entry = self.links.vacant_entry();
        let handle = entry.key() as Handle;
        if handle > self.options.handle_max {
            return Err(Error::HandleMaxReached);
        }
        let id = LinkId {
            channel: self.id.0,
            handle,
        };
        let link = entry.insert(create(id));

        if matches!(self.state, SessionState::BeginSent | SessionState::Mapped) {
            let attach = link.attach();
            out.frame(self.id.0, FrameBody::Attach(attach));
        }
        Ok(id)
    }

    fn find_link(&self, name: &str, local_role: Role) -> Option<Handle> {
        self.links
            .iter()
            .find(|(_, link)| link.name == name && link.role() == local_role)
            .map(|(key, _)| key as Handle)
    }

    fn link_by_remote_handle(&mut self, remote: Handle) -> Result<&mut Link, Error> {
        let local = *self
            .remote_handles
            .get(&remote)
            .ok_or(Error::UnattachedHandle(remote))?;
        self.links
            .get_mut(local as usize)
            .ok_or(Error::UnattachedHandle(remote))
    }

    pub fn on_incoming_attach(
        &mut self,
        attach: Attach,
        sender_defaults: &SenderOptions,
        receiver_defaults: &ReceiverOptions,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if self.remote_handles.contains_key(&attach.handle) {
            return Err(Error::HandleInUse(attach.handle));
        }

        let local_role = attach.role.reverse();
        let handle = match self.find_link(&attach.name, local_role) {
            Some(handle) => handle,
            None => {
                // The peer initiates the link
                let entry = self.links.vacant_entry();
                let handle = entry.key() as Handle;
                let id = LinkId {
                    channel: self.id.0,
                    handle,
                };
                let link = Link::from_remote_attach(
                    id,
                    &attach,
                    sender_defaults.clone(),
                    receiver_defaults.clone(),
                );
                entry.insert(link);
                handle
            }
        };
        self.remote_handles.insert(attach.handle, handle);

        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(Error::UnattachedHandle(attach.handle))?;
        if let LinkState::Unattached = link.state {
            let reply = link.attach();
            out.frame(self.id.0, FrameBody::Attach(reply));
        }

        match link.on_incoming_attach(&attach) {
            Ok(()) => {}
            Err(_err) => {
                // A refused link is closed by the detach that follows
                #[cfg(feature = "tracing")]
                tracing::debug!(link = %link.id, error = %_err, "Attach refused");
                #[cfg(feature = "log")]
                log::debug!("Attach refused link={}, error={}", link.id, _err);
                return Ok(());
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(link = %link.id, name = %link.name, "Link attached");
        #[cfg(feature = "log")]
        log::debug!("Link attached link={}, name={}", link.id, link.name);

        let id = link.id;
        out.event(Event::LinkOpen(id));
        match link.role() {
            Role::Receiver => self.send_link_flow(handle, false, out),
            Role::Sender => self.pump(handle, out),
        }
        Ok(())
    }

    pub fn on_incoming_detach(&mut self, detach: Detach, out: &mut Outbox) -> Result<(), Error> {
        let local = self
            .remote_handles
            .remove(&detach.handle)
            .ok_or(Error::UnattachedHandle(detach.handle))?;
        let Some(link) = self.links.get_mut(local as usize) else {
            return Err(Error::UnattachedHandle(detach.handle));
        };

        match link.state {
            LinkState::CloseSent => link.state = LinkState::Closed,
            _ => {
                link.state = LinkState::CloseReceived;
                let reply = link.detach(None);
                out.frame(self.id.0, FrameBody::Detach(reply));
            }
        }
        self.remove_link(local, detach.error, out);
        Ok(())
    }

    /// Sends a closing detach. The link is removed once the peer's detach arrives
    pub fn close_link(
        &mut self,
        handle: Handle,
        error: Option<definitions::Error>,
        out: &mut Outbox,
    ) -> Result<(), link::Error> {
        let mapped = self.is_mapped();
        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(link::Error::NotFound)?;
        match link.state {
            LinkState::CloseSent | LinkState::Closed => return Ok(()),
            LinkState::Unattached => {
                self.remove_link(handle, error, out);
                return Ok(());
            }
            _ => {}
        }

        let detach = link.detach(error);
        if mapped {
            out.frame(self.id.0, FrameBody::Detach(detach));
        }
        Ok(())
    }

    fn remove_link(&mut self, handle: Handle, error: Option<definitions::Error>, out: &mut Outbox) {
        if !self.links.contains(handle as usize) {
            return;
        }
        let link = self.links.remove(handle as usize);
        self.outgoing_deliveries.retain(|_, h| *h != handle);
        self.incoming_deliveries.retain(|_, h| *h != handle);
        self.remote_handles.retain(|_, local| *local != handle);
        self.pending_transfers.retain(|(transfer, _)| transfer.handle != handle);

        if let LinkRole::Sender(sender) = &link.role {
            if let Some(gate) = &sender.gate {
                gate.raise_error(SendError::LinkClosed(error.clone()));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(link = %link.id, error = ?error, "Link closed");
        #[cfg(feature = "log")]
        log::debug!("Link closed link={}, error={:?}", link.id, error);

        // Dropping the link also drops the sending half of its deliveries stream
        out.event(Event::LinkClose(link.id, error));
    }

    fn close_all_links(&mut self, error: Option<definitions::Error>, out: &mut Outbox) {
        let handles: Vec<Handle> = self.links.iter().map(|(key, _)| key as Handle).collect();
        for handle in handles {
            self.remove_link(handle, error.clone(), out);
        }
    }

    /* ------------------------------ Flow control ------------------------------ */

    fn session_flow(&mut self) -> Flow {
        // Every outgoing flow refreshes the incoming window
        self.incoming_window = self.options.incoming_window;
        Flow {
            next_incoming_id: self.remote_channel.map(|_| self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.options.outgoing_window,
            handle: None,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }
    }

    fn send_session_flow(&mut self, out: &mut Outbox) {
        let flow = self.session_flow();
        out.frame(self.id.0, FrameBody::Flow(flow));
    }

    fn send_link_flow(&mut self, handle: Handle, echo: bool, out: &mut Outbox) {
        if !self.is_mapped() {
            return;
        }
        let mut flow = self.session_flow();
        let Some(link) = self.links.get(handle as usize) else {
            return;
        };
        if !link.is_open() {
            return;
        }
        let link_flow = link.flow.as_link_flow(handle, echo);
        flow.handle = Some(link_flow.handle);
        flow.delivery_count = Some(link_flow.delivery_count);
        flow.link_credit = Some(link_flow.link_credit);
        flow.available = Some(link_flow.available);
        flow.drain = link_flow.drain;
        flow.echo = link_flow.echo;
        out.frame(self.id.0, FrameBody::Flow(flow));
    }

    pub fn on_incoming_flow(&mut self, flow: Flow, out: &mut Outbox) -> Result<(), Error> {
        // remote-incoming-window := next-incoming-id(flow) + incoming-window(flow) - next-outgoing-id(endpoint)
        let next_incoming_id = flow.next_incoming_id.unwrap_or(0);
        self.remote_incoming_window = next_incoming_id
            .wrapping_add(flow.incoming_window)
            .wrapping_sub(self.next_outgoing_id);
        if self.remote_incoming_window > flow.incoming_window {
            self.remote_incoming_window = 0;
        }
        self.remote_outgoing_window = flow.outgoing_window;

        let Some(remote_handle) = flow.handle else {
            if flow.echo {
                self.send_session_flow(out);
            }
            self.flush_transfers(out);
            return Ok(());
        };

        let link = self.link_by_remote_handle(remote_handle)?;
        let handle = link.id.handle;
        let id = link.id;
        let echo = match &mut link.role {
            LinkRole::Sender(sender) => {
                let echo = link.flow.on_incoming_flow_as_sender(&flow);
                if flow.drain && !sender.drain_started {
                    sender.drain_started = true;
                    out.event(Event::SenderDrainStart(id));
                }
                echo
            }
            LinkRole::Receiver(receiver) => {
                let echo = link.flow.on_incoming_flow_as_receiver(&flow);
                if receiver.draining && link.flow.link_credit == 0 {
                    receiver.draining = false;
                    link.flow.drain = false;
                    out.event(Event::ReceiverDrainFinish(id));
                }
                echo
            }
        };

        if echo {
            self.send_link_flow(handle, false, out);
        }
        self.pump(handle, out);
        self.flush_transfers(out);
        Ok(())
    }

    /// Grants additional credit to a receiver
    pub fn add_credit(&mut self, handle: Handle, credit: u32, out: &mut Outbox) -> Result<(), link::Error> {
        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(link::Error::NotFound)?;
        let (_, flow) = link.as_receiver_mut()?;
        flow.link_credit = flow.link_credit.saturating_add(credit);
        self.send_link_flow(handle, false, out);
        Ok(())
    }

    /// Asks the sender to use up or give back all outstanding credit
    pub fn drain(&mut self, handle: Handle, out: &mut Outbox) -> Result<(), link::Error> {
        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(link::Error::NotFound)?;
        let id = link.id;
        let (receiver, flow) = link.as_receiver_mut()?;
        if flow.link_credit == 0 {
            out.event(Event::ReceiverDrainFinish(id));
            return Ok(());
        }
        receiver.draining = true;
        flow.drain = true;
        self.send_link_flow(handle, false, out);
        Ok(())
    }

    /// Completes a drain requested by the peer once every queued delivery has been sent.
    /// Runs after the drain start has been dispatched to the handler
    pub fn complete_drains(&mut self, out: &mut Outbox) {
        let mut drained = Vec::new();
        for (key, link) in self.links.iter_mut() {
            if !link.is_open() {
                continue;
            }
            if let LinkRole::Sender(sender) = &mut link.role {
                if link.flow.drain && sender.drain_started && sender.queue.is_empty() {
                    sender.drain_started = false;
                    link.flow.drain_credit();
                    sender.sync_gate(&link.flow);
                    drained.push(key as Handle);
                }
            }
        }
        for handle in drained {
            self.send_link_flow(handle, false, out);
        }
    }

    /* -------------------------------- Transfers -------------------------------- */

    /// Queues a message on a sender and transfers it if there is credit
    pub fn send(&mut self, handle: Handle, payload: Bytes, out: &mut Outbox) -> Result<Tracker, link::Error> {
        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(link::Error::NotFound)?;
        if matches!(
            link.state,
            LinkState::CloseSent | LinkState::CloseReceived | LinkState::Closed
        ) {
            return Err(link::Error::Detached(None));
        }
        if let Some(max) = link.max_message_size {
            if payload.len() as u64 > max {
                return Err(link::Error::MessageCodec(format!(
                    "Message size {} exceeds the link's max message size {}",
                    payload.len(),
                    max
                )));
            }
        }
        let id = link.id;
        let settled = matches!(link.snd_settle_mode, SenderSettleMode::Settled);
        let (sender, flow) = link.as_sender_mut()?;
        let tracker = sender.enqueue(id, payload, settled);
        sender.sync_gate(flow);

        self.pump(handle, out);
        Ok(tracker)
    }

    /// Moves queued deliveries of a sender into transfer frames as far as credit allows
    fn pump(&mut self, handle: Handle, out: &mut Outbox) {
        if !self.is_mapped() {
            return;
        }
        let Some(link) = self.links.get_mut(handle as usize) else {
            return;
        };
        if !link.is_open() {
            return;
        }
        let id = link.id;
        let Ok((sender, flow)) = link.as_sender_mut() else {
            return;
        };

        while flow.link_credit > 0 {
            let Some(head) = sender.queue.front() else {
                break;
            };
            let delivery_id = self.next_delivery_id;
            let transfer = Transfer {
                handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(head.tracker.tag.clone()),
                message_format: Some(0),
                settled: Some(head.settled),
                more: false,
                rcv_settle_mode: None,
                state: None,
                resume: false,
                aborted: false,
                batchable: false,
            };
            let frames = match split_transfer(transfer, head.payload.clone(), self.max_frame_size) {
                Ok(frames) => frames,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(link = %id, error = %_err, "Failed to encode transfer");
                    #[cfg(feature = "log")]
                    log::error!("Failed to encode transfer link={}, error={}", id, _err);
                    if let Some(tracker) = sender.discard_head() {
                        out.event(Event::Settled(tracker));
                    }
                    continue;
                }
            };
            let Some(outgoing) = sender.next_sendable(flow) else {
                break;
            };
            self.next_delivery_id = self.next_delivery_id.wrapping_add(1);
            self.pending_transfers.extend(frames);

            if !outgoing.settled {
                self.outgoing_deliveries.insert(delivery_id, handle);
            }
            if let Some(tracker) = sender.on_transferred(delivery_id, outgoing) {
                out.event(Event::Settled(tracker));
            }
        }
        sender.sync_gate(flow);

        let spare = sender.spare_credit(flow);
        if spare > 0 {
            out.event(Event::Sendable(id, spare));
        }
        self.flush_transfers(out);
    }

    /// Emits pending transfer frames while the peer's incoming window allows
    fn flush_transfers(&mut self, out: &mut Outbox) {
        while self.remote_incoming_window > 0 {
            let Some((performative, payload)) = self.pending_transfers.pop_front() else {
                break;
            };
            out.frame(
                self.id.0,
                FrameBody::Transfer {
                    performative,
                    payload,
                },
            );
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window -= 1;
        }
    }

    pub fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Bytes,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if self.incoming_window == 0 {
            return Err(Error::WindowViolation);
        }
        self.incoming_window -= 1;
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);

        let epoch = self.epoch;
        let link = self.link_by_remote_handle(transfer.handle)?;
        let id = link.id;
        let result = match link.as_receiver_mut() {
            Ok((receiver, flow)) => receiver.on_incoming_transfer(id, epoch, flow, transfer, payload),
            Err(err) => Err(err),
        };

        match result {
            Ok(Some((delivery, message))) => {
                if !delivery.settled {
                    self.incoming_deliveries.insert(delivery.delivery_id, id.handle);
                }
                out.event(Event::Message(delivery, message));
                self.replenish(id.handle, out);
            }
            Ok(None) => {}
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(link = %id, error = %err, "Closing link");
                #[cfg(feature = "log")]
                log::warn!("Closing link={}, error={}", id, err);
                let error = err.to_amqp_error();
                let _ = self.close_link(id.handle, error, out);
            }
        }

        if self.incoming_window <= self.options.incoming_window / 2 {
            self.send_session_flow(out);
        }
        Ok(())
    }

    fn replenish(&mut self, handle: Handle, out: &mut Outbox) {
        let Some(link) = self.links.get_mut(handle as usize) else {
            return;
        };
        let Ok((receiver, flow)) = link.as_receiver_mut() else {
            return;
        };
        if receiver.replenish(flow) {
            self.send_link_flow(handle, false, out);
        }
    }

    /* -------------------------------- Settlement -------------------------------- */

    /// Settles an incoming delivery with the given outcome. Settling twice has no effect
    pub fn settle_delivery(
        &mut self,
        delivery: &Delivery,
        outcome: Outcome,
        out: &mut Outbox,
    ) -> Result<(), link::Error> {
        let handle = delivery.link.handle;
        let mapped = self.is_mapped();
        let link = self
            .links
            .get_mut(handle as usize)
            .ok_or(link::Error::NotFound)?;
        let (receiver, _) = link.as_receiver_mut()?;
        if !receiver.settle(delivery.delivery_id) {
            return Ok(());
        }
        self.incoming_deliveries.remove(&delivery.delivery_id);

        if mapped {
            let disposition = Disposition {
                role: Role::Receiver,
                first: delivery.delivery_id,
                last: None,
                settled: true,
                state: outcome.into_state(),
                batchable: false,
            };
            out.frame(self.id.0, FrameBody::Disposition(disposition));
        }
        self.replenish(handle, out);
        Ok(())
    }

    /// Settles an outgoing delivery whose sender does not settle automatically
    pub fn settle_tracker(&mut self, tracker: &Tracker, out: &mut Outbox) -> Result<(), link::Error> {
        let Some(delivery_id) = tracker.delivery_id else {
            return Err(link::Error::IllegalState);
        };
        let link = self
            .links
            .get_mut(tracker.link.handle as usize)
            .ok_or(link::Error::NotFound)?;
        let (sender, _) = link.as_sender_mut()?;
        let Some(settled) = sender.settle(delivery_id) else {
            return Ok(());
        };
        self.outgoing_deliveries.remove(&delivery_id);
        self.send_sender_disposition(delivery_id, None, out);
        out.event(Event::Settled(settled));
        Ok(())
    }

    fn send_sender_disposition(
        &mut self,
        delivery_id: DeliveryNumber,
        state: Option<crate::types::messaging::DeliveryState>,
        out: &mut Outbox,
    ) {
        if !self.is_mapped() {
            return;
        }
        let disposition = Disposition {
            role: Role::Sender,
            first: delivery_id,
            last: None,
            settled: true,
            state,
            batchable: false,
        };
        out.frame(self.id.0, FrameBody::Disposition(disposition));
    }

    pub fn on_incoming_disposition(&mut self, disposition: Disposition, out: &mut Outbox) {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first).max(first);

        match disposition.role {
            // Outcomes of our outgoing deliveries
            Role::Receiver => {
                let ids: Vec<(DeliveryNumber, Handle)> = self
                    .outgoing_deliveries
                    .range(first..=last)
                    .map(|(id, handle)| (*id, *handle))
                    .collect();
                for (delivery_id, handle) in ids {
                    let Some(link) = self.links.get_mut(handle as usize) else {
                        continue;
                    };
                    let Ok((sender, _)) = link.as_sender_mut() else {
                        continue;
                    };
                    let update = sender.on_disposition(
                        delivery_id,
                        disposition.settled,
                        disposition.state.as_ref(),
                    );
                    match update {
                        Some(DispositionUpdate::Settled {
                            tracker,
                            settle_locally,
                        }) => {
                            self.outgoing_deliveries.remove(&delivery_id);
                            if settle_locally {
                                let state = tracker.outcome.clone().into_state();
                                self.send_sender_disposition(delivery_id, state, out);
                            }
                            out.event(Event::Settled(tracker));
                        }
                        Some(DispositionUpdate::Updated(tracker)) => {
                            out.event(Event::TrackerUpdate(tracker))
                        }
                        None => {}
                    }
                }
            }
            // The peer settled deliveries we received
            Role::Sender => {
                if !disposition.settled {
                    return;
                }
                let ids: Vec<(DeliveryNumber, Handle)> = self
                    .incoming_deliveries
                    .range(first..=last)
                    .map(|(id, handle)| (*id, *handle))
                    .collect();
                for (delivery_id, handle) in ids {
                    self.incoming_deliveries.remove(&delivery_id);
                    if let Some(link) = self.links.get_mut(handle as usize) {
                        if let Ok((receiver, _)) = link.as_receiver_mut() {
                            receiver.settle(delivery_id);
                        }
                    }
                    self.replenish(handle, out);
                }
            }
        }
    }

    /* --------------------------------- Failover --------------------------------- */

    /// Resets the session after its transport was lost. Links that were open stay in
    /// place to be attached again; transferred but unsettled deliveries get the `Unknown`
    /// outcome.
    pub fn on_transport_lost(&mut self, epoch: u64, out: &mut Outbox) {
        self.epoch = epoch;
        self.remote_channel = None;
        self.remote_handles.clear();
        self.outgoing_deliveries.clear();
        self.incoming_deliveries.clear();
        self.pending_transfers.clear();
        self.remote_incoming_window = 0;
        self.remote_outgoing_window = 0;
        self.incoming_window = self.options.incoming_window;

        let closing: Vec<Handle> = self
            .links
            .iter()
            .filter(|(_, link)| {
                matches!(
                    link.state,
                    LinkState::CloseSent | LinkState::CloseReceived | LinkState::Closed
                )
            })
            .map(|(key, _)| key as Handle)
            .collect();
        for handle in closing {
            self.remove_link(handle, None, out);
        }

        for (_, link) in self.links.iter_mut() {
            link.state = LinkState::Unattached;
            link.remote_handle = None;
            match &mut link.role {
                LinkRole::Sender(sender) => {
                    for tracker in sender.on_transport_lost() {
                        out.event(Event::Settled(tracker));
                    }
                    sender.drain_started = false;
                    link.flow.link_credit = 0;
                    link.flow.drain = false;
                    sender.sync_gate(&link.flow);
                }
                LinkRole::Receiver(receiver) => receiver.on_transport_lost(&mut link.flow),
            }
        }

        match self.state {
            SessionState::EndSent | SessionState::EndReceived | SessionState::Ended => {
                if self.state != SessionState::Ended {
                    self.state = SessionState::Ended;
                    out.event(Event::SessionClose(self.id, None));
                }
            }
            _ => self.state = SessionState::Unmapped,
        }
    }

    /// The peer closed the connection. Outgoing deliveries waiting for an outcome will not get
    /// one and are settled as `Unknown`
    pub fn on_remote_close(&mut self, out: &mut Outbox) {
        self.outgoing_deliveries.clear();
        self.pending_transfers.clear();
        for (_, link) in self.links.iter_mut() {
            if let LinkRole::Sender(sender) = &mut link.role {
                for tracker in sender.on_transport_lost() {
                    out.event(Event::Settled(tracker));
                }
            }
        }
    }

    /// Nothing left to transfer and no outgoing delivery waiting for an outcome
    pub fn is_idle(&self) -> bool {
        self.pending_transfers.is_empty()
            && self.links.iter().all(|(_, link)| match &link.role {
                LinkRole::Sender(sender) => !link.is_open() || sender.is_idle(),
                LinkRole::Receiver(_) => true,
            })
    }

    /// Fails every thread waiting to send on this session
    pub fn raise_send_error(&self, error: &SendError) {
        for (_, link) in self.links.iter() {
            if let LinkRole::Sender(sender) = &link.role {
                if let Some(gate) = &sender.gate {
                    gate.raise_error(error.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::primitives::Binary;

    use crate::{
        delivery::Outcome,
        endpoint::Outbox,
        frames::amqp::FrameBody,
        handler::Event,
        link::{Link, ReceiverOptions, SenderOptions},
        types::{
            definitions::Role,
            message::Message,
            messaging::{Accepted, DeliveryState, Source, Target},
            performatives::{Attach, Begin, Disposition, Flow, Transfer},
        },
    };

    use super::{Error, Session, SessionId, SessionOptions, SessionState};

    fn mapped_session(options: SessionOptions) -> (Session, Outbox) {
        let mut out = Outbox::default();
        let mut session = Session::new(SessionId(0), options, 65536);
        session.begin(&mut out);
        session.on_incoming_begin(
            0,
            Begin {
                remote_channel: Some(0),
                next_outgoing_id: 0,
                incoming_window: 2048,
                outgoing_window: 2048,
                handle_max: None,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            },
            &mut out,
        );
        assert_eq!(session.state, SessionState::Mapped);
        (session, out)
    }

    fn remote_attach(name: &str, role: Role, handle: u32) -> Attach {
        Attach {
            name: String::from(name),
            handle,
            role,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: Some(Box::new(Source::default())),
            target: Some(Box::new(Target::default())),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    fn credit_flow(handle: u32, delivery_count: u32, link_credit: u32, next_incoming_id: u32) -> Flow {
        Flow {
            next_incoming_id: Some(next_incoming_id),
            incoming_window: 2048,
            next_outgoing_id: 0,
            outgoing_window: 2048,
            handle: Some(handle),
            delivery_count: Some(delivery_count),
            link_credit: Some(link_credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }
    }

    fn transfer(delivery_id: u32) -> Transfer {
        Transfer {
            handle: 9,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(Binary::from(delivery_id.to_be_bytes().to_vec())),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    fn count_transfers(out: &Outbox) -> usize {
        out.frames
            .iter()
            .filter(|frame| matches!(frame.body, FrameBody::Transfer { .. }))
            .count()
    }

    #[test]
    fn test_sender_waits_for_credit() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        let id = session
            .attach_link(
                |id| Link::sender(id, String::from("sender"), SenderOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("sender", Role::Receiver, 3),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();

        for _ in 0..3 {
            session
                .send(id.handle, Message::from("m").encode().unwrap(), &mut out)
                .unwrap();
        }
        assert_eq!(count_transfers(&out), 0);

        session
            .on_incoming_flow(credit_flow(3, 0, 2, 0), &mut out)
            .unwrap();
        assert_eq!(count_transfers(&out), 2);

        session
            .on_incoming_flow(credit_flow(3, 2, 2, 2), &mut out)
            .unwrap();
        assert_eq!(count_transfers(&out), 3);
        assert!(out
            .events
            .iter()
            .any(|event| matches!(event, Event::Sendable(_, 1))));
    }

    #[test]
    fn test_untransferable_delivery_settles_unknown_without_consuming_credit() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        let id = session
            .attach_link(
                |id| Link::sender(id, String::from("sender"), SenderOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("sender", Role::Receiver, 3),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_flow(credit_flow(3, 0, 5, 0), &mut out)
            .unwrap();
        out.events.clear();

        // Too small for even the transfer performative
        session.max_frame_size = 16;
        let lost = session
            .send(id.handle, Message::from("m").encode().unwrap(), &mut out)
            .unwrap();
        assert_eq!(count_transfers(&out), 0);
        assert!(out.events.iter().any(|event| matches!(
            event,
            Event::Settled(tracker) if tracker.tag == lost.tag && tracker.outcome == Outcome::Unknown
        )));
        assert!(out
            .events
            .iter()
            .any(|event| matches!(event, Event::Sendable(_, 5))));

        session.max_frame_size = 65536;
        session
            .send(id.handle, Message::from("m").encode().unwrap(), &mut out)
            .unwrap();
        let delivery_ids: Vec<_> = out
            .frames
            .iter()
            .filter_map(|frame| match &frame.body {
                FrameBody::Transfer { performative, .. } => performative.delivery_id,
                _ => None,
            })
            .collect();
        assert_eq!(delivery_ids, vec![0]);
    }

    #[test]
    fn test_outgoing_transfers_bounded_by_remote_window() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        let id = session
            .attach_link(
                |id| Link::sender(id, String::from("sender"), SenderOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("sender", Role::Receiver, 0),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();

        let mut flow = credit_flow(0, 0, 10, 0);
        flow.incoming_window = 1;
        session.on_incoming_flow(flow, &mut out).unwrap();
        for _ in 0..3 {
            session
                .send(id.handle, Message::from("m").encode().unwrap(), &mut out)
                .unwrap();
        }
        assert_eq!(count_transfers(&out), 1);

        let mut flow = credit_flow(0, 0, 10, 1);
        flow.incoming_window = 5;
        session.on_incoming_flow(flow, &mut out).unwrap();
        assert_eq!(count_transfers(&out), 3);
    }

    #[test]
    fn test_incoming_window_violation() {
        let options = SessionOptions {
            incoming_window: 1,
            ..Default::default()
        };
        let (mut session, mut out) = mapped_session(options);
        session
            .attach_link(
                |id| Link::receiver(id, String::from("receiver"), ReceiverOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("receiver", Role::Sender, 9),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();

        // The receiver's credit flow refreshed the window to 1
        session.incoming_window = 0;
        let payload = Message::from("m").encode().unwrap();
        let result = session.on_incoming_transfer(transfer(0), payload, &mut out);
        assert!(matches!(result, Err(Error::WindowViolation)));
    }

    #[test]
    fn test_duplicate_disposition_settles_once() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        let id = session
            .attach_link(
                |id| Link::sender(id, String::from("sender"), SenderOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("sender", Role::Receiver, 0),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_flow(credit_flow(0, 0, 1, 0), &mut out)
            .unwrap();
        session
            .send(id.handle, Message::from("m").encode().unwrap(), &mut out)
            .unwrap();

        let disposition = Disposition {
            role: Role::Receiver,
            first: 0,
            last: None,
            settled: true,
            state: Some(DeliveryState::Accepted(Accepted {})),
            batchable: false,
        };
        out.events.clear();
        session.on_incoming_disposition(disposition.clone(), &mut out);
        session.on_incoming_disposition(disposition, &mut out);
        let settled = out
            .events
            .iter()
            .filter(|event| matches!(event, Event::Settled(_)))
            .count();
        assert_eq!(settled, 1);
        assert!(session.is_idle());
    }

    #[test]
    fn test_end_is_idempotent() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        out.frames.clear();
        session.end(None, &mut out);
        session.end(None, &mut out);
        assert_eq!(out.frames.len(), 1);
        assert_eq!(session.state, SessionState::EndSent);
    }

    #[test]
    fn test_transport_lost_reports_unknown_and_keeps_queue() {
        let (mut session, mut out) = mapped_session(SessionOptions::default());
        let id = session
            .attach_link(
                |id| Link::sender(id, String::from("sender"), SenderOptions::new()),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_attach(
                remote_attach("sender", Role::Receiver, 0),
                &SenderOptions::default(),
                &ReceiverOptions::default(),
                &mut out,
            )
            .unwrap();
        session
            .on_incoming_flow(credit_flow(0, 0, 1, 0), &mut out)
            .unwrap();
        session
            .send(id.handle, Message::from("sent").encode().unwrap(), &mut out)
            .unwrap();
        session
            .send(id.handle, Message::from("queued").encode().unwrap(), &mut out)
            .unwrap();

        out.events.clear();
        session.on_transport_lost(1, &mut out);
        assert_eq!(session.state, SessionState::Unmapped);
        let unknown = out
            .events
            .iter()
            .filter(|event| match event {
                Event::Settled(tracker) => matches!(tracker.outcome(), Outcome::Unknown),
                _ => false,
            })
            .count();
        assert_eq!(unknown, 1);

        let link = session.links.get_mut(id.handle as usize).unwrap();
        let (sender, flow) = link.as_sender_mut().unwrap();
        assert_eq!(sender.queue.len(), 1);
        assert_eq!(flow.link_credit, 0);
    }
}
