//! Receiver half of a link: credit window, transfer reassembly and unsettled deliveries

use std::{collections::BTreeMap, pin::Pin, task::Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    delivery::{Delivery, Outcome},
    thread_safe::SendError,
    types::{
        definitions::{DeliveryNumber, DeliveryTag, Error as AmqpError},
        message::Message,
        performatives::Transfer,
    },
    work_queue::WorkQueue,
};

use super::{
    options::{CreditMode, ReceiverOptions},
    state::LinkFlowState,
    Error, LinkId,
};

/// A delivery whose transfer frames have not all arrived
#[derive(Debug)]
struct IncompleteTransfer {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    settled: bool,
    buffer: BytesMut,
}

#[derive(Debug)]
pub(crate) struct ReceiverLink {
    pub options: ReceiverOptions,
    incomplete: Option<IncompleteTransfer>,
    pub unsettled: BTreeMap<DeliveryNumber, DeliveryTag>,
    pub draining: bool,
    pub deliveries: Option<mpsc::UnboundedSender<IncomingDelivery>>,
}

impl ReceiverLink {
    pub fn new(options: ReceiverOptions) -> Self {
        Self {
            options,
            incomplete: None,
            unsettled: BTreeMap::new(),
            draining: false,
            deliveries: None,
        }
    }

    /// Handles one transfer frame. Returns the delivery and its message once the last frame
    /// of a delivery has arrived.
    pub fn on_incoming_transfer(
        &mut self,
        link: LinkId,
        epoch: u64,
        flow: &mut LinkFlowState,
        transfer: Transfer,
        payload: Bytes,
    ) -> Result<Option<(Delivery, Message)>, Error> {
        let mut incomplete = match self.incomplete.take() {
            Some(incomplete) => {
                if let Some(delivery_id) = transfer.delivery_id {
                    if delivery_id != incomplete.delivery_id {
                        return Err(Error::Protocol(format!(
                            "Expecting continuation of delivery {}, found {}",
                            incomplete.delivery_id, delivery_id
                        )));
                    }
                }
                incomplete
            }
            None => {
                let (delivery_id, delivery_tag) = match (transfer.delivery_id, transfer.delivery_tag.clone()) {
                    (Some(id), Some(tag)) => (id, tag),
                    _ => {
                        return Err(Error::Protocol(String::from(
                            "First transfer of a delivery must carry delivery id and tag",
                        )))
                    }
                };
                if !flow.consume() {
                    return Err(Error::TransferLimitExceeded);
                }
                IncompleteTransfer {
                    delivery_id,
                    delivery_tag,
                    settled: false,
                    buffer: BytesMut::new(),
                }
            }
        };

        if transfer.aborted {
            return Ok(None);
        }

        incomplete.settled |= transfer.settled.unwrap_or(false);
        incomplete.buffer.extend_from_slice(&payload);

        if transfer.more {
            self.incomplete = Some(incomplete);
            return Ok(None);
        }

        let message =
            Message::decode(&incomplete.buffer).map_err(|err| Error::MessageCodec(err.to_string()))?;
        if !incomplete.settled {
            self.unsettled
                .insert(incomplete.delivery_id, incomplete.delivery_tag.clone());
        }
        let delivery = Delivery {
            link,
            tag: incomplete.delivery_tag,
            delivery_id: incomplete.delivery_id,
            epoch,
            settled: incomplete.settled,
        };
        Ok(Some((delivery, message)))
    }

    /// Removes a delivery from the unsettled set. Returns `false` if it was already settled
    pub fn settle(&mut self, delivery_id: DeliveryNumber) -> bool {
        self.unsettled.remove(&delivery_id).is_some()
    }

    /// In auto mode, tops the credit up so that credit plus unsettled deliveries equals the
    /// window. Returns whether the credit changed
    pub fn replenish(&self, flow: &mut LinkFlowState) -> bool {
        match self.options.credit_mode {
            CreditMode::Auto(window) if !self.draining => {
                let target = window.saturating_sub(self.unsettled.len() as u32);
                if target > flow.link_credit {
                    flow.link_credit = target;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Forgets every partial and unsettled delivery of the lost transport
    pub fn on_transport_lost(&mut self, flow: &mut LinkFlowState) {
        self.incomplete = None;
        self.unsettled.clear();
        self.draining = false;
        flow.drain = false;
        flow.link_credit = self.options.credit_mode.initial_credit();
    }
}

/// A received message with a handle to settle it from any thread
#[derive(Debug)]
pub struct IncomingDelivery {
    pub delivery: Delivery,
    pub message: Message,
    pub(crate) work_queue: WorkQueue,
}

impl IncomingDelivery {
    fn settle(&self, outcome: Outcome) -> Result<(), SendError> {
        let delivery = self.delivery.clone();
        self.work_queue.add(move |ctx| {
            if let Err(err) = ctx.settle_delivery(&delivery, outcome) {
                ctx.report_link_error(delivery.link(), err);
            }
        })
    }

    pub fn accept(&self) -> Result<(), SendError> {
        self.settle(Outcome::Accepted)
    }

    pub fn reject(&self, error: Option<AmqpError>) -> Result<(), SendError> {
        self.settle(Outcome::Rejected(error))
    }

    pub fn release(&self) -> Result<(), SendError> {
        self.settle(Outcome::Released)
    }

    pub fn modify(&self, delivery_failed: bool, undeliverable_here: bool) -> Result<(), SendError> {
        self.settle(Outcome::Modified {
            delivery_failed,
            undeliverable_here,
        })
    }
}

pin_project! {
    /// Deliveries of one receiver link.
    ///
    /// The stream ends once the link is closed, and never restarts.
    #[derive(Debug)]
    pub struct Deliveries {
        #[pin]
        inner: UnboundedReceiverStream<IncomingDelivery>,
        link: LinkId,
        work_queue: WorkQueue,
        owns_connection: bool,
    }
}

impl Deliveries {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<IncomingDelivery>,
        link: LinkId,
        work_queue: WorkQueue,
        owns_connection: bool,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            link,
            work_queue,
            owns_connection,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Grants more credit, for a receiver in manual credit mode
    pub fn add_credit(&self, credit: u32) -> Result<(), SendError> {
        let link = self.link;
        self.work_queue.add(move |ctx| {
            if let Err(err) = ctx.add_credit(link, credit) {
                ctx.report_link_error(link, err);
            }
        })
    }

    /// Closes the link, or the whole connection if it was opened for this receiver
    pub fn close(&self) -> Result<(), SendError> {
        let link = self.link;
        let owns_connection = self.owns_connection;
        self.work_queue.add(move |ctx| match owns_connection {
            true => ctx.close(),
            false => {
                if let Err(err) = ctx.close_link(link) {
                    ctx.report_link_error(link, err);
                }
            }
        })
    }
}

impl Stream for Deliveries {
    type Item = IncomingDelivery;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_amqp::primitives::Binary;

    use crate::{
        link::{
            options::{CreditMode, ReceiverOptions},
            state::LinkFlowState,
            Error, LinkId,
        },
        types::{message::Message, performatives::Transfer},
    };

    use super::ReceiverLink;

    fn link_id() -> LinkId {
        LinkId {
            channel: 0,
            handle: 0,
        }
    }

    fn transfer(delivery_id: Option<u32>, more: bool) -> Transfer {
        Transfer {
            handle: 0,
            delivery_id,
            delivery_tag: delivery_id.map(|id| Binary::from(id.to_be_bytes().to_vec())),
            message_format: Some(0),
            settled: Some(false),
            more,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn test_transfer_without_credit_is_refused() {
        let mut receiver = ReceiverLink::new(ReceiverOptions::default());
        let mut flow = LinkFlowState::receiver(0);
        let payload = Message::from("hello").encode().unwrap();
        let result =
            receiver.on_incoming_transfer(link_id(), 0, &mut flow, transfer(Some(0), false), payload);
        assert!(matches!(result, Err(Error::TransferLimitExceeded)));
    }

    #[test]
    fn test_multi_frame_delivery_is_reassembled() {
        let mut receiver = ReceiverLink::new(ReceiverOptions::default());
        let mut flow = LinkFlowState::receiver(10);
        let payload = Message::from("a message split in three").encode().unwrap();
        let (first, rest) = payload.split_at(4);
        let (second, third) = rest.split_at(5);

        let frames = [
            (transfer(Some(3), true), first),
            (transfer(None, true), second),
            (transfer(None, false), third),
        ];
        let mut completed = None;
        for (performative, partial) in frames {
            completed = receiver
                .on_incoming_transfer(
                    link_id(),
                    0,
                    &mut flow,
                    performative,
                    Bytes::copy_from_slice(partial),
                )
                .unwrap();
        }
        let (delivery, message) = completed.unwrap();
        assert_eq!(delivery.delivery_id(), 3);
        assert_eq!(message.body_str(), Some("a message split in three"));
        assert_eq!(flow.link_credit, 9);
        assert_eq!(flow.delivery_count, 1);
        assert_eq!(receiver.unsettled.len(), 1);
    }

    #[test]
    fn test_auto_credit_never_exceeds_window() {
        let options = ReceiverOptions::default().credit_mode(CreditMode::Auto(3));
        let mut receiver = ReceiverLink::new(options);
        let mut flow = LinkFlowState::receiver(3);

        for id in 0..3 {
            let payload = Message::from("m").encode().unwrap();
            receiver
                .on_incoming_transfer(link_id(), 0, &mut flow, transfer(Some(id), false), payload)
                .unwrap()
                .unwrap();
            assert!(!receiver.replenish(&mut flow));
            assert_eq!(flow.link_credit + receiver.unsettled.len() as u32, 3);
        }
        assert_eq!(flow.link_credit, 0);

        assert!(receiver.settle(0));
        assert!(!receiver.settle(0));
        assert!(receiver.replenish(&mut flow));
        assert_eq!(flow.link_credit, 1);
    }

    #[test]
    fn test_manual_credit_is_not_replenished() {
        let options = ReceiverOptions::default().credit_mode(CreditMode::Manual(1));
        let mut receiver = ReceiverLink::new(options);
        let mut flow = LinkFlowState::receiver(1);
        let payload = Message::from("m").encode().unwrap();
        receiver
            .on_incoming_transfer(link_id(), 0, &mut flow, transfer(Some(0), false), payload)
            .unwrap();
        receiver.settle(0);
        assert!(!receiver.replenish(&mut flow));
        assert_eq!(flow.link_credit, 0);
    }
}
