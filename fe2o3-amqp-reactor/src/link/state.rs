//! Link state and link flow state

use crate::types::{
    definitions::{Handle, SequenceNo},
    performatives::Flow,
};

/// Link state.
///
/// AMQP 1.0 does not name the link states, these follow the attach and detach exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The initial state after initialization, and again after the transport is lost
    Unattached,

    /// An attach frame has been sent
    AttachSent,

    /// The link is attached
    Attached,

    /// A closing detach frame has been sent
    CloseSent,

    /// A closing detach has arrived before a local one was sent
    CloseReceived,

    /// The link is closed
    Closed,
}

/// The link fields of a flow frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkFlow {
    pub handle: Handle,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,
    pub echo: bool,
}

/// Flow control state of one link, owned by the connection's worker
#[derive(Debug, Clone)]
pub(crate) struct LinkFlowState {
    pub initial_delivery_count: SequenceNo,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,
}

impl LinkFlowState {
    pub fn sender(initial_delivery_count: SequenceNo) -> Self {
        Self {
            initial_delivery_count,
            delivery_count: initial_delivery_count,
            link_credit: 0,
            available: 0,
            drain: false,
        }
    }

    pub fn receiver(link_credit: u32) -> Self {
        Self {
            initial_delivery_count: 0,
            delivery_count: 0,
            link_credit,
            available: 0,
            drain: false,
        }
    }

    pub fn as_link_flow(&self, handle: Handle, echo: bool) -> LinkFlow {
        LinkFlow {
            handle,
            delivery_count: self.delivery_count,
            link_credit: self.link_credit,
            available: self.available,
            drain: self.drain,
            echo,
        }
    }

    /// Handles a flow received by a sender. Returns whether an echo was requested.
    ///
    /// link-credit_snd := delivery-count_rcv + link-credit_rcv - delivery-count_snd
    pub fn on_incoming_flow_as_sender(&mut self, flow: &Flow) -> bool {
        // In the event that the receiver does not yet know the delivery-count, the sender
        // assumes the delivery-count it sent in its attach
        let delivery_count_rcv = flow.delivery_count.unwrap_or(self.initial_delivery_count);

        if let Some(link_credit_rcv) = flow.link_credit {
            let limit = delivery_count_rcv.wrapping_add(link_credit_rcv);
            self.link_credit = sequence_diff(limit, self.delivery_count);
        }

        // The sender's value of drain is always the last known value indicated by the receiver
        self.drain = flow.drain;
        flow.echo
    }

    /// Handles a flow received by a receiver. Returns whether an echo was requested.
    pub fn on_incoming_flow_as_receiver(&mut self, flow: &Flow) -> bool {
        if let Some(delivery_count) = flow.delivery_count {
            // The sender may have advanced its delivery-count while draining, which consumes
            // the credit in between
            let consumed = sequence_diff(delivery_count, self.delivery_count);
            self.link_credit = self.link_credit.saturating_sub(consumed);
            self.delivery_count = delivery_count;
        }

        // The receiver maintains a floor of zero
        if let Some(available) = flow.available {
            self.available = available;
        }
        flow.echo
    }

    /// Consumes one unit of credit for a transfer. Returns `false` when there is none
    pub fn consume(&mut self) -> bool {
        if self.link_credit == 0 {
            return false;
        }
        self.delivery_count = self.delivery_count.wrapping_add(1);
        self.link_credit -= 1;
        true
    }

    /// Advances the delivery-count over all remaining credit, as a draining sender does
    pub fn drain_credit(&mut self) {
        self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
        self.link_credit = 0;
    }
}

/// `a - b` in serial number arithmetic, floored at zero
fn sequence_diff(a: SequenceNo, b: SequenceNo) -> u32 {
    let diff = a.wrapping_sub(b);
    if diff > u32::MAX / 2 {
        0
    } else {
        diff
    }
}
