//! Sender half of a link: delivery queue, tags and outcome tracking

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use serde_amqp::primitives::Binary;

use crate::{
    delivery::{Outcome, Tracker},
    thread_safe::SendGate,
    types::{definitions::DeliveryNumber, messaging::DeliveryState},
};

use super::{options::SenderOptions, state::LinkFlowState, LinkId};

/// A delivery waiting for credit
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub tracker: Tracker,
    pub payload: Bytes,
    pub settled: bool,
}

/// What a disposition from the receiver did to one delivery
#[derive(Debug, PartialEq)]
pub(crate) enum DispositionUpdate {
    /// Settled by the peer, or locally in reaction to a terminal outcome
    Settled { tracker: Tracker, settle_locally: bool },

    /// A terminal outcome was reported but the delivery stays unsettled
    Updated(Tracker),
}

#[derive(Debug)]
pub(crate) struct SenderLink {
    pub options: SenderOptions,
    next_tag: u64,
    pub queue: VecDeque<Outgoing>,
    pub unsettled: BTreeMap<DeliveryNumber, Tracker>,
    pub gate: Option<Arc<SendGate>>,
    pub drain_started: bool,
}

impl SenderLink {
    pub fn new(options: SenderOptions) -> Self {
        Self {
            options,
            next_tag: 0,
            queue: VecDeque::new(),
            unsettled: BTreeMap::new(),
            gate: None,
            drain_started: false,
        }
    }

    /// Delivery tags are the big endian bytes of a per link counter
    fn next_tag(&mut self) -> Binary {
        let tag = self.next_tag.to_be_bytes();
        self.next_tag = self.next_tag.wrapping_add(1);
        Binary::from(tag.to_vec())
    }

    /// Queues an encoded message. It is transferred once there is credit
    pub fn enqueue(&mut self, link: LinkId, payload: Bytes, settled: bool) -> Tracker {
        let tracker = Tracker::new(link, self.next_tag());
        self.queue.push_back(Outgoing {
            tracker: tracker.clone(),
            payload,
            settled,
        });
        tracker
    }

    /// Takes the head of the queue if one unit of credit can be consumed for it
    pub fn next_sendable(&mut self, flow: &mut LinkFlowState) -> Option<Outgoing> {
        if self.queue.is_empty() || !flow.consume() {
            return None;
        }
        self.queue.pop_front()
    }

    /// Drops the head of the queue without consuming credit, giving it the `Unknown` outcome
    pub fn discard_head(&mut self) -> Option<Tracker> {
        let mut tracker = self.queue.pop_front()?.tracker;
        tracker.outcome.transition(Outcome::Unknown);
        Some(tracker)
    }

    /// Records that the first transfer frame was emitted with `delivery_id`.
    ///
    /// A pre-settled delivery is returned right away as it will never receive an outcome
    pub fn on_transferred(&mut self, delivery_id: DeliveryNumber, outgoing: Outgoing) -> Option<Tracker> {
        let mut tracker = outgoing.tracker;
        tracker.delivery_id = Some(delivery_id);
        match outgoing.settled {
            true => {
                tracker.outcome.transition(Outcome::Settled);
                Some(tracker)
            }
            false => {
                self.unsettled.insert(delivery_id, tracker);
                None
            }
        }
    }

    /// Applies a disposition sent by the receiver.
    ///
    /// Unknown ids, including ids of deliveries that were already settled, are ignored
    pub fn on_disposition(
        &mut self,
        delivery_id: DeliveryNumber,
        settled: bool,
        state: Option<&DeliveryState>,
    ) -> Option<DispositionUpdate> {
        let outcome = Outcome::from_state(state);

        if settled {
            let mut tracker = self.unsettled.remove(&delivery_id)?;
            match outcome.is_terminal() {
                true => tracker.outcome.transition(outcome),
                false => tracker.outcome.transition(Outcome::Settled),
            };
            return Some(DispositionUpdate::Settled {
                tracker,
                settle_locally: false,
            });
        }

        if !outcome.is_terminal() {
            return None;
        }

        if self.options.auto_settle {
            let mut tracker = self.unsettled.remove(&delivery_id)?;
            tracker.outcome.transition(outcome);
            return Some(DispositionUpdate::Settled {
                tracker,
                settle_locally: true,
            });
        }

        let tracker = self.unsettled.get_mut(&delivery_id)?;
        if tracker.outcome.transition(outcome) {
            return Some(DispositionUpdate::Updated(tracker.clone()));
        }
        None
    }

    /// Settles a delivery locally. Returns `None` if it is not unsettled
    pub fn settle(&mut self, delivery_id: DeliveryNumber) -> Option<Tracker> {
        let mut tracker = self.unsettled.remove(&delivery_id)?;
        tracker.outcome.transition(Outcome::Settled);
        Some(tracker)
    }

    /// Every delivery transferred but not settled gets the `Unknown` outcome.
    ///
    /// Queued deliveries have not been transferred and stay queued.
    pub fn on_transport_lost(&mut self) -> Vec<Tracker> {
        std::mem::take(&mut self.unsettled)
            .into_values()
            .map(|mut tracker| {
                tracker.outcome.transition(Outcome::Unknown);
                tracker
            })
            .collect()
    }

    /// Nothing queued nor waiting for an outcome
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.unsettled.is_empty()
    }

    /// Credit left after every queued delivery has been sent
    pub fn spare_credit(&self, flow: &LinkFlowState) -> u32 {
        flow.link_credit.saturating_sub(self.queue.len() as u32)
    }

    pub fn sync_gate(&self, flow: &LinkFlowState) {
        if let Some(gate) = &self.gate {
            gate.set_credit(self.spare_credit(flow));
        }
    }
}
