//! Blocking sender that may be used from any thread

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::{
    link::LinkId,
    types::{definitions, message::Message},
    work_queue::WorkQueue,
};

/// Error returned to a thread submitting a message through a [`ThreadSafeSender`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The link was closed, possibly with an error from the peer
    #[error("Link is closed {0:?}")]
    LinkClosed(Option<definitions::Error>),

    /// The connection has terminated and its work queue is gone
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connection failed and will not recover
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The message could not be encoded
    #[error("Message codec error: {0}")]
    Codec(String),
}

#[derive(Debug)]
struct GateState {
    /// Credit not yet claimed by a queued delivery, as last reported by the worker
    credit: u32,

    /// Submissions admitted but not yet queued on the link by the worker
    reserved: u32,

    next_ticket: u64,
    serving: u64,
    error: Option<SendError>,
}

/// Credit and error state of one sender link shared with the threads blocked on it
#[derive(Debug)]
pub(crate) struct SendGate {
    work_queue: WorkQueue,
    link: LinkId,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl SendGate {
    pub fn new(work_queue: WorkQueue, link: LinkId) -> Self {
        Self {
            work_queue,
            link,
            state: Mutex::new(GateState {
                credit: 0,
                reserved: 0,
                next_ticket: 0,
                serving: 0,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Called by the worker whenever the link's spare credit changes
    pub fn set_credit(&self, credit: u32) {
        let mut state = self.state.lock();
        if state.credit != credit {
            state.credit = credit;
            self.cond.notify_all();
        }
    }

    /// Wakes every blocked thread with `error`. The first error raised is kept
    pub fn raise_error(&self, error: SendError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        self.cond.notify_all();
    }

    fn release_reservation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Blocks until this caller's turn comes and a unit of credit is available, then claims it
    fn reserve(&self) -> Result<(), SendError> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.serving == ticket && state.credit > state.reserved {
                break;
            }
            self.cond.wait(&mut state);
        }

        state.reserved += 1;
        state.serving += 1;
        self.cond.notify_all();
        Ok(())
    }
}

/// A handle to a sender link that may be moved to and used from any thread.
///
/// [`ThreadSafeSender::send`] blocks until the link has credit, or fails once the link or the
/// connection is known to be unusable. The transfer itself is performed later by the worker
/// owning the connection, and its outcome is reported through `on_settled`.
///
/// Blocking the worker thread of the same connection, e.g. by calling `send` from a callback
/// of that connection, deadlocks.
#[derive(Debug, Clone)]
pub struct ThreadSafeSender {
    gate: Arc<SendGate>,
    owns_connection: bool,
}

impl ThreadSafeSender {
    pub(crate) fn new(gate: Arc<SendGate>, owns_connection: bool) -> Self {
        Self {
            gate,
            owns_connection,
        }
    }

    /// The link messages are sent on
    pub fn link(&self) -> LinkId {
        self.gate.link
    }

    /// Submits a message, waiting for credit first.
    ///
    /// Threads blocked on the same link are released in the order they called `send`.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), SendError> {
        let payload = message
            .into()
            .encode()
            .map_err(|err| SendError::Codec(err.to_string()))?;
        self.send_encoded(payload)
    }

    fn send_encoded(&self, payload: Bytes) -> Result<(), SendError> {
        self.gate.reserve()?;

        let gate = self.gate.clone();
        let link = self.gate.link;
        let result = self.gate.work_queue.add(move |ctx| {
            if let Err(err) = ctx.send_encoded(link, payload) {
                gate.raise_error(SendError::LinkClosed(err.to_amqp_error()));
            }
            gate.release_reservation();
        });

        if let Err(err) = result {
            self.gate.release_reservation();
            self.gate.raise_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Closes the link, or the whole connection if it was opened for this sender.
    ///
    /// Messages submitted before are still transferred before the connection closes.
    pub fn close(&self) -> Result<(), SendError> {
        let gate = self.gate.clone();
        let link = self.gate.link;
        let owns_connection = self.owns_connection;
        self.gate.work_queue.add(move |ctx| match owns_connection {
            true => ctx.close(),
            false => {
                if let Err(err) = ctx.close_link(link) {
                    gate.raise_error(SendError::LinkClosed(err.to_amqp_error()));
                    ctx.report_link_error(link, err);
                }
            }
        })
    }
}
