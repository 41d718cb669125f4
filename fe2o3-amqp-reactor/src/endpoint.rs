//! Frames and events produced while a connection processes input

use std::collections::VecDeque;

use crate::{
    frames::amqp::{Frame, FrameBody},
    handler::Event,
};

/// Collects the frames to write to the transport and the events to dispatch to the
/// handler. Both are drained by the connection's worker after every step
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub frames: VecDeque<Frame>,
    pub events: VecDeque<Event>,
}

impl Outbox {
    pub fn frame(&mut self, channel: u16, body: FrameBody) {
        #[cfg(feature = "tracing")]
        tracing::trace!(channel, frame = ?body, "SEND");
        #[cfg(feature = "log")]
        log::trace!("SEND channel={}, frame={:?}", channel, body);
        self.frames.push_back(Frame::new(channel, body));
    }

    pub fn event(&mut self, event: Event) {
        self.events.push_back(event);
    }
}
