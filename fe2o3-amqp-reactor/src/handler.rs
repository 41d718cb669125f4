//! Application callbacks
//!
//! Every callback of a connection runs on the worker that currently owns the connection,
//! never concurrently with another callback of the same connection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    connection,
    container::ContainerHandle,
    context::Context,
    delivery::{Delivery, Outcome, Tracker},
    link::{self, IncomingDelivery, LinkId},
    session::SessionId,
    transport,
    types::{definitions, message::Message},
};

/// Events produced by a connection, each mapping to one callback
#[derive(Debug)]
pub(crate) enum Event {
    ConnectionOpen,
    ConnectionClose,
    ConnectionError(definitions::Error),
    TransportError(transport::Error),
    SessionOpen(SessionId),
    SessionClose(SessionId, Option<definitions::Error>),
    LinkOpen(LinkId),
    LinkClose(LinkId, Option<definitions::Error>),
    LinkError(LinkId, link::Error),
    Sendable(LinkId, u32),
    SenderDrainStart(LinkId),
    ReceiverDrainFinish(LinkId),
    Message(Delivery, Message),
    Settled(Tracker),
    TrackerUpdate(Tracker),
    Error(connection::Error),
}

/// Callbacks of a container and its connections.
///
/// Every method has an empty default so that a handler only implements the events it is
/// interested in.
#[allow(unused_variables)]
pub trait MessagingHandler: Send + 'static {
    /// Called once when the container starts running
    fn on_container_start(&mut self, container: &ContainerHandle) {}

    /// Called once before [`crate::Container::run`] returns
    fn on_container_stop(&mut self, container: &ContainerHandle) {}

    /// The peer's `open` was received. On a reconnect this is called again, with
    /// [`Context::is_reconnect`] returning `true`
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {}

    /// The connection closed cleanly
    fn on_connection_close(&mut self, ctx: &mut Context<'_>) {}

    /// The peer closed the connection with an error
    fn on_connection_error(&mut self, ctx: &mut Context<'_>, error: &definitions::Error) {}

    /// A transport failed. A reconnect may follow
    fn on_transport_error(&mut self, ctx: &mut Context<'_>, error: &transport::Error) {}

    fn on_session_open(&mut self, ctx: &mut Context<'_>, session: SessionId) {}

    fn on_session_close(
        &mut self,
        ctx: &mut Context<'_>,
        session: SessionId,
        error: Option<&definitions::Error>,
    ) {
    }

    fn on_link_open(&mut self, ctx: &mut Context<'_>, link: LinkId) {}

    /// The link is gone, either closed by this end or by the peer. A link refused by the
    /// peer is reported here with the peer's error
    fn on_link_close(&mut self, ctx: &mut Context<'_>, link: LinkId, error: Option<&definitions::Error>) {}

    /// An operation queued for the link failed with nobody to return the error to, e.g. a
    /// delivery settled through [`IncomingDelivery`] after its transport was lost
    fn on_link_error(&mut self, ctx: &mut Context<'_>, link: LinkId, error: &link::Error) {}

    /// The sender has `credit` left after every queued message is sent
    fn on_sendable(&mut self, ctx: &mut Context<'_>, link: LinkId, credit: u32) {}

    /// The peer asked the sender to use up or give back its credit
    fn on_sender_drain_start(&mut self, ctx: &mut Context<'_>, link: LinkId) {}

    /// A drain requested with [`Context::drain`] has completed
    fn on_receiver_drain_finish(&mut self, ctx: &mut Context<'_>, link: LinkId) {}

    /// A message arrived on a receiver link that has no [`crate::link::Deliveries`] stream
    fn on_message(&mut self, ctx: &mut Context<'_>, delivery: &Delivery, message: Message) {}

    /// An outgoing delivery was settled. The outcome is [`Outcome::Unknown`] if the transport
    /// failed before the peer reported one
    fn on_settled(&mut self, ctx: &mut Context<'_>, tracker: &Tracker) {}

    /// The peer reported an outcome for a delivery that the sender settles manually
    fn on_tracker_update(&mut self, ctx: &mut Context<'_>, tracker: &Tracker) {}

    /// The connection failed and will not recover. Called at most once per connection
    fn on_error(&mut self, ctx: &mut Context<'_>, error: &connection::Error) {}
}

/// A handler shared by the connections of a container
pub(crate) type SharedHandler = Arc<Mutex<dyn MessagingHandler>>;

pub(crate) fn shared<H: MessagingHandler>(handler: H) -> SharedHandler {
    Arc::new(Mutex::new(handler))
}

/// Routes one event to its callback.
///
/// Messages go to the link's deliveries stream if one was taken, otherwise to `on_message`.
/// Auto-accept runs after the message has been handed over and is a no-op for a delivery the
/// handler already settled.
pub(crate) fn dispatch(handler: &mut dyn MessagingHandler, ctx: &mut Context<'_>, event: Event) {
    match event {
        Event::ConnectionOpen => handler.on_connection_open(ctx),
        Event::ConnectionClose => handler.on_connection_close(ctx),
        Event::ConnectionError(error) => handler.on_connection_error(ctx, &error),
        Event::TransportError(error) => handler.on_transport_error(ctx, &error),
        Event::SessionOpen(session) => handler.on_session_open(ctx, session),
        Event::SessionClose(session, error) => handler.on_session_close(ctx, session, error.as_ref()),
        Event::LinkOpen(link) => handler.on_link_open(ctx, link),
        Event::LinkClose(link, error) => handler.on_link_close(ctx, link, error.as_ref()),
        Event::LinkError(link, error) => handler.on_link_error(ctx, link, &error),
        Event::Sendable(link, credit) => handler.on_sendable(ctx, link, credit),
        Event::SenderDrainStart(link) => handler.on_sender_drain_start(ctx, link),
        Event::ReceiverDrainFinish(link) => handler.on_receiver_drain_finish(ctx, link),
        Event::Message(delivery, message) => {
            let link = delivery.link();
            let message = match ctx.connection.deliveries_sink(link) {
                Some(sink) => {
                    let incoming = IncomingDelivery {
                        delivery: delivery.clone(),
                        message,
                        work_queue: ctx.work_queue.clone(),
                    };
                    match sink.send(incoming) {
                        Ok(()) => None,
                        // The stream was dropped, fall back to the handler
                        Err(returned) => {
                            ctx.connection.drop_deliveries_sink(link);
                            Some(returned.0.message)
                        }
                    }
                }
                None => Some(message),
            };
            if let Some(message) = message {
                handler.on_message(ctx, &delivery, message);
            }
            if !delivery.is_remotely_settled() && ctx.connection.auto_accept(link) {
                if let Err(err) = ctx.settle_delivery(&delivery, Outcome::Accepted) {
                    ctx.report_link_error(link, err);
                }
            }
        }
        Event::Settled(tracker) => handler.on_settled(ctx, &tracker),
        Event::TrackerUpdate(tracker) => handler.on_tracker_update(ctx, &tracker),
        Event::Error(error) => handler.on_error(ctx, &error),
    }
}
