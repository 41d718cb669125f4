//! The engine drives a [`Connection`] over a transport, runs its work queue and dispatches
//! its events to the handler

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    container::{ActiveGuard, ContainerHandle},
    context::Context,
    frames::amqp::Frame,
    handler::{self, Event, SharedHandler},
    transport::{self, BoxedIo, Transport},
    types::definitions::{self, ErrorCondition},
    util::{sleep_until_or_pending, Running},
    work_queue::{Work, WorkQueue},
};

use super::{heartbeat::HeartBeat, reconnect::Backoff, Connection, ConnectionState, Error};

/// Why the event loop over one transport returned
#[derive(Debug)]
enum Exit {
    /// The connection closed or failed for good
    Terminated,

    /// The container is stopping and the connection never opened
    Stopped,

    /// The transport was lost
    Lost(transport::Error),

    /// The peer did not answer our `close` in time
    CloseTimeout,
}

pub(crate) struct ConnectionEngine {
    connection: Connection,
    handler: SharedHandler,
    container: ContainerHandle,
    work_queue: WorkQueue,
    work_rx: mpsc::UnboundedReceiver<Work>,
    heartbeat: HeartBeat,
    stop: CancellationToken,
    _active: ActiveGuard,
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("connection", &self.connection)
            .field("work_queue", &self.work_queue)
            .finish()
    }
}

impl ConnectionEngine {
    pub fn new(
        connection: Connection,
        handler: SharedHandler,
        container: ContainerHandle,
        work_queue: WorkQueue,
        work_rx: mpsc::UnboundedReceiver<Work>,
        active: ActiveGuard,
    ) -> Self {
        let stop = container.stop_token();
        Self {
            connection,
            handler,
            container,
            work_queue,
            work_rx,
            heartbeat: HeartBeat::never(),
            stop,
            _active: active,
        }
    }

    /* ---------------------------------- Client ---------------------------------- */

    /// Connects to the endpoints in `backoff` and runs the connection until it terminates,
    /// reconnecting after transport failures
    pub async fn run_client(mut self, mut backoff: Backoff) {
        loop {
            let (transport, url) = match self.connect(&mut backoff).await {
                Ok(Some(connected)) => connected,
                Ok(None) => {
                    self.connection.close(None);
                    self.process_events();
                    break;
                }
                Err(err) => {
                    self.connection.fail(err);
                    self.process_events();
                    break;
                }
            };

            self.connection.start(Some(url));
            match self.event_loop(transport).await {
                Exit::Terminated => break,
                Exit::Stopped | Exit::CloseTimeout => {
                    self.connection.on_transport_lost();
                    self.process_events();
                    break;
                }
                Exit::Lost(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "Transport lost");
                    #[cfg(feature = "log")]
                    log::warn!("Transport lost error={}", err);

                    if matches!(self.connection.state, ConnectionState::Open) {
                        backoff.reset();
                    }
                    let reconnect = !self.connection.is_closing() && backoff.is_enabled();
                    let fatal = !self.connection.is_closing() && !backoff.is_enabled();

                    self.connection.out.event(Event::TransportError(err.clone()));
                    let alive = self.connection.on_transport_lost();
                    if fatal && alive {
                        self.connection.fail(Error::Transport(err));
                    }
                    self.process_events();

                    if !reconnect || !alive {
                        break;
                    }
                }
            }
        }
        self.finish();
    }

    /// Returns `None` if the connection was stopped or closed before a transport came up
    async fn connect(
        &mut self,
        backoff: &mut Backoff,
    ) -> Result<Option<(Transport<BoxedIo>, Url)>, Error> {
        let mut last_error = None;
        while let Some((url, wait)) = backoff.next_attempt() {
            if !wait.is_zero() {
                if let Running::Stop = self.wait_for_retry(wait).await {
                    return Ok(None);
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(url = %url, attempt = backoff.attempts(), "Connecting");
            #[cfg(feature = "log")]
            log::debug!("Connecting url={}, attempt={}", url, backoff.attempts());

            let result = tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                result = open_transport(&url, &self.connection) => result,
            };

            match result {
                Ok(transport) => return Ok(Some((transport, url))),
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(url = %url, error = %err, "Connect attempt failed");
                    #[cfg(feature = "log")]
                    log::warn!("Connect attempt failed url={}, error={}", url, err);

                    self.connection.out.event(Event::TransportError(err.clone()));
                    self.process_events();
                    if self.connection.is_terminated() {
                        return Ok(None);
                    }
                    if !err.is_recoverable() {
                        return Err(Error::Transport(err));
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(source) if backoff.is_enabled() => Err(Error::ReconnectExhausted {
                attempts: backoff.attempts(),
                source,
            }),
            Some(source) => Err(Error::Transport(source)),
            None => Err(Error::InvalidUrl(String::from("No endpoint to connect to"))),
        }
    }

    /// Sleeps before the next reconnect round while still running the work queue
    async fn wait_for_retry(&mut self, wait: Duration) -> Running {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Running::Stop,
                _ = &mut sleep => return Running::Continue,
                Some(work) = self.work_rx.recv() => {
                    self.run_work(work);
                    self.process_events();
                    if self.connection.is_terminated() {
                        return Running::Stop;
                    }
                }
            }
        }
    }

    /* ---------------------------------- Server ---------------------------------- */

    /// Runs a connection accepted by a listener. Its transport has completed the handshake
    pub async fn run_server(mut self, transport: Transport<BoxedIo>) {
        self.connection.start(None);
        match self.event_loop(transport).await {
            Exit::Terminated => {}
            Exit::Stopped | Exit::CloseTimeout => {
                self.connection.on_transport_lost();
            }
            Exit::Lost(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %err, "Incoming transport lost");
                #[cfg(feature = "log")]
                log::debug!("Incoming transport lost error={}", err);

                self.connection.out.event(Event::TransportError(err.clone()));
                if self.connection.on_transport_lost() {
                    self.connection.fail(Error::Transport(err));
                }
            }
        }
        self.process_events();
        self.finish();
    }

    /* -------------------------------- Event loop -------------------------------- */

    async fn event_loop(&mut self, mut transport: Transport<BoxedIo>) -> Exit {
        self.heartbeat = HeartBeat::never();
        if let Err(err) = self.after_step(&mut transport).await {
            return Exit::Lost(err);
        }

        loop {
            let deadline = self.connection.drain_deadline;
            let result = tokio::select! {
                _ = self.stop.cancelled(), if !self.connection.is_closing() => {
                    match self.connection.state {
                        ConnectionState::Open | ConnectionState::Opening => {
                            self.connection.close(None);
                            Ok(Running::Continue)
                        }
                        _ => Ok(Running::Stop),
                    }
                },
                incoming = transport.next() => match incoming {
                    Some(Ok(frame)) => {
                        if let Err(err) = self.connection.on_incoming_frame(frame) {
                            #[cfg(feature = "tracing")]
                            tracing::error!(error = %err, "Protocol violation by peer");
                            #[cfg(feature = "log")]
                            log::error!("Protocol violation by peer error={}", err);
                            self.connection.abort(err);
                        }
                        Ok(Running::Continue)
                    }
                    Some(Err(err)) => Err(err),
                    None => Err(transport::Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))),
                },
                Some(work) = self.work_rx.recv() => {
                    self.run_work(work);
                    Ok(Running::Continue)
                },
                _ = self.heartbeat.next() => {
                    self.on_heartbeat();
                    Ok(Running::Continue)
                },
                _ = sleep_until_or_pending(deadline) => {
                    if self.connection.close_sent() {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Peer did not answer close");
                        #[cfg(feature = "log")]
                        log::warn!("Peer did not answer close");
                        return Exit::CloseTimeout;
                    }
                    self.connection.force_close();
                    Ok(Running::Continue)
                },
            };

            match result {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => return Exit::Stopped,
                Err(err) => return Exit::Lost(err),
            }

            if let Err(err) = self.after_step(&mut transport).await {
                return Exit::Lost(err);
            }
            if matches!(
                self.connection.state,
                ConnectionState::Closed | ConnectionState::Failed
            ) {
                // Best effort, the peer may already be gone
                let _ = transport.close().await;
                return Exit::Terminated;
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if matches!(self.connection.state, ConnectionState::Open | ConnectionState::Closing) {
            self.connection.out.frames.push_back(Frame::empty());
        }
    }

    /// Dispatches pending events, completes drains and pending closes, then writes
    /// every queued frame
    async fn after_step(&mut self, transport: &mut Transport<BoxedIo>) -> Result<(), transport::Error> {
        loop {
            self.process_events();
            self.connection.complete_pending_drains();
            self.connection.try_finish_close();
            if self.connection.out.events.is_empty() {
                break;
            }
        }

        if self.connection.out.frames.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.connection.out.frames.pop_front() {
            transport.feed(frame).await?;
        }
        transport.flush().await
    }

    /* -------------------------------- Callbacks -------------------------------- */

    fn process_events(&mut self) {
        while let Some(event) = self.connection.out.events.pop_front() {
            if let Event::ConnectionOpen = event {
                self.heartbeat = HeartBeat::for_remote_idle_timeout(self.connection.remote_idle_timeout);
            }

            let mut handler = self.handler.lock();
            let mut ctx = Context {
                connection: &mut self.connection,
                work_queue: &self.work_queue,
                container: &self.container,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                handler::dispatch(&mut *handler, &mut ctx, event)
            }));
            drop(handler);

            if let Err(payload) = result {
                self.on_handler_panic(payload);
            }
        }
    }

    fn run_work(&mut self, work: Work) {
        let mut ctx = Context {
            connection: &mut self.connection,
            work_queue: &self.work_queue,
            container: &self.container,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(&mut ctx)));
        if let Err(payload) = result {
            self.on_handler_panic(payload);
        }
    }

    /// A panicking callback closes its connection with an internal error
    fn on_handler_panic(&mut self, payload: Box<dyn Any + Send>) {
        let message = panic_message(&*payload);

        #[cfg(feature = "tracing")]
        tracing::error!(panic = %message, "Handler panicked, closing connection");
        #[cfg(feature = "log")]
        log::error!("Handler panicked, closing connection panic={}", message);

        match self.connection.state {
            ConnectionState::Open | ConnectionState::Opening => {
                let error = definitions::Error::new(ErrorCondition::InternalError, message);
                self.connection.close(Some(error));
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Unopened | ConnectionState::Failed => {
                self.connection.fail(Error::HandlerPanicked(message));
            }
        }
    }

    /// Wakes blocked senders and releases the container
    fn finish(mut self) {
        if !self.connection.is_terminated() && !matches!(self.connection.state, ConnectionState::Failed) {
            self.connection.close(None);
            self.process_events();
        }
        self.work_rx.close();

        #[cfg(feature = "tracing")]
        tracing::debug!(container_id = %self.connection.container_id(), state = ?self.connection.state, "Connection engine stopped");
        #[cfg(feature = "log")]
        log::debug!("Connection engine stopped container_id={}, state={:?}", self.connection.container_id(), self.connection.state);
    }
}

async fn open_transport(url: &Url, connection: &Connection) -> Result<Transport<BoxedIo>, transport::Error> {
    let options = &connection.options;
    let mut io = transport::connect_stream(url, &options.tls).await?;
    let sasl = options.sasl.clone().with_url_credentials(url);
    let hostname = options.hostname.as_deref().or_else(|| url.host_str());
    let is_tls = url.scheme() == "amqps";
    transport::client_handshake(&mut io, &sasl, hostname, is_tls).await?;
    Ok(Transport::bind(
        io,
        options.max_frame_size as usize,
        options.idle_timeout(),
    ))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        String::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("handler panicked")
    }
}
