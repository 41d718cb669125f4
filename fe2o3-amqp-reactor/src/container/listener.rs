//! Connection listener

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{engine::ConnectionEngine, Connection, ConnectionOptions},
    handler::SharedHandler,
    sasl_profile::SaslAcceptor,
    transport::{self, BoxedIo, Transport},
    work_queue::WorkQueue,
};

use super::{ActiveGuard, ContainerHandle, Error};

/// Options of a listener
///
/// # Default configuration
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`sasl`| [`SaslAcceptor::anonymous`] |
/// |`connection`| [`ConnectionOptions::default`] |
///
/// The connection options supply the `open` sent to clients and the session and link
/// options applied to sessions and links begun or attached by clients.
///
/// ```rust
/// use fe2o3_amqp_reactor::{container::ListenerOptions, sasl_profile::SaslAcceptor};
///
/// let options = ListenerOptions::new()
///     .sasl(SaslAcceptor::plain([(String::from("guest"), String::from("guest"))]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub(crate) sasl: SaslAcceptor,
    pub(crate) connection: ConnectionOptions,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How clients authenticate
    pub fn sasl(mut self, sasl: SaslAcceptor) -> Self {
        self.sasl = sasl;
        self
    }

    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }
}

/// Handle to a running listener
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: CancellationToken,
}

impl ListenerHandle {
    /// The address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Accepted connections keep running
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Binds right away so that the address is known before the container runs
pub(super) fn listen(
    container: &ContainerHandle,
    addr: &str,
    options: ListenerOptions,
    handler: Option<SharedHandler>,
) -> Result<ListenerHandle, Error> {
    if container.is_stopped() {
        return Err(Error::Stopped);
    }

    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let stop = container.stop_token().child_token();

    #[cfg(feature = "tracing")]
    tracing::info!(addr = %local_addr, "Listening");
    #[cfg(feature = "log")]
    log::info!("Listening addr={}", local_addr);

    let active = container.register();
    let token = stop.clone();
    container.schedule(Box::new(move |container, default_handler| {
        let handler = handler.unwrap_or(default_handler);
        container
            .runtime()
            .spawn(accept_loop(container.clone(), listener, options, handler, token, active));
    }));

    Ok(ListenerHandle { local_addr, stop })
}

async fn accept_loop(
    container: ContainerHandle,
    listener: std::net::TcpListener,
    options: ListenerOptions,
    handler: SharedHandler,
    stop: CancellationToken,
    _active: ActiveGuard,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %_err, "Failed to register listener");
            #[cfg(feature = "log")]
            log::error!("Failed to register listener error={}", _err);
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _peer)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(peer = %_peer, "Accepted transport");
                #[cfg(feature = "log")]
                log::debug!("Accepted transport peer={}", _peer);

                let active = container.register();
                container.runtime().spawn(serve(
                    container.clone(),
                    stream,
                    options.clone(),
                    handler.clone(),
                    active,
                ));
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "Accept failed");
                #[cfg(feature = "log")]
                log::warn!("Accept failed error={}", _err);
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Listener stopped");
    #[cfg(feature = "log")]
    log::info!("Listener stopped");
}

/// Runs the server handshake, then hands the transport to a connection engine
async fn serve(
    container: ContainerHandle,
    stream: TcpStream,
    options: ListenerOptions,
    handler: SharedHandler,
    active: ActiveGuard,
) {
    if let Err(_err) = stream.set_nodelay(true) {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %_err, "Failed to set nodelay");
        #[cfg(feature = "log")]
        log::debug!("Failed to set nodelay error={}", _err);
    }

    let mut io: BoxedIo = Box::new(stream);
    let stop_token = container.stop_token();
    let handshake = tokio::select! {
        _ = stop_token.cancelled() => return,
        result = transport::server_handshake(&mut io, &options.sasl) => result,
    };
    if let Err(_err) = handshake {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %_err, "Incoming handshake failed");
        #[cfg(feature = "log")]
        log::warn!("Incoming handshake failed error={}", _err);
        return;
    }

    let ListenerOptions {
        connection: connection_options,
        ..
    } = options;
    let transport = Transport::bind(
        io,
        connection_options.max_frame_size as usize,
        connection_options.idle_timeout(),
    );
    let container_id = connection_options
        .container_id
        .clone()
        .unwrap_or_else(|| container.id().to_string());
    let connection = Connection::new(container_id, None, connection_options, true);
    let (work_queue, work_rx) = WorkQueue::new();

    let engine = ConnectionEngine::new(
        connection,
        handler,
        container.clone(),
        work_queue,
        work_rx,
        active,
    );
    container.spawn(engine.run_server(transport));
}
