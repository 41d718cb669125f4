//! Container
//!
//! A [`Container`] owns the runtime that runs its connections and listeners.
//! [`Container::run`] blocks the calling thread until every connection and listener has
//! terminated, or until [`ContainerHandle::stop`] is called.
//!
//! Each connection is served by one task at a time. With [`Scheduling::WorkerPool`] the tasks
//! of every connection share a fixed pool of worker threads. With
//! [`Scheduling::ThreadPerConnection`] each connection gets a thread of its own.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Runtime, sync::mpsc, sync::Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    connection::{
        engine::ConnectionEngine,
        options::{address_of, parse_endpoint},
        reconnect::Backoff,
        Connection, ConnectionOptions,
    },
    handler::{self, MessagingHandler, SharedHandler},
    link::{Deliveries, ReceiverOptions, SenderOptions},
    thread_safe::ThreadSafeSender,
    work_queue::WorkQueue,
};

pub mod error;
mod listener;

pub use error::Error;
pub use listener::{ListenerHandle, ListenerOptions};

/// How long [`Container::run`] waits for connections to close after a stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

static CONTAINER_COUNTER: AtomicU64 = AtomicU64::new(0);

fn default_container_id() -> String {
    let count = CONTAINER_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("container-{}-{}", std::process::id(), count)
}

/// How connections are mapped onto threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// A fixed pool of worker threads shared by every connection
    WorkerPool(usize),

    /// A dedicated thread for each connection
    ThreadPerConnection,
}

impl Default for Scheduling {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Scheduling::WorkerPool(workers)
    }
}

/// Builder of a [`Container`]
#[derive(Debug, Clone)]
pub struct Builder {
    id: Option<String>,
    scheduling: Scheduling,
    auto_stop: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            id: None,
            scheduling: Scheduling::default(),
            auto_stop: true,
        }
    }
}

impl Builder {
    /// Container id sent in the `open` of every connection that does not set its own
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Whether [`Container::run`] returns once no connection or listener is left.
    /// Defaults to `true`
    pub fn auto_stop(mut self, auto_stop: bool) -> Self {
        self.auto_stop = auto_stop;
        self
    }

    pub fn build(self) -> Result<Container, Error> {
        let workers = match self.scheduling {
            Scheduling::WorkerPool(n) => n.max(1),
            // Listeners only
            Scheduling::ThreadPerConnection => 1,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("amqp-worker")
            .enable_all()
            .build()?;

        let shared = Shared {
            id: self.id.unwrap_or_else(default_container_id),
            runtime: runtime.handle().clone(),
            scheduling: self.scheduling,
            auto_stop: self.auto_stop,
            state: Mutex::new(RunState::default()),
            active: AtomicUsize::new(0),
            changed: Notify::new(),
            stop: CancellationToken::new(),
        };

        Ok(Container {
            runtime,
            handle: ContainerHandle {
                shared: Arc::new(shared),
            },
        })
    }
}

/// Runs connections and listeners and dispatches their events to a [`MessagingHandler`]
#[derive(Debug)]
pub struct Container {
    runtime: Runtime,
    handle: ContainerHandle,
}

impl Container {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A container with a generated id and the default worker pool
    pub fn new() -> Result<Self, Error> {
        Builder::default().build()
    }

    pub fn id(&self) -> &str {
        &self.handle.shared.id
    }

    /// A handle that may be used from any thread, before or while the container runs
    pub fn handle(&self) -> ContainerHandle {
        self.handle.clone()
    }

    /// Runs the container on the calling thread.
    ///
    /// `handler` receives the events of every connection that was not given a handler of its
    /// own. Connections requested before `run` are started now.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn run<H: MessagingHandler>(self, handler: H) -> Result<(), Error> {
        let Container { runtime, handle } = self;
        let handler = handler::shared(handler);

        let pending = {
            let mut state = handle.shared.state.lock();
            state.handler = Some(handler.clone());
            std::mem::take(&mut state.pending)
        };

        #[cfg(feature = "tracing")]
        tracing::info!(container_id = %handle.shared.id, "Container started");
        #[cfg(feature = "log")]
        log::info!("Container started container_id={}", handle.shared.id);

        handler.lock().on_container_start(&handle);
        for start in pending {
            start(&handle, handler.clone());
        }

        runtime.block_on(handle.wait_until_done());

        handler.lock().on_container_stop(&handle);
        handle.shared.state.lock().handler = None;

        #[cfg(feature = "tracing")]
        tracing::info!(container_id = %handle.shared.id, "Container stopped");
        #[cfg(feature = "log")]
        log::info!("Container stopped container_id={}", handle.shared.id);

        runtime.shutdown_timeout(Duration::from_millis(100));
        Ok(())
    }
}

/// Starts a connection or listener once the container has a handler
type PendingStart = Box<dyn FnOnce(&ContainerHandle, SharedHandler) + Send + 'static>;

#[derive(Default)]
struct RunState {
    handler: Option<SharedHandler>,
    pending: Vec<PendingStart>,
}

struct Shared {
    id: String,
    runtime: tokio::runtime::Handle,
    scheduling: Scheduling,
    auto_stop: bool,
    state: Mutex<RunState>,
    active: AtomicUsize,
    changed: Notify,
    stop: CancellationToken,
}

/// Keeps a container running while a connection or listener is alive
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    shared: Arc<Shared>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        self.shared.changed.notify_waiters();
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("id", &self.id)
            .field("scheduling", &self.scheduling)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

/// A cloneable handle to a [`Container`]
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    shared: Arc<Shared>,
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Closes every connection and listener. [`Container::run`] returns once they are gone
    pub fn stop(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(container_id = %self.shared.id, "Container stopping");
        #[cfg(feature = "log")]
        log::debug!("Container stopping container_id={}", self.shared.id);

        self.shared.stop.cancel();
        self.shared.changed.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Opens a connection whose events go to the container's handler
    pub fn connect(&self, url: &str, options: ConnectionOptions) -> Result<WorkQueue, Error> {
        self.start_client(url, options, None, |_, _, _| Ok(()))
            .map(|(work_queue, _)| work_queue)
    }

    /// Opens a connection whose events go to `handler`
    pub fn connect_with<H: MessagingHandler>(
        &self,
        url: &str,
        options: ConnectionOptions,
        handler: H,
    ) -> Result<WorkQueue, Error> {
        let handler = handler::shared(handler);
        self.start_client(url, options, Some(handler), |_, _, _| Ok(()))
            .map(|(work_queue, _)| work_queue)
    }

    /// Opens a connection to the host of `url` with a single sender whose target is the
    /// path of `url`. Closing the sender closes the connection
    pub fn open_sender(&self, url: &str, options: SenderOptions) -> Result<ThreadSafeSender, Error> {
        let (_, sender) = self.start_client(
            url,
            ConnectionOptions::default(),
            None,
            move |connection, work_queue, url| {
                let mut options = options;
                if options.target.is_none() {
                    options.target = address_of(url);
                }
                let link = connection.open_sender(None, options)?;
                let gate = connection.sender_gate(link, work_queue)?;
                Ok(ThreadSafeSender::new(gate, true))
            },
        )?;
        Ok(sender)
    }

    /// Opens a connection to the host of `url` with a single receiver whose source is the
    /// path of `url`. Closing the stream's link closes the connection
    pub fn open_receiver(&self, url: &str, options: ReceiverOptions) -> Result<Deliveries, Error> {
        let (_, deliveries) = self.start_client(
            url,
            ConnectionOptions::default(),
            None,
            move |connection, work_queue, url| {
                let mut options = options;
                if options.source.is_none() {
                    options.source = address_of(url);
                }
                let link = connection.open_receiver(None, options)?;
                let (tx, rx) = mpsc::unbounded_channel();
                connection.set_deliveries_sink(link, tx)?;
                Ok(Deliveries::new(rx, link, work_queue.clone(), true))
            },
        )?;
        Ok(deliveries)
    }

    /// Accepts incoming connections on `addr`. Their events go to the container's handler
    pub fn listen(&self, addr: &str, options: ListenerOptions) -> Result<ListenerHandle, Error> {
        listener::listen(self, addr, options, None)
    }

    /// Accepts incoming connections on `addr`. Their events go to `handler`
    pub fn listen_with<H: MessagingHandler>(
        &self,
        addr: &str,
        options: ListenerOptions,
        handler: H,
    ) -> Result<ListenerHandle, Error> {
        listener::listen(self, addr, options, Some(handler::shared(handler)))
    }

    /* -------------------------------- Internals -------------------------------- */

    /// Builds a client connection, lets `setup` open its links, then starts it
    fn start_client<T, F>(
        &self,
        url: &str,
        options: ConnectionOptions,
        handler: Option<SharedHandler>,
        setup: F,
    ) -> Result<(WorkQueue, T), Error>
    where
        F: FnOnce(&mut Connection, &WorkQueue, &Url) -> Result<T, Error>,
    {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        let primary = parse_endpoint(url)?;
        let mut endpoints = vec![primary.clone()];
        if let Some(reconnect) = &options.reconnect {
            for failover in &reconnect.failover_urls {
                endpoints.push(parse_endpoint(failover)?);
            }
        }

        let container_id = options
            .container_id
            .clone()
            .unwrap_or_else(|| self.shared.id.clone());
        let hostname = options
            .hostname
            .clone()
            .or_else(|| primary.host_str().map(String::from));
        let backoff = Backoff::new(endpoints, options.reconnect.clone());

        let mut connection = Connection::new(container_id, hostname, options, false);
        let (work_queue, work_rx) = WorkQueue::new();
        let output = setup(&mut connection, &work_queue, &primary)?;

        let active = self.register();
        let engine_queue = work_queue.clone();
        self.schedule(Box::new(move |container, default_handler| {
            let engine = ConnectionEngine::new(
                connection,
                handler.unwrap_or(default_handler),
                container.clone(),
                engine_queue,
                work_rx,
                active,
            );
            container.spawn(engine.run_client(backoff));
        }));

        Ok((work_queue, output))
    }

    /// Runs `start` now if the container is running, otherwise once it starts
    fn schedule(&self, start: PendingStart) {
        let mut state = self.shared.state.lock();
        match state.handler.clone() {
            Some(handler) => {
                drop(state);
                start(self, handler);
            }
            None => state.pending.push(start),
        }
    }

    pub(crate) fn register(&self) -> ActiveGuard {
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        ActiveGuard {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.shared.stop.clone()
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.shared.runtime
    }

    /// Spawns the task serving one connection according to the scheduling
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.shared.scheduling {
            Scheduling::WorkerPool(_) => {
                self.shared.runtime.spawn(future);
            }
            Scheduling::ThreadPerConnection => {
                let result = std::thread::Builder::new()
                    .name(format!("{}-connection", self.shared.id))
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime.block_on(future),
                            Err(_err) => {
                                #[cfg(feature = "tracing")]
                                tracing::error!(error = %_err, "Failed to build connection runtime");
                                #[cfg(feature = "log")]
                                log::error!("Failed to build connection runtime error={}", _err);
                            }
                        }
                    });
                if let Err(_err) = result {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %_err, "Failed to spawn connection thread");
                    #[cfg(feature = "log")]
                    log::error!("Failed to spawn connection thread error={}", _err);
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.shared.auto_stop && self.shared.active.load(Ordering::Acquire) == 0
    }

    async fn wait_until_done(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_done() {
                return;
            }
            if self.is_stopped() {
                break;
            }
            notified.await;
        }

        // Give connections the chance to close cleanly
        let idle = async {
            loop {
                let notified = self.shared.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, idle).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(container_id = %self.shared.id, "Connections still open after shutdown timeout");
            #[cfg(feature = "log")]
            log::warn!("Connections still open after shutdown timeout container_id={}", self.shared.id);
        }
    }
}
