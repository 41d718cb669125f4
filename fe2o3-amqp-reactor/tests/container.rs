use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use fe2o3_amqp_reactor::{
    connection,
    sasl_profile::SaslAcceptor,
    transport,
    types::definitions::{self, ErrorCondition},
    ConnectionOptions, Container, Context, CreditMode, Delivery, LinkId, ListenerOptions, Message,
    MessagingHandler, Outcome, ReceiverOptions, ReconnectOptions, Scheduling, SendError,
    SenderOptions, Tracker,
};
use parking_lot::Mutex;

mod common;

use common::{cutting_proxy, unused_port, watchdog, Noop, Peer};

const TIMEOUT: Duration = Duration::from_secs(20);

/// Sends `total` messages and closes once every one of them is accepted
#[derive(Debug, Default)]
struct CountingSender {
    total: usize,
    sent: usize,
    accepted: Arc<AtomicUsize>,
    accepted_at_close: Arc<AtomicUsize>,
}

impl MessagingHandler for CountingSender {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        ctx.open_sender(SenderOptions::new().target("queue")).unwrap();
    }

    fn on_sendable(&mut self, ctx: &mut Context<'_>, link: LinkId, credit: u32) {
        for _ in 0..credit {
            if self.sent == self.total {
                break;
            }
            ctx.send(link, Message::new(self.sent as u64)).unwrap();
            self.sent += 1;
        }
    }

    fn on_settled(&mut self, ctx: &mut Context<'_>, tracker: &Tracker) {
        if *tracker.outcome() == Outcome::Accepted {
            let accepted = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
            if accepted == self.total {
                self.accepted_at_close.store(accepted, Ordering::SeqCst);
                ctx.close();
            }
        }
    }
}

fn run_counting_sender(scheduling: Scheduling) {
    let container = Container::builder().scheduling(scheduling).build().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        stop_on_close: true,
        ..Default::default()
    };
    let received = peer.received.clone();
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    let sender = CountingSender {
        total: 10,
        ..Default::default()
    };
    let accepted = sender.accepted.clone();
    let accepted_at_close = sender.accepted_at_close.clone();
    let url = format!("amqp://{}/queue", listener.local_addr());
    handle
        .connect_with(&url, ConnectionOptions::default(), sender)
        .unwrap();

    container.run(Noop).unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 10);
    assert_eq!(accepted.load(Ordering::SeqCst), 10);
    assert_eq!(accepted_at_close.load(Ordering::SeqCst), 10);
}

#[test]
fn close_after_every_delivery_is_accepted() {
    run_counting_sender(Scheduling::WorkerPool(2));
}

#[test]
fn thread_per_connection_runs_the_same_exchange() {
    run_counting_sender(Scheduling::ThreadPerConnection);
}

/// Records the endpoint that accepted the connection
#[derive(Debug, Default)]
struct FailoverClient {
    connected_port: Arc<Mutex<Option<u16>>>,
    transport_errors: Arc<AtomicUsize>,
}

impl MessagingHandler for FailoverClient {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        *self.connected_port.lock() = ctx.connected_url().and_then(|url| url.port());
        ctx.close();
    }

    fn on_transport_error(&mut self, _ctx: &mut Context<'_>, _error: &transport::Error) {
        self.transport_errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn connect_falls_over_to_the_backup_endpoint() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        stop_on_close: true,
        ..Default::default()
    };
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();
    let backup_port = listener.local_addr().port();

    let client = FailoverClient::default();
    let connected_port = client.connected_port.clone();
    let transport_errors = client.transport_errors.clone();
    let options = ConnectionOptions::builder()
        .failover_urls([format!("127.0.0.1:{}", backup_port)])
        .build();
    let primary = format!("127.0.0.1:{}", unused_port());
    handle.connect_with(&primary, options, client).unwrap();

    container.run(Noop).unwrap();

    assert_eq!(*connected_port.lock(), Some(backup_port));
    assert!(transport_errors.load(Ordering::SeqCst) >= 1);
}

/// Reports whether the connection opened or failed
#[derive(Debug, Default)]
struct OpenOrFail {
    opened: Arc<AtomicUsize>,
    error: Arc<Mutex<Option<String>>>,
}

impl MessagingHandler for OpenOrFail {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        ctx.close();
    }

    fn on_connection_close(&mut self, ctx: &mut Context<'_>) {
        ctx.container().stop();
    }

    fn on_error(&mut self, ctx: &mut Context<'_>, error: &connection::Error) {
        *self.error.lock() = Some(error.to_string());
        ctx.container().stop();
    }
}

fn sasl_plain_listener_options() -> ListenerOptions {
    ListenerOptions::new().sasl(SaslAcceptor::plain([(
        String::from("guest"),
        String::from("secret"),
    )]))
}

#[test]
fn sasl_plain_with_url_credentials() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let listener = handle
        .listen_with("127.0.0.1:0", sasl_plain_listener_options(), Peer::default())
        .unwrap();

    let client = OpenOrFail::default();
    let opened = client.opened.clone();
    let error = client.error.clone();
    let url = format!("amqp://guest:secret@{}", listener.local_addr());
    let options = ConnectionOptions::builder()
        .sasl_allow_insecure_mechs(true)
        .build();
    handle.connect_with(&url, options, client).unwrap();

    container.run(Noop).unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(error.lock().is_none());
}

#[test]
fn sasl_plain_with_wrong_password_fails_once() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let listener = handle
        .listen_with("127.0.0.1:0", sasl_plain_listener_options(), Peer::default())
        .unwrap();

    let client = OpenOrFail::default();
    let opened = client.opened.clone();
    let error = client.error.clone();
    let url = format!("amqp://{}", listener.local_addr());
    let options = ConnectionOptions::builder()
        .user("guest")
        .password("wrong")
        .sasl_allow_insecure_mechs(true)
        .build();
    handle.connect_with(&url, options, client).unwrap();

    container.run(Noop).unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 0);
    let error = error.lock().clone().unwrap();
    assert!(error.contains("Security"), "{}", error);
}

#[test]
fn plain_over_plain_tcp_is_refused_by_default() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let listener = handle
        .listen_with("127.0.0.1:0", sasl_plain_listener_options(), Peer::default())
        .unwrap();

    let client = OpenOrFail::default();
    let error = client.error.clone();
    let url = format!("amqp://guest:secret@{}", listener.local_addr());
    handle
        .connect_with(&url, ConnectionOptions::default(), client)
        .unwrap();

    container.run(Noop).unwrap();

    assert!(error.lock().is_some());
}

/// Accepts deliveries only after the current callback returned, tracking how many were
/// outstanding at once
#[derive(Debug, Default)]
struct WindowedReceiver {
    total: usize,
    received: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: Arc<AtomicUsize>,
}

impl MessagingHandler for WindowedReceiver {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        let options = ReceiverOptions::new()
            .source("queue")
            .credit_mode(CreditMode::Auto(3));
        ctx.open_receiver(options).unwrap();
    }

    fn on_message(&mut self, ctx: &mut Context<'_>, delivery: &Delivery, _message: Message) {
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);
        let received = self.received.fetch_add(1, Ordering::SeqCst) + 1;

        let delivery = delivery.clone();
        let outstanding = self.outstanding.clone();
        let done = received == self.total;
        ctx.work_queue()
            .add(move |ctx| {
                ctx.accept(&delivery).unwrap();
                outstanding.fetch_sub(1, Ordering::SeqCst);
                if done {
                    ctx.close();
                }
            })
            .unwrap();
    }
}

#[test]
fn receiver_window_bounds_unsettled_deliveries() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        to_send: 10,
        stop_on_close: true,
        ..Default::default()
    };
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    let receiver = WindowedReceiver {
        total: 10,
        ..Default::default()
    };
    let received = receiver.received.clone();
    let max_outstanding = receiver.max_outstanding.clone();
    let url = listener.local_addr().to_string();
    handle
        .connect_with(&url, ConnectionOptions::default(), receiver)
        .unwrap();

    container.run(Noop).unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 10);
    let max = max_outstanding.load(Ordering::SeqCst);
    assert!((1..=3).contains(&max), "max outstanding {}", max);
}

/// Records the error a refused link was closed with
#[derive(Debug, Default)]
struct RefusedLink {
    condition: Arc<Mutex<Option<ErrorCondition>>>,
}

impl MessagingHandler for RefusedLink {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        ctx.open_sender(SenderOptions::new().target("nowhere")).unwrap();
    }

    fn on_link_close(&mut self, ctx: &mut Context<'_>, _link: LinkId, error: Option<&definitions::Error>) {
        *self.condition.lock() = error.map(|error| error.condition.clone());
        ctx.close();
    }
}

#[test]
fn refused_link_is_reported_without_closing_the_connection() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        refuse_links: true,
        stop_on_close: true,
        ..Default::default()
    };
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    let client = RefusedLink::default();
    let condition = client.condition.clone();
    handle
        .connect_with(&listener.local_addr().to_string(), ConnectionOptions::default(), client)
        .unwrap();

    container.run(Noop).unwrap();

    assert_eq!(*condition.lock(), Some(ErrorCondition::NotFound));
}

#[test]
fn thread_safe_sender_from_many_threads() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        stop_on_close: true,
        ..Default::default()
    };
    let received = peer.received.clone();
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    let url = format!("amqp://{}/queue", listener.local_addr());
    let sender = handle.open_sender(&url, SenderOptions::new()).unwrap();

    let producer = thread::spawn(move || {
        let workers: Vec<_> = (0..5)
            .map(|i| {
                let sender = sender.clone();
                thread::spawn(move || sender.send(format!("from thread {}", i)))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }
        sender.close().unwrap();
    });

    container.run(Noop).unwrap();
    producer.join().unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 5);
}

/// Queues `total` messages on the first open and tracks their outcomes across a reconnect
#[derive(Debug, Default)]
struct ReconnectingSender {
    total: usize,
    reconnect_flags: Arc<Mutex<Vec<bool>>>,
    unknown: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

impl MessagingHandler for ReconnectingSender {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        self.reconnect_flags.lock().push(ctx.is_reconnect());
        if ctx.is_reconnect() {
            return;
        }
        let link = ctx.open_sender(SenderOptions::new().target("queue")).unwrap();
        for i in 0..self.total {
            ctx.send(link, Message::new(i as u64)).unwrap();
        }
    }

    fn on_settled(&mut self, ctx: &mut Context<'_>, tracker: &Tracker) {
        match tracker.outcome() {
            Outcome::Unknown => self.unknown.fetch_add(1, Ordering::SeqCst),
            Outcome::Accepted => self.accepted.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
        let done = self.unknown.load(Ordering::SeqCst) + self.accepted.load(Ordering::SeqCst);
        if done == self.total {
            ctx.close();
        }
    }

    fn on_connection_close(&mut self, ctx: &mut Context<'_>) {
        ctx.container().stop();
    }
}

/// Leaves the first `hold` messages unsettled, then has the network cut. Later messages are
/// accepted
#[derive(Debug)]
struct HoldingPeer {
    hold: usize,
    held: usize,
    cut: Option<mpsc::Sender<()>>,
    accepted: Arc<AtomicUsize>,
}

impl MessagingHandler for HoldingPeer {
    fn on_message(&mut self, ctx: &mut Context<'_>, delivery: &Delivery, _message: Message) {
        if self.held < self.hold {
            self.held += 1;
            if self.held == self.hold {
                if let Some(cut) = self.cut.take() {
                    cut.send(()).unwrap();
                }
            }
            return;
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        ctx.accept(delivery).unwrap();
    }
}

#[test]
fn reconnect_reports_in_flight_as_unknown_and_sends_the_queue() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let (cut_tx, cut_rx) = mpsc::channel();
    let peer = HoldingPeer {
        hold: 2,
        held: 0,
        cut: Some(cut_tx),
        accepted: Arc::new(AtomicUsize::new(0)),
    };
    let peer_accepted = peer.accepted.clone();
    // A window of 2 leaves the rest queued at the client while the first two are held
    let receiver_defaults = ReceiverOptions::new()
        .credit_mode(CreditMode::Auto(2))
        .auto_accept(false);
    let listener_options = ListenerOptions::new().connection_options(
        ConnectionOptions::builder()
            .receiver_options(receiver_defaults)
            .build(),
    );
    let listener = handle
        .listen_with("127.0.0.1:0", listener_options, peer)
        .unwrap();
    let proxy = cutting_proxy(listener.local_addr(), cut_rx);

    let client = ReconnectingSender {
        total: 5,
        ..Default::default()
    };
    let reconnect_flags = client.reconnect_flags.clone();
    let unknown = client.unknown.clone();
    let accepted = client.accepted.clone();
    let options = ConnectionOptions::builder()
        .reconnect(ReconnectOptions::default())
        .build();
    handle
        .connect_with(&format!("amqp://{}/queue", proxy), options, client)
        .unwrap();

    container.run(Noop).unwrap();

    assert_eq!(*reconnect_flags.lock(), vec![false, true]);
    assert_eq!(unknown.load(Ordering::SeqCst), 2);
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(peer_accepted.load(Ordering::SeqCst), 3);
}

/// Panics on the first message
#[derive(Debug)]
struct PanicsOnMessage;

impl MessagingHandler for PanicsOnMessage {
    fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
        ctx.open_receiver(ReceiverOptions::new().source("queue")).unwrap();
    }

    fn on_message(&mut self, _ctx: &mut Context<'_>, _delivery: &Delivery, _message: Message) {
        panic!("handler failed on purpose");
    }
}

#[test]
fn panicking_handler_closes_with_internal_error() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    let peer = Peer {
        to_send: 1,
        stop_on_close: true,
        ..Default::default()
    };
    let connection_error = peer.connection_error.clone();
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    handle
        .connect_with(
            &listener.local_addr().to_string(),
            ConnectionOptions::default(),
            PanicsOnMessage,
        )
        .unwrap();

    container.run(Noop).unwrap();

    assert_eq!(*connection_error.lock(), Some(ErrorCondition::InternalError));
}

/// Closes every link the client attaches, after a while, with `resource-deleted`
#[derive(Debug)]
struct ClosesLinksLater {
    delay: Duration,
}

impl MessagingHandler for ClosesLinksLater {
    fn on_link_open(&mut self, ctx: &mut Context<'_>, link: LinkId) {
        let work_queue = ctx.work_queue();
        let delay = self.delay;
        thread::spawn(move || {
            thread::sleep(delay);
            work_queue
                .add(move |ctx| {
                    let error = definitions::Error::new(
                        ErrorCondition::ResourceDeleted,
                        String::from("Queue deleted"),
                    );
                    ctx.close_link_with_error(link, error).unwrap();
                })
                .unwrap();
        });
    }

    fn on_connection_close(&mut self, ctx: &mut Context<'_>) {
        ctx.container().stop();
    }
}

#[test]
fn thread_safe_senders_blocked_on_credit_wake_when_the_link_closes() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), TIMEOUT);

    // No credit is ever granted
    let listener_options = ListenerOptions::new().connection_options(
        ConnectionOptions::builder()
            .receiver_options(ReceiverOptions::new().credit_mode(CreditMode::Manual(0)))
            .build(),
    );
    let peer = ClosesLinksLater {
        delay: Duration::from_millis(300),
    };
    let listener = handle
        .listen_with("127.0.0.1:0", listener_options, peer)
        .unwrap();

    let url = format!("amqp://{}/queue", listener.local_addr());
    let sender = handle.open_sender(&url, SenderOptions::new()).unwrap();

    let producer = thread::spawn(move || {
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let sender = sender.clone();
                thread::spawn(move || sender.send(format!("blocked {}", i)))
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect();
        sender.close().unwrap();
        results
    });

    container.run(Noop).unwrap();
    let results = producer.join().unwrap();

    assert_eq!(results.len(), 4);
    for result in results {
        match result {
            Err(SendError::LinkClosed(Some(error))) => {
                assert_eq!(error.condition, ErrorCondition::ResourceDeleted)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
