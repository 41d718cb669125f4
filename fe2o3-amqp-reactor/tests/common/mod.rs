#![allow(dead_code)]

use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use fe2o3_amqp_reactor::{
    types::definitions::{Error as AmqpError, ErrorCondition},
    ContainerHandle, Context, Delivery, LinkId, Message, MessagingHandler,
};

/// Stops the container if a test hangs
pub fn watchdog(container: ContainerHandle, timeout: Duration) {
    thread::spawn(move || {
        thread::sleep(timeout);
        container.stop();
    });
}

/// A port nothing listens on
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Forwards every connection to `target`. The first one is cut in both directions once
/// `cut` receives, the way a failing network would
pub fn cutting_proxy(target: SocketAddr, cut: mpsc::Receiver<()>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut cut = Some(cut);
        for client in listener.incoming() {
            let Ok(client) = client else { break };
            let Ok(upstream) = TcpStream::connect(target) else { break };
            pipe(client.try_clone().unwrap(), upstream.try_clone().unwrap());
            pipe(upstream.try_clone().unwrap(), client.try_clone().unwrap());
            if let Some(cut) = cut.take() {
                thread::spawn(move || {
                    if cut.recv().is_ok() {
                        let _ = client.shutdown(Shutdown::Both);
                        let _ = upstream.shutdown(Shutdown::Both);
                    }
                });
            }
        }
    });
    addr
}

fn pipe(mut from: TcpStream, mut to: TcpStream) {
    thread::spawn(move || {
        let _ = io::copy(&mut from, &mut to);
        let _ = to.shutdown(Shutdown::Write);
    });
}

/// Peer side of the tests: accepts every message and sends `to_send` messages on every
/// link the client attaches as a receiver
#[derive(Debug, Default, Clone)]
pub struct Peer {
    pub received: Arc<AtomicUsize>,
    pub to_send: usize,
    pub sent: Arc<AtomicUsize>,
    pub refuse_links: bool,
    pub stop_on_close: bool,
    pub connection_error: Arc<Mutex<Option<ErrorCondition>>>,
}

impl MessagingHandler for Peer {
    fn on_link_open(&mut self, ctx: &mut Context<'_>, link: LinkId) {
        if self.refuse_links {
            let error = AmqpError::new(ErrorCondition::NotFound, String::from("Invalid address"));
            ctx.close_link_with_error(link, error).unwrap();
        }
    }

    fn on_sendable(&mut self, ctx: &mut Context<'_>, link: LinkId, credit: u32) {
        for _ in 0..credit {
            let n = self.sent.load(Ordering::SeqCst);
            if n >= self.to_send {
                break;
            }
            ctx.send(link, Message::new(format!("message-{}", n))).unwrap();
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_message(&mut self, ctx: &mut Context<'_>, delivery: &Delivery, _message: Message) {
        self.received.fetch_add(1, Ordering::SeqCst);
        ctx.accept(delivery).unwrap();
    }

    fn on_connection_error(&mut self, _ctx: &mut Context<'_>, error: &AmqpError) {
        *self.connection_error.lock() = Some(error.condition.clone());
    }

    fn on_connection_close(&mut self, ctx: &mut Context<'_>) {
        if self.stop_on_close {
            ctx.container().stop();
        }
    }
}

/// Default handler of a container whose connections all have their own handler
#[derive(Debug)]
pub struct Noop;

impl MessagingHandler for Noop {}
