#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A callback driven AMQP 1.0 messaging core built on `serde_amqp` and `tokio`.
//!
//! A [`Container`] runs connections on a worker pool, or on a thread per connection, and
//! reports their events to a [`MessagingHandler`]. Callbacks act on their connection through
//! a [`Context`]. Other threads act on a connection through its [`WorkQueue`], or send with a
//! blocking [`ThreadSafeSender`].
//!
//! Connections with a [`ReconnectOptions`] reconnect after a transport failure, trying the
//! primary endpoint and then each failover endpoint, and re-attach their sessions and links.
//! Deliveries that were in flight are reported through `on_settled` with
//! [`Outcome::Unknown`].
//!
//! # Feature flags
//!
//! ```toml
//! default = []
//! ```
//!
//! | Feature | Description |
//! |---------|-------------|
//! |`"rustls"`| enables `amqps` endpoints with `tokio-rustls` |
//! |`"tracing"`| enables logging with `tracing` |
//! |`"log"`| enables logging with `log` |
//!
//! # Quick start
//!
//! ```rust,no_run
//! use fe2o3_amqp_reactor::{
//!     Container, ConnectionOptions, Context, LinkId, MessagingHandler, SenderOptions, Tracker,
//! };
//!
//! struct HelloWorld;
//!
//! impl MessagingHandler for HelloWorld {
//!     fn on_connection_open(&mut self, ctx: &mut Context<'_>) {
//!         let _ = ctx.open_sender(SenderOptions::new().target("examples"));
//!     }
//!
//!     fn on_sendable(&mut self, ctx: &mut Context<'_>, link: LinkId, _credit: u32) {
//!         let _ = ctx.send(link, "hello world");
//!     }
//!
//!     fn on_settled(&mut self, ctx: &mut Context<'_>, _tracker: &Tracker) {
//!         ctx.close();
//!     }
//! }
//!
//! let container = Container::new().unwrap();
//! container
//!     .handle()
//!     .connect("localhost:5672", ConnectionOptions::default())
//!     .unwrap();
//! container.run(HelloWorld).unwrap();
//! ```

// Public mods
pub mod connection;
pub mod container;
pub mod delivery;
pub mod frames;
pub mod link;
pub mod sasl_profile;
pub mod session;
pub mod transport;
pub mod types;

// Private mods
mod context;
mod endpoint;
mod handler;
mod thread_safe;
mod util;
mod work_queue;

pub use connection::{ConnectionOptions, ConnectionState, ReconnectOptions};
pub use container::{Container, ContainerHandle, ListenerHandle, ListenerOptions, Scheduling};
pub use context::Context;
pub use delivery::{Delivery, Outcome, Tracker};
pub use handler::MessagingHandler;
pub use link::{CreditMode, Deliveries, IncomingDelivery, LinkId, ReceiverOptions, SenderOptions};
pub use session::{SessionId, SessionOptions};
pub use thread_safe::{SendError, ThreadSafeSender};
pub use types::message::Message;
pub use work_queue::WorkQueue;
