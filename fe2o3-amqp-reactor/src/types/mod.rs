//! AMQP 1.0 types exchanged on the wire
//!
//! Encoding and decoding of every primitive type is delegated to `serde_amqp`; this
//! module only defines the composite types the messaging core exchanges.

pub mod definitions;
pub mod message;
pub mod messaging;
pub mod performatives;
pub mod sasl;

pub use serde_amqp::primitives::{Array, Binary, Symbol};
pub use serde_amqp::value::Value;
