//! Frame codecs for the AMQP and SASL frame types

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};

pub mod amqp;
pub mod error;
pub mod sasl;

pub use error::Error;

/// Frame type of AMQP frames
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Frame type of SASL frames
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Size of the fixed frame header, including the 4 byte size field
pub const FRAME_HEADER_SIZE: usize = 8;

/// Data offset of a frame without extended header, in 4 byte words
pub(crate) const DOFF: u8 = 2;

/// Serializes a frame body after the frame header already written to `dst`
pub(crate) fn encode_body<T: Serialize>(dst: &mut BytesMut, body: &T) -> Result<(), Error> {
    let mut serializer = Serializer::from((&mut *dst).writer());
    body.serialize(&mut serializer)
        .map_err(|err| Error::EncodeError(err.to_string()))
}

/// Deserializes a frame body from the front of `src`, leaving any payload behind it
pub(crate) fn decode_body<T: DeserializeOwned>(src: &mut BytesMut) -> Result<T, Error> {
    let reader = IoReader::new(src.reader());
    let mut deserializer = Deserializer::new(reader);
    Ok(T::deserialize(&mut deserializer)?)
}
