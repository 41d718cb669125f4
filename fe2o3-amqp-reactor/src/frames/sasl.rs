//! SASL frame type and corresponding encoder and decoder

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::sasl::{SaslChallenge, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse};

use super::{decode_body, encode_body, Error, DOFF, FRAME_HEADER_SIZE, FRAME_TYPE_SASL};

/// SASL frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Challenge(SaslChallenge),
    Response(SaslResponse),
    Outcome(SaslOutcome),
}

/// Descriptor codes and names of the SASL frame bodies
const BODIES: [(u64, &str); 5] = [
    (0x40, "amqp:sasl-mechanisms:list"),
    (0x41, "amqp:sasl-init:list"),
    (0x42, "amqp:sasl-challenge:list"),
    (0x43, "amqp:sasl-response:list"),
    (0x44, "amqp:sasl-outcome:list"),
];

/// Reads the descriptor of the body at the front of `src` without consuming it
fn descriptor_code(src: &[u8]) -> Result<u64, Error> {
    let by_name = |name: &[u8]| {
        BODIES
            .iter()
            .find(|(_, symbol)| symbol.as_bytes() == name)
            .map(|(code, _)| *code)
    };
    let code = match src {
        [0x00, 0x53, code, ..] => Some(*code as u64),
        [0x00, 0x80, rest @ ..] => rest
            .get(..8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes),
        [0x00, 0xa3, len, rest @ ..] => rest.get(..*len as usize).and_then(by_name),
        _ => None,
    };
    code.ok_or_else(|| Error::DecodeError(String::from("Missing SASL frame body descriptor")))
}

/// Encodes and decodes the part of a SASL frame that follows the 4 byte size field
#[derive(Debug, Default)]
pub struct FrameCodec {}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // The extended header is ignored, bytes 6 and 7 are set to zero
        dst.put_u8(DOFF);
        dst.put_u8(FRAME_TYPE_SASL);
        dst.put_u16(0x0000);

        match item {
            Frame::Mechanisms(body) => encode_body(dst, &body),
            Frame::Init(body) => encode_body(dst, &body),
            Frame::Challenge(body) => encode_body(dst, &body),
            Frame::Response(body) => encode_body(dst, &body),
            Frame::Outcome(body) => encode_body(dst, &body),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE - 4 {
            return Err(Error::MalformedHeader);
        }
        let doff = src.get_u8();
        let ftype = src.get_u8();
        let _ignored = src.get_u16();

        if ftype != FRAME_TYPE_SASL {
            return Err(Error::UnexpectedFrameType(ftype));
        }
        if doff != DOFF {
            return Err(Error::MalformedHeader);
        }

        let frame = match descriptor_code(src)? {
            0x40 => Frame::Mechanisms(decode_body(src)?),
            0x41 => Frame::Init(decode_body(src)?),
            0x42 => Frame::Challenge(decode_body(src)?),
            0x43 => Frame::Response(decode_body(src)?),
            0x44 => Frame::Outcome(decode_body(src)?),
            code => {
                return Err(Error::DecodeError(format!(
                    "Unknown SASL frame body {:#x}",
                    code
                )))
            }
        };
        Ok(Some(frame))
    }
}
