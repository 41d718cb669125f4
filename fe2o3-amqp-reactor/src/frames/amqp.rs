//! AMQP frame type and corresponding encoder and decoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};

use super::{decode_body, encode_body, Error, DOFF, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP};

/// AMQP frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// AMQP frame channel
    pub channel: u16,

    /// AMQP frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new AMQP frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Creates an emtpy frame. The empty frame is only used to reset
    /// the remote idle timeout
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// AMQP frame body
#[derive(Clone, PartialEq)]
pub enum FrameBody {
    // Frames handled by Connection
    /// Open performative
    Open(Open),

    /// Close performative
    Close(Close),

    // Frames handled by Session
    /// Begin performative
    Begin(Begin),

    /// End performative
    End(End),

    // Frames handled by Link
    /// Attach performative
    Attach(Attach),

    /// Flow performative
    Flow(Flow),

    /// Transfer performative and payload
    Transfer {
        /// Transfer performative
        performative: Transfer,

        /// Binary payload
        payload: Bytes,
    },

    /// Disposition performative
    Disposition(Disposition),

    /// Detach performative
    Detach(Detach),

    /// An empty frame used only for resetting idle timeout
    Empty,
}

impl FrameBody {
    /// Wraps a performative with an empty payload
    pub fn from_performative(performative: Performative) -> Self {
        match performative {
            Performative::Open(p) => FrameBody::Open(p),
            Performative::Begin(p) => FrameBody::Begin(p),
            Performative::Attach(p) => FrameBody::Attach(p),
            Performative::Flow(p) => FrameBody::Flow(p),
            Performative::Transfer(performative) => FrameBody::Transfer {
                performative,
                payload: Bytes::new(),
            },
            Performative::Disposition(p) => FrameBody::Disposition(p),
            Performative::Detach(p) => FrameBody::Detach(p),
            Performative::End(p) => FrameBody::End(p),
            Performative::Close(p) => FrameBody::Close(p),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            FrameBody::Open(_) => "open",
            FrameBody::Close(_) => "close",
            FrameBody::Begin(_) => "begin",
            FrameBody::End(_) => "end",
            FrameBody::Attach(_) => "attach",
            FrameBody::Flow(_) => "flow",
            FrameBody::Transfer { .. } => "transfer",
            FrameBody::Disposition(_) => "disposition",
            FrameBody::Detach(_) => "detach",
            FrameBody::Empty => "empty",
        }
    }
}

impl std::fmt::Debug for FrameBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(arg0) => f.debug_tuple("Attach").field(arg0).finish(),
            Self::Flow(arg0) => f.debug_tuple("Flow").field(arg0).finish(),
            Self::Transfer {
                performative,
                payload,
            } => f
                .debug_struct("Transfer")
                .field("performative", performative)
                .field("payload.len", &payload.len())
                .finish(),
            Self::Disposition(arg0) => f.debug_tuple("Disposition").field(arg0).finish(),
            Self::Detach(arg0) => f.debug_tuple("Detach").field(arg0).finish(),
            Self::Begin(arg0) => f.debug_tuple("Begin").field(arg0).finish(),
            Self::End(arg0) => f.debug_tuple("End").field(arg0).finish(),
            Self::Open(arg0) => f.debug_tuple("Open").field(arg0).finish(),
            Self::Close(arg0) => f.debug_tuple("Close").field(arg0).finish(),
            Self::Empty => write!(f, "Empty"),
        }
    }
}

fn write_header(dst: &mut BytesMut, channel: u16) {
    // AMQP frame ignores extended header, thus doff should always be 2
    dst.put_u8(DOFF);
    dst.put_u8(FRAME_TYPE_AMQP);
    dst.put_u16(channel);
}

/// Encodes and decodes the part of a frame that follows the 4 byte size field.
///
/// The size field itself is handled by `LengthDelimitedCodec` in the transport.
#[derive(Debug, Default)]
pub struct FrameCodec {}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_header(dst, item.channel);
        match item.body {
            FrameBody::Open(performative) => encode_body(dst, &performative),
            FrameBody::Begin(performative) => encode_body(dst, &performative),
            FrameBody::Attach(performative) => encode_body(dst, &performative),
            FrameBody::Flow(performative) => encode_body(dst, &performative),
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                encode_body(dst, &performative)?;
                dst.put(payload);
                Ok(())
            }
            FrameBody::Disposition(performative) => encode_body(dst, &performative),
            FrameBody::Detach(performative) => encode_body(dst, &performative),
            FrameBody::End(performative) => encode_body(dst, &performative),
            FrameBody::Close(performative) => encode_body(dst, &performative),
            FrameBody::Empty => Ok(()),
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
        let channel = src.get_u16();

        // check type byte
        if ftype != FRAME_TYPE_AMQP {
            return Err(Error::UnexpectedFrameType(ftype));
        }

        // skip the extended header if there is one
        let extended = (doff as usize * 4)
            .checked_sub(FRAME_HEADER_SIZE)
            .ok_or(Error::MalformedHeader)?;
        if src.len() < extended {
            return Err(Error::MalformedHeader);
        }
        src.advance(extended);

        let body = if src.is_empty() {
            FrameBody::Empty
        } else {
            match decode_body::<Performative>(src)? {
                Performative::Transfer(performative) => {
                    let payload = src.split().freeze();
                    FrameBody::Transfer {
                        performative,
                        payload,
                    }
                }
                performative => FrameBody::from_performative(performative),
            }
        };

        Ok(Some(Frame { channel, body }))
    }
}

/// Encodes a complete frame, including its size field
pub fn encode_frame(frame: Frame) -> Result<Bytes, Error> {
    let mut body = BytesMut::new();
    FrameCodec {}.encode(frame, &mut body)?;
    let mut dst = BytesMut::with_capacity(body.len() + 4);
    dst.put_u32(body.len() as u32 + 4);
    dst.put(body);
    Ok(dst.freeze())
}

/// Decodes one complete frame from the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the number of
/// bytes it occupied.
pub fn decode_frame(src: &[u8]) -> Result<Option<(Frame, usize)>, Error> {
    if src.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if size < FRAME_HEADER_SIZE {
        return Err(Error::MalformedHeader);
    }
    if src.len() < size {
        return Ok(None);
    }
    let mut body = BytesMut::from(&src[4..size]);
    match (FrameCodec {}).decode(&mut body)? {
        Some(frame) => Ok(Some((frame, size))),
        None => Ok(None),
    }
}

fn encoded_len(transfer: &Transfer) -> Result<usize, Error> {
    serde_amqp::to_vec(transfer)
        .map(|buf| buf.len())
        .map_err(|err| Error::EncodeError(err.to_string()))
}

/// Splits a transfer into as many frames as `max_frame_size` requires.
///
/// Only the first frame carries the delivery id, tag, format, settlement and state. Every
/// frame except the last one has `more` set.
pub fn split_transfer(
    mut transfer: Transfer,
    mut payload: Bytes,
    max_frame_size: usize,
) -> Result<Vec<(Transfer, Bytes)>, Error> {
    let max_frame_body_size = max_frame_size.saturating_sub(FRAME_HEADER_SIZE);
    let performative_len = encoded_len(&transfer)?;
    if performative_len + payload.len() <= max_frame_body_size {
        return Ok(vec![(transfer, payload)]);
    }

    let orig_more = transfer.more;
    let mut frames = Vec::new();

    // First frame
    transfer.more = true;
    let capacity = max_frame_body_size
        .checked_sub(encoded_len(&transfer)?)
        .filter(|c| *c > 0)
        .ok_or_else(|| Error::EncodeError(String::from("Max frame size is too small")))?;
    let partial = payload.split_to(capacity.min(payload.len()));
    frames.push((transfer.clone(), partial));

    // Middle frames
    let mut continuation = Transfer {
        handle: transfer.handle,
        delivery_id: None,
        delivery_tag: None,
        message_format: None,
        settled: None,
        more: true,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: false,
        batchable: transfer.batchable,
    };
    let capacity = max_frame_body_size
        .checked_sub(encoded_len(&continuation)?)
        .filter(|c| *c > 0)
        .ok_or_else(|| Error::EncodeError(String::from("Max frame size is too small")))?;
    while payload.len() > capacity {
        let partial = payload.split_to(capacity);
        frames.push((continuation.clone(), partial));
    }

    // Last frame
    continuation.more = orig_more;
    frames.push((continuation, payload));
    Ok(frames)
}
