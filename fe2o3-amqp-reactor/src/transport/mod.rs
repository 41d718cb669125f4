//! Implements low level transport framing
//!
//! Two layer design.
//! layer 0: `tokio_util::codec::LengthDelimited` over `AsyncWrite`
//! layer 1: `frames::amqp::FrameCodec` turning the delimited bytes into frames
//!
//! Before layer 1 is bound, the protocol header exchange and the optional SASL layer run
//! directly over the byte stream.

use std::{convert::TryFrom, task::Poll, time::Duration};

use bytes::{Bytes, BytesMut};
use futures_util::{Future, Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::{
    frames::{
        amqp::{Frame, FrameCodec},
        sasl, FRAME_HEADER_SIZE,
    },
    sasl_profile::{SaslAcceptor, SaslConfig},
    types::{
        definitions::MIN_MAX_FRAME_SIZE,
        sasl::{SaslCode, SaslOutcome},
    },
    util::IdleTimeout,
};

pub mod error;
pub mod protocol_header;
#[cfg(feature = "rustls")]
#[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
pub mod tls;

pub use error::Error;
use protocol_header::ProtocolHeader;

/// Any byte stream a transport can run over
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type erased byte stream, either plain TCP or TLS wrapped
pub type BoxedIo = Box<dyn IoStream>;

/// Peer certificate verification for TLS connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Verify the certificate chain and that the certificate matches the host name
    #[default]
    VerifyPeerName,

    /// Verify the certificate chain only
    VerifyPeer,

    /// Accept any certificate
    AnonymousPeer,
}

/// TLS configuration used for `amqps` endpoints
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Path to a trusted CA certificate (DER or PEM). The webpki roots are used when absent
    pub ca_cert_path: Option<std::path::PathBuf>,

    /// How the peer certificate is verified
    pub verify_mode: VerifyMode,
}

pin_project! {
    /// A framed AMQP transport
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, LengthDelimitedCodec>,
        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> std::fmt::Debug for Transport<Io> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("idle_timeout", &self.idle_timeout.is_some())
            .finish()
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds the frame codec over a stream whose handshake is complete
    pub fn bind(io: Io, max_frame_size: usize, idle_timeout: Option<Duration>) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(max_frame_size.max(MIN_MAX_FRAME_SIZE))
            .length_adjustment(-4)
            .new_framed(io);
        let idle_timeout = idle_timeout
            .filter(|duration| !duration.is_zero())
            .map(IdleTimeout::new);

        Self {
            framed,
            idle_timeout,
        }
    }
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<Bytes>::poll_ready(this.framed, cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let mut bytesmut = BytesMut::new();
        let mut encoder = FrameCodec {};
        encoder.encode(item, &mut bytesmut)?;

        let this = self.project();
        this.framed
            .start_send(Bytes::from(bytesmut))
            .map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<Bytes>::poll_flush(this.framed, cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let this = self.project();
        Sink::<Bytes>::poll_close(this.framed, cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(mut delay) = this.idle_timeout.as_pin_mut() {
                    delay.reset();
                }

                match next {
                    Some(Ok(mut src)) => {
                        let mut decoder = FrameCodec {};
                        Poll::Ready(decoder.decode(&mut src).map_err(Into::into).transpose())
                    }
                    Some(Err(err)) => {
                        // LengthDelimitedCodecError is wrapped in an io::Error
                        let err = match err.get_ref() {
                            Some(inner)
                                if inner
                                    .downcast_ref::<tokio_util::codec::LengthDelimitedCodecError>()
                                    .is_some() =>
                            {
                                Error::MaxFrameSizeExceeded
                            }
                            _ => Error::Io(err),
                        };
                        Poll::Ready(Some(Err(err)))
                    }
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => {
                // check if idle timeout has exceeded
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    if let Poll::Ready(()) = delay.poll(cx) {
                        return Poll::Ready(Some(Err(Error::IdleTimeout)));
                    }
                }

                Poll::Pending
            }
        }
    }
}

/* ------------------------------- Handshakes ------------------------------- */

async fn send_proto_header<Io>(io: &mut Io, header: ProtocolHeader) -> Result<(), Error>
where
    Io: AsyncWrite + Unpin,
{
    let buf: [u8; 8] = header.into();
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn recv_proto_header<Io>(io: &mut Io) -> Result<ProtocolHeader, Error>
where
    Io: AsyncRead + Unpin,
{
    let mut inbound_buf = [0u8; 8];
    io.read_exact(&mut inbound_buf).await?;
    ProtocolHeader::try_from(inbound_buf)
        .map_err(|buf| Error::Handshake(format!("Invalid protocol header {:x?}", buf)))
}

/// Exchanges `header` and returns the peer's header if it is the same protocol and version
async fn negotiate<Io>(io: &mut Io, header: ProtocolHeader) -> Result<ProtocolHeader, Error>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    send_proto_header(io, header.clone()).await?;
    let incoming = recv_proto_header(io).await?;
    if incoming != header {
        return Err(Error::Handshake(format!(
            "Expecting {:?}, found {:?}",
            header, incoming
        )));
    }
    Ok(incoming)
}

pub(crate) async fn send_sasl_frame<Io>(io: &mut Io, frame: sasl::Frame) -> Result<(), Error>
where
    Io: AsyncWrite + Unpin,
{
    let mut body = BytesMut::new();
    sasl::FrameCodec {}.encode(frame, &mut body)?;
    let size = body.len() as u32 + 4;
    io.write_all(&size.to_be_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

pub(crate) async fn recv_sasl_frame<Io>(io: &mut Io) -> Result<sasl::Frame, Error>
where
    Io: AsyncRead + Unpin,
{
    let size = io.read_u32().await? as usize;
    if size < FRAME_HEADER_SIZE || size > MIN_MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("Invalid SASL frame size {}", size)));
    }
    let mut body = BytesMut::zeroed(size - 4);
    io.read_exact(&mut body).await?;
    sasl::FrameCodec {}
        .decode(&mut body)?
        .ok_or_else(|| Error::Protocol(String::from("Empty SASL frame")))
}

/// Runs the client side of the protocol header exchange and the optional SASL layer
pub async fn client_handshake<Io>(
    io: &mut Io,
    sasl: &SaslConfig,
    hostname: Option<&str>,
    is_tls: bool,
) -> Result<(), Error>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    if sasl.enabled {
        negotiate(io, ProtocolHeader::sasl()).await?;

        let mechanisms = match recv_sasl_frame(io).await? {
            sasl::Frame::Mechanisms(mechanisms) => mechanisms,
            frame => {
                return Err(Error::Protocol(format!(
                    "Expecting SASL mechanisms, found {:?}",
                    frame
                )))
            }
        };
        let profile = sasl
            .choose(&mechanisms.sasl_server_mechanisms.0, is_tls)
            .map_err(|err| Error::Security(err.to_string()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(mechanism = %profile.mechanism().0, "SASL init");
        #[cfg(feature = "log")]
        log::debug!("SASL init mechanism={}", profile.mechanism().0);

        send_sasl_frame(io, sasl::Frame::Init(profile.init(hostname))).await?;

        match recv_sasl_frame(io).await? {
            sasl::Frame::Outcome(SaslOutcome {
                code: SaslCode::Ok, ..
            }) => {}
            sasl::Frame::Outcome(outcome) => return Err(Error::sasl_outcome(outcome.code)),
            sasl::Frame::Challenge(_) => {
                return Err(Error::Security(format!(
                    "Mechanism {} does not support challenges",
                    profile.mechanism().0
                )))
            }
            frame => {
                return Err(Error::Protocol(format!(
                    "Expecting SASL outcome, found {:?}",
                    frame
                )))
            }
        }
    }

    negotiate(io, ProtocolHeader::amqp()).await?;
    Ok(())
}

/// Runs the server side of the protocol header exchange and the optional SASL layer
pub async fn server_handshake<Io>(io: &mut Io, acceptor: &SaslAcceptor) -> Result<(), Error>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut incoming = recv_proto_header(io).await?;
    if !incoming.is_supported_version() {
        send_proto_header(io, ProtocolHeader::amqp()).await?;
        return Err(Error::Handshake(format!(
            "Unsupported protocol version {:?}",
            incoming
        )));
    }

    if incoming.is_sasl() {
        send_proto_header(io, ProtocolHeader::sasl()).await?;
        send_sasl_frame(io, sasl::Frame::Mechanisms(acceptor.mechanisms())).await?;

        let init = match recv_sasl_frame(io).await? {
            sasl::Frame::Init(init) => init,
            frame => {
                return Err(Error::Protocol(format!(
                    "Expecting SASL init, found {:?}",
                    frame
                )))
            }
        };
        let outcome = acceptor.on_init(&init);
        let code = outcome.code;
        send_sasl_frame(io, sasl::Frame::Outcome(outcome)).await?;
        if code != SaslCode::Ok {
            return Err(Error::sasl_outcome(code));
        }

        incoming = recv_proto_header(io).await?;
    } else if acceptor.is_required() {
        send_proto_header(io, ProtocolHeader::sasl()).await?;
        return Err(Error::Security(String::from(
            "SASL is required by this listener",
        )));
    }

    if !incoming.is_amqp() {
        send_proto_header(io, ProtocolHeader::amqp()).await?;
        return Err(Error::Handshake(format!(
            "Expecting AMQP protocol header, found {:?}",
            incoming
        )));
    }
    send_proto_header(io, ProtocolHeader::amqp()).await
}

/// Opens a byte stream to `url`, wrapping it in TLS for `amqps`
pub async fn connect_stream(url: &url::Url, tls: &TlsOptions) -> Result<BoxedIo, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Handshake(format!("Missing host in {}", url)))?;
    let is_tls = url.scheme() == "amqps";
    let default_port = match is_tls {
        true => crate::types::definitions::SECURE_PORT,
        false => crate::types::definitions::PORT,
    };
    let port = url.port().unwrap_or(default_port);
    let stream = tokio::net::TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    match is_tls {
        false => {
            let _ = tls;
            Ok(Box::new(stream))
        }
        #[cfg(feature = "rustls")]
        true => {
            let stream = tls::connect_tls(stream, host, tls).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(feature = "rustls"))]
        true => Err(Error::Security(String::from(
            "amqps requires the \"rustls\" feature",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use futures_util::{SinkExt, StreamExt};
    use serde_amqp::primitives::{Array, Binary, Symbol};
    use tokio_test::io::Builder;
    use tokio_util::codec::Encoder;

    use crate::{
        frames::{
            amqp::{Frame, FrameBody},
            sasl,
        },
        sasl_profile::{SaslAcceptor, SaslConfig},
        types::{
            performatives::End,
            sasl::{SaslCode, SaslInit, SaslMechanisms, SaslOutcome},
        },
    };

    use super::{client_handshake, server_handshake, Error, Transport};

    fn sasl_frame_bytes(frame: sasl::Frame) -> Vec<u8> {
        let mut body = BytesMut::new();
        sasl::FrameCodec {}.encode(frame, &mut body).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32 + 4);
        buf.put(body);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_client_handshake_without_sasl() {
        let mut mock = Builder::new()
            .write(b"AMQP\x00\x01\x00\x00")
            .read(b"AMQP\x00\x01\x00\x00")
            .build();
        let config = SaslConfig {
            enabled: false,
            ..Default::default()
        };
        client_handshake(&mut mock, &config, None, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_handshake_version_mismatch() {
        let mut mock = Builder::new()
            .write(b"AMQP\x00\x01\x00\x00")
            .read(b"AMQP\x00\x00\x09\x01")
            .build();
        let config = SaslConfig {
            enabled: false,
            ..Default::default()
        };
        let result = client_handshake(&mut mock, &config, None, false).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_client_handshake_sasl_anonymous() {
        let mechanisms = sasl_frame_bytes(sasl::Frame::Mechanisms(SaslMechanisms {
            sasl_server_mechanisms: Array::from(vec![Symbol::from("ANONYMOUS")]),
        }));
        let init = sasl_frame_bytes(sasl::Frame::Init(SaslInit {
            mechanism: "ANONYMOUS".into(),
            initial_response: None,
            hostname: Some(String::from("localhost")),
        }));
        let outcome = sasl_frame_bytes(sasl::Frame::Outcome(SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        }));
        let mut mock = Builder::new()
            .write(b"AMQP\x03\x01\x00\x00")
            .read(b"AMQP\x03\x01\x00\x00")
            .read(&mechanisms)
            .write(&init)
            .read(&outcome)
            .write(b"AMQP\x00\x01\x00\x00")
            .read(b"AMQP\x00\x01\x00\x00")
            .build();
        client_handshake(&mut mock, &SaslConfig::default(), Some("localhost"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_handshake_sasl_rejected() {
        let mechanisms = sasl_frame_bytes(sasl::Frame::Mechanisms(SaslMechanisms {
            sasl_server_mechanisms: Array::from(vec![Symbol::from("ANONYMOUS")]),
        }));
        let init = sasl_frame_bytes(sasl::Frame::Init(SaslInit {
            mechanism: "ANONYMOUS".into(),
            initial_response: None,
            hostname: None,
        }));
        let outcome = sasl_frame_bytes(sasl::Frame::Outcome(SaslOutcome {
            code: SaslCode::Auth,
            additional_data: None,
        }));
        let mut mock = Builder::new()
            .write(b"AMQP\x03\x01\x00\x00")
            .read(b"AMQP\x03\x01\x00\x00")
            .read(&mechanisms)
            .write(&init)
            .read(&outcome)
            .build();
        let result = client_handshake(&mut mock, &SaslConfig::default(), None, false).await;
        assert!(matches!(result, Err(Error::Security(_))));
    }

    #[tokio::test]
    async fn test_client_refuses_plain_over_cleartext() {
        let mechanisms = sasl_frame_bytes(sasl::Frame::Mechanisms(SaslMechanisms {
            sasl_server_mechanisms: Array::from(vec![Symbol::from("PLAIN")]),
        }));
        let mut mock = Builder::new()
            .write(b"AMQP\x03\x01\x00\x00")
            .read(b"AMQP\x03\x01\x00\x00")
            .read(&mechanisms)
            .build();
        let config = SaslConfig {
            username: Some(String::from("user")),
            password: Some(String::from("secret")),
            ..Default::default()
        };
        let result = client_handshake(&mut mock, &config, None, false).await;
        assert!(matches!(result, Err(Error::Security(_))));
    }

    #[tokio::test]
    async fn test_server_handshake_with_plain() {
        let acceptor = SaslAcceptor::plain(vec![(String::from("user"), String::from("secret"))]);
        let mechanisms = sasl_frame_bytes(sasl::Frame::Mechanisms(acceptor.mechanisms()));
        let init = sasl_frame_bytes(sasl::Frame::Init(SaslInit {
            mechanism: "PLAIN".into(),
            initial_response: Some(Binary::from(b"\0user\0secret".to_vec())),
            hostname: None,
        }));
        let outcome = sasl_frame_bytes(sasl::Frame::Outcome(SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        }));
        let mut mock = Builder::new()
            .read(b"AMQP\x03\x01\x00\x00")
            .write(b"AMQP\x03\x01\x00\x00")
            .write(&mechanisms)
            .read(&init)
            .write(&outcome)
            .read(b"AMQP\x00\x01\x00\x00")
            .write(b"AMQP\x00\x01\x00\x00")
            .build();
        server_handshake(&mut mock, &acceptor).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_sends_and_receives_frames() {
        let end = Frame::new(1u16, FrameBody::End(End { error: None }));
        let encoded = crate::frames::amqp::encode_frame(end.clone()).unwrap();

        let mock = Builder::new().write(&encoded).read(&encoded).build();
        let mut transport = Transport::bind(mock, 512, None);
        transport.send(end.clone()).await.unwrap();
        let received = transport.next().await.unwrap().unwrap();
        assert_eq!(received, end);
    }
}
