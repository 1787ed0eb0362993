//! Byte-framed duplex transport adapter.
//!
//! The connection manager treats the network as a stream of length-delimited
//! frames with open/frame/close semantics. [`Connector`] opens a
//! [`Transport`] for a [`ConnectRequest`]; the default [`TcpConnector`]
//! dials TCP (optionally wrapped in TLS), sends the handshake parameters as
//! the first frame, and then exchanges protocol frames through a
//! [`LengthDelimitedCodec`]. Tests substitute an in-process implementation.

use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{codec::WireFormat, protocol::ErrorInfo};

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Parameters for one transport open attempt.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    /// Host selected by the manager for this attempt.
    pub host: String,
    /// TCP port, already defaulted from the TLS setting.
    pub port: u16,
    /// Whether to wrap the stream in TLS.
    pub tls: bool,
    /// Negotiated wire format for the session.
    pub format: WireFormat,
    /// Handshake query parameters (auth, format, echo, resume/recover...).
    pub params: Vec<(String, String)>,
}

/// A connected byte-framed duplex stream.
#[async_trait]
pub trait Transport: Send {
    /// Write one frame to the peer.
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;

    /// Read the next frame; `None` signals an orderly end of stream.
    async fn recv(&mut self) -> Option<io::Result<Bytes>>;

    /// Release the underlying stream.
    async fn close(&mut self);
}

/// Capability opening transports on behalf of the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport for `request`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorInfo`] describing the open failure; the manager
    /// classifies it into a retry or terminal path.
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, ErrorInfo>;
}

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Default connector: length-delimited frames over TCP, with TLS by default.
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    /// Build a connector trusting the platform web PKI roots.
    #[must_use]
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, ErrorInfo> {
        let stream = TcpStream::connect((request.host.as_str(), request.port))
            .await
            .map_err(|err| {
                ErrorInfo::connection(format!("tcp connect to {} failed: {err}", request.host))
            })?;
        let _ = stream.set_nodelay(true);

        let io: Box<dyn IoStream> = if request.tls {
            let name = rustls::pki_types::ServerName::try_from(request.host.clone())
                .map_err(|err| ErrorInfo::connection(format!("invalid server name: {err}")))?;
            let tls = self.tls.connect(name, stream).await.map_err(|err| {
                ErrorInfo::connection(format!("tls handshake with {} failed: {err}", request.host))
            })?;
            Box::new(tls)
        } else {
            Box::new(stream)
        };

        let mut framed = Framed::new(
            io,
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        );
        let handshake = encode_handshake(&request)?;
        framed.send(handshake).await.map_err(|err| {
            ErrorInfo::connection(format!("handshake write to {} failed: {err}", request.host))
        })?;

        Ok(Box::new(FramedTransport { framed }))
    }
}

/// Render the handshake parameters as the first frame on the stream.
fn encode_handshake(request: &ConnectRequest) -> Result<Bytes, ErrorInfo> {
    let map: serde_json::Map<String, serde_json::Value> = request
        .params
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    let bytes = match request.format {
        WireFormat::Json => serde_json::to_vec(&map)
            .map_err(|err| ErrorInfo::connection(format!("handshake encode failed: {err}")))?,
        WireFormat::MsgPack => rmp_serde::to_vec_named(&map)
            .map_err(|err| ErrorInfo::connection(format!("handshake encode failed: {err}")))?,
    };
    Ok(Bytes::from(bytes))
}

struct FramedTransport {
    framed: Framed<Box<dyn IoStream>, LengthDelimitedCodec>,
}

#[async_trait]
impl Transport for FramedTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.framed.send(frame).await
    }

    async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        self.framed
            .next()
            .await
            .map(|result| result.map(BytesMut::freeze))
    }

    async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}
