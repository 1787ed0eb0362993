//! In-process transport doubles for connection tests.
//!
//! [`ScriptedConnector`] records every [`ConnectRequest`] and either refuses
//! the attempt or hands out a channel-backed transport whose server side is
//! delivered to the test through an accept queue. No sockets are involved,
//! so scenarios run entirely under the paused tokio clock.

use std::{
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    codec::{self, WireFormat},
    protocol::{ErrorInfo, ProtocolMessage},
    transport::{ConnectRequest, Connector, Transport},
};

/// Server half of an accepted in-process connection.
pub struct ServerEnd {
    /// Request that opened this connection.
    pub request: ConnectRequest,
    to_client: mpsc::UnboundedSender<Bytes>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl ServerEnd {
    /// Receive and decode the next frame written by the client.
    ///
    /// # Panics
    ///
    /// Panics when the client side has gone away or sent an undecodable
    /// frame; in tests that is a failure worth surfacing immediately.
    pub async fn recv_frame(&mut self) -> ProtocolMessage {
        let bytes = self
            .from_client
            .recv()
            .await
            .expect("client side closed while a frame was expected");
        codec::decode(self.request.format, &bytes).expect("client sent undecodable frame")
    }

    /// Encode and deliver a frame to the client.
    ///
    /// # Panics
    ///
    /// Panics when the frame cannot be encoded.
    pub fn send_frame(&self, frame: &ProtocolMessage) {
        let bytes = codec::encode(self.request.format, frame).expect("frame encodes");
        // A send failure means the client released the transport; scenarios
        // that race shutdown simply lose the frame, as a real peer would.
        let _ = self.to_client.send(bytes);
    }

    /// Whether the client has released its half of the connection.
    #[must_use]
    pub fn client_gone(&self) -> bool {
        self.to_client.is_closed()
    }
}

struct ChannelTransport {
    to_server: mpsc::UnboundedSender<Bytes>,
    from_server: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.to_server
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server side dropped"))
    }

    async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Connector double scripted by the test.
pub struct ScriptedConnector {
    accepts_tx: mpsc::UnboundedSender<ServerEnd>,
    refusals: Mutex<Vec<ErrorInfo>>,
    requests: Mutex<Vec<ConnectRequest>>,
}

impl ScriptedConnector {
    /// Create a connector and the queue on which accepted server ends
    /// arrive.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepts_tx, accepts_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accepts_tx,
                refusals: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }),
            accepts_rx,
        )
    }

    /// Refuse the next open attempt with `error`; queued refusals apply in
    /// order before any attempt is accepted again.
    pub fn refuse_next(&self, error: ErrorInfo) {
        self.refusals.lock().expect("lock").push(error);
    }

    /// Every request observed so far, in attempt order.
    #[must_use]
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, ErrorInfo> {
        self.requests.lock().expect("lock").push(request.clone());
        let refusal = {
            let mut refusals = self.refusals.lock().expect("lock");
            if refusals.is_empty() {
                None
            } else {
                Some(refusals.remove(0))
            }
        };
        if let Some(error) = refusal {
            return Err(error);
        }
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let server = ServerEnd {
            request,
            to_client,
            from_client,
        };
        self.accepts_tx
            .send(server)
            .map_err(|_| ErrorInfo::connection("accept queue dropped"))?;
        Ok(Box::new(ChannelTransport {
            to_server,
            from_server,
        }))
    }
}

/// A plain `Connected` frame carrying the given identity.
#[must_use]
pub fn connected_frame(id: &str, key: &str) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(crate::protocol::Action::Connected);
    frame.connection_id = Some(id.to_string());
    frame.connection_key = Some(key.to_string());
    frame
}

/// Look up a handshake parameter in a recorded request.
#[must_use]
pub fn param<'a>(request: &'a ConnectRequest, name: &str) -> Option<&'a str> {
    request
        .params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}
