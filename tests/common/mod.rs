//! Shared fixtures for connection integration tests.

use livewire::{
    Auth, ClientOptions, ClientOptionsBuilder, Connection, PayloadMessage, ProtocolMessage,
    connection::test_support::{ServerEnd, connected_frame},
};
use tokio::sync::mpsc;

/// Options with key auth and the default deployment.
pub fn options() -> ClientOptionsBuilder {
    ClientOptions::builder(Auth::Key("app.keyid:secret".into()))
}

/// A channel `Message` frame with the given payload name.
pub fn message(name: &str) -> ProtocolMessage {
    ProtocolMessage::message(
        "ticker",
        PayloadMessage {
            id: None,
            name: Some(name.to_string()),
            client_id: None,
            data: None,
        },
    )
}

/// Accept the next open attempt and acknowledge it as connection
/// `id`/`key`.
pub async fn accept_connected(
    accepts: &mut mpsc::UnboundedReceiver<ServerEnd>,
    id: &str,
    key: &str,
) -> ServerEnd {
    let server = accepts.recv().await.expect("open attempt accepted");
    server.send_frame(&connected_frame(id, key));
    server
}

/// Drive `connect` while accepting the attempt server-side.
pub async fn connect(
    connection: &Connection,
    accepts: &mut mpsc::UnboundedReceiver<ServerEnd>,
    id: &str,
    key: &str,
) -> ServerEnd {
    let (result, server) = tokio::join!(connection.connect(), accept_connected(accepts, id, key));
    result.expect("connection reaches Connected");
    server
}
