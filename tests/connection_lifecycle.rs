//! Connection lifecycle: connect, close, state events and terminal errors.

mod common;

use livewire::{
    Action, Connection, ConnectionState, Error, ErrorInfo, ProtocolMessage,
    connection::test_support::{ScriptedConnector, param},
};

fn closed_frame() -> ProtocolMessage {
    ProtocolMessage::new(Action::Closed)
}

#[tokio::test(start_paused = true)]
async fn connect_emits_ordered_state_events() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut events = connection.state_changes();

    let server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.id().await.expect("info"), Some("conn-1".into()));
    assert_eq!(connection.key().await.expect("info"), Some("key-1".into()));

    let first = events.recv().await.expect("event");
    assert_eq!(first.previous, ConnectionState::Initialized);
    assert_eq!(first.current, ConnectionState::Connecting);
    let second = events.recv().await.expect("event");
    assert_eq!(second.previous, ConnectionState::Connecting);
    assert_eq!(second.current, ConnectionState::Connected);
    drop(server);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_resolves_immediately() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let _server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;
    connection.connect().await.expect("already connected");
}

#[tokio::test(start_paused = true)]
async fn close_handshake_sends_an_ack_required_close_frame() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let ((), close_result) = tokio::join!(
        async {
            let close = server.recv_frame().await;
            assert_eq!(close.action, Action::Close);
            assert!(close.action.ack_required());
            assert!(close.msg_serial.is_some());
            server.send_frame(&closed_frame());
        },
        async { connection.close().await }
    );
    close_result.expect("closed");
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn close_times_out_to_closed_when_the_server_stays_silent() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let ((), close_result) = tokio::join!(
        async {
            // Swallow the close frame and never reply; the deadline forces
            // the terminal state.
            let close = server.recv_frame().await;
            assert_eq!(close.action, Action::Close);
        },
        async { connection.close().await }
    );
    close_result.expect("forced closed");
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn close_discards_resume_state() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector.clone()).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let mut inbound = common::message("tick");
    inbound.connection_serial = Some(9);
    server.send_frame(&inbound);
    // Round-trip a worker command to order after frame processing.
    let _ = connection.info().await.expect("worker");
    assert_eq!(
        connection.recovery_key().await.expect("worker"),
        Some("key-1:9".into())
    );

    let ((), close_result) = tokio::join!(
        async {
            let close = server.recv_frame().await;
            assert_eq!(close.action, Action::Close);
            server.send_frame(&closed_frame());
        },
        async { connection.close().await }
    );
    close_result.expect("closed");

    // The closed session cannot be resumed: no recovery key survives, and a
    // fresh connect does not ask the server to resume it.
    assert_eq!(connection.recovery_key().await.expect("worker"), None);
    let _server = common::connect(&connection, &mut accepts, "conn-2", "key-2").await;
    let request = connector.requests().last().cloned().expect("request");
    assert_eq!(param(&request, "resume"), None);
    assert_eq!(param(&request, "connection_serial"), None);
}

#[tokio::test(start_paused = true)]
async fn close_from_initialized_skips_the_handshake() {
    let (connector, _accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    connection.close().await.expect("closed");
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn connect_during_close_is_a_state_error() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let ((), close_result) = tokio::join!(
        async {
            let close = server.recv_frame().await;
            assert_eq!(close.action, Action::Close);
            let err = connection.connect().await.expect_err("closing");
            assert!(matches!(err, Error::InvalidStateTransition { .. }));
            server.send_frame(&closed_frame());
        },
        async { connection.close().await }
    );
    close_result.expect("closed");
}

#[tokio::test(start_paused = true)]
async fn server_error_frame_fails_the_connection_terminally() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;
    let mut events = connection.state_changes();

    let mut error_frame = ProtocolMessage::new(Action::Error);
    error_frame.error = Some(ErrorInfo::new(50002, "node draining"));
    server.send_frame(&error_frame);

    loop {
        let change = events.recv().await.expect("event");
        if change.current == ConnectionState::Failed {
            assert_eq!(change.reason.map(|info| info.code), Some(50002));
            break;
        }
    }
    let reason = connection.error_reason().await.expect("info").expect("reason");
    assert_eq!(reason.code, 50002);

    let err = connection.send(common::message("m")).await.expect_err("failed");
    assert!(matches!(err, Error::NotConnected(ConnectionState::Failed)));
    let err = connection.close().await.expect_err("close from failed");
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn connect_after_failure_starts_a_fresh_session() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector.clone()).expect("connection");
    let server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;
    let mut events = connection.state_changes();

    let mut error_frame = ProtocolMessage::new(Action::Error);
    error_frame.error = Some(ErrorInfo::new(50002, "node draining"));
    server.send_frame(&error_frame);
    loop {
        if events.recv().await.expect("event").current == ConnectionState::Failed {
            break;
        }
    }

    let mut server = common::connect(&connection, &mut accepts, "conn-9", "key-9").await;
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.id().await.expect("info"), Some("conn-9".into()));
    // The fresh session carries no resume state from the failed one.
    let request = connector.requests().last().cloned().expect("request");
    assert!(request.params.iter().all(|(name, _)| name != "resume"));

    let delivery = connection.send(common::message("m")).await.expect("sent");
    let frame = server.recv_frame().await;
    assert_eq!(frame.msg_serial, Some(0));
    drop(delivery);
}

#[tokio::test(start_paused = true)]
async fn ping_is_rejected_before_connecting() {
    let (connector, _accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let err = connection.ping().await.expect_err("initialized");
    assert!(matches!(
        err,
        Error::NotConnected(ConnectionState::Initialized)
    ));
}

#[tokio::test(start_paused = true)]
async fn send_fails_fast_when_queueing_is_disabled() {
    let (connector, _accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(
        common::options().queue_messages(false).build(),
        connector,
    )
    .expect("connection");
    let err = connection.send(common::message("m")).await.expect_err("not connected");
    assert!(matches!(err, Error::NotConnected(_)));
}
