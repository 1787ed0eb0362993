//! Heartbeat round trips and bus subscriptions.

mod common;

use std::sync::{Arc, Mutex};

use livewire::{
    Action, Connection, ProtocolMessage,
    connection::test_support::ScriptedConnector,
};

#[tokio::test(start_paused = true)]
async fn ping_resolves_on_the_next_inbound_heartbeat() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let (latency, ()) = tokio::join!(connection.ping(), async {
        let heartbeat = server.recv_frame().await;
        assert_eq!(heartbeat.action, Action::Heartbeat);
        server.send_frame(&ProtocolMessage::new(Action::Heartbeat));
    });
    let _latency = latency.expect("heartbeat answered");
}

#[tokio::test(start_paused = true)]
async fn ping_issued_while_connecting_waits_for_the_session() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");

    let (connected, latency, ()) = tokio::join!(
        connection.connect(),
        connection.ping(),
        async {
            let server = accepts.recv().await.expect("attempt");
            server.send_frame(&livewire::connection::test_support::connected_frame(
                "conn-1", "key-1",
            ));
            let mut server = server;
            let heartbeat = server.recv_frame().await;
            assert_eq!(heartbeat.action, Action::Heartbeat);
            server.send_frame(&ProtocolMessage::new(Action::Heartbeat));
        }
    );
    connected.expect("connected");
    latency.expect("deferred ping answered");
}

#[tokio::test(start_paused = true)]
async fn incoming_bus_routes_channel_traffic_in_order() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let token = {
        let seen = Arc::clone(&seen);
        connection
            .subscribe_incoming(move |frame| {
                if frame.action == Action::Message {
                    let name = frame
                        .messages
                        .as_ref()
                        .and_then(|batch| batch.first())
                        .and_then(|payload| payload.name.clone())
                        .unwrap_or_default();
                    seen.lock().expect("lock").push(name);
                }
            })
            .await
            .expect("subscribed")
    };

    server.send_frame(&common::message("first"));
    server.send_frame(&common::message("second"));

    // A ping round trip orders the assertion after both frames.
    let (latency, ()) = tokio::join!(connection.ping(), async {
        let _ = server.recv_frame().await;
        server.send_frame(&ProtocolMessage::new(Action::Heartbeat));
    });
    latency.expect("heartbeat answered");
    assert_eq!(*seen.lock().expect("lock"), vec!["first", "second"]);

    assert!(connection.unsubscribe(token).await.expect("worker"));
    assert!(!connection.unsubscribe(token).await.expect("worker"));
}

#[tokio::test(start_paused = true)]
async fn outgoing_bus_observes_frames_accepted_for_delivery() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        connection
            .subscribe_outgoing(move |frame| {
                seen.lock().expect("lock").push(frame.msg_serial);
            })
            .await
            .expect("subscribed");
    }

    let _delivery = connection.send(common::message("m1")).await.expect("sent");
    let frame = server.recv_frame().await;
    assert_eq!(frame.msg_serial, Some(0));
    assert_eq!(*seen.lock().expect("lock"), vec![Some(0)]);
}

#[tokio::test(start_paused = true)]
async fn a_panicking_subscriber_does_not_break_dispatch() {
    let (connector, mut accepts) = ScriptedConnector::new();
    let connection = Connection::with_connector(common::options().build(), connector).expect("connection");
    let mut server = common::connect(&connection, &mut accepts, "conn-1", "key-1").await;

    connection
        .subscribe_incoming(|_| panic!("subscriber bug"))
        .await
        .expect("subscribed");
    let seen = Arc::new(Mutex::new(0u32));
    {
        let seen = Arc::clone(&seen);
        connection
            .subscribe_incoming(move |frame| {
                if frame.action == Action::Message {
                    *seen.lock().expect("lock") += 1;
                }
            })
            .await
            .expect("subscribed");
    }

    server.send_frame(&common::message("m"));
    let (latency, ()) = tokio::join!(connection.ping(), async {
        let _ = server.recv_frame().await;
        server.send_frame(&ProtocolMessage::new(Action::Heartbeat));
    });
    latency.expect("heartbeat answered");
    assert_eq!(*seen.lock().expect("lock"), 1);
}
