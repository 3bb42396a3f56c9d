//! Failover behavior over mock transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, mock_failover, wait_for_event, wait_for_listener};
use openwire_client::transport::mock::{ListenerEvent, MockTransportFactory, RecordingListener};
use openwire_client::{
    ClientConfig, ClientEvent, FailoverEvent, FailoverState, OpenWireClient, Transport,
};
use openwire_core::commands::{
    ConnectionControl, ConnectionId, ConnectionInfo, Destination, Message, MessageDispatch,
    MessagePull, RemoveInfo, Response, SessionId, SessionInfo,
};
use openwire_core::{Command, OpenWireError};

fn reset() -> OpenWireError {
    OpenWireError::Connection("connection reset".to_string())
}

fn names(commands: &[Command]) -> Vec<&'static str> {
    commands.iter().map(Command::type_name).collect()
}

async fn client_over(uri: &str) -> (OpenWireClient, Arc<MockTransportFactory>) {
    let factory = Arc::new(MockTransportFactory::new());
    let config = ClientConfig::builder().broker_uri(uri).build().unwrap();
    let client = OpenWireClient::connect_with_factory(config, factory.clone())
        .await
        .unwrap();
    (client, factory)
}

#[tokio::test]
async fn test_reconnect_restores_state_in_order() {
    common::init_tracing();
    let (client, factory) =
        client_over("failover:(tcp://a:1)?randomize=false&initialReconnectDelay=5").await;
    let mut events = client.subscribe_failover().unwrap();

    let session = client.create_session().await.unwrap();
    client
        .create_producer(&session, Some(Destination::queue("orders")))
        .await
        .unwrap();
    client
        .create_consumer(&session, Destination::topic("prices"), None)
        .await
        .unwrap();

    factory.transports()[0].fail(reset());
    let resumed = wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    assert!(matches!(resumed, FailoverEvent::Resumed { uri } if uri.as_str() == "tcp://a:1"));

    let second = &factory.transports()[1];
    let replayed = second.sent();
    assert_eq!(
        names(&replayed),
        vec![
            "ConnectionControl",
            "ConnectionInfo",
            "SessionInfo",
            "ProducerInfo",
            "ConsumerInfo"
        ]
    );
    match &replayed[1] {
        Command::ConnectionInfo(info) => {
            assert!(info.failover_reconnect);
            assert_eq!(info.connection_id.as_ref(), Some(client.connection_id()));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_request_waits_for_reconnect() {
    let (client, factory) = client_over(
        "failover:(tcp://a:1)?initialReconnectDelay=5&maxReconnectDelay=20",
    )
    .await;
    factory.set_available("tcp://a:1", false);
    factory.transports()[0].fail(reset());

    let client = Arc::new(client);
    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.create_session().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    factory.set_available("tcp://a:1", true);
    let session = tokio::time::timeout(common::WAIT, pending)
        .await
        .expect("request never completed")
        .unwrap()
        .unwrap();

    let last = factory.transports().last().cloned().unwrap();
    assert!(last.sent().iter().any(|c| match c {
        Command::SessionInfo(info) => info.session_id.as_ref() == Some(&session),
        _ => false,
    }));
}

#[tokio::test]
async fn test_exhausted_reconnects_fail_the_client() {
    let (client, factory) = client_over(
        "failover:(tcp://a:1,tcp://b:1)?maxReconnectAttempts=2&initialReconnectDelay=5",
    )
    .await;
    let mut failover_events = client.subscribe_failover().unwrap();
    let mut client_events = client.subscribe();

    factory.set_available("tcp://a:1", false);
    factory.set_available("tcp://b:1", false);
    factory.transports()[0].fail(reset());

    let failed = wait_for_event(&mut failover_events, |e| {
        matches!(e, FailoverEvent::ReconnectFailed { .. })
    })
    .await;
    assert!(matches!(failed, FailoverEvent::ReconnectFailed { attempts: 2, .. }));

    let failed = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Ok(ClientEvent::Failed { error }) = client_events.recv().await {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert!(failed.contains("failed to connect after 2 attempts"));

    let err = client.create_session().await.unwrap_err();
    assert!(matches!(err, OpenWireError::Connection(_)), "{err:?}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_startup_attempt_limit_fails_connect() {
    let factory = Arc::new(MockTransportFactory::new());
    factory.set_available("tcp://a:1", false);
    let config = ClientConfig::builder()
        .broker_uri("failover:(tcp://a:1)?startupMaxReconnectAttempts=3&initialReconnectDelay=1")
        .build()
        .unwrap();

    let err = OpenWireClient::connect_with_factory(config, factory.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, OpenWireError::Connection(_)), "{err:?}");
    assert_eq!(factory.attempts().len(), 3);
}

#[tokio::test]
async fn test_send_times_out_while_disconnected() {
    let (client, factory) = client_over(
        "failover:(tcp://a:1)?timeout=100&initialReconnectDelay=5&maxReconnectDelay=20",
    )
    .await;
    factory.set_available("tcp://a:1", false);
    factory.transports()[0].fail(reset());

    let started = tokio::time::Instant::now();
    let err = client.create_session().await.unwrap_err();
    assert!(matches!(err, OpenWireError::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_disconnected_commands_answered_locally() {
    let (client, factory) = client_over(
        "failover:(tcp://a:1)?initialReconnectDelay=5&maxReconnectDelay=20",
    )
    .await;
    let session = client.create_session().await.unwrap();
    let consumer = client
        .create_consumer(&session, Destination::queue("orders"), Some(0))
        .await
        .unwrap();
    let mut client_events = client.subscribe();
    let mut failover_events = client.subscribe_failover().unwrap();

    factory.set_available("tcp://a:1", false);
    factory.transports()[0].fail(reset());

    tokio::time::timeout(Duration::from_secs(1), client.remove(consumer.clone()))
        .await
        .expect("remove should be answered without a broker")
        .unwrap();

    let pull = MessagePull {
        consumer_id: Some(consumer.clone()),
        destination: Some(Destination::queue("orders")),
        timeout: 1_000,
        ..MessagePull::default()
    };
    client.oneway(pull.into()).await.unwrap();
    let dispatch = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Ok(ClientEvent::Command(Command::MessageDispatch(d))) = client_events.recv().await
            {
                return d;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(dispatch.consumer_id.as_ref(), Some(&consumer));
    assert!(dispatch.message.is_none());

    factory.set_available("tcp://a:1", true);
    wait_for_event(&mut failover_events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    let replayed = factory.transports().last().cloned().unwrap().sent();
    assert!(!names(&replayed).contains(&"ConsumerInfo"));
    assert!(names(&replayed).contains(&"SessionInfo"));
}

#[tokio::test]
async fn test_unanswered_request_is_replayed() {
    let (failover, factory) = mock_failover("failover:(tcp://a:1)?initialReconnectDelay=5");
    factory.set_auto_respond(false);
    let (listener, mut events) = RecordingListener::channel();
    failover.add_transport_listener(listener);
    failover.start().await.unwrap();
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;

    let mut message: Command = Message::text("hello").into();
    message.set_command_id(5);
    message.set_response_required(true);
    failover.oneway(message.clone()).await.unwrap();
    assert_eq!(failover.in_flight_count(), 1);

    factory.transports()[0].fail(reset());
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;

    let second = factory.transports()[1].clone();
    assert_eq!(names(&second.sent()), vec!["ConnectionControl", "Message"]);
    assert_eq!(second.sent()[1], message);
    assert_eq!(failover.in_flight_count(), 1);

    second.inject(Response::for_request(5).into());
    let response = wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Command(_))).await;
    assert!(matches!(response, ListenerEvent::Command(c) if c.correlation_id() == Some(5)));
    assert_eq!(failover.in_flight_count(), 0);
}

#[tokio::test]
async fn test_pending_removal_is_answered_on_interruption() {
    let (failover, factory) = mock_failover("failover:(tcp://a:1)?initialReconnectDelay=5");
    factory.set_auto_respond(false);
    let (listener, mut events) = RecordingListener::channel();
    failover.add_transport_listener(listener);
    failover.start().await.unwrap();
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;

    let connection = ConnectionId::new("ID:removal");
    let session = SessionId::new("ID:removal", 1);
    failover
        .oneway(ConnectionInfo::new(connection).into())
        .await
        .unwrap();
    failover
        .oneway(SessionInfo::new(session.clone()).into())
        .await
        .unwrap();

    let mut remove: Command = RemoveInfo::new(session).into();
    remove.set_command_id(7);
    remove.set_response_required(true);
    failover.oneway(remove).await.unwrap();
    assert_eq!(failover.in_flight_count(), 1);

    factory.transports()[0].fail(reset());
    let answer = wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Command(_))).await;
    assert!(matches!(answer, ListenerEvent::Command(c) if c.correlation_id() == Some(7)));
    assert_eq!(failover.in_flight_count(), 0);

    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;
    let replayed = factory.transports()[1].sent();
    assert_eq!(names(&replayed), vec!["ConnectionControl", "ConnectionInfo"]);
}

#[tokio::test]
async fn test_client_removal_completes_across_interruption() {
    let (client, factory) =
        client_over("failover:(tcp://a:1)?randomize=false&initialReconnectDelay=5").await;
    let mut events = client.subscribe_failover().unwrap();
    let session = client.create_session().await.unwrap();
    let consumer = client
        .create_consumer(&session, Destination::topic("prices"), None)
        .await
        .unwrap();

    let first = factory.transports()[0].clone();
    first.set_auto_respond(false);
    let client = Arc::new(client);
    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.remove(consumer).await }
    });
    eventually("removal sent", || names(&first.sent()).contains(&"RemoveInfo")).await;
    assert!(!pending.is_finished());

    first.fail(reset());
    tokio::time::timeout(common::WAIT, pending)
        .await
        .expect("removal never completed")
        .unwrap()
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    let replayed = factory.transports()[1].sent();
    assert!(names(&replayed).contains(&"SessionInfo"));
    assert!(!names(&replayed).contains(&"ConsumerInfo"));
    assert!(!names(&replayed).contains(&"RemoveInfo"));
}

#[tokio::test]
async fn test_interruption_is_reported_to_listeners() {
    let (failover, factory) = mock_failover("failover:(tcp://a:1)?initialReconnectDelay=5");
    let (listener, mut events) = RecordingListener::channel();
    failover.add_transport_listener(listener);
    failover.start().await.unwrap();
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;

    factory.transports()[0].fail(reset());
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Interrupted)).await;
    wait_for_listener(&mut events, |e| matches!(e, ListenerEvent::Resumed)).await;
    let lost = factory.transports()[0].clone();
    eventually("lost transport closed", || lost.is_closed()).await;
    assert_eq!(failover.state(), FailoverState::Connected);
}

#[tokio::test]
async fn test_reconnect_to_moves_connection() {
    let (failover, factory) = mock_failover("failover:(tcp://a:1,tcp://b:1)?randomize=false");
    let mut events = failover.subscribe();
    failover.start().await.unwrap();
    assert!(failover.wait_for_state(FailoverState::Connected, common::WAIT).await);
    assert_eq!(failover.remote_address().as_deref(), Some("tcp://a:1"));

    let control = ConnectionControl {
        reconnect_to: Some("tcp://b:1".to_string()),
        ..ConnectionControl::default()
    };
    factory.transports_for("tcp://a:1")[0].inject(control.into());

    let resumed = wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    assert!(matches!(resumed, FailoverEvent::Resumed { uri } if uri.as_str() == "tcp://b:1"));
    assert_eq!(failover.remote_address().as_deref(), Some("tcp://b:1"));
    assert!(factory.transports_for("tcp://a:1")[0].is_closed());
}

#[tokio::test]
async fn test_connected_brokers_update_candidates() {
    let (failover, factory) =
        mock_failover("failover:(tcp://a:1)?randomize=false&initialReconnectDelay=5");
    let mut events = failover.subscribe();
    failover.start().await.unwrap();
    assert!(failover.wait_for_state(FailoverState::Connected, common::WAIT).await);

    let control = ConnectionControl {
        connected_brokers: Some("tcp://c:1".to_string()),
        ..ConnectionControl::default()
    };
    factory.transports()[0].inject(control.into());
    factory.set_available("tcp://a:1", false);
    factory.transports()[0].fail(reset());

    let resumed = wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    assert!(matches!(resumed, FailoverEvent::Resumed { uri } if uri.as_str() == "tcp://c:1"));
}

#[tokio::test]
async fn test_backup_transport_takes_over() {
    let (failover, factory) = mock_failover(
        "failover:(tcp://a:1,tcp://b:1)?randomize=false&backup=true&maxReconnectDelay=50",
    );
    let mut events = failover.subscribe();
    failover.start().await.unwrap();
    assert!(failover.wait_for_state(FailoverState::Connected, common::WAIT).await);
    eventually("backup pool filled", || failover.backup_count() == 1).await;
    assert_eq!(factory.transports_for("tcp://b:1").len(), 1);

    factory.transports_for("tcp://a:1")[0].fail(reset());
    let resumed = wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    assert!(matches!(resumed, FailoverEvent::Resumed { uri } if uri.as_str() == "tcp://b:1"));

    let b_attempts = factory
        .attempts()
        .iter()
        .filter(|u| u.as_str() == "tcp://b:1")
        .count();
    assert_eq!(b_attempts, 1, "the pooled backup should be reused");
    assert_eq!(
        names(&factory.transports_for("tcp://b:1")[0].sent())[0],
        "ConnectionControl"
    );
}

#[tokio::test]
async fn test_priority_backup_returns_to_priority_broker() {
    let (failover, factory) = mock_failover(
        "failover:(tcp://a:1,tcp://b:1)?randomize=false&priorityBackup=true&maxReconnectDelay=20",
    );
    factory.set_available("tcp://a:1", false);
    let mut events = failover.subscribe();
    failover.start().await.unwrap();
    let connected =
        wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Connected { .. })).await;
    assert!(matches!(connected, FailoverEvent::Connected { uri } if uri.as_str() == "tcp://b:1"));

    factory.set_available("tcp://a:1", true);
    let resumed = wait_for_event(&mut events, |e| matches!(e, FailoverEvent::Resumed { .. })).await;
    assert!(matches!(resumed, FailoverEvent::Resumed { uri } if uri.as_str() == "tcp://a:1"));
    assert_eq!(failover.remote_address().as_deref(), Some("tcp://a:1"));
    assert!(factory.transports_for("tcp://b:1")[0].is_closed());
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    let (failover, factory) =
        mock_failover("failover:(tcp://a:1)?initialReconnectDelay=5&maxReconnectDelay=10");
    failover.start().await.unwrap();
    assert!(failover.wait_for_state(FailoverState::Connected, common::WAIT).await);
    factory.set_available("tcp://a:1", false);
    factory.transports()[0].fail(reset());

    failover.close().await.unwrap();
    assert_eq!(failover.state(), FailoverState::Closed);
    let attempts = factory.attempts().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.attempts().len(), attempts);

    let err = failover
        .oneway(MessageDispatch::default().into())
        .await
        .unwrap_err();
    assert!(matches!(err, OpenWireError::Closed(_)));
    assert!(failover.start().await.is_err());
}
