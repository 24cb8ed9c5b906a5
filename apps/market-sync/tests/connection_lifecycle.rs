//! Connection Lifecycle Integration Tests
//!
//! Drives the client through connect, retry exhaustion, link loss,
//! heartbeat timeout and shutdown against an in-memory feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use market_sync::application::ports::TransportEvent;
use market_sync::application::services::heartbeat::HeartbeatConfig;
use market_sync::{ConnectError, ConnectionState};

use common::{
    ScriptedTransport, Step, client_with, eventually, kinds, record_events, test_config,
    wait_for_state,
};

#[tokio::test(start_paused = true)]
async fn exhausted_retries_then_manual_connect_starts_fresh() {
    let transport = ScriptedTransport::new();
    transport.script([Step::Fail; 5]);
    let client = client_with(&transport, &[], test_config(5));
    let events = record_events(&client);

    let result = client.connect().await;
    assert_eq!(result, Err(ConnectError::ReconnectExhausted { attempts: 5 }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.stats().attempts, 5);
    assert_eq!(transport.opens(), 5);
    assert_eq!(kinds(&events), vec!["reconnect_failed"]);

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.stats().attempts, 0);
    assert_eq!(transport.opens(), 6);
    assert_eq!(kinds(&events), vec!["reconnect_failed", "connected"]);

    client.dispose();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_hidden_from_connect() {
    let transport = ScriptedTransport::new();
    transport.script([Step::Fail, Step::Fail]);
    let client = client_with(&transport, &[], test_config(5));

    client.connect().await.unwrap();
    assert_eq!(transport.opens(), 3);
    assert_eq!(transport.links(), 1);
    assert_eq!(client.stats().attempts, 0);

    client.dispose();
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects_automatically() {
    let transport = ScriptedTransport::new();
    let client = client_with(&transport, &[], test_config(5));
    let events = record_events(&client);

    client.connect().await.unwrap();
    transport
        .feed()
        .send(TransportEvent::Closed {
            reason: Some("server restart".to_string()),
        })
        .await
        .unwrap();

    eventually(|| transport.links() == 2).await;
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(kinds(&events), vec!["connected", "disconnected", "connected"]);

    client.dispose();
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_open_one_link() {
    let transport = ScriptedTransport::new();
    let client = client_with(&transport, &[], test_config(5));

    let (a, b) = tokio::join!(client.connect(), client.connect());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(transport.links(), 1);

    client.dispose();
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_connect() {
    let transport = ScriptedTransport::new();
    transport.script([Step::Fail; 100]);
    let client = Arc::new(client_with(&transport, &[], test_config(0)));

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.connect().await })
    };
    eventually(|| transport.opens() >= 2).await;

    client.close();
    assert_eq!(pending.await.unwrap(), Err(ConnectError::Cancelled));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let opens = transport.opens();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.opens(), opens);
}

#[tokio::test(start_paused = true)]
async fn silent_feed_trips_heartbeat_and_reconnects() {
    let transport = ScriptedTransport::new();
    let mut config = test_config(5);
    config.connection.heartbeat =
        HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(3));
    let client = client_with(&transport, &[], config);
    let events = record_events(&client);

    client.connect().await.unwrap();

    eventually(|| !transport.sent().is_empty()).await;
    assert!(transport.sent()[0].contains("\"ping\""));

    eventually(|| transport.links() == 2).await;
    assert!(kinds(&events).contains(&"disconnected".to_string()));

    client.dispose();
}

#[tokio::test]
async fn dispose_closes_connection_and_is_idempotent() {
    let transport = ScriptedTransport::new();
    let client = client_with(&transport, &[], test_config(5));
    client.connect().await.unwrap();

    client.dispose();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.dispose();

    client.init();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
