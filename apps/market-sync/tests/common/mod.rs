//! Shared fixtures for integration tests.
//!
//! `ScriptedTransport` stands in for the feed: each `open()` either fails or
//! hands out an in-memory link the test pushes frames through.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use market_sync::application::ports::{
    FeedTransport, OutboundFrame, TransportError, TransportEvent, TransportLink,
};
use market_sync::application::services::backoff::BackoffConfig;
use market_sync::application::services::connection::ConnectionConfig;
use market_sync::application::services::heartbeat::HeartbeatConfig;
use market_sync::application::services::reset::ResetConfig;
use market_sync::{
    ClientConfig, ClientDeps, ConnectionState, FeedEvent, InstrumentId, MarketSyncClient,
    StaticCredentials, StaticReferencePrices, WILDCARD,
};

/// Outcome of one `open()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fail,
    Open,
}

/// In-memory feed driven by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    links: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    tokens: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    /// Every `open()` succeeds unless scripted otherwise.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for the next `open()` calls.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// Number of `open()` calls so far.
    pub fn opens(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Number of links actually established.
    pub fn links(&self) -> usize {
        self.links.lock().len()
    }

    /// Sender for the most recent link.
    pub fn feed(&self) -> mpsc::Sender<TransportEvent> {
        self.links.lock().last().cloned().expect("no link opened")
    }

    /// Push a text frame through the most recent link.
    pub async fn push(&self, frame: &str) {
        self.feed()
            .send(TransportEvent::Message(frame.to_string()))
            .await
            .expect("link dropped");
    }

    /// Text frames the client sent.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn open(&self, token: &str) -> Result<TransportLink, TransportError> {
        self.tokens.lock().push(token.to_string());
        let step = self.script.lock().pop_front().unwrap_or(Step::Open);
        if step == Step::Fail {
            return Err(TransportError::ConnectionFailed("scripted failure".to_string()));
        }

        let (outbound, mut outbound_rx) = mpsc::channel(16);
        let (inbound_tx, inbound) = mpsc::channel(64);
        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => sent.lock().push(text),
                    OutboundFrame::Close => break,
                }
            }
        });
        self.links.lock().push(inbound_tx);
        Ok(TransportLink { outbound, inbound })
    }
}

/// Fast timings with heartbeat and sweep disabled.
pub fn test_config(max_attempts: u32) -> ClientConfig {
    ClientConfig {
        connection: ConnectionConfig {
            heartbeat: HeartbeatConfig::disabled(),
            backoff: BackoffConfig::new(
                Duration::from_millis(10),
                Duration::from_millis(80),
                2.0,
                max_attempts,
            ),
        },
        reset: ResetConfig {
            cooldown: Duration::from_secs(300),
            settle_delay: Duration::from_millis(50),
        },
        sweep_interval: Duration::ZERO,
        ..ClientConfig::default()
    }
}

/// Build and initialize a client over `transport`.
pub fn client_with(
    transport: &Arc<ScriptedTransport>,
    references: &[(u64, i64)],
    config: ClientConfig,
) -> MarketSyncClient {
    let references: HashMap<InstrumentId, Decimal> = references
        .iter()
        .map(|&(id, price)| (InstrumentId::from(id), Decimal::from(price)))
        .collect();

    let client = MarketSyncClient::new(
        config,
        ClientDeps {
            transport: Arc::clone(transport) as Arc<dyn FeedTransport>,
            credentials: Arc::new(StaticCredentials::new("test-token")),
            references: Arc::new(StaticReferencePrices::new(references)),
            defaults: None,
        },
    );
    client.init();
    client
}

/// Records the kind of every event dispatched.
pub fn record_events(client: &MarketSyncClient) -> Arc<Mutex<Vec<FeedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    // The handle is not needed: dispose() clears the registry.
    let _handle = client.subscribe(WILDCARD, move |event| sink.lock().push(event.clone()));
    seen
}

/// Kinds of recorded events, in order.
pub fn kinds(events: &Mutex<Vec<FeedEvent>>) -> Vec<String> {
    events.lock().iter().map(|e| e.kind().to_string()).collect()
}

/// Wait until the client reaches `state`.
pub async fn wait_for_state(client: &MarketSyncClient, state: ConnectionState) {
    let mut rx = client.state_changes();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .expect("watch closed");
}

/// Poll until `check` holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Price frame in the feed's wire shape.
pub fn price_frame(id: u64, price: &str) -> String {
    format!(r#"{{"type":"stock_update","id":{id},"current_price":{price}}}"#)
}
