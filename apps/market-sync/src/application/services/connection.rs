//! Connection Manager
//!
//! Owns the single live feed connection and drives its state machine:
//!
//! ```text
//!              connect()                 open
//! Disconnected ─────────► Connecting ─────────► Connected
//!      ▲                   │    ▲                   │
//!      │ attempts          │    │ backoff fires     │ close/error/timeout
//!      │ exhausted         ▼    │                   ▼
//!      └─────────────── Reconnecting ◄──────────────┘
//!
//! any ── close() ──► Closing ──► Disconnected
//! ```
//!
//! Each `connect()` from `Disconnected` starts a *session*: one supervisor
//! task that opens the transport, processes inbound frames strictly in
//! order, and retries with backoff until it connects, gives up, or is
//! cancelled. State writes from a superseded session are ignored.
//!
//! Listener dispatch always happens outside the bookkeeping lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, ReconnectPolicy};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use crate::application::ports::{
    CredentialProvider, FeedTransport, OutboundFrame, TransportEvent, TransportLink,
};
use crate::domain::events::{FeedCodec, FeedEvent, FeedMessage, PriceUpdate, sanitize};
use crate::domain::listeners::ListenerRegistry;
use crate::domain::pricing::{PriceCache, UpdateOutcome};
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and no retry scheduled.
    Disconnected,
    /// Opening a transport.
    Connecting,
    /// Transport open.
    Connected,
    /// Tearing down on request.
    Closing,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No credential was available.
    #[error("no credential available")]
    AuthMissing,

    /// Reconnection gave up.
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Failed cycles.
        attempts: u32,
    },

    /// `close()` was called while the connect was in flight.
    #[error("connect cancelled")]
    Cancelled,
}

/// Errors returned by [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No transport is open.
    #[error("not connected")]
    NotConnected,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Liveness ping settings.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection backoff settings.
    pub backoff: BackoffConfig,
}

// =============================================================================
// Internal State
// =============================================================================

type Waiter = oneshot::Sender<Result<(), ConnectError>>;

#[derive(Debug, Clone)]
struct Session {
    id: u64,
    cancel: CancellationToken,
}

struct Bookkeeping {
    state: ConnectionState,
    attempts: u32,
    waiters: Vec<Waiter>,
    session: Option<Session>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
}

impl Bookkeeping {
    fn is_current(&self, session_id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn FeedTransport>,
    credentials: Arc<dyn CredentialProvider>,
    cache: Arc<PriceCache>,
    registry: ListenerRegistry,
    codec: FeedCodec,
    book: Mutex<Bookkeeping>,
    state_tx: watch::Sender<ConnectionState>,
    next_session: AtomicU64,
}

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Lost(Option<String>),
}

/// Result of one connection cycle.
enum Cycle {
    Cancelled,
    Failed,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns the feed connection. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.shared.book.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &book.state)
            .field("attempts", &book.attempts)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn FeedTransport>,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<PriceCache>,
        registry: ListenerRegistry,
        codec: FeedCodec,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                credentials,
                cache,
                registry,
                codec,
                book: Mutex::new(Bookkeeping {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    waiters: Vec::new(),
                    session: None,
                    outbound: None,
                }),
                state_tx,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.book.lock().state
    }

    /// Watch channel following every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Failed connection cycles since the last successful connect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.book.lock().attempts
    }

    /// Connect to the feed.
    ///
    /// Returns immediately if already connected. If a connection cycle is in
    /// flight, waits for it instead of opening a second transport. From
    /// `Disconnected`, resets the attempt counter and starts a new cycle.
    ///
    /// # Errors
    ///
    /// - `AuthMissing` if no credential is available (state unchanged)
    /// - `ReconnectExhausted` if the attempt cap is reached first
    /// - `Cancelled` if `close()` is called before the connection opens
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let rx = {
            let mut book = self.shared.book.lock();
            match book.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    let (tx, rx) = oneshot::channel();
                    book.waiters.push(tx);
                    rx
                }
                ConnectionState::Disconnected | ConnectionState::Closing => {
                    let token = self.current_token().ok_or_else(|| {
                        tracing::warn!("Connect requested without a credential");
                        ConnectError::AuthMissing
                    })?;

                    let (tx, rx) = oneshot::channel();
                    book.waiters.push(tx);
                    book.attempts = 0;

                    let session = Session {
                        id: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
                        cancel: CancellationToken::new(),
                    };
                    book.session = Some(session.clone());
                    self.set_state(&mut book, ConnectionState::Connecting);

                    tokio::spawn(self.clone().supervise(session, token));
                    rx
                }
            }
        };

        rx.await.unwrap_or(Err(ConnectError::Cancelled))
    }

    /// Close the connection and cancel any reconnection.
    ///
    /// Pending `connect()` calls resolve with `Cancelled`.
    pub fn close(&self) {
        let waiters = {
            let mut book = self.shared.book.lock();
            if book.session.is_none() && book.state == ConnectionState::Disconnected {
                return;
            }

            self.set_state(&mut book, ConnectionState::Closing);
            if let Some(session) = book.session.take() {
                session.cancel.cancel();
            }
            if let Some(outbound) = book.outbound.take() {
                let _ = outbound.try_send(OutboundFrame::Close);
            }
            self.set_state(&mut book, ConnectionState::Disconnected);
            std::mem::take(&mut book.waiters)
        };

        tracing::info!(pending = waiters.len(), "Connection closed");
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }
    }

    /// Close the current transport and open a new one.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        self.close();
        self.connect().await
    }

    /// Queue an outbound frame on the open transport.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NotConnected` if no transport is open.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        let outbound = self
            .shared
            .book
            .lock()
            .outbound
            .clone()
            .ok_or(SendError::NotConnected)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| SendError::NotConnected)
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    fn current_token(&self) -> Option<String> {
        self.shared
            .credentials
            .token()
            .filter(|token| !token.trim().is_empty())
    }

    fn set_state(&self, book: &mut Bookkeeping, state: ConnectionState) {
        if book.state == state {
            return;
        }
        tracing::debug!(from = %book.state, to = %state, "Connection state changed");
        book.state = state;
        self.shared.state_tx.send_replace(state);
        metrics::set_connection_state(state);
    }

    /// Apply `f` to the bookkeeping if `session` is still current.
    fn with_current<T>(&self, session: &Session, f: impl FnOnce(&mut Bookkeeping) -> T) -> Option<T> {
        let mut book = self.shared.book.lock();
        if book.is_current(session.id) {
            Some(f(&mut book))
        } else {
            None
        }
    }

    async fn supervise(self, session: Session, initial_token: String) {
        let mut policy = ReconnectPolicy::new(self.shared.config.backoff.clone());
        let mut token = Some(initial_token);

        loop {
            if let Cycle::Cancelled = self.run_cycle(&session, &mut policy, token.take()).await {
                return;
            }

            let delay = policy.record_failure();
            let attempts = policy.attempt_count();

            let Some(delay) = delay else {
                let waiters = self.with_current(&session, |book| {
                    book.attempts = attempts;
                    book.session = None;
                    self.set_state(book, ConnectionState::Disconnected);
                    std::mem::take(&mut book.waiters)
                });
                let Some(waiters) = waiters else { return };

                tracing::error!(attempts, "Reconnection attempts exhausted");
                metrics::record_reconnect_exhausted();
                self.shared
                    .registry
                    .dispatch(&FeedEvent::ReconnectFailed { attempts });
                for waiter in waiters {
                    let _ = waiter.send(Err(ConnectError::ReconnectExhausted { attempts }));
                }
                return;
            };

            if self
                .with_current(&session, |book| book.attempts = attempts)
                .is_none()
            {
                return;
            }

            tracing::info!(
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to feed"
            );
            metrics::record_reconnect();

            tokio::select! {
                () = session.cancel.cancelled() => {
                    tracing::debug!("Reconnect cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one connection cycle: open, then process frames until the link
    /// is lost.
    async fn run_cycle(
        &self,
        session: &Session,
        policy: &mut ReconnectPolicy,
        token: Option<String>,
    ) -> Cycle {
        if self
            .with_current(session, |book| {
                self.set_state(book, ConnectionState::Connecting);
            })
            .is_none()
        {
            return Cycle::Cancelled;
        }

        let Some(token) = token.or_else(|| self.current_token()) else {
            tracing::warn!("No credential available for reconnect");
            return self.mark_reconnecting(session);
        };

        let opened = tokio::select! {
            () = session.cancel.cancelled() => return Cycle::Cancelled,
            result = self.shared.transport.open(&token) => result,
        };

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "Feed connection failed");
                return self.mark_reconnecting(session);
            }
        };

        policy.reset();
        let outbound = link.outbound.clone();
        let waiters = self.with_current(session, |book| {
            book.attempts = 0;
            book.outbound = Some(outbound);
            self.set_state(book, ConnectionState::Connected);
            std::mem::take(&mut book.waiters)
        });
        let Some(waiters) = waiters else {
            let _ = link.outbound.try_send(OutboundFrame::Close);
            return Cycle::Cancelled;
        };

        tracing::info!("Connected to feed");
        self.shared.registry.dispatch(&FeedEvent::Connected);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }

        match self.run_session(session, link).await {
            SessionEnd::Cancelled => Cycle::Cancelled,
            SessionEnd::Lost(reason) => {
                let lost = self.with_current(session, |book| {
                    book.outbound = None;
                    self.set_state(book, ConnectionState::Reconnecting);
                });
                if lost.is_none() {
                    return Cycle::Cancelled;
                }
                tracing::warn!(reason = ?reason, "Feed connection lost");
                self.shared
                    .registry
                    .dispatch(&FeedEvent::Disconnected { reason });
                Cycle::Failed
            }
        }
    }

    fn mark_reconnecting(&self, session: &Session) -> Cycle {
        match self.with_current(session, |book| {
            self.set_state(book, ConnectionState::Reconnecting);
        }) {
            Some(()) => Cycle::Failed,
            None => Cycle::Cancelled,
        }
    }

    async fn run_session(&self, session: &Session, mut link: TransportLink) -> SessionEnd {
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = session.cancel.child_token();
        let heartbeat = HeartbeatManager::new(
            self.shared.config.heartbeat.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();

        if self.shared.config.heartbeat.is_enabled() {
            tokio::spawn(heartbeat.run());
        }

        loop {
            tokio::select! {
                () = session.cancel.cancelled() => {
                    let _ = link.outbound.try_send(OutboundFrame::Close);
                    return SessionEnd::Cancelled;
                }
                Some(event) = heartbeat_rx.recv() => {
                    match event {
                        HeartbeatEvent::SendPing => {
                            heartbeat_state.mark_ping_sent();
                            let ping = self.shared.codec.encode_ping(Utc::now().timestamp_millis());
                            if link.outbound.send(OutboundFrame::Text(ping)).await.is_err() {
                                return SessionEnd::Lost(Some("outbound channel closed".to_string()));
                            }
                        }
                        HeartbeatEvent::Timeout => {
                            let _ = link.outbound.try_send(OutboundFrame::Close);
                            return SessionEnd::Lost(Some("heartbeat timeout".to_string()));
                        }
                    }
                }
                inbound = link.inbound.recv() => {
                    match inbound {
                        Some(TransportEvent::Message(text)) => {
                            heartbeat_state.record_activity();
                            self.handle_frame(&text);
                        }
                        Some(TransportEvent::Closed { reason }) => return SessionEnd::Lost(reason),
                        Some(TransportEvent::Error(error)) => return SessionEnd::Lost(Some(error)),
                        None => return SessionEnd::Lost(None),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Inbound Frames
    // =========================================================================

    /// Sanitize, decode, guard and dispatch one inbound frame.
    fn handle_frame(&self, raw: &str) {
        metrics::record_frame_received();

        let text = sanitize(raw);
        if text.is_empty() {
            return;
        }

        let messages = match self.shared.codec.decode(&text) {
            Ok(messages) => messages,
            Err(e) => {
                metrics::record_parse_error();
                tracing::warn!(error = %e, frame_len = text.len(), "Dropping malformed frame");
                return;
            }
        };

        for message in messages {
            match message {
                FeedMessage::Price(update) => self.handle_price(update),
                FeedMessage::Record(record) => {
                    if !record.is_control() && self.shared.cache.cooldown_active() {
                        tracing::trace!(kind = %record.kind, "Record dropped: cooldown active");
                        continue;
                    }
                    self.shared.registry.dispatch(&FeedEvent::Record(record));
                }
            }
        }
    }

    fn handle_price(&self, mut update: PriceUpdate) {
        let outcome = self
            .shared
            .cache
            .apply_feed_update(&update.instrument_id, update.raw_price);
        metrics::record_price_update(&outcome);
        if outcome.stored_price().is_some() {
            metrics::set_cached_instruments(self.shared.cache.len());
        }

        match outcome {
            UpdateOutcome::Stored { price } => {
                update.price = price;
                self.shared.registry.dispatch(&FeedEvent::Price(update));
            }
            UpdateOutcome::Clamped {
                incoming, stored, ..
            } => {
                update.price = stored;
                let instrument_id = update.instrument_id.clone();
                self.shared.registry.dispatch(&FeedEvent::Price(update));
                self.shared.registry.dispatch(&FeedEvent::PriceClamped {
                    instrument_id,
                    incoming,
                    stored,
                });
            }
            UpdateOutcome::Discarded(_) => {}
        }
    }
}
