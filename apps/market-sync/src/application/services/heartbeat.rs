//! Heartbeat Manager
//!
//! Liveness check for the feed connection. Asks the connection to send an
//! application-level ping every `ping_interval`, and reports a timeout when
//! nothing has been heard from the feed for longer than `pong_timeout` after
//! a ping went out.
//!
//! Any inbound frame counts as proof of life, not only `pong`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages (zero disables the heartbeat).
    pub ping_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Configuration that never pings.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Check whether the heartbeat should run at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a ping message.
    SendPing,
    /// Heartbeat timeout occurred, connection should be restarted.
    Timeout,
}

/// State shared between the heartbeat manager and the session loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
        }
    }

    /// Record that the feed sent something.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }

    /// Mark that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Check if we're currently waiting for a reply.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the feed last sent anything.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Heartbeat manager that monitors connection health.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat monitoring loop.
    ///
    /// Runs until cancelled, a timeout is detected, or the event receiver is
    /// dropped. Returns immediately if the heartbeat is disabled.
    pub async fn run(self) {
        if !self.config.is_enabled() {
            return;
        }

        let start = Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_ping().await {
                        break;
                    }
                }
            }
        }
    }

    /// Check heartbeat state and request a ping.
    ///
    /// Returns `false` when the loop should exit.
    async fn check_and_ping(&self) -> bool {
        if self.state.is_waiting_for_pong() {
            let elapsed = self.state.time_since_activity();
            if elapsed > self.config.pong_timeout {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    timeout_secs = self.config.pong_timeout.as_secs(),
                    "Heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(25));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
        assert!(config.is_enabled());
        assert!(!HeartbeatConfig::disabled().is_enabled());
    }

    #[test]
    fn activity_clears_waiting_flag() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());

        state.record_activity();
        assert!(!state.is_waiting_for_pong());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_sends_ping_after_interval() {
        let config = HeartbeatConfig::new(Duration::from_secs(25), Duration::from_secs(60));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state, event_tx, cancel.clone()).run(),
        );

        let event = tokio::time::timeout(Duration::from_secs(30), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::SendPing);

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn manager_detects_timeout() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(15));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        // Ping goes out but nothing ever comes back
        let first = event_rx.recv().await.unwrap();
        assert_eq!(first, HeartbeatEvent::SendPing);
        state.mark_ping_sent();

        let mut received_timeout = false;
        while let Some(event) = event_rx.recv().await {
            if event == HeartbeatEvent::Timeout {
                received_timeout = true;
                break;
            }
        }

        assert!(received_timeout, "should receive timeout event");
        handle.await.expect("manager should exit after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn activity_prevents_timeout() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(15));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let _handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        for _ in 0..5 {
            let event = event_rx.recv().await.unwrap();
            assert_eq!(event, HeartbeatEvent::SendPing);
            state.mark_ping_sent();
            state.record_activity();
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_manager_returns_immediately() {
        let (event_tx, _event_rx) = mpsc::channel(10);
        let manager = HeartbeatManager::new(
            HeartbeatConfig::disabled(),
            Arc::new(HeartbeatState::new()),
            event_tx,
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_millis(100), manager.run())
            .await
            .expect("disabled heartbeat should not loop");
    }
}
