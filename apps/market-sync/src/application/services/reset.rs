//! Reset Controller
//!
//! Emergency recovery: wipe the price cache, reconnect, and hold off feed
//! updates for a cooldown window so a corrupt upstream burst cannot refill
//! the cache straight away.
//!
//! # Sequence
//!
//! 1. Pause every instrument and suppress data-event dispatch
//! 2. Clear the cache
//! 3. Start the cooldown window
//! 4. Close and reopen the connection
//! 5. Once the settle delay has passed, lift the pause and suppression
//! 6. When the cooldown elapses, emit `cooldown_ended`
//!
//! The pause never outlives the settle delay. If the feed is still down
//! when it expires, retries carry on in the background and the report says
//! `reconnected: false`. Step 5's release also runs when any earlier step
//! fails or the reset future is dropped. A global pause that was already in
//! place before the reset is left in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{ConnectError, ConnectionManager};
use crate::domain::events::FeedEvent;
use crate::domain::listeners::ListenerRegistry;
use crate::domain::pricing::{CooldownTicket, PriceCache};
use crate::infrastructure::metrics;

/// Reset timing.
#[derive(Debug, Clone)]
pub struct ResetConfig {
    /// How long feed updates are ignored after a reset.
    pub cooldown: Duration,
    /// Pause kept in place after reconnecting.
    pub settle_delay: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// Summary of a completed reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Correlation id for logs.
    pub reset_id: Uuid,
    /// Cache entries removed.
    pub cleared_entries: usize,
    /// Cooldown window started.
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
    /// The connection was reopened.
    pub reconnected: bool,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Reset failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResetError {
    /// Another reset is running.
    #[error("a reset is already in progress")]
    InProgress,

    /// The connection could not be reopened.
    #[error("reconnect after reset failed: {0}")]
    Reconnect(#[from] ConnectError),
}

/// Releases the pause, suppression and in-progress flag on drop.
struct ReleaseGuard<'a> {
    cache: &'a PriceCache,
    registry: &'a ListenerRegistry,
    in_progress: &'a AtomicBool,
    was_paused_all: bool,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if !self.was_paused_all {
            self.cache.resume_all();
        }
        self.registry.suppress(false);
        self.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates forced cache resets.
#[derive(Debug)]
pub struct ResetController {
    config: ResetConfig,
    cache: Arc<PriceCache>,
    registry: ListenerRegistry,
    connection: ConnectionManager,
    in_progress: AtomicBool,
    lifetime: CancellationToken,
}

impl ResetController {
    /// Create a controller. Cooldown timers stop when `lifetime` is cancelled.
    #[must_use]
    pub const fn new(
        config: ResetConfig,
        cache: Arc<PriceCache>,
        registry: ListenerRegistry,
        connection: ConnectionManager,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            config,
            cache,
            registry,
            connection,
            in_progress: AtomicBool::new(false),
            lifetime,
        }
    }

    /// Check whether a reset is running.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run the full reset sequence.
    ///
    /// # Errors
    ///
    /// - `InProgress` if another reset is running
    /// - `Reconnect` if reconnection gave up within the settle delay; the
    ///   cache stays cleared and the cooldown stays active
    pub async fn force_reset(&self) -> Result<ResetReport, ResetError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Reset requested while another is running");
            return Err(ResetError::InProgress);
        }

        let _release = ReleaseGuard {
            cache: &self.cache,
            registry: &self.registry,
            in_progress: &self.in_progress,
            was_paused_all: self.cache.is_paused_all(),
        };

        let reset_id = Uuid::new_v4();
        tracing::warn!(%reset_id, "Forcing price cache reset");

        self.cache.pause_all();
        self.registry.suppress(true);

        let cleared_entries = self.cache.clear();
        metrics::set_cached_instruments(0);

        let ticket = self.cache.start_cooldown(self.config.cooldown);
        self.spawn_cooldown_timer(ticket);

        let settle = tokio::time::sleep(self.config.settle_delay);
        tokio::pin!(settle);

        // Dropping the reconnect future leaves the supervisor retrying.
        let reconnected = tokio::select! {
            () = self.lifetime.cancelled() => false,
            () = &mut settle => {
                tracing::warn!(%reset_id, "Feed not back within settle delay, retrying in background");
                false
            }
            result = self.connection.reconnect() => match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(%reset_id, error = %e, "Reconnect after reset failed");
                    metrics::record_force_reset("failed");
                    return Err(e.into());
                }
            },
        };

        if reconnected {
            tokio::select! {
                () = self.lifetime.cancelled() => {}
                () = &mut settle => {}
            }
        }

        tracing::info!(
            %reset_id,
            cleared_entries,
            reconnected,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Price cache reset complete"
        );
        metrics::record_force_reset(if reconnected { "reconnected" } else { "pending" });

        Ok(ResetReport {
            reset_id,
            cleared_entries,
            cooldown: self.config.cooldown,
            reconnected,
        })
    }

    fn spawn_cooldown_timer(&self, ticket: CooldownTicket) {
        let cache = Arc::clone(&self.cache);
        let registry = self.registry.clone();
        let lifetime = self.lifetime.clone();
        let cooldown = self.config.cooldown;

        tokio::spawn(async move {
            tokio::select! {
                () = lifetime.cancelled() => {}
                () = tokio::time::sleep(cooldown) => {
                    if cache.finish_cooldown(ticket) {
                        tracing::info!("Cooldown ended, feed updates resumed");
                        registry.dispatch(&FeedEvent::CooldownEnded);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::{
        FeedTransport, MockCredentialProvider, TransportError, TransportLink,
    };
    use crate::application::services::backoff::BackoffConfig;
    use crate::application::services::connection::ConnectionConfig;
    use crate::application::services::heartbeat::HeartbeatConfig;
    use crate::domain::events::FeedCodec;
    use crate::domain::instrument::InstrumentId;
    use crate::domain::pricing::PriceGuard;

    struct IdleTransport;

    #[async_trait]
    impl FeedTransport for IdleTransport {
        async fn open(&self, _token: &str) -> Result<TransportLink, TransportError> {
            let (outbound, mut outbound_rx) = mpsc::channel(8);
            let (inbound_tx, inbound) = mpsc::channel(8);
            tokio::spawn(async move {
                let _inbound_tx = inbound_tx;
                while outbound_rx.recv().await.is_some() {}
            });
            Ok(TransportLink { outbound, inbound })
        }
    }

    fn controller(token: Option<&'static str>) -> (ResetController, Arc<PriceCache>, ListenerRegistry) {
        let references: HashMap<InstrumentId, Decimal> = HashMap::new();
        let cache = Arc::new(PriceCache::new(PriceGuard::default(), Arc::new(references)));
        let registry = ListenerRegistry::new();
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_token()
            .returning(move || token.map(ToString::to_string));
        let connection = ConnectionManager::new(
            ConnectionConfig {
                heartbeat: HeartbeatConfig::disabled(),
                backoff: BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1), 2.0, 1),
            },
            Arc::new(IdleTransport),
            Arc::new(credentials),
            Arc::clone(&cache),
            registry.clone(),
            FeedCodec::default(),
        );
        let controller = ResetController::new(
            ResetConfig {
                cooldown: Duration::from_millis(200),
                settle_delay: Duration::from_millis(10),
            },
            Arc::clone(&cache),
            registry.clone(),
            connection,
            CancellationToken::new(),
        );
        (controller, cache, registry)
    }

    #[tokio::test]
    async fn reset_clears_cache_and_starts_cooldown() {
        let (controller, cache, registry) = controller(Some("token"));
        cache.set_price(&InstrumentId::from(1_u64), Decimal::ONE).unwrap();
        cache.set_price(&InstrumentId::from(2_u64), Decimal::TWO).unwrap();

        let ended = Arc::new(AtomicBool::new(false));
        {
            let ended = Arc::clone(&ended);
            registry.subscribe("cooldown_ended", move |_| ended.store(true, Ordering::SeqCst));
        }

        let report = controller.force_reset().await.unwrap();

        assert_eq!(report.cleared_entries, 2);
        assert!(report.reconnected);
        assert!(cache.is_empty());
        assert!(cache.cooldown_active());
        assert!(!cache.is_paused(&InstrumentId::from(1_u64)));
        assert!(!registry.is_suppressed());
        assert!(!controller.in_progress());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!cache.cooldown_active());
        assert!(ended.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_reconnect_still_releases_pause() {
        let (controller, cache, registry) = controller(None);

        let result = controller.force_reset().await;

        assert_eq!(result, Err(ResetError::Reconnect(ConnectError::AuthMissing)));
        assert!(!cache.is_paused(&InstrumentId::from(1_u64)));
        assert!(!registry.is_suppressed());
        assert!(!controller.in_progress());
        assert!(cache.cooldown_active());
    }

    #[tokio::test]
    async fn reset_keeps_global_pause_set_beforehand() {
        let (controller, cache, registry) = controller(Some("token"));
        cache.pause_all();

        controller.force_reset().await.unwrap();

        assert!(cache.is_paused_all());
        assert!(!registry.is_suppressed());
        assert!(!controller.in_progress());
    }

    #[tokio::test]
    async fn concurrent_reset_is_rejected() {
        let (controller, _, _) = controller(Some("token"));

        let (first, second) = tokio::join!(controller.force_reset(), controller.force_reset());

        assert!(first.is_ok());
        assert_eq!(second, Err(ResetError::InProgress));
    }

    #[test]
    fn report_serializes_cooldown_in_millis() {
        let report = ResetReport {
            reset_id: Uuid::nil(),
            cleared_entries: 3,
            cooldown: Duration::from_secs(300),
            reconnected: true,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["cooldown"], 300_000);
        assert_eq!(value["cleared_entries"], 3);
    }
}
