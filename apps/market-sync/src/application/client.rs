//! Market Sync Client
//!
//! The single entry point wiring the cache, registry, connection manager,
//! reset controller and detection sweep together.
//!
//! Every client owns independent state, so tests can run several side by
//! side. The lifecycle is explicit:
//!
//! ```text
//! new() ──► init() ──► connect() … force_reset() … ──► dispose()
//! ```
//!
//! A disposed client cannot be re-initialized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ports::{CredentialProvider, DefaultPriceStore, FeedTransport, StoreError};
use super::services::connection::{ConnectError, ConnectionConfig, ConnectionManager, ConnectionState};
use super::services::reset::{ResetConfig, ResetController, ResetError, ResetReport};
use super::services::sweep::DetectionSweep;
use crate::domain::events::{DEFAULT_PRICE_KINDS, FeedCodec, FeedEvent};
use crate::domain::instrument::InstrumentId;
use crate::domain::listeners::{ListenerRegistry, SubscriptionHandle};
use crate::domain::pricing::{
    CacheError, CacheStats, GuardConfig, PriceCache, PriceGuard, ReferencePriceProvider,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Heartbeat and backoff.
    pub connection: ConnectionConfig,
    /// Cooldown and settle delay.
    pub reset: ResetConfig,
    /// Guard thresholds.
    pub guard: GuardConfig,
    /// Detection sweep period (zero disables).
    pub sweep_interval: Duration,
    /// Price-bearing record types.
    pub price_kinds: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reset: ResetConfig::default(),
            guard: GuardConfig::default(),
            sweep_interval: Duration::from_secs(30),
            price_kinds: DEFAULT_PRICE_KINDS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// External collaborators.
pub struct ClientDeps {
    /// Feed connection factory.
    pub transport: Arc<dyn FeedTransport>,
    /// Bearer credential source.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Reference price lookup.
    pub references: Arc<dyn ReferencePriceProvider>,
    /// Persisted default prices, if any.
    pub defaults: Option<Arc<dyn DefaultPriceStore>>,
}

// =============================================================================
// Errors & Stats
// =============================================================================

/// Errors from [`MarketSyncClient::restore_defaults`].
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// No default price store was configured.
    #[error("no default price store configured")]
    NoStore,

    /// The store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Client observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Connection state.
    pub state: ConnectionState,
    /// Failed connection cycles since the last connect.
    pub attempts: u32,
    /// A forced reset is running.
    pub reset_in_progress: bool,
    /// Data-event dispatch is suppressed.
    pub dispatch_suppressed: bool,
    /// Cache statistics.
    pub cache: CacheStats,
}

// =============================================================================
// Client
// =============================================================================

/// Realtime market-data synchronization client.
pub struct MarketSyncClient {
    cache: Arc<PriceCache>,
    registry: ListenerRegistry,
    connection: ConnectionManager,
    reset: ResetController,
    sweep: DetectionSweep,
    defaults: Option<Arc<dyn DefaultPriceStore>>,
    lifetime: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for MarketSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketSyncClient")
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MarketSyncClient {
    /// Build a client. Nothing runs until [`init`](Self::init) and
    /// [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: ClientConfig, deps: ClientDeps) -> Self {
        let cache = Arc::new(PriceCache::new(
            PriceGuard::new(config.guard),
            deps.references,
        ));
        let registry = ListenerRegistry::new();
        let connection = ConnectionManager::new(
            config.connection,
            deps.transport,
            deps.credentials,
            Arc::clone(&cache),
            registry.clone(),
            FeedCodec::new(config.price_kinds),
        );
        let lifetime = CancellationToken::new();
        let reset = ResetController::new(
            config.reset,
            Arc::clone(&cache),
            registry.clone(),
            connection.clone(),
            lifetime.child_token(),
        );
        let sweep = DetectionSweep::new(Arc::clone(&cache), registry.clone(), config.sweep_interval);

        Self {
            cache,
            registry,
            connection,
            reset,
            sweep,
            defaults: deps.defaults,
            lifetime,
            sweep_handle: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start background tasks. Idempotent; a no-op after `dispose()`.
    pub fn init(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            tracing::warn!("init() called on a disposed client");
            return;
        }
        let mut handle = self.sweep_handle.lock();
        if handle.is_none() {
            *handle = self.sweep.clone().spawn(self.lifetime.child_token());
            tracing::info!("Market sync client initialized");
        }
    }

    /// Close the connection, stop every timer and drop all subscriptions.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.close();
        self.lifetime.cancel();
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
        self.registry.clear();
        tracing::info!("Market sync client disposed");
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to the feed.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    /// Close the feed connection.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch channel following connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Subscribe to events of type `kind` (`"*"` for every event).
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, handler)
    }

    // =========================================================================
    // Prices
    // =========================================================================

    /// Cached price for `instrument`, or `fallback`.
    #[must_use]
    pub fn get_price(&self, instrument: &InstrumentId, fallback: Decimal) -> Decimal {
        self.cache.get_price(instrument, fallback)
    }

    /// Authoritatively set a price, bypassing the guard.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidPrice` for a zero or negative price.
    pub fn set_price(&self, instrument: &InstrumentId, price: Decimal) -> Result<(), CacheError> {
        self.cache.set_price(instrument, price)?;
        metrics::record_manual_override();
        metrics::set_cached_instruments(self.cache.len());
        Ok(())
    }

    /// Shield one instrument from feed updates.
    pub fn pause(&self, instrument: &InstrumentId) {
        self.cache.pause(instrument);
    }

    /// Re-enable feed updates for one instrument.
    pub fn resume(&self, instrument: &InstrumentId) {
        self.cache.resume(instrument);
    }

    /// Shield every instrument from feed updates.
    pub fn pause_all(&self) {
        self.cache.pause_all();
    }

    /// Clear the global pause flag.
    pub fn resume_all(&self) {
        self.cache.resume_all();
    }

    /// Shared handle to the price cache.
    #[must_use]
    pub fn cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.cache)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Wipe the cache, reconnect and start the cooldown window.
    ///
    /// # Errors
    ///
    /// See [`ResetController::force_reset`].
    pub async fn force_reset(&self) -> Result<ResetReport, ResetError> {
        self.reset.force_reset().await
    }

    /// Apply stored default prices as manual overrides.
    ///
    /// Non-positive defaults are skipped. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// - `NoStore` if no default store was configured
    /// - `Store` if the store could not be read
    pub fn restore_defaults(&self) -> Result<usize, RestoreError> {
        let store = self.defaults.as_ref().ok_or(RestoreError::NoStore)?;
        let defaults = store.load_defaults()?;

        let mut applied = 0;
        for (instrument, price) in defaults {
            match self.cache.set_price(&instrument, price) {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping invalid default price"),
            }
        }

        metrics::set_cached_instruments(self.cache.len());
        tracing::info!(applied, "Default prices restored");
        Ok(applied)
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.connection.state(),
            attempts: self.connection.attempts(),
            reset_in_progress: self.reset.in_progress(),
            dispatch_suppressed: self.registry.is_suppressed(),
            cache: self.cache.stats(),
        }
    }
}

impl Drop for MarketSyncClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
