#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Sync - Realtime Market Data Synchronization Client
//!
//! Maintains one push connection to a market-data feed, keeps a local cache
//! of the latest price per instrument guarded against malformed or
//! adversarial updates, and fans every feed message out to in-process
//! subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Price model and in-process event plumbing
//!   - `pricing`: Price guard, price cache, cooldown and pause controls
//!   - `events`: Feed events and the wire codec
//!   - `listeners`: Channel-keyed listener registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, credential and price-source interfaces
//!   - `services`: Connection manager, backoff, heartbeat, reset, sweep
//!   - `client`: The `MarketSyncClient` facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: Feed transport over `tokio-tungstenite`
//!   - `providers`: Env credentials and JSON price files
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!               ┌──────────────┐   ┌───────────┐   ┌─────────────┐
//! Feed WS ─────►│  Connection  │──►│   Price   │──►│  Listener   │──► subscribers
//!               │   Manager    │   │   Cache   │   │  Registry   │
//!               └──────────────┘   └───────────┘   └─────────────┘
//!                      ▲                 ▲                ▲
//!                      └──── Reset ──────┴──── Sweep ─────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Price model and event plumbing with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::events::{FeedEvent, FeedRecord, PriceUpdate, WILDCARD};
pub use domain::instrument::InstrumentId;
pub use domain::listeners::{ListenerRegistry, SubscriptionHandle};
pub use domain::pricing::{
    AutoReset, CacheError, CacheStats, GuardConfig, PriceCache, PriceGuard, UpdateOutcome,
};

// Client facade
pub use application::client::{ClientConfig, ClientDeps, ClientStats, MarketSyncClient, RestoreError};
pub use application::services::connection::{ConnectError, ConnectionState};
pub use application::services::reset::{ResetError, ResetReport};

// Infrastructure config
pub use infrastructure::config::{ConfigError, SyncConfig, TOKEN_ENV_VAR};

// Adapters
pub use infrastructure::providers::{
    EnvCredentialProvider, JsonFileDefaultStore, StaticCredentials, StaticReferencePrices,
};
pub use infrastructure::websocket::WebSocketTransport;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
