//! Market Sync Binary
//!
//! Runs the market sync client against a configured feed and exposes its
//! status over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_SYNC_FEED_URL`: Feed WebSocket URL
//! - `MARKET_SYNC_TOKEN`: Bearer token (read on every connection attempt)
//!
//! ## Optional
//! - `MARKET_SYNC_REFERENCE_PRICES`: JSON file of reference prices
//! - `MARKET_SYNC_DEFAULT_PRICES`: JSON file of default prices seeded at startup
//! - `MARKET_SYNC_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-sync)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `SyncConfig` for connection, guard and recovery tuning.

use std::sync::Arc;

use anyhow::Context;
use market_sync::application::ports::{DefaultPriceStore, ReferencePriceProvider};
use market_sync::infrastructure::health::{HealthServer, HealthServerState};
use market_sync::infrastructure::telemetry;
use market_sync::{
    ClientDeps, EnvCredentialProvider, FeedEvent, JsonFileDefaultStore, MarketSyncClient,
    StaticReferencePrices, SyncConfig, TOKEN_ENV_VAR, WebSocketTransport, WILDCARD, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("installing tracing subscriber")?;

    tracing::info!("Starting market sync");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = SyncConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let references: Arc<dyn ReferencePriceProvider> = match &config.sources.reference_prices {
        Some(path) => Arc::new(
            StaticReferencePrices::from_json_file(path).context("loading reference prices")?,
        ),
        None => Arc::new(StaticReferencePrices::default()),
    };
    let defaults = config
        .sources
        .default_prices
        .as_ref()
        .map(|path| Arc::new(JsonFileDefaultStore::new(path)) as Arc<dyn DefaultPriceStore>);

    let client = Arc::new(MarketSyncClient::new(
        config.client_config(),
        ClientDeps {
            transport: Arc::new(WebSocketTransport::new(config.feed.url.clone())),
            credentials: Arc::new(EnvCredentialProvider::new(TOKEN_ENV_VAR)),
            references,
            defaults,
        },
    ));
    client.init();

    if config.sources.default_prices.is_some() {
        match client.restore_defaults() {
            Ok(applied) => tracing::info!(applied, "Seeded cache from default prices"),
            Err(e) => tracing::warn!(error = %e, "Failed to seed default prices"),
        }
    }

    let _events = client.subscribe(WILDCARD, log_event);

    let shutdown_token = CancellationToken::new();

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&client),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let connecting = Arc::clone(&client);
    tokio::spawn(async move {
        if let Err(e) = connecting.connect().await {
            tracing::error!(error = %e, "Feed connection failed");
        }
    });

    tracing::info!("Market sync ready");

    await_shutdown(shutdown_token).await;

    client.dispose();
    tracing::info!("Market sync stopped");
    Ok(())
}

fn log_event(event: &FeedEvent) {
    match event {
        FeedEvent::Price(update) => tracing::debug!(
            instrument = %update.instrument_id,
            price = %update.price,
            kind = %update.kind,
            "Price update"
        ),
        FeedEvent::Record(record) => tracing::trace!(kind = %record.kind, "Feed record"),
        FeedEvent::Connected => tracing::info!("Feed connected"),
        FeedEvent::Disconnected { reason } => {
            tracing::warn!(reason = reason.as_deref().unwrap_or("none"), "Feed disconnected");
        }
        FeedEvent::ReconnectFailed { attempts } => {
            tracing::error!(attempts, "Feed reconnection gave up");
        }
        FeedEvent::CooldownEnded => tracing::info!("Reset cooldown ended"),
        FeedEvent::AutoReset(reset) => tracing::warn!(
            instrument = %reset.instrument_id,
            from = %reset.from,
            to = %reset.to,
            "Price restored to reference"
        ),
        FeedEvent::PriceClamped {
            instrument_id,
            incoming,
            stored,
        } => tracing::warn!(
            instrument = %instrument_id,
            incoming = %incoming,
            stored = %stored,
            "Feed price clamped"
        ),
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        price_kinds = ?config.feed.price_kinds,
        max_reconnect_attempts = config.connection.max_reconnect_attempts,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        cooldown_secs = config.recovery.cooldown.as_secs(),
        sweep_interval_secs = config.recovery.sweep_interval.as_secs(),
        absolute_floor = %config.guard.absolute_floor,
        "Recovery settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
