//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (feed connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::client::{ClientStats, MarketSyncClient};
use crate::application::services::connection::ConnectionState;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Client version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Client snapshot.
    pub client: ClientStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected and accepting feed updates.
    Healthy,
    /// Connecting, reconnecting or recovering from a reset.
    Degraded,
    /// No connection and none pending.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    client: Arc<MarketSyncClient>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, client: Arc<MarketSyncClient>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            client,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.client.state() == ConnectionState::Connected {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let client = state.client.stats();

    HealthResponse {
        status: determine_health_status(&client),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        client,
    }
}

const fn determine_health_status(stats: &ClientStats) -> HealthStatus {
    match stats.state {
        ConnectionState::Connected if !stats.reset_in_progress && !stats.cache.paused_all => {
            HealthStatus::Healthy
        }
        ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
            HealthStatus::Degraded
        }
        ConnectionState::Disconnected | ConnectionState::Closing => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    use super::*;
    use crate::application::client::{ClientConfig, ClientDeps};
    use crate::application::ports::{MockCredentialProvider, MockFeedTransport};
    use crate::domain::instrument::InstrumentId;
    use crate::domain::pricing::CacheStats;

    fn stats(state: ConnectionState, reset_in_progress: bool) -> ClientStats {
        ClientStats {
            state,
            attempts: 0,
            reset_in_progress,
            dispatch_suppressed: reset_in_progress,
            cache: CacheStats {
                entries: 0,
                clamped_updates: 0,
                discarded_updates: 0,
                paused: Vec::new(),
                paused_all: reset_in_progress,
                cooldown_remaining_ms: None,
            },
        }
    }

    fn idle_client() -> Arc<MarketSyncClient> {
        let mut credentials = MockCredentialProvider::new();
        credentials.expect_token().returning(|| None);
        let references: HashMap<InstrumentId, Decimal> = HashMap::new();
        Arc::new(MarketSyncClient::new(
            ClientConfig::default(),
            ClientDeps {
                transport: Arc::new(MockFeedTransport::new()),
                credentials: Arc::new(credentials),
                references: Arc::new(references),
                defaults: None,
            },
        ))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn connected_is_healthy() {
        let status = determine_health_status(&stats(ConnectionState::Connected, false));
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn reset_in_progress_is_degraded() {
        let status = determine_health_status(&stats(ConnectionState::Connected, true));
        assert_eq!(status, HealthStatus::Degraded);

        let status = determine_health_status(&stats(ConnectionState::Reconnecting, false));
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn disconnected_is_unhealthy() {
        let status = determine_health_status(&stats(ConnectionState::Disconnected, false));
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let app = router(Arc::new(HealthServerState::new("test".to_string(), idle_client())));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_requires_connection() {
        let app = router(Arc::new(HealthServerState::new("test".to_string(), idle_client())));
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_client_snapshot() {
        let client = idle_client();
        client
            .set_price(&InstrumentId::from(7_u64), Decimal::from(100))
            .unwrap();
        let app = router(Arc::new(HealthServerState::new("1.2.3".to_string(), client)));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["version"], "1.2.3");
        assert_eq!(json["client"]["state"], "disconnected");
        assert_eq!(json["client"]["cache"]["entries"], 1);
    }
}
