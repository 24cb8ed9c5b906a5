//! Client Configuration Settings
//!
//! Configuration types for the market sync client, loaded from environment
//! variables. Unset variables fall back to defaults; set but unparsable
//! values are errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use url::Url;

use crate::application::client::ClientConfig;
use crate::application::services::backoff::BackoffConfig;
use crate::application::services::connection::ConnectionConfig;
use crate::application::services::heartbeat::HeartbeatConfig;
use crate::application::services::reset::ResetConfig;
use crate::domain::events::DEFAULT_PRICE_KINDS;
use crate::domain::pricing::GuardConfig;

/// Environment variable holding the bearer token.
pub const TOKEN_ENV_VAR: &str = "MARKET_SYNC_TOKEN";

/// Feed endpoint settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub url: Url,
    /// Record types treated as price-bearing.
    pub price_kinds: Vec<String>,
}

/// Connection liveness and reconnection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Heartbeat ping interval (zero disables).
    pub ping_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Failed cycles before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Reconnection delay randomization as a fraction (0.1 = ±10%).
    pub reconnect_jitter: f64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 5,
            reconnect_jitter: 0.1,
        }
    }
}

/// Reset and self-healing timing.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Cooldown after a forced reset.
    pub cooldown: Duration,
    /// Pause kept in place after the post-reset reconnect.
    pub settle_delay: Duration,
    /// Detection sweep period (zero disables).
    pub sweep_interval: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            settle_delay: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Optional JSON price files.
#[derive(Debug, Clone, Default)]
pub struct PriceSources {
    /// Reference prices (floor anchor and sweep target).
    pub reference_prices: Option<PathBuf>,
    /// Default prices applied by `restore_defaults`.
    pub default_prices: Option<PathBuf>,
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Feed endpoint.
    pub feed: FeedSettings,
    /// Connection settings.
    pub connection: ConnectionSettings,
    /// Guard thresholds.
    pub guard: GuardConfig,
    /// Reset and sweep timing.
    pub recovery: RecoverySettings,
    /// Price files.
    pub sources: PriceSources,
    /// Server ports.
    pub server: ServerSettings,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_SYNC_FEED_URL` is missing or empty, or if
    /// any variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let raw_url = env
            .get("MARKET_SYNC_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_SYNC_FEED_URL".to_string()))?;
        if raw_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_SYNC_FEED_URL".to_string()));
        }
        let url = Url::parse(raw_url.trim()).map_err(|e| ConfigError::InvalidValue {
            key: "MARKET_SYNC_FEED_URL".to_string(),
            value: raw_url.clone(),
            reason: e.to_string(),
        })?;

        let price_kinds = env.get("MARKET_SYNC_PRICE_KINDS").map_or_else(
            || DEFAULT_PRICE_KINDS.iter().map(ToString::to_string).collect(),
            |raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|kind| !kind.is_empty())
                    .map(ToString::to_string)
                    .collect()
            },
        );

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            ping_interval: env.duration_secs("MARKET_SYNC_PING_INTERVAL_SECS", defaults.ping_interval)?,
            pong_timeout: env.duration_secs("MARKET_SYNC_PONG_TIMEOUT_SECS", defaults.pong_timeout)?,
            reconnect_delay_initial: env.duration_millis(
                "MARKET_SYNC_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.duration_secs(
                "MARKET_SYNC_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "MARKET_SYNC_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            )?,
            max_reconnect_attempts: env.parse(
                "MARKET_SYNC_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            reconnect_jitter: env.parse("MARKET_SYNC_RECONNECT_JITTER", defaults.reconnect_jitter)?,
        };
        if !(0.0..=1.0).contains(&connection.reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_SYNC_RECONNECT_JITTER".to_string(),
                value: connection.reconnect_jitter.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let guard_defaults = GuardConfig::default();
        let guard = GuardConfig {
            absolute_floor: env.parse("MARKET_SYNC_ABSOLUTE_FLOOR", guard_defaults.absolute_floor)?,
            floor_fraction: env.parse("MARKET_SYNC_FLOOR_FRACTION", guard_defaults.floor_fraction)?,
            drop_limit_fraction: env.parse(
                "MARKET_SYNC_DROP_LIMIT_FRACTION",
                guard_defaults.drop_limit_fraction,
            )?,
            max_price: env.parse("MARKET_SYNC_MAX_PRICE", guard_defaults.max_price)?,
            spike_multiple: env.parse("MARKET_SYNC_SPIKE_MULTIPLE", guard_defaults.spike_multiple)?,
        };
        validate_guard(&guard)?;

        let recovery_defaults = RecoverySettings::default();
        let recovery = RecoverySettings {
            cooldown: env.duration_secs("MARKET_SYNC_COOLDOWN_SECS", recovery_defaults.cooldown)?,
            settle_delay: env.duration_millis(
                "MARKET_SYNC_SETTLE_DELAY_MS",
                recovery_defaults.settle_delay,
            )?,
            sweep_interval: env.duration_secs(
                "MARKET_SYNC_SWEEP_INTERVAL_SECS",
                recovery_defaults.sweep_interval,
            )?,
        };

        let sources = PriceSources {
            reference_prices: env.path("MARKET_SYNC_REFERENCE_PRICES"),
            default_prices: env.path("MARKET_SYNC_DEFAULT_PRICES"),
        };

        let server = ServerSettings {
            health_port: env.parse("MARKET_SYNC_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        Ok(Self {
            feed: FeedSettings { url, price_kinds },
            connection,
            guard,
            recovery,
            sources,
            server,
        })
    }

    /// Build the client configuration.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection: ConnectionConfig {
                heartbeat: HeartbeatConfig::new(
                    self.connection.ping_interval,
                    self.connection.pong_timeout,
                ),
                backoff: BackoffConfig::new(
                    self.connection.reconnect_delay_initial,
                    self.connection.reconnect_delay_max,
                    self.connection.reconnect_delay_multiplier,
                    self.connection.max_reconnect_attempts,
                )
                .with_jitter(self.connection.reconnect_jitter),
            },
            reset: ResetConfig {
                cooldown: self.recovery.cooldown,
                settle_delay: self.recovery.settle_delay,
            },
            guard: self.guard.clone(),
            sweep_interval: self.recovery.sweep_interval,
            price_kinds: self.feed.price_kinds.clone(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },
    /// A configured file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A configured file is not valid JSON of the expected shape.
    #[error("failed to parse {path}: {source}")]
    Json {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

fn validate_guard(guard: &GuardConfig) -> Result<(), ConfigError> {
    let checks = [
        ("MARKET_SYNC_ABSOLUTE_FLOOR", guard.absolute_floor > Decimal::ZERO, guard.absolute_floor),
        ("MARKET_SYNC_FLOOR_FRACTION", guard.floor_fraction >= Decimal::ZERO, guard.floor_fraction),
        (
            "MARKET_SYNC_DROP_LIMIT_FRACTION",
            guard.drop_limit_fraction >= Decimal::ZERO && guard.drop_limit_fraction <= Decimal::ONE,
            guard.drop_limit_fraction,
        ),
        ("MARKET_SYNC_MAX_PRICE", guard.max_price > guard.absolute_floor, guard.max_price),
        ("MARKET_SYNC_SPIKE_MULTIPLE", guard.spike_multiple >= Decimal::ZERO, guard.spike_multiple),
    ];

    for (key, ok, value) in checks {
        if !ok {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "out of range".to_string(),
            });
        }
    }
    Ok(())
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse::<u64>(key, default_ms).map(Duration::from_millis)
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn feed_url_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnvVar(_))));
        assert!(matches!(
            load(&[("MARKET_SYNC_FEED_URL", " ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[("MARKET_SYNC_FEED_URL", "wss://feed.example.com/ws")]).unwrap();

        assert_eq!(config.feed.url.as_str(), "wss://feed.example.com/ws");
        assert_eq!(
            config.feed.price_kinds,
            vec!["stock_update", "price_update", "stock_price_update"]
        );
        assert_eq!(config.connection.ping_interval, Duration::from_secs(25));
        assert_eq!(config.connection.pong_timeout, Duration::from_secs(60));
        assert_eq!(config.connection.reconnect_delay_initial, Duration::from_secs(1));
        assert_eq!(config.connection.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert!((config.connection.reconnect_jitter - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.guard, GuardConfig::default());
        assert_eq!(config.recovery.cooldown, Duration::from_secs(300));
        assert_eq!(config.recovery.settle_delay, Duration::from_secs(2));
        assert_eq!(config.recovery.sweep_interval, Duration::from_secs(30));
        assert!(config.sources.reference_prices.is_none());
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn reconnect_jitter_reaches_backoff() {
        let config = load(&[
            ("MARKET_SYNC_FEED_URL", "ws://localhost:9000"),
            ("MARKET_SYNC_RECONNECT_JITTER", "0.25"),
        ])
        .unwrap();
        let backoff = config.client_config().connection.backoff;
        assert!((backoff.jitter_factor - 0.25).abs() < f64::EPSILON);

        let config = load(&[
            ("MARKET_SYNC_FEED_URL", "ws://localhost:9000"),
            ("MARKET_SYNC_RECONNECT_JITTER", "0"),
        ])
        .unwrap();
        assert!(config.client_config().connection.backoff.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn reconnect_jitter_out_of_range_is_rejected() {
        for raw in ["1.5", "-0.1", "NaN", "lots"] {
            let result = load(&[
                ("MARKET_SYNC_FEED_URL", "ws://localhost:9000"),
                ("MARKET_SYNC_RECONNECT_JITTER", raw),
            ]);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { ref key, .. }) if key == "MARKET_SYNC_RECONNECT_JITTER"),
                "{raw} accepted"
            );
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("MARKET_SYNC_FEED_URL", "ws://localhost:9000"),
            ("MARKET_SYNC_PRICE_KINDS", "tick, quote ,"),
            ("MARKET_SYNC_MAX_RECONNECT_ATTEMPTS", "0"),
            ("MARKET_SYNC_FLOOR_FRACTION", "0.5"),
            ("MARKET_SYNC_COOLDOWN_SECS", "60"),
            ("MARKET_SYNC_REFERENCE_PRICES", "/etc/market-sync/refs.json"),
        ])
        .unwrap();

        assert_eq!(config.feed.price_kinds, vec!["tick", "quote"]);
        assert_eq!(config.connection.max_reconnect_attempts, 0);
        assert_eq!(config.guard.floor_fraction, Decimal::new(5, 1));
        assert_eq!(config.recovery.cooldown, Duration::from_secs(60));
        assert_eq!(
            config.sources.reference_prices,
            Some(PathBuf::from("/etc/market-sync/refs.json"))
        );
    }

    #[test]
    fn unparsable_values_are_errors() {
        let err = load(&[
            ("MARKET_SYNC_FEED_URL", "wss://feed.example.com"),
            ("MARKET_SYNC_PING_INTERVAL_SECS", "soon"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MARKET_SYNC_PING_INTERVAL_SECS"));

        assert!(matches!(
            load(&[("MARKET_SYNC_FEED_URL", "not a url")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn out_of_range_guard_values_are_errors() {
        let err = load(&[
            ("MARKET_SYNC_FEED_URL", "wss://feed.example.com"),
            ("MARKET_SYNC_DROP_LIMIT_FRACTION", "1.5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn client_config_carries_settings() {
        let config = load(&[
            ("MARKET_SYNC_FEED_URL", "wss://feed.example.com"),
            ("MARKET_SYNC_SETTLE_DELAY_MS", "250"),
        ])
        .unwrap();
        let client = config.client_config();
        assert_eq!(client.reset.settle_delay, Duration::from_millis(250));
        assert_eq!(client.connection.backoff.max_attempts, 5);
        assert_eq!(client.connection.heartbeat.ping_interval, Duration::from_secs(25));
        assert_eq!(client.sweep_interval, Duration::from_secs(30));
    }
}
