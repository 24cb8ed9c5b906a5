//! Provider Adapters
//!
//! Concrete implementations of the credential, reference-price and
//! default-price ports.
//!
//! # Price File Format
//!
//! Reference and default price files share one JSON shape: an object keyed
//! by instrument id whose values are numbers or numeric strings.
//!
//! ```json
//! {"7": 100, "42": "150.25", "AAPL": 189.1}
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde_json::Value;

use super::config::ConfigError;
use crate::application::ports::{
    CredentialProvider, DefaultPriceStore, ReferencePriceProvider, StoreError,
};
use crate::domain::events::decimal_from_json;
use crate::domain::instrument::InstrumentId;

// =============================================================================
// Credentials
// =============================================================================

/// Reads the bearer token from an environment variable on every call, so a
/// rotated token is picked up by the next reconnect.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    /// Read the token from `var`.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Fixed token.
#[derive(Clone)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    /// Always return `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Never return a token.
    #[must_use]
    pub const fn none() -> Self {
        Self { token: None }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

// =============================================================================
// Price Files
// =============================================================================

fn parse_price_map(value: Value) -> Result<HashMap<InstrumentId, Decimal>, String> {
    let Value::Object(entries) = value else {
        return Err("expected a JSON object keyed by instrument id".to_string());
    };

    entries
        .into_iter()
        .map(|(raw_id, raw_price)| {
            let id = InstrumentId::new(raw_id.as_str()).map_err(|e| e.to_string())?;
            let price = decimal_from_json(&raw_price)
                .ok_or_else(|| format!("invalid price {raw_price} for instrument {id}"))?;
            Ok((id, price))
        })
        .collect()
}

/// In-memory reference price catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticReferencePrices {
    prices: HashMap<InstrumentId, Decimal>,
}

impl StaticReferencePrices {
    /// Wrap an existing map.
    #[must_use]
    pub const fn new(prices: HashMap<InstrumentId, Decimal>) -> Self {
        Self { prices }
    }

    /// Load the catalog from a JSON price file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Json` if it is not a valid price file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let prices = parse_price_map(value).map_err(|reason| ConfigError::Json {
            path: path.to_path_buf(),
            source: serde::de::Error::custom(reason),
        })?;

        tracing::info!(path = %path.display(), count = prices.len(), "Loaded reference prices");
        Ok(Self { prices })
    }

    /// Number of known instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Check whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl ReferencePriceProvider for StaticReferencePrices {
    fn reference_price(&self, instrument: &InstrumentId) -> Option<Decimal> {
        self.prices.get(instrument).copied()
    }
}

/// Default prices persisted in a JSON price file, re-read on every load.
#[derive(Debug, Clone)]
pub struct JsonFileDefaultStore {
    path: PathBuf,
}

impl JsonFileDefaultStore {
    /// Read defaults from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DefaultPriceStore for JsonFileDefaultStore {
    fn load_defaults(&self) -> Result<HashMap<InstrumentId, Decimal>, StoreError> {
        let text = fs::read_to_string(&self.path)?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| StoreError::Malformed(e.to_string()))?;
        parse_price_map(value).map_err(StoreError::Malformed)
    }
}
