//! Instrument Identity
//!
//! Feeds identify instruments with either a JSON number (`42`) or a JSON
//! string (`"42"`, `"AAPL"`). Both forms normalize into one canonical
//! textual id so that `42` and `"42"` address the same cache entry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Error returned when an instrument id is empty or not representable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instrument id: {0:?}")]
pub struct InvalidInstrumentId(pub String);

/// Canonical instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    /// Create an id from its textual form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstrumentId` if the trimmed id is empty.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidInstrumentId> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidInstrumentId(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Normalize an id from a JSON value (number or string).
    ///
    /// Returns `None` for any other JSON type or an empty string.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Self::new(n.to_string()).ok(),
            Value::String(s) => Self::new(s.as_str()).ok(),
            _ => None,
        }
    }

    /// Get the canonical textual id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstrumentId {
    type Err = InvalidInstrumentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<u64> for InstrumentId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<u32> for InstrumentId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for InstrumentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("expected a non-empty number or string id, got {value}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_string_ids_normalize_equal() {
        let from_number = InstrumentId::from_json(&serde_json::json!(42)).unwrap();
        let from_string = InstrumentId::from_json(&serde_json::json!("42")).unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number, InstrumentId::from(42_u64));
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(InstrumentId::new("").is_err());
        assert!(InstrumentId::new("   ").is_err());
        assert!(InstrumentId::from_json(&serde_json::json!("")).is_none());
    }

    #[test]
    fn non_scalar_json_is_rejected() {
        assert!(InstrumentId::from_json(&serde_json::json!(null)).is_none());
        assert!(InstrumentId::from_json(&serde_json::json!({"id": 1})).is_none());
        assert!(InstrumentId::from_json(&serde_json::json!([1])).is_none());
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let id = InstrumentId::new("  AAPL ").unwrap();
        assert_eq!(id.as_str(), "AAPL");
    }

    #[test]
    fn deserializes_from_either_form() {
        let ids: Vec<InstrumentId> = serde_json::from_str(r#"[7, "7", "MSFT"]"#).unwrap();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[2].to_string(), "MSFT");
    }
}
