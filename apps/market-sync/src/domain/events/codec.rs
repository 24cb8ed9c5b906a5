//! Feed Codec
//!
//! Decodes inbound feed frames into typed messages and encodes outbound
//! control records.
//!
//! # Wire Format
//!
//! A frame is a JSON object or a JSON array of objects. Every object carries
//! a string `type`. Price-bearing types additionally carry an instrument id
//! and a price under either of two field names:
//!
//! ```json
//! {"type": "stock_update", "stock_id": 42, "current_price": 150.25}
//! {"type": "price_update", "id": "42", "price": "150.25"}
//! ```
//!
//! Fields missing at the top level are looked up in a nested `data` object.
//! A price-bearing record without a usable id or price fails the whole frame.

use std::collections::HashSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value, json};

use super::{DEFAULT_PRICE_KINDS, FeedRecord, PriceUpdate};
use crate::domain::instrument::InstrumentId;

const ID_FIELDS: [&str; 2] = ["stock_id", "id"];
const PRICE_FIELDS: [&str; 2] = ["current_price", "price"];
const NESTED_FIELD: &str = "data";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not an object or array of objects, or lacks a `type`.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// Price-bearing record lacks a required field.
    #[error("{kind} record missing {field}")]
    MissingField {
        /// Record type.
        kind: String,
        /// Expected field (either name).
        field: &'static str,
    },

    /// Price-bearing record has a field of the wrong shape.
    #[error("{kind} record has invalid {field}: {value}")]
    InvalidField {
        /// Record type.
        kind: String,
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

/// A decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Price-bearing record. `price` and `raw_price` both hold the feed value.
    Price(PriceUpdate),
    /// Any other record.
    Record(FeedRecord),
}

impl FeedMessage {
    /// Record type.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Price(update) => &update.kind,
            Self::Record(record) => &record.kind,
        }
    }
}

/// Strip control characters and surrounding whitespace from a raw frame.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse a decimal from a JSON number or numeric string.
#[must_use]
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// JSON codec for the market-data feed.
#[derive(Debug, Clone)]
pub struct FeedCodec {
    price_kinds: HashSet<String>,
}

impl Default for FeedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE_KINDS)
    }
}

impl FeedCodec {
    /// Create a codec treating `price_kinds` as price-bearing record types.
    #[must_use]
    pub fn new<I, S>(price_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            price_kinds: price_kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Check whether `kind` is price-bearing.
    #[must_use]
    pub fn is_price_kind(&self, kind: &str) -> bool {
        self.price_kinds.contains(kind)
    }

    /// Decode a sanitized text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is not an object or array
    /// of objects, or contains a price-bearing record without a valid id or
    /// price.
    pub fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.decode_value(item))
                .collect(),
            value @ Value::Object(_) => Ok(vec![self.decode_value(value)?]),
            other => Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}",
                truncate(&other.to_string(), 50)
            ))),
        }
    }

    fn decode_value(&self, value: Value) -> Result<FeedMessage, CodecError> {
        let Value::Object(object) = value else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                truncate(&value.to_string(), 50)
            )));
        };

        let kind = match object.get("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind.trim().to_string(),
            _ => {
                return Err(CodecError::InvalidFormat(
                    "record has no string `type` field".to_string(),
                ));
            }
        };

        if !self.is_price_kind(&kind) {
            return Ok(FeedMessage::Record(FeedRecord {
                kind,
                payload: Value::Object(object),
            }));
        }

        let raw_id = lookup(&object, &ID_FIELDS).ok_or_else(|| CodecError::MissingField {
            kind: kind.clone(),
            field: "stock_id|id",
        })?;
        let instrument_id =
            InstrumentId::from_json(raw_id).ok_or_else(|| CodecError::InvalidField {
                kind: kind.clone(),
                field: "stock_id|id",
                value: raw_id.to_string(),
            })?;

        let raw_price = lookup(&object, &PRICE_FIELDS).ok_or_else(|| CodecError::MissingField {
            kind: kind.clone(),
            field: "current_price|price",
        })?;
        let price = decimal_from_json(raw_price).ok_or_else(|| CodecError::InvalidField {
            kind: kind.clone(),
            field: "current_price|price",
            value: raw_price.to_string(),
        })?;

        Ok(FeedMessage::Price(PriceUpdate {
            kind,
            instrument_id,
            price,
            raw_price: price,
            payload: Value::Object(object),
        }))
    }

    /// Encode a liveness ping.
    #[must_use]
    pub fn encode_ping(&self, timestamp_ms: i64) -> String {
        json!({"type": "ping", "timestamp": timestamp_ms}).to_string()
    }
}

/// First non-null value under any of `fields`, falling back to the nested
/// `data` object.
fn lookup<'a>(object: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a Value> {
    let direct = fields
        .iter()
        .find_map(|field| object.get(*field).filter(|v| !v.is_null()));

    direct.or_else(|| {
        object
            .get(NESTED_FIELD)
            .and_then(Value::as_object)
            .and_then(|nested| {
                fields
                    .iter()
                    .find_map(|field| nested.get(*field).filter(|v| !v.is_null()))
            })
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
