//! Feed Events
//!
//! Everything the client hands to listeners: parsed feed records and locally
//! generated notifications.
//!
//! Events are split into two classes:
//!
//! - **Data** events come from the feed (price updates and any other record
//!   type the feed sends). They are suppressed during a reset.
//! - **Control** events describe the client itself (connection lifecycle,
//!   cooldown, corrections). They always reach listeners.

pub mod codec;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use super::instrument::InstrumentId;
use super::pricing::AutoReset;

pub use codec::{CodecError, FeedCodec, FeedMessage, decimal_from_json, sanitize};

/// Wildcard channel receiving every dispatched event.
pub const WILDCARD: &str = "*";

/// Default price-bearing record types.
pub const DEFAULT_PRICE_KINDS: [&str; 3] = ["stock_update", "price_update", "stock_price_update"];

/// Feed record types that are liveness chatter rather than data.
pub const CONTROL_RECORD_KINDS: [&str; 2] = ["pong", "heartbeat"];

/// Event type names for locally generated notifications.
pub mod kinds {
    /// Transport opened.
    pub const CONNECTED: &str = "connected";
    /// Transport lost after being connected.
    pub const DISCONNECTED: &str = "disconnected";
    /// Reconnection gave up.
    pub const RECONNECT_FAILED: &str = "reconnect_failed";
    /// Post-reset cooldown elapsed.
    pub const COOLDOWN_ENDED: &str = "cooldown_ended";
    /// Detection sweep restored a reference price.
    pub const AUTO_RESET: &str = "auto_reset";
    /// A feed price was clamped before being stored.
    pub const PRICE_CLAMPED: &str = "price_clamped";
}

/// A price-bearing feed record after the guard has run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// Record type as sent by the feed.
    pub kind: String,
    /// Normalized instrument id.
    pub instrument_id: InstrumentId,
    /// Price as stored in the cache.
    pub price: Decimal,
    /// Price as sent by the feed.
    pub raw_price: Decimal,
    /// Full sanitized record.
    pub payload: Value,
}

impl PriceUpdate {
    /// Check whether the guard altered the feed price.
    #[must_use]
    pub fn was_clamped(&self) -> bool {
        self.price != self.raw_price
    }
}

/// A feed record that carries no price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedRecord {
    /// Record type as sent by the feed.
    pub kind: String,
    /// Full sanitized record.
    pub payload: Value,
}

impl FeedRecord {
    /// Check whether this record is liveness chatter.
    #[must_use]
    pub fn is_control(&self) -> bool {
        CONTROL_RECORD_KINDS.contains(&self.kind.as_str())
    }
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    /// Guarded price update.
    Price(PriceUpdate),
    /// Any other feed record.
    Record(FeedRecord),
    /// Transport opened.
    Connected,
    /// Transport lost after being connected.
    Disconnected {
        /// Close reason, if the transport gave one.
        reason: Option<String>,
    },
    /// Reconnection gave up after `attempts` failed cycles.
    ReconnectFailed {
        /// Failed cycles.
        attempts: u32,
    },
    /// Post-reset cooldown elapsed.
    CooldownEnded,
    /// Detection sweep restored a reference price.
    AutoReset(AutoReset),
    /// A feed price was clamped before being stored.
    PriceClamped {
        /// Affected instrument.
        instrument_id: InstrumentId,
        /// Raw feed price.
        incoming: Decimal,
        /// Price actually stored.
        stored: Decimal,
    },
}

impl FeedEvent {
    /// Channel this event is dispatched on.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Price(update) => &update.kind,
            Self::Record(record) => &record.kind,
            Self::Connected => kinds::CONNECTED,
            Self::Disconnected { .. } => kinds::DISCONNECTED,
            Self::ReconnectFailed { .. } => kinds::RECONNECT_FAILED,
            Self::CooldownEnded => kinds::COOLDOWN_ENDED,
            Self::AutoReset(_) => kinds::AUTO_RESET,
            Self::PriceClamped { .. } => kinds::PRICE_CLAMPED,
        }
    }

    /// Check whether this event survives listener suppression.
    #[must_use]
    pub fn is_control(&self) -> bool {
        match self {
            Self::Price(_) => false,
            Self::Record(record) => record.is_control(),
            _ => true,
        }
    }

    /// Instrument the event refers to, if any.
    #[must_use]
    pub const fn instrument_id(&self) -> Option<&InstrumentId> {
        match self {
            Self::Price(update) => Some(&update.instrument_id),
            Self::AutoReset(reset) => Some(&reset.instrument_id),
            Self::PriceClamped { instrument_id, .. } => Some(instrument_id),
            _ => None,
        }
    }
}
