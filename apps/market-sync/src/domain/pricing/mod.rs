//! Pricing Domain
//!
//! The guarded price cache and the lookup it depends on.
//!
//! - `guard`: pure validation and clamping of feed prices
//! - `cache`: last-known price per instrument, pause set, cooldown window

pub mod cache;
pub mod guard;

use std::collections::HashMap;

use rust_decimal::Decimal;

use super::instrument::InstrumentId;

pub use cache::{
    AutoReset, CacheError, CacheStats, CooldownTicket, CooldownWindow, DiscardReason,
    PriceCache, PriceCacheEntry, PriceSource, UpdateOutcome,
};
pub use guard::{ClampReason, GuardConfig, GuardDecision, PriceGuard, RejectReason};

/// Lookup for an instrument's reference (default) price.
///
/// The reference price anchors the protective floor and is the value the
/// detection sweep restores when a cached price falls to its floor.
#[cfg_attr(test, mockall::automock)]
pub trait ReferencePriceProvider: Send + Sync {
    /// Reference price for `instrument`, if the catalog knows it.
    fn reference_price(&self, instrument: &InstrumentId) -> Option<Decimal>;
}

impl ReferencePriceProvider for HashMap<InstrumentId, Decimal> {
    fn reference_price(&self, instrument: &InstrumentId) -> Option<Decimal> {
        self.get(instrument).copied()
    }
}
