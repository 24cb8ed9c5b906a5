//! Price Guard
//!
//! Validates and clamps incoming feed prices before they reach the cache.
//!
//! # Algorithm
//!
//! Given an incoming price, the instrument's current cached price (if any)
//! and its reference price (if known):
//!
//! 1. Reject non-positive prices, prices above the absolute ceiling, and
//!    prices more than `spike_multiple` times the cached price.
//! 2. `floor = max(absolute_floor, reference × floor_fraction)`
//! 3. `minimum_allowed = cached × drop_limit_fraction`
//! 4. `safe = max(incoming, floor, minimum_allowed)`
//!
//! The guard is pure: pause and cooldown checks belong to the cache.

use rust_decimal::Decimal;
use serde::Serialize;

/// Guard thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Minimum price any instrument may fall to via the feed.
    pub absolute_floor: Decimal,
    /// Fraction of the reference price used as a per-instrument floor.
    pub floor_fraction: Decimal,
    /// A single update may not take the price below `cached × drop_limit_fraction`.
    pub drop_limit_fraction: Decimal,
    /// Absolute sanity ceiling; anything above is treated as corrupt.
    pub max_price: Decimal,
    /// Reject prices above `cached × spike_multiple` (zero disables).
    pub spike_multiple: Decimal,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            absolute_floor: Decimal::new(1, 2),
            floor_fraction: Decimal::new(25, 2),
            drop_limit_fraction: Decimal::new(95, 2),
            max_price: Decimal::from(1_000_000),
            spike_multiple: Decimal::from(100),
        }
    }
}

/// Why an incoming price was rejected as corrupt feed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Price was zero or negative.
    NonPositive,
    /// Price exceeded the absolute sanity ceiling.
    AboveCeiling,
    /// Price jumped more than `spike_multiple` above the cached value.
    Spike,
}

impl RejectReason {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NonPositive => "non_positive",
            Self::AboveCeiling => "above_ceiling",
            Self::Spike => "spike",
        }
    }
}

/// Which protective bound raised the stored price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampReason {
    /// The per-instrument floor.
    Floor,
    /// The single-step drop limit.
    DropLimit,
}

impl ClampReason {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Floor => "floor",
            Self::DropLimit => "drop_limit",
        }
    }
}

/// Result of evaluating one incoming price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Store the incoming price unchanged.
    Accept(Decimal),
    /// Store `safe` instead of `incoming`.
    Clamp {
        /// Raw price from the feed.
        incoming: Decimal,
        /// Price that will be stored.
        safe: Decimal,
        /// Bound that produced `safe`.
        reason: ClampReason,
    },
    /// Discard the update.
    Reject(RejectReason),
}

/// Stateless price validator.
#[derive(Debug, Clone, Default)]
pub struct PriceGuard {
    config: GuardConfig,
}

impl PriceGuard {
    /// Create a guard with the given thresholds.
    #[must_use]
    pub const fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Get the guard thresholds.
    #[must_use]
    pub const fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Compute the protective floor for an instrument.
    #[must_use]
    pub fn floor(&self, reference: Option<Decimal>) -> Decimal {
        let derived = reference.map_or(Decimal::ZERO, |r| {
            r.saturating_mul(self.config.floor_fraction)
        });
        derived.max(self.config.absolute_floor)
    }

    /// Check whether a price sits at or below the instrument's floor.
    #[must_use]
    pub fn is_at_or_below_floor(&self, price: Decimal, reference: Option<Decimal>) -> bool {
        price <= self.floor(reference)
    }

    /// Evaluate an incoming feed price.
    #[must_use]
    pub fn evaluate(
        &self,
        incoming: Decimal,
        current: Option<Decimal>,
        reference: Option<Decimal>,
    ) -> GuardDecision {
        if incoming <= Decimal::ZERO {
            return GuardDecision::Reject(RejectReason::NonPositive);
        }
        if incoming > self.config.max_price {
            return GuardDecision::Reject(RejectReason::AboveCeiling);
        }
        if let Some(cached) = current
            && self.config.spike_multiple > Decimal::ZERO
            && cached > Decimal::ZERO
            && incoming > cached.saturating_mul(self.config.spike_multiple)
        {
            return GuardDecision::Reject(RejectReason::Spike);
        }

        let floor = self.floor(reference);
        let minimum_allowed = current.map_or(Decimal::ZERO, |cached| {
            cached.saturating_mul(self.config.drop_limit_fraction)
        });

        let safe = incoming.max(floor).max(minimum_allowed);
        if safe == incoming {
            return GuardDecision::Accept(incoming);
        }

        let reason = if floor >= minimum_allowed {
            ClampReason::Floor
        } else {
            ClampReason::DropLimit
        };

        GuardDecision::Clamp {
            incoming,
            safe,
            reason,
        }
    }
}
