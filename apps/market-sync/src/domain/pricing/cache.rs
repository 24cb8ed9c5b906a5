//! Price Cache
//!
//! Authoritative last-known price per instrument.
//!
//! Feed updates go through [`PriceCache::apply_feed_update`], which checks
//! the pause set and the cooldown window before handing the price to the
//! [`PriceGuard`]. Manual overrides go through [`PriceCache::set_price`] and
//! bypass the guard entirely.
//!
//! Locks are never held across an `.await` or while calling out to
//! listeners.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use super::ReferencePriceProvider;
use super::guard::{ClampReason, GuardDecision, PriceGuard, RejectReason};
use crate::domain::instrument::{InstrumentId, InvalidInstrumentId};

// =============================================================================
// Types
// =============================================================================

/// Where a cached price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Guarded feed update.
    Feed,
    /// Authoritative out-of-band override.
    Manual,
    /// Restored to the reference price by the detection sweep.
    Reference,
}

/// One cached price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceCacheEntry {
    /// Instrument this entry belongs to.
    pub instrument_id: InstrumentId,
    /// Last-known price (always > 0).
    pub price: Decimal,
    /// When the price was written.
    pub last_updated_at: DateTime<Utc>,
    /// Which path wrote the price.
    pub source: PriceSource,
}

/// Time-bounded period during which feed updates are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownWindow {
    started_at: Instant,
    duration: Duration,
}

impl CooldownWindow {
    /// Start a window now.
    #[must_use]
    pub fn starting_now(duration: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            duration,
        }
    }

    /// Window length.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Check whether the window covers `now`.
    #[must_use]
    pub fn is_active_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) < self.duration
    }

    /// Time left at `now` (zero once elapsed).
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.started_at))
    }
}

/// Identifies one cooldown window so a stale timer cannot end a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownTicket(u64);

/// Why a feed update did not touch the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Instrument (or everything) is paused.
    Paused,
    /// A cooldown window is active.
    Cooldown,
    /// The guard rejected the price as corrupt.
    Rejected(RejectReason),
}

impl DiscardReason {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Cooldown => "cooldown",
            Self::Rejected(reason) => reason.as_str(),
        }
    }
}

/// Result of a guarded feed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Incoming price stored unchanged.
    Stored {
        /// Stored price.
        price: Decimal,
    },
    /// A protective bound replaced the incoming price.
    Clamped {
        /// Raw feed price.
        incoming: Decimal,
        /// Price actually stored.
        stored: Decimal,
        /// Bound that applied.
        reason: ClampReason,
    },
    /// Update dropped.
    Discarded(DiscardReason),
}

impl UpdateOutcome {
    /// Price written to the cache, if any.
    #[must_use]
    pub const fn stored_price(&self) -> Option<Decimal> {
        match self {
            Self::Stored { price } => Some(*price),
            Self::Clamped { stored, .. } => Some(*stored),
            Self::Discarded(_) => None,
        }
    }
}

/// A correction applied by the detection sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoReset {
    /// Corrected instrument.
    pub instrument_id: InstrumentId,
    /// Price found at or below the floor.
    pub from: Decimal,
    /// Reference price written in its place.
    pub to: Decimal,
    /// Floor that was violated.
    pub floor: Decimal,
}

/// Cache observability snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of cached instruments.
    pub entries: usize,
    /// Feed updates stored after clamping.
    pub clamped_updates: u64,
    /// Feed updates dropped (paused, cooldown, rejected).
    pub discarded_updates: u64,
    /// Instruments individually paused.
    pub paused: Vec<InstrumentId>,
    /// Global pause flag.
    pub paused_all: bool,
    /// Remaining cooldown, if a window is active.
    pub cooldown_remaining_ms: Option<u64>,
}

/// Programmer errors raised by the manual override path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Instrument id was empty.
    #[error("invalid instrument id: {0:?}")]
    InvalidInstrument(String),
    /// Override price was zero or negative.
    #[error("invalid price {price} for instrument {instrument}")]
    InvalidPrice {
        /// Target instrument.
        instrument: InstrumentId,
        /// Rejected price.
        price: Decimal,
    },
}

impl From<InvalidInstrumentId> for CacheError {
    fn from(err: InvalidInstrumentId) -> Self {
        Self::InvalidInstrument(err.0)
    }
}

// =============================================================================
// Cache State
// =============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<InstrumentId, PriceCacheEntry>,
    paused: HashSet<InstrumentId>,
    paused_all: bool,
    cooldown: Option<(CooldownTicket, CooldownWindow)>,
    next_ticket: u64,
    clamped_updates: u64,
    discarded_updates: u64,
}

impl CacheState {
    fn is_paused(&self, instrument: &InstrumentId) -> bool {
        self.paused_all || self.paused.contains(instrument)
    }

    fn cooldown_active(&self, now: Instant) -> bool {
        self.cooldown
            .as_ref()
            .is_some_and(|(_, window)| window.is_active_at(now))
    }

    fn write(&mut self, instrument: &InstrumentId, price: Decimal, source: PriceSource) {
        self.entries.insert(
            instrument.clone(),
            PriceCacheEntry {
                instrument_id: instrument.clone(),
                price,
                last_updated_at: Utc::now(),
                source,
            },
        );
    }
}

// =============================================================================
// Price Cache
// =============================================================================

/// Guarded in-memory price cache.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// use market_sync::domain::instrument::InstrumentId;
/// use market_sync::domain::pricing::{PriceCache, PriceGuard};
/// use rust_decimal::Decimal;
///
/// let references: HashMap<InstrumentId, Decimal> =
///     HashMap::from([(InstrumentId::from(7_u64), Decimal::from(100))]);
/// let cache = PriceCache::new(PriceGuard::default(), Arc::new(references));
///
/// let id = InstrumentId::from(7_u64);
/// let outcome = cache.apply_feed_update(&id, Decimal::new(1, 2));
/// assert_eq!(outcome.stored_price(), Some(Decimal::from(25)));
/// assert_eq!(cache.get_price(&id, Decimal::ZERO), Decimal::from(25));
/// ```
pub struct PriceCache {
    guard: PriceGuard,
    references: Arc<dyn ReferencePriceProvider>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("guard", &self.guard)
            .field("entries", &self.state.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl PriceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(guard: PriceGuard, references: Arc<dyn ReferencePriceProvider>) -> Self {
        Self {
            guard,
            references,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Get the guard used for feed updates.
    #[must_use]
    pub const fn guard(&self) -> &PriceGuard {
        &self.guard
    }

    /// Apply a feed price through the guard pipeline.
    pub fn apply_feed_update(&self, instrument: &InstrumentId, incoming: Decimal) -> UpdateOutcome {
        let reference = self.references.reference_price(instrument);
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.is_paused(instrument) {
            state.discarded_updates += 1;
            tracing::debug!(instrument = %instrument, %incoming, "Feed update discarded: paused");
            return UpdateOutcome::Discarded(DiscardReason::Paused);
        }

        if state.cooldown_active(now) {
            state.discarded_updates += 1;
            tracing::trace!(instrument = %instrument, "Feed update discarded: cooldown active");
            return UpdateOutcome::Discarded(DiscardReason::Cooldown);
        }

        let current = state.entries.get(instrument).map(|entry| entry.price);

        match self.guard.evaluate(incoming, current, reference) {
            GuardDecision::Reject(reason) => {
                state.discarded_updates += 1;
                tracing::warn!(
                    instrument = %instrument,
                    %incoming,
                    cached = ?current,
                    reason = reason.as_str(),
                    "Rejected corrupt feed price"
                );
                UpdateOutcome::Discarded(DiscardReason::Rejected(reason))
            }
            GuardDecision::Accept(price) => {
                state.write(instrument, price, PriceSource::Feed);
                UpdateOutcome::Stored { price }
            }
            GuardDecision::Clamp {
                incoming,
                safe,
                reason,
            } => {
                state.write(instrument, safe, PriceSource::Feed);
                state.clamped_updates += 1;
                tracing::warn!(
                    instrument = %instrument,
                    %incoming,
                    stored = %safe,
                    cached = ?current,
                    reason = reason.as_str(),
                    "Clamped feed price"
                );
                UpdateOutcome::Clamped {
                    incoming,
                    stored: safe,
                    reason,
                }
            }
        }
    }

    /// Authoritatively set a price, bypassing the guard.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidPrice` for a zero or negative price.
    pub fn set_price(&self, instrument: &InstrumentId, price: Decimal) -> Result<(), CacheError> {
        if price <= Decimal::ZERO {
            return Err(CacheError::InvalidPrice {
                instrument: instrument.clone(),
                price,
            });
        }

        self.state
            .lock()
            .write(instrument, price, PriceSource::Manual);
        tracing::info!(instrument = %instrument, %price, "Manual price override");
        Ok(())
    }

    /// Cached price for `instrument`, or `fallback` when absent.
    #[must_use]
    pub fn get_price(&self, instrument: &InstrumentId, fallback: Decimal) -> Decimal {
        self.state
            .lock()
            .entries
            .get(instrument)
            .map_or(fallback, |entry| entry.price)
    }

    /// Full cache entry for `instrument`.
    #[must_use]
    pub fn entry(&self, instrument: &InstrumentId) -> Option<PriceCacheEntry> {
        self.state.lock().entries.get(instrument).cloned()
    }

    /// Snapshot of every cached entry, ordered by instrument id.
    #[must_use]
    pub fn entries(&self) -> Vec<PriceCacheEntry> {
        let mut entries: Vec<_> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        entries
    }

    /// Number of cached instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    // =========================================================================
    // Pause Set
    // =========================================================================

    /// Shield one instrument from feed updates.
    pub fn pause(&self, instrument: &InstrumentId) {
        self.state.lock().paused.insert(instrument.clone());
        tracing::debug!(instrument = %instrument, "Instrument paused");
    }

    /// Re-enable feed updates for one instrument.
    pub fn resume(&self, instrument: &InstrumentId) {
        self.state.lock().paused.remove(instrument);
        tracing::debug!(instrument = %instrument, "Instrument resumed");
    }

    /// Shield every instrument from feed updates.
    pub fn pause_all(&self) {
        self.state.lock().paused_all = true;
        tracing::debug!("All instruments paused");
    }

    /// Clear the global pause flag. Individually paused instruments stay paused.
    pub fn resume_all(&self) {
        self.state.lock().paused_all = false;
        tracing::debug!("Global pause cleared");
    }

    /// Check whether the global pause flag is set.
    #[must_use]
    pub fn is_paused_all(&self) -> bool {
        self.state.lock().paused_all
    }

    /// Check whether feed updates for `instrument` are currently suppressed.
    #[must_use]
    pub fn is_paused(&self, instrument: &InstrumentId) -> bool {
        self.state.lock().is_paused(instrument)
    }

    // =========================================================================
    // Cooldown Window
    // =========================================================================

    /// Start (or replace) the cooldown window.
    pub fn start_cooldown(&self, duration: Duration) -> CooldownTicket {
        let mut state = self.state.lock();
        state.next_ticket += 1;
        let ticket = CooldownTicket(state.next_ticket);
        state.cooldown = Some((ticket, CooldownWindow::starting_now(duration)));
        tracing::info!(duration_secs = duration.as_secs_f64(), "Cooldown window started");
        ticket
    }

    /// Clear the cooldown window if `ticket` still owns it.
    ///
    /// Returns `false` when a newer window has replaced it.
    pub fn finish_cooldown(&self, ticket: CooldownTicket) -> bool {
        let mut state = self.state.lock();
        match state.cooldown {
            Some((current, _)) if current == ticket => {
                state.cooldown = None;
                true
            }
            _ => false,
        }
    }

    /// Clear any cooldown window.
    pub fn end_cooldown(&self) {
        self.state.lock().cooldown = None;
    }

    /// Check whether feed updates are currently suppressed by a cooldown.
    #[must_use]
    pub fn cooldown_active(&self) -> bool {
        self.state.lock().cooldown_active(Instant::now())
    }

    /// Remaining cooldown time, if a window is active.
    #[must_use]
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .cooldown
            .as_ref()
            .filter(|(_, window)| window.is_active_at(now))
            .map(|(_, window)| window.remaining_at(now))
    }

    // =========================================================================
    // Detection Sweep
    // =========================================================================

    /// Reset every unpaused entry sitting at or below its floor to its
    /// reference price.
    ///
    /// Entries without a known reference are logged and left alone.
    pub fn sweep(&self) -> Vec<AutoReset> {
        let candidates: Vec<(InstrumentId, Decimal)> = {
            let state = self.state.lock();
            if state.paused_all {
                return Vec::new();
            }
            state
                .entries
                .values()
                .filter(|entry| !state.paused.contains(&entry.instrument_id))
                .map(|entry| (entry.instrument_id.clone(), entry.price))
                .collect()
        };

        let mut resets = Vec::new();

        for (instrument, price) in candidates {
            let reference = self.references.reference_price(&instrument);
            let floor = self.guard.floor(reference);
            if price > floor {
                continue;
            }

            let Some(reference) = reference.filter(|r| *r > Decimal::ZERO && *r != price) else {
                tracing::warn!(
                    instrument = %instrument,
                    %price,
                    %floor,
                    "Price at floor but no usable reference price"
                );
                continue;
            };

            let mut state = self.state.lock();
            if state.is_paused(&instrument) {
                continue;
            }
            // Skip if the entry changed since the snapshot.
            if state.entries.get(&instrument).map(|e| e.price) != Some(price) {
                continue;
            }
            state.write(&instrument, reference, PriceSource::Reference);
            drop(state);

            tracing::warn!(
                instrument = %instrument,
                from = %price,
                to = %reference,
                %floor,
                "Auto-reset price at or below floor"
            );
            resets.push(AutoReset {
                instrument_id: instrument,
                from: price,
                to: reference,
                floor,
            });
        }

        resets
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        let mut paused: Vec<_> = state.paused.iter().cloned().collect();
        paused.sort();

        CacheStats {
            entries: state.entries.len(),
            clamped_updates: state.clamped_updates,
            discarded_updates: state.discarded_updates,
            paused,
            paused_all: state.paused_all,
            cooldown_remaining_ms: state
                .cooldown
                .as_ref()
                .filter(|(_, window)| window.is_active_at(now))
                .map(|(_, window)| {
                    u64::try_from(window.remaining_at(now).as_millis()).unwrap_or(u64::MAX)
                }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
