//! Detection Sweep
//!
//! Periodic self-healing pass over the price cache. Any unpaused entry
//! sitting at or below its floor is restored to its reference price and an
//! `auto_reset` event is dispatched for it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::events::FeedEvent;
use crate::domain::listeners::ListenerRegistry;
use crate::domain::pricing::{AutoReset, PriceCache};
use crate::infrastructure::metrics;

/// Periodic floor detection.
#[derive(Debug, Clone)]
pub struct DetectionSweep {
    cache: Arc<PriceCache>,
    registry: ListenerRegistry,
    interval: Duration,
}

impl DetectionSweep {
    /// Create a sweep running every `interval` (zero disables the loop).
    #[must_use]
    pub const fn new(cache: Arc<PriceCache>, registry: ListenerRegistry, interval: Duration) -> Self {
        Self {
            cache,
            registry,
            interval,
        }
    }

    /// Run one pass and dispatch an event per correction.
    pub fn run_once(&self) -> Vec<AutoReset> {
        let resets = self.cache.sweep();
        if !resets.is_empty() {
            metrics::record_auto_resets(resets.len());
            tracing::info!(count = resets.len(), "Detection sweep restored prices");
        }
        for reset in &resets {
            self.registry.dispatch(&FeedEvent::AutoReset(reset.clone()));
        }
        metrics::set_cached_instruments(self.cache.len());
        resets
    }

    /// Spawn the periodic loop; it stops when `cancel` fires.
    ///
    /// Returns `None` when the interval is zero.
    pub fn spawn(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            tracing::debug!("Detection sweep disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Detection sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                }
            }
        }))
    }
}
