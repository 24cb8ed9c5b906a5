//! Domain Layer - Core market-sync types and business logic.
//!
//! This layer holds the price model and the in-process event plumbing. It
//! performs no I/O; time enters only through tokio's clock for cooldown
//! windows.

/// Feed events and the wire codec.
pub mod events;

/// Instrument identity normalization.
pub mod instrument;

/// Listener registry for in-process subscribers.
pub mod listeners;

/// Price guard, price cache and reference-price lookup.
pub mod pricing;
