//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `backoff`: Reconnect delay schedule and attempt tracking
//! - `heartbeat`: Liveness pings over the feed connection
//! - `connection`: Connection state machine and inbound frame pipeline
//! - `reset`: Forced cache reset with cooldown
//! - `sweep`: Periodic floor detection and self-healing

pub mod backoff;
pub mod connection;
pub mod heartbeat;
pub mod reset;
pub mod sweep;
