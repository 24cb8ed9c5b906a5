//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services, the client facade and the
//! port interfaces that define how the domain interacts with external
//! systems.

/// Client facade with explicit init/dispose lifecycle.
pub mod client;

/// Port interfaces for external systems (transport, credentials, prices).
pub mod ports;

/// Connection, backoff, heartbeat, reset and sweep services.
pub mod services;
