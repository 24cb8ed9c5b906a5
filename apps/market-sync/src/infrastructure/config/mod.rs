//! Configuration Module
//!
//! Configuration loading for the market sync client.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, FeedSettings, PriceSources, RecoverySettings,
    ServerSettings, SyncConfig, TOKEN_ENV_VAR,
};
