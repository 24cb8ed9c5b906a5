//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedTransport`: Opens one bidirectional message channel to the feed
//! - `CredentialProvider`: Supplies the bearer token at connect time
//! - `ReferencePriceProvider`: Reference price per instrument
//! - `DefaultPriceStore`: Optional persisted default prices

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::domain::instrument::InstrumentId;

pub use crate::domain::pricing::ReferencePriceProvider;

// =============================================================================
// Feed Transport
// =============================================================================

/// Transport failures. These trigger reconnection and are never surfaced to
/// `connect()` callers while retries remain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Endpoint URL could not be built.
    #[error("invalid feed url: {0}")]
    InvalidUrl(String),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped.
    #[error("connection closed")]
    Closed,
}

/// Frame queued for the transport to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame.
    Text(String),
    /// Close the connection gracefully.
    Close,
}

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound text frame (unsanitized).
    Message(String),
    /// Peer closed the connection.
    Closed {
        /// Close reason, if the peer gave one.
        reason: Option<String>,
    },
    /// Socket error; the link is unusable afterwards.
    Error(String),
}

/// An open transport connection.
///
/// Dropping `outbound` or sending [`OutboundFrame::Close`] tears the link
/// down. `inbound` ends (returns `None`) once the link is gone.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to send.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Frames and lifecycle events received.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens feed connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open one connection authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the connection cannot be established.
    async fn open(&self, token: &str) -> Result<TransportLink, TransportError>;
}

// =============================================================================
// Credentials
// =============================================================================

/// Supplies the bearer credential, read fresh at every connection attempt.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` if no credential is available.
    fn token(&self) -> Option<String>;
}

// =============================================================================
// Default Prices
// =============================================================================

/// Errors loading persisted default prices.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backing storage could not be read.
    #[error("failed to read default prices: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data is malformed.
    #[error("malformed default prices: {0}")]
    Malformed(String),
}

/// Optional persistence collaborator holding default prices.
#[cfg_attr(test, mockall::automock)]
pub trait DefaultPriceStore: Send + Sync {
    /// Load every stored default price.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read or parsed.
    fn load_defaults(&self) -> Result<HashMap<InstrumentId, Decimal>, StoreError>;
}
