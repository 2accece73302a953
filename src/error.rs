//! Error types for the presence relay.

use crate::types::ColleagueId;
use thiserror::Error;

/// Main error type for bus, session and roster operations.
///
/// Every variant is local to one session, one subscription or one roster
/// call. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence collaborator failed while reading the snapshot.
    #[error("Snapshot read failed: {0}")]
    SnapshotRead(String),

    /// The bus refused a new subscriber.
    #[error("Subscription capacity reached (max: {limit})")]
    SubscriptionCapacity { limit: usize },

    /// Writing to a connected client failed. Treated as a disconnect.
    #[error("Transport write failed: {0}")]
    TransportWrite(String),

    #[error("Event bus is closed")]
    BusClosed,

    #[error("Colleague not found: {0}")]
    ColleagueNotFound(ColleagueId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid roster format: {0}")]
    InvalidFormat(String),

    #[error("Roster is locked by another process")]
    Locked,
}

impl RelayError {
    /// Short machine-readable code, used in `error` stream messages.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Io(_) => "io",
            RelayError::SnapshotRead(_) => "snapshot_read",
            RelayError::SubscriptionCapacity { .. } => "capacity",
            RelayError::TransportWrite(_) => "transport_write",
            RelayError::BusClosed => "bus_closed",
            RelayError::ColleagueNotFound(_) => "not_found",
            RelayError::Serialization(_) => "serialization",
            RelayError::Deserialization(_) => "deserialization",
            RelayError::Corruption(_) => "corruption",
            RelayError::InvalidFormat(_) => "invalid_format",
            RelayError::Locked => "locked",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
