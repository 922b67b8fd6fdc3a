//! Pipeline error enums.

use std::time::Duration;
use thiserror::Error;

use crate::data::types::{ConnectionState, StreamKind};

/// Connection-level failures.
///
/// These never cross the pipeline boundary as exceptions: the connection
/// manager converts them into state transitions plus a human-readable
/// message. `connect` returns one only for setup failures that retrying
/// cannot fix.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Transport timeout after {0:?}")]
    Timeout(Duration),

    /// Endpoint URL is malformed
    #[error("Invalid gateway endpoint: {0}")]
    Endpoint(String),

    /// Credentials rejected outright
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    /// Connection closed by the remote side
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Outbound send failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Connect called in a state that cannot accept it
    #[error("Already connected (state: {0})")]
    AlreadyConnected(ConnectionState),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Instrument-scoped subscription failures, returned to the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SubscriptionError {
    /// Subscribe/unsubscribe requires an established connection; requests
    /// are never queued
    #[error("Gateway not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// One stream kind timed out
    #[error("{kind} subscription for {instrument} timed out after {timeout:?}")]
    Timeout {
        instrument: String,
        kind: StreamKind,
        timeout: Duration,
    },

    /// One stream kind was rejected by the gateway
    #[error("{kind} subscription for {instrument} rejected: {reason}")]
    Rejected {
        instrument: String,
        kind: StreamKind,
        reason: String,
    },

    /// Every stream kind and the coarse fallback failed
    #[error("No data stream available for {instrument} (failed kinds: {failed:?})")]
    AllStreamsFailed {
        instrument: String,
        failed: Vec<StreamKind>,
    },
}

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Per-tick anomalies. Always recovered locally: the offending tick is
/// dropped and the pipeline continues.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AggregationError {
    /// Tick carries neither a last price nor a full bid/ask pair
    #[error("Tick for {instrument} has no usable price")]
    NoUsablePrice { instrument: String },

    /// Tick belongs to a bucket older than the open bar; sealed bars are
    /// immutable so the tick is discarded
    #[error("Out-of-order tick for {instrument}: bucket {tick_bucket} behind open {open_bucket}")]
    OutOfOrder {
        instrument: String,
        tick_bucket: chrono::DateTime<chrono::Utc>,
        open_bucket: chrono::DateTime<chrono::Utc>,
    },
}

/// Historical cache failures, surfaced to the caller of upsert/query.
/// Upserts are all-or-nothing per bar, so a failed write never corrupts
/// previously cached data.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// Store write failed
    #[error("Cache write failed: {0}")]
    Write(String),

    /// Store read failed
    #[error("Cache read failed: {0}")]
    Read(String),

    /// Database error from the persistent store
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored row could not be mapped back to a bar
    #[error("Invalid cached bar: {0}")]
    InvalidRow(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Failures from the external historical fetch collaborator.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FetchError {
    /// Gateway historical endpoint request failed
    #[error("Historical fetch failed: {0}")]
    Request(String),

    /// Provider rate limit hit
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// The requested range is not available upstream
    #[error("Data not available: {0}")]
    NotAvailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_error_messages() {
        let err = SubscriptionError::NotConnected {
            state: ConnectionState::Reconnecting,
        };
        assert!(err.to_string().contains("reconnecting"));

        let err = SubscriptionError::AllStreamsFailed {
            instrument: "ESZ5".to_string(),
            failed: vec![StreamKind::Quote, StreamKind::Trade],
        };
        let msg = err.to_string();
        assert!(msg.contains("ESZ5"));
        assert!(msg.contains("Quote"));
        assert!(msg.contains("Trade"));
    }

    #[test]
    fn test_transport_error_messages() {
        let err = TransportError::Endpoint("not a url".to_string());
        assert!(err.to_string().contains("Invalid gateway endpoint"));

        let err = TransportError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_cache_error_from_sqlx() {
        let err: CacheError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, CacheError::Database(_)));
    }
}
