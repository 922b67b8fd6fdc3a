//! Core data model for the ingestion pipeline.

pub mod types;

pub use types::{
    Bar, ConnectionState, Gap, StreamKind, StreamState, Subscription, SyncState, SyncStatus, Tick,
    Timeframe,
};
