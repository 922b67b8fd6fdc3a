//! Error types for the ingestion pipeline.
//!
//! One enum per failure domain, each carrying enough context for the caller
//! to act without string matching:
//! - [`TransportError`]: connection-level; surfaced as state transitions by
//!   the connection manager, never thrown across the pipeline boundary.
//! - [`SubscriptionError`]: instrument-scoped; returned to the caller with
//!   the failing stream kinds enumerated.
//! - [`AggregationError`]: malformed tick; logged and dropped, never fatal.
//! - [`CacheError`]: store failures; surfaced to upsert/query callers.
//! - [`FetchError`]: backfill collaborator failures; recorded in sync
//!   status.
//!
//! All implement [`ErrorClassification`] so retry logic can be generic.

mod common;
mod traits;

pub use common::*;
pub use traits::*;
