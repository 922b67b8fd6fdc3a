//! # marketfeed
//!
//! Real-time market data ingestion pipeline.
//!
//! The pipeline maintains one persistent streaming connection to a broker
//! data gateway, subscribes to per-instrument data streams with graceful
//! degradation, aggregates raw ticks into fixed-interval OHLCV bars, and
//! reconciles live bars with a persisted historical cache so charting
//! clients can render a single consistent series.
//!
//! ## Components
//!
//! - [`connection::ConnectionManager`]: owns the gateway connection, drives
//!   reconnection and health checks, publishes state-change events.
//! - [`subscription::SubscriptionCoordinator`]: per-instrument stream
//!   subscriptions with a prioritized attempt cascade and coarse fallback.
//! - [`aggregator::BarAggregator`]: tick to OHLCV bar synthesis with
//!   seal-on-bucket-advance semantics.
//! - [`cache::BarCache`]: persisted bar storage, gap detection and sync
//!   status bookkeeping.
//! - [`backfill::BackfillExecutor`]: fills detected gaps through an external
//!   historical fetch collaborator.
//! - [`series::SeriesMerger`]: merges cached history with live bars into one
//!   deduplicated, render-safe series.
//! - [`service::MarketDataService`]: pumps the tick stream into the
//!   aggregator and reconciles sealed bars into the cache.

pub mod aggregator;
pub mod backfill;
pub mod cache;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod series;
pub mod service;
pub mod subscription;

pub use aggregator::BarAggregator;
pub use backfill::{BackfillExecutor, BarFetcher};
pub use cache::{BarCache, BarStore, InMemoryBarStore};
pub use connection::{ConnectionEvent, ConnectionManager};
pub use data::types::{Bar, ConnectionState, Gap, StreamKind, Tick, Timeframe};
pub use series::{RenderMode, SeriesMerger};
pub use service::MarketDataService;
pub use subscription::SubscriptionCoordinator;
