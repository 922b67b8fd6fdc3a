//! Standardized logging configuration.
//!
//! Consistent `tracing` output across binaries and tests with support for:
//! - Human-readable console output (default)
//! - JSON format for log aggregation
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. `info`, `marketfeed=debug`)
//! - `LOG_FORMAT`: output format - `pretty` (default), `compact`, or `json`
//! - `LOG_TIMESTAMPS`: timestamp format - `local` (default), `utc`, or `none`
//! - `LOG_LEVEL`: default level when `RUST_LOG` is unset

mod config;

pub use config::{init_logging, LogConfig, LogFormat, TimestampFormat};
