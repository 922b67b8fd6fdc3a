//! Gateway connection lifecycle.

mod manager;

pub use manager::{ConnectionEvent, ConnectionHandle, ConnectionManager};
