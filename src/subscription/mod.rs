//! Per-instrument stream subscriptions.

mod coordinator;

pub use coordinator::{StreamAttempt, SubscriptionCoordinator};
