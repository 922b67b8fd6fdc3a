//! Error classification for retry decisions.
//!
//! Errors self-describe whether a retry can help and how long to wait, so
//! retry loops stay generic instead of matching on concrete enums.

use std::time::Duration;

use super::common::*;

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// May resolve on retry (network issues, timeouts)
    Transient,
    /// Will not resolve on retry (invalid input, missing data)
    Permanent,
    /// Resource exhaustion (rate limits)
    ResourceExhausted,
    /// Configuration problems (bad endpoint, bad credentials)
    Configuration,
}

/// Trait for errors that can classify themselves for retry logic.
pub trait ErrorClassification {
    /// Returns the category of this error
    fn category(&self) -> ErrorCategory;

    /// Returns true if this error may succeed on retry
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    /// Returns true if this error will not succeed on retry
    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    /// Suggests a delay before retrying, if applicable
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(500)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

impl ErrorClassification for TransportError {
    fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Connection(_) => ErrorCategory::Transient,
            TransportError::Timeout(_) => ErrorCategory::Transient,
            TransportError::Closed(_) => ErrorCategory::Transient,
            TransportError::Send(_) => ErrorCategory::Transient,
            TransportError::Endpoint(_) => ErrorCategory::Configuration,
            TransportError::Authentication(_) => ErrorCategory::Configuration,
            TransportError::AlreadyConnected(_) => ErrorCategory::Permanent,
        }
    }
}

impl ErrorClassification for SubscriptionError {
    fn category(&self) -> ErrorCategory {
        match self {
            // Resolves once the connection manager reports Connected again
            SubscriptionError::NotConnected { .. } => ErrorCategory::Transient,
            SubscriptionError::Timeout { .. } => ErrorCategory::Transient,
            SubscriptionError::Rejected { .. } => ErrorCategory::Permanent,
            SubscriptionError::AllStreamsFailed { .. } => ErrorCategory::Permanent,
        }
    }
}

impl ErrorClassification for AggregationError {
    fn category(&self) -> ErrorCategory {
        // Bad data never improves on retry; the tick is already gone
        ErrorCategory::Permanent
    }
}

impl ErrorClassification for CacheError {
    fn category(&self) -> ErrorCategory {
        match self {
            CacheError::Write(_) | CacheError::Read(_) => ErrorCategory::Transient,
            CacheError::Database(_) => ErrorCategory::Transient,
            CacheError::InvalidRow(_) => ErrorCategory::Permanent,
        }
    }
}

impl ErrorClassification for FetchError {
    fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Request(_) => ErrorCategory::Transient,
            FetchError::RateLimit(_) => ErrorCategory::ResourceExhausted,
            FetchError::NotAvailable(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            FetchError::Request(_) => Some(Duration::from_millis(500)),
            FetchError::RateLimit(_) => Some(Duration::from_secs(30)),
            FetchError::NotAvailable(_) => None,
        }
    }
}

/// Retry an async operation while its error stays transient.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    E: ErrorClassification + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    let mut delay = initial_delay;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if !err.is_transient() || attempts >= max_attempts {
                    return Err(err);
                }

                let retry_delay = err.suggested_retry_delay().unwrap_or(delay);
                tokio::time::sleep(retry_delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::StreamKind;

    #[test]
    fn test_transport_classification() {
        assert!(TransportError::Connection("refused".into()).is_transient());
        assert_eq!(
            TransportError::Authentication("bad token".into()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_subscription_classification() {
        let err = SubscriptionError::NotConnected {
            state: crate::data::types::ConnectionState::Disconnected,
        };
        assert!(err.is_transient());

        let err = SubscriptionError::Rejected {
            instrument: "ESZ5".into(),
            kind: StreamKind::Quote,
            reason: "unknown instrument".into(),
        };
        assert!(err.is_permanent());
    }

    #[test]
    fn test_fetch_classification() {
        assert!(FetchError::Request("503".into()).is_transient());
        assert!(FetchError::NotAvailable("too old".into()).is_permanent());
        assert_eq!(
            FetchError::RateLimit("slow down".into()).suggested_retry_delay(),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_retry_with_backoff_recovers() {
        let mut calls = 0;
        let result: Result<u32, FetchError> = retry_with_backoff(
            || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(FetchError::Request("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up_on_permanent() {
        let mut calls = 0;
        let result: Result<u32, FetchError> = retry_with_backoff(
            || {
                calls += 1;
                async { Err(FetchError::NotAvailable("gone".into())) }
            },
            5,
            Duration::from_millis(1),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
