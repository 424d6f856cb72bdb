//! Backend-agnostic storage errors and round-trip bounds.

use std::{error::Error, future::Future, time::Duration};
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend failed or could not be reached.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Backend description of the failure.
        message: String,
        /// Backend error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A round trip exceeded the configured bound.
    #[error("storage round trip `{operation}` timed out after {limit:?}")]
    Timeout {
        /// Store operation that stalled.
        operation: &'static str,
        /// Bound that was exceeded.
        limit: Duration,
    },
    /// Concurrent writers kept winning; the caller should re-read.
    #[error("storage conflict: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Transient failures may be retried by idempotent callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::Timeout { .. }
        )
    }
}

/// Bound a single store round trip, mapping expiry to [`StorageError::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, work: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout { operation, limit }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_round_trip_becomes_retryable_timeout() {
        let err = bounded("read", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Timeout { operation: "read", .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn conflicts_are_not_retryable() {
        assert!(!StorageError::Conflict("rev".into()).is_retryable());
    }
}
