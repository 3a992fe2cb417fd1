//! Provider error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during provider dispatch
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// Check if this error is worth another dispatch attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::ApiError { status, .. } => matches!(status, 408 | 429) || *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::Io(_) => true,
            ProviderError::Timeout(_) => true,
            ProviderError::Protocol(_) => false,
            ProviderError::Unsupported(_) => false,
            ProviderError::NotConfigured(_) => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rate_limit() {
        let err = ProviderError::RateLimited {
            retry_after: Duration::from_secs(30),
        };
        assert!(err.is_rate_limit());

        let err = ProviderError::ApiError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            ProviderError::RateLimited {
                retry_after: Duration::from_secs(30)
            }
            .is_retryable()
        );

        // 408/429/5xx are transient
        assert!(
            ProviderError::ApiError {
                status: 408,
                message: "Request timeout".to_string()
            }
            .is_retryable()
        );
        assert!(
            ProviderError::ApiError {
                status: 503,
                message: "Service unavailable".to_string()
            }
            .is_retryable()
        );

        // Permanent rejections are not
        assert!(
            !ProviderError::ApiError {
                status: 400,
                message: "Invalid number".to_string()
            }
            .is_retryable()
        );
        assert!(!ProviderError::Unsupported("messages".to_string()).is_retryable());
        assert!(!ProviderError::NotConfigured("no credentials".to_string()).is_retryable());
        assert!(!ProviderError::Protocol("bad response".to_string()).is_retryable());

        assert!(ProviderError::Timeout(Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = ProviderError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));

        let err = ProviderError::Timeout(Duration::from_secs(5));
        assert_eq!(err.retry_after(), None);
    }
}
