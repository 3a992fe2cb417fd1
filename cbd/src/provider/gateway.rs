//! Provider trait definition

use async_trait::async_trait;
#[allow(unused_imports)]
use tracing::debug;

use super::ProviderError;

/// What the provider handed back for an accepted dispatch
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    /// Provider-side reference (call SID, message SID, action id)
    pub reference: String,
    /// The provider's initial status word, e.g. "queued"
    pub status: String,
}

/// Telephony backend - places calls and sends texts
///
/// This is the seam between the lifecycle engine and the outside world.
/// Each dispatch is independent; the outcome of a placed call arrives
/// later through the status-callback path, not through the return value.
/// Implementations return structured errors and never panic across the
/// boundary.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Place an outbound call to `destination`
    ///
    /// `request_id` rides along so the provider's status callback can be
    /// correlated back to the request.
    async fn place_call(
        &self,
        destination: &str,
        caller_id: &str,
        request_id: &str,
    ) -> Result<DispatchReceipt, ProviderError>;

    /// Send a text message to `destination`
    async fn send_message(&self, destination: &str, sender: &str, body: &str)
    -> Result<DispatchReceipt, ProviderError>;

    /// Cheap readiness probe for startup checks and `status`
    async fn is_ready(&self) -> bool;

    /// Short provider name for logs and receipts
    fn name(&self) -> &'static str;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::debug;

    /// Mock provider for unit tests
    ///
    /// The first `failing_calls` invocations of `place_call` return a
    /// retryable API error; everything after succeeds. Messages always
    /// succeed and are recorded for assertions.
    pub struct MockProvider {
        call_count: AtomicUsize,
        message_count: AtomicUsize,
        failing_calls: usize,
        messages: Mutex<Vec<(String, String)>>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::failing(0)
        }

        pub fn failing(failing_calls: usize) -> Self {
            debug!(failing_calls, "MockProvider::failing: called");
            Self {
                call_count: AtomicUsize::new(0),
                message_count: AtomicUsize::new(0),
                failing_calls,
                messages: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn message_count(&self) -> usize {
            self.message_count.load(Ordering::SeqCst)
        }

        /// (destination, body) pairs in send order
        pub fn sent_messages(&self) -> Vec<(String, String)> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn place_call(
            &self,
            destination: &str,
            _caller_id: &str,
            _request_id: &str,
        ) -> Result<DispatchReceipt, ProviderError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            debug!(%destination, idx, "MockProvider::place_call: called");
            if idx < self.failing_calls {
                return Err(ProviderError::ApiError {
                    status: 503,
                    message: "mock call failure".to_string(),
                });
            }
            Ok(DispatchReceipt {
                reference: format!("CA-mock-{}", idx),
                status: "queued".to_string(),
            })
        }

        async fn send_message(
            &self,
            destination: &str,
            _sender: &str,
            body: &str,
        ) -> Result<DispatchReceipt, ProviderError> {
            let idx = self.message_count.fetch_add(1, Ordering::SeqCst);
            debug!(%destination, idx, "MockProvider::send_message: called");
            self.messages
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            Ok(DispatchReceipt {
                reference: format!("SM-mock-{}", idx),
                status: "queued".to_string(),
            })
        }

        async fn is_ready(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_fails_then_succeeds() {
            let provider = MockProvider::failing(2);

            assert!(provider.place_call("+15550001111", "+15550002222", "req-1").await.is_err());
            assert!(provider.place_call("+15550001111", "+15550002222", "req-1").await.is_err());

            let receipt = provider
                .place_call("+15550001111", "+15550002222", "req-1")
                .await
                .unwrap();
            assert_eq!(receipt.reference, "CA-mock-2");
            assert_eq!(provider.call_count(), 3);
        }

        #[tokio::test]
        async fn test_mock_records_messages() {
            let provider = MockProvider::new();

            provider
                .send_message("+15550001111", "+15550002222", "hello")
                .await
                .unwrap();

            let sent = provider.sent_messages();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "+15550001111");
            assert_eq!(sent[0].1, "hello");
        }
    }
}
