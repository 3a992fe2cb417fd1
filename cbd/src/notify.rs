//! Best-effort SMS notifications
//!
//! Plain-text messages sent through the provider's message capability:
//! the after-hours reply, the missed-callback alert to the business, the
//! give-up text to the visitor, and verification codes. Send failures
//! are logged and swallowed; a notification must never fail the
//! lifecycle step that triggered it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::CallbackRequest;
use crate::events::{CbEvent, EventBus};
use crate::provider::Provider;

/// Sends lifecycle notifications over SMS
pub struct Notifier {
    provider: Arc<dyn Provider>,
    bus: Arc<EventBus>,
    service_number: String,
    business_phone: String,
}

impl Notifier {
    pub fn new(provider: Arc<dyn Provider>, bus: Arc<EventBus>, config: &Config) -> Self {
        Self {
            provider,
            bus,
            service_number: config.provider.service_number.clone(),
            business_phone: config.notify.business_phone.clone(),
        }
    }

    /// Tell the business a request arrived outside business hours
    ///
    /// Returns the provider message reference when the text went out, so
    /// the caller can record it on the request.
    pub async fn after_hours(&self, request: &CallbackRequest) -> Option<String> {
        let body = format!(
            "Callback request from {} at {}. Received outside business hours. \
             Please call back during business hours.",
            display_name(request),
            request.phone
        );
        self.send_to_business(request, body, "after-hours").await
    }

    /// Tell the business a callback attempt did not connect
    pub async fn missed_call(&self, request: &CallbackRequest) {
        let body = format!(
            "Missed callback from {} at {}. Please call back.",
            display_name(request),
            request.phone
        );
        self.send_to_business(request, body, "missed-call").await;
    }

    /// Dead-letter pair: alert the business and tell the visitor we gave up
    pub async fn dead_letter(&self, request: &CallbackRequest) {
        self.missed_call(request).await;

        let body = "We were unable to reach you for your callback request. \
                    Please submit a new request or contact us directly."
            .to_string();
        self.send(&request.id, &request.phone, body, "dead-letter").await;
    }

    /// Text a verification code to the visitor
    pub async fn verification_code(&self, request: &CallbackRequest, code: &str, expiry_mins: u32) {
        let body = format!(
            "Your verification code is {code}. It expires in {expiry_mins} minutes."
        );
        self.send(&request.id, &request.phone, body, "verification-code").await;
    }

    async fn send_to_business(&self, request: &CallbackRequest, body: String, purpose: &str) -> Option<String> {
        if self.business_phone.is_empty() {
            warn!(request_id = %request.id, purpose, "Business phone not configured; skipping notification");
            return None;
        }
        let recipient = self.business_phone.clone();
        self.send(&request.id, &recipient, body, purpose).await
    }

    async fn send(&self, request_id: &str, recipient: &str, body: String, purpose: &str) -> Option<String> {
        match self
            .provider
            .send_message(recipient, &self.service_number, &body)
            .await
        {
            Ok(receipt) => {
                debug!(request_id, purpose, reference = %receipt.reference, "Notification sent");
                self.bus.emit(CbEvent::NotificationSent {
                    request_id: request_id.to_string(),
                    recipient: recipient.to_string(),
                    purpose: purpose.to_string(),
                });
                Some(receipt.reference)
            }
            Err(error) => {
                warn!(request_id, purpose, %error, "Notification failed");
                None
            }
        }
    }
}

fn display_name(request: &CallbackRequest) -> &str {
    request.name.as_deref().unwrap_or("visitor")
}
