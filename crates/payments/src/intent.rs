//! Outbound payment-intent contract.
//!
//! Checkout creates an intent with the processor and hands the client secret
//! back to the storefront. The processor API itself is an external
//! collaborator; this is only the contract the core expects from it.

use async_trait::async_trait;
use thiserror::Error;

use trailmark_core::Currency;
use trailmark_orders::OrderId;

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("payment processor request failed: {0}")]
    Request(String),

    #[error("payment processor returned an unusable response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIntentRequest {
    pub order_id: OrderId,
    /// Cents.
    pub amount: i64,
    pub currency: Currency,
    pub receipt_email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedIntent {
    pub id: String,
    pub client_secret: String,
}

/// Client for creating payment intents, injected at process start.
#[async_trait]
pub trait PaymentIntents: Send + Sync {
    /// The intent must carry the order id in its metadata so webhook events
    /// can be routed back to the order.
    async fn create_intent(&self, req: CreateIntentRequest) -> Result<CreatedIntent, IntentError>;
}
