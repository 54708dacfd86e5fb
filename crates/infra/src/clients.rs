//! External service clients.
//!
//! Constructed once at process start and injected into the services that
//! need them; there is no ambient global client state.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use trailmark_fulfillment::{
    FulfillmentPartner, Mailer, MailerError, OutboundEmail, PartnerError, PartnerOrderStatus,
    PlaceOrderRequest, PlaceOrderResponse,
};
use trailmark_payments::{CreateIntentRequest, CreatedIntent, IntentError, PaymentIntents};

/// Payment-processor client (intent creation only; everything else arrives
/// via webhooks).
pub struct ProcessorClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl ProcessorClient {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    client_secret: String,
}

#[async_trait]
impl PaymentIntents for ProcessorClient {
    async fn create_intent(&self, req: CreateIntentRequest) -> Result<CreatedIntent, IntentError> {
        let params = [
            ("amount", req.amount.to_string()),
            ("currency", req.currency.wire_code().to_string()),
            ("receipt_email", req.receipt_email.clone()),
            // Webhook events route back to the order through this.
            (
                "metadata[prettyOrderId]",
                req.order_id.as_str().to_string(),
            ),
        ];

        let response = self
            .http
            .post(format!("{}/v1/payment_intents", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| IntentError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntentError::Request(format!(
                "intent creation returned {status}: {body}"
            )));
        }

        let intent: IntentResponse = response
            .json()
            .await
            .map_err(|e| IntentError::BadResponse(e.to_string()))?;
        debug!(order_id = %req.order_id, intent_id = %intent.id, "payment intent created");
        Ok(CreatedIntent {
            id: intent.id,
            client_secret: intent.client_secret,
        })
    }
}

/// HTTP client for the manufacturing/fulfillment partner.
pub struct PartnerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PartnerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerOrderResponse {
    order_number: String,
}

#[derive(Debug, Deserialize)]
struct PartnerStatusResponse {
    status: String,
}

#[async_trait]
impl FulfillmentPartner for PartnerClient {
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, PartnerError> {
        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| PartnerError::Request(e.to_string()))?;

        let status = response.status();
        let raw: serde_json::Value = if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| PartnerError::BadResponse(e.to_string()))?
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(PartnerError::Rejected {
                status: status.as_u16(),
                body,
            });
        };

        let parsed: PartnerOrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| PartnerError::BadResponse(e.to_string()))?;
        Ok(PlaceOrderResponse {
            external_id: parsed.order_number,
            raw,
        })
    }

    async fn order_status(&self, external_id: &str) -> Result<PartnerOrderStatus, PartnerError> {
        let response = self
            .http
            .get(format!("{}/orders/{external_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| PartnerError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PartnerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PartnerStatusResponse = response
            .json()
            .await
            .map_err(|e| PartnerError::BadResponse(e.to_string()))?;
        Ok(PartnerOrderStatus::from_wire(&parsed.status))
    }
}

/// Development stand-in for the mail collaborator: logs the send and returns
/// a synthetic message id. Template rendering and real delivery live outside
/// this repository.
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send(&self, to: &str, email: &OutboundEmail) -> Result<String, MailerError> {
        let message_id = format!("local-{}", uuid::Uuid::now_v7());
        info!(
            to,
            kind = email.kind.as_str(),
            order_id = %email.order_id,
            message_id = %message_id,
            "outbound notification"
        );
        Ok(message_id)
    }
}
