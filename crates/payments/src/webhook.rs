//! Payment-processor webhook event model.
//!
//! The processor delivers a signed envelope `{type, livemode, data.object}`.
//! Events in scope here follow the payment-intent lifecycle
//! `created → succeeded | failed | canceled`, with `charge.refunded` as a
//! side event attachable to a succeeded intent. Everything else is parsed
//! into `Other` and no-opped, so new processor event types never break
//! ingestion.

use serde::Deserialize;
use thiserror::Error;

use trailmark_core::DomainError;
use trailmark_orders::OrderId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentEventError {
    #[error("event payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("{event_type} event is missing metadata.prettyOrderId")]
    MissingOrderId { event_type: String },

    #[error(transparent)]
    BadOrderId(#[from] DomainError),

    #[error("refund list reports {total} refunds but only {fetched} were returned")]
    RefundsTruncated { total: u64, fetched: usize },

    #[error("charge has no succeeded refund to record")]
    NoSucceededRefund,
}

/// The signed event envelope as delivered.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub livemode: bool,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn parse(raw: &[u8]) -> Result<Self, PaymentEventError> {
        serde_json::from_slice(raw).map_err(|e| PaymentEventError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> PaymentEventKind {
        PaymentEventKind::from_type(&self.event_type)
    }

    /// Test-mode traffic must never mutate production ledgers.
    pub fn should_process(&self, allow_test_events: bool) -> bool {
        self.livemode || allow_test_events
    }

    /// The order id every in-scope event must carry in its object metadata.
    /// Missing it is a hard failure, not a skip.
    pub fn order_id(&self) -> Result<OrderId, PaymentEventError> {
        let pretty = self.data.object["metadata"]["prettyOrderId"]
            .as_str()
            .ok_or_else(|| PaymentEventError::MissingOrderId {
                event_type: self.event_type.clone(),
            })?;
        Ok(pretty.parse::<OrderId>()?)
    }
}

/// Processor event taxonomy; `Other` keeps unknown types a logged no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    IntentCreated,
    IntentSucceeded,
    IntentFailed,
    IntentCanceled,
    ChargeRefunded,
    Other(String),
}

impl PaymentEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.created" => PaymentEventKind::IntentCreated,
            "payment_intent.succeeded" => PaymentEventKind::IntentSucceeded,
            "payment_intent.payment_failed" => PaymentEventKind::IntentFailed,
            "payment_intent.canceled" => PaymentEventKind::IntentCanceled,
            "charge.refunded" => PaymentEventKind::ChargeRefunded,
            other => PaymentEventKind::Other(other.to_string()),
        }
    }

    /// In-scope events get the idempotency checkpoint (durable OrderEvent
    /// append) before any reaction runs.
    pub fn in_scope(&self) -> bool {
        !matches!(self, PaymentEventKind::Other(_))
    }
}

/// `data.object` of a `payment_intent.*` event.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount_received: i64,
    pub currency: String,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
}

impl PaymentIntentObject {
    pub fn from_object(object: &serde_json::Value) -> Result<Self, PaymentEventError> {
        serde_json::from_value(object.clone())
            .map_err(|e| PaymentEventError::Malformed(e.to_string()))
    }
}

/// `data.object` of a `charge.refunded` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub refunds: RefundList,
}

impl ChargeObject {
    pub fn from_object(object: &serde_json::Value) -> Result<Self, PaymentEventError> {
        serde_json::from_value(object.clone())
            .map_err(|e| PaymentEventError::Malformed(e.to_string()))
    }
}

/// One page of refunds as embedded in the charge object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundObject>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    /// Unix seconds.
    pub created: i64,
}

impl RefundList {
    /// The most recent succeeded refund.
    ///
    /// Pagination is deliberately unsupported: if the processor reports more
    /// refund records than this page returned, fail loudly rather than
    /// silently undercounting.
    pub fn latest_succeeded(&self) -> Result<&RefundObject, PaymentEventError> {
        if self.has_more || self.total_count as usize > self.data.len() {
            return Err(PaymentEventError::RefundsTruncated {
                total: self.total_count.max(self.data.len() as u64 + 1),
                fetched: self.data.len(),
            });
        }
        self.data
            .iter()
            .filter(|r| r.status == "succeeded")
            .max_by_key(|r| r.created)
            .ok_or(PaymentEventError::NoSucceededRefund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, livemode: bool, object: serde_json::Value) -> WebhookEnvelope {
        let raw = json!({
            "id": "evt_123",
            "type": event_type,
            "livemode": livemode,
            "data": { "object": object }
        });
        WebhookEnvelope::parse(raw.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn kind_parses_lifecycle_types() {
        assert_eq!(
            PaymentEventKind::from_type("payment_intent.succeeded"),
            PaymentEventKind::IntentSucceeded
        );
        assert_eq!(
            PaymentEventKind::from_type("charge.refunded"),
            PaymentEventKind::ChargeRefunded
        );
        let other = PaymentEventKind::from_type("customer.created");
        assert_eq!(other, PaymentEventKind::Other("customer.created".into()));
        assert!(!other.in_scope());
    }

    #[test]
    fn test_mode_events_are_gated_by_config() {
        let env = envelope("payment_intent.succeeded", false, json!({}));
        assert!(!env.should_process(false));
        assert!(env.should_process(true));

        let live = envelope("payment_intent.succeeded", true, json!({}));
        assert!(live.should_process(false));
    }

    #[test]
    fn missing_order_id_is_a_hard_failure() {
        let env = envelope("payment_intent.succeeded", true, json!({ "id": "pi_1" }));
        assert_eq!(
            env.order_id(),
            Err(PaymentEventError::MissingOrderId {
                event_type: "payment_intent.succeeded".to_string()
            })
        );
    }

    #[test]
    fn order_id_is_read_from_metadata() {
        let env = envelope(
            "payment_intent.succeeded",
            true,
            json!({ "id": "pi_1", "metadata": { "prettyOrderId": "1234-5678-9012-3456" } }),
        );
        assert_eq!(env.order_id().unwrap().as_str(), "1234-5678-9012-3456");
    }

    #[test]
    fn truncated_refund_list_is_refused() {
        let list: RefundList = serde_json::from_value(json!({
            "data": [{ "id": "re_1", "amount": 500, "currency": "eur", "status": "succeeded", "created": 10 }],
            "has_more": true,
            "total_count": 3
        }))
        .unwrap();
        assert!(matches!(
            list.latest_succeeded(),
            Err(PaymentEventError::RefundsTruncated { .. })
        ));
    }

    #[test]
    fn latest_succeeded_refund_wins() {
        let list: RefundList = serde_json::from_value(json!({
            "data": [
                { "id": "re_old", "amount": 300, "currency": "eur", "status": "succeeded", "created": 10 },
                { "id": "re_failed", "amount": 900, "currency": "eur", "status": "failed", "created": 30 },
                { "id": "re_new", "amount": 500, "currency": "eur", "status": "succeeded", "created": 20 }
            ],
            "has_more": false,
            "total_count": 3
        }))
        .unwrap();
        assert_eq!(list.latest_succeeded().unwrap().id, "re_new");
    }

    #[test]
    fn empty_refund_list_is_an_error() {
        let list = RefundList::default();
        assert_eq!(
            list.latest_succeeded().unwrap_err(),
            PaymentEventError::NoSucceededRefund
        );
    }
}
