//! Append-only order event log.
//!
//! Every accepted external webhook (and internal dispatch audit record) is
//! persisted here before any side effect runs. Delivery/fulfillment state is
//! derived entirely from this log; there is no denormalized status column.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use trailmark_core::{DomainError, OrderEventId};

use crate::id::OrderId;

/// Where an event came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    PaymentProcessor,
    FulfillmentPartner,
    /// Internal audit records (e.g. the raw dispatch request/response).
    Internal,
    /// Synthesized from a live partner status poll after a missed webhook.
    PartnerPoll,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::PaymentProcessor => "payment-processor",
            EventSource::FulfillmentPartner => "fulfillment-partner",
            EventSource::Internal => "internal",
            EventSource::PartnerPoll => "partner-poll",
        }
    }
}

impl FromStr for EventSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment-processor" => Ok(EventSource::PaymentProcessor),
            "fulfillment-partner" => Ok(EventSource::FulfillmentPartner),
            "internal" => Ok(EventSource::Internal),
            "partner-poll" => Ok(EventSource::PartnerPoll),
            other => Err(DomainError::unknown_enum("event source", other)),
        }
    }
}

/// One immutable entry in an order's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: OrderEventId,
    pub order_id: OrderId,
    pub source: EventSource,
    /// Raw event type string as received (`payment_intent.succeeded`,
    /// `USER_ORDER_DELIVERED`, ...).
    pub event_type: String,
    /// Sender-assigned id, when the source provides one. Backed by a unique
    /// index so replayed deliveries are recognized instead of reprocessed.
    pub external_event_id: Option<String>,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Event data as recorded (ids/timestamps assigned by the store).
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderEvent {
    pub order_id: OrderId,
    pub source: EventSource,
    pub event_type: String,
    pub external_event_id: Option<String>,
    pub payload: serde_json::Value,
}
