//! Outbound fulfillment-partner contract.
//!
//! The partner's API is an external collaborator; this module specifies only
//! what the core expects from it: place an order, report its status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trailmark_orders::{Address, CartItem, Order};

#[derive(Debug, Error)]
pub enum PartnerError {
    #[error("partner request failed: {0}")]
    Request(String),

    #[error("partner rejected the request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("partner returned an unusable response: {0}")]
    BadResponse(String),
}

/// What we hand the partner at dispatch. Serializable so the raw request can
/// be persisted for audit alongside the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub order: Order,
    pub cart: Vec<CartItem>,
    pub shipping: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    /// The partner's id for this order; stored on the order row.
    pub external_id: String,
    /// Raw response body, persisted for audit.
    pub raw: serde_json::Value,
}

/// Live order status as the partner reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartnerOrderStatus {
    Received,
    InProduction,
    Shipped,
    Delivered,
    Cancelled,
    Unknown(String),
}

impl PartnerOrderStatus {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "RECEIVED" => PartnerOrderStatus::Received,
            "IN_PRODUCTION" => PartnerOrderStatus::InProduction,
            "SHIPPED" => PartnerOrderStatus::Shipped,
            "DELIVERED" => PartnerOrderStatus::Delivered,
            "CANCELLED" => PartnerOrderStatus::Cancelled,
            other => PartnerOrderStatus::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PartnerOrderStatus::Delivered | PartnerOrderStatus::Cancelled
        )
    }
}

/// Client for the manufacturing/fulfillment partner, injected at process
/// start.
#[async_trait]
pub trait FulfillmentPartner: Send + Sync {
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, PartnerError>;

    /// Live status check, used by the staleness scan before flagging an
    /// order as late — silence from webhooks is not trusted.
    async fn order_status(&self, external_id: &str) -> Result<PartnerOrderStatus, PartnerError>;
}
