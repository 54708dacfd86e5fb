//! Order and address records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trailmark_core::Currency;

use crate::cart::CartItem;
use crate::id::OrderId;

/// Postal address role. At most one row per role per order (enforced by a
/// uniqueness constraint on `(order_id, kind)`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Shipping,
    Billing,
}

impl AddressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Shipping => "shipping",
            AddressKind::Billing => "billing",
        }
    }
}

/// Immutable postal address attached to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub recipient: String,
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2.
    pub country: String,
}

/// The order row.
///
/// Created once at checkout. `dispatched_at`/`partner_ref` are set exactly
/// once by the dispatch scheduler; everything else is immutable. Payment and
/// delivery state live in the append-only ledger and event log, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub email: String,
    pub currency: Currency,
    /// Authoritative total in cents, recomputed server-side at creation.
    pub total: i64,
    pub promotion_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// External id assigned by the fulfillment partner at dispatch.
    pub partner_ref: Option<String>,
}

impl Order {
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

/// An order together with its owned collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: Order,
    /// In original input order.
    pub cart: Vec<CartItem>,
    pub addresses: Vec<Address>,
}
