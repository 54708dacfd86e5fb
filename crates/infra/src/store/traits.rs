//! Store contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trailmark_core::SentEmailId;
use trailmark_fulfillment::{EmailKind, SentEmail};
use trailmark_orders::{NewOrderEvent, Order, OrderDetails, OrderEvent, OrderId, Promotion};
use trailmark_payments::{LedgerTotals, NewPayment, Payment};

/// Storage-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The order id primary key caught a generation race (accepted risk of
    /// the non-atomic probe). Logged critical, never retried here.
    #[error("order id already exists")]
    DuplicateOrderId,

    /// The referenced order does not exist.
    #[error("order not found")]
    OrderNotFound,

    /// An external event id was appended twice; the event was already
    /// durably recorded and must not be reprocessed.
    #[error("external event already recorded")]
    DuplicateEvent,

    /// A `(order, kind, seq)` notification slot is already reserved; a
    /// concurrent delivery of the same trigger won the insert.
    #[error("notification slot already reserved")]
    DuplicateEmail,

    /// Anything else the backend reports.
    #[error("storage failure during {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

/// Outcome of appending an externally-identified event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventAppend {
    Recorded(OrderEvent),
    /// The sender replayed an event id we already hold; the idempotency
    /// checkpoint makes this a recognized no-op.
    AlreadyRecorded,
}

/// Snapshot of an order that failed to persist, captured for manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOrderSnapshot {
    pub email: String,
    /// The attempted order, serialized in full.
    pub payload: serde_json::Value,
    pub error: String,
}

impl FailedOrderSnapshot {
    pub fn capture(details: &OrderDetails, error: &dyn std::error::Error) -> Self {
        Self {
            email: details.order.email.clone(),
            payload: serde_json::to_value(details).unwrap_or_else(
                |e| serde_json::json!({ "serialization_error": e.to_string() }),
            ),
            error: error.to_string(),
        }
    }
}

/// Orders and their owned collections.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order_id_exists(&self, id: &OrderId) -> Result<bool, StoreError>;

    /// Atomically persist the order row, its cart items (in input order) and
    /// addresses. A lost id-generation race surfaces as `DuplicateOrderId`.
    async fn insert_order(&self, details: &OrderDetails) -> Result<(), StoreError>;

    async fn find_order(&self, id: &OrderId) -> Result<Option<OrderDetails>, StoreError>;

    /// Resolve by the fulfillment partner's own order number. `None` is a
    /// recoverable condition: the order may exist only on the partner side.
    async fn find_by_partner_ref(&self, partner_ref: &str) -> Result<Option<Order>, StoreError>;

    /// Atomically set `dispatched_at`/`partner_ref` (guarded: only if not
    /// yet dispatched) and append the dispatch audit event. Returns `false`
    /// when the order was already dispatched.
    async fn mark_dispatched(
        &self,
        id: &OrderId,
        partner_ref: &str,
        audit: NewOrderEvent,
    ) -> Result<bool, StoreError>;

    /// Undispatched orders created before `cutoff` whose CHARGE ledger sum
    /// covers the authoritative total, oldest first.
    async fn dispatchable_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    /// Undispatched orders created before `cutoff` with some but
    /// insufficient payment (read-only audit pass).
    async fn partially_paid_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Order, LedgerTotals)>, StoreError>;

    /// Hard-delete orders created before `cutoff` with zero ledger rows.
    /// Owned collections go with them. Returns the number of deleted orders.
    async fn delete_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Orders dispatched within `[from, to]` that have neither a terminal
    /// delivered/cancelled event nor a delivery-reminder email yet.
    async fn overdue_candidates(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError>;
}

/// The append-only financial ledger and order event log.
///
/// Deliberately: no update, no delete.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn append_payment(&self, payment: NewPayment) -> Result<Payment, StoreError>;

    /// Append several rows in one transaction (payment-intent settlement).
    async fn append_payments(&self, payments: Vec<NewPayment>) -> Result<Vec<Payment>, StoreError>;

    /// Append to the order event log. When the event carries an external id
    /// already on file, returns `AlreadyRecorded` instead of a second row.
    async fn append_event(&self, event: NewOrderEvent) -> Result<EventAppend, StoreError>;

    async fn ledger_totals(&self, order_id: &OrderId) -> Result<LedgerTotals, StoreError>;

    async fn payments_for(&self, order_id: &OrderId) -> Result<Vec<Payment>, StoreError>;

    async fn events_for(&self, order_id: &OrderId) -> Result<Vec<OrderEvent>, StoreError>;
}

/// Promotion lookup (promotions are referenced, never mutated, here).
#[async_trait]
pub trait PromotionStore: Send + Sync {
    async fn find_promotion(&self, code: &str) -> Result<Option<Promotion>, StoreError>;
}

/// Sent-notification history.
#[async_trait]
pub trait SentEmailStore: Send + Sync {
    /// Reserve the `(order, kind, seq)` slot *before* sending. The unique
    /// constraint behind this insert is the serialization point for capped
    /// notifications; losing the race surfaces as `DuplicateEmail`.
    async fn reserve_email(
        &self,
        order_id: &OrderId,
        kind: EmailKind,
        seq: u32,
    ) -> Result<SentEmail, StoreError>;

    /// Attach the provider's message id once the send is acknowledged.
    async fn attach_message_id(
        &self,
        id: SentEmailId,
        message_id: &str,
    ) -> Result<(), StoreError>;

    async fn email_history(&self, order_id: &OrderId) -> Result<Vec<SentEmail>, StoreError>;
}

/// Last-resort capture of orders that failed mid-transaction.
#[async_trait]
pub trait FailedOrderStore: Send + Sync {
    async fn record_failed_order(&self, snapshot: &FailedOrderSnapshot) -> Result<(), StoreError>;
}

/// Everything the application services need from one backing database.
pub trait Store:
    OrderStore + PaymentLedger + PromotionStore + SentEmailStore + FailedOrderStore + 'static
{
}

impl<T> Store for T where
    T: OrderStore + PaymentLedger + PromotionStore + SentEmailStore + FailedOrderStore + 'static
{
}
