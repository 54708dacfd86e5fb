//! In-memory store for tests.
//!
//! Mirrors the Postgres implementation's semantics, including the uniqueness
//! guarantees (order ids, external event ids, notification slots) and the
//! foreign-key requirement that rows reference an existing order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use trailmark_core::{OrderEventId, PaymentId, SentEmailId};
use trailmark_fulfillment::{EmailKind, SentEmail};
use trailmark_orders::{
    NewOrderEvent, Order, OrderDetails, OrderEvent, OrderId, Promotion,
};
use trailmark_payments::{LedgerTotals, NewPayment, Payment, PaymentType};

use super::traits::{
    EventAppend, FailedOrderSnapshot, FailedOrderStore, OrderStore, PaymentLedger, PromotionStore,
    SentEmailStore, StoreError,
};

#[derive(Default)]
struct State {
    orders: HashMap<String, OrderDetails>,
    payments: Vec<Payment>,
    events: Vec<OrderEvent>,
    emails: Vec<SentEmail>,
    promotions: HashMap<String, Promotion>,
    failed_orders: Vec<FailedOrderSnapshot>,
}

/// Test double with the same observable behavior as `PostgresStore`.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_next_insert: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `insert_order` fail with a backend error (exercises the
    /// fail-safe path).
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    pub fn put_promotion(&self, promotion: Promotion) {
        let mut state = self.state.lock().unwrap();
        state.promotions.insert(promotion.code.clone(), promotion);
    }

    pub fn failed_orders(&self) -> Vec<FailedOrderSnapshot> {
        self.state.lock().unwrap().failed_orders.clone()
    }

    fn totals_locked(state: &State, order_id: &OrderId) -> LedgerTotals {
        let mut totals = LedgerTotals::default();
        for p in state.payments.iter().filter(|p| &p.order_id == order_id) {
            match p.payment_type {
                PaymentType::Charge => totals.charges += p.amount,
                PaymentType::Refund => totals.refunds += p.amount,
            }
        }
        totals
    }

    fn charge_sum_locked(state: &State, order_id: &OrderId) -> i64 {
        state
            .payments
            .iter()
            .filter(|p| &p.order_id == order_id && p.payment_type == PaymentType::Charge)
            .map(|p| p.amount)
            .sum()
    }

    fn has_payments_locked(state: &State, order_id: &OrderId) -> bool {
        state.payments.iter().any(|p| &p.order_id == order_id)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn order_id_exists(&self, id: &OrderId) -> Result<bool, StoreError> {
        Ok(self.state.lock().unwrap().orders.contains_key(id.as_str()))
    }

    async fn insert_order(&self, details: &OrderDetails) -> Result<(), StoreError> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::backend("insert_order", "injected failure"));
        }
        let mut state = self.state.lock().unwrap();
        let key = details.order.id.as_str().to_string();
        if state.orders.contains_key(&key) {
            return Err(StoreError::DuplicateOrderId);
        }
        state.orders.insert(key, details.clone());
        Ok(())
    }

    async fn find_order(&self, id: &OrderId) -> Result<Option<OrderDetails>, StoreError> {
        Ok(self.state.lock().unwrap().orders.get(id.as_str()).cloned())
    }

    async fn find_by_partner_ref(&self, partner_ref: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .map(|d| &d.order)
            .find(|o| o.partner_ref.as_deref() == Some(partner_ref))
            .cloned())
    }

    async fn mark_dispatched(
        &self,
        id: &OrderId,
        partner_ref: &str,
        audit: NewOrderEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(details) = state.orders.get_mut(id.as_str()) else {
            return Err(StoreError::OrderNotFound);
        };
        if details.order.dispatched_at.is_some() {
            return Ok(false);
        }
        details.order.dispatched_at = Some(Utc::now());
        details.order.partner_ref = Some(partner_ref.to_string());
        state.events.push(OrderEvent {
            id: OrderEventId::new(),
            order_id: audit.order_id,
            source: audit.source,
            event_type: audit.event_type,
            external_event_id: audit.external_event_id,
            payload: audit.payload,
            recorded_at: Utc::now(),
        });
        Ok(true)
    }

    async fn dispatchable_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .map(|d| &d.order)
            .filter(|o| {
                o.dispatched_at.is_none()
                    && o.created_at < cutoff
                    && Self::charge_sum_locked(&state, &o.id) >= o.total
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn partially_paid_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Order, LedgerTotals)>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<(Order, LedgerTotals)> = state
            .orders
            .values()
            .map(|d| &d.order)
            .filter(|o| o.dispatched_at.is_none() && o.created_at < cutoff)
            .filter_map(|o| {
                let totals = Self::totals_locked(&state, &o.id);
                totals.is_partial(o.total).then(|| (o.clone(), totals))
            })
            .collect();
        out.sort_by_key(|(o, _)| o.created_at);
        Ok(out)
    }

    async fn delete_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<String> = state
            .orders
            .values()
            .filter(|d| {
                d.order.dispatched_at.is_none()
                    && d.order.created_at < cutoff
                    && !Self::has_payments_locked(&state, &d.order.id)
            })
            .map(|d| d.order.id.as_str().to_string())
            .collect();
        for key in &doomed {
            state.orders.remove(key);
            state.events.retain(|e| e.order_id.as_str() != key);
            state.emails.retain(|e| e.order_id.as_str() != key);
        }
        Ok(doomed.len() as u64)
    }

    async fn overdue_candidates(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .map(|d| &d.order)
            .filter(|o| {
                let Some(dispatched_at) = o.dispatched_at else {
                    return false;
                };
                if dispatched_at < from || dispatched_at > to {
                    return false;
                }
                let terminal = state.events.iter().any(|e| {
                    e.order_id == o.id
                        && matches!(
                            e.event_type.as_str(),
                            "USER_ORDER_DELIVERED" | "USER_ORDER_CANCELLED"
                        )
                });
                let reminded = state
                    .emails
                    .iter()
                    .any(|e| e.order_id == o.id && e.kind == EmailKind::DeliveryReminder);
                !terminal && !reminded
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.dispatched_at);
        Ok(orders)
    }
}

#[async_trait]
impl PaymentLedger for InMemoryStore {
    async fn append_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        self.append_payments(vec![payment])
            .await
            .map(|mut rows| rows.remove(0))
    }

    async fn append_payments(
        &self,
        payments: Vec<NewPayment>,
    ) -> Result<Vec<Payment>, StoreError> {
        let mut state = self.state.lock().unwrap();
        // Atomicity: validate everything before appending anything.
        for payment in &payments {
            if !state.orders.contains_key(payment.order_id.as_str()) {
                return Err(StoreError::OrderNotFound);
            }
        }
        let mut out = Vec::with_capacity(payments.len());
        for payment in payments {
            let row = Payment {
                id: PaymentId::new(),
                order_id: payment.order_id,
                payment_type: payment.payment_type,
                amount: payment.amount,
                currency: payment.currency,
                provider: payment.provider,
                provider_method: payment.provider_method,
                external_ref: payment.external_ref,
                promotion_code: payment.promotion_code,
                created_at: Utc::now(),
            };
            state.payments.push(row.clone());
            out.push(row);
        }
        Ok(out)
    }

    async fn append_event(&self, event: NewOrderEvent) -> Result<EventAppend, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.orders.contains_key(event.order_id.as_str()) {
            return Err(StoreError::OrderNotFound);
        }
        if let Some(external_id) = &event.external_event_id {
            let seen = state
                .events
                .iter()
                .any(|e| e.external_event_id.as_deref() == Some(external_id));
            if seen {
                return Ok(EventAppend::AlreadyRecorded);
            }
        }
        let row = OrderEvent {
            id: OrderEventId::new(),
            order_id: event.order_id,
            source: event.source,
            event_type: event.event_type,
            external_event_id: event.external_event_id,
            payload: event.payload,
            recorded_at: Utc::now(),
        };
        state.events.push(row.clone());
        Ok(EventAppend::Recorded(row))
    }

    async fn ledger_totals(&self, order_id: &OrderId) -> Result<LedgerTotals, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(Self::totals_locked(&state, order_id))
    }

    async fn payments_for(&self, order_id: &OrderId) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .filter(|p| &p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn events_for(&self, order_id: &OrderId) -> Result<Vec<OrderEvent>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| &e.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PromotionStore for InMemoryStore {
    async fn find_promotion(&self, code: &str) -> Result<Option<Promotion>, StoreError> {
        Ok(self.state.lock().unwrap().promotions.get(code).cloned())
    }
}

#[async_trait]
impl SentEmailStore for InMemoryStore {
    async fn reserve_email(
        &self,
        order_id: &OrderId,
        kind: EmailKind,
        seq: u32,
    ) -> Result<SentEmail, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.orders.contains_key(order_id.as_str()) {
            return Err(StoreError::OrderNotFound);
        }
        let taken = state
            .emails
            .iter()
            .any(|e| &e.order_id == order_id && e.kind == kind && e.seq == seq);
        if taken {
            return Err(StoreError::DuplicateEmail);
        }
        let row = SentEmail {
            id: SentEmailId::new(),
            order_id: order_id.clone(),
            kind,
            seq,
            message_id: None,
            sent_at: Utc::now(),
        };
        state.emails.push(row.clone());
        Ok(row)
    }

    async fn attach_message_id(
        &self,
        id: SentEmailId,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(email) = state.emails.iter_mut().find(|e| e.id == id) {
            email.message_id = Some(message_id.to_string());
        }
        Ok(())
    }

    async fn email_history(&self, order_id: &OrderId) -> Result<Vec<SentEmail>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .emails
            .iter()
            .filter(|e| &e.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FailedOrderStore for InMemoryStore {
    async fn record_failed_order(
        &self,
        snapshot: &FailedOrderSnapshot,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .failed_orders
            .push(snapshot.clone());
        Ok(())
    }
}
