//! Payment-processor webhook reconciliation.
//!
//! Reconciles external payment-intent lifecycle events into the ledger.
//! Every in-scope event is durably appended to the order event log before
//! any side effect (the idempotency checkpoint); replayed event ids are
//! recognized there and skipped. Settlement asserts the processor-reported
//! amount against an independent price recomputation — a mismatch aborts
//! with a business-critical alert and leaves the ledger untouched.

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use chrono::Utc;
use trailmark_core::{Currency, DomainError};
use trailmark_fulfillment::{EmailKind, Mailer, OutboundEmail};
use trailmark_orders::{
    EventSource, NewOrderEvent, Order, OrderDetails, OrderId, PricingError, reconcile,
};
use trailmark_payments::{
    ChargeObject, NewPayment, PaymentEventError, PaymentEventKind, PaymentIntentObject,
    PaymentProvider, PaymentType, ProviderMethod, WebhookEnvelope,
};

use crate::checkout::promotion_charge;
use crate::store::{EventAppend, Store, StoreError};

#[derive(Debug, Error)]
pub enum PaymentWebhookError {
    #[error(transparent)]
    Event(#[from] PaymentEventError),

    #[error("order {order_id} not found for payment event")]
    OrderNotFound { order_id: OrderId },

    #[error("promotion {code} on order {order_id} is no longer resolvable")]
    MissingPromotion { code: String, order_id: OrderId },

    /// Consistency violation: the processor collected a different amount
    /// than the independently recomputed price.
    #[error("amount mismatch for order {order_id}: processor received {received}, recomputed {expected}")]
    AmountMismatch {
        order_id: OrderId,
        expected: i64,
        received: i64,
    },

    #[error("currency mismatch for order {order_id}: processor reported {received:?}, order is {expected}")]
    CurrencyMismatch {
        order_id: OrderId,
        received: String,
        expected: Currency,
    },

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// The event id was already on file; replay recognized and skipped.
    AlreadyProcessed,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Test-mode event against a live-mode ledger.
    TestMode,
    /// Event type outside the reconciled lifecycle.
    UnknownEventType,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentProcessorConfig {
    /// Allow non-livemode events to mutate the ledger (test environments
    /// only).
    pub allow_test_events: bool,
}

pub struct PaymentWebhookProcessor<S> {
    store: Arc<S>,
    mailer: Arc<dyn Mailer>,
    config: PaymentProcessorConfig,
}

impl<S: Store> PaymentWebhookProcessor<S> {
    pub fn new(store: Arc<S>, mailer: Arc<dyn Mailer>, config: PaymentProcessorConfig) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    /// Process one raw (already signature-verified) webhook delivery.
    #[instrument(skip(self, raw), err)]
    pub async fn process(&self, raw: &[u8]) -> Result<ProcessOutcome, PaymentWebhookError> {
        let envelope = WebhookEnvelope::parse(raw)?;
        let kind = envelope.kind();

        if !envelope.should_process(self.config.allow_test_events) {
            info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "dropping test-mode event"
            );
            return Ok(ProcessOutcome::Skipped(SkipReason::TestMode));
        }

        if !kind.in_scope() {
            info!(
                event_type = %envelope.event_type,
                "ignoring unknown processor event type"
            );
            return Ok(ProcessOutcome::Skipped(SkipReason::UnknownEventType));
        }

        let order_id = envelope.order_id()?;
        let Some(details) = self.store.find_order(&order_id).await? else {
            return Err(PaymentWebhookError::OrderNotFound { order_id });
        };

        // Idempotency checkpoint: the raw event goes into the log before any
        // reaction runs. A replayed event id stops here.
        let payload: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| PaymentEventError::Malformed(e.to_string()))?;
        let append = self
            .store
            .append_event(NewOrderEvent {
                order_id: order_id.clone(),
                source: EventSource::PaymentProcessor,
                event_type: envelope.event_type.clone(),
                external_event_id: Some(envelope.id.clone()),
                payload,
            })
            .await?;
        if append == EventAppend::AlreadyRecorded {
            info!(event_id = %envelope.id, order_id = %order_id, "event already recorded, skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        match kind {
            PaymentEventKind::IntentSucceeded => {
                self.settle_intent(&envelope, &details).await?;
                self.send_receipt(&details.order).await;
            }
            PaymentEventKind::ChargeRefunded => {
                self.record_refund(&envelope, &details.order).await?;
            }
            PaymentEventKind::IntentCreated => {
                info!(order_id = %order_id, "payment intent created");
            }
            PaymentEventKind::IntentFailed => {
                warn!(order_id = %order_id, "payment intent failed");
            }
            PaymentEventKind::IntentCanceled => {
                warn!(order_id = %order_id, "payment intent canceled");
            }
            PaymentEventKind::Other(_) => {}
        }

        Ok(ProcessOutcome::Processed)
    }

    /// Record a succeeded intent: promotion delta + processor charge, in one
    /// atomic append, gated by the amount/currency assertion.
    async fn settle_intent(
        &self,
        envelope: &WebhookEnvelope,
        details: &OrderDetails,
    ) -> Result<(), PaymentWebhookError> {
        let order = &details.order;
        let intent = PaymentIntentObject::from_object(&envelope.data.object)?;

        let promotion = match &order.promotion_code {
            Some(code) => Some(
                self.store
                    .find_promotion(code)
                    .await?
                    .ok_or_else(|| PaymentWebhookError::MissingPromotion {
                        code: code.clone(),
                        order_id: order.id.clone(),
                    })?,
            ),
            None => None,
        };

        // The same computation that produced the stored total at checkout.
        let price = reconcile(&details.cart, order.currency, promotion.as_ref(), Utc::now())?;

        let received_currency = intent.currency.parse::<Currency>()?;
        if received_currency != order.currency {
            error!(
                business_critical = true,
                order_id = %order.id,
                received = %intent.currency,
                expected = %order.currency,
                "currency mismatch on succeeded intent; refusing payment"
            );
            return Err(PaymentWebhookError::CurrencyMismatch {
                order_id: order.id.clone(),
                received: intent.currency.clone(),
                expected: order.currency,
            });
        }

        if intent.amount_received != price.total {
            error!(
                business_critical = true,
                order_id = %order.id,
                received = intent.amount_received,
                expected = price.total,
                "amount mismatch on succeeded intent; refusing payment"
            );
            return Err(PaymentWebhookError::AmountMismatch {
                order_id: order.id.clone(),
                expected: price.total,
                received: intent.amount_received,
            });
        }

        let method = intent
            .payment_method_types
            .first()
            .ok_or_else(|| DomainError::unknown_enum("provider method", "<missing>"))?
            .parse::<ProviderMethod>()?;

        let mut rows = Vec::with_capacity(2);
        if price.discount > 0 {
            if let Some(promo) = &promotion {
                rows.push(promotion_charge(order, promo, price.discount));
            }
        }
        rows.push(NewPayment {
            order_id: order.id.clone(),
            payment_type: PaymentType::Charge,
            amount: intent.amount_received,
            currency: order.currency,
            provider: PaymentProvider::Stripe,
            provider_method: method,
            external_ref: Some(intent.id.clone()),
            promotion_code: order.promotion_code.clone(),
        });
        self.store.append_payments(rows).await?;

        info!(
            order_id = %order.id,
            amount = intent.amount_received,
            discount = price.discount,
            "payment settled"
        );
        Ok(())
    }

    async fn record_refund(
        &self,
        envelope: &WebhookEnvelope,
        order: &Order,
    ) -> Result<(), PaymentWebhookError> {
        let charge = ChargeObject::from_object(&envelope.data.object)?;
        let refund = charge.refunds.latest_succeeded()?;

        let refund_currency = refund.currency.parse::<Currency>()?;
        if refund_currency != order.currency {
            error!(
                business_critical = true,
                order_id = %order.id,
                received = %refund.currency,
                expected = %order.currency,
                "currency mismatch on refund; refusing to record"
            );
            return Err(PaymentWebhookError::CurrencyMismatch {
                order_id: order.id.clone(),
                received: refund.currency.clone(),
                expected: order.currency,
            });
        }

        // Attribute the refund to the method of the charge it reverses.
        let method = self
            .store
            .payments_for(&order.id)
            .await?
            .iter()
            .rev()
            .find(|p| {
                p.provider == PaymentProvider::Stripe && p.payment_type == PaymentType::Charge
            })
            .map(|p| p.provider_method)
            .unwrap_or(ProviderMethod::Card);

        self.store
            .append_payment(NewPayment {
                order_id: order.id.clone(),
                payment_type: PaymentType::Refund,
                amount: refund.amount,
                currency: order.currency,
                provider: PaymentProvider::Stripe,
                provider_method: method,
                external_ref: Some(refund.id.clone()),
                promotion_code: None,
            })
            .await?;

        info!(order_id = %order.id, amount = refund.amount, refund_id = %refund.id, "refund recorded");
        Ok(())
    }

    /// Receipt notification, after the settlement transaction committed.
    /// At-most-once via the `(order, kind, seq)` reservation.
    async fn send_receipt(&self, order: &Order) {
        let reserved = match self
            .store
            .reserve_email(&order.id, EmailKind::Receipt, 1)
            .await
        {
            Ok(reserved) => reserved,
            Err(StoreError::DuplicateEmail) => {
                info!(order_id = %order.id, "receipt already sent");
                return;
            }
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "could not reserve receipt notification");
                return;
            }
        };

        let email = OutboundEmail {
            kind: EmailKind::Receipt,
            order_id: order.id.clone(),
            tracking_link: None,
        };
        match self.mailer.send(&order.email, &email).await {
            Ok(message_id) => {
                if let Err(err) = self
                    .store
                    .attach_message_id(reserved.id, &message_id)
                    .await
                {
                    warn!(order_id = %order.id, error = %err, "could not attach receipt message id");
                }
            }
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "receipt delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use trailmark_core::Money;
    use trailmark_fulfillment::MailerError;
    use trailmark_orders::{
        Address, AddressKind, CartItem, Discount, GeoBounds, GeoPoint, MapGeometry, Order,
        OrderDetails, Promotion,
    };

    use crate::store::{InMemoryStore, OrderStore, PaymentLedger};

    struct RecordingMailer {
        sent: Mutex<Vec<(String, OutboundEmail)>>,
    }

    impl RecordingMailer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, OutboundEmail)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, email: &OutboundEmail) -> Result<String, MailerError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((to.to_string(), email.clone()));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    fn poster_cart() -> Vec<CartItem> {
        vec![CartItem::MapPoster {
            quantity: 1,
            unit_price: Money::new(2000, Currency::Eur),
            geometry: MapGeometry {
                center: GeoPoint { lat: 52.5, lng: 13.4 },
                bounds: GeoBounds {
                    north: 53.0,
                    south: 52.0,
                    east: 14.0,
                    west: 13.0,
                },
            },
            labels: vec![],
        }]
    }

    async fn seed_order(store: &InMemoryStore, promotion_code: Option<&str>, total: i64) -> OrderId {
        let order_id: OrderId = "1234-5678-9012-3456".parse().unwrap();
        store
            .insert_order(&OrderDetails {
                order: Order {
                    id: order_id.clone(),
                    email: "customer@example.com".to_string(),
                    currency: Currency::Eur,
                    total,
                    promotion_code: promotion_code.map(str::to_string),
                    created_at: Utc::now(),
                    dispatched_at: None,
                    partner_ref: None,
                },
                cart: poster_cart(),
                addresses: vec![Address {
                    kind: AddressKind::Shipping,
                    recipient: "Jo Doe".to_string(),
                    line1: "Mapstraat 1".to_string(),
                    line2: None,
                    city: "Amsterdam".to_string(),
                    postal_code: "1011 AB".to_string(),
                    country: "NL".to_string(),
                }],
            })
            .await
            .unwrap();
        order_id
    }

    fn succeeded_event(event_id: &str, amount: i64, currency: &str) -> Vec<u8> {
        json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "livemode": true,
            "data": { "object": {
                "id": "pi_42",
                "amount_received": amount,
                "currency": currency,
                "payment_method_types": ["card"],
                "metadata": { "prettyOrderId": "1234-5678-9012-3456" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn processor(
        store: &Arc<InMemoryStore>,
        mailer: &Arc<RecordingMailer>,
    ) -> PaymentWebhookProcessor<InMemoryStore> {
        PaymentWebhookProcessor::new(
            store.clone(),
            mailer.clone(),
            PaymentProcessorConfig::default(),
        )
    }

    #[tokio::test]
    async fn succeeded_intent_settles_discount_and_charge() {
        let store = Arc::new(InMemoryStore::new());
        store.put_promotion(Promotion {
            code: "PERCENTAGE20".to_string(),
            discount: Discount::Percentage { percent: 20 },
            expires_at: None,
            gift_card: false,
        });
        let order_id = seed_order(&store, Some("PERCENTAGE20"), 1600).await;
        let mailer = RecordingMailer::new();

        let outcome = processor(&store, &mailer)
            .process(&succeeded_event("evt_1", 1600, "eur"))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let payments = store.payments_for(&order_id).await.unwrap();
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].provider, PaymentProvider::Promotion);
        assert_eq!(payments[0].amount, 400);
        assert_eq!(payments[1].provider, PaymentProvider::Stripe);
        assert_eq!(payments[1].amount, 1600);
        assert_eq!(payments[1].external_ref.as_deref(), Some("pi_42"));

        // paid: sum(CHARGE) covers the authoritative total
        let totals = store.ledger_totals(&order_id).await.unwrap();
        assert!(totals.covers(1600));

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "customer@example.com");
        assert_eq!(sent[0].1.kind, EmailKind::Receipt);
    }

    #[tokio::test]
    async fn amount_mismatch_aborts_with_zero_ledger_rows() {
        let store = Arc::new(InMemoryStore::new());
        store.put_promotion(Promotion {
            code: "PERCENTAGE20".to_string(),
            discount: Discount::Percentage { percent: 20 },
            expires_at: None,
            gift_card: false,
        });
        let order_id = seed_order(&store, Some("PERCENTAGE20"), 1600).await;
        let mailer = RecordingMailer::new();

        let err = processor(&store, &mailer)
            .process(&succeeded_event("evt_1", 1700, "eur"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentWebhookError::AmountMismatch {
                expected: 1600,
                received: 1700,
                ..
            }
        ));

        assert!(store.payments_for(&order_id).await.unwrap().is_empty());
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn currency_mismatch_aborts() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();

        let err = processor(&store, &mailer)
            .process(&succeeded_event("evt_1", 2000, "usd"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentWebhookError::CurrencyMismatch { .. }));
        assert!(store.payments_for(&order_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_event_id_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();
        let p = processor(&store, &mailer);

        let event = succeeded_event("evt_1", 2000, "eur");
        assert_eq!(p.process(&event).await.unwrap(), ProcessOutcome::Processed);
        assert_eq!(
            p.process(&event).await.unwrap(),
            ProcessOutcome::AlreadyProcessed
        );

        assert_eq!(store.payments_for(&order_id).await.unwrap().len(), 1);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_mode_events_are_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();

        let event = json!({
            "id": "evt_test",
            "type": "payment_intent.succeeded",
            "livemode": false,
            "data": { "object": {
                "id": "pi_42",
                "amount_received": 2000,
                "currency": "eur",
                "payment_method_types": ["card"],
                "metadata": { "prettyOrderId": "1234-5678-9012-3456" }
            }}
        })
        .to_string()
        .into_bytes();

        let outcome = processor(&store, &mailer).process(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::TestMode));
        assert!(store.payments_for(&order_id).await.unwrap().is_empty());
        assert!(store.events_for(&order_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let mailer = RecordingMailer::new();

        let event = json!({
            "id": "evt_x",
            "type": "customer.created",
            "livemode": true,
            "data": { "object": {} }
        })
        .to_string()
        .into_bytes();

        let outcome = processor(&store, &mailer).process(&event).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Skipped(SkipReason::UnknownEventType)
        );
    }

    #[tokio::test]
    async fn missing_order_id_is_a_hard_failure() {
        let store = Arc::new(InMemoryStore::new());
        let mailer = RecordingMailer::new();

        let event = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "livemode": true,
            "data": { "object": { "id": "pi_42", "amount_received": 100, "currency": "eur" } }
        })
        .to_string()
        .into_bytes();

        let err = processor(&store, &mailer).process(&event).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentWebhookError::Event(PaymentEventError::MissingOrderId { .. })
        ));
    }

    #[tokio::test]
    async fn failed_intent_only_logs() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();

        let event = json!({
            "id": "evt_fail",
            "type": "payment_intent.payment_failed",
            "livemode": true,
            "data": { "object": {
                "id": "pi_42",
                "currency": "eur",
                "metadata": { "prettyOrderId": "1234-5678-9012-3456" }
            }}
        })
        .to_string()
        .into_bytes();

        let outcome = processor(&store, &mailer).process(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);
        assert!(store.payments_for(&order_id).await.unwrap().is_empty());
        // The event itself is on file.
        assert_eq!(store.events_for(&order_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_records_latest_succeeded() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();
        let p = processor(&store, &mailer);

        // Settle first so the refund can inherit the charge method.
        p.process(&succeeded_event("evt_1", 2000, "eur"))
            .await
            .unwrap();

        let refund_event = json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "livemode": true,
            "data": { "object": {
                "id": "ch_1",
                "metadata": { "prettyOrderId": "1234-5678-9012-3456" },
                "refunds": {
                    "data": [
                        { "id": "re_1", "amount": 300, "currency": "eur", "status": "succeeded", "created": 10 },
                        { "id": "re_2", "amount": 500, "currency": "eur", "status": "succeeded", "created": 20 }
                    ],
                    "has_more": false,
                    "total_count": 2
                }
            }}
        })
        .to_string()
        .into_bytes();

        assert_eq!(
            p.process(&refund_event).await.unwrap(),
            ProcessOutcome::Processed
        );

        let payments = store.payments_for(&order_id).await.unwrap();
        assert_eq!(payments.len(), 2);
        let refund = &payments[1];
        assert_eq!(refund.payment_type, PaymentType::Refund);
        assert_eq!(refund.amount, 500);
        assert_eq!(refund.external_ref.as_deref(), Some("re_2"));
        assert_eq!(refund.provider_method, ProviderMethod::Card);

        let totals = store.ledger_totals(&order_id).await.unwrap();
        assert_eq!(totals.net(), 1500);
        assert!(!totals.covers(2000));
    }

    #[tokio::test]
    async fn truncated_refund_page_is_refused() {
        let store = Arc::new(InMemoryStore::new());
        let order_id = seed_order(&store, None, 2000).await;
        let mailer = RecordingMailer::new();

        let refund_event = json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "livemode": true,
            "data": { "object": {
                "id": "ch_1",
                "metadata": { "prettyOrderId": "1234-5678-9012-3456" },
                "refunds": {
                    "data": [
                        { "id": "re_1", "amount": 300, "currency": "eur", "status": "succeeded", "created": 10 }
                    ],
                    "has_more": true,
                    "total_count": 4
                }
            }}
        })
        .to_string()
        .into_bytes();

        let err = processor(&store, &mailer)
            .process(&refund_event)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentWebhookError::Event(PaymentEventError::RefundsTruncated { .. })
        ));
        assert!(store.payments_for(&order_id).await.unwrap().is_empty());
    }
}
