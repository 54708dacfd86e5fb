//! The order transaction manager.
//!
//! Creates durable orders: recomputed price, one atomic insert for the order
//! row plus its owned collections, payment-intent creation for non-zero
//! totals. Failures that are not the order-id race hand the attempted order
//! to the fail-safe recorder off the critical path and propagate unchanged.

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use chrono::Utc;
use trailmark_core::Currency;
use trailmark_orders::{
    Address, AddressKind, CartItem, Order, OrderDetails, OrderId, Promotion, PricingError,
    reconcile,
};
use trailmark_payments::{
    CreateIntentRequest, IntentError, NewPayment, PaymentIntents, PaymentProvider, PaymentType,
    ProviderMethod,
};

use crate::failsafe::FailSafeRecorder;
use crate::order_id::{OrderIdError, OrderIdGenerator};
use crate::store::{FailedOrderSnapshot, Store, StoreError};

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error("unknown promotion code {code}")]
    UnknownPromotion { code: String },

    /// The id probe lost its race: the primary key rejected the insert.
    /// Logged critical and propagated; the caller may retry the whole
    /// checkout, this layer never does.
    #[error("order id already taken (lost generation race)")]
    DuplicateOrderId,

    #[error(transparent)]
    OrderIds(#[from] OrderIdError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Intent(#[from] IntentError),
}

/// Checkout request after HTTP-level validation (routing/schemas are an
/// external concern).
#[derive(Debug, Clone)]
pub struct CheckoutInput {
    pub email: String,
    pub cart: Vec<CartItem>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub promotion_code: Option<String>,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutOutcome {
    pub order_id: OrderId,
    pub paid: bool,
    /// Present when a payment intent was created for the storefront to
    /// confirm; zero-cost orders have none.
    pub client_secret: Option<String>,
}

pub struct CheckoutService<S> {
    store: Arc<S>,
    ids: OrderIdGenerator<S>,
    intents: Arc<dyn PaymentIntents>,
    failsafe: FailSafeRecorder<S>,
}

impl<S: Store> CheckoutService<S> {
    pub fn new(store: Arc<S>, intents: Arc<dyn PaymentIntents>) -> Self {
        Self {
            ids: OrderIdGenerator::new(store.clone()),
            failsafe: FailSafeRecorder::new(store.clone()),
            store,
            intents,
        }
    }

    #[instrument(skip(self, input), fields(currency = %input.currency), err)]
    pub async fn checkout(&self, input: CheckoutInput) -> Result<CheckoutOutcome, CheckoutError> {
        let order_id = self.ids.generate().await?;
        let promotion = self.resolve_promotion(input.promotion_code.as_deref()).await?;

        let price = reconcile(&input.cart, input.currency, promotion.as_ref(), Utc::now())?;
        if let Some(anomaly) = price.anomaly {
            warn!(
                alert = true,
                total = price.total,
                ?anomaly,
                "checkout total flagged for manual review"
            );
        }
        let order = Order {
            id: order_id.clone(),
            email: input.email,
            currency: input.currency,
            // Never the client-submitted total.
            total: price.total,
            promotion_code: promotion.as_ref().map(|p| p.code.clone()),
            created_at: Utc::now(),
            dispatched_at: None,
            partner_ref: None,
        };

        let mut addresses = Vec::new();
        if let Some(mut shipping) = input.shipping_address {
            shipping.kind = AddressKind::Shipping;
            addresses.push(shipping);
        }
        if let Some(mut billing) = input.billing_address {
            billing.kind = AddressKind::Billing;
            addresses.push(billing);
        }

        let details = OrderDetails {
            order,
            cart: input.cart,
            addresses,
        };

        match self.store.insert_order(&details).await {
            Ok(()) => {}
            Err(StoreError::DuplicateOrderId) => {
                error!(
                    business_critical = true,
                    order_id = %order_id,
                    "order id collision slipped past the probe; insert rejected"
                );
                return Err(CheckoutError::DuplicateOrderId);
            }
            Err(err) => {
                // Off the critical path, own retry policy; the original
                // error goes back to the caller unchanged.
                let snapshot = FailedOrderSnapshot::capture(&details, &err);
                let failsafe = self.failsafe.clone();
                tokio::spawn(async move { failsafe.record(snapshot).await });
                return Err(CheckoutError::Store(err));
            }
        }

        if price.total == 0 {
            // Fully covered by the promotion/gift code: record the discount
            // delta now, no payment intent needed.
            if price.discount > 0 {
                if let Some(promo) = &promotion {
                    self.store
                        .append_payment(promotion_charge(&details.order, promo, price.discount))
                        .await
                        .map_err(CheckoutError::Store)?;
                }
            }
            info!(order_id = %order_id, "zero-cost order created and settled");
            return Ok(CheckoutOutcome {
                order_id,
                paid: true,
                client_secret: None,
            });
        }

        let intent = self
            .intents
            .create_intent(CreateIntentRequest {
                order_id: order_id.clone(),
                amount: price.total,
                currency: details.order.currency,
                receipt_email: details.order.email.clone(),
            })
            .await?;

        info!(order_id = %order_id, total = price.total, "order created");
        Ok(CheckoutOutcome {
            order_id,
            paid: false,
            client_secret: Some(intent.client_secret),
        })
    }

    async fn resolve_promotion(
        &self,
        code: Option<&str>,
    ) -> Result<Option<Promotion>, CheckoutError> {
        let Some(code) = code else { return Ok(None) };
        self.store
            .find_promotion(code)
            .await
            .map_err(CheckoutError::Store)?
            .map(Some)
            .ok_or_else(|| CheckoutError::UnknownPromotion {
                code: code.to_string(),
            })
    }
}

/// The discount delta as a ledger charge, attributed to the gift-card or
/// promotion provider.
pub fn promotion_charge(order: &Order, promotion: &Promotion, discount: i64) -> NewPayment {
    let (provider, method) = if promotion.gift_card {
        (PaymentProvider::GiftCard, ProviderMethod::GiftCard)
    } else {
        (PaymentProvider::Promotion, ProviderMethod::Promotion)
    };
    NewPayment {
        order_id: order.id.clone(),
        payment_type: PaymentType::Charge,
        amount: discount,
        currency: order.currency,
        provider,
        provider_method: method,
        external_ref: None,
        promotion_code: Some(promotion.code.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use trailmark_core::Money;
    use trailmark_orders::{Discount, GeoBounds, GeoPoint, MapGeometry};
    use trailmark_payments::CreatedIntent;

    use crate::store::{InMemoryStore, OrderStore, PaymentLedger};

    struct StubIntents {
        calls: AtomicU32,
    }

    impl StubIntents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentIntents for StubIntents {
        async fn create_intent(
            &self,
            req: CreateIntentRequest,
        ) -> Result<CreatedIntent, IntentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CreatedIntent {
                id: format!("pi_{}", req.order_id),
                client_secret: format!("pi_{}_secret", req.order_id),
            })
        }
    }

    fn poster(unit_cents: i64) -> CartItem {
        CartItem::MapPoster {
            quantity: 1,
            unit_price: Money::new(unit_cents, Currency::Eur),
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
        }
    }

    fn input(cart: Vec<CartItem>, promotion_code: Option<&str>) -> CheckoutInput {
        CheckoutInput {
            email: "customer@example.com".to_string(),
            cart,
            shipping_address: Some(Address {
                kind: AddressKind::Shipping,
                recipient: "Jo Doe".to_string(),
                line1: "Mapstraat 1".to_string(),
                line2: None,
                city: "Amsterdam".to_string(),
                postal_code: "1011 AB".to_string(),
                country: "NL".to_string(),
            }),
            billing_address: None,
            promotion_code: promotion_code.map(str::to_string),
            currency: Currency::Eur,
        }
    }

    fn percent_promo(code: &str, percent: u8) -> Promotion {
        Promotion {
            code: code.to_string(),
            discount: Discount::Percentage { percent },
            expires_at: None,
            gift_card: false,
        }
    }

    #[tokio::test]
    async fn checkout_persists_order_with_recomputed_total() {
        let store = Arc::new(InMemoryStore::new());
        store.put_promotion(percent_promo("PERCENTAGE20", 20));
        let intents = StubIntents::new();
        let service = CheckoutService::new(store.clone(), intents.clone());

        let outcome = service
            .checkout(input(vec![poster(2000)], Some("PERCENTAGE20")))
            .await
            .unwrap();

        assert!(!outcome.paid);
        assert!(outcome.client_secret.is_some());
        assert_eq!(intents.calls.load(Ordering::SeqCst), 1);

        let details = store.find_order(&outcome.order_id).await.unwrap().unwrap();
        assert_eq!(details.order.total, 1600);
        assert_eq!(details.order.promotion_code.as_deref(), Some("PERCENTAGE20"));
        assert_eq!(details.cart.len(), 1);
        assert_eq!(details.addresses.len(), 1);
    }

    #[tokio::test]
    async fn zero_cost_checkout_settles_without_an_intent() {
        let store = Arc::new(InMemoryStore::new());
        store.put_promotion(Promotion {
            gift_card: true,
            ..percent_promo("GIFT100", 100)
        });
        let intents = StubIntents::new();
        let service = CheckoutService::new(store.clone(), intents.clone());

        let outcome = service
            .checkout(input(vec![poster(2000)], Some("GIFT100")))
            .await
            .unwrap();

        assert!(outcome.paid);
        assert_eq!(outcome.client_secret, None);
        assert_eq!(intents.calls.load(Ordering::SeqCst), 0);

        let payments = store.payments_for(&outcome.order_id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].provider, PaymentProvider::GiftCard);
        assert_eq!(payments[0].amount, 2000);

        let totals = store.ledger_totals(&outcome.order_id).await.unwrap();
        let details = store.find_order(&outcome.order_id).await.unwrap().unwrap();
        assert!(totals.covers(details.order.total));
    }

    #[tokio::test]
    async fn expired_promotion_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let mut promo = percent_promo("OLD", 20);
        promo.expires_at = Some(Utc::now() - chrono::Duration::days(1));
        store.put_promotion(promo);
        let service = CheckoutService::new(store, StubIntents::new());

        let err = service
            .checkout(input(vec![poster(2000)], Some("OLD")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Pricing(PricingError::PromotionExpired { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_promotion_code_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let service = CheckoutService::new(store, StubIntents::new());

        let err = service
            .checkout(input(vec![poster(2000)], Some("NOPE")))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::UnknownPromotion { .. }));
    }

    #[tokio::test]
    async fn insert_failure_snapshots_and_propagates() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_insert();
        let service = CheckoutService::new(store.clone(), StubIntents::new());

        let err = service
            .checkout(input(vec![poster(2000)], None))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Store(StoreError::Backend { .. })));

        // The snapshot task runs off the critical path.
        let mut captured = store.failed_orders();
        for _ in 0..50 {
            if !captured.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            captured = store.failed_orders();
        }
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].email, "customer@example.com");
    }
}
