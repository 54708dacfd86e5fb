//! Integration tests for the full order pipeline.
//!
//! Checkout → payment webhook settlement → production dispatch → delivery
//! webhook, against the in-memory store.
//!
//! Verifies:
//! - the recomputed total flows from checkout into settlement unchanged
//! - the ledger covers the order exactly when settlement succeeded
//! - dispatch happens once, with the audit event on file
//! - delivery notifications respect the capped policy

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;

    use trailmark_core::{Currency, Money};
    use trailmark_fulfillment::{
        EmailKind, FulfillmentPartner, Mailer, MailerError, OutboundEmail, PartnerError,
        PartnerOrderStatus, PlaceOrderRequest, PlaceOrderResponse, WebhookAuthenticator,
    };
    use trailmark_orders::{
        Address, AddressKind, CartItem, Discount, GeoBounds, GeoPoint, MapGeometry, Promotion,
    };
    use trailmark_payments::{
        CreateIntentRequest, CreatedIntent, IntentError, PaymentIntents,
    };

    use crate::checkout::{CheckoutInput, CheckoutService};
    use crate::dispatch::{DispatchConfig, ProductionDispatchScheduler};
    use crate::fulfillment_processor::{FulfillmentWebhookProcessor, IngestOutcome};
    use crate::payment_processor::{
        PaymentProcessorConfig, PaymentWebhookProcessor, ProcessOutcome,
    };
    use crate::store::{InMemoryStore, OrderStore, PaymentLedger, SentEmailStore};

    const PARTNER_SECRET: &[u8] = b"partner-secret";

    struct StubIntents;

    #[async_trait]
    impl PaymentIntents for StubIntents {
        async fn create_intent(
            &self,
            req: CreateIntentRequest,
        ) -> Result<CreatedIntent, IntentError> {
            Ok(CreatedIntent {
                id: format!("pi_{}", req.order_id),
                client_secret: "secret".to_string(),
            })
        }
    }

    struct StubPartner;

    #[async_trait]
    impl FulfillmentPartner for StubPartner {
        async fn place_order(
            &self,
            _request: &PlaceOrderRequest,
        ) -> Result<PlaceOrderResponse, PartnerError> {
            Ok(PlaceOrderResponse {
                external_id: "PARTNER-1".to_string(),
                raw: json!({ "orderNumber": "PARTNER-1" }),
            })
        }

        async fn order_status(
            &self,
            _external_id: &str,
        ) -> Result<PartnerOrderStatus, PartnerError> {
            Ok(PartnerOrderStatus::InProduction)
        }
    }

    struct RecordingMailer {
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, _to: &str, email: &OutboundEmail) -> Result<String, MailerError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(email.clone());
            Ok(format!("msg-{}", sent.len()))
        }
    }

    fn sign(payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(PARTNER_SECRET).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn order_lifecycle_end_to_end() {
        let store = Arc::new(InMemoryStore::new());
        store.put_promotion(Promotion {
            code: "PERCENTAGE20".to_string(),
            discount: Discount::Percentage { percent: 20 },
            expires_at: None,
            gift_card: false,
        });
        let mailer = Arc::new(RecordingMailer {
            sent: Mutex::new(Vec::new()),
        });

        // 1. Checkout: 2000-cent poster with 20% off prices at 1600.
        let checkout = CheckoutService::new(store.clone(), Arc::new(StubIntents));
        let outcome = checkout
            .checkout(CheckoutInput {
                email: "customer@example.com".to_string(),
                cart: vec![CartItem::MapPoster {
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
                }],
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
                promotion_code: Some("PERCENTAGE20".to_string()),
                currency: Currency::Eur,
            })
            .await
            .unwrap();
        let order_id = outcome.order_id.clone();
        assert!(!outcome.paid);

        let details = store.find_order(&order_id).await.unwrap().unwrap();
        assert_eq!(details.order.total, 1600);

        // 2. Processor reports success for exactly the recomputed amount.
        let payments_processor = PaymentWebhookProcessor::new(
            store.clone(),
            mailer.clone(),
            PaymentProcessorConfig::default(),
        );
        let event = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "livemode": true,
            "data": { "object": {
                "id": format!("pi_{order_id}"),
                "amount_received": 1600,
                "currency": "eur",
                "payment_method_types": ["card"],
                "metadata": { "prettyOrderId": order_id.as_str() }
            }}
        })
        .to_string()
        .into_bytes();
        assert_eq!(
            payments_processor.process(&event).await.unwrap(),
            ProcessOutcome::Processed
        );

        let totals = store.ledger_totals(&order_id).await.unwrap();
        assert!(totals.covers(1600));

        // 3. The scheduler hands the paid order to the partner.
        let scheduler = ProductionDispatchScheduler::new(
            store.clone(),
            Arc::new(StubPartner),
            mailer.clone(),
            DispatchConfig {
                grace_period: chrono::Duration::zero(),
                ..DispatchConfig::default()
            },
        );
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.dispatched, 1);

        let details = store.find_order(&order_id).await.unwrap().unwrap();
        assert_eq!(details.order.partner_ref.as_deref(), Some("PARTNER-1"));

        // 4. The partner reports delivery; the customer gets the capped
        //    delivery-status notification.
        let fulfillment = FulfillmentWebhookProcessor::new(
            store.clone(),
            WebhookAuthenticator::new(PARTNER_SECRET.to_vec()),
            mailer.clone(),
        );
        let delivery = json!({
            "eventType": "USER_ORDER_DELIVERED",
            "userOrder": {
                "orderNumber": "PARTNER-1",
                "meta": { "externalTrackingLinks": ["https://track.example/1"] }
            }
        })
        .to_string()
        .into_bytes();
        assert_eq!(
            fulfillment.ingest(&delivery, &sign(&delivery)).await.unwrap(),
            IngestOutcome::Processed
        );

        let emails = store.email_history(&order_id).await.unwrap();
        let kinds: Vec<EmailKind> = emails.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EmailKind::Receipt));
        assert!(kinds.contains(&EmailKind::DeliveryStarted));

        // The event log carries the full history: settlement, dispatch
        // audit, delivery.
        let events = store.events_for(&order_id).await.unwrap();
        assert_eq!(events.len(), 3);
    }
}
