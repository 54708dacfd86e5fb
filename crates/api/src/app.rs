//! Axum application: checkout, webhook ingestion, order lookup.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use trailmark_core::Currency;
use trailmark_infra::checkout::{CheckoutInput, CheckoutService};
use trailmark_infra::fulfillment_processor::{FulfillmentWebhookProcessor, IngestOutcome};
use trailmark_infra::payment_processor::PaymentWebhookProcessor;
use trailmark_infra::store::Store;
use trailmark_orders::{Address, AddressKind, CartItem, OrderDetails, OrderId};
use trailmark_payments::SignatureVerifier;

pub mod errors;
use errors::{
    checkout_error_to_response, fulfillment_webhook_error_to_response, internal_error, json_error,
    payment_webhook_error_to_response,
};

/// Everything the handlers need, built once at startup and injected.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub checkout: CheckoutService<S>,
    pub payment_webhooks: PaymentWebhookProcessor<S>,
    pub fulfillment_webhooks: FulfillmentWebhookProcessor<S>,
    pub payment_signature: SignatureVerifier,
    pub internal_token: Option<String>,
}

pub fn build_app<S: Store>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/api/checkout", post(checkout_handler::<S>))
        .route("/api/orders/:id", get(order_view::<S>))
        .route("/api/orders/:id/full", get(order_full_view::<S>))
        .route("/webhooks/payment", post(payment_webhook::<S>))
        .route("/webhooks/fulfillment", post(fulfillment_webhook::<S>))
        .layer(Extension(state))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest {
    email: String,
    cart: Vec<CartItem>,
    shipping_address: Option<AddressPayload>,
    billing_address: Option<AddressPayload>,
    promotion_code: Option<String>,
    currency: String,
}

/// Address as submitted; the role comes from the field it arrived in.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressPayload {
    recipient: String,
    line1: String,
    #[serde(default)]
    line2: Option<String>,
    city: String,
    postal_code: String,
    country: String,
}

impl AddressPayload {
    fn into_address(self, kind: AddressKind) -> Address {
        Address {
            kind,
            recipient: self.recipient,
            line1: self.line1,
            line2: self.line2,
            city: self.city,
            postal_code: self.postal_code,
            country: self.country,
        }
    }
}

async fn checkout_handler<S: Store>(
    Extension(state): Extension<Arc<AppState<S>>>,
    Json(request): Json<CheckoutRequest>,
) -> axum::response::Response {
    let currency: Currency = match request.currency.parse() {
        Ok(currency) => currency,
        Err(_) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("unsupported currency {:?}", request.currency),
            );
        }
    };

    let input = CheckoutInput {
        email: request.email,
        cart: request.cart,
        shipping_address: request
            .shipping_address
            .map(|a| a.into_address(AddressKind::Shipping)),
        billing_address: request
            .billing_address
            .map(|a| a.into_address(AddressKind::Billing)),
        promotion_code: request.promotion_code,
        currency,
    };

    match state.checkout.checkout(input).await {
        Ok(outcome) => {
            let mut body = json!({
                "orderId": outcome.order_id,
                "paid": outcome.paid,
            });
            if let Some(client_secret) = outcome.client_secret {
                body["stripePaymentIntent"] = json!({ "clientSecret": client_secret });
            }
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(err) => checkout_error_to_response(err),
    }
}

async fn load_order<S: Store>(
    state: &AppState<S>,
    id: &str,
) -> Result<(OrderDetails, bool), axum::response::Response> {
    let order_id: OrderId = id
        .parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_order_id", "invalid order id"))?;
    let details = state
        .store
        .find_order(&order_id)
        .await
        .map_err(|e| internal_error(&e))?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "order not found"))?;
    let totals = state
        .store
        .ledger_totals(&order_id)
        .await
        .map_err(|e| internal_error(&e))?;
    let paid = totals.covers(details.order.total);
    Ok((details, paid))
}

/// Public view: cart, paid flag, promotion, limited address fields.
async fn order_view<S: Store>(
    Extension(state): Extension<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (details, paid) = match load_order(&state, &id).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    let shipping = details
        .addresses
        .iter()
        .find(|a| a.kind == AddressKind::Shipping)
        .map(|a| json!({ "city": a.city, "country": a.country }));

    Json(json!({
        "orderId": details.order.id,
        "paid": paid,
        "currency": details.order.currency,
        "total": details.order.total,
        "promotionCode": details.order.promotion_code,
        "cart": details.cart,
        "shipping": shipping,
    }))
    .into_response()
}

/// Trusted view: the full record including ledger and event history.
async fn order_full_view<S: Store>(
    Extension(state): Extension<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let authorized = state.internal_token.as_deref().is_some_and(|token| {
        headers
            .get("x-internal-token")
            .and_then(|v| v.to_str().ok())
            == Some(token)
    });
    if !authorized {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized");
    }

    let (details, paid) = match load_order(&state, &id).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let payments = match state.store.payments_for(&details.order.id).await {
        Ok(payments) => payments,
        Err(e) => return internal_error(&e),
    };
    let events = match state.store.events_for(&details.order.id).await {
        Ok(events) => events,
        Err(e) => return internal_error(&e),
    };
    let emails = match state.store.email_history(&details.order.id).await {
        Ok(emails) => emails,
        Err(e) => return internal_error(&e),
    };

    Json(json!({
        "order": details.order,
        "paid": paid,
        "cart": details.cart,
        "addresses": details.addresses,
        "payments": payments,
        "events": events,
        "emails": emails,
    }))
    .into_response()
}

async fn payment_webhook<S: Store>(
    Extension(state): Extension<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return json_error(StatusCode::UNAUTHORIZED, "missing_signature", "missing signature");
    };
    if state
        .payment_signature
        .verify(&body, signature, Utc::now().timestamp())
        .is_err()
    {
        return json_error(StatusCode::UNAUTHORIZED, "invalid_signature", "invalid signature");
    }

    match state.payment_webhooks.process(&body).await {
        Ok(outcome) => Json(json!({ "received": true, "outcome": format!("{outcome:?}") }))
            .into_response(),
        Err(err) => payment_webhook_error_to_response(err),
    }
}

async fn fulfillment_webhook<S: Store>(
    Extension(state): Extension<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers
        .get("x-partner-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.fulfillment_webhooks.ingest(&body, signature).await {
        Ok(IngestOutcome::Processed) => Json(json!({ "received": true })).into_response(),
        // An order unknown to us is a recoverable condition, acknowledged
        // so the partner stops retrying.
        Ok(IngestOutcome::UnknownOrder) => {
            Json(json!({ "received": true, "known": false })).into_response()
        }
        Err(err) => fulfillment_webhook_error_to_response(err),
    }
}
