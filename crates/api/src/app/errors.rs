//! HTTP error mapping.
//!
//! Validation failures carry their message to the client (they caused them);
//! everything else returns a generic body, with full detail routed to
//! internal logs only.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use trailmark_infra::checkout::CheckoutError;
use trailmark_infra::fulfillment_processor::FulfillmentWebhookError;
use trailmark_infra::payment_processor::PaymentWebhookError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn internal_error(err: &dyn std::fmt::Display) -> axum::response::Response {
    error!(error = %err, "request failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "something went wrong",
    )
}

pub fn checkout_error_to_response(err: CheckoutError) -> axum::response::Response {
    match err {
        CheckoutError::Pricing(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        CheckoutError::UnknownPromotion { code } => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_promotion",
            format!("promotion code {code} does not exist"),
        ),
        err => internal_error(&err),
    }
}

pub fn payment_webhook_error_to_response(err: PaymentWebhookError) -> axum::response::Response {
    match err {
        PaymentWebhookError::Event(e) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_event", e.to_string())
        }
        err => internal_error(&err),
    }
}

pub fn fulfillment_webhook_error_to_response(
    err: FulfillmentWebhookError,
) -> axum::response::Response {
    match err {
        FulfillmentWebhookError::Auth(_) => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_signature", "invalid signature")
        }
        FulfillmentWebhookError::Malformed(e) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_payload", e)
        }
        FulfillmentWebhookError::MissingTrackingLink { .. } => json_error(
            StatusCode::BAD_REQUEST,
            "missing_tracking_link",
            "delivered event has no tracking link",
        ),
        FulfillmentWebhookError::Notification(e) => {
            json_error(StatusCode::CONFLICT, "notification_cap", e.to_string())
        }
        err => internal_error(&err),
    }
}
