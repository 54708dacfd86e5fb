//! Partner webhook payloads and authentication.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FulfillmentAuthError {
    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature does not match payload")]
    Mismatch,
}

/// Verifies the partner's HMAC-SHA256 signature over the raw JSON body.
///
/// Verification can be disabled by configuration for local development only;
/// a disabled authenticator accepts everything and says so in the logs.
#[derive(Clone)]
pub struct WebhookAuthenticator {
    secret: Vec<u8>,
    enabled: bool,
}

impl std::fmt::Debug for WebhookAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuthenticator")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl WebhookAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            enabled: true,
        }
    }

    /// Development-only escape hatch.
    pub fn disabled() -> Self {
        Self {
            secret: Vec::new(),
            enabled: false,
        }
    }

    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> Result<(), FulfillmentAuthError> {
        if !self.enabled {
            warn!("fulfillment webhook signature verification is disabled");
            return Ok(());
        }

        let expected =
            hex::decode(signature_hex).map_err(|_| FulfillmentAuthError::MalformedSignature)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| FulfillmentAuthError::Mismatch)
    }
}

/// Partner event taxonomy. Reactions match on this exhaustively; a new kind
/// is a compile-time decision, not a lookup-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentEventKind {
    OrderCreated,
    OrderCancelled,
    OrderDelivered,
    Other(String),
}

impl FulfillmentEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "USER_ORDER_CREATED" => FulfillmentEventKind::OrderCreated,
            "USER_ORDER_CANCELLED" => FulfillmentEventKind::OrderCancelled,
            "USER_ORDER_DELIVERED" => FulfillmentEventKind::OrderDelivered,
            other => FulfillmentEventKind::Other(other.to_string()),
        }
    }

    /// Terminal kinds end the staleness scan's interest in an order.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FulfillmentEventKind::OrderDelivered | FulfillmentEventKind::OrderCancelled
        )
    }
}

/// The partner's webhook body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentWebhook {
    pub event_type: String,
    pub user_order: UserOrder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOrder {
    /// The partner's own order number, matched against the `partner_ref`
    /// recorded at dispatch.
    pub order_number: String,
    #[serde(default)]
    pub meta: UserOrderMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOrderMeta {
    #[serde(default)]
    pub tracking_code: Option<String>,
    #[serde(default)]
    pub external_tracking_links: Vec<String>,
}

impl FulfillmentWebhook {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn kind(&self) -> FulfillmentEventKind {
        FulfillmentEventKind::from_type(&self.event_type)
    }

    /// Customer-facing tracking link; delivered events fail loudly without one.
    pub fn tracking_link(&self) -> Option<&str> {
        self.user_order
            .meta
            .external_tracking_links
            .first()
            .map(String::as_str)
    }
}
