//! Authoritative price reconciliation.
//!
//! Client-submitted totals are never trusted: this module recomputes the
//! price from cart contents + resolved promotion, at checkout time and again
//! at webhook-confirmation time, so the two computations can be compared.
//! The function is pure and deterministic over its inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trailmark_core::Currency;

use crate::cart::CartItem;
use crate::promotion::Promotion;

/// Totals at or above this are rejected outright, never clamped.
pub const HARD_CEILING: i64 = 50_000;
/// Totals at or above this are accepted but flagged for manual review.
pub const ALERT_ABOVE: i64 = 25_000;
/// Non-zero totals below this are accepted but flagged for manual review.
pub const ALERT_BELOW: i64 = 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("cart item priced in {found}, order currency is {expected}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    #[error("promotion {code} has expired")]
    PromotionExpired { code: String },

    #[error("computed total {total} is at or above the hard limit {limit}")]
    AboveHardLimit { total: i64, limit: i64 },
}

/// Non-fatal pricing observation; logged for manual review, never blocks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceAnomaly {
    SuspiciouslyLow,
    UnusuallyHigh,
}

/// Result of a reconciliation pass. All amounts in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledPrice {
    pub subtotal: i64,
    pub discount: i64,
    pub total: i64,
    pub currency: Currency,
    pub anomaly: Option<PriceAnomaly>,
}

/// Recompute the authoritative price for `cart` in `currency`.
///
/// An expired promotion is a hard reject; the caller resolved the code, so
/// expiry here means it lapsed between resolution and pricing (or the client
/// replayed an old code).
pub fn reconcile(
    cart: &[CartItem],
    currency: Currency,
    promotion: Option<&Promotion>,
    now: DateTime<Utc>,
) -> Result<ReconciledPrice, PricingError> {
    if cart.is_empty() {
        return Err(PricingError::EmptyCart);
    }

    let mut subtotal: i64 = 0;
    for item in cart {
        if item.currency() != currency {
            return Err(PricingError::CurrencyMismatch {
                expected: currency,
                found: item.currency(),
            });
        }
        subtotal = subtotal.saturating_add(item.line_total());
    }

    let discount = match promotion {
        Some(promo) if promo.is_expired(now) => {
            return Err(PricingError::PromotionExpired {
                code: promo.code.clone(),
            });
        }
        Some(promo) => promo.discount_on(subtotal),
        None => 0,
    };

    let total = subtotal - discount;
    if total >= HARD_CEILING {
        return Err(PricingError::AboveHardLimit {
            total,
            limit: HARD_CEILING,
        });
    }

    let anomaly = if total > 0 && total < ALERT_BELOW {
        Some(PriceAnomaly::SuspiciouslyLow)
    } else if total >= ALERT_ABOVE {
        Some(PriceAnomaly::UnusuallyHigh)
    } else {
        None
    };

    Ok(ReconciledPrice {
        subtotal,
        discount,
        total,
        currency,
        anomaly,
    })
}
