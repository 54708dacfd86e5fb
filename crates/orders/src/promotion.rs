//! Promotion codes.
//!
//! Promotions are referenced, never mutated, by orders and ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trailmark_core::{DomainError, DomainResult};

/// Discount shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Discount {
    Fixed { amount: i64 },
    Percentage { percent: u8 },
}

impl Discount {
    pub fn percentage(percent: u8) -> DomainResult<Self> {
        if percent == 0 || percent > 100 {
            return Err(DomainError::validation(format!(
                "percentage discount must be within 1..=100, got {percent}"
            )));
        }
        Ok(Self::Percentage { percent })
    }

    pub fn fixed(amount: i64) -> DomainResult<Self> {
        if amount <= 0 {
            return Err(DomainError::validation(format!(
                "fixed discount must be positive, got {amount}"
            )));
        }
        Ok(Self::Fixed { amount })
    }
}

/// A promotion code as resolved at checkout/webhook time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub code: String,
    pub discount: Discount,
    pub expires_at: Option<DateTime<Utc>>,
    /// Value codes sold as gift cards; their ledger rows are attributed to
    /// the gift-card provider rather than the promotion provider.
    pub gift_card: bool,
}

impl Promotion {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }

    /// Discount in cents for a given subtotal, clamped to the subtotal.
    /// Percentage discounts floor to whole cents.
    pub fn discount_on(&self, subtotal: i64) -> i64 {
        let raw = match self.discount {
            Discount::Fixed { amount } => amount,
            Discount::Percentage { percent } => subtotal
                .saturating_mul(i64::from(percent))
                .div_euclid(100),
        };
        raw.clamp(0, subtotal)
    }
}
