//! The payment ledger row model.
//!
//! Ledger rows are append-only: no update or delete operation exists anywhere
//! in this workspace. How much has been collected or refunded for an order is
//! answered only by summing its rows. All enumerations are closed; values
//! arriving from the outside parse through `FromStr` and fail fast with
//! `UnknownEnumValue` instead of persisting unvalidated strings.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use trailmark_core::{Currency, DomainError, PaymentId};
use trailmark_orders::OrderId;

/// Direction of a ledger row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Charge,
    Refund,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Charge => "charge",
            PaymentType::Refund => "refund",
        }
    }
}

impl FromStr for PaymentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "charge" => Ok(PaymentType::Charge),
            "refund" => Ok(PaymentType::Refund),
            _ => Err(DomainError::unknown_enum("payment type", s)),
        }
    }
}

/// Who the money moved through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    /// The external card processor.
    Stripe,
    /// Internal gift-card value redemption.
    GiftCard,
    /// Promotion discount recorded as collected value.
    Promotion,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::GiftCard => "giftcard",
            PaymentProvider::Promotion => "promotion",
        }
    }
}

impl FromStr for PaymentProvider {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(PaymentProvider::Stripe),
            "giftcard" => Ok(PaymentProvider::GiftCard),
            "promotion" => Ok(PaymentProvider::Promotion),
            _ => Err(DomainError::unknown_enum("payment provider", s)),
        }
    }
}

/// Concrete method within a provider, as the processor reports it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMethod {
    Card,
    SepaDebit,
    Paypal,
    Klarna,
    GiftCard,
    Promotion,
}

impl ProviderMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMethod::Card => "card",
            ProviderMethod::SepaDebit => "sepa_debit",
            ProviderMethod::Paypal => "paypal",
            ProviderMethod::Klarna => "klarna",
            ProviderMethod::GiftCard => "giftcard",
            ProviderMethod::Promotion => "promotion",
        }
    }
}

impl FromStr for ProviderMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" => Ok(ProviderMethod::Card),
            "sepa_debit" => Ok(ProviderMethod::SepaDebit),
            "paypal" => Ok(ProviderMethod::Paypal),
            "klarna" => Ok(ProviderMethod::Klarna),
            "giftcard" => Ok(ProviderMethod::GiftCard),
            "promotion" => Ok(ProviderMethod::Promotion),
            _ => Err(DomainError::unknown_enum("provider method", s)),
        }
    }
}

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub payment_type: PaymentType,
    /// Cents; always positive, direction is carried by `payment_type`.
    pub amount: i64,
    pub currency: Currency,
    pub provider: PaymentProvider,
    pub provider_method: ProviderMethod,
    /// Processor-side reference (intent id, refund id, promotion code echo).
    pub external_ref: Option<String>,
    pub promotion_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row data as appended (id/timestamp assigned by the store).
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub currency: Currency,
    pub provider: PaymentProvider,
    pub provider_method: ProviderMethod,
    pub external_ref: Option<String>,
    pub promotion_code: Option<String>,
}

/// Summed ledger state for one order.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub charges: i64,
    pub refunds: i64,
}

impl LedgerTotals {
    pub fn net(&self) -> i64 {
        self.charges - self.refunds
    }

    /// The paid invariant: an order is paid iff net collected value covers
    /// the authoritative total.
    pub fn covers(&self, total: i64) -> bool {
        self.net() >= total
    }

    /// Some, but not enough, money collected.
    pub fn is_partial(&self, total: i64) -> bool {
        self.net() > 0 && !self.covers(total)
    }

    pub fn from_payments<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Self {
        let mut totals = Self::default();
        for p in payments {
            match p.payment_type {
                PaymentType::Charge => totals.charges += p.amount,
                PaymentType::Refund => totals.refunds += p.amount,
            }
        }
        totals
    }
}
