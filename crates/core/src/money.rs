//! Monetary values.
//!
//! All amounts are integers in the smallest currency unit (cents). Floating
//! point never touches money anywhere in this workspace.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Currencies the storefront sells in (closed set).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Usd,
    Gbp,
    Sek,
    Dkk,
    Nok,
}

impl Currency {
    /// Upper-case ISO 4217 code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
            Currency::Sek => "SEK",
            Currency::Dkk => "DKK",
            Currency::Nok => "NOK",
        }
    }

    /// Lower-case code as the payment processor reports it on the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Currency::Eur => "eur",
            Currency::Usd => "usd",
            Currency::Gbp => "gbp",
            Currency::Sek => "sek",
            Currency::Dkk => "dkk",
            Currency::Nok => "nok",
        }
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    /// Case-insensitive: the processor reports `"eur"` where checkout says `"EUR"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EUR" => Ok(Currency::Eur),
            "USD" => Ok(Currency::Usd),
            "GBP" => Ok(Currency::Gbp),
            "SEK" => Ok(Currency::Sek),
            "DKK" => Ok(Currency::Dkk),
            "NOK" => Ok(Currency::Nok),
            _ => Err(DomainError::unknown_enum("currency", s)),
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Amount in smallest currency unit + currency.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Cents (or equivalent smallest unit).
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: 0,
            currency,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
