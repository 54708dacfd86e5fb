//! `trailmark-payments` — payment ledger model + processor event handling.
//!
//! The ledger row model with its closed enumerations, paid-invariant
//! arithmetic, the payment-processor webhook envelope/state machine, the
//! processor signature scheme, and the outbound payment-intent contract.

pub mod intent;
pub mod ledger;
pub mod signature;
pub mod webhook;

pub use intent::{CreateIntentRequest, CreatedIntent, IntentError, PaymentIntents};
pub use ledger::{LedgerTotals, NewPayment, Payment, PaymentProvider, PaymentType, ProviderMethod};
pub use signature::{SignatureError, SignatureVerifier};
pub use webhook::{
    ChargeObject, PaymentEventError, PaymentEventKind, PaymentIntentObject, RefundList,
    RefundObject, WebhookEnvelope,
};
