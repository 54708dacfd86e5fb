//! `trailmark-fulfillment` — fulfillment-partner domain.
//!
//! Partner webhook payloads and authentication, the notification model with
//! its capped-send rules, the outbound partner contract, and business-day
//! arithmetic for the staleness scan.

pub mod notifications;
pub mod partner;
pub mod staleness;
pub mod webhook;

pub use notifications::{
    DeliveryEmailDecision, EmailKind, Mailer, MailerError, NotificationError, OutboundEmail,
    SentEmail, decide_delivery_email,
};
pub use partner::{
    FulfillmentPartner, PartnerError, PartnerOrderStatus, PlaceOrderRequest, PlaceOrderResponse,
};
pub use staleness::business_days_between;
pub use webhook::{
    FulfillmentAuthError, FulfillmentEventKind, FulfillmentWebhook, WebhookAuthenticator,
};
