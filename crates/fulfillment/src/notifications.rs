//! Notification model and capped-send rules.
//!
//! `SentEmail` rows are the only memory of what was sent; policies here are
//! pure decisions over that history. Actual rendering and delivery are an
//! external collaborator behind the `Mailer` contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trailmark_core::{DomainError, SentEmailId};
use trailmark_orders::OrderId;

/// Total delivery-status emails allowed per order: one "delivery started"
/// plus at most two updates.
pub const DELIVERY_STATUS_CAP: u32 = 3;

/// Notification types this core dispatches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    /// Payment receipt, after a confirmed charge.
    Receipt,
    /// First delivery-status notification.
    DeliveryStarted,
    /// Subsequent delivery-status notifications, capped.
    DeliveryUpdate,
    /// Staleness-scan nudge when a dispatched order looks overdue.
    DeliveryReminder,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::Receipt => "receipt",
            EmailKind::DeliveryStarted => "delivery_started",
            EmailKind::DeliveryUpdate => "delivery_update",
            EmailKind::DeliveryReminder => "delivery_reminder",
        }
    }
}

impl FromStr for EmailKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(EmailKind::Receipt),
            "delivery_started" => Ok(EmailKind::DeliveryStarted),
            "delivery_update" => Ok(EmailKind::DeliveryUpdate),
            "delivery_reminder" => Ok(EmailKind::DeliveryReminder),
            other => Err(DomainError::unknown_enum("email kind", other)),
        }
    }
}

/// Append-only record of one notification.
///
/// `(order_id, kind, seq)` carries a uniqueness constraint; the row is
/// reserved *before* the mailer is called, which is what serializes
/// concurrent deliveries of the same webhook (insert-or-fail). `message_id`
/// is attached once the provider acknowledges the send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmail {
    pub id: SentEmailId,
    pub order_id: OrderId,
    pub kind: EmailKind,
    /// 1-based occurrence number within `(order_id, kind)`.
    pub seq: u32,
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("delivery-status email cap reached ({sent} of {cap} already sent)")]
    DeliveryCapExceeded { sent: u32, cap: u32 },
}

/// Which delivery-status email to send next for an order, given its history.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryEmailDecision {
    /// Nothing delivery-related sent yet.
    SendStarted,
    /// Started already went out; send update number `seq`.
    SendUpdate { seq: u32 },
}

/// Decide the reaction to a delivered-event notification trigger.
///
/// Pure over the sent-email history; the caller is responsible for reserving
/// the decided row before sending (see `SentEmail`).
pub fn decide_delivery_email(
    history: &[SentEmail],
) -> Result<DeliveryEmailDecision, NotificationError> {
    let started = history
        .iter()
        .any(|e| e.kind == EmailKind::DeliveryStarted);
    if !started {
        return Ok(DeliveryEmailDecision::SendStarted);
    }

    let updates = history
        .iter()
        .filter(|e| e.kind == EmailKind::DeliveryUpdate)
        .count() as u32;
    let sent = 1 + updates;
    if sent >= DELIVERY_STATUS_CAP {
        return Err(NotificationError::DeliveryCapExceeded {
            sent,
            cap: DELIVERY_STATUS_CAP,
        });
    }
    Ok(DeliveryEmailDecision::SendUpdate { seq: updates + 1 })
}

impl DeliveryEmailDecision {
    pub fn kind(&self) -> EmailKind {
        match self {
            DeliveryEmailDecision::SendStarted => EmailKind::DeliveryStarted,
            DeliveryEmailDecision::SendUpdate { .. } => EmailKind::DeliveryUpdate,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            DeliveryEmailDecision::SendStarted => 1,
            DeliveryEmailDecision::SendUpdate { seq } => *seq,
        }
    }
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// What the core asks the mail collaborator to send. Rendering lives with
/// the collaborator, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub kind: EmailKind,
    pub order_id: OrderId,
    pub tracking_link: Option<String>,
}

/// Mail delivery contract, injected at process start.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, to: &str, email: &OutboundEmail) -> Result<String, MailerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(kind: EmailKind, seq: u32) -> SentEmail {
        SentEmail {
            id: SentEmailId::new(),
            order_id: "1111-2222-3333-4444".parse().unwrap(),
            kind,
            seq,
            message_id: Some(format!("msg-{seq}")),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn first_delivered_event_sends_started() {
        assert_eq!(
            decide_delivery_email(&[]),
            Ok(DeliveryEmailDecision::SendStarted)
        );
        // Unrelated receipt history does not count.
        assert_eq!(
            decide_delivery_email(&[sent(EmailKind::Receipt, 1)]),
            Ok(DeliveryEmailDecision::SendStarted)
        );
    }

    #[test]
    fn after_started_updates_are_numbered() {
        let history = [sent(EmailKind::DeliveryStarted, 1)];
        assert_eq!(
            decide_delivery_email(&history),
            Ok(DeliveryEmailDecision::SendUpdate { seq: 1 })
        );

        let history = [
            sent(EmailKind::DeliveryStarted, 1),
            sent(EmailKind::DeliveryUpdate, 1),
        ];
        assert_eq!(
            decide_delivery_email(&history),
            Ok(DeliveryEmailDecision::SendUpdate { seq: 2 })
        );
    }

    #[test]
    fn fourth_delivery_email_is_refused() {
        let history = [
            sent(EmailKind::DeliveryStarted, 1),
            sent(EmailKind::DeliveryUpdate, 1),
            sent(EmailKind::DeliveryUpdate, 2),
        ];
        assert_eq!(
            decide_delivery_email(&history),
            Err(NotificationError::DeliveryCapExceeded { sent: 3, cap: 3 })
        );
    }

    #[test]
    fn reminder_history_does_not_consume_the_cap() {
        let history = [
            sent(EmailKind::DeliveryStarted, 1),
            sent(EmailKind::DeliveryReminder, 1),
        ];
        assert_eq!(
            decide_delivery_email(&history),
            Ok(DeliveryEmailDecision::SendUpdate { seq: 1 })
        );
    }
}
