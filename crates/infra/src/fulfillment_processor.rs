//! Fulfillment-partner webhook ingestion.
//!
//! Authenticates the raw payload, event-sources accepted callbacks into the
//! order event log, and reacts per event kind. Orders unknown to us are a
//! recoverable condition (the partner also serves orders created outside
//! this system), not an error.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use trailmark_fulfillment::{
    FulfillmentAuthError, FulfillmentEventKind, FulfillmentWebhook, Mailer, NotificationError,
    OutboundEmail, WebhookAuthenticator, decide_delivery_email,
};
use trailmark_orders::{EventSource, NewOrderEvent, Order, OrderId};

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum FulfillmentWebhookError {
    #[error(transparent)]
    Auth(#[from] FulfillmentAuthError),

    #[error("webhook payload is not valid JSON: {0}")]
    Malformed(String),

    /// A delivered event must carry a tracking link; its absence is a
    /// partner contract violation, not something to paper over.
    #[error("delivered event for order {order_id} has no tracking link")]
    MissingTrackingLink { order_id: OrderId },

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed,
    /// The partner's order number did not resolve here; logged and dropped.
    UnknownOrder,
}

pub struct FulfillmentWebhookProcessor<S> {
    store: Arc<S>,
    authenticator: WebhookAuthenticator,
    mailer: Arc<dyn Mailer>,
}

impl<S: Store> FulfillmentWebhookProcessor<S> {
    pub fn new(
        store: Arc<S>,
        authenticator: WebhookAuthenticator,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            store,
            authenticator,
            mailer,
        }
    }

    /// Ingest one raw delivery with its signature header.
    #[instrument(skip(self, raw, signature), err)]
    pub async fn ingest(
        &self,
        raw: &[u8],
        signature: &str,
    ) -> Result<IngestOutcome, FulfillmentWebhookError> {
        self.authenticator.verify(raw, signature)?;

        let hook = FulfillmentWebhook::parse(raw)
            .map_err(|e| FulfillmentWebhookError::Malformed(e.to_string()))?;
        let kind = hook.kind();

        let order_number = &hook.user_order.order_number;
        let Some(order) = self.store.find_by_partner_ref(order_number).await? else {
            info!(
                partner_order = %order_number,
                event_type = %hook.event_type,
                "partner event for an order not known here, dropping"
            );
            return Ok(IngestOutcome::UnknownOrder);
        };

        // Event-source before reacting; delivery history is derived from
        // this log, never stored denormalized.
        let payload: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| FulfillmentWebhookError::Malformed(e.to_string()))?;
        self.store
            .append_event(NewOrderEvent {
                order_id: order.id.clone(),
                source: EventSource::FulfillmentPartner,
                event_type: hook.event_type.clone(),
                external_event_id: None,
                payload,
            })
            .await?;

        match kind {
            FulfillmentEventKind::OrderCreated => {
                info!(order_id = %order.id, "partner accepted the order");
            }
            FulfillmentEventKind::OrderCancelled => {
                info!(order_id = %order.id, "partner cancelled the order");
            }
            FulfillmentEventKind::OrderDelivered => {
                let tracking_link = hook
                    .tracking_link()
                    .ok_or_else(|| FulfillmentWebhookError::MissingTrackingLink {
                        order_id: order.id.clone(),
                    })?
                    .to_string();
                self.notify_delivery(&order, tracking_link).await?;
            }
            FulfillmentEventKind::Other(event_type) => {
                warn!(order_id = %order.id, %event_type, "unhandled partner event type");
            }
        }

        Ok(IngestOutcome::Processed)
    }

    /// Capped delivery-status notification. The `(order, kind, seq)`
    /// reservation happens before the send; a concurrent delivery of the
    /// same webhook loses the insert and sends nothing.
    async fn notify_delivery(
        &self,
        order: &Order,
        tracking_link: String,
    ) -> Result<(), FulfillmentWebhookError> {
        let history = self.store.email_history(&order.id).await?;
        let decision = decide_delivery_email(&history)?;

        let reserved = match self
            .store
            .reserve_email(&order.id, decision.kind(), decision.seq())
            .await
        {
            Ok(reserved) => reserved,
            Err(StoreError::DuplicateEmail) => {
                warn!(
                    order_id = %order.id,
                    kind = decision.kind().as_str(),
                    seq = decision.seq(),
                    "concurrent delivery notification won the reservation, skipping send"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let email = OutboundEmail {
            kind: decision.kind(),
            order_id: order.id.clone(),
            tracking_link: Some(tracking_link),
        };
        match self.mailer.send(&order.email, &email).await {
            Ok(message_id) => {
                if let Err(err) = self
                    .store
                    .attach_message_id(reserved.id, &message_id)
                    .await
                {
                    warn!(order_id = %order.id, error = %err, "could not attach message id");
                }
            }
            Err(err) => {
                warn!(
                    order_id = %order.id,
                    error = %err,
                    "delivery notification send failed; slot stays consumed"
                );
            }
        }
        Ok(())
    }
}
