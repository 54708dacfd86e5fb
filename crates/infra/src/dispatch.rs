//! Production dispatch scheduler.
//!
//! A periodic batch job (invocation mechanism lives with the binary) with
//! three passes — dispatch, partial-payment audit, unpaid cleanup — plus the
//! staleness scan for dispatched orders with no terminal delivery event.
//! Dispatch is strictly sequential: it bounds concurrent load on the partner
//! and keeps one order's failure from blocking its siblings.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use chrono::{DateTime, Duration, Utc};
use trailmark_fulfillment::{
    EmailKind, FulfillmentPartner, Mailer, OutboundEmail, PartnerOrderStatus, PlaceOrderRequest,
    business_days_between,
};
use trailmark_orders::{AddressKind, EventSource, NewOrderEvent, Order, OrderDetails};

use crate::store::{Store, StoreError};

/// Staleness scan only considers orders dispatched within this many business
/// days.
pub const STALENESS_WINDOW_MIN_DAYS: i64 = 1;
pub const STALENESS_WINDOW_MAX_DAYS: i64 = 15;

/// Event type recorded with the raw request/response when an order is handed
/// to the partner.
pub const DISPATCH_AUDIT_EVENT: &str = "production.dispatched";

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Orders younger than this are never dispatched (cancellation window).
    pub grace_period: Duration,
    /// Unpaid orders older than this are hard-deleted.
    pub retention: Duration,
    /// Business days after dispatch before an order without a terminal
    /// delivery event is considered late.
    pub staleness_threshold_days: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::hours(1),
            retention: Duration::days(30),
            staleness_threshold_days: 5,
        }
    }
}

/// What one run did, for job logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchRunReport {
    pub dispatched: u32,
    pub dispatch_failures: u32,
    pub partially_paid: u32,
    pub deleted_unpaid: u64,
    pub late_flagged: u32,
    pub healed: u32,
}

pub struct ProductionDispatchScheduler<S> {
    store: Arc<S>,
    partner: Arc<dyn FulfillmentPartner>,
    mailer: Arc<dyn Mailer>,
    config: DispatchConfig,
}

impl<S: Store> ProductionDispatchScheduler<S> {
    pub fn new(
        store: Arc<S>,
        partner: Arc<dyn FulfillmentPartner>,
        mailer: Arc<dyn Mailer>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            partner,
            mailer,
            config,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn run_once(&self) -> Result<DispatchRunReport, StoreError> {
        let now = Utc::now();
        let mut report = DispatchRunReport::default();

        self.dispatch_pass(now, &mut report).await?;
        self.partial_payment_audit(now, &mut report).await?;
        self.unpaid_cleanup(now, &mut report).await?;
        self.staleness_scan(now, &mut report).await?;

        info!(?report, "dispatch run finished");
        Ok(report)
    }

    async fn dispatch_pass(
        &self,
        now: DateTime<Utc>,
        report: &mut DispatchRunReport,
    ) -> Result<(), StoreError> {
        let cutoff = now - self.config.grace_period;
        let candidates = self.store.dispatchable_orders(cutoff).await?;

        // One order at a time; a failure is alerted and the loop moves on.
        for order in candidates {
            let Some(details) = self.store.find_order(&order.id).await? else {
                continue;
            };
            if let Err(err) = self.dispatch_one(&details).await {
                error!(
                    business_critical = true,
                    order_id = %order.id,
                    error = %err,
                    "order dispatch failed"
                );
                report.dispatch_failures += 1;
            } else {
                report.dispatched += 1;
            }
        }
        Ok(())
    }

    async fn dispatch_one(&self, details: &OrderDetails) -> Result<(), DispatchOneError> {
        let order = &details.order;

        // Declared geometry must be self-consistent; reject, never
        // auto-correct.
        for item in &details.cart {
            if let Some(geometry) = item.geometry() {
                geometry.validate().map_err(DispatchOneError::Geometry)?;
            }
        }

        let request = PlaceOrderRequest {
            order: order.clone(),
            cart: details.cart.clone(),
            shipping: details
                .addresses
                .iter()
                .find(|a| a.kind == AddressKind::Shipping)
                .cloned(),
        };
        let response = self
            .partner
            .place_order(&request)
            .await
            .map_err(DispatchOneError::Partner)?;

        let audit = NewOrderEvent {
            order_id: order.id.clone(),
            source: EventSource::Internal,
            event_type: DISPATCH_AUDIT_EVENT.to_string(),
            external_event_id: None,
            payload: serde_json::json!({
                "request": request,
                "response": response.raw,
            }),
        };
        let marked = self
            .store
            .mark_dispatched(&order.id, &response.external_id, audit)
            .await
            .map_err(DispatchOneError::Store)?;
        if !marked {
            // The selection query should have excluded it; a concurrent run
            // got there first.
            warn!(order_id = %order.id, "order was already dispatched, not re-marked");
            return Ok(());
        }

        info!(
            order_id = %order.id,
            partner_ref = %response.external_id,
            "order dispatched to production"
        );
        Ok(())
    }

    /// Read-only: report underpaid orders past the grace period.
    async fn partial_payment_audit(
        &self,
        now: DateTime<Utc>,
        report: &mut DispatchRunReport,
    ) -> Result<(), StoreError> {
        let cutoff = now - self.config.grace_period;
        for (order, totals) in self.store.partially_paid_orders(cutoff).await? {
            warn!(
                alert = true,
                order_id = %order.id,
                collected = totals.net(),
                total = order.total,
                "order past grace period with insufficient payment"
            );
            report.partially_paid += 1;
        }
        Ok(())
    }

    async fn unpaid_cleanup(
        &self,
        now: DateTime<Utc>,
        report: &mut DispatchRunReport,
    ) -> Result<(), StoreError> {
        let cutoff = now - self.config.retention;
        let deleted = self.store.delete_unpaid_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "removed unpaid orders past retention");
        }
        report.deleted_unpaid = deleted;
        Ok(())
    }

    /// Flag dispatched orders overdue for a terminal delivery status —
    /// after a live partner check, so a missed webhook is healed rather than
    /// misreported as lateness.
    async fn staleness_scan(
        &self,
        now: DateTime<Utc>,
        report: &mut DispatchRunReport,
    ) -> Result<(), StoreError> {
        // Calendar over-approximation of the business-day window; the exact
        // filter runs below.
        let from = now - Duration::days(STALENESS_WINDOW_MAX_DAYS + 10);
        let to = now - Duration::days(STALENESS_WINDOW_MIN_DAYS);

        for order in self.store.overdue_candidates(from, to).await? {
            let Some(dispatched_at) = order.dispatched_at else {
                continue;
            };
            let elapsed = business_days_between(dispatched_at, now);
            if elapsed < STALENESS_WINDOW_MIN_DAYS
                || elapsed > STALENESS_WINDOW_MAX_DAYS
                || elapsed < self.config.staleness_threshold_days
            {
                continue;
            }
            let Some(partner_ref) = order.partner_ref.clone() else {
                continue;
            };

            match self.partner.order_status(&partner_ref).await {
                Ok(PartnerOrderStatus::Delivered) => {
                    self.heal_missed_webhook(&order, "USER_ORDER_DELIVERED").await?;
                    report.healed += 1;
                }
                Ok(PartnerOrderStatus::Cancelled) => {
                    self.heal_missed_webhook(&order, "USER_ORDER_CANCELLED").await?;
                    report.healed += 1;
                }
                Ok(status) => {
                    error!(
                        alert = true,
                        order_id = %order.id,
                        partner_ref = %partner_ref,
                        ?status,
                        business_days_since_dispatch = elapsed,
                        "dispatched order is genuinely late"
                    );
                    self.send_reminder(&order).await;
                    report.late_flagged += 1;
                }
                Err(err) => {
                    warn!(
                        order_id = %order.id,
                        error = %err,
                        "partner status check failed, will retry next run"
                    );
                }
            }
        }
        Ok(())
    }

    /// The partner reached a terminal state but the webhook never arrived;
    /// append the missing event so derived state catches up.
    async fn heal_missed_webhook(
        &self,
        order: &Order,
        event_type: &str,
    ) -> Result<(), StoreError> {
        info!(order_id = %order.id, event_type, "recording terminal status found by live poll");
        self.store
            .append_event(NewOrderEvent {
                order_id: order.id.clone(),
                source: EventSource::PartnerPoll,
                event_type: event_type.to_string(),
                external_event_id: None,
                payload: serde_json::json!({ "polled_at": Utc::now() }),
            })
            .await?;
        Ok(())
    }

    async fn send_reminder(&self, order: &Order) {
        let reserved = match self
            .store
            .reserve_email(&order.id, EmailKind::DeliveryReminder, 1)
            .await
        {
            Ok(reserved) => reserved,
            Err(StoreError::DuplicateEmail) => {
                info!(order_id = %order.id, "delivery reminder already sent");
                return;
            }
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "could not reserve delivery reminder");
                return;
            }
        };

        let email = OutboundEmail {
            kind: EmailKind::DeliveryReminder,
            order_id: order.id.clone(),
            tracking_link: None,
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
                warn!(order_id = %order.id, error = %err, "delivery reminder send failed");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DispatchOneError {
    #[error(transparent)]
    Geometry(trailmark_core::DomainError),
    #[error(transparent)]
    Partner(trailmark_fulfillment::PartnerError),
    #[error(transparent)]
    Store(StoreError),
}
