//! Postgres-backed store implementation.
//!
//! ## Error mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | PostgreSQL error code | Constraint | StoreError | Scenario |
//! |---|---|---|---|
//! | `23505` | `orders_pkey` | `DuplicateOrderId` | Lost order-id generation race |
//! | `23505` | `order_events_external_id_idx` | `DuplicateEvent` | Replayed webhook delivery |
//! | `23505` | `sent_emails_order_id_kind_seq_key` | `DuplicateEmail` | Concurrent notification reservation |
//! | `23503` | any | `OrderNotFound` | Row references a missing order |
//! | other | — | `Backend` | Connection/decode/other failures |
//!
//! All multi-row writes (order + items + addresses, settlement row groups,
//! dispatch mark + audit event) run in a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use trailmark_core::{PaymentId, SentEmailId};
use trailmark_fulfillment::{EmailKind, SentEmail};
use trailmark_orders::{
    Address, AddressKind, CartItem, Discount, EventSource, NewOrderEvent, Order, OrderDetails,
    OrderEvent, OrderId, Promotion,
};
use trailmark_payments::{LedgerTotals, NewPayment, Payment};

use super::traits::{
    EventAppend, FailedOrderSnapshot, FailedOrderStore, OrderStore, PaymentLedger, PromotionStore,
    SentEmailStore, StoreError,
};

/// Postgres-backed store.
///
/// Uses the SQLx connection pool (thread-safe, `Send + Sync`); clone freely.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::backend("connect", e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::backend("migrate", e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }
}

fn map_sqlx_error(operation: &'static str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => {
                return match db.constraint() {
                    Some("orders_pkey") => StoreError::DuplicateOrderId,
                    Some("order_events_external_id_idx") => StoreError::DuplicateEvent,
                    Some("sent_emails_order_id_kind_seq_key") => StoreError::DuplicateEmail,
                    _ => StoreError::backend(operation, db.to_string()),
                };
            }
            Some("23503") => return StoreError::OrderNotFound,
            _ => {}
        }
    }
    StoreError::backend(operation, e.to_string())
}

fn decode_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| map_sqlx_error(operation, e)
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let corrupt = |msg: String| StoreError::backend("decode order", msg);

    let id: String = row.try_get("id").map_err(decode_error("decode order"))?;
    let currency: String = row
        .try_get("currency")
        .map_err(decode_error("decode order"))?;
    Ok(Order {
        id: id.parse::<OrderId>().map_err(|e| corrupt(e.to_string()))?,
        email: row.try_get("email").map_err(decode_error("decode order"))?,
        currency: currency.parse().map_err(|e: trailmark_core::DomainError| {
            corrupt(e.to_string())
        })?,
        total: row.try_get("total").map_err(decode_error("decode order"))?,
        promotion_code: row
            .try_get("promotion_code")
            .map_err(decode_error("decode order"))?,
        created_at: row
            .try_get("created_at")
            .map_err(decode_error("decode order"))?,
        dispatched_at: row
            .try_get("dispatched_at")
            .map_err(decode_error("decode order"))?,
        partner_ref: row
            .try_get("partner_ref")
            .map_err(decode_error("decode order"))?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let corrupt = |msg: String| StoreError::backend("decode payment", msg);
    let err = decode_error("decode payment");

    let id: uuid::Uuid = row.try_get("id").map_err(&err)?;
    let order_id: String = row.try_get("order_id").map_err(&err)?;
    let payment_type: String = row.try_get("payment_type").map_err(&err)?;
    let currency: String = row.try_get("currency").map_err(&err)?;
    let provider: String = row.try_get("provider").map_err(&err)?;
    let provider_method: String = row.try_get("provider_method").map_err(&err)?;
    Ok(Payment {
        id: PaymentId::from_uuid(id),
        order_id: order_id.parse().map_err(|e: trailmark_core::DomainError| {
            corrupt(e.to_string())
        })?,
        payment_type: payment_type
            .parse()
            .map_err(|e: trailmark_core::DomainError| corrupt(e.to_string()))?,
        amount: row.try_get("amount").map_err(&err)?,
        currency: currency
            .parse()
            .map_err(|e: trailmark_core::DomainError| corrupt(e.to_string()))?,
        provider: provider
            .parse()
            .map_err(|e: trailmark_core::DomainError| corrupt(e.to_string()))?,
        provider_method: provider_method
            .parse()
            .map_err(|e: trailmark_core::DomainError| corrupt(e.to_string()))?,
        external_ref: row.try_get("external_ref").map_err(&err)?,
        promotion_code: row.try_get("promotion_code").map_err(&err)?,
        created_at: row.try_get("created_at").map_err(&err)?,
    })
}

fn event_from_row(row: &PgRow) -> Result<OrderEvent, StoreError> {
    let corrupt = |msg: String| StoreError::backend("decode event", msg);
    let err = decode_error("decode event");

    let id: uuid::Uuid = row.try_get("id").map_err(&err)?;
    let order_id: String = row.try_get("order_id").map_err(&err)?;
    let source: String = row.try_get("source").map_err(&err)?;
    Ok(OrderEvent {
        id: trailmark_core::OrderEventId::from_uuid(id),
        order_id: order_id.parse().map_err(|e: trailmark_core::DomainError| {
            corrupt(e.to_string())
        })?,
        source: source
            .parse::<EventSource>()
            .map_err(|e| corrupt(e.to_string()))?,
        event_type: row.try_get("event_type").map_err(&err)?,
        external_event_id: row.try_get("external_event_id").map_err(&err)?,
        payload: row.try_get("payload").map_err(&err)?,
        recorded_at: row.try_get("recorded_at").map_err(&err)?,
    })
}

fn email_from_row(row: &PgRow) -> Result<SentEmail, StoreError> {
    let corrupt = |msg: String| StoreError::backend("decode sent email", msg);
    let err = decode_error("decode sent email");

    let id: uuid::Uuid = row.try_get("id").map_err(&err)?;
    let order_id: String = row.try_get("order_id").map_err(&err)?;
    let kind: String = row.try_get("kind").map_err(&err)?;
    let seq: i32 = row.try_get("seq").map_err(&err)?;
    Ok(SentEmail {
        id: SentEmailId::from_uuid(id),
        order_id: order_id.parse().map_err(|e: trailmark_core::DomainError| {
            corrupt(e.to_string())
        })?,
        kind: kind
            .parse::<EmailKind>()
            .map_err(|e| corrupt(e.to_string()))?,
        seq: seq as u32,
        message_id: row.try_get("message_id").map_err(&err)?,
        sent_at: row.try_get("sent_at").map_err(&err)?,
    })
}

async fn insert_payment_tx(
    tx: &mut Transaction<'static, Postgres>,
    payment: &NewPayment,
) -> Result<Payment, StoreError> {
    let id = PaymentId::new();
    let created_at = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO payments
            (id, order_id, payment_type, amount, currency, provider,
             provider_method, external_ref, promotion_code, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(id.as_uuid())
    .bind(payment.order_id.as_str())
    .bind(payment.payment_type.as_str())
    .bind(payment.amount)
    .bind(payment.currency.code())
    .bind(payment.provider.as_str())
    .bind(payment.provider_method.as_str())
    .bind(payment.external_ref.as_deref())
    .bind(payment.promotion_code.as_deref())
    .bind(created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("append_payment", e))?;

    Ok(Payment {
        id,
        order_id: payment.order_id.clone(),
        payment_type: payment.payment_type,
        amount: payment.amount,
        currency: payment.currency,
        provider: payment.provider,
        provider_method: payment.provider_method,
        external_ref: payment.external_ref.clone(),
        promotion_code: payment.promotion_code.clone(),
        created_at,
    })
}

async fn insert_event_tx(
    tx: &mut Transaction<'static, Postgres>,
    event: &NewOrderEvent,
) -> Result<EventAppend, StoreError> {
    let id = trailmark_core::OrderEventId::new();
    let recorded_at = Utc::now();
    let inserted = sqlx::query(
        r#"
        INSERT INTO order_events
            (id, order_id, source, event_type, external_event_id, payload, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (external_event_id) WHERE external_event_id IS NOT NULL
        DO NOTHING
        RETURNING id
        "#,
    )
    .bind(id.as_uuid())
    .bind(event.order_id.as_str())
    .bind(event.source.as_str())
    .bind(&event.event_type)
    .bind(event.external_event_id.as_deref())
    .bind(&event.payload)
    .bind(recorded_at)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("append_event", e))?;

    if inserted.is_none() {
        return Ok(EventAppend::AlreadyRecorded);
    }

    Ok(EventAppend::Recorded(OrderEvent {
        id,
        order_id: event.order_id.clone(),
        source: event.source,
        event_type: event.event_type.clone(),
        external_event_id: event.external_event_id.clone(),
        payload: event.payload.clone(),
        recorded_at,
    }))
}

#[async_trait]
impl OrderStore for PostgresStore {
    #[instrument(skip(self), fields(order_id = %id))]
    async fn order_id_exists(&self, id: &OrderId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM orders WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("order_id_exists", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, details), fields(order_id = %details.order.id), err)]
    async fn insert_order(&self, details: &OrderDetails) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let order = &details.order;

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, email, currency, total, promotion_code, created_at,
                 dispatched_at, partner_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id.as_str())
        .bind(&order.email)
        .bind(order.currency.code())
        .bind(order.total)
        .bind(order.promotion_code.as_deref())
        .bind(order.created_at)
        .bind(order.dispatched_at)
        .bind(order.partner_ref.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for (position, item) in details.cart.iter().enumerate() {
            let payload = serde_json::to_value(item)
                .map_err(|e| StoreError::backend("insert_order", e.to_string()))?;
            sqlx::query(
                "INSERT INTO cart_items (order_id, position, item) VALUES ($1, $2, $3)",
            )
            .bind(order.id.as_str())
            .bind(position as i32)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order", e))?;
        }

        for address in &details.addresses {
            sqlx::query(
                r#"
                INSERT INTO addresses
                    (order_id, kind, recipient, line1, line2, city, postal_code, country)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(order.id.as_str())
            .bind(address.kind.as_str())
            .bind(&address.recipient)
            .bind(&address.line1)
            .bind(address.line2.as_deref())
            .bind(&address.city)
            .bind(&address.postal_code)
            .bind(&address.country)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_order", e))
    }

    #[instrument(skip(self), fields(order_id = %id))]
    async fn find_order(&self, id: &OrderId) -> Result<Option<OrderDetails>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_order", e))?
        else {
            return Ok(None);
        };
        let order = order_from_row(&row)?;

        let item_rows =
            sqlx::query("SELECT item FROM cart_items WHERE order_id = $1 ORDER BY position")
                .bind(id.as_str())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_order", e))?;
        let mut cart = Vec::with_capacity(item_rows.len());
        for row in &item_rows {
            let payload: serde_json::Value = row
                .try_get("item")
                .map_err(decode_error("find_order"))?;
            let item: CartItem = serde_json::from_value(payload)
                .map_err(|e| StoreError::backend("find_order", e.to_string()))?;
            cart.push(item);
        }

        let address_rows = sqlx::query("SELECT * FROM addresses WHERE order_id = $1 ORDER BY kind")
            .bind(id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_order", e))?;
        let mut addresses = Vec::with_capacity(address_rows.len());
        for row in &address_rows {
            let err = decode_error("find_order");
            let kind: String = row.try_get("kind").map_err(&err)?;
            addresses.push(Address {
                kind: match kind.as_str() {
                    "shipping" => AddressKind::Shipping,
                    "billing" => AddressKind::Billing,
                    other => {
                        return Err(StoreError::backend(
                            "find_order",
                            format!("unexpected address kind {other:?}"),
                        ));
                    }
                },
                recipient: row.try_get("recipient").map_err(&err)?,
                line1: row.try_get("line1").map_err(&err)?,
                line2: row.try_get("line2").map_err(&err)?,
                city: row.try_get("city").map_err(&err)?,
                postal_code: row.try_get("postal_code").map_err(&err)?,
                country: row.try_get("country").map_err(&err)?,
            });
        }

        Ok(Some(OrderDetails {
            order,
            cart,
            addresses,
        }))
    }

    #[instrument(skip(self))]
    async fn find_by_partner_ref(&self, partner_ref: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE partner_ref = $1")
            .bind(partner_ref)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_partner_ref", e))?;
        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(skip(self, audit), fields(order_id = %id, partner_ref), err)]
    async fn mark_dispatched(
        &self,
        id: &OrderId,
        partner_ref: &str,
        audit: NewOrderEvent,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET dispatched_at = $2, partner_ref = $3
            WHERE id = $1 AND dispatched_at IS NULL
            "#,
        )
        .bind(id.as_str())
        .bind(Utc::now())
        .bind(partner_ref)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_dispatched", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("mark_dispatched", e))?;
            return Ok(false);
        }

        insert_event_tx(&mut tx, &audit).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mark_dispatched", e))?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn dispatchable_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.* FROM orders o
            WHERE o.dispatched_at IS NULL
              AND o.created_at < $1
              AND o.total <= COALESCE((
                  SELECT SUM(p.amount)::BIGINT FROM payments p
                  WHERE p.order_id = o.id AND p.payment_type = 'charge'
              ), 0)
            ORDER BY o.created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dispatchable_orders", e))?;
        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn partially_paid_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Order, LedgerTotals)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.*, t.charges, t.refunds
            FROM orders o
            CROSS JOIN LATERAL (
                SELECT
                    COALESCE(SUM(p.amount) FILTER (WHERE p.payment_type = 'charge'), 0)::BIGINT AS charges,
                    COALESCE(SUM(p.amount) FILTER (WHERE p.payment_type = 'refund'), 0)::BIGINT AS refunds
                FROM payments p WHERE p.order_id = o.id
            ) t
            WHERE o.dispatched_at IS NULL
              AND o.created_at < $1
              AND (t.charges - t.refunds) > 0
              AND (t.charges - t.refunds) < o.total
            ORDER BY o.created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("partially_paid_orders", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let err = decode_error("partially_paid_orders");
            let totals = LedgerTotals {
                charges: row.try_get("charges").map_err(&err)?,
                refunds: row.try_get("refunds").map_err(&err)?,
            };
            out.push((order_from_row(row)?, totals));
        }
        Ok(out)
    }

    #[instrument(skip(self), err)]
    async fn delete_unpaid_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM orders o
            WHERE o.created_at < $1
              AND o.dispatched_at IS NULL
              AND NOT EXISTS (SELECT 1 FROM payments p WHERE p.order_id = o.id)
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_unpaid_before", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn overdue_candidates(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.* FROM orders o
            WHERE o.dispatched_at BETWEEN $1 AND $2
              AND NOT EXISTS (
                  SELECT 1 FROM order_events e
                  WHERE e.order_id = o.id
                    AND e.event_type IN ('USER_ORDER_DELIVERED', 'USER_ORDER_CANCELLED')
              )
              AND NOT EXISTS (
                  SELECT 1 FROM sent_emails s
                  WHERE s.order_id = o.id AND s.kind = 'delivery_reminder'
              )
            ORDER BY o.dispatched_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("overdue_candidates", e))?;
        rows.iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl PaymentLedger for PostgresStore {
    #[instrument(skip(self, payment), fields(order_id = %payment.order_id), err)]
    async fn append_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut tx = self.begin().await?;
        let row = insert_payment_tx(&mut tx, &payment).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append_payment", e))?;
        Ok(row)
    }

    #[instrument(skip(self, payments), fields(rows = payments.len()), err)]
    async fn append_payments(
        &self,
        payments: Vec<NewPayment>,
    ) -> Result<Vec<Payment>, StoreError> {
        let mut tx = self.begin().await?;
        let mut out = Vec::with_capacity(payments.len());
        for payment in &payments {
            out.push(insert_payment_tx(&mut tx, payment).await?);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append_payments", e))?;
        Ok(out)
    }

    #[instrument(skip(self, event), fields(order_id = %event.order_id, event_type = %event.event_type), err)]
    async fn append_event(&self, event: NewOrderEvent) -> Result<EventAppend, StoreError> {
        let mut tx = self.begin().await?;
        let appended = insert_event_tx(&mut tx, &event).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append_event", e))?;
        Ok(appended)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn ledger_totals(&self, order_id: &OrderId) -> Result<LedgerTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE payment_type = 'charge'), 0)::BIGINT AS charges,
                COALESCE(SUM(amount) FILTER (WHERE payment_type = 'refund'), 0)::BIGINT AS refunds
            FROM payments WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_totals", e))?;

        let err = decode_error("ledger_totals");
        Ok(LedgerTotals {
            charges: row.try_get("charges").map_err(&err)?,
            refunds: row.try_get("refunds").map_err(&err)?,
        })
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn payments_for(&self, order_id: &OrderId) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query("SELECT * FROM payments WHERE order_id = $1 ORDER BY created_at")
            .bind(order_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("payments_for", e))?;
        rows.iter().map(payment_from_row).collect()
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn events_for(&self, order_id: &OrderId) -> Result<Vec<OrderEvent>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM order_events WHERE order_id = $1 ORDER BY recorded_at")
                .bind(order_id.as_str())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("events_for", e))?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl PromotionStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_promotion(&self, code: &str) -> Result<Option<Promotion>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM promotions WHERE code = $1")
            .bind(code)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_promotion", e))?
        else {
            return Ok(None);
        };

        let err = decode_error("find_promotion");
        let discount_kind: String = row.try_get("discount_kind").map_err(&err)?;
        let discount_value: i64 = row.try_get("discount_value").map_err(&err)?;
        let discount = match discount_kind.as_str() {
            "fixed" => Discount::fixed(discount_value),
            "percentage" => {
                let percent = u8::try_from(discount_value).map_err(|_| {
                    StoreError::backend(
                        "find_promotion",
                        format!("percentage out of range: {discount_value}"),
                    )
                })?;
                Discount::percentage(percent)
            }
            other => {
                return Err(StoreError::backend(
                    "find_promotion",
                    format!("unexpected discount kind {other:?}"),
                ));
            }
        }
        .map_err(|e| StoreError::backend("find_promotion", e.to_string()))?;

        Ok(Some(Promotion {
            code: row.try_get("code").map_err(&err)?,
            discount,
            expires_at: row.try_get("expires_at").map_err(&err)?,
            gift_card: row.try_get("gift_card").map_err(&err)?,
        }))
    }
}

#[async_trait]
impl SentEmailStore for PostgresStore {
    #[instrument(skip(self), fields(order_id = %order_id, kind = kind.as_str(), seq), err)]
    async fn reserve_email(
        &self,
        order_id: &OrderId,
        kind: EmailKind,
        seq: u32,
    ) -> Result<SentEmail, StoreError> {
        let id = SentEmailId::new();
        let sent_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO sent_emails (id, order_id, kind, seq, message_id, sent_at)
            VALUES ($1, $2, $3, $4, NULL, $5)
            "#,
        )
        .bind(id.as_uuid())
        .bind(order_id.as_str())
        .bind(kind.as_str())
        .bind(seq as i32)
        .bind(sent_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reserve_email", e))?;

        Ok(SentEmail {
            id,
            order_id: order_id.clone(),
            kind,
            seq,
            message_id: None,
            sent_at,
        })
    }

    async fn attach_message_id(
        &self,
        id: SentEmailId,
        message_id: &str,
    ) -> Result<(), StoreError> {
        // The single permitted mutation: filling in the provider message id
        // on an already-reserved row.
        sqlx::query("UPDATE sent_emails SET message_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(message_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("attach_message_id", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn email_history(&self, order_id: &OrderId) -> Result<Vec<SentEmail>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sent_emails WHERE order_id = $1 ORDER BY sent_at")
            .bind(order_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("email_history", e))?;
        rows.iter().map(email_from_row).collect()
    }
}

#[async_trait]
impl FailedOrderStore for PostgresStore {
    #[instrument(skip(self, snapshot), err)]
    async fn record_failed_order(
        &self,
        snapshot: &FailedOrderSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO failed_orders (id, email, payload, error, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&snapshot.email)
        .bind(&snapshot.payload)
        .bind(&snapshot.error)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failed_order", e))?;
        Ok(())
    }
}
