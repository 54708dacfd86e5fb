//! Persistence layer.
//!
//! Store contracts with two implementations: Postgres (production) and
//! in-memory (tests). Ledger rows, order events, and sent emails are
//! append-only at the API level; the schema backs the uniqueness guarantees
//! the domain relies on (order id primary key, one address per role,
//! external event ids, notification slots).

mod in_memory;
mod postgres;
mod traits;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use traits::{
    EventAppend, FailedOrderSnapshot, FailedOrderStore, OrderStore, PaymentLedger,
    PromotionStore, SentEmailStore, Store, StoreError,
};
