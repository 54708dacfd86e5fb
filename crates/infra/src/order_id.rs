//! Collision-probed order id generation.
//!
//! Draws random ids and probes the store for collisions under the standard
//! retry policy. The probe and the later insert are deliberately not atomic;
//! the `orders` primary key converts the residual race into a
//! `StoreError::DuplicateOrderId` at insert time (see `checkout`).

use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use trailmark_core::{RetryError, RetryPolicy, run_with_retry};
use trailmark_orders::OrderId;

use crate::store::{OrderStore, StoreError};

#[derive(Debug, Error)]
pub enum OrderIdError {
    /// Every drawn id collided with an existing order. With a 10^16 id space
    /// this signals something badly wrong, not bad luck.
    #[error("no free order id found after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error(transparent)]
    Store(StoreError),
}

#[derive(Debug, Error)]
enum ProbeFailure {
    #[error("order id collision")]
    Collision,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct OrderIdGenerator<S> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: OrderStore> OrderIdGenerator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            policy: RetryPolicy::standard(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[instrument(skip(self), err)]
    pub async fn generate(&self) -> Result<OrderId, OrderIdError> {
        let attempt = || {
            let store = Arc::clone(&self.store);
            async move {
                let candidate = {
                    let mut rng = rand::thread_rng();
                    OrderId::random(&mut rng)
                };
                if store.order_id_exists(&candidate).await? {
                    Err(ProbeFailure::Collision)
                } else {
                    Ok(candidate)
                }
            }
        };

        run_with_retry(&self.policy, "order-id-generation", attempt)
            .await
            .map_err(|err| match err {
                RetryError::Exhausted {
                    attempts,
                    source: ProbeFailure::Collision,
                } => OrderIdError::ExhaustedRetries { attempts },
                RetryError::Exhausted {
                    source: ProbeFailure::Store(store_err),
                    ..
                } => OrderIdError::Store(store_err),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn generates_a_canonical_unused_id() {
        let store = Arc::new(InMemoryStore::new());
        let generator = OrderIdGenerator::new(store.clone());
        let id = generator.generate().await.unwrap();
        assert!(!store.order_id_exists(&id).await.unwrap());
        assert_eq!(id.as_str().len(), 19);
    }
}
