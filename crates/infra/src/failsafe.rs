//! Last-resort capture of orders that failed mid-transaction.
//!
//! Runs off the checkout critical path with its own retry policy. When even
//! the snapshot write keeps failing, it degrades to logging only the
//! customer's contact email at permanent-alert severity. Payment details are
//! never logged; losing the full snapshot is the accepted cost of not
//! blocking customer-facing failure reporting.

use std::sync::Arc;
use tracing::{error, info};

use trailmark_core::{RetryError, RetryPolicy, run_with_retry};

use crate::store::{FailedOrderSnapshot, FailedOrderStore};

pub struct FailSafeRecorder<S> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S> Clone for FailSafeRecorder<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy,
        }
    }
}

impl<S: FailedOrderStore> FailSafeRecorder<S> {
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

    /// Persist the snapshot, retrying with capped backoff. Never fails the
    /// caller.
    pub async fn record(&self, snapshot: FailedOrderSnapshot) {
        let outcome = run_with_retry(&self.policy, "failed-order-snapshot", || {
            let store = Arc::clone(&self.store);
            let snapshot = snapshot.clone();
            async move { store.record_failed_order(&snapshot).await }
        })
        .await;

        match outcome {
            Ok(()) => {
                info!(customer_email = %snapshot.email, "captured failed-order snapshot");
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                error!(
                    alert = "permanent",
                    customer_email = %snapshot.email,
                    attempts,
                    error = %source,
                    "failed-order snapshot could not be persisted; full order data lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::{FailedOrderStore, InMemoryStore, StoreError};
    use async_trait::async_trait;

    #[tokio::test]
    async fn snapshot_is_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = FailSafeRecorder::new(store.clone());
        recorder
            .record(FailedOrderSnapshot {
                email: "customer@example.com".to_string(),
                payload: serde_json::json!({ "order": "1234-5678-9012-3456" }),
                error: "connection reset".to_string(),
            })
            .await;

        let captured = store.failed_orders();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].email, "customer@example.com");
    }

    struct AlwaysFails;

    #[async_trait]
    impl FailedOrderStore for AlwaysFails {
        async fn record_failed_order(
            &self,
            _snapshot: &FailedOrderSnapshot,
        ) -> Result<(), StoreError> {
            Err(StoreError::backend("record_failed_order", "down"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_does_not_propagate() {
        let recorder = FailSafeRecorder::new(Arc::new(AlwaysFails)).with_policy(
            trailmark_core::RetryPolicy::exponential(
                3,
                Duration::from_millis(1),
                Duration::from_millis(2),
            ),
        );
        // Must complete without panicking or returning an error.
        recorder
            .record(FailedOrderSnapshot {
                email: "customer@example.com".to_string(),
                payload: serde_json::json!({}),
                error: "boom".to_string(),
            })
            .await;
    }
}
