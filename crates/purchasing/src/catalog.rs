//! Product catalog client.
//!
//! At most one catalog request is in flight. Starting a new one aborts the
//! previous request, and the previous caller's completion is dropped without
//! being invoked.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use iapkit_core::ProductId;

use crate::error::CatalogFetchError;
use crate::gateway::PaymentGateway;
use crate::model::Product;

pub type CatalogResult = Result<Vec<Product>, CatalogFetchError>;

#[derive(Debug)]
struct InFlightRequest {
    request_id: u64,
    abort: AbortHandle,
}

pub struct ProductCatalogClient {
    gateway: Arc<dyn PaymentGateway>,
    in_flight: Arc<Mutex<Option<InFlightRequest>>>,
    next_request: AtomicU64,
}

impl ProductCatalogClient {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            gateway,
            in_flight: Arc::new(Mutex::new(None)),
            next_request: AtomicU64::new(0),
        }
    }

    /// Start fetching `ids`, superseding any request still in flight.
    ///
    /// `completion` runs on the tokio runtime once the gateway answers, unless
    /// a later call superseded this one first. Must be called from within a
    /// tokio runtime.
    pub fn fetch_products<F>(&self, ids: BTreeSet<ProductId>, completion: F)
    where
        F: FnOnce(CatalogResult) + Send + 'static,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let gateway = Arc::clone(&self.gateway);
        let in_flight = Arc::clone(&self.in_flight);

        let mut slot = lock(&self.in_flight);
        if let Some(previous) = slot.take() {
            previous.abort.abort();
            debug!(superseded = previous.request_id, request_id, "superseding catalog request");
        }

        let task = tokio::spawn(async move {
            let result = gateway.request_products(&ids).await;

            {
                let mut slot = lock(&in_flight);
                match slot.as_ref() {
                    Some(current) if current.request_id == request_id => *slot = None,
                    _ => {
                        debug!(request_id, "catalog completion suppressed");
                        return;
                    }
                }
            }

            match &result {
                Ok(products) => debug!(request_id, count = products.len(), "catalog loaded"),
                Err(err) => warn!(request_id, error = %err, "catalog request failed"),
            }
            completion(result);
        });

        *slot = Some(InFlightRequest {
            request_id,
            abort: task.abort_handle(),
        });
    }

    /// Abort the in-flight request, if any, without starting a new one.
    pub fn cancel(&self) -> bool {
        match lock(&self.in_flight).take() {
            Some(previous) => {
                previous.abort.abort();
                debug!(request_id = previous.request_id, "catalog request cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }
}

impl Drop for ProductCatalogClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(slot: &Mutex<Option<InFlightRequest>>) -> MutexGuard<'_, Option<InFlightRequest>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Notify, oneshot};

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::TransactionUpdates;
    use crate::model::Price;
    use iapkit_core::TransactionId;

    /// Gateway whose catalog answers are released by the test.
    struct GatedGateway {
        release: Notify,
        fail: bool,
        requests: AtomicUsize,
    }

    impl GatedGateway {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                fail,
                requests: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentGateway for GatedGateway {
        fn can_make_payments(&self) -> bool {
            true
        }

        async fn request_products(
            &self,
            ids: &BTreeSet<ProductId>,
        ) -> Result<Vec<Product>, CatalogFetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            if self.fail {
                return Err(CatalogFetchError::Unreachable("offline".into()));
            }
            Ok(ids
                .iter()
                .map(|id| {
                    Product::new(
                        id.clone(),
                        id.resource_name(),
                        Price {
                            amount_minor: 99,
                            currency: "USD".into(),
                        },
                    )
                })
                .collect())
        }

        fn submit_payment(&self, _product: &Product) -> Result<(), GatewayError> {
            Ok(())
        }

        fn finish_transaction(&self, _transaction_id: TransactionId) -> Result<(), GatewayError> {
            Ok(())
        }

        fn restore_completed_transactions(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        fn take_transaction_updates(&self) -> Option<TransactionUpdates> {
            None
        }

        fn app_receipt(&self) -> Result<Option<Vec<u8>>, GatewayError> {
            Ok(None)
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<ProductId> {
        values.iter().map(|v| ProductId::new(*v).unwrap()).collect()
    }

    #[tokio::test]
    async fn success_delivers_products_and_clears_in_flight() {
        let gateway = GatedGateway::new(false);
        let client = ProductCatalogClient::new(gateway.clone());
        let (tx, rx) = oneshot::channel();

        client.fetch_products(ids(&["premium"]), move |result| {
            let _ = tx.send(result);
        });
        assert!(client.is_in_flight());

        tokio::task::yield_now().await;
        gateway.release.notify_one();

        let products = rx.await.unwrap().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].id.as_str(), "premium");
        assert!(!client.is_in_flight());
    }

    #[tokio::test]
    async fn failure_delivers_error_and_clears_in_flight() {
        let gateway = GatedGateway::new(true);
        let client = ProductCatalogClient::new(gateway.clone());
        let (tx, rx) = oneshot::channel();

        client.fetch_products(ids(&["premium"]), move |result| {
            let _ = tx.send(result);
        });
        tokio::task::yield_now().await;
        gateway.release.notify_one();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, CatalogFetchError::Unreachable(_)));
        assert!(!client.is_in_flight());
    }

    #[tokio::test]
    async fn superseded_request_never_completes() {
        let gateway = GatedGateway::new(false);
        let client = ProductCatalogClient::new(gateway.clone());
        let first_calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = first_calls.clone();
        client.fetch_products(ids(&["premium"]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.fetch_products(ids(&["premium", "ad_free"]), move |result| {
            let _ = tx.send(result);
        });

        // Let the surviving request reach the gateway, then release it.
        while gateway.requests.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        gateway.release.notify_waiters();

        let products = rx.await.unwrap().unwrap();
        assert_eq!(products.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert!(!client.is_in_flight());
    }

    #[tokio::test]
    async fn cancel_drops_the_pending_completion() {
        let gateway = GatedGateway::new(false);
        let client = ProductCatalogClient::new(gateway.clone());
        let (tx, rx) = oneshot::channel::<CatalogResult>();

        client.fetch_products(ids(&["premium"]), move |result| {
            let _ = tx.send(result);
        });
        assert!(client.cancel());
        assert!(!client.cancel());

        // The aborted task drops the completion, closing the channel.
        assert!(rx.await.is_err());
    }
}
