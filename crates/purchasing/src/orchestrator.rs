//! Public purchase API.
//!
//! [`PurchaseOrchestrator`] wires the catalog client, the transaction ledger
//! and the entitlement store around one [`PurchaseContext`]. Construct it
//! once per process with [`PurchaseOrchestrator::start`] and pass clones
//! around; there is no global instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use iapkit_core::ProductId;
use iapkit_events::{EventBus, InMemoryEventBus, Subscription};

use crate::catalog::{CatalogResult, ProductCatalogClient};
use crate::config::{OrchestratorConfig, RestorePolicy};
use crate::entitlement::{EntitlementStore, KeyValueStore};
use crate::error::{GatewayError, PurchaseError, StoreError};
use crate::gateway::PaymentGateway;
use crate::ledger::{LedgerStats, OutcomeBus, TransactionLedger};
use crate::model::Product;
use crate::outcome::PurchaseOutcome;
use crate::presentation::{LoadingIndicator, NoopLoadingIndicator};

/// Collaborators the orchestrator is built from.
#[derive(Clone)]
pub struct PurchaseContext {
    pub gateway: Arc<dyn PaymentGateway>,
    pub store: Arc<dyn KeyValueStore>,
    pub loading: Arc<dyn LoadingIndicator>,
    pub outcomes: Arc<OutcomeBus>,
}

impl PurchaseContext {
    /// Context with a headless loading indicator and an in-memory outcome bus.
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            gateway,
            store,
            loading: Arc::new(NoopLoadingIndicator),
            outcomes: Arc::new(InMemoryEventBus::<PurchaseOutcome>::new()),
        }
    }

    pub fn with_loading(mut self, loading: Arc<dyn LoadingIndicator>) -> Self {
        self.loading = loading;
        self
    }

    pub fn with_outcomes(mut self, outcomes: Arc<OutcomeBus>) -> Self {
        self.outcomes = outcomes;
        self
    }
}

struct Inner {
    config: OrchestratorConfig,
    gateway: Arc<dyn PaymentGateway>,
    loading: Arc<dyn LoadingIndicator>,
    outcomes: Arc<OutcomeBus>,
    entitlements: Arc<EntitlementStore>,
    ledger: Arc<TransactionLedger>,
    catalog: ProductCatalogClient,
    products: RwLock<HashMap<ProductId, Product>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn restore_purchases(&self) -> Result<(), GatewayError> {
        if self.config.restore_policy == RestorePolicy::ResetThenReplay {
            if let Err(err) = self.entitlements.reset(&self.config.tracked_products) {
                warn!(error = %err, "failed to persist entitlement reset before restore");
            }
        }
        info!(policy = ?self.config.restore_policy, "restoring purchases");
        self.gateway.restore_completed_transactions()
    }

    fn replace_products(&self, products: &[Product]) {
        let mut cached = self.products.write().unwrap_or_else(PoisonError::into_inner);
        *cached = products.iter().map(|p| (p.id.clone(), p.clone())).collect();
    }

    fn publish(&self, outcome: PurchaseOutcome) {
        if let Err(err) = self.outcomes.publish(outcome) {
            warn!(error = %err, "failed to publish purchase outcome");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct PurchaseOrchestrator {
    inner: Arc<Inner>,
}

impl PurchaseOrchestrator {
    /// Build the orchestrator and hydrate tracked entitlement from the store.
    ///
    /// No background work is started; call [`Self::listen`] (or use
    /// [`Self::start`]) before expecting transaction updates to be processed.
    pub fn new(ctx: PurchaseContext, config: OrchestratorConfig) -> Self {
        let entitlements = Arc::new(EntitlementStore::new(ctx.store));
        entitlements.load(&config.tracked_products);

        let ledger = Arc::new(TransactionLedger::new(
            ctx.gateway.clone(),
            entitlements.clone(),
            ctx.outcomes.clone(),
            ctx.loading.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                catalog: ProductCatalogClient::new(ctx.gateway.clone()),
                config,
                gateway: ctx.gateway,
                loading: ctx.loading,
                outcomes: ctx.outcomes,
                entitlements,
                ledger,
                products: RwLock::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// [`Self::new`], then attach the ledger to the gateway's update stream
    /// and start the reconciler if one is configured. Requires a tokio
    /// runtime.
    pub fn start(ctx: PurchaseContext, config: OrchestratorConfig) -> Self {
        let orchestrator = Self::new(ctx, config);
        orchestrator.listen();
        if let Some(interval) = orchestrator.inner.config.reconcile_interval {
            orchestrator.spawn_reconciler(interval);
        }
        orchestrator
    }

    /// Attach the ledger to the gateway's transaction-update stream.
    ///
    /// Returns `false` if the stream was already taken.
    pub fn listen(&self) -> bool {
        let Some(updates) = self.inner.gateway.take_transaction_updates() else {
            warn!("transaction update stream already taken; ledger not attached");
            return false;
        };
        let ledger = self.inner.ledger.clone();
        self.track(tokio::spawn(ledger.run(updates)));
        debug!("ledger attached to transaction updates");
        true
    }

    /// Periodically retry entitlement writes that failed to persist and
    /// transaction acknowledgements the gateway rejected.
    pub fn spawn_reconciler(&self, interval: Duration) {
        let entitlements = self.inner.entitlements.clone();
        let ledger = self.inner.ledger.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !entitlements.pending_writes().is_empty() {
                    if let Err(err) = entitlements.reconcile() {
                        warn!(error = %err, "entitlement reconciliation incomplete");
                    }
                }
                if !ledger.unacknowledged().is_empty() {
                    let acknowledged = ledger.retry_acknowledgements();
                    debug!(acknowledged, "retried transaction acknowledgements");
                }
            }
        }));
    }

    /// Stop background tasks. Outstanding gateway updates stay queued in the
    /// gateway and are redelivered on the next start.
    pub fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn can_purchase(&self) -> bool {
        self.inner.gateway.can_make_payments()
    }

    /// Fetch `ids` from the catalog.
    ///
    /// On success the products replace the cached catalog and a restore is
    /// triggered before `completion` runs. A later call supersedes this one,
    /// in which case `completion` is never invoked.
    pub fn load_catalog<F>(&self, ids: BTreeSet<ProductId>, completion: F)
    where
        F: FnOnce(CatalogResult) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.catalog.fetch_products(ids, move |result| {
            if let Ok(products) = &result {
                inner.replace_products(products);
                if let Err(err) = inner.restore_purchases() {
                    warn!(error = %err, "restore after catalog load failed");
                }
            }
            completion(result);
        });
    }

    /// [`Self::load_catalog`] for the configured tracked products.
    pub fn load_tracked_catalog<F>(&self, completion: F)
    where
        F: FnOnce(CatalogResult) + Send + 'static,
    {
        self.load_catalog(self.inner.config.tracked_products.clone(), completion);
    }

    /// Start buying `product_id`.
    ///
    /// Fails only when the product is not in the last loaded catalog. The
    /// purchase result is delivered as a [`PurchaseOutcome`].
    pub fn buy(&self, product_id: &ProductId) -> Result<(), PurchaseError> {
        let product = self
            .product(product_id)
            .ok_or_else(|| PurchaseError::ProductNotFound(product_id.clone()))?;

        self.inner.loading.show_loading();
        if let Err(err) = self.inner.gateway.submit_payment(&product) {
            warn!(product_id = %product_id, error = %err, "payment submission failed");
            self.inner.loading.hide_loading();
            self.inner.publish(PurchaseOutcome::failed(None));
        }
        Ok(())
    }

    /// Ask the gateway to replay completed purchases through the ledger.
    pub fn restore_purchases(&self) -> Result<(), GatewayError> {
        self.inner.restore_purchases()
    }

    pub fn is_purchased(&self, product_id: &ProductId) -> bool {
        self.inner.entitlements.is_purchased(product_id)
    }

    pub fn subscribe(&self) -> Subscription<PurchaseOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Product from the last successful catalog load.
    pub fn product(&self, product_id: &ProductId) -> Option<Product> {
        self.inner
            .products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(product_id)
            .cloned()
    }

    pub fn products(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self
            .inner
            .products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        products.sort_by(|a, b| a.id.cmp(&b.id));
        products
    }

    /// The app receipt, base64-encoded.
    pub fn receipt_data(&self) -> Result<Option<String>, GatewayError> {
        Ok(self.inner.gateway.app_receipt()?.map(|bytes| STANDARD.encode(bytes)))
    }

    /// Retry entitlement writes that failed to persist, now.
    pub fn reconcile_entitlements(&self) -> Result<usize, StoreError> {
        self.inner.entitlements.reconcile()
    }

    pub fn entitlements(&self) -> &EntitlementStore {
        &self.inner.entitlements
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.inner.ledger
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.inner.ledger.stats()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::entitlement::InMemoryKeyValueStore;
    use crate::ledger::tests::{CountingIndicator, RecordingGateway};
    use crate::model::{OriginalTransaction, Price, Transaction, TransactionState};
    use iapkit_core::TransactionId;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn product(id: &str) -> Product {
        Product::new(
            pid(id),
            id,
            Price {
                amount_minor: 499,
                currency: "USD".into(),
            },
        )
    }

    struct Harness {
        gateway: Arc<RecordingGateway>,
        kv: Arc<InMemoryKeyValueStore>,
        loading: Arc<CountingIndicator>,
        updates: mpsc::UnboundedSender<Vec<Transaction>>,
        orchestrator: PurchaseOrchestrator,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let gateway = Arc::new(RecordingGateway::default());
        *gateway.catalog.lock().unwrap() = vec![product("premium"), product("ad_free")];
        let (updates, rx) = mpsc::unbounded_channel();
        *gateway.updates.lock().unwrap() = Some(rx);

        let kv = Arc::new(InMemoryKeyValueStore::new());
        let loading = Arc::new(CountingIndicator::default());
        let ctx = PurchaseContext::new(gateway.clone(), kv.clone()).with_loading(loading.clone());
        let orchestrator =
            PurchaseOrchestrator::start(ctx, config.with_reconcile_interval(None));

        Harness {
            gateway,
            kv,
            loading,
            updates,
            orchestrator,
        }
    }

    fn tracked(ids: &[&str]) -> OrchestratorConfig {
        OrchestratorConfig::default().with_tracked_products(ids.iter().map(|id| pid(id)))
    }

    async fn load(orchestrator: &PurchaseOrchestrator, ids: &[&str]) -> CatalogResult {
        let (tx, rx) = oneshot::channel();
        orchestrator.load_catalog(ids.iter().map(|id| pid(id)).collect(), move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn buy_unknown_product_fails_without_touching_the_gateway() {
        let h = harness(tracked(&["premium"]));
        load(&h.orchestrator, &["premium"]).await.unwrap();

        let err = h.orchestrator.buy(&pid("unknown_id")).unwrap_err();
        assert_eq!(err, PurchaseError::ProductNotFound(pid("unknown_id")));
        assert!(h.gateway.submitted.lock().unwrap().is_empty());
        assert_eq!(h.loading.shown.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn buy_before_any_catalog_load_fails() {
        let h = harness(tracked(&["premium"]));
        assert!(matches!(
            h.orchestrator.buy(&pid("premium")),
            Err(PurchaseError::ProductNotFound(_))
        ));
    }

    #[tokio::test]
    async fn buy_submits_and_resolves_through_the_ledger() {
        let h = harness(tracked(&["premium"]));
        load(&h.orchestrator, &["premium"]).await.unwrap();
        let outcomes = h.orchestrator.subscribe();

        h.orchestrator.buy(&pid("premium")).unwrap();
        assert_eq!(*h.gateway.submitted.lock().unwrap(), vec![pid("premium")]);
        assert_eq!(h.loading.shown.load(Ordering::SeqCst), 1);

        let tx = Transaction::new(pid("premium"), TransactionState::Purchasing);
        h.updates
            .send(vec![tx.clone(), tx.advanced(TransactionState::Purchased)])
            .unwrap();
        settle().await;

        let received = outcomes.drain();
        assert_eq!(received.len(), 1);
        assert!(received[0].success);
        assert!(h.orchestrator.is_purchased(&pid("premium")));
        assert_eq!(h.loading.hidden.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn catalog_load_triggers_restore_and_replay_grants() {
        let h = harness(tracked(&["premium"]));
        let outcomes = h.orchestrator.subscribe();

        let products = load(&h.orchestrator, &["premium"]).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(h.gateway.restores.load(Ordering::SeqCst), 1);
        assert_eq!(h.orchestrator.products().len(), 1);

        let replay = Transaction::restored(OriginalTransaction {
            id: TransactionId::new(),
            product_id: pid("premium"),
        });
        h.updates.send(vec![replay]).unwrap();
        settle().await;

        assert!(h.orchestrator.is_purchased(&pid("premium")));
        let received = outcomes.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].product_id, Some(pid("premium")));
    }

    #[test]
    fn startup_hydrates_tracked_entitlement() {
        let gateway = Arc::new(RecordingGateway::default());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        kv.set_bool("premium", true).unwrap();
        kv.set_bool("ad_free", true).unwrap();

        let orchestrator = PurchaseOrchestrator::new(
            PurchaseContext::new(gateway, kv),
            tracked(&["premium"]),
        );

        assert!(orchestrator.is_purchased(&pid("premium")));
        assert!(!orchestrator.is_purchased(&pid("ad_free")));
    }

    #[tokio::test]
    async fn reset_policy_clears_tracked_entitlement_before_replay() {
        let h = harness(tracked(&["premium"]));
        h.kv.set_bool("premium", true).unwrap();
        h.orchestrator.entitlements().mark_purchased(&pid("premium")).unwrap();

        h.orchestrator.restore_purchases().unwrap();

        assert!(!h.orchestrator.is_purchased(&pid("premium")));
        assert_eq!(h.kv.get_bool("premium").unwrap(), Some(false));
        assert_eq!(h.gateway.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retain_policy_keeps_entitlement_across_restore() {
        let h = harness(
            tracked(&["premium"]).with_restore_policy(RestorePolicy::RetainUntilConfirmed),
        );
        h.orchestrator.entitlements().mark_purchased(&pid("premium")).unwrap();

        h.orchestrator.restore_purchases().unwrap();

        assert!(h.orchestrator.is_purchased(&pid("premium")));
        assert_eq!(h.gateway.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler_persists_grants_once_the_store_recovers() {
        let gateway = Arc::new(RecordingGateway::default());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orchestrator = PurchaseOrchestrator::new(
            PurchaseContext::new(gateway, kv.clone()),
            tracked(&["premium"]).with_reconcile_interval(None),
        );

        kv.set_fail_writes(true);
        assert!(orchestrator.entitlements().mark_purchased(&pid("premium")).is_err());
        orchestrator.spawn_reconciler(Duration::from_secs(30));

        // First tick fires immediately while the store is still failing.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orchestrator.entitlements().pending_writes().len(), 1);
        assert_eq!(kv.get_bool("premium").unwrap(), None);

        kv.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(orchestrator.entitlements().pending_writes().is_empty());
        assert_eq!(kv.get_bool("premium").unwrap(), Some(true));
        assert!(orchestrator.is_purchased(&pid("premium")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler_retries_rejected_acknowledgements() {
        let h = harness(tracked(&["premium"]));
        h.gateway.fail_finish.store(true, Ordering::SeqCst);
        h.updates
            .send(vec![Transaction::new(pid("premium"), TransactionState::Purchased)])
            .unwrap();
        settle().await;
        assert_eq!(h.orchestrator.ledger().unacknowledged().len(), 1);

        h.gateway.fail_finish.store(false, Ordering::SeqCst);
        h.orchestrator.spawn_reconciler(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.orchestrator.ledger().unacknowledged().is_empty());
        assert_eq!(h.gateway.finished.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_listen_is_refused() {
        let h = harness(tracked(&["premium"]));
        assert!(!h.orchestrator.listen());
    }

    #[tokio::test]
    async fn receipt_is_absent_without_gateway_receipt() {
        let h = harness(tracked(&["premium"]));
        assert_eq!(h.orchestrator.receipt_data().unwrap(), None);
        assert!(h.orchestrator.can_purchase());
    }
}
