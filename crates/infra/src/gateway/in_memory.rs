//! Scriptable in-process payment gateway.
//!
//! Behaves like a platform store closely enough to drive the purchasing core
//! end to end: purchases and failures arrive as transaction updates, owned
//! purchases are replayed on restore, and anything left unfinished can be
//! redelivered as if the app had relaunched.
//!
//! Intended for tests, the simulator and local development.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use iapkit_core::{ProductId, TransactionId};
use iapkit_purchasing::{
    CatalogFetchError, FailureReason, GatewayError, OriginalTransaction, PaymentGateway, Product,
    Transaction, TransactionState, TransactionUpdates,
};

/// How the next submitted payment resolves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PaymentScript {
    #[default]
    Purchase,
    Fail(FailureReason),
    /// Park the transaction in `deferred` until [`InMemoryPaymentGateway::approve`].
    Defer,
}

#[derive(Debug, Default)]
struct LedgerSide {
    scripts: VecDeque<PaymentScript>,
    /// Latest delivered state of every transaction not yet finished.
    open: BTreeMap<TransactionId, Transaction>,
    finished: HashSet<TransactionId>,
    /// Completed purchases, replayed on restore.
    owned: Vec<OriginalTransaction>,
}

pub struct InMemoryPaymentGateway {
    catalog: RwLock<HashMap<ProductId, Product>>,
    state: Mutex<LedgerSide>,
    sender: mpsc::UnboundedSender<Vec<Transaction>>,
    receiver: Mutex<Option<TransactionUpdates>>,
    payments_allowed: AtomicBool,
    offline: AtomicBool,
    catalog_latency: RwLock<Option<Duration>>,
    catalog_requests: AtomicUsize,
    finish_calls: AtomicUsize,
    receipt: RwLock<Option<Vec<u8>>>,
}

impl Default for InMemoryPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            catalog: RwLock::new(HashMap::new()),
            state: Mutex::new(LedgerSide::default()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            payments_allowed: AtomicBool::new(true),
            offline: AtomicBool::new(false),
            catalog_latency: RwLock::new(None),
            catalog_requests: AtomicUsize::new(0),
            finish_calls: AtomicUsize::new(0),
            receipt: RwLock::new(None),
        }
    }

    pub fn with_products(self, products: impl IntoIterator<Item = Product>) -> Self {
        {
            let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
            catalog.extend(products.into_iter().map(|p| (p.id.clone(), p)));
        }
        self
    }

    /// Mark `product_id` as purchased on an earlier install, so the next
    /// restore replays it.
    pub fn with_owned(self, product_id: ProductId) -> Self {
        self.lock_state().owned.push(OriginalTransaction {
            id: TransactionId::new(),
            product_id,
        });
        self
    }

    pub fn set_payments_allowed(&self, allowed: bool) {
        self.payments_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Fail every call with `Unavailable` / `Unreachable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_catalog_latency(&self, latency: Option<Duration>) {
        *self
            .catalog_latency
            .write()
            .unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn set_receipt(&self, receipt: Option<Vec<u8>>) {
        *self.receipt.write().unwrap_or_else(PoisonError::into_inner) = receipt;
    }

    /// Queue how the next submitted payment resolves. Unscripted payments
    /// succeed.
    pub fn script_next(&self, script: PaymentScript) {
        self.lock_state().scripts.push_back(script);
    }

    /// Resolve a deferred transaction as purchased.
    pub fn approve(&self, transaction_id: TransactionId) -> Result<(), GatewayError> {
        let mut state = self.lock_state();
        let Some(tx) = state.open.get(&transaction_id) else {
            return Err(GatewayError::Rejected(format!(
                "transaction {transaction_id} is not open"
            )));
        };
        if tx.state != TransactionState::Deferred {
            return Err(GatewayError::Rejected(format!(
                "transaction {transaction_id} is {}, not deferred",
                tx.state.name()
            )));
        }

        let purchased = tx.advanced(TransactionState::Purchased);
        state.owned.push(OriginalTransaction {
            id: purchased.id,
            product_id: purchased.product_id.clone(),
        });
        state.open.insert(purchased.id, purchased.clone());
        drop(state);

        self.deliver(vec![purchased]);
        Ok(())
    }

    /// Push an arbitrary batch of updates, as the platform would.
    pub fn push(&self, batch: Vec<Transaction>) {
        {
            let mut state = self.lock_state();
            for tx in &batch {
                if !state.finished.contains(&tx.id) {
                    state.open.insert(tx.id, tx.clone());
                }
            }
        }
        self.deliver(batch);
    }

    /// Redeliver every terminal transaction that was never finished.
    ///
    /// Returns how many were redelivered.
    pub fn redeliver_unfinished(&self) -> usize {
        let batch: Vec<Transaction> = self
            .lock_state()
            .open
            .values()
            .filter(|tx| tx.state.is_terminal())
            .cloned()
            .collect();
        let count = batch.len();
        if count > 0 {
            info!(count, "redelivering unfinished transactions");
            self.deliver(batch);
        }
        count
    }

    /// Redeliver a transaction regardless of whether it was finished.
    pub fn redeliver(&self, transaction: Transaction) {
        self.deliver(vec![transaction]);
    }

    pub fn is_finished(&self, transaction_id: &TransactionId) -> bool {
        self.lock_state().finished.contains(transaction_id)
    }

    /// Transactions delivered but not finished, in id order.
    pub fn open_transactions(&self) -> Vec<Transaction> {
        self.lock_state().open.values().cloned().collect()
    }

    pub fn owned_products(&self) -> BTreeSet<ProductId> {
        self.lock_state()
            .owned
            .iter()
            .map(|o| o.product_id.clone())
            .collect()
    }

    /// Calls to `finish_transaction`, including repeated ones.
    pub fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }

    pub fn catalog_requests(&self) -> usize {
        self.catalog_requests.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, LedgerSide> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("gateway offline".into()));
        }
        Ok(())
    }

    fn deliver(&self, batch: Vec<Transaction>) {
        debug!(size = batch.len(), "delivering transaction updates");
        if self.sender.send(batch).is_err() {
            debug!("transaction update stream has no consumer; batch dropped");
        }
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    fn can_make_payments(&self) -> bool {
        self.payments_allowed.load(Ordering::SeqCst)
    }

    async fn request_products(
        &self,
        ids: &BTreeSet<ProductId>,
    ) -> Result<Vec<Product>, CatalogFetchError> {
        self.catalog_requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self
            .catalog_latency
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CatalogFetchError::Unreachable("gateway offline".into()));
        }

        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids.iter().filter_map(|id| catalog.get(id).cloned()).collect())
    }

    fn submit_payment(&self, product: &Product) -> Result<(), GatewayError> {
        self.check_online()?;
        if !self.can_make_payments() {
            return Err(GatewayError::Rejected("payments are disabled".into()));
        }

        let mut state = self.lock_state();
        let script = state.scripts.pop_front().unwrap_or_default();
        let purchasing = Transaction::new(product.id.clone(), TransactionState::Purchasing);
        let resolved = match script {
            PaymentScript::Purchase => {
                state.owned.push(OriginalTransaction {
                    id: purchasing.id,
                    product_id: product.id.clone(),
                });
                purchasing.advanced(TransactionState::Purchased)
            }
            PaymentScript::Fail(reason) => purchasing.advanced(TransactionState::Failed(reason)),
            PaymentScript::Defer => purchasing.advanced(TransactionState::Deferred),
        };
        state.open.insert(resolved.id, resolved.clone());
        drop(state);

        debug!(product_id = %product.id, transaction_id = %resolved.id, state = resolved.state.name(), "payment submitted");
        self.deliver(vec![purchasing, resolved]);
        Ok(())
    }

    fn finish_transaction(&self, transaction_id: TransactionId) -> Result<(), GatewayError> {
        self.check_online()?;
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock_state();
        state.open.remove(&transaction_id);
        state.finished.insert(transaction_id);
        Ok(())
    }

    fn restore_completed_transactions(&self) -> Result<(), GatewayError> {
        self.check_online()?;
        let batch: Vec<Transaction> = {
            let mut state = self.lock_state();
            let batch: Vec<Transaction> = state
                .owned
                .iter()
                .cloned()
                .map(Transaction::restored)
                .collect();
            for tx in &batch {
                state.open.insert(tx.id, tx.clone());
            }
            batch
        };

        info!(count = batch.len(), "replaying completed purchases");
        if !batch.is_empty() {
            self.deliver(batch);
        }
        Ok(())
    }

    fn take_transaction_updates(&self) -> Option<TransactionUpdates> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn app_receipt(&self) -> Result<Option<Vec<u8>>, GatewayError> {
        self.check_online()?;
        Ok(self
            .receipt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iapkit_purchasing::Price;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn product(id: &str) -> Product {
        Product::new(
            pid(id),
            id,
            Price {
                amount_minor: 299,
                currency: "EUR".into(),
            },
        )
    }

    #[tokio::test]
    async fn catalog_returns_only_known_ids() {
        let gateway = InMemoryPaymentGateway::new().with_products([product("premium")]);
        let ids = BTreeSet::from([pid("premium"), pid("unknown")]);

        let products = gateway.request_products(&ids).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(gateway.catalog_requests(), 1);

        gateway.set_offline(true);
        assert!(gateway.request_products(&ids).await.is_err());
    }

    #[test]
    fn submit_delivers_purchasing_then_resolution() {
        let gateway = InMemoryPaymentGateway::new().with_products([product("premium")]);
        let mut updates = gateway.take_transaction_updates().unwrap();
        assert!(gateway.take_transaction_updates().is_none());

        gateway.submit_payment(&product("premium")).unwrap();
        let batch = updates.try_recv().unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].state, TransactionState::Purchasing);
        assert_eq!(batch[1].state, TransactionState::Purchased);
        assert_eq!(batch[0].id, batch[1].id);
        assert_eq!(gateway.owned_products(), BTreeSet::from([pid("premium")]));
    }

    #[test]
    fn scripted_failure_is_not_owned() {
        let gateway = InMemoryPaymentGateway::new();
        let mut updates = gateway.take_transaction_updates().unwrap();
        gateway.script_next(PaymentScript::Fail(FailureReason::Cancelled));

        gateway.submit_payment(&product("premium")).unwrap();
        let batch = updates.try_recv().unwrap();

        assert_eq!(batch[1].state, TransactionState::Failed(FailureReason::Cancelled));
        assert!(gateway.owned_products().is_empty());
    }

    #[test]
    fn finish_is_idempotent_and_stops_redelivery() {
        let gateway = InMemoryPaymentGateway::new();
        let mut updates = gateway.take_transaction_updates().unwrap();
        gateway.submit_payment(&product("premium")).unwrap();
        let tx = updates.try_recv().unwrap().pop().unwrap();

        assert_eq!(gateway.redeliver_unfinished(), 1);
        assert_eq!(updates.try_recv().unwrap(), vec![tx.clone()]);

        gateway.finish_transaction(tx.id).unwrap();
        gateway.finish_transaction(tx.id).unwrap();
        assert!(gateway.is_finished(&tx.id));
        assert_eq!(gateway.finish_calls(), 2);
        assert_eq!(gateway.redeliver_unfinished(), 0);
    }

    #[test]
    fn restore_replays_owned_purchases_with_originals() {
        let gateway = InMemoryPaymentGateway::new().with_owned(pid("premium"));
        let mut updates = gateway.take_transaction_updates().unwrap();

        gateway.restore_completed_transactions().unwrap();
        let batch = updates.try_recv().unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].state, TransactionState::Restored);
        assert_eq!(batch[0].original.as_ref().unwrap().product_id, pid("premium"));
    }

    #[test]
    fn deferred_payment_resolves_on_approval() {
        let gateway = InMemoryPaymentGateway::new();
        let mut updates = gateway.take_transaction_updates().unwrap();
        gateway.script_next(PaymentScript::Defer);
        gateway.submit_payment(&product("premium")).unwrap();
        let deferred = updates.try_recv().unwrap().pop().unwrap();
        assert_eq!(deferred.state, TransactionState::Deferred);
        assert!(gateway.owned_products().is_empty());

        gateway.approve(deferred.id).unwrap();
        let approved = updates.try_recv().unwrap();
        assert_eq!(approved[0].state, TransactionState::Purchased);
        assert_eq!(approved[0].id, deferred.id);
        assert!(gateway.approve(deferred.id).is_err());
    }

    #[test]
    fn disabled_payments_are_rejected() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_payments_allowed(false);

        assert!(!gateway.can_make_payments());
        assert!(matches!(
            gateway.submit_payment(&product("premium")),
            Err(GatewayError::Rejected(_))
        ));
    }
}
