//! Transaction ledger: the purchase state machine.
//!
//! The ledger is the single consumer of the gateway's transaction-update
//! stream. For every update it decides what the transaction means for
//! entitlement, publishes at most one [`PurchaseOutcome`], and finishes the
//! transaction with the gateway.
//!
//! ```text
//! purchasing ──► purchased ──► grant + success outcome + finish
//!     │   └────► failed ─────► failure outcome + finish
//!     └───────► deferred ────► (wait)
//! restore ────► restored ────► grant original product + success outcome + finish
//! ```
//!
//! Updates are applied one at a time, in delivery order, under a single lock.
//! A transaction id that was already finished is ignored if the gateway
//! delivers it again. If the gateway rejected the acknowledgement, the
//! redelivery retries it instead.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use iapkit_core::{ProductId, TransactionId};
use iapkit_events::{BusError, Event, EventBus};

use crate::entitlement::EntitlementStore;
use crate::error::{PurchaseError, RestoreNoopWarning};
use crate::gateway::{PaymentGateway, TransactionUpdates};
use crate::model::{Transaction, TransactionState};
use crate::outcome::PurchaseOutcome;
use crate::presentation::LoadingIndicator;

/// Outcome channel the ledger publishes on.
pub type OutcomeBus = dyn EventBus<PurchaseOutcome, Error = BusError>;

/// What the ledger did with one transaction update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Entitlement granted, success published, transaction finished.
    Purchased(ProductId),
    /// Failure published, transaction finished.
    Failed { cancelled: bool },
    /// Original product re-granted, success published, transaction finished.
    Restored(ProductId),
    /// Restore without an original reference. Nothing is granted or
    /// published, but the transaction is still finished so the gateway stops
    /// redelivering it on every launch.
    RestoreIgnored,
    /// `purchasing` / `deferred`: left open.
    Pending,
    /// Unrecognized state: loading cleared, nothing else.
    Unrecognized,
    /// Already processed earlier; ignored apart from retrying a failed
    /// acknowledgement.
    Duplicate,
}

/// Running counters, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub processed: u64,
    pub purchased: u64,
    pub failed: u64,
    pub restored: u64,
    pub restore_ignored: u64,
    pub pending: u64,
    pub unrecognized: u64,
    pub duplicates: u64,
    /// `finish_transaction` calls that failed, retries included.
    pub finish_failures: u64,
}

/// Acknowledged ids remembered for redelivery detection.
pub const DEFAULT_FINISHED_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct LedgerState {
    /// Processed terminal transactions, acknowledged or not.
    finished: HashSet<TransactionId>,
    /// Acknowledged ids in acknowledgement order, oldest first.
    acknowledged: VecDeque<TransactionId>,
    /// Processed ids whose `finish_transaction` call failed.
    unacknowledged: HashSet<TransactionId>,
    stats: LedgerStats,
}

pub struct TransactionLedger {
    gateway: Arc<dyn PaymentGateway>,
    entitlements: Arc<EntitlementStore>,
    outcomes: Arc<OutcomeBus>,
    loading: Arc<dyn LoadingIndicator>,
    finished_capacity: usize,
    state: Mutex<LedgerState>,
}

impl TransactionLedger {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        entitlements: Arc<EntitlementStore>,
        outcomes: Arc<OutcomeBus>,
        loading: Arc<dyn LoadingIndicator>,
    ) -> Self {
        Self {
            gateway,
            entitlements,
            outcomes,
            loading,
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Bound how many acknowledged ids are remembered. The oldest are
    /// forgotten first; ids still awaiting acknowledgement are never
    /// forgotten.
    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity.max(1);
        self
    }

    /// Consume the gateway's update stream until it closes.
    pub async fn run(self: Arc<Self>, mut updates: TransactionUpdates) {
        while let Some(batch) = updates.recv().await {
            self.process_batch(&batch);
        }
        debug!("transaction update stream closed");
    }

    /// Apply a batch of updates in order.
    pub fn process_batch(&self, batch: &[Transaction]) -> Vec<Disposition> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        batch.iter().map(|tx| self.apply(&mut state, tx)).collect()
    }

    /// Apply a single update.
    pub fn process(&self, transaction: &Transaction) -> Disposition {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply(&mut state, transaction)
    }

    pub fn is_finished(&self, transaction_id: &TransactionId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .contains(transaction_id)
    }

    /// Processed transactions the gateway has not accepted an
    /// acknowledgement for yet.
    pub fn unacknowledged(&self) -> Vec<TransactionId> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<TransactionId> = state.unacknowledged.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Retry every failed acknowledgement. Returns how many went through.
    pub fn retry_acknowledgements(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let pending: Vec<TransactionId> = state.unacknowledged.iter().copied().collect();
        let mut acknowledged = 0;
        for transaction_id in pending {
            if self.acknowledge(&mut state, transaction_id) {
                acknowledged += 1;
            }
        }
        acknowledged
    }

    pub fn stats(&self) -> LedgerStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }

    fn apply(&self, state: &mut LedgerState, tx: &Transaction) -> Disposition {
        if state.finished.contains(&tx.id) {
            debug!(transaction_id = %tx.id, state = tx.state.name(), "ignoring redelivered transaction");
            state.stats.duplicates += 1;
            if state.unacknowledged.contains(&tx.id) {
                self.acknowledge(state, tx.id);
            }
            return Disposition::Duplicate;
        }
        state.stats.processed += 1;

        match &tx.state {
            TransactionState::Purchasing | TransactionState::Deferred => {
                debug!(transaction_id = %tx.id, state = tx.state.name(), "transaction pending");
                state.stats.pending += 1;
                Disposition::Pending
            }
            TransactionState::Purchased => {
                info!(transaction_id = %tx.id, product_id = %tx.product_id, "purchase completed");
                self.grant(&tx.product_id);
                self.publish(PurchaseOutcome::succeeded(tx.product_id.clone(), tx.id));
                self.loading.hide_loading();
                self.finish(state, tx.id);
                state.stats.purchased += 1;
                Disposition::Purchased(tx.product_id.clone())
            }
            TransactionState::Failed(reason) => {
                let err = PurchaseError::from(reason);
                if err.is_cancellation() {
                    debug!(transaction_id = %tx.id, "purchase cancelled by user");
                } else {
                    warn!(transaction_id = %tx.id, product_id = %tx.product_id, error = %err, "purchase failed");
                }
                self.publish(PurchaseOutcome::failed(Some(tx.id)));
                self.loading.hide_loading();
                self.finish(state, tx.id);
                state.stats.failed += 1;
                Disposition::Failed {
                    cancelled: err.is_cancellation(),
                }
            }
            TransactionState::Restored => match &tx.original {
                Some(original) => {
                    info!(
                        transaction_id = %tx.id,
                        original_id = %original.id,
                        product_id = %original.product_id,
                        "purchase restored"
                    );
                    self.grant(&original.product_id);
                    self.publish(PurchaseOutcome::succeeded(original.product_id.clone(), tx.id));
                    self.finish(state, tx.id);
                    state.stats.restored += 1;
                    Disposition::Restored(original.product_id.clone())
                }
                None => {
                    let warning = RestoreNoopWarning {
                        transaction_id: tx.id,
                    };
                    warn!(%warning, "restore ignored");
                    self.finish(state, tx.id);
                    state.stats.restore_ignored += 1;
                    Disposition::RestoreIgnored
                }
            },
            TransactionState::Unknown(raw) => {
                debug!(transaction_id = %tx.id, state = %raw, "unrecognized transaction state");
                self.loading.hide_loading();
                state.stats.unrecognized += 1;
                Disposition::Unrecognized
            }
        }
    }

    fn grant(&self, product_id: &ProductId) {
        // A failed write is already queued for reconciliation by the store;
        // the in-memory grant stands.
        let _ = self.entitlements.mark_purchased(product_id);
    }

    fn publish(&self, outcome: PurchaseOutcome) {
        debug!(
            event_type = outcome.event_type(),
            version = outcome.version(),
            occurred_at = %outcome.occurred_at(),
            "publishing purchase outcome"
        );
        if let Err(err) = self.outcomes.publish(outcome) {
            warn!(error = %err, "failed to publish purchase outcome");
        }
    }

    fn finish(&self, state: &mut LedgerState, transaction_id: TransactionId) {
        if !state.finished.insert(transaction_id) {
            return;
        }
        state.unacknowledged.insert(transaction_id);
        self.acknowledge(state, transaction_id);
    }

    /// Call `finish_transaction` for a processed id. On failure the id stays
    /// unacknowledged and the next redelivery retries it.
    fn acknowledge(&self, state: &mut LedgerState, transaction_id: TransactionId) -> bool {
        if let Err(err) = self.gateway.finish_transaction(transaction_id) {
            warn!(%transaction_id, error = %err, "failed to finish transaction; retrying on redelivery");
            state.stats.finish_failures += 1;
            return false;
        }

        state.unacknowledged.remove(&transaction_id);
        state.acknowledged.push_back(transaction_id);
        while state.acknowledged.len() > self.finished_capacity {
            if let Some(oldest) = state.acknowledged.pop_front() {
                state.finished.remove(&oldest);
            }
        }
        true
    }
}
