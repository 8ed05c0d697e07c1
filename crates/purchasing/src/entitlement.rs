//! Entitlement cache backed by a durable key-value store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use iapkit_core::ProductId;

use crate::error::StoreError;

/// Durable boolean key/value store.
///
/// Writes must be durable when `set_bool` returns `Ok`.
pub trait KeyValueStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError>;
    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError>;
}

impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        (**self).get_bool(key)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        (**self).set_bool(key, value)
    }
}

/// In-memory key/value store for tests/dev.
///
/// Not durable. Writes can be made to fail on demand to exercise the
/// optimistic-grant path.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    inner: RwLock<HashMap<String, bool>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set_bool` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).copied())
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("writes disabled"));
        }
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Which products the user owns.
///
/// Reads are served from memory. Writes go through to the durable store
/// immediately; if that write fails the in-memory grant stands and the id is
/// queued for [`EntitlementStore::reconcile`].
pub struct EntitlementStore {
    store: Arc<dyn KeyValueStore>,
    owned: RwLock<HashSet<ProductId>>,
    /// Ids granted in memory whose durable write has not succeeded yet.
    pending: Mutex<BTreeSet<ProductId>>,
    /// Serializes durable writes so two updates to one key never interleave.
    writes: Mutex<()>,
}

impl core::fmt::Debug for EntitlementStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntitlementStore")
            .field("owned", &self.owned())
            .field("pending", &self.pending_writes())
            .finish()
    }
}

impl EntitlementStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            owned: RwLock::new(HashSet::new()),
            pending: Mutex::new(BTreeSet::new()),
            writes: Mutex::new(()),
        }
    }

    /// Hydrate the cache for `ids` from the durable store.
    ///
    /// Ids with no stored value are skipped; read failures are logged and
    /// skipped. Returns how many ids were found owned.
    pub fn load<'a>(&self, ids: impl IntoIterator<Item = &'a ProductId>) -> usize {
        let mut hydrated = 0;
        for id in ids {
            match self.store.get_bool(id.as_str()) {
                Ok(Some(true)) => {
                    self.set_owned(id, true);
                    hydrated += 1;
                }
                Ok(_) => {}
                Err(err) => warn!(product_id = %id, error = %err, "failed to read entitlement"),
            }
        }
        debug!(hydrated, "entitlements loaded");
        hydrated
    }

    pub fn is_purchased(&self, id: &ProductId) -> bool {
        self.owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Grant `id`. Idempotent.
    ///
    /// The in-memory flag is set before the durable write and is kept even
    /// when the write fails.
    pub fn mark_purchased(&self, id: &ProductId) -> Result<(), StoreError> {
        let _write = self.write_guard();
        self.set_owned(id, true);

        match self.store.set_bool(id.as_str(), true) {
            Ok(()) => {
                self.clear_pending(id);
                Ok(())
            }
            Err(err) => {
                error!(product_id = %id, error = %err, "entitlement write failed; queued for reconciliation");
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone());
                Err(err)
            }
        }
    }

    /// Drop entitlement for `ids`, in memory and durably.
    ///
    /// Every id is cleared in memory even if a durable write fails; the
    /// first write error is returned.
    pub fn reset<'a>(&self, ids: impl IntoIterator<Item = &'a ProductId>) -> Result<(), StoreError> {
        let _write = self.write_guard();
        let mut first_err = None;

        for id in ids {
            self.set_owned(id, false);
            self.clear_pending(id);
            if let Err(err) = self.store.set_bool(id.as_str(), false) {
                warn!(product_id = %id, error = %err, "failed to persist entitlement reset");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Retry durable writes for grants that failed to persist.
    ///
    /// Returns the number of writes that went through. Ids that still fail
    /// stay queued.
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let _write = self.write_guard();
        let queued: Vec<ProductId> = {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.iter().cloned().collect()
        };

        let mut written = 0;
        let mut first_err = None;
        for id in queued {
            match self.store.set_bool(id.as_str(), true) {
                Ok(()) => {
                    self.clear_pending(&id);
                    written += 1;
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        if written > 0 {
            info!(written, "reconciled entitlement writes");
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Snapshot of owned product ids.
    pub fn owned(&self) -> BTreeSet<ProductId> {
        self.owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Ids whose grant has not been persisted yet.
    pub fn pending_writes(&self) -> BTreeSet<ProductId> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The write lock guards no data; a poisoned lock is safe to reuse.
    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_owned(&self, id: &ProductId, owned: bool) {
        let mut set = self.owned.write().unwrap_or_else(PoisonError::into_inner);
        if owned {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    fn clear_pending(&self, id: &ProductId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}
