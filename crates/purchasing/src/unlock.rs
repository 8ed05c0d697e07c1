//! Feature unlocks driven by purchase outcomes.
//!
//! Apps bind product ids to their own feature type (a tab, an ad-free flag,
//! a content pack) and feed the outcome subscription into [`FeatureUnlocks`].
//! The optional hook fires once per newly unlocked feature, e.g. to switch to
//! a freshly purchased tab.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use iapkit_core::ProductId;
use iapkit_events::EventHandler;

use crate::outcome::PurchaseOutcome;

type UnlockHook<F> = Box<dyn Fn(&F) + Send + Sync>;

pub struct FeatureUnlocks<F> {
    bindings: HashMap<ProductId, F>,
    unlocked: RwLock<Vec<F>>,
    on_unlock: Option<UnlockHook<F>>,
}

impl<F> FeatureUnlocks<F>
where
    F: Clone + Eq + Hash + core::fmt::Debug + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            unlocked: RwLock::new(Vec::new()),
            on_unlock: None,
        }
    }

    pub fn bind(mut self, product_id: ProductId, feature: F) -> Self {
        self.bindings.insert(product_id, feature);
        self
    }

    pub fn on_unlock(mut self, hook: impl Fn(&F) + Send + Sync + 'static) -> Self {
        self.on_unlock = Some(Box::new(hook));
        self
    }

    pub fn is_unlocked(&self, feature: &F) -> bool {
        self.unlocked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(feature)
    }

    /// Features in unlock order.
    pub fn unlocked(&self) -> Vec<F> {
        self.unlocked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the feature bound to `product_id` unlocked without a hook call,
    /// e.g. from entitlement loaded at startup.
    pub fn seed(&self, product_id: &ProductId) {
        if let Some(feature) = self.bindings.get(product_id) {
            self.insert(feature);
        }
    }

    fn insert(&self, feature: &F) -> bool {
        let mut unlocked = self.unlocked.write().unwrap_or_else(PoisonError::into_inner);
        if unlocked.contains(feature) {
            return false;
        }
        unlocked.push(feature.clone());
        true
    }
}

impl<F> Default for FeatureUnlocks<F>
where
    F: Clone + Eq + Hash + core::fmt::Debug + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F> EventHandler<PurchaseOutcome> for FeatureUnlocks<F>
where
    F: Clone + Eq + Hash + core::fmt::Debug + Send + Sync,
{
    fn handle(&self, outcome: &PurchaseOutcome) {
        if !outcome.success {
            return;
        }
        let Some(feature) = outcome.product_id.as_ref().and_then(|id| self.bindings.get(id)) else {
            return;
        };
        if self.insert(feature) {
            debug!(?feature, "feature unlocked");
            if let Some(hook) = &self.on_unlock {
                hook(feature);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use iapkit_core::TransactionId;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Feature {
        CustomTab,
        AdFree,
    }

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    #[test]
    fn success_unlocks_bound_feature_once() {
        let switches = Arc::new(AtomicUsize::new(0));
        let counter = switches.clone();
        let unlocks = FeatureUnlocks::new()
            .bind(pid("custom_tab"), Feature::CustomTab)
            .bind(pid("ad_free"), Feature::AdFree)
            .on_unlock(move |feature| {
                if *feature == Feature::CustomTab {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });

        let outcome = PurchaseOutcome::succeeded(pid("custom_tab"), TransactionId::new());
        unlocks.handle(&outcome);
        unlocks.handle(&outcome);

        assert!(unlocks.is_unlocked(&Feature::CustomTab));
        assert!(!unlocks.is_unlocked(&Feature::AdFree));
        assert_eq!(switches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_and_unbound_products_unlock_nothing() {
        let unlocks = FeatureUnlocks::new().bind(pid("ad_free"), Feature::AdFree);

        unlocks.handle(&PurchaseOutcome::failed(None));
        unlocks.handle(&PurchaseOutcome::succeeded(pid("premium"), TransactionId::new()));

        assert!(unlocks.unlocked().is_empty());
    }

    #[test]
    fn seed_skips_the_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let unlocks = FeatureUnlocks::new()
            .bind(pid("ad_free"), Feature::AdFree)
            .on_unlock(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        unlocks.seed(&pid("ad_free"));
        unlocks.handle(&PurchaseOutcome::succeeded(pid("ad_free"), TransactionId::new()));

        assert_eq!(unlocks.unlocked(), vec![Feature::AdFree]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
