//! Orchestrator configuration.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use iapkit_core::{DomainError, ProductId};

/// How `restore_purchases` treats entitlement that is already cached.
///
/// `ResetThenReplay` clears every tracked product before asking the gateway
/// to replay. If the gateway then fails to replay a product (partial
/// restore, network loss), that product reads as not owned until the next
/// successful restore. `RetainUntilConfirmed` keeps existing entitlement and
/// only ever adds what the replay confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    #[default]
    ResetThenReplay,
    RetainUntilConfirmed,
}

impl FromStr for RestorePolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" | "reset_then_replay" => Ok(RestorePolicy::ResetThenReplay),
            "retain" | "retain_until_confirmed" => Ok(RestorePolicy::RetainUntilConfirmed),
            other => Err(DomainError::validation(format!("unknown restore policy '{other}'"))),
        }
    }
}

/// Purchase orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Products whose entitlement is hydrated at startup and reset on restore.
    pub tracked_products: BTreeSet<ProductId>,
    pub restore_policy: RestorePolicy,
    /// How often to retry entitlement writes that failed to persist.
    /// `None` disables the background reconciler.
    pub reconcile_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tracked_products: BTreeSet::new(),
            restore_policy: RestorePolicy::default(),
            reconcile_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_tracked_products(mut self, ids: impl IntoIterator<Item = ProductId>) -> Self {
        self.tracked_products = ids.into_iter().collect();
        self
    }

    pub fn with_restore_policy(mut self, policy: RestorePolicy) -> Self {
        self.restore_policy = policy;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Option<Duration>) -> Self {
        self.reconcile_interval = interval;
        self
    }
}
