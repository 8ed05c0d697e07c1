//! Catalog products and gateway transactions.

use serde::{Deserialize, Serialize};

use iapkit_core::{ProductId, TransactionId};

/// Price as reported by the store, in minor units of `currency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_minor: i64,
    pub currency: String,
}

/// A purchasable product as returned by a catalog fetch.
///
/// Products are read-only snapshots; the orchestrator keeps the set from the
/// latest successful fetch and replaces it wholesale on the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub display_name: String,
    pub price: Price,
    /// Raw store payload, untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Product {
    pub fn new(id: ProductId, display_name: impl Into<String>, price: Price) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            price,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Why the gateway failed a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The user dismissed the payment sheet.
    Cancelled,
    /// The payment method was declined (insufficient funds etc.).
    Declined(String),
    /// Anything else the gateway reports.
    Other(String),
}

/// Transaction state as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Purchasing,
    Purchased,
    Failed(FailureReason),
    Restored,
    Deferred,
    /// A state this crate does not know how to interpret (raw gateway name).
    Unknown(String),
}

impl TransactionState {
    /// States after which the gateway expects the transaction to be finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Purchased | TransactionState::Failed(_) | TransactionState::Restored
        )
    }

    pub fn name(&self) -> &str {
        match self {
            TransactionState::Purchasing => "purchasing",
            TransactionState::Purchased => "purchased",
            TransactionState::Failed(_) => "failed",
            TransactionState::Restored => "restored",
            TransactionState::Deferred => "deferred",
            TransactionState::Unknown(raw) => raw,
        }
    }
}

/// Back-reference from a restored transaction to the purchase it restores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalTransaction {
    pub id: TransactionId,
    pub product_id: ProductId,
}

/// A gateway transaction update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub product_id: ProductId,
    pub state: TransactionState,
    pub original: Option<OriginalTransaction>,
}

impl Transaction {
    pub fn new(product_id: ProductId, state: TransactionState) -> Self {
        Self {
            id: TransactionId::new(),
            product_id,
            state,
            original: None,
        }
    }

    /// A `restored` transaction replaying `original`.
    pub fn restored(original: OriginalTransaction) -> Self {
        Self {
            id: TransactionId::new(),
            product_id: original.product_id.clone(),
            state: TransactionState::Restored,
            original: Some(original),
        }
    }

    /// The same transaction (same id) moved to a new state.
    pub fn advanced(&self, state: TransactionState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn with_original(mut self, original: Option<OriginalTransaction>) -> Self {
        self.original = original;
        self
    }
}
