//! Error taxonomy for the purchasing layer.
//!
//! Only [`PurchaseError::ProductNotFound`] is ever returned synchronously to
//! a caller of `buy`. Gateway-reported failures travel as failure
//! [`crate::PurchaseOutcome`]s; the other variants exist so the ledger can
//! classify and log them.

use thiserror::Error;

use iapkit_core::{ProductId, TransactionId};

use crate::model::FailureReason;

/// Durable key-value store failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("key-value store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Payment gateway failure on a request/acknowledgement call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
}

/// Catalog lookup failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogFetchError {
    #[error("catalog service unreachable: {0}")]
    Unreachable(String),

    #[error("malformed catalog response: {0}")]
    Malformed(String),
}

/// Purchase failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    /// `buy` was called for an id missing from the last loaded catalog.
    #[error("product '{0}' is not in the loaded catalog")]
    ProductNotFound(ProductId),

    /// The user cancelled the payment.
    #[error("purchase cancelled by user")]
    Cancelled,

    /// The gateway failed the payment.
    #[error("purchase failed: {0}")]
    Failed(String),
}

impl PurchaseError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PurchaseError::Cancelled)
    }
}

impl From<&FailureReason> for PurchaseError {
    fn from(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::Cancelled => PurchaseError::Cancelled,
            FailureReason::Declined(msg) => PurchaseError::Failed(format!("declined: {msg}")),
            FailureReason::Other(msg) => PurchaseError::Failed(msg.clone()),
        }
    }
}

/// A `restored` transaction arrived without its original-transaction
/// reference. Logged, never surfaced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("restored transaction {transaction_id} carries no original transaction; ignoring")]
pub struct RestoreNoopWarning {
    pub transaction_id: TransactionId,
}
