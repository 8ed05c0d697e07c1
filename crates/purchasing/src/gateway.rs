//! Payment gateway capability interface.
//!
//! The gateway is the platform purchase API seen from this crate: it answers
//! catalog lookups, accepts payments and acknowledgements, and pushes
//! transaction updates. Production code wraps the platform SDK; tests and the
//! simulator use `iapkit_infra::InMemoryPaymentGateway`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::mpsc;

use iapkit_core::{ProductId, TransactionId};

use crate::error::{CatalogFetchError, GatewayError};
use crate::model::{Product, Transaction};

/// Receiving half of the gateway's transaction-update stream.
///
/// Updates arrive in batches, in delivery order. The stream has exactly one
/// consumer: the [`crate::TransactionLedger`].
pub type TransactionUpdates = mpsc::UnboundedReceiver<Vec<Transaction>>;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Whether the device/account is allowed to make payments at all.
    fn can_make_payments(&self) -> bool;

    /// Look up purchasable products. Unknown ids are simply absent from the
    /// returned list.
    async fn request_products(
        &self,
        ids: &BTreeSet<ProductId>,
    ) -> Result<Vec<Product>, CatalogFetchError>;

    /// Queue a payment. The result arrives later as transaction updates.
    fn submit_payment(&self, product: &Product) -> Result<(), GatewayError>;

    /// Acknowledge a processed transaction so it is not redelivered.
    ///
    /// Finishing an already finished transaction must be a no-op.
    fn finish_transaction(&self, transaction_id: TransactionId) -> Result<(), GatewayError>;

    /// Ask the gateway to replay previously completed purchases as
    /// `restored` transactions.
    fn restore_completed_transactions(&self) -> Result<(), GatewayError>;

    /// Hand over the transaction-update stream. Returns `None` once taken.
    fn take_transaction_updates(&self) -> Option<TransactionUpdates>;

    /// The app receipt, if the platform has one on disk.
    fn app_receipt(&self) -> Result<Option<Vec<u8>>, GatewayError>;
}
