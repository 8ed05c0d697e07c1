//! In-app purchase orchestration.
//!
//! This crate turns a platform payment gateway into a small, testable
//! purchasing core: a product catalog client, a transaction ledger that
//! drives the purchase state machine, and an entitlement store that answers
//! "does the user own this product?". [`PurchaseOrchestrator`] ties them
//! together behind the public API.
//!
//! IO lives behind traits ([`PaymentGateway`], [`KeyValueStore`],
//! [`LoadingIndicator`]); concrete adapters are in `iapkit-infra`.

pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod outcome;
pub mod presentation;
pub mod unlock;

pub use catalog::{CatalogResult, ProductCatalogClient};
pub use config::{OrchestratorConfig, RestorePolicy};
pub use entitlement::{EntitlementStore, InMemoryKeyValueStore, KeyValueStore};
pub use error::{CatalogFetchError, GatewayError, PurchaseError, RestoreNoopWarning, StoreError};
pub use gateway::{PaymentGateway, TransactionUpdates};
pub use ledger::{Disposition, LedgerStats, OutcomeBus, TransactionLedger};
pub use model::{FailureReason, OriginalTransaction, Price, Product, Transaction, TransactionState};
pub use orchestrator::{PurchaseContext, PurchaseOrchestrator};
pub use outcome::PurchaseOutcome;
pub use presentation::{LoadingIndicator, NoopLoadingIndicator};
pub use unlock::FeatureUnlocks;
