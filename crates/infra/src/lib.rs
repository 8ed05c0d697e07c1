//! Infrastructure adapters for the purchasing core.
//!
//! - [`kv`]: durable key-value stores backing entitlement.
//! - [`gateway`]: payment gateway adapters.

pub mod gateway;
pub mod kv;


pub use gateway::{InMemoryPaymentGateway, PaymentScript};
pub use kv::{FileStoreError, JsonFileStore};
