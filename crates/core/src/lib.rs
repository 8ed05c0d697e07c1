//! `iapkit-core`: identifier and error building blocks.
//!
//! This crate contains **pure** primitives shared by the purchasing layer
//! (no IO, no async, no gateway concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ProductId, TransactionId};
