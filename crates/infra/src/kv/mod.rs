//! Durable key-value stores.

pub mod json_file;

pub use json_file::{FileStoreError, JsonFileStore};
