//! Strongly-typed identifiers used across the purchasing layer.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a purchasable product, as defined by the store catalog.
///
/// Opaque and immutable. The only structural rule enforced here is that it is
/// non-empty and carries no surrounding whitespace, since it doubles as the
/// durable entitlement key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

impl ProductId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("ProductId: must not be empty"));
        }
        if value.trim() != value {
            return Err(DomainError::invalid_id(format!(
                "ProductId: surrounding whitespace in '{value}'"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `.`-separated component of the identifier.
    ///
    /// Store identifiers are usually reverse-DNS (`com.example.app.premium`);
    /// the trailing segment is what resource bundles are keyed by.
    pub fn resource_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProductId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProductId> for String {
    fn from(value: ProductId) -> Self {
        value.0
    }
}

/// Identifier of a gateway transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Gateways that carry their own identifiers
    /// should go through `from_uuid`/`FromStr` instead.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TransactionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TransactionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("TransactionId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_product_id_is_rejected() {
        let err = ProductId::new("").unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    #[test]
    fn padded_product_id_is_rejected() {
        assert!(ProductId::new(" premium").is_err());
        assert!("premium\n".parse::<ProductId>().is_err());
    }

    #[test]
    fn resource_name_is_last_dotted_segment() {
        let id = ProductId::new("com.example.study.cash_25").unwrap();
        assert_eq!(id.resource_name(), "cash_25");

        let flat = ProductId::new("premium").unwrap();
        assert_eq!(flat.resource_name(), "premium");
    }

    #[test]
    fn product_id_deserialization_validates() {
        let ok: ProductId = serde_json::from_str("\"premium\"").unwrap();
        assert_eq!(ok.as_str(), "premium");

        let bad = serde_json::from_str::<ProductId>("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn transaction_id_parses_its_display_form() {
        let id = TransactionId::new();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TransactionId>().is_err());
    }

    proptest! {
        #[test]
        fn resource_name_never_contains_a_dot(segments in prop::collection::vec("[a-z0-9_]{1,8}", 1..5)) {
            let id = ProductId::new(segments.join(".")).unwrap();
            prop_assert!(!id.resource_name().contains('.'));
            prop_assert_eq!(id.resource_name(), segments.last().unwrap().as_str());
        }
    }
}
