//! Simulator configuration from the environment.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};

use iapkit_core::ProductId;
use iapkit_purchasing::{OrchestratorConfig, RestorePolicy};

pub const PRODUCTS_ENV: &str = "IAPKIT_PRODUCTS";
pub const STORE_PATH_ENV: &str = "IAPKIT_STORE_PATH";
pub const RESTORE_POLICY_ENV: &str = "IAPKIT_RESTORE_POLICY";

const DEFAULT_PRODUCTS: &str = "com.example.app.premium,com.example.app.ad_free";

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub products: BTreeSet<ProductId>,
    pub store_path: PathBuf,
    pub restore_policy: RestorePolicy,
}

impl SimConfig {
    pub fn from_env() -> Result<Self> {
        let raw_products = std::env::var(PRODUCTS_ENV).unwrap_or_else(|_| DEFAULT_PRODUCTS.to_string());
        let products = parse_products(&raw_products)
            .with_context(|| format!("invalid {PRODUCTS_ENV}"))?;

        let store_path = std::env::var_os(STORE_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("iapkit-sim").join("entitlements.json"));

        let restore_policy = match std::env::var(RESTORE_POLICY_ENV) {
            Ok(raw) => raw
                .parse::<RestorePolicy>()
                .with_context(|| format!("invalid {RESTORE_POLICY_ENV}"))?,
            Err(_) => RestorePolicy::default(),
        };

        Ok(Self {
            products,
            store_path,
            restore_policy,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_tracked_products(self.products.iter().cloned())
            .with_restore_policy(self.restore_policy)
    }
}

fn parse_products(raw: &str) -> Result<BTreeSet<ProductId>> {
    let products = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| ProductId::new(id).with_context(|| format!("bad product id '{id}'")))
        .collect::<Result<BTreeSet<_>>>()?;
    anyhow::ensure!(!products.is_empty(), "no product ids given");
    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_list_is_trimmed_and_deduplicated() {
        let products = parse_products(" a.premium , b.ad_free,,a.premium ").unwrap();
        assert_eq!(products.len(), 2);
        assert!(products.contains(&ProductId::new("a.premium").unwrap()));
    }

    #[test]
    fn empty_product_list_is_rejected() {
        assert!(parse_products(" , ").is_err());
    }
}
