//! Drives one purchase session against the in-memory gateway and prints
//! every outcome as a JSON line.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;

use iapkit_events::{Event, Subscription, SubscriptionRunner};
use iapkit_infra::{InMemoryPaymentGateway, JsonFileStore, PaymentScript};
use iapkit_purchasing::{
    FailureReason, FeatureUnlocks, LoadingIndicator, Price, Product, PurchaseContext,
    PurchaseOrchestrator, PurchaseOutcome,
};

use crate::config::SimConfig;

/// Loading indicator that only logs.
struct LogLoadingIndicator;

impl LoadingIndicator for LogLoadingIndicator {
    fn show_loading(&self) {
        tracing::info!("loading shown");
    }

    fn hide_loading(&self) {
        tracing::info!("loading hidden");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    iapkit_observability::init();

    let config = SimConfig::from_env()?;
    tracing::info!(
        products = config.products.len(),
        store = %config.store_path.display(),
        policy = ?config.restore_policy,
        "starting purchase session"
    );

    let gateway = Arc::new(InMemoryPaymentGateway::new().with_products(config.products.iter().map(|id| {
        Product::new(
            id.clone(),
            id.resource_name(),
            Price {
                amount_minor: 299,
                currency: "USD".into(),
            },
        )
    })));
    gateway.set_receipt(Some(b"iapkit-sim-receipt".to_vec()));

    let store = Arc::new(
        JsonFileStore::open(&config.store_path)
            .with_context(|| format!("failed to open {}", config.store_path.display()))?,
    );

    let ctx = PurchaseContext::new(gateway.clone(), store).with_loading(Arc::new(LogLoadingIndicator));
    let orchestrator = PurchaseOrchestrator::start(ctx, config.orchestrator());
    let outcomes = orchestrator.subscribe();

    let unlocks = config
        .products
        .iter()
        .fold(FeatureUnlocks::<String>::new(), |unlocks, id| {
            unlocks.bind(id.clone(), id.resource_name().to_string())
        })
        .on_unlock(|tab: &String| tracing::info!(tab = %tab, "switching to unlocked tab"));
    let unlocks = Arc::new(unlocks);
    for id in orchestrator.entitlements().owned() {
        unlocks.seed(&id);
    }
    let _runner = SubscriptionRunner::new(orchestrator.subscribe(), unlocks.clone()).spawn();

    let (tx, rx) = oneshot::channel();
    orchestrator.load_tracked_catalog(move |result| {
        let _ = tx.send(result);
    });
    let products = rx
        .await
        .context("catalog request was superseded")?
        .context("catalog request failed")?;
    tracing::info!(count = products.len(), "catalog loaded");
    print_outcomes(&outcomes, Duration::from_millis(100)).await?;

    let mut ids = config.products.iter();
    if let Some(first) = ids.next() {
        if orchestrator.is_purchased(first) {
            tracing::info!(product_id = %first, "already owned; skipping purchase");
        } else {
            orchestrator.buy(first)?;
            print_outcomes(&outcomes, Duration::from_millis(100)).await?;
        }
    }
    if let Some(second) = ids.next() {
        gateway.script_next(PaymentScript::Fail(FailureReason::Cancelled));
        orchestrator.buy(second)?;
        print_outcomes(&outcomes, Duration::from_millis(100)).await?;
    }

    if let Some(receipt) = orchestrator.receipt_data()? {
        tracing::info!(receipt = %receipt, "app receipt");
    }

    println!("{}", serde_json::to_string(&orchestrator.ledger_stats())?);
    tracing::info!(unlocked = ?unlocks.unlocked(), "session finished");
    orchestrator.shutdown();
    Ok(())
}

/// Print outcomes that arrive within `window`, one JSON line each.
async fn print_outcomes(outcomes: &Subscription<PurchaseOutcome>, window: Duration) -> Result<()> {
    tokio::time::sleep(window).await;
    for outcome in outcomes.drain() {
        println!("{}", outcome_line(&outcome)?);
    }
    Ok(())
}

fn outcome_line<E: Event + Serialize>(event: &E) -> Result<String> {
    let line = serde_json::json!({
        "event_type": event.event_type(),
        "version": event.version(),
        "occurred_at": event.occurred_at(),
        "payload": event,
    });
    Ok(serde_json::to_string(&line)?)
}
