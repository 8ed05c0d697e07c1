use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use iapkit_core::{ProductId, TransactionId};
use iapkit_events::Event;

/// Resolution of a purchase or restore, as seen by the rest of the app.
///
/// Failure outcomes never carry a product id: a failed transaction grants
/// nothing, whatever product it was for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOutcome {
    pub success: bool,
    pub product_id: Option<ProductId>,
    /// Transaction that produced this outcome, when there was one.
    pub transaction_id: Option<TransactionId>,
    pub occurred_at: DateTime<Utc>,
}

impl PurchaseOutcome {
    pub fn succeeded(product_id: ProductId, transaction_id: TransactionId) -> Self {
        Self {
            success: true,
            product_id: Some(product_id),
            transaction_id: Some(transaction_id),
            occurred_at: Utc::now(),
        }
    }

    pub fn failed(transaction_id: Option<TransactionId>) -> Self {
        Self {
            success: false,
            product_id: None,
            transaction_id,
            occurred_at: Utc::now(),
        }
    }
}

impl Event for PurchaseOutcome {
    fn event_type(&self) -> &'static str {
        if self.success {
            "purchasing.outcome.succeeded"
        } else {
            "purchasing.outcome.failed"
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
