//! Purchase reconciliation engine
//!
//! Turns each [`PurchaseUpdate`] into an [`Outcome`]: classify the purchase
//! against the product catalog, acknowledge or consume it exactly once,
//! and report what happened. The engine holds no session state; the
//! session folds outcomes into [`SessionState`](crate::session::SessionState).
//!
//! # Settlement policy
//!
//! ```text
//! non-consumable only ──▶ Acknowledge
//! consumable only     ──▶ Consume
//! both / neither      ──▶ Rejected (UnknownProductComposition)
//! ```
//!
//! A purchase that is already `Purchased` and acknowledged settles without
//! a vendor call.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::catalog::ProductCatalog;
use crate::config::BillingConfig;
use crate::connection::ConnectionManager;
use crate::error::{BillingError, Result};
use crate::metrics::ReconcileMetrics;
use crate::model::{
    Purchase, PurchaseSet, PurchaseState, PurchaseUpdate, QueryProductType, ResponseCode,
};
use crate::vendor::{round_trip, BillingVendor, VendorOp};

/// How a purchase must be settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// Acknowledge (non-consumable)
    Acknowledge,
    /// Consume (consumable)
    Consume,
}

/// Classify a purchase by the product types it covers
pub fn classify(catalog: &ProductCatalog, purchase: &Purchase) -> Result<Settlement> {
    let has_non_consumable = purchase
        .product_ids
        .iter()
        .any(|id| catalog.is_non_consumable(id));
    let has_consumable = purchase
        .product_ids
        .iter()
        .any(|id| catalog.is_consumable(id));

    match (has_non_consumable, has_consumable) {
        (true, false) => Ok(Settlement::Acknowledge),
        (false, true) => Ok(Settlement::Consume),
        _ => Err(BillingError::UnknownProductComposition {
            token: purchase.token.clone(),
            product_ids: purchase.product_ids.iter().cloned().collect(),
        }),
    }
}

/// Result of settling one purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Acknowledged; `vendor_called` is false when it already was
    Acknowledged {
        /// The purchase, marked acknowledged
        purchase: Purchase,
        /// Whether the vendor was contacted
        vendor_called: bool,
    },
    /// Consumed; `vendor_called` is false when already settled
    Consumed {
        /// The consumed purchase
        purchase: Purchase,
        /// Whether the vendor was contacted
        vendor_called: bool,
    },
    /// Product composition could not be classified
    Rejected {
        /// The untouched purchase
        purchase: Purchase,
        /// `UnknownProductComposition`
        error: BillingError,
    },
    /// The vendor operation failed; the purchase stays pending
    Failed {
        /// The untouched purchase
        purchase: Purchase,
        /// Operation error
        error: BillingError,
    },
}

impl Resolution {
    /// The purchase this resolution is about
    pub fn purchase(&self) -> &Purchase {
        match self {
            Self::Acknowledged { purchase, .. }
            | Self::Consumed { purchase, .. }
            | Self::Rejected { purchase, .. }
            | Self::Failed { purchase, .. } => purchase,
        }
    }

    /// The error, for rejected or failed resolutions
    pub fn error(&self) -> Option<&BillingError> {
        match self {
            Self::Rejected { error, .. } | Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// What one purchase update amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A `Success` update was settled (or not)
    Resolved(Resolution),
    /// The purchase flow failed with a vendor code
    PurchaseFailed {
        /// Vendor response code
        code: ResponseCode,
    },
    /// The user cancelled the flow
    UserCancelled,
}

/// Purchase history split into confirmed and pending sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurchasePartition {
    /// Acknowledged or purchased
    pub confirmed: PurchaseSet,
    /// Pending and not acknowledged
    pub pending: PurchaseSet,
}

/// Partition a purchase history.
///
/// `confirmed = acknowledged ∨ Purchased`, `pending` is everything else
/// still in state `Pending`, so the two sets never overlap. A token listed
/// twice keeps its last entry.
pub fn partition<I>(purchases: I) -> PurchasePartition
where
    I: IntoIterator<Item = Purchase>,
{
    let mut result = PurchasePartition::default();
    for purchase in purchases {
        if purchase.acknowledged || purchase.state == PurchaseState::Purchased {
            result.pending.remove(&purchase.token);
            result.confirmed.insert(purchase);
        } else {
            result.confirmed.remove(&purchase.token);
            result.pending.insert(purchase);
        }
    }
    result
}

/// Settles purchases against the vendor
pub struct ReconciliationEngine {
    vendor: Arc<dyn BillingVendor>,
    connection: Arc<ConnectionManager>,
    catalog: Arc<ProductCatalog>,
    query_type: QueryProductType,
    timeout: Duration,
    metrics: Arc<ReconcileMetrics>,
}

impl ReconciliationEngine {
    /// Create an engine
    pub fn new(
        vendor: Arc<dyn BillingVendor>,
        connection: Arc<ConnectionManager>,
        catalog: Arc<ProductCatalog>,
        config: &BillingConfig,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        Self {
            vendor,
            connection,
            catalog,
            query_type: config.product_query_type,
            timeout: config.operation_timeout,
            metrics,
        }
    }

    /// Process one update from the event source
    pub async fn process(&self, update: PurchaseUpdate) -> Outcome {
        self.metrics.record_event(update.label());
        match update {
            PurchaseUpdate::Success { purchase } => Outcome::Resolved(self.resolve(purchase).await),
            PurchaseUpdate::Failure { code } => {
                info!(code = %code, "Purchase failed");
                Outcome::PurchaseFailed { code }
            }
            PurchaseUpdate::UserCancelled => {
                info!("Purchase cancelled by user");
                Outcome::UserCancelled
            }
        }
    }

    /// Classify and settle a purchase
    #[instrument(skip(self, purchase), fields(token = %purchase.token))]
    pub async fn resolve(&self, purchase: Purchase) -> Resolution {
        let settlement = match classify(&self.catalog, &purchase) {
            Ok(settlement) => settlement,
            Err(error) => {
                warn!(
                    token = %purchase.token,
                    product_ids = ?purchase.product_ids,
                    "Purchase does not match the catalog; leaving it unsettled"
                );
                self.metrics.record_rejected();
                return Resolution::Rejected { purchase, error };
            }
        };

        match settlement {
            Settlement::Acknowledge => match self.acknowledge(&purchase).await {
                Ok(vendor_called) => {
                    info!(token = %purchase.token, vendor_called, "Purchase acknowledged");
                    Resolution::Acknowledged {
                        purchase: purchase.acknowledged(),
                        vendor_called,
                    }
                }
                Err(error) => Resolution::Failed { purchase, error },
            },
            Settlement::Consume => match self.consume(&purchase).await {
                Ok(vendor_called) => {
                    info!(token = %purchase.token, vendor_called, "Purchase consumed");
                    Resolution::Consumed {
                        purchase,
                        vendor_called,
                    }
                }
                Err(error) => Resolution::Failed { purchase, error },
            },
        }
    }

    /// Acknowledge a purchase. Returns whether the vendor was called.
    pub async fn acknowledge(&self, purchase: &Purchase) -> Result<bool> {
        self.settle(VendorOp::Acknowledge, purchase).await
    }

    /// Consume a purchase. Returns whether the vendor was called.
    pub async fn consume(&self, purchase: &Purchase) -> Result<bool> {
        self.settle(VendorOp::Consume, purchase).await
    }

    async fn settle(&self, op: VendorOp, purchase: &Purchase) -> Result<bool> {
        if purchase.is_settled() {
            debug!(token = %purchase.token, op = %op, "Already acknowledged; skipping vendor call");
            self.metrics.record_short_circuit();
            return Ok(false);
        }
        self.connection.ensure_ready()?;

        let call = async {
            match op {
                VendorOp::Consume => self.vendor.consume(&purchase.token).await,
                _ => self.vendor.acknowledge(&purchase.token).await,
            }
        };
        match round_trip(op, self.timeout, call).await {
            Ok(()) => {
                match op {
                    VendorOp::Consume => self.metrics.record_consumed(),
                    _ => self.metrics.record_acknowledged(),
                }
                Ok(true)
            }
            Err(err) => {
                self.metrics.record_vendor_error(op);
                Err(err)
            }
        }
    }

    /// Query the vendor's purchase history and partition it
    #[instrument(skip(self))]
    pub async fn reconcile_history(&self) -> Result<PurchasePartition> {
        let result = async {
            self.connection.ensure_ready()?;
            round_trip(
                VendorOp::QueryPurchases,
                self.timeout,
                self.vendor.query_purchases(self.query_type),
            )
            .await
        }
        .await;

        match result {
            Ok(purchases) => {
                self.metrics.record_history(true);
                let partition = partition(purchases);
                debug!(
                    confirmed = partition.confirmed.len(),
                    pending = partition.pending.len(),
                    "Purchase history reconciled"
                );
                Ok(partition)
            }
            Err(err) => {
                self.metrics.record_history(false);
                Err(err)
            }
        }
    }
}
