//! Session state aggregation
//!
//! [`BillingSession`] owns [`SessionState`], the single value observed by
//! the presentation layer. It wires the connection manager, catalog client
//! and reconciliation engine together and runs the one task that consumes
//! the purchase event stream.
//!
//! # Architecture
//!
//! ```text
//! initialize: connect ──▶ history reconciliation ──▶ catalog query
//!
//! vendor callback ──▶ event stream ──▶ event loop (one update at a time)
//!                                          │
//!                                          ▼
//!                          engine.process ──▶ fold outcome ──▶ history pass
//!                                          │
//!                                          ▼
//!                                watch::Sender<SessionState>
//! ```
//!
//! Every write goes through [`BillingSession::update`], which mutates one
//! logical field of the internal model and republishes the folded view.
//! Concurrent writers therefore win per field, not per state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CatalogClient, ProductCatalog};
use crate::config::BillingConfig;
use crate::connection::ConnectionManager;
use crate::error::{BillingError, ErrorKind, Result};
use crate::events::{purchase_event_channel, PurchaseEventStream};
use crate::metrics::ReconcileMetrics;
use crate::model::{ConnectionState, Product, PurchaseSet, PurchaseUpdate, ResponseCode, UiHandle};
use crate::reconcile::{Outcome, ReconciliationEngine, Resolution};
use crate::vendor::{round_trip, BillingVendor, VendorOp};

/// Why the session is in the error status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusKind {
    /// Connecting to the vendor failed
    Connection,
    /// The connection was torn down
    Disconnected,
    /// The product catalog failed to load
    CatalogUnavailable,
    /// The purchase flow failed with a vendor code
    PurchaseFailed {
        /// Vendor response code
        code: ResponseCode,
    },
    /// The user cancelled the purchase flow
    UserCancelled,
    /// The purchase dialog could not be shown
    LaunchFailed,
    /// The purchase event stream ended
    EventStreamClosed,
}

/// Error shown in place of the ready view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// Stable classification
    pub kind: StatusKind,
    /// User-facing message
    pub message: String,
    /// Underlying reason, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SessionError {
    fn new(kind: StatusKind, detail: Option<String>) -> Self {
        let message = match &kind {
            StatusKind::Connection => "Failed to connect to the billing service",
            StatusKind::Disconnected => "Billing service disconnected",
            StatusKind::CatalogUnavailable => "Failed to load products",
            StatusKind::PurchaseFailed { .. } => "Purchase failed",
            StatusKind::UserCancelled => "Purchase was cancelled",
            StatusKind::LaunchFailed => "Failed to launch the purchase flow",
            StatusKind::EventStreamClosed => "Purchase updates are no longer available",
        };
        Self {
            kind,
            message: message.to_string(),
            detail,
        }
    }
}

/// Overall session status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connecting or loading the catalog
    Loading,
    /// Products are shown and purchases can be made
    Ready,
    /// Something fatal happened; `retry` recovers
    Error(SessionError),
}

/// Transient, dismissible failure layered on top of the status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Error text
    pub message: String,
    /// When it was raised
    pub raised_at: DateTime<Utc>,
}

impl Notice {
    fn from_error(error: &BillingError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            raised_at: Utc::now(),
        }
    }
}

/// Snapshot observed by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Folded status
    pub status: SessionStatus,
    /// Connection state at publication time
    pub connection: ConnectionState,
    /// Catalog products
    pub products: Vec<Product>,
    /// Acknowledged or purchased purchases
    pub confirmed_purchases: PurchaseSet,
    /// Purchases still pending
    pub pending_purchases: PurchaseSet,
    /// Latest non-fatal failure
    pub notice: Option<Notice>,
    /// Purchase updates fully handled so far
    pub events_processed: u64,
}

impl SessionState {
    /// Whether any confirmed purchase covers the product
    pub fn is_purchased(&self, product_id: &str) -> bool {
        self.confirmed_purchases.covers_product(product_id)
    }
}

/// Progress of the catalog query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CatalogPhase {
    /// Not loaded yet
    #[default]
    Loading,
    /// Products available
    Loaded,
    /// Query failed with this reason
    Failed(String),
}

/// Fold connection, catalog and purchase-flow results into a status.
///
/// A connecting or failed connection wins over anything the catalog or the
/// purchase flow reports.
pub fn fold_status(
    connection: &ConnectionState,
    catalog: &CatalogPhase,
    flow_error: Option<&SessionError>,
) -> SessionStatus {
    match connection {
        ConnectionState::Connecting => SessionStatus::Loading,
        ConnectionState::Error(reason) => SessionStatus::Error(SessionError::new(
            StatusKind::Connection,
            Some(reason.clone()),
        )),
        ConnectionState::Disconnected => match catalog {
            CatalogPhase::Loading => SessionStatus::Loading,
            _ => SessionStatus::Error(SessionError::new(StatusKind::Disconnected, None)),
        },
        ConnectionState::Connected => match catalog {
            CatalogPhase::Loading => SessionStatus::Loading,
            CatalogPhase::Failed(reason) => SessionStatus::Error(SessionError::new(
                StatusKind::CatalogUnavailable,
                Some(reason.clone()),
            )),
            CatalogPhase::Loaded => match flow_error {
                Some(err) => SessionStatus::Error(err.clone()),
                None => SessionStatus::Ready,
            },
        },
    }
}

#[derive(Debug, Default)]
struct SessionModel {
    catalog: CatalogPhase,
    flow_error: Option<SessionError>,
    products: Vec<Product>,
    confirmed: PurchaseSet,
    pending: PurchaseSet,
    notice: Option<Notice>,
    events_processed: u64,
}

impl SessionModel {
    /// Route an error to the status or to a notice.
    ///
    /// Fatal errors and a cancelled flow replace the status; anything else
    /// becomes a notice on top of it.
    fn surface(&mut self, error: &BillingError) {
        let kind = match error {
            BillingError::UserCancelled => StatusKind::UserCancelled,
            BillingError::EventStreamClosed => StatusKind::EventStreamClosed,
            _ if error.is_fatal() => StatusKind::Connection,
            _ => {
                self.notice = Some(Notice::from_error(error));
                return;
            }
        };
        self.flow_error = Some(SessionError::new(kind, Some(error.to_string())));
    }

    fn view(&self, connection: ConnectionState) -> SessionState {
        SessionState {
            status: fold_status(&connection, &self.catalog, self.flow_error.as_ref()),
            connection,
            products: self.products.clone(),
            confirmed_purchases: self.confirmed.clone(),
            pending_purchases: self.pending.clone(),
            notice: self.notice.clone(),
            events_processed: self.events_processed,
        }
    }
}

/// A billing session: the aggregator and its collaborators
pub struct BillingSession {
    vendor: Arc<dyn BillingVendor>,
    config: BillingConfig,
    connection: Arc<ConnectionManager>,
    catalog: CatalogClient,
    engine: ReconciliationEngine,
    metrics: Arc<ReconcileMetrics>,
    model: Mutex<SessionModel>,
    state: watch::Sender<SessionState>,
    /// Bumped by every `initialize`; results of older runs are dropped
    generation: AtomicU64,
    events: Mutex<Option<PurchaseEventStream>>,
    shutdown: watch::Sender<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BillingSession {
    /// Create a session and register the purchase listener with the vendor
    pub fn new(vendor: Arc<dyn BillingVendor>, config: BillingConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(ReconcileMetrics::new());
        let product_catalog = Arc::new(ProductCatalog::from_config(&config));
        let connection = Arc::new(ConnectionManager::new(
            vendor.clone(),
            config.operation_timeout,
            metrics.clone(),
        ));
        let catalog = CatalogClient::new(
            vendor.clone(),
            connection.clone(),
            product_catalog.clone(),
            &config,
            metrics.clone(),
        );
        let engine = ReconciliationEngine::new(
            vendor.clone(),
            connection.clone(),
            product_catalog,
            &config,
            metrics.clone(),
        );

        let (sink, stream) = purchase_event_channel();
        vendor.register_listener(sink);

        let model = SessionModel::default();
        let (state, _) = watch::channel(model.view(connection.state()));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            vendor,
            config,
            connection,
            catalog,
            engine,
            metrics,
            model: Mutex::new(model),
            state,
            generation: AtomicU64::new(0),
            events: Mutex::new(Some(stream)),
            shutdown,
            event_task: Mutex::new(None),
        }))
    }

    /// Start consuming purchase updates, then run initialization
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_event_loop();
        self.initialize().await
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Observe session state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionState>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| BillingError::EventStreamClosed)?
            .clone();
        Ok(state)
    }

    /// Session metrics
    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    /// Session configuration
    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Connection manager
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Whether a confirmed purchase covers `product_id`.
    ///
    /// Consumed purchases are never confirmed, so this is false for them.
    pub fn is_purchased(&self, product_id: &str) -> bool {
        self.state.borrow().is_purchased(product_id)
    }

    /// Clear the current notice
    pub fn dismiss_notice(&self) {
        self.update(|model| model.notice = None);
    }

    /// Run connect, history reconciliation and catalog query from the top.
    ///
    /// The sequence runs on its own task and lands in one update, so a
    /// caller that stops waiting leaves the previous state in place. Results
    /// of a run superseded by a later `initialize` are dropped.
    #[instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.clone();
        let run = tokio::spawn(async move { session.run_initialization(generation).await });

        match run.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Initialization task ended abnormally");
                Err(BillingError::connection(format!("initialization aborted: {e}")))
            }
        }
    }

    /// Re-run initialization after an error
    pub async fn retry(self: &Arc<Self>) -> Result<()> {
        info!("Retrying billing session initialization");
        self.initialize().await
    }

    async fn run_initialization(&self, generation: u64) -> Result<()> {
        let connected = self.connection.connect().await;
        self.publish();
        if let Err(err) = connected {
            error!(error = %err, "Billing client connection failed");
            return Err(err);
        }
        info!("Billing client connected");

        let history = self.engine.reconcile_history().await;
        if let Err(err) = &history {
            warn!(error = %err, "Failed to load purchases");
        }
        let catalog = self.catalog.query_catalog().await;
        let result = match &catalog {
            Ok(products) => {
                info!(count = products.len(), "Products loaded");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Failed to load products");
                Err(err.clone())
            }
        };

        self.update_if_current(generation, |model| {
            match history {
                Ok(partition) => {
                    model.confirmed = partition.confirmed;
                    model.pending = partition.pending;
                }
                Err(err) => model.surface(&err),
            }
            match catalog {
                Ok(products) => {
                    model.products = products;
                    model.catalog = CatalogPhase::Loaded;
                }
                Err(err) => {
                    model.products.clear();
                    model.catalog = CatalogPhase::Failed(err.to_string());
                }
            }
            model.flow_error = None;
        });
        result
    }

    /// Show the vendor purchase dialog for `product`.
    ///
    /// The outcome arrives later on the purchase event stream.
    #[instrument(skip(self, ui, product), fields(product_id = %product.id))]
    pub async fn purchase(&self, ui: &UiHandle, product: &Product) -> Result<()> {
        let launched = match self.connection.ensure_ready() {
            Ok(()) => {
                round_trip(
                    VendorOp::LaunchPurchaseFlow,
                    self.config.operation_timeout,
                    self.vendor.launch_purchase_flow(ui, product),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match launched {
            Ok(()) => {
                debug!("Purchase flow launched");
                self.update(|model| model.flow_error = None);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to launch purchase flow");
                if err.kind() == ErrorKind::VendorOperation {
                    self.metrics.record_vendor_error(VendorOp::LaunchPurchaseFlow);
                }
                let error = SessionError::new(StatusKind::LaunchFailed, Some(err.to_string()));
                self.update(|model| model.flow_error = Some(error));
                Err(err)
            }
        }
    }

    /// Stop the event loop and disconnect from the vendor
    pub async fn shutdown(&self) {
        info!("Shutting down billing session");
        self.shutdown.send_replace(true);
        let task = self.event_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Event loop ended abnormally");
            }
        }
        self.connection.disconnect().await;
        self.publish();
    }

    /// Spawn the single consumer of the purchase event stream.
    ///
    /// The stream can be consumed once; later calls do nothing.
    pub fn spawn_event_loop(self: &Arc<Self>) {
        let Some(stream) = self.events.lock().take() else {
            debug!("Event loop already started");
            return;
        };
        let session = self.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            session.run_event_loop(stream, shutdown).await;
        });
        *self.event_task.lock() = Some(handle);
    }

    async fn run_event_loop(
        &self,
        mut stream: PurchaseEventStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting purchase event loop");
        let mut connection = self.connection.subscribe();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish();
                }
                update = stream.next_update() => match update {
                    Some(update) => self.handle_update(update).await,
                    None => {
                        error!("Purchase event stream closed");
                        self.update(|model| model.surface(&BillingError::EventStreamClosed));
                        break;
                    }
                },
            }
        }

        info!("Purchase event loop shutting down");
    }

    /// Process one update: settle, fold the outcome, resync history
    async fn handle_update(&self, update: PurchaseUpdate) {
        let outcome = self.engine.process(update).await;
        let resolved = matches!(outcome, Outcome::Resolved(_));
        self.apply_outcome(outcome);

        if resolved {
            self.reconcile_history().await;
        }
        self.update(|model| model.events_processed += 1);
    }

    fn apply_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Resolved(Resolution::Acknowledged { purchase, .. }) => self.update(|model| {
                model.pending.remove(&purchase.token);
                model.confirmed.insert(purchase);
                model.flow_error = None;
            }),
            Outcome::Resolved(Resolution::Consumed { purchase, .. }) => self.update(|model| {
                model.pending.remove(&purchase.token);
                model.flow_error = None;
            }),
            Outcome::Resolved(Resolution::Rejected { error, .. })
            | Outcome::Resolved(Resolution::Failed { error, .. }) => {
                self.update(|model| model.surface(&error));
            }
            Outcome::PurchaseFailed { code } => {
                let error = SessionError::new(StatusKind::PurchaseFailed { code }, None);
                self.update(|model| model.flow_error = Some(error));
            }
            Outcome::UserCancelled => {
                self.update(|model| model.surface(&BillingError::UserCancelled));
            }
        }
    }

    /// Replace both purchase sets with the vendor's history. Failure only
    /// raises a notice; the previous sets stay in place.
    async fn reconcile_history(&self) {
        match self.engine.reconcile_history().await {
            Ok(partition) => self.update(|model| {
                model.confirmed = partition.confirmed;
                model.pending = partition.pending;
            }),
            Err(err) => {
                warn!(error = %err, "Failed to load purchases");
                self.update(|model| model.surface(&err));
            }
        }
    }

    fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut SessionModel),
    {
        let mut model = self.model.lock();
        apply(&mut model);
        self.state.send_replace(model.view(self.connection.state()));
    }

    fn update_if_current<F>(&self, generation: u64, apply: F)
    where
        F: FnOnce(&mut SessionModel),
    {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.update(apply);
        } else {
            debug!(generation, "Dropping result of a superseded initialization");
        }
    }

    fn publish(&self) {
        self.update(|_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Purchase, PurchaseState};
    use crate::vendor::InMemoryVendor;

    fn loaded() -> CatalogPhase {
        CatalogPhase::Loaded
    }

    #[test]
    fn test_fold_connection_overrides_catalog() {
        assert_eq!(
            fold_status(&ConnectionState::Connecting, &loaded(), None),
            SessionStatus::Loading
        );
        let status = fold_status(&ConnectionState::Error("down".into()), &loaded(), None);
        match status {
            SessionStatus::Error(err) => {
                assert_eq!(err.kind, StatusKind::Connection);
                assert_eq!(err.detail.as_deref(), Some("down"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn test_fold_connected() {
        let connected = ConnectionState::Connected;
        assert_eq!(
            fold_status(&connected, &CatalogPhase::Loading, None),
            SessionStatus::Loading
        );
        assert_eq!(fold_status(&connected, &loaded(), None), SessionStatus::Ready);
        assert!(matches!(
            fold_status(&connected, &CatalogPhase::Failed("x".into()), None),
            SessionStatus::Error(SessionError { kind: StatusKind::CatalogUnavailable, .. })
        ));

        let cancelled = SessionError::new(StatusKind::UserCancelled, None);
        assert_eq!(
            fold_status(&connected, &loaded(), Some(&cancelled)),
            SessionStatus::Error(cancelled)
        );
    }

    #[test]
    fn test_fold_disconnected() {
        assert_eq!(
            fold_status(&ConnectionState::Disconnected, &CatalogPhase::Loading, None),
            SessionStatus::Loading
        );
        assert!(matches!(
            fold_status(&ConnectionState::Disconnected, &loaded(), None),
            SessionStatus::Error(SessionError { kind: StatusKind::Disconnected, .. })
        ));
    }

    #[test]
    fn test_session_error_messages_are_distinct() {
        let code = ResponseCode::Error;
        let failed = SessionError::new(StatusKind::PurchaseFailed { code }, None);
        let cancelled = SessionError::new(StatusKind::UserCancelled, None);
        assert_ne!(failed.message, cancelled.message);
    }

    #[test]
    fn test_surface_routes_by_severity() {
        let mut model = SessionModel::default();
        model.surface(&BillingError::vendor(VendorOp::Consume, "declined"));
        assert!(model.flow_error.is_none());
        assert_eq!(
            model.notice.as_ref().map(|n| n.kind),
            Some(ErrorKind::VendorOperation)
        );

        let mut model = SessionModel::default();
        model.surface(&BillingError::connection("lost"));
        assert!(model.notice.is_none());
        assert_eq!(
            model.flow_error.map(|e| e.kind),
            Some(StatusKind::Connection)
        );

        let mut model = SessionModel::default();
        model.surface(&BillingError::UserCancelled);
        assert!(model.notice.is_none());
        assert_eq!(
            model.flow_error.map(|e| e.kind),
            Some(StatusKind::UserCancelled)
        );
    }

    #[tokio::test]
    async fn test_initialize_loads_history_and_catalog() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let old = Purchase::new("old", ["test1"], PurchaseState::Purchased).acknowledged();
        vendor.seed_purchase(old);
        let session = BillingSession::new(vendor.clone(), BillingConfig::test_config()).unwrap();
        assert_eq!(session.state().status, SessionStatus::Loading);

        session.initialize().await.unwrap();

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.products.len(), 5);
        assert!(session.is_purchased("test1"));
        assert!(!session.is_purchased("test2"));
    }

    #[tokio::test]
    async fn test_history_failure_is_a_notice() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        vendor.fail(VendorOp::QueryPurchases, ResponseCode::ServiceUnavailable, "down");
        let session = BillingSession::new(vendor.clone(), BillingConfig::test_config()).unwrap();

        session.initialize().await.unwrap();

        let state = session.state();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.notice.as_ref().map(|n| n.kind), Some(ErrorKind::Query));

        session.dismiss_notice();
        assert!(session.state().notice.is_none());
    }

    #[tokio::test]
    async fn test_purchase_requires_connection() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let session = BillingSession::new(vendor.clone(), BillingConfig::test_config()).unwrap();
        let product = Product::from_details(
            crate::vendor::memory::product_details("test1", 120),
            crate::model::ProductType::NonConsumable,
        );

        let err = session.purchase(&UiHandle::new("main"), &product).await.unwrap_err();
        assert_eq!(err, BillingError::NotReady);
        assert_eq!(vendor.call_count(VendorOp::LaunchPurchaseFlow), 0);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let mut config = BillingConfig::test_config();
        config.consumable_ids.insert("test1".to_string());
        assert!(matches!(
            BillingSession::new(vendor, config),
            Err(BillingError::Config(_))
        ));
    }
}
