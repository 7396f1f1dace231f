//! IAP Reconcile - Client-Side In-App Purchase Reconciliation
//!
//! This crate sits between an application and a platform billing vendor.
//! It keeps the vendor connection alive, consumes the asynchronous purchase
//! event stream, settles each purchase exactly once (acknowledge or
//! consume), and folds everything into one observable session state.
//!
//! # Features
//!
//! - **Connection State Machine**: coalesced connects, retry, teardown
//! - **Purchase Events**: vendor callbacks turned into a typed stream
//! - **Reconciliation**: idempotent acknowledge/consume by product type
//! - **Session State**: one `watch` value for the presentation layer
//!
//! # Architecture
//!
//! ```text
//! Application ──▶ BillingSession ──▶ ConnectionManager ──▶ BillingVendor
//!                     │    ▲                                   │
//!                     │    │ SessionState                      │ callbacks
//!                     ▼    │                                   ▼
//!              ┌─────────────────────┐               ┌──────────────────┐
//!              │ ReconciliationEngine│◀── updates ───│ PurchaseEvent-   │
//!              │ CatalogClient       │               │ Stream           │
//!              └─────────────────────┘               └──────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iap_reconcile::{BillingConfig, BillingSession, InMemoryVendor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vendor = Arc::new(InMemoryVendor::with_default_catalog());
//!     let session = BillingSession::new(vendor, BillingConfig::default())?;
//!
//!     session.start().await?;
//!     println!("{:?}", session.state().status);
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod metrics;
pub mod model;
pub mod reconcile;
pub mod session;
pub mod vendor;

// Re-exports for convenience
pub use catalog::{CatalogClient, ProductCatalog};
pub use config::BillingConfig;
pub use connection::ConnectionManager;
pub use error::{BillingError, ErrorKind, Result, VendorError};
pub use events::{purchase_event_channel, PurchaseEventStream, PurchaseUpdateSink};
pub use metrics::ReconcileMetrics;
pub use model::{
    ConnectionState, Product, ProductType, Purchase, PurchaseSet, PurchaseState, PurchaseUpdate,
    ResponseCode, UiHandle,
};
pub use reconcile::{Outcome, ReconciliationEngine, Resolution, Settlement};
pub use session::{BillingSession, Notice, SessionError, SessionState, SessionStatus, StatusKind};
pub use vendor::{BillingVendor, InMemoryVendor, VendorOp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
