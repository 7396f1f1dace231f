//! Vendor connection lifecycle
//!
//! [`ConnectionManager`] is the only writer of [`ConnectionState`]. Concurrent
//! `connect` calls coalesce into a single in-flight attempt: the first caller
//! flips the state to `Connecting` and spawns the attempt, every caller then
//! waits for the state to settle.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │
//!      │                        └──err──▶ Error(reason) ──retry──▶ Connecting
//!      └────────── disconnect (from any state) ──────────┘
//! ```
//!
//! The attempt runs on its own task, so a caller dropping its `connect`
//! future never leaves the state stuck in `Connecting`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::{BillingError, Result};
use crate::metrics::ReconcileMetrics;
use crate::model::ConnectionState;
use crate::vendor::BillingVendor;

/// Owner of the vendor connection
pub struct ConnectionManager {
    vendor: Arc<dyn BillingVendor>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped on every disconnect; attempts from an older epoch are discarded
    epoch: Arc<Mutex<u64>>,
    connect_timeout: Duration,
    metrics: Arc<ReconcileMetrics>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state
    pub fn new(
        vendor: Arc<dyn BillingVendor>,
        connect_timeout: Duration,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            vendor,
            state: Arc::new(tx),
            epoch: Arc::new(Mutex::new(0)),
            connect_timeout,
            metrics,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Whether vendor operations may be issued
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Fail with `NotReady` unless connected
    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(BillingError::NotReady)
        }
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect to the vendor.
    ///
    /// Returns immediately when already connected. Joins the in-flight
    /// attempt when one is running.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let mut rx = self.state.subscribe();

        let started = {
            let epoch = self.epoch.lock();
            let current = self.state.borrow().clone();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => None,
                ConnectionState::Disconnected | ConnectionState::Error(_) => {
                    self.state.send_replace(ConnectionState::Connecting);
                    Some(*epoch)
                }
            }
        };

        if let Some(epoch) = started {
            self.spawn_attempt(epoch);
        }

        let settled = rx
            .wait_for(ConnectionState::is_terminal)
            .await
            .map_err(|_| BillingError::connection("connection manager dropped"))?
            .clone();

        match settled {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Error(reason) => Err(BillingError::Connection { reason }),
            other => Err(BillingError::connection(format!(
                "connection ended in state {other:?}"
            ))),
        }
    }

    /// Re-run `connect` after a failure
    pub async fn retry(&self) -> Result<()> {
        info!("Retrying vendor connection");
        self.connect().await
    }

    /// Tear down the connection. Repeated calls are no-ops.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        {
            let mut epoch = self.epoch.lock();
            if matches!(*self.state.borrow(), ConnectionState::Disconnected) {
                return;
            }
            *epoch += 1;
            self.state.send_replace(ConnectionState::Disconnected);
        }
        self.vendor.disconnect().await;
        info!("Vendor connection closed");
    }

    fn spawn_attempt(&self, epoch: u64) {
        let vendor = self.vendor.clone();
        let state = self.state.clone();
        let epochs = self.epoch.clone();
        let timeout = self.connect_timeout;
        self.metrics.record_connect_attempt();

        tokio::spawn(async move {
            let next = match tokio::time::timeout(timeout, vendor.connect()).await {
                Ok(Ok(())) => {
                    info!("Vendor connection established");
                    ConnectionState::Connected
                }
                Ok(Err(e)) => {
                    warn!(code = %e.code, error = %e.message, "Vendor connection failed");
                    ConnectionState::Error(e.message)
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis(), "Vendor connection timed out");
                    ConnectionState::Error(format!("connection timed out after {timeout:?}"))
                }
            };

            let superseded = {
                let current = epochs.lock();
                if *current == epoch {
                    state.send_replace(next.clone());
                    false
                } else {
                    true
                }
            };

            if superseded {
                info!("Discarding result of a connection attempt superseded by disconnect");
                if next.is_connected() {
                    vendor.disconnect().await;
                }
            }
        });
    }
}
