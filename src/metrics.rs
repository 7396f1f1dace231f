//! Reconciliation metrics
//!
//! Atomic counters for purchase events and their settlement, exported in
//! Prometheus text format.
//!
//! # Example
//!
//! ```rust
//! use iap_reconcile::metrics::ReconcileMetrics;
//!
//! let metrics = ReconcileMetrics::new();
//! metrics.record_event("success");
//! metrics.record_acknowledged();
//!
//! let output = metrics.to_prometheus_format();
//! assert!(output.contains("iap_acknowledged_total 1"));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::vendor::VendorOp;

/// Counters for one billing session
#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    // === Counters ===
    /// Purchase updates received from the event source
    pub events_total: AtomicU64,
    /// Purchases acknowledged through a vendor call
    pub acknowledged_total: AtomicU64,
    /// Purchases consumed through a vendor call
    pub consumed_total: AtomicU64,
    /// Settlements skipped because the purchase was already acknowledged
    pub short_circuited_total: AtomicU64,
    /// Purchases rejected for an unknown product composition
    pub rejected_total: AtomicU64,
    /// Failed vendor operations of any kind
    pub vendor_errors_total: AtomicU64,
    /// Successful history reconciliation passes
    pub history_ok_total: AtomicU64,
    /// Failed history reconciliation passes
    pub history_failed_total: AtomicU64,
    /// Connection attempts started
    pub connect_attempts_total: AtomicU64,

    // === Labeled counters ===
    /// Events broken down by kind
    events_by_kind: RwLock<BTreeMap<String, u64>>,
    /// Vendor errors broken down by operation
    vendor_errors_by_op: RwLock<BTreeMap<VendorOp, u64>>,
}

impl ReconcileMetrics {
    /// Create a zeroed metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received purchase update
    pub fn record_event(&self, kind: &str) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        *self
            .events_by_kind
            .write()
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    /// Record a vendor acknowledge
    pub fn record_acknowledged(&self) {
        self.acknowledged_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a vendor consume
    pub fn record_consumed(&self) {
        self.consumed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settlement that needed no vendor call
    pub fn record_short_circuit(&self) {
        self.short_circuited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unknown product composition
    pub fn record_rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed vendor operation
    pub fn record_vendor_error(&self, op: VendorOp) {
        self.vendor_errors_total.fetch_add(1, Ordering::Relaxed);
        *self.vendor_errors_by_op.write().entry(op).or_insert(0) += 1;
    }

    /// Record the outcome of a history reconciliation pass
    pub fn record_history(&self, ok: bool) {
        if ok {
            self.history_ok_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.history_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a connection attempt
    pub fn record_connect_attempt(&self) {
        self.connect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Events received of the given kind
    pub fn events_of_kind(&self, kind: &str) -> u64 {
        self.events_by_kind.read().get(kind).copied().unwrap_or(0)
    }

    /// Vendor errors recorded for `op`
    pub fn vendor_errors_for(&self, op: VendorOp) -> u64 {
        self.vendor_errors_by_op.read().get(&op).copied().unwrap_or(0)
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("iap_events_total", &self.events_total),
            ("iap_acknowledged_total", &self.acknowledged_total),
            ("iap_consumed_total", &self.consumed_total),
            ("iap_short_circuited_total", &self.short_circuited_total),
            ("iap_rejected_total", &self.rejected_total),
            ("iap_vendor_errors_total", &self.vendor_errors_total),
            ("iap_history_ok_total", &self.history_ok_total),
            ("iap_history_failed_total", &self.history_failed_total),
            ("iap_connect_attempts_total", &self.connect_attempts_total),
        ];
        for (name, value) in counters {
            output.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
        }

        for (kind, count) in self.events_by_kind.read().iter() {
            output.push_str(&format!("iap_events{{kind=\"{kind}\"}} {count}\n"));
        }
        for (op, count) in self.vendor_errors_by_op.read().iter() {
            output.push_str(&format!("iap_vendor_errors{{op=\"{op}\"}} {count}\n"));
        }

        output
    }
}
