//! Error types for IAP reconciliation
//!
//! This module provides the error hierarchy using `thiserror`. Vendor
//! failures ([`VendorError`]) are mapped into [`BillingError`] at the
//! boundary of each component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ResponseCode;
use crate::vendor::VendorOp;

/// The main error type for billing operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// The vendor connection is not established
    #[error("Billing client is not ready")]
    NotReady,

    /// Connecting to the vendor failed
    #[error("Connection failed: {reason}")]
    Connection {
        /// Vendor supplied reason
        reason: String,
    },

    /// Catalog or purchase history query failed
    #[error("Query failed: {0}")]
    Query(String),

    /// A purchase covers both product types, or none of the known ones
    #[error("Unknown product composition in purchase {token}: {product_ids:?}")]
    UnknownProductComposition {
        /// Purchase token
        token: String,
        /// Product ids carried by the purchase
        product_ids: Vec<String>,
    },

    /// Acknowledge, consume or launch failed on the vendor side
    #[error("Vendor operation {op} failed: {reason}")]
    VendorOperation {
        /// Operation that failed
        op: VendorOp,
        /// Vendor supplied reason
        reason: String,
    },

    /// The user backed out of the purchase flow
    #[error("Purchase cancelled by user")]
    UserCancelled,

    /// The purchase event stream has no sender left
    #[error("Purchase event stream closed")]
    EventStreamClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Error reported by the vendor transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct VendorError {
    /// Vendor response code
    pub code: ResponseCode,
    /// Vendor debug message
    pub message: String,
}

impl VendorError {
    /// Create a vendor error
    pub fn new<S: Into<String>>(code: ResponseCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Stable classification of errors surfaced on the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection not established
    NotReady,
    /// Connection attempt failed
    Connection,
    /// Query failed
    Query,
    /// Purchase mixes or lacks known product types
    UnknownProductComposition,
    /// Vendor acknowledge/consume/launch failure
    VendorOperation,
    /// User cancelled the flow
    UserCancelled,
    /// Event stream closed
    EventStreamClosed,
    /// Bad configuration
    Config,
}

/// Result type alias for billing operations
pub type Result<T> = std::result::Result<T, BillingError>;

impl BillingError {
    /// Create a connection error from a reason
    pub fn connection<S: Into<String>>(reason: S) -> Self {
        BillingError::Connection {
            reason: reason.into(),
        }
    }

    /// Create a vendor operation error
    pub fn vendor<S: Into<String>>(op: VendorOp, reason: S) -> Self {
        BillingError::VendorOperation {
            op,
            reason: reason.into(),
        }
    }

    /// Stable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotReady => ErrorKind::NotReady,
            BillingError::Connection { .. } => ErrorKind::Connection,
            BillingError::Query(_) => ErrorKind::Query,
            BillingError::UnknownProductComposition { .. } => ErrorKind::UnknownProductComposition,
            BillingError::VendorOperation { .. } => ErrorKind::VendorOperation,
            BillingError::UserCancelled => ErrorKind::UserCancelled,
            BillingError::EventStreamClosed => ErrorKind::EventStreamClosed,
            BillingError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error takes the session out of its Ready status.
    ///
    /// Only connection-level failures are fatal; everything else is a
    /// transient notice layered on top of Ready.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BillingError::Connection { .. } | BillingError::EventStreamClosed
        )
    }

    /// Map a vendor failure of `op` into a billing error
    pub fn from_vendor(op: VendorOp, err: VendorError) -> Self {
        match op {
            VendorOp::Connect => BillingError::connection(err.message),
            VendorOp::QueryProducts | VendorOp::QueryPurchases => {
                BillingError::Query(err.to_string())
            }
            _ => BillingError::vendor(op, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::connection("service unavailable");
        assert!(err.to_string().contains("Connection failed"));
        assert!(err.to_string().contains("service unavailable"));
    }

    #[test]
    fn test_vendor_operation_error() {
        let err = BillingError::vendor(VendorOp::Acknowledge, "boom");
        assert_eq!(err.to_string(), "Vendor operation acknowledge failed: boom");
        assert_eq!(err.kind(), ErrorKind::VendorOperation);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_from_vendor_mapping() {
        let vendor = VendorError::new(ResponseCode::ServiceUnavailable, "down");

        let err = BillingError::from_vendor(VendorOp::Connect, vendor.clone());
        assert_eq!(err, BillingError::connection("down"));
        assert!(err.is_fatal());

        let err = BillingError::from_vendor(VendorOp::QueryPurchases, vendor.clone());
        assert_eq!(err.kind(), ErrorKind::Query);

        let err = BillingError::from_vendor(VendorOp::Consume, vendor);
        assert_eq!(err.kind(), ErrorKind::VendorOperation);
        assert!(err.to_string().contains("code 2"));
    }

    #[test]
    fn test_unknown_composition_lists_ids() {
        let err = BillingError::UnknownProductComposition {
            token: "t9".to_string(),
            product_ids: vec!["mystery".to_string()],
        };
        assert!(err.to_string().contains("t9"));
        assert!(err.to_string().contains("mystery"));
        assert!(!err.is_fatal());
    }
}
