//! Billing data model
//!
//! Strongly-typed representations of products, purchases and the events
//! the vendor pushes while a session is alive.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the vendor connection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection, or torn down
    #[default]
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Ready for vendor operations
    Connected,
    /// Last connection attempt failed
    Error(String),
}

impl ConnectionState {
    /// Whether vendor operations may be issued
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether this is a settled state (not `Connecting`)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectionState::Connecting)
    }
}

/// Vendor response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResponseCode {
    /// The request reached its timeout before the vendor answered
    ServiceTimeout,
    /// The requested feature is not supported by the store
    FeatureNotSupported,
    /// The app is not connected to the store service
    ServiceDisconnected,
    /// Success
    Ok,
    /// The user pressed back or cancelled a dialog
    UserCanceled,
    /// The service is unavailable on the device
    ServiceUnavailable,
    /// Billing is unavailable for the user
    BillingUnavailable,
    /// The requested product is not available
    ItemUnavailable,
    /// Invalid arguments were passed to the vendor
    DeveloperError,
    /// Fatal error during the vendor call
    Error,
    /// The item is already owned
    ItemAlreadyOwned,
    /// The item is not owned
    ItemNotOwned,
    /// A network error occurred
    NetworkError,
    /// Any code this crate does not know about
    Other(i32),
}

impl ResponseCode {
    /// Numeric code as reported by the vendor
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::ServiceTimeout => -3,
            Self::FeatureNotSupported => -2,
            Self::ServiceDisconnected => -1,
            Self::Ok => 0,
            Self::UserCanceled => 1,
            Self::ServiceUnavailable => 2,
            Self::BillingUnavailable => 3,
            Self::ItemUnavailable => 4,
            Self::DeveloperError => 5,
            Self::Error => 6,
            Self::ItemAlreadyOwned => 7,
            Self::ItemNotOwned => 8,
            Self::NetworkError => 12,
            Self::Other(code) => *code,
        }
    }

    /// Check if this is the success code
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<i32> for ResponseCode {
    fn from(code: i32) -> Self {
        match code {
            -3 => Self::ServiceTimeout,
            -2 => Self::FeatureNotSupported,
            -1 => Self::ServiceDisconnected,
            0 => Self::Ok,
            1 => Self::UserCanceled,
            2 => Self::ServiceUnavailable,
            3 => Self::BillingUnavailable,
            4 => Self::ItemUnavailable,
            5 => Self::DeveloperError,
            6 => Self::Error,
            7 => Self::ItemAlreadyOwned,
            8 => Self::ItemNotOwned,
            12 => Self::NetworkError,
            other => Self::Other(other),
        }
    }
}

impl From<ResponseCode> for i32 {
    fn from(code: ResponseCode) -> Self {
        code.as_i32()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// How a product is settled after purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    /// Bought repeatedly, consumed after each purchase
    Consumable,
    /// Permanent entitlement, acknowledged once
    NonConsumable,
}

/// Product family used by vendor queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryProductType {
    /// One-time products
    #[default]
    InApp,
    /// Subscriptions
    Subs,
}

impl QueryProductType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "inapp",
            Self::Subs => "subs",
        }
    }
}

/// Price metadata as presented by the vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    /// Localized price, e.g. "¥120"
    pub formatted: String,
    /// Price in micro-units of the currency
    pub amount_micros: i64,
    /// ISO 4217 currency code
    pub currency_code: String,
}

/// Product definition returned by the vendor's catalog query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    /// Product id
    pub id: String,
    /// Display name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Price
    pub price: PriceInfo,
}

/// A catalog product with its settlement type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product id (unique key)
    pub id: String,
    /// Settlement type
    pub product_type: ProductType,
    /// Display name
    pub display_name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Price
    pub price: PriceInfo,
}

impl Product {
    /// Attach a settlement type to vendor product details
    pub fn from_details(details: ProductDetails, product_type: ProductType) -> Self {
        Self {
            id: details.id,
            product_type,
            display_name: details.name,
            description: details.description,
            price: details.price,
        }
    }
}

/// Vendor-side purchase state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    /// Payment not yet completed (e.g. cash payment)
    Pending,
    /// Payment completed
    Purchased,
}

/// A purchase record issued by the vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Opaque vendor token; the identity of the purchase
    pub token: String,
    /// Products covered by this purchase
    pub product_ids: BTreeSet<String>,
    /// Vendor-side state
    pub state: PurchaseState,
    /// Whether the purchase has been acknowledged
    pub acknowledged: bool,
    /// Vendor order id
    #[serde(default)]
    pub order_id: Option<String>,
    /// When the purchase was made
    #[serde(default)]
    pub purchase_time: Option<DateTime<Utc>>,
}

impl Purchase {
    /// Create a purchase record
    pub fn new<I, S>(token: impl Into<String>, product_ids: I, state: PurchaseState) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token: token.into(),
            product_ids: product_ids.into_iter().map(Into::into).collect(),
            state,
            acknowledged: false,
            order_id: None,
            purchase_time: None,
        }
    }

    /// Mark as acknowledged
    pub fn acknowledged(mut self) -> Self {
        self.acknowledged = true;
        self
    }

    /// Already purchased and acknowledged; settling it again is a no-op
    pub fn is_settled(&self) -> bool {
        self.state == PurchaseState::Purchased && self.acknowledged
    }

    /// Check if this purchase covers the given product
    pub fn covers(&self, product_id: &str) -> bool {
        self.product_ids.contains(product_id)
    }
}

/// Purchases keyed by token; inserting a known token replaces the record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseSet(BTreeMap<String, Purchase>);

impl PurchaseSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a purchase
    pub fn insert(&mut self, purchase: Purchase) {
        self.0.insert(purchase.token.clone(), purchase);
    }

    /// Remove a purchase by token
    pub fn remove(&mut self, token: &str) -> Option<Purchase> {
        self.0.remove(token)
    }

    /// Whether a purchase with this token is present
    pub fn contains(&self, token: &str) -> bool {
        self.0.contains_key(token)
    }

    /// Look up a purchase by token
    pub fn get(&self, token: &str) -> Option<&Purchase> {
        self.0.get(token)
    }

    /// Whether any purchase covers the product
    pub fn covers_product(&self, product_id: &str) -> bool {
        self.0.values().any(|p| p.covers(product_id))
    }

    /// Number of purchases
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in token order
    pub fn iter(&self) -> impl Iterator<Item = &Purchase> {
        self.0.values()
    }

    /// Tokens in order
    pub fn tokens(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl FromIterator<Purchase> for PurchaseSet {
    fn from_iter<T: IntoIterator<Item = Purchase>>(iter: T) -> Self {
        let mut set = Self::new();
        for purchase in iter {
            set.insert(purchase);
        }
        set
    }
}

/// One update pushed by the vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PurchaseUpdate {
    /// A purchase completed (or changed state)
    Success {
        /// The purchase record
        purchase: Purchase,
    },
    /// The flow failed with a vendor code
    Failure {
        /// Vendor response code
        code: ResponseCode,
    },
    /// The user cancelled
    UserCancelled,
}

impl PurchaseUpdate {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::UserCancelled => "user_cancelled",
        }
    }
}

/// Opaque handle to the UI surface that hosts the vendor purchase dialog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UiHandle(pub String);

impl UiHandle {
    /// Create a UI handle
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }
}
