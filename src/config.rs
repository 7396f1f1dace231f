//! Session configuration
//!
//! The product-type catalog, vendor query family and operation timeout.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{BillingError, Result};
use crate::model::QueryProductType;

/// Environment variable holding comma-separated non-consumable product ids
pub const NON_CONSUMABLE_IDS_ENV: &str = "IAP_NON_CONSUMABLE_IDS";
/// Environment variable holding comma-separated consumable product ids
pub const CONSUMABLE_IDS_ENV: &str = "IAP_CONSUMABLE_IDS";
/// Environment variable selecting `inapp` or `subs`
pub const PRODUCT_QUERY_TYPE_ENV: &str = "IAP_PRODUCT_QUERY_TYPE";
/// Environment variable holding the vendor operation timeout in milliseconds
pub const OPERATION_TIMEOUT_ENV: &str = "IAP_OPERATION_TIMEOUT_MS";

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a billing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingConfig {
    /// Products that grant a permanent entitlement (acknowledged)
    pub non_consumable_ids: BTreeSet<String>,
    /// Products that are consumed after purchase
    pub consumable_ids: BTreeSet<String>,
    /// Product family passed to vendor queries (default: in-app)
    pub product_query_type: QueryProductType,
    /// Timeout applied to every vendor round-trip (default: 30s)
    pub operation_timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            non_consumable_ids: ["test1", "test5"].into_iter().map(String::from).collect(),
            consumable_ids: ["test2", "test3", "test4"]
                .into_iter()
                .map(String::from)
                .collect(),
            product_query_type: QueryProductType::InApp,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl BillingConfig {
    /// Create a new config builder
    pub fn builder() -> BillingConfigBuilder {
        BillingConfigBuilder::default()
    }

    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(NON_CONSUMABLE_IDS_ENV) {
            config.non_consumable_ids = parse_id_list(&raw);
        }
        if let Some(raw) = lookup(CONSUMABLE_IDS_ENV) {
            config.consumable_ids = parse_id_list(&raw);
        }
        if let Some(raw) = lookup(PRODUCT_QUERY_TYPE_ENV) {
            config.product_query_type = match raw.trim().to_ascii_lowercase().as_str() {
                "inapp" => QueryProductType::InApp,
                "subs" => QueryProductType::Subs,
                other => {
                    return Err(BillingError::Config(format!(
                        "{PRODUCT_QUERY_TYPE_ENV} must be 'inapp' or 'subs', got '{other}'"
                    )))
                }
            };
        }
        if let Some(raw) = lookup(OPERATION_TIMEOUT_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|e| {
                BillingError::Config(format!("{OPERATION_TIMEOUT_ENV}: {e}"))
            })?;
            config.operation_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject overlapping catalogs and a zero timeout
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.non_consumable_ids.intersection(&self.consumable_ids).next() {
            return Err(BillingError::Config(format!(
                "product '{id}' is configured as both consumable and non-consumable"
            )));
        }
        if self.operation_timeout.is_zero() {
            return Err(BillingError::Config(
                "operation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Every configured product id
    pub fn all_product_ids(&self) -> BTreeSet<String> {
        self.non_consumable_ids
            .union(&self.consumable_ids)
            .cloned()
            .collect()
    }

    /// Config with short timeouts for tests
    pub fn test_config() -> Self {
        Self {
            operation_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

fn parse_id_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// Builder for BillingConfig
#[derive(Default)]
pub struct BillingConfigBuilder {
    config: BillingConfig,
}

impl BillingConfigBuilder {
    /// Replace the non-consumable product ids
    pub fn non_consumables<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.non_consumable_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the consumable product ids
    pub fn consumables<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.consumable_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the vendor query product family
    pub fn product_query_type(mut self, kind: QueryProductType) -> Self {
        self.config.product_query_type = kind;
        self
    }

    /// Set the vendor operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Build and validate the config
    pub fn build(self) -> Result<BillingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
