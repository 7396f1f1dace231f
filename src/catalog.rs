//! Product catalog
//!
//! [`ProductCatalog`] is the known product-type mapping used to classify
//! purchases. [`CatalogClient`] fetches product details from the vendor
//! and attaches those types.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::config::BillingConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::metrics::ReconcileMetrics;
use crate::model::{Product, ProductType, QueryProductType};
use crate::vendor::{round_trip, BillingVendor, VendorOp};

/// Known product ids, split by settlement type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductCatalog {
    non_consumable: BTreeSet<String>,
    consumable: BTreeSet<String>,
}

impl ProductCatalog {
    /// Build a catalog from the two id sets
    pub fn new<I, J, S, T>(non_consumable: I, consumable: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            non_consumable: non_consumable.into_iter().map(Into::into).collect(),
            consumable: consumable.into_iter().map(Into::into).collect(),
        }
    }

    /// Catalog configured for a session
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            non_consumable: config.non_consumable_ids.clone(),
            consumable: config.consumable_ids.clone(),
        }
    }

    /// Settlement type of a product, if known.
    ///
    /// An id listed under both types resolves to `NonConsumable`; config
    /// validation rejects that overlap.
    pub fn product_type(&self, id: &str) -> Option<ProductType> {
        if self.non_consumable.contains(id) {
            Some(ProductType::NonConsumable)
        } else if self.consumable.contains(id) {
            Some(ProductType::Consumable)
        } else {
            None
        }
    }

    /// Whether the id is a known non-consumable
    pub fn is_non_consumable(&self, id: &str) -> bool {
        self.non_consumable.contains(id)
    }

    /// Whether the id is a known consumable
    pub fn is_consumable(&self, id: &str) -> bool {
        self.consumable.contains(id)
    }

    /// Every known id, non-consumables first
    pub fn ids(&self) -> Vec<String> {
        self.non_consumable
            .iter()
            .chain(self.consumable.iter())
            .cloned()
            .collect()
    }
}

/// Fetches product definitions from the vendor
pub struct CatalogClient {
    vendor: Arc<dyn BillingVendor>,
    connection: Arc<ConnectionManager>,
    catalog: Arc<ProductCatalog>,
    query_type: QueryProductType,
    timeout: Duration,
    metrics: Arc<ReconcileMetrics>,
}

impl CatalogClient {
    /// Create a catalog client
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

    /// The product-type mapping used by this client
    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    /// Fetch products for `ids`.
    ///
    /// Fails with `NotReady` unless connected. Duplicate ids collapse to
    /// one product (first wins); ids missing from the catalog are skipped.
    #[instrument(skip(self, ids))]
    pub async fn query_products<I, S>(&self, ids: I) -> Result<Vec<Product>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connection.ensure_ready()?;

        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let details = round_trip(
            VendorOp::QueryProducts,
            self.timeout,
            self.vendor.query_products(&ids, self.query_type),
        )
        .await
        .inspect_err(|_| self.metrics.record_vendor_error(VendorOp::QueryProducts))?;

        let mut seen = HashSet::new();
        let mut products = Vec::with_capacity(details.len());
        for detail in details {
            if !seen.insert(detail.id.clone()) {
                continue;
            }
            match self.catalog.product_type(&detail.id) {
                Some(product_type) => products.push(Product::from_details(detail, product_type)),
                None => warn!(product_id = %detail.id, "Skipping product missing from catalog"),
            }
        }

        debug!(requested = ids.len(), returned = products.len(), "Products loaded");
        Ok(products)
    }

    /// Fetch every product in the catalog
    pub async fn query_catalog(&self) -> Result<Vec<Product>> {
        self.query_products(self.catalog.ids()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::events::PurchaseUpdateSink;
    use crate::model::{ProductDetails, Purchase, ResponseCode, UiHandle};
    use crate::vendor::memory::product_details;
    use crate::vendor::{InMemoryVendor, VendorResult};

    fn client(vendor: Arc<dyn BillingVendor>) -> (CatalogClient, Arc<ConnectionManager>) {
        let metrics = Arc::new(ReconcileMetrics::new());
        let connection = Arc::new(ConnectionManager::new(
            vendor.clone(),
            Duration::from_secs(2),
            metrics.clone(),
        ));
        let config = BillingConfig::test_config();
        let catalog = Arc::new(ProductCatalog::from_config(&config));
        (
            CatalogClient::new(vendor, connection.clone(), catalog, &config, metrics),
            connection,
        )
    }

    #[test]
    fn test_catalog_classification() {
        let catalog = ProductCatalog::new(["sub1"], ["coin10"]);
        assert_eq!(catalog.product_type("sub1"), Some(ProductType::NonConsumable));
        assert_eq!(catalog.product_type("coin10"), Some(ProductType::Consumable));
        assert_eq!(catalog.product_type("other"), None);
        assert_eq!(catalog.ids(), vec!["sub1".to_string(), "coin10".to_string()]);
    }

    #[tokio::test]
    async fn test_query_requires_connection() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let (client, _) = client(vendor.clone());

        let err = client.query_products(["test1"]).await.unwrap_err();
        assert_eq!(err, BillingError::NotReady);
        assert_eq!(vendor.call_count(VendorOp::QueryProducts), 0);
    }

    #[tokio::test]
    async fn test_query_catalog_attaches_types() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let (client, connection) = client(vendor);
        connection.connect().await.unwrap();

        let products = client.query_catalog().await.unwrap();
        assert_eq!(products.len(), 5);
        let test1 = products.iter().find(|p| p.id == "test1").unwrap();
        assert_eq!(test1.product_type, ProductType::NonConsumable);
        let test3 = products.iter().find(|p| p.id == "test3").unwrap();
        assert_eq!(test3.product_type, ProductType::Consumable);
    }

    /// Vendor that answers every query with duplicated and foreign entries
    struct NoisyVendor;

    #[async_trait::async_trait]
    impl BillingVendor for NoisyVendor {
        fn register_listener(&self, _sink: PurchaseUpdateSink) {}
        async fn connect(&self) -> VendorResult<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn query_products(
            &self,
            _ids: &[String],
            _kind: QueryProductType,
        ) -> VendorResult<Vec<ProductDetails>> {
            let mut second = product_details("test1", 999);
            second.name = "duplicate".to_string();
            Ok(vec![
                product_details("test1", 120),
                second,
                product_details("unlisted", 10),
                product_details("test2", 240),
            ])
        }
        async fn query_purchases(&self, _kind: QueryProductType) -> VendorResult<Vec<Purchase>> {
            Ok(vec![])
        }
        async fn launch_purchase_flow(&self, _ui: &UiHandle, _p: &Product) -> VendorResult<()> {
            Ok(())
        }
        async fn acknowledge(&self, _token: &str) -> VendorResult<()> {
            Ok(())
        }
        async fn consume(&self, _token: &str) -> VendorResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_query_dedupes_keep_first() {
        let (client, connection) = client(Arc::new(NoisyVendor));
        connection.connect().await.unwrap();

        let products = client.query_products(["test1", "test1", "test2"]).await.unwrap();
        let ids: Vec<_> = products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["test1", "test2"]);
        assert_eq!(products[0].display_name, "Product test1");
    }

    #[tokio::test]
    async fn test_query_failure_is_query_error() {
        let vendor = Arc::new(InMemoryVendor::with_default_catalog());
        let (client, connection) = client(vendor.clone());
        connection.connect().await.unwrap();
        vendor.fail(VendorOp::QueryProducts, ResponseCode::NetworkError, "offline");

        let err = client.query_catalog().await.unwrap_err();
        assert!(matches!(err, BillingError::Query(ref msg) if msg.contains("offline")));
    }
}
