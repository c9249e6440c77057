use crate::{FetchJob, Product, ProductDescriptor, ProductVersion};
use anyhow::Error;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistent catalog state shared by the enqueuer and the workers.
///
/// Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, Error>;

    async fn get_product(&self, id: &str) -> Result<Option<Product>, Error>;

    /// Inserts the product or refreshes its descriptive fields.
    async fn upsert_product(&self, descriptor: &ProductDescriptor) -> Result<(), Error>;

    /// Inserts a `pending` job for `product_id`.
    async fn create_fetch_job(&self, product_id: &str) -> Result<FetchJob, Error>;

    async fn get_fetch_job(&self, id: Uuid) -> Result<Option<FetchJob>, Error>;

    /// `running`, stamping `started_at` and clearing any previous outcome.
    async fn begin_job(&self, id: Uuid) -> Result<(), Error>;

    async fn complete_job(&self, id: Uuid) -> Result<(), Error>;

    async fn fail_job(&self, id: Uuid, msg: &str) -> Result<(), Error>;

    /// Insert-or-update keyed on `(product_id, version, platform, architecture)`.
    /// Never changes `is_latest` or `created_at` of an existing row.
    async fn upsert_version(&self, version: &ProductVersion) -> Result<(), Error>;

    /// Recomputes `is_latest` for every (platform, architecture) group of a
    /// product in one transaction.
    async fn promote_latest(&self, product_id: &str) -> Result<(), Error>;

    async fn list_versions(&self, product_id: &str) -> Result<Vec<ProductVersion>, Error>;
}
