use crate::store::CatalogStore;
use crate::{FetchJob, Product, ProductDescriptor, ProductVersion};
use anyhow::{Context, Error};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;
use uuid::Uuid;

const PRODUCT_COLUMNS: &str =
    "id, name, vendor, category, description, icon_url, website_url, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, product_id, version, platform, architecture, download_url, \
    checksum, checksum_type, file_size, filename, is_latest, etag, last_fetched, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, product_id, status, started_at, completed_at, error, created_at, updated_at";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(max_connections.min(5))
            .max_lifetime(Duration::from_secs(60 * 60))
            .idle_timeout(Duration::from_secs(30 * 60))
            .connect(url)
            .await
            .context("failed to connect to database")?;

        (&pool)
            .execute(include_str!("setup.sql"))
            .await
            .context("failed to apply schema")?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl CatalogStore for DbHandle {
    async fn list_products(&self) -> Result<Vec<Product>, Error> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY vendor, name");
        Ok(sqlx::query_as::<_, Product>(&sql)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, Error> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        Ok(sqlx::query_as::<_, Product>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    #[instrument(name = "db.upsert_product", skip_all, fields(product_id = %descriptor.id))]
    async fn upsert_product(&self, descriptor: &ProductDescriptor) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO products \
                (id, name, vendor, category, description, icon_url, website_url) \
            VALUES ($1, $2, $3, $4, $5, $6, $7) \
            ON CONFLICT (id) DO UPDATE SET \
                name = EXCLUDED.name, \
                vendor = EXCLUDED.vendor, \
                category = EXCLUDED.category, \
                description = EXCLUDED.description, \
                icon_url = EXCLUDED.icon_url, \
                website_url = EXCLUDED.website_url, \
                updated_at = now()",
        )
        .bind(descriptor.id)
        .bind(descriptor.name)
        .bind(descriptor.vendor)
        .bind(descriptor.category.as_str())
        .bind(descriptor.description)
        .bind(descriptor.icon_url)
        .bind(descriptor.website_url)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.create_fetch_job", skip(self))]
    async fn create_fetch_job(&self, product_id: &str) -> Result<FetchJob, Error> {
        let sql = format!(
            "INSERT INTO fetch_jobs (id, product_id, status) \
            VALUES ($1, $2, 'pending') \
            RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, FetchJob>(&sql)
            .bind(Uuid::new_v4())
            .bind(product_id)
            .fetch_one(&*self.pool)
            .await?;

        debug!(message = "Created fetch job", job_id = %job.id);
        Ok(job)
    }

    async fn get_fetch_job(&self, id: Uuid) -> Result<Option<FetchJob>, Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM fetch_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, FetchJob>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    #[instrument(name = "db.begin_job", skip_all, fields(job_id = %id))]
    async fn begin_job(&self, id: Uuid) -> Result<(), Error> {
        sqlx::query(
            "UPDATE fetch_jobs \
                SET status = 'running', \
                started_at = now(), \
                completed_at = NULL, \
                error = NULL, \
                updated_at = now() \
            WHERE id = $1",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.complete_job", skip_all, fields(job_id = %id))]
    async fn complete_job(&self, id: Uuid) -> Result<(), Error> {
        sqlx::query(
            "UPDATE fetch_jobs \
                SET status = 'completed', \
                completed_at = now(), \
                updated_at = now() \
            WHERE id = $1",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.fail_job", skip_all, fields(job_id = %id, error = %msg))]
    async fn fail_job(&self, id: Uuid, msg: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE fetch_jobs \
                SET status = 'failed', \
                completed_at = now(), \
                error = $1, \
                updated_at = now() \
            WHERE id = $2",
        )
        .bind(msg)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_version(&self, version: &ProductVersion) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO product_versions \
                (id, product_id, version, platform, architecture, download_url, checksum, \
                checksum_type, file_size, filename, is_latest, etag, last_fetched, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, false, $11, $12, $13, $14) \
            ON CONFLICT (product_id, version, platform, architecture) DO UPDATE SET \
                download_url = EXCLUDED.download_url, \
                checksum = EXCLUDED.checksum, \
                checksum_type = EXCLUDED.checksum_type, \
                file_size = EXCLUDED.file_size, \
                filename = EXCLUDED.filename, \
                etag = EXCLUDED.etag, \
                last_fetched = EXCLUDED.last_fetched, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(version.id)
        .bind(&version.product_id)
        .bind(&version.version)
        .bind(&version.platform)
        .bind(&version.architecture)
        .bind(&version.download_url)
        .bind(&version.checksum)
        .bind(&version.checksum_type)
        .bind(version.file_size)
        .bind(&version.filename)
        .bind(&version.etag)
        .bind(version.last_fetched)
        .bind(version.created_at)
        .bind(version.updated_at)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to save version {}", version.version))?;

        Ok(())
    }

    #[instrument(name = "db.promote_latest", skip(self))]
    async fn promote_latest(&self, product_id: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE product_versions SET is_latest = false WHERE product_id = $1")
            .bind(product_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear latest versions")?;

        sqlx::query(
            "UPDATE product_versions \
                SET is_latest = true \
            WHERE id IN ( \
                SELECT DISTINCT ON (platform, architecture) id \
                FROM product_versions \
                WHERE product_id = $1 \
                ORDER BY platform, architecture, created_at DESC, seq DESC \
            )",
        )
        .bind(product_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark latest versions")?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_versions(&self, product_id: &str) -> Result<Vec<ProductVersion>, Error> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM product_versions \
            WHERE product_id = $1 \
            ORDER BY platform, architecture, created_at DESC, seq DESC"
        );
        Ok(sqlx::query_as::<_, ProductVersion>(&sql)
            .bind(product_id)
            .fetch_all(&*self.pool)
            .await?)
    }
}
