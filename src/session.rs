//! Access to the trip table.
//!
//! The [TripSource] trait is the seam between the pipeline and the database. [SqlSession]
//! implements it over a `sqlx` connection pool using the `Any` driver, so that both PostgreSQL
//! and SQLite URLs are accepted.

use crate::error::HhiError;
use crate::models::{BucketCount, RegionId};
use crate::query;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use url::Url;

/// Source of trip aggregates.
///
/// Implementations are passed explicitly to every function that needs the data; there is no
/// process-wide session.
#[async_trait]
pub trait TripSource: Send + Sync {
    /// Distinct home regions with at least one trip ending in the home region, sorted.
    async fn region_ids(&self) -> Result<Vec<RegionId>, HhiError>;

    /// Number of trips of `region` that end in `region`.
    async fn region_trip_count(&self, region: &RegionId) -> Result<i64, HhiError>;

    /// Trip counts of `region` grouped by the end geohash truncated to `precision` characters.
    async fn bucket_counts(
        &self,
        region: &RegionId,
        precision: usize,
    ) -> Result<Vec<BucketCount>, HhiError>;
}

/// SQL database session holding a connection pool.
#[derive(Clone, Debug)]
pub struct SqlSession {
    /// Underlying sqlx connection pool.
    pool: AnyPool,
    /// Name of the trip table.
    table: String,
}

impl SqlSession {
    /// Connect to the database and return a session.
    ///
    /// # Arguments
    ///
    /// * `database_url`: `postgres://` or `sqlite://` connection URL
    /// * `table`: Validated name of the trip table
    /// * `max_connections`: Maximum size of the connection pool
    pub async fn connect(
        database_url: &str,
        table: &str,
        max_connections: u32,
    ) -> Result<Self, HhiError> {
        sqlx::any::install_default_drivers();
        tracing::info!("Connecting to {}", redact_url(database_url)?);
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, table))
    }

    /// Return a session using an existing pool.
    pub fn from_pool(pool: AnyPool, table: &str) -> Self {
        SqlSession {
            pool,
            table: table.to_string(),
        }
    }

    /// Close all connections of the pool.
    pub async fn close(&self) {
        self.pool.close().await
    }
}

#[async_trait]
impl TripSource for SqlSession {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn region_ids(&self) -> Result<Vec<RegionId>, HhiError> {
        let rows = sqlx::query(&query::region_ids(&self.table))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<RegionId, HhiError> {
                Ok(RegionId::from(row.try_get::<String, _>("home_cbsa_id")?))
            })
            .collect()
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn region_trip_count(&self, region: &RegionId) -> Result<i64, HhiError> {
        let row = sqlx::query(&query::region_trip_count(&self.table))
            .bind(region.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("trip_count")?)
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn bucket_counts(
        &self,
        region: &RegionId,
        precision: usize,
    ) -> Result<Vec<BucketCount>, HhiError> {
        let rows = sqlx::query(&query::bucket_counts(&self.table, precision))
            .bind(region.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<BucketCount, HhiError> {
                Ok(BucketCount {
                    bucket: row.try_get::<Option<String>, _>("end_geohash")?,
                    trip_count: row.try_get("trip_count")?,
                })
            })
            .collect()
    }
}

/// Returns the database URL with any password masked, for logging.
pub fn redact_url(database_url: &str) -> Result<String, HhiError> {
    let mut url = Url::parse(database_url)?;
    if url.password().is_some() {
        // Only fails for URLs that cannot carry credentials, which have no password to mask.
        let _ = url.set_password(Some("****"));
    }
    Ok(url.to_string())
}
