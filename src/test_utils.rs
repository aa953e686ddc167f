use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::HhiError;
use crate::models::{BucketCount, RegionId};
use crate::session::{SqlSession, TripSource};

use async_trait::async_trait;
use hashbrown::HashMap;
use sqlx::any::AnyPoolOptions;
use tempfile::TempDir;

/// In-memory trip source.
///
/// Holds the full end geohash of every trip ending in its home region, keyed by region.
#[derive(Debug, Default)]
pub(crate) struct MockTripSource {
    /// Regions returned by discovery, in order
    pub regions: Vec<RegionId>,
    /// End geohashes of the trips of each region
    pub trips: HashMap<RegionId, Vec<String>>,
    /// Totals reported instead of the trip count, to simulate concurrent writes
    pub total_overrides: HashMap<RegionId, i64>,
    /// Region whose grouped query fails permanently
    pub failing_region: Option<RegionId>,
    /// Number of upcoming queries that fail with a transient error
    pub transient_failures: AtomicU32,
    /// Regions for which the trip count was queried, in query order
    pub queried: Mutex<Vec<RegionId>>,
}

impl MockTripSource {
    /// Regions "A" (4 trips over 2 buckets) and "B" (5 trips in one bucket).
    pub fn new() -> Self {
        let mut source = Self::default();
        source.add_region("A", &["aaaaa1", "aaaaa2", "aaaaa3", "bbbbb9"]);
        source.add_region("B", &["ccccc1", "ccccc2", "ccccc3", "ccccc4", "ccccc5"]);
        source
    }

    /// Add a region with the given trip end geohashes; no geohashes makes an empty region.
    pub fn add_region(&mut self, region: &str, geohashes: &[&str]) {
        let region = RegionId::from(region);
        self.regions.push(region.clone());
        self.trips.insert(
            region,
            geohashes.iter().map(|geohash| geohash.to_string()).collect(),
        );
    }

    pub fn queried(&self) -> Vec<RegionId> {
        self.queried.lock().unwrap().clone()
    }

    fn maybe_fail(&self) -> Result<(), HhiError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HhiError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn region_trips(&self, region: &RegionId) -> &[String] {
        self.trips.get(region).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl TripSource for MockTripSource {
    async fn region_ids(&self) -> Result<Vec<RegionId>, HhiError> {
        self.maybe_fail()?;
        Ok(self.regions.clone())
    }

    async fn region_trip_count(&self, region: &RegionId) -> Result<i64, HhiError> {
        self.maybe_fail()?;
        self.queried.lock().unwrap().push(region.clone());
        if let Some(total) = self.total_overrides.get(region) {
            return Ok(*total);
        }
        Ok(self.region_trips(region).len().try_into()?)
    }

    async fn bucket_counts(
        &self,
        region: &RegionId,
        precision: usize,
    ) -> Result<Vec<BucketCount>, HhiError> {
        self.maybe_fail()?;
        if self.failing_region.as_ref() == Some(region) {
            return Err(HhiError::Database(sqlx::Error::RowNotFound));
        }
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for geohash in self.region_trips(region) {
            let bucket: String = geohash.chars().take(precision).collect();
            *counts.entry(bucket).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(bucket, trip_count)| BucketCount::new(&bucket, trip_count))
            .collect())
    }
}

/// Statements creating the SQLite fixture table.
///
/// Region "A" has 4 trips ending in "A" (3 in bucket "aaaaa", 1 in "bbbbb") and one ending
/// elsewhere, "B" has 5 trips in bucket "ccccc", "C" only has trips ending in "D".
const FIXTURE_STATEMENTS: &[&str] = &[
    "CREATE TABLE temp_traj_all (home_cbsa_id TEXT, end_cbsa_id TEXT, end_geohash TEXT)",
    "INSERT INTO temp_traj_all VALUES \
     ('A', 'A', 'aaaaa1x'), ('A', 'A', 'aaaaa2x'), ('A', 'A', 'aaaaa3x'), \
     ('A', 'A', 'bbbbb9x'), ('A', 'X', 'zzzzz0x')",
    "INSERT INTO temp_traj_all VALUES \
     ('B', 'B', 'ccccc1'), ('B', 'B', 'ccccc2'), ('B', 'B', 'ccccc3'), \
     ('B', 'B', 'ccccc4'), ('B', 'B', 'ccccc5')",
    "INSERT INTO temp_traj_all VALUES ('C', 'D', 'ddddd1'), ('C', 'D', 'ddddd2')",
];

/// Region "N" has one trip without an end geohash and one with an empty one.
pub(crate) const MISSING_GEOHASH_TRIPS: &str =
    "INSERT INTO temp_traj_all VALUES ('N', 'N', NULL), ('N', 'N', '')";

/// Create a SQLite database with the fixture trip table in a temporary directory.
///
/// The directory is deleted when the returned [TempDir] is dropped.
pub(crate) async fn fixture_database() -> (TempDir, SqlSession) {
    fixture_database_with(&[]).await
}

/// Create the fixture database and run `extra` statements against it.
pub(crate) async fn fixture_database_with(extra: &[&str]) -> (TempDir, SqlSession) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("trips.db").display());
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .unwrap();
    for statement in FIXTURE_STATEMENTS.iter().chain(extra) {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    (dir, SqlSession::from_pool(pool, "temp_traj_all"))
}
