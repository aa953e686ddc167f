//! Data types and associated functions and methods

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use validator::Validate;

lazy_static! {
    /// A plain or schema-qualified SQL identifier, e.g. `temp_traj_all` or `mobility.trips`.
    static ref TABLE_IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*){0,2}$").unwrap();
}

/// Identifier of a home region (`home_cbsa_id`)
///
/// Treated as an opaque key and carried as text regardless of the column type in the source
/// table.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RegionId {
    fn from(value: &str) -> Self {
        RegionId(value.to_string())
    }
}

impl From<String> for RegionId {
    fn from(value: String) -> Self {
        RegionId(value)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of trips ending in one truncated geohash bucket
#[derive(Clone, Debug, PartialEq)]
pub struct BucketCount {
    /// Truncated end geohash, `None` for trips without one
    pub bucket: Option<String>,
    /// Number of trips ending in the bucket
    pub trip_count: i64,
}

impl BucketCount {
    pub fn new(bucket: &str, trip_count: i64) -> Self {
        BucketCount {
            bucket: Some(bucket.to_string()),
            trip_count,
        }
    }

    /// Count of the trips that have no end geohash.
    pub fn missing(trip_count: i64) -> Self {
        BucketCount {
            bucket: None,
            trip_count,
        }
    }
}

/// One row of a share table, as written to the share output file
///
/// A missing end geohash is written as an empty cell.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ShareRow {
    pub home_cbsa_id: RegionId,
    pub end_geohash: Option<String>,
    pub trip_count: i64,
    pub share: f64,
}

/// Destination shares of a single region
///
/// The trip counts of the rows partition `total_trips` exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct ShareTable {
    /// Region the shares belong to
    pub region: RegionId,
    /// Total number of trips of the region
    pub total_trips: i64,
    /// One row per non-empty bucket
    pub rows: Vec<ShareRow>,
}

impl ShareTable {
    /// Returns the shares in row order.
    pub fn shares(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.share).collect()
    }
}

/// One row of the HHI output files
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HhiRecord {
    pub home_cbsa_id: RegionId,
    pub hhi: f64,
}

impl HhiRecord {
    pub fn new(home_cbsa_id: RegionId, hhi: f64) -> Self {
        HhiRecord { home_cbsa_id, hhi }
    }
}

/// What to do with a discovered region that has no matching trips
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum EmptyRegionPolicy {
    /// Fail the run
    #[default]
    Error,
    /// Emit no row for the region
    Skip,
    /// Emit a row with an HHI of zero
    Zero,
}

/// Retry settings for database queries
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Number of additional attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every further attempt
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Return a retry policy with the default backoff cap.
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        RetryPolicy {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Returns the delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Settings of a single run
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct RunConfig {
    /// Table holding the trip records
    #[validate(regex(
        path = "TABLE_IDENTIFIER",
        message = "table must be a plain or dotted SQL identifier"
    ))]
    pub table: String,
    /// Length of the geohash prefix used as bucket
    #[validate(range(min = 1, max = 12, message = "geohash precision must be between 1 and 12"))]
    pub geohash_precision: usize,
    /// File rewritten incrementally as regions complete
    pub intermediate_output: PathBuf,
    /// File written once the run completes
    pub final_output: PathBuf,
    /// Optional file receiving every region's share table
    pub shares_output: Option<PathBuf>,
    /// Maximum number of regions processed concurrently
    #[validate(range(min = 1, message = "concurrency must be greater than 0"))]
    pub concurrency: usize,
    /// Maximum number of in-flight queries, matching the connection pool size
    #[validate(range(min = 1, message = "max connections must be greater than 0"))]
    pub max_connections: u32,
    /// Policy for regions without trips
    pub empty_region_policy: EmptyRegionPolicy,
    /// Retry settings for every query
    pub retry: RetryPolicy,
    /// Continue from an existing intermediate file
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            table: "temp_traj_all".to_string(),
            geohash_precision: 5,
            intermediate_output: PathBuf::from("intermediate_hhi_results.csv"),
            final_output: PathBuf::from("final_hhi_results.csv"),
            shares_output: None,
            concurrency: 1,
            max_connections: 4,
            empty_region_policy: EmptyRegionPolicy::Error,
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
            resume: false,
        }
    }
}
