//! SQL statements issued against the trip table.
//!
//! The statements stick to the subset of SQL shared by PostgreSQL and SQLite. The table name is
//! interpolated and must have been validated by [RunConfig](crate::models::RunConfig); the region
//! identifier is always a bind parameter.

/// Trips that start and end in the same home region.
const SAME_REGION: &str = "end_cbsa_id = home_cbsa_id";

/// Returns the region discovery statement.
///
/// Produces one `home_cbsa_id` column with the distinct home regions of trips ending in their
/// home region.
pub fn region_ids(table: &str) -> String {
    format!(
        "SELECT DISTINCT CAST(home_cbsa_id AS VARCHAR) AS home_cbsa_id \
         FROM {table} \
         WHERE {SAME_REGION} AND home_cbsa_id IS NOT NULL \
         ORDER BY 1"
    )
}

/// Returns the statement counting a region's trips.
///
/// Takes the region identifier as its only bind parameter.
pub fn region_trip_count(table: &str) -> String {
    format!(
        "SELECT COUNT(*) AS trip_count \
         FROM {table} \
         WHERE {SAME_REGION} AND CAST(home_cbsa_id AS VARCHAR) = $1"
    )
}

/// Returns the statement counting a region's trips per truncated end geohash.
///
/// Takes the region identifier as its only bind parameter. Trips without an end geohash form
/// their own NULL bucket, distinct from the empty-string bucket.
pub fn bucket_counts(table: &str, precision: usize) -> String {
    let bucket = format!("SUBSTR(end_geohash, 1, {precision})");
    format!(
        "SELECT {bucket} AS end_geohash, COUNT(*) AS trip_count \
         FROM {table} \
         WHERE {SAME_REGION} AND CAST(home_cbsa_id AS VARCHAR) = $1 \
         GROUP BY {bucket} \
         ORDER BY 1"
    )
}
