//! Share and concentration computations.

use crate::error::HhiError;
use crate::models::{BucketCount, EmptyRegionPolicy, RegionId, ShareRow, ShareTable};

use ndarray::Array1;

/// Result of computing the shares of a region.
#[derive(Debug, PartialEq)]
pub enum RegionShares {
    /// The region has trips; shares are defined.
    Shares(ShareTable),
    /// The region has no trips and the policy asks for an HHI of zero.
    Zero,
    /// The region has no trips and the policy asks for it to be left out.
    Skipped,
}

/// Build the share table of a region from its grouped trip counts.
///
/// Each share is the bucket's trip count divided by `total_trips`.
///
/// # Arguments
///
/// * `region`: Region the counts belong to
/// * `total_trips`: Result of the region's filtered count
/// * `counts`: Result of the region's grouped count
/// * `policy`: What to do when the region has no trips
pub fn share_table(
    region: &RegionId,
    total_trips: i64,
    counts: Vec<BucketCount>,
    policy: EmptyRegionPolicy,
) -> Result<RegionShares, HhiError> {
    let bucketed: i64 = counts.iter().map(|count| count.trip_count).sum();
    if total_trips == 0 && bucketed == 0 {
        return match policy {
            EmptyRegionPolicy::Error => Err(HhiError::EmptyRegion {
                region: region.clone(),
            }),
            EmptyRegionPolicy::Skip => Ok(RegionShares::Skipped),
            EmptyRegionPolicy::Zero => Ok(RegionShares::Zero),
        };
    }
    // The two queries disagree if trips were written in between.
    if bucketed != total_trips {
        return Err(HhiError::TripCountMismatch {
            region: region.clone(),
            total: total_trips,
            bucketed,
        });
    }
    let total = total_trips as f64;
    let rows = counts
        .into_iter()
        .map(|count| ShareRow {
            home_cbsa_id: region.clone(),
            share: count.trip_count as f64 / total,
            end_geohash: count.bucket,
            trip_count: count.trip_count,
        })
        .collect();
    Ok(RegionShares::Shares(ShareTable {
        region: region.clone(),
        total_trips,
        rows,
    }))
}

/// Herfindahl-Hirschman Index of a set of shares: the sum of the squared shares.
///
/// For `k` non-empty buckets whose shares sum to one, the result lies in `[1/k, 1]`.
pub fn herfindahl_index(shares: &[f64]) -> f64 {
    let shares = Array1::from_vec(shares.to_vec());
    shares.dot(&shares)
}

/// Herfindahl-Hirschman Index of a region's share table.
pub fn table_hhi(table: &ShareTable) -> f64 {
    herfindahl_index(&table.shares())
}
