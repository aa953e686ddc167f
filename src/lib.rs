//! This crate computes the Herfindahl-Hirschman Index (HHI) of trip destinations for every home
//! region of a mobility dataset.
//!
//! For each home region (`home_cbsa_id`) the trips that start and end in that region are grouped
//! into coarse spatial buckets by truncating their end geohash. Each bucket's share of the
//! region's trips is computed, and the HHI is the sum of the squared shares: 1 when every trip
//! ends in the same bucket, approaching 0 when trips spread evenly over many buckets.
//!
//! Results are appended to an intermediate CSV file as each region completes, so an interrupted
//! run leaves a valid partial table behind, and a final CSV file is written once all regions are
//! processed.
//!
//! The crate is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, runs region tasks concurrently.
//! * [sqlx] queries the trip table in PostgreSQL or SQLite.
//! * [ndarray] provides the share vectors.
//! * [csv] and [Serde](serde) write the result tables.

pub mod cli;
pub mod error;
pub mod hhi;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod resource_manager;
pub mod retry;
pub mod session;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
