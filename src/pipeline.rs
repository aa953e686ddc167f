//! Region discovery, per-region HHI computation and accumulation of results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::HhiError;
use crate::hhi::{self, RegionShares};
use crate::models::{HhiRecord, RegionId, RunConfig, ShareRow, ShareTable};
use crate::output::{self, HhiAppender, ShareAppender, HHI_HEADERS, SHARE_HEADERS};
use crate::resource_manager::ResourceManager;
use crate::retry;
use crate::session::TripSource;

use hashbrown::HashSet;
use tokio::task::JoinSet;
use validator::Validate;

/// Number of share rows shown in debug logs for each region.
const SHARE_PREVIEW_ROWS: usize = 5;

/// Accumulated HHI records, at most one per region.
#[derive(Debug, Default)]
pub struct HhiTable {
    /// Records in accumulation order
    records: Vec<HhiRecord>,
    /// Regions present in `records`
    regions: HashSet<RegionId>,
}

impl HhiTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, rejecting a second record for the same region.
    pub fn push(&mut self, record: HhiRecord) -> Result<(), HhiError> {
        if !self.regions.insert(record.home_cbsa_id.clone()) {
            return Err(HhiError::DuplicateRegion {
                region: record.home_cbsa_id,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn contains(&self, region: &RegionId) -> bool {
        self.regions.contains(region)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in accumulation order.
    pub fn records(&self) -> &[HhiRecord] {
        &self.records
    }

    /// Records sorted into the order of `regions`.
    pub fn ordered_by(&self, regions: &[RegionId]) -> Vec<HhiRecord> {
        let mut records = self.records.clone();
        let position: hashbrown::HashMap<&RegionId, usize> = regions
            .iter()
            .enumerate()
            .map(|(index, region)| (region, index))
            .collect();
        records.sort_by_key(|record| {
            position
                .get(&record.home_cbsa_id)
                .copied()
                .unwrap_or(usize::MAX)
        });
        records
    }
}

/// Outcome of processing one region.
#[derive(Debug, PartialEq)]
pub enum RegionOutcome {
    /// A record was computed, with the share table when the region has trips.
    Computed {
        record: HhiRecord,
        shares: Option<ShareTable>,
    },
    /// The region has no trips and was left out.
    Skipped(RegionId),
}

/// Counts and paths of a completed run.
#[derive(Debug, PartialEq)]
pub struct RunSummary {
    /// Regions returned by discovery
    pub discovered: usize,
    /// Regions computed during this run
    pub processed: usize,
    /// Regions taken from an existing intermediate file
    pub resumed: usize,
    /// Regions left out because they have no trips
    pub skipped: usize,
    pub intermediate_output: PathBuf,
    pub final_output: PathBuf,
}

/// Discover the regions to process.
///
/// Duplicates returned by the source are dropped, keeping the first occurrence.
#[tracing::instrument(level = "DEBUG", skip_all)]
pub async fn discover_regions(
    source: &dyn TripSource,
    config: &RunConfig,
) -> Result<Vec<RegionId>, HhiError> {
    let regions =
        retry::with_backoff(&config.retry, "region discovery", || source.region_ids()).await?;
    let mut seen = HashSet::new();
    let unique: Vec<RegionId> = regions
        .into_iter()
        .filter(|region| seen.insert(region.clone()))
        .collect();
    tracing::info!("Found {} home_cbsa_ids.", unique.len());
    Ok(unique)
}

/// Query the trips of one region and compute its HHI.
///
/// # Arguments
///
/// * `source`: Trip source
/// * `region`: Region to process
/// * `config`: Run configuration
/// * `resource_manager`: Limits concurrent queries
#[tracing::instrument(level = "DEBUG", skip(source, config, resource_manager))]
pub async fn process_region(
    source: &dyn TripSource,
    region: &RegionId,
    config: &RunConfig,
    resource_manager: &ResourceManager,
) -> Result<RegionOutcome, HhiError> {
    tracing::info!("Processing home_cbsa_id: {}", region);

    let total_trips = {
        let _permit = resource_manager.query().await?;
        retry::with_backoff(&config.retry, "trip count query", || {
            source.region_trip_count(region)
        })
        .await?
    };
    let counts = {
        let _permit = resource_manager.query().await?;
        retry::with_backoff(&config.retry, "trip share query", || {
            source.bucket_counts(region, config.geohash_precision)
        })
        .await?
    };

    match hhi::share_table(region, total_trips, counts, config.empty_region_policy)? {
        RegionShares::Shares(table) => {
            for row in table.rows.iter().take(SHARE_PREVIEW_ROWS) {
                tracing::debug!(
                    "{} {} trips={} share={:.4}",
                    region,
                    row.end_geohash.as_deref().unwrap_or("NULL"),
                    row.trip_count,
                    row.share
                );
            }
            let value = hhi::table_hhi(&table);
            tracing::info!("Computed HHI {:.4} for {}.", value, region);
            Ok(RegionOutcome::Computed {
                record: HhiRecord::new(region.clone(), value),
                shares: Some(table),
            })
        }
        RegionShares::Zero => {
            tracing::warn!("No trips for {}, recording HHI 0", region);
            Ok(RegionOutcome::Computed {
                record: HhiRecord::new(region.clone(), 0.0),
                shares: None,
            })
        }
        RegionShares::Skipped => {
            tracing::warn!("No trips for {}, skipping", region);
            Ok(RegionOutcome::Skipped(region.clone()))
        }
    }
}

/// Load the records of a previous run for the discovered regions.
///
/// A torn last line left by an interrupted append is dropped.
fn resume_records(config: &RunConfig, regions: &[RegionId]) -> Result<Vec<HhiRecord>, HhiError> {
    if !config.resume || !config.intermediate_output.exists() {
        return Ok(Vec::new());
    }
    let discovered: HashSet<&RegionId> = regions.iter().collect();
    let mut records = output::read_appended::<HhiRecord>(&config.intermediate_output)?;
    records.retain(|record| {
        let keep = discovered.contains(&record.home_cbsa_id);
        if !keep {
            tracing::warn!(
                "Dropping resumed record for {}, which is no longer discovered",
                record.home_cbsa_id
            );
        }
        keep
    });
    tracing::info!(
        "Resuming with {} records from {}",
        records.len(),
        config.intermediate_output.display()
    );
    Ok(records)
}

/// Load the share rows of a previous run that belong to resumed records.
///
/// Share rows are written before their region's intermediate record, so every resumed region
/// has its complete share table and rows of any other region are stale. Without a share file,
/// no resumed record can be trusted and every region is computed again.
fn resume_shares(path: &Path, records: &mut Vec<HhiRecord>) -> Result<Vec<ShareRow>, HhiError> {
    if !path.exists() {
        if !records.is_empty() {
            tracing::warn!(
                "{} is missing, recomputing {} resumed regions",
                path.display(),
                records.len()
            );
            records.clear();
        }
        return Ok(Vec::new());
    }
    let resumed: HashSet<RegionId> = records
        .iter()
        .map(|record| record.home_cbsa_id.clone())
        .collect();
    let mut rows = output::read_appended::<ShareRow>(path)?;
    let total = rows.len();
    rows.retain(|row| resumed.contains(&row.home_cbsa_id));
    if rows.len() < total {
        tracing::warn!(
            "Dropping {} share rows of regions without a resumed record from {}",
            total - rows.len(),
            path.display()
        );
    }
    Ok(rows)
}

/// Results of the regions processed so far and the files they are written to.
struct Accumulator {
    table: HhiTable,
    intermediate: HhiAppender,
    shares: Option<ShareAppender>,
    processed: usize,
    skipped: usize,
}

impl Accumulator {
    /// Add the outcome of one region and persist it.
    fn accept(&mut self, outcome: RegionOutcome) -> Result<(), HhiError> {
        match outcome {
            RegionOutcome::Computed { record, shares } => {
                self.table.push(record.clone())?;
                // Shares go first: a record in the intermediate file implies complete shares.
                if let (Some(appender), Some(shares)) = (self.shares.as_mut(), shares.as_ref()) {
                    appender.append_all(&shares.rows)?;
                }
                self.intermediate.append(&record)?;
                self.processed += 1;
                tracing::info!("Saved {}", self.intermediate.path().display());
            }
            RegionOutcome::Skipped(_) => self.skipped += 1,
        }
        Ok(())
    }
}

/// Compute the HHI of every discovered region and write the output files.
///
/// Regions are processed by at most `config.concurrency` tasks. Each result is appended to the
/// intermediate file as soon as it is accepted; the final file lists every record in discovery
/// order. The first error aborts the outstanding tasks and is returned, leaving the intermediate
/// file with the records accepted so far.
///
/// # Arguments
///
/// * `source`: Trip source shared by the region tasks
/// * `config`: Run configuration
pub async fn run(source: Arc<dyn TripSource>, config: &RunConfig) -> Result<RunSummary, HhiError> {
    config.validate()?;

    let regions = discover_regions(source.as_ref(), config).await?;
    let mut records = resume_records(config, &regions)?;
    let share_rows = match &config.shares_output {
        Some(path) if config.resume => resume_shares(path, &mut records)?,
        _ => Vec::new(),
    };
    let mut resumed = HhiTable::new();
    for record in records {
        resumed.push(record)?;
    }

    // Both files are rewritten atomically with the resumed rows, so an interrupted start never
    // loses them and torn or stale rows do not survive.
    let shares = match &config.shares_output {
        Some(path) => {
            output::write_table(path, &SHARE_HEADERS, &share_rows)?;
            Some(ShareAppender::append_to(path)?)
        }
        None => None,
    };
    output::write_table(&config.intermediate_output, &HHI_HEADERS, resumed.records())?;
    let intermediate = HhiAppender::append_to(&config.intermediate_output)?;

    let resumed_count = resumed.len();
    let mut accumulator = Accumulator {
        table: resumed,
        intermediate,
        shares,
        processed: 0,
        skipped: 0,
    };

    let pending: Vec<RegionId> = regions
        .iter()
        .filter(|region| !accumulator.table.contains(region))
        .cloned()
        .collect();
    let config = Arc::new(config.clone());
    let resource_manager = Arc::new(ResourceManager::new(Some(
        config.max_connections.try_into()?,
    )));

    let mut pending = pending.into_iter();
    let mut tasks = JoinSet::new();
    loop {
        while tasks.len() < config.concurrency {
            let Some(region) = pending.next() else {
                break;
            };
            let source = source.clone();
            let config = config.clone();
            let resource_manager = resource_manager.clone();
            tasks.spawn(async move {
                process_region(source.as_ref(), &region, &config, &resource_manager).await
            });
        }
        match tasks.join_next().await {
            Some(joined) => accumulator.accept(joined??)?,
            None => break,
        }
    }

    let records = accumulator.table.ordered_by(&regions);
    output::write_table(&config.final_output, &HHI_HEADERS, &records)?;
    tracing::info!(
        "Saved {} with {} records",
        config.final_output.display(),
        records.len()
    );

    let summary = RunSummary {
        discovered: regions.len(),
        processed: accumulator.processed,
        resumed: resumed_count,
        skipped: accumulator.skipped,
        intermediate_output: config.intermediate_output.clone(),
        final_output: config.final_output.clone(),
    };
    tracing::info!(?summary, "Run complete");
    Ok(summary)
}
