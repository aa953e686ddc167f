//! Error handling.

use thiserror::Error;
use tokio::sync::AcquireError;

use crate::models::RegionId;

/// HHI computation error type
///
/// This type encapsulates the various errors that may occur during a run.
#[derive(Debug, Error)]
pub enum HhiError {
    /// Error writing or reading a CSV file
    #[error("CSV error")]
    Csv(#[from] csv::Error),

    /// Error returned by the database driver
    #[error("database query failed")]
    Database(#[from] sqlx::Error),

    /// The same region was accumulated twice
    #[error("region {region} has already been accumulated")]
    DuplicateRegion { region: RegionId },

    /// A discovered region has no matching trips
    #[error("region {region} has no trips ending in the home region")]
    EmptyRegion { region: RegionId },

    /// Run configuration failed validation
    #[error("run configuration is not valid")]
    InvalidConfig(#[from] validator::ValidationErrors),

    /// Invalid database URL
    #[error("database URL is not valid")]
    InvalidDatabaseUrl(#[from] url::ParseError),

    /// Error accessing an output file
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error renaming the temporary final output into place
    #[error("failed to persist output file")]
    Persist(#[from] tempfile::PersistError),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// A region worker panicked or was cancelled
    #[error("region task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// The grouped counts do not add up to the filtered total
    #[error("bucket counts for region {region} sum to {bucketed}, expected {total}")]
    TripCountMismatch {
        region: RegionId,
        total: i64,
        bucketed: i64,
    },

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl HhiError {
    /// Returns whether the error is a transient database fault that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            HhiError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Console report of an error
///
/// Holds the main message and the chain of causes, with consecutive duplicates removed.
#[derive(Debug, PartialEq)]
pub struct ErrorReport {
    /// Main error message
    pub message: String,

    /// Optional list of causes
    pub caused_by: Option<Vec<String>>,
}

impl ErrorReport {
    /// Return a new ErrorReport
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorReport { message, caused_by }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error: {}", self.message)?;
        if let Some(caused_by) = &self.caused_by {
            for cause in caused_by {
                write!(f, "\n  caused by: {}", cause)?;
            }
        }
        Ok(())
    }
}
