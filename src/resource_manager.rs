//! Resource management

use crate::error::HhiError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate resources to
/// region tasks. Resource management is performed using a Tokio Semaphore.
///
/// Queries wait here for a free slot rather than in the connection pool, where a long wait ends
/// in a pool timeout.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for in-flight database queries.
    queries: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(query_limit: Option<usize>) -> Self {
        Self {
            queries: query_limit.map(Semaphore::new),
        }
    }

    /// Acquire a database query resource.
    pub async fn query(&self) -> Result<Option<SemaphorePermit>, HhiError> {
        optional_acquire(&self.queries, 1).await
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
    n: usize,
) -> Result<Option<SemaphorePermit>, HhiError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.acquire_many(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
