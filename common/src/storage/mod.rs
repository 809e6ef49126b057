// Job store contract and its backends

pub mod memory_storage;
pub mod postgres_storage;
pub mod redis_storage;
pub mod sqlite_storage;

pub use memory_storage::MemoryStore;
pub use postgres_storage::PostgresStore;
pub use redis_storage::RedisStore;
pub use sqlite_storage::SqliteStore;

use crate::config::{StoreConfig, StoreDriver};
use crate::errors::StoreError;
use crate::models::Job;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{info, instrument};

/// Lazy, finite sequence produced by store listings
pub type StoreStream<'a> = BoxStream<'a, Result<String, StoreError>>;

/// Durable CRUD over job records, keyed by (function, name)
///
/// Implementations must be safe to call concurrently. No cross-key
/// transactions are required: job records are self-describing, so
/// re-applying a `put` after a partial failure is always safe.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job record, `StoreError::NotFound` if absent
    async fn get(&self, func: &str, name: &str) -> Result<Job, StoreError>;

    /// Delete a job record; deleting a missing record is not an error
    async fn remove(&self, func: &str, name: &str) -> Result<(), StoreError>;

    /// Names of every function that has at least one job.
    /// Each call starts a fresh listing.
    fn list_functions(&self) -> StoreStream<'_>;

    /// Names of the jobs stored under `func`
    fn list_jobs<'a>(&'a self, func: &'a str) -> StoreStream<'a>;

    /// Release underlying resources
    async fn close(&self) -> Result<(), StoreError>;
}

/// Open the backend selected by configuration
#[instrument(skip(config), fields(driver = ?config.driver))]
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    let store: Arc<dyn JobStore> = match config.driver {
        StoreDriver::Memory => Arc::new(MemoryStore::new()),
        StoreDriver::Sqlite => {
            let path = config
                .sqlite_path
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("sqlite_path is not set".to_string()))?;
            Arc::new(SqliteStore::open(path, config.max_connections).await?)
        }
        StoreDriver::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("redis_url is not set".to_string()))?;
            Arc::new(RedisStore::connect(url).await?)
        }
        StoreDriver::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("database_url is not set".to_string()))?;
            Arc::new(PostgresStore::connect(url, config.max_connections).await?)
        }
    };

    info!("Job store ready");
    Ok(store)
}
