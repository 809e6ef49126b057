// SQLite job store: an embedded on-disk file, the default backend

use crate::errors::StoreError;
use crate::models::Job;
use crate::storage::{JobStore, StoreStream};
use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS periodic_jobs (
        func TEXT NOT NULL,
        name TEXT NOT NULL,
        record TEXT NOT NULL,
        PRIMARY KEY (func, name)
    )
"#;

/// Job store kept in a single SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database file, creating it and the table when missing
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StoreError> {
        info!("Opening SQLite job store");

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open SQLite database");
                StoreError::Unavailable(e.to_string())
            })?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        info!("SQLite job store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip(self, job), fields(func = %job.func, name = %job.name))]
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let record = serde_json::to_string(job)?;

        sqlx::query(
            r#"
            INSERT INTO periodic_jobs (func, name, record)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (func, name) DO UPDATE SET record = excluded.record
            "#,
        )
        .bind(&job.func)
        .bind(&job.name)
        .bind(record)
        .execute(&self.pool)
        .await?;

        debug!("Job record stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, func: &str, name: &str) -> Result<Job, StoreError> {
        let record: Option<String> =
            sqlx::query_scalar("SELECT record FROM periodic_jobs WHERE func = ?1 AND name = ?2")
                .bind(func)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match record {
            Some(record) => Ok(serde_json::from_str(&record)?),
            None => Err(StoreError::NotFound(format!("{}/{}", func, name))),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, func: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM periodic_jobs WHERE func = ?1 AND name = ?2")
            .bind(func)
            .bind(name)
            .execute(&self.pool)
            .await?;

        debug!("Job record removed");
        Ok(())
    }

    fn list_functions(&self) -> StoreStream<'_> {
        sqlx::query_scalar::<_, String>("SELECT DISTINCT func FROM periodic_jobs ORDER BY func")
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    fn list_jobs<'a>(&'a self, func: &'a str) -> StoreStream<'a> {
        sqlx::query_scalar::<_, String>("SELECT name FROM periodic_jobs WHERE func = ?1 ORDER BY name")
            .bind(func)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        info!("SQLite job store closed");
        Ok(())
    }
}
