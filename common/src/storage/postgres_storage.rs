// PostgreSQL job store

use crate::errors::StoreError;
use crate::models::Job;
use crate::storage::{JobStore, StoreStream};
use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS periodic_jobs (
        func TEXT NOT NULL,
        name TEXT NOT NULL,
        record JSONB NOT NULL,
        PRIMARY KEY (func, name)
    )
"#;

/// Job store backed by a `periodic_jobs` table, one row per job
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and create the table if it does not exist yet
    #[instrument(skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!("Connecting to PostgreSQL job store");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create database pool");
                StoreError::Unavailable(e.to_string())
            })?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        info!(max_connections, "PostgreSQL job store connected");
        Ok(Self { pool })
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(func = %job.func, name = %job.name))]
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let record = serde_json::to_value(job)?;

        sqlx::query(
            r#"
            INSERT INTO periodic_jobs (func, name, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (func, name) DO UPDATE SET record = EXCLUDED.record
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
        let record: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT record FROM periodic_jobs WHERE func = $1 AND name = $2",
        )
        .bind(func)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(serde_json::from_value(record)?),
            None => Err(StoreError::NotFound(format!("{}/{}", func, name))),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, func: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM periodic_jobs WHERE func = $1 AND name = $2")
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
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM periodic_jobs WHERE func = $1 ORDER BY name",
        )
        .bind(func)
        .fetch(&self.pool)
        .map_err(StoreError::from)
        .boxed()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        info!("PostgreSQL job store closed");
        Ok(())
    }
}
