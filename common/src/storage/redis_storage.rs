// Redis job store
//
// Layout:
//   periodic:funcs         set of function names
//   periodic:jobs:{func}   hash of job name to JSON job record

use crate::errors::StoreError;
use crate::models::Job;
use crate::storage::{JobStore, StoreStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, instrument};

const FUNCS_KEY: &str = "periodic:funcs";
const SCAN_BATCH: usize = 100;

/// Job store backed by Redis
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect with a connection manager (automatic reconnection)
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting to Redis job store");

        let client = Client::open(url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        let store = Self { manager };
        store.health_check().await?;

        info!("Redis job store connected");
        Ok(store)
    }

    fn jobs_key(func: &str) -> String {
        format!("periodic:jobs:{}", func)
    }

    /// Hash key and field holding a job record
    fn record_slot<'a>(func: &str, name: &'a str) -> (String, &'a str) {
        (Self::jobs_key(func), name)
    }

    /// Verify the connection answers PING
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(StoreError::Unavailable(format!(
                "Unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    /// Page through a set with SSCAN, one batch per poll
    fn scan_set(&self, key: String) -> StoreStream<'static> {
        self.scan("SSCAN", key, 1)
    }

    /// Page through the field names of a hash with HSCAN
    fn scan_hash_fields(&self, key: String) -> StoreStream<'static> {
        self.scan("HSCAN", key, 2)
    }

    /// Cursor scan; `stride` 2 keeps only the fields of field/value replies
    fn scan(&self, command: &'static str, key: String, stride: usize) -> StoreStream<'static> {
        let conn = self.manager.clone();

        stream::try_unfold(
            (conn, key, Some(0u64)),
            move |(mut conn, key, cursor)| async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, StoreError>(None);
                };

                let (next, reply): (u64, Vec<String>) = redis::cmd(command)
                    .arg(&key)
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;

                let batch: Vec<String> = reply.into_iter().step_by(stride).collect();
                let next = (next != 0).then_some(next);
                Ok::<_, StoreError>(Some((batch, (conn, key, next))))
            },
        )
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, StoreError>)))
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl JobStore for RedisStore {
    #[instrument(skip(self, job), fields(func = %job.func, name = %job.name))]
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let record = serde_json::to_string(job)?;
        let mut conn = self.manager.clone();
        let (key, field) = Self::record_slot(&job.func, &job.name);

        redis::pipe()
            .atomic()
            .hset(key, field, record)
            .ignore()
            .sadd(FUNCS_KEY, &job.func)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!("Job record stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, func: &str, name: &str) -> Result<Job, StoreError> {
        let mut conn = self.manager.clone();
        let (key, field) = Self::record_slot(func, name);
        let record: Option<String> = conn.hget(key, field).await?;

        match record {
            Some(record) => Ok(serde_json::from_str(&record)?),
            None => Err(StoreError::NotFound(format!("{}/{}", func, name))),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, func: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let (key, field) = Self::record_slot(func, name);

        let (remaining,): (usize,) = redis::pipe()
            .atomic()
            .hdel(&key, field)
            .ignore()
            .hlen(&key)
            .query_async(&mut conn)
            .await?;

        if remaining == 0 {
            let _: () = conn.srem(FUNCS_KEY, func).await?;
        }

        debug!("Job record removed");
        Ok(())
    }

    fn list_functions(&self) -> StoreStream<'_> {
        self.scan_set(FUNCS_KEY.to_string())
    }

    fn list_jobs<'a>(&'a self, func: &'a str) -> StoreStream<'a> {
        self.scan_hash_fields(Self::jobs_key(func))
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The connection manager closes when the last clone is dropped
        info!("Redis job store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            RedisStore::record_slot("email", "welcome-1"),
            ("periodic:jobs:email".to_string(), "welcome-1")
        );
    }

    #[test]
    fn test_separator_in_names_does_not_alias() {
        assert_ne!(
            RedisStore::record_slot("a:b", "c"),
            RedisStore::record_slot("a", "b:c")
        );
        assert_ne!(RedisStore::jobs_key("a:b"), RedisStore::jobs_key("a"));
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let result = RedisStore::connect("redis://invalid-host:9999").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_round_trip() {
        let store = RedisStore::connect("redis://localhost:6379").await.unwrap();
        let job = Job {
            func: "redis-test".to_string(),
            name: "a".to_string(),
            payload: "x".to_string(),
            timeout: 0,
            sched_at: 0,
            status: JobStatus::Ready,
            attempts: 0,
            worker: None,
            run_at: None,
        };
        store.put(&job).await.unwrap();
        assert_eq!(store.get("redis-test", "a").await.unwrap(), job);

        let names: Vec<String> = store.list_jobs("redis-test").try_collect().await.unwrap();
        assert!(names.contains(&"a".to_string()));

        store.remove("redis-test", "a").await.unwrap();
        assert!(store.get("redis-test", "a").await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_colon_names_stay_distinct() {
        let store = RedisStore::connect("redis://localhost:6379").await.unwrap();
        let record = |func: &str, name: &str| Job {
            func: func.to_string(),
            name: name.to_string(),
            payload: format!("{}/{}", func, name),
            timeout: 0,
            sched_at: 0,
            status: JobStatus::Ready,
            attempts: 0,
            worker: None,
            run_at: None,
        };
        let first = record("colon:a", "b");
        let second = record("colon", "a:b");
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        assert_eq!(store.get("colon:a", "b").await.unwrap(), first);
        assert_eq!(store.get("colon", "a:b").await.unwrap(), second);
        let names: Vec<String> = store.list_jobs("colon").try_collect().await.unwrap();
        assert_eq!(names, vec!["a:b".to_string()]);

        store.remove("colon:a", "b").await.unwrap();
        assert_eq!(store.get("colon", "a:b").await.unwrap(), second);
        store.remove("colon", "a:b").await.unwrap();
    }
}
