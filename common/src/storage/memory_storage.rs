// In-process job store, the default backend and the one used in tests

use crate::errors::StoreError;
use crate::models::Job;
use crate::storage::{JobStore, StoreStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Records = BTreeMap<String, BTreeMap<String, Job>>;

/// Job store backed by a process-local map
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Records>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Records>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.write()?
            .entry(job.func.clone())
            .or_default()
            .insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, func: &str, name: &str) -> Result<Job, StoreError> {
        self.read()?
            .get(func)
            .and_then(|jobs| jobs.get(name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", func, name)))
    }

    async fn remove(&self, func: &str, name: &str) -> Result<(), StoreError> {
        let mut records = self.write()?;
        if let Some(jobs) = records.get_mut(func) {
            jobs.remove(name);
            if jobs.is_empty() {
                records.remove(func);
            }
        }
        Ok(())
    }

    fn list_functions(&self) -> StoreStream<'_> {
        match self.read() {
            Ok(records) => {
                let names: Vec<String> = records.keys().cloned().collect();
                stream::iter(names.into_iter().map(Ok)).boxed()
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    fn list_jobs<'a>(&'a self, func: &'a str) -> StoreStream<'a> {
        match self.read() {
            Ok(records) => {
                let names: Vec<String> = records
                    .get(func)
                    .map(|jobs| jobs.keys().cloned().collect())
                    .unwrap_or_default();
                stream::iter(names.into_iter().map(Ok)).boxed()
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use futures::TryStreamExt;

    fn job(func: &str, name: &str) -> Job {
        Job {
            func: func.to_string(),
            name: name.to_string(),
            payload: String::new(),
            timeout: 0,
            sched_at: 0,
            status: JobStatus::Ready,
            attempts: 0,
            worker: None,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryStore::new();
        store.put(&job("email", "a")).await.unwrap();

        let loaded = store.get("email", "a").await.unwrap();
        assert_eq!(loaded.name, "a");

        store.remove("email", "a").await.unwrap();
        assert!(matches!(
            store.get("email", "a").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = MemoryStore::new();
        let mut record = job("email", "a");
        store.put(&record).await.unwrap();
        record.status = JobStatus::Done;
        store.put(&record).await.unwrap();

        let loaded = store.get("email", "a").await.unwrap();
        assert_eq!(loaded.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_listings_are_restartable() {
        let store = MemoryStore::new();
        store.put(&job("email", "a")).await.unwrap();
        store.put(&job("email", "b")).await.unwrap();
        store.put(&job("sms", "c")).await.unwrap();

        let first: Vec<String> = store.list_functions().try_collect().await.unwrap();
        let second: Vec<String> = store.list_functions().try_collect().await.unwrap();
        assert_eq!(first, vec!["email", "sms"]);
        assert_eq!(first, second);

        let jobs: Vec<String> = store.list_jobs("email").try_collect().await.unwrap();
        assert_eq!(jobs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_function_is_pruned() {
        let store = MemoryStore::new();
        store.put(&job("email", "a")).await.unwrap();
        store.remove("email", "a").await.unwrap();

        let funcs: Vec<String> = store.list_functions().try_collect().await.unwrap();
        assert!(funcs.is_empty());
    }
}
