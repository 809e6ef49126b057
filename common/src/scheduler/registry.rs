// Job registry: authoritative in-memory view of every job, written through to the store

use crate::errors::{SchedError, StoreError};
use crate::models::{Job, JobKey, JobStatus};
use crate::storage::JobStore;
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// In-memory map from (function, name) to job, backed by a `JobStore`
///
/// Every mutation reaches the store before memory. A failed store write
/// leaves the in-memory state untouched and surfaces as
/// `SchedError::PersistenceFailed`.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    jobs: BTreeMap<JobKey, Job>,
}

impl JobRegistry {
    /// Create an empty registry without reading the store
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            jobs: BTreeMap::new(),
        }
    }

    /// Rebuild the registry from the store
    ///
    /// Jobs persisted as running are moved back to ready: no worker
    /// survives a restart. Any store error here is `StoreUnavailable`.
    #[instrument(skip(store))]
    pub async fn recover(store: Arc<dyn JobStore>) -> Result<Self, SchedError> {
        let unavailable = |e: StoreError| SchedError::StoreUnavailable(e.to_string());

        let funcs: Vec<String> = store
            .list_functions()
            .try_collect()
            .await
            .map_err(unavailable)?;

        let mut jobs = BTreeMap::new();
        let mut reclaimed = 0usize;

        for func in &funcs {
            let names: Vec<String> = store.list_jobs(func).try_collect().await.map_err(unavailable)?;

            for name in names {
                let mut job = match store.get(func, &name).await {
                    Ok(job) => job,
                    Err(StoreError::NotFound(_)) => {
                        warn!(func = %func, name = %name, "Listed job has no record, skipping");
                        continue;
                    }
                    Err(e) => return Err(unavailable(e)),
                };

                if job.status == JobStatus::Running {
                    job.status = JobStatus::Ready;
                    job.worker = None;
                    store.put(&job).await.map_err(unavailable)?;
                    reclaimed += 1;
                }

                jobs.insert(job.key(), job);
            }
        }

        info!(
            functions = funcs.len(),
            jobs = jobs.len(),
            reclaimed,
            "Job registry recovered from store"
        );

        Ok(Self { store, jobs })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn get(&self, key: &JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Jobs of one function, ordered by name
    pub fn jobs_for<'a>(&'a self, func: &'a str) -> impl Iterator<Item = &'a Job> + 'a {
        let start = JobKey::new(func, "");
        self.jobs
            .range(start..)
            .take_while(move |(key, _)| key.func == func)
            .map(|(_, job)| job)
    }

    #[cfg(test)]
    fn has_jobs(&self, func: &str) -> bool {
        self.jobs_for(func).next().is_some()
    }

    /// Persist `job` and then record it in memory
    pub async fn commit(&mut self, job: Job) -> Result<(), SchedError> {
        self.store
            .put(&job)
            .await
            .map_err(|e| SchedError::PersistenceFailed(e.to_string()))?;
        self.jobs.insert(job.key(), job);
        Ok(())
    }

    /// Remove a job from the store and then from memory
    pub async fn delete(&mut self, key: &JobKey) -> Result<Option<Job>, SchedError> {
        self.store
            .remove(&key.func, &key.name)
            .await
            .map_err(|e| SchedError::PersistenceFailed(e.to_string()))?;
        Ok(self.jobs.remove(key))
    }
}
