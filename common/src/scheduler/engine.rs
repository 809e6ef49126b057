// Scheduler engine: owns every scheduling structure behind one coordination lock

use crate::config::SchedulerConfig;
use crate::errors::SchedError;
use crate::models::{
    FuncStat, Job, JobKey, JobStatus, NewJob, StatusCounts, WorkerId, MAX_DURATION_SECONDS,
};
use crate::scheduler::funcs::FunctionTable;
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::supervisor::TimeoutSupervisor;
use crate::scheduler::timer::DelayTimer;
use crate::storage::JobStore;
use crate::telemetry;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, MutexGuard, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Current unix time in milliseconds
pub fn unix_now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

#[derive(Debug, Default)]
struct WorkerEntry {
    funcs: Vec<String>,
    assignment: Option<JobKey>,
}

/// Everything the coordination lock protects
struct SchedState {
    registry: JobRegistry,
    funcs: FunctionTable,
    timer: DelayTimer,
    supervisor: TimeoutSupervisor,
    workers: HashMap<WorkerId, WorkerEntry>,
}

impl SchedState {
    fn clear_assignment(&mut self, worker: WorkerId, key: &JobKey) {
        if let Some(entry) = self.workers.get_mut(&worker) {
            if entry.assignment.as_ref() == Some(key) {
                entry.assignment = None;
            }
        }
    }

    /// Persist a modified copy of a job; memory changes only on success
    async fn transition(
        &mut self,
        key: &JobKey,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, SchedError> {
        let mut job = self
            .registry
            .get(key)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(key.to_string()))?;
        apply(&mut job);
        self.registry.commit(job.clone()).await?;
        Ok(job)
    }

    /// The job, if it is running and held by `worker`
    fn owned_job(&self, key: &JobKey, worker: WorkerId) -> Result<&Job, SchedError> {
        match self.registry.get(key) {
            Some(job) if job.status == JobStatus::Running && job.worker == Some(worker) => Ok(job),
            _ => Err(SchedError::not_owner(&key.func, &key.name)),
        }
    }
}

/// The scheduler/dispatch engine
///
/// Owns the job registry, the function table, the delay timer and the
/// timeout supervisor. Every mutation takes the single state lock for its
/// whole duration, store write included, so dispatch and state transitions
/// are atomic with respect to concurrent submits, grabs and timeouts.
pub struct Sched {
    config: SchedulerConfig,
    state: Mutex<SchedState>,
    timer_wake: Notify,
    supervisor_wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl Sched {
    /// Build the scheduler, recovering all state from the store
    #[instrument(skip_all)]
    pub async fn new(
        store: Arc<dyn JobStore>,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>, SchedError> {
        let registry = JobRegistry::recover(store).await?;

        let mut timer = DelayTimer::new();
        let mut funcs = FunctionTable::new();
        let mut ready: Vec<&Job> = Vec::new();

        for job in registry.iter() {
            match job.status {
                JobStatus::Scheduled => {
                    timer.schedule(job.key(), job.sched_at);
                }
                JobStatus::Ready | JobStatus::Running => ready.push(job),
                JobStatus::Done | JobStatus::Failed => {}
            }
        }

        ready.sort_by(|a, b| (a.sched_at, &a.name).cmp(&(b.sched_at, &b.name)));
        for job in &ready {
            funcs.push_ready(&job.func, &job.name);
        }

        info!(
            jobs = registry.len(),
            ready = ready.len(),
            scheduled = timer.len(),
            "Scheduler state rebuilt"
        );

        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(SchedState {
                registry,
                funcs,
                timer,
                supervisor: TimeoutSupervisor::new(),
                workers: HashMap::new(),
            }),
            timer_wake: Notify::new(),
            supervisor_wake: Notify::new(),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }))
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the state lock for a mutating operation
    async fn lock_open(&self) -> Result<MutexGuard<'_, SchedState>, SchedError> {
        let state = self.state.lock().await;
        if self.is_closed() {
            return Err(SchedError::Shutdown);
        }
        Ok(state)
    }

    // ========== Client operations ==========

    /// Accept a new job, or reset a terminal one with the same identity
    #[instrument(skip(self, new_job), fields(func = %new_job.func, name = %new_job.name))]
    pub async fn submit(&self, new_job: NewJob) -> Result<(), SchedError> {
        new_job.validate().map_err(SchedError::InvalidJob)?;

        let mut state = self.lock_open().await?;
        let now_ms = unix_now_millis();
        let now = millis_to_secs(now_ms);
        let sched_at = new_job.sched_at.unwrap_or(now);
        let key = JobKey::new(new_job.func.clone(), new_job.name.clone());

        if let Some(existing) = state.registry.get(&key) {
            if !existing.status.is_terminal() {
                return Err(SchedError::JobExists {
                    func: key.func,
                    name: key.name,
                });
            }
        }

        let status = if sched_at > now {
            JobStatus::Scheduled
        } else {
            JobStatus::Ready
        };

        state
            .registry
            .commit(Job {
                func: new_job.func,
                name: new_job.name,
                payload: new_job.payload,
                timeout: new_job.timeout,
                sched_at,
                status,
                attempts: 0,
                worker: None,
                run_at: None,
            })
            .await?;

        telemetry::record_job_submitted(&key.func);

        if status == JobStatus::Scheduled {
            debug!(sched_at, "Job held by delay timer");
            if state.timer.schedule(key, sched_at) {
                self.timer_wake.notify_one();
            }
        } else {
            self.make_ready(&mut state, key, now_ms).await;
        }

        Ok(())
    }

    /// Job counts per function and status, optionally filtered
    pub async fn status(
        &self,
        func: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<FuncStat>, SchedError> {
        let state = self.state.lock().await;
        let mut stats: BTreeMap<String, FuncStat> = BTreeMap::new();

        let func_matches = |f: &str| func.map_or(true, |wanted| wanted == f);
        let mut job_found = false;

        for job in state.registry.iter() {
            if !func_matches(&job.func) || name.is_some_and(|n| n != job.name) {
                continue;
            }
            job_found = true;
            Self::stat_entry(&mut stats, &job.func).jobs.add(job.status);
        }

        for worker in state.workers.values() {
            for f in worker.funcs.iter().filter(|f| func_matches(f)) {
                Self::stat_entry(&mut stats, f).workers += 1;
            }
        }

        if let Some(name) = name {
            if !job_found {
                return Err(SchedError::NotFound(format!(
                    "job {}/{}",
                    func.unwrap_or("*"),
                    name
                )));
            }
        }
        if let Some(func) = func {
            if !stats.contains_key(func) {
                return Err(SchedError::NotFound(format!("function {}", func)));
            }
        }

        Ok(stats.into_values().collect())
    }

    fn stat_entry<'a>(stats: &'a mut BTreeMap<String, FuncStat>, func: &str) -> &'a mut FuncStat {
        stats.entry(func.to_string()).or_insert_with(|| FuncStat {
            func: func.to_string(),
            workers: 0,
            jobs: StatusCounts::default(),
        })
    }

    /// Full record of one job
    pub async fn info(&self, func: &str, name: &str) -> Result<Job, SchedError> {
        let state = self.state.lock().await;
        state
            .registry
            .get(&JobKey::new(func, name))
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("job {}/{}", func, name)))
    }

    /// Remove a function and every job under it, cancelling running ones
    #[instrument(skip(self))]
    pub async fn drop_function(&self, func: &str) -> Result<usize, SchedError> {
        let mut state = self.lock_open().await?;

        let keys: Vec<JobKey> = state.registry.jobs_for(func).map(Job::key).collect();
        let has_workers = state
            .workers
            .values()
            .any(|w| w.funcs.iter().any(|f| f == func));

        if keys.is_empty() && !has_workers {
            return Err(SchedError::NotFound(format!("function {}", func)));
        }

        for key in &keys {
            Self::purge(&mut state, key).await?;
        }

        info!(jobs = keys.len(), "Function dropped");
        Ok(keys.len())
    }

    /// Remove a single job, cancelling it if running
    #[instrument(skip(self))]
    pub async fn remove_job(&self, func: &str, name: &str) -> Result<(), SchedError> {
        let mut state = self.lock_open().await?;
        let key = JobKey::new(func, name);

        if state.registry.get(&key).is_none() {
            return Err(SchedError::NotFound(format!("job {}", key)));
        }

        Self::purge(&mut state, &key).await?;
        info!("Job removed");
        Ok(())
    }

    /// Delete a job everywhere; a worker holding it is released and its
    /// later report is answered with NotOwner
    async fn purge(state: &mut SchedState, key: &JobKey) -> Result<(), SchedError> {
        state.registry.delete(key).await?;
        state.timer.cancel(key);
        state.funcs.remove_ready(&key.func, &key.name);
        if let Some(worker) = state.supervisor.release(key) {
            debug!(job = %key, worker = %worker, "Cancelled running job");
            state.clear_assignment(worker, key);
        }
        Ok(())
    }

    // ========== Worker operations ==========

    /// Register a worker session with no subscriptions yet
    pub async fn register_worker(&self, worker: WorkerId) -> Result<(), SchedError> {
        let mut state = self.lock_open().await?;
        state.workers.entry(worker).or_default();
        Ok(())
    }

    /// Add functions to a worker's interest list, keeping first-seen order
    #[instrument(skip(self))]
    pub async fn subscribe(&self, worker: WorkerId, funcs: Vec<String>) -> Result<(), SchedError> {
        if funcs.iter().any(|f| f.is_empty()) {
            return Err(SchedError::ProtocolViolation(
                "function name is empty".to_string(),
            ));
        }

        let mut state = self.lock_open().await?;
        let entry = state.workers.entry(worker).or_default();
        for func in funcs {
            if !entry.funcs.contains(&func) {
                entry.funcs.push(func);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, worker: WorkerId, func: &str) -> Result<(), SchedError> {
        let mut state = self.lock_open().await?;
        if let Some(entry) = state.workers.get_mut(&worker) {
            entry.funcs.retain(|f| f != func);
        }
        Ok(())
    }

    /// Hand the worker a ready job from its functions, or wait for one
    ///
    /// Functions are scanned in subscription order. When nothing is ready
    /// the worker takes a waiting slot on each of them and the call
    /// suspends until a job is handed over. Dropping the returned future
    /// cancels the wait.
    #[instrument(skip(self))]
    pub async fn grab(&self, worker: WorkerId) -> Result<Job, SchedError> {
        let rx = {
            let mut state = self.lock_open().await?;

            let funcs = match state.workers.get(&worker) {
                Some(entry) if entry.funcs.is_empty() => {
                    return Err(SchedError::ProtocolViolation(
                        "grab without subscriptions".to_string(),
                    ))
                }
                Some(entry) => {
                    if let Some(held) = &entry.assignment {
                        return Err(SchedError::ProtocolViolation(format!(
                            "worker already holds {}",
                            held
                        )));
                    }
                    entry.funcs.clone()
                }
                None => {
                    return Err(SchedError::ProtocolViolation(
                        "grab from unknown worker".to_string(),
                    ))
                }
            };

            let now_ms = unix_now_millis();
            for func in &funcs {
                let Some(name) = state.funcs.pop_ready(func) else {
                    continue;
                };
                let key = JobKey::new(func.clone(), name);
                match self.assign(&mut state, &key, worker, now_ms).await {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        state.funcs.push_ready_front(&key.func, &key.name);
                        return Err(e);
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            state.funcs.add_waiter(worker, funcs, tx);
            telemetry::update_waiting_workers(state.funcs.waiting_count());
            debug!("Worker waiting for a job");
            rx
        };

        rx.await.map_err(|_| SchedError::Shutdown)
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, worker: WorkerId, func: &str, name: &str) -> Result<(), SchedError> {
        self.finish(worker, JobKey::new(func, name), JobStatus::Done)
            .await?;
        telemetry::record_job_completed(func);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn fail(&self, worker: WorkerId, func: &str, name: &str) -> Result<(), SchedError> {
        self.finish(worker, JobKey::new(func, name), JobStatus::Failed)
            .await?;
        telemetry::record_job_failed(func);
        Ok(())
    }

    async fn finish(&self, worker: WorkerId, key: JobKey, outcome: JobStatus) -> Result<(), SchedError> {
        let mut state = self.lock_open().await?;
        state.owned_job(&key, worker)?;

        state
            .transition(&key, |job| {
                job.status = outcome;
                job.worker = None;
            })
            .await?;

        state.supervisor.release(&key);
        state.clear_assignment(worker, &key);
        debug!(status = ?outcome, "Job finished");
        Ok(())
    }

    /// Give a running job back to be retried `delay` seconds from now
    #[instrument(skip(self))]
    pub async fn sched_later(
        &self,
        worker: WorkerId,
        func: &str,
        name: &str,
        delay: u64,
    ) -> Result<(), SchedError> {
        if delay > MAX_DURATION_SECONDS {
            return Err(SchedError::InvalidJob(format!(
                "delay {} exceeds {} seconds",
                delay, MAX_DURATION_SECONDS
            )));
        }

        let mut state = self.lock_open().await?;
        let key = JobKey::new(func, name);
        state.owned_job(&key, worker)?;

        let now_ms = unix_now_millis();
        let sched_at = millis_to_secs(now_ms).saturating_add(delay as i64);
        let status = if delay > 0 {
            JobStatus::Scheduled
        } else {
            JobStatus::Ready
        };

        state
            .transition(&key, |job| {
                job.status = status;
                job.sched_at = sched_at;
                job.worker = None;
            })
            .await?;

        state.supervisor.release(&key);
        state.clear_assignment(worker, &key);

        if status == JobStatus::Scheduled {
            if state.timer.schedule(key, sched_at) {
                self.timer_wake.notify_one();
            }
        } else {
            self.make_ready(&mut state, key, now_ms).await;
        }
        Ok(())
    }

    /// Forget a worker session; a job it was running is requeued at once
    #[instrument(skip(self))]
    pub async fn disconnect(&self, worker: WorkerId) {
        let mut state = self.state.lock().await;
        state.funcs.remove_waiters_for(worker);
        telemetry::update_waiting_workers(state.funcs.waiting_count());

        let Some(entry) = state.workers.remove(&worker) else {
            return;
        };
        let Some(key) = entry.assignment else {
            return;
        };

        if self.is_closed() {
            // No store writes after shutdown; recovery reclassifies it
            return;
        }

        if let Err(e) = self
            .requeue(&mut state, &key, worker, "disconnect", unix_now_millis())
            .await
        {
            // Still supervised, the deadline will requeue it
            error!(job = %key, error = %e, "Failed to requeue job of disconnected worker");
        }
    }

    /// Workers currently blocked in grab
    pub async fn waiting_workers(&self) -> usize {
        self.state.lock().await.funcs.waiting_count()
    }

    // ========== Dispatch ==========

    /// Move a ready job to running for `worker` and start its deadline
    async fn assign(
        &self,
        state: &mut SchedState,
        key: &JobKey,
        worker: WorkerId,
        now_ms: i64,
    ) -> Result<Job, SchedError> {
        let job = state
            .transition(key, |job| {
                job.status = JobStatus::Running;
                job.worker = Some(worker);
                job.run_at = Some(millis_to_secs(now_ms));
            })
            .await?;

        // Millisecond deadline so a dispatch late in a second still gets its full timeout
        let deadline = job.deadline_millis(now_ms, self.config.default_timeout_seconds);
        if state.supervisor.track(key.clone(), worker, deadline) {
            self.supervisor_wake.notify_one();
        }
        if let Some(entry) = state.workers.get_mut(&worker) {
            entry.assignment = Some(key.clone());
        }

        telemetry::record_job_dispatched(&key.func);
        debug!(job = %key, worker = %worker, ?deadline, "Job dispatched");
        Ok(job)
    }

    /// Route a job that just became ready: straight to the longest-waiting
    /// worker of its function, else to the tail of the ready queue
    async fn make_ready(&self, state: &mut SchedState, key: JobKey, now_ms: i64) {
        loop {
            let Some(waiter) = state.funcs.take_waiter(&key.func) else {
                state.funcs.push_ready(&key.func, &key.name);
                break;
            };

            let worker = waiter.worker;
            match self.assign(state, &key, worker, now_ms).await {
                Ok(job) => {
                    if waiter.deliver(job).is_ok() {
                        break;
                    }
                    // The grab was cancelled after the waiter was picked
                    if let Err(e) = self.unassign(state, &key, worker).await {
                        error!(job = %key, error = %e, "Failed to take back undelivered job");
                        break;
                    }
                }
                Err(e) => {
                    error!(job = %key, error = %e, "Failed to hand job to waiting worker");
                    state.funcs.restore_waiter(waiter);
                    state.funcs.push_ready(&key.func, &key.name);
                    break;
                }
            }
        }

        telemetry::update_waiting_workers(state.funcs.waiting_count());
    }

    /// Undo an assignment that never reached the worker; attempts unchanged
    async fn unassign(
        &self,
        state: &mut SchedState,
        key: &JobKey,
        worker: WorkerId,
    ) -> Result<(), SchedError> {
        state
            .transition(key, |job| {
                job.status = JobStatus::Ready;
                job.worker = None;
            })
            .await?;
        state.supervisor.release(key);
        state.clear_assignment(worker, key);
        Ok(())
    }

    /// Return a running job to ready with one more attempt
    async fn requeue(
        &self,
        state: &mut SchedState,
        key: &JobKey,
        worker: WorkerId,
        reason: &'static str,
        now_ms: i64,
    ) -> Result<(), SchedError> {
        if state.owned_job(key, worker).is_err() {
            return Ok(());
        }

        let job = state
            .transition(key, |job| {
                job.status = JobStatus::Ready;
                job.worker = None;
                job.attempts += 1;
            })
            .await?;

        state.supervisor.release(key);
        state.clear_assignment(worker, key);
        telemetry::record_job_requeued(&key.func, reason);
        info!(job = %key, attempts = job.attempts, reason, "Job requeued");

        self.make_ready(state, key.clone(), now_ms).await;
        Ok(())
    }

    // ========== Timing ==========

    /// Promote every scheduled job due at `now_ms`
    async fn promote_due(&self, state: &mut SchedState, now_ms: i64) -> usize {
        let now = millis_to_secs(now_ms);
        let mut promoted = 0;

        for key in state.timer.pop_due(now) {
            let still_scheduled = state
                .registry
                .get(&key)
                .is_some_and(|job| job.status == JobStatus::Scheduled);
            if !still_scheduled {
                continue;
            }

            match state
                .transition(&key, |job| job.status = JobStatus::Ready)
                .await
            {
                Ok(_) => {
                    self.make_ready(state, key, now_ms).await;
                    promoted += 1;
                }
                Err(e) => {
                    warn!(job = %key, error = %e, "Failed to promote job, retrying shortly");
                    state.timer.schedule(key, now.saturating_add(1));
                }
            }
        }

        promoted
    }

    /// Requeue every running job whose deadline passed at `now_ms`
    async fn expire_due(&self, state: &mut SchedState, now_ms: i64) -> usize {
        let mut expired = 0;

        for (key, worker) in state.supervisor.pop_expired(now_ms) {
            match self.requeue(state, &key, worker, "timeout", now_ms).await {
                Ok(()) => expired += 1,
                Err(e) => {
                    warn!(job = %key, error = %e, "Failed to requeue timed out job, retrying shortly");
                    state
                        .supervisor
                        .track(key, worker, Some(now_ms.saturating_add(1000)));
                }
            }
        }

        expired
    }

    /// Run one round of promotion and expiry as of unix second `now`
    ///
    /// The timing loops call this continuously; exposed so callers can
    /// drive the scheduler with their own clock.
    pub async fn tick(&self, now: i64) -> Result<(usize, usize), SchedError> {
        let now_ms = now.saturating_mul(1000);
        let mut state = self.lock_open().await?;
        let promoted = self.promote_due(&mut state, now_ms).await;
        let expired = self.expire_due(&mut state, now_ms).await;
        Ok((promoted, expired))
    }

    /// Delay timer loop: sleeps until the earliest scheduled job is due
    pub async fn run_delay_timer(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_receiver();
        info!("Delay timer started");

        while !self.is_closed() {
            let next = {
                let mut state = self.state.lock().await;
                let promoted = self.promote_due(&mut state, unix_now_millis()).await;
                if promoted > 0 {
                    debug!(promoted, "Promoted scheduled jobs");
                }
                state.timer.next_deadline()
            };

            tokio::select! {
                _ = sleep_until_millis(next.map(|at| at.saturating_mul(1000))) => {}
                _ = self.timer_wake.notified() => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Delay timer stopped");
    }

    /// Timeout supervisor loop: sleeps until the earliest deadline
    pub async fn run_timeout_supervisor(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_receiver();
        info!("Timeout supervisor started");

        while !self.is_closed() {
            let next = {
                let mut state = self.state.lock().await;
                let expired = self.expire_due(&mut state, unix_now_millis()).await;
                if expired > 0 {
                    debug!(expired, "Requeued timed out jobs");
                }
                state.supervisor.next_deadline()
            };

            tokio::select! {
                _ = sleep_until_millis(next) => {}
                _ = self.supervisor_wake.notified() => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Timeout supervisor stopped");
    }

    // ========== Shutdown ==========

    /// Stop accepting mutations, stop the timing loops and release waiters
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let released = state.funcs.clear_waiters();
        info!(released_waiters = released, "Scheduler shut down");
    }

    /// Close the job store; shuts the scheduler down first if needed
    pub async fn close_store(&self) -> Result<(), SchedError> {
        self.shutdown().await;
        let state = self.state.lock().await;
        state
            .registry
            .store()
            .close()
            .await
            .map_err(|e| SchedError::StoreUnavailable(e.to_string()))
    }
}

/// Time left until `deadline_ms`, zero once it has passed
fn wait_until(deadline_ms: i64, now_ms: i64) -> Duration {
    let wait_ms = deadline_ms.saturating_sub(now_ms).max(0);
    Duration::from_millis(wait_ms as u64)
}

/// Sleep until the given unix millisecond, or forever when there is none
async fn sleep_until_millis(deadline_ms: Option<i64>) {
    match deadline_ms {
        Some(deadline_ms) => tokio::time::sleep(wait_until(deadline_ms, unix_now_millis())).await,
        None => std::future::pending::<()>().await,
    }
}
