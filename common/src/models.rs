use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Job Models
// ============================================================================

/// Latest accepted scheduling time, 9999-12-31T23:59:59Z
pub const MAX_SCHED_AT: i64 = 253_402_300_799;

/// Longest accepted timeout or retry delay, one hundred years in seconds
pub const MAX_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Identity of a job: unique per (function, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub func: String,
    pub name: String,
}

impl JobKey {
    pub fn new(func: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.func, self.name)
    }
}

/// JobStatus represents the lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Ready,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Done and failed jobs are kept only for status queries
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Job is the self-describing record persisted in the job store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub func: String,
    pub name: String,
    #[serde(default)]
    pub payload: String,
    /// Requested timeout in seconds; 0 falls back to the server default
    #[serde(default)]
    pub timeout: u64,
    /// Unix timestamp (seconds) at or after which the job may be dispatched
    pub sched_at: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Worker holding the job, only set while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<Uuid>,
    /// Unix timestamp of the last dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.func.clone(), self.name.clone())
    }

    /// Deadline in unix milliseconds for a dispatch at `now_ms`, or `None`
    /// when the job never times out
    pub fn deadline_millis(&self, now_ms: i64, default_timeout: u64) -> Option<i64> {
        let timeout = if self.timeout > 0 {
            self.timeout
        } else {
            default_timeout
        };
        if timeout == 0 {
            return None;
        }
        let timeout_ms = i64::try_from(timeout)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        Some(now_ms.saturating_add(timeout_ms))
    }
}

/// NewJob is what a client submits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub func: String,
    pub name: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub timeout: u64,
    /// Absent means "now"
    #[serde(default)]
    pub sched_at: Option<i64>,
}

impl NewJob {
    pub fn new(func: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            name: name.into(),
            payload: String::new(),
            timeout: 0,
            sched_at: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sched_at(mut self, sched_at: i64) -> Self {
        self.sched_at = Some(sched_at);
        self
    }

    /// Check the fields a submit cannot accept
    pub fn validate(&self) -> Result<(), String> {
        if self.func.is_empty() {
            return Err("function name is empty".to_string());
        }
        if self.name.is_empty() {
            return Err("job name is empty".to_string());
        }
        if self.timeout > MAX_DURATION_SECONDS {
            return Err(format!(
                "timeout {} exceeds {} seconds",
                self.timeout, MAX_DURATION_SECONDS
            ));
        }
        if let Some(sched_at) = self.sched_at {
            if !(0..=MAX_SCHED_AT).contains(&sched_at) {
                return Err(format!("sched_at {} is out of range", sched_at));
            }
        }
        Ok(())
    }
}

/// JobAssignment is what a worker receives from GRAB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub func: String,
    pub name: String,
    pub payload: String,
}

impl From<&Job> for JobAssignment {
    fn from(job: &Job) -> Self {
        Self {
            func: job.func.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
        }
    }
}

// ============================================================================
// Status Models
// ============================================================================

/// Per-status job counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub scheduled: usize,
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Scheduled => self.scheduled += 1,
            JobStatus::Ready => self.ready += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.scheduled + self.ready + self.running + self.done + self.failed
    }
}

/// Status of a single function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncStat {
    pub func: String,
    /// Number of workers subscribed to the function
    pub workers: usize,
    pub jobs: StatusCounts,
}

/// Unique id of a worker session
pub type WorkerId = Uuid;
