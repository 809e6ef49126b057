// Timeout supervisor: in-flight jobs and their deadlines

use crate::models::{JobKey, WorkerId};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy)]
struct InFlight {
    worker: WorkerId,
    deadline: Option<i64>,
    seq: u64,
}

/// Tracks which worker holds each running job and when it expires
///
/// Jobs dispatched without any timeout are tracked but never expire; only
/// a report or a worker disconnect releases them.
/// Deadlines are unix milliseconds.
#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    deadlines: BTreeSet<(i64, u64, JobKey)>,
    in_flight: HashMap<JobKey, InFlight>,
    next_seq: u64,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start supervising a dispatched job. Returns true when the earliest
    /// deadline moved forward.
    pub fn track(&mut self, key: JobKey, worker: WorkerId, deadline: Option<i64>) -> bool {
        self.release(&key);

        let earliest = self.next_deadline();
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, seq, key.clone()));
        }
        self.in_flight.insert(
            key,
            InFlight {
                worker,
                deadline,
                seq,
            },
        );

        match (deadline, earliest) {
            (Some(d), Some(e)) => d < e,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Stop supervising a job, returning the worker that held it
    pub fn release(&mut self, key: &JobKey) -> Option<WorkerId> {
        let entry = self.in_flight.remove(key)?;
        if let Some(deadline) = entry.deadline {
            self.deadlines.remove(&(deadline, entry.seq, key.clone()));
        }
        Some(entry.worker)
    }

    #[cfg(test)]
    fn holder(&self, key: &JobKey) -> Option<WorkerId> {
        self.in_flight.get(key).map(|e| e.worker)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.deadlines.first().map(|(deadline, _, _)| *deadline)
    }

    /// Remove and return every job whose deadline is at or before `now_ms`
    pub fn pop_expired(&mut self, now_ms: i64) -> Vec<(JobKey, WorkerId)> {
        let mut expired = Vec::new();
        while let Some((deadline, _, _)) = self.deadlines.first() {
            if *deadline > now_ms {
                break;
            }
            if let Some((_, _, key)) = self.deadlines.pop_first() {
                if let Some(entry) = self.in_flight.remove(&key) {
                    expired.push((key, entry.worker));
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let mut supervisor = TimeoutSupervisor::new();
        let worker = Uuid::new_v4();
        supervisor.track(JobKey::new("email", "slow"), worker, Some(30));
        supervisor.track(JobKey::new("email", "fast"), worker, Some(10));

        let expired = supervisor.pop_expired(30);
        let keys: Vec<String> = expired.into_iter().map(|(k, _)| k.name).collect();
        assert_eq!(keys, vec!["fast", "slow"]);
        assert!(supervisor.is_empty());
    }

    #[test]
    fn test_release_before_deadline() {
        let mut supervisor = TimeoutSupervisor::new();
        let worker = Uuid::new_v4();
        let key = JobKey::new("email", "a");
        supervisor.track(key.clone(), worker, Some(10));

        assert_eq!(supervisor.release(&key), Some(worker));
        assert!(supervisor.pop_expired(100).is_empty());
        assert_eq!(supervisor.next_deadline(), None);
    }

    #[test]
    fn test_untimed_job_never_expires() {
        let mut supervisor = TimeoutSupervisor::new();
        let worker = Uuid::new_v4();
        let key = JobKey::new("email", "a");
        assert!(!supervisor.track(key.clone(), worker, None));

        assert!(supervisor.pop_expired(i64::MAX).is_empty());
        assert_eq!(supervisor.holder(&key), Some(worker));
    }

    #[test]
    fn test_track_reports_new_earliest() {
        let mut supervisor = TimeoutSupervisor::new();
        let worker = Uuid::new_v4();
        assert!(supervisor.track(JobKey::new("email", "a"), worker, Some(50)));
        assert!(!supervisor.track(JobKey::new("email", "b"), worker, Some(60)));
        assert!(supervisor.track(JobKey::new("email", "c"), worker, Some(5)));
    }
}
