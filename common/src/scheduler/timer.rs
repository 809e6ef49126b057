// Delay timer: jobs waiting for their scheduled time

use crate::models::JobKey;
use std::collections::{BTreeSet, HashMap};

/// Future-scheduled jobs ordered by scheduled time, ties by submission order
#[derive(Debug, Default)]
pub struct DelayTimer {
    queue: BTreeSet<(i64, u64, JobKey)>,
    index: HashMap<JobKey, (i64, u64)>,
    next_seq: u64,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `key` until `sched_at`, replacing any earlier entry for it.
    /// Returns true when this moved the earliest deadline forward, meaning
    /// the timing loop must re-arm.
    pub fn schedule(&mut self, key: JobKey, sched_at: i64) -> bool {
        self.cancel(&key);

        let earliest = self.next_deadline();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.index.insert(key.clone(), (sched_at, seq));
        self.queue.insert((sched_at, seq, key));

        earliest.map_or(true, |t| sched_at < t)
    }

    pub fn cancel(&mut self, key: &JobKey) -> bool {
        match self.index.remove(key) {
            Some((sched_at, seq)) => self.queue.remove(&(sched_at, seq, key.clone())),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.queue.first().map(|(sched_at, _, _)| *sched_at)
    }

    /// Remove and return every job due at `now`, in promotion order
    pub fn pop_due(&mut self, now: i64) -> Vec<JobKey> {
        let mut due = Vec::new();
        while let Some((sched_at, _, _)) = self.queue.first() {
            if *sched_at > now {
                break;
            }
            if let Some((_, _, key)) = self.queue.pop_first() {
                self.index.remove(&key);
                due.push(key);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
