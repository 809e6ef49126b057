// Function table: per-function ready queues and waiting workers

use crate::models::{Job, WorkerId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

pub type WaiterId = u64;

/// A worker blocked in GRAB, waiting on one or more functions
pub struct Waiter {
    pub worker: WorkerId,
    pub funcs: Vec<String>,
    tx: oneshot::Sender<Job>,
}

impl Waiter {
    /// Hand the job over; gives it back if the grab was cancelled meanwhile
    pub fn deliver(self, job: Job) -> Result<(), Job> {
        self.tx.send(job)
    }

    fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct FuncEntry {
    ready: VecDeque<String>,
    waiting: VecDeque<WaiterId>,
}

impl FuncEntry {
    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }
}

/// Maps a function name to its FIFO ready queue and its waiting workers
///
/// Entries with nothing ready and nobody waiting are pruned; they are
/// recreated on demand, the jobs themselves live in the registry.
#[derive(Default)]
pub struct FunctionTable {
    funcs: HashMap<String, FuncEntry>,
    waiters: HashMap<WaiterId, Waiter>,
    next_waiter: WaiterId,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ready job at the tail of its function's queue
    pub fn push_ready(&mut self, func: &str, name: &str) {
        self.entry(func).ready.push_back(name.to_string());
    }

    /// Put a job back at the head of its queue
    pub fn push_ready_front(&mut self, func: &str, name: &str) {
        self.entry(func).ready.push_front(name.to_string());
    }

    pub fn pop_ready(&mut self, func: &str) -> Option<String> {
        let entry = self.funcs.get_mut(func)?;
        let name = entry.ready.pop_front();
        self.prune(func);
        name
    }

    /// Remove one job from a ready queue, wherever it sits
    pub fn remove_ready(&mut self, func: &str, name: &str) -> bool {
        let Some(entry) = self.funcs.get_mut(func) else {
            return false;
        };
        let before = entry.ready.len();
        entry.ready.retain(|n| n != name);
        let removed = entry.ready.len() != before;
        self.prune(func);
        removed
    }

    /// Register a worker as waiting on every function in `funcs`
    pub fn add_waiter(
        &mut self,
        worker: WorkerId,
        funcs: Vec<String>,
        tx: oneshot::Sender<Job>,
    ) -> WaiterId {
        let id = self.next_waiter;
        self.next_waiter += 1;

        for func in &funcs {
            self.entry(func).waiting.push_back(id);
        }
        self.waiters.insert(id, Waiter { worker, funcs, tx });
        id
    }

    /// Take the longest-waiting live worker for `func`
    ///
    /// Waiters whose grab was cancelled are discarded on the way. The
    /// chosen waiter loses its slots on every other function too.
    pub fn take_waiter(&mut self, func: &str) -> Option<Waiter> {
        let mut found = None;

        while let Some(id) = self.funcs.get_mut(func).and_then(|e| e.waiting.pop_front()) {
            let Some(waiter) = self.waiters.remove(&id) else {
                continue;
            };
            self.release_slots(id, &waiter.funcs);
            if waiter.is_cancelled() {
                continue;
            }
            found = Some(waiter);
            break;
        }

        self.prune(func);
        found
    }

    /// Put a waiter back at the head of each of its functions, used when a
    /// hand-off to it could not be committed
    pub fn restore_waiter(&mut self, waiter: Waiter) -> WaiterId {
        let id = self.next_waiter;
        self.next_waiter += 1;

        for func in &waiter.funcs {
            self.entry(func).waiting.push_front(id);
        }
        self.waiters.insert(id, waiter);
        id
    }

    /// Drop every waiter; their pending grabs resolve with an error
    pub fn clear_waiters(&mut self) -> usize {
        let ids: Vec<WaiterId> = self.waiters.keys().copied().collect();
        ids.iter().filter(|id| self.remove_waiter(**id)).count()
    }

    /// Forget a single waiter, e.g. when its grab resolved elsewhere
    pub fn remove_waiter(&mut self, id: WaiterId) -> bool {
        match self.waiters.remove(&id) {
            Some(waiter) => {
                self.release_slots(id, &waiter.funcs);
                true
            }
            None => false,
        }
    }

    /// Forget every waiter belonging to `worker`
    pub fn remove_waiters_for(&mut self, worker: WorkerId) -> usize {
        let ids: Vec<WaiterId> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.worker == worker)
            .map(|(id, _)| *id)
            .collect();

        ids.iter().filter(|id| self.remove_waiter(**id)).count()
    }

    /// Number of workers currently blocked in GRAB
    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    #[cfg(test)]
    fn has_waiters(&self, func: &str) -> bool {
        self.funcs.get(func).is_some_and(|e| !e.waiting.is_empty())
    }

    #[cfg(test)]
    fn contains(&self, func: &str) -> bool {
        self.funcs.contains_key(func)
    }

    fn release_slots(&mut self, id: WaiterId, funcs: &[String]) {
        for func in funcs {
            if let Some(entry) = self.funcs.get_mut(func) {
                entry.waiting.retain(|w| *w != id);
            }
            self.prune(func);
        }
    }

    fn entry(&mut self, func: &str) -> &mut FuncEntry {
        self.funcs.entry(func.to_string()).or_default()
    }

    fn prune(&mut self, func: &str) {
        if self.funcs.get(func).is_some_and(FuncEntry::is_idle) {
            self.funcs.remove(func);
        }
    }
}
