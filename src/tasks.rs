//! Bounded task execution for one walk.
//!
//! Each walk owns its pool, so two concurrent walks never compete for the
//! same workers. Tasks may submit further tasks; `wait_for_completion` only
//! returns once the in-flight count drops to zero, which includes work
//! submitted while the caller was already waiting.

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{Result, ScanError};

struct TaskState {
    pending: Mutex<usize>,
    idle: Condvar,
    errors: Mutex<Vec<ScanError>>,
}

impl TaskState {
    fn record(&self, error: ScanError) {
        lock(&self.errors).push(error);
    }

    fn finish_one(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct TaskManager {
    pool: Arc<ThreadPool>,
    state: Arc<TaskState>,
    max_parallel: usize,
}

impl TaskManager {
    pub fn new(max_parallel: usize) -> Result<Self> {
        let max_parallel = max_parallel.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_parallel)
            .thread_name(|i| format!("unit-scan-{i}"))
            .build()
            .map_err(|e| ScanError::Concurrency(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            state: Arc::new(TaskState {
                pending: Mutex::new(0),
                idle: Condvar::new(),
                errors: Mutex::new(Vec::new()),
            }),
            max_parallel,
        })
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        *lock(&self.state.pending)
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        *lock(&self.state.pending) += 1;
        let state = Arc::clone(&self.state);
        self.pool.spawn(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => state.record(e),
                Err(payload) => state.record(ScanError::Concurrency(panic_message(&payload))),
            }
            state.finish_one();
        });
    }

    /// Blocks until every submitted task has finished, then returns the
    /// recorded failures. The manager is empty and reusable afterwards.
    pub fn wait_for_completion(&self) -> Result<()> {
        if self.pool.current_thread_index().is_some() {
            return Err(ScanError::Concurrency(
                "wait_for_completion called from a task of the same manager".to_string(),
            ));
        }

        let mut pending = lock(&self.state.pending);
        while *pending > 0 {
            pending = self
                .state
                .idle
                .wait(pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        drop(pending);

        let errors = std::mem::take(&mut *lock(&self.state.errors));
        match ScanError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
