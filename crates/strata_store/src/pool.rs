//! Shared background processing pool.
//!
//! Tables register one executor task each; a fixed set of workers drains
//! them round-robin. The pool also hosts named counters ("big merges" and
//! friends) that let merge selection across tables back off from heavy work
//! happening anywhere in the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// One unit of registerable background work.
#[async_trait]
pub trait PoolTask: Send + Sync {
    /// Perform at most one piece of work; return whether anything was done.
    /// Workers sleep briefly when a full round produced no work.
    async fn run(&self, pool: &BackgroundPool) -> bool;
}

struct TaskState {
    task: Arc<dyn PoolTask>,
    running: AtomicBool,
    removed: AtomicBool,
}

struct PoolShared {
    tasks: Mutex<Vec<Arc<TaskState>>>,
    counters: Mutex<HashMap<String, i64>>,
    wake: Notify,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a registered task. Does not own the task: the pool does, until
/// `remove_task`. `wake()` nudges the workers out of their idle sleep.
pub struct TaskHandle {
    state: Arc<TaskState>,
    wake: Arc<Notify>,
}

impl TaskHandle {
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }
}

/// Cheap-clone pool handle; clones share workers, tasks, and counters.
#[derive(Clone)]
pub struct BackgroundPool {
    shared: Arc<PoolShared>,
    wake: Arc<Notify>,
}

impl BackgroundPool {
    /// Start a pool with `workers` concurrent workers.
    pub fn start(workers: usize) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                tasks: Mutex::new(Vec::new()),
                counters: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
            wake: Arc::new(Notify::new()),
        };
        let mut handles = pool.shared.workers.lock().unwrap();
        for _ in 0..workers.max(1) {
            let worker_pool = pool.clone();
            handles.push(tokio::spawn(worker_loop(worker_pool)));
        }
        drop(handles);
        pool
    }

    pub fn add_task(&self, task: Arc<dyn PoolTask>) -> TaskHandle {
        let state = Arc::new(TaskState {
            task,
            running: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        self.shared.tasks.lock().unwrap().push(state.clone());
        self.wake.notify_waiters();
        TaskHandle {
            state,
            wake: self.wake.clone(),
        }
    }

    /// Deregister a task and wait for its in-flight invocation, if any, to
    /// finish. After this returns the pool holds no reference to the task.
    pub async fn remove_task(&self, handle: TaskHandle) {
        handle.state.removed.store(true, Ordering::SeqCst);
        self.shared
            .tasks
            .lock()
            .unwrap()
            .retain(|state| !Arc::ptr_eq(state, &handle.state));
        while handle.state.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn increment_counter(&self, name: &str) {
        *self
            .shared
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn decrement_counter(&self, name: &str) {
        *self
            .shared
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) -= 1;
    }

    pub fn get_counter(&self, name: &str) -> i64 {
        self.shared
            .counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Increment `name` for the lifetime of the returned guard.
    pub fn counter_guard(&self, name: &str) -> CounterGuard {
        self.increment_counter(name);
        CounterGuard {
            pool: self.clone(),
            name: name.to_string(),
        }
    }

    /// Stop the workers. Registered tasks are not run again.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.shared.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Holds a named counter incremented until dropped.
pub struct CounterGuard {
    pool: BackgroundPool,
    name: String,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.pool.decrement_counter(&self.name);
    }
}

async fn worker_loop(pool: BackgroundPool) {
    loop {
        if pool.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<Arc<TaskState>> = pool.shared.tasks.lock().unwrap().clone();
        let mut did_work = false;
        for state in tasks {
            if state.removed.load(Ordering::SeqCst) {
                continue;
            }
            if state
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Another worker has this task; move on.
                continue;
            }
            let worked = state.task.run(&pool).await;
            state.running.store(false, Ordering::SeqCst);
            did_work |= worked;
            if pool.shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
        }
        if !did_work {
            tokio::select! {
                _ = pool.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: AtomicUsize,
        budget: usize,
    }

    #[async_trait]
    impl PoolTask for CountingTask {
        async fn run(&self, _pool: &BackgroundPool) -> bool {
            let prior = self.runs.fetch_add(1, Ordering::SeqCst);
            prior + 1 < self.budget
        }
    }

    #[tokio::test]
    async fn pool_drains_registered_tasks() {
        let pool = BackgroundPool::start(2);
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
            budget: 5,
        });
        let handle = pool.add_task(task.clone());
        for _ in 0..200 {
            if task.runs.load(Ordering::SeqCst) >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(task.runs.load(Ordering::SeqCst) >= 5);
        pool.remove_task(handle).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn removed_task_is_not_run_again() {
        let pool = BackgroundPool::start(1);
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
            budget: usize::MAX,
        });
        let handle = pool.add_task(task.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.remove_task(handle).await;
        let after_removal = task.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), after_removal);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn counter_guard_decrements_on_drop() {
        let pool = BackgroundPool::start(1);
        assert_eq!(pool.get_counter("big merges"), 0);
        {
            let _guard = pool.counter_guard("big merges");
            let _second = pool.counter_guard("big merges");
            assert_eq!(pool.get_counter("big merges"), 2);
        }
        assert_eq!(pool.get_counter("big merges"), 0);
        pool.shutdown().await;
    }
}
