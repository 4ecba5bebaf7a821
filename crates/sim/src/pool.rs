//! Fixed worker pool for the parallel tick phases.
//!
//! The tick loop enqueues one task per shard, then blocks on
//! [`WorkerPool::finish`] until the queue drains and every worker is
//! idle again. The pool is reused across ticks; threads are only
//! joined on drop.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    busy: usize,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    cv_task: Condvar,
    cv_done: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                busy: 0,
                stop: false,
            }),
            cv_task: Condvar::new(),
            cv_done: Condvar::new(),
        });
        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("sim-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"))
            })
            .collect();
        Self { shared, workers }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    fn enqueue_boxed(&self, task: Task) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(task);
        drop(state);
        self.shared.cv_task.notify_one();
    }

    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.enqueue_boxed(Box::new(f));
    }

    /// Blocks until the queue is empty and all workers are idle.
    pub fn finish(&self) {
        let mut state = self.shared.state.lock();
        while state.busy > 0 || !state.tasks.is_empty() {
            self.shared.cv_done.wait(&mut state);
        }
    }

    /// Runs `f` with a handle that can spawn tasks borrowing from the
    /// enclosing stack frame, and waits for all of them before
    /// returning. The wait also happens on unwind, so borrowed data
    /// outlives every task either way.
    pub fn scope<'env, F>(&self, f: F)
    where
        F: for<'pool> FnOnce(&Scope<'pool, 'env>),
    {
        let guard = FinishGuard(self);
        let scope = Scope {
            pool: self,
            _env: PhantomData,
        };
        f(&scope);
        drop(guard);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.cv_task.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct FinishGuard<'a>(&'a WorkerPool);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Spawn handle tied to the borrow lifetime `'env`.
pub struct Scope<'pool, 'env> {
    pool: &'pool WorkerPool,
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'env> Scope<'_, 'env> {
    pub fn spawn<F: FnOnce() + Send + 'env>(&self, f: F) {
        let task: Box<dyn FnOnce() + Send + 'env> = Box::new(f);
        // SAFETY: the task only borrows data with lifetime 'env. The
        // scope that handed out this handle waits in finish() before
        // 'env can end, including on unwind via FinishGuard, so the
        // borrow outlives the task's execution.
        let task: Task = unsafe { std::mem::transmute(task) };
        self.pool.enqueue_boxed(task);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            while !state.stop && state.tasks.is_empty() {
                shared.cv_task.wait(&mut state);
            }
            if state.stop && state.tasks.is_empty() {
                return;
            }
            state.busy += 1;
            state.tasks.pop_front()
        };
        if let Some(task) = task {
            task();
        }
        let mut state = shared.state.lock();
        state.busy -= 1;
        if state.busy == 0 && state.tasks.is_empty() {
            drop(state);
            shared.cv_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    #[test]
    fn finish_waits_for_all_tasks() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                std::thread::sleep(std::time::Duration::from_micros(50));
                counter.fetch_add(1, Relaxed);
            });
        }
        pool.finish();
        assert_eq!(counter.load(Relaxed), 64);
    }

    #[test]
    fn scoped_tasks_borrow_the_stack() {
        let pool = WorkerPool::new(2);
        let cells: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
        pool.scope(|scope| {
            for chunk in cells.chunks(2) {
                scope.spawn(move || {
                    for cell in chunk {
                        cell.fetch_add(1, Relaxed);
                    }
                });
            }
        });
        assert!(cells.iter().all(|c| c.load(Relaxed) == 1));
    }

    #[test]
    fn pool_is_reusable_across_rounds() {
        let pool = WorkerPool::new(3);
        let counter = AtomicUsize::new(0);
        for _ in 0..5 {
            pool.scope(|scope| {
                for _ in 0..pool.threads() {
                    scope.spawn(|| {
                        counter.fetch_add(1, Relaxed);
                    });
                }
            });
        }
        assert_eq!(counter.load(Relaxed), 15);
    }
}
