// src/pool.rs
//! Fixed-size worker pool draining a shared FIFO of tasks.

use crate::error::{TernError, TernResult};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `threads` workers immediately. A zero count is bumped to one.
    pub fn new(threads: usize) -> TernResult<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("tern-worker-{}", id))
                .spawn(move || worker_loop(id, &shared))
                .map_err(|e| TernError::setup("spawn worker thread", e))?;
            workers.push(handle);
        }

        info!(threads, "Thread pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task and wake one idle worker.
    ///
    /// Fails with [`TernError::PoolStopped`] once shutdown has begun; the task is
    /// handed back to nobody and dropped.
    pub fn enqueue<F>(&self, task: F) -> TernResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            if queue.stopped {
                return Err(TernError::PoolStopped);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Stop accepting work, let the workers drain the queue, and join them.
    ///
    /// Idempotent; later calls return once the first one has joined everything.
    pub fn shutdown(&self) {
        self.shared.lock().stopped = true;
        self.shared.available.notify_all();

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.lock();
            while queue.tasks.is_empty() && !queue.stopped {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match queue.tasks.pop_front() {
                Some(task) => task,
                // stopped and nothing left
                None => {
                    debug!(worker = id, "Worker exiting");
                    return;
                }
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(worker = id, reason = %panic_message(&payload), "Task panicked");
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
