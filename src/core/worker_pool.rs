//! Fixed-size worker pool for blocking units of work
//!
//! Workers pull from a shared FIFO queue guarded by a mutex and condvar.
//! Every submitted job produces a result handle; a panic inside a job is
//! captured and delivered through the handle instead of killing a worker.
//! Shutdown drains already-queued work before joining the workers.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{error, info, warn};

use crate::error::{ChatRelayError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<PoolQueue>,
    condvar: Condvar,
    active: AtomicUsize,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    stopped: bool,
}

/// Handle for retrieving the outcome of a submitted unit of work
pub struct TaskHandle<T> {
    receiver: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the work completes. A panic inside the job surfaces as
    /// a `SystemError` carrying the panic message.
    pub fn wait(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(ChatRelayError::SystemError(format!(
                "task panicked: {}",
                panic_message(&panic)
            ))),
            Err(_) => Err(ChatRelayError::SystemError(
                "task result was dropped".to_string(),
            )),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounded set of worker threads executing submitted work FIFO
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Create a pool with the given number of worker threads (minimum 1).
    pub fn new(worker_count: usize) -> Result<Self> {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                stopped: false,
            }),
            condvar: Condvar::new(),
            active: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("chat-relay-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .map_err(|e| {
                    ChatRelayError::SystemError(format!("Failed to spawn worker thread: {}", e))
                })?;
            workers.push(handle);
        }

        info!("Created worker pool with {} worker threads", worker_count);

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    /// Submit a unit of work. Fails with `PoolClosed` after shutdown.
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        let shared = Arc::clone(&self.shared);

        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work));
            if let Err(ref panic) = outcome {
                error!("Worker job panicked: {}", panic_message(panic));
            }
            shared.active.fetch_sub(1, Ordering::Relaxed);
            // Receiver may be gone if the submitter dropped the handle
            let _ = tx.send(outcome);
        });

        {
            let mut queue = self.shared.queue.lock()?;
            if queue.stopped {
                return Err(ChatRelayError::PoolClosed);
            }
            self.shared.active.fetch_add(1, Ordering::Relaxed);
            queue.jobs.push_back(job);
        }
        self.shared.condvar.notify_one();

        Ok(TaskHandle { receiver: rx })
    }

    /// Number of jobs queued or running.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop accepting work, let queued jobs drain, then join every worker.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock()?;
            if queue.stopped {
                return Ok(());
            }
            queue.stopped = true;
        }
        self.shared.condvar.notify_all();

        let mut workers = self.workers.lock()?;
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
        info!("Worker pool shut down");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to shut down worker pool: {}", e);
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = match shared.queue.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                // Exit only once stopped AND drained, so queued work is
                // never dropped.
                if queue.stopped {
                    return;
                }
                queue = match shared.condvar.wait(queue) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
        };
        job();
    }
}
