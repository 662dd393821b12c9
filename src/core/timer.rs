//! Time-driven task scheduling
//!
//! One background thread executes one-shot and periodic callbacks ordered
//! by absolute execution time. The thread sleeps on a condvar until the
//! earliest deadline and re-checks the heap top after every wake, since a
//! newly scheduled task may be due sooner.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info};

use crate::error::{ChatRelayError, Result};

type TimerJob = Box<dyn FnMut() + Send + 'static>;

struct TimerTask {
    fire_at: Instant,
    /// Insertion order tiebreaker for identical deadlines
    seq: u64,
    period: Option<Duration>,
    job: TimerJob,
}

impl PartialEq for TimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerTask {}

impl PartialOrd for TimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

struct TimerState {
    // Reverse turns std's max-heap into earliest-deadline-first
    heap: BinaryHeap<Reverse<TimerTask>>,
    stopped: bool,
    next_seq: u64,
}

/// One-thread scheduler for one-shot and periodic callbacks
pub struct TimerService {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    stopped: false,
                    next_seq: 0,
                }),
                Condvar::new(),
            )),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the background thread. Calling start twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock()?;
        if thread_slot.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chat-relay-timer".to_string())
            .spawn(move || timer_loop(shared))
            .map_err(|e| {
                ChatRelayError::SystemError(format!("Failed to spawn timer thread: {}", e))
            })?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Schedule a callback to run once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callback = Some(callback);
        self.schedule(delay, None, move || {
            if let Some(f) = callback.take() {
                f();
            }
        })
    }

    /// Schedule a callback to run after `initial_delay` and then every
    /// `period`. The next tick is measured from when the previous run
    /// finished, so a slow callback delays ticks rather than stacking them.
    pub fn schedule_periodic<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(initial_delay, Some(period), callback)
    }

    fn schedule<F>(&self, delay: Duration, period: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let (state_lock, condvar) = &*self.shared;
        let mut state = state_lock.lock()?;
        if state.stopped {
            return Err(ChatRelayError::ShuttingDown);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(TimerTask {
            fire_at: Instant::now() + delay,
            seq,
            period,
            job: Box::new(callback),
        }));
        drop(state);
        // Wake the thread in case the new task is now the earliest
        condvar.notify_one();
        Ok(())
    }

    /// Stop the scheduler and join the background thread. No callback
    /// fires after this returns. Idempotent.
    pub fn stop(&self) -> Result<()> {
        {
            let (state_lock, condvar) = &*self.shared;
            let mut state = state_lock.lock()?;
            state.stopped = true;
            state.heap.clear();
            condvar.notify_all();
        }
        let handle = self.thread.lock()?.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(ChatRelayError::SystemError(
                    "Timer thread terminated abnormally".to_string(),
                ));
            }
            info!("Timer service stopped");
        }
        Ok(())
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop timer service: {}", e);
        }
    }
}

fn timer_loop(shared: Arc<(Mutex<TimerState>, Condvar)>) {
    let (state_lock, condvar) = &*shared;
    loop {
        let mut task = {
            let mut state = match state_lock.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            loop {
                if state.stopped {
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    None => {
                        state = match condvar.wait(state) {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                    }
                    Some(Reverse(next)) if next.fire_at > now => {
                        let wait_for = next.fire_at - now;
                        state = match condvar.wait_timeout(state, wait_for) {
                            Ok((guard, _)) => guard,
                            Err(_) => return,
                        };
                    }
                    Some(_) => match state.heap.pop() {
                        Some(Reverse(task)) => break task,
                        None => continue,
                    },
                }
            }
        };

        // Run outside the lock so scheduling from a callback cannot deadlock
        if catch_unwind(AssertUnwindSafe(|| (task.job)())).is_err() {
            error!("Timer callback panicked; timer thread continues");
        }

        if let Some(period) = task.period {
            // Drift measured from actual completion, not original schedule
            task.fire_at = Instant::now() + period;
            let mut state = match state_lock.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if !state.stopped {
                state.heap.push(Reverse(task));
            }
        }
    }
}
