//! Cancellable delayed tasks.
//!
//! The batcher arms one quiet-period timer at a time through a `Scheduler`.
//! `TokioScheduler` runs timers on the tokio runtime; `ManualScheduler`
//! fires them only when its clock is advanced, so debounce behaviour can be
//! exercised without wall-clock waits.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Work run when a timer fires
pub type Task = BoxFuture<'static, ()>;

/// Schedules a task to run once after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Handle to a scheduled task. Cancelling is idempotent and only prevents a
/// task that has not started yet; a task already running is left alone.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    wake: Notify,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(TimerState::default()),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs each timer as a tokio task that sleeps, then checks for cancellation.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // Cancelled while sleeping: exit without waiting out the delay
                _ = timer.state.wake.notified() => return,
            }
            if timer.is_cancelled() {
                return;
            }
            task.await;
        });

        handle
    }
}

/// Scheduler driven by an explicit virtual clock.
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<ManualClock>,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    timers: Vec<ManualTimer>,
}

struct ManualTimer {
    due: Duration,
    handle: TimerHandle,
    task: Task,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner).now
    }

    /// Timers that are armed and not cancelled
    pub fn pending_timers(&self) -> usize {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timers
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    /// Moves the clock forward and runs every timer that came due, earliest
    /// first. Returns how many tasks ran.
    pub async fn advance(&self, by: Duration) -> usize {
        {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            clock.now += by;
        }

        let mut fired = 0;
        while let Some(task) = self.take_next_due() {
            task.await;
            fired += 1;
        }
        fired
    }

    fn take_next_due(&self) -> Option<Task> {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.timers.retain(|t| !t.handle.is_cancelled());

        let now = clock.now;
        let index = clock
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| t.due)
            .map(|(i, _)| i)?;

        Some(clock.timers.remove(index).task)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let due = clock.now + delay;
        clock.timers.push(ManualTimer {
            due,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
