//! Debounced batching of change events.
//!
//! Events accumulate in a pending buffer. A batch is flushed to the
//! `BatchConsumer` when the buffer reaches `max_batch_size`, or once
//! `batch_delay` has passed since the most recent `add`. Only one flush runs
//! at a time; events added while a flush is in flight go into the next
//! batch. A batch the consumer rejects is put back at the front of the
//! buffer and retried on the next trigger (at-least-once delivery).

use crate::config::BatcherConfig;
use crate::detector::ChangeEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod consumer;
mod scheduler;

pub use consumer::{BatchConsumer, JsonLinesConsumer};
pub use scheduler::{ManualScheduler, Scheduler, Task, TimerHandle, TokioScheduler};


/// Group of change events delivered in a single consumer call
#[derive(Clone, Debug, Serialize)]
pub struct Batch {
    /// Time-ordered id for log correlation
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub events: Vec<ChangeEvent>,
}

impl Batch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatcherState {
    /// Nothing buffered, no flush running
    Idle,
    /// Events buffered, waiting for a trigger
    Accumulating,
    /// A batch is with the consumer
    Flushing,
}

/// Point-in-time counters
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatcherStats {
    pub total_received: u64,
    pub total_processed: u64,
    pub batches_processed: u64,
    pub pending_count: usize,
    pub is_processing: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Another flush holds the guard
    InProgress,
    /// Nothing to deliver
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Skipped(SkipReason),
    Delivered { batch_id: Uuid, size: usize },
    Requeued { batch_id: Uuid, size: usize },
}

/// Debounce/size-triggered batcher. Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct ChangeBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    batch_delay: Duration,
    max_batch_size: usize,
    consumer: Arc<dyn BatchConsumer>,
    scheduler: Arc<dyn Scheduler>,
    queue: Mutex<PendingQueue>,
    /// Single-flush guard
    flushing: AtomicBool,
    total_received: AtomicU64,
    total_processed: AtomicU64,
    batches_processed: AtomicU64,
}

#[derive(Default)]
struct PendingQueue {
    events: Vec<ChangeEvent>,
    timer: Option<TimerHandle>,
    /// A trigger arrived while a flush was in flight
    retrigger: bool,
}

impl PendingQueue {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl ChangeBatcher {
    /// Batcher whose quiet-period timers run on the tokio runtime
    pub fn new(config: &BatcherConfig, consumer: Arc<dyn BatchConsumer>) -> Self {
        Self::with_scheduler(config, consumer, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(
        config: &BatcherConfig,
        consumer: Arc<dyn BatchConsumer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                batch_delay: config.batch_delay(),
                max_batch_size: config.max_batch_size.max(1),
                consumer,
                scheduler,
                queue: Mutex::new(PendingQueue::default()),
                flushing: AtomicBool::new(false),
                total_received: AtomicU64::new(0),
                total_processed: AtomicU64::new(0),
                batches_processed: AtomicU64::new(0),
            }),
        }
    }

    /// Buffers an event.
    ///
    /// Reaching `max_batch_size` flushes before returning; otherwise the
    /// quiet-period timer is restarted.
    pub async fn add(&self, event: ChangeEvent) {
        let inner = &self.inner;
        inner.total_received.fetch_add(1, Ordering::Relaxed);

        let full = {
            let mut queue = inner.lock_queue();
            debug!(entity_id = %event.entity_id, "Change event buffered");
            queue.events.push(event);

            if queue.events.len() >= inner.max_batch_size {
                queue.cancel_timer();
                true
            } else {
                inner.arm_timer(&mut queue);
                false
            }
        };

        if full {
            debug!(max_batch_size = inner.max_batch_size, "Batch full, flushing immediately");
            inner.flush().await;
        }
    }

    /// Forces a flush of whatever is buffered, cancelling the pending timer.
    pub async fn flush(&self) -> FlushOutcome {
        self.inner.flush().await
    }

    /// Drains the buffer for shutdown. Returns how many events could not be delivered.
    pub async fn shutdown(&self) -> usize {
        loop {
            match self.inner.flush().await {
                FlushOutcome::Delivered { .. } => continue,
                FlushOutcome::Skipped(SkipReason::InProgress) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                FlushOutcome::Skipped(SkipReason::Empty) => break,
                FlushOutcome::Requeued { .. } => break,
            }
        }

        let mut queue = self.inner.lock_queue();
        queue.cancel_timer();
        let remaining = queue.events.len();
        if remaining > 0 {
            warn!(remaining = remaining, "Shutting down with undelivered change events");
        } else {
            info!("Change batcher drained");
        }
        remaining
    }

    pub fn get_stats(&self) -> BatcherStats {
        let inner = &self.inner;
        BatcherStats {
            total_received: inner.total_received.load(Ordering::Relaxed),
            total_processed: inner.total_processed.load(Ordering::Relaxed),
            batches_processed: inner.batches_processed.load(Ordering::Relaxed),
            pending_count: self.pending_count(),
            is_processing: inner.flushing.load(Ordering::Acquire),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_queue().events.len()
    }

    pub fn state(&self) -> BatcherState {
        if self.inner.flushing.load(Ordering::Acquire) {
            BatcherState::Flushing
        } else if self.pending_count() > 0 {
            BatcherState::Accumulating
        } else {
            BatcherState::Idle
        }
    }
}

impl BatcherInner {
    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)starts the quiet-period timer
    fn arm_timer(self: &Arc<Self>, queue: &mut PendingQueue) {
        self.arm_timer_in(queue, self.batch_delay);
    }

    fn arm_timer_in(self: &Arc<Self>, queue: &mut PendingQueue, delay: Duration) {
        queue.cancel_timer();
        let task = flush_task(Arc::downgrade(self));
        queue.timer = Some(self.scheduler.schedule(delay, task));
    }

    async fn flush(self: &Arc<Self>) -> FlushOutcome {
        // The guard is only taken or released under the queue lock, so a
        // skipped trigger is always seen by the flush that skipped it
        let batch = {
            let mut queue = self.lock_queue();
            if self
                .flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                queue.retrigger = true;
                return FlushOutcome::Skipped(SkipReason::InProgress);
            }

            queue.cancel_timer();
            queue.retrigger = false;
            if queue.events.is_empty() {
                self.flushing.store(false, Ordering::Release);
                return FlushOutcome::Skipped(SkipReason::Empty);
            }
            Batch::new(std::mem::take(&mut queue.events))
        };

        let batch_id = batch.id;
        let size = batch.len();
        debug!(batch_id = %batch_id, size = size, "Flushing batch");

        let result = self.consumer.consume(&batch).await;

        let mut queue = self.lock_queue();
        let retrigger = std::mem::take(&mut queue.retrigger);
        let outcome = match result {
            Ok(()) => {
                let total = self.total_processed.fetch_add(size as u64, Ordering::Relaxed)
                    + size as u64;
                let batches = self.batches_processed.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    batch_id = %batch_id,
                    size = size,
                    total_processed = total,
                    batches_processed = batches,
                    "Batch delivered"
                );

                // Events added during the flight whose trigger was swallowed
                // are already past their quiet period
                if !queue.events.is_empty() && (retrigger || queue.timer.is_none()) {
                    debug!(pending = queue.events.len(), "Re-arming flush for events added in flight");
                    self.arm_timer_in(&mut queue, Duration::ZERO);
                }
                FlushOutcome::Delivered { batch_id, size }
            }
            Err(e) => {
                let mut events = batch.events;
                events.append(&mut queue.events);
                queue.events = events;
                self.arm_timer(&mut queue);
                warn!(
                    batch_id = %batch_id,
                    size = size,
                    pending = queue.events.len(),
                    error = %e,
                    "Batch rejected by consumer, requeued"
                );
                FlushOutcome::Requeued { batch_id, size }
            }
        };

        self.flushing.store(false, Ordering::Release);
        outcome
    }
}

fn flush_task(inner: Weak<BatcherInner>) -> Task {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            inner.flush().await;
        }
    })
}
