// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::cmp;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use kpool::{NIL, Pool};
use spin::Mutex;
use static_assertions::assert_impl_all;

use crate::bucket::Bucket;
use crate::error::{StartError, UnscheduleError};
use crate::task::{RunOutcome, Task, TimerId};
use crate::wait::Signal;

/// Configuration for [`TimerThread::start`].
#[derive(Debug, Clone, Copy)]
pub struct TimerOptions {
    /// Number of intake shards producers are spread over. More shards reduce
    /// producer contention; the worker's drain pass is O(shards). 1 is legal
    /// but serializes producers.
    pub num_buckets: usize,
}

impl TimerOptions {
    pub const MAX_BUCKETS: usize = 1024;
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self { num_buckets: 13 }
    }
}

/// A sharded timer scheduler with a single dispatch thread.
///
/// [`schedule`][TimerThread::schedule] accepts a callback and an absolute
/// deadline from any thread and returns a [`TimerId`]; the callback runs at
/// or soon after the deadline, exactly once, on the scheduler's worker
/// thread. [`unschedule`][TimerThread::unschedule] races safely against the
/// dispatch loop: for every accepted task, either the callback runs or one
/// cancellation succeeds, never both and never neither (short of
/// [`stop_and_join`][TimerThread::stop_and_join]).
///
/// Callbacks execute sequentially; a long callback delays everything behind
/// it. There are no periodic timers; a callback reschedules itself if it
/// wants to run again.
///
/// A callback that panics unwinds out of the worker thread and stops all
/// further dispatch (the task's completion is still published first, so
/// cancellation of it can never wedge on
/// [`Busy`][UnscheduleError::Busy]). A stopped scheduler cannot be
/// restarted.
pub struct TimerThread {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
}

assert_impl_all!(TimerThread: Send, Sync);

struct Lifecycle {
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    pool: Pool<Task>,
    /// Intake shards, allocated once at `start`.
    buckets: OnceLock<Box<[Bucket]>>,
    /// Best-known earliest pending deadline across all buckets (`None` when
    /// nothing is known to be pending). Producers consult it to decide
    /// whether to wake the worker; the worker re-checks it before sleeping
    /// and re-drains when it has been beaten.
    nearest: Mutex<Option<Instant>>,
    signal: Signal,
    started: AtomicBool,
    stopping: AtomicBool,
}

/// Heap entry for a drained task; the deadline is read once at drain time.
#[derive(Debug, Clone, Copy)]
struct QueuedTask {
    run_time: Instant,
    slot: u32,
    id: TimerId,
}

// === impl QueuedTask ===

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // `BinaryHeap` is a max-heap; invert so the earliest deadline is on
        // top. Slot as tie-break keeps the order deterministic.
        other
            .run_time
            .cmp(&self.run_time)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for QueuedTask {}

// === impl TimerThread ===

impl TimerThread {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: Pool::new(),
                buckets: OnceLock::new(),
                nearest: Mutex::new(None),
                signal: Signal::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(Lifecycle { worker: None }),
        }
    }

    /// Allocates the intake shards and spawns the worker thread. Further
    /// calls while started return `Ok` without effect.
    pub fn start(&self, options: TimerOptions) -> Result<(), StartError> {
        if self.inner.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut lifecycle = self.lifecycle.lock();
        if self.inner.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if options.num_buckets == 0 || options.num_buckets > TimerOptions::MAX_BUCKETS {
            tracing::error!(num_buckets = options.num_buckets, "invalid bucket count");
            return Err(StartError::InvalidNumBuckets(options.num_buckets));
        }

        let buckets = (0..options.num_buckets).map(|_| Bucket::new()).collect();
        let _ = self.inner.buckets.set(buckets);

        let inner = Arc::clone(&self.inner);
        let worker = thread::Builder::new()
            .name("ktimer".into())
            .spawn(move || inner.run())
            .map_err(StartError::Spawn)?;
        self.inner.signal.register_worker(worker.thread().clone());
        lifecycle.worker = Some(worker);

        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Schedules `f` to run at or soon after `at` on the worker thread.
    ///
    /// Returns [`TimerId::INVALID`] when the scheduler is not started, is
    /// stopping, or the task pool is exhausted.
    #[must_use = "the returned id is the only handle for unscheduling"]
    pub fn schedule<F>(&self, f: F, at: Instant) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_boxed(Box::new(f), at)
    }

    /// [`schedule`][TimerThread::schedule] with a deadline relative to now.
    #[must_use = "the returned id is the only handle for unscheduling"]
    pub fn schedule_after<F>(&self, f: F, delay: Duration) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(at) = Instant::now().checked_add(delay) else {
            return TimerId::INVALID;
        };
        self.schedule_boxed(Box::new(f), at)
    }

    fn schedule_boxed(&self, callback: Box<dyn FnOnce() + Send>, at: Instant) -> TimerId {
        if self.inner.stopping.load(Ordering::Relaxed) || !self.inner.started.load(Ordering::Acquire)
        {
            return TimerId::INVALID;
        }
        let Some(buckets) = self.inner.buckets.get() else {
            return TimerId::INVALID;
        };

        let bucket = &buckets[bucket_index(buckets.len())];
        let result = bucket.schedule_into(&self.inner.pool, at, callback);

        // Only a deadline that became its bucket's nearest can be the global
        // nearest; everything else is already covered by a pending wake-up.
        if result.earlier {
            let mut wake = false;
            {
                let mut nearest = self.inner.nearest.lock();
                if nearest.is_none_or(|hint| at < hint) {
                    *nearest = Some(at);
                    self.inner.signal.bump();
                    wake = true;
                }
            }
            if wake {
                self.inner.signal.wake();
            }
        }
        result.id
    }

    /// Prevents the task `id` from running.
    ///
    /// Returns `Ok` when the task will not run (its slot is reclaimed lazily
    /// by the worker), [`Busy`][UnscheduleError::Busy] when the callback is
    /// executing right now, [`NotFound`][UnscheduleError::NotFound] when it
    /// already ran or was already cancelled, and
    /// [`InvalidId`][UnscheduleError::InvalidId] for malformed ids. Never
    /// blocks, never runs the callback.
    pub fn unschedule(&self, id: TimerId) -> Result<(), UnscheduleError> {
        if id.version() == 0 {
            return Err(UnscheduleError::InvalidId);
        }
        let Some(task) = self.inner.pool.address(id.slot()) else {
            tracing::error!(id = %id, "unschedule of a slot outside the pool");
            return Err(UnscheduleError::InvalidId);
        };
        task.cancel(id)
    }

    /// Stops the worker and waits for it to exit. Later `schedule` calls
    /// return [`TimerId::INVALID`]. Idempotent; an in-flight callback is
    /// awaited. When called from inside a callback the join is skipped (the
    /// worker cannot wait for itself) and the worker exits right after the
    /// callback returns.
    pub fn stop_and_join(&self) {
        self.inner.stopping.store(true, Ordering::Relaxed);
        if !self.inner.started.load(Ordering::Acquire) {
            return;
        }
        {
            // Pretend something is due immediately so the worker re-checks
            // `stopping` instead of committing to a sleep.
            let mut nearest = self.inner.nearest.lock();
            *nearest = Some(Instant::now());
            self.inner.signal.bump();
        }
        self.inner.signal.wake();

        let worker = self.lifecycle.lock().worker.take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("timer worker panicked");
            }
        }
    }

    /// The worker's thread id, for diagnostics. `None` before `start`.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.signal.worker_thread().map(Thread::id)
    }
}

impl Default for TimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

// === impl Inner ===

impl Inner {
    /// The worker loop: drain every bucket into a deadline-ordered heap, run
    /// everything that is due, then sleep until the next deadline or a
    /// producer's wake-up, re-draining whenever a newly inserted task could
    /// preempt the heap's head.
    fn run(&self) {
        tracing::info!(thread = ?thread::current().id(), "timer worker started");
        let mut heap: BinaryHeap<QueuedTask> = BinaryHeap::with_capacity(4096);
        let Some(buckets) = self.buckets.get() else {
            // `start` publishes the buckets before spawning this thread
            tracing::error!("timer worker spawned without buckets");
            return;
        };

        while !self.stopping.load(Ordering::Relaxed) {
            // Clear the hint *before* draining: a producer inserting while we
            // drain then sees itself as earlier and leaves a wake-up behind.
            *self.nearest.lock() = None;

            for bucket in buckets {
                let mut slot = bucket.drain();
                while slot != NIL {
                    let Some(task) = self.pool.address(slot) else {
                        tracing::error!(slot, "drained a slot outside the pool");
                        break;
                    };
                    // read the link first; reclaiming the record recycles it
                    let next = task.next();
                    match task.dispatch_info() {
                        Some((run_time, id)) => {
                            if task.try_delete(id) {
                                // cancelled since it was scheduled
                                self.pool.release(slot);
                            } else {
                                heap.push(QueuedTask { run_time, slot, id });
                            }
                        }
                        None => tracing::error!(slot, "drained a task that was never armed"),
                    }
                    slot = next;
                }
            }

            let mut pull_again = false;
            loop {
                let Some(&QueuedTask { run_time: head_time, .. }) = heap.peek() else {
                    break;
                };
                if Instant::now() < head_time {
                    break;
                }
                {
                    // A task earlier than our head may have been inserted
                    // while we were draining or dispatching; pull it in
                    // instead of running past it.
                    let nearest = self.nearest.lock();
                    if nearest.is_some_and(|hint| hint < head_time) {
                        pull_again = true;
                        break;
                    }
                }
                let Some(QueuedTask { slot, id, .. }) = heap.pop() else {
                    break;
                };
                self.run_and_delete(slot, id);
            }
            if pull_again {
                continue;
            }

            let next_run_time = heap.peek().map(|queued| queued.run_time);
            let expected;
            {
                let mut nearest = self.nearest.lock();
                let beaten = match (next_run_time, *nearest) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(next), Some(hint)) => next > hint,
                };
                if beaten {
                    // a producer inserted something earlier than everything
                    // we hold; drain before sleeping
                    continue;
                }
                *nearest = next_run_time;
                expected = self.signal.epoch();
            }
            self.signal.wait_until(expected, next_run_time);
        }
        tracing::info!("timer worker stopped");
    }

    fn run_and_delete(&self, slot: u32, id: TimerId) {
        let Some(task) = self.pool.address(slot) else {
            tracing::error!(slot, "dispatching a slot outside the pool");
            return;
        };
        match task.run(id) {
            RunOutcome::Ran => {
                tracing::trace!(id = %id, "ran task");
                self.pool.release(slot);
            }
            RunOutcome::Cancelled => self.pool.release(slot),
            RunOutcome::Corrupt(observed) => {
                // leave the slot alone: releasing a record in an unknown
                // state could hand it out twice
                tracing::error!(
                    id = %id,
                    observed,
                    expected = id.version(),
                    "task version out of protocol"
                );
            }
        }
    }
}

/// Same thread, same bucket: producers that schedule often stay on one shard
/// for cache locality. Correctness does not depend on the distribution, only
/// contention does.
fn bucket_index(num_buckets: usize) -> usize {
    thread_local! {
        static PICK: Cell<usize> = Cell::new(fastrand::usize(..));
    }
    PICK.with(Cell::get) % num_buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn with_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn start_validates_the_bucket_count() {
        with_tracing();
        let timer = TimerThread::new();
        assert!(matches!(
            timer.start(TimerOptions { num_buckets: 0 }),
            Err(StartError::InvalidNumBuckets(0))
        ));
        assert!(matches!(
            timer.start(TimerOptions { num_buckets: 4097 }),
            Err(StartError::InvalidNumBuckets(4097))
        ));
        assert!(timer.start(TimerOptions { num_buckets: 1 }).is_ok());
        // idempotent while running
        assert!(timer.start(TimerOptions::default()).is_ok());
        assert!(timer.thread_id().is_some());
        timer.stop_and_join();
    }

    #[test]
    fn unschedule_rejects_malformed_ids() {
        with_tracing();
        let timer = TimerThread::new();
        timer.start(TimerOptions::default()).unwrap();
        assert_eq!(timer.unschedule(TimerId::INVALID), Err(UnscheduleError::InvalidId));
        // a slot far outside anything the pool ever allocated
        let bogus = TimerId::from((2_u64 << 32) | 0xdead_beef);
        assert_eq!(timer.unschedule(bogus), Err(UnscheduleError::InvalidId));
        timer.stop_and_join();
    }

    #[test]
    fn stress_every_task_runs_or_is_cancelled_and_no_slot_leaks() {
        with_tracing();
        const PRODUCERS: usize = 8;
        const TASKS: usize = 2_000;

        let timer = TimerThread::new();
        timer.start(TimerOptions::default()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut cancelled = 0_usize;
        let mut ids: HashSet<TimerId> = HashSet::with_capacity(PRODUCERS * TASKS);
        thread::scope(|scope| {
            let mut producers = Vec::new();
            for _ in 0..PRODUCERS {
                let timer = &timer;
                let runs = &runs;
                producers.push(scope.spawn(move || {
                    let mut cancelled = 0_usize;
                    let mut ids = Vec::with_capacity(TASKS);
                    for _ in 0..TASKS {
                        let runs = Arc::clone(runs);
                        let at = Instant::now() + Duration::from_millis(fastrand::u64(..800));
                        let id = timer.schedule(
                            move || {
                                runs.fetch_add(1, Ordering::Relaxed);
                            },
                            at,
                        );
                        assert!(id.is_valid());
                        ids.push(id);
                        if fastrand::bool() {
                            match timer.unschedule(id) {
                                Ok(()) => cancelled += 1,
                                // raced with the dispatch loop; the task ran
                                Err(UnscheduleError::Busy | UnscheduleError::NotFound) => {}
                                Err(UnscheduleError::InvalidId) => {
                                    panic!("a live id reported as invalid")
                                }
                            }
                        }
                    }
                    (cancelled, ids)
                }));
            }
            for producer in producers {
                let (count, producer_ids) = producer.join().unwrap();
                cancelled += count;
                ids.extend(producer_ids);
            }
        });

        // let every deadline pass and the worker reclaim all slots
        thread::sleep(Duration::from_millis(1_200));
        timer.stop_and_join();

        assert_eq!(ids.len(), PRODUCERS * TASKS, "live ids must be unique");
        assert_eq!(
            runs.load(Ordering::Relaxed) + cancelled,
            PRODUCERS * TASKS,
            "every task either ran or was cancelled, never both or neither"
        );
        assert_eq!(timer.inner.pool.outstanding(), 0, "all slots reclaimed");
    }
}
