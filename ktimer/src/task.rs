// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::time::Instant;

use kpool::NIL;

use crate::error::UnscheduleError;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU32, Ordering};

/// Identifier of a scheduled task.
///
/// The low 32 bits index the task's slot in the record pool, the high 32 bits
/// snapshot the slot's version at schedule time. Because a slot's version
/// advances on every completion and cancellation, an id can never be confused
/// with a later task that recycled the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Versions start here; 0 is skipped so that a live id is never all-zero.
const FIRST_VERSION: u32 = 2;

// === impl TimerId ===

impl TimerId {
    /// Returned by `schedule` when no task was accepted.
    pub const INVALID: TimerId = TimerId(0);

    pub(crate) fn new(slot: u32, version: u32) -> Self {
        debug_assert_ne!(version, 0);
        Self((u64::from(version) << 32) | u64::from(slot))
    }

    /// `true` unless this is [`TimerId::INVALID`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub(crate) fn slot(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub(crate) fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl From<TimerId> for u64 {
    fn from(id: TimerId) -> u64 {
        id.0
    }
}

impl From<u64> for TimerId {
    fn from(raw: u64) -> TimerId {
        TimerId(raw)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Outcome of the worker's run transition on a single task.
pub(crate) enum RunOutcome {
    /// The callback ran (or panicked); the slot can be recycled.
    Ran,
    /// The task was cancelled before we got to it; the slot can be recycled.
    Cancelled,
    /// The version matched no expected state. The slot is left alone.
    Corrupt(u32),
}

/// One scheduled callback, living in a pool slot.
///
/// `version` is the only synchronization variable of the cancel/run race:
/// even means the slot is free or scheduled, `v + 1` (odd) means the
/// callback is executing, and `v + 2` means done or cancelled and is the
/// version the slot's next occupant starts from, so versions grow
/// monotonically (wrapping, skipping 0). Everything else is written by the
/// producer before the task becomes visible through a bucket and never
/// mutated while shared.
pub(crate) struct Task {
    version: AtomicU32,
    payload: UnsafeCell<Payload>,
}

struct Payload {
    /// Intake-list link (pool slot index), [`NIL`] at the tail.
    next: u32,
    /// Present from `arm` until the worker consumes or discards the task.
    armed: Option<Armed>,
}

struct Armed {
    run_time: Instant,
    callback: Box<dyn FnOnce() + Send>,
    id: TimerId,
}

/// Stores the completed version on drop, so the `v + 1 → v + 2` transition
/// happens even when the callback unwinds. Without it a panicking callback
/// would wedge every later `unschedule` of this task on `Busy`.
struct Complete<'a> {
    version: &'a AtomicU32,
    value: u32,
}

impl Drop for Complete<'_> {
    fn drop(&mut self) {
        // Pairs with the acquire CAS in `Task::cancel`, publishing the
        // callback's side effects to a canceller that observed `Busy`.
        self.version.store(self.value, Ordering::Release);
    }
}

// Safety: `payload` is only ever touched by the slot's exclusive owner: the
// producer between `Pool::acquire` and publication (which happens under a
// bucket lock), then the worker after detaching the intake list (which
// acquires the same lock). The cancellation path reads nothing but `version`.
unsafe impl Sync for Task {}

// === impl Task ===

impl Default for Task {
    fn default() -> Self {
        Self {
            version: AtomicU32::new(FIRST_VERSION),
            payload: UnsafeCell::new(Payload { next: NIL, armed: None }),
        }
    }
}

impl Task {
    /// Producer only: fill a freshly acquired record and snapshot its
    /// version into the returned id. The caller owns the slot exclusively
    /// until it publishes the task through a bucket.
    pub(crate) fn arm(
        &self,
        slot: u32,
        run_time: Instant,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimerId {
        let mut version = self.version.load(Ordering::Relaxed);
        if version == 0 {
            // the previous occupant's version wrapped; skip 0
            self.version.store(FIRST_VERSION, Ordering::Relaxed);
            version = FIRST_VERSION;
        }
        let id = TimerId::new(slot, version);
        self.payload.with_mut(|payload| {
            // Safety: exclusive owner, see above.
            unsafe {
                (*payload).next = NIL;
                (*payload).armed = Some(Armed { run_time, callback, id });
            }
        });
        id
    }

    /// Producer only, under the bucket lock.
    pub(crate) fn set_next(&self, next: u32) {
        self.payload.with_mut(|payload| {
            // Safety: link writes are serialized by the bucket lock; the
            // worker reads them only after detaching the list under it.
            unsafe { (*payload).next = next }
        });
    }

    /// Worker only, after drain.
    pub(crate) fn next(&self) -> u32 {
        // Safety: the worker owns the detached list.
        self.payload.with(|payload| unsafe { (*payload).next })
    }

    /// Worker only, after drain: deadline and id snapshot, without consuming
    /// the task. `None` means the record was never armed, which is a protocol
    /// violation on the caller's side.
    pub(crate) fn dispatch_info(&self) -> Option<(Instant, TimerId)> {
        self.payload.with(|payload| {
            // Safety: the worker owns the detached list.
            unsafe { (*payload).armed.as_ref().map(|armed| (armed.run_time, armed.id)) }
        })
    }

    /// Worker only: discard the task if it was cancelled since it was
    /// scheduled. Returns `true` when the callback was dropped and the caller
    /// must release the slot.
    pub(crate) fn try_delete(&self, id: TimerId) -> bool {
        let current = self.version.load(Ordering::Relaxed);
        if current == id.version() {
            return false;
        }
        debug_assert_eq!(current, id.version().wrapping_add(2));
        self.disarm();
        true
    }

    /// Worker only: the `v → v + 1 → v + 2` run transition. On success the
    /// callback is invoked on the calling thread; the completion store
    /// happens even if it unwinds.
    pub(crate) fn run(&self, id: TimerId) -> RunOutcome {
        let scheduled = id.version();
        // Relaxed is enough: the producer's writes were published to this
        // thread by the bucket lock during drain.
        match self.version.compare_exchange(
            scheduled,
            scheduled.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                let callback = self.payload.with_mut(|payload| {
                    // Safety: the successful CAS makes this thread the
                    // exclusive owner until it stores the completed version.
                    unsafe { (*payload).armed.take().map(|armed| armed.callback) }
                });
                let _complete = Complete {
                    version: &self.version,
                    value: scheduled.wrapping_add(2),
                };
                if let Some(callback) = callback {
                    callback();
                } else {
                    tracing::error!(id = %id, "scheduled task has no callback");
                }
                RunOutcome::Ran
            }
            Err(observed) if observed == scheduled.wrapping_add(2) => {
                self.disarm();
                RunOutcome::Cancelled
            }
            Err(observed) => RunOutcome::Corrupt(observed),
        }
    }

    /// Prevents a not-yet-running task from running. Callable from any
    /// thread; never blocks and never runs the callback. The slot is
    /// reclaimed later by whichever worker pass notices the mismatch.
    pub(crate) fn cancel(&self, id: TimerId) -> Result<(), UnscheduleError> {
        let scheduled = id.version();
        // The acquire pairs with the release store after the callback, so a
        // caller that sees `Busy` and then `NotFound` also sees the
        // callback's side effects.
        match self.version.compare_exchange(
            scheduled,
            scheduled.wrapping_add(2),
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(observed) if observed == scheduled.wrapping_add(1) => Err(UnscheduleError::Busy),
            Err(_) => Err(UnscheduleError::NotFound),
        }
    }

    fn disarm(&self) {
        self.payload.with_mut(|payload| {
            // Safety: only the worker disarms, and only for tasks it owns
            // (detached from a bucket or popped from its heap).
            unsafe { (*payload).armed = None }
        });
    }

    #[cfg(test)]
    fn force_version(&self, version: u32) {
        self.version.store(version, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnscheduleError;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicUsize;
    use proptest::prelude::*;

    fn armed(task: &Task, slot: u32) -> (TimerId, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let id = task.arm(
            slot,
            Instant::now(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );
        (id, runs)
    }

    #[test]
    fn run_invokes_the_callback_once() {
        loom::model(|| {
            let task = Task::default();
            let (id, runs) = armed(&task, 3);
            assert!(matches!(task.run(id), RunOutcome::Ran));
            assert_eq!(runs.load(Ordering::Relaxed), 1);
            // the slot now looks recycled to the old id
            assert_eq!(task.cancel(id), Err(UnscheduleError::NotFound));
        });
    }

    #[test]
    fn cancel_prevents_the_run() {
        loom::model(|| {
            let task = Task::default();
            let (id, runs) = armed(&task, 3);
            assert_eq!(task.cancel(id), Ok(()));
            assert!(matches!(task.run(id), RunOutcome::Cancelled));
            assert_eq!(runs.load(Ordering::Relaxed), 0);
            assert_eq!(task.cancel(id), Err(UnscheduleError::NotFound));
        });
    }

    // The interesting interleaving: a producer cancelling while the worker
    // dispatches. Exactly one side may win, for every schedule loom explores.
    #[test]
    fn racing_cancel_and_run_agree_on_a_single_winner() {
        loom::model(|| {
            let task = Arc::new(Task::default());
            let (id, runs) = armed(&task, 7);

            let worker = {
                let task = Arc::clone(&task);
                loom::thread::spawn(move || match task.run(id) {
                    RunOutcome::Ran => 1_usize,
                    RunOutcome::Cancelled => 0,
                    RunOutcome::Corrupt(observed) => panic!("corrupt version {observed}"),
                })
            };
            let cancelled = usize::from(task.cancel(id).is_ok());
            let ran = worker.join().unwrap();

            assert_eq!(runs.load(Ordering::Relaxed), ran);
            assert_eq!(cancelled + ran, 1, "exactly one of cancel/run must win");
        });
    }

    #[test]
    fn version_wrap_skips_zero() {
        loom::model(|| {
            let task = Task::default();
            task.force_version(u32::MAX - 1); // even, one completion away from wrapping
            let (id, runs) = armed(&task, 0);
            assert_eq!(id.version(), u32::MAX - 1);
            assert!(matches!(task.run(id), RunOutcome::Ran));
            assert_eq!(runs.load(Ordering::Relaxed), 1);

            // the next occupant must not produce a version-0 (all-zero-prone) id
            let (id, _) = armed(&task, 0);
            assert_eq!(id.version(), 2);
            assert!(id.is_valid());
        });
    }

    #[test]
    fn try_delete_only_reclaims_cancelled_tasks() {
        loom::model(|| {
            let task = Task::default();
            let (id, _) = armed(&task, 9);
            assert!(!task.try_delete(id));
            assert_eq!(task.cancel(id), Ok(()));
            assert!(task.try_delete(id));
        });
    }

    proptest! {
        #[test]
        fn id_round_trips(slot: u32, version in 1_u32..) {
            let id = TimerId::new(slot, version);
            prop_assert_eq!(id.slot(), slot);
            prop_assert_eq!(id.version(), version);
            prop_assert!(id.is_valid());
            prop_assert_eq!(TimerId::from(u64::from(id)), id);
        }
    }
}
