// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use kpool::{NIL, Pool};
use spin::Mutex;

use crate::task::{Task, TimerId};

/// One intake shard. Producers push scheduled tasks here; the worker
/// periodically detaches the whole list in one motion.
pub(crate) struct Bucket {
    /// Most recently pushed task (the intake list is LIFO), [`NIL`] when
    /// empty. Written under `nearest`'s lock; read without it only by the
    /// empty fast path in [`drain`][Bucket::drain].
    head: AtomicU32,
    /// Earliest deadline currently on the intake list, `None` when empty.
    nearest: Mutex<Option<Instant>>,
}

pub(crate) struct ScheduleResult {
    pub(crate) id: TimerId,
    /// Whether this deadline became the bucket's nearest; only then can it
    /// possibly be the globally nearest one.
    pub(crate) earlier: bool,
}

// === impl Bucket ===

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
            nearest: Mutex::new(None),
        }
    }

    /// Producer path: acquire a record, arm it, and link it into the intake
    /// list. On pool exhaustion the id is [`TimerId::INVALID`].
    pub(crate) fn schedule_into(
        &self,
        pool: &Pool<Task>,
        run_time: Instant,
        callback: Box<dyn FnOnce() + Send>,
    ) -> ScheduleResult {
        let Some((slot, task)) = pool.acquire() else {
            return ScheduleResult { id: TimerId::INVALID, earlier: false };
        };
        let id = task.arm(slot, run_time, callback);

        let mut earlier = false;
        {
            let mut nearest = self.nearest.lock();
            task.set_next(self.head.load(Ordering::Relaxed));
            self.head.store(slot, Ordering::Relaxed);
            if nearest.is_none_or(|t| run_time < t) {
                *nearest = Some(run_time);
                earlier = true;
            }
        }
        ScheduleResult { id, earlier }
    }

    /// Worker path: detach the whole intake list and reset the nearest
    /// cache. Returns the head slot, [`NIL`] when the bucket was empty.
    pub(crate) fn drain(&self) -> u32 {
        // Unlocked peek: producers and the worker are already sequenced
        // through the scheduler's global nearest hint, so a stale NIL here
        // only defers the task to the wake-up that its insertion guaranteed.
        // This keeps the worker's sweep over mostly-empty buckets cheap.
        if self.head.load(Ordering::Relaxed) == NIL {
            return NIL;
        }
        let mut nearest = self.nearest.lock();
        *nearest = None;
        self.head.swap(NIL, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop() -> Box<dyn FnOnce() + Send> {
        Box::new(|| {})
    }

    #[test]
    fn intake_is_lifo_and_drain_resets() {
        let pool = Pool::new();
        let bucket = Bucket::new();
        let base = Instant::now() + Duration::from_secs(1);

        let first = bucket.schedule_into(&pool, base, noop());
        let second = bucket.schedule_into(&pool, base + Duration::from_secs(1), noop());
        assert!(first.earlier);
        assert!(!second.earlier, "a later deadline is not the bucket's nearest");

        let head = bucket.drain();
        assert_eq!(head, second.id.slot());
        let head_task = pool.address(head).unwrap();
        assert_eq!(head_task.next(), first.id.slot());
        assert_eq!(pool.address(head_task.next()).unwrap().next(), NIL);

        assert_eq!(bucket.drain(), NIL);
    }

    #[test]
    fn earlier_insert_lowers_the_nearest_deadline() {
        let pool = Pool::new();
        let bucket = Bucket::new();
        let base = Instant::now() + Duration::from_secs(10);

        assert!(bucket.schedule_into(&pool, base, noop()).earlier);
        assert!(bucket.schedule_into(&pool, base - Duration::from_secs(5), noop()).earlier);

        // draining resets the cache, so the next push is "earlier" again
        bucket.drain();
        assert!(bucket.schedule_into(&pool, base + Duration::from_secs(5), noop()).earlier);
    }
}
