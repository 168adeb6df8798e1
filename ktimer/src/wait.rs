// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};
use std::time::Instant;

/// Wake-up protocol between producers and the worker.
///
/// Producers bump the epoch while holding the scheduler lock whenever they
/// lower the global nearest deadline, then wake the worker once outside the
/// lock. The worker snapshots the epoch under that same lock before
/// committing to a sleep; [`wait_until`][Signal::wait_until] returns as soon
/// as the epoch differs from the snapshot, and a wake arriving between the
/// snapshot and the park is kept alive by the unpark token, so no bump is
/// ever lost.
pub(crate) struct Signal {
    epoch: AtomicU32,
    worker: OnceLock<Thread>,
}

// === impl Signal ===

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            worker: OnceLock::new(),
        }
    }

    /// Registers the thread to wake. Called once, when the worker is spawned.
    pub(crate) fn register_worker(&self, worker: Thread) {
        let _ = self.worker.set(worker);
    }

    pub(crate) fn worker_thread(&self) -> Option<&Thread> {
        self.worker.get()
    }

    /// Callers hold the scheduler lock, which also orders the counter.
    pub(crate) fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Callers hold the scheduler lock.
    pub(crate) fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Wakes the worker if it is parked; a wake of a running worker is
    /// remembered by its next park.
    pub(crate) fn wake(&self) {
        if let Some(worker) = self.worker.get() {
            worker.unpark();
        }
    }

    /// Blocks the calling thread until the epoch differs from `expected`,
    /// the deadline passes, or any wake-up (including a buffered or spurious
    /// one) arrives; `None` means no deadline. Single-shot like a futex wait:
    /// the caller re-checks its own state and decides whether to wait again.
    /// Re-parking in here instead would eat a wake token that raced with the
    /// caller's last state check and sleep through it. Only the registered
    /// worker may call this.
    pub(crate) fn wait_until(&self, expected: u32, deadline: Option<Instant>) {
        if self.epoch.load(Ordering::Relaxed) != expected {
            return;
        }
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                thread::park_timeout(deadline - now);
            }
        }
    }
}
