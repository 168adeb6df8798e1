// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A process-wide default scheduler.
//!
//! Most programs want exactly one timer thread. These helpers lazily start a
//! shared [`TimerThread`] with default options on first use; it lives for the
//! rest of the process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::{StartError, TimerId, TimerOptions, TimerThread, UnscheduleError};

/// The shared scheduler, started on first call.
pub fn default_timer() -> Result<&'static TimerThread, StartError> {
    static GLOBAL: OnceLock<TimerThread> = OnceLock::new();
    let timer = GLOBAL.get_or_init(TimerThread::new);
    timer.start(TimerOptions::default())?;
    Ok(timer)
}

/// Schedules `f` on the shared scheduler to run at or soon after `at`.
///
/// Returns [`TimerId::INVALID`] when the shared scheduler cannot be started
/// or the task was not accepted.
#[must_use = "the returned id is the only handle for cancelling"]
pub fn run_at<F>(f: F, at: Instant) -> TimerId
where
    F: FnOnce() + Send + 'static,
{
    match default_timer() {
        Ok(timer) => timer.schedule(f, at),
        Err(error) => {
            tracing::error!(%error, "failed to start the default timer");
            TimerId::INVALID
        }
    }
}

/// Schedules `f` on the shared scheduler to run after `delay`.
#[must_use = "the returned id is the only handle for cancelling"]
pub fn run_after<F>(f: F, delay: Duration) -> TimerId
where
    F: FnOnce() + Send + 'static,
{
    match default_timer() {
        Ok(timer) => timer.schedule_after(f, delay),
        Err(error) => {
            tracing::error!(%error, "failed to start the default timer");
            TimerId::INVALID
        }
    }
}

/// Cancels a task scheduled through [`run_at`] or [`run_after`].
pub fn cancel(id: TimerId) -> Result<(), UnscheduleError> {
    match default_timer() {
        Ok(timer) => timer.unschedule(id),
        Err(_) => Err(UnscheduleError::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn the_default_timer_runs_tasks() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let id = run_after(
            || {
                RUNS.fetch_add(1, Ordering::Relaxed);
            },
            Duration::from_millis(10),
        );
        assert!(id.is_valid());

        let parked = run_after(|| unreachable!("cancelled task must not run"), Duration::from_secs(600));
        assert_eq!(cancel(parked), Ok(()));

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(cancel(id), Err(UnscheduleError::NotFound));
    }
}
