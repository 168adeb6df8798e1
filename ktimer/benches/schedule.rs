// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use ktimer::{TimerOptions, TimerThread};

/// The producer hot path: schedule + cancel. Deadlines sit slightly in the
/// future so the worker keeps draining (and recycling) cancelled slots while
/// the benchmark hammers the intake side.
fn schedule_unschedule(c: &mut Criterion) {
    let timer = TimerThread::new();
    timer.start(TimerOptions::default()).unwrap();

    c.bench_function("schedule_unschedule", |b| {
        b.iter(|| {
            let at = Instant::now() + Duration::from_millis(50);
            let id = timer.schedule(|| {}, at);
            let _ = timer.unschedule(id);
        });
    });

    timer.stop_and_join();
}

fn schedule_into_contended_buckets(c: &mut Criterion) {
    let timer = TimerThread::new();
    timer.start(TimerOptions { num_buckets: 1 }).unwrap();

    c.bench_function("schedule_unschedule/1_bucket", |b| {
        b.iter(|| {
            let at = Instant::now() + Duration::from_millis(50);
            let id = timer.schedule(|| {}, at);
            let _ = timer.unschedule(id);
        });
    });

    timer.stop_and_join();
}

criterion_group!(benches, schedule_unschedule, schedule_into_contended_buckets);
criterion_main!(benches);
