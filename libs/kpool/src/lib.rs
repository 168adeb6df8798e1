// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A recyclable record pool with stable addresses.
//!
//! [`Pool`] hands out fixed-size records keyed by a 32-bit slot index. Records
//! live in blocks that are allocated on demand and never freed or moved while
//! the pool is alive, so a `&T` obtained through [`Pool::address`] stays valid
//! for the pool's whole lifetime, including after the slot has been
//! [`release`][Pool::release]d and recycled. Callers that keep indices across
//! a release must carry their own liveness tag (e.g. a version counter inside
//! `T`); the pool only guarantees that the storage itself never goes away.
//!
//! Free slots are kept in sharded lists so that concurrent producers don't
//! fight over a single lock. A released slot goes to the shard derived from
//! its own index rather than the releasing thread: workloads where one
//! consumer thread releases everything would otherwise starve the producers'
//! shards and grow the pool without bound.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

/// Slots per block. Blocks are allocated whole and default-initialized once.
const BLOCK_LEN: usize = 1024;
/// Upper bound on the number of blocks; caps the pool at ~4M live records.
const MAX_BLOCKS: usize = 4096;
/// Free-list shards.
const SHARDS: usize = 16;

const MAX_SLOTS: u32 = (MAX_BLOCKS * BLOCK_LEN) as u32;

/// Sentinel slot index. Never handed out by [`Pool::acquire`], convenient as
/// a "no slot" marker in caller data structures that link records by index.
pub const NIL: u32 = u32::MAX;

/// A thread-safe pool of recyclable `T` records addressed by `u32` slots.
pub struct Pool<T> {
    /// Lazily published blocks; a cell is written exactly once (under `grow`)
    /// and read lock-free by `address`.
    blocks: Box<[AtomicPtr<T>]>,
    /// Number of published blocks; serializes block allocation.
    grow: Mutex<usize>,
    /// Sharded free lists of recycled slots.
    free: Box<[Mutex<Vec<u32>>]>,
    /// Bump cursor over never-used slots.
    fresh: AtomicU32,
    /// Live (acquired but not yet released) slots.
    outstanding: AtomicUsize,
}

// Safety: the raw block pointers are owned by the pool; shared access only
// ever produces `&T` (requiring `T: Sync`) and blocks are reclaimed with
// `&mut self` in `Drop` (requiring `T: Send`).
unsafe impl<T: Send + Sync> Send for Pool<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for Pool<T> {}

// === impl Pool ===

impl<T: Default + Send + Sync> Pool<T> {
    pub fn new() -> Self {
        Self {
            blocks: (0..MAX_BLOCKS).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            grow: Mutex::new(0),
            free: (0..SHARDS).map(|_| Mutex::new(Vec::new())).collect(),
            fresh: AtomicU32::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Hands out a free record and its slot index.
    ///
    /// The caller becomes the slot's exclusive owner until it is passed to
    /// [`release`][Pool::release]; the pool never gives the same slot to two
    /// live owners. The record is *recycled, not reset*: it still holds
    /// whatever state its previous owner left behind.
    ///
    /// Returns `None` only when the slot space is exhausted.
    pub fn acquire(&self) -> Option<(u32, &T)> {
        let home = home_shard();
        for probe in 0..SHARDS {
            let popped = self.free[(home + probe) % SHARDS].lock().pop();
            if let Some(slot) = popped {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                return Some((slot, self.address(slot)?));
            }
        }
        self.carve_fresh()
    }

    /// Returns `slot` to the pool. A later [`acquire`][Pool::acquire] may
    /// hand it out again.
    ///
    /// The caller must own the slot; releasing a slot twice or releasing an
    /// index it never acquired corrupts the free lists.
    pub fn release(&self, slot: u32) {
        debug_assert!(slot < self.fresh.load(Ordering::Relaxed));
        self.free[slot as usize % SHARDS].lock().push(slot);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns a reference to the record in `slot`, valid for the lifetime of
    /// the pool.
    ///
    /// Calling this on a released slot is legal and returns the (possibly
    /// recycled) record; distinguishing stale from live is the caller's job.
    /// Returns `None` only for indices that were never part of an allocated
    /// block, i.e. indices that cannot have come from `acquire`.
    pub fn address(&self, slot: u32) -> Option<&T> {
        let (block, offset) = (slot as usize / BLOCK_LEN, slot as usize % BLOCK_LEN);
        if block >= MAX_BLOCKS {
            return None;
        }
        let base = self.blocks[block].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // Safety: a non-null block cell was published (with release ordering)
        // after its BLOCK_LEN records were initialized, and blocks are only
        // deallocated in `Drop` with exclusive access.
        Some(unsafe { &*base.add(offset) })
    }

    /// Number of currently live slots.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn carve_fresh(&self) -> Option<(u32, &T)> {
        let slot = self
            .fresh
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next < MAX_SLOTS).then_some(next + 1)
            })
            .ok()?;

        let block = slot as usize / BLOCK_LEN;
        if self.blocks[block].load(Ordering::Acquire).is_null() {
            let mut published = self.grow.lock();
            while *published <= block {
                let records: Box<[T]> = (0..BLOCK_LEN).map(|_| T::default()).collect();
                tracing::trace!(block = *published, "allocating pool block");
                self.blocks[*published]
                    .store(Box::into_raw(records).cast::<T>(), Ordering::Release);
                *published += 1;
            }
        }

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some((slot, self.address(slot)?))
    }
}

impl<T: Default + Send + Sync> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        for cell in &mut self.blocks {
            let base = *cell.get_mut();
            if !base.is_null() {
                // Safety: the pointer came from `Box::into_raw` of a boxed
                // slice of exactly BLOCK_LEN records and is dropped only here.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, BLOCK_LEN)) });
            }
        }
    }
}

/// Thread-affine shard index: threads are spread round-robin over the shards
/// and stick to their shard for the fast acquire path.
fn home_shard() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static HOME: Cell<usize> = Cell::new(NEXT.fetch_add(1, Ordering::Relaxed) % SHARDS);
    }
    HOME.with(Cell::get)
}
