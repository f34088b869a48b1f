use super::{EvictableCounter, ReclaimCheck, RefState, Workgroup};
use crate::Result;
use crossbeam_epoch as epoch;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct IndexStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub collisions: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub collisions: u64,
    pub evictions: u64,
}

impl IndexStats {
    pub fn snapshot(&self) -> IndexStatsSnapshot {
        IndexStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// Far enough below zero that no run of decrements brings it back up.
const DETACHED: i64 = i64::MIN / 2;

/// Cluster index -> workgroup map of one mounted instance.
///
/// Lookups run lock-free against concurrent insertion and eviction. Entries
/// removed from the map are reclaimed through the epoch collector, so a
/// reader that loaded an entry keeps a valid workgroup even if it was evicted
/// in the meantime; it just cannot take a reference to it.
///
/// Idle workgroups are reported to the shared evictable counter until the
/// index is [detached](Self::detach); after that it stops contributing.
pub struct ManagedIndex<T: Send + Sync + 'static> {
    slots: SkipMap<u64, Arc<Workgroup<T>>>,
    evictable: Arc<EvictableCounter>,
    // this index's share of `evictable`, or DETACHED-based once detached
    idle: AtomicI64,
    reclaim: Box<dyn ReclaimCheck<T>>,
    stats: IndexStats,
}

impl<T: Send + Sync + 'static> ManagedIndex<T> {
    /// Index whose idle workgroups can always be reclaimed.
    pub fn new(evictable: Arc<EvictableCounter>) -> Self {
        Self::with_reclaim_check(evictable, |_: &Workgroup<T>| true)
    }

    pub fn with_reclaim_check<C>(evictable: Arc<EvictableCounter>, check: C) -> Self
    where
        C: ReclaimCheck<T> + 'static,
    {
        Self {
            slots: SkipMap::new(),
            evictable,
            idle: AtomicI64::new(0),
            reclaim: Box::new(check),
            stats: IndexStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn evictable(&self) -> &Arc<EvictableCounter> {
        &self.evictable
    }

    pub fn stats(&self) -> IndexStatsSnapshot {
        self.stats.snapshot()
    }

    /// Withdraw this index's idle workgroups from the shared counter and stop
    /// reporting to it. Used once the instance leaves the shrinker.
    pub fn detach(&self) {
        let idle = self.idle.swap(DETACHED, Ordering::AcqRel);
        if idle > DETACHED / 2 {
            self.evictable.add(-idle);
            trace!(idle, "workgroup index detached");
        }
    }

    pub fn is_detached(&self) -> bool {
        self.idle.load(Ordering::Acquire) <= DETACHED / 2
    }

    fn account(&self, delta: i64) {
        let prev = self.idle.fetch_add(delta, Ordering::AcqRel);
        if prev > DETACHED / 2 {
            self.evictable.add(delta);
        }
    }

    /// Take a reference to a workgroup linked in this index.
    ///
    /// Fails with `NotAvailable` if it is frozen for eviction or already
    /// freed; look it up again instead of waiting.
    pub fn get_reference(&self, grp: &Workgroup<T>) -> Result<()> {
        let prev = grp.counter().try_get()?;
        if prev == 1 {
            self.account(-1);
        }
        Ok(())
    }

    /// Referenced workgroup for `index`, if cached.
    pub fn find(&self, index: u64) -> Option<Arc<Workgroup<T>>> {
        loop {
            let grp = match self.slots.get(&index) {
                Some(entry) => entry.value().clone(),
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            if self.get_reference(&grp).is_ok() {
                debug_assert_eq!(grp.index(), index);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(grp);
            }
            // frozen entries are erased shortly
            std::hint::spin_loop();
        }
    }

    /// Publish `grp` under its index, or return the workgroup already there.
    ///
    /// Either way the caller gets back one reference to the returned
    /// workgroup. When another workgroup won, `grp` is left with just the
    /// caller's own reference; hand it to [`put`](Self::put).
    pub fn insert(&self, grp: Arc<Workgroup<T>>) -> Arc<Workgroup<T>> {
        // readers may find it the moment it is linked
        grp.counter().inc();

        loop {
            let entry = self.slots.get_or_insert(grp.index(), grp.clone());
            if Arc::ptr_eq(entry.value(), &grp) {
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                return grp;
            }
            if self.get_reference(entry.value()).is_ok() {
                let existing = entry.value().clone();
                grp.counter().dec();
                self.stats.collisions.fetch_add(1, Ordering::Relaxed);
                return existing;
            }
            drop(entry);
            trace!(index = grp.index(), "insert raced with eviction, retrying");
            std::thread::yield_now();
        }
    }

    /// Drop one reference, returning the remaining count.
    pub fn put(&self, grp: Arc<Workgroup<T>>) -> i32 {
        let count = grp.counter().dec();
        if count == 1 {
            self.account(1);
        } else if count == 0 {
            defer_destroy(grp);
        }
        count
    }

    /// Evict `grp`, which must be linked in this index, if nobody but the
    /// index holds it and the reclaim check agrees.
    pub fn try_evict(&self, grp: &Arc<Workgroup<T>>) -> bool {
        if !grp.counter().try_freeze(1) {
            return false;
        }
        if !self.reclaim.can_reclaim(grp) {
            grp.counter().unfreeze(1);
            return false;
        }

        match self.slots.get(&grp.index()) {
            Some(entry) if Arc::ptr_eq(entry.value(), grp) => {
                if !entry.remove() {
                    unreachable!("frozen workgroup {} erased by someone else", grp.index());
                }
            }
            _ => {
                // not linked here, e.g. the loser of an insert race
                grp.counter().unfreeze(1);
                return false;
            }
        }

        // the index's own reference goes with the entry
        grp.counter().unfreeze(0);
        self.account(-1);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        defer_destroy(grp.clone());
        true
    }

    /// Evict up to `nr_to_scan` idle workgroups, in index order.
    pub fn shrink(&self, nr_to_scan: usize) -> usize {
        let mut freed = 0;
        if nr_to_scan == 0 {
            return freed;
        }
        for entry in self.slots.iter() {
            let grp = entry.value().clone();
            if !self.try_evict(&grp) {
                continue;
            }
            freed += 1;
            if freed >= nr_to_scan {
                break;
            }
        }
        freed
    }
}

impl<T: Send + Sync + 'static> Drop for ManagedIndex<T> {
    fn drop(&mut self) {
        self.shrink(usize::MAX);
        if !self.slots.is_empty() {
            warn!(
                remaining = self.slots.len(),
                "workgroup index dropped with referenced entries"
            );
        }
    }
}

fn defer_destroy<T: Send + Sync + 'static>(grp: Arc<Workgroup<T>>) {
    debug_assert_eq!(grp.state(), RefState::Freed);
    let guard = epoch::pin();
    guard.defer(move || drop(grp));
}
