//! Refcounted cache units and the per-instance index that owns them.
//!
//! A workgroup caches the content of one cluster. Its count includes one
//! reference owned by the index for as long as it is linked there, so a count
//! of 1 means nobody but the cache is using it and it may be evicted. Eviction
//! freezes the count first; a frozen workgroup never hands out another
//! reference, which makes "erase from the index" and "drop the last
//! reference" a single step as far as lookups can tell.

pub mod index;
pub mod refcount;

pub use index::ManagedIndex;
pub use refcount::{RefState, Refcount};

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub struct Workgroup<T> {
    index: u64,
    refcount: Refcount,
    payload: T,
}

impl<T> Workgroup<T> {
    /// A new workgroup holding the creator's single reference.
    pub fn new(index: u64, payload: T) -> Arc<Self> {
        Arc::new(Self {
            index,
            refcount: Refcount::new(1),
            payload,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.get()
    }

    pub fn state(&self) -> RefState {
        self.refcount.state()
    }

    pub(crate) fn counter(&self) -> &Refcount {
        &self.refcount
    }
}

impl<T> fmt::Debug for Workgroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workgroup")
            .field("index", &self.index)
            .field("state", &self.state())
            .finish()
    }
}

/// Number of idle (evictable) workgroups across every mounted instance.
#[derive(Debug, Default)]
pub struct EvictableCounter(AtomicI64);

impl EvictableCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire).max(0) as usize
    }

    pub(crate) fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::AcqRel);
    }
}

/// Decides whether a frozen workgroup's payload can be let go right now, for
/// instance because none of its pages are still under I/O. Runs with the
/// workgroup frozen; returning `false` puts it back as idle.
pub trait ReclaimCheck<T>: Send + Sync {
    fn can_reclaim(&self, grp: &Workgroup<T>) -> bool;
}

impl<T, F> ReclaimCheck<T> for F
where
    F: Fn(&Workgroup<T>) -> bool + Send + Sync,
{
    fn can_reclaim(&self, grp: &Workgroup<T>) -> bool {
        self(grp)
    }
}
