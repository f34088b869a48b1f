//! Memory-pressure reclaim across every mounted instance.
//!
//! The shrinker keeps the registry of mounted instances. A scan walks the
//! registry from the head, evicts idle workgroups from each instance it can
//! claim, and moves every instance it serviced to the tail. Each scan has its
//! own pass id so it stops once it comes back around to an instance it has
//! already handled.
//!
//! Every instance carries an unmount lock. A scan only try-locks it, so an
//! instance in the middle of unmounting is skipped rather than waited for;
//! unmount takes it for real, drains the instance, and then unlinks it.

pub mod monitor;

pub use monitor::PressureMonitor;

use crate::workgroup::{EvictableCounter, ManagedIndex};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Something holding reclaimable objects.
pub trait Shrinkable: Send + Sync {
    /// Free up to `nr_to_scan` objects, returning how many were freed.
    fn shrink(&self, nr_to_scan: usize) -> usize;

    /// Stop counting toward the global evictable total. Called once the
    /// instance has been drained for unmount.
    fn detach(&self) {}
}

impl<T: Send + Sync + 'static> Shrinkable for ManagedIndex<T> {
    fn shrink(&self, nr_to_scan: usize) -> usize {
        ManagedIndex::shrink(self, nr_to_scan)
    }

    fn detach(&self) {
        ManagedIndex::detach(self)
    }
}

/// The two callbacks a memory-pressure source drives.
pub trait ShrinkControl: Send + Sync {
    fn count_objects(&self) -> usize;

    fn scan_objects(&self, nr_to_scan: usize) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(pub u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount-{}", self.0)
    }
}

struct MountSlot {
    id: MountId,
    // pass id of the last scan that serviced this instance
    last_pass: AtomicU32,
    umount: Mutex<()>,
    cache: Arc<dyn Shrinkable>,
}

/// Proof of registration, consumed by [`Shrinker::unregister`].
pub struct MountHandle {
    slot: Arc<MountSlot>,
}

impl MountHandle {
    pub fn id(&self) -> MountId {
        self.slot.id
    }

    /// Hold the unmount lock, as an unmount in progress would.
    pub fn lock_for_unmount(&self) -> MutexGuard<'_, ()> {
        self.slot.umount.lock()
    }
}

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle").field("id", &self.slot.id).finish()
    }
}

#[derive(Default)]
struct Registry {
    mounts: VecDeque<Arc<MountSlot>>,
    pass: u32,
}

impl Registry {
    fn next_pass(&mut self) -> u32 {
        loop {
            self.pass = self.pass.wrapping_add(1);
            if self.pass != 0 {
                return self.pass;
            }
        }
    }

    fn position(&self, slot: &Arc<MountSlot>) -> Option<usize> {
        self.mounts.iter().position(|m| Arc::ptr_eq(m, slot))
    }
}

pub struct Shrinker {
    registry: Mutex<Registry>,
    evictable: Arc<EvictableCounter>,
    next_id: AtomicU64,
}

impl Default for Shrinker {
    fn default() -> Self {
        Self::new()
    }
}

impl Shrinker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            evictable: Arc::new(EvictableCounter::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Counter every registered index must report its idle workgroups to.
    pub fn evictable(&self) -> &Arc<EvictableCounter> {
        &self.evictable
    }

    pub fn mounted(&self) -> usize {
        self.registry.lock().mounts.len()
    }

    /// Registered instances from head to tail.
    pub fn mount_order(&self) -> Vec<MountId> {
        self.registry.lock().mounts.iter().map(|m| m.id).collect()
    }

    pub fn register(&self, cache: Arc<dyn Shrinkable>) -> MountHandle {
        let slot = Arc::new(MountSlot {
            id: MountId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            last_pass: AtomicU32::new(0),
            umount: Mutex::new(()),
            cache,
        });

        let mut registry = self.registry.lock();
        registry.mounts.push_front(slot.clone());
        info!(mount = %slot.id, mounted = registry.mounts.len(), "instance registered");
        MountHandle { slot }
    }

    /// Drain every evictable workgroup of the instance and unlink it. Waits
    /// for any scan currently working on it. Returns the number evicted.
    ///
    /// Workgroups still referenced at this point never become evictable:
    /// the instance is detached from the global count.
    pub fn unregister(&self, handle: MountHandle) -> usize {
        let slot = handle.slot;
        let _umount = slot.umount.lock();
        let freed = slot.cache.shrink(usize::MAX);
        slot.cache.detach();

        let mut registry = self.registry.lock();
        if let Some(pos) = registry.position(&slot) {
            registry.mounts.remove(pos);
        }
        info!(mount = %slot.id, freed, mounted = registry.mounts.len(), "instance unregistered");
        freed
    }

    pub fn count(&self) -> usize {
        self.evictable.get()
    }

    /// Evict up to `nr_to_scan` workgroups, spreading the work across
    /// instances.
    pub fn scan(&self, nr_to_scan: usize) -> usize {
        let mut freed = 0;
        if nr_to_scan == 0 {
            return freed;
        }

        let mut registry = self.registry.lock();
        let pass = registry.next_pass();
        let mut pos = 0;
        let mut skipped = 0;

        while let Some(slot) = registry.mounts.get(pos).cloned() {
            // serviced instances sit at the tail; reaching one means we wrapped
            if slot.last_pass.load(Ordering::Relaxed) == pass {
                break;
            }
            let Some(umount) = slot.umount.try_lock() else {
                trace!(mount = %slot.id, "instance busy unmounting, skipped");
                skipped += 1;
                pos += 1;
                continue;
            };

            slot.last_pass.store(pass, Ordering::Relaxed);
            let want = nr_to_scan - freed;
            let got = MutexGuard::unlocked(&mut registry, || slot.cache.shrink(want));
            freed += got;
            trace!(mount = %slot.id, freed = got, "instance shrunk");

            // the element after this one takes its position once it moves
            // to the tail
            if let Some(at) = registry.position(&slot) {
                if let Some(moved) = registry.mounts.remove(at) {
                    registry.mounts.push_back(moved);
                }
                pos = at;
            }
            drop(umount);

            if freed >= nr_to_scan {
                break;
            }
        }
        drop(registry);

        debug!(pass, requested = nr_to_scan, freed, skipped, "shrink pass finished");
        freed
    }
}

impl ShrinkControl for Shrinker {
    fn count_objects(&self) -> usize {
        self.count()
    }

    fn scan_objects(&self, nr_to_scan: usize) -> usize {
        self.scan(nr_to_scan)
    }
}
