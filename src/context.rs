//! Process-wide state and mounted instances.
//!
//! A [`ZcacheContext`] is what module init builds: the page pool, the scratch
//! buffer pool and the shrinker with its registry. Each [`Mount`] is one
//! mounted image with its own workgroup index, registered with the shrinker
//! for as long as it lives.

use crate::config::ZcacheConfig;
use crate::cpu::{CpuPinner, SystemCpu};
use crate::mapping::{AnonymousMapper, PageMapper};
use crate::page::{HeapPageAllocator, PageAllocator, PagePool};
use crate::scratch::GlobalBufferPool;
use crate::shrinker::{MountHandle, MountId, PressureMonitor, ShrinkControl, Shrinker};
use crate::workgroup::index::IndexStatsSnapshot;
use crate::workgroup::{ManagedIndex, ReclaimCheck, Workgroup};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// The host services the caches run on.
#[derive(Clone)]
pub struct Capabilities {
    pub allocator: Arc<dyn PageAllocator>,
    pub mapper: Arc<dyn PageMapper>,
    pub cpu: Arc<dyn CpuPinner>,
}

impl Capabilities {
    pub fn system() -> Self {
        Self {
            allocator: Arc::new(HeapPageAllocator::new()),
            mapper: Arc::new(AnonymousMapper),
            cpu: Arc::new(SystemCpu),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("nr_cpus", &self.cpu.nr_cpus())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZcacheStats {
    pub mounted: usize,
    pub evictable: usize,
    pub scratch_shards: usize,
    pub scratch_pages: usize,
    pub reserved_available: usize,
    pub monitor_running: bool,
}

pub struct ZcacheContext {
    config: ZcacheConfig,
    pages: PagePool,
    buffers: GlobalBufferPool,
    shrinker: Arc<Shrinker>,
    monitor: Mutex<Option<PressureMonitor>>,
}

impl ZcacheContext {
    pub fn new(config: ZcacheConfig) -> Result<Self> {
        Self::with_capabilities(config, Capabilities::system())
    }

    pub fn with_capabilities(config: ZcacheConfig, caps: Capabilities) -> Result<Self> {
        config.validate()?;

        let pages = PagePool::new(caps.allocator.clone(), config.reserved_pages);
        let buffers = GlobalBufferPool::new(config.global_buffers, config.map_attr, &caps);
        if config.initial_buffer_pages > 0 {
            buffers.grow(config.initial_buffer_pages)?;
        }

        let context = Self {
            config,
            pages,
            buffers,
            shrinker: Arc::new(Shrinker::new()),
            monitor: Mutex::new(None),
        };
        if context.config.shrinker.monitor_enabled {
            context.start_monitor()?;
        }

        info!(
            shards = context.buffers.shard_count(),
            scratch_pages = context.buffers.nr_pages(),
            reserved_pages = context.config.reserved_pages,
            "zcache context ready"
        );
        Ok(context)
    }

    pub fn config(&self) -> &ZcacheConfig {
        &self.config
    }

    pub fn pages(&self) -> &PagePool {
        &self.pages
    }

    pub fn buffers(&self) -> &GlobalBufferPool {
        &self.buffers
    }

    pub fn shrinker(&self) -> &Arc<Shrinker> {
        &self.shrinker
    }

    /// Start the pressure monitor if it is not already running.
    pub fn start_monitor(&self) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            let control: Arc<dyn ShrinkControl> = self.shrinker.clone();
            *monitor = Some(PressureMonitor::spawn(control, &self.config.shrinker)?);
        }
        Ok(())
    }

    pub fn stop_monitor(&self) {
        // join outside the lock
        let monitor = self.monitor.lock().take();
        drop(monitor);
    }

    pub fn mount<T: Send + Sync + 'static>(&self) -> Mount<T> {
        let index = ManagedIndex::new(self.shrinker.evictable().clone());
        Mount::register(self.shrinker.clone(), index)
    }

    /// Mount whose workgroups are only evicted when `check` allows it.
    pub fn mount_with_check<T, C>(&self, check: C) -> Mount<T>
    where
        T: Send + Sync + 'static,
        C: ReclaimCheck<T> + 'static,
    {
        let index = ManagedIndex::with_reclaim_check(self.shrinker.evictable().clone(), check);
        Mount::register(self.shrinker.clone(), index)
    }

    pub fn stats(&self) -> ZcacheStats {
        ZcacheStats {
            mounted: self.shrinker.mounted(),
            evictable: self.shrinker.count(),
            scratch_shards: self.buffers.shard_count(),
            scratch_pages: self.buffers.nr_pages(),
            reserved_available: self.pages.reserved_available(),
            monitor_running: self.monitor.lock().as_ref().is_some_and(PressureMonitor::is_running),
        }
    }
}

impl Drop for ZcacheContext {
    fn drop(&mut self) {
        self.stop_monitor();
        let mounted = self.shrinker.mounted();
        if mounted > 0 {
            warn!(mounted, "zcache context torn down with instances still mounted");
        }
    }
}

impl fmt::Debug for ZcacheContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZcacheContext")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One mounted instance. Dropping it unmounts.
pub struct Mount<T: Send + Sync + 'static> {
    index: Arc<ManagedIndex<T>>,
    shrinker: Arc<Shrinker>,
    handle: Option<MountHandle>,
    id: MountId,
}

impl<T: Send + Sync + 'static> Mount<T> {
    fn register(shrinker: Arc<Shrinker>, index: ManagedIndex<T>) -> Self {
        let index = Arc::new(index);
        let handle = shrinker.register(index.clone());
        Self {
            id: handle.id(),
            index,
            shrinker,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn index(&self) -> &ManagedIndex<T> {
        &self.index
    }

    pub fn find(&self, index: u64) -> Option<Arc<Workgroup<T>>> {
        self.index.find(index)
    }

    pub fn insert(&self, grp: Arc<Workgroup<T>>) -> Arc<Workgroup<T>> {
        self.index.insert(grp)
    }

    pub fn put(&self, grp: Arc<Workgroup<T>>) -> i32 {
        self.index.put(grp)
    }

    pub fn try_evict(&self, grp: &Arc<Workgroup<T>>) -> bool {
        self.index.try_evict(grp)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> IndexStatsSnapshot {
        self.index.stats()
    }

    /// Evict everything evictable and leave the registry. Returns the number
    /// of workgroups evicted.
    pub fn unmount(mut self) -> usize {
        self.leave_registry()
    }

    fn leave_registry(&mut self) -> usize {
        match self.handle.take() {
            Some(handle) => {
                let freed = self.shrinker.unregister(handle);
                if !self.index.is_empty() {
                    warn!(
                        mount = %self.id,
                        referenced = self.index.len(),
                        "unmounted with workgroups still referenced"
                    );
                }
                freed
            }
            None => 0,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Mount<T> {
    fn drop(&mut self) {
        self.leave_registry();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Mount<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("cached", &self.index.len())
            .finish()
    }
}
