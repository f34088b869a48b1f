//! Per-CPU scratch buffers for decompression.
//!
//! The pool holds one shard per CPU (or fewer, if configured). A shard is a
//! lock and a virtually contiguous mapping whose region holds the shard's
//! pages. Acquiring a buffer pins the caller to its CPU and holds the shard
//! lock until the buffer is released, so a shard has at most one user.
//!
//! Shards only ever grow. A resize maps the old frames plus fresh ones off to
//! the side, copies the old contents across under the shard lock and swaps
//! the mapping in, so holders of a buffer see either the old mapping or the
//! new one, never a mix.

use crate::context::Capabilities;
use crate::cpu::{CpuPinner, MigrationGuard};
use crate::mapping::{MapAttr, PageMapper, VirtualMapping};
use crate::page::{Page, PageAllocator, PageFrame};
use crate::{Error, Result};
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{info, trace, warn};

#[derive(Default)]
struct ShardState {
    mapping: Option<VirtualMapping>,
}

impl ShardState {
    fn nr_pages(&self) -> usize {
        self.mapping.as_ref().map_or(0, VirtualMapping::nr_pages)
    }
}

pub struct GlobalBufferPool {
    shards: Box<[CachePadded<Mutex<ShardState>>]>,
    // committed page count of every shard; also serializes resizes
    resize: Mutex<usize>,
    allocator: Arc<dyn PageAllocator>,
    mapper: Arc<dyn PageMapper>,
    cpu: Arc<dyn CpuPinner>,
    attr: MapAttr,
}

/// Exclusive use of one shard's mapping. Releasing it unlocks the shard and
/// re-enables migration.
pub struct ScratchBuffer<'a> {
    state: MutexGuard<'a, ShardState>,
    _pin: MigrationGuard<'a>,
    shard: usize,
}

impl ScratchBuffer<'_> {
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn nr_pages(&self) -> usize {
        self.state.nr_pages()
    }

    pub fn frames(&self) -> &[PageFrame] {
        self.state
            .mapping
            .as_ref()
            .map(VirtualMapping::frames)
            .unwrap_or(&[])
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.state
            .mapping
            .as_ref()
            .map(VirtualMapping::as_slice)
            .unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.state.mapping.as_mut() {
            Some(mapping) => mapping.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Deref for ScratchBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for ScratchBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl GlobalBufferPool {
    /// `global_buffers == 0` means one shard per CPU; larger values are
    /// clamped to the CPU count.
    pub fn new(global_buffers: usize, attr: MapAttr, caps: &Capabilities) -> Self {
        let nr_cpus = caps.cpu.nr_cpus().max(1);
        let count = match global_buffers {
            0 => nr_cpus,
            n => n.min(nr_cpus),
        };
        let shards = (0..count)
            .map(|_| CachePadded::new(Mutex::new(ShardState::default())))
            .collect();

        info!(shards = count, ?attr, "global buffer pool initialized");
        Self {
            shards,
            resize: Mutex::new(0),
            allocator: caps.allocator.clone(),
            mapper: caps.mapper.clone(),
            cpu: caps.cpu.clone(),
            attr,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Page count every shard is guaranteed to have.
    pub fn nr_pages(&self) -> usize {
        *self.resize.lock()
    }

    pub fn shard_pages(&self, shard: usize) -> usize {
        self.shards.get(shard).map_or(0, |s| s.lock().nr_pages())
    }

    /// Lock the current CPU's shard if it holds at least `required` pages.
    ///
    /// `None` means the shard is too small: grow the pool and retry.
    pub fn acquire(&self, required: usize) -> Option<ScratchBuffer<'_>> {
        let pin = MigrationGuard::new(&*self.cpu);
        let shard = pin.cpu() % self.shards.len();
        let state = self.shards[shard].lock();

        if state.mapping.is_none() || required > state.nr_pages() {
            trace!(shard, required, have = state.nr_pages(), "scratch buffer too small");
            return None;
        }
        Some(ScratchBuffer {
            state,
            _pin: pin,
            shard,
        })
    }

    pub fn release(&self, buffer: ScratchBuffer<'_>) {
        drop(buffer);
    }

    /// Grow every shard to at least `nrpages`. Never shrinks.
    ///
    /// On allocation or mapping failure the shard being resized keeps its old
    /// mapping and contents; shards already resized stay resized.
    pub fn grow(&self, nrpages: usize) -> Result<()> {
        let mut committed = self.resize.lock();
        if nrpages <= *committed {
            return Ok(());
        }

        for (shard_id, shard) in self.shards.iter().enumerate() {
            let mut frames: Vec<PageFrame> = {
                let state = shard.lock();
                if state.nr_pages() >= nrpages {
                    continue;
                }
                let mut frames = Vec::with_capacity(nrpages);
                if let Some(mapping) = &state.mapping {
                    frames.extend_from_slice(mapping.frames());
                }
                frames
            };
            let carried = frames.len();

            let mut fresh = self.alloc_fresh(nrpages - carried).map_err(|e| {
                warn!(shard = shard_id, nrpages, "scratch buffer growth failed: out of pages");
                e
            })?;
            frames.extend(fresh.iter().map(Page::frame));

            let mut mapping = match self.mapper.map_pages(&frames, self.attr) {
                Ok(mapping) => mapping,
                Err(e) => {
                    warn!(
                        shard = shard_id,
                        nrpages,
                        error = %e,
                        "scratch buffer growth failed: mapping"
                    );
                    self.free_all(fresh);
                    return Err(e);
                }
            };
            if let Err(e) = mapping.adopt_pages(carried, &mut fresh) {
                self.mapper.unmap(mapping);
                self.free_all(fresh);
                return Err(e);
            }

            let old = {
                let mut state = shard.lock();
                if let Some(old) = &state.mapping {
                    if let Err(e) = mapping.carry_over(old) {
                        drop(state);
                        self.free_all(mapping.into_pages().into_iter().skip(carried));
                        return Err(e);
                    }
                }
                state.mapping.replace(mapping)
            };
            // its frames live on in the new mapping
            if let Some(old) = old {
                self.mapper.unmap(old);
            }
            trace!(shard = shard_id, nrpages, "scratch shard resized");
        }

        info!(from = *committed, to = nrpages, "global buffer pool grown");
        *committed = nrpages;
        Ok(())
    }

    fn alloc_fresh(&self, count: usize) -> Result<Vec<Page>> {
        let mut slots: Vec<Option<Page>> = std::iter::repeat_with(|| None).take(count).collect();
        let mut filled = 0;
        while filled < count {
            let last = filled;
            filled = self.allocator.alloc_pages_bulk(&mut slots);
            if filled == last {
                self.free_all(slots.into_iter().flatten());
                return Err(Error::Memory);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn free_all(&self, pages: impl IntoIterator<Item = Page>) {
        for page in pages {
            self.allocator.free_page(page);
        }
    }
}

impl Drop for GlobalBufferPool {
    fn drop(&mut self) {
        let allocator = &self.allocator;
        for shard in self.shards.iter_mut() {
            if let Some(mapping) = shard.get_mut().mapping.take() {
                for page in mapping.into_pages() {
                    allocator.free_page(page);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{FixedCpu, SystemCpu};
    use crate::mapping::AnonymousMapper;
    use crate::page::HeapPageAllocator;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn caps(allocator: Arc<HeapPageAllocator>, cpu: Arc<dyn CpuPinner>) -> Capabilities {
        Capabilities {
            allocator,
            mapper: Arc::new(AnonymousMapper),
            cpu,
        }
    }

    /// Maps successfully `remaining` times, then fails.
    struct FlakyMapper {
        remaining: AtomicUsize,
    }

    impl PageMapper for FlakyMapper {
        fn map_pages(&self, frames: &[PageFrame], attr: MapAttr) -> Result<VirtualMapping> {
            let granted = self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            match granted {
                Ok(_) => AnonymousMapper.map_pages(frames, attr),
                Err(_) => Err(Error::Mapping("no address space".into())),
            }
        }
    }

    #[test]
    fn test_shard_count_clamped_to_cpus() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let cpu = Arc::new(FixedCpu::new(0, 4));
        let caps = caps(allocator, cpu);
        assert_eq!(GlobalBufferPool::new(0, MapAttr::Cacheable, &caps).shard_count(), 4);
        assert_eq!(GlobalBufferPool::new(2, MapAttr::Cacheable, &caps).shard_count(), 2);
        assert_eq!(GlobalBufferPool::new(16, MapAttr::Cacheable, &caps).shard_count(), 4);
    }

    #[test]
    fn test_acquire_fails_until_grown() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = caps(allocator, Arc::new(FixedCpu::new(0, 1)));
        let pool = GlobalBufferPool::new(1, MapAttr::Cacheable, &caps);

        assert!(pool.acquire(0).is_none());
        assert!(pool.acquire(1).is_none());

        pool.grow(2).unwrap();
        let mut buf = pool.acquire(2).unwrap();
        assert_eq!(buf.nr_pages(), 2);
        assert_eq!(buf.len(), 2 * crate::page::PAGE_SIZE);
        buf[0] = 1;
        pool.release(buf);

        assert!(pool.acquire(3).is_none());
    }

    #[test]
    fn test_shard_selected_by_cpu() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let cpu = Arc::new(FixedCpu::new(5, 4));
        let pool = GlobalBufferPool::new(4, MapAttr::Cacheable, &caps(allocator, cpu.clone()));
        pool.grow(1).unwrap();

        assert_eq!(pool.acquire(1).unwrap().shard(), 1);
        cpu.set_cpu(2);
        assert_eq!(pool.acquire(1).unwrap().shard(), 2);
    }

    #[test]
    fn test_grow_is_monotonic() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = caps(allocator.clone(), Arc::new(FixedCpu::new(0, 2)));
        let pool = GlobalBufferPool::new(2, MapAttr::Cacheable, &caps);

        pool.grow(4).unwrap();
        assert_eq!(allocator.live_pages(), 8);
        let frames_before: Vec<PageFrame> = pool.acquire(4).unwrap().frames().to_vec();

        pool.grow(2).unwrap();
        assert_eq!(pool.nr_pages(), 4);
        assert_eq!(pool.shard_pages(0), 4);

        pool.grow(6).unwrap();
        assert_eq!(pool.nr_pages(), 6);
        assert_eq!(allocator.live_pages(), 12);
        let buf = pool.acquire(6).unwrap();
        // existing pages are carried into the new mapping
        assert_eq!(&buf.frames()[..4], &frames_before[..]);
    }

    #[test]
    fn test_grow_keeps_buffer_contents() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = caps(allocator.clone(), Arc::new(FixedCpu::new(0, 1)));
        let pool = GlobalBufferPool::new(1, MapAttr::Cacheable, &caps);

        pool.grow(1).unwrap();
        let mut buf = pool.acquire(1).unwrap();
        let first = buf.frames()[0];
        buf[10] = 0xAB;
        pool.release(buf);

        pool.grow(2).unwrap();
        let buf = pool.acquire(2).unwrap();
        assert_eq!(buf.frames()[0], first);
        assert_eq!(buf[10], 0xAB);
        assert!(buf[crate::page::PAGE_SIZE..].iter().all(|&b| b == 0));
        drop(buf);
        assert_eq!(allocator.live_pages(), 2);
    }

    #[test]
    fn test_failed_growth_rolls_back() {
        // enough for the first shard at 3 pages, not for the second
        let allocator = Arc::new(HeapPageAllocator::with_limit(5));
        let caps = caps(allocator.clone(), Arc::new(FixedCpu::new(1, 2)));
        let pool = GlobalBufferPool::new(2, MapAttr::Cacheable, &caps);
        pool.grow(1).unwrap();
        assert_eq!(allocator.live_pages(), 2);

        let err = pool.grow(3).unwrap_err();
        assert!(matches!(err, Error::Memory));
        assert_eq!(pool.nr_pages(), 1);
        assert_eq!(pool.shard_pages(0), 3);
        assert_eq!(pool.shard_pages(1), 1);
        // nothing half-allocated is left behind
        assert_eq!(allocator.live_pages(), 4);

        let buf = pool.acquire(1).unwrap();
        assert_eq!(buf.shard(), 1);
        assert_eq!(buf.len(), crate::page::PAGE_SIZE);
    }

    #[test]
    fn test_mapping_failure_keeps_old_mapping() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = Capabilities {
            allocator: allocator.clone(),
            mapper: Arc::new(FlakyMapper {
                remaining: AtomicUsize::new(1),
            }),
            cpu: Arc::new(FixedCpu::new(0, 1)),
        };
        let pool = GlobalBufferPool::new(1, MapAttr::Cacheable, &caps);
        pool.grow(1).unwrap();
        let frames_before = pool.acquire(1).unwrap().frames().to_vec();

        assert!(matches!(pool.grow(2), Err(Error::Mapping(_))));
        assert_eq!(pool.nr_pages(), 1);
        assert_eq!(pool.shard_pages(0), 1);
        assert_eq!(allocator.live_pages(), 1);

        let buf = pool.acquire(1).unwrap();
        assert_eq!(buf.frames(), &frames_before[..]);
        drop(buf);
        assert!(pool.acquire(2).is_none());
    }

    #[test]
    fn test_drop_returns_all_pages() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = caps(allocator.clone(), Arc::new(FixedCpu::new(0, 3)));
        let pool = GlobalBufferPool::new(3, MapAttr::Cacheable, &caps);
        pool.grow(5).unwrap();
        assert_eq!(allocator.live_pages(), 15);
        drop(pool);
        assert_eq!(allocator.live_pages(), 0);
    }

    #[test]
    fn test_concurrent_acquire_during_growth_sees_whole_mappings() {
        let allocator = Arc::new(HeapPageAllocator::new());
        let caps = caps(allocator, Arc::new(SystemCpu));
        let pool = Arc::new(GlobalBufferPool::new(0, MapAttr::Cacheable, &caps));
        pool.grow(1).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut observed = 0usize;
                    while !stop.load(Ordering::Relaxed) {
                        if let Some(buf) = pool.acquire(1) {
                            assert_eq!(buf.len(), buf.nr_pages() * crate::page::PAGE_SIZE);
                            assert_eq!(buf.frames().len(), buf.nr_pages());
                            observed = observed.max(buf.nr_pages());
                        }
                    }
                    observed
                })
            })
            .collect();

        for target in 2..=16 {
            pool.grow(target).unwrap();
        }
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() <= 16);
        }
        assert_eq!(pool.nr_pages(), 16);
    }
}
