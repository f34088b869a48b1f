//! Physical page handles and the allocator capability.

pub mod pool;

pub use pool::{LocalPageList, PagePool, ReservedPagePool};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Identity of a physical page, stable for the lifetime of the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageFrame(pub u64);

/// One owned page of memory.
pub struct Page {
    frame: PageFrame,
    data: Box<[u8]>,
}

impl Page {
    pub fn new(frame: PageFrame) -> Self {
        Self {
            frame,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// A page holding a copy of `bytes`, zero-filled past their end.
    pub fn from_bytes(frame: PageFrame, bytes: &[u8]) -> Self {
        let mut page = Self::new(frame);
        let len = bytes.len().min(PAGE_SIZE);
        page.data[..len].copy_from_slice(&bytes[..len]);
        page
    }

    pub fn frame(&self) -> PageFrame {
        self.frame
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("frame", &self.frame).finish()
    }
}

/// Source of fresh pages. Failure is reported as `None`, never a panic.
pub trait PageAllocator: Send + Sync {
    fn alloc_page(&self) -> Option<Page>;

    /// Fill the empty slots of `slots`, returning how many slots are populated
    /// afterwards. May stop early when memory runs out.
    fn alloc_pages_bulk(&self, slots: &mut [Option<Page>]) -> usize {
        for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
            match self.alloc_page() {
                Some(page) => *slot = Some(page),
                None => break,
            }
        }
        slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn free_page(&self, page: Page);
}

/// Heap-backed allocator with an optional cap on live pages.
#[derive(Debug, Default)]
pub struct HeapPageAllocator {
    next_frame: AtomicU64,
    live: AtomicUsize,
    limit: Option<usize>,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl HeapPageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to hand out more than `limit` live pages.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn live_pages(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn total_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn total_freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}

impl PageAllocator for HeapPageAllocator {
    fn alloc_page(&self) -> Option<Page> {
        match self.limit {
            Some(limit) => {
                self.live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                        (live < limit).then_some(live + 1)
                    })
                    .ok()?;
            }
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
            }
        }

        let frame = PageFrame(self.next_frame.fetch_add(1, Ordering::Relaxed));
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(Page::new(frame))
    }

    fn free_page(&self, page: Page) {
        drop(page);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}
