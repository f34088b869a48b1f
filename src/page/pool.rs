use super::{Page, PageAllocator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Caller-owned free list used on the hot allocate/free path. No locking.
#[derive(Debug, Default)]
pub struct LocalPageList {
    pages: Vec<Page>,
}

impl LocalPageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, page: Page) {
        self.pages.push(page);
    }

    pub fn pop(&mut self) -> Option<Page> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Bounded stash of free pages kept back from the allocator.
#[derive(Debug)]
pub struct ReservedPagePool {
    pages: Mutex<Vec<Page>>,
    capacity: usize,
    // mirrors pages.len() for the lock-free pre-checks
    available: AtomicUsize,
}

impl ReservedPagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            available: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<Page> {
        if self.available() == 0 {
            return None;
        }
        let mut pages = self.pages.lock();
        let page = pages.pop();
        self.available.store(pages.len(), Ordering::Release);
        page
    }

    /// Hands the page back when the pool is already full.
    fn refill(&self, page: Page) -> Option<Page> {
        if self.available() >= self.capacity {
            return Some(page);
        }
        let mut pages = self.pages.lock();
        if pages.len() >= self.capacity {
            return Some(page);
        }
        pages.push(page);
        self.available.store(pages.len(), Ordering::Release);
        None
    }

    fn drain(&self) -> Vec<Page> {
        let mut pages = self.pages.lock();
        self.available.store(0, Ordering::Release);
        std::mem::take(&mut *pages)
    }
}

/// Page source for decompression jobs: local list, then reserved pool, then
/// the allocator.
pub struct PagePool {
    allocator: Arc<dyn PageAllocator>,
    reserved: Option<ReservedPagePool>,
}

impl PagePool {
    pub fn new(allocator: Arc<dyn PageAllocator>, reserved_pages: usize) -> Self {
        let reserved = (reserved_pages > 0).then(|| ReservedPagePool::new(reserved_pages));
        debug!(reserved_pages, "page pool initialized");
        Self {
            allocator,
            reserved,
        }
    }

    pub fn reserved(&self) -> Option<&ReservedPagePool> {
        self.reserved.as_ref()
    }

    pub fn reserved_available(&self) -> usize {
        self.reserved.as_ref().map_or(0, ReservedPagePool::available)
    }

    pub fn allocate_page(&self, local: &mut LocalPageList, try_reserved: bool) -> Option<Page> {
        if let Some(page) = local.pop() {
            return Some(page);
        }
        if try_reserved {
            if let Some(page) = self.reserved.as_ref().and_then(ReservedPagePool::take) {
                return Some(page);
            }
        }
        self.allocator.alloc_page()
    }

    /// Empty `local`, topping up the reserved pool before giving pages back to
    /// the allocator.
    pub fn release_pages(&self, local: &mut LocalPageList) {
        while let Some(page) = local.pop() {
            let page = match &self.reserved {
                Some(reserved) => match reserved.refill(page) {
                    Some(page) => page,
                    None => continue,
                },
                None => page,
            };
            self.allocator.free_page(page);
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if let Some(reserved) = &self.reserved {
            for page in reserved.drain() {
                self.allocator.free_page(page);
            }
        }
    }
}
