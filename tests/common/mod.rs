#![allow(dead_code)]

use std::sync::Arc;
use zcache::cpu::FixedCpu;
use zcache::mapping::AnonymousMapper;
use zcache::page::HeapPageAllocator;
use zcache::{Capabilities, Mount, Workgroup, ZcacheConfig, ZcacheContext};

pub struct TestContext {
    pub context: ZcacheContext,
    pub allocator: Arc<HeapPageAllocator>,
    pub cpu: Arc<FixedCpu>,
}

impl TestContext {
    /// Context over a heap allocator and a steerable CPU id.
    pub fn new(config: ZcacheConfig, nr_cpus: usize) -> Self {
        Self::with_allocator(config, nr_cpus, HeapPageAllocator::new())
    }

    pub fn with_allocator(config: ZcacheConfig, nr_cpus: usize, allocator: HeapPageAllocator) -> Self {
        let allocator = Arc::new(allocator);
        let cpu = Arc::new(FixedCpu::new(0, nr_cpus));
        let caps = Capabilities {
            allocator: allocator.clone(),
            mapper: Arc::new(AnonymousMapper),
            cpu: cpu.clone(),
        };
        let context = ZcacheContext::with_capabilities(config, caps)
            .expect("failed to build test context");
        Self {
            context,
            allocator,
            cpu,
        }
    }
}

/// Insert `keys` and drop the caller's reference so each ends up idle.
pub fn fill_idle<T, F>(mount: &Mount<T>, keys: std::ops::Range<u64>, mut payload: F)
where
    T: Send + Sync + 'static,
    F: FnMut(u64) -> T,
{
    for key in keys {
        let candidate = Workgroup::new(key, payload(key));
        let grp = mount.insert(candidate.clone());
        if !Arc::ptr_eq(&grp, &candidate) {
            mount.put(candidate);
        }
        mount.put(grp);
    }
}
