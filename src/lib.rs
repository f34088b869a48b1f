//! In-memory caching and reclaim engine for compressed read-only images.
//!
//! Four pieces, leaves first:
//!
//! - [`page`]: single pages, a bounded reserved pool and per-caller free lists
//! - [`scratch`]: per-CPU, growable, virtually contiguous decompression buffers
//! - [`workgroup`]: the per-mount index of refcounted cache units with
//!   freeze-based eviction
//! - [`shrinker`]: the registry of mounted instances and the fair reclaim scan
//!   driven by memory pressure
//!
//! [`ZcacheContext`] wires them together; host services (page allocation,
//! virtual mapping, CPU pinning) come in through [`Capabilities`].

pub mod config;
pub mod context;
pub mod cpu;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod page;
pub mod scratch;
pub mod shrinker;
pub mod workgroup;

pub use config::{ShrinkerConfig, ZcacheConfig};
pub use context::{Capabilities, Mount, ZcacheContext, ZcacheStats};
pub use error::{Error, Result};
pub use mapping::MapAttr;
pub use page::{LocalPageList, Page, PagePool, PAGE_SIZE};
pub use scratch::{GlobalBufferPool, ScratchBuffer};
pub use shrinker::{MountId, PressureMonitor, ShrinkControl, Shrinker};
pub use workgroup::{EvictableCounter, ManagedIndex, RefState, Workgroup};
