//! CPU identity and migration control for per-CPU resources.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait CpuPinner: Send + Sync {
    /// CPU the calling context runs on. Stable while migration is disabled.
    fn current_cpu(&self) -> usize;

    fn disable_migration(&self);

    fn enable_migration(&self);

    fn nr_cpus(&self) -> usize;
}

/// Keeps the calling context on one CPU until dropped.
pub struct MigrationGuard<'a> {
    pinner: &'a dyn CpuPinner,
    cpu: usize,
}

impl<'a> MigrationGuard<'a> {
    pub fn new(pinner: &'a dyn CpuPinner) -> Self {
        pinner.disable_migration();
        let cpu = pinner.current_cpu();
        Self { pinner, cpu }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.pinner.enable_migration();
    }
}

thread_local! {
    // (nesting depth, cpu observed when the outermost pin was taken)
    static PIN_STATE: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// Reports the CPU from `sched_getcpu`. Disabling migration does not change
/// the thread's affinity; it freezes the reported id per thread, so the CPU
/// seen when the outermost guard is taken is the one reported until the last
/// guard is dropped. Exclusive use of a per-CPU resource still comes from its
/// own lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCpu;

impl SystemCpu {
    fn observe_cpu() -> usize {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getcpu has no preconditions.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                return cpu as usize;
            }
        }
        thread_slot()
    }
}

fn thread_slot() -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

impl CpuPinner for SystemCpu {
    fn current_cpu(&self) -> usize {
        PIN_STATE.with(|state| {
            let (depth, cpu) = state.get();
            if depth > 0 {
                cpu
            } else {
                Self::observe_cpu()
            }
        })
    }

    fn disable_migration(&self) {
        PIN_STATE.with(|state| {
            let (depth, cpu) = state.get();
            let cpu = if depth == 0 { Self::observe_cpu() } else { cpu };
            state.set((depth + 1, cpu));
        });
    }

    fn enable_migration(&self) {
        PIN_STATE.with(|state| {
            let (depth, cpu) = state.get();
            debug_assert!(depth > 0, "unbalanced enable_migration");
            state.set((depth.saturating_sub(1), cpu));
        });
    }

    fn nr_cpus(&self) -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
    }
}

/// Reports a caller-chosen CPU. Useful to steer work onto a particular shard.
#[derive(Debug)]
pub struct FixedCpu {
    cpu: AtomicUsize,
    nr_cpus: usize,
}

impl FixedCpu {
    pub fn new(cpu: usize, nr_cpus: usize) -> Self {
        Self {
            cpu: AtomicUsize::new(cpu),
            nr_cpus: nr_cpus.max(1),
        }
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }
}

impl CpuPinner for FixedCpu {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    fn disable_migration(&self) {}

    fn enable_migration(&self) {}

    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }
}
