use super::ShrinkControl;
use crate::config::ShrinkerConfig;
use crate::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct MonitorStats {
    scans: AtomicU64,
    freed: AtomicU64,
}

/// Background thread standing in for the host's memory-pressure callbacks.
///
/// Every interval it asks how many workgroups are evictable and, above the
/// high watermark, scans the excess (at most one batch per wakeup). Stops on
/// [`shutdown`](Self::shutdown) or drop.
pub struct PressureMonitor {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<MonitorStats>,
}

impl PressureMonitor {
    pub fn spawn(control: Arc<dyn ShrinkControl>, config: &ShrinkerConfig) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(MonitorStats::default());
        let interval = config.interval();
        let high_watermark = config.high_watermark;
        let scan_batch = config.scan_batch;

        let handle = {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("zcache-shrinker".into())
                .spawn(move || {
                    run(&*control, &shutdown, &stats, interval, high_watermark, scan_batch)
                })?
        };

        info!(
            interval_ms = interval.as_millis() as u64,
            high_watermark, scan_batch, "pressure monitor started"
        );
        Ok(Self {
            handle: Some(handle),
            shutdown,
            stats,
        })
    }

    /// Wake the thread for an immediate check.
    pub fn kick(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    pub fn scans(&self) -> u64 {
        self.stats.scans.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.stats.freed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("pressure monitor thread panicked");
            }
            info!(scans = self.scans(), freed = self.freed(), "pressure monitor stopped");
        }
    }
}

impl Drop for PressureMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    control: &dyn ShrinkControl,
    shutdown: &AtomicBool,
    stats: &MonitorStats,
    interval: Duration,
    high_watermark: usize,
    scan_batch: usize,
) {
    while !shutdown.load(Ordering::Acquire) {
        let count = control.count_objects();
        if count > high_watermark {
            let nr = (count - high_watermark).min(scan_batch);
            let freed = control.scan_objects(nr);
            stats.scans.fetch_add(1, Ordering::Relaxed);
            stats.freed.fetch_add(freed as u64, Ordering::Relaxed);
            debug!(count, requested = nr, freed, "pressure scan");
        }
        thread::park_timeout(interval);
    }
}
