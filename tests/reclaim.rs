mod common;

use common::{fill_idle, TestContext};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zcache::shrinker::Shrinkable;
use zcache::{ManagedIndex, ShrinkControl, Shrinker, ShrinkerConfig, Workgroup, ZcacheConfig};

#[test]
fn test_pressure_request_frees_exact_total() {
    let t = TestContext::new(ZcacheConfig::default(), 1);
    let a = t.context.mount::<u32>();
    let b = t.context.mount::<u32>();
    fill_idle(&a, 0..3, |k| k as u32);
    fill_idle(&b, 0..1, |k| k as u32);

    let shrinker = t.context.shrinker();
    assert_eq!(shrinker.count_objects(), 4);
    assert_eq!(shrinker.scan_objects(2), 2);
    assert_eq!(shrinker.count_objects(), 2);
    assert_eq!(a.len() + b.len(), 2);
    // b was mounted last, so it sits at the head and goes first
    assert!(b.is_empty());
    assert_eq!(a.len(), 2);
}

#[test]
fn test_every_instance_serviced_before_any_repeats() {
    let t = TestContext::new(ZcacheConfig::default(), 1);
    let mounts: Vec<_> = (0..5).map(|_| t.context.mount::<u32>()).collect();
    for mount in &mounts {
        fill_idle(mount, 0..20, |k| k as u32);
    }

    let mut serviced = Vec::new();
    for _ in 0..15 {
        let before: Vec<usize> = mounts.iter().map(|m| m.len()).collect();
        assert_eq!(t.context.shrinker().scan(1), 1);
        let hit = mounts
            .iter()
            .zip(&before)
            .position(|(m, &len)| m.len() < len)
            .unwrap();
        serviced.push(hit);
    }

    for window in serviced.chunks(mounts.len()) {
        let distinct: HashSet<_> = window.iter().collect();
        assert_eq!(distinct.len(), mounts.len(), "{:?}", serviced);
    }
}

#[test]
fn test_busy_entries_are_not_reclaimed() {
    let t = TestContext::new(ZcacheConfig::default(), 1);
    let mount = t.context.mount::<u32>();
    fill_idle(&mount, 0..8, |k| k as u32);
    let held: Vec<_> = (0..4).map(|k| mount.find(k).unwrap()).collect();

    assert_eq!(t.context.shrinker().scan(100), 4);
    assert_eq!(mount.len(), 4);
    for grp in &held {
        assert!(Arc::ptr_eq(&mount.find(grp.index()).unwrap(), grp));
        // drop the extra lookup reference again
        mount.put(grp.clone());
    }
    for grp in held {
        mount.put(grp);
    }
    assert_eq!(t.context.shrinker().count(), 4);
    assert_eq!(t.context.shrinker().scan(100), 4);
    assert!(mount.is_empty());
}

#[test]
fn test_scan_skips_unmounting_instance_and_unmount_drains_it() {
    let shrinker = Arc::new(Shrinker::new());
    let a = Arc::new(ManagedIndex::<u32>::new(shrinker.evictable().clone()));
    let b = Arc::new(ManagedIndex::<u32>::new(shrinker.evictable().clone()));
    for key in 0..5 {
        a.put(a.insert(Workgroup::new(key, 0)));
        b.put(b.insert(Workgroup::new(key, 0)));
    }
    let ha = shrinker.register(a.clone());
    let _hb = shrinker.register(b.clone());

    let unmounting = ha.lock_for_unmount();
    let scanner = {
        let shrinker = shrinker.clone();
        thread::spawn(move || shrinker.scan(10))
    };
    assert_eq!(scanner.join().unwrap(), 5);
    assert_eq!(a.len(), 5);
    assert!(b.is_empty());
    drop(unmounting);

    assert_eq!(shrinker.unregister(ha), 5);
    assert!(a.is_empty());
    assert_eq!(shrinker.mounted(), 1);
    assert_eq!(shrinker.count(), 0);
}

#[test]
fn test_unmount_races_with_scans() {
    for _ in 0..20 {
        let t = TestContext::new(ZcacheConfig::default(), 1);
        let keep = t.context.mount::<u32>();
        let doomed = t.context.mount::<u32>();
        fill_idle(&keep, 0..64, |k| k as u32);
        fill_idle(&doomed, 0..64, |k| k as u32);

        let freed = thread::scope(|s| {
            let scanner = s.spawn(|| {
                let mut freed = 0;
                for _ in 0..16 {
                    freed += t.context.shrinker().scan(4);
                }
                freed
            });
            let drained = doomed.unmount();
            scanner.join().unwrap() + drained
        });

        assert_eq!(t.context.shrinker().mounted(), 1);
        assert_eq!(freed + keep.len(), 128);
        assert_eq!(t.context.shrinker().count(), keep.len());
    }
}

#[test]
fn test_unregister_waits_for_running_shrink() {
    struct Slow(ManagedIndex<u32>);

    impl Shrinkable for Slow {
        fn shrink(&self, nr_to_scan: usize) -> usize {
            thread::sleep(Duration::from_millis(50));
            self.0.shrink(nr_to_scan)
        }

        fn detach(&self) {
            self.0.detach()
        }
    }

    let shrinker = Arc::new(Shrinker::new());
    let slow = Arc::new(Slow(ManagedIndex::new(shrinker.evictable().clone())));
    for key in 0..3 {
        slow.0.put(slow.0.insert(Workgroup::new(key, 0)));
    }
    let handle = shrinker.register(slow.clone());

    let scanner = {
        let shrinker = shrinker.clone();
        thread::spawn(move || shrinker.scan(1))
    };
    thread::sleep(Duration::from_millis(10));
    let drained = shrinker.unregister(handle);
    let scanned = scanner.join().unwrap();

    assert_eq!(scanned + drained, 3);
    assert!(slow.0.is_empty());
    assert_eq!(shrinker.mounted(), 0);
}

#[test]
fn test_monitor_keeps_cache_at_watermark() {
    let config = ZcacheConfig {
        shrinker: ShrinkerConfig {
            monitor_enabled: true,
            interval_ms: 2,
            high_watermark: 10,
            scan_batch: 7,
        },
        ..Default::default()
    };
    let t = TestContext::new(config, 1);
    let mount = t.context.mount::<u32>();
    fill_idle(&mount, 0..50, |k| k as u32);

    let deadline = Instant::now() + Duration::from_secs(5);
    while mount.len() > 10 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(mount.len(), 10);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(mount.len(), 10);
}
