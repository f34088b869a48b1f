//! zcache stress driver
//!
//! Runs concurrent lookup/insert/release traffic against several mounted
//! instances while scratch buffers grow and a pressure thread keeps
//! reclaiming, then unmounts everything and prints the final counters.

use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use zcache::logging::init_logging;
use zcache::{LocalPageList, Mount, Workgroup, ZcacheConfig, ZcacheContext};

#[derive(Parser, Debug)]
#[command(name = "zcache-stress")]
#[command(about = "Concurrent workload against the zcache workgroup cache and buffer pools", version)]
struct Cli {
    /// JSON config file; defaults plus ZCACHE_* overrides when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mounted instances
    #[arg(short, long, default_value_t = 4)]
    mounts: usize,

    /// Worker threads
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 5)]
    duration: u64,

    /// Distinct cluster indices per mount
    #[arg(short, long, default_value_t = 4096)]
    keys: u64,

    /// Largest scratch buffer a worker asks for, in pages
    #[arg(long, default_value_t = 16)]
    max_pages: usize,

    /// Objects requested per pressure scan
    #[arg(long, default_value_t = 256)]
    scan_batch: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    inserts: AtomicU64,
    collisions: AtomicU64,
    scratch_uses: AtomicU64,
    scratch_grows: AtomicU64,
    pages_cycled: AtomicU64,
    reclaimed: AtomicU64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.json);

    let config = match &cli.config {
        Some(path) => ZcacheConfig::from_file(path)?,
        None => ZcacheConfig::from_env()?,
    };
    let context = Arc::new(ZcacheContext::new(config)?);
    let mounts: Arc<Vec<Mount<Vec<u8>>>> =
        Arc::new((0..cli.mounts.max(1)).map(|_| context.mount()).collect());
    let counters = Arc::new(Counters::default());
    let stop = Arc::new(AtomicBool::new(false));

    info!(
        mounts = mounts.len(),
        threads = cli.threads,
        duration_s = cli.duration,
        "stress run starting"
    );
    let started = Instant::now();

    let workers: Vec<_> = (0..cli.threads.max(1))
        .map(|worker| {
            let context = context.clone();
            let mounts = mounts.clone();
            let counters = counters.clone();
            let stop = stop.clone();
            let keys = cli.keys.max(1);
            let max_pages = cli.max_pages.max(1);
            thread::Builder::new()
                .name(format!("stress-{}", worker))
                .spawn(move || {
                    let mut rng = rand::rng();
                    let mut local = LocalPageList::new();
                    while !stop.load(Ordering::Relaxed) {
                        let mount = &mounts[rng.random_range(0..mounts.len())];
                        cache_round(mount, rng.random_range(0..keys), &counters);

                        if rng.random_bool(0.05) {
                            scratch_round(&context, rng.random_range(1..=max_pages), &counters);
                        }
                        if rng.random_bool(0.05) {
                            page_round(&context, &mut local, rng.random_range(1..8), &counters);
                        }
                    }
                    context.pages().release_pages(&mut local);
                })
        })
        .collect::<std::io::Result<_>>()?;

    let pressure = {
        let context = context.clone();
        let counters = counters.clone();
        let stop = stop.clone();
        let batch = cli.scan_batch.max(1);
        thread::Builder::new()
            .name("stress-pressure".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let freed = context.shrinker().scan(batch);
                    counters.reclaimed.fetch_add(freed as u64, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                }
            })?
    };

    thread::sleep(Duration::from_secs(cli.duration));
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().map_err(|_| "worker thread panicked")?;
    }
    pressure.join().map_err(|_| "pressure thread panicked")?;

    let before_unmount = context.stats();
    let mounts = Arc::try_unwrap(mounts).map_err(|_| "mounts still shared")?;
    let drained: usize = mounts.into_iter().map(Mount::unmount).sum();
    let elapsed = started.elapsed();

    let report = serde_json::json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "hits": counters.hits.load(Ordering::Relaxed),
        "inserts": counters.inserts.load(Ordering::Relaxed),
        "collisions": counters.collisions.load(Ordering::Relaxed),
        "scratch_uses": counters.scratch_uses.load(Ordering::Relaxed),
        "scratch_grows": counters.scratch_grows.load(Ordering::Relaxed),
        "pages_cycled": counters.pages_cycled.load(Ordering::Relaxed),
        "reclaimed_under_pressure": counters.reclaimed.load(Ordering::Relaxed),
        "drained_at_unmount": drained,
        "before_unmount": before_unmount,
        "after_unmount": context.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cache_round(mount: &Mount<Vec<u8>>, key: u64, counters: &Counters) {
    if let Some(grp) = mount.find(key) {
        counters.hits.fetch_add(1, Ordering::Relaxed);
        mount.put(grp);
        return;
    }

    let candidate = Workgroup::new(key, key.to_le_bytes().to_vec());
    let grp = mount.insert(candidate.clone());
    if Arc::ptr_eq(&grp, &candidate) {
        counters.inserts.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.collisions.fetch_add(1, Ordering::Relaxed);
        mount.put(candidate);
    }
    mount.put(grp);
}

fn scratch_round(context: &ZcacheContext, pages: usize, counters: &Counters) {
    let buffers = context.buffers();
    let mut buffer = match buffers.acquire(pages) {
        Some(buffer) => buffer,
        None => {
            if buffers.grow(pages).is_err() {
                return;
            }
            counters.scratch_grows.fetch_add(1, Ordering::Relaxed);
            match buffers.acquire(pages) {
                Some(buffer) => buffer,
                None => return,
            }
        }
    };
    buffer.as_mut_slice().fill(0xa5);
    counters.scratch_uses.fetch_add(1, Ordering::Relaxed);
    buffers.release(buffer);
}

fn page_round(
    context: &ZcacheContext,
    local: &mut LocalPageList,
    count: usize,
    counters: &Counters,
) {
    let pool = context.pages();
    let mut taken = LocalPageList::new();
    for _ in 0..count {
        match pool.allocate_page(local, true) {
            Some(page) => taken.push(page),
            None => break,
        }
    }
    counters.pages_cycled.fetch_add(taken.len() as u64, Ordering::Relaxed);
    pool.release_pages(&mut taken);
}
