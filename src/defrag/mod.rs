//! Background reclamation of data-region holes.
//!
//! A single thread scans the router's shards, scores each one with the
//! income/cost model and compacts the best candidate. It wakes every
//! `scan_interval` or as soon as [`DefragEngine::notify`] is called.

pub mod compaction;

pub use compaction::{compact_shard, qualifies, select_candidate};

use crate::config::DefragConfig;
use crate::error::{Error, Result};
use crate::router::ShardRouter;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct DefragStats {
    passes: AtomicU64,
    shards_compacted: AtomicU64,
    bytes_reclaimed: AtomicU64,
    aborted: AtomicU64,
    last_pass_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefragStatsSnapshot {
    pub passes: u64,
    pub shards_compacted: u64,
    pub bytes_reclaimed: u64,
    pub aborted: u64,
    pub last_pass_duration: Duration,
}

pub struct DefragEngine {
    config: Arc<RwLock<DefragConfig>>,
    router: Arc<dyn ShardRouter>,
    running: Arc<AtomicBool>,
    wake_signal: Arc<(Mutex<bool>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DefragStats>,
}

impl DefragEngine {
    pub fn new(router: Arc<dyn ShardRouter>, config: DefragConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            router,
            running: Arc::new(AtomicBool::new(false)),
            wake_signal: Arc::new((Mutex::new(false), Condvar::new())),
            worker: Mutex::new(None),
            stats: Arc::new(DefragStats::default()),
        })
    }

    /// Replace the thresholds. Takes effect from the next pass.
    pub fn configure(
        &self,
        min_income: u64,
        max_income: u64,
        min_cost: f64,
        scan_interval: Duration,
    ) -> Result<()> {
        let config = DefragConfig::new(min_income, max_income, min_cost, scan_interval);
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> DefragConfig {
        self.config.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting defragmentation engine");

        let running = Arc::clone(&self.running);
        let config = Arc::clone(&self.config);
        let router = Arc::clone(&self.router);
        let wake_signal = Arc::clone(&self.wake_signal);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("skipdb-defrag".into())
            .spawn(move || {
                debug!("Defragmentation thread started");
                while running.load(Ordering::SeqCst) {
                    let current = config.read().clone();
                    if let Err(e) = run_pass(router.as_ref(), &current, &stats) {
                        warn!("Defragmentation pass failed: {}", e);
                    }

                    let (lock, cvar) = &*wake_signal;
                    let mut woken = lock.lock();
                    if !*woken && running.load(Ordering::SeqCst) {
                        cvar.wait_for(&mut woken, current.scan_interval);
                    }
                    *woken = false;
                }
                debug!("Defragmentation thread stopped");
            });

        match handle {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Wake the thread for an immediate pass. Wakeups coalesce.
    pub fn notify(&self) {
        let (lock, cvar) = &*self.wake_signal;
        *lock.lock() = true;
        cvar.notify_one();
    }

    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping defragmentation engine");
        self.notify();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Defragmentation thread panicked");
                return Err(Error::ThreadPanic("defragmentation thread".into()));
            }
        }
        Ok(())
    }

    /// Run one selection and compaction synchronously. Returns the bytes
    /// reclaimed, 0 when no shard qualified.
    pub fn run_once(&self) -> Result<u64> {
        let config = self.config();
        run_pass(self.router.as_ref(), &config, &self.stats)
    }

    pub fn stats(&self) -> DefragStatsSnapshot {
        DefragStatsSnapshot {
            passes: self.stats.passes.load(Ordering::Relaxed),
            shards_compacted: self.stats.shards_compacted.load(Ordering::Relaxed),
            bytes_reclaimed: self.stats.bytes_reclaimed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            last_pass_duration: Duration::from_micros(
                self.stats.last_pass_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

impl Drop for DefragEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping defragmentation engine: {}", e);
        }
    }
}

fn run_pass(router: &dyn ShardRouter, config: &DefragConfig, stats: &DefragStats) -> Result<u64> {
    let started = Instant::now();
    stats.passes.fetch_add(1, Ordering::Relaxed);

    let shards = router.shards();
    let Some((shard, frag)) = select_candidate(&shards, config) else {
        debug!("No shard qualifies for defragmentation");
        return Ok(0);
    };

    let result = compact_shard(&shard);
    stats
        .last_pass_micros
        .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

    match result {
        Ok(reclaimed) => {
            stats.shards_compacted.fetch_add(1, Ordering::Relaxed);
            stats.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
            info!(
                "Defragmented {}: reclaimed {} bytes (cost {:.3}) in {:?}",
                shard.prefix().display(),
                reclaimed,
                frag.cost(),
                started.elapsed()
            );
            Ok(reclaimed)
        }
        Err(e) => {
            stats.aborted.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}
