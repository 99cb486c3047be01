use crate::config::DatabaseConfig;
use crate::defrag::DefragEngine;
use crate::error::{Error, Result};
use crate::logging::OperationTimer;
use crate::router::{parse_shard_id, RangeRouter, ShardRouter, UpperBound};
use crate::shard::Shard;
use crate::skiplist::{validate_key, META_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// A directory of shards behind a [`RangeRouter`], with an optional
/// defragmentation thread.
pub struct Database {
    dir: PathBuf,
    router: Arc<RangeRouter>,
    defrag: DefragEngine,
    closed: AtomicBool,
}

/// `shard-NNNNNN` prefixes in `dir`, ordered by id. Split artifacts are left
/// to the shard that owns them.
fn discover_shards(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stem) = name.strip_suffix(META_SUFFIX) else {
            continue;
        };
        if let Some(id) = parse_shard_id(stem) {
            found.push((id, dir.join(stem)));
        }
    }
    found.sort_unstable_by_key(|(id, _)| *id);
    Ok(found)
}

impl Database {
    pub fn open<P: AsRef<Path>>(dir: P, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let found = discover_shards(&dir)?;
        let last_id = found.last().map(|(id, _)| *id).unwrap_or(0);
        let router = Arc::new(RangeRouter::new(&dir, last_id));

        let mut shards = Vec::with_capacity(found.len());
        for (_, prefix) in &found {
            let shard = Shard::open_with(prefix, config.shard.clone())?;
            let max = shard.maximum_key()?;
            shards.push((max, shard));
        }
        // Ranges are not persisted: rebuild them from each shard's maximum
        // key. Empty shards own no keys and are dropped.
        shards.sort_by(|a, b| a.0.cmp(&b.0));
        let mut ranges: Vec<(Vec<u8>, Arc<Shard>)> = Vec::with_capacity(shards.len());
        for (max, shard) in shards {
            match max {
                Some(max) => ranges.push((max, shard)),
                None => {
                    debug!("Removing empty shard {}", shard.prefix().display());
                    shard.destroy()?;
                }
            }
        }

        let last = match ranges.pop() {
            Some((_, shard)) => shard,
            None => {
                let prefix = router.allocate_prefix()?;
                Shard::open_with(prefix, config.shard.clone())?
            }
        };
        for (max, shard) in ranges {
            router.insert(UpperBound::Key(max), shard);
        }
        router.insert(UpperBound::Unbounded, last);

        let dyn_router: Arc<dyn ShardRouter> = router.clone();
        let weak: Weak<dyn ShardRouter> = Arc::downgrade(&dyn_router);
        for shard in router.shards() {
            shard.attach_router(weak.clone());
        }

        let defrag = DefragEngine::new(dyn_router, config.defrag.clone())?;
        if config.enable_defrag {
            defrag.start()?;
        }

        info!(
            "Opened database {} with {} shards",
            dir.display(),
            router.len()
        );
        Ok(Self {
            dir,
            router,
            defrag,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn shard_for(&self, key: &[u8]) -> Result<Arc<Shard>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        validate_key(key)?;
        self.router
            .lookup(key)
            .ok_or_else(|| Error::InvalidState("no shard covers key".into()))
    }

    pub fn put(&self, key: &[u8], value: u64) -> Result<()> {
        let timer = OperationTimer::new("put", key);
        let result = self.shard_for(key).and_then(|shard| shard.put(key, value));
        timer.complete(&result);
        result
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let timer = OperationTimer::new("get", key);
        let result = self.shard_for(key).and_then(|shard| shard.get(key));
        timer.complete(&result);
        result
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let timer = OperationTimer::new("delete", key);
        let result = self.shard_for(key).and_then(|shard| shard.delete(key));
        timer.complete(&result);
        if result.is_ok() && self.defrag.is_running() {
            self.defrag.notify();
        }
        result
    }

    /// Every live entry across all shards, in key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut out = Vec::new();
        for shard in self.router.shards() {
            out.extend(shard.entries()?);
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<u64> {
        let mut total = 0;
        for shard in self.router.shards() {
            total += shard.len()?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn shard_count(&self) -> usize {
        self.router.len()
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.router.shards()
    }

    pub fn defrag(&self) -> &DefragEngine {
        &self.defrag
    }

    /// Flush every shard to disk.
    pub fn sync(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        for shard in self.router.shards() {
            shard.flush()?;
        }
        Ok(())
    }

    /// Check every shard and that consecutive shards do not overlap.
    pub fn verify(&self) -> Result<()> {
        let mut previous_max: Option<Vec<u8>> = None;
        for shard in self.router.shards() {
            shard.verify()?;
            let entries = shard.entries()?;
            if let (Some(prev), Some((first, _))) = (&previous_max, entries.first()) {
                if prev >= first {
                    return Err(Error::Corrupted(format!(
                        "shard {} starts at or below the previous shard's maximum",
                        shard.prefix().display()
                    )));
                }
            }
            if let Some((last, _)) = entries.last() {
                previous_max = Some(last.clone());
            }
        }
        Ok(())
    }

    /// Stop defragmentation and close every shard. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.defrag.stop()?;
        for shard in self.router.shards() {
            shard.close()?;
        }
        info!("Closed database {}", self.dir.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing database {}: {}", self.dir.display(), e);
        }
    }
}
