//! Key-range routing across shards.

use crate::error::{Error, Result};
use crate::shard::Shard;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What a shard reports to its router when a split is cut over.
#[derive(Debug, Clone)]
pub struct SplitBoundary {
    /// The shard being replaced.
    pub retired: Arc<Shard>,
    pub old_max_key: Option<Vec<u8>>,
    /// Left child and its maximum key. `None` when the left child ended up
    /// empty and was dropped.
    pub left: Option<(Vec<u8>, Arc<Shard>)>,
    pub right_max_key: Option<Vec<u8>>,
    /// Inherits the retired shard's upper bound.
    pub right: Arc<Shard>,
}

/// Ordered map from a shard's upper key bound to the shard.
///
/// Implementations must not call into a shard while holding their own lock:
/// shards call back into the router with their lock held.
pub trait ShardRouter: Send + Sync {
    /// Shard owning `key`.
    fn lookup(&self, key: &[u8]) -> Option<Arc<Shard>>;

    /// Replace `boundary.retired` with its children.
    fn insert_boundary(&self, boundary: SplitBoundary) -> Result<()>;

    /// Fresh file prefix for a shard promoted at cutover.
    fn allocate_prefix(&self) -> Result<PathBuf>;

    /// Every shard in key order.
    fn shards(&self) -> Vec<Arc<Shard>>;
}

/// Upper bound of a shard's key range. The last shard is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpperBound {
    Key(Vec<u8>),
    Unbounded,
}

pub const SHARD_FILE_PREFIX: &str = "shard-";

pub fn shard_file_name(id: u64) -> String {
    format!("{}{:06}", SHARD_FILE_PREFIX, id)
}

/// Id encoded in a `shard-NNNNNN` file stem.
pub fn parse_shard_id(stem: &str) -> Option<u64> {
    stem.strip_prefix(SHARD_FILE_PREFIX)?.parse().ok()
}

/// [`ShardRouter`] backed by a `BTreeMap` keyed by upper bound.
pub struct RangeRouter {
    dir: PathBuf,
    ranges: RwLock<BTreeMap<UpperBound, Arc<Shard>>>,
    next_id: AtomicU64,
}

impl RangeRouter {
    /// Empty router allocating prefixes in `dir`, starting after `last_id`.
    pub fn new<P: AsRef<Path>>(dir: P, last_id: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ranges: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(last_id + 1),
        }
    }

    pub fn insert(&self, bound: UpperBound, shard: Arc<Shard>) {
        self.ranges.write().insert(bound, shard);
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    pub fn bounds(&self) -> Vec<UpperBound> {
        self.ranges.read().keys().cloned().collect()
    }
}

impl ShardRouter for RangeRouter {
    fn lookup(&self, key: &[u8]) -> Option<Arc<Shard>> {
        let ranges = self.ranges.read();
        ranges
            .range(UpperBound::Key(key.to_vec())..)
            .next()
            .map(|(_, shard)| Arc::clone(shard))
    }

    fn insert_boundary(&self, boundary: SplitBoundary) -> Result<()> {
        let mut ranges = self.ranges.write();
        let bound = ranges
            .iter()
            .find(|(_, shard)| Arc::ptr_eq(shard, &boundary.retired))
            .map(|(bound, _)| bound.clone())
            .ok_or_else(|| Error::InvalidState("split shard is not routed".into()))?;

        ranges.remove(&bound);
        if let Some((left_max, left)) = boundary.left {
            ranges.insert(UpperBound::Key(left_max), left);
        }
        ranges.insert(bound.clone(), boundary.right);

        debug!(
            "Split boundary under {:?}: old max {:?}, right max {:?}, {} shards",
            bound,
            boundary.old_max_key,
            boundary.right_max_key,
            ranges.len()
        );
        Ok(())
    }

    fn allocate_prefix(&self) -> Result<PathBuf> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let prefix = self.dir.join(shard_file_name(id));
        if crate::skiplist::SkipList::files_exist(&prefix) != (false, false) {
            return Err(Error::InvalidState(format!(
                "prefix {} already in use",
                prefix.display()
            )));
        }
        Ok(prefix)
    }

    fn shards(&self) -> Vec<Arc<Shard>> {
        self.ranges.read().values().cloned().collect()
    }
}
