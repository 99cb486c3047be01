use super::layout::{
    data_node_size, node_size, DataRegion, IndexRegion, DATA_HEADER_SIZE, DATA_NODE_HEADER_SIZE,
    FIRST_NODE_OFFSET, FLAG_DELETED, FLAG_USED, HEAD_OFFSET,
};
use super::{
    random_level, seeded_rng, suffixed, validate_key, DATA_SUFFIX, MAX_KEY_LEN, MAX_LEVEL,
    META_SUFFIX,
};
use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::storage::FreeList;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of [`SkipList::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key existed; its value was overwritten in place.
    Updated,
    /// No slot of the drawn level and no room to bump; nothing was written.
    IndexFull,
}

/// Free-space snapshot of a data region, input to the defragmentation
/// cost model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fragmentation {
    /// Sum of free data-node sizes.
    pub income: u64,
    /// Smallest free offset, 0 when nothing is free.
    pub leftmost: u64,
    pub used: u64,
}

impl Fragmentation {
    /// Reclaimable bytes per byte that has to move. Infinite when every
    /// byte after the leftmost hole is free.
    pub fn cost(&self) -> f64 {
        if self.income == 0 {
            return 0.0;
        }
        let moving = self
            .used
            .saturating_sub(self.income)
            .saturating_sub(self.leftmost);
        if moving == 0 {
            f64::INFINITY
        } else {
            self.income as f64 / moving as f64
        }
    }
}

/// Free data blocks taken out of a shard for compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionPlan {
    /// Merged `(start, len)` holes in ascending order.
    pub blocks: Vec<(u64, u64)>,
    /// Data cursor when the plan was made.
    pub end: u64,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn reclaimed(&self) -> u64 {
        self.blocks.iter().map(|&(_, len)| len).sum()
    }

    /// `(src, len, dst)` of every live run that follows a hole, in the order
    /// the runs must move.
    pub fn moves(&self) -> Vec<(u64, u64, u64)> {
        let mut moves = Vec::with_capacity(self.blocks.len());
        let mut shift = 0;
        for (i, &(start, len)) in self.blocks.iter().enumerate() {
            shift += len;
            let src = start + len;
            let run_end = self
                .blocks
                .get(i + 1)
                .map(|&(next, _)| next)
                .unwrap_or(self.end);
            moves.push((src, run_end - src, src - shift));
        }
        moves
    }
}

/// A skip list stored in an index region and a data region.
///
/// Keys live in the data region; index nodes refer to them by offset and
/// every data node refers back to its owner. All offsets are absolute within
/// their region and 0 is the null sentinel.
pub struct SkipList {
    index: IndexRegion,
    data: DataRegion,
    /// Reusable index slots, bucketed by node level.
    index_free: Vec<FreeList>,
    data_free: FreeList,
    rng: StdRng,
    probability: f32,
}

impl SkipList {
    pub fn meta_path(prefix: &Path) -> PathBuf {
        suffixed(prefix, META_SUFFIX)
    }

    pub fn data_path(prefix: &Path) -> PathBuf {
        suffixed(prefix, DATA_SUFFIX)
    }

    /// Whether the `(meta, data)` files of `prefix` exist.
    pub fn files_exist(prefix: &Path) -> (bool, bool) {
        (
            Self::meta_path(prefix).exists(),
            Self::data_path(prefix).exists(),
        )
    }

    pub fn create(prefix: &Path, config: &ShardConfig) -> Result<Self> {
        let index = IndexRegion::create(
            Self::meta_path(prefix),
            config.index_capacity,
            config.probability,
        )?;
        let data = DataRegion::create(Self::data_path(prefix), config.data_capacity)?;

        debug!("Created skip list {}", prefix.display());
        Ok(Self {
            index,
            data,
            index_free: vec![FreeList::new(); MAX_LEVEL + 1],
            data_free: FreeList::new(),
            rng: seeded_rng(config.seed),
            probability: config.probability,
        })
    }

    /// Load an existing skip list, rebuilding the free lists and verifying
    /// that every live index node and its data node point at each other.
    pub fn open(prefix: &Path, config: &ShardConfig) -> Result<Self> {
        let index = IndexRegion::open(Self::meta_path(prefix))?;
        let data = DataRegion::open(Self::data_path(prefix))?;
        let probability = index.probability();

        let mut list = Self {
            index,
            data,
            index_free: vec![FreeList::new(); MAX_LEVEL + 1],
            data_free: FreeList::new(),
            rng: seeded_rng(config.seed),
            probability,
        };
        list.rebuild_index_free()?;
        list.check_levels()?;
        list.check_links()?;
        list.rebuild_data_free()?;

        debug!(
            "Opened skip list {} ({} keys, {} free data nodes)",
            prefix.display(),
            list.len(),
            list.data_free.len()
        );
        Ok(list)
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn len(&self) -> u64 {
        self.index.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_used(&self) -> u64 {
        self.index.used()
    }

    pub fn index_capacity(&self) -> u64 {
        self.index.capacity()
    }

    pub fn data_used(&self) -> u64 {
        self.data.used()
    }

    #[inline]
    fn node_key(&self, node: u64) -> &[u8] {
        self.data.key(self.index.data_offset(node))
    }

    /// Top-down walk. Returns the rightmost node before `key` on every level
    /// and the node holding `key`, if any.
    fn search(&self, key: &[u8]) -> ([u64; MAX_LEVEL], Option<u64>) {
        let mut update = [HEAD_OFFSET; MAX_LEVEL];
        let mut x = HEAD_OFFSET;
        for i in (0..self.index.level(HEAD_OFFSET)).rev() {
            loop {
                let next = self.index.forward(x, i);
                if next == 0 || self.node_key(next) >= key {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }

        let next = self.index.forward(x, 0);
        let found = (next != 0 && self.node_key(next) == key).then_some(next);
        (update, found)
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.search(key).1.map(|node| self.index.value(node))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.search(key).1.is_some()
    }

    /// Insert or overwrite. With `may_grow` false a full index region is
    /// reported as [`InsertOutcome::IndexFull`] instead of being extended.
    pub fn insert(&mut self, key: &[u8], value: u64, may_grow: bool) -> Result<InsertOutcome> {
        validate_key(key)?;

        let (mut update, found) = self.search(key);
        if let Some(node) = found {
            self.index.set_value(node, value);
            return Ok(InsertOutcome::Updated);
        }

        let level = random_level(&mut self.rng, self.probability);
        let size = node_size(level);
        if self.index_free[level].is_empty() {
            let end = self.index.used() + size;
            if end > self.index.capacity() {
                if !may_grow {
                    return Ok(InsertOutcome::IndexFull);
                }
                self.index.ensure(end)?;
            }
        }

        // Reserve the data node before touching the index so a failed growth
        // leaves the list untouched.
        let data_offset = self.data.used();
        let data_end = data_offset + data_node_size(key.len());
        self.data.ensure(data_end)?;

        let node = match self.index_free[level].pop() {
            Some(node) => node,
            None => {
                let node = self.index.used();
                self.index.set_used(node + size);
                node
            }
        };

        self.data.write_node(data_offset, node, key);
        self.data.set_used(data_end);
        self.index
            .init_node(node, level, FLAG_USED, data_offset, value, update[0]);

        let height = self.index.level(HEAD_OFFSET);
        if level > height {
            for slot in update.iter_mut().take(level).skip(height) {
                *slot = HEAD_OFFSET;
            }
            self.index.set_level(HEAD_OFFSET, level);
        }

        for (i, &prev) in update.iter().enumerate().take(level) {
            let next = self.index.forward(prev, i);
            self.index.set_forward(node, i, next);
            self.index.set_forward(prev, i, node);
        }

        let successor = self.index.forward(node, 0);
        if successor != 0 {
            self.index.set_backward(successor, node);
        } else {
            self.index.set_tail(node);
        }
        self.index.set_count(self.index.count() + 1);

        Ok(InsertOutcome::Inserted)
    }

    /// Unlink `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;

        let (update, found) = self.search(key);
        let Some(node) = found else {
            return Ok(false);
        };

        let level = self.index.level(node);
        for (i, &prev) in update.iter().enumerate().take(level) {
            if self.index.forward(prev, i) == node {
                let next = self.index.forward(node, i);
                self.index.set_forward(prev, i, next);
            }
        }

        let successor = self.index.forward(node, 0);
        if successor != 0 {
            self.index.set_backward(successor, update[0]);
        } else {
            self.index.set_tail(update[0]);
        }

        let mut height = self.index.level(HEAD_OFFSET);
        while height > 0 && self.index.forward(HEAD_OFFSET, height - 1) == 0 {
            height -= 1;
        }
        self.index.set_level(HEAD_OFFSET, height);

        let data_offset = self.index.data_offset(node);
        self.index.set_flag(node, FLAG_DELETED);
        self.index.set_count(self.index.count() - 1);
        self.data_free.push(data_offset);
        self.index_free[level].push(node);

        Ok(true)
    }

    /// Largest key, read from the tail.
    pub fn max_key(&self) -> Option<Vec<u8>> {
        let tail = self.index.tail();
        (tail != HEAD_OFFSET).then(|| self.node_key(tail).to_vec())
    }

    /// Largest key accepted by `keep`, walking the backward chain from the
    /// tail.
    pub fn max_key_where<F>(&self, keep: F) -> Option<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut x = self.index.tail();
        while x != HEAD_OFFSET {
            let key = self.node_key(x);
            if keep(key) {
                return Some(key.to_vec());
            }
            x = self.index.backward(x);
        }
        None
    }

    pub fn min_key(&self) -> Option<Vec<u8>> {
        let first = self.index.forward(HEAD_OFFSET, 0);
        (first != 0).then(|| self.node_key(first).to_vec())
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::with_capacity(self.len() as usize);
        let mut x = self.index.forward(HEAD_OFFSET, 0);
        while x != 0 {
            out.push((self.node_key(x).to_vec(), self.index.value(x)));
            x = self.index.forward(x, 0);
        }
        out
    }

    /// Up to `limit` entries strictly greater than `after` (from the start
    /// when `after` is `None`), in key order.
    pub fn scan_after(&self, after: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, u64)> {
        let mut x = match after {
            None => self.index.forward(HEAD_OFFSET, 0),
            Some(key) => {
                let (update, found) = self.search(key);
                match found {
                    Some(node) => self.index.forward(node, 0),
                    None => self.index.forward(update[0], 0),
                }
            }
        };

        let mut out = Vec::with_capacity(limit.min(self.len() as usize));
        while x != 0 && out.len() < limit {
            out.push((self.node_key(x).to_vec(), self.index.value(x)));
            x = self.index.forward(x, 0);
        }
        out
    }

    pub fn flush(&self) -> Result<()> {
        self.index.region().flush()?;
        self.data.region().flush()
    }

    /// Move both files to `prefix`. The mappings stay valid.
    pub fn rename(&mut self, prefix: &Path) -> Result<()> {
        self.flush()?;
        self.index.region_mut().rename(Self::meta_path(prefix))?;
        self.data.region_mut().rename(Self::data_path(prefix))
    }

    /// Unmap and delete both files.
    pub fn remove_files(self) -> Result<()> {
        let SkipList { index, data, .. } = self;
        index.into_region().remove()?;
        data.into_region().remove()
    }

    /// Check every structural invariant: ordering on every level, the
    /// backward chain, tail, count and the index/data back-references.
    pub fn verify(&self) -> Result<()> {
        let height = self.index.level(HEAD_OFFSET);
        if height > MAX_LEVEL {
            return Err(Error::Corrupted(format!("head height {}", height)));
        }
        for i in 0..height {
            let mut prev: Option<&[u8]> = None;
            let mut x = self.index.forward(HEAD_OFFSET, i);
            while x != 0 {
                if self.index.level(x) <= i {
                    return Err(Error::Corrupted(format!(
                        "node {} linked on level {} above its height",
                        x, i
                    )));
                }
                let key = self.node_key(x);
                if prev.is_some_and(|p| p >= key) {
                    return Err(Error::Corrupted(format!(
                        "level {} out of order at node {}",
                        i, x
                    )));
                }
                prev = Some(key);
                x = self.index.forward(x, i);
            }
        }

        let live = self.check_links()?;
        if live != self.index.count() {
            return Err(Error::Corrupted(format!(
                "count {} but {} live nodes",
                self.index.count(),
                live
            )));
        }
        Ok(())
    }

    /// Walk level 0 checking the backward chain, the tail and the
    /// bidirectional index/data references. Returns the live node count.
    fn check_links(&self) -> Result<u64> {
        let index_used = self.index.used();
        let data_used = self.data.used();
        let mut prev = HEAD_OFFSET;
        let mut x = self.index.forward(HEAD_OFFSET, 0);
        let mut live = 0;

        while x != 0 {
            if x < FIRST_NODE_OFFSET || x >= index_used {
                return Err(Error::Corrupted(format!("node offset {} out of range", x)));
            }
            if self.index.flag(x) != FLAG_USED {
                return Err(Error::Corrupted(format!(
                    "node {} reachable with flag {:#x}",
                    x,
                    self.index.flag(x)
                )));
            }
            if self.index.backward(x) != prev {
                return Err(Error::Corrupted(format!(
                    "node {} points back to {} instead of {}",
                    x,
                    self.index.backward(x),
                    prev
                )));
            }
            let data_offset = self.index.data_offset(x);
            if data_offset < DATA_HEADER_SIZE
                || data_offset + DATA_NODE_HEADER_SIZE > data_used
                || data_offset + self.data.node_size(data_offset) > data_used
            {
                return Err(Error::Corrupted(format!(
                    "node {} refers to data offset {} outside the data region",
                    x, data_offset
                )));
            }
            if self.data.backref(data_offset) != x {
                return Err(Error::Corrupted(format!(
                    "data node {} belongs to {} not {}",
                    data_offset,
                    self.data.backref(data_offset),
                    x
                )));
            }

            live += 1;
            prev = x;
            x = self.index.forward(x, 0);
        }

        if self.index.tail() != prev {
            return Err(Error::Corrupted(format!(
                "tail is {} but last node is {}",
                self.index.tail(),
                prev
            )));
        }
        Ok(live)
    }

    /// Check the head height and that every forward pointer above level 0
    /// lands on a live node tall enough to carry it.
    fn check_levels(&self) -> Result<()> {
        let height = self.index.level(HEAD_OFFSET);
        if height > MAX_LEVEL {
            return Err(Error::Corrupted(format!(
                "head height {} exceeds {}",
                height, MAX_LEVEL
            )));
        }

        let used = self.index.used();
        let max_steps = (used - FIRST_NODE_OFFSET) / node_size(1);
        for i in 0..height {
            let mut x = self.index.forward(HEAD_OFFSET, i);
            let mut steps = 0;
            while x != 0 {
                if x < FIRST_NODE_OFFSET || x >= used {
                    return Err(Error::Corrupted(format!(
                        "level {} points at offset {} outside the index",
                        i, x
                    )));
                }
                if self.index.flag(x) != FLAG_USED || self.index.level(x) <= i {
                    return Err(Error::Corrupted(format!(
                        "level {} reaches node {} which cannot carry it",
                        i, x
                    )));
                }
                steps += 1;
                if steps > max_steps {
                    return Err(Error::Corrupted(format!("level {} loops", i)));
                }
                x = self.index.forward(x, i);
            }
        }
        Ok(())
    }

    fn rebuild_index_free(&mut self) -> Result<()> {
        let used = self.index.used();
        let mut offset = FIRST_NODE_OFFSET;
        let mut live = 0;

        while offset < used {
            let level = self.index.level(offset);
            if level == 0 || level > MAX_LEVEL || offset + node_size(level) > used {
                return Err(Error::Corrupted(format!(
                    "index node {} has level {}",
                    offset, level
                )));
            }
            match self.index.flag(offset) {
                FLAG_USED => live += 1,
                FLAG_DELETED => self.index_free[level].push(offset),
                flag => {
                    return Err(Error::Corrupted(format!(
                        "index node {} has flag {:#x}",
                        offset, flag
                    )))
                }
            }
            offset += node_size(level);
        }

        if live != self.index.count() {
            warn!(
                "Index {} records {} keys but holds {}, repairing",
                self.index.region().path().display(),
                self.index.count(),
                live
            );
            self.index.set_count(live);
        }
        Ok(())
    }

    fn rebuild_data_free(&mut self) -> Result<()> {
        let used = self.data.used();
        let index_used = self.index.used();
        let mut offset = DATA_HEADER_SIZE;

        while offset < used {
            if offset + DATA_NODE_HEADER_SIZE > used {
                return Err(Error::Corrupted(format!("truncated data node at {}", offset)));
            }
            let size = self.data.node_size(offset);
            if offset + size > used {
                return Err(Error::Corrupted(format!("truncated data node at {}", offset)));
            }
            let owner = self.data.backref(offset);
            let live = owner >= FIRST_NODE_OFFSET
                && owner < index_used
                && self.index.flag(owner) == FLAG_USED
                && self.index.data_offset(owner) == offset;
            if !live {
                self.data_free.push(offset);
            }
            offset += size;
        }
        Ok(())
    }

    pub fn fragmentation(&self) -> Fragmentation {
        let mut income = 0;
        let mut leftmost = u64::MAX;
        for offset in self.data_free.iter() {
            income += self.data.node_size(offset);
            leftmost = leftmost.min(offset);
        }
        Fragmentation {
            income,
            leftmost: if income == 0 { 0 } else { leftmost },
            used: self.data.used(),
        }
    }

    /// Take the data free list and merge adjacent entries into holes.
    pub fn plan_compaction(&mut self) -> CompactionPlan {
        let mut offsets = self.data_free.take();
        offsets.sort_unstable();

        let mut blocks: Vec<(u64, u64)> = Vec::new();
        for offset in offsets {
            let size = self.data.node_size(offset);
            match blocks.last_mut() {
                Some((start, len)) if *start + *len == offset => *len += size,
                _ => blocks.push((offset, size)),
            }
        }
        CompactionPlan {
            blocks,
            end: self.data.used(),
        }
    }

    /// Slide the run `[src, src + len)` down to `dst`, fixing the owner of
    /// every moved data node and any free-list entry inside the run. The
    /// vacated tail is overwritten with filler nodes so the region stays
    /// walkable.
    pub fn relocate_run(&mut self, src: u64, len: u64, dst: u64) {
        let shift = src - dst;
        if len > 0 {
            self.data.copy_within(src, len, dst);
            let index_used = self.index.used();
            let mut offset = dst;
            while offset < dst + len {
                let old = offset + shift;
                let owner = self.data.backref(offset);
                if owner >= FIRST_NODE_OFFSET
                    && owner < index_used
                    && self.index.flag(owner) == FLAG_USED
                    && self.index.data_offset(owner) == old
                {
                    self.index.set_data_offset(owner, offset);
                }
                offset += self.data.node_size(offset);
            }
            self.data_free.relocate(src, len, shift);
        }
        self.write_filler(dst + len, shift);
    }

    /// Fill `[start, start + len)` with ownerless data nodes.
    fn write_filler(&mut self, start: u64, len: u64) {
        const MAX_FILLER: u64 = DATA_NODE_HEADER_SIZE + MAX_KEY_LEN as u64;
        let mut offset = start;
        let mut remaining = len;
        while remaining >= DATA_NODE_HEADER_SIZE {
            let mut chunk = remaining.min(MAX_FILLER);
            let rest = remaining - chunk;
            if rest > 0 && rest < DATA_NODE_HEADER_SIZE {
                chunk -= DATA_NODE_HEADER_SIZE;
            }
            let region = self.data.region_mut();
            region.write_u64(offset, 0);
            region.write_u16(offset + 8, (chunk - DATA_NODE_HEADER_SIZE) as u16);
            offset += chunk;
            remaining -= chunk;
        }
    }

    /// Move everything appended since `plan.end` onto the reclaimed space
    /// and shrink the data cursor.
    pub fn finish_compaction(&mut self, plan: &CompactionPlan) {
        let reclaimed = plan.reclaimed();
        if reclaimed == 0 {
            return;
        }
        let used = self.data.used();
        self.relocate_run(plan.end, used - plan.end, plan.end - reclaimed);
        self.data.set_used(used - reclaimed);
    }

    /// Compact the whole data region in one go. Returns the bytes reclaimed.
    pub fn compact(&mut self) -> u64 {
        let plan = self.plan_compaction();
        for (src, len, dst) in plan.moves() {
            self.relocate_run(src, len, dst);
        }
        self.finish_compaction(&plan);
        plan.reclaimed()
    }
}
