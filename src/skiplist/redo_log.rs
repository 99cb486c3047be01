use super::{random_level, seeded_rng, validate_key, MAX_LEVEL};
use crate::error::{Error, Result};
use crate::storage::{MappedRegion, MIN_REGION_CAPACITY};
use rand::rngs::StdRng;
use std::path::Path;
use tracing::debug;

const MAGIC: u32 = u32::from_le_bytes(*b"SKPR");
const VERSION: u32 = 1;

const H_MAGIC: u64 = 0;
const H_VERSION: u64 = 4;
const H_USED: u64 = 8;
const H_COUNT: u64 = 16;
const H_TAIL: u64 = 24;
const H_PROBABILITY: u64 = 32;
const HEADER_SIZE: u64 = 48;

const HEAD: u64 = HEADER_SIZE;
const N_LEVEL: u64 = 0;
const N_FLAG: u64 = 1;
const N_KEY_LEN: u64 = 2;
const N_VALUE: u64 = 8;
const N_BACKWARD: u64 = 16;
const N_FORWARDS: u64 = 24;
const FIRST_NODE: u64 = HEAD + N_FORWARDS + 8 * MAX_LEVEL as u64;

const FLAG_HEAD: u8 = 0x80;
const FLAG_LIVE: u8 = 0x01;
const FLAG_TOMBSTONE: u8 = 0x02;

/// What the redo log knows about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoRecord {
    Live(u64),
    Tombstone,
}

/// Append-only skip list recording writes made while a shard splits.
///
/// Unlike [`super::SkipList`] the key is stored inline after the forward
/// pointers and nothing is ever unlinked: a delete is an upsert that turns
/// the entry into a tombstone.
///
/// Node: `level: u8 | flag: u8 | key_len: u16 | pad | value: u64 |
/// backward: u64 | forwards: [u64; level] | key`.
pub struct RedoLog {
    region: MappedRegion,
    rng: StdRng,
    probability: f32,
}

impl RedoLog {
    pub fn create<P: AsRef<Path>>(
        path: P,
        capacity: u64,
        probability: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        let mut region = MappedRegion::create(path, capacity.max(MIN_REGION_CAPACITY))?;
        region.write_u32(H_MAGIC, MAGIC);
        region.write_u32(H_VERSION, VERSION);
        region.write_u64(H_USED, FIRST_NODE);
        region.write_u64(H_COUNT, 0);
        region.write_u64(H_TAIL, HEAD);
        region.write_f32(H_PROBABILITY, probability);
        region.write_u8(HEAD + N_FLAG, FLAG_HEAD);

        debug!("Created redo log {}", region.path().display());
        Ok(Self {
            region,
            rng: seeded_rng(seed),
            probability,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, seed: Option<u64>) -> Result<Self> {
        let region = MappedRegion::open(path)?;
        if region.read_u32(H_MAGIC) != MAGIC || region.read_u32(H_VERSION) != VERSION {
            return Err(Error::Corrupted(format!(
                "{} is not a redo log",
                region.path().display()
            )));
        }
        let used = region.read_u64(H_USED);
        if used < FIRST_NODE || used > region.capacity() {
            return Err(Error::Corrupted(format!(
                "{}: used cursor {} out of range",
                region.path().display(),
                used
            )));
        }
        let probability = region.read_f32(H_PROBABILITY);
        let log = Self {
            region,
            rng: seeded_rng(seed),
            probability,
        };
        log.check_levels()?;
        Ok(log)
    }

    /// Every level chain must stay inside the written part of the file and
    /// only visit nodes tall enough to carry it.
    fn check_levels(&self) -> Result<()> {
        let height = self.level(HEAD);
        if height > MAX_LEVEL {
            return Err(Error::Corrupted(format!(
                "{}: head height {} exceeds {}",
                self.region.path().display(),
                height,
                MAX_LEVEL
            )));
        }

        let used = self.region.read_u64(H_USED);
        let max_steps = (used - FIRST_NODE) / (N_FORWARDS + 9);
        for i in 0..height {
            let mut x = self.forward(HEAD, i);
            let mut steps = 0;
            while x != 0 {
                let valid = x >= FIRST_NODE
                    && x + N_FORWARDS <= used
                    && self.level(x) > i
                    && self.level(x) <= MAX_LEVEL
                    && x + N_FORWARDS
                        + 8 * self.level(x) as u64
                        + self.region.read_u16(x + N_KEY_LEN) as u64
                        <= used;
                steps += 1;
                if !valid || steps > max_steps {
                    return Err(Error::Corrupted(format!(
                        "{}: level {} broken at offset {}",
                        self.region.path().display(),
                        i,
                        x
                    )));
                }
                x = self.forward(x, i);
            }
        }
        Ok(())
    }

    /// Number of distinct keys recorded, tombstones included.
    pub fn len(&self) -> u64 {
        self.region.read_u64(H_COUNT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn level(&self, node: u64) -> usize {
        self.region.read_u8(node + N_LEVEL) as usize
    }

    fn forward(&self, node: u64, level: usize) -> u64 {
        self.region.read_u64(node + N_FORWARDS + 8 * level as u64)
    }

    fn set_forward(&mut self, node: u64, level: usize, next: u64) {
        self.region.write_u64(node + N_FORWARDS + 8 * level as u64, next);
    }

    fn key(&self, node: u64) -> &[u8] {
        let len = self.region.read_u16(node + N_KEY_LEN) as usize;
        let start = node + N_FORWARDS + 8 * self.level(node) as u64;
        self.region.bytes(start, len)
    }

    fn record(&self, node: u64) -> RedoRecord {
        if self.region.read_u8(node + N_FLAG) == FLAG_TOMBSTONE {
            RedoRecord::Tombstone
        } else {
            RedoRecord::Live(self.region.read_u64(node + N_VALUE))
        }
    }

    fn search(&self, key: &[u8]) -> ([u64; MAX_LEVEL], Option<u64>) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level(HEAD)).rev() {
            loop {
                let next = self.forward(x, i);
                if next == 0 || self.key(next) >= key {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }
        let next = self.forward(x, 0);
        let found = (next != 0 && self.key(next) == key).then_some(next);
        (update, found)
    }

    pub fn put(&mut self, key: &[u8], value: u64) -> Result<()> {
        self.upsert(key, FLAG_LIVE, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.upsert(key, FLAG_TOMBSTONE, 0)
    }

    fn upsert(&mut self, key: &[u8], flag: u8, value: u64) -> Result<()> {
        validate_key(key)?;

        let (mut update, found) = self.search(key);
        if let Some(node) = found {
            self.region.write_u8(node + N_FLAG, flag);
            self.region.write_u64(node + N_VALUE, value);
            return Ok(());
        }

        let level = random_level(&mut self.rng, self.probability);
        let node = self.region.read_u64(H_USED);
        let end = node + N_FORWARDS + 8 * level as u64 + key.len() as u64;
        self.region.ensure(end)?;

        self.region.write_u8(node + N_LEVEL, level as u8);
        self.region.write_u8(node + N_FLAG, flag);
        self.region.write_u16(node + N_KEY_LEN, key.len() as u16);
        self.region.write_u64(node + N_VALUE, value);
        self.region.write_u64(node + N_BACKWARD, update[0]);
        self.region.write_bytes(node + N_FORWARDS + 8 * level as u64, key);

        let height = self.level(HEAD);
        if level > height {
            for slot in update.iter_mut().take(level).skip(height) {
                *slot = HEAD;
            }
            self.region.write_u8(HEAD + N_LEVEL, level as u8);
        }
        for (i, &prev) in update.iter().enumerate().take(level) {
            let next = self.forward(prev, i);
            self.set_forward(node, i, next);
            self.set_forward(prev, i, node);
        }

        let successor = self.forward(node, 0);
        if successor != 0 {
            self.region.write_u64(successor + N_BACKWARD, node);
        } else {
            self.region.write_u64(H_TAIL, node);
        }
        self.region.write_u64(H_USED, end);
        self.region.write_u64(H_COUNT, self.len() + 1);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<RedoRecord> {
        self.search(key).1.map(|node| self.record(node))
    }

    /// Largest key whose latest record is not a tombstone.
    pub fn max_live_key(&self) -> Option<Vec<u8>> {
        let mut x = self.region.read_u64(H_TAIL);
        while x != HEAD {
            if let RedoRecord::Live(_) = self.record(x) {
                return Some(self.key(x).to_vec());
            }
            x = self.region.read_u64(x + N_BACKWARD);
        }
        None
    }

    /// Every record in key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, RedoRecord)> {
        let mut out = Vec::with_capacity(self.len() as usize);
        let mut x = self.forward(HEAD, 0);
        while x != 0 {
            out.push((self.key(x).to_vec(), self.record(x)));
            x = self.forward(x, 0);
        }
        out
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Unmap and delete the log file.
    pub fn destroy(self) -> Result<()> {
        self.region.remove()
    }
}
