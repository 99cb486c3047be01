//! Byte layout of the `.meta` (index) and `.data` regions.
//!
//! Index region:
//!
//! ```text
//! 0      magic "SKPI" | version
//! 8      used bytes
//! 16     capacity
//! 24     tail node offset
//! 32     live key count
//! 40     promotion probability (f32) | reserved
//! 48     head sentinel: 32-byte node header + MAX_LEVEL forwards
//! 592    packed index nodes ...
//! ```
//!
//! Index node: `level: u32 | flag: u32 | data offset: u64 | value: u64 |
//! backward: u64 | forwards: [u64; level]`.
//!
//! Data region: 32-byte header (`magic "SKPD" | version | used | capacity`)
//! followed by packed data nodes `backref: u64 | len: u16 | key bytes`.

use super::MAX_LEVEL;
use crate::error::{Error, Result};
use crate::storage::MappedRegion;
use std::path::Path;

pub const FORMAT_VERSION: u32 = 1;

pub const INDEX_MAGIC: u32 = u32::from_le_bytes(*b"SKPI");
pub const INDEX_HEADER_SIZE: u64 = 48;
pub const HEAD_OFFSET: u64 = INDEX_HEADER_SIZE;
pub const NODE_HEADER_SIZE: u64 = 32;
pub const FIRST_NODE_OFFSET: u64 = HEAD_OFFSET + node_size(MAX_LEVEL);

pub const DATA_MAGIC: u32 = u32::from_le_bytes(*b"SKPD");
pub const DATA_HEADER_SIZE: u64 = 32;
pub const DATA_NODE_HEADER_SIZE: u64 = 10;

pub const FLAG_USED: u32 = 0x0001;
pub const FLAG_DELETED: u32 = 0x0002;
pub const FLAG_HEAD: u32 = 0x8000;

const H_MAGIC: u64 = 0;
const H_VERSION: u64 = 4;
const H_USED: u64 = 8;
const H_CAPACITY: u64 = 16;
const H_TAIL: u64 = 24;
const H_COUNT: u64 = 32;
const H_PROBABILITY: u64 = 40;

const N_LEVEL: u64 = 0;
const N_FLAG: u64 = 4;
const N_DATA: u64 = 8;
const N_VALUE: u64 = 16;
const N_BACKWARD: u64 = 24;

pub const fn node_size(level: usize) -> u64 {
    NODE_HEADER_SIZE + 8 * level as u64
}

pub const fn data_node_size(key_len: usize) -> u64 {
    DATA_NODE_HEADER_SIZE + key_len as u64
}

fn check_header(region: &MappedRegion, magic: u32, min_used: u64) -> Result<()> {
    let found = region.read_u32(H_MAGIC);
    if found != magic {
        return Err(Error::Corrupted(format!(
            "{}: bad magic {:#010x}",
            region.path().display(),
            found
        )));
    }
    let version = region.read_u32(H_VERSION);
    if version != FORMAT_VERSION {
        return Err(Error::Corrupted(format!(
            "{}: unsupported format version {}",
            region.path().display(),
            version
        )));
    }
    let used = region.read_u64(H_USED);
    if used < min_used || used > region.capacity() {
        return Err(Error::Corrupted(format!(
            "{}: used cursor {} outside [{}, {}]",
            region.path().display(),
            used,
            min_used,
            region.capacity()
        )));
    }
    Ok(())
}

/// Typed view over the `.meta` region.
pub struct IndexRegion {
    region: MappedRegion,
}

impl IndexRegion {
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64, probability: f32) -> Result<Self> {
        let mut region = MappedRegion::create(path, capacity)?;
        region.write_u32(H_MAGIC, INDEX_MAGIC);
        region.write_u32(H_VERSION, FORMAT_VERSION);
        region.write_u64(H_USED, FIRST_NODE_OFFSET);
        region.write_u64(H_CAPACITY, capacity);
        region.write_u64(H_TAIL, HEAD_OFFSET);
        region.write_u64(H_COUNT, 0);
        region.write_f32(H_PROBABILITY, probability);

        let mut index = Self { region };
        index.init_node(HEAD_OFFSET, 0, FLAG_HEAD, 0, 0, 0);
        Ok(index)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut region = MappedRegion::open(path)?;
        check_header(&region, INDEX_MAGIC, FIRST_NODE_OFFSET)?;
        let capacity = region.capacity();
        region.write_u64(H_CAPACITY, capacity);
        Ok(Self { region })
    }

    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut MappedRegion {
        &mut self.region
    }

    pub fn into_region(self) -> MappedRegion {
        self.region
    }

    pub fn capacity(&self) -> u64 {
        self.region.capacity()
    }

    pub fn ensure(&mut self, end: u64) -> Result<()> {
        self.region.ensure(end)?;
        let capacity = self.region.capacity();
        self.region.write_u64(H_CAPACITY, capacity);
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.region.read_u64(H_USED)
    }

    pub fn set_used(&mut self, used: u64) {
        self.region.write_u64(H_USED, used);
    }

    pub fn tail(&self) -> u64 {
        self.region.read_u64(H_TAIL)
    }

    pub fn set_tail(&mut self, tail: u64) {
        self.region.write_u64(H_TAIL, tail);
    }

    pub fn count(&self) -> u64 {
        self.region.read_u64(H_COUNT)
    }

    pub fn set_count(&mut self, count: u64) {
        self.region.write_u64(H_COUNT, count);
    }

    pub fn probability(&self) -> f32 {
        self.region.read_f32(H_PROBABILITY)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init_node(
        &mut self,
        node: u64,
        level: usize,
        flag: u32,
        data_offset: u64,
        value: u64,
        backward: u64,
    ) {
        self.region.write_u32(node + N_LEVEL, level as u32);
        self.region.write_u32(node + N_FLAG, flag);
        self.region.write_u64(node + N_DATA, data_offset);
        self.region.write_u64(node + N_VALUE, value);
        self.region.write_u64(node + N_BACKWARD, backward);
        let forwards = if flag == FLAG_HEAD { MAX_LEVEL } else { level };
        for i in 0..forwards {
            self.set_forward(node, i, 0);
        }
    }

    pub fn level(&self, node: u64) -> usize {
        self.region.read_u32(node + N_LEVEL) as usize
    }

    pub fn set_level(&mut self, node: u64, level: usize) {
        self.region.write_u32(node + N_LEVEL, level as u32);
    }

    pub fn flag(&self, node: u64) -> u32 {
        self.region.read_u32(node + N_FLAG)
    }

    pub fn set_flag(&mut self, node: u64, flag: u32) {
        self.region.write_u32(node + N_FLAG, flag);
    }

    pub fn data_offset(&self, node: u64) -> u64 {
        self.region.read_u64(node + N_DATA)
    }

    pub fn set_data_offset(&mut self, node: u64, offset: u64) {
        self.region.write_u64(node + N_DATA, offset);
    }

    pub fn value(&self, node: u64) -> u64 {
        self.region.read_u64(node + N_VALUE)
    }

    pub fn set_value(&mut self, node: u64, value: u64) {
        self.region.write_u64(node + N_VALUE, value);
    }

    pub fn backward(&self, node: u64) -> u64 {
        self.region.read_u64(node + N_BACKWARD)
    }

    pub fn set_backward(&mut self, node: u64, backward: u64) {
        self.region.write_u64(node + N_BACKWARD, backward);
    }

    pub fn forward(&self, node: u64, level: usize) -> u64 {
        self.region.read_u64(node + NODE_HEADER_SIZE + 8 * level as u64)
    }

    pub fn set_forward(&mut self, node: u64, level: usize, next: u64) {
        self.region.write_u64(node + NODE_HEADER_SIZE + 8 * level as u64, next);
    }
}

/// Typed view over the `.data` region.
pub struct DataRegion {
    region: MappedRegion,
}

impl DataRegion {
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let mut region = MappedRegion::create(path, capacity)?;
        region.write_u32(H_MAGIC, DATA_MAGIC);
        region.write_u32(H_VERSION, FORMAT_VERSION);
        region.write_u64(H_USED, DATA_HEADER_SIZE);
        region.write_u64(H_CAPACITY, capacity);
        Ok(Self { region })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut region = MappedRegion::open(path)?;
        check_header(&region, DATA_MAGIC, DATA_HEADER_SIZE)?;
        let capacity = region.capacity();
        region.write_u64(H_CAPACITY, capacity);
        Ok(Self { region })
    }

    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut MappedRegion {
        &mut self.region
    }

    pub fn into_region(self) -> MappedRegion {
        self.region
    }

    pub fn ensure(&mut self, end: u64) -> Result<()> {
        self.region.ensure(end)?;
        let capacity = self.region.capacity();
        self.region.write_u64(H_CAPACITY, capacity);
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.region.read_u64(H_USED)
    }

    pub fn set_used(&mut self, used: u64) {
        self.region.write_u64(H_USED, used);
    }

    pub fn write_node(&mut self, offset: u64, backref: u64, key: &[u8]) {
        self.region.write_u64(offset, backref);
        self.region.write_u16(offset + 8, key.len() as u16);
        self.region.write_bytes(offset + DATA_NODE_HEADER_SIZE, key);
    }

    pub fn backref(&self, offset: u64) -> u64 {
        self.region.read_u64(offset)
    }

    pub fn key_len(&self, offset: u64) -> usize {
        self.region.read_u16(offset + 8) as usize
    }

    pub fn key(&self, offset: u64) -> &[u8] {
        let len = self.key_len(offset);
        self.region.bytes(offset + DATA_NODE_HEADER_SIZE, len)
    }

    /// Total size of the data node at `offset`, header included.
    pub fn node_size(&self, offset: u64) -> u64 {
        data_node_size(self.key_len(offset))
    }

    pub fn copy_within(&mut self, src: u64, len: u64, dst: u64) {
        self.region.copy_within(src, len, dst);
    }
}
