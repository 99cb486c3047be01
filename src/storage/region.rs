use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIN_REGION_CAPACITY: u64 = 4096;

/// Capacity a region grows to once it is exhausted: doubling below 1 GiB,
/// then fixed 1 GiB steps.
pub fn next_capacity(current: u64) -> u64 {
    if current < GIB {
        current.max(1) * 2
    } else {
        current + GIB
    }
}

/// A file mapped read/write in its entirety that can be extended in place.
///
/// Every structure stored in a region refers to other structures by byte
/// offset, so a remap only invalidates borrowed slices, never the offsets.
pub struct MappedRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl MappedRegion {
    /// Create (or truncate) the file at `path` with `capacity` zeroed bytes.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;
        let map = map_file(&file, capacity)?;

        debug!("Created region {} ({} bytes)", path.display(), capacity);
        Ok(Self { path, file, map })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len();
        if capacity < MIN_REGION_CAPACITY {
            return Err(Error::Corrupted(format!(
                "{} is only {} bytes",
                path.display(),
                capacity
            )));
        }
        let map = map_file(&file, capacity)?;
        Ok(Self { path, file, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.map.len() as u64
    }

    /// Unmap, extend the file and map it again. On failure the old mapping
    /// is kept and the region stays usable at its previous size.
    pub fn grow(&mut self) -> Result<u64> {
        let old = self.capacity();
        let new = next_capacity(old);

        self.map.flush()?;
        self.file.set_len(new)?;
        self.map = map_file(&self.file, new)?;

        debug!("Grew region {} from {} to {} bytes", self.path.display(), old, new);
        Ok(new)
    }

    /// Grow until at least `end` bytes are addressable.
    pub fn ensure(&mut self, end: u64) -> Result<()> {
        while self.capacity() < end {
            self.grow()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Rename the backing file. The mapping and descriptor stay valid.
    pub fn rename<P: AsRef<Path>>(&mut self, to: P) -> Result<()> {
        let to = to.as_ref().to_path_buf();
        std::fs::rename(&self.path, &to)?;
        debug!("Renamed region {} to {}", self.path.display(), to.display());
        self.path = to;
        Ok(())
    }

    /// Unmap and delete the backing file.
    pub fn remove(self) -> Result<()> {
        let MappedRegion { path, file, map } = self;
        drop(map);
        drop(file);
        std::fs::remove_file(&path)?;
        debug!("Removed region {}", path.display());
        Ok(())
    }

    #[inline]
    pub fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.map[start..start + len]
    }

    #[inline]
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.map[start..start + data.len()].copy_from_slice(data);
    }

    /// Move `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: u64, len: u64, dst: u64) {
        let src = src as usize;
        self.map.copy_within(src..src + len as usize, dst as usize);
    }

    #[inline]
    pub fn read_u64(&self, offset: u64) -> u64 {
        let start = offset as usize;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[start..start + 8]);
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub fn write_u64(&mut self, offset: u64, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> u32 {
        let start = offset as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[start..start + 4]);
        u32::from_le_bytes(buf)
    }

    #[inline]
    pub fn write_u32(&mut self, offset: u64, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[inline]
    pub fn read_u16(&self, offset: u64) -> u16 {
        let start = offset as usize;
        u16::from_le_bytes([self.map[start], self.map[start + 1]])
    }

    #[inline]
    pub fn write_u16(&mut self, offset: u64, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[inline]
    pub fn read_u8(&self, offset: u64) -> u8 {
        self.map[offset as usize]
    }

    #[inline]
    pub fn write_u8(&mut self, offset: u64, value: u8) {
        self.map[offset as usize] = value;
    }

    pub fn read_f32(&self, offset: u64) -> f32 {
        f32::from_bits(self.read_u32(offset))
    }

    pub fn write_f32(&mut self, offset: u64, value: f32) {
        self.write_u32(offset, value.to_bits());
    }
}

fn map_file(file: &File, capacity: u64) -> Result<MmapMut> {
    // SAFETY: the file is owned by the region and only ever accessed through
    // this mapping while the shard lock is held.
    let map = unsafe { MmapOptions::new().len(capacity as usize).map_mut(file)? };

    // Skip-list traversal jumps around the file; readahead only hurts.
    #[cfg(unix)]
    map.advise(memmap2::Advice::Random)?;

    Ok(map)
}
