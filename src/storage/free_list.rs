/// LIFO list of reclaimable byte offsets within one region.
///
/// One list exists per index-node level (a freed slot can only satisfy an
/// allocation of the same size) and one for data nodes.
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    offsets: Vec<u64>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64) {
        self.offsets.push(offset);
    }

    /// Most recently pushed offset.
    pub fn pop(&mut self) -> Option<u64> {
        self.offsets.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.offsets.iter().rev().copied()
    }

    /// Empty the list, returning everything it held.
    pub fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.offsets)
    }

    /// Shift every entry inside `[from, from + len)` down by `delta`.
    pub(crate) fn relocate(&mut self, from: u64, len: u64, delta: u64) {
        for offset in self.offsets.iter_mut() {
            if *offset >= from && *offset < from + len {
                *offset -= delta;
            }
        }
    }
}
