pub mod free_list;
pub mod region;

pub use free_list::FreeList;
pub use region::{next_capacity, MappedRegion, GIB, MIN_REGION_CAPACITY};
