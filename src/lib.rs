pub mod config;
pub mod database;
pub mod defrag;
pub mod error;
pub mod logging;
pub mod router;
pub mod shard;
pub mod skiplist;
pub mod storage;

pub use config::{DatabaseConfig, DefragConfig, ShardConfig};
pub use database::Database;
pub use defrag::{DefragEngine, DefragStatsSnapshot};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use router::{RangeRouter, ShardRouter, SplitBoundary, UpperBound};
pub use shard::{Shard, ShardStatus};
pub use skiplist::{Fragmentation, RedoLog, RedoRecord, SkipList};
