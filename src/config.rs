//! Configuration for shards, the defragmentation engine and the database.

use crate::error::{Error, Result};
use crate::storage::region::MIN_REGION_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_INDEX_CAPACITY: u64 = 4 * 1024 * 1024;
pub const DEFAULT_DATA_CAPACITY: u64 = 4 * 1024 * 1024;
pub const DEFAULT_REDO_LOG_CAPACITY: u64 = 1024 * 1024;
pub const DEFAULT_PROBABILITY: f32 = 0.25;

/// Per-shard settings. Capacities only apply when a shard is created; an
/// existing shard keeps the size of its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Level promotion probability of the skip list, in `[0, 1)`
    pub probability: f32,
    /// Initial size of the `.meta` file
    pub index_capacity: u64,
    /// Initial size of the `.data` file
    pub data_capacity: u64,
    /// Initial size of the `.sp.redolog` file created during a split
    pub redo_log_capacity: u64,
    /// Fixed seed for level draws; random when unset
    pub seed: Option<u64>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            probability: DEFAULT_PROBABILITY,
            index_capacity: DEFAULT_INDEX_CAPACITY,
            data_capacity: DEFAULT_DATA_CAPACITY,
            redo_log_capacity: DEFAULT_REDO_LOG_CAPACITY,
            seed: None,
        }
    }
}

impl ShardConfig {
    pub fn new(probability: f32) -> Self {
        Self {
            probability,
            ..Default::default()
        }
    }

    pub fn index_capacity(mut self, bytes: u64) -> Self {
        self.index_capacity = bytes;
        self
    }

    pub fn data_capacity(mut self, bytes: u64) -> Self {
        self.data_capacity = bytes;
        self
    }

    pub fn redo_log_capacity(mut self, bytes: u64) -> Self {
        self.redo_log_capacity = bytes;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.probability) {
            return Err(Error::Config(format!(
                "probability must be in [0, 1), got {}",
                self.probability
            )));
        }
        for (name, bytes) in [
            ("index_capacity", self.index_capacity),
            ("data_capacity", self.data_capacity),
            ("redo_log_capacity", self.redo_log_capacity),
        ] {
            if bytes < MIN_REGION_CAPACITY {
                return Err(Error::Config(format!(
                    "{} must be at least {} bytes, got {}",
                    name, MIN_REGION_CAPACITY, bytes
                )));
            }
        }
        Ok(())
    }
}

/// Thresholds of the defragmentation cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefragConfig {
    /// Shards reclaiming this many bytes or fewer are never compacted
    pub min_income: u64,
    /// Shards reclaiming more than this are compacted regardless of cost
    pub max_income: u64,
    /// Minimum reclaimable/relocated ratio between the two income bounds
    pub min_cost: f64,
    /// How long the engine sleeps between scans unless notified
    pub scan_interval: Duration,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            min_income: 4 * 1024,
            max_income: 1024 * 1024,
            min_cost: 0.5,
            scan_interval: Duration::from_secs(10),
        }
    }
}

impl DefragConfig {
    pub fn new(min_income: u64, max_income: u64, min_cost: f64, scan_interval: Duration) -> Self {
        Self {
            min_income,
            max_income,
            min_cost,
            scan_interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_income > self.max_income {
            return Err(Error::Config(format!(
                "min_income ({}) exceeds max_income ({})",
                self.min_income, self.max_income
            )));
        }
        if !self.min_cost.is_finite() || self.min_cost < 0.0 {
            return Err(Error::Config(format!(
                "min_cost must be a non-negative number, got {}",
                self.min_cost
            )));
        }
        if self.scan_interval.is_zero() {
            return Err(Error::Config("scan_interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub shard: ShardConfig,
    pub defrag: DefragConfig,
    /// Start the defragmentation thread when the database opens
    pub enable_defrag: bool,
}

impl DatabaseConfig {
    pub fn shard(mut self, shard: ShardConfig) -> Self {
        self.shard = shard;
        self
    }

    pub fn defrag(mut self, defrag: DefragConfig) -> Self {
        self.defrag = defrag;
        self
    }

    pub fn enable_defrag(mut self, enabled: bool) -> Self {
        self.enable_defrag = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.shard.validate()?;
        self.defrag.validate()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DatabaseConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
