#![allow(dead_code)]

use skipdb::{Database, Shard, ShardConfig, ShardStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Small regions so a few dozen keys fill an index and force a split.
pub fn small_shard_config() -> ShardConfig {
    ShardConfig::new(0.25)
        .index_capacity(4096)
        .data_capacity(4096)
        .redo_log_capacity(4096)
        .seed(42)
}

/// Regions large enough that tests never split.
pub fn roomy_shard_config() -> ShardConfig {
    ShardConfig::new(0.25)
        .index_capacity(1024 * 1024)
        .data_capacity(1024 * 1024)
        .seed(7)
}

pub fn key(i: u64) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

/// Poll `done` every few milliseconds for up to ten seconds.
pub fn wait_until<F: FnMut() -> bool>(mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

pub fn wait_for_split(shard: &Arc<Shard>) {
    assert!(
        wait_until(|| shard.status() != ShardStatus::Splitting),
        "split of {:?} did not finish",
        shard
    );
}

/// Let running splits finish and cut over every completed one by touching
/// its largest key.
pub fn settle(db: &Database) {
    let settled = wait_until(|| {
        let mut quiet = true;
        for shard in db.shards() {
            match shard.status() {
                ShardStatus::Splitting => quiet = false,
                ShardStatus::SplitDone => {
                    quiet = false;
                    if let Some(max) = shard.maximum_key().unwrap() {
                        let value = db.get(&max).unwrap().unwrap();
                        db.put(&max, value).unwrap();
                    }
                }
                _ => {}
            }
        }
        quiet
    });
    assert!(settled, "database did not settle");
}

pub fn assert_matches_model(entries: Vec<(Vec<u8>, u64)>, model: &BTreeMap<Vec<u8>, u64>) {
    let expected: Vec<(Vec<u8>, u64)> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(entries.len(), expected.len(), "entry count differs");
    for (actual, expected) in entries.iter().zip(expected.iter()) {
        assert_eq!(
            actual,
            expected,
            "mismatch at key {:?}",
            String::from_utf8_lossy(&expected.0)
        );
    }
}
