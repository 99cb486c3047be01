mod common;

use common::{assert_matches_model, key, roomy_shard_config, wait_until};
use skipdb::{Database, DatabaseConfig, DefragConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn eager_defrag() -> DefragConfig {
    DefragConfig::new(0, u64::MAX, 0.0, Duration::from_millis(20))
}

#[test]
fn test_background_defrag_reclaims_deleted_space() {
    let dir = tempdir().unwrap();
    let config = DatabaseConfig::default()
        .shard(roomy_shard_config())
        .defrag(eager_defrag())
        .enable_defrag(true);
    let db = Database::open(dir.path(), config).unwrap();
    assert!(db.defrag().is_running());

    for i in 0..3000 {
        db.put(&key(i), i).unwrap();
    }
    for i in (0..3000).filter(|i| i % 3 != 0) {
        db.delete(&key(i)).unwrap();
    }

    let shard = db.shards().pop().unwrap();
    assert!(
        wait_until(|| shard.fragmentation().is_some_and(|f| f.income == 0)),
        "defragmentation did not catch up"
    );
    let stats = db.defrag().stats();
    assert!(stats.shards_compacted >= 1);
    assert!(stats.bytes_reclaimed > 0);

    for i in 0..3000 {
        let expected = (i % 3 == 0).then_some(i);
        assert_eq!(db.get(&key(i)).unwrap(), expected);
    }
    db.verify().unwrap();
    db.close().unwrap();
    assert!(!db.defrag().is_running());
}

#[test]
fn test_compaction_races_with_writers() {
    let dir = tempdir().unwrap();
    let config = DatabaseConfig::default()
        .shard(roomy_shard_config())
        .defrag(eager_defrag());
    let db = Arc::new(Database::open(dir.path(), config).unwrap());
    assert!(!db.defrag().is_running());

    for i in 0..2000 {
        db.put(&key(i), i).unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..2000u64 {
                if i % 2 == 0 {
                    db.delete(&key(i)).unwrap();
                } else {
                    db.put(&key(i), i * 7).unwrap();
                }
                if i % 50 == 0 {
                    db.put(&key(10_000 + i), i).unwrap();
                }
            }
        })
    };
    for _ in 0..50 {
        db.defrag().run_once().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    writer.join().unwrap();
    db.defrag().run_once().unwrap();

    let mut model = BTreeMap::new();
    for i in 0..2000u64 {
        if i % 2 == 1 {
            model.insert(key(i), i * 7);
        }
        if i % 50 == 0 {
            model.insert(key(10_000 + i), i);
        }
    }
    assert_matches_model(db.entries().unwrap(), &model);
    db.verify().unwrap();

    let shard = db.shards().pop().unwrap();
    assert_eq!(shard.fragmentation().unwrap().income, 0);
}

#[test]
fn test_reconfigure_while_running() {
    let dir = tempdir().unwrap();
    let config = DatabaseConfig::default()
        .shard(roomy_shard_config())
        .enable_defrag(true);
    let db = Database::open(dir.path(), config).unwrap();

    for i in 0..500 {
        db.put(&key(i), i).unwrap();
    }
    for i in 0..150 {
        db.delete(&key(i)).unwrap();
    }
    // Defaults need more than 4 KiB of holes; 150 nodes of 20 bytes fall short.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(db.defrag().stats().shards_compacted, 0);

    db.defrag()
        .configure(0, u64::MAX, 0.0, Duration::from_millis(20))
        .unwrap();
    db.defrag().notify();
    assert!(wait_until(|| db.defrag().stats().shards_compacted >= 1));
    assert!(db.defrag().configure(10, 1, 0.0, Duration::from_secs(1)).is_err());
}
