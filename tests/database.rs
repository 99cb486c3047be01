mod common;

use common::{assert_matches_model, key, settle, small_shard_config};
use skipdb::{Database, DatabaseConfig, Error, ShardStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn small_db_config() -> DatabaseConfig {
    DatabaseConfig::default().shard(small_shard_config())
}

#[test]
fn test_split_cutover_adds_shards() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), small_db_config()).unwrap();
    assert_eq!(db.shard_count(), 1);

    let mut model = BTreeMap::new();
    for i in 0..2000 {
        db.put(&key(i), i).unwrap();
        model.insert(key(i), i);
    }
    settle(&db);

    assert!(db.shard_count() > 1, "no split was cut over");
    for shard in db.shards() {
        assert_eq!(shard.status(), ShardStatus::Normal);
        assert!(!shard.is_split_child());
    }
    assert_matches_model(db.entries().unwrap(), &model);
    assert_eq!(db.len().unwrap(), 2000);
    db.verify().unwrap();

    // Retired shards leave no files behind.
    assert!(!dir.path().join("shard-000001.meta").exists());
}

#[test]
fn test_concurrent_writers_across_splits() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path(), small_db_config()).unwrap());

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..500u64 {
                    let id = i * 4 + t;
                    db.put(&key(id), id).unwrap();
                }
                for i in (0..500u64).step_by(5) {
                    db.delete(&key(i * 4 + t)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    settle(&db);

    let model: BTreeMap<Vec<u8>, u64> = (0..2000u64)
        .filter(|id| (id / 4) % 5 != 0)
        .map(|id| (key(id), id))
        .collect();
    assert_matches_model(db.entries().unwrap(), &model);
    for id in 0..2000u64 {
        assert_eq!(db.get(&key(id)).unwrap(), model.get(&key(id)).copied());
    }
    db.verify().unwrap();
}

#[test]
fn test_reopen_rebuilds_ranges() {
    let dir = tempdir().unwrap();
    let mut model = BTreeMap::new();
    let shard_count = {
        let db = Database::open(dir.path(), small_db_config()).unwrap();
        for i in (0..1500).rev() {
            db.put(&key(i), i + 1).unwrap();
            model.insert(key(i), i + 1);
        }
        settle(&db);
        db.sync().unwrap();
        let count = db.shard_count();
        db.close().unwrap();
        count
    };

    let db = Database::open(dir.path(), small_db_config()).unwrap();
    assert_eq!(db.shard_count(), shard_count);
    assert_matches_model(db.entries().unwrap(), &model);
    db.verify().unwrap();

    // Keys above every stored key land in the last shard.
    db.put(b"zzz", 1).unwrap();
    assert_eq!(db.get(b"zzz").unwrap(), Some(1));
    assert_eq!(db.get(b"0").unwrap(), None);
}

#[test]
fn test_reopen_drops_empty_shards() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path(), small_db_config()).unwrap();
        for i in 0..1000 {
            db.put(&key(i), i).unwrap();
        }
        settle(&db);
        assert!(db.shard_count() > 1);
        for i in 0..1000 {
            db.delete(&key(i)).unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(dir.path(), small_db_config()).unwrap();
    assert_eq!(db.shard_count(), 1);
    assert!(db.is_empty().unwrap());
    db.put(b"fresh", 9).unwrap();
    assert_eq!(db.get(b"fresh").unwrap(), Some(9));
}

#[test]
fn test_closed_database_rejects_operations() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), small_db_config()).unwrap();
    db.put(b"a", 1).unwrap();
    db.close().unwrap();
    db.close().unwrap();
    assert!(matches!(db.put(b"a", 2), Err(Error::Closed)));
    assert!(matches!(db.delete(b"a"), Err(Error::Closed)));
    assert!(matches!(db.sync(), Err(Error::Closed)));
}

#[test]
fn test_config_from_json_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("skipdb.json");
    let config = small_db_config().enable_defrag(true);
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = DatabaseConfig::from_json_file(&path).unwrap();
    assert!(loaded.enable_defrag);
    assert_eq!(loaded.shard.index_capacity, 4096);
    assert_eq!(loaded.shard.seed, Some(42));
}
