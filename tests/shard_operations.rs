mod common;

use common::{key, roomy_shard_config};
use skipdb::{Error, Shard, ShardConfig, ShardStatus, SkipList};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

#[test]
fn test_basic_scenario() {
    let dir = tempdir().unwrap();
    let shard = Shard::open(dir.path().join("shard-000001"), 0.25).unwrap();

    shard.put(b"abc", 3).unwrap();
    shard.put(b"abcd", 4).unwrap();
    shard.put(b"def", 5).unwrap();
    shard.put(b"aa", 6).unwrap();
    shard.put(b"doy", 7).unwrap();

    assert_eq!(shard.get(b"def").unwrap(), Some(5));
    assert_eq!(shard.maximum_key().unwrap(), Some(b"doy".to_vec()));

    shard.delete(b"abc").unwrap();
    assert_eq!(shard.len().unwrap(), 4);
    assert_eq!(shard.get(b"abc").unwrap(), None);
    assert_eq!(
        shard
            .entries()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>(),
        vec![b"aa".to_vec(), b"abcd".to_vec(), b"def".to_vec(), b"doy".to_vec()]
    );
    shard.verify().unwrap();
}

#[test]
fn test_shorter_key_sorts_first() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), roomy_shard_config()).unwrap();
    for k in [&b"ab"[..], b"a", b"abc", b"b", b"\x00"] {
        shard.put(k, k.len() as u64).unwrap();
    }
    let keys: Vec<Vec<u8>> = shard.entries().unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        vec![
            b"\x00".to_vec(),
            b"a".to_vec(),
            b"ab".to_vec(),
            b"abc".to_vec(),
            b"b".to_vec()
        ]
    );
}

#[test]
fn test_delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), roomy_shard_config()).unwrap();
    shard.put(b"k", 1).unwrap();
    shard.delete(b"k").unwrap();
    shard.delete(b"k").unwrap();
    shard.delete(b"never-there").unwrap();
    assert!(shard.is_empty().unwrap());
    assert_eq!(shard.maximum_key().unwrap(), None);
}

#[test]
fn test_overwrite_keeps_count() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), roomy_shard_config()).unwrap();
    for i in 0..100 {
        shard.put(&key(i), i).unwrap();
    }
    for i in 0..100 {
        shard.put(&key(i), i + 1000).unwrap();
    }
    assert_eq!(shard.len().unwrap(), 100);
    assert_eq!(shard.get(&key(42)).unwrap(), Some(1042));
}

#[test]
fn test_oversized_key_rejected_without_change() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), roomy_shard_config()).unwrap();
    let huge = vec![b'x'; 65536];
    assert!(matches!(
        shard.put(&huge, 1),
        Err(Error::InvalidKeySize { size: 65536, .. })
    ));
    let largest = vec![b'x'; 65535];
    shard.put(&largest, 2).unwrap();
    assert_eq!(shard.get(&largest).unwrap(), Some(2));
    assert_eq!(shard.len().unwrap(), 1);
}

#[test]
fn test_regions_grow_past_initial_capacity() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    let config = ShardConfig::new(0.5)
        .index_capacity(4096)
        .data_capacity(4096)
        .seed(1);
    let shard = Shard::open_with(&prefix, config).unwrap();

    // 60 keys of 100 bytes overflow a 4 KiB data region
    let long_key = |i: u64| format!("{:0>100}", i).into_bytes();
    for i in 0..60 {
        shard.put(&long_key(i), i).unwrap();
    }
    // Growing data is always allowed; the index did not fill up yet
    assert_eq!(shard.status(), ShardStatus::Normal);
    assert!(std::fs::metadata(SkipList::data_path(&prefix)).unwrap().len() > 4096);
    for i in 0..60 {
        assert_eq!(shard.get(&long_key(i)).unwrap(), Some(i));
    }
}

#[test]
fn test_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    {
        let shard = Shard::open_with(&prefix, roomy_shard_config()).unwrap();
        for i in 0..1000 {
            shard.put(&key(i), i * 3).unwrap();
        }
        for i in (0..1000).step_by(7) {
            shard.delete(&key(i)).unwrap();
        }
        shard.flush().unwrap();
        shard.close().unwrap();
    }

    let shard = Shard::open_with(&prefix, roomy_shard_config()).unwrap();
    shard.verify().unwrap();
    assert_eq!(shard.len().unwrap(), 1000 - 143);
    for i in 0..1000 {
        let expected = (i % 7 != 0).then_some(i * 3);
        assert_eq!(shard.get(&key(i)).unwrap(), expected);
    }
    assert_eq!(shard.maximum_key().unwrap(), Some(key(999)));
}

#[test]
fn test_destroy_removes_files() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    let shard = Shard::open_with(&prefix, roomy_shard_config()).unwrap();
    shard.put(b"a", 1).unwrap();
    shard.destroy().unwrap();
    assert_eq!(SkipList::files_exist(&prefix), (false, false));
    assert_eq!(shard.status(), ShardStatus::Closed);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), roomy_shard_config()).unwrap();
    for i in 0..500 {
        shard.put(&key(i), i).unwrap();
    }

    let writer = {
        let shard = Arc::clone(&shard);
        thread::spawn(move || {
            for i in 500..1500 {
                shard.put(&key(i), i).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shard = Arc::clone(&shard);
            thread::spawn(move || {
                for round in 0..5 {
                    for i in 0..500 {
                        assert_eq!(shard.get(&key(i)).unwrap(), Some(i), "round {}", round);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(shard.len().unwrap(), 1500);
    shard.verify().unwrap();
}
