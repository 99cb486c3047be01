mod common;

use common::{key, small_shard_config, wait_for_split};
use skipdb::{RedoLog, Shard, ShardStatus, SkipList};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn redo_log_path(prefix: &Path) -> std::path::PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".sp.redolog");
    name.into()
}

fn child_prefix(prefix: &Path, side: &str) -> std::path::PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".sp.{}", side));
    name.into()
}

#[test]
fn test_full_index_triggers_split() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("shard-000001");
    let shard = Shard::open_with(&prefix, small_shard_config()).unwrap();

    for i in 0..400 {
        shard.put(&key(i), i).unwrap();
    }
    wait_for_split(&shard);

    // Without a router the split is never cut over.
    assert_eq!(shard.status(), ShardStatus::SplitDone);
    assert_eq!(shard.len().unwrap(), 400);
    for i in 0..400 {
        assert_eq!(shard.get(&key(i)).unwrap(), Some(i), "key {}", i);
    }
    assert_eq!(shard.maximum_key().unwrap(), Some(key(399)));
    assert!(!redo_log_path(&prefix).exists());
    assert_eq!(SkipList::files_exist(&child_prefix(&prefix, "left")), (true, true));
    assert_eq!(SkipList::files_exist(&child_prefix(&prefix, "right")), (true, true));

    let keys: Vec<Vec<u8>> = shard.entries().unwrap().into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = (0..400).map(key).collect();
    assert_eq!(keys, expected);
    shard.verify().unwrap();
}

#[test]
fn test_writes_and_deletes_during_split() {
    let dir = tempdir().unwrap();
    let shard = Shard::open_with(dir.path().join("s"), small_shard_config()).unwrap();

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let shard = Arc::clone(&shard);
            thread::spawn(move || {
                for i in 0..300u64 {
                    let id = i * 4 + t;
                    shard.put(&key(id), id).unwrap();
                    if id % 3 == 0 {
                        shard.delete(&key(id)).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    wait_for_split(&shard);

    let model: BTreeMap<Vec<u8>, u64> = (0..1200u64)
        .filter(|id| id % 3 != 0)
        .map(|id| (key(id), id))
        .collect();
    common::assert_matches_model(shard.entries().unwrap(), &model);
    assert_eq!(shard.len().unwrap(), model.len() as u64);
    for id in (0..1200u64).step_by(3) {
        assert_eq!(shard.get(&key(id)).unwrap(), None);
    }
    shard.verify().unwrap();
}

#[test]
fn test_completed_split_survives_reopen() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    {
        let shard = Shard::open_with(&prefix, small_shard_config()).unwrap();
        for i in 0..300 {
            shard.put(&key(i), i * 10).unwrap();
        }
        wait_for_split(&shard);
        assert_eq!(shard.status(), ShardStatus::SplitDone);
        shard.close().unwrap();
    }

    let shard = Shard::open_with(&prefix, small_shard_config()).unwrap();
    assert_eq!(shard.status(), ShardStatus::SplitDone);
    for i in 0..300 {
        assert_eq!(shard.get(&key(i)).unwrap(), Some(i * 10));
    }
    shard.verify().unwrap();
}

#[test]
fn test_interrupted_split_is_redone_on_open() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    let config = small_shard_config().index_capacity(64 * 1024);
    {
        let shard = Shard::open_with(&prefix, config.clone()).unwrap();
        for i in 0..100 {
            shard.put(&key(i), i).unwrap();
        }
        shard.close().unwrap();
    }
    {
        // Writes that arrived while the split was running.
        let mut redo_log = RedoLog::create(redo_log_path(&prefix), 4096, 0.25, Some(3)).unwrap();
        redo_log.put(&key(5), 500).unwrap();
        redo_log.put(&key(150), 150).unwrap();
        redo_log.delete(&key(7)).unwrap();
        redo_log.delete(&key(99)).unwrap();
        redo_log.flush().unwrap();
    }

    let shard = Shard::open_with(&prefix, config).unwrap();
    assert_eq!(shard.status(), ShardStatus::SplitDone);
    assert!(!redo_log_path(&prefix).exists());

    assert_eq!(shard.get(&key(5)).unwrap(), Some(500));
    assert_eq!(shard.get(&key(150)).unwrap(), Some(150));
    assert_eq!(shard.get(&key(7)).unwrap(), None);
    assert_eq!(shard.get(&key(99)).unwrap(), None);
    assert_eq!(shard.get(&key(42)).unwrap(), Some(42));
    assert_eq!(shard.len().unwrap(), 99);
    assert_eq!(shard.maximum_key().unwrap(), Some(key(150)));
    shard.verify().unwrap();
}

#[test]
fn test_destroy_removes_split_artifacts() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    let shard = Shard::open_with(&prefix, small_shard_config()).unwrap();
    for i in 0..300 {
        shard.put(&key(i), i).unwrap();
    }
    wait_for_split(&shard);
    shard.destroy().unwrap();

    for base in [
        prefix.clone(),
        child_prefix(&prefix, "left"),
        child_prefix(&prefix, "right"),
    ] {
        assert_eq!(SkipList::files_exist(&base), (false, false));
    }
    assert!(!redo_log_path(&prefix).exists());
}

#[test]
fn test_failed_split_start_cleans_up() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("s");
    let shard = Shard::open_with(&prefix, small_shard_config()).unwrap();

    // A directory where the right child's index belongs makes its creation fail.
    let blocker = SkipList::meta_path(&child_prefix(&prefix, "right"));
    std::fs::create_dir(&blocker).unwrap();
    let mut i = 0;
    let failed_at = loop {
        if shard.put(&key(i), i).is_err() {
            break i;
        }
        i += 1;
        assert!(i < 1000, "index never filled");
    };

    assert_eq!(shard.status(), ShardStatus::Normal);
    assert_eq!(shard.get(&key(failed_at)).unwrap(), None);
    assert_eq!(
        SkipList::files_exist(&child_prefix(&prefix, "left")),
        (false, false)
    );
    assert!(!redo_log_path(&prefix).exists());
    assert_eq!(shard.len().unwrap(), failed_at);

    std::fs::remove_dir(&blocker).unwrap();
    shard.put(&key(failed_at), failed_at).unwrap();
    wait_for_split(&shard);
    assert_eq!(shard.status(), ShardStatus::SplitDone);
    assert_eq!(shard.get(&key(failed_at)).unwrap(), Some(failed_at));
}
