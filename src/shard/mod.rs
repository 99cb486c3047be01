//! A shard: one disk-backed skip list plus the state machine that lets it
//! split online.
//!
//! ```text
//! Normal ──full index──▶ Splitting ──drain + replay──▶ SplitDone ──cutover──▶ Retired
//!    ▲                       │
//!    └──────drain failed─────┘
//! ```
//!
//! Every operation takes the shard lock once and dispatches on the state.
//! While splitting, writes go to the redo log and reads consult it first.
//! Once split, operations are routed to the children by the left child's
//! maximum key until the first write after completion hands both children to
//! the router.

mod split;

use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::router::ShardRouter;
use crate::skiplist::{
    suffixed, validate_key, CompactionPlan, Fragmentation, InsertOutcome, RedoLog, RedoRecord,
    SkipList, DATA_SUFFIX, META_SUFFIX, SPLIT_LEFT_SUFFIX, SPLIT_REDOLOG_SUFFIX,
    SPLIT_RIGHT_SUFFIX,
};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Externally visible lifecycle state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Normal,
    Splitting,
    SplitDone,
    Retired,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Splits when its index region fills up.
    Primary,
    /// Created by a split and not yet handed to the router; grows instead.
    SplitChild,
}

pub(crate) enum ShardState {
    Normal(SkipList),
    Splitting {
        core: SkipList,
        redo_log: RedoLog,
        left: Arc<Shard>,
        right: Arc<Shard>,
    },
    SplitDone {
        core: SkipList,
        left: Arc<Shard>,
        right: Arc<Shard>,
    },
    /// Files are gone; stale handles are redirected. `left` carries the upper
    /// bound it was registered with.
    Retired {
        left: Option<(Vec<u8>, Arc<Shard>)>,
        right: Arc<Shard>,
    },
    Closed,
}

impl ShardState {
    fn status(&self) -> ShardStatus {
        match self {
            ShardState::Normal(_) => ShardStatus::Normal,
            ShardState::Splitting { .. } => ShardStatus::Splitting,
            ShardState::SplitDone { .. } => ShardStatus::SplitDone,
            ShardState::Retired { .. } => ShardStatus::Retired,
            ShardState::Closed => ShardStatus::Closed,
        }
    }
}

pub(crate) struct ShardInner {
    prefix: PathBuf,
    config: ShardConfig,
    role: Role,
    defrag_running: bool,
    state: ShardState,
}

pub struct Shard {
    me: Weak<Shard>,
    inner: RwLock<ShardInner>,
    split_task: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<Weak<dyn ShardRouter>>>,
}

/// Child of a split or retired shard that owns `key`.
fn route_split(left: &Arc<Shard>, right: &Arc<Shard>, key: &[u8]) -> Result<Arc<Shard>> {
    match left.maximum_key()? {
        Some(max) if key <= max.as_slice() => Ok(Arc::clone(left)),
        _ => Ok(Arc::clone(right)),
    }
}

fn route_retired(
    left: &Option<(Vec<u8>, Arc<Shard>)>,
    right: &Arc<Shard>,
    key: &[u8],
) -> Arc<Shard> {
    match left {
        Some((bound, shard)) if key <= bound.as_slice() => Arc::clone(shard),
        _ => Arc::clone(right),
    }
}

/// Apply redo records on top of an ordered snapshot.
fn overlay(base: Vec<(Vec<u8>, u64)>, redo: Vec<(Vec<u8>, RedoRecord)>) -> Vec<(Vec<u8>, u64)> {
    let mut out = Vec::with_capacity(base.len() + redo.len());
    let mut base = base.into_iter().peekable();
    for (key, record) in redo {
        while let Some((k, _)) = base.peek() {
            if k.as_slice() >= key.as_slice() {
                break;
            }
            out.extend(base.next());
        }
        if base.peek().is_some_and(|(k, _)| *k == key) {
            base.next();
        }
        if let RedoRecord::Live(value) = record {
            out.push((key, value));
        }
    }
    out.extend(base);
    out
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Shard {
    fn build(prefix: &Path, config: ShardConfig, role: Role, state: ShardState) -> Arc<Self> {
        Arc::new_cyclic(|me| Shard {
            me: me.clone(),
            inner: RwLock::new(ShardInner {
                prefix: prefix.to_path_buf(),
                config,
                role,
                defrag_running: false,
                state,
            }),
            split_task: Mutex::new(None),
            router: Mutex::new(None),
        })
    }

    /// Open the shard stored under `prefix`, creating it when no file exists.
    pub fn open<P: AsRef<Path>>(prefix: P, probability: f32) -> Result<Arc<Self>> {
        Self::open_with(prefix, ShardConfig::new(probability))
    }

    /// Open or create with explicit capacities.
    ///
    /// An interrupted split (redo log still on disk) is redone from scratch
    /// before returning; a split that completed but was never cut over comes
    /// back as [`ShardStatus::SplitDone`].
    pub fn open_with<P: AsRef<Path>>(prefix: P, config: ShardConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let prefix = prefix.as_ref();

        let core = match SkipList::files_exist(prefix) {
            (false, false) => SkipList::create(prefix, &config)?,
            (true, true) => SkipList::open(prefix, &config)?,
            (meta, _) => {
                return Err(Error::Corrupted(format!(
                    "{}: {} file missing",
                    prefix.display(),
                    if meta { DATA_SUFFIX } else { META_SUFFIX }
                )))
            }
        };

        let redo_path = suffixed(prefix, SPLIT_REDOLOG_SUFFIX);
        let left_prefix = suffixed(prefix, SPLIT_LEFT_SUFFIX);
        let right_prefix = suffixed(prefix, SPLIT_RIGHT_SUFFIX);

        if redo_path.exists() {
            info!("Redoing interrupted split of {}", prefix.display());
            let redo_log = RedoLog::open(&redo_path, config.seed)?;
            let left = Self::create_child(&left_prefix, &config, None)?;
            let right = Self::create_child(&right_prefix, &config, None)?;
            let shard = Self::build(
                prefix,
                config,
                Role::Primary,
                ShardState::Splitting {
                    core,
                    redo_log,
                    left,
                    right,
                },
            );
            shard.run_split();
            return Ok(shard);
        }

        let children = [&left_prefix, &right_prefix]
            .iter()
            .all(|p| SkipList::files_exist(p) == (true, true));
        if children {
            info!("Reopening {} with a completed split", prefix.display());
            let left = Self::open_child(&left_prefix, &config)?;
            let right = Self::open_child(&right_prefix, &config)?;
            return Ok(Self::build(
                prefix,
                config,
                Role::Primary,
                ShardState::SplitDone { core, left, right },
            ));
        }

        debug!("Opened shard {} with {} keys", prefix.display(), core.len());
        Ok(Self::build(prefix, config, Role::Primary, ShardState::Normal(core)))
    }

    fn create_child(
        prefix: &Path,
        config: &ShardConfig,
        router: Option<Weak<dyn ShardRouter>>,
    ) -> Result<Arc<Self>> {
        let core = SkipList::create(prefix, config)?;
        let child = Self::build(prefix, config.clone(), Role::SplitChild, ShardState::Normal(core));
        *child.router.lock() = router;
        Ok(child)
    }

    fn open_child(prefix: &Path, config: &ShardConfig) -> Result<Arc<Self>> {
        let core = SkipList::open(prefix, config)?;
        Ok(Self::build(
            prefix,
            config.clone(),
            Role::SplitChild,
            ShardState::Normal(core),
        ))
    }

    /// Give the shard, and any split children it holds, the router to notify
    /// at cutover.
    pub fn attach_router(&self, router: Weak<dyn ShardRouter>) {
        *self.router.lock() = Some(router.clone());
        let inner = self.inner.read();
        match &inner.state {
            ShardState::Splitting { left, right, .. }
            | ShardState::SplitDone { left, right, .. } => {
                left.attach_router(router.clone());
                right.attach_router(router);
            }
            _ => {}
        }
    }

    pub fn prefix(&self) -> PathBuf {
        self.inner.read().prefix.clone()
    }

    pub fn status(&self) -> ShardStatus {
        self.inner.read().state.status()
    }

    pub fn is_split_child(&self) -> bool {
        self.inner.read().role == Role::SplitChild
    }

    pub fn put(&self, key: &[u8], value: u64) -> Result<()> {
        validate_key(key)?;

        let target = {
            let mut guard = self.inner.write();
            if matches!(guard.state, ShardState::SplitDone { .. }) {
                self.try_cutover(&mut guard);
            }
            let inner = &mut *guard;
            match &mut inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => {
                    let may_grow = inner.role == Role::SplitChild || inner.defrag_running;
                    return match core.insert(key, value, may_grow)? {
                        InsertOutcome::IndexFull => self.begin_split(inner, key, value),
                        InsertOutcome::Inserted | InsertOutcome::Updated => Ok(()),
                    };
                }
                ShardState::Splitting { redo_log, .. } => return redo_log.put(key, value),
                ShardState::SplitDone { left, right, .. } => {
                    return route_split(left, right, key)?.put(key, value)
                }
                ShardState::Retired { left, right } => route_retired(left, right, key),
            }
        };
        target.put(key, value)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        validate_key(key)?;

        let target = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => return Ok(core.get(key)),
                ShardState::Splitting { core, redo_log, .. } => {
                    return Ok(match redo_log.get(key) {
                        Some(RedoRecord::Live(value)) => Some(value),
                        Some(RedoRecord::Tombstone) => None,
                        None => core.get(key),
                    })
                }
                ShardState::SplitDone { left, right, .. } => {
                    return route_split(left, right, key)?.get(key)
                }
                ShardState::Retired { left, right } => route_retired(left, right, key),
            }
        };
        target.get(key)
    }

    /// Remove `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;

        let target = {
            let mut guard = self.inner.write();
            if matches!(guard.state, ShardState::SplitDone { .. }) {
                self.try_cutover(&mut guard);
            }
            match &mut guard.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => return core.remove(key).map(|_| ()),
                ShardState::Splitting { redo_log, .. } => return redo_log.delete(key),
                ShardState::SplitDone { left, right, .. } => {
                    return route_split(left, right, key)?.delete(key)
                }
                ShardState::Retired { left, right } => route_retired(left, right, key),
            }
        };
        target.delete(key)
    }

    pub fn maximum_key(&self) -> Result<Option<Vec<u8>>> {
        let (left, right) = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => return Ok(core.max_key()),
                ShardState::Splitting { core, redo_log, .. } => {
                    let own = core
                        .max_key_where(|k| redo_log.get(k) != Some(RedoRecord::Tombstone));
                    return Ok(own.max(redo_log.max_live_key()));
                }
                ShardState::SplitDone { left, right, .. } => {
                    (Some(Arc::clone(left)), Arc::clone(right))
                }
                ShardState::Retired { left, right } => {
                    (left.as_ref().map(|(_, s)| Arc::clone(s)), Arc::clone(right))
                }
            }
        };
        match right.maximum_key()? {
            Some(max) => Ok(Some(max)),
            None => match left {
                Some(left) => left.maximum_key(),
                None => Ok(None),
            },
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<u64> {
        let (left, right) = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => return Ok(core.len()),
                ShardState::Splitting { core, redo_log, .. } => {
                    let mut len = core.len();
                    for (key, record) in redo_log.entries() {
                        match (record, core.contains(&key)) {
                            (RedoRecord::Live(_), false) => len += 1,
                            (RedoRecord::Tombstone, true) => len -= 1,
                            _ => {}
                        }
                    }
                    return Ok(len);
                }
                ShardState::SplitDone { left, right, .. } => {
                    (Some(Arc::clone(left)), Arc::clone(right))
                }
                ShardState::Retired { left, right } => {
                    (left.as_ref().map(|(_, s)| Arc::clone(s)), Arc::clone(right))
                }
            }
        };
        let left = match left {
            Some(left) => left.len()?,
            None => 0,
        };
        Ok(left + right.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ordered snapshot of every live entry.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        let (left, right) = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) => return Ok(core.entries()),
                ShardState::Splitting { core, redo_log, .. } => {
                    return Ok(overlay(core.entries(), redo_log.entries()))
                }
                ShardState::SplitDone { left, right, .. } => {
                    (Some(Arc::clone(left)), Arc::clone(right))
                }
                ShardState::Retired { left, right } => {
                    (left.as_ref().map(|(_, s)| Arc::clone(s)), Arc::clone(right))
                }
            }
        };
        let mut out = match left {
            Some(left) => left.entries()?,
            None => Vec::new(),
        };
        out.extend(right.entries()?);
        Ok(out)
    }

    /// Synchronously write every mapping this shard owns to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        match &inner.state {
            ShardState::Closed => Err(Error::Closed),
            ShardState::Normal(core) => core.flush(),
            ShardState::Splitting {
                core,
                redo_log,
                left,
                right,
            } => {
                core.flush()?;
                redo_log.flush()?;
                left.flush()?;
                right.flush()
            }
            ShardState::SplitDone { core, left, right } => {
                core.flush()?;
                left.flush()?;
                right.flush()
            }
            // Both children are registered shards flushed on their own.
            ShardState::Retired { .. } => Ok(()),
        }
    }

    fn join_split_task(&self) -> Result<()> {
        let handle = self.split_task.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::ThreadPanic("split task panicked".into()))?;
        }
        Ok(())
    }

    /// Wait for a running split, flush and unmap. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let joined = self.join_split_task();

        let state = {
            let mut inner = self.inner.write();
            std::mem::replace(&mut inner.state, ShardState::Closed)
        };
        match state {
            ShardState::Closed | ShardState::Retired { .. } => {}
            ShardState::Normal(core) => core.flush()?,
            ShardState::Splitting {
                core,
                redo_log,
                left,
                right,
            } => {
                core.flush()?;
                redo_log.flush()?;
                left.close()?;
                right.close()?;
            }
            ShardState::SplitDone { core, left, right } => {
                core.flush()?;
                left.close()?;
                right.close()?;
            }
        }
        debug!("Closed shard {}", self.prefix().display());
        joined
    }

    /// Close and delete every file under this shard's prefix, split
    /// artifacts included. Children already handed to the router survive.
    pub fn destroy(&self) -> Result<()> {
        self.close()?;
        let prefix = self.prefix();
        for suffix in [SPLIT_LEFT_SUFFIX, SPLIT_RIGHT_SUFFIX, ""] {
            let base = suffixed(&prefix, suffix);
            remove_if_exists(&SkipList::meta_path(&base))?;
            remove_if_exists(&SkipList::data_path(&base))?;
        }
        remove_if_exists(&suffixed(&prefix, SPLIT_REDOLOG_SUFFIX))?;
        info!("Destroyed shard {}", prefix.display());
        Ok(())
    }

    /// Check the structural invariants of every skip list this shard owns.
    pub fn verify(&self) -> Result<()> {
        let (left, right) = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Closed => return Err(Error::Closed),
                ShardState::Normal(core) | ShardState::Splitting { core, .. } => {
                    return core.verify()
                }
                ShardState::SplitDone { core, left, right } => {
                    core.verify()?;
                    (Some(Arc::clone(left)), Arc::clone(right))
                }
                ShardState::Retired { left, right } => {
                    (left.as_ref().map(|(_, s)| Arc::clone(s)), Arc::clone(right))
                }
            }
        };
        right.verify()?;
        if let Some(left) = left {
            left.verify()?;
            let left_max = left.maximum_key()?;
            let right_min = right.entries()?.into_iter().next().map(|(k, _)| k);
            if let (Some(l), Some(r)) = (left_max, right_min) {
                if l >= r {
                    return Err(Error::Corrupted(format!(
                        "split children overlap: left ends at {:?}, right starts at {:?}",
                        l, r
                    )));
                }
            }
        }
        Ok(())
    }

    /// Free-space snapshot, or `None` when the shard is not eligible for
    /// defragmentation.
    pub fn fragmentation(&self) -> Option<Fragmentation> {
        let inner = self.inner.read();
        match &inner.state {
            ShardState::Normal(core) if !inner.defrag_running => Some(core.fragmentation()),
            _ => None,
        }
    }

    /// Mark the shard as defragmenting and take its data free list.
    /// Returns `None` when the shard is not `Normal` or has nothing to do.
    pub(crate) fn begin_compaction(&self) -> Option<CompactionPlan> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.defrag_running {
            return None;
        }
        let ShardState::Normal(core) = &mut inner.state else {
            return None;
        };
        let plan = core.plan_compaction();
        if plan.is_empty() {
            return None;
        }
        inner.defrag_running = true;
        Some(plan)
    }

    pub(crate) fn compact_run(&self, src: u64, len: u64, dst: u64) -> Result<()> {
        let mut inner = self.inner.write();
        match &mut inner.state {
            ShardState::Normal(core) => {
                core.relocate_run(src, len, dst);
                Ok(())
            }
            ShardState::Closed => Err(Error::Closed),
            state => Err(Error::InvalidState(format!(
                "compaction interrupted in state {:?}",
                state.status()
            ))),
        }
    }

    /// Slide appended data down, sweep entries freed meanwhile and clear
    /// the defragmenting flag. Returns the total bytes reclaimed.
    pub(crate) fn finish_compaction(&self, plan: &CompactionPlan) -> Result<u64> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.defrag_running = false;
        match &mut inner.state {
            ShardState::Normal(core) => {
                core.finish_compaction(plan);
                let swept = core.compact();
                Ok(plan.reclaimed() + swept)
            }
            ShardState::Closed => Err(Error::Closed),
            state => Err(Error::InvalidState(format!(
                "compaction finished in state {:?}",
                state.status()
            ))),
        }
    }

    pub(crate) fn abort_compaction(&self) {
        let mut inner = self.inner.write();
        if inner.defrag_running {
            warn!("Abandoning compaction of {}", inner.prefix.display());
            inner.defrag_running = false;
        }
    }

    pub fn is_defragmenting(&self) -> bool {
        self.inner.read().defrag_running
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_read() {
            Some(inner) => f
                .debug_struct("Shard")
                .field("prefix", &inner.prefix)
                .field("status", &inner.state.status())
                .field("role", &inner.role)
                .finish(),
            None => f.debug_struct("Shard").finish_non_exhaustive(),
        }
    }
}
