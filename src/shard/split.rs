//! Online split: drain a full shard into two children while new writes
//! collect in a redo log, then hand the children to the router.

use super::{Role, Shard, ShardInner, ShardState};
use crate::error::{Error, Result};
use crate::router::{ShardRouter, SplitBoundary};
use crate::skiplist::{
    suffixed, RedoLog, RedoRecord, SPLIT_LEFT_SUFFIX, SPLIT_REDOLOG_SUFFIX, SPLIT_RIGHT_SUFFIX,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Entries copied per shared-lock section while draining.
const DRAIN_BATCH: usize = 256;

impl Shard {
    /// Switch a full `Normal` shard to `Splitting`, recording the put that
    /// did not fit, and start the drain thread.
    pub(super) fn begin_split(&self, inner: &mut ShardInner, key: &[u8], value: u64) -> Result<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::InvalidState("split of a dropped shard".into()))?;
        let router = self.router.lock().clone();
        let prefix = inner.prefix.clone();
        let config = &inner.config;

        let mut redo_log = RedoLog::create(
            suffixed(&prefix, SPLIT_REDOLOG_SUFFIX),
            config.redo_log_capacity,
            config.probability,
            config.seed,
        )?;
        let left_prefix = suffixed(&prefix, SPLIT_LEFT_SUFFIX);
        let right_prefix = suffixed(&prefix, SPLIT_RIGHT_SUFFIX);
        let children = Self::create_child(&left_prefix, config, router.clone())
            .and_then(|left| match Self::create_child(&right_prefix, config, router) {
                Ok(right) => Ok((left, right)),
                Err(e) => {
                    discard_child(&left);
                    Err(e)
                }
            })
            .and_then(|children| redo_log.put(key, value).map(|_| children));
        let (left, right) = match children {
            Ok(children) => children,
            Err(e) => {
                discard_redo_log(redo_log, &prefix);
                return Err(e);
            }
        };

        // The thread blocks on the shard lock until this section ends.
        let handle = thread::Builder::new()
            .name("skipdb-split".into())
            .spawn(move || me.run_split());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                discard_child(&left);
                discard_child(&right);
                discard_redo_log(redo_log, &prefix);
                return Err(e.into());
            }
        };

        let core = match std::mem::replace(&mut inner.state, ShardState::Closed) {
            ShardState::Normal(core) => core,
            other => {
                inner.state = other;
                return Err(Error::InvalidState("split started outside Normal".into()));
            }
        };
        inner.state = ShardState::Splitting {
            core,
            redo_log,
            left,
            right,
        };
        *self.split_task.lock() = Some(handle);

        info!("Splitting shard {}", prefix.display());
        Ok(())
    }

    /// Drain, replay and complete the split, falling back to `Normal` when
    /// any step fails.
    pub(super) fn run_split(&self) {
        let started = Instant::now();
        // Captured up front: once SplitDone is visible a cutover may hold the
        // write lock while joining this thread.
        let prefix = self.prefix();
        let result = self.drain().and_then(|copied| self.finish_split().map(|_| copied));
        match result {
            Ok(copied) => info!(
                "Split of {} done: {} entries copied in {:?}",
                prefix.display(),
                copied,
                started.elapsed()
            ),
            Err(Error::Closed) => warn!("Shard {} closed during split", prefix.display()),
            Err(e) => {
                error!("Split of {} failed: {}", prefix.display(), e);
                self.abort_split();
            }
        }
    }

    /// Copy the first half of the entries (by count) into the left child and
    /// the rest into the right one, a batch per shared-lock section.
    fn drain(&self) -> Result<u64> {
        let (left, right, total) = {
            let inner = self.inner.read();
            match &inner.state {
                ShardState::Splitting {
                    core, left, right, ..
                } => (Arc::clone(left), Arc::clone(right), core.len()),
                ShardState::Closed => return Err(Error::Closed),
                _ => return Err(Error::InvalidState("drain outside a split".into())),
            }
        };

        let half = total / 2;
        let mut copied = 0u64;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let batch = {
                let inner = self.inner.read();
                match &inner.state {
                    ShardState::Splitting { core, .. } => {
                        core.scan_after(cursor.as_deref(), DRAIN_BATCH)
                    }
                    ShardState::Closed => return Err(Error::Closed),
                    _ => return Err(Error::InvalidState("drain outside a split".into())),
                }
            };
            let Some((last, _)) = batch.last() else {
                break;
            };
            cursor = Some(last.clone());

            for (key, value) in &batch {
                let target = if copied < half { &left } else { &right };
                target.put(key, *value)?;
                copied += 1;
            }
            debug!("Drained {}/{} entries", copied, total);
        }
        Ok(copied)
    }

    /// Replay the redo log into the children under the exclusive lock and
    /// move to `SplitDone`.
    fn finish_split(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match &inner.state {
            ShardState::Splitting {
                redo_log,
                left,
                right,
                ..
            } => {
                let replayed = replay(redo_log, left, right)?;
                debug!("Replayed {} redo records", replayed);
            }
            ShardState::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState("split finished twice".into())),
        }

        match std::mem::replace(&mut inner.state, ShardState::Closed) {
            ShardState::Splitting {
                core,
                redo_log,
                left,
                right,
            } => {
                if let Err(e) = redo_log.destroy() {
                    warn!("Could not remove redo log of {}: {}", inner.prefix.display(), e);
                }
                inner.state = ShardState::SplitDone { core, left, right };
                Ok(())
            }
            other => {
                inner.state = other;
                Err(Error::InvalidState("split finished twice".into()))
            }
        }
    }

    /// Return to `Normal`: fold the redo log into the parent and drop the
    /// children. If even that fails the shard stays `Splitting` so writes
    /// keep landing in the redo log.
    fn abort_split(&self) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if !matches!(inner.state, ShardState::Splitting { .. }) {
            return;
        }
        let ShardState::Splitting {
            core,
            redo_log,
            left,
            right,
        } = std::mem::replace(&mut inner.state, ShardState::Closed)
        else {
            return;
        };

        let mut core = core;
        let mut restored = Ok(());
        for (key, record) in redo_log.entries() {
            let applied = match record {
                RedoRecord::Live(value) => core.insert(&key, value, true).map(|_| ()),
                RedoRecord::Tombstone => core.remove(&key).map(|_| ()),
            };
            if let Err(e) = applied {
                restored = Err(e);
                break;
            }
        }

        if let Err(e) = restored {
            error!(
                "Could not fold redo log back into {}: {}",
                inner.prefix.display(),
                e
            );
            inner.state = ShardState::Splitting {
                core,
                redo_log,
                left,
                right,
            };
            return;
        }

        discard_child(&left);
        discard_child(&right);
        discard_redo_log(redo_log, &inner.prefix);
        inner.state = ShardState::Normal(core);
        info!("Split of {} rolled back", inner.prefix.display());
    }

    /// Hand a completed split to the router, if one is attached.
    pub(super) fn try_cutover(&self, inner: &mut ShardInner) {
        let router = self.router.lock().as_ref().and_then(|r| r.upgrade());
        let Some(router) = router else {
            return;
        };
        if let Err(e) = self.cutover(inner, router.as_ref()) {
            error!("Cutover of {} failed: {}", inner.prefix.display(), e);
        }
    }

    fn cutover(&self, inner: &mut ShardInner, router: &dyn ShardRouter) -> Result<()> {
        self.join_split_task()?;

        let (old_max_key, left, right) = match &inner.state {
            ShardState::SplitDone { core, left, right } => {
                (core.max_key(), Arc::clone(left), Arc::clone(right))
            }
            _ => return Err(Error::InvalidState("cutover outside SplitDone".into())),
        };
        let retired = self
            .me
            .upgrade()
            .ok_or_else(|| Error::InvalidState("cutover of a dropped shard".into()))?;

        let left_entry = match left.maximum_key()? {
            Some(max) => {
                left.promote(&router.allocate_prefix()?)?;
                Some((max, Arc::clone(&left)))
            }
            None => None,
        };
        right.promote(&router.allocate_prefix()?)?;

        router.insert_boundary(SplitBoundary {
            retired,
            old_max_key,
            left: left_entry.clone(),
            right_max_key: right.maximum_key()?,
            right: Arc::clone(&right),
        })?;

        let state = std::mem::replace(
            &mut inner.state,
            ShardState::Retired {
                left: left_entry.clone(),
                right: Arc::clone(&right),
            },
        );
        if left_entry.is_none() {
            if let Err(e) = left.destroy() {
                warn!("Could not remove empty split child: {}", e);
            }
        }
        if let ShardState::SplitDone { core, .. } = state {
            if let Err(e) = core.remove_files() {
                warn!("Could not remove files of {}: {}", inner.prefix.display(), e);
            }
        }

        info!(
            "Retired shard {} in favour of {}{}",
            inner.prefix.display(),
            match &left_entry {
                Some((_, l)) => format!("{} and ", l.prefix().display()),
                None => String::new(),
            },
            right.prefix().display()
        );
        Ok(())
    }

    /// Rename a split child to its permanent prefix and let it split on its
    /// own from now on.
    pub(crate) fn promote(&self, prefix: &Path) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match &mut inner.state {
            ShardState::Normal(core) => core.rename(prefix)?,
            ShardState::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState("only a Normal shard can be promoted".into())),
        }
        debug!("Promoted {} to {}", inner.prefix.display(), prefix.display());
        inner.prefix = prefix.to_path_buf();
        inner.role = Role::Primary;
        Ok(())
    }
}

fn discard_child(child: &Shard) {
    if let Err(e) = child.destroy() {
        warn!("Could not remove split child {}: {}", child.prefix().display(), e);
    }
}

fn discard_redo_log(redo_log: RedoLog, prefix: &Path) {
    if let Err(e) = redo_log.destroy() {
        warn!("Could not remove redo log of {}: {}", prefix.display(), e);
    }
}

/// Route every redo record to the child owning it. Returns the number of
/// records applied.
fn replay(redo_log: &RedoLog, left: &Arc<Shard>, right: &Arc<Shard>) -> Result<usize> {
    let entries = redo_log.entries();
    for (key, record) in &entries {
        let target = super::route_split(left, right, key)?;
        match record {
            RedoRecord::Live(value) => target.put(key, *value)?,
            RedoRecord::Tombstone => target.delete(key)?,
        }
    }
    Ok(entries.len())
}
