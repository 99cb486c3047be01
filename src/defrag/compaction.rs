use crate::config::DefragConfig;
use crate::error::Result;
use crate::shard::Shard;
use crate::skiplist::Fragmentation;
use std::sync::Arc;
use tracing::debug;

/// Whether a shard's free space is worth a compaction pass.
pub fn qualifies(frag: &Fragmentation, config: &DefragConfig) -> bool {
    frag.income > config.min_income
        && (frag.income > config.max_income || frag.cost() > config.min_cost)
}

/// Highest-cost qualifying shard. Shards that are splitting, split or
/// already defragmenting report no fragmentation and are skipped; ties go to
/// the earlier shard.
pub fn select_candidate(
    shards: &[Arc<Shard>],
    config: &DefragConfig,
) -> Option<(Arc<Shard>, Fragmentation)> {
    let mut best: Option<(Arc<Shard>, Fragmentation)> = None;
    for shard in shards {
        let Some(frag) = shard.fragmentation() else {
            continue;
        };
        if !qualifies(&frag, config) {
            continue;
        }
        let better = match &best {
            None => true,
            Some((_, current)) => frag.cost() > current.cost(),
        };
        if better {
            best = Some((Arc::clone(shard), frag));
        }
    }
    best
}

/// Compact one shard's data region, one exclusive-lock section per moved
/// run. Returns the bytes reclaimed.
pub fn compact_shard(shard: &Shard) -> Result<u64> {
    let Some(plan) = shard.begin_compaction() else {
        return Ok(0);
    };
    let moves = plan.moves();
    debug!(
        "Compacting {}: {} holes, {} bytes",
        shard.prefix().display(),
        moves.len(),
        plan.reclaimed()
    );

    for (src, len, dst) in moves {
        if let Err(e) = shard.compact_run(src, len, dst) {
            shard.abort_compaction();
            return Err(e);
        }
    }
    shard.finish_compaction(&plan)
}
