//! Leader-only housekeeping: merge selection and dedup-window cleanup.
//!
//! Leadership is advisory. A merge entry appended by a stale leader is
//! harmless (peers execute it like any other), so nothing here ever tries to
//! rescind a proposal; losing the lease just stops the loops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use strata_keeper::{AbandonableLock, CreateMode, LockState, Op};

use crate::error::{ReplicationError, Result};
use crate::log_entry::{LogAction, LogEntry};
use crate::queue;
use crate::store::{MergePredicate, Part};
use crate::table::TableCore;

/// Election callback: mark leadership and start the two leader loops.
pub(crate) fn become_leader(core: &Arc<TableCore>) {
    tracing::info!(replica = %core.replica_name, "became leader");
    core.is_leader.store(true, Ordering::SeqCst);
    let mut tasks = core.leader_tasks.lock().unwrap();
    tasks.push(tokio::spawn(merge_selecting_task(core.clone())));
    tasks.push(tokio::spawn(clear_old_blocks_task(core.clone())));
}

/// Admission control for one candidate pair, checked against the live
/// coordinator state.
struct CoordinatedMergePredicate<'a> {
    core: &'a Arc<TableCore>,
}

#[async_trait]
impl MergePredicate for CoordinatedMergePredicate<'_> {
    async fn can_merge(&self, left: &Part, right: &Part) -> bool {
        let core = self.core;

        // Parts already promised to another merge are not their own cover.
        {
            let virtual_parts = core.virtual_parts.lock().unwrap();
            if virtual_parts.containing_part(&left.name).as_ref() != Some(&left.name)
                || virtual_parts.containing_part(&right.name).as_ref() != Some(&right.name)
            {
                return false;
            }
        }

        let keeper = core.keeper();
        let me = &core.replica_name;
        let known = async {
            Ok::<bool, ReplicationError>(
                keeper.exists(&core.paths.part(me, &left.name)).await?
                    && keeper.exists(&core.paths.part(me, &right.name)).await?,
            )
        }
        .await;
        if !matches!(known, Ok(true)) {
            return false;
        }

        // Every number in the gap must be a provably dead allocation.
        let month = &left.name.month;
        for number in (left.name.right + 1)..right.name.left {
            let path = core.paths.block_number(month, number);
            match AbandonableLock::check(keeper.as_ref(), &path).await {
                Ok(LockState::Abandoned) => {}
                Ok(_) => {
                    tracing::debug!(
                        left = %left.name,
                        right = %right.name,
                        block = %path,
                        "cannot merge: intervening block number is not abandoned"
                    );
                    return false;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "block number check failed");
                    return false;
                }
            }
        }
        true
    }
}

/// Leader loop: propose merges while the queue has room, then doze until a
/// part commit or the period wakes it.
async fn merge_selecting_task(core: Arc<TableCore>) {
    if let Err(err) = queue::pull_logs_to_queue(&core).await {
        tracing::warn!(error = %err, "log pull before merge selection failed");
    }
    while !core.shutdown_requested() && core.leading() {
        let success = match select_and_propose_merge(&core).await {
            Ok(success) => success,
            Err(err) => {
                tracing::warn!(replica = %core.replica_name, error = %err, "merge selection failed");
                false
            }
        };
        if core.shutdown_requested() || !core.leading() {
            break;
        }
        if !success {
            tokio::select! {
                _ = core.merge_selecting_event.notified() => {}
                _ = core.shutdown_event.notified() => {}
                _ = tokio::time::sleep(core.settings.merge_selecting_period) => {}
            }
        }
    }
}

async fn select_and_propose_merge(core: &Arc<TableCore>) -> Result<bool> {
    let keeper = core.keeper();

    let mut merges_queued = 0usize;
    let mut has_big_merge = core.pool.get_counter("replicated big merges") > 0;
    {
        let queue = core.queue.lock().await;
        for qe in queue.iter() {
            let LogAction::MergeParts { parts_to_merge, .. } = &qe.entry.action else {
                continue;
            };
            merges_queued += 1;
            if has_big_merge {
                continue;
            }
            for name in parts_to_merge {
                let Some(part) = core.data.containing_part(name, false) else {
                    continue;
                };
                if part.name == *name
                    && part.is_big(
                        core.schema.index_granularity,
                        core.settings.big_merge_threshold_bytes,
                    )
                {
                    has_big_merge = true;
                    break;
                }
            }
        }
    }
    if merges_queued >= core.settings.max_replicated_merges_in_queue {
        tracing::trace!(merges_queued, "merge queue is full");
        return Ok(false);
    }

    let predicate = CoordinatedMergePredicate { core };
    let mut selected = core
        .merger
        .select_parts_to_merge(&predicate, false, has_big_merge)
        .await;
    if selected.is_none() {
        selected = core
            .merger
            .select_parts_to_merge(&predicate, true, has_big_merge)
            .await;
    }
    let Some((parts, new_name)) = selected else {
        return Ok(false);
    };

    let entry = LogEntry::merge_parts(
        core.replica_name.clone(),
        parts.iter().map(|p| p.name.clone()).collect(),
        new_name.clone(),
    );
    keeper
        .create(
            &core.paths.log_seq_prefix(&core.replica_name),
            &entry.to_text(),
            CreateMode::PersistentSequential,
        )
        .await?;
    tracing::debug!(new_part = %new_name, inputs = parts.len(), "proposed merge");

    // The new entry must reach the virtual-parts index before the next
    // selection pass, or the same parts would be picked again.
    queue::pull_logs_to_queue(core).await?;

    // The dead allocations inside the merged range are no longer needed to
    // prove anything.
    let month = &parts[0].name.month;
    for pair in parts.windows(2) {
        for number in (pair[0].name.right + 1)..pair[1].name.left {
            let _ = keeper
                .try_remove(&core.paths.block_number(month, number))
                .await;
        }
    }
    Ok(true)
}

/// Leader loop: bound the deduplication window.
async fn clear_old_blocks_task(core: Arc<TableCore>) {
    while !core.shutdown_requested() && core.leading() {
        if let Err(err) = clear_old_blocks(&core).await {
            tracing::warn!(replica = %core.replica_name, error = %err, "dedup window cleanup failed");
        }
        // Doze for the cleanup period, checking leadership every second.
        let deadline = Instant::now() + core.settings.cleanup_period;
        loop {
            if core.shutdown_requested() || !core.leading() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let step = (deadline - now).min(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = core.shutdown_event.notified() => return,
            }
        }
    }
}

/// Trim `/blocks` down to the deduplication window, oldest first. Inserts
/// older than the window lose duplicate protection; that is the documented
/// contract of the window.
pub(crate) async fn clear_old_blocks(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let blocks_path = core.paths.blocks();
    let Some(stat) = keeper.stat(&blocks_path).await? else {
        return Err(ReplicationError::Storage(format!(
            "{blocks_path} does not exist"
        )));
    };

    let window = core.settings.replicated_deduplication_window;
    // Amortize the stat calls: act only after 1.1x the window accumulated.
    if (stat.num_children as f64) < window as f64 * 1.1 {
        return Ok(());
    }
    tracing::trace!(
        about = stat.num_children.saturating_sub(window),
        "clearing old blocks"
    );

    let blocks = keeper.children(&blocks_path).await?;
    let mut timed_blocks: Vec<(u64, String)> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(stat) = keeper.stat(&core.paths.block(&block)).await? {
            timed_blocks.push((stat.czxid, block));
        }
    }
    // Newest first; everything beyond the window goes.
    timed_blocks.sort_by(|a, b| b.cmp(a));
    let mut cleared = 0usize;
    for (_, block) in timed_blocks.iter().skip(window) {
        keeper
            .multi(vec![
                Op::remove(core.paths.block_number_field(block)),
                Op::remove(core.paths.block_checksums_field(block)),
                Op::remove(core.paths.block(block)),
            ])
            .await?;
        cleared += 1;
    }
    if cleared > 0 {
        tracing::debug!(cleared, "cleared old deduplication blocks");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::part::PartName;

    #[test]
    fn gap_range_between_adjacent_parts_is_empty() {
        let left: PartName = "202608_0_3_1".parse().unwrap();
        let right: PartName = "202608_4_6_1".parse().unwrap();
        let gap: Vec<u64> = ((left.right + 1)..right.left).collect();
        assert!(gap.is_empty());

        let far: PartName = "202608_9_9_0".parse().unwrap();
        let gap: Vec<u64> = ((left.right + 1)..far.left).collect();
        assert_eq!(gap, vec![4, 5, 6, 7, 8]);
    }
}
