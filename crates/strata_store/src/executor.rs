//! Queue execution: merges and fetches.
//!
//! The executor is not a dedicated task; it registers with the shared
//! background pool and handles at most one queue entry per invocation.
//! Selected entries reserve their output name in `future_parts` for the
//! duration of the attempt, so concurrent pool workers never produce the
//! same part twice, and merge selection can see what is in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use strata_keeper::Op;

use crate::error::{ReplicationError, Result};
use crate::log_entry::{LogAction, LogEntry, QueueEntry};
use crate::metrics::{profile_events, ProfileEvents};
use crate::part::PartName;
use crate::pool::{BackgroundPool, PoolTask};
use crate::table::{peer_endpoint, TableCore};

/// The executor task registered with the background pool. Holds only a weak
/// reference so the pool never keeps a dropped table alive.
pub(crate) struct QueueTask {
    core: Weak<TableCore>,
}

impl QueueTask {
    pub(crate) fn new(core: Weak<TableCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl PoolTask for QueueTask {
    async fn run(&self, pool: &BackgroundPool) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        if core.shutdown_requested() {
            return false;
        }
        queue_task_step(&core, pool).await
    }
}

/// Scoped reservation of an output part name. Released on every exit path.
struct FuturePartTagger {
    core: Arc<TableCore>,
    name: String,
}

impl FuturePartTagger {
    fn tag(core: &Arc<TableCore>, name: &PartName) -> Self {
        let inserted = core.future_parts.lock().unwrap().insert(name.to_string());
        debug_assert!(inserted, "part {name} tagged twice");
        Self {
            core: core.clone(),
            name: name.to_string(),
        }
    }
}

impl Drop for FuturePartTagger {
    fn drop(&mut self) {
        self.core.future_parts.lock().unwrap().remove(&self.name);
    }
}

/// Whether `entry` may run right now, given the in-flight reservations.
fn should_execute(future_parts: &HashSet<String>, entry: &LogEntry) -> bool {
    if future_parts.contains(&entry.new_part_name().to_string()) {
        tracing::debug!(
            part = %entry.new_part_name(),
            "not executing log entry: another entry producing the same part is in flight"
        );
        return false;
    }
    if let LogAction::MergeParts { parts_to_merge, .. } = &entry.action {
        // An input being produced right now will be available shortly; wait
        // for it rather than degrading to a fetch of the merged result.
        for name in parts_to_merge {
            if future_parts.contains(&name.to_string()) {
                tracing::trace!(
                    part = %entry.new_part_name(),
                    input = %name,
                    "not merging: an input is not ready yet"
                );
                return false;
            }
        }
    }
    true
}

/// One executor invocation: pick the first executable entry, run it, and
/// settle the queue. Returns whether any work was attempted.
pub(crate) async fn queue_task_step(core: &Arc<TableCore>, pool: &BackgroundPool) -> bool {
    let selected = {
        let mut queue = core.queue.lock().await;
        let pos = {
            let future_parts = core.future_parts.lock().unwrap();
            queue
                .iter()
                .position(|qe| should_execute(&future_parts, &qe.entry))
        };
        pos.map(|pos| {
            let qe = queue.remove(pos).expect("selected position is in bounds");
            let tagger = FuturePartTagger::tag(core, qe.entry.new_part_name());
            (qe, tagger)
        })
    };
    let Some((queue_entry, tagger)) = selected else {
        return false;
    };

    match execute_entry(core, &queue_entry, pool).await {
        Ok(()) => {
            let path = core
                .paths
                .queue_entry(&core.replica_name, &queue_entry.znode_name);
            match core.keeper().try_remove(&path).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(node = %path, "queue node was already gone; ignoring");
                }
                Err(err) => {
                    tracing::error!(node = %path, error = %err, "could not remove queue node; ignoring");
                }
            }
            drop(tagger);
            true
        }
        Err(err) => {
            if err.is_benign() {
                tracing::info!(part = %queue_entry.entry.new_part_name(), "{err}");
            } else {
                tracing::error!(
                    part = %queue_entry.entry.new_part_name(),
                    error = %err,
                    "queue entry execution failed"
                );
            }
            // Release the reservation before the entry becomes selectable
            // again at the tail. The coordinator node stays.
            drop(tagger);
            core.queue.lock().await.push_back(queue_entry);
            false
        }
    }
}

async fn execute_entry(core: &Arc<TableCore>, qe: &QueueEntry, pool: &BackgroundPool) -> Result<()> {
    let entry = &qe.entry;
    let keeper = core.keeper();
    let new_name = entry.new_part_name();
    let own_get = !entry.is_merge() && entry.source_replica == core.replica_name;

    // A local cover known to the coordinator makes the entry a no-op.
    if let Some(containing) = core.data.containing_part(new_name, true) {
        if keeper
            .exists(&core.paths.part(&core.replica_name, &containing.name))
            .await?
        {
            if !own_get {
                tracing::debug!(part = %new_name, "skipping action: part already exists");
            }
            return Ok(());
        }
    }

    if own_get {
        // Anomalous but recoverable: our own insert's part vanished locally.
        tracing::warn!(part = %new_name, "part from own log does not exist locally");
    }

    let mut do_fetch = false;
    match &entry.action {
        LogAction::GetPart { .. } => do_fetch = true,
        LogAction::MergeParts { parts_to_merge, .. } => {
            let mut inputs = Vec::new();
            let mut have_all_parts = true;
            for name in parts_to_merge {
                match core.data.containing_part(name, false) {
                    None => {
                        have_all_parts = false;
                        break;
                    }
                    Some(part) if part.name != *name => {
                        tracing::error!(
                            wanted = %name,
                            covered_by = %part.name,
                            merging_into = %new_name,
                            "log and local part set look inconsistent"
                        );
                        have_all_parts = false;
                        break;
                    }
                    Some(part) => inputs.push(part),
                }
            }
            if !have_all_parts {
                tracing::debug!(part = %new_name, "do not have all merge inputs; will try to fetch the result");
                do_fetch = true;
            } else {
                let _big_merge_guards = inputs
                    .iter()
                    .any(|part| {
                        part.is_big(
                            core.schema.index_granularity,
                            core.settings.big_merge_threshold_bytes,
                        )
                    })
                    .then(|| {
                        (
                            pool.counter_guard("big merges"),
                            pool.counter_guard("replicated big merges"),
                        )
                    });

                let (merged, payload) = core.merger.merge_parts(&inputs, new_name)?;
                let staged = core.data.stage_part(merged.clone(), payload)?;
                let ops = core.check_part_and_add_ops(&merged).await?;
                keeper.multi(ops).await?;
                staged.commit()?;
                core.merge_selecting_event.notify_waiters();
                ProfileEvents::increment(&profile_events().replicated_part_merges);
            }
        }
    }

    if do_fetch {
        if let Err(err) = fetch_new_part(core, entry).await {
            // The inputs this entry would have produced are unobtainable
            // one by one; line the queue up to fetch the merged result
            // instead.
            reorder_after_failed_fetch(core, new_name).await;
            return Err(err);
        }
        if entry.is_merge() {
            ProfileEvents::increment(&profile_events().replicated_part_fetches_of_merged);
        }
    }
    Ok(())
}

async fn fetch_new_part(core: &Arc<TableCore>, entry: &LogEntry) -> Result<()> {
    let name = entry.new_part_name();
    let Some(replica) = core.find_replica_having_part(name, true).await? else {
        ProfileEvents::increment(&profile_events().replicated_part_failed_fetches);
        return Err(ReplicationError::NoReplicaHasPart(name.to_string()));
    };
    fetch_part(core, name, &replica).await
}

/// Fetch `name` from `replica`, register it (dropping records of parts it
/// supersedes) and commit it locally.
pub(crate) async fn fetch_part(core: &Arc<TableCore>, name: &PartName, replica: &str) -> Result<()> {
    tracing::debug!(part = %name, source = %replica, "fetching part");
    let keeper = core.keeper();
    let (host, port) = peer_endpoint(core, replica).await?;
    let (part, payload) = match core.fetcher.fetch_part(name, &host, port).await {
        Ok(fetched) => fetched,
        Err(err) => {
            ProfileEvents::increment(&profile_events().replicated_part_failed_fetches);
            return Err(err);
        }
    };

    let staged = core.data.stage_part(part.clone(), payload)?;
    let mut ops = core.check_part_and_add_ops(&part).await?;
    for old in core.data.active_parts_covered_by(&part.name) {
        ops.push(Op::remove(
            core.paths.part_checksums(&core.replica_name, &old.name),
        ));
        ops.push(Op::remove(core.paths.part(&core.replica_name, &old.name)));
    }
    keeper.multi(ops).await?;
    let replaced = staged.commit()?;
    core.merge_selecting_event.notify_waiters();

    for old in &replaced {
        tracing::debug!(part = %old.name, superseded_by = %part.name, "part rendered obsolete by fetch");
        ProfileEvents::increment(&profile_events().obsolete_replicated_parts);
    }
    ProfileEvents::increment(&profile_events().replicated_part_fetches);
    tracing::debug!(part = %name, source = %replica, "fetched part");
    Ok(())
}

async fn reorder_after_failed_fetch(core: &Arc<TableCore>, failed: &PartName) {
    let mut queue = core.queue.lock().await;
    reorder_entries(&mut queue, failed);
}

/// After failing to obtain `failed`, move every entry producing a sibling
/// merge input behind the merge entry that needs them, preserving their
/// relative order. The executor then tries the already-merged result first
/// instead of chasing inputs nobody may serve.
fn reorder_entries(queue: &mut VecDeque<QueueEntry>, failed: &PartName) {
    let merge_pos = queue.iter().position(|qe| {
        matches!(
            &qe.entry.action,
            LogAction::MergeParts { parts_to_merge, .. } if parts_to_merge.contains(failed)
        )
    });
    let Some(merge_pos) = merge_pos else {
        return;
    };
    let parts_for_merge: HashSet<PartName> = match &queue[merge_pos].entry.action {
        LogAction::MergeParts { parts_to_merge, .. } => parts_to_merge.iter().cloned().collect(),
        _ => unreachable!("position matched a merge entry"),
    };

    let drained: Vec<QueueEntry> = queue.drain(..).collect();
    let mut kept = VecDeque::with_capacity(drained.len());
    let mut moved = Vec::new();
    for (idx, qe) in drained.into_iter().enumerate() {
        if idx < merge_pos && parts_for_merge.contains(qe.entry.new_part_name()) {
            moved.push(qe);
        } else {
            kept.push_back(qe);
        }
    }
    kept.extend(moved);
    *queue = kept;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PartName {
        s.parse().unwrap()
    }

    fn get(name: &str, znode: &str) -> QueueEntry {
        QueueEntry {
            entry: LogEntry::get_part("r1", p(name)),
            znode_name: znode.to_string(),
        }
    }

    fn merge(inputs: &[&str], out: &str, znode: &str) -> QueueEntry {
        QueueEntry {
            entry: LogEntry::merge_parts(
                "r1",
                inputs.iter().map(|s| p(s)).collect(),
                p(out),
            ),
            znode_name: znode.to_string(),
        }
    }

    fn names(queue: &VecDeque<QueueEntry>) -> Vec<String> {
        queue.iter().map(|qe| qe.znode_name.clone()).collect()
    }

    #[test]
    fn failed_fetch_moves_merge_inputs_behind_the_merge() {
        // queue = [GET p2, MERGE p1+p2 -> p3]; GET p1 already popped and
        // failing. Expect [MERGE, GET p2]; the failed entry re-appends last.
        let mut queue: VecDeque<QueueEntry> = VecDeque::from(vec![
            get("202608_1_1_0", "queue-0000000001"),
            merge(
                &["202608_0_0_0", "202608_1_1_0"],
                "202608_0_1_1",
                "queue-0000000002",
            ),
        ]);
        reorder_entries(&mut queue, &p("202608_0_0_0"));
        assert_eq!(names(&queue), vec!["queue-0000000002", "queue-0000000001"]);
    }

    #[test]
    fn reorder_preserves_relative_order_of_moved_entries() {
        let mut queue: VecDeque<QueueEntry> = VecDeque::from(vec![
            get("202608_1_1_0", "queue-0000000001"),
            get("202608_9_9_0", "queue-0000000002"),
            get("202608_2_2_0", "queue-0000000003"),
            merge(
                &["202608_0_0_0", "202608_1_1_0", "202608_2_2_0"],
                "202608_0_2_1",
                "queue-0000000004",
            ),
            get("202608_7_7_0", "queue-0000000005"),
        ]);
        reorder_entries(&mut queue, &p("202608_0_0_0"));
        assert_eq!(
            names(&queue),
            vec![
                "queue-0000000002",
                "queue-0000000004",
                "queue-0000000005",
                "queue-0000000001",
                "queue-0000000003",
            ]
        );
    }

    #[test]
    fn reorder_without_matching_merge_is_a_no_op() {
        let mut queue: VecDeque<QueueEntry> = VecDeque::from(vec![
            get("202608_1_1_0", "queue-0000000001"),
            get("202608_2_2_0", "queue-0000000002"),
        ]);
        reorder_entries(&mut queue, &p("202608_0_0_0"));
        assert_eq!(names(&queue), vec!["queue-0000000001", "queue-0000000002"]);
    }

    #[test]
    fn tagged_output_blocks_same_part_and_merges_over_it() {
        let mut future = HashSet::new();
        future.insert("202608_0_0_0".to_string());

        let same_output = LogEntry::get_part("r1", p("202608_0_0_0"));
        assert!(!should_execute(&future, &same_output));

        let merge_over_it = LogEntry::merge_parts(
            "r1",
            vec![p("202608_0_0_0"), p("202608_1_1_0")],
            p("202608_0_1_1"),
        );
        assert!(!should_execute(&future, &merge_over_it));

        let unrelated = LogEntry::get_part("r1", p("202608_5_5_0"));
        assert!(should_execute(&future, &unrelated));
    }
}
