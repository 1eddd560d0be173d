//! Queue loading, log pulling, and log/part garbage collection.
//!
//! Every replica appends to its own durable log; every replica pulls all
//! peers' logs (its own included) into its private queue. Pulling merges the
//! logs by coordinator creation order, so all replicas observe one global
//! happens-before order regardless of which peer produced an entry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use strata_keeper::{CreateMode, Keeper, Op, OpResult};

use crate::error::Result;
use crate::log_entry::{LogEntry, QueueEntry};
use crate::paths::log_index;
use crate::table::TableCore;

/// Rebuild the in-memory queue from `queue/*`, registering every promised
/// part in the virtual-parts index.
pub(crate) async fn load_queue(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let mut queue = core.queue.lock().await;
    let mut children = keeper
        .children(&core.paths.queue_root(&core.replica_name))
        .await?;
    children.sort();
    for child in children {
        let Some(text) = keeper
            .try_get(&core.paths.queue_entry(&core.replica_name, &child))
            .await?
        else {
            continue;
        };
        let entry = LogEntry::parse(&text)?;
        core.virtual_parts
            .lock()
            .unwrap()
            .add(entry.new_part_name().clone());
        queue.push_back(QueueEntry {
            entry,
            znode_name: child,
        });
    }
    tracing::debug!(replica = %core.replica_name, entries = queue.len(), "loaded queue");
    Ok(())
}

#[derive(PartialEq, Eq)]
struct LogCursor {
    /// Coordinator creation timestamp of the entry; the merge key.
    czxid: u64,
    replica: String,
    index: u64,
    text: String,
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.czxid, &self.replica, self.index).cmp(&(other.czxid, &other.replica, other.index))
    }
}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

async fn read_log_entry(
    core: &TableCore,
    keeper: &Arc<dyn Keeper>,
    replica: &str,
    index: u64,
) -> Result<Option<(String, u64)>> {
    Ok(keeper
        .try_get_with_stat(&core.paths.log_entry(replica, index))
        .await?
        .map(|(text, stat)| (text, stat.czxid)))
}

/// Merge unread entries from every peer's log into the local queue, oldest
/// coordinator timestamp first. Each adoption atomically creates the queue
/// node and advances the matching log pointer, so a crash can duplicate
/// nothing and lose nothing.
pub(crate) async fn pull_logs_to_queue(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let mut queue = core.queue.lock().await;
    let me = &core.replica_name;

    let replicas = keeper.children(&core.paths.replicas()).await?;
    let mut heap: BinaryHeap<Reverse<LogCursor>> = BinaryHeap::new();
    for replica in replicas {
        let pointer_path = core.paths.log_pointer(me, &replica);
        let index = match keeper.try_get(&pointer_path).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => {
                // First contact with this peer's log: start at its oldest
                // surviving entry and persist the pointer immediately. This
                // is also how a peer acknowledges a bootstrapping replica.
                let mut entries = keeper.children(&core.paths.log_root(&replica)).await?;
                entries.sort();
                let index = entries.first().and_then(|name| log_index(name)).unwrap_or(0);
                keeper
                    .create(&pointer_path, &index.to_string(), CreateMode::Persistent)
                    .await?;
                index
            }
        };
        if let Some((text, czxid)) = read_log_entry(core, &keeper, &replica, index).await? {
            heap.push(Reverse(LogCursor {
                czxid,
                replica,
                index,
                text,
            }));
        }
    }

    let mut count = 0usize;
    while let Some(Reverse(cursor)) = heap.pop() {
        let entry = LogEntry::parse(&cursor.text)?;
        let results = keeper
            .multi(vec![
                Op::create(
                    core.paths.queue_seq_prefix(me),
                    cursor.text.clone(),
                    CreateMode::PersistentSequential,
                ),
                Op::set_data(
                    core.paths.log_pointer(me, &cursor.replica),
                    (cursor.index + 1).to_string(),
                ),
            ])
            .await?;
        let znode_name = match &results[0] {
            OpResult::Created { path } => path.rsplit('/').next().unwrap_or_default().to_string(),
            _ => unreachable!("first multi op is a create"),
        };
        core.virtual_parts
            .lock()
            .unwrap()
            .add(entry.new_part_name().clone());
        queue.push_back(QueueEntry { entry, znode_name });
        count += 1;

        let next = cursor.index + 1;
        if let Some((text, czxid)) = read_log_entry(core, &keeper, &cursor.replica, next).await? {
            heap.push(Reverse(LogCursor {
                czxid,
                replica: cursor.replica,
                index: next,
                text,
            }));
        }
    }
    drop(queue);

    if count > 0 {
        core.wake_queue_task().await;
        tracing::debug!(replica = %core.replica_name, count, "pulled log entries to queue");
    }
    Ok(())
}

/// Periodic task: pull logs, drop superseded parts past their grace period,
/// and truncate the own log once in a while.
pub(crate) async fn queue_updating_task(core: Arc<TableCore>) {
    let mut last_log_cleanup = Instant::now();
    while !core.shutdown_requested() {
        let cleanup_due = last_log_cleanup.elapsed() >= core.settings.cleanup_period;
        let result: Result<()> = async {
            pull_logs_to_queue(&core).await?;
            clear_old_parts(&core).await?;
            if cleanup_due {
                clear_old_logs(&core).await?;
            }
            Ok(())
        }
        .await;
        if cleanup_due {
            last_log_cleanup = Instant::now();
        }
        if let Err(err) = result {
            tracing::warn!(replica = %core.replica_name, error = %err, "queue update iteration failed");
        }
        core.interruptible_sleep(core.settings.queue_update_period).await;
    }
}

/// Drop local parts superseded long enough ago, removing their coordinator
/// records best-effort.
pub(crate) async fn clear_old_parts(core: &Arc<TableCore>) -> Result<()> {
    let dropped = core.data.clear_old_parts(core.settings.old_parts_lifetime)?;
    if dropped.is_empty() {
        return Ok(());
    }
    let keeper = core.keeper();
    for name in &dropped {
        let ops = vec![
            Op::remove(core.paths.part_checksums(&core.replica_name, name)),
            Op::remove(core.paths.part(&core.replica_name, name)),
        ];
        if let Err(err) = keeper.multi(ops).await {
            tracing::debug!(part = %name, error = %err, "could not remove old part from the coordinator");
        }
    }
    tracing::debug!(count = dropped.len(), "removed old parts");
    Ok(())
}

/// Truncate the own log below the minimum of every peer's pointer into it.
/// If any peer has no pointer for us yet, nothing may be trimmed.
pub(crate) async fn clear_old_logs(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let replicas = keeper.children(&core.paths.replicas()).await?;
    let mut min_pointer = u64::MAX;
    for replica in replicas {
        let pointer_path = core.paths.log_pointer(&replica, &core.replica_name);
        match keeper.try_get(&pointer_path).await? {
            Some(raw) => min_pointer = min_pointer.min(raw.parse().unwrap_or(0)),
            None => return Ok(()),
        }
    }

    let log_root = core.paths.log_root(&core.replica_name);
    let mut entries = keeper.children(&log_root).await?;
    entries.sort();
    let mut removed = 0usize;
    for entry in entries {
        let Some(index) = log_index(&entry) else {
            continue;
        };
        if index >= min_pointer {
            break;
        }
        keeper.remove(&format!("{log_root}/{entry}")).await?;
        removed += 1;
    }
    if removed > 0 {
        tracing::debug!(removed, "removed old log entries");
    }
    Ok(())
}
