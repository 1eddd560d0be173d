//! The replicated write path.
//!
//! Each block insert allocates a block number under an abandonable lock,
//! stages a level-0 part locally, then commits one atomic multi carrying the
//! deduplication records (when the caller supplied an insert id), the part
//! registration, a `get` entry appended to the replica's own log, and the
//! lock release. Peers pick the entry up from the log and fetch the part;
//! the writing replica itself resolves it as a no-op.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use strata_keeper::{AbandonableLock, CreateMode, KeeperError, Op};

use crate::error::{ReplicationError, Result};
use crate::log_entry::LogEntry;
use crate::part::PartName;
use crate::store::{payload_checksum, Part};
use crate::table::TableCore;

/// One block of rows to insert.
#[derive(Clone, Debug)]
pub struct Block {
    /// Month bucket the rows belong to, `YYYYMM`.
    pub month: String,
    pub rows: u64,
    pub payload: Bytes,
    /// Client-assigned identity for at-most-once insertion. Duplicate ids
    /// inside the deduplication window are dropped silently; outside the
    /// window they are inserted again.
    pub insert_id: Option<String>,
}

/// Writes blocks into one replicated table.
pub struct BlockWriter {
    core: Arc<TableCore>,
}

impl BlockWriter {
    pub(crate) fn new(core: Arc<TableCore>) -> Self {
        Self { core }
    }

    pub async fn write(&self, block: Block) -> Result<()> {
        let core = &self.core;
        if core.is_read_only.load(Ordering::SeqCst) {
            return Err(ReplicationError::TableReadOnly);
        }
        // Writers share this lock; the supervisor takes it exclusively while
        // swapping coordinator sessions.
        let _alter = core.alter_lock.read().await;
        let keeper = core.keeper();
        let checksum = payload_checksum(&block.payload);

        if let Some(id) = &block.insert_id {
            if let Some(existing) = keeper
                .try_get(&core.paths.block_checksums_field(id))
                .await?
            {
                if existing == checksum {
                    tracing::debug!(insert_id = %id, "block is a duplicate of one already inserted; ignoring");
                    return Ok(());
                }
                return Err(ReplicationError::DuplicateInsertId(id.clone()));
            }
        }

        let month_path = core.paths.block_numbers_month(&block.month);
        if !keeper.exists(&month_path).await? {
            match keeper.create(&month_path, "", CreateMode::Persistent).await {
                Ok(_) | Err(KeeperError::NodeExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let token = format!(
            "{}-{}",
            core.active_node_identifier,
            core.block_token_seq.fetch_add(1, Ordering::SeqCst)
        );
        let lock = AbandonableLock::acquire(
            keeper.clone(),
            &core.paths.temp(),
            &core.paths.block_number_seq_prefix(&block.month),
            &token,
        )
        .await?;
        let number = lock.number();

        let name = PartName::new(block.month.clone(), number, number, 0);
        let part = Part {
            name: name.clone(),
            rows: block.rows,
            bytes: block.payload.len() as u64,
            checksum: checksum.clone(),
        };
        let staged = core.data.stage_part(part.clone(), block.payload.clone())?;

        let mut ops = Vec::new();
        if let Some(id) = &block.insert_id {
            ops.push(Op::create(core.paths.block(id), "", CreateMode::Persistent));
            ops.push(Op::create(
                core.paths.block_number_field(id),
                number.to_string(),
                CreateMode::Persistent,
            ));
            ops.push(Op::create(
                core.paths.block_checksums_field(id),
                checksum.clone(),
                CreateMode::Persistent,
            ));
        }
        ops.extend(core.check_part_and_add_ops(&part).await?);
        let entry = LogEntry::get_part(core.replica_name.clone(), name.clone());
        ops.push(Op::create(
            core.paths.log_seq_prefix(&core.replica_name),
            entry.to_text(),
            CreateMode::PersistentSequential,
        ));
        ops.extend(lock.unlock_ops());

        if let Err(err) = keeper.multi(ops).await {
            // The staged part is discarded and the number abandoned; the
            // gap it leaves is provably empty.
            lock.abandon().await;
            return Err(err.into());
        }
        lock.committed();
        staged.commit()?;
        core.merge_selecting_event.notify_waiters();
        tracing::debug!(part = %name, rows = block.rows, "wrote block");
        Ok(())
    }
}
