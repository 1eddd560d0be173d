//! Startup reconciliation of local parts against the coordinator.
//!
//! Runs once per session, after the replica registers and before the queue
//! loads. Four classes of disagreement can exist after a crash or missed
//! session: local parts the coordinator does not know (unexpected), known
//! parts missing locally but covered by a local part (the cover is
//! registered, the covered names become obsolete), known parts missing
//! without a cover (re-fetched), and nothing else. Large disagreements abort
//! unless the operator planted the force-restore flag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use strata_keeper::{CreateMode, Op};

use crate::error::{ReplicationError, Result};
use crate::log_entry::LogEntry;
use crate::part::PartName;
use crate::store::Part;
use crate::table::TableCore;

pub(crate) async fn check_parts(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let me = &core.replica_name;

    let mut expected: HashSet<PartName> = HashSet::new();
    for name in keeper.children(&core.paths.parts(me)).await? {
        expected.insert(name.parse()?);
    }
    let local_parts = core.data.all_parts();

    // Local parts the coordinator does not know about.
    let mut unexpected: HashMap<String, Arc<Part>> = HashMap::new();
    for part in &local_parts {
        if !expected.remove(&part.name) {
            unexpected.insert(part.name.to_string(), part.clone());
        }
    }

    // `expected` now holds names missing locally. A covering local part
    // resolves a missing name; if the cover itself was unexpected it gets
    // registered instead. Names with no cover must be fetched again.
    let mut parts_to_add: Vec<Arc<Part>> = Vec::new();
    let mut parts_to_fetch: Vec<PartName> = Vec::new();
    for missing in &expected {
        match local_parts.iter().find(|part| part.name.covers(missing)) {
            Some(cover) => {
                tracing::error!(
                    missing = %missing,
                    covered_by = %cover.name,
                    "ignoring missing local part: a covering part exists"
                );
                if unexpected.remove(&cover.name.to_string()).is_some() {
                    parts_to_add.push(cover.clone());
                }
            }
            None => parts_to_fetch.push(missing.clone()),
        }
    }
    for name in &parts_to_fetch {
        expected.remove(name);
    }
    // What remains in `expected` is covered locally and merely stale in the
    // coordinator.
    let obsolete: Vec<PartName> = expected.into_iter().collect();

    let mut skip_sanity_check = false;
    let flag = core.paths.force_restore_flag(me);
    if keeper.exists(&flag).await? {
        // Operator override; consumed on use.
        skip_sanity_check = true;
        keeper.try_remove(&flag).await?;
    }

    let report = format!(
        "{} unexpected parts, {} unexpectedly merged parts, {} obsolete parts, {} missing parts",
        unexpected.len(),
        parts_to_add.len(),
        obsolete.len(),
        parts_to_fetch.len()
    );
    let insane = parts_to_add.len() > core.settings.max_covered_unexpected_parts
        || unexpected.len() > core.settings.max_unexpected_parts
        || obsolete.len() > core.settings.max_obsolete_parts
        || parts_to_fetch.len() > core.settings.max_missing_parts;
    if skip_sanity_check {
        tracing::warn!(%report, flag = %flag, "skipping the limits on severity of part changes");
    } else if insane {
        return Err(ReplicationError::TooManyUnexpectedParts(report));
    }

    for part in &parts_to_add {
        tracing::error!(part = %part.name, "registering unexpected local part in the coordinator");
        let ops = core.check_part_and_add_ops(part).await?;
        keeper.multi(ops).await?;
    }

    for name in &obsolete {
        tracing::error!(part = %name, "removing unexpectedly merged part from the coordinator");
        keeper
            .multi(vec![
                Op::remove(core.paths.part_checksums(me, name)),
                Op::remove(core.paths.part(me, name)),
            ])
            .await?;
    }

    for name in &parts_to_fetch {
        tracing::error!(part = %name, "removing missing part from the coordinator and queueing a fetch");
        let entry = LogEntry::get_part("", name.clone());
        // This runs before the queue loads, so the new queue node is picked
        // up by the same startup.
        keeper
            .multi(vec![
                Op::remove(core.paths.part_checksums(me, name)),
                Op::remove(core.paths.part(me, name)),
                Op::create(
                    core.paths.queue_seq_prefix(me),
                    entry.to_text(),
                    CreateMode::PersistentSequential,
                ),
            ])
            .await?;
    }

    for part in unexpected.values() {
        tracing::error!(part = %part.name, "renaming unexpected local part aside");
        core.data.rename_and_detach(&part.name, "ignored_")?;
    }
    Ok(())
}
