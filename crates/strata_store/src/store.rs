//! Local part store and merger.
//!
//! Parts live in two fjall partitions: payload bytes keyed by part name, and
//! a JSON metadata row per part. New parts are staged under a `tmp_` key
//! prefix and only renamed active by an explicit commit, so a coordinator
//! multi that fails between staging and commit leaves no trace. Superseded
//! parts stay behind inactive for a grace period before `clear_old_parts`
//! drops them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};
use crate::part::PartName;

const TMP_PREFIX: &str = "tmp_";

/// One immutable columnar part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub name: PartName,
    pub rows: u64,
    pub bytes: u64,
    /// Hex crc32 of the payload; also the value of the part's `checksums`
    /// node in the coordinator.
    pub checksum: String,
}

impl Part {
    /// Big-merge heuristic: the product of row count and index granularity.
    pub fn is_big(&self, index_granularity: u64, threshold_bytes: u64) -> bool {
        self.rows.saturating_mul(index_granularity) > threshold_bytes
    }
}

pub fn payload_checksum(payload: &[u8]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    format!("{:08x}", hasher.finalize())
}

#[derive(Serialize, Deserialize)]
struct PartRecord {
    part: Part,
    active: bool,
}

struct StoredPart {
    part: Arc<Part>,
    active: bool,
    deactivated_at: Option<Instant>,
}

/// Fjall-backed store of local parts.
pub struct LocalPartStore {
    keyspace: Arc<Keyspace>,
    meta: PartitionHandle,
    payloads: PartitionHandle,
    state: Mutex<HashMap<String, StoredPart>>,
}

impl LocalPartStore {
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .map_err(|err| ReplicationError::Storage(format!("create {}: {err}", dir.display())))?;
        let keyspace = Arc::new(fjall::Config::new(dir).open()?);
        let meta = keyspace.open_partition("part_meta", PartitionCreateOptions::default())?;
        let payloads = keyspace.open_partition("part_payloads", PartitionCreateOptions::default())?;

        let mut state = HashMap::new();
        let mut leftover_tmp = Vec::new();
        for item in meta.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            if key.starts_with(TMP_PREFIX) {
                // Staged by a run that died before commit.
                leftover_tmp.push(key);
                continue;
            }
            let record: PartRecord = serde_json::from_slice(&value)
                .map_err(|err| ReplicationError::Storage(format!("part record {key}: {err}")))?;
            if key != record.part.name.to_string() {
                // Detached under a marker prefix; invisible until an
                // operator intervenes.
                continue;
            }
            state.insert(
                key,
                StoredPart {
                    part: Arc::new(record.part),
                    active: record.active,
                    deactivated_at: None,
                },
            );
        }
        if !leftover_tmp.is_empty() {
            tracing::info!(count = leftover_tmp.len(), "dropping uncommitted staged parts");
            let mut batch = keyspace.batch();
            for key in &leftover_tmp {
                batch.remove(&meta, key.as_bytes());
                batch.remove(&payloads, key.as_bytes());
            }
            batch.commit()?;
        }

        Ok(Arc::new(Self {
            keyspace,
            meta,
            payloads,
            state: Mutex::new(state),
        }))
    }

    /// Active parts, ordered by name.
    pub fn active_parts(&self) -> Vec<Arc<Part>> {
        let state = self.state.lock().unwrap();
        let mut parts: Vec<Arc<Part>> = state
            .values()
            .filter(|stored| stored.active)
            .map(|stored| stored.part.clone())
            .collect();
        parts.sort_by(|a, b| a.name.cmp(&b.name));
        parts
    }

    /// All parts, active or superseded-but-not-yet-cleaned.
    pub fn all_parts(&self) -> Vec<Arc<Part>> {
        let state = self.state.lock().unwrap();
        let mut parts: Vec<Arc<Part>> = state.values().map(|stored| stored.part.clone()).collect();
        parts.sort_by(|a, b| a.name.cmp(&b.name));
        parts
    }

    pub fn part(&self, name: &PartName) -> Option<Arc<Part>> {
        let state = self.state.lock().unwrap();
        state.get(&name.to_string()).map(|stored| stored.part.clone())
    }

    /// The part covering `name`, if one exists. Active parts are preferred;
    /// `include_inactive` also consults superseded parts still on disk.
    pub fn containing_part(&self, name: &PartName, include_inactive: bool) -> Option<Arc<Part>> {
        let state = self.state.lock().unwrap();
        let active = state
            .values()
            .filter(|stored| stored.active)
            .find(|stored| stored.part.name.covers(name));
        if let Some(stored) = active {
            return Some(stored.part.clone());
        }
        if include_inactive {
            return state
                .values()
                .find(|stored| stored.part.name.covers(name))
                .map(|stored| stored.part.clone());
        }
        None
    }

    /// Active parts strictly covered by `name`.
    pub fn active_parts_covered_by(&self, name: &PartName) -> Vec<Arc<Part>> {
        let state = self.state.lock().unwrap();
        state
            .values()
            .filter(|stored| stored.active && stored.part.name != *name && name.covers(&stored.part.name))
            .map(|stored| stored.part.clone())
            .collect()
    }

    pub fn payload(&self, name: &PartName) -> Result<Option<Bytes>> {
        Ok(self
            .payloads
            .get(name.to_string().as_bytes())?
            .map(|slice| Bytes::copy_from_slice(&slice)))
    }

    /// Stage a new part under a temporary key. Nothing becomes visible until
    /// the returned handle is committed; dropping it discards the staging.
    pub fn stage_part(self: &Arc<Self>, part: Part, payload: Bytes) -> Result<StagedPart> {
        let tmp_key = format!("{TMP_PREFIX}{}", part.name);
        let record = PartRecord {
            part: part.clone(),
            active: true,
        };
        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.meta,
            tmp_key.as_bytes(),
            serde_json::to_vec(&record)
                .map_err(|err| ReplicationError::Storage(err.to_string()))?,
        );
        batch.insert(&self.payloads, tmp_key.as_bytes(), payload.as_ref());
        batch.commit()?;
        Ok(StagedPart {
            store: self.clone(),
            part,
            committed: false,
        })
    }

    fn commit_staged(&self, part: &Part) -> Result<Vec<Arc<Part>>> {
        let name = part.name.to_string();
        let tmp_key = format!("{TMP_PREFIX}{name}");
        let payload = self
            .payloads
            .get(tmp_key.as_bytes())?
            .ok_or_else(|| ReplicationError::Storage(format!("staged payload {name} missing")))?;

        let mut state = self.state.lock().unwrap();
        let replaced: Vec<Arc<Part>> = state
            .values()
            .filter(|stored| {
                stored.active && stored.part.name != part.name && part.name.covers(&stored.part.name)
            })
            .map(|stored| stored.part.clone())
            .collect();

        let mut batch = self.keyspace.batch();
        batch.remove(&self.meta, tmp_key.as_bytes());
        batch.remove(&self.payloads, tmp_key.as_bytes());
        let record = PartRecord {
            part: part.clone(),
            active: true,
        };
        batch.insert(
            &self.meta,
            name.as_bytes(),
            serde_json::to_vec(&record)
                .map_err(|err| ReplicationError::Storage(err.to_string()))?,
        );
        batch.insert(&self.payloads, name.as_bytes(), payload);
        for old in &replaced {
            let old_record = PartRecord {
                part: (**old).clone(),
                active: false,
            };
            batch.insert(
                &self.meta,
                old.name.to_string().as_bytes(),
                serde_json::to_vec(&old_record)
                    .map_err(|err| ReplicationError::Storage(err.to_string()))?,
            );
        }
        batch.commit()?;

        let now = Instant::now();
        for old in &replaced {
            if let Some(stored) = state.get_mut(&old.name.to_string()) {
                stored.active = false;
                stored.deactivated_at = Some(now);
            }
        }
        state.insert(
            name,
            StoredPart {
                part: Arc::new(part.clone()),
                active: true,
                deactivated_at: None,
            },
        );
        Ok(replaced)
    }

    fn discard_staged(&self, part: &Part) {
        let tmp_key = format!("{TMP_PREFIX}{}", part.name);
        let mut batch = self.keyspace.batch();
        batch.remove(&self.meta, tmp_key.as_bytes());
        batch.remove(&self.payloads, tmp_key.as_bytes());
        if let Err(err) = batch.commit() {
            tracing::warn!(part = %part.name, error = %err, "failed to discard staged part");
        }
    }

    /// Move a part out of the visible set under a marker prefix. The data
    /// stays on disk for operator inspection.
    pub fn rename_and_detach(&self, name: &PartName, prefix: &str) -> Result<()> {
        let key = name.to_string();
        let detached_key = format!("{prefix}{key}");
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.remove(&key) else {
            return Ok(());
        };
        let record = PartRecord {
            part: (*stored.part).clone(),
            active: false,
        };
        let mut batch = self.keyspace.batch();
        batch.remove(&self.meta, key.as_bytes());
        batch.insert(
            &self.meta,
            detached_key.as_bytes(),
            serde_json::to_vec(&record)
                .map_err(|err| ReplicationError::Storage(err.to_string()))?,
        );
        if let Some(payload) = self.payloads.get(key.as_bytes())? {
            batch.remove(&self.payloads, key.as_bytes());
            batch.insert(&self.payloads, detached_key.as_bytes(), payload);
        }
        batch.commit()?;
        Ok(())
    }

    /// Drop superseded parts older than `lifetime`, returning their names so
    /// the caller can remove the matching coordinator records.
    pub fn clear_old_parts(&self, lifetime: Duration) -> Result<Vec<PartName>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let doomed: Vec<String> = state
            .iter()
            .filter(|(_, stored)| {
                !stored.active
                    && stored
                        .deactivated_at
                        .map(|at| now.duration_since(at) >= lifetime)
                        .unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = self.keyspace.batch();
        for key in &doomed {
            batch.remove(&self.meta, key.as_bytes());
            batch.remove(&self.payloads, key.as_bytes());
        }
        batch.commit()?;
        let mut names = Vec::new();
        for key in doomed {
            if let Some(stored) = state.remove(&key) {
                names.push(stored.part.name.clone());
            }
        }
        Ok(names)
    }

    /// Remove every part, staged or otherwise.
    pub fn drop_all_data(&self) -> Result<()> {
        let mut keys = Vec::new();
        for item in self.meta.iter() {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        for item in self.payloads.iter() {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        let mut batch = self.keyspace.batch();
        for key in &keys {
            batch.remove(&self.meta, key.clone());
            batch.remove(&self.payloads, key.clone());
        }
        batch.commit()?;
        self.state.lock().unwrap().clear();
        Ok(())
    }
}

/// A part written to disk but not yet visible. Commit makes it active and
/// deactivates the parts it covers; drop discards it.
pub struct StagedPart {
    store: Arc<LocalPartStore>,
    pub part: Part,
    committed: bool,
}

impl StagedPart {
    /// Activate the staged part. Returns the active parts it replaced.
    pub fn commit(mut self) -> Result<Vec<Arc<Part>>> {
        self.committed = true;
        self.store.commit_staged(&self.part)
    }
}

impl Drop for StagedPart {
    fn drop(&mut self) {
        if !self.committed {
            self.store.discard_staged(&self.part);
        }
    }
}

/// Pairwise merge admission decided by the leader against coordinator state.
#[async_trait]
pub trait MergePredicate: Send + Sync {
    async fn can_merge(&self, left: &Part, right: &Part) -> bool;
}

/// Admits every pair; used for unreplicated data.
pub struct AlwaysMerge;

#[async_trait]
impl MergePredicate for AlwaysMerge {
    async fn can_merge(&self, _left: &Part, _right: &Part) -> bool {
        true
    }
}

/// Merges local parts and plans which parts to merge next.
pub struct Merger {
    store: Arc<LocalPartStore>,
    cancelled: AtomicBool,
    index_granularity: u64,
    big_threshold_bytes: u64,
    merge_min_parts: usize,
    max_parts_to_merge_at_once: usize,
}

impl Merger {
    pub fn new(
        store: Arc<LocalPartStore>,
        index_granularity: u64,
        big_threshold_bytes: u64,
        merge_min_parts: usize,
        max_parts_to_merge_at_once: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cancelled: AtomicBool::new(false),
            index_granularity,
            big_threshold_bytes,
            merge_min_parts: merge_min_parts.max(2),
            max_parts_to_merge_at_once: max_parts_to_merge_at_once.max(2),
        })
    }

    /// Make in-flight and future merges abort with a retriable error.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn uncancel_all(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Merge `parts` (sorted, adjacent, one month) into `new_name`.
    pub fn merge_parts(&self, parts: &[Arc<Part>], new_name: &PartName) -> Result<(Part, Bytes)> {
        let mut payload = Vec::new();
        let mut rows = 0u64;
        for part in parts {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ReplicationError::MergeCancelled);
            }
            let piece = self
                .store
                .payload(&part.name)?
                .ok_or_else(|| ReplicationError::Storage(format!("payload of {} missing", part.name)))?;
            payload.extend_from_slice(&piece);
            rows += part.rows;
        }
        let checksum = payload_checksum(&payload);
        let merged = Part {
            name: new_name.clone(),
            rows,
            bytes: payload.len() as u64,
            checksum,
        };
        Ok((merged, Bytes::from(payload)))
    }

    /// Pick an adjacent run of active parts to merge, or `None`.
    ///
    /// The unforced pass (`relaxed == false`) only proposes runs of at least
    /// `merge_min_parts`; the relaxed pass accepts any admissible pair. With
    /// `exclude_big` set, parts over the big-merge threshold are not
    /// considered, so small merges can proceed under a running big one.
    pub async fn select_parts_to_merge(
        &self,
        predicate: &dyn MergePredicate,
        relaxed: bool,
        exclude_big: bool,
    ) -> Option<(Vec<Arc<Part>>, PartName)> {
        let parts = self.store.active_parts();
        let min_len = if relaxed { 2 } else { self.merge_min_parts };

        let eligible = |part: &Part| {
            !exclude_big || !part.is_big(self.index_granularity, self.big_threshold_bytes)
        };

        let mut i = 0;
        while i < parts.len() {
            if !eligible(&parts[i]) {
                i += 1;
                continue;
            }
            let mut run = vec![parts[i].clone()];
            let mut j = i + 1;
            while j < parts.len() && run.len() < self.max_parts_to_merge_at_once {
                let prev = run.last().expect("run is non-empty");
                let next = &parts[j];
                if next.name.month != prev.name.month || !eligible(next) {
                    break;
                }
                if !predicate.can_merge(prev, next).await {
                    break;
                }
                run.push(next.clone());
                j += 1;
            }
            if run.len() >= min_len {
                let names: Vec<PartName> = run.iter().map(|p| p.name.clone()).collect();
                let merged_name = PartName::merged(&names);
                return Some((run, merged_name));
            }
            // Restart after the run; a run that stopped early cannot be
            // extended by starting inside it.
            i = j.max(i + 1);
        }
        None
    }
}
