//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use strata_keeper::Keeper;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use strata_keeper::memory::MemorySession;
use strata_keeper::MemoryCoordinator;
use strata_store::{
    BackgroundPool, Block, ReplicatedTable, ReplicationSettings, TableConfig, TableSchema,
};

pub const TABLE_PATH: &str = "/tables/visits";
pub const MONTH: &str = "202608";

static CLUSTER_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn schema() -> TableSchema {
    TableSchema {
        date_column: "EventDate".into(),
        sampling_expression: String::new(),
        index_granularity: 8192,
        mode: 0,
        sign_column: String::new(),
        primary_key: "(EventDate)".into(),
        columns: vec![
            ("EventDate".into(), "Date".into()),
            ("Value".into(), "UInt64".into()),
        ],
    }
}

/// One in-process cluster: a coordinator, a background pool, and a data
/// directory. Each cluster gets a unique fetch host so concurrent tests
/// never cross-talk through the endpoint registry.
pub struct Cluster {
    pub coordinator: MemoryCoordinator,
    pub pool: BackgroundPool,
    pub dir: tempfile::TempDir,
    host: String,
    ports: Mutex<HashMap<String, u16>>,
}

impl Cluster {
    pub fn new() -> Self {
        let id = CLUSTER_SEQ.fetch_add(1, Ordering::SeqCst);
        Self {
            coordinator: MemoryCoordinator::new(),
            pool: BackgroundPool::start(4),
            dir: tempfile::tempdir().expect("create test dir"),
            host: format!("test-cluster-{id}"),
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self, replica: &str, settings: ReplicationSettings) -> TableConfig {
        let mut ports = self.ports.lock().unwrap();
        let next = 9001 + ports.len() as u16;
        let port = *ports.entry(replica.to_string()).or_insert(next);
        TableConfig {
            coordinator_path: TABLE_PATH.into(),
            replica_name: replica.into(),
            host: self.host.clone(),
            port,
            data_dir: self.dir.path().join(replica),
            schema: schema(),
            settings,
            attach: false,
        }
    }

    pub async fn open(&self, replica: &str) -> ReplicatedTable {
        self.open_with(replica, ReplicationSettings::fast()).await
    }

    pub async fn open_with(&self, replica: &str, settings: ReplicationSettings) -> ReplicatedTable {
        ReplicatedTable::open(
            self.config(replica, settings),
            Arc::new(self.coordinator.clone()),
            self.pool.clone(),
        )
        .await
        .expect("open replica")
    }

    pub async fn attach_with(
        &self,
        replica: &str,
        settings: ReplicationSettings,
    ) -> strata_store::Result<ReplicatedTable> {
        let mut config = self.config(replica, settings);
        config.attach = true;
        ReplicatedTable::open(config, Arc::new(self.coordinator.clone()), self.pool.clone()).await
    }

    /// A fresh coordinator session for inspecting or mutating the tree.
    pub fn session(&self) -> Arc<MemorySession> {
        self.coordinator.new_session()
    }
}

/// Settings that keep the leader from ever proposing merges, for tests that
/// need the part set to stay put.
pub fn no_merge_settings() -> ReplicationSettings {
    ReplicationSettings {
        max_replicated_merges_in_queue: 0,
        ..ReplicationSettings::fast()
    }
}

pub fn block(n: usize) -> Block {
    Block {
        month: MONTH.into(),
        rows: 8,
        payload: Bytes::from(format!("payload-{n}")),
        insert_id: Some(format!("insert-{n}")),
    }
}

const WAIT_ROUNDS: usize = 800;
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Poll a synchronous condition until it holds or ~8 seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..WAIT_ROUNDS {
        if cond() {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until a table's active local part names equal `expected` (sorted).
pub async fn wait_parts(table: &ReplicatedTable, expected: &[&str]) {
    for _ in 0..WAIT_ROUNDS {
        if part_names(table) == expected {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!(
        "timed out waiting for parts {expected:?} on {}; have {:?}",
        table.replica_name(),
        part_names(table)
    );
}

/// Wait until the node at `path` exists (or not).
pub async fn wait_node(k: &MemorySession, path: &str, want_exists: bool) {
    for _ in 0..WAIT_ROUNDS {
        if k.exists(path).await.unwrap() == want_exists {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {path} exists={want_exists}");
}

/// Wait until the node at `path` holds exactly `value`.
pub async fn wait_value(k: &MemorySession, path: &str, value: &str) {
    let mut last = None;
    for _ in 0..WAIT_ROUNDS {
        last = k.try_get(path).await.unwrap();
        if last.as_deref() == Some(value) {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {path} == {value:?}; have {last:?}");
}

/// Wait until `path` has exactly `count` children.
pub async fn wait_children_count(k: &MemorySession, path: &str, count: usize) {
    let mut last = usize::MAX;
    for _ in 0..WAIT_ROUNDS {
        last = k.children(path).await.map(|c| c.len()).unwrap_or(usize::MAX);
        if last == count {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for {count} children under {path}; have {last}");
}

/// Wait until the in-memory queue satisfies `pred`.
pub async fn wait_queue(
    table: &ReplicatedTable,
    what: &str,
    mut pred: impl FnMut(&[strata_store::LogEntry]) -> bool,
) {
    for _ in 0..WAIT_ROUNDS {
        let snapshot = table.queue_snapshot().await;
        if pred(&snapshot) {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("timed out waiting for queue condition: {what}");
}

/// Part names of a table's active local parts, sorted.
pub fn part_names(table: &ReplicatedTable) -> Vec<String> {
    let mut names: Vec<String> = table
        .local_parts()
        .iter()
        .map(|part| part.name.to_string())
        .collect();
    names.sort();
    names
}
