//! The replicated table: shared state, lifecycle, and the session supervisor.
//!
//! One `ReplicatedTable` owns one replica of one table. All durable
//! replication state lives in the coordinator; this module keeps the
//! in-memory mirror (queue, virtual parts, reservations), drives startup and
//! shutdown, registers the replica's liveness, bootstraps new replicas from
//! a reference peer, and survives coordinator session expiration by tearing
//! everything down and starting again on a fresh session.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use strata_keeper::{
    CreateMode, EphemeralNodeHolder, Keeper, KeeperError, LeaderElection, Op, SessionProvider,
};
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{ReplicationError, Result};
use crate::executor::QueueTask;
use crate::fetch::{FetchEndpoint, InProcessFetcher, PartFetcher};
use crate::log_entry::{LogEntry, QueueEntry};
use crate::metadata::TableSchema;
use crate::part::{ActivePartSet, PartName};
use crate::paths::TablePaths;
use crate::pool::{BackgroundPool, PoolTask, TaskHandle};
use crate::settings::ReplicationSettings;
use crate::store::{AlwaysMerge, LocalPartStore, Merger, Part};
use crate::writer::BlockWriter;
use crate::{leader, queue, reconcile};

/// Everything needed to open one replica of a replicated table.
#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Coordinator path of the table, e.g. `/tables/visits`.
    pub coordinator_path: String,
    pub replica_name: String,
    /// Advertised fetch endpoint.
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub schema: TableSchema,
    pub settings: ReplicationSettings,
    /// Re-open an existing local replica (reconcile local parts against the
    /// coordinator) instead of registering a new one.
    pub attach: bool,
}

pub(crate) struct TableCore {
    pub(crate) paths: TablePaths,
    pub(crate) replica_name: String,
    pub(crate) settings: ReplicationSettings,
    pub(crate) schema: TableSchema,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Random per-process identity of this instance's liveness node.
    pub(crate) active_node_identifier: String,

    pub(crate) provider: Arc<dyn SessionProvider>,
    keeper: StdRwLock<Arc<dyn Keeper>>,
    pub(crate) data: Arc<LocalPartStore>,
    pub(crate) merger: Arc<Merger>,
    pub(crate) unreplicated_data: Option<Arc<LocalPartStore>>,
    pub(crate) unreplicated_merger: Option<Arc<Merger>>,
    pub(crate) fetcher: Arc<dyn PartFetcher>,
    pub(crate) pool: BackgroundPool,

    /// Pending work, mirroring `queue/` in the coordinator. Scans and
    /// mutations all happen under this one lock.
    pub(crate) queue: TokioMutex<VecDeque<QueueEntry>>,
    /// Parts that exist locally or are promised by a queued entry.
    pub(crate) virtual_parts: StdMutex<ActivePartSet>,
    /// Output names currently reserved by an executing entry.
    pub(crate) future_parts: StdMutex<HashSet<String>>,

    pub(crate) shutdown_called: AtomicBool,
    pub(crate) permanent_shutdown_called: AtomicBool,
    pub(crate) is_read_only: AtomicBool,
    pub(crate) is_leader: AtomicBool,

    pub(crate) shutdown_event: Notify,
    /// Wakes the merge-selection loop early after a part commit.
    pub(crate) merge_selecting_event: Notify,

    /// Writers hold this shared; the supervisor takes it exclusively while
    /// swapping sessions.
    pub(crate) alter_lock: tokio::sync::RwLock<()>,
    pub(crate) block_token_seq: AtomicU64,

    leader_election: TokioMutex<Option<LeaderElection>>,
    is_active_holder: TokioMutex<Option<EphemeralNodeHolder>>,
    queue_updating_task: TokioMutex<Option<JoinHandle<()>>>,
    pub(crate) leader_tasks: StdMutex<Vec<JoinHandle<()>>>,
    queue_task_handle: TokioMutex<Option<TaskHandle>>,
    fetch_endpoint: StdMutex<Option<FetchEndpoint>>,
}

impl TableCore {
    /// Current session handle. Cloned out so callers never hold the lock
    /// across an await.
    pub(crate) fn keeper(&self) -> Arc<dyn Keeper> {
        self.keeper.read().unwrap().clone()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }

    pub(crate) fn leading(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub(crate) async fn wake_queue_task(&self) {
        if let Some(handle) = self.queue_task_handle.lock().await.as_ref() {
            handle.wake();
        }
    }

    /// Sleep observing shutdown at least once per second.
    pub(crate) async fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            if self.shutdown_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let step = (deadline - now).min(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = self.shutdown_event.notified() => return,
            }
        }
    }

    /// A replica that claims the part in the coordinator, chosen uniformly.
    pub(crate) async fn find_replica_having_part(
        &self,
        name: &PartName,
        active: bool,
    ) -> Result<Option<String>> {
        let keeper = self.keeper();
        let mut replicas = keeper.children(&self.paths.replicas()).await?;
        replicas.shuffle(&mut rand::thread_rng());
        for replica in replicas {
            if keeper.exists(&self.paths.part(&replica, name)).await?
                && (!active || keeper.exists(&self.paths.is_active(&replica)).await?)
            {
                return Ok(Some(replica));
            }
        }
        Ok(None)
    }

    /// Ops registering `part` under this replica, after cross-checking its
    /// checksums against any peer that already has it.
    pub(crate) async fn check_part_and_add_ops(&self, part: &Part) -> Result<Vec<Op>> {
        if let Some(replica) = self.find_replica_having_part(&part.name, false).await? {
            let checksums_path = self.paths.part_checksums(&replica, &part.name);
            if let Some(checksums) = self.keeper().try_get(&checksums_path).await? {
                if checksums != part.checksum {
                    return Err(ReplicationError::ChecksumMismatch {
                        part: part.name.to_string(),
                        replica,
                    });
                }
            }
        }
        Ok(vec![
            Op::create(self.paths.part(&self.replica_name, &part.name), "", CreateMode::Persistent),
            Op::create(
                self.paths.part_checksums(&self.replica_name, &part.name),
                part.checksum.clone(),
                CreateMode::Persistent,
            ),
        ])
    }
}

/// Public handle to one replica of a replicated table.
pub struct ReplicatedTable {
    core: Arc<TableCore>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicatedTable {
    /// Open the replica with the in-process fetch channel.
    pub async fn open(
        config: TableConfig,
        provider: Arc<dyn SessionProvider>,
        pool: BackgroundPool,
    ) -> Result<Self> {
        Self::open_with_fetcher(config, provider, pool, Arc::new(InProcessFetcher)).await
    }

    pub async fn open_with_fetcher(
        config: TableConfig,
        provider: Arc<dyn SessionProvider>,
        pool: BackgroundPool,
        fetcher: Arc<dyn PartFetcher>,
    ) -> Result<Self> {
        let data = LocalPartStore::open(&config.data_dir.join("data"))?;
        let merger = Merger::new(
            data.clone(),
            config.schema.index_granularity,
            config.settings.big_merge_threshold_bytes,
            config.settings.merge_min_parts,
            config.settings.max_parts_to_merge_at_once,
        );

        let unreplicated_dir = config.data_dir.join("unreplicated");
        let (unreplicated_data, unreplicated_merger) = if unreplicated_dir.exists() {
            tracing::info!(replica = %config.replica_name, "have unreplicated data");
            let store = LocalPartStore::open(&unreplicated_dir)?;
            let merger = Merger::new(
                store.clone(),
                config.schema.index_granularity,
                config.settings.big_merge_threshold_bytes,
                config.settings.merge_min_parts,
                config.settings.max_parts_to_merge_at_once,
            );
            (Some(store), Some(merger))
        } else {
            (None, None)
        };

        let identifier = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ReplicationError::Clock)?
            .as_nanos()
            .to_string();

        let core = Arc::new(TableCore {
            paths: TablePaths::new(&config.coordinator_path),
            replica_name: config.replica_name.clone(),
            settings: config.settings,
            schema: config.schema,
            host: config.host.clone(),
            port: config.port,
            active_node_identifier: identifier,
            provider: provider.clone(),
            keeper: StdRwLock::new(provider.session()),
            data: data.clone(),
            merger,
            unreplicated_data,
            unreplicated_merger,
            fetcher,
            pool,
            queue: TokioMutex::new(VecDeque::new()),
            virtual_parts: StdMutex::new(ActivePartSet::new()),
            future_parts: StdMutex::new(HashSet::new()),
            shutdown_called: AtomicBool::new(false),
            permanent_shutdown_called: AtomicBool::new(false),
            is_read_only: AtomicBool::new(false),
            is_leader: AtomicBool::new(false),
            shutdown_event: Notify::new(),
            merge_selecting_event: Notify::new(),
            alter_lock: tokio::sync::RwLock::new(()),
            block_token_seq: AtomicU64::new(0),
            leader_election: TokioMutex::new(None),
            is_active_holder: TokioMutex::new(None),
            queue_updating_task: TokioMutex::new(None),
            leader_tasks: StdMutex::new(Vec::new()),
            queue_task_handle: TokioMutex::new(None),
            fetch_endpoint: StdMutex::new(None),
        });

        let keeper = core.keeper();
        if config.attach {
            check_table_structure(&core).await?;
        } else {
            if !keeper.exists(core.paths.root()).await? {
                create_table(&core).await?;
            }
            check_table_structure(&core).await?;
            create_replica(&core).await?;
        }

        *core.fetch_endpoint.lock().unwrap() =
            Some(FetchEndpoint::register(&config.host, config.port, &data));

        startup(&core).await?;

        let supervisor_core = core.clone();
        let supervisor = tokio::spawn(supervisor_task(supervisor_core));

        Ok(Self {
            core,
            supervisor: StdMutex::new(Some(supervisor)),
        })
    }

    pub fn replica_name(&self) -> &str {
        &self.core.replica_name
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.core.leading()
    }

    /// Begin writing blocks. Fails immediately when the table is read-only.
    pub fn writer(&self) -> Result<BlockWriter> {
        if self.is_read_only() {
            return Err(ReplicationError::TableReadOnly);
        }
        Ok(BlockWriter::new(self.core.clone()))
    }

    /// Snapshot of readable parts: unreplicated first, then replicated.
    pub fn read(&self) -> Vec<Arc<Part>> {
        let mut parts = Vec::new();
        if let Some(unreplicated) = &self.core.unreplicated_data {
            parts.extend(unreplicated.active_parts());
        }
        parts.extend(self.core.data.active_parts());
        parts
    }

    /// Merge some unreplicated parts, if there are any to merge.
    pub async fn optimize(&self) -> Result<bool> {
        let (Some(store), Some(merger)) = (
            self.core.unreplicated_data.as_ref(),
            self.core.unreplicated_merger.as_ref(),
        ) else {
            return Ok(false);
        };
        store.clear_old_parts(self.core.settings.old_parts_lifetime)?;
        let Some((parts, new_name)) = merger.select_parts_to_merge(&AlwaysMerge, true, false).await
        else {
            return Ok(false);
        };
        let (merged, payload) = merger.merge_parts(&parts, &new_name)?;
        store.stage_part(merged, payload)?.commit()?;
        Ok(true)
    }

    /// Stop all background work. Durable state is left in place; the table
    /// can be attached again later.
    pub async fn shutdown(&self) {
        self.core
            .permanent_shutdown_called
            .store(true, Ordering::SeqCst);
        self.core.shutdown_event.notify_waiters();
        let task = self.supervisor.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Remove this replica from the table; if it was the last one, remove
    /// the whole table subtree. Local data is dropped even when coordinator
    /// removal fails partway.
    pub async fn drop_table(self) -> Result<()> {
        self.shutdown().await;
        let core = &self.core;
        let keeper = core.keeper();
        tracing::info!(replica = %core.replica_name, "removing replica");
        let removed: Result<()> = async {
            keeper
                .remove_recursive(&core.paths.replica_root(&core.replica_name))
                .await?;
            if keeper.children(&core.paths.replicas()).await?.is_empty() {
                tracing::info!(table = %core.paths.root(), "removing table");
                keeper.remove_recursive(core.paths.root()).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = removed {
            tracing::warn!(error = %err, "coordinator removal incomplete; dropping local data anyway");
        }
        core.data.drop_all_data()?;
        Ok(())
    }

    /// Current queue contents, for tests and operations tooling.
    pub async fn queue_snapshot(&self) -> Vec<LogEntry> {
        self.core
            .queue
            .lock()
            .await
            .iter()
            .map(|qe| qe.entry.clone())
            .collect()
    }

    pub fn local_parts(&self) -> Vec<Arc<Part>> {
        self.core.data.active_parts()
    }

    pub fn virtual_parts(&self) -> Vec<PartName> {
        self.core.virtual_parts.lock().unwrap().parts()
    }
}

fn parse_host_node(value: &str) -> Result<(String, u16)> {
    let mut lines = value.lines();
    let host = lines
        .next()
        .and_then(|line| line.strip_prefix("host: "))
        .ok_or_else(|| ReplicationError::Storage(format!("malformed host node {value:?}")))?;
    let port = lines
        .next()
        .and_then(|line| line.strip_prefix("port: "))
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ReplicationError::Storage(format!("malformed host node {value:?}")))?;
    Ok((host.to_string(), port))
}

/// Read a peer's advertised fetch endpoint.
pub(crate) async fn peer_endpoint(core: &TableCore, replica: &str) -> Result<(String, u16)> {
    let value = core.keeper().get(&core.paths.host(replica)).await?;
    parse_host_node(&value)
}

async fn create_table(core: &Arc<TableCore>) -> Result<()> {
    tracing::debug!(table = %core.paths.root(), "creating table");
    let keeper = core.keeper();
    keeper
        .create(core.paths.root(), "", CreateMode::Persistent)
        .await?;
    keeper
        .create(&core.paths.metadata(), &core.schema.to_text(), CreateMode::Persistent)
        .await?;
    for path in [
        core.paths.replicas(),
        core.paths.blocks(),
        core.paths.block_numbers(),
        core.paths.leader_election(),
        core.paths.temp(),
    ] {
        keeper.create(&path, "", CreateMode::Persistent).await?;
    }
    Ok(())
}

async fn check_table_structure(core: &Arc<TableCore>) -> Result<()> {
    let metadata = core.keeper().get(&core.paths.metadata()).await?;
    core.schema.check_matches(&metadata)
}

/// Register a brand-new replica and seed its queue from a reference peer.
async fn create_replica(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let paths = &core.paths;
    let me = &core.replica_name;
    tracing::debug!(replica = %paths.replica_root(me), "creating replica");

    // Snapshot first: replicas that appear later will see our subtree and
    // wait for us instead.
    // NOTE: several replicas added at nearly the same time, with writes
    // starting immediately, can each miss a sliver of the other's log before
    // the pointer copy below. Rare and bounded; tolerated.
    let replicas = keeper.children(&paths.replicas()).await?;

    keeper
        .create(&paths.replica_root(me), "", CreateMode::Persistent)
        .await?;
    for path in [
        paths.host(me),
        paths.log_root(me),
        paths.log_pointers(me),
        paths.queue_root(me),
        paths.parts(me),
    ] {
        keeper.create(&path, "", CreateMode::Persistent).await?;
    }

    if replicas.is_empty() {
        tracing::debug!("no other replicas");
        return Ok(());
    }

    // A new replica may only serve once every existing active replica has
    // observed it: evidenced by that peer creating a log pointer for us, or
    // by the peer ceasing to be active.
    let mut source_replica = replicas[0].clone();
    for replica in &replicas {
        tracing::debug!(peer = %replica, "waiting for acknowledgement");
        let mut active = true;
        loop {
            let (peer_active, active_watch) =
                keeper.exists_watch(&paths.is_active(replica)).await?;
            if !peer_active {
                active = false;
                break;
            }
            let (acknowledged, ack_watch) = keeper
                .exists_watch(&paths.log_pointer(replica, me))
                .await?;
            if acknowledged {
                break;
            }
            tokio::select! {
                _ = active_watch.wait() => {}
                _ = ack_watch.wait() => {}
                _ = tokio::time::sleep(core.settings.bootstrap_ack_poll) => {}
            }
        }
        if active {
            source_replica = replica.clone();
        }
    }
    tracing::info!(source = %source_replica, "will mimic reference replica");
    let source = source_replica;

    // The order of the next three steps matters: entries may duplicate, but
    // none may be lost.

    // 1. Inherit the reference replica's view of every peer's log progress.
    for replica in &replicas {
        if let Some(pointer) = keeper.try_get(&paths.log_pointer(&source, replica)).await? {
            keeper
                .create(&paths.log_pointer(me, replica), &pointer, CreateMode::Persistent)
                .await?;
        }
    }

    // 2. Snapshot the reference queue before enumerating its parts.
    let mut queue_names = keeper.children(&paths.queue_root(&source)).await?;
    queue_names.sort();
    let mut source_queue = Vec::new();
    for name in queue_names {
        if let Some(entry) = keeper.try_get(&paths.queue_entry(&source, &name)).await? {
            source_queue.push(entry);
        }
    }

    // 3. Fetch every part the reference replica holds, reduced to maximal
    // covers, then replay its queue verbatim.
    let part_names = keeper.children(&paths.parts(&source)).await?;
    let mut active_set = ActivePartSet::new();
    for name in part_names {
        match name.parse::<PartName>() {
            Ok(part) => {
                active_set.add(part);
            }
            Err(_) => {
                tracing::warn!(part = %name, source = %source, "skipping unparsable part name");
            }
        }
    }
    let maximal = active_set.parts();
    for part in &maximal {
        let entry = LogEntry::get_part("", part.clone());
        keeper
            .create(
                &paths.queue_seq_prefix(me),
                &entry.to_text(),
                CreateMode::PersistentSequential,
            )
            .await?;
    }
    tracing::debug!(count = maximal.len(), "queued parts to be fetched");

    for entry in &source_queue {
        keeper
            .create(&paths.queue_seq_prefix(me), entry, CreateMode::PersistentSequential)
            .await?;
    }
    tracing::debug!(count = source_queue.len(), "copied reference queue entries");
    Ok(())
}

/// Announce liveness: create `is_active` and refresh `host` atomically.
async fn activate_replica(core: &Arc<TableCore>) -> Result<()> {
    let keeper = core.keeper();
    let paths = &core.paths;
    let me = &core.replica_name;
    let is_active_path = paths.is_active(me);

    // A leftover node carrying our own identifier is a stale artifact of a
    // previous session of this same instance.
    if let Some(value) = keeper.try_get(&is_active_path).await? {
        if value == core.active_node_identifier {
            keeper.try_remove(&is_active_path).await?;
        }
    }

    let host_value = format!("host: {}\nport: {}\n", core.host, core.port);
    let ops = vec![
        Op::create(
            is_active_path.clone(),
            core.active_node_identifier.clone(),
            CreateMode::Ephemeral,
        ),
        Op::set_data(paths.host(me), host_value),
    ];
    match keeper.multi(ops).await {
        Ok(_) => {}
        Err(KeeperError::NodeExists(_)) => {
            return Err(ReplicationError::ReplicaAlreadyActive(
                paths.replica_root(me),
            ));
        }
        Err(err) => return Err(err.into()),
    }

    *core.is_active_holder.lock().await =
        Some(EphemeralNodeHolder::existing(keeper, is_active_path));
    Ok(())
}

/// Bring one session to life: register liveness, reconcile local parts,
/// rebuild in-memory state, and start the background tasks.
pub(crate) async fn startup(core: &Arc<TableCore>) -> Result<()> {
    core.shutdown_called.store(false, Ordering::SeqCst);
    core.merger.uncancel_all();
    if let Some(merger) = &core.unreplicated_merger {
        merger.uncancel_all();
    }

    activate_replica(core).await?;
    reconcile::check_parts(core).await?;

    {
        let mut virtual_parts = core.virtual_parts.lock().unwrap();
        virtual_parts.clear();
        for part in core.data.active_parts() {
            virtual_parts.add(part.name.clone());
        }
    }
    core.queue.lock().await.clear();
    core.future_parts.lock().unwrap().clear();
    queue::load_queue(core).await?;

    let weak = Arc::downgrade(core);
    let election = LeaderElection::start(
        core.keeper(),
        &core.paths.leader_election(),
        &core.replica_name,
        Box::new(move || {
            if let Some(core) = weak.upgrade() {
                leader::become_leader(&core);
            }
        }),
    )
    .await?;
    *core.leader_election.lock().await = Some(election);

    let updater_core = core.clone();
    *core.queue_updating_task.lock().await =
        Some(tokio::spawn(queue::queue_updating_task(updater_core)));

    let task: Arc<dyn PoolTask> = Arc::new(QueueTask::new(Arc::downgrade(core)));
    *core.queue_task_handle.lock().await = Some(core.pool.add_task(task));
    Ok(())
}

/// Stop background work and release session-scoped nodes. Durable state is
/// untouched; a later `startup` on a fresh session resumes from it.
pub(crate) async fn partial_shutdown(core: &Arc<TableCore>) {
    if let Some(election) = core.leader_election.lock().await.take() {
        election.release().await;
    }
    core.shutdown_called.store(true, Ordering::SeqCst);
    core.shutdown_event.notify_waiters();
    if let Some(holder) = core.is_active_holder.lock().await.take() {
        holder.release().await;
    }
    core.merger.cancel_all();
    if let Some(merger) = &core.unreplicated_merger {
        merger.cancel_all();
    }

    tracing::trace!(replica = %core.replica_name, "waiting for tasks to finish");
    core.is_leader.store(false, Ordering::SeqCst);
    core.merge_selecting_event.notify_waiters();
    let leader_tasks: Vec<JoinHandle<()>> = core.leader_tasks.lock().unwrap().drain(..).collect();
    for task in leader_tasks {
        let _ = task.await;
    }
    if let Some(task) = core.queue_updating_task.lock().await.take() {
        let _ = task.await;
    }
    if let Some(handle) = core.queue_task_handle.lock().await.take() {
        core.pool.remove_task(handle).await;
    }
    tracing::trace!(replica = %core.replica_name, "tasks finished");
}

/// Terminal failure mode: writes fail fast, background work stops, the fetch
/// endpoint is released. Only a process restart leaves this state.
pub(crate) async fn go_read_only(core: &Arc<TableCore>) {
    tracing::info!(replica = %core.replica_name, "entering read-only mode");
    core.is_read_only.store(true, Ordering::SeqCst);
    core.permanent_shutdown_called.store(true, Ordering::SeqCst);
    partial_shutdown(core).await;
    core.fetch_endpoint.lock().unwrap().take();
}

/// Watches the session and rebuilds the replica on expiration.
async fn supervisor_task(core: Arc<TableCore>) {
    loop {
        if core.permanent_shutdown_called.load(Ordering::SeqCst) {
            break;
        }
        if core.keeper().expired() {
            tracing::warn!(
                replica = %core.replica_name,
                "coordinator session expired; switching to a new session"
            );
            let result = async {
                // Block writers while the session handle is swapped.
                let _alter = core.alter_lock.write().await;
                partial_shutdown(&core).await;
                let fresh = core.provider.session();
                *core.keeper.write().unwrap() = fresh;
                startup(&core).await
            }
            .await;
            if let Err(err) = result {
                tracing::error!(
                    replica = %core.replica_name,
                    error = %err,
                    "failed to recover from session expiration; the table will be read-only until restart"
                );
                go_read_only(&core).await;
                return;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(core.settings.supervisor_check_period) => {}
            _ = core.shutdown_event.notified() => {}
        }
    }
    partial_shutdown(&core).await;
    core.fetch_endpoint.lock().unwrap().take();
}
