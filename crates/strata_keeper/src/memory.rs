//! In-process coordinator implementation.
//!
//! `MemoryCoordinator` keeps the whole node tree in one flat ordered map keyed
//! by full path, so listing children is a range scan. It backs both the test
//! suites and single-process multi-replica deployments; every replica opens
//! its own session against the shared tree, and sessions can be expired
//! explicitly to exercise the supervisor's recovery path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::client::{
    format_seq, CreateMode, Keeper, KeeperError, KeeperResult, Op, OpResult, Stat, Watch,
};

#[derive(Clone, Debug)]
struct Node {
    value: String,
    mode: CreateMode,
    czxid: u64,
    /// Session that owns this node; set only for ephemerals.
    owner: Option<u64>,
    /// Next sequential suffix handed out to `PersistentSequential` children.
    seq_counter: u64,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    next_czxid: u64,
    next_session_id: u64,
    sessions: HashMap<u64, Arc<AtomicBool>>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl TreeState {
    fn fire_watches(&mut self, path: &str) {
        if let Some(senders) = self.watches.remove(path) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    /// Drop a session's ephemerals (firing their watches) and forget it.
    fn end_session(&mut self, session_id: u64) {
        if let Some(flag) = self.sessions.remove(&session_id) {
            flag.store(true, Ordering::SeqCst);
        }
        let doomed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            self.nodes.remove(&path);
            self.fire_watches(&path);
        }
    }
}

/// Factory for coordinator sessions. The session supervisor asks for a fresh
/// session after expiration instead of reconnecting an old handle.
pub trait SessionProvider: Send + Sync {
    fn session(&self) -> Arc<dyn Keeper>;
}

/// Shared in-memory coordinator tree. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<TreeState>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session against the shared tree.
    pub fn new_session(&self) -> Arc<MemorySession> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_session_id;
        state.next_session_id += 1;
        let expired = Arc::new(AtomicBool::new(false));
        state.sessions.insert(id, expired.clone());
        Arc::new(MemorySession {
            state: self.state.clone(),
            id,
            expired,
        })
    }

    /// Expire a session: drop its ephemerals (firing their watches) and make
    /// every further operation on it fail with `SessionExpired`.
    pub fn expire_session(&self, session_id: u64) {
        self.state.lock().unwrap().end_session(session_id);
    }

    /// Session id of the ephemeral node at `path`, if any. Fault-injection
    /// hook: lets tests kill "whoever holds this liveness token".
    pub fn session_owning(&self, path: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.nodes.get(path).and_then(|node| node.owner)
    }
}

impl SessionProvider for MemoryCoordinator {
    fn session(&self) -> Arc<dyn Keeper> {
        self.new_session()
    }
}

/// One session against a `MemoryCoordinator`.
pub struct MemorySession {
    state: Arc<Mutex<TreeState>>,
    id: u64,
    expired: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_alive(&self) -> KeeperResult<()> {
        if self.expired.load(Ordering::SeqCst) {
            Err(KeeperError::SessionExpired)
        } else {
            Ok(())
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // Closing the last handle to a session invalidates its ephemerals,
        // the same as expiration.
        if let Ok(mut state) = self.state.lock() {
            state.end_session(self.id);
        }
    }
}

fn validate_path(path: &str) -> KeeperResult<()> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(KeeperError::BadPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}

/// Apply one op to the node map. Returns the affected path and, for creates,
/// whether existence changed at that path.
fn apply_op(
    nodes: &mut BTreeMap<String, Node>,
    next_czxid: &mut u64,
    session_id: u64,
    op: &Op,
) -> KeeperResult<(OpResult, String)> {
    match op {
        Op::Create { path, value, mode } => {
            validate_path(path)?;
            let parent = parent_of(path);
            if !parent.is_empty() {
                let parent_node = nodes
                    .get_mut(parent)
                    .ok_or_else(|| KeeperError::NoNode(parent.to_string()))?;
                if parent_node.mode.is_ephemeral() {
                    return Err(KeeperError::NoChildrenForEphemeral(parent.to_string()));
                }
            }
            let final_path = if mode.is_sequential() {
                let seq = if parent.is_empty() {
                    0
                } else {
                    let parent_node = nodes.get_mut(parent).expect("parent checked above");
                    let seq = parent_node.seq_counter;
                    parent_node.seq_counter += 1;
                    seq
                };
                format!("{path}{}", format_seq(seq))
            } else {
                path.clone()
            };
            if nodes.contains_key(&final_path) {
                return Err(KeeperError::NodeExists(final_path));
            }
            let czxid = *next_czxid;
            *next_czxid += 1;
            nodes.insert(
                final_path.clone(),
                Node {
                    value: value.clone(),
                    mode: *mode,
                    czxid,
                    owner: mode.is_ephemeral().then_some(session_id),
                    seq_counter: 0,
                },
            );
            Ok((
                OpResult::Created {
                    path: final_path.clone(),
                },
                final_path,
            ))
        }
        Op::SetData { path, value } => {
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| KeeperError::NoNode(path.clone()))?;
            node.value = value.clone();
            *next_czxid += 1;
            Ok((OpResult::Set, path.clone()))
        }
        Op::Remove { path } => {
            if !nodes.contains_key(path) {
                return Err(KeeperError::NoNode(path.clone()));
            }
            if child_names(nodes, path).next().is_some() {
                return Err(KeeperError::NotEmpty(path.clone()));
            }
            nodes.remove(path);
            *next_czxid += 1;
            Ok((OpResult::Removed, path.clone()))
        }
    }
}

/// Direct children names of `path`, via a range scan over the flat map.
fn child_names<'a>(
    nodes: &'a BTreeMap<String, Node>,
    path: &str,
) -> impl Iterator<Item = &'a str> + 'a {
    let prefix = format!("{path}/");
    let end = format!("{path}0"); // b'0' is the successor of b'/'
    nodes
        .range(prefix.clone()..end)
        .filter_map(move |(full, _)| {
            let rest = &full[prefix.len()..];
            (!rest.contains('/')).then_some(rest)
        })
}

#[async_trait]
impl Keeper for MemorySession {
    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> KeeperResult<String> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let (result, changed) = apply_op(
            &mut state.nodes,
            &mut state.next_czxid,
            self.id,
            &Op::create(path, value, mode),
        )?;
        state.fire_watches(&changed);
        match result {
            OpResult::Created { path } => Ok(path),
            _ => unreachable!("create op returned non-create result"),
        }
    }

    async fn get(&self, path: &str) -> KeeperResult<String> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(path)
            .map(|node| node.value.clone())
            .ok_or_else(|| KeeperError::NoNode(path.to_string()))
    }

    async fn try_get(&self, path: &str) -> KeeperResult<Option<String>> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|node| node.value.clone()))
    }

    async fn try_get_with_stat(&self, path: &str) -> KeeperResult<Option<(String, Stat)>> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|node| {
            let stat = Stat {
                czxid: node.czxid,
                num_children: child_names(&state.nodes, path).count(),
            };
            (node.value.clone(), stat)
        }))
    }

    async fn set(&self, path: &str, value: &str) -> KeeperResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        apply_op(
            &mut state.nodes,
            &mut state.next_czxid,
            self.id,
            &Op::set_data(path, value),
        )?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> KeeperResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        apply_op(
            &mut state.nodes,
            &mut state.next_czxid,
            self.id,
            &Op::remove(path),
        )?;
        state.fire_watches(path);
        Ok(())
    }

    async fn try_remove(&self, path: &str) -> KeeperResult<bool> {
        match self.remove(path).await {
            Ok(()) => Ok(true),
            Err(KeeperError::NoNode(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &str) -> KeeperResult<bool> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        Ok(state.nodes.contains_key(path))
    }

    async fn stat(&self, path: &str) -> KeeperResult<Option<Stat>> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|node| Stat {
            czxid: node.czxid,
            num_children: child_names(&state.nodes, path).count(),
        }))
    }

    async fn exists_watch(&self, path: &str) -> KeeperResult<(bool, Watch)> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let exists = state.nodes.contains_key(path);
        let (tx, rx) = oneshot::channel();
        state.watches.entry(path.to_string()).or_default().push(tx);
        Ok((exists, Watch::new(rx)))
    }

    async fn children(&self, path: &str) -> KeeperResult<Vec<String>> {
        self.check_alive()?;
        let state = self.state.lock().unwrap();
        if !path.is_empty() && !state.nodes.contains_key(path) {
            return Err(KeeperError::NoNode(path.to_string()));
        }
        Ok(child_names(&state.nodes, path).map(str::to_string).collect())
    }

    async fn multi(&self, ops: Vec<Op>) -> KeeperResult<Vec<OpResult>> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        // Apply against a scratch copy so a failing op leaves the tree
        // untouched. The czxid counter is allowed to advance on failure; it
        // only needs to stay monotonic.
        let mut scratch = state.nodes.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut changed = Vec::new();
        for op in &ops {
            let (result, path) = apply_op(&mut scratch, &mut state.next_czxid, self.id, op)?;
            if matches!(op, Op::Create { .. } | Op::Remove { .. }) {
                changed.push(path.clone());
            }
            results.push(result);
        }
        state.nodes = scratch;
        for path in changed {
            state.fire_watches(&path);
        }
        Ok(results)
    }

    async fn remove_recursive(&self, path: &str) -> KeeperResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = state
            .nodes
            .keys()
            .filter(|full| *full == path || full.starts_with(&prefix))
            .cloned()
            .collect();
        // Deepest first so no node is removed before its children.
        doomed.sort_by_key(|full| std::cmp::Reverse(full.len()));
        for full in doomed {
            state.nodes.remove(&full);
            state.fire_watches(&full);
        }
        Ok(())
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (MemoryCoordinator, Arc<MemorySession>) {
        let coord = MemoryCoordinator::new();
        let session = coord.new_session();
        (coord, session)
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let (_, k) = coordinator();
        k.create("/t", "root", CreateMode::Persistent).await.unwrap();
        k.create("/t/child", "v1", CreateMode::Persistent).await.unwrap();
        assert_eq!(k.get("/t/child").await.unwrap(), "v1");
        assert_eq!(
            k.create("/t/child", "v2", CreateMode::Persistent).await,
            Err(KeeperError::NodeExists("/t/child".into()))
        );
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let (_, k) = coordinator();
        assert!(matches!(
            k.create("/t/a/b", "", CreateMode::Persistent).await,
            Err(KeeperError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn sequential_suffixes_are_per_parent_and_ordered() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/log", "", CreateMode::Persistent).await.unwrap();
        let a = k
            .create("/t/log/log-", "a", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = k
            .create("/t/log/log-", "b", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/t/log/log-0000000000");
        assert_eq!(b, "/t/log/log-0000000001");

        let mut names = k.children("/t/log").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["log-0000000000", "log-0000000001"]);
    }

    #[tokio::test]
    async fn children_are_direct_only() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/a", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/a/deep", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/b", "", CreateMode::Persistent).await.unwrap();
        let mut names = k.children("/t").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn multi_is_atomic() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/a", "old", CreateMode::Persistent).await.unwrap();

        // Second op fails, so the first must not take effect.
        let err = k
            .multi(vec![
                Op::set_data("/t/a", "new"),
                Op::remove("/t/missing"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::NoNode(_)));
        assert_eq!(k.get("/t/a").await.unwrap(), "old");

        let results = k
            .multi(vec![
                Op::set_data("/t/a", "new"),
                Op::create("/t/b", "", CreateMode::Persistent),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(k.get("/t/a").await.unwrap(), "new");
        assert!(k.exists("/t/b").await.unwrap());
    }

    #[tokio::test]
    async fn czxid_orders_creations_globally() {
        let coord = MemoryCoordinator::new();
        let k1 = coord.new_session();
        let k2 = coord.new_session();
        k1.create("/t", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/a", "", CreateMode::Persistent).await.unwrap();
        k2.create("/t/b", "", CreateMode::Persistent).await.unwrap();
        let (_, stat_a) = k1.try_get_with_stat("/t/a").await.unwrap().unwrap();
        let (_, stat_b) = k1.try_get_with_stat("/t/b").await.unwrap().unwrap();
        assert!(stat_a.czxid < stat_b.czxid);
    }

    #[tokio::test]
    async fn watch_fires_once_on_create_and_on_delete() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();

        let (exists, watch) = k.exists_watch("/t/flag").await.unwrap();
        assert!(!exists);
        k.create("/t/flag", "", CreateMode::Persistent).await.unwrap();
        assert!(watch.wait_for(std::time::Duration::from_secs(1)).await);

        let (exists, watch) = k.exists_watch("/t/flag").await.unwrap();
        assert!(exists);
        k.remove("/t/flag").await.unwrap();
        assert!(watch.wait_for(std::time::Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn session_expiry_drops_ephemerals_and_poisons_handle() {
        let coord = MemoryCoordinator::new();
        let k1 = coord.new_session();
        let k2 = coord.new_session();
        k1.create("/t", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/alive", "id", CreateMode::Ephemeral).await.unwrap();

        let (_, watch) = k2.exists_watch("/t/alive").await.unwrap();
        assert_eq!(coord.session_owning("/t/alive"), Some(k1.id()));

        coord.expire_session(k1.id());
        assert!(k1.expired());
        assert_eq!(k1.get("/t").await, Err(KeeperError::SessionExpired));
        assert!(!k2.exists("/t/alive").await.unwrap());
        assert!(watch.wait_for(std::time::Duration::from_secs(1)).await);
        // The persistent node survives its creator's session.
        assert!(k2.exists("/t").await.unwrap());
    }

    #[tokio::test]
    async fn ephemerals_cannot_have_children() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/e", "", CreateMode::Ephemeral).await.unwrap();
        assert!(matches!(
            k.create("/t/e/x", "", CreateMode::Persistent).await,
            Err(KeeperError::NoChildrenForEphemeral(_))
        ));
    }

    #[tokio::test]
    async fn remove_recursive_clears_subtree() {
        let (_, k) = coordinator();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/a", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/a/b", "", CreateMode::Persistent).await.unwrap();
        k.create("/tother", "", CreateMode::Persistent).await.unwrap();
        k.remove_recursive("/t").await.unwrap();
        assert!(!k.exists("/t").await.unwrap());
        assert!(!k.exists("/t/a/b").await.unwrap());
        assert!(k.exists("/tother").await.unwrap());
    }
}
