//! Typed client surface over the coordinator tree.
//!
//! All durable replication state lives in a hierarchical store of text nodes.
//! The `Keeper` trait is the seam between the storage layer and any concrete
//! coordinator; higher layers never touch a wire protocol directly.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub type KeeperResult<T> = Result<T, KeeperError>;

/// Typed outcomes of coordinator operations.
///
/// `NoNode`/`NodeExists`/`NotEmpty` are logical conditions callers routinely
/// match on (a failed multi pre-check, a lost race). `SessionExpired` is the
/// transport-level condition the session supervisor reacts to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeeperError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("node at {0} still has children")]
    NotEmpty(String),
    #[error("ephemeral node {0} cannot have children")]
    NoChildrenForEphemeral(String),
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("bad path {0:?}")]
    BadPath(String),
}

/// Node creation modes.
///
/// Sequential modes append a 10-digit zero-padded suffix chosen by the
/// coordinator, monotonically increasing per parent, so lexical order of
/// children equals numeric order. Ephemeral nodes live exactly as long as the
/// creating session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Subset of node metadata the replication layer consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Global creation-order identifier; used as a cross-replica timestamp.
    pub czxid: u64,
    pub num_children: usize,
}

/// One operation inside an atomic `multi`.
#[derive(Clone, Debug)]
pub enum Op {
    Create {
        path: String,
        value: String,
        mode: CreateMode,
    },
    SetData {
        path: String,
        value: String,
    },
    Remove {
        path: String,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, value: impl Into<String>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            value: value.into(),
            mode,
        }
    }

    pub fn set_data(path: impl Into<String>, value: impl Into<String>) -> Self {
        Op::SetData {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove { path: path.into() }
    }
}

/// Per-op result of a successful `multi`.
#[derive(Clone, Debug)]
pub enum OpResult {
    /// Holds the final path, including any sequential suffix.
    Created { path: String },
    Set,
    Removed,
}

/// One-shot notification that a watched path was created or deleted.
///
/// A watch fires exactly once, on the next change of existence of the path it
/// was registered against. Dropping the watch deregisters it.
pub struct Watch {
    rx: oneshot::Receiver<()>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Wait until the watch fires.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }

    /// Wait until the watch fires or the timeout elapses. Returns whether the
    /// watch fired.
    pub async fn wait_for(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.rx).await.is_ok()
    }
}

/// Typed operations over the coordinator tree.
///
/// One `Keeper` instance corresponds to one coordinator session; ephemeral
/// nodes created through it live exactly as long as that session. After
/// `expired()` turns true every operation fails with `SessionExpired` and the
/// handle must be replaced wholesale.
#[async_trait]
pub trait Keeper: Send + Sync {
    /// Create a node, returning the final path (with the sequential suffix
    /// for `PersistentSequential` creates).
    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> KeeperResult<String>;

    async fn get(&self, path: &str) -> KeeperResult<String>;

    /// `get` that maps `NoNode` to `None`.
    async fn try_get(&self, path: &str) -> KeeperResult<Option<String>>;

    async fn try_get_with_stat(&self, path: &str) -> KeeperResult<Option<(String, Stat)>>;

    async fn set(&self, path: &str, value: &str) -> KeeperResult<()>;

    async fn remove(&self, path: &str) -> KeeperResult<()>;

    /// `remove` that maps `NoNode` to `false`.
    async fn try_remove(&self, path: &str) -> KeeperResult<bool>;

    async fn exists(&self, path: &str) -> KeeperResult<bool>;

    async fn stat(&self, path: &str) -> KeeperResult<Option<Stat>>;

    /// Current existence of the path plus a one-shot watch on its next
    /// creation or deletion.
    async fn exists_watch(&self, path: &str) -> KeeperResult<(bool, Watch)>;

    /// Direct children names (not full paths), in unspecified order.
    async fn children(&self, path: &str) -> KeeperResult<Vec<String>>;

    /// Apply all ops atomically: either every op takes effect or none does.
    async fn multi(&self, ops: Vec<Op>) -> KeeperResult<Vec<OpResult>>;

    /// Remove a subtree, deepest nodes first.
    async fn remove_recursive(&self, path: &str) -> KeeperResult<()>;

    /// Whether this session is dead. Sticky once true.
    fn expired(&self) -> bool;
}

/// Format a sequence number the way sequential nodes encode it.
pub fn format_seq(seq: u64) -> String {
    format!("{seq:010}")
}

/// Parse the numeric suffix of a sequential node name, given its prefix.
pub fn parse_seq(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}
