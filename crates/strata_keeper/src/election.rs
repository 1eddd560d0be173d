//! Ephemeral liveness holders and leader election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::{parse_seq, CreateMode, Keeper, KeeperError, KeeperResult};

/// Owns one ephemeral node and removes it on release.
///
/// Removal on drop is best-effort (spawned onto the current runtime); callers
/// that need the node gone before proceeding should use `release()`.
pub struct EphemeralNodeHolder {
    keeper: Arc<dyn Keeper>,
    path: String,
    armed: bool,
}

impl EphemeralNodeHolder {
    /// Create the ephemeral node and take ownership of it.
    pub async fn create(
        keeper: Arc<dyn Keeper>,
        path: impl Into<String>,
        value: &str,
    ) -> KeeperResult<Self> {
        let path = path.into();
        keeper.create(&path, value, CreateMode::Ephemeral).await?;
        Ok(Self {
            keeper,
            path,
            armed: true,
        })
    }

    /// Take ownership of an ephemeral node that already exists in this
    /// session (e.g. created inside a multi).
    pub fn existing(keeper: Arc<dyn Keeper>, path: impl Into<String>) -> Self {
        Self {
            keeper,
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Remove the node now.
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(err) = self.keeper.try_remove(&self.path).await {
            tracing::debug!(path = %self.path, error = %err, "failed to remove ephemeral node");
        }
    }
}

impl Drop for EphemeralNodeHolder {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let keeper = self.keeper.clone();
        let path = std::mem::take(&mut self.path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = keeper.try_remove(&path).await;
            });
        }
    }
}

/// Leader election over a group node.
///
/// Every candidate creates an ephemeral-sequential child; the smallest suffix
/// is the leader. Non-leaders watch the candidate directly ahead of them, so
/// one departure wakes exactly one waiter. The callback fires at most once;
/// leadership then lasts until the handle is released or the session dies.
pub struct LeaderElection {
    my_path: String,
    keeper: Arc<dyn Keeper>,
    stop: Arc<ElectionStop>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ElectionStop {
    stopped: AtomicBool,
    notify: Notify,
}

const CANDIDATE_PREFIX: &str = "leader_election-";

impl LeaderElection {
    /// Join the election group and start watching for leadership.
    pub async fn start(
        keeper: Arc<dyn Keeper>,
        election_path: &str,
        identifier: &str,
        on_leader: Box<dyn FnOnce() + Send>,
    ) -> KeeperResult<Self> {
        let my_path = keeper
            .create(
                &format!("{election_path}/{CANDIDATE_PREFIX}"),
                identifier,
                CreateMode::EphemeralSequential,
            )
            .await?;

        let stop = Arc::new(ElectionStop {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let task = tokio::spawn(election_loop(
            keeper.clone(),
            election_path.to_string(),
            my_path.clone(),
            on_leader,
            stop.clone(),
        ));

        Ok(Self {
            my_path,
            keeper,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    /// Leave the election: stop watching and remove the candidate node.
    pub async fn release(mut self) {
        self.stop.stopped.store(true, Ordering::SeqCst);
        self.stop.notify.notify_waiters();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let path = std::mem::take(&mut self.my_path);
        if let Err(err) = self.keeper.try_remove(&path).await {
            tracing::debug!(path = %path, error = %err, "failed to remove election candidate");
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.stop.stopped.store(true, Ordering::SeqCst);
        self.stop.notify.notify_waiters();
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        let keeper = self.keeper.clone();
        let path = std::mem::take(&mut self.my_path);
        if !path.is_empty() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = keeper.try_remove(&path).await;
                });
            }
        }
    }
}

async fn election_loop(
    keeper: Arc<dyn Keeper>,
    election_path: String,
    my_path: String,
    on_leader: Box<dyn FnOnce() + Send>,
    stop: Arc<ElectionStop>,
) {
    let my_name = my_path.rsplit('/').next().unwrap_or_default().to_string();
    let my_seq = match parse_seq(&my_name, CANDIDATE_PREFIX) {
        Some(seq) => seq,
        None => return,
    };

    loop {
        if stop.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut candidates: Vec<(u64, String)> = match keeper.children(&election_path).await {
            Ok(names) => names
                .into_iter()
                .filter_map(|name| parse_seq(&name, CANDIDATE_PREFIX).map(|seq| (seq, name)))
                .collect(),
            Err(KeeperError::SessionExpired) => return,
            Err(err) => {
                tracing::warn!(error = %err, "election children listing failed");
                return;
            }
        };
        candidates.sort();

        let Some(pos) = candidates.iter().position(|(seq, _)| *seq == my_seq) else {
            // Our candidate node is gone (released or session expired).
            return;
        };
        if pos == 0 {
            on_leader();
            return;
        }

        let predecessor = format!("{election_path}/{}", candidates[pos - 1].1);
        let watch = match keeper.exists_watch(&predecessor).await {
            Ok((true, watch)) => watch,
            Ok((false, _)) => continue,
            Err(KeeperError::SessionExpired) => return,
            Err(err) => {
                tracing::warn!(error = %err, "election predecessor watch failed");
                return;
            }
        };

        tokio::select! {
            _ = watch.wait() => {}
            _ = stop.notify.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn first_candidate_becomes_leader() {
        let coord = MemoryCoordinator::new();
        let k = coord.new_session();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/leader_election", "", CreateMode::Persistent)
            .await
            .unwrap();

        let led = Arc::new(AtomicBool::new(false));
        let led2 = led.clone();
        let _election = LeaderElection::start(
            k.clone() as Arc<dyn Keeper>,
            "/t/leader_election",
            "r1",
            Box::new(move || led2.store(true, Ordering::SeqCst)),
        )
        .await
        .unwrap();

        wait_until(|| led.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn successor_takes_over_when_leader_releases() {
        let coord = MemoryCoordinator::new();
        let k1 = coord.new_session();
        let k2 = coord.new_session();
        k1.create("/t", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/leader_election", "", CreateMode::Persistent)
            .await
            .unwrap();

        let leaders = Arc::new(AtomicUsize::new(0));
        let l1 = leaders.clone();
        let e1 = LeaderElection::start(
            k1.clone() as Arc<dyn Keeper>,
            "/t/leader_election",
            "r1",
            Box::new(move || {
                l1.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        let l2 = leaders.clone();
        let _e2 = LeaderElection::start(
            k2.clone() as Arc<dyn Keeper>,
            "/t/leader_election",
            "r2",
            Box::new(move || {
                l2.fetch_add(10, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        wait_until(|| leaders.load(Ordering::SeqCst) == 1).await;
        e1.release().await;
        wait_until(|| leaders.load(Ordering::SeqCst) == 11).await;
    }

    #[tokio::test]
    async fn session_expiry_promotes_successor() {
        let coord = MemoryCoordinator::new();
        let k1 = coord.new_session();
        let k2 = coord.new_session();
        k1.create("/t", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/leader_election", "", CreateMode::Persistent)
            .await
            .unwrap();

        let _e1 = LeaderElection::start(
            k1.clone() as Arc<dyn Keeper>,
            "/t/leader_election",
            "r1",
            Box::new(|| {}),
        )
        .await
        .unwrap();

        let led = Arc::new(AtomicBool::new(false));
        let led2 = led.clone();
        let _e2 = LeaderElection::start(
            k2.clone() as Arc<dyn Keeper>,
            "/t/leader_election",
            "r2",
            Box::new(move || led2.store(true, Ordering::SeqCst)),
        )
        .await
        .unwrap();

        coord.expire_session(k1.id());
        wait_until(|| led.load(Ordering::SeqCst)).await;
    }
}
