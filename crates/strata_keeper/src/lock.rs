//! Abandonable locks over block numbers.
//!
//! A writer allocates a block number by creating a persistent-sequential lock
//! node whose value names an ephemeral holder node under the scratch
//! namespace. Three observable states follow:
//!
//! - the lock node is absent: the number was never allocated, or the insert
//!   that allocated it committed and folded the unlock into its commit multi
//!   (`Unlocked`);
//! - the lock node exists and its holder is alive: an insert is in flight
//!   (`Locked`);
//! - the lock node exists but the holder is gone: the insert died and the
//!   number will never be filled (`Abandoned`).
//!
//! Merge selection relies on `Abandoned` to prove a gap between two parts
//! contains no data.

use std::sync::Arc;

use crate::client::{parse_seq, CreateMode, Keeper, KeeperError, KeeperResult, Op};

/// Observable state of a block-number lock node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    Abandoned,
}

/// A held block-number allocation.
pub struct AbandonableLock {
    keeper: Arc<dyn Keeper>,
    lock_path: String,
    holder_path: String,
    number: u64,
    released: bool,
}

impl AbandonableLock {
    /// Allocate the next block number under `lock_prefix` (e.g.
    /// `/t/block_numbers/202608/block-`). `holder_token` must be unique per
    /// acquisition across the cluster; callers derive it from their active
    /// node identifier plus a local counter.
    pub async fn acquire(
        keeper: Arc<dyn Keeper>,
        temp_root: &str,
        lock_prefix: &str,
        holder_token: &str,
    ) -> KeeperResult<Self> {
        let holder_path = format!("{temp_root}/abandonable_lock-{holder_token}");
        keeper
            .create(&holder_path, "", CreateMode::Ephemeral)
            .await?;
        let lock_path = match keeper
            .create(lock_prefix, &holder_path, CreateMode::PersistentSequential)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                let _ = keeper.try_remove(&holder_path).await;
                return Err(err);
            }
        };
        let suffix_start = lock_path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        let prefix_name = &lock_prefix[lock_prefix.rfind('/').map(|i| i + 1).unwrap_or(0)..];
        let number = parse_seq(&lock_path[suffix_start..], prefix_name)
            .ok_or_else(|| KeeperError::BadPath(lock_path.clone()))?;
        Ok(Self {
            keeper,
            lock_path,
            holder_path,
            number,
            released: false,
        })
    }

    /// The allocated block number.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Removal ops to fold into the caller's commit multi. The caller must
    /// follow a successful multi with `committed()`.
    pub fn unlock_ops(&self) -> Vec<Op> {
        vec![
            Op::remove(self.lock_path.clone()),
            Op::remove(self.holder_path.clone()),
        ]
    }

    /// Mark the lock consumed by a successful commit multi.
    pub fn committed(mut self) {
        self.released = true;
    }

    /// Abandon the allocation: the lock node stays behind as a tombstone, the
    /// holder disappears, and the number is provably never filled.
    pub async fn abandon(mut self) {
        self.released = true;
        if let Err(err) = self.keeper.try_remove(&self.holder_path).await {
            tracing::debug!(path = %self.holder_path, error = %err, "failed to abandon block-number lock");
        }
    }

    /// Check the state of a lock node at `lock_path`.
    pub async fn check(keeper: &dyn Keeper, lock_path: &str) -> KeeperResult<LockState> {
        match keeper.try_get(lock_path).await? {
            None => Ok(LockState::Unlocked),
            Some(holder_path) => {
                if !holder_path.is_empty() && keeper.exists(&holder_path).await? {
                    Ok(LockState::Locked)
                } else {
                    Ok(LockState::Abandoned)
                }
            }
        }
    }
}

impl Drop for AbandonableLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropping without an explicit outcome abandons the number.
        let keeper = self.keeper.clone();
        let holder_path = std::mem::take(&mut self.holder_path);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = keeper.try_remove(&holder_path).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;

    async fn setup() -> Arc<dyn Keeper> {
        let coord = MemoryCoordinator::new();
        let k = coord.new_session();
        k.create("/t", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/temp", "", CreateMode::Persistent).await.unwrap();
        k.create("/t/block_numbers", "", CreateMode::Persistent)
            .await
            .unwrap();
        k.create("/t/block_numbers/202608", "", CreateMode::Persistent)
            .await
            .unwrap();
        k
    }

    #[tokio::test]
    async fn numbers_are_sequential() {
        let k = setup().await;
        let a = AbandonableLock::acquire(
            k.clone(),
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-0",
        )
        .await
        .unwrap();
        let b = AbandonableLock::acquire(
            k.clone(),
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-1",
        )
        .await
        .unwrap();
        assert_eq!(a.number(), 0);
        assert_eq!(b.number(), 1);
        a.abandon().await;
        b.abandon().await;
    }

    #[tokio::test]
    async fn held_lock_reads_locked() {
        let k = setup().await;
        let lock = AbandonableLock::acquire(
            k.clone(),
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-0",
        )
        .await
        .unwrap();
        let state = AbandonableLock::check(k.as_ref(), lock.lock_path())
            .await
            .unwrap();
        assert_eq!(state, LockState::Locked);
        lock.abandon().await;
    }

    #[tokio::test]
    async fn abandoned_lock_reads_abandoned() {
        let k = setup().await;
        let lock = AbandonableLock::acquire(
            k.clone(),
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-0",
        )
        .await
        .unwrap();
        let path = lock.lock_path().to_string();
        lock.abandon().await;
        let state = AbandonableLock::check(k.as_ref(), &path).await.unwrap();
        assert_eq!(state, LockState::Abandoned);
    }

    #[tokio::test]
    async fn committed_lock_leaves_no_trace() {
        let k = setup().await;
        let lock = AbandonableLock::acquire(
            k.clone(),
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-0",
        )
        .await
        .unwrap();
        let path = lock.lock_path().to_string();
        k.multi(lock.unlock_ops()).await.unwrap();
        lock.committed();
        let state = AbandonableLock::check(k.as_ref(), &path).await.unwrap();
        assert_eq!(state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn session_death_abandons_lock() {
        let coord = MemoryCoordinator::new();
        let k1 = coord.new_session();
        let k2 = coord.new_session();
        k1.create("/t", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/temp", "", CreateMode::Persistent).await.unwrap();
        k1.create("/t/block_numbers", "", CreateMode::Persistent)
            .await
            .unwrap();
        k1.create("/t/block_numbers/202608", "", CreateMode::Persistent)
            .await
            .unwrap();

        let lock = AbandonableLock::acquire(
            k1.clone() as Arc<dyn Keeper>,
            "/t/temp",
            "/t/block_numbers/202608/block-",
            "id-0",
        )
        .await
        .unwrap();
        let path = lock.lock_path().to_string();
        // Leak the guard so only session death releases the holder.
        std::mem::forget(lock);

        coord.expire_session(k1.id());
        let state = AbandonableLock::check(k2.as_ref(), &path).await.unwrap();
        assert_eq!(state, LockState::Abandoned);
    }
}
