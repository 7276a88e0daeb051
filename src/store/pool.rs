//! Shard checkout and locking.
//!
//! Each shard directory gets a pair of locks: a session mutex so that at
//! most one replication session works a shard at a time, and a
//! reader/writer lock shared with local readers. A session holds the
//! shared side for its whole life and takes the exclusive side only for
//! the atomic-swap window.

use std::collections::{hash_map::Entry, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use uuid::Uuid;

use super::{OpenMode, Shard, StorageEngine, StoreError};

#[derive(Default, Clone)]
struct ShardSlot {
    session: Arc<tokio::sync::Mutex<()>>,
    lock: Arc<tokio::sync::RwLock<()>>,
}

type Slots = Arc<Mutex<HashMap<PathBuf, ShardSlot>>>;

pub struct ShardPool<E: StorageEngine> {
    engine: E,
    /// Node data directory; cluster-relative shard paths resolve below it.
    root: PathBuf,
    slots: Slots,
}

impl<E: StorageEngine> ShardPool<E> {
    pub fn new(engine: E, root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            root: root.into(),
            slots: Default::default(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a cluster-wide shard path to a directory on this node.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn slot(&self, path: &Path) -> ShardSlot {
        self.slots
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Checks a shard out for a replication session. Fails with
    /// [`StoreError::ShardBusy`] when another session already works this
    /// shard or a swap is in flight.
    pub fn checkout(&self, path: &Path, mode: OpenMode) -> Result<CheckedOutShard<E>, StoreError> {
        let slot = self.slot(path);
        let result = self.try_checkout(path, mode, &slot);
        if result.is_err() {
            // paths come from the remote peer; don't let a failed open
            // leave an orphan slot behind
            reclaim_slot(&self.slots, path, &slot);
        }
        result
    }

    fn try_checkout(
        &self,
        path: &Path,
        mode: OpenMode,
        slot: &ShardSlot,
    ) -> Result<CheckedOutShard<E>, StoreError> {
        let session = slot
            .session
            .clone()
            .try_lock_owned()
            .map_err(|_| StoreError::ShardBusy(path.to_path_buf()))?;
        let read = slot
            .lock
            .clone()
            .try_read_owned()
            .map_err(|_| StoreError::ShardBusy(path.to_path_buf()))?;
        let shard = self.engine.open(path, mode)?;
        Ok(CheckedOutShard {
            shard,
            path: path.to_path_buf(),
            slot: slot.clone(),
            slots: self.slots.clone(),
            session: Some(session),
            read: Some(read),
        })
    }

    /// Reads a shard's identity under the shared lock, without checking
    /// it out.
    pub async fn shard_meta(&self, path: &Path) -> Result<(Uuid, u64), StoreError> {
        let slot = self.slot(path);
        let result = {
            let _guard = slot.lock.read().await;
            self.engine
                .open(path, OpenMode::ReadOnly)
                .map(|shard| (shard.uuid(), shard.revision()))
        };
        // a metadata read holds nothing past the call
        reclaim_slot(&self.slots, path, &slot);
        result
    }
}

/// A shard handle plus the locks backing it. Checked back in on drop.
pub struct CheckedOutShard<E: StorageEngine> {
    shard: E::Shard,
    path: PathBuf,
    slot: ShardSlot,
    slots: Slots,
    session: Option<OwnedMutexGuard<()>>,
    read: Option<OwnedRwLockReadGuard<()>>,
}

impl<E: StorageEngine> CheckedOutShard<E> {
    pub fn shard(&self) -> &E::Shard {
        &self.shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Trades the session's shared lock for the exclusive one, waiting
    /// for local readers to drain. The session mutex is still held, so no
    /// other session can slip in between release and acquisition.
    pub async fn lock_exclusive(&mut self) -> ShardWriteLock {
        self.read.take();
        let guard = self.slot.lock.clone().write_owned().await;
        ShardWriteLock { _guard: guard }
    }
}

impl<E: StorageEngine> Drop for CheckedOutShard<E> {
    fn drop(&mut self) {
        self.session.take();
        self.read.take();
        reclaim_slot(&self.slots, &self.path, &self.slot);
    }
}

/// Drops the map entry for `path` once the map and the caller's `slot`
/// clone are the only holders left.
fn reclaim_slot(slots: &Slots, path: &Path, slot: &ShardSlot) {
    let mut slots = slots.lock();
    if let Entry::Occupied(entry) = slots.entry(path.to_path_buf()) {
        if Arc::strong_count(&slot.session) == 2 && Arc::strong_count(&slot.lock) == 2 {
            entry.remove();
        }
    }
}

/// Exclusive hold on a shard for the swap window. Readers are blocked
/// until this is dropped.
pub struct ShardWriteLock {
    _guard: OwnedRwLockWriteGuard<()>,
}

#[cfg(test)]
mod test {
    use crate::test::TestEnv;

    use super::*;

    #[tokio::test]
    async fn second_checkout_is_busy() {
        let env = TestEnv::new();
        let path = env.create_shard("shard");

        let first = env.pool().checkout(&path, OpenMode::Writable).unwrap();
        assert!(matches!(
            env.pool().checkout(&path, OpenMode::Writable),
            Err(StoreError::ShardBusy(_))
        ));
        drop(first);
        env.pool().checkout(&path, OpenMode::Writable).unwrap();
    }

    #[tokio::test]
    async fn meta_reads_coexist_with_a_checkout() {
        let env = TestEnv::new();
        let path = env.create_shard("shard");

        let checked_out = env.pool().checkout(&path, OpenMode::Writable).unwrap();
        let (uuid, revision) = env.pool().shard_meta(&path).await.unwrap();
        assert_eq!(uuid, checked_out.shard().uuid());
        assert_eq!(revision, 0);
    }

    #[tokio::test]
    async fn missing_shard_is_not_found() {
        let env = TestEnv::new();
        let path = env.root().join("nope");
        assert!(matches!(
            env.pool().checkout(&path, OpenMode::Writable),
            Err(StoreError::ShardNotFound(_))
        ));
        // a failed checkout must not leave a slot behind, however many
        // bad paths a peer asks for
        assert!(env.pool().slots.lock().is_empty());
    }

    #[tokio::test]
    async fn busy_checkout_keeps_the_holders_slot() {
        let env = TestEnv::new();
        let path = env.create_shard("shard");

        let held = env.pool().checkout(&path, OpenMode::Writable).unwrap();
        assert!(matches!(
            env.pool().checkout(&path, OpenMode::Writable),
            Err(StoreError::ShardBusy(_))
        ));
        assert_eq!(env.pool().slots.lock().len(), 1);
        drop(held);
        assert!(env.pool().slots.lock().is_empty());
    }

    #[tokio::test]
    async fn relative_paths_resolve_below_the_data_root() {
        let env = TestEnv::new();
        assert_eq!(env.pool().resolve("wiki/0"), env.root().join("wiki/0"));
        let abs = env.root().join("already/abs");
        assert_eq!(env.pool().resolve(abs.to_str().unwrap()), abs);
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_and_releases() {
        let env = TestEnv::new();
        let path = env.create_shard("shard");

        let mut checked_out = env.pool().checkout(&path, OpenMode::Writable).unwrap();
        let write = checked_out.lock_exclusive().await;

        // a metadata read must wait for the swap window to end
        let pool = env.pool().clone();
        let path2 = path.clone();
        let read = tokio::spawn(async move { pool.shard_meta(&path2).await.unwrap() });
        tokio::task::yield_now().await;
        assert!(!read.is_finished());

        drop(write);
        read.await.unwrap();
    }

    #[tokio::test]
    async fn slot_entries_are_reclaimed() {
        let env = TestEnv::new();
        let path = env.create_shard("shard");

        let checked_out = env.pool().checkout(&path, OpenMode::Writable).unwrap();
        assert_eq!(env.pool().slots.lock().len(), 1);
        drop(checked_out);
        assert!(env.pool().slots.lock().is_empty());
    }
}
