//! Receiving side of a replication session.
//!
//! Holds the destination shard checked out for the whole conversation.
//! A full copy is staged into a `.tmp.*` directory next to the live
//! files and only swapped in, under the pool's exclusive lock, once the
//! footer confirms the copy is consistent and the end-of-changes marker
//! arrives. WAL changesets are applied to the staged copy when one
//! exists, to the live shard otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cluster::Endpoint;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::metrics::{
    CHANGESETS_APPLIED, FULL_COPIES, REPLICATION_CONNECTIONS, SESSIONS_FAILED,
};
use crate::store::{
    is_swap_stale, CheckedOutShard, OpenMode, Shard, ShardPool, StorageEngine, WalSink,
};
use crate::wire::framer::Framer;
use crate::wire::{decode_revision, DbHeader, GetChangesets, Message, Reply, Request};

enum Step {
    Continue,
    Shutdown,
}

pub struct ReplicaSession<E: StorageEngine, S> {
    framer: Framer<S>,
    pool: Arc<ShardPool<E>>,
    endpoint: Endpoint,
    live_path: PathBuf,
    shard: CheckedOutShard<E>,
    /// Failure to synchronize the cluster metadata shard is fatal to the
    /// whole process; cleared once the session completes.
    cluster_database: bool,
    current_uuid: String,
    current_revision: u64,
    switch_dir: Option<TempDir>,
    switch_shard: Option<CheckedOutShard<E>>,
    wal: Option<E::WalSink>,
    file_path: Option<PathBuf>,
    changesets: u64,
}

impl<E, S> ReplicaSession<E, S>
where
    E: StorageEngine,
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Checks the destination shard out (creating it if missing) and
    /// binds the session to an established stream. A busy shard surfaces
    /// as [`crate::store::StoreError::ShardBusy`] for the trigger to
    /// debounce.
    pub fn new(
        stream: S,
        pool: Arc<ShardPool<E>>,
        config: &ReplicationConfig,
        dst: Endpoint,
        cluster_database: bool,
    ) -> Result<Self> {
        let live_path = pool.resolve(&dst.path);
        let shard = pool.checkout(&live_path, OpenMode::CreateOrOpen)?;
        let framer = Framer::new(stream, config.max_message_size, live_path.clone());
        Ok(Self {
            framer,
            pool,
            endpoint: dst,
            live_path,
            shard,
            cluster_database,
            current_uuid: String::new(),
            current_revision: 0,
            switch_dir: None,
            switch_shard: None,
            wal: None,
            file_path: None,
            changesets: 0,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        REPLICATION_CONNECTIONS.increment(1);
        let result = self.run_inner().await;
        if let Err(e) = &result {
            SESSIONS_FAILED.increment(1);
            tracing::error!(shard = %self.endpoint, error = %e, "replication session failed");
        }
        self.reset();
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            let Some(msg) = self.framer.recv().await? else {
                return Err(Error::ConnectionClosed);
            };
            match self.dispatch(msg).await? {
                Step::Continue => {}
                Step::Shutdown => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Step> {
        match Reply::try_from(msg.kind)? {
            Reply::Welcome => self.reply_welcome().await,
            Reply::Exception => self.reply_exception(&msg),
            Reply::EndOfChanges => self.reply_end_of_changes().await,
            Reply::Fail => self.reply_fail(&msg),
            Reply::DbHeader => self.reply_db_header(&msg),
            Reply::DbFilename => self.reply_db_filename(&msg),
            Reply::DbFiledata => self.reply_db_filedata(&msg).await,
            Reply::DbFooter => self.reply_db_footer(&msg),
            Reply::Changeset => self.reply_changeset(&msg),
        }
    }

    /// The greeting asks for everything after our current revision.
    async fn reply_welcome(&mut self) -> Result<Step> {
        let request = GetChangesets {
            uuid: self.shard.shard().uuid().to_string(),
            revision: self.shard.shard().revision(),
            path: self.endpoint.path.clone(),
        };
        self.framer
            .send(Request::GetChangesets as u8, &request.encode())
            .await?;
        Ok(Step::Continue)
    }

    fn reply_exception(&mut self, msg: &Message) -> Result<Step> {
        let text = String::from_utf8_lossy(&msg.bytes()?).into_owned();
        Err(Error::Remote(text))
    }

    fn reply_fail(&mut self, msg: &Message) -> Result<Step> {
        let reason = msg.bytes()?;
        tracing::warn!(
            shard = %self.endpoint,
            reason = %String::from_utf8_lossy(&reason),
            "replication refused by the source"
        );
        self.reset();
        Ok(Step::Shutdown)
    }

    /// A header opens (or reopens) a full-copy phase: discard whatever
    /// was staged and start a fresh staging directory.
    fn reply_db_header(&mut self, msg: &Message) -> Result<Step> {
        let header = DbHeader::decode(msg.bytes()?)?;
        self.reset();
        let staging = tempfile::Builder::new()
            .prefix(".tmp.")
            .tempdir_in(&self.live_path)?;
        tracing::debug!(
            shard = %self.endpoint,
            uuid = %header.uuid,
            revision = header.revision,
            "receiving full copy"
        );
        self.current_uuid = header.uuid;
        self.current_revision = header.revision;
        self.switch_dir = Some(staging);
        Ok(Step::Continue)
    }

    fn reply_db_filename(&mut self, msg: &Message) -> Result<Step> {
        let Some(staging) = &self.switch_dir else {
            return Err(Error::Protocol("file name received outside a full copy"));
        };
        let name = String::from_utf8(msg.bytes()?.to_vec())
            .map_err(|_| Error::Format("file name is not valid utf-8"))?;
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::Protocol("file name escapes the shard directory"));
        }
        self.file_path = Some(staging.path().join(name));
        Ok(Step::Continue)
    }

    async fn reply_db_filedata(&mut self, msg: &Message) -> Result<Step> {
        let Some(dst) = self.file_path.take() else {
            return Err(Error::Protocol("file data received without a file name"));
        };
        // the spool file is on the same filesystem as the staging dir
        tokio::fs::rename(msg.file_path()?, &dst).await?;
        Ok(Step::Continue)
    }

    /// The footer tells us whether the copy we just received is from a
    /// single revision. If not, throw it away; the source retries.
    fn reply_db_footer(&mut self, msg: &Message) -> Result<Step> {
        let revision = decode_revision(msg.bytes()?)?;
        if self.switch_dir.is_none() {
            return Err(Error::Protocol("footer received outside a full copy"));
        }
        if revision != self.current_revision {
            tracing::debug!(
                shard = %self.endpoint,
                expected = self.current_revision,
                got = revision,
                "copy raced a writer, discarding staged files"
            );
            if let Some(staging) = self.switch_dir.take() {
                let _ = staging.close();
            }
            self.file_path = None;
        }
        Ok(Step::Continue)
    }

    /// Changesets after a consistent full copy top up the staged shard;
    /// without a copy they apply straight to the live shard. Either way
    /// the first one opens the transaction envelope and the WAL sink.
    fn reply_changeset(&mut self, msg: &Message) -> Result<Step> {
        let line = msg.bytes()?;
        if self.wal.is_none() {
            if let Some(staging) = &self.switch_dir {
                let switch = self
                    .pool
                    .checkout(staging.path(), OpenMode::Writable)?;
                switch.shard().begin_transaction()?;
                self.wal = Some(self.pool.engine().wal_sink(switch.shard())?);
                self.switch_shard = Some(switch);
            } else {
                self.shard.shard().begin_transaction()?;
                self.wal = Some(self.pool.engine().wal_sink(self.shard.shard())?);
            }
        }
        self.wal
            .as_mut()
            .expect("sink was just opened")
            .execute_line(&line)?;
        self.changesets += 1;
        CHANGESETS_APPLIED.increment(1);
        Ok(Step::Continue)
    }

    async fn reply_end_of_changes(&mut self) -> Result<Step> {
        let switching = self.switch_dir.is_some();
        if switching {
            self.wal = None;
            if let Some(switch) = self.switch_shard.take() {
                switch.shard().close();
            }
            self.shard.shard().do_close();

            let staging = self.switch_dir.take().expect("switching implies a staging dir");
            let lock = self.shard.lock_exclusive().await;
            // no reader is using the shard while we hold the lock
            swap_shard_files(staging.path(), &self.live_path)?;
            drop(lock);
            let _ = staging.close();
            FULL_COPIES.increment(1);
        }

        match (switching, self.changesets) {
            (true, 0) => tracing::debug!(
                shard = %self.endpoint,
                uuid = %self.current_uuid,
                "synchronized from a full copy"
            ),
            (true, n) => tracing::debug!(
                shard = %self.endpoint,
                uuid = %self.current_uuid,
                changesets = n,
                "synchronized from a full copy and a set of changesets"
            ),
            (false, 0) => tracing::debug!(shard = %self.endpoint, "no changes"),
            (false, n) => tracing::debug!(
                shard = %self.endpoint,
                changesets = n,
                "synchronized from a set of changesets"
            ),
        }

        if self.cluster_database {
            self.cluster_database = false;
            tracing::info!("cluster database synchronized");
        }
        Ok(Step::Shutdown)
    }

    /// Drops every in-flight artifact of the session: the WAL sink, the
    /// staged shard and its directory, the pending file name and the
    /// changeset count. Safe to call on any path, including drop.
    fn reset(&mut self) {
        self.wal = None;
        if let Some(switch) = self.switch_shard.take() {
            switch.shard().close();
        }
        if let Some(staging) = self.switch_dir.take() {
            let _ = staging.close();
        }
        self.file_path = None;
        self.changesets = 0;
    }
}

impl<E: StorageEngine, S> Drop for ReplicaSession<E, S> {
    fn drop(&mut self) {
        if self.cluster_database {
            super::cluster_fatal("cluster database session ended before completion");
        }
    }
}

/// The swap itself: delete the live base files and WAL segments, then
/// move the staged files over. Runs entirely inside the exclusive-lock
/// window.
fn swap_shard_files(staging: &std::path::Path, live: &std::path::Path) -> Result<()> {
    for entry in std::fs::read_dir(live)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && is_swap_stale(&entry.file_name().to_string_lossy()) {
            std::fs::remove_file(entry.path())?;
        }
    }
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        std::fs::rename(entry.path(), live.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, DuplexStream};

    use crate::cluster::Node;
    use crate::replication::primary::PrimarySession;
    use crate::store::wal::COMMIT_KIND;
    use crate::test::{make_line, TestEnv, ADD_KIND};

    use super::*;

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
    }

    fn endpoint(path: &str) -> Endpoint {
        Endpoint::new(Node::default(), path)
    }

    /// The leader side of a scripted conversation.
    struct ScriptedLeader {
        framer: Framer<DuplexStream>,
        _spool: tempfile::TempDir,
    }

    impl ScriptedLeader {
        fn new(stream: DuplexStream) -> Self {
            let spool = tempfile::tempdir().unwrap();
            Self {
                framer: Framer::new(stream, 1 << 26, spool.path().to_path_buf()),
                _spool: spool,
            }
        }

        async fn welcome_and_expect_request(&mut self) -> GetChangesets {
            self.framer.send(Reply::Welcome as u8, &[]).await.unwrap();
            let msg = self.framer.recv().await.unwrap().unwrap();
            assert_eq!(msg.kind, Request::GetChangesets as u8);
            GetChangesets::decode(msg.bytes().unwrap()).unwrap()
        }

        async fn send(&mut self, kind: Reply, payload: &[u8]) {
            self.framer.send(kind as u8, payload).await.unwrap();
        }

        /// Streams the base files of an on-disk shard, as a copy pass.
        async fn send_files_of(&mut self, dir: &std::path::Path) {
            for name in crate::store::BASE_FILENAMES {
                let path = dir.join(name);
                let Ok(mut file) = tokio::fs::File::open(&path).await else {
                    continue;
                };
                self.send(Reply::DbFilename, name.as_bytes()).await;
                self.framer
                    .send_file(Reply::DbFiledata as u8, &mut file)
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn fail_ends_the_session_cleanly() {
        let env = TestEnv::new();
        let (near, far) = duplex(64 * 1024);
        let session = ReplicaSession::new(
            far,
            env.pool().clone(),
            &config(),
            endpoint("wiki"),
            false,
        )
        .unwrap();
        let client = tokio::spawn(session.run());

        let mut leader = ScriptedLeader::new(near);
        let request = leader.welcome_and_expect_request().await;
        assert_eq!(request.path, "wiki");
        assert_eq!(request.revision, 0);
        leader.send(Reply::Fail, b"Database changing too fast").await;

        client.await.unwrap().unwrap();
        let live = env.root().join("wiki");
        assert!(env.temp_dirs(&live).is_empty());
    }

    #[tokio::test]
    async fn exception_surfaces_as_a_remote_error() {
        let env = TestEnv::new();
        let (near, far) = duplex(64 * 1024);
        let session = ReplicaSession::new(
            far,
            env.pool().clone(),
            &config(),
            endpoint("wiki"),
            false,
        )
        .unwrap();
        let client = tokio::spawn(session.run());

        let mut leader = ScriptedLeader::new(near);
        leader.welcome_and_expect_request().await;
        leader.send(Reply::Exception, b"shard `wiki` not found").await;

        assert!(matches!(
            client.await.unwrap(),
            Err(Error::Remote(text)) if text.contains("not found")
        ));
    }

    #[tokio::test]
    async fn interrupted_transfer_leaves_no_temp_dirs() {
        let env = TestEnv::new();
        let live = env.create_shard("wiki");
        let before = env.shard_meta(&live);

        let (near, far) = duplex(64 * 1024);
        let session = ReplicaSession::new(
            far,
            env.pool().clone(),
            &config(),
            endpoint("wiki"),
            false,
        )
        .unwrap();
        let client = tokio::spawn(session.run());

        let mut leader = ScriptedLeader::new(near);
        leader.welcome_and_expect_request().await;
        let header = DbHeader {
            uuid: uuid::Uuid::new_v4().to_string(),
            revision: 7,
        };
        leader.send(Reply::DbHeader, &header.encode()).await;
        leader.send(Reply::DbFilename, b"postlist.glass").await;
        drop(leader); // connection dies before the file body

        assert!(matches!(
            client.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
        assert!(env.temp_dirs(&live).is_empty());
        assert_eq!(env.shard_meta(&live), before);
    }

    #[tokio::test]
    async fn footer_mismatch_discards_the_staged_copy() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);
        let (leader_uuid, leader_revision) = leader_env.shard_meta(&leader_shard);

        let (near, far) = duplex(64 * 1024);
        let session = ReplicaSession::new(
            far,
            follower_env.pool().clone(),
            &config(),
            endpoint("wiki"),
            false,
        )
        .unwrap();
        let client = tokio::spawn(session.run());

        let mut leader = ScriptedLeader::new(near);
        leader.welcome_and_expect_request().await;

        // first pass raced a writer: footer disagrees with the header
        let header = DbHeader {
            uuid: leader_uuid.to_string(),
            revision: leader_revision - 1,
        };
        leader.send(Reply::DbHeader, &header.encode()).await;
        leader.send_files_of(&leader_shard).await;
        leader
            .send(
                Reply::DbFooter,
                &crate::wire::encode_revision(leader_revision),
            )
            .await;

        // second pass is consistent
        let header = DbHeader {
            uuid: leader_uuid.to_string(),
            revision: leader_revision,
        };
        leader.send(Reply::DbHeader, &header.encode()).await;
        leader.send_files_of(&leader_shard).await;
        leader
            .send(
                Reply::DbFooter,
                &crate::wire::encode_revision(leader_revision),
            )
            .await;
        leader.send(Reply::EndOfChanges, b"").await;

        client.await.unwrap().unwrap();

        let live = follower_env.root().join("wiki");
        assert_eq!(
            follower_env.shard_meta(&live),
            (leader_uuid, leader_revision)
        );
        assert!(follower_env.temp_dirs(&live).is_empty());
    }

    #[tokio::test]
    async fn full_copy_with_trailing_changesets() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);
        let (leader_uuid, leader_revision) = leader_env.shard_meta(&leader_shard);

        let (near, far) = duplex(64 * 1024);
        let session = ReplicaSession::new(
            far,
            follower_env.pool().clone(),
            &config(),
            endpoint("wiki"),
            false,
        )
        .unwrap();
        let client = tokio::spawn(session.run());

        let mut leader = ScriptedLeader::new(near);
        leader.welcome_and_expect_request().await;
        let header = DbHeader {
            uuid: leader_uuid.to_string(),
            revision: leader_revision,
        };
        leader.send(Reply::DbHeader, &header.encode()).await;
        leader.send_files_of(&leader_shard).await;
        leader
            .send(
                Reply::DbFooter,
                &crate::wire::encode_revision(leader_revision),
            )
            .await;
        // a transaction committed while the copy was on the wire
        leader
            .send(
                Reply::Changeset,
                &make_line(leader_revision, ADD_KIND, b"doc2"),
            )
            .await;
        leader
            .send(
                Reply::Changeset,
                &make_line(leader_revision, COMMIT_KIND, b""),
            )
            .await;
        leader.send(Reply::EndOfChanges, b"").await;

        client.await.unwrap().unwrap();

        let live = follower_env.root().join("wiki");
        let (uuid, revision) = follower_env.shard_meta(&live);
        assert_eq!(uuid, leader_uuid);
        assert_eq!(revision, leader_revision + 1);
        // both the copied document and the top-up are visible
        let docdata = follower_env.docdata(&live);
        assert_eq!(docdata, b"doc1doc2");
        assert!(follower_env.temp_dirs(&live).is_empty());
    }

    async fn sync_once(leader_env: &TestEnv, follower_env: &TestEnv, path: &str) {
        let (near, far) = duplex(64 * 1024);
        let server = PrimarySession::new(near, leader_env.pool().clone(), config());
        let session = ReplicaSession::new(
            far,
            follower_env.pool().clone(),
            &config(),
            endpoint(path),
            false,
        )
        .unwrap();
        let (server_result, client_result) = tokio::join!(server.run(), session.run());
        server_result.unwrap();
        client_result.unwrap();
    }

    #[tokio::test]
    async fn diverged_uuid_ends_in_an_atomic_swap() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);
        leader_env.commit_txn(&leader_shard, &[b"doc2"]);
        std::fs::write(leader_shard.join("docdata.0"), b"overflow volume").unwrap();

        sync_once(&leader_env, &follower_env, "wiki").await;

        let live = follower_env.root().join("wiki");
        assert_eq!(
            follower_env.shard_meta(&live),
            leader_env.shard_meta(&leader_shard)
        );
        assert_eq!(
            follower_env.docdata(&live),
            leader_env.docdata(&leader_shard)
        );
        assert_eq!(
            std::fs::read(live.join("docdata.0")).unwrap(),
            b"overflow volume"
        );
        assert!(follower_env.temp_dirs(&live).is_empty());
    }

    #[tokio::test]
    async fn wal_suffix_catches_a_stale_follower_up() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);

        // the follower was cloned at revision 1
        let follower_shard = follower_env.root().join("wiki");
        follower_env.copy_shard(&leader_shard, &follower_shard);

        leader_env.commit_txn(&leader_shard, &[b"doc2", b"doc3"]);
        leader_env.commit_txn(&leader_shard, &[b"doc4"]);

        sync_once(&leader_env, &follower_env, "wiki").await;

        assert_eq!(
            follower_env.shard_meta(&follower_shard),
            leader_env.shard_meta(&leader_shard)
        );
        assert_eq!(
            follower_env.docdata(&follower_shard),
            leader_env.docdata(&leader_shard)
        );
        assert!(follower_env.temp_dirs(&follower_shard).is_empty());
    }

    #[tokio::test]
    async fn resynchronizing_is_idempotent() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);

        sync_once(&leader_env, &follower_env, "wiki").await;
        let live = follower_env.root().join("wiki");
        let after_first = follower_env.shard_meta(&live);

        sync_once(&leader_env, &follower_env, "wiki").await;
        assert_eq!(follower_env.shard_meta(&live), after_first);
        assert_eq!(
            follower_env.docdata(&live),
            leader_env.docdata(&leader_shard)
        );
        assert!(follower_env.temp_dirs(&live).is_empty());
    }

    #[tokio::test]
    async fn fast_changing_leader_aborts_without_touching_the_follower() {
        let leader_env = TestEnv::new();
        let follower_env = TestEnv::new();
        let leader_shard = leader_env.create_shard("wiki");
        leader_env.commit_txn(&leader_shard, &[b"doc1"]);
        leader_env.set_churn(&leader_shard);

        sync_once(&leader_env, &follower_env, "wiki").await;

        let live = follower_env.root().join("wiki");
        // the freshly created destination shard is untouched
        assert_eq!(follower_env.shard_meta(&live).1, 0);
        assert!(follower_env.temp_dirs(&live).is_empty());
    }
}
