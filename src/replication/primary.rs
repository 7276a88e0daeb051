//! Serving side of a replication session.
//!
//! Answers a follower's `GET_CHANGESETS` with either a WAL suffix or a
//! whole-database copy plus whatever suffix accumulated during the copy.
//! The leader is never quiesced: base files may change while they are
//! being streamed, so the copy loop compares the shard revision before
//! and after each pass and retries on a budget.

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::metrics::{REPLICATION_CONNECTIONS, SESSIONS_FAILED};
use crate::store::wal::decode_line_head;
use crate::store::{volume_filename, ShardPool, StorageEngine, WalCursor, BASE_FILENAMES};
use crate::wire::framer::Framer;
use crate::wire::{encode_revision, DbHeader, GetChangesets, Reply, Request};

enum FullCopy {
    Done(u64),
    ChangingTooFast,
}

pub struct PrimarySession<E: StorageEngine, S> {
    framer: Framer<S>,
    pool: Arc<ShardPool<E>>,
    config: ReplicationConfig,
}

impl<E, S> PrimarySession<E, S>
where
    E: StorageEngine,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, pool: Arc<ShardPool<E>>, config: ReplicationConfig) -> Self {
        let framer = Framer::new(stream, config.max_message_size, std::env::temp_dir());
        Self {
            framer,
            pool,
            config,
        }
    }

    /// Greets the peer, then answers requests until it hangs up.
    pub async fn run(mut self) -> Result<()> {
        REPLICATION_CONNECTIONS.increment(1);
        let result = self.run_inner().await;
        if result.is_err() {
            SESSIONS_FAILED.increment(1);
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.framer.send(Reply::Welcome as u8, &[]).await?;
        while let Some(msg) = self.framer.recv().await? {
            match Request::try_from(msg.kind)? {
                Request::GetChangesets => {
                    let request = GetChangesets::decode(msg.bytes()?)?;
                    match self.get_changesets(request).await {
                        Ok(()) => {}
                        Err(e) if e.is_timeout() => {
                            // the peer may have stopped listening; try to
                            // tell it, then give up on the connection
                            let _ = self
                                .framer
                                .send(Reply::Exception as u8, e.to_string().as_bytes())
                                .await;
                            return Err(e);
                        }
                        Err(Error::Io(e)) => return Err(e.into()),
                        Err(Error::Store(e)) => {
                            tracing::warn!(error = %e, "changeset request failed");
                            self.framer
                                .send(Reply::Exception as u8, e.to_string().as_bytes())
                                .await?;
                        }
                        Err(e) => {
                            let _ = self.framer.send(Reply::Exception as u8, &[]).await;
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_changesets(&mut self, request: GetChangesets) -> Result<()> {
        if request.path.is_empty() {
            self.framer
                .send(Reply::Fail as u8, b"Database must have a valid path")
                .await?;
            return Ok(());
        }
        let path = self.pool.resolve(&request.path);

        let (mut uuid, mut db_revision) = self.pool.shard_meta(&path).await?;

        let mut from_revision = request.revision;
        if from_revision != 0 && uuid.to_string() != request.uuid {
            from_revision = 0;
        }
        let mut wal = self.pool.engine().wal_cursor(&path)?;
        if from_revision != 0 && wal.locate_revision(from_revision)?.is_none() {
            from_revision = 0;
        }
        let mut to_revision = from_revision;

        if to_revision < db_revision {
            if to_revision == 0 {
                match self.send_full_copy(&path, &mut uuid, &mut db_revision).await? {
                    FullCopy::Done(revision) => to_revision = revision,
                    FullCopy::ChangingTooFast => {
                        tracing::warn!(path = %request.path, "shard changed on every copy pass, giving up");
                        self.framer
                            .send(Reply::Fail as u8, b"Database changing too fast")
                            .await?;
                        return Ok(());
                    }
                }
            }
            self.stream_changesets(&path, &mut wal, to_revision, db_revision)
                .await?;
        }
        self.framer.send(Reply::EndOfChanges as u8, &[]).await?;
        tracing::debug!(
            path = %request.path,
            from = from_revision,
            "changeset request served"
        );
        Ok(())
    }

    /// Streams every base file, bracketed by a header and a footer
    /// carrying the shard revision at each end of the pass. A mismatch
    /// means a writer raced the copy; re-send until it sticks or the
    /// budget runs out.
    async fn send_full_copy(
        &mut self,
        path: &Path,
        uuid: &mut Uuid,
        db_revision: &mut u64,
    ) -> Result<FullCopy> {
        let mut copies_left = self.config.full_copy_budget;
        loop {
            let meta = self.pool.shard_meta(path).await?;
            *uuid = meta.0;
            *db_revision = meta.1;
            let header = DbHeader {
                uuid: uuid.to_string(),
                revision: *db_revision,
            };
            self.framer
                .send(Reply::DbHeader as u8, &header.encode())
                .await?;

            for name in BASE_FILENAMES {
                self.send_base_file(path, name).await?;
            }
            for volume in 0usize.. {
                if !self.send_base_file(path, &volume_filename(volume)).await? {
                    break;
                }
            }

            let (_, final_revision) = self.pool.shard_meta(path).await?;
            self.framer
                .send(Reply::DbFooter as u8, &encode_revision(final_revision))
                .await?;

            if final_revision == *db_revision {
                return Ok(FullCopy::Done(*db_revision));
            }
            copies_left -= 1;
            if copies_left == 0 {
                return Ok(FullCopy::ChangingTooFast);
            }
            tracing::debug!(
                expected = *db_revision,
                got = final_revision,
                copies_left,
                "shard changed during copy, retrying"
            );
        }
    }

    async fn send_base_file(&mut self, dir: &Path, name: &str) -> Result<bool> {
        let mut file = match tokio::fs::File::open(dir.join(name)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.framer
            .send(Reply::DbFilename as u8, name.as_bytes())
            .await?;
        self.framer
            .send_file(Reply::DbFiledata as u8, &mut file)
            .await?;
        Ok(true)
    }

    /// Walks the WAL from `to_revision`, holding each transaction's lines
    /// back until its commit line so the follower never sees an
    /// uncommitted prefix. Re-reads the shard revision between passes to
    /// pick up transactions committed while streaming.
    async fn stream_changesets(
        &mut self,
        path: &Path,
        wal: &mut E::WalCursor,
        mut to_revision: u64,
        mut db_revision: u64,
    ) -> Result<()> {
        for _ in 0..self.config.wal_iteration_budget {
            let mut pending: Vec<Bytes> = Vec::new();
            for line in wal.find(to_revision)? {
                let line = line?;
                let head = decode_line_head(&line)?;
                if head.revision >= db_revision {
                    break;
                }
                if head.is_commit() {
                    for pending_line in pending.drain(..) {
                        self.framer
                            .send(Reply::Changeset as u8, &pending_line)
                            .await?;
                    }
                    self.framer.send(Reply::Changeset as u8, &line).await?;
                    to_revision += 1;
                } else {
                    pending.push(line);
                }
            }
            db_revision = self.pool.shard_meta(path).await?.1;
            if to_revision >= db_revision {
                break;
            }
        }
        Ok(())
    }
}
