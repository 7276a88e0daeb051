//! Decides when this node pulls a shard, and from whom.
//!
//! Triggers arrive from discovery whenever a shard may be stale. The
//! node first checks that it is a legitimate replica for the index, then
//! connects and starts a [`ReplicaSession`]. A busy destination shard is
//! retried after a randomized delay; triggers for the same shard inside
//! the delay window coalesce into one retry. The accept loop for the
//! serving side lives here too.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::cluster::{Endpoint, Node, NodeResolver};
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::replication::{cluster_fatal, PrimarySession, ReplicaSession};
use crate::store::{ShardPool, StorageEngine, StoreError, MARKER_FILENAME};

pub struct Trigger<E: StorageEngine> {
    pool: Arc<ShardPool<E>>,
    config: ReplicationConfig,
    local_node: Node,
    resolver: Arc<dyn NodeResolver>,
    debounce: Debouncer,
    jobs: Arc<Semaphore>,
}

impl<E: StorageEngine> Trigger<E> {
    pub fn new(
        pool: Arc<ShardPool<E>>,
        config: ReplicationConfig,
        local_node: Node,
        resolver: Arc<dyn NodeResolver>,
    ) -> Arc<Self> {
        let jobs = Arc::new(Semaphore::new(config.max_replication_jobs));
        Arc::new(Self {
            pool,
            config,
            local_node,
            resolver,
            debounce: Debouncer::default(),
            jobs,
        })
    }

    /// Entry point for "this shard may be stale" notifications.
    pub async fn trigger_replication(
        self: Arc<Self>,
        src: Endpoint,
        dst: Endpoint,
        cluster_database: bool,
    ) {
        if !self.should_replicate(&src).await {
            if cluster_database {
                cluster_fatal("this node does not replicate the cluster database");
            }
            tracing::trace!(%src, "not a replica for this index, ignoring trigger");
            return;
        }
        let addr = src.node.replication_addr();
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                if cluster_database {
                    cluster_fatal("cannot reach the cluster database source");
                }
                tracing::warn!(%src, error = %e, "cannot connect to replication source");
                return;
            }
        };
        self.start_session(stream, src, dst, cluster_database).await;
    }

    /// Binds a replica session to an established stream and runs it on
    /// the job pool. A busy destination shard schedules a coalesced
    /// retry instead of blocking.
    pub(crate) async fn start_session<S>(
        self: Arc<Self>,
        stream: S,
        src: Endpoint,
        dst: Endpoint,
        cluster_database: bool,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let permit = self
            .jobs
            .clone()
            .acquire_owned()
            .await
            .expect("job semaphore closed");
        let session = match ReplicaSession::new(
            stream,
            self.pool.clone(),
            &self.config,
            dst.clone(),
            cluster_database,
        ) {
            Ok(session) => session,
            Err(Error::Store(StoreError::ShardBusy(_))) => {
                tracing::debug!(%dst, "destination shard is busy, retrying later");
                self.schedule_retry(src, dst, cluster_database);
                return;
            }
            Err(e) => {
                if cluster_database {
                    cluster_fatal("cannot open the cluster database for replication");
                }
                tracing::error!(%dst, error = %e, "cannot initialize replication");
                return;
            }
        };
        tracing::debug!(%src, %dst, "shard being synchronized");
        tokio::spawn(async move {
            let _permit = permit;
            // the session logs its own failures
            let _ = session.run().await;
        });
    }

    fn schedule_retry(self: &Arc<Self>, src: Endpoint, dst: Endpoint, cluster_database: bool) {
        let delay = self
            .config
            .debounce_delay
            .mul_f64(rand::thread_rng().gen::<f64>());
        let trigger = self.clone();
        self.debounce.schedule(dst.path.clone(), delay, async move {
            trigger.trigger_replication(src, dst, cluster_database).await;
        });
    }

    /// A node replicates an index when the index already lives here, when
    /// it is the cluster metadata database, or when discovery says this
    /// node should hold a replica. It never pulls from itself.
    async fn should_replicate(&self, src: &Endpoint) -> bool {
        if src.is_local(&self.local_node) {
            return false;
        }
        if src.path == "./" {
            return true;
        }
        if self.pool.resolve(&src.path).join(MARKER_FILENAME).exists() {
            return true;
        }
        let nodes = self.resolver.resolve_index_nodes(&src.path).await;
        nodes.iter().any(|node| self.local_node.is_superset(node))
    }

    /// Accept loop of the serving side.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "replication peer connected");
            let session = PrimarySession::new(stream, self.pool.clone(), self.config.clone());
            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    tracing::warn!(error = %e, "serving session ended with an error");
                }
            });
        }
    }
}

/// Coalesces bursts of retries: any number of schedules for one key
/// inside the delay window run the action exactly once.
#[derive(Default)]
struct Debouncer {
    pending: Arc<Mutex<HashSet<String>>>,
}

impl Debouncer {
    fn schedule<F>(&self, key: String, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut pending = self.pending.lock();
            if !pending.insert(key.clone()) {
                return;
            }
        }
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().remove(&key);
            action.await;
        });
    }
}
