use std::net::SocketAddr;
use std::time::Duration;

/// Tunables for both replication roles and the trigger.
///
/// The defaults mirror what the cluster runs in production; the consumer
/// overrides individual fields from its own configuration surface.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Address the consumer binds the replication listener to.
    pub listen_addr: SocketAddr,
    /// Maximum number of concurrently running replication jobs.
    pub max_replication_jobs: usize,
    /// Upper bound of a single framed message payload.
    pub max_message_size: u64,
    /// How many whole-database copies the server attempts before giving
    /// up on a leader whose revision keeps advancing mid-copy.
    pub full_copy_budget: u32,
    /// How many times the server re-reads the leader revision and
    /// re-iterates the WAL before sending the end-of-changes marker.
    pub wal_iteration_budget: u32,
    /// Busy destination shards are retried after a random delay drawn
    /// from this window; triggers arriving inside the window coalesce.
    pub debounce_delay: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8881).into(),
            max_replication_jobs: 4,
            max_message_size: 64 * 1024 * 1024,
            full_copy_budget: 5,
            wal_iteration_budget: 5,
            debounce_delay: Duration::from_millis(3000),
        }
    }
}
