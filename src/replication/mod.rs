//! Shard replication: a follower pulls changesets (or a whole base copy)
//! from the node that owns the authoritative copy.
//!
//! [`primary::PrimarySession`] answers `GET_CHANGESETS` requests on the
//! serving side; [`replica::ReplicaSession`] drives the receiving side,
//! including the atomic swap of a staged full copy; [`trigger::Trigger`]
//! decides whether this node should pull at all, coalesces bursts of
//! triggers, and owns the accept loop.

pub mod primary;
pub mod replica;
pub mod trigger;

pub use primary::PrimarySession;
pub use replica::ReplicaSession;
pub use trigger::Trigger;

/// A shard flagged as the cluster metadata database must synchronize; a
/// node that cannot is useless to the cluster and exits.
pub(crate) fn cluster_fatal(reason: &str) -> ! {
    tracing::error!(reason, "cannot synchronize cluster database");
    std::process::exit(70);
}
