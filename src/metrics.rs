#![allow(dead_code)]
use metrics::{describe_counter, register_counter, Counter};
use once_cell::sync::Lazy;

pub static REPLICATION_CONNECTIONS: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_connections";
    describe_counter!(NAME, "number of replication sessions opened");
    register_counter!(NAME)
});
pub static REPLICATION_SENT_BYTES: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_sent_bytes";
    describe_counter!(NAME, "bytes written to replication peers");
    register_counter!(NAME)
});
pub static REPLICATION_RECEIVED_BYTES: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_received_bytes";
    describe_counter!(NAME, "bytes read from replication peers");
    register_counter!(NAME)
});
pub static CHANGESETS_APPLIED: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_changesets_applied";
    describe_counter!(NAME, "WAL changesets applied to local shards");
    register_counter!(NAME)
});
pub static FULL_COPIES: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_full_copies";
    describe_counter!(NAME, "whole-database copies received");
    register_counter!(NAME)
});
pub static SESSIONS_FAILED: Lazy<Counter> = Lazy::new(|| {
    const NAME: &str = "seekd_replication_sessions_failed";
    describe_counter!(NAME, "replication sessions that ended in an error");
    register_counter!(NAME)
});
