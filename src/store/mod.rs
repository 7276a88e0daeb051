//! Seam between the replication core and the shard storage engine.
//!
//! The engine itself (index format, search, WAL encoding internals) lives
//! in its own crate; replication only needs the identity of a shard, a
//! transaction envelope, and a way to read and apply WAL lines. A toy
//! file-backed engine implementing these traits for tests lives in
//! `crate::test`.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub mod pool;
pub mod wal;

pub use pool::{CheckedOutShard, ShardPool, ShardWriteLock};
pub use wal::{LineHead, LineKind, WalCursor, WalSink};

/// Base files of a shard, in the order they are streamed during a full
/// copy. The marker file comes last so a half-written copy is never
/// mistaken for a shard.
pub const BASE_FILENAMES: [&str; 7] = [
    "termlist.glass",
    "synonym.glass",
    "spelling.glass",
    "docdata.glass",
    "position.glass",
    "postlist.glass",
    "iamglass",
];

/// Presence of this file marks a directory as a shard.
pub const MARKER_FILENAME: &str = "iamglass";

/// Overflow volumes of the document store: `docdata.0`, `docdata.1`, …
/// numbered densely.
pub fn volume_filename(volume: usize) -> String {
    format!("docdata.{volume}")
}

/// Files replaced when a staged full copy is swapped over a live shard:
/// the base files (the `glass` suffix also covers the marker) and the
/// WAL segments.
pub fn is_swap_stale(name: &str) -> bool {
    name.ends_with("glass") || name.starts_with("wal.")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shard `{0}` is busy")]
    ShardBusy(PathBuf),
    #[error("shard `{0}` not found")]
    ShardNotFound(PathBuf),
    #[error("invalid write-ahead log line")]
    InvalidWalLine,
    #[error("failed to apply write-ahead log line: {0}")]
    WalApply(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Writable,
    CreateOrOpen,
}

/// The storage engine, as far as replication is concerned.
pub trait StorageEngine: Send + Sync + 'static {
    type Shard: Shard;
    type WalCursor: WalCursor;
    type WalSink: WalSink;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Shard, StoreError>;

    /// A read cursor over the shard's WAL, for the serving side.
    fn wal_cursor(&self, path: &Path) -> Result<Self::WalCursor, StoreError>;

    /// An apply sink bound to an open shard, for the receiving side.
    fn wal_sink(&self, shard: &Self::Shard) -> Result<Self::WalSink, StoreError>;
}

/// An open shard. Identity is read at open time and stable for the life
/// of the handle.
pub trait Shard: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn revision(&self) -> u64;
    fn db_path(&self) -> &Path;

    fn begin_transaction(&self) -> Result<(), StoreError>;

    /// Flush and close internal handles.
    fn close(&self);

    /// Drop every internal handle without flushing. Called right before
    /// the shard's files are replaced from a staged copy.
    fn do_close(&self);
}
