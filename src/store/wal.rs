//! WAL engine seam. Lines are opaque to replication except for their
//! header: a revision and a kind, encoded with the same varint scheme as
//! the wire protocol. A transaction is a run of lines sharing a revision,
//! terminated by a commit line that advances the shard to revision + 1.

use bytes::Bytes;

use crate::wire::varint;

use super::StoreError;

/// Kind tag of a commit line; everything else is engine-private.
pub const COMMIT_KIND: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Commit,
    Other(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineHead {
    pub revision: u64,
    pub kind: LineKind,
}

impl LineHead {
    pub fn is_commit(&self) -> bool {
        matches!(self.kind, LineKind::Commit)
    }
}

/// Decodes the `[revision][kind]` header every WAL line starts with.
pub fn decode_line_head(line: &[u8]) -> Result<LineHead, StoreError> {
    let (revision, n) = match varint::peek_varint(line) {
        Ok(Some(v)) => v,
        _ => return Err(StoreError::InvalidWalLine),
    };
    let (kind, _) = match varint::peek_varint(&line[n..]) {
        Ok(Some(v)) => v,
        _ => return Err(StoreError::InvalidWalLine),
    };
    let kind = if kind == COMMIT_KIND {
        LineKind::Commit
    } else {
        LineKind::Other(kind)
    };
    Ok(LineHead { revision, kind })
}

/// Read cursor over a shard's WAL, used by the serving side.
pub trait WalCursor: Send {
    /// Whether the log still holds `revision`. `None` means the log has
    /// been trimmed past that point and a full copy is required.
    fn locate_revision(&mut self, revision: u64) -> Result<Option<u64>, StoreError>;

    /// Lines at or after `revision`, oldest first. Re-reads the log, so
    /// a later call observes lines appended since the previous one.
    fn find(
        &mut self,
        revision: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<Bytes, StoreError>> + Send + '_>, StoreError>;
}

/// Apply sink bound to one shard, used by the receiving side. Lines are
/// applied in receive order inside the transaction envelope the session
/// opened on the shard.
pub trait WalSink: Send {
    fn execute_line(&mut self, line: &[u8]) -> Result<(), StoreError>;
}
