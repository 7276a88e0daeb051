use std::io;

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed frame: {0}")]
    Format(&'static str),
    #[error("message of {0} bytes exceeds the {1} byte limit")]
    MessageTooLarge(u64, u64),
    #[error("unexpected message type `{0:#04x}`")]
    UnexpectedMessage(u8),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("remote replication error: {0}")]
    Remote(String),
    #[error("connection closed mid-session")]
    ConnectionClosed,
}

impl Error {
    /// Send timeouts are the one network error the server replies to
    /// before shutting down; everything else closes the connection cold.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock)
    }
}
