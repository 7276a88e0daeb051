//! Wire protocol: typed message frames over an ordered byte stream, with
//! an in-band framing switch for whole-file transfers.
//!
//! A normal frame is `[type: u8][length: varint][payload]`. A frame whose
//! type byte is [`FILE_FOLLOWS`] instead carries `[real type: u8]`
//! followed by the chunked file body (see [`framer`]); the receiver
//! surfaces it as a message whose payload is the path of a temp file.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

pub mod framer;
pub mod varint;

/// Reserved framing-switch byte, disjoint from both type-code namespaces.
pub const FILE_FOLLOWS: u8 = 0xfd;

/// First type code past the reply namespace.
pub const REPLY_MAX: u8 = 0x09;
/// First type code past the request namespace. The two namespaces are
/// disjoint so a misdirected message can never be misparsed.
pub const REQUEST_MAX: u8 = 0x11;

/// Requests a replica sends to the node it pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    GetChangesets = 0x10,
}

impl TryFrom<u8> for Request {
    type Error = Error;

    fn try_from(kind: u8) -> Result<Self> {
        match kind {
            0x10 => Ok(Request::GetChangesets),
            _ => Err(Error::UnexpectedMessage(kind)),
        }
    }
}

/// Replies streamed back by the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Welcome = 0x00,
    Exception = 0x01,
    EndOfChanges = 0x02,
    Fail = 0x03,
    DbHeader = 0x04,
    DbFilename = 0x05,
    DbFiledata = 0x06,
    DbFooter = 0x07,
    Changeset = 0x08,
}

impl TryFrom<u8> for Reply {
    type Error = Error;

    fn try_from(kind: u8) -> Result<Self> {
        match kind {
            0x00 => Ok(Reply::Welcome),
            0x01 => Ok(Reply::Exception),
            0x02 => Ok(Reply::EndOfChanges),
            0x03 => Ok(Reply::Fail),
            0x04 => Ok(Reply::DbHeader),
            0x05 => Ok(Reply::DbFilename),
            0x06 => Ok(Reply::DbFiledata),
            0x07 => Ok(Reply::DbFooter),
            0x08 => Ok(Reply::Changeset),
            _ => Err(Error::UnexpectedMessage(kind)),
        }
    }
}

/// One deframed message. File transfers arrive with their body already
/// written to a temp file owned by the framer.
#[derive(Debug)]
pub struct Message {
    pub kind: u8,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Inline(Bytes),
    File(PathBuf),
}

impl Message {
    pub fn bytes(&self) -> Result<Bytes> {
        match &self.payload {
            Payload::Inline(bytes) => Ok(bytes.clone()),
            Payload::File(_) => Err(Error::Protocol("expected an inline payload")),
        }
    }

    pub fn file_path(&self) -> Result<&PathBuf> {
        match &self.payload {
            Payload::File(path) => Ok(path),
            Payload::Inline(_) => Err(Error::Protocol("expected a file payload")),
        }
    }
}

/// `MSG_GET_CHANGESETS`: the replica's current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChangesets {
    pub uuid: String,
    pub revision: u64,
    pub path: String,
}

impl GetChangesets {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        varint::put_string(&mut buf, self.uuid.as_bytes());
        varint::put_varint(&mut buf, self.revision);
        varint::put_string(&mut buf, self.path.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            uuid: varint::get_utf8(&mut payload)?,
            revision: varint::get_varint(&mut payload)?,
            path: varint::get_utf8(&mut payload)?,
        })
    }
}

/// `REPLY_DB_HEADER`: identity of the copy that is about to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub uuid: String,
    pub revision: u64,
}

impl DbHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        varint::put_string(&mut buf, self.uuid.as_bytes());
        varint::put_varint(&mut buf, self.revision);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            uuid: varint::get_utf8(&mut payload)?,
            revision: varint::get_varint(&mut payload)?,
        })
    }
}

pub fn encode_revision(revision: u64) -> Bytes {
    let mut buf = BytesMut::new();
    varint::put_varint(&mut buf, revision);
    buf.freeze()
}

pub fn decode_revision(mut payload: Bytes) -> Result<u64> {
    varint::get_varint(&mut payload)
}
