use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tempfile::{TempDir, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::metrics::{REPLICATION_RECEIVED_BYTES, REPLICATION_SENT_BYTES};
use crate::wire::{varint, Message, Payload, FILE_FOLLOWS};

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Frames and deframes messages on an ordered, reliable byte stream.
///
/// Incoming file transfers are spooled into temp files under a lazily
/// created `.tmp.*` directory below `temp_base`; the temp directory and
/// any file bodies that were never claimed are removed when the framer is
/// dropped.
pub struct Framer<S> {
    stream: S,
    buf: BytesMut,
    max_message_size: u64,
    temp_base: PathBuf,
    temp_dir: Option<TempDir>,
    temp_files: Vec<TempPath>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framer<S> {
    pub fn new(stream: S, max_message_size: u64, temp_base: PathBuf) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            max_message_size,
            temp_base,
            temp_dir: None,
            temp_files: Vec::new(),
        }
    }

    /// Reads the next message, switching framing when the peer announces
    /// a file body. Returns `None` on a clean end of stream; an end of
    /// stream inside a frame is a [`Error::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if self.buf.len() >= 2 && self.buf[0] == FILE_FOLLOWS {
                let kind = self.buf[1];
                self.buf.advance(2);
                let path = self.recv_file().await?;
                return Ok(Some(Message {
                    kind,
                    payload: Payload::File(path),
                }));
            }
            if !self.buf.is_empty() && self.buf[0] != FILE_FOLLOWS {
                if let Some((len, len_bytes)) = varint::peek_varint(&self.buf[1..])? {
                    if len > self.max_message_size {
                        return Err(Error::MessageTooLarge(len, self.max_message_size));
                    }
                    if self.buf.len() >= 1 + len_bytes + len as usize {
                        let kind = self.buf[0];
                        self.buf.advance(1 + len_bytes);
                        let payload = self.buf.split_to(len as usize).freeze();
                        return Ok(Some(Message {
                            kind,
                            payload: Payload::Inline(payload),
                        }));
                    }
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }

    pub async fn send(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let mut head = BytesMut::with_capacity(1 + varint::MAX_VARINT_LEN);
        head.put_u8(kind);
        varint::put_varint(&mut head, payload.len() as u64);
        self.stream.write_all(&head).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        REPLICATION_SENT_BYTES.increment((head.len() + payload.len()) as u64);
        Ok(())
    }

    /// Sends `file` under the file-follows framing: length-prefixed
    /// chunks terminated by a zero-length chunk.
    pub async fn send_file(&mut self, kind: u8, file: &mut tokio::fs::File) -> Result<()> {
        self.stream.write_all(&[FILE_FOLLOWS, kind]).await?;
        let mut sent = 2u64;
        let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk).await?;
            let mut head = BytesMut::with_capacity(varint::MAX_VARINT_LEN);
            varint::put_varint(&mut head, n as u64);
            self.stream.write_all(&head).await?;
            sent += head.len() as u64;
            if n == 0 {
                break;
            }
            self.stream.write_all(&chunk[..n]).await?;
            sent += n as u64;
        }
        self.stream.flush().await?;
        REPLICATION_SENT_BYTES.increment(sent);
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        REPLICATION_RECEIVED_BYTES.increment(n as u64);
        Ok(n)
    }

    async fn recv_file(&mut self) -> Result<PathBuf> {
        let dir = self.ensure_temp_dir()?.to_path_buf();
        let (file, temp_path) = tempfile::Builder::new()
            .prefix("seekd.")
            .tempfile_in(dir)?
            .into_parts();
        let mut out = tokio::fs::File::from_std(file);
        loop {
            let len = self.recv_chunk_len().await?;
            if len == 0 {
                break;
            }
            if len > self.max_message_size {
                return Err(Error::MessageTooLarge(len, self.max_message_size));
            }
            let mut remaining = len as usize;
            while remaining > 0 {
                if self.buf.is_empty() && self.fill().await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
                let take = remaining.min(self.buf.len());
                out.write_all(&self.buf[..take]).await?;
                self.buf.advance(take);
                remaining -= take;
            }
        }
        out.flush().await?;
        let path = temp_path.to_path_buf();
        self.temp_files.push(temp_path);
        Ok(path)
    }

    async fn recv_chunk_len(&mut self) -> Result<u64> {
        loop {
            if let Some((len, len_bytes)) = varint::peek_varint(&self.buf)? {
                self.buf.advance(len_bytes);
                return Ok(len);
            }
            if self.fill().await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn ensure_temp_dir(&mut self) -> Result<&Path> {
        if self.temp_dir.is_none() {
            let base: &Path = if self.temp_base.as_os_str().is_empty() {
                Path::new("/tmp")
            } else {
                &self.temp_base
            };
            self.temp_dir = Some(tempfile::Builder::new().prefix(".tmp.").tempdir_in(base)?);
        }
        Ok(self
            .temp_dir
            .as_ref()
            .expect("temp dir was just created")
            .path())
    }
}
