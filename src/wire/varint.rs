//! Length encoding shared by the message framing, the payload fields and
//! the WAL line headers: little-endian base-128 with a continuation bit,
//! at most ten bytes for a `u64`.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub const MAX_VARINT_LEN: usize = 10;

pub fn put_varint(buf: &mut impl BufMut, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decodes a varint from the front of `buf` without consuming it.
///
/// Returns `Ok(None)` when the buffer holds an incomplete prefix, and the
/// number of bytes the value occupies otherwise.
pub fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if i == MAX_VARINT_LEN - 1 && b > 0x01 {
            return Err(Error::Format("varint overflows 64 bits"));
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(Error::Format("varint overflows 64 bits"));
    }
    Ok(None)
}

/// Decodes a varint from a complete payload, consuming it.
pub fn get_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::Format("truncated varint"));
        }
        let b = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && b > 0x01 {
            return Err(Error::Format("varint overflows 64 bits"));
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Format("varint overflows 64 bits"))
}

pub fn put_string(buf: &mut impl BufMut, s: &[u8]) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s);
}

pub fn get_string(buf: &mut bytes::Bytes) -> Result<bytes::Bytes> {
    let len = get_varint(buf)?;
    if len > buf.remaining() as u64 {
        return Err(Error::Format("truncated string"));
    }
    Ok(buf.split_to(len as usize))
}

pub fn get_utf8(buf: &mut bytes::Bytes) -> Result<String> {
    let raw = get_string(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Format("string is not valid utf-8"))
}
