//! Cursor-based binary codec.
//!
//! All integers are little-endian. Byte strings carry a u64 length prefix.
//!
//! Binary format of a key:
//! ```text
//! [chain_info: u64][b: i64][c: i64]   (24 bytes)
//! ```

use crate::address::Address;
use crate::error::DecodeError;
use crate::key::DbKey;

type DecodeResult<T> = std::result::Result<T, DecodeError>;

// ── ByteWriter ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_len(&mut self, len: usize) {
        self.put_u64(len as u64);
    }

    /// Length-prefixed bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_len(v.len());
        self.buf.extend_from_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    /// Raw bytes, no prefix.
    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn put_key(&mut self, key: &DbKey) {
        self.buf.extend_from_slice(&key.to_bytes());
    }

    pub fn put_address(&mut self, addr: &Address) {
        self.put_u64(addr.serial());
    }
}

// ── ByteReader ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> DecodeResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated { needed: n, remaining: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> DecodeResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::Invalid(format!("bool byte {}", other))),
        }
    }

    pub fn get_u16(&mut self) -> DecodeResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn get_i64(&mut self) -> DecodeResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// A u64 length that must fit in what is left of the buffer, given
    /// each element takes at least `min_elem` bytes.
    pub fn get_len(&mut self, min_elem: usize) -> DecodeResult<usize> {
        let len = self.get_u64()?;
        let needed = len.saturating_mul(min_elem.max(1) as u64);
        if needed > self.remaining() as u64 {
            return Err(DecodeError::Truncated {
                needed: usize::try_from(needed).unwrap_or(usize::MAX),
                remaining: self.remaining(),
            });
        }
        Ok(len as usize)
    }

    pub fn get_bytes(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.get_len(1)?;
        self.take(len)
    }

    pub fn get_string(&mut self, what: &'static str) -> DecodeResult<String> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8(what))
    }

    pub fn get_key(&mut self) -> DecodeResult<DbKey> {
        Ok(DbKey::new(self.get_u64()?, self.get_i64()?, self.get_i64()?))
    }

    pub fn get_address(&mut self) -> DecodeResult<Address> {
        Ok(Address::from_serial(self.get_u64()?))
    }
}
