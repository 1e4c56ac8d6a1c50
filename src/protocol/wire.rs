//! Field-level payload encoding.
//!
//! Integers are fixed width and big endian. Byte strings and strings carry a
//! `u32` length prefix; vectors carry a `u32` element count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{Error, ObjectId, Result};

/// Appends fields to a payload buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_id(&mut self, id: ObjectId) {
        self.buf.put_u64(id.as_u64());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_len(bytes.len());
        self.buf.put_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn put_ids(&mut self, ids: &[ObjectId]) {
        self.put_len(ids.len());
        for id in ids {
            self.put_id(*id);
        }
    }

    fn put_len(&mut self, len: usize) {
        // Frames are capped well below u32::MAX by max_frame_bytes.
        self.buf.put_u32(len as u32);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Consumes fields from a received payload.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, field: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated payload: {} needs {} bytes, {} left",
                field,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_id(&mut self) -> Result<ObjectId> {
        Ok(ObjectId::from_raw(self.get_u64()?))
    }

    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.need(len, "byte string")?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_string(&mut self) -> Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::protocol(format!("string field is not UTF-8: {}", e)))
    }

    /// Read a vector count, rejecting counts the remaining bytes cannot hold.
    fn get_count(&mut self, elem_size: usize) -> Result<usize> {
        let count = self.get_u32()? as usize;
        self.need(count.saturating_mul(elem_size), "vector")?;
        Ok(count)
    }

    pub fn get_ids(&mut self) -> Result<Vec<ObjectId>> {
        let count = self.get_count(8)?;
        (0..count).map(|_| self.get_id()).collect()
    }

    /// Fail if any bytes were left unread.
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after payload",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
