//! Component E — Serializer.
//!
//! `Writer` over a growable buffer, `Reader` over a read cursor. All
//! multi-byte primitives are little-endian; `bytes`/`string` are length
//! prefixed with a `u64`. Reading past the end of the buffer is the one
//! failure mode, surfaced as `IpcError::DeserializationFailed`.

use crate::error::{IpcError, Result};

/// Growable-buffer writer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Truncates the buffer to `position` (or pads with zeroes if seeking
    /// forward past the current length — matches the C++ `Reserve` + `Seek`
    /// combination implementers typically use before overwriting a field).
    pub fn seek(&mut self, position: usize) {
        if position <= self.buf.len() {
            self.buf.truncate(position);
        } else {
            self.buf.resize(position, 0);
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_u8(&mut self, v: u8) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_i16(&mut self, v: i16) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_u16(&mut self, v: u16) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_i32(&mut self, v: i32) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_u32(&mut self, v: u32) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_i64(&mut self, v: i64) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_u64(&mut self, v: u64) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_f32(&mut self, v: f32) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_f64(&mut self, v: f64) {
        self.write_raw(&v.to_le_bytes());
    }
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_u64(data.len() as u64);
        self.write_raw(data);
    }

    /// Writes the UTF-8 bytes of `s` with a `u64` length prefix. The IPC
    /// layer does not re-validate UTF-8 on the read side — that contract is
    /// the caller's.
    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }
}

/// Read cursor over a borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.buf.len() {
            return Err(IpcError::DeserializationFailed);
        }
        self.pos = position;
        Ok(())
    }

    fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(IpcError::DeserializationFailed);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.read_raw(1)?.try_into().unwrap()))
    }
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(u8::from_le_bytes(self.read_raw(1)?.try_into().unwrap()))
    }
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_raw(2)?.try_into().unwrap()))
    }
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_raw(2)?.try_into().unwrap()))
    }
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_raw(4)?.try_into().unwrap()))
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_raw(4)?.try_into().unwrap()))
    }
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_raw(8)?.try_into().unwrap()))
    }
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_raw(8)?.try_into().unwrap()))
    }
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_raw(4)?.try_into().unwrap()))
    }
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_raw(8)?.try_into().unwrap()))
    }
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(IpcError::DeserializationFailed);
        }
        Ok(self.read_raw(len as usize)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| IpcError::DeserializationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = Writer::new();
        w.write_i8(-5);
        w.write_u8(5);
        w.write_i16(-1000);
        w.write_u16(1000);
        w.write_i32(-100_000);
        w.write_u32(100_000);
        w.write_i64(-1_000_000_000_000);
        w.write_u64(1_000_000_000_000);
        w.write_f32(1.5);
        w.write_f64(2.5);
        w.write_bool(true);
        w.write_bool(false);
        w.write_bytes(&[1, 2, 3, 4]);
        w.write_string("hello world");

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_i8().unwrap(), -5);
        assert_eq!(r.read_u8().unwrap(), 5);
        assert_eq!(r.read_i16().unwrap(), -1000);
        assert_eq!(r.read_u16().unwrap(), 1000);
        assert_eq!(r.read_i32().unwrap(), -100_000);
        assert_eq!(r.read_u32().unwrap(), 100_000);
        assert_eq!(r.read_i64().unwrap(), -1_000_000_000_000);
        assert_eq!(r.read_u64().unwrap(), 1_000_000_000_000);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), 2.5);
        assert!(r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
        assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(r.read_string().unwrap(), "hello world");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn read_past_end_fails() {
        let w = Writer::new();
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32(), Err(IpcError::DeserializationFailed));
    }

    #[test]
    fn oversized_length_prefix_fails_without_allocating() {
        let mut w = Writer::new();
        w.write_u64(u64::MAX);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_bytes(), Err(IpcError::DeserializationFailed));
    }

    #[test]
    fn writer_seek_truncates() {
        let mut w = Writer::new();
        w.write_u32(1);
        w.write_u32(2);
        assert_eq!(w.position(), 8);
        w.seek(4);
        assert_eq!(w.position(), 4);
        w.write_u32(3);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_u32().unwrap(), 3);
    }
}
