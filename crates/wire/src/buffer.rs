//! Minimal byte buffer traits for the descriptor wire format.
//!
//! All integers are big-endian. Writers are infallible (they grow a
//! `Vec<u8>`); readers fail with [`DecodeError`] when the input is
//! truncated or malformed.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: needed {needed} bytes, {available} available")]
    BufferLength { needed: usize, available: usize },
    #[error("unknown descriptor tag 0x{0:02x}")]
    InvalidTag(u8),
    #[error("invalid cardinality byte 0x{0:02x}")]
    InvalidCardinality(u8),
    #[error("descriptor references ordinal {0} which has not been described yet")]
    BadOrdinal(u16),
    #[error("field name is not valid UTF-8")]
    InvalidUtf8,
    #[error("empty type descriptor")]
    Empty,
    #[error("array descriptors with {0} dimensions are not supported")]
    BadDimensions(u16),
}

pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&[val]);
    }

    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_be_bytes());
    }

    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_be_bytes());
    }

    fn put_i32(&mut self, val: i32) {
        self.put_slice(&val.to_be_bytes());
    }

    fn put_uuid(&mut self, val: Uuid) {
        self.put_slice(val.as_bytes());
    }

    /// A `u32` length prefix followed by the bytes.
    fn put_len32_prefixed(&mut self, slice: &[u8]) {
        self.put_u32(slice.len() as u32);
        self.put_slice(slice);
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

pub trait BufReader<'a> {
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError>;
    fn remaining(&self) -> usize;

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.get_slice(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.get_slice(2)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.get_slice(4)?.try_into().unwrap()))
    }

    fn get_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.get_slice(4)?.try_into().unwrap()))
    }

    fn get_uuid(&mut self) -> Result<Uuid, DecodeError> {
        let bytes: [u8; 16] = self.get_slice(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(bytes))
    }

    fn get_len32_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.get_u32()? as usize;
        self.get_slice(len)
    }

    fn get_len32_prefixed_str(&mut self) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.get_len32_prefixed()?).map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl<'a> BufReader<'a> for &'a [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError> {
        if size > self.len() {
            return Err(DecodeError::BufferLength {
                needed: size,
                available: self.len(),
            });
        }
        let (ret, rest) = self.split_at(size);
        *self = rest;
        Ok(ret)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = Vec::new();
        buf.put_u16(0x0102);
        buf.put_u32(0x03040506);
        buf.put_i32(-1);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn reader_roundtrip() {
        let mut buf = Vec::new();
        buf.put_u8(7);
        buf.put_len32_prefixed(b"name");
        let id = Uuid::from_u128(0x42);
        buf.put_uuid(id);

        let mut r: &[u8] = &buf;
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_len32_prefixed_str().unwrap(), "name");
        assert_eq!(r.get_uuid().unwrap(), id);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_read_reports_sizes() {
        let mut r: &[u8] = &[0, 1];
        assert_eq!(
            r.get_u32(),
            Err(DecodeError::BufferLength {
                needed: 4,
                available: 2
            })
        );
    }
}
