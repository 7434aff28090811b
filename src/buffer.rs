//! Growable byte buffer used by every wire format in the crate.
//!
//! [`VarBuffer`] keeps a write length and an independent read cursor over one
//! owned allocation. Writers append at the end; readers consume from the
//! cursor and never read past the written length.
//!
//! # Encodings
//!
//! - Fixed-width integers and doubles are little-endian.
//! - `varuint` is the protobuf base-128 form: 7 payload bits per byte, high
//!   bit set on every byte except the last.
//! - `varint` is a zigzag-mapped signed integer written as a `varuint`.
//! - `vstring`/`vbytes` are a `varuint` length followed by the raw bytes.
use thiserror::Error;

const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer underflow: need {need} bytes at position {position}, written length {length}")]
    Underflow {
        position: usize,
        length: usize,
        need: usize,
    },
    #[error("varint at position {position} exceeds 64 bits")]
    VarintOverflow { position: usize },
    #[error("invalid utf-8 string at position {position}")]
    InvalidUtf8 { position: usize },
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[derive(Debug, Clone, Default)]
pub struct VarBuffer {
    buf: Vec<u8>,
    len: usize,
    pos: usize,
}

impl PartialEq for VarBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for VarBuffer {}

impl From<Vec<u8>> for VarBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            buf: bytes,
            len,
            pos: 0,
        }
    }
}

impl From<&[u8]> for VarBuffer {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

impl VarBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.len);
        self.buf
    }

    /// Bytes between the read cursor and the written length.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.pos..self.len]
    }

    pub fn rewind(&mut self) -> &mut Self {
        self.pos = 0;
        self
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.check(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.pos = 0;
    }

    /// Drops the first `n` written bytes, shifting the rest to the front.
    pub fn truncate_start(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
        self.pos = self.pos.saturating_sub(n);
    }

    fn reserve(&mut self, extra: usize) {
        let need = self.len + extra;
        if need <= self.buf.len() {
            return;
        }

        let mut capacity = self.buf.len().max(INITIAL_CAPACITY);
        while capacity < need {
            capacity = capacity * 3 / 2;
        }
        self.buf.resize(capacity, 0);
    }

    fn check(&self, need: usize) -> Result<(), BufferError> {
        if self.pos + need > self.len {
            return Err(BufferError::Underflow {
                position: self.pos,
                length: self.len,
                need,
            });
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.reserve(bytes.len());
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.write_bytes(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Overwrites four already written bytes at `offset`.
    pub fn put_u32_at(&mut self, offset: usize, value: u32) -> Result<(), BufferError> {
        if offset + 4 > self.len {
            return Err(BufferError::Underflow {
                position: offset,
                length: self.len,
                need: 4,
            });
        }
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_varuint(&mut self, mut value: u64) -> &mut Self {
        let mut scratch = [0u8; 10];
        let mut i = 0;
        while value >= 0x80 {
            scratch[i] = (value as u8) | 0x80;
            value >>= 7;
            i += 1;
        }
        scratch[i] = value as u8;
        self.write_bytes(&scratch[..=i])
    }

    pub fn put_varint(&mut self, value: i64) -> &mut Self {
        self.put_varuint(zigzag_encode(value))
    }

    pub fn put_vbytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_varuint(bytes.len() as u64);
        self.write_bytes(bytes)
    }

    pub fn put_vstring(&mut self, value: &str) -> &mut Self {
        self.put_vbytes(value.as_bytes())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        self.check(n)?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        self.check(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, BufferError> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64, BufferError> {
        Ok(f64::from_le_bytes(self.get_array()?))
    }

    pub fn get_varuint(&mut self) -> Result<u64, BufferError> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift = 0u32;

        loop {
            let byte = self.get_u8()?;
            // the tenth byte may only carry the single remaining bit
            if shift == 63 && byte > 1 {
                return Err(BufferError::VarintOverflow { position: start });
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn get_varint(&mut self) -> Result<i64, BufferError> {
        Ok(zigzag_decode(self.get_varuint()?))
    }

    fn get_len(&mut self) -> Result<usize, BufferError> {
        let position = self.pos;
        let len = self.get_varuint()?;
        usize::try_from(len).map_err(|_| BufferError::Underflow {
            position,
            length: self.len,
            need: usize::MAX,
        })
    }

    pub fn get_vbytes(&mut self) -> Result<Vec<u8>, BufferError> {
        let len = self.get_len()?;
        self.get_bytes(len)
    }

    pub fn get_vstring(&mut self) -> Result<String, BufferError> {
        let position = self.pos;
        let bytes = self.get_vbytes()?;
        String::from_utf8(bytes).map_err(|_| BufferError::InvalidUtf8 { position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_edges() {
        for v in [0, 1, -1, 63, -64, i32::MAX as i64, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(5), 10);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);
    }

    #[test]
    fn varuint_known_encodings() {
        let mut buf = VarBuffer::new();
        buf.put_varuint(0).put_varuint(127).put_varuint(300);
        assert_eq!(buf.as_bytes(), &[0x00, 0x7f, 0xac, 0x02]);

        buf.rewind();
        assert_eq!(buf.get_varuint().unwrap(), 0);
        assert_eq!(buf.get_varuint().unwrap(), 127);
        assert_eq!(buf.get_varuint().unwrap(), 300);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn varuint_extremes() {
        let mut buf = VarBuffer::new();
        buf.put_varuint(u64::MAX).put_varint(i64::MIN);
        assert_eq!(buf.len(), 20);

        buf.rewind();
        assert_eq!(buf.get_varuint().unwrap(), u64::MAX);
        assert_eq!(buf.get_varint().unwrap(), i64::MIN);
    }

    #[test]
    fn varuint_overflow() {
        let mut bytes = vec![0xff; 9];
        bytes.push(0x02);
        let mut buf = VarBuffer::from(bytes);
        assert_eq!(
            buf.get_varuint(),
            Err(BufferError::VarintOverflow { position: 0 })
        );

        let mut buf = VarBuffer::from(vec![0xff; 11]);
        assert!(matches!(
            buf.get_varuint(),
            Err(BufferError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn growth_preserves_content() {
        let mut buf = VarBuffer::with_capacity(1);
        for i in 0..1000u32 {
            buf.put_u32(i).put_varint(-(i as i64)).put_vstring(&format!("s{i}"));
        }
        assert!(buf.capacity() >= buf.len());

        buf.rewind();
        for i in 0..1000u32 {
            assert_eq!(buf.get_u32().unwrap(), i);
            assert_eq!(buf.get_varint().unwrap(), -(i as i64));
            assert_eq!(buf.get_vstring().unwrap(), format!("s{i}"));
        }
    }

    #[test]
    fn fixed_width_little_endian() {
        let mut buf = VarBuffer::new();
        buf.put_u16(0x0102).put_u32(0x03040506).put_u64(7).put_f64(1.5);
        assert_eq!(&buf.as_bytes()[..6], &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);

        buf.rewind();
        assert_eq!(buf.get_u16().unwrap(), 0x0102);
        assert_eq!(buf.get_u32().unwrap(), 0x03040506);
        assert_eq!(buf.get_u64().unwrap(), 7);
        assert_eq!(buf.get_f64().unwrap(), 1.5);
    }

    #[test]
    fn underflow() {
        let mut buf = VarBuffer::new();
        buf.put_u16(1);
        buf.rewind();
        assert_eq!(
            buf.get_u32(),
            Err(BufferError::Underflow {
                position: 0,
                length: 2,
                need: 4
            })
        );

        let mut buf = VarBuffer::new();
        buf.put_varuint(10).write_bytes(b"abc");
        buf.rewind();
        assert!(matches!(
            buf.get_vbytes(),
            Err(BufferError::Underflow { .. })
        ));
    }

    #[test]
    fn invalid_utf8() {
        let mut buf = VarBuffer::new();
        buf.put_vbytes(&[0xff, 0xfe]);
        buf.rewind();
        assert_eq!(
            buf.get_vstring(),
            Err(BufferError::InvalidUtf8 { position: 0 })
        );
    }

    #[test]
    fn patch_and_truncate() {
        let mut buf = VarBuffer::new();
        buf.put_u8(7).put_u32(0).put_u8(9);
        buf.put_u32_at(1, 0xaabbccdd).unwrap();
        assert_eq!(buf.as_bytes(), &[7, 0xdd, 0xcc, 0xbb, 0xaa, 9]);
        assert!(buf.put_u32_at(4, 0).is_err());

        buf.truncate_start(5);
        assert_eq!(buf.into_bytes(), vec![9]);
    }
}
