//! Little-endian binary encoding for the records stored in pages.
//!
//! Every collection node, bucket and header is a [`Record`]: it writes itself
//! field by field into an [`Encoder`] and reads itself back from a
//! [`Decoder`]. Variable-length fields carry a `u32` length prefix.

mod error;

pub use error::{DecodeError, DecodeResult};

/// Accumulates the bytes of one record
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed byte string
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Element count of a sequence that follows
    pub fn put_len(&mut self, len: usize) {
        self.put_u32(len as u32);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads the fields of one record in order
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEnd {
                offset: self.offset,
                wanted: len,
            })?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn get_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> DecodeResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> DecodeResult<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn get_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> DecodeResult<String> {
        String::from_utf8(self.get_bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Element count of a sequence that follows. Each element takes at least
    /// one byte, so a count larger than what is left is corrupt.
    pub fn get_len(&mut self) -> DecodeResult<usize> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd {
                offset: self.offset,
                wanted: len,
            });
        }
        Ok(len)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }
}

/// A value with a fixed binary layout in a page
pub trait Record: Sized {
    fn encode(&self, encoder: &mut Encoder);

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        encoder.finish()
    }

    fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        Self::decode(&mut Decoder::new(bytes))
    }
}
