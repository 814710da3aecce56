//! Little-endian binary reader shared by the block, index-file and snapshot
//! formats.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input: wanted {wanted} bytes at offset {offset}")]
    Truncated { offset: usize, wanted: usize },
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
    #[error("length {len} exceeds limit {limit}")]
    TooLarge { len: usize, limit: usize },
}

/// Cursor over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::Truncated {
                offset: self.offset,
                wanted: n,
            })?;
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn hash(&mut self) -> Result<[u8; 32], CodecError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.bytes(32)?);
        Ok(out)
    }

    /// `u32` length prefix followed by that many bytes, bounded by `limit`.
    pub fn var_bytes(&mut self, limit: usize) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        if len > limit {
            return Err(CodecError::TooLarge { len, limit });
        }
        self.bytes(len)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Fail unless the whole input was consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Append a `u32` length prefix and the bytes themselves.
pub fn put_var_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation_offset() {
        let mut r = Reader::new(&[1, 0, 0, 0, 9]);
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(
            r.u32(),
            Err(CodecError::Truncated {
                offset: 4,
                wanted: 4
            })
        );
    }

    #[test]
    fn var_bytes_respects_limit() {
        let mut buf = Vec::new();
        put_var_bytes(&mut buf, b"hello");
        assert_eq!(Reader::new(&buf).var_bytes(16).unwrap(), b"hello");
        assert_eq!(
            Reader::new(&buf).var_bytes(4),
            Err(CodecError::TooLarge { len: 5, limit: 4 })
        );
    }
}
