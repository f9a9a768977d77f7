use crate::types::Error;
use crate::types::Result;
use crate::vint;

/// A read cursor over a borrowed buffer.
///
/// All reads are bounds checked; running off the end yields `Error::Pending`
/// with the number of missing bytes.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    slice: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.slice.len().saturating_sub(self.pos)
    }

    #[inline]
    fn need(&self, n: usize) -> Result<()> {
        let end = self.pos.checked_add(n).ok_or(Error::TooLarge(n))?;
        if end > self.slice.len() {
            Err(Error::Pending(end - self.slice.len()))
        } else {
            Ok(())
        }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.need(1)?;
        let byte = self.slice[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_byte(&self) -> Result<u8> {
        self.need(1)?;
        Ok(self.slice[self.pos])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let slice = &self.slice[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    pub fn read_vint(&mut self) -> Result<u32> {
        vint::read(self)
    }

    /// Reads a vint and widens it for use as a length or count.
    pub fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_vint()? as usize)
    }

    /// Reads a vint-length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}
