//! Variable-length unsigned integers.
//!
//! Little-endian groups of seven bits. A set high bit marks the *last* group,
//! so `0x80` is zero and `0x01 0x81` is 129. At most 32 bits are accepted.

use crate::cursor::Cursor;
use crate::types::Error;
use crate::types::Result;

/// Longest legal encoding: 5 groups cover 35 bits.
pub const MAX_LEN: usize = 5;

pub fn write(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let group = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(group | 0x80);
            return;
        }
        buf.push(group);
    }
}

pub fn read(cursor: &mut Cursor<'_>) -> Result<u32> {
    let mut value: u64 = 0;
    for i in 0..MAX_LEN {
        let byte = cursor.read_byte()?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if value > u64::from(u32::MAX) {
            return Err(Error::VintOverflow);
        }
        if byte & 0x80 != 0 {
            return Ok(value as u32);
        }
    }
    Err(Error::VintOverflow)
}
