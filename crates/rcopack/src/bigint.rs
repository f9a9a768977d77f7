//! Arbitrary-precision integers as sign plus little-endian magnitude.
//!
//! The codec only moves these around; no arithmetic beyond what `Display`
//! and the primitive conversions need.

use std::fmt;

/// Always normalized: no high zero bytes, and zero is never negative.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BigInt {
    negative: bool,
    magnitude: Vec<u8>,
}

impl BigInt {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_parts(negative: bool, mut magnitude: Vec<u8>) -> Self {
        while magnitude.last() == Some(&0) {
            magnitude.pop();
        }
        let negative = negative && !magnitude.is_empty();
        Self { negative, magnitude }
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    /// Little-endian magnitude bytes.
    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }

    pub fn to_i128(&self) -> Option<i128> {
        if self.magnitude.len() > 16 {
            return None;
        }
        let mut raw = [0u8; 16];
        raw[..self.magnitude.len()].copy_from_slice(&self.magnitude);
        let m = u128::from_le_bytes(raw);
        if self.negative {
            if m == 1u128 << 127 {
                Some(i128::MIN)
            } else {
                i128::try_from(m).ok().map(|v| -v)
            }
        } else {
            i128::try_from(m).ok()
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        self.to_i128().and_then(|v| i64::try_from(v).ok())
    }

    fn to_decimal(&self) -> String {
        if self.magnitude.is_empty() {
            return "0".to_owned();
        }
        // schoolbook division by 10, most significant byte first
        let mut digits = Vec::new();
        let mut work: Vec<u8> = self.magnitude.iter().rev().copied().collect();
        while !work.is_empty() {
            let mut rem: u16 = 0;
            let mut next = Vec::with_capacity(work.len());
            for byte in &work {
                let cur = (rem << 8) | u16::from(*byte);
                let q = (cur / 10) as u8;
                rem = cur % 10;
                if !(next.is_empty() && q == 0) {
                    next.push(q);
                }
            }
            digits.push(b'0' + rem as u8);
            work = next;
        }
        if self.negative {
            digits.push(b'-');
        }
        digits.reverse();
        String::from_utf8(digits).unwrap_or_default()
    }
}

impl From<i128> for BigInt {
    fn from(v: i128) -> Self {
        Self::from_parts(v < 0, v.unsigned_abs().to_le_bytes().to_vec())
    }
}

impl From<u128> for BigInt {
    fn from(v: u128) -> Self {
        Self::from_parts(false, v.to_le_bytes().to_vec())
    }
}

impl From<i64> for BigInt {
    fn from(v: i64) -> Self {
        Self::from(i128::from(v))
    }
}

impl From<u64> for BigInt {
    fn from(v: u64) -> Self {
        Self::from(u128::from(v))
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInt({})", self)
    }
}
