//! A bounds-checked cursor over DWARF bytes.
//!
//! Unlike a plain slice, the cursor remembers where it is in the whole
//! section, because pc-relative pointer encodings and error messages need the
//! absolute offset.


use core::ops::Range;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// 32-bit or 64-bit DWARF, decided by the initial length of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Dwarf32,
    Dwarf64,
}

impl Format {
    /// Size of an offset in this format.
    pub fn offset_size(self) -> usize {
        match self {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
            endian,
        }
    }

    /// A cursor over `range` of `data` that still reports offsets relative to
    /// the start of `data`.
    pub fn with_range(data: &'a [u8], range: Range<usize>, endian: Endian) -> Result<Self> {
        if range.start > range.end || range.end > data.len() {
            return Err(Error::UnexpectedEof {
                offset: range.start,
                wanted: range.end.saturating_sub(range.start),
                available: data.len().saturating_sub(range.start),
            });
        }
        Ok(Self {
            data,
            pos: range.start,
            end: range.end,
            endian,
        })
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The unread bytes.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..self.end]
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.end {
            return Err(self.eof(pos.saturating_sub(self.pos)));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, amount: usize) -> Result<()> {
        self.read_bytes(amount).map(|_| ())
    }

    /// Split off the next `amount` bytes as their own cursor.
    pub fn take(&mut self, amount: usize) -> Result<Cursor<'a>> {
        let start = self.pos;
        self.skip(amount)?;
        Ok(Cursor {
            data: self.data,
            pos: start,
            end: self.pos,
            endian: self.endian,
        })
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.rest().first().copied()
    }

    fn eof(&self, wanted: usize) -> Error {
        Error::UnexpectedEof {
            offset: self.pos,
            wanted,
            available: self.remaining(),
        }
    }

    pub fn read_bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.remaining() < amount {
            return Err(self.eof(amount));
        }
        let result = &self.data[self.pos..][..amount];
        self.pos += amount;
        Ok(result)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_uint(2)? as u16)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_uint(4)? as u32)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads an unsigned integer of `size` bytes (at most 8) in the cursor's
    /// byte order.
    pub fn read_uint(&mut self, size: usize) -> Result<u64> {
        if size > 8 {
            return Err(Error::corrupt(alloc::format!(
                "integer of {size} bytes does not fit into 64 bits"
            )));
        }
        let bytes = self.read_bytes(size)?;
        Ok(extract_unsigned(bytes, self.endian))
    }

    /// Reads a sign-extended integer of `size` bytes (at most 8).
    pub fn read_sint(&mut self, size: usize) -> Result<i64> {
        let value = self.read_uint(size)?;
        Ok(sign_extend(value, size))
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break;
            }
        }
        Ok(result)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result = 0i64;
        let mut shift = 0;
        let sign_bit_set = loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break ((byte >> 6) & 1) == 1;
            }
        };
        if shift < 64 && sign_bit_set {
            result |= -1i64 << shift;
        }
        Ok(result)
    }

    /// Reads a null-terminated string, without its terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.rest();
        let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::corrupt(alloc::format!(
                "no null terminator found for string at {:#x}",
                self.pos
            ))
        })?;
        let s = &rest[..len];
        self.pos += len + 1;
        Ok(s)
    }

    /// Reads a unit's initial length. `0xffffffff` escapes to a 64-bit length.
    pub fn read_initial_length(&mut self) -> Result<(u64, Format)> {
        let length = self.read_u32()?;
        if length == 0xffff_ffff {
            Ok((self.read_u64()?, Format::Dwarf64))
        } else {
            Ok((u64::from(length), Format::Dwarf32))
        }
    }
}

pub fn extract_unsigned(bytes: &[u8], endian: Endian) -> u64 {
    match endian {
        Endian::Little => bytes
            .iter()
            .rev()
            .fold(0, |acc, &b| (acc << 8) | u64::from(b)),
        Endian::Big => bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)),
    }
}

pub fn extract_signed(bytes: &[u8], endian: Endian) -> i64 {
    sign_extend(extract_unsigned(bytes, endian), bytes.len())
}

/// Stores the low `buf.len()` bytes of `value` into `buf`.
pub fn store_unsigned(buf: &mut [u8], value: u64, endian: Endian) {
    let len = buf.len();
    for (i, byte) in buf.iter_mut().enumerate() {
        let shift = match endian {
            Endian::Little => i,
            Endian::Big => len - 1 - i,
        } * 8;
        *byte = if shift < 64 { (value >> shift) as u8 } else { 0 };
    }
}

/// Sign-extends the low `size` bytes of `value`.
pub fn sign_extend(value: u64, size: usize) -> i64 {
    if size == 0 || size >= 8 {
        return value as i64;
    }
    let shift = 64 - size * 8;
    ((value << shift) as i64) >> shift
}

/// Mask of the low `size` bytes.
pub fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}
