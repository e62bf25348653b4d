//! Values assembled from the pieces of a composite location.
//!
//! A composite location is never read as a whole. Every access names a range
//! of bits of the value, and only the pieces overlapping that range are
//! touched. Bits that cannot be read are reported alongside the contents so
//! that the caller can show them as optimized out or unavailable.


use alloc::{vec, vec::Vec};
use core::ops::Range;

use super::expr::{Location, Piece};
use crate::{
    error::{Error, ErrorKind, Result},
    reader::Endian,
    target::Frame,
};

fn bit(bytes: &[u8], index: u64, bits_big_endian: bool) -> bool {
    let byte = bytes[(index / 8) as usize];
    let shift = if bits_big_endian { 7 - index % 8 } else { index % 8 };
    (byte >> shift) & 1 == 1
}

fn set_bit(bytes: &mut [u8], index: u64, value: bool, bits_big_endian: bool) {
    let byte = &mut bytes[(index / 8) as usize];
    let shift = if bits_big_endian { 7 - index % 8 } else { index % 8 };
    if value {
        *byte |= 1 << shift;
    } else {
        *byte &= !(1 << shift);
    }
}

/// Copies `nbits` bits from `source` starting at bit `source_offset` to
/// `dest` starting at bit `dest_offset`. Bits of `dest` outside of the copied
/// range are left alone.
///
/// With `bits_big_endian`, bit 0 of a byte is its most significant bit,
/// otherwise its least significant one.
///
/// # Panics
///
/// Panics if either bit range is out of bounds of its buffer.
pub fn copy_bitwise(
    dest: &mut [u8],
    dest_offset: u64,
    source: &[u8],
    source_offset: u64,
    nbits: u64,
    bits_big_endian: bool,
) {
    if dest_offset % 8 == 0 && source_offset % 8 == 0 && nbits % 8 == 0 {
        let dest_start = (dest_offset / 8) as usize;
        let source_start = (source_offset / 8) as usize;
        let len = (nbits / 8) as usize;
        dest[dest_start..][..len].copy_from_slice(&source[source_start..][..len]);
        return;
    }
    for i in 0..nbits {
        let value = bit(source, source_offset + i, bits_big_endian);
        set_bit(dest, dest_offset + i, value, bits_big_endian);
    }
}

fn bytes_for_bits(bits: u64) -> usize {
    bits.div_ceil(8) as usize
}

/// The result of reading bits of a [`PiecedValue`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PieceContents {
    /// The bits that were read, starting at bit 0 of the first byte. Bits
    /// that could not be read are zero.
    pub bytes: Vec<u8>,
    /// Bit ranges, relative to the start of the read, that do not exist.
    pub optimized_out: Vec<Range<u64>>,
    /// Bit ranges that could not be read from the target.
    pub unavailable: Vec<Range<u64>>,
}

impl PieceContents {
    pub(crate) fn new(bit_len: u64) -> Self {
        Self {
            bytes: vec![0; bytes_for_bits(bit_len)],
            optimized_out: Vec::new(),
            unavailable: Vec::new(),
        }
    }

    /// Whether every bit was read.
    pub fn is_complete(&self) -> bool {
        self.optimized_out.is_empty() && self.unavailable.is_empty()
    }

    pub(crate) fn mark(&mut self, err: Error, bits: Range<u64>) -> Result<()> {
        match err.kind() {
            ErrorKind::OptimizedOut => self.optimized_out.push(bits),
            ErrorKind::Unavailable => self.unavailable.push(bits),
            _ => return Err(err),
        }
        Ok(())
    }

    /// Copies as many of the requested bits as `source` has.
    fn copy_available(&mut self, dest: u64, source: &[u8], source_bit: u64, len: u64, bits_big_endian: bool) {
        let available = (source.len() as u64 * 8).saturating_sub(source_bit);
        let len = len.min(available);
        if len > 0 {
            copy_bitwise(&mut self.bytes, dest, source, source_bit, len, bits_big_endian);
        }
    }
}

/// A value spread over the pieces of a composite location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiecedValue {
    pieces: Vec<Piece>,
    address_size: u8,
    endian: Endian,
}

impl PiecedValue {
    pub fn new(pieces: Vec<Piece>, address_size: u8, endian: Endian) -> Self {
        Self {
            pieces,
            address_size,
            endian,
        }
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// The size of the value in bits.
    pub fn total_bits(&self) -> u64 {
        self.pieces
            .iter()
            .fold(0, |total: u64, piece| total.saturating_add(piece.size))
    }

    fn bits_big_endian(&self) -> bool {
        self.endian == Endian::Big
    }

    /// Every piece with the bit of the value it starts at.
    fn spans(&self) -> impl Iterator<Item = (u64, &Piece)> {
        self.pieces.iter().scan(0u64, |start, piece| {
            let this = *start;
            *start = start.saturating_add(piece.size);
            Some((this, piece))
        })
    }

    /// The pieces overlapping `bit_offset..bit_offset + bit_len`, each with
    /// the first overlapping bit relative to the start of the range, the bit
    /// inside of the piece and the number of overlapping bits.
    fn overlapping(&self, bit_offset: u64, bit_len: u64) -> impl Iterator<Item = (u64, u64, u64, &Piece)> {
        let end = bit_offset.saturating_add(bit_len);
        self.spans().filter_map(move |(start, piece)| {
            let first = bit_offset.max(start);
            let last = end.min(start.saturating_add(piece.size));
            (first < last).then(|| (first - bit_offset, first - start, last - first, piece))
        })
    }

    /// Where the bits of a piece start inside of a register or stack value of
    /// `container_bits`. `DW_OP_bit_piece` offsets count from the least
    /// significant bit, which comes last with big endian bit numbering.
    fn container_base(&self, piece: &Piece, container_bits: u64) -> u64 {
        if self.bits_big_endian() {
            container_bits.saturating_sub(piece.offset.saturating_add(piece.size))
        } else {
            piece.offset
        }
    }

    /// Reads `bit_len` bits starting at `bit_offset`.
    #[instrument(level = "trace", skip(self, frame))]
    pub fn read(&self, frame: &dyn Frame, bit_offset: u64, bit_len: u64) -> Result<PieceContents> {
        let mut contents = PieceContents::new(bit_len);
        let bits_big_endian = self.bits_big_endian();

        for (dest, within, len, piece) in self.overlapping(bit_offset, bit_len) {
            let bits = dest..dest + len;
            match &piece.location {
                Location::Register(reg) => {
                    let arch = frame.arch();
                    let regnum = arch.dwarf_reg_to_regnum_or_error(*reg)?;
                    let reg_bits = arch.register_size(regnum) as u64 * 8;
                    let source = self.container_base(piece, reg_bits).saturating_add(within);
                    let first_byte = (source / 8) as usize;
                    let mut buf = vec![0; bytes_for_bits(source % 8 + len)];
                    match frame.register_bytes(regnum, first_byte, &mut buf) {
                        Ok(()) => contents.copy_available(dest, &buf, source % 8, len, bits_big_endian),
                        Err(err) => contents.mark(err, bits)?,
                    }
                }
                Location::Memory { address, .. } => {
                    let source = piece.offset.saturating_add(within);
                    let mut buf = vec![0; bytes_for_bits(source % 8 + len)];
                    match frame.read_memory(address.wrapping_add(source / 8), &mut buf) {
                        Ok(()) => contents.copy_available(dest, &buf, source % 8, len, bits_big_endian),
                        Err(err) if err.kind() == ErrorKind::Unavailable => contents.unavailable.push(bits),
                        Err(err) => return Err(err),
                    }
                }
                Location::Value(value) => {
                    let bytes = value.to_bytes(self.address_size, self.endian);
                    let source = self.container_base(piece, bytes.len() as u64 * 8).saturating_add(within);
                    contents.copy_available(dest, &bytes, source, len, bits_big_endian);
                }
                Location::Literal(bytes) => {
                    contents.copy_available(dest, bytes, piece.offset.saturating_add(within), len, bits_big_endian);
                }
                // These read as zeros without making the value optimized out.
                Location::ImplicitPointer { .. } => {}
                Location::OptimizedOut => contents.optimized_out.push(bits),
            }
        }

        let total = self.total_bits();
        if bit_offset.saturating_add(bit_len) > total {
            contents
                .optimized_out
                .push(total.saturating_sub(bit_offset)..bit_len);
        }
        Ok(contents)
    }

    /// Writes `bit_len` bits of `data` starting at `bit_offset`. Pieces that
    /// only partially cover a byte are read first and merged.
    #[instrument(level = "trace", skip(self, frame, data))]
    pub fn write(&self, frame: &dyn Frame, bit_offset: u64, data: &[u8], bit_len: u64) -> Result<()> {
        let bits_big_endian = self.bits_big_endian();

        for (source, within, len, piece) in self.overlapping(bit_offset, bit_len) {
            match &piece.location {
                Location::Register(reg) => {
                    let arch = frame.arch();
                    let regnum = arch.dwarf_reg_to_regnum_or_error(*reg)?;
                    let reg_bits = arch.register_size(regnum) as u64 * 8;
                    let dest = self.container_base(piece, reg_bits).saturating_add(within);
                    let first_byte = (dest / 8) as usize;
                    let mut buf = vec![0; bytes_for_bits(dest % 8 + len)];
                    if dest % 8 != 0 || len % 8 != 0 {
                        frame
                            .register_bytes(regnum, first_byte, &mut buf)
                            .map_err(read_modify_write_error)?;
                    }
                    copy_bitwise(&mut buf, dest % 8, data, source, len, bits_big_endian);
                    frame.write_register_bytes(regnum, first_byte, &buf)?;
                }
                Location::Memory { address, .. } => {
                    let dest = piece.offset.saturating_add(within);
                    let address = address.wrapping_add(dest / 8);
                    let mut buf = vec![0; bytes_for_bits(dest % 8 + len)];
                    if dest % 8 != 0 || len % 8 != 0 {
                        frame.read_memory(address, &mut buf)?;
                    }
                    copy_bitwise(&mut buf, dest % 8, data, source, len, bits_big_endian);
                    frame.write_memory(address, &buf)?;
                }
                _ => return Err(Error::OptimizedOut),
            }
        }
        Ok(())
    }

    /// Whether the bits are entirely made of implicit pointers.
    pub fn is_synthetic_pointer(&self, bit_offset: u64, bit_len: u64) -> bool {
        let mut any = false;
        for (_, _, _, piece) in self.overlapping(bit_offset, bit_len) {
            if !matches!(piece.location, Location::ImplicitPointer { .. }) {
                return false;
            }
            any = true;
        }
        any
    }

    /// The DIE and byte offset a pointer stored at `bit_offset` points to,
    /// if it is an implicit pointer.
    pub fn implicit_pointer_target(&self, bit_offset: u64, bit_len: u64) -> Result<Option<(u64, i64)>> {
        let Some((start, piece)) = self
            .spans()
            .find(|(start, piece)| (*start..start.saturating_add(piece.size)).contains(&bit_offset))
        else {
            return Ok(None);
        };
        let Location::ImplicitPointer { die, offset } = piece.location else {
            return Ok(None);
        };
        if bit_offset.saturating_add(bit_len) > start.saturating_add(piece.size) {
            return Err(Error::corrupt("Invalid use of DW_OP_implicit_pointer"));
        }
        Ok(Some((die, offset)))
    }
}

fn read_modify_write_error(err: Error) -> Error {
    match err.kind() {
        ErrorKind::OptimizedOut => Error::OptimizedOut,
        ErrorKind::Unavailable => Error::unavailable(
            "Can't do read-modify-write to update bitfield; containing word is unavailable",
        ),
        _ => err,
    }
}
