//! Location lists: picking the location expression that is valid at a pc.
//!
//! The encoding depends on the unit: `.debug_loc` before DWARF 5,
//! `.debug_loclists` from DWARF 5 on, and the GNU split-dwarf flavor of
//! `.debug_loc.dwo` which names addresses by their `.debug_addr` index.
//! Nothing in the data says which one it is, so the caller has to know.

#[cfg(test)]
mod tests;

use crate::{
    error::{Error, Result},
    reader::{self, Cursor, Endian},
    target::DebugInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocListFormat {
    /// `.debug_loc`, DWARF 2 to 4.
    Loc,
    /// `.debug_loc.dwo` of pre-standard split DWARF.
    LocDwo,
    /// `.debug_loclists` and `.debug_loclists.dwo`, DWARF 5.
    Loclists,
}

mod lle {
    pub const END_OF_LIST: u8 = 0x00;
    pub const BASE_ADDRESSX: u8 = 0x01;
    pub const STARTX_ENDX: u8 = 0x02;
    pub const STARTX_LENGTH: u8 = 0x03;
    pub const OFFSET_PAIR: u8 = 0x04;
    pub const BASE_ADDRESS: u8 = 0x06;
    pub const START_END: u8 = 0x07;
    pub const START_LENGTH: u8 = 0x08;

    pub const GNU_END_OF_LIST_ENTRY: u8 = 0x00;
    pub const GNU_BASE_ADDRESS_SELECTION_ENTRY: u8 = 0x01;
    pub const GNU_START_END_ENTRY: u8 = 0x02;
    pub const GNU_START_LENGTH_ENTRY: u8 = 0x03;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    End,
    /// The new base address, without the text offset.
    Base(u64),
    /// A range of absolute addresses. Addresses from `.debug_addr` already
    /// include the base.
    Range { low: u64, high: u64 },
    /// A range relative to the current base address.
    OffsetPair { low: u64, high: u64 },
}

/// The location list of one variable.
#[derive(Debug, Clone, Copy)]
pub struct LocList<'a> {
    /// The list, starting at the first entry.
    pub data: &'a [u8],
    pub format: LocListFormat,
    /// The base address of the compilation unit, before relocation.
    pub base_address: u64,
    pub address_size: u8,
    /// Relocation offset of the text section.
    pub text_offset: u64,
    pub endian: Endian,
    /// Whether addresses are sign-extended, for targets with signed VMAs.
    pub sign_extend_vma: bool,
}

fn corrupted() -> Error {
    Error::corrupt("dwarf2_find_location_expression: Corrupted DWARF expression.")
}

impl<'a> LocList<'a> {
    /// Finds the expression that is valid at `pc`. `None` means the variable
    /// has no location there.
    ///
    /// A zero-width entry matching `pc` exactly is only accepted at the
    /// entry point of a function, as `debug` reports it.
    #[instrument(level = "debug", skip(self, debug), fields(format = ?self.format))]
    pub fn find_expression(&self, pc: u64, debug: &dyn DebugInfo) -> Result<Option<&'a [u8]>> {
        let mut cursor = Cursor::new(self.data, self.endian);
        let mut base_address = self.base_address.wrapping_add(self.text_offset);

        loop {
            let entry = self.read_entry(&mut cursor, debug).map_err(|err| match err {
                Error::UnexpectedEof { .. } => corrupted(),
                err => err,
            })?;
            trace!(?entry);

            let (low, high) = match entry {
                Entry::End => return Ok(None),
                Entry::Base(base) => {
                    base_address = base.wrapping_add(self.text_offset);
                    continue;
                }
                Entry::Range { low, high } => (
                    low.wrapping_add(self.text_offset),
                    high.wrapping_add(self.text_offset),
                ),
                Entry::OffsetPair { low, high } => (
                    low.wrapping_add(base_address),
                    high.wrapping_add(base_address),
                ),
            };

            let length = match self.format {
                LocListFormat::Loc | LocListFormat::LocDwo => cursor.read_u16().map(u64::from),
                LocListFormat::Loclists => cursor.read_uleb128(),
            };
            let expr = length
                .ok()
                .and_then(|length| usize::try_from(length).ok())
                .and_then(|length| cursor.read_bytes(length).ok())
                .ok_or_else(corrupted)?;

            if low == high && pc == low && debug.function_entry(pc) == Some(pc) {
                debug!(low, "entry value location at function entry");
                return Ok(Some(expr));
            }
            if (low..high).contains(&pc) {
                debug!(low, high, "found location");
                return Ok(Some(expr));
            }
        }
    }

    fn read_address(&self, cursor: &mut Cursor<'_>) -> Result<u64> {
        let size = usize::from(self.address_size);
        if self.sign_extend_vma {
            Ok(cursor.read_sint(size)? as u64)
        } else {
            cursor.read_uint(size)
        }
    }

    fn read_entry(&self, cursor: &mut Cursor<'_>, debug: &dyn DebugInfo) -> Result<Entry> {
        match self.format {
            LocListFormat::Loc => {
                let low = self.read_address(cursor)?;
                let high = self.read_address(cursor)?;
                let base_mask = reader::mask(usize::from(self.address_size));
                if low & base_mask == base_mask {
                    Ok(Entry::Base(high))
                } else if low == 0 && high == 0 {
                    Ok(Entry::End)
                } else {
                    Ok(Entry::OffsetPair { low, high })
                }
            }
            LocListFormat::LocDwo => match cursor.read_u8()? {
                lle::GNU_END_OF_LIST_ENTRY => Ok(Entry::End),
                lle::GNU_BASE_ADDRESS_SELECTION_ENTRY => {
                    Ok(Entry::Base(debug.addr_index(cursor.read_uleb128()?)?))
                }
                lle::GNU_START_END_ENTRY => {
                    let low = debug.addr_index(cursor.read_uleb128()?)?;
                    let high = debug.addr_index(cursor.read_uleb128()?)?;
                    Ok(Entry::Range { low, high })
                }
                lle::GNU_START_LENGTH_ENTRY => {
                    let low = debug.addr_index(cursor.read_uleb128()?)?;
                    let length = cursor.read_u32()?;
                    Ok(Entry::Range {
                        low,
                        high: low.wrapping_add(u64::from(length)),
                    })
                }
                _ => Err(corrupted()),
            },
            LocListFormat::Loclists => match cursor.read_u8()? {
                lle::END_OF_LIST => Ok(Entry::End),
                lle::BASE_ADDRESSX => Ok(Entry::Base(debug.addr_index(cursor.read_uleb128()?)?)),
                lle::BASE_ADDRESS => Ok(Entry::Base(self.read_address(cursor)?)),
                lle::OFFSET_PAIR => {
                    let low = cursor.read_uleb128()?;
                    let high = cursor.read_uleb128()?;
                    Ok(Entry::OffsetPair { low, high })
                }
                lle::STARTX_ENDX => {
                    let low = debug.addr_index(cursor.read_uleb128()?)?;
                    let high = debug.addr_index(cursor.read_uleb128()?)?;
                    Ok(Entry::Range { low, high })
                }
                lle::STARTX_LENGTH => {
                    let low = debug.addr_index(cursor.read_uleb128()?)?;
                    let length = cursor.read_uleb128()?;
                    Ok(Entry::Range {
                        low,
                        high: low.wrapping_add(length),
                    })
                }
                lle::START_LENGTH => {
                    let low = self.read_address(cursor)?;
                    let length = cursor.read_uleb128()?;
                    Ok(Entry::Range {
                        low,
                        high: low.wrapping_add(length),
                    })
                }
                lle::START_END => {
                    let low = self.read_address(cursor)?;
                    let high = self.read_address(cursor)?;
                    Ok(Entry::Range { low, high })
                }
                // DW_LLE_default_location is not supported.
                _ => Err(corrupted()),
            },
        }
    }
}
