//! Implements parsing and processing of DWARF call frame information.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program (a relative offset in shared object files). The remaining columns
//! contain unwinding rules that are associated with the indicated location.
//!
//! The table is stored compressed: a Common Information Entry (CIE) holds
//! what many functions share and a Frame Description Entry (FDE) per function
//! holds a small program that, when run, produces the rows. This module
//! decodes CIEs and FDEs from `.eh_frame` and `.debug_frame` into a
//! [`CfiTable`] sorted by address. Running the programs is done by
//! [`super::exec`].
#![allow(non_upper_case_globals)]


use alloc::{collections::BTreeMap, string::ToString, vec::Vec};
use core::{fmt, ops::Range};

use crate::{
    complaint::{Complaint, Complaints, Workaround},
    error::{Error, Result},
    reader::{Cursor, Endian, Format},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    // Ordered so that `.debug_frame` wins over `.eh_frame` for equal
    // addresses.
    DebugFrame,
    EhFrame,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SectionKind::DebugFrame => ".debug_frame",
            SectionKind::EhFrame => ".eh_frame",
        })
    }
}

/// The raw contents of a frame section and the address it is loaded at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSection<'a> {
    pub kind: SectionKind,
    pub data: &'a [u8],
    pub address: u64,
}

impl<'a> FrameSection<'a> {
    pub fn eh_frame(data: &'a [u8], address: u64) -> Self {
        Self {
            kind: SectionKind::EhFrame,
            data,
            address,
        }
    }

    pub fn debug_frame(data: &'a [u8], address: u64) -> Self {
        Self {
            kind: SectionKind::DebugFrame,
            data,
            address,
        }
    }

    pub fn is_eh_frame(&self) -> bool {
        self.kind == SectionKind::EhFrame
    }
}

/// How the frame sections of one object file are to be read.
#[derive(Debug, Clone, Copy)]
pub struct CfiOptions {
    pub endian: Endian,
    /// Size of a target address in `.debug_frame` CIEs before version 4.
    pub address_size: u8,
    /// Size of a pointer. `.eh_frame` always uses this.
    pub ptr_size: u8,
    /// Relocation offset of the text section. FDE addresses are unrelocated.
    pub text_offset: u64,
    /// Base for `DW_EH_PE_textrel`, the address of `.text`.
    pub text_base: u64,
    /// Base for `DW_EH_PE_datarel`, the address of `.got`.
    pub data_base: u64,
    /// Whether pointer-sized values are sign-extended (MIPS).
    pub sign_extend_vma: bool,
}

impl Default for CfiOptions {
    fn default() -> Self {
        Self {
            endian: Endian::Little,
            address_size: 8,
            ptr_size: 8,
            text_offset: 0,
            text_base: 0,
            data_base: 0,
            sign_extend_vma: false,
        }
    }
}

/// A DWARF expression embedded in the CFI.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Expr<'a>(pub &'a [u8]);

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({:x?})", self.0)
    }
}

/// What pointer encodings are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerBases {
    /// Address of the start of the section being read, for `pcrel`.
    pub section: u64,
    pub text: u64,
    pub data: u64,
    /// Start of the function, for `funcrel`.
    pub func: u64,
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq)]
pub struct Cie<'a> {
    /// Offset of the CIE in its section.
    pub offset: u64,
    pub section: FrameSection<'a>,
    pub format: Format,
    pub endian: Endian,
    pub version: u8,
    /// A null-terminated UTF-8 string that identifies the augmentation to this
    /// CIE or to the FDEs that use it. If a reader encounters an
    /// augmentation string that is unexpected, then only the following
    /// fields can be read:
    /// - CIE: length, CIE_id, version, augmentation
    /// - FDE: length, CIE_pointer, initial_location, address_range
    ///
    /// If there is no augmentation, this value is a zero byte.
    pub augmentation: &'a str,
    /// A constant that is factored out of all advance location instructions
    /// (see Section 6.4.2.1 on page 177). The resulting value is
    /// (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions (see
    /// Sections 6.4.2.2 on page 177 and 6.4.2.3 on page 179). The resulting
    /// value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// An unsigned LEB128 constant that indicates which column in the rule
    /// table represents the return address of the function. Note that this
    /// column might not correspond to an actual machine register.
    pub return_address_register: u64,
    pub address_size: u8,
    pub segment_size: u8,
    /// Size of an unencoded pointer in FDEs using this CIE.
    pub ptr_size: u8,
    /// Encoding of the FDE addresses, `R` augmentation.
    pub encoding: Encoding,
    /// `L` augmentation.
    pub lsda_encoding: Option<Encoding>,
    /// `P` augmentation.
    pub personality: Option<u64>,
    pub saw_z_augmentation: bool,
    /// `S` augmentation: FDEs using this CIE describe signal trampolines.
    pub signal_frame: bool,
    /// A sequence of rules that are interpreted to create the initial setting
    /// of each column in the table.
    /// The default rule for all columns before interpretation of the initial
    /// instructions is the undefined rule. However, an ABI authoring body
    /// or a compilation system authoring body may specify an alternate
    /// default value for any or all columns.
    pub initial_instructions: Range<usize>,
    pub bases: PointerBases,
    pub sign_extend_vma: bool,
}

impl<'a> Cie<'a> {
    pub fn initial_instructions(&self) -> &'a [u8] {
        &self.section.data[self.initial_instructions.clone()]
    }

    pub fn is_eh_frame(&self) -> bool {
        self.section.is_eh_frame()
    }

    /// Reads a pointer in `encoding` relative to the bases of this CIE.
    pub fn read_pointer(&self, data: &mut Cursor<'_>, encoding: Encoding, func: u64) -> Result<u64> {
        let bases = PointerBases { func, ..self.bases };
        read_encoded(data, encoding, self.ptr_size, &bases, self.sign_extend_vma)
    }
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq)]
pub struct Fde<'a> {
    /// Offset of the FDE in its section.
    pub offset: u64,
    /// Index of the CIE in [`CfiTable::cies`].
    pub cie: usize,
    /// The address of the first location associated with this table entry,
    /// not including the text offset.
    pub initial_location: u64,
    /// The number of bytes of program instructions described by this entry.
    pub address_range: u64,
    /// A sequence of table defining instructions that are described in Section
    /// 6.4.2.
    pub instructions: Range<usize>,
    pub section: FrameSection<'a>,
}

impl<'a> Fde<'a> {
    pub fn instructions(&self) -> &'a [u8] {
        &self.section.data[self.instructions.clone()]
    }

    pub fn is_eh_frame(&self) -> bool {
        self.section.is_eh_frame()
    }

    pub fn contains(&self, unrelocated_pc: u64) -> bool {
        unrelocated_pc >= self.initial_location
            && unrelocated_pc - self.initial_location < self.address_range
    }
}

/// All FDEs of one object file, sorted by address.
#[derive(Debug, Clone, PartialEq)]
pub struct CfiTable<'a> {
    cies: Vec<Cie<'a>>,
    fdes: Vec<Fde<'a>>,
    text_offset: u64,
}

impl<'a> CfiTable<'a> {
    /// Parses `.eh_frame` and `.debug_frame` and merges them.
    ///
    /// A section that turns out to be unparseable is dropped with a complaint
    /// instead of failing the whole table: what came before it is kept.
    #[instrument(
        level = "debug",
        skip_all,
        fields(eh_frame = eh_frame.is_some(), debug_frame = debug_frame.is_some())
    )]
    pub fn build(
        eh_frame: Option<FrameSection<'a>>,
        debug_frame: Option<FrameSection<'a>>,
        options: &CfiOptions,
        complaints: &Complaints,
    ) -> Self {
        let mut cies = Vec::new();
        let mut fdes = Vec::new();

        for section in [eh_frame, debug_frame].into_iter().flatten() {
            let num_old = fdes.len();
            let mut parser = Parser {
                section,
                options,
                complaints,
                cies: &mut cies,
                cie_index: BTreeMap::new(),
                fdes: &mut fdes,
            };
            if let Err(err) = parser.parse() {
                complaints.complain(Complaint::SectionDiscarded {
                    section: section.kind,
                    reason: err.to_string(),
                });
                // `.eh_frame` comes first, so truncating drops all of it.
                fdes.truncate(num_old);
            }
        }

        let fdes = sort_and_prune(fdes);
        debug!(cies = cies.len(), fdes = fdes.len(), "built CFI table");

        Self {
            cies,
            fdes,
            text_offset: options.text_offset,
        }
    }

    pub fn fdes(&self) -> &[Fde<'a>] {
        &self.fdes
    }

    pub fn cies(&self) -> &[Cie<'a>] {
        &self.cies
    }

    pub fn cie(&self, fde: &Fde<'a>) -> &Cie<'a> {
        &self.cies[fde.cie]
    }

    pub fn text_offset(&self) -> u64 {
        self.text_offset
    }

    pub fn is_empty(&self) -> bool {
        self.fdes.is_empty()
    }

    /// Finds the FDE covering the relocated address `pc`.
    pub fn find_fde(&self, pc: u64) -> Option<&Fde<'a>> {
        let first = self.fdes.first()?;
        if pc < self.text_offset.wrapping_add(first.initial_location) {
            return None;
        }
        let seek = pc.wrapping_sub(self.text_offset);
        let idx = self.fdes.partition_point(|fde| fde.initial_location <= seek);
        let fde = &self.fdes[idx.checked_sub(1)?];
        fde.contains(seek).then_some(fde)
    }
}

fn sort_and_prune(mut fdes: Vec<Fde<'_>>) -> Vec<Fde<'_>> {
    // Stable, so FDEs from the same section with the same address keep their
    // order.
    fdes.sort_by_key(|fde| (fde.initial_location, fde.section.kind));

    // Relocations that failed to apply leave FDEs at address 0. Drop those
    // that would shadow real functions.
    let first_non_zero = fdes
        .iter()
        .find(|fde| fde.initial_location != 0)
        .map(|fde| fde.initial_location);

    let mut table: Vec<Fde<'_>> = Vec::with_capacity(fdes.len());
    for fde in fdes {
        if fde.initial_location == 0
            && first_non_zero.is_some_and(|first| first < fde.address_range)
        {
            continue;
        }
        if table
            .last()
            .is_some_and(|prev| prev.initial_location == fde.initial_location)
        {
            continue;
        }
        table.push(fde);
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Cie,
    Fde,
    Either,
}

/// Why a record could not be decoded.
enum EntryError {
    /// The record is broken but the rest of the section may be fine.
    Malformed,
    /// The whole section cannot be trusted.
    Fatal(Error),
}

impl From<Error> for EntryError {
    fn from(err: Error) -> Self {
        match err {
            Error::UnexpectedEof { .. } => EntryError::Malformed,
            err => EntryError::Fatal(err),
        }
    }
}

struct Parser<'p, 'a> {
    section: FrameSection<'a>,
    options: &'p CfiOptions,
    complaints: &'p Complaints,
    cies: &'p mut Vec<Cie<'a>>,
    /// CIEs of this section by offset.
    cie_index: BTreeMap<u64, usize>,
    fdes: &'p mut Vec<Fde<'a>>,
}

impl<'a> Parser<'_, 'a> {
    #[instrument(level = "debug", skip(self), fields(section = %self.section.kind, size = self.section.data.len()))]
    fn parse(&mut self) -> Result<()> {
        let mut offset = 0;
        while offset < self.section.data.len() {
            offset = self.decode_entry(offset, Want::Either)?;
        }
        Ok(())
    }

    /// Decodes the record at `start` and returns the offset of the next one.
    /// Broken records are skipped by trying 4 and 8 byte alignment; if that
    /// does not help, the rest of the section is skipped.
    fn decode_entry(&mut self, start: usize, want: Want) -> Result<usize> {
        let mut workaround = None;
        let mut start = start;
        let end = loop {
            match self.decode_entry_1(start, want) {
                Ok(end) => break end,
                Err(EntryError::Fatal(err)) => return Err(err),
                Err(EntryError::Malformed) => {}
            }
            trace!(start, ?workaround, "malformed frame entry");
            if workaround < Some(Workaround::Align4) && start % 4 != 0 {
                start += 4 - start % 4;
                workaround = Some(Workaround::Align4);
                continue;
            }
            if workaround < Some(Workaround::Align8) && start % 8 != 0 {
                start += 8 - start % 8;
                workaround = Some(Workaround::Align8);
                continue;
            }
            workaround = Some(Workaround::GaveUp);
            break self.section.data.len();
        };

        if let Some(workaround) = workaround {
            self.complaints.complain(Complaint::CorruptSection {
                section: self.section.kind,
                workaround,
            });
        }
        Ok(end)
    }

    fn decode_entry_1(&mut self, start: usize, want: Want) -> Result<usize, EntryError> {
        let data = self.section.data;
        let endian = self.options.endian;
        if start >= data.len() {
            return Err(EntryError::Malformed);
        }
        let mut header = Cursor::with_range(data, start..data.len(), endian)?;
        let (length, format) = header.read_initial_length()?;
        let end = (header.offset() as u64)
            .checked_add(length)
            .filter(|&end| end <= data.len() as u64)
            .ok_or(EntryError::Malformed)? as usize;
        if length == 0 {
            return Ok(end);
        }

        let mut entry = Cursor::with_range(data, header.offset()..end, endian)?;
        let cie_id = match (self.section.kind, format) {
            (SectionKind::EhFrame, _) => 0,
            (SectionKind::DebugFrame, Format::Dwarf32) => 0xffff_ffff,
            (SectionKind::DebugFrame, Format::Dwarf64) => u64::MAX,
        };
        let id_offset = entry.offset();
        let id = entry.read_uint(format.offset_size())?;

        if id == cie_id {
            if want == Want::Fde {
                return Err(EntryError::Fatal(Error::corrupt(
                    "Found a CIE when not expecting it.",
                )));
            }
            self.decode_cie(start, entry, format, end)
        } else {
            if want == Want::Cie {
                return Err(EntryError::Fatal(Error::corrupt(
                    "Found an FDE when not expecting it.",
                )));
            }
            let cie_offset = if self.section.is_eh_frame() {
                // Relative to the position of the CIE pointer.
                (id_offset as u64).checked_sub(id)
            } else {
                Some(id)
            };
            let cie_offset = cie_offset
                .filter(|&offset| offset < data.len() as u64)
                .ok_or(EntryError::Malformed)?;
            self.decode_fde(start, cie_offset, entry, end)
        }
    }

    #[instrument(level = "trace", skip(self, data, format))]
    fn decode_cie(
        &mut self,
        start: usize,
        mut data: Cursor<'a>,
        format: Format,
        end: usize,
    ) -> Result<usize, EntryError> {
        let offset = start as u64;
        if self.cie_index.contains_key(&offset) {
            return Ok(end);
        }

        let version = data.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(EntryError::Malformed);
        }

        let augmentation = data.read_cstr().map_err(|_| EntryError::Malformed)?;
        let augmentation =
            core::str::from_utf8(augmentation).map_err(|_| EntryError::Malformed)?;

        // RealView uses its own augmentation format; none of it matters here.
        let mut codes = if augmentation.starts_with("armcc") {
            ""
        } else {
            augmentation
        };

        // GCC 2.x `eh` augmentation: a pointer to the exception table.
        if let Some(rest) = codes.strip_prefix("eh") {
            data.skip(usize::from(self.options.ptr_size))?;
            codes = rest;
        }

        let (address_size, segment_size) = if version >= 4 {
            (data.read_u8()?, data.read_u8()?)
        } else {
            (self.options.address_size, 0)
        };
        let ptr_size = if self.section.is_eh_frame() {
            self.options.ptr_size
        } else {
            address_size
        };

        let code_alignment_factor = data.read_uleb128()?;
        let data_alignment_factor = data.read_sleb128()?;
        let return_address_register = if version == 1 {
            u64::from(data.read_u8()?)
        } else {
            data.read_uleb128()?
        };

        let mut cie = Cie {
            offset,
            section: self.section,
            format,
            endian: self.options.endian,
            version,
            augmentation,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            address_size,
            segment_size,
            ptr_size,
            encoding: Encoding::ABSPTR,
            lsda_encoding: None,
            personality: None,
            saw_z_augmentation: false,
            signal_frame: false,
            initial_instructions: 0..0,
            bases: PointerBases {
                section: self.section.address,
                text: self.options.text_base,
                data: self.options.data_base,
                func: 0,
            },
            sign_extend_vma: self.options.sign_extend_vma,
        };

        let mut augmentation_end = None;
        if let Some(rest) = codes.strip_prefix('z') {
            let len = data.read_uleb128()?;
            augmentation_end = Some((data.offset() as u64).saturating_add(len));
            cie.saw_z_augmentation = true;
            codes = rest;
        }

        for code in codes.bytes() {
            match code {
                // If present, it indicates the presence of one argument in the Augmentation Data of the
                // CIE, and a corresponding argument in the Augmentation Data of the FDE.
                // The argument in the Augmentation Data of the CIE is 1-byte and represents the pointer
                // encoding used for the argument in the Augmentation Data of the FDE, which
                // is the address of a language-specific data area (LSDA).
                b'L' => {
                    cie.lsda_encoding = Some(Encoding(data.read_u8()?));
                }
                // If present, The Augmentation Data shall include a 1 byte argument that represents the
                // pointer encoding for the address pointers used in the FDE.
                b'R' => {
                    cie.encoding = Encoding(data.read_u8()?);
                }
                // If present, it indicates the presence of two arguments in the Augmentation Data of
                // the CIE. The first argument is 1-byte and represents the pointer encoding
                // used for the second argument, which is the address of a personality
                // routine handler. We only need the value, so the indirection is not followed.
                b'P' => {
                    let encoding = Encoding(data.read_u8()? & !DW_EH_PE_indirect);
                    cie.personality = Some(cie.read_pointer(&mut data, encoding, 0)?);
                }
                b'S' => {
                    cie.signal_frame = true;
                }
                _ => {
                    trace!(code, "unknown augmentation");
                    if let Some(augmentation_end) = augmentation_end {
                        data.seek(augmentation_end as usize)?;
                    }
                    break;
                }
            }
        }

        cie.initial_instructions = data.offset()..end;
        trace!(?cie, "CIE");

        self.cie_index.insert(offset, self.cies.len());
        self.cies.push(cie);
        Ok(end)
    }

    #[instrument(level = "trace", skip(self, data))]
    fn decode_fde(
        &mut self,
        start: usize,
        cie_offset: u64,
        mut data: Cursor<'a>,
        end: usize,
    ) -> Result<usize, EntryError> {
        let cie = match self.cie_index.get(&cie_offset) {
            Some(&cie) => cie,
            None => {
                self.decode_entry(cie_offset as usize, Want::Cie)
                    .map_err(EntryError::Fatal)?;
                *self
                    .cie_index
                    .get(&cie_offset)
                    .ok_or(EntryError::Malformed)?
            }
        };
        let (initial_location, address_range, saw_z) = {
            let cie = &self.cies[cie];
            let initial_location = cie.read_pointer(&mut data, cie.encoding, 0)?;
            // The range is a length, it is not relative to anything.
            let address_range = cie.read_pointer(&mut data, cie.encoding.format_only(), 0)?;
            (initial_location, address_range, cie.saw_z_augmentation)
        };

        if saw_z {
            let len = data.read_uleb128()?;
            let augmentation_end = (data.offset() as u64).saturating_add(len);
            if augmentation_end > end as u64 {
                return Err(EntryError::Malformed);
            }
            data.seek(augmentation_end as usize)?;
        }

        let fde = Fde {
            offset: start as u64,
            cie,
            initial_location,
            address_range,
            instructions: data.offset()..end,
            section: self.section,
        };
        trace!(?fde, "FDE");

        if fde.address_range == 0 {
            trace!(start, "discarding FDE with an empty range");
        } else {
            self.fdes.push(fde);
        }
        Ok(end)
    }
}

/// Reads a pointer encoded as described by `encoding`.
///
/// `ptr_len` is the size of an unencoded pointer. `data` must be positioned
/// within its section so that pc-relative values can be computed.
pub fn read_encoded(
    data: &mut Cursor<'_>,
    mut encoding: Encoding,
    ptr_len: u8,
    bases: &PointerBases,
    sign_extend_vma: bool,
) -> Result<u64> {
    if encoding.0 & DW_EH_PE_indirect != 0 {
        return Err(Error::unsupported(
            "Unsupported encoding: DW_EH_PE_indirect",
        ));
    }

    let base = match encoding.application()? {
        ValueApplication::DW_EH_PE_absptr => 0,
        ValueApplication::DW_EH_PE_pcrel => bases.section.wrapping_add(data.offset() as u64),
        ValueApplication::DW_EH_PE_textrel => bases.text,
        ValueApplication::DW_EH_PE_datarel => bases.data,
        ValueApplication::DW_EH_PE_funcrel => bases.func,
        ValueApplication::DW_EH_PE_aligned => {
            let ptr_len = usize::from(ptr_len.max(1));
            let misalignment = data.offset() % ptr_len;
            if misalignment != 0 {
                data.skip(ptr_len - misalignment)?;
            }
            0
        }
    };

    if encoding.0 & 0x07 == 0 {
        encoding = Encoding(encoding.0 | Encoding::for_size(ptr_len)?);
        if sign_extend_vma {
            encoding = Encoding(encoding.0 | 0x08);
        }
    }

    let value = match encoding.format()? {
        ValueFormat::DW_EH_PE_uleb128 => data.read_uleb128()?,
        ValueFormat::DW_EH_PE_udata2 => u64::from(data.read_u16()?),
        ValueFormat::DW_EH_PE_udata4 => u64::from(data.read_u32()?),
        ValueFormat::DW_EH_PE_udata8 => data.read_u64()?,
        ValueFormat::DW_EH_PE_sleb128 => data.read_sleb128()? as u64,
        ValueFormat::DW_EH_PE_sdata2 => i64::from(data.read_i16()?) as u64,
        ValueFormat::DW_EH_PE_sdata4 => i64::from(data.read_i32()?) as u64,
        ValueFormat::DW_EH_PE_sdata8 => data.read_i64()? as u64,
    };

    Ok(base.wrapping_add(value))
}

const DW_EH_PE_indirect: u8 = 0x80;

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(0x00);
    pub const OMIT: Encoding = Encoding(0xff);

    fn for_size(size: u8) -> Result<u8> {
        match size {
            2 => Ok(ValueFormat::DW_EH_PE_udata2 as u8),
            4 => Ok(ValueFormat::DW_EH_PE_udata4 as u8),
            8 => Ok(ValueFormat::DW_EH_PE_udata8 as u8),
            _ => Err(Error::unsupported(alloc::format!(
                "Unsupported address size {size}"
            ))),
        }
    }

    /// The same encoding without its application bits.
    pub fn format_only(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }

    fn format(&self) -> Result<ValueFormat> {
        Ok(match self.0 & 0b1111 {
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            v => {
                return Err(Error::corrupt(alloc::format!(
                    "Invalid or unsupported encoding format {v:#x}"
                )))
            }
        })
    }

    fn application(&self) -> Result<ValueApplication> {
        Ok(match self.0 & 0x70 {
            0x00 => ValueApplication::DW_EH_PE_absptr,
            0x10 => ValueApplication::DW_EH_PE_pcrel,
            0x20 => ValueApplication::DW_EH_PE_textrel,
            0x30 => ValueApplication::DW_EH_PE_datarel,
            0x40 => ValueApplication::DW_EH_PE_funcrel,
            0x50 => ValueApplication::DW_EH_PE_aligned,
            v => {
                return Err(Error::corrupt(alloc::format!(
                    "Invalid or unsupported encoding application {v:#x}"
                )))
            }
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => write!(f, "{application:?} | {format:?}"),
            _ if self.0 & 0x0f == 0 && self.0 & 0x80 == 0 => write!(f, "{:#x} | ptr", self.0),
            _ => write!(f, "Encoding({:#x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug)]
#[repr(u8)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the current program counter.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}

/// A decoded call frame instruction. Offsets are still factored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// The DW_CFA_set_loc instruction takes a single operand that represents a
    /// target address. The required action is to create a new table row using
    /// the specified address as the location. The address is not relocated.
    SetLoc(u64),
    /// DW_CFA_advance_loc and DW_CFA_advance_loc1/2/4: create a new table row
    /// with a location value that is computed by taking the current entry’s
    /// location value and adding the value of delta * code_alignment_factor.
    AdvanceLoc(u64),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// The DW_CFA_def_cfa instruction takes two unsigned LEB128 operands
    /// representing a register number and a (non-factored) offset. The required
    /// action is to define the current CFA rule to use the provided register
    /// and offset
    DefCfa { register: u64, offset: u64 },
    /// This instruction is identical to DW_CFA_def_cfa except that the
    /// second operand is signed and factored.
    DefCfaSf { register: u64, factored_offset: i64 },
    /// The DW_CFA_def_cfa_register instruction takes a single unsigned LEB128
    /// operand representing a register number. The required action is to define
    /// the current CFA rule to use the provided register (but to keep the
    /// old offset).
    DefCfaRegister(u64),
    /// The DW_CFA_def_cfa_offset instruction takes a single unsigned LEB128
    /// operand representing a (non-factored) offset. The required action is to
    /// define the current CFA rule to use the provided offset (but to keep
    /// the old register).
    DefCfaOffset(u64),
    /// Identical to DW_CFA_def_cfa_offset except that the operand is signed
    /// and factored.
    DefCfaOffsetSf(i64),
    /// The DW_CFA_def_cfa_expression instruction takes a single operand encoded
    /// as a DW_FORM_exprloc value representing a DWARF expression. The
    /// required action is to establish that expression as the means by which
    /// the current CFA is computed.
    DefCfaExpression(Expr<'a>),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    /// The DW_CFA_undefined instruction takes a single unsigned LEB128 operand
    /// that represents a register number. The required action is to set the
    /// rule for the specified register to “undefined.”
    Undefined(u64),
    /// The DW_CFA_same_value instruction takes a single unsigned LEB128 operand
    /// that represents a register number. The required action is to set the
    /// rule for the specified register to “same value.”
    SameValue(u64),
    /// DW_CFA_offset and DW_CFA_offset_extended: the rule for the register
    /// becomes offset(N) where N is factored_offset * data_alignment_factor.
    Offset { register: u64, factored_offset: u64 },
    /// DW_CFA_offset_extended_sf, with a signed factored offset.
    OffsetSf { register: u64, factored_offset: i64 },
    /// DW_CFA_GNU_negative_offset_extended: like DW_CFA_offset_extended but
    /// the offset is negated.
    NegativeOffset { register: u64, factored_offset: u64 },
    /// The DW_CFA_val_offset instruction takes two unsigned LEB128 operands
    /// representing a register number and a factored offset. The required
    /// action is to change the rule for the register indicated by the
    /// register number to be a val_offset(N) rule where the value of N is
    /// factored_offset * data_alignment_factor.
    ValOffset { register: u64, factored_offset: u64 },
    /// DW_CFA_val_offset_sf, with a signed factored offset.
    ValOffsetSf { register: u64, factored_offset: i64 },
    /// The DW_CFA_register instruction takes two unsigned LEB128 operands
    /// representing register numbers. The required action is to set the rule
    /// for the first register to be register(R) where R is the second
    /// register.
    Register { register: u64, from: u64 },
    /// The DW_CFA_expression instruction takes two operands: an unsigned LEB128
    /// value representing a register number, and a DW_FORM_block value
    /// representing a DWARF expression. The required action is to change the
    /// rule for the register indicated by the register number to be an
    /// expression(E) rule where E is the DWARF expression.
    Expression { register: u64, expr: Expr<'a> },
    /// Like DW_CFA_expression, but the expression computes the value instead
    /// of its address.
    ValExpression { register: u64, expr: Expr<'a> },
    /// DW_CFA_restore and DW_CFA_restore_extended: change the rule for the
    /// indicated register to the rule assigned it by the initial_instructions
    /// in the CIE.
    Restore(u64),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    /// The DW_CFA_remember_state instruction takes no operands. The required
    /// action is to push the set of rules for every register onto an implicit
    /// stack.
    RememberState,
    /// The DW_CFA_restore_state instruction takes no operands. The required
    /// action is to pop the set of rules off the implicit stack and place them
    /// in the current row.
    RestoreState,
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
    //
    //-------- GNU extensions
    //
    /// DW_CFA_GNU_window_save, SPARC register windows.
    WindowSave,
    /// DW_CFA_GNU_args_size: size of the arguments pushed on the stack.
    ArgsSize(u64),
}

const DW_CFA_advance_loc_hi: u8 = 0x40;
const DW_CFA_offset_hi: u8 = 0x80;
const DW_CFA_restore_hi: u8 = 0xc0;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_GNU_window_save: u8 = 0x2d;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// Decodes the instructions of a CIE or FDE program.
pub struct InstrIter<'c, 'a> {
    data: Cursor<'a>,
    cie: &'c Cie<'a>,
    /// Start of the function, for `DW_EH_PE_funcrel` in `DW_CFA_set_loc`.
    func: u64,
}

impl<'c, 'a> InstrIter<'c, 'a> {
    /// Decodes the bytes at `range` of the CIE's section.
    pub fn new(cie: &'c Cie<'a>, range: Range<usize>, func: u64) -> Result<Self> {
        Ok(Self {
            data: Cursor::with_range(cie.section.data, range, cie.endian)?,
            cie,
            func,
        })
    }

    /// Offset of the next instruction in the section.
    pub fn offset(&self) -> usize {
        self.data.offset()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn expr(&mut self) -> Result<Expr<'a>> {
        let len = self.data.read_uleb128()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::corrupt("CFA expression length does not fit"))?;
        Ok(Expr(self.data.read_bytes(len)?))
    }

    fn decode(&mut self) -> Result<Instruction<'a>> {
        let data = &mut self.data;
        let b = data.read_u8()?;
        let low_6 = u64::from(b & 0x3f);
        Ok(match b & 0xc0 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(low_6),
            DW_CFA_offset_hi => Instruction::Offset {
                register: low_6,
                factored_offset: data.read_uleb128()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(low_6),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    let encoding = self.cie.encoding;
                    Instruction::SetLoc(self.cie.read_pointer(data, encoding, self.func)?)
                }
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc(u64::from(data.read_u8()?)),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc(u64::from(data.read_u16()?)),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc(u64::from(data.read_u32()?)),
                DW_CFA_offset_extended => Instruction::Offset {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::Restore(data.read_uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(data.read_uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(data.read_uleb128()?),
                DW_CFA_register => Instruction::Register {
                    register: data.read_uleb128()?,
                    from: data.read_uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: data.read_uleb128()?,
                    offset: data.read_uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(data.read_uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(data.read_uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expr()?),
                DW_CFA_expression => {
                    let register = data.read_uleb128()?;
                    Instruction::Expression {
                        register,
                        expr: self.expr()?,
                    }
                }
                DW_CFA_offset_extended_sf => Instruction::OffsetSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(data.read_sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_val_expression => {
                    let register = data.read_uleb128()?;
                    Instruction::ValExpression {
                        register,
                        expr: self.expr()?,
                    }
                }
                DW_CFA_GNU_window_save => Instruction::WindowSave,
                DW_CFA_GNU_args_size => Instruction::ArgsSize(data.read_uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::NegativeOffset {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                op => {
                    return Err(Error::corrupt(alloc::format!(
                        "unknown CFI instruction {op:#x} at {:#x}",
                        data.offset() - 1
                    )))
                }
            },
        })
    }
}

impl<'a> Iterator for InstrIter<'_, 'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let result = self.decode();
        if result.is_err() {
            // don't keep decoding garbage
            let end = self.data.end();
            let _ = self.data.seek(end);
        }
        Some(result)
    }
}
