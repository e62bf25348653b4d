//! The outside world, as seen by the unwinder and the evaluator.
//!
//! Neither trait is implemented here: a debugger provides a [`Frame`] for
//! every activation it walks and a [`DebugInfo`] for the symbol tables it has
//! loaded.

use alloc::format;

use crate::{
    arch::Arch,
    dwarf::call_site::CallSite,
    error::{Error, Result},
    reader::{self, extract_unsigned},
};

/// One activation on the stack of the inferior.
///
/// Register values are those of *this* frame. The unwinder computes the
/// caller's values from them.
pub trait Frame {
    fn arch(&self) -> &dyn Arch;

    /// The value of internal register `regnum`, zero-extended.
    fn register(&self, regnum: usize) -> Result<u64>;

    /// Reads `buf.len()` bytes of register `regnum` starting at byte
    /// `offset`, in target byte order.
    fn register_bytes(&self, regnum: usize, offset: usize, buf: &mut [u8]) -> Result<()> {
        let arch = self.arch();
        let size = arch.register_size(regnum);
        if offset + buf.len() > size {
            return Err(Error::corrupt(format!(
                "bad read of {} bytes at offset {offset} of register {regnum}",
                buf.len()
            )));
        }
        let value = self.register(regnum)?;
        let mut whole = alloc::vec![0; size];
        reader::store_unsigned(&mut whole, value, arch.endian());
        buf.copy_from_slice(&whole[offset..][..buf.len()]);
        Ok(())
    }

    fn write_register_bytes(&self, regnum: usize, _offset: usize, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported(format!("writing register {regnum}")))
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&self, addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported(format!("writing memory at {addr:#x}")))
    }

    /// Reads an unsigned integer of `size` bytes from memory.
    fn read_memory_uint(&self, addr: u64, size: usize) -> Result<u64> {
        let mut buf = [0; 8];
        let buf = buf.get_mut(..size).ok_or_else(|| {
            Error::corrupt(format!("cannot read a {size} byte integer from memory"))
        })?;
        self.read_memory(addr, buf)?;
        Ok(extract_unsigned(buf, self.arch().endian()))
    }

    fn pc(&self) -> u64;

    /// An address that is guaranteed to be inside the code of this frame's
    /// function. For frames that are not the innermost one the pc is a return
    /// address which may already belong to the next function, so frames
    /// usually return `pc - 1` there.
    fn address_in_block(&self) -> u64 {
        self.pc()
    }

    /// Start address of the function this frame is executing, if known.
    fn function_start(&self) -> Option<u64>;

    /// Whether this frame is a virtual frame for an inlined function.
    fn is_inline(&self) -> bool {
        false
    }

    fn caller(&self) -> Option<&dyn Frame>;
}

/// A base type from `.debug_info`, as far as the evaluator cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseType {
    pub size: u8,
    pub signed: bool,
}

/// Symbol and DIE lookups.
///
/// All methods have defaults that report the information as missing, so an
/// implementation only provides what its symbol tables know.
pub trait DebugInfo {
    /// `DW_AT_producer` of the compilation unit covering `pc`.
    fn producer(&self, _pc: u64) -> Option<&str> {
        None
    }

    /// Entry address of the outermost (non-inlined) function containing `pc`.
    fn function_entry(&self, _pc: u64) -> Option<u64> {
        None
    }

    /// The `DW_AT_frame_base` expression of the function containing `pc`.
    fn frame_base(&self, pc: u64) -> Result<&[u8]> {
        Err(Error::corrupt(format!(
            "could not find the frame base for the function at {pc:#x}"
        )))
    }

    /// Location expression of the DIE at `die` (a `.debug_info` offset),
    /// valid at `pc`.
    fn die_location(&self, die: u64, _pc: u64) -> Result<&[u8]> {
        Err(Error::corrupt(format!("cannot find DIE at {die:#x}")))
    }

    /// `DW_AT_const_value` bytes of the DIE at `die`.
    fn die_constant(&self, _die: u64) -> Option<&[u8]> {
        None
    }

    fn base_type(&self, die: u64) -> Result<BaseType> {
        Err(Error::corrupt(format!(
            "DW_OP_const_type has different sizes for type and data (no base type at {die:#x})"
        )))
    }

    /// Entry `index` of the `.debug_addr` table of the current unit.
    fn addr_index(&self, index: u64) -> Result<u64> {
        Err(Error::corrupt(format!(
            "DW_FORM_addr_index {index} pointing outside of .debug_addr section"
        )))
    }

    /// Address of the thread-local variable at `offset` of the current
    /// module.
    fn tls_address(&self, _offset: u64) -> Result<u64> {
        Err(Error::unsupported(
            "Cannot access thread-local variables on this target",
        ))
    }

    /// The call site whose return address is `pc`.
    fn call_site(&self, _pc: u64) -> Option<&CallSite> {
        None
    }

    /// All tail calls made by the function starting exactly at `entry`, or
    /// `None` if no function starts there.
    fn tail_call_sites(&self, _entry: u64) -> Option<&[CallSite]> {
        None
    }

    /// Resolves a linkage name.
    fn lookup_symbol(&self, _name: &str) -> Option<u64> {
        None
    }
}
