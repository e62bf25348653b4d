//! In-memory stand-ins for the debugger, shared by the unit tests.

use alloc::{boxed::Box, collections::BTreeMap, collections::BTreeSet, format, vec::Vec};
use core::cell::RefCell;

use crate::{
    arch::{Arch, X86_64},
    dwarf::call_site::CallSite,
    error::{Error, Result},
    target::{BaseType, DebugInfo, Frame},
};

/// Assembles a `.debug_frame` section with one version 3 CIE
/// (code alignment `caf`, data alignment `daf`, return address column 16)
/// and one FDE per `(start, range, program)`.
pub(crate) fn debug_frame(caf: u8, daf: i8, cie_program: &[u8], fdes: &[(u64, u64, &[u8])]) -> Vec<u8> {
    let mut cie = Vec::new();
    cie.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    cie.push(3);
    cie.push(0);
    cie.push(caf);
    cie.push((daf as u8) & 0x7f);
    cie.push(16);
    cie.extend_from_slice(cie_program);

    let mut data = Vec::new();
    data.extend_from_slice(&(cie.len() as u32).to_le_bytes());
    data.extend(cie);

    for &(start, range, program) in fdes {
        let mut fde = Vec::new();
        fde.extend_from_slice(&0u32.to_le_bytes());
        fde.extend_from_slice(&start.to_le_bytes());
        fde.extend_from_slice(&range.to_le_bytes());
        fde.extend_from_slice(program);
        data.extend_from_slice(&(fde.len() as u32).to_le_bytes());
        data.extend(fde);
    }
    data
}

#[derive(Default)]
pub(crate) struct FakeFrame {
    pub(crate) registers: BTreeMap<usize, u64>,
    pub(crate) unavailable_registers: BTreeSet<usize>,
    /// Start address and bytes of each readable memory region.
    pub(crate) memory: RefCell<Vec<(u64, Vec<u8>)>>,
    pub(crate) written_registers: RefCell<BTreeMap<usize, Vec<u8>>>,
    pub(crate) pc: u64,
    pub(crate) function_start: Option<u64>,
    pub(crate) inline: bool,
    pub(crate) caller: Option<Box<FakeFrame>>,
}

impl FakeFrame {
    pub(crate) fn new(pc: u64) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }

    pub(crate) fn with_register(mut self, regnum: usize, value: u64) -> Self {
        self.registers.insert(regnum, value);
        self
    }

    pub(crate) fn with_memory(self, addr: u64, bytes: &[u8]) -> Self {
        self.memory.borrow_mut().push((addr, bytes.to_vec()));
        self
    }

    pub(crate) fn with_u64(self, addr: u64, value: u64) -> Self {
        self.with_memory(addr, &value.to_le_bytes())
    }

    pub(crate) fn with_caller(mut self, caller: FakeFrame) -> Self {
        self.caller = Some(Box::new(caller));
        self
    }

    pub(crate) fn memory_at(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = alloc::vec![0; len];
        self.read_memory(addr, &mut buf).ok()?;
        Some(buf)
    }
}

impl Frame for FakeFrame {
    fn arch(&self) -> &dyn Arch {
        &X86_64
    }

    fn register(&self, regnum: usize) -> Result<u64> {
        if self.unavailable_registers.contains(&regnum) {
            return Err(Error::unavailable(format!("register {regnum}")));
        }
        self.registers
            .get(&regnum)
            .copied()
            .ok_or_else(|| Error::unavailable(format!("register {regnum}")))
    }

    fn write_register_bytes(&self, regnum: usize, offset: usize, data: &[u8]) -> Result<()> {
        let mut written = self.written_registers.borrow_mut();
        let reg = written.entry(regnum).or_insert_with(|| {
            self.registers
                .get(&regnum)
                .copied()
                .unwrap_or_default()
                .to_le_bytes()
                .to_vec()
        });
        reg[offset..][..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr + i as u64;
            let memory = self.memory.borrow();
            let region = memory
                .iter()
                .find(|(start, bytes)| at >= *start && at < start + bytes.len() as u64)
                .ok_or_else(|| Error::unavailable(format!("memory at {at:#x}")))?;
            *byte = region.1[(at - region.0) as usize];
        }
        Ok(())
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut memory = self.memory.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u64;
            let region = memory
                .iter_mut()
                .find(|(start, bytes)| at >= *start && at < start + bytes.len() as u64)
                .ok_or_else(|| Error::unavailable(format!("memory at {at:#x}")))?;
            let start = region.0;
            region.1[(at - start) as usize] = *byte;
        }
        Ok(())
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn function_start(&self) -> Option<u64> {
        self.function_start
    }

    fn is_inline(&self) -> bool {
        self.inline
    }

    fn caller(&self) -> Option<&dyn Frame> {
        self.caller.as_deref().map(|frame| frame as &dyn Frame)
    }
}

#[derive(Default)]
pub(crate) struct FakeDebugInfo {
    pub(crate) producer: Option<&'static str>,
    /// (start, end) of functions.
    pub(crate) functions: Vec<(u64, u64)>,
    pub(crate) frame_base: Vec<u8>,
    pub(crate) die_locations: BTreeMap<u64, Vec<u8>>,
    pub(crate) die_constants: BTreeMap<u64, Vec<u8>>,
    pub(crate) base_types: BTreeMap<u64, BaseType>,
    pub(crate) addresses: Vec<u64>,
    pub(crate) call_sites: Vec<CallSite>,
    pub(crate) tail_calls: BTreeMap<u64, Vec<CallSite>>,
    pub(crate) symbols: BTreeMap<&'static str, u64>,
}

impl DebugInfo for FakeDebugInfo {
    fn producer(&self, _pc: u64) -> Option<&str> {
        self.producer
    }

    fn function_entry(&self, pc: u64) -> Option<u64> {
        self.functions
            .iter()
            .find(|(start, end)| pc >= *start && pc < *end)
            .map(|(start, _)| *start)
    }

    fn frame_base(&self, _pc: u64) -> Result<&[u8]> {
        Ok(&self.frame_base)
    }

    fn die_location(&self, die: u64, _pc: u64) -> Result<&[u8]> {
        self.die_locations
            .get(&die)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::corrupt(format!("no DIE at {die:#x}")))
    }

    fn die_constant(&self, die: u64) -> Option<&[u8]> {
        self.die_constants.get(&die).map(Vec::as_slice)
    }

    fn base_type(&self, die: u64) -> Result<BaseType> {
        self.base_types
            .get(&die)
            .copied()
            .ok_or_else(|| Error::corrupt(format!("no base type at {die:#x}")))
    }

    fn addr_index(&self, index: u64) -> Result<u64> {
        self.addresses
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::corrupt(format!("no address {index}")))
    }

    fn tls_address(&self, offset: u64) -> Result<u64> {
        Ok(0x7000_0000 + offset)
    }

    fn call_site(&self, pc: u64) -> Option<&CallSite> {
        self.call_sites.iter().find(|site| site.pc == pc)
    }

    fn tail_call_sites(&self, entry: u64) -> Option<&[CallSite]> {
        if !self.functions.iter().any(|(start, _)| *start == entry) {
            return None;
        }
        Some(self.tail_calls.get(&entry).map_or(&[][..], Vec::as_slice))
    }

    fn lookup_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}
