//! Architecture-specific knowledge the unwinder needs.
//!
//! Internal register numbers ("regnum") are whatever the debugger uses to
//! address registers of a frame. DWARF register numbers are mapped onto them
//! with [`Arch::dwarf_reg_to_regnum`]; numbers without a mapping are skipped
//! by the unwinder.

use crate::{
    dwarf::exec::{RegisterRule, RegisterSet},
    error::{Error, Result},
    reader::Endian,
    target::Frame,
};

pub trait Arch {
    fn name(&self) -> &str;
    fn endian(&self) -> Endian;
    /// Size of a target address in bytes.
    fn address_size(&self) -> u8;
    fn num_regs(&self) -> usize;
    fn register_size(&self, regnum: usize) -> usize;
    fn dwarf_reg_to_regnum(&self, dwarf_reg: u64) -> Option<usize>;
    fn pc_regnum(&self) -> Option<usize>;
    fn sp_regnum(&self) -> Option<usize>;

    fn dwarf_reg_to_regnum_or_error(&self, dwarf_reg: u64) -> Result<usize> {
        self.dwarf_reg_to_regnum(dwarf_reg)
            .ok_or(Error::BadRegister(dwarf_reg))
    }

    /// The rule a register has before any CFI instruction touched it.
    fn init_reg(&self, regnum: usize) -> RegisterRule<'static> {
        if Some(regnum) == self.pc_regnum() {
            RegisterRule::ReturnAddress
        } else if Some(regnum) == self.sp_regnum() {
            RegisterRule::Cfa
        } else {
            RegisterRule::Unspecified
        }
    }

    /// Translates register numbers as they appear in the CFI of the given
    /// section into DWARF register numbers.
    fn adjust_regnum(&self, regnum: u64, _eh_frame: bool) -> u64 {
        regnum
    }

    /// Whether `frame` is a signal trampoline even though its CIE does not say
    /// so.
    fn is_signal_frame(&self, _frame: &dyn Frame) -> bool {
        false
    }

    /// `DW_CFA_GNU_window_save`. The default follows the SPARC register
    /// window convention.
    fn window_save(&self, rules: &mut RegisterSet<'_>) {
        let size = self.register_size(0) as i64;
        for reg in 8..16u64 {
            rules.set(reg, RegisterRule::Register(reg + 16));
        }
        for reg in 16..32u64 {
            rules.set(reg, RegisterRule::Offset((reg as i64 - 16) * size));
        }
    }

    /// Computes a register saved with an architecture-defined rule.
    fn architectural_register(&self, _frame: &dyn Frame, regnum: usize, id: u32) -> Result<u64> {
        Err(Error::unsupported(alloc::format!(
            "architecture-specific rule {id} for register {regnum}"
        )))
    }
}

/// x86-64 as described by the System V psABI. The internal numbering is the
/// DWARF numbering, so register 16 is the return address column.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64;

impl X86_64 {
    pub const RAX: usize = 0;
    pub const RDX: usize = 1;
    pub const RCX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSI: usize = 4;
    pub const RDI: usize = 5;
    pub const RBP: usize = 6;
    pub const RSP: usize = 7;
    // r8..r15 are 8..15
    pub const RIP: usize = 16;

    const NAMES: [&'static str; 17] = [
        "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ];

    pub fn register_name(regnum: usize) -> Option<&'static str> {
        Self::NAMES.get(regnum).copied()
    }
}

impl Arch for X86_64 {
    fn name(&self) -> &str {
        "x86-64"
    }

    fn endian(&self) -> Endian {
        Endian::Little
    }

    fn address_size(&self) -> u8 {
        8
    }

    fn num_regs(&self) -> usize {
        Self::NAMES.len()
    }

    fn register_size(&self, _regnum: usize) -> usize {
        8
    }

    fn dwarf_reg_to_regnum(&self, dwarf_reg: u64) -> Option<usize> {
        let regnum = usize::try_from(dwarf_reg).ok()?;
        (regnum < self.num_regs()).then_some(regnum)
    }

    fn pc_regnum(&self) -> Option<usize> {
        Some(Self::RIP)
    }

    fn sp_regnum(&self) -> Option<usize> {
        Some(Self::RSP)
    }
}
