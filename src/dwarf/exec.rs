//! Runs CIE and FDE programs to produce the unwind rules of one table row.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions


use alloc::{format, vec::Vec};
use core::ops::Range;

use super::{
    parse::{Cie, Expr, Fde, InstrIter, Instruction},
    quirks::Quirks,
};
use crate::{
    arch::Arch,
    complaint::{Complaint, Complaints},
    error::{Error, Result},
};

/// Register columns at or above this are not accepted from CFI.
pub const MAX_COLUMNS: u64 = 4096;

/// How to recover the value a register had in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterRule<'a> {
    /// No instruction said anything about this register.
    #[default]
    Unspecified,
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    /// (By convention, it is preserved by the callee, but the callee has not
    /// modified it.)
    SameValue,
    /// The previous value of this register is saved at the address CFA+N where
    /// CFA is the current CFA value and N is a signed offset
    Offset(i64),
    /// The previous value of this register is the value CFA+N where CFA is the
    /// current CFA value and N is a signed offset.
    ValOffset(i64),
    /// The previous value of this register is stored in another register
    /// numbered R (a DWARF register number).
    Register(u64),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression E (see Section 2.5 on page 26)
    Expression(Expr<'a>),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression E (see Section 2.5 on page 26).
    ValExpression(Expr<'a>),
    /// The value of the return address column.
    ReturnAddress,
    /// The value of the return address column plus N.
    ReturnAddressOffset(i64),
    /// The CFA itself.
    Cfa,
    /// CFA+N.
    CfaOffset(i64),
    ///  The rule is defined externally to this specification by the augmenter.
    Architectural(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaRule<'a> {
    #[default]
    Unset,
    /// `cfa_register + cfa_offset`
    RegisterOffset,
    Expression(Expr<'a>),
}

/// The rules of one table row: one per column plus the CFA.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterSet<'a> {
    rules: Vec<RegisterRule<'a>>,
    pub cfa: CfaRule<'a>,
    pub cfa_register: u64,
    pub cfa_offset: i64,
}

impl<'a> RegisterSet<'a> {
    pub fn get(&self, column: u64) -> RegisterRule<'a> {
        usize::try_from(column)
            .ok()
            .and_then(|column| self.rules.get(column))
            .copied()
            .unwrap_or_default()
    }

    /// Columns from [`MAX_COLUMNS`] on are ignored.
    pub fn set(&mut self, column: u64, rule: RegisterRule<'a>) {
        if column >= MAX_COLUMNS {
            return;
        }
        let Ok(column) = usize::try_from(column) else {
            return;
        };
        if column >= self.rules.len() {
            if rule == RegisterRule::Unspecified {
                return;
            }
            self.rules.resize(column + 1, RegisterRule::Unspecified);
        }
        self.rules[column] = rule;
    }

    /// Number of columns that may have a rule.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All columns with their rules, including unspecified ones.
    pub fn iter(&self) -> impl Iterator<Item = (u64, RegisterRule<'a>)> + '_ {
        self.rules
            .iter()
            .enumerate()
            .map(|(column, rule)| (column as u64, *rule))
    }
}

/// The state of the interpreter while running the programs of one FDE.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState<'a> {
    pub regs: RegisterSet<'a>,
    /// The rules after the CIE program, for `DW_CFA_restore`.
    pub initial: Option<RegisterSet<'a>>,
    remembered: Vec<RegisterSet<'a>>,
    /// Location of the current row, relocated.
    pub pc: u64,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub retaddr_column: u64,
    pub quirks: Quirks,
}

impl<'a> FrameState<'a> {
    pub fn new(cie: &Cie<'a>, pc: u64, quirks: Quirks) -> Self {
        Self {
            regs: RegisterSet::default(),
            initial: None,
            remembered: Vec::new(),
            pc,
            code_alignment_factor: cie.code_alignment_factor,
            data_alignment_factor: cie.data_alignment_factor,
            retaddr_column: cie.return_address_register,
            quirks,
        }
    }

    fn factored(&self, offset: i64) -> i64 {
        offset.wrapping_mul(self.data_alignment_factor)
    }

    fn restore(&mut self, column: u64, complaints: &Complaints) {
        let rule = self
            .initial
            .as_ref()
            .map_or(RegisterRule::Unspecified, |initial| initial.get(column));
        self.regs.set(column, rule);
        if rule == RegisterRule::Unspecified {
            complaints.complain(Complaint::RestoreUnspecified {
                register: column,
                pc: self.pc,
            });
        }
    }

    /// Remembers the current rules as the CIE's initial rules.
    pub fn capture_initial(&mut self) {
        self.initial = Some(self.regs.clone());
    }
}

/// The two programs that together describe one function.
#[derive(Debug, Clone, Copy)]
pub struct CfiProgram<'t, 'a> {
    pub cie: &'t Cie<'a>,
    pub fde: &'t Fde<'a>,
    pub text_offset: u64,
}

impl<'t, 'a> CfiProgram<'t, 'a> {
    pub fn cie_instructions(&self) -> Range<usize> {
        self.cie.initial_instructions.clone()
    }

    pub fn fde_instructions(&self) -> Range<usize> {
        self.fde.instructions.clone()
    }

    /// Relocated start of the function.
    pub fn start(&self) -> u64 {
        self.fde.initial_location.wrapping_add(self.text_offset)
    }

    /// The rules in effect at `pc`.
    pub fn rules_at(
        &self,
        pc: u64,
        arch: &dyn Arch,
        complaints: &Complaints,
        quirks: Quirks,
    ) -> Result<FrameState<'a>> {
        let mut state = FrameState::new(self.cie, self.start(), quirks);
        execute(self, self.cie_instructions(), pc, &mut state, arch, complaints)?;
        state.capture_initial();
        execute(self, self.fde_instructions(), pc, &mut state, arch, complaints)?;
        Ok(state)
    }
}

/// Runs the instructions at `range` until the row containing `pc` is
/// complete, and returns the offset of the first instruction not run.
///
/// The row containing `pc` is complete once an instruction advances the
/// location past `pc`, so `state.pc` may end up past `pc`.
pub fn execute<'a>(
    program: &CfiProgram<'_, 'a>,
    range: Range<usize>,
    pc: u64,
    state: &mut FrameState<'a>,
    arch: &dyn Arch,
    complaints: &Complaints,
) -> Result<usize> {
    let eh_frame = program.cie.is_eh_frame();
    let adjust = |column: u64| arch.adjust_regnum(column, eh_frame);
    // the column of a register that gets a rule
    let column = |register: u64| {
        let column = adjust(register);
        if column >= MAX_COLUMNS {
            return Err(Error::corrupt(format!(
                "DW_CFA register column {column} is out of range"
            )));
        }
        Ok(column)
    };
    let mut insns = InstrIter::new(program.cie, range, program.fde.initial_location)?;

    while !insns.is_empty() && state.pc <= pc {
        let Some(insn) = insns.next() else {
            break;
        };
        let insn = insn?;
        trace!(?insn, pc = state.pc);
        match insn {
            Instruction::SetLoc(location) => {
                state.pc = location.wrapping_add(program.text_offset);
            }
            Instruction::AdvanceLoc(delta) => {
                state.pc = state
                    .pc
                    .wrapping_add(delta.wrapping_mul(state.code_alignment_factor));
            }
            Instruction::Offset {
                register,
                factored_offset,
            } => {
                let offset = state.factored(factored_offset as i64);
                state.regs.set(column(register)?, RegisterRule::Offset(offset));
            }
            Instruction::OffsetSf {
                register,
                factored_offset,
            } => {
                let offset = state.factored(factored_offset);
                state.regs.set(column(register)?, RegisterRule::Offset(offset));
            }
            Instruction::NegativeOffset {
                register,
                factored_offset,
            } => {
                let offset = state.factored(factored_offset as i64).wrapping_neg();
                state.regs.set(column(register)?, RegisterRule::Offset(offset));
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = state.factored(factored_offset as i64);
                state
                    .regs
                    .set(column(register)?, RegisterRule::ValOffset(offset));
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = state.factored(factored_offset);
                state
                    .regs
                    .set(column(register)?, RegisterRule::ValOffset(offset));
            }
            Instruction::Restore(register) => {
                state.restore(column(register)?, complaints);
            }
            Instruction::Undefined(register) => {
                state.regs.set(column(register)?, RegisterRule::Undefined);
            }
            Instruction::SameValue(register) => {
                state.regs.set(column(register)?, RegisterRule::SameValue);
            }
            Instruction::Register { register, from } => {
                state
                    .regs
                    .set(column(register)?, RegisterRule::Register(adjust(from)));
            }
            Instruction::Expression { register, expr } => {
                state
                    .regs
                    .set(column(register)?, RegisterRule::Expression(expr));
            }
            Instruction::ValExpression { register, expr } => {
                state
                    .regs
                    .set(column(register)?, RegisterRule::ValExpression(expr));
            }
            Instruction::RememberState => {
                state.remembered.push(state.regs.clone());
            }
            Instruction::RestoreState => match state.remembered.pop() {
                Some(regs) => state.regs = regs,
                None => complaints.complain(Complaint::MismatchedRestoreState { pc: state.pc }),
            },
            Instruction::DefCfa { register, offset } => {
                state.regs.cfa_register = adjust(register);
                state.regs.cfa_offset = if state.quirks.cfa_offsets_factored {
                    state.factored(offset as i64)
                } else {
                    offset as i64
                };
                state.regs.cfa = CfaRule::RegisterOffset;
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                state.regs.cfa_register = adjust(register);
                state.regs.cfa_offset = state.factored(factored_offset);
                state.regs.cfa = CfaRule::RegisterOffset;
            }
            Instruction::DefCfaRegister(register) => {
                state.regs.cfa_register = adjust(register);
                state.regs.cfa = CfaRule::RegisterOffset;
            }
            // Only the offset changes, the rule stays what it was.
            Instruction::DefCfaOffset(offset) => {
                state.regs.cfa_offset = if state.quirks.cfa_offsets_factored {
                    state.factored(offset as i64)
                } else {
                    offset as i64
                };
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                state.regs.cfa_offset = state.factored(factored_offset);
            }
            Instruction::DefCfaExpression(expr) => {
                state.regs.cfa = CfaRule::Expression(expr);
            }
            Instruction::WindowSave => arch.window_save(&mut state.regs),
            Instruction::ArgsSize(_) | Instruction::Nop => {}
        }
    }

    if state.initial.is_none() {
        // remember/restore may not cross from the CIE into the FDE program
        state.remembered.clear();
    }

    Ok(insns.offset())
}
