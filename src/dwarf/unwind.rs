//! Recovering the caller's registers.
//!
//! For every frame, the rules of the CFI row covering its pc are turned into a
//! [`FrameCache`]: the CFA plus one rule per register, in the debugger's
//! register numbering. The registers of the caller are then computed on
//! demand from the cache and the registers and memory of this frame.


use alloc::vec::Vec;
use core::cell::OnceCell;

use super::{
    exec::{self, CfaRule, CfiProgram, FrameState, RegisterRule},
    expr::{CfiContext, EvalContext, EvalOptions, Evaluator, Location, LocationDescription},
    parse::{CfiTable, Expr},
    quirks::{producer_quirks, Quirks},
};
use crate::{
    arch::Arch,
    complaint::{Complaint, Complaints},
    error::{Error, ErrorKind, Result},
    target::{DebugInfo, Frame},
};

/// Why there is no caller to unwind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoReason,
    /// The CFA needs registers or memory that could not be read.
    Unavailable,
    /// The return address is undefined, this is the outermost frame.
    Outermost,
}

/// Identity of a frame that stays the same while it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameId {
    Stack { cfa: u64, function: u64 },
    /// The CFA is not known, only the function.
    UnavailableStack { function: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Normal,
    /// A signal trampoline. Its pc is not a return address.
    Signal,
}

/// Where the caller's value of a register is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedRegister {
    OptimizedOut,
    /// Saved in memory at this address.
    Memory(u64),
    /// The value of this (internal) register of the current frame.
    Register(usize),
    Value(u64),
}

/// What a bytecode compiler needs to know about the CFA at a pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaInfo<'a> {
    /// Internal register `regnum` plus `offset`.
    RegisterOffset { regnum: usize, offset: i64 },
    Expression { expr: Expr<'a>, text_offset: u64 },
}

/// The unwind information of one physical frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCache<'a> {
    /// Relocated start address of the FDE.
    pub function: u64,
    pub cfa: u64,
    /// Rules by internal register number.
    regs: Vec<RegisterRule<'a>>,
    /// DWARF register holding the return address, for `ReturnAddressOffset`.
    retaddr_reg: u64,
    /// The CFA offset from the stack pointer at the function's entry.
    pub entry_cfa_sp_offset: Option<i64>,
    /// The return address is undefined.
    pub undefined_retaddr: bool,
    /// The CFA could not be computed, nothing else in the cache is valid.
    pub unavailable_retaddr: bool,
    pub signal_frame: bool,
}

impl<'a> FrameCache<'a> {
    pub fn rule(&self, regnum: usize) -> RegisterRule<'a> {
        self.regs.get(regnum).copied().unwrap_or_default()
    }

    fn unavailable(function: u64, signal_frame: bool) -> Self {
        Self {
            function,
            cfa: 0,
            regs: Vec::new(),
            retaddr_reg: 0,
            entry_cfa_sp_offset: None,
            undefined_retaddr: false,
            unavailable_retaddr: true,
            signal_frame,
        }
    }
}

/// Unwinds frames of the code described by one CFI table.
pub struct Unwinder<'a> {
    table: &'a CfiTable<'a>,
    debug: &'a dyn DebugInfo,
    complaints: &'a Complaints,
}

impl<'a> Unwinder<'a> {
    pub fn new(table: &'a CfiTable<'a>, debug: &'a dyn DebugInfo, complaints: &'a Complaints) -> Self {
        Self {
            table,
            debug,
            complaints,
        }
    }

    pub fn table(&self) -> &'a CfiTable<'a> {
        self.table
    }

    pub fn debug(&self) -> &'a dyn DebugInfo {
        self.debug
    }

    pub fn complaints(&self) -> &'a Complaints {
        self.complaints
    }

    pub fn eval_options(&self, frame: &dyn Frame) -> EvalOptions {
        EvalOptions::for_frame(frame.arch(), self.table.text_offset())
    }

    fn program(&self, pc: u64) -> Option<CfiProgram<'a, 'a>> {
        let table = self.table;
        let fde = table.find_fde(pc)?;
        Some(CfiProgram {
            cie: table.cie(fde),
            fde,
            text_offset: table.text_offset(),
        })
    }

    fn quirks(&self, program: &CfiProgram<'a, 'a>) -> Quirks {
        producer_quirks(self.debug.producer(program.start()), program.cie)
    }

    /// Whether the CFI covers `frame`, and what kind of frame it is.
    pub fn sniff(&self, frame: &dyn Frame) -> Option<FrameKind> {
        let program = self.program(frame.address_in_block())?;
        if program.cie.signal_frame || frame.arch().is_signal_frame(frame) {
            Some(FrameKind::Signal)
        } else {
            Some(FrameKind::Normal)
        }
    }

    /// The cache of `frame`, computed on first use.
    pub fn cache<'c>(
        &self,
        frame: &dyn Frame,
        cell: &'c OnceCell<FrameCache<'a>>,
    ) -> Result<&'c FrameCache<'a>> {
        if let Some(cache) = cell.get() {
            return Ok(cache);
        }
        let cache = self.build_cache(frame)?;
        Ok(cell.get_or_init(|| cache))
    }

    #[instrument(level = "debug", skip(self, frame), fields(pc = frame.pc()))]
    pub fn build_cache(&self, frame: &dyn Frame) -> Result<FrameCache<'a>> {
        let arch = frame.arch();
        let pc = frame.address_in_block();
        let program = self
            .program(pc)
            .ok_or_else(|| Error::corrupt("no call frame information for pc"))?;
        let function = program.start();
        let quirks = self.quirks(&program);
        let signal_frame = program.cie.signal_frame || arch.is_signal_frame(frame);
        debug!(function, "found FDE");

        let mut state = FrameState::new(program.cie, function, quirks);
        exec::execute(
            &program,
            program.cie_instructions(),
            pc,
            &mut state,
            arch,
            self.complaints,
        )?;
        state.capture_initial();

        let fde_end = program.fde_instructions().end;
        let mut entry_cfa_sp_offset = None;
        let entry = frame
            .function_start()
            .filter(|&entry| program.fde.contains(entry.wrapping_sub(program.text_offset)));
        let resume = match entry {
            Some(entry) => {
                let resume = exec::execute(
                    &program,
                    program.fde_instructions(),
                    entry,
                    &mut state,
                    arch,
                    self.complaints,
                )?;
                if state.regs.cfa == CfaRule::RegisterOffset
                    && arch.dwarf_reg_to_regnum(state.regs.cfa_register) == arch.sp_regnum()
                {
                    entry_cfa_sp_offset = Some(state.regs.cfa_offset);
                }
                resume
            }
            None => program.fde_instructions().start,
        };
        exec::execute(
            &program,
            resume..fde_end,
            pc,
            &mut state,
            arch,
            self.complaints,
        )?;

        let cfa = match self.compute_cfa(frame, &state) {
            Ok(cfa) => cfa,
            Err(err) if err.kind() == ErrorKind::Unavailable => {
                debug!(%err, "CFA is unavailable");
                return Ok(FrameCache::unavailable(function, signal_frame));
            }
            Err(err) => return Err(err),
        };

        let num_regs = arch.num_regs();
        let mut regs: Vec<RegisterRule<'a>> = (0..num_regs).map(|regnum| arch.init_reg(regnum)).collect();
        for (column, rule) in state.regs.iter() {
            let Some(regnum) = arch
                .dwarf_reg_to_regnum(column)
                .filter(|&regnum| regnum < num_regs)
            else {
                if rule != RegisterRule::Unspecified {
                    self.complaints.complain(Complaint::UnmappedColumn {
                        column,
                        pc: state.pc,
                    });
                }
                continue;
            };
            if rule != RegisterRule::Unspecified {
                regs[regnum] = rule;
            } else if regs[regnum] == RegisterRule::Unspecified {
                self.complaints
                    .complain(Complaint::UnspecifiedRegister { function, regnum });
            }
        }

        // Compilers use an unspecified or same-value return address column
        // to say that the return address is in the register of that number.
        let retaddr_column = state.retaddr_column;
        let retaddr_rule = state.regs.get(retaddr_column);
        let retaddr_has_rule = !matches!(
            retaddr_rule,
            RegisterRule::Unspecified | RegisterRule::SameValue
        );
        for rule in &mut regs {
            if *rule == RegisterRule::ReturnAddress {
                *rule = if retaddr_has_rule {
                    retaddr_rule
                } else {
                    RegisterRule::Register(retaddr_column)
                };
            }
        }
        let retaddr_reg = match retaddr_rule {
            RegisterRule::Register(reg) => reg,
            _ => retaddr_column,
        };

        Ok(FrameCache {
            function,
            cfa,
            regs,
            retaddr_reg,
            entry_cfa_sp_offset,
            undefined_retaddr: retaddr_rule == RegisterRule::Undefined,
            unavailable_retaddr: false,
            signal_frame,
        })
    }

    fn compute_cfa(&self, frame: &dyn Frame, state: &FrameState<'a>) -> Result<u64> {
        match state.regs.cfa {
            CfaRule::RegisterOffset => {
                let regnum = frame
                    .arch()
                    .dwarf_reg_to_regnum_or_error(state.regs.cfa_register)?;
                let value = frame.register(regnum)?;
                let offset = state.regs.cfa_offset as u64;
                if state.quirks.cfa_offsets_reversed {
                    Ok(value.wrapping_sub(offset))
                } else {
                    Ok(value.wrapping_add(offset))
                }
            }
            CfaRule::Expression(expr) => self.execute_cfi_expr(frame, expr, None),
            CfaRule::Unset => Err(Error::corrupt("Unknown CFA rule")),
        }
    }

    /// Runs a CFI expression with nothing but the registers and memory of
    /// `frame`, optionally starting with the CFA on the stack.
    fn execute_cfi_expr(&self, frame: &dyn Frame, expr: Expr<'_>, cfa: Option<u64>) -> Result<u64> {
        let mut ctx = CfiContext::new(frame);
        let mut evaluator = Evaluator::new(self.eval_options(frame));
        if let Some(cfa) = cfa {
            evaluator.push_address(cfa, true);
        }
        evaluator.eval(&mut ctx, expr.0)?;
        match evaluator.location()? {
            LocationDescription::Simple(Location::Memory { address, .. }) => Ok(address),
            LocationDescription::Simple(Location::Register(reg)) => ctx.read_register(reg),
            _ => Err(Error::unsupported(
                "Not implemented: computing unwound register using explicit value operator",
            )),
        }
    }

    pub fn stop_reason(&self, cache: &FrameCache<'a>) -> StopReason {
        if cache.unavailable_retaddr {
            StopReason::Unavailable
        } else if cache.undefined_retaddr {
            StopReason::Outermost
        } else {
            StopReason::NoReason
        }
    }

    /// The identity of `frame`, or `None` for the outermost frame.
    pub fn frame_id(&self, frame: &dyn Frame, cache: &FrameCache<'a>) -> Option<FrameId> {
        let function = frame.function_start().unwrap_or(cache.function);
        if cache.unavailable_retaddr {
            Some(FrameId::UnavailableStack { function })
        } else if cache.undefined_retaddr {
            None
        } else {
            Some(FrameId::Stack {
                cfa: cache.cfa,
                function,
            })
        }
    }

    /// Where the caller's value of internal register `regnum` is.
    pub fn saved_register(
        &self,
        frame: &dyn Frame,
        cache: &FrameCache<'a>,
        regnum: usize,
    ) -> Result<SavedRegister> {
        if cache.unavailable_retaddr {
            return Err(Error::unavailable(
                "can't compute CFA for this frame: required registers or memory are unavailable",
            ));
        }
        let arch = frame.arch();
        let cfa = cache.cfa;
        let saved = match cache.rule(regnum) {
            RegisterRule::Undefined => SavedRegister::OptimizedOut,
            RegisterRule::Offset(offset) => SavedRegister::Memory(cfa.wrapping_add(offset as u64)),
            RegisterRule::Register(reg) => {
                SavedRegister::Register(arch.dwarf_reg_to_regnum_or_error(reg)?)
            }
            RegisterRule::Expression(expr) => {
                SavedRegister::Memory(self.execute_cfi_expr(frame, expr, Some(cfa))?)
            }
            RegisterRule::ValOffset(offset) => SavedRegister::Value(cfa.wrapping_add(offset as u64)),
            RegisterRule::ValExpression(expr) => {
                SavedRegister::Value(self.execute_cfi_expr(frame, expr, Some(cfa))?)
            }
            RegisterRule::Unspecified => {
                // Same value, as GCC means it.
                self.complaints.complain(Complaint::UnspecifiedRegister {
                    function: cache.function,
                    regnum,
                });
                SavedRegister::Register(regnum)
            }
            RegisterRule::SameValue => SavedRegister::Register(regnum),
            RegisterRule::Cfa => SavedRegister::Value(cfa),
            RegisterRule::CfaOffset(offset) => SavedRegister::Value(cfa.wrapping_add(offset as u64)),
            RegisterRule::ReturnAddress => {
                SavedRegister::Register(arch.dwarf_reg_to_regnum_or_error(cache.retaddr_reg)?)
            }
            RegisterRule::ReturnAddressOffset(offset) => {
                let reg = arch.dwarf_reg_to_regnum_or_error(cache.retaddr_reg)?;
                SavedRegister::Value(frame.register(reg)?.wrapping_add(offset as u64))
            }
            RegisterRule::Architectural(id) => {
                SavedRegister::Value(arch.architectural_register(frame, regnum, id)?)
            }
        };
        trace!(regnum, ?saved);
        Ok(saved)
    }

    /// The caller's value of internal register `regnum`.
    pub fn prev_register(
        &self,
        frame: &dyn Frame,
        cache: &FrameCache<'a>,
        regnum: usize,
    ) -> Result<u64> {
        match self.saved_register(frame, cache, regnum)? {
            SavedRegister::OptimizedOut => Err(Error::OptimizedOut),
            SavedRegister::Memory(addr) => {
                frame.read_memory_uint(addr, frame.arch().register_size(regnum))
            }
            SavedRegister::Register(reg) => frame.register(reg),
            SavedRegister::Value(value) => Ok(value),
        }
    }

    /// The CFA of `frame`, for `DW_OP_call_frame_cfa`. Inline frames share
    /// the CFA of the function they are inlined into.
    pub fn frame_cfa(&self, frame: &dyn Frame) -> Result<u64> {
        self.cached_frame_cfa(frame, &OnceCell::new())
    }

    /// Like [`Unwinder::frame_cfa`], with `cell` holding the cache of the
    /// first frame that is not inline.
    pub fn cached_frame_cfa(&self, frame: &dyn Frame, cell: &OnceCell<FrameCache<'a>>) -> Result<u64> {
        let mut frame = frame;
        while frame.is_inline() {
            frame = frame.caller().ok_or_else(|| {
                Error::unavailable("can't compute CFA for this frame: no outer frame")
            })?;
        }
        Self::cfa_of(self.cache(frame, cell)?)
    }

    fn cfa_of(cache: &FrameCache<'_>) -> Result<u64> {
        if cache.unavailable_retaddr {
            return Err(Error::unavailable(
                "can't compute CFA for this frame: required registers or memory are unavailable",
            ));
        }
        if cache.undefined_retaddr {
            return Err(Error::unavailable(
                "can't compute CFA for this frame: frame base not available",
            ));
        }
        Ok(cache.cfa)
    }

    /// How to compute the CFA at `pc`, without a frame.
    pub fn cfa_info(&self, arch: &dyn Arch, pc: u64) -> Result<CfaInfo<'a>> {
        let program = self.program(pc).ok_or_else(|| {
            Error::corrupt("Could not compute CFA; needed to translate this expression")
        })?;
        let state = program.rules_at(pc, arch, self.complaints, self.quirks(&program))?;
        match state.regs.cfa {
            CfaRule::RegisterOffset => {
                let regnum = arch.dwarf_reg_to_regnum_or_error(state.regs.cfa_register)?;
                let offset = if state.quirks.cfa_offsets_reversed {
                    state.regs.cfa_offset.wrapping_neg()
                } else {
                    state.regs.cfa_offset
                };
                Ok(CfaInfo::RegisterOffset { regnum, offset })
            }
            CfaRule::Expression(expr) => Ok(CfaInfo::Expression {
                expr,
                text_offset: self.table.text_offset(),
            }),
            CfaRule::Unset => Err(Error::corrupt("Unknown CFA rule")),
        }
    }
}
