//! The places an expression can be evaluated in.

use alloc::{boxed::Box, format, vec, vec::Vec};
use core::cell::OnceCell;

use super::op::DW_OP_lit0;
use crate::{
    dwarf::{
        call_site::{self, ParameterKind},
        unwind::{FrameCache, Unwinder},
    },
    error::{Error, Result},
    target::{BaseType, DebugInfo, Frame},
};

/// What the evaluator needs from the outside world.
///
/// Only register and memory access are required. Every other capability
/// fails by default, so a context only implements what makes sense where it
/// is used.
pub trait EvalContext {
    /// The value of DWARF register `dwarf_reg`.
    fn read_register(&mut self, dwarf_reg: u64) -> Result<u64>;

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// The `DW_AT_frame_base` expression of the current function.
    fn frame_base(&mut self) -> Result<Vec<u8>> {
        Err(invalid("DW_OP_fbreg"))
    }

    fn frame_cfa(&mut self) -> Result<u64> {
        Err(invalid("DW_OP_call_frame_cfa"))
    }

    fn frame_pc(&mut self) -> Result<u64> {
        Err(invalid("DW_OP_implicit_pointer"))
    }

    fn tls_address(&mut self, _offset: u64) -> Result<u64> {
        Err(invalid("DW_OP_form_tls_address"))
    }

    /// The location expression of the DIE at `die`, for `DW_OP_call2/4`.
    fn dwarf_call(&mut self, _die: u64) -> Result<Vec<u8>> {
        Err(invalid("DW_OP_call*"))
    }

    fn base_type(&mut self, _die: u64) -> Result<BaseType> {
        Err(invalid("DW_OP_GNU_*_type"))
    }

    fn addr_index(&mut self, _index: u64) -> Result<u64> {
        Err(invalid("DW_OP_addrx"))
    }

    fn object_address(&mut self) -> Result<u64> {
        Err(invalid("DW_OP_push_object_address"))
    }

    /// Looks up the value the parameter described by `kind` had on entry to
    /// the current function. `deref_size` asks for the value it pointed to.
    fn entry_value(
        &mut self,
        _kind: ParameterKind,
        _deref_size: Option<u8>,
    ) -> Result<EntryValue<'_>> {
        Err(invalid("DW_OP_entry_value"))
    }
}

fn invalid(op: &str) -> Error {
    Error::unsupported(format!("{op} is invalid in this context"))
}

/// How to get an entry value.
pub enum EntryValue<'a> {
    /// Evaluate `expr` in `caller` and use whatever it pushes.
    Block {
        expr: Vec<u8>,
        caller: Box<dyn EvalContext + 'a>,
    },
    /// Push this value.
    Value(u64),
}

/// Evaluation of CFI expressions: only the registers and memory of one frame
/// are available.
pub struct CfiContext<'f> {
    frame: &'f dyn Frame,
}

impl<'f> CfiContext<'f> {
    pub fn new(frame: &'f dyn Frame) -> Self {
        Self { frame }
    }
}

impl EvalContext for CfiContext<'_> {
    fn read_register(&mut self, dwarf_reg: u64) -> Result<u64> {
        read_frame_register(self.frame, dwarf_reg)
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.frame.read_memory(addr, buf)
    }
}

fn read_frame_register(frame: &dyn Frame, dwarf_reg: u64) -> Result<u64> {
    let regnum = frame.arch().dwarf_reg_to_regnum_or_error(dwarf_reg)?;
    frame.register(regnum)
}

/// Evaluation of variable locations in a live frame.
pub struct FrameContext<'f> {
    frame: &'f dyn Frame,
    unwinder: &'f Unwinder<'f>,
    object_address: Option<u64>,
    cache: OnceCell<FrameCache<'f>>,
}

impl<'f> FrameContext<'f> {
    pub fn new(frame: &'f dyn Frame, unwinder: &'f Unwinder<'f>) -> Self {
        Self {
            frame,
            unwinder,
            object_address: None,
            cache: OnceCell::new(),
        }
    }

    /// Sets the address of the object whose location is evaluated, for
    /// `DW_OP_push_object_address`.
    pub fn with_object_address(mut self, address: u64) -> Self {
        self.object_address = Some(address);
        self
    }

    fn debug(&self) -> &'f dyn DebugInfo {
        self.unwinder.debug()
    }
}

impl EvalContext for FrameContext<'_> {
    fn read_register(&mut self, dwarf_reg: u64) -> Result<u64> {
        read_frame_register(self.frame, dwarf_reg)
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.frame.read_memory(addr, buf)
    }

    fn frame_base(&mut self) -> Result<Vec<u8>> {
        let pc = self.frame.address_in_block();
        Ok(self.debug().frame_base(pc)?.to_vec())
    }

    fn frame_cfa(&mut self) -> Result<u64> {
        self.unwinder.cached_frame_cfa(self.frame, &self.cache)
    }

    fn frame_pc(&mut self) -> Result<u64> {
        Ok(self.frame.address_in_block())
    }

    fn tls_address(&mut self, offset: u64) -> Result<u64> {
        self.debug().tls_address(offset)
    }

    fn dwarf_call(&mut self, die: u64) -> Result<Vec<u8>> {
        let pc = self.frame.address_in_block();
        Ok(self.debug().die_location(die, pc)?.to_vec())
    }

    fn base_type(&mut self, die: u64) -> Result<BaseType> {
        self.debug().base_type(die)
    }

    fn addr_index(&mut self, index: u64) -> Result<u64> {
        self.debug().addr_index(index)
    }

    fn object_address(&mut self) -> Result<u64> {
        self.object_address
            .ok_or_else(|| Error::corrupt("Location address is not set."))
    }

    fn entry_value(
        &mut self,
        kind: ParameterKind,
        deref_size: Option<u8>,
    ) -> Result<EntryValue<'_>> {
        let (parameter, caller) = call_site::entry_parameter(self.frame, self.unwinder, kind)?;
        let expr = match deref_size {
            None => parameter.value.clone(),
            Some(_) => parameter
                .data_value
                .clone()
                .ok_or_else(|| Error::no_entry_value("Cannot resolve DW_AT_call_data_value"))?,
        };
        Ok(EntryValue::Block {
            expr,
            caller: Box::new(FrameContext::new(caller, self.unwinder)),
        })
    }
}

/// What reading a variable requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SymbolNeeds {
    /// Memory at most.
    #[default]
    None,
    /// The registers of the frame, but nothing else about it.
    Registers,
    /// A frame: its base, CFA, pc or caller.
    Frame,
}

/// Runs an expression without a target to find out what it needs.
///
/// Every capability succeeds with a dummy value and records what it would
/// have needed.
pub struct NeedsContext<'d> {
    debug: &'d dyn DebugInfo,
    needs: SymbolNeeds,
}

impl<'d> NeedsContext<'d> {
    pub fn new(debug: &'d dyn DebugInfo) -> Self {
        Self {
            debug,
            needs: SymbolNeeds::None,
        }
    }

    pub fn needs(&self) -> SymbolNeeds {
        self.needs
    }

    pub(crate) fn need(&mut self, needs: SymbolNeeds) {
        self.needs = self.needs.max(needs);
    }
}

impl EvalContext for NeedsContext<'_> {
    fn read_register(&mut self, _dwarf_reg: u64) -> Result<u64> {
        self.need(SymbolNeeds::Registers);
        Ok(1)
    }

    fn read_memory(&mut self, _addr: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        Ok(())
    }

    fn frame_base(&mut self) -> Result<Vec<u8>> {
        self.need(SymbolNeeds::Frame);
        Ok(vec![DW_OP_lit0])
    }

    fn frame_cfa(&mut self) -> Result<u64> {
        self.need(SymbolNeeds::Frame);
        Ok(1)
    }

    fn frame_pc(&mut self) -> Result<u64> {
        self.need(SymbolNeeds::Frame);
        Ok(1)
    }

    fn tls_address(&mut self, _offset: u64) -> Result<u64> {
        self.need(SymbolNeeds::Frame);
        Ok(1)
    }

    fn dwarf_call(&mut self, die: u64) -> Result<Vec<u8>> {
        // Without a frame there is no pc, so this only works for DIEs with a
        // single location expression.
        Ok(self.debug.die_location(die, 0)?.to_vec())
    }

    fn base_type(&mut self, die: u64) -> Result<BaseType> {
        self.debug.base_type(die)
    }

    fn addr_index(&mut self, _index: u64) -> Result<u64> {
        Ok(1)
    }

    fn object_address(&mut self) -> Result<u64> {
        self.need(SymbolNeeds::Frame);
        Ok(1)
    }

    fn entry_value(
        &mut self,
        _kind: ParameterKind,
        _deref_size: Option<u8>,
    ) -> Result<EntryValue<'_>> {
        self.need(SymbolNeeds::Frame);
        Ok(EntryValue::Value(1))
    }
}
