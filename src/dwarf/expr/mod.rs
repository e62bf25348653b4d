//! The DWARF expression stack machine.
//!
//! An expression computes either a value or the location of a value. The
//! evaluator keeps a stack of address-sized (or typed) values, and at the end
//! the top of the stack is interpreted according to the kind of location
//! the expression asked for. Expressions made of `DW_OP_piece`s produce a
//! list of pieces instead.
//!
//! Everything outside of the stack machine, like registers, memory or the
//! frame base, comes from an [`EvalContext`].
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §2.5 DWARF Expressions, §2.6 Location Descriptions

mod context;
pub mod op;


use alloc::{format, vec, vec::Vec};
use core::mem;

pub use context::{
    CfiContext, EntryValue, EvalContext, FrameContext, NeedsContext, SymbolNeeds,
};
use op::*;

use crate::{
    arch::Arch,
    dwarf::call_site::ParameterKind,
    error::{Error, Result},
    reader::{self, extract_unsigned, Cursor, Endian},
    target::BaseType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    /// Size of an address and of generic stack values, in bytes.
    pub address_size: u8,
    /// Size of a `DW_FORM_ref_addr`, used by implicit pointers.
    pub ref_addr_size: u8,
    pub endian: Endian,
    /// Added to addresses from `DW_OP_addr` and friends.
    pub text_offset: u64,
    /// How deep evaluations may nest through calls, frame bases and entry
    /// values.
    pub max_recursion_depth: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            address_size: 8,
            ref_addr_size: 4,
            endian: Endian::Little,
            text_offset: 0,
            max_recursion_depth: 256,
        }
    }
}

impl EvalOptions {
    pub fn for_frame(arch: &dyn Arch, text_offset: u64) -> Self {
        Self {
            address_size: arch.address_size(),
            endian: arch.endian(),
            text_offset,
            ..Self::default()
        }
    }
}

/// A value on the DWARF stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    /// The value, zero-extended from its size.
    pub bits: u64,
    /// `None` for the generic type, an address-sized integer.
    pub ty: Option<BaseType>,
}

impl Value {
    pub fn generic(bits: u64, address_size: u8) -> Self {
        Self {
            bits: bits & reader::mask(usize::from(address_size)),
            ty: None,
        }
    }

    pub fn typed(bits: u64, ty: BaseType) -> Self {
        Self {
            bits: bits & reader::mask(usize::from(ty.size)),
            ty: Some(ty),
        }
    }

    /// Size in bytes.
    pub fn size(&self, address_size: u8) -> u8 {
        self.ty.map_or(address_size, |ty| ty.size)
    }

    /// Whether arithmetic treats this value as signed. Generic values are
    /// signed for division, comparisons and `DW_OP_abs`.
    fn arith_signed(&self) -> bool {
        self.ty.map_or(true, |ty| ty.signed)
    }

    fn signed(&self, address_size: u8) -> i64 {
        reader::sign_extend(self.bits, usize::from(self.size(address_size)))
    }

    fn with_bits(self, bits: u64, address_size: u8) -> Self {
        match self.ty {
            None => Self::generic(bits, address_size),
            Some(ty) => Self::typed(bits, ty),
        }
    }

    /// The value as it would be stored in target memory.
    pub fn to_bytes(&self, address_size: u8, endian: Endian) -> Vec<u8> {
        let mut bytes = vec![0; usize::from(self.size(address_size))];
        reader::store_unsigned(&mut bytes, self.bits, endian);
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub value: Value,
    /// The value is an address on the stack of the inferior.
    pub in_stack_memory: bool,
}

/// Where (a piece of) a value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Memory { address: u64, in_stack_memory: bool },
    /// A DWARF register number.
    Register(u64),
    /// The value itself, from `DW_OP_stack_value`.
    Value(Value),
    /// Bytes from `DW_OP_implicit_value`.
    Literal(Vec<u8>),
    OptimizedOut,
    /// A pointer that was optimized away, pointing `offset` bytes into the
    /// variable described by the DIE at `die`.
    ImplicitPointer { die: u64, offset: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub location: Location,
    /// Size in bits.
    pub size: u64,
    /// Offset in bits into the location, from `DW_OP_bit_piece`.
    pub offset: u64,
}

/// The result of evaluating a location description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationDescription {
    Simple(Location),
    Composite(Vec<Piece>),
}

/// The kind of location the expression has asked for so far. The data for
/// most kinds is on the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Memory,
    Register,
    Stack,
    Literal(Vec<u8>),
    OptimizedOut,
    ImplicitPointer { die: u64 },
}

pub struct Evaluator {
    options: EvalOptions,
    stack: Vec<StackEntry>,
    kind: Kind,
    pieces: Vec<Piece>,
    depth: usize,
    initialized: bool,
}

impl Evaluator {
    pub fn new(options: EvalOptions) -> Self {
        Self {
            options,
            stack: Vec::new(),
            kind: Kind::Memory,
            pieces: Vec::new(),
            depth: 0,
            initialized: true,
        }
    }

    pub fn options(&self) -> &EvalOptions {
        &self.options
    }

    pub fn push_address(&mut self, address: u64, in_stack_memory: bool) {
        let value = self.generic(address);
        self.stack.push(StackEntry {
            value,
            in_stack_memory,
        });
    }

    /// The stack, top last.
    pub fn stack(&self) -> &[StackEntry] {
        &self.stack
    }

    /// `false` if the expression ended in `DW_OP_GNU_uninit`.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The entry `n` places below the top of the stack.
    pub fn fetch(&self, n: usize) -> Result<StackEntry> {
        self.stack
            .len()
            .checked_sub(n + 1)
            .map(|index| self.stack[index])
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "Asked for position {n} of stack, stack only has {} elements on it.",
                    self.stack.len()
                ))
            })
    }

    pub fn fetch_address(&self, n: usize) -> Result<u64> {
        Ok(self.fetch(n)?.value.bits)
    }

    fn pop(&mut self) -> Result<StackEntry> {
        self.stack
            .pop()
            .ok_or_else(|| Error::corrupt("dwarf expression stack underflow"))
    }

    fn require_stack(&self, n: usize, op: &str) -> Result<()> {
        if self.stack.len() < n {
            return Err(Error::corrupt(format!(
                "Not enough elements for {op}. Need {n}, have {}.",
                self.stack.len()
            )));
        }
        Ok(())
    }

    fn generic(&self, bits: u64) -> Value {
        Value::generic(bits, self.options.address_size)
    }

    /// Runs `expr` on the current stack.
    pub fn eval(&mut self, ctx: &mut dyn EvalContext, expr: &[u8]) -> Result<()> {
        if self.depth >= self.options.max_recursion_depth {
            return Err(Error::corrupt(format!(
                "DWARF-2 expression error: stack too deep ({} nested evaluations)",
                self.depth
            )));
        }
        self.depth += 1;
        let result = self.execute(ctx, expr);
        self.depth -= 1;
        result
    }

    /// Interprets the final state of the evaluator.
    pub fn location(&self) -> Result<LocationDescription> {
        if !self.pieces.is_empty() {
            return Ok(LocationDescription::Composite(self.pieces.clone()));
        }
        let location = match &self.kind {
            Kind::Memory => {
                let top = self.fetch(0)?;
                Location::Memory {
                    address: top.value.bits,
                    in_stack_memory: top.in_stack_memory,
                }
            }
            Kind::Register => Location::Register(self.fetch(0)?.value.bits),
            Kind::Stack => Location::Value(self.fetch(0)?.value),
            Kind::Literal(bytes) => Location::Literal(bytes.clone()),
            Kind::OptimizedOut => Location::OptimizedOut,
            Kind::ImplicitPointer { die } => Location::ImplicitPointer {
                die: *die,
                offset: self.fetch(0)?.value.signed(self.options.address_size),
            },
        };
        Ok(LocationDescription::Simple(location))
    }

    fn execute(&mut self, ctx: &mut dyn EvalContext, expr: &[u8]) -> Result<()> {
        let address_size = self.options.address_size;
        let endian = self.options.endian;
        let mut data = Cursor::new(expr, endian);
        self.kind = Kind::Memory;
        self.initialized = true;

        while !data.is_empty() {
            let op = data.read_u8()?;
            trace!("DW_OP {op:#04x} at {}", data.offset() - 1);
            let mut in_stack_memory = false;

            let value = match op {
                DW_OP_lit0..=DW_OP_lit31 => self.generic(u64::from(op - DW_OP_lit0)),
                DW_OP_addr => {
                    let mut addr = data.read_uint(usize::from(address_size))?;
                    // GCC emits DW_OP_addr before TLS operations instead of a
                    // DTPOFF relocation, that one is not an address.
                    if !matches!(
                        data.peek_u8(),
                        Some(DW_OP_GNU_push_tls_address | DW_OP_form_tls_address)
                    ) {
                        addr = addr.wrapping_add(self.options.text_offset);
                    }
                    self.generic(addr)
                }
                DW_OP_addrx | DW_OP_GNU_addr_index => {
                    let index = data.read_uleb128()?;
                    let addr = ctx.addr_index(index)?;
                    self.generic(addr.wrapping_add(self.options.text_offset))
                }
                DW_OP_constx | DW_OP_GNU_const_index => {
                    let index = data.read_uleb128()?;
                    self.generic(ctx.addr_index(index)?)
                }
                DW_OP_const1u => self.generic(u64::from(data.read_u8()?)),
                DW_OP_const1s => self.generic(i64::from(data.read_i8()?) as u64),
                DW_OP_const2u => self.generic(u64::from(data.read_u16()?)),
                DW_OP_const2s => self.generic(i64::from(data.read_i16()?) as u64),
                DW_OP_const4u => self.generic(u64::from(data.read_u32()?)),
                DW_OP_const4s => self.generic(i64::from(data.read_i32()?) as u64),
                DW_OP_const8u => self.generic(data.read_u64()?),
                DW_OP_const8s => self.generic(data.read_i64()? as u64),
                DW_OP_constu => self.generic(data.read_uleb128()?),
                DW_OP_consts => self.generic(data.read_sleb128()? as u64),

                // The DW_OP_reg* operations name a location, the register
                // number goes on the stack until the piece (or the end).
                DW_OP_reg0..=DW_OP_reg31 => {
                    require_composition(&data, "DW_OP_reg")?;
                    self.kind = Kind::Register;
                    self.generic(u64::from(op - DW_OP_reg0))
                }
                DW_OP_regx => {
                    let reg = data.read_uleb128()?;
                    require_composition(&data, "DW_OP_regx")?;
                    self.kind = Kind::Register;
                    self.generic(reg)
                }
                DW_OP_implicit_value => {
                    let len = data.read_uleb128()?;
                    let len = usize::try_from(len)
                        .ok()
                        .filter(|&len| len <= data.remaining())
                        .ok_or_else(|| {
                            Error::corrupt("DW_OP_implicit_value: too few bytes available.")
                        })?;
                    let bytes = data.read_bytes(len)?;
                    require_composition(&data, "DW_OP_implicit_value")?;
                    self.kind = Kind::Literal(bytes.to_vec());
                    continue;
                }
                DW_OP_stack_value => {
                    require_composition(&data, "DW_OP_stack_value")?;
                    self.kind = Kind::Stack;
                    continue;
                }
                DW_OP_implicit_pointer | DW_OP_GNU_implicit_pointer => {
                    let die = data.read_uint(usize::from(self.options.ref_addr_size))?;
                    let offset = data.read_sleb128()?;
                    require_composition(&data, "DW_OP_implicit_pointer")?;
                    self.kind = Kind::ImplicitPointer { die };
                    self.generic(offset as u64)
                }

                DW_OP_breg0..=DW_OP_breg31 => {
                    let offset = data.read_sleb128()?;
                    let base = ctx.read_register(u64::from(op - DW_OP_breg0))?;
                    self.generic(base.wrapping_add(offset as u64))
                }
                DW_OP_bregx => {
                    let reg = data.read_uleb128()?;
                    let offset = data.read_sleb128()?;
                    let base = ctx.read_register(reg)?;
                    self.generic(base.wrapping_add(offset as u64))
                }
                DW_OP_fbreg => {
                    let offset = data.read_sleb128()?;
                    let base = self.frame_base(ctx)?;
                    in_stack_memory = true;
                    self.generic(base.wrapping_add(offset as u64))
                }

                DW_OP_dup => {
                    let top = self.fetch(0)?;
                    in_stack_memory = top.in_stack_memory;
                    top.value
                }
                DW_OP_drop => {
                    self.pop()?;
                    continue;
                }
                DW_OP_pick => {
                    let n = data.read_u8()?;
                    let entry = self.fetch(usize::from(n))?;
                    in_stack_memory = entry.in_stack_memory;
                    entry.value
                }
                DW_OP_over => {
                    let entry = self.fetch(1)?;
                    in_stack_memory = entry.in_stack_memory;
                    entry.value
                }
                DW_OP_swap => {
                    self.require_stack(2, "DW_OP_swap")?;
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                    continue;
                }
                DW_OP_rot => {
                    self.require_stack(3, "DW_OP_rot")?;
                    let len = self.stack.len();
                    self.stack[len - 3..].rotate_right(1);
                    continue;
                }

                DW_OP_deref | DW_OP_deref_size | DW_OP_deref_type | DW_OP_GNU_deref_type => {
                    let size = if op == DW_OP_deref {
                        address_size
                    } else {
                        data.read_u8()?
                    };
                    let ty = if matches!(op, DW_OP_deref_type | DW_OP_GNU_deref_type) {
                        Some(base_type(ctx, data.read_uleb128()?)?)
                    } else {
                        None
                    };
                    let addr = self.fetch_address(0)?;
                    self.pop()?;
                    let bits = read_uint(ctx, addr, size, endian)?;
                    match ty {
                        Some(ty) => Value::typed(bits, ty),
                        None => self.generic(bits),
                    }
                }

                DW_OP_abs | DW_OP_neg | DW_OP_not => {
                    let value = self.pop()?.value;
                    let bits = match op {
                        DW_OP_abs if value.arith_signed() && value.signed(address_size) < 0 => {
                            value.bits.wrapping_neg()
                        }
                        DW_OP_abs => value.bits,
                        DW_OP_neg => value.bits.wrapping_neg(),
                        _ => !value.bits,
                    };
                    value.with_bits(bits, address_size)
                }
                DW_OP_plus_uconst => {
                    let addend = data.read_uleb128()?;
                    let value = self.pop()?.value;
                    self.generic(value.bits.wrapping_add(addend))
                }
                DW_OP_and | DW_OP_div | DW_OP_minus | DW_OP_mod | DW_OP_mul | DW_OP_or
                | DW_OP_plus | DW_OP_shl | DW_OP_shr | DW_OP_shra | DW_OP_xor | DW_OP_le
                | DW_OP_ge | DW_OP_eq | DW_OP_lt | DW_OP_gt | DW_OP_ne => {
                    let second = self.pop()?.value;
                    let first = self.pop()?.value;
                    self.binary_op(op, first, second)?
                }

                DW_OP_skip => {
                    let offset = data.read_i16()?;
                    jump(&mut data, offset)?;
                    continue;
                }
                DW_OP_bra => {
                    let offset = data.read_i16()?;
                    let condition = self.pop()?.value;
                    if condition.bits != 0 {
                        jump(&mut data, offset)?;
                    }
                    continue;
                }

                DW_OP_call_frame_cfa => {
                    in_stack_memory = true;
                    self.generic(ctx.frame_cfa()?)
                }
                DW_OP_push_object_address => self.generic(ctx.object_address()?),
                DW_OP_GNU_push_tls_address | DW_OP_form_tls_address => {
                    let offset = self.pop()?.value.bits;
                    self.generic(ctx.tls_address(offset)?)
                }
                DW_OP_nop => continue,

                DW_OP_piece => {
                    let size = data.read_uleb128()?;
                    let size = size
                        .checked_mul(8)
                        .ok_or_else(|| Error::corrupt("DW_OP_piece size is too large"))?;
                    self.add_piece(size, 0)?;
                    self.finish_piece()?;
                    continue;
                }
                DW_OP_bit_piece => {
                    let size = data.read_uleb128()?;
                    let offset = data.read_uleb128()?;
                    self.add_piece(size, offset)?;
                    self.finish_piece()?;
                    continue;
                }
                DW_OP_GNU_uninit => {
                    if !data.is_empty() {
                        return Err(Error::corrupt(
                            "DWARF-2 expression error: DW_OP_GNU_uninit must always be the last operation.",
                        ));
                    }
                    self.initialized = false;
                    continue;
                }

                DW_OP_call2 | DW_OP_call4 => {
                    let die = if op == DW_OP_call2 {
                        u64::from(data.read_u16()?)
                    } else {
                        u64::from(data.read_u32()?)
                    };
                    let block = ctx.dwarf_call(die)?;
                    self.eval(ctx, &block)?;
                    continue;
                }
                DW_OP_call_ref => {
                    return Err(Error::unsupported("DW_OP_call_ref is not supported"));
                }

                DW_OP_entry_value | DW_OP_GNU_entry_value => {
                    let len = data.read_uleb128()?;
                    let len = usize::try_from(len)
                        .ok()
                        .filter(|&len| len <= data.remaining())
                        .ok_or_else(|| {
                            Error::corrupt("DW_OP_entry_value: too few bytes available.")
                        })?;
                    let block = data.read_bytes(len)?;
                    if let Some(reg) = block_to_dwarf_reg(block) {
                        self.push_entry_value(ctx, ParameterKind::DwarfReg(reg), None)?;
                    } else if let Some((reg, size)) = block_to_dwarf_reg_deref(block) {
                        let size = size.unwrap_or(address_size);
                        self.push_entry_value(ctx, ParameterKind::DwarfReg(reg), Some(size))?;
                    } else {
                        return Err(Error::corrupt(
                            "DWARF-2 expression error: DW_OP_entry_value is supported only for \
                             single DW_OP_reg* or for DW_OP_breg*(0)+DW_OP_deref*",
                        ));
                    }
                    continue;
                }
                DW_OP_GNU_parameter_ref => {
                    let offset = data.read_u32()?;
                    self.push_entry_value(ctx, ParameterKind::ParamOffset(u64::from(offset)), None)?;
                    continue;
                }

                DW_OP_const_type | DW_OP_GNU_const_type => {
                    let die = data.read_uleb128()?;
                    let size = data.read_u8()?;
                    let bytes = data.read_bytes(usize::from(size))?;
                    let ty = base_type(ctx, die)?;
                    if ty.size != size {
                        return Err(Error::corrupt(
                            "DW_OP_const_type has different sizes for type and data",
                        ));
                    }
                    Value::typed(extract_unsigned(bytes, endian), ty)
                }
                DW_OP_regval_type | DW_OP_GNU_regval_type => {
                    let reg = data.read_uleb128()?;
                    let die = data.read_uleb128()?;
                    let ty = base_type(ctx, die)?;
                    Value::typed(ctx.read_register(reg)?, ty)
                }
                DW_OP_convert | DW_OP_GNU_convert | DW_OP_reinterpret | DW_OP_GNU_reinterpret => {
                    let die = data.read_uleb128()?;
                    let ty = match die {
                        0 => None,
                        die => Some(base_type(ctx, die)?),
                    };
                    let value = self.pop()?.value;
                    let converted = Value {
                        bits: if value.arith_signed() {
                            value.signed(address_size) as u64
                        } else {
                            value.bits
                        },
                        ty,
                    };
                    if matches!(op, DW_OP_convert | DW_OP_GNU_convert) {
                        converted.with_bits(converted.bits, address_size)
                    } else if value.ty == ty {
                        value
                    } else if converted.size(address_size) != value.size(address_size) {
                        return Err(Error::corrupt("DW_OP_reinterpret has wrong size"));
                    } else {
                        Value { bits: value.bits, ty }
                    }
                }
                DW_OP_GNU_variable_value => {
                    let die = data.read_uint(usize::from(self.options.ref_addr_size))?;
                    self.variable_value(ctx, die)?
                }

                _ => {
                    return Err(Error::corrupt(format!(
                        "Unhandled dwarf expression opcode {op:#x}"
                    )))
                }
            };

            self.stack.push(StackEntry {
                value,
                in_stack_memory,
            });
        }

        // Implicit pointers can only appear where pieces are allowed, so a
        // final one is turned into a piece of its own.
        if matches!(self.kind, Kind::ImplicitPointer { .. }) {
            self.add_piece(8 * u64::from(address_size), 0)?;
        }

        Ok(())
    }

    fn binary_op(&self, op: u8, first: Value, second: Value) -> Result<Value> {
        if first.ty != second.ty {
            return Err(Error::corrupt("Incompatible types on DWARF stack"));
        }
        let address_size = self.options.address_size;
        let bits = u64::from(first.size(address_size)) * 8;
        let (a, b) = (first.bits, second.bits);
        let (sa, sb) = (first.signed(address_size), second.signed(address_size));

        let result = match op {
            DW_OP_and => a & b,
            DW_OP_or => a | b,
            DW_OP_xor => a ^ b,
            DW_OP_plus => a.wrapping_add(b),
            DW_OP_minus => a.wrapping_sub(b),
            DW_OP_mul => a.wrapping_mul(b),
            DW_OP_div | DW_OP_mod if b == 0 => {
                return Err(Error::corrupt("Division by zero"));
            }
            DW_OP_div if first.arith_signed() => sa.wrapping_div(sb) as u64,
            DW_OP_div => a / b,
            // Unlike division, the modulus of generic values is unsigned.
            DW_OP_mod if first.ty.is_some_and(|ty| ty.signed) => sa.wrapping_rem(sb) as u64,
            DW_OP_mod => a % b,
            DW_OP_shl if b >= bits => 0,
            DW_OP_shl => a << b,
            DW_OP_shr if b >= bits => 0,
            DW_OP_shr => a >> b,
            DW_OP_shra if b >= bits => {
                if sa < 0 {
                    u64::MAX
                } else {
                    0
                }
            }
            DW_OP_shra => (sa >> b) as u64,
            _ => {
                let ordering = if first.arith_signed() {
                    sa.cmp(&sb)
                } else {
                    a.cmp(&b)
                };
                let holds = match op {
                    DW_OP_le => ordering.is_le(),
                    DW_OP_ge => ordering.is_ge(),
                    DW_OP_eq => ordering.is_eq(),
                    DW_OP_lt => ordering.is_lt(),
                    DW_OP_gt => ordering.is_gt(),
                    _ => ordering.is_ne(),
                };
                return Ok(self.generic(u64::from(holds)));
            }
        };
        Ok(first.with_bits(result, address_size))
    }

    /// Evaluates the frame base of the current function on a fresh stack.
    fn frame_base(&mut self, ctx: &mut dyn EvalContext) -> Result<u64> {
        let block = ctx.frame_base()?;
        let saved = mem::take(&mut self.stack);
        let result = self
            .eval(ctx, &block)
            .and_then(|()| self.frame_base_value(ctx));
        self.stack = saved;
        self.kind = Kind::Memory;
        result
    }

    fn frame_base_value(&self, ctx: &mut dyn EvalContext) -> Result<u64> {
        match self.kind {
            Kind::Memory => self.fetch_address(0),
            Kind::Register => ctx.read_register(self.fetch(0)?.value.bits),
            _ => Err(Error::unsupported(
                "Not implemented: computing frame base using explicit value operator",
            )),
        }
    }

    fn push_entry_value(
        &mut self,
        ctx: &mut dyn EvalContext,
        kind: ParameterKind,
        deref_size: Option<u8>,
    ) -> Result<()> {
        match ctx.entry_value(kind, deref_size)? {
            EntryValue::Value(value) => self.push_address(value, false),
            EntryValue::Block { expr, mut caller } => self.eval(&mut *caller, &expr)?,
        }
        Ok(())
    }

    /// The value of the variable at `die`, read through its location.
    fn variable_value(&mut self, ctx: &mut dyn EvalContext, die: u64) -> Result<Value> {
        let block = ctx.dwarf_call(die)?;
        let mut nested = Evaluator::new(self.options);
        nested.depth = self.depth;
        nested.eval(ctx, &block)?;

        let address_size = self.options.address_size;
        let bits = match nested.location()? {
            LocationDescription::Simple(Location::Memory { address, .. }) => {
                read_uint(ctx, address, address_size, self.options.endian)?
            }
            LocationDescription::Simple(Location::Register(reg)) => ctx.read_register(reg)?,
            LocationDescription::Simple(Location::Value(value)) => value.bits,
            LocationDescription::Simple(Location::Literal(bytes)) => {
                let len = bytes.len().min(usize::from(address_size));
                extract_unsigned(&bytes[..len], self.options.endian)
            }
            LocationDescription::Simple(Location::OptimizedOut) => {
                return Err(Error::OptimizedOut)
            }
            _ => {
                return Err(Error::unsupported(
                    "DW_OP_GNU_variable_value of a variable without a simple location",
                ))
            }
        };
        Ok(self.generic(bits))
    }

    fn add_piece(&mut self, size: u64, offset: u64) -> Result<()> {
        // Bit positions inside of the composite and inside of each piece
        // must fit in 64 bits.
        let total = self
            .pieces
            .iter()
            .try_fold(size, |total, piece| total.checked_add(piece.size));
        if total.is_none() || offset.checked_add(size).is_none() {
            return Err(Error::corrupt("pieces of the location are too large"));
        }
        let location = if let Kind::Literal(bytes) = &self.kind {
            Location::Literal(bytes.clone())
        } else if self.stack.is_empty() {
            self.kind = Kind::OptimizedOut;
            Location::OptimizedOut
        } else {
            let top = self.fetch(0)?;
            match self.kind {
                Kind::Memory => Location::Memory {
                    address: top.value.bits,
                    in_stack_memory: top.in_stack_memory,
                },
                Kind::Register => Location::Register(top.value.bits),
                Kind::Stack => Location::Value(top.value),
                Kind::ImplicitPointer { die } => Location::ImplicitPointer {
                    die,
                    offset: top.value.signed(self.options.address_size),
                },
                Kind::OptimizedOut | Kind::Literal(_) => Location::OptimizedOut,
            }
        };
        self.pieces.push(Piece {
            location,
            size,
            offset,
        });
        Ok(())
    }

    /// Pops what the last piece described and starts over with a memory
    /// location.
    fn finish_piece(&mut self) -> Result<()> {
        if !matches!(self.kind, Kind::Literal(_) | Kind::OptimizedOut) {
            self.pop()?;
        }
        self.kind = Kind::Memory;
        Ok(())
    }
}

fn require_composition(data: &Cursor<'_>, op: &str) -> Result<()> {
    if ends_location(data.peek_u8()) {
        Ok(())
    } else {
        Err(Error::corrupt(format!(
            "DWARF-2 expression error: `{op}' operations must be used either alone or in \
             conjunction with DW_OP_piece or DW_OP_bit_piece."
        )))
    }
}

fn jump(data: &mut Cursor<'_>, offset: i16) -> Result<()> {
    let target = data.offset() as i64 + i64::from(offset);
    if target < 0 || target as usize > data.end() {
        return Err(Error::corrupt(format!(
            "DWARF expression branch to {target} is outside of the expression"
        )));
    }
    data.seek(target as usize)
}

fn read_uint(ctx: &mut dyn EvalContext, addr: u64, size: u8, endian: Endian) -> Result<u64> {
    let mut buf = [0; 8];
    let buf = buf.get_mut(..usize::from(size)).ok_or_else(|| {
        Error::unsupported(format!("dereferencing {size} bytes on the DWARF stack"))
    })?;
    ctx.read_memory(addr, buf)?;
    Ok(extract_unsigned(buf, endian))
}

fn base_type(ctx: &mut dyn EvalContext, die: u64) -> Result<BaseType> {
    let ty = ctx.base_type(die)?;
    if ty.size == 0 || ty.size > 8 {
        return Err(Error::unsupported(format!(
            "base type of {} bytes on the DWARF stack",
            ty.size
        )));
    }
    Ok(ty)
}

/// The register of a block that is exactly one `DW_OP_reg*`, `DW_OP_regx` or
/// `DW_OP_regval_type`.
pub fn block_to_dwarf_reg(block: &[u8]) -> Option<u64> {
    let mut data = Cursor::new(block, Endian::Little);
    let reg = match data.read_u8().ok()? {
        op @ DW_OP_reg0..=DW_OP_reg31 => u64::from(op - DW_OP_reg0),
        DW_OP_regx => data.read_uleb128().ok()?,
        DW_OP_regval_type | DW_OP_GNU_regval_type => {
            let reg = data.read_uleb128().ok()?;
            data.read_uleb128().ok()?;
            reg
        }
        _ => return None,
    };
    data.is_empty().then_some(reg)
}

/// The register and dereference size of a block that is exactly
/// `DW_OP_breg*(0)` followed by `DW_OP_deref` (size `None`) or
/// `DW_OP_deref_size`.
pub fn block_to_dwarf_reg_deref(block: &[u8]) -> Option<(u64, Option<u8>)> {
    let mut data = Cursor::new(block, Endian::Little);
    let reg = match data.read_u8().ok()? {
        op @ DW_OP_breg0..=DW_OP_breg31 => u64::from(op - DW_OP_breg0),
        DW_OP_bregx => data.read_uleb128().ok()?,
        _ => return None,
    };
    if data.read_sleb128().ok()? != 0 {
        return None;
    }
    let size = match data.read_u8().ok()? {
        DW_OP_deref => None,
        DW_OP_deref_size => Some(data.read_u8().ok()?),
        _ => return None,
    };
    data.is_empty().then_some((reg, size))
}

/// The offset of a block that is exactly one `DW_OP_fbreg`.
pub fn block_to_fb_offset(block: &[u8]) -> Option<i64> {
    let mut data = Cursor::new(block, Endian::Little);
    if data.read_u8().ok()? != DW_OP_fbreg {
        return None;
    }
    let offset = data.read_sleb128().ok()?;
    data.is_empty().then_some(offset)
}
