//! Variables, as described by their location expressions.
//!
//! [`evaluate_location`] runs the expression in a live frame and says where
//! the variable is. Nothing is read until [`VariableValue::contents`] is
//! called, which reports unreadable bits instead of failing.

#[cfg(test)]
mod tests;

use alloc::{rc::Rc, vec, vec::Vec};

use super::{
    expr::{
        EvalOptions, Evaluator, FrameContext, Location, LocationDescription, NeedsContext, Piece,
        SymbolNeeds,
    },
    piece::{PieceContents, PiecedValue},
    unwind::Unwinder,
};
use crate::{
    error::{Error, ErrorKind, Result},
    reader::Endian,
    target::{DebugInfo, Frame},
};

/// The part of an object that is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset in bytes from the start of the object the expression describes.
    pub offset: i64,
    /// Size in bytes.
    pub size: u64,
}

impl Extent {
    pub fn whole(size: u64) -> Self {
        Self { offset: 0, size }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLocation {
    OptimizedOut,
    /// Registers or memory the location depends on could not be read.
    Unavailable,
    Memory { address: u64, in_stack_memory: bool },
    /// Internal register number.
    Register(usize),
    /// The contents themselves.
    Bytes(Vec<u8>),
    /// A part of a value made of pieces. The pieces are shared by all parts
    /// of the same variable.
    Pieced {
        pieces: Rc<PiecedValue>,
        bit_offset: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub location: ValueLocation,
    /// Size in bytes.
    pub size: u64,
    /// `false` after `DW_OP_GNU_uninit`.
    pub initialized: bool,
}

impl VariableValue {
    fn new(location: ValueLocation, size: u64) -> Self {
        Self {
            location,
            size,
            initialized: true,
        }
    }

    fn optimized_out(size: u64) -> Self {
        Self::new(ValueLocation::OptimizedOut, size)
    }

    fn bits(&self) -> Result<u64> {
        self.size
            .checked_mul(8)
            .ok_or_else(|| Error::unsupported(alloc::format!("a value of {} bytes is too large", self.size)))
    }

    /// Reads the value from `frame`.
    pub fn contents(&self, frame: &dyn Frame) -> Result<PieceContents> {
        let bits = self.bits()?;
        let mut contents = PieceContents::new(bits);
        match &self.location {
            ValueLocation::OptimizedOut => contents.optimized_out.push(0..bits),
            ValueLocation::Unavailable => contents.unavailable.push(0..bits),
            ValueLocation::Memory { address, .. } => {
                if let Err(err) = frame.read_memory(*address, &mut contents.bytes) {
                    contents.bytes.fill(0);
                    contents.mark(err, 0..bits)?;
                }
            }
            ValueLocation::Register(regnum) => {
                let arch = frame.arch();
                let reg_size = arch.register_size(*regnum);
                let size = usize::try_from(self.size)
                    .ok()
                    .filter(|&size| size <= reg_size)
                    .ok_or_else(|| {
                        Error::unsupported(alloc::format!(
                            "a value of {} bytes does not fit in register {regnum}",
                            self.size
                        ))
                    })?;
                // The value is in the low-order bytes of the register.
                let offset = match arch.endian() {
                    Endian::Little => 0,
                    Endian::Big => reg_size - size,
                };
                if let Err(err) = frame.register_bytes(*regnum, offset, &mut contents.bytes) {
                    contents.bytes.fill(0);
                    contents.mark(err, 0..bits)?;
                }
            }
            ValueLocation::Bytes(bytes) => {
                let len = bytes.len().min(contents.bytes.len());
                contents.bytes[..len].copy_from_slice(&bytes[..len]);
            }
            ValueLocation::Pieced { pieces, bit_offset } => {
                return pieces.read(frame, *bit_offset, bits);
            }
        }
        Ok(contents)
    }

    /// The target of the value if it is an implicit pointer: the DIE it
    /// points into and the byte offset into that DIE's value.
    pub fn implicit_pointer(&self) -> Result<Option<(u64, i64)>> {
        match &self.location {
            ValueLocation::Pieced { pieces, bit_offset } => {
                pieces.implicit_pointer_target(*bit_offset, self.bits()?)
            }
            _ => Ok(None),
        }
    }
}

/// The `size` bytes at `offset` of a value that only has `bytes`.
fn subobject(bytes: &[u8], offset: u64, size: u64) -> Result<Vec<u8>> {
    let range = usize::try_from(offset)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(offset, size)| Some(offset..offset.checked_add(size)?))
        .filter(|range| range.end <= bytes.len())
        .ok_or(Error::InvalidSyntheticPointer)?;
    Ok(bytes[range].to_vec())
}

/// Evaluates the location expression `expr` of a variable in `frame`.
///
/// Values that cannot be shown are not errors: missing registers or memory
/// make the value unavailable, and a failed entry value lookup makes it
/// optimized out.
#[instrument(level = "debug", skip(frame, unwinder, expr), fields(pc = frame.pc()))]
pub fn evaluate_location(
    frame: &dyn Frame,
    unwinder: &Unwinder<'_>,
    expr: &[u8],
    extent: Extent,
) -> Result<VariableValue> {
    let offset = u64::try_from(extent.offset).map_err(|_| Error::InvalidSyntheticPointer)?;
    if expr.is_empty() {
        return Ok(VariableValue::optimized_out(extent.size));
    }

    let options = unwinder.eval_options(frame);
    let mut ctx = FrameContext::new(frame, unwinder);
    let mut evaluator = Evaluator::new(options);
    let description = match evaluator
        .eval(&mut ctx, expr)
        .and_then(|()| evaluator.location())
    {
        Ok(description) => description,
        Err(err) => {
            return match err.kind() {
                ErrorKind::Unavailable => {
                    debug!(%err, "location is unavailable");
                    Ok(VariableValue::new(ValueLocation::Unavailable, extent.size))
                }
                ErrorKind::OptimizedOut | ErrorKind::NoEntryValue => {
                    debug!(%err, "location is optimized out");
                    Ok(VariableValue::optimized_out(extent.size))
                }
                ErrorKind::Corrupt | ErrorKind::Unsupported => Err(err),
            };
        }
    };
    trace!(?description);

    let mut value = description_value(frame, &options, description, offset, extent.size)?;
    value.initialized = evaluator.is_initialized();
    Ok(value)
}

fn description_value(
    frame: &dyn Frame,
    options: &EvalOptions,
    description: LocationDescription,
    offset: u64,
    size: u64,
) -> Result<VariableValue> {
    let location = match description {
        LocationDescription::Composite(pieces) => {
            return pieced_value(pieces, options, offset, size);
        }
        LocationDescription::Simple(location) => location,
    };
    let location = match location {
        Location::Memory {
            address,
            in_stack_memory,
        } => ValueLocation::Memory {
            address: address.wrapping_add(offset),
            in_stack_memory,
        },
        Location::Register(reg) => {
            let regnum = frame.arch().dwarf_reg_to_regnum_or_error(reg)?;
            if offset != 0 {
                return Err(Error::unsupported(
                    "cannot use offset on synthetic pointer to register",
                ));
            }
            ValueLocation::Register(regnum)
        }
        Location::Value(value) => ValueLocation::Bytes(subobject(
            &value.to_bytes(options.address_size, options.endian),
            offset,
            size,
        )?),
        Location::Literal(bytes) => ValueLocation::Bytes(subobject(&bytes, offset, size)?),
        Location::OptimizedOut => ValueLocation::OptimizedOut,
        location @ Location::ImplicitPointer { .. } => {
            let piece = Piece {
                location,
                size: u64::from(options.address_size) * 8,
                offset: 0,
            };
            return pieced_value(vec![piece], options, offset, size);
        }
    };
    Ok(VariableValue::new(location, size))
}

fn pieced_value(pieces: Vec<Piece>, options: &EvalOptions, offset: u64, size: u64) -> Result<VariableValue> {
    let pieces = PiecedValue::new(pieces, options.address_size, options.endian);
    let end = offset
        .checked_add(size)
        .and_then(|end| end.checked_mul(8))
        .ok_or(Error::InvalidSyntheticPointer)?;
    if end > pieces.total_bits() {
        return Err(Error::InvalidSyntheticPointer);
    }
    Ok(VariableValue::new(
        ValueLocation::Pieced {
            pieces: Rc::new(pieces),
            bit_offset: offset * 8,
        },
        size,
    ))
}

/// Follows an implicit pointer to `size` bytes at `byte_offset` of the
/// variable described by the DIE at `die`.
#[instrument(level = "debug", skip(frame, unwinder))]
pub fn indirect_implicit_pointer(
    frame: &dyn Frame,
    unwinder: &Unwinder<'_>,
    die: u64,
    byte_offset: i64,
    size: u64,
) -> Result<VariableValue> {
    let debug = unwinder.debug();
    if let Ok(expr) = debug.die_location(die, frame.address_in_block()) {
        let extent = Extent {
            offset: byte_offset,
            size,
        };
        return evaluate_location(frame, unwinder, expr, extent);
    }
    match debug.die_constant(die) {
        Some(bytes) => {
            let offset = u64::try_from(byte_offset).map_err(|_| Error::InvalidSyntheticPointer)?;
            let bytes = subobject(bytes, offset, size)?;
            Ok(VariableValue::new(ValueLocation::Bytes(bytes), size))
        }
        None => Ok(VariableValue::optimized_out(size)),
    }
}

/// What reading a variable with the location expression `expr` requires,
/// found by running it without a target.
pub fn symbol_needs(expr: &[u8], debug: &dyn DebugInfo, options: EvalOptions) -> Result<SymbolNeeds> {
    if expr.is_empty() {
        return Ok(SymbolNeeds::None);
    }
    let mut ctx = NeedsContext::new(debug);
    let mut evaluator = Evaluator::new(options);
    evaluator.eval(&mut ctx, expr)?;

    // Registers are only known in a frame.
    let in_register = match evaluator.location()? {
        LocationDescription::Simple(location) => matches!(location, Location::Register(_)),
        LocationDescription::Composite(pieces) => pieces
            .iter()
            .any(|piece| matches!(piece.location, Location::Register(_))),
    };
    if in_register {
        ctx.need(SymbolNeeds::Frame);
    }
    Ok(ctx.needs())
}
