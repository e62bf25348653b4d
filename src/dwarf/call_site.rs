//! Entry values: what a parameter was when the function was called.
//!
//! The callee does not know, but the caller might. `DW_TAG_call_site`
//! entries of the caller describe how to recompute the arguments in the
//! caller's frame, which is still around when the callee is stopped. This
//! only works if the frame that called us is really the one whose call site
//! we look at, so tail calls make everything a lot more careful.

#[cfg(test)]
mod tests;

use alloc::{collections::BTreeSet, format, string::String, vec::Vec};

use super::{
    expr::{
        block_to_dwarf_reg, block_to_fb_offset, op::DW_OP_stack_value, EvalContext, Evaluator,
        FrameContext, Location, LocationDescription,
    },
    unwind::Unwinder,
    value::{evaluate_location, Extent, VariableValue},
};
use crate::{
    error::{Error, ErrorKind, Result},
    reader::extract_unsigned,
    target::{DebugInfo, Frame},
};

/// `DW_AT_call_target` (or `DW_AT_call_origin`) of a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteTarget {
    /// Neither attribute is present.
    Unspecified,
    /// An expression computing the target in the caller's frame.
    Block(Vec<u8>),
    /// A linkage name.
    PhysName(String),
    /// A relocated address.
    PhysAddr(u64),
}

/// How a callee refers to a parameter, and how a call site parameter is
/// matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Passed in a DWARF register.
    DwarfReg(u64),
    /// Passed on the stack, at this offset from the callee's frame base.
    FbOffset(i64),
    /// `DW_OP_GNU_parameter_ref`: the DIE offset of the formal parameter,
    /// relative to its unit.
    ParamOffset(u64),
}

/// `DW_TAG_call_site_parameter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteParameter {
    pub kind: ParameterKind,
    /// `DW_AT_call_value`: computes the argument in the caller.
    pub value: Vec<u8>,
    /// `DW_AT_call_data_value`: computes what the argument pointed to.
    pub data_value: Option<Vec<u8>>,
}

/// `DW_TAG_call_site`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// The return address of the call.
    pub pc: u64,
    pub target: CallSiteTarget,
    pub parameters: Vec<CallSiteParameter>,
}

/// Tail calls that must have happened between a caller and a callee.
///
/// `call_sites` is one possible chain, outermost first. Only its first
/// `callers` and last `callees` entries are certain, everything in between
/// differs between the possible chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteChain<'d> {
    pub call_sites: Vec<&'d CallSite>,
    pub callers: usize,
    pub callees: usize,
}

fn call_site_for_pc(debug: &dyn DebugInfo, pc: u64) -> Result<&CallSite> {
    debug.call_site(pc).ok_or_else(|| {
        Error::no_entry_value(format!(
            "DW_OP_entry_value resolving cannot find DW_TAG_call_site {pc:#x}"
        ))
    })
}

/// The address `site` calls. Expression targets need the registers of the
/// `caller`, which tail-called frames do not have.
pub fn call_site_to_target_addr(
    site: &CallSite,
    caller: Option<&dyn Frame>,
    unwinder: &Unwinder<'_>,
) -> Result<u64> {
    let pc = site.pc;
    match &site.target {
        CallSiteTarget::Unspecified => Err(Error::no_entry_value(format!(
            "DW_AT_call_target is not specified at {pc:#x}"
        ))),
        CallSiteTarget::Block(expr) => {
            let caller = caller.ok_or_else(|| {
                Error::no_entry_value(format!(
                    "DW_AT_call_target DWARF block resolving requires known frame which is \
                     currently not available at {pc:#x}"
                ))
            })?;
            let options = unwinder.eval_options(caller);
            let mut ctx = FrameContext::new(caller, unwinder);
            let mut evaluator = Evaluator::new(options);
            evaluator.eval(&mut ctx, expr)?;
            // This is an expression, not a location: a memory location is
            // the address itself.
            match evaluator.location()? {
                LocationDescription::Simple(Location::Memory { address, .. }) => Ok(address),
                LocationDescription::Simple(Location::Register(reg)) => ctx.read_register(reg),
                LocationDescription::Simple(Location::Value(value)) => Ok(value.bits),
                LocationDescription::Simple(Location::Literal(bytes)) => {
                    let len = bytes.len().min(usize::from(options.address_size));
                    Ok(extract_unsigned(&bytes[..len], options.endian))
                }
                _ => Err(Error::OptimizedOut),
            }
        }
        CallSiteTarget::PhysName(name) => unwinder.debug().lookup_symbol(name).ok_or_else(|| {
            Error::no_entry_value(format!(
                "Cannot find function \"{name}\" for a call site target at {pc:#x}"
            ))
        }),
        CallSiteTarget::PhysAddr(addr) => Ok(*addr),
    }
}

/// The tail calls of the function starting exactly at `addr`.
fn tail_call_list(debug: &dyn DebugInfo, addr: u64) -> Result<&[CallSite]> {
    debug.tail_call_sites(addr).ok_or_else(|| {
        Error::no_entry_value(format!(
            "DW_TAG_call_site resolving failed to find function name for address {addr:#x}"
        ))
    })
}

/// Fails if the function at `verify_addr` can tail call itself, directly or
/// through other functions. Its parameters may then have changed since the
/// call site we would look at.
pub fn verify_no_self_tail_call(unwinder: &Unwinder<'_>, verify_addr: u64) -> Result<()> {
    let debug = unwinder.debug();
    let mut todo = Vec::from([verify_addr]);
    let mut seen = BTreeSet::new();

    while let Some(addr) = todo.pop() {
        for site in tail_call_list(debug, addr)? {
            let target = call_site_to_target_addr(site, None, unwinder)?;
            if target == verify_addr {
                return Err(Error::no_entry_value(format!(
                    "DW_OP_entry_value resolving has found function at {verify_addr:#x} \
                     can call itself via tail calls"
                )));
            }
            if seen.insert(target) {
                todo.push(target);
            }
        }
    }
    Ok(())
}

/// Narrows `result` down to what it has in common with `chain`. Returns
/// `false` once nothing is left.
fn chain_candidate<'d>(result: &mut Option<CallSiteChain<'d>>, chain: &[&'d CallSite]) -> bool {
    let Some(current) = result.as_mut() else {
        debug!(len = chain.len(), "initial tail call chain");
        *result = Some(CallSiteChain {
            call_sites: chain.to_vec(),
            callers: chain.len(),
            callees: chain.len(),
        });
        return true;
    };

    let same = |a: &CallSite, b: &CallSite| core::ptr::eq(a, b);
    let len = current.call_sites.len();

    let callers = current.callers.min(chain.len());
    if let Some(idx) = (0..callers).find(|&idx| !same(current.call_sites[idx], chain[idx])) {
        current.callers = idx;
    }
    let callees = current.callees.min(chain.len());
    if let Some(idx) = (0..callees)
        .find(|&idx| !same(current.call_sites[len - 1 - idx], chain[chain.len() - 1 - idx]))
    {
        current.callees = idx;
    }
    debug!(
        callers = current.callers,
        callees = current.callees,
        "reduced tail call chain"
    );

    // A direct call has an empty chain, which is only fine if it is the
    // only way.
    current.callers != 0 || current.callees != 0
}

fn find_chain_inner<'d>(
    unwinder: &Unwinder<'d>,
    caller_pc: u64,
    callee_pc: u64,
) -> Result<CallSiteChain<'d>> {
    let debug = unwinder.debug();
    let callee = debug.function_entry(callee_pc).ok_or_else(|| {
        Error::no_entry_value(format!("Unable to find function for PC {callee_pc:#x}"))
    })?;

    let mut result = None;
    // The call sites between the caller and the callee, each with the tail
    // call list it is part of so that its siblings can be tried next.
    let mut chain: Vec<(&'d [CallSite], usize)> = Vec::new();
    let mut visited = BTreeSet::new();
    let mut site = Some(call_site_for_pc(debug, caller_pc)?);

    while let Some(current) = site {
        let target = call_site_to_target_addr(current, None, unwinder)?;
        let mut next = if target == callee {
            let sites: Vec<&'d CallSite> = chain.iter().map(|&(list, i)| &list[i]).collect();
            if !chain_candidate(&mut result, &sites) {
                result = None;
                break;
            }
            // The callee is visited at most once per path.
            None
        } else {
            Some((tail_call_list(debug, target)?, 0))
        };

        loop {
            if let Some((list, i)) = next {
                if let Some(entered) = list.get(i) {
                    if visited.insert(entered.pc) {
                        chain.push((list, i));
                        break;
                    }
                }
            }

            // Backtrack to the next sibling of the innermost call site that
            // has one.
            next = None;
            while let Some((list, i)) = chain.pop() {
                visited.remove(&list[i].pc);
                if i + 1 < list.len() {
                    next = Some((list, i + 1));
                    break;
                }
            }
            if next.is_none() {
                break;
            }
        }

        site = chain.last().map(|&(list, i)| &list[i]);
    }

    result.ok_or_else(|| {
        Error::no_entry_value(format!(
            "There are no unambiguously determinable intermediate callers or callees \
             between caller function at {caller_pc:#x} and callee function at {callee:#x}"
        ))
    })
}

/// Reconstructs the tail calls between the call at `caller_pc` and the
/// function containing `callee_pc`. `None` if they cannot be determined
/// unambiguously.
#[instrument(level = "debug", skip(unwinder))]
pub fn find_chain<'d>(
    unwinder: &Unwinder<'d>,
    caller_pc: u64,
    callee_pc: u64,
) -> Result<Option<CallSiteChain<'d>>> {
    match find_chain_inner(unwinder, caller_pc, callee_pc) {
        Ok(chain) => Ok(Some(chain)),
        Err(err) if err.kind() == ErrorKind::NoEntryValue => {
            debug!(%err, "no tail call chain");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Finds the call site parameter in the caller of `frame` that matches
/// `kind`, together with the caller frame to evaluate it in.
#[instrument(level = "debug", skip(frame, unwinder), fields(pc = frame.pc()))]
pub fn entry_parameter<'f, 'd>(
    frame: &'f dyn Frame,
    unwinder: &Unwinder<'d>,
    kind: ParameterKind,
) -> Result<(&'d CallSiteParameter, &'f dyn Frame)> {
    let debug = unwinder.debug();
    let mut frame = frame;
    while frame.is_inline() {
        frame = frame.caller().ok_or_else(|| {
            Error::no_entry_value("DW_OP_entry_value resolving requires the caller of an inline frame")
        })?;
    }

    let func_addr = frame.function_start().ok_or_else(|| {
        Error::no_entry_value(format!(
            "DW_OP_entry_value resolving cannot find the function at {:#x}",
            frame.pc()
        ))
    })?;
    let caller = frame.caller().ok_or_else(|| {
        Error::no_entry_value(format!(
            "DW_OP_entry_value resolving requires caller of {func_addr:#x}"
        ))
    })?;
    let (arch, caller_arch) = (frame.arch().name(), caller.arch().name());
    if arch != caller_arch {
        return Err(Error::no_entry_value(format!(
            "DW_OP_entry_value resolving callee architecture {arch} (of {func_addr:#x}) does not \
             match caller architecture {caller_arch}"
        )));
    }

    let caller_pc = caller.pc();
    let site = call_site_for_pc(debug, caller_pc)?;
    let target = call_site_to_target_addr(site, Some(caller), unwinder)?;
    if target != func_addr {
        return Err(Error::no_entry_value(format!(
            "DW_OP_entry_value resolving expects callee at {target:#x} but the called frame \
             is for {func_addr:#x}"
        )));
    }

    verify_no_self_tail_call(unwinder, func_addr)?;

    let parameter = site
        .parameters
        .iter()
        .find(|parameter| parameter.kind == kind)
        .ok_or_else(|| {
            // Compilers leave the parameter out if they cannot say.
            Error::no_entry_value(format!(
                "Cannot find matching parameter at DW_TAG_call_site {caller_pc:#x}"
            ))
        })?;
    debug!(?parameter, caller_pc, "found entry parameter");
    Ok((parameter, caller))
}

/// Evaluates `parameter` in `caller`: its value, or with `deref` what it
/// pointed to, as an object of `size` bytes.
pub fn entry_parameter_to_value(
    parameter: &CallSiteParameter,
    deref: bool,
    caller: &dyn Frame,
    unwinder: &Unwinder<'_>,
    size: u64,
) -> Result<VariableValue> {
    let expr = if deref {
        parameter
            .data_value
            .as_deref()
            .ok_or_else(|| Error::no_entry_value("Cannot resolve DW_AT_call_data_value"))?
    } else {
        parameter.value.as_slice()
    };
    let mut expr = expr.to_vec();
    expr.push(DW_OP_stack_value);
    evaluate_location(caller, unwinder, &expr, Extent::whole(size))
}

/// The entry value of the parameter whose location in the callee is
/// `block`, which must be a single register or frame base offset.
pub fn value_of_block_entry(
    frame: &dyn Frame,
    unwinder: &Unwinder<'_>,
    block: &[u8],
    size: u64,
) -> Result<VariableValue> {
    let kind = if let Some(reg) = block_to_dwarf_reg(block) {
        ParameterKind::DwarfReg(reg)
    } else if let Some(offset) = block_to_fb_offset(block) {
        ParameterKind::FbOffset(offset)
    } else {
        return Err(Error::no_entry_value(
            "DWARF-2 expression error: DW_OP_entry_value is supported only for single \
             DW_OP_reg* or for DW_OP_fbreg(*)",
        ));
    };
    let (parameter, caller) = entry_parameter(frame, unwinder, kind)?;
    entry_parameter_to_value(parameter, false, caller, unwinder, size)
}
