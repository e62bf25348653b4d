//! DWARF call frame information unwinding and location expression
//! evaluation for debuggers.
//!
//! The crate does not know how to read a process: the debugger hands it
//! [`target::Frame`]s for register and memory access and a
//! [`target::DebugInfo`] for whatever the symbol tables know. From that it
//! computes the caller's registers ([`dwarf::unwind`]) and the locations and
//! values of variables ([`dwarf::expr`], [`dwarf::value`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

pub mod arch;
pub mod complaint;
pub mod dwarf;
pub mod error;
pub mod reader;
pub mod target;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
