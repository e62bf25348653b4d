//! this implements the DWARF bits a debugger needs to look at a stopped program.
//!
//! # how it works
//! first, the `.eh_frame` and `.debug_frame` sections get parsed into one sorted table of FDEs ([`parse`]).
//! to unwind a frame, the CIE and FDE programs of its function get run up to the pc ([`exec`]), which gives
//! a rule for every register. those rules are then used to compute the registers of the caller ([`unwind`]).
//!
//! the rules and the locations of variables are DWARF expressions, a little stack machine ([`expr`]).
//! variables can be split into pieces that live in different places ([`piece`], [`value`]), their location can
//! depend on the pc ([`loclist`]), and `DW_OP_entry_value` needs to look at the caller's call site ([`call_site`]).
//!
//! See https://dwarfstd.org/doc/DWARF5.pdf for more information if more information is desired.

pub mod call_site;
pub mod exec;
pub mod expr;
pub mod loclist;
pub mod parse;
pub mod piece;
pub mod quirks;
pub mod unwind;
pub mod value;
