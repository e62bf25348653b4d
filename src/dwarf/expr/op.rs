//! `DW_OP_*` opcodes.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §7.7.1 DWARF Expressions

#![allow(non_upper_case_globals)]

pub const DW_OP_addr: u8 = 0x03;
pub const DW_OP_deref: u8 = 0x06;
pub const DW_OP_const1u: u8 = 0x08;
pub const DW_OP_const1s: u8 = 0x09;
pub const DW_OP_const2u: u8 = 0x0a;
pub const DW_OP_const2s: u8 = 0x0b;
pub const DW_OP_const4u: u8 = 0x0c;
pub const DW_OP_const4s: u8 = 0x0d;
pub const DW_OP_const8u: u8 = 0x0e;
pub const DW_OP_const8s: u8 = 0x0f;
pub const DW_OP_constu: u8 = 0x10;
pub const DW_OP_consts: u8 = 0x11;
pub const DW_OP_dup: u8 = 0x12;
pub const DW_OP_drop: u8 = 0x13;
pub const DW_OP_over: u8 = 0x14;
pub const DW_OP_pick: u8 = 0x15;
pub const DW_OP_swap: u8 = 0x16;
pub const DW_OP_rot: u8 = 0x17;
pub const DW_OP_xderef: u8 = 0x18;
pub const DW_OP_abs: u8 = 0x19;
pub const DW_OP_and: u8 = 0x1a;
pub const DW_OP_div: u8 = 0x1b;
pub const DW_OP_minus: u8 = 0x1c;
pub const DW_OP_mod: u8 = 0x1d;
pub const DW_OP_mul: u8 = 0x1e;
pub const DW_OP_neg: u8 = 0x1f;
pub const DW_OP_not: u8 = 0x20;
pub const DW_OP_or: u8 = 0x21;
pub const DW_OP_plus: u8 = 0x22;
pub const DW_OP_plus_uconst: u8 = 0x23;
pub const DW_OP_shl: u8 = 0x24;
pub const DW_OP_shr: u8 = 0x25;
pub const DW_OP_shra: u8 = 0x26;
pub const DW_OP_xor: u8 = 0x27;
pub const DW_OP_bra: u8 = 0x28;
pub const DW_OP_eq: u8 = 0x29;
pub const DW_OP_ge: u8 = 0x2a;
pub const DW_OP_gt: u8 = 0x2b;
pub const DW_OP_le: u8 = 0x2c;
pub const DW_OP_lt: u8 = 0x2d;
pub const DW_OP_ne: u8 = 0x2e;
pub const DW_OP_skip: u8 = 0x2f;
pub const DW_OP_lit0: u8 = 0x30;
pub const DW_OP_lit31: u8 = 0x4f;
pub const DW_OP_reg0: u8 = 0x50;
pub const DW_OP_reg31: u8 = 0x6f;
pub const DW_OP_breg0: u8 = 0x70;
pub const DW_OP_breg31: u8 = 0x8f;
pub const DW_OP_regx: u8 = 0x90;
pub const DW_OP_fbreg: u8 = 0x91;
pub const DW_OP_bregx: u8 = 0x92;
pub const DW_OP_piece: u8 = 0x93;
pub const DW_OP_deref_size: u8 = 0x94;
pub const DW_OP_xderef_size: u8 = 0x95;
pub const DW_OP_nop: u8 = 0x96;
pub const DW_OP_push_object_address: u8 = 0x97;
pub const DW_OP_call2: u8 = 0x98;
pub const DW_OP_call4: u8 = 0x99;
pub const DW_OP_call_ref: u8 = 0x9a;
pub const DW_OP_form_tls_address: u8 = 0x9b;
pub const DW_OP_call_frame_cfa: u8 = 0x9c;
pub const DW_OP_bit_piece: u8 = 0x9d;
pub const DW_OP_implicit_value: u8 = 0x9e;
pub const DW_OP_stack_value: u8 = 0x9f;
pub const DW_OP_implicit_pointer: u8 = 0xa0;
pub const DW_OP_addrx: u8 = 0xa1;
pub const DW_OP_constx: u8 = 0xa2;
pub const DW_OP_entry_value: u8 = 0xa3;
pub const DW_OP_const_type: u8 = 0xa4;
pub const DW_OP_regval_type: u8 = 0xa5;
pub const DW_OP_deref_type: u8 = 0xa6;
pub const DW_OP_xderef_type: u8 = 0xa7;
pub const DW_OP_convert: u8 = 0xa8;
pub const DW_OP_reinterpret: u8 = 0xa9;

// GNU extensions
pub const DW_OP_GNU_push_tls_address: u8 = 0xe0;
pub const DW_OP_GNU_uninit: u8 = 0xf0;
pub const DW_OP_GNU_encoded_addr: u8 = 0xf1;
pub const DW_OP_GNU_implicit_pointer: u8 = 0xf2;
pub const DW_OP_GNU_entry_value: u8 = 0xf3;
pub const DW_OP_GNU_const_type: u8 = 0xf4;
pub const DW_OP_GNU_regval_type: u8 = 0xf5;
pub const DW_OP_GNU_deref_type: u8 = 0xf6;
pub const DW_OP_GNU_convert: u8 = 0xf7;
pub const DW_OP_GNU_reinterpret: u8 = 0xf9;
pub const DW_OP_GNU_parameter_ref: u8 = 0xfa;
pub const DW_OP_GNU_addr_index: u8 = 0xfb;
pub const DW_OP_GNU_const_index: u8 = 0xfc;
pub const DW_OP_GNU_variable_value: u8 = 0xfd;

/// Whether an operation that only names a location may be followed by `op`.
pub(crate) fn ends_location(op: Option<u8>) -> bool {
    matches!(
        op,
        None | Some(DW_OP_piece | DW_OP_bit_piece | DW_OP_GNU_uninit)
    )
}
