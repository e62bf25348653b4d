use alloc::{vec, vec::Vec};

use super::{evaluate_location, indirect_implicit_pointer, symbol_needs, Extent, ValueLocation};
use crate::{
    arch::X86_64,
    complaint::Complaints,
    dwarf::{
        expr::{op::*, EvalOptions, SymbolNeeds},
        parse::{CfiOptions, CfiTable},
        unwind::Unwinder,
    },
    error::{Error, ErrorKind},
    testing::{FakeDebugInfo, FakeFrame},
};

fn with_unwinder(debug: &FakeDebugInfo, f: impl FnOnce(&Unwinder<'_>)) {
    let complaints = Complaints::default();
    let table = CfiTable::build(None, None, &CfiOptions::default(), &complaints);
    f(&Unwinder::new(&table, debug, &complaints));
}

fn frame() -> FakeFrame {
    FakeFrame::new(0x1004)
        .with_register(X86_64::RAX, 0x1122_3344_aabb_ccdd)
        .with_register(X86_64::RBX, 0x1122_3344_5566_7788)
        .with_register(X86_64::RBP, 0x7000)
        .with_register(X86_64::RSP, 0x8000)
        .with_u64(0x6ff0, 0x0807_0605_0403_0201)
        .with_memory(0x8000, &[1, 2, 3, 4])
}

fn debug() -> FakeDebugInfo {
    FakeDebugInfo {
        frame_base: vec![DW_OP_breg0 + 6, 0],
        ..FakeDebugInfo::default()
    }
}

#[test]
fn memory_locations() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        // DW_OP_fbreg -16
        let expr = [DW_OP_fbreg, 0x70];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(
            value.location,
            ValueLocation::Memory {
                address: 0x6ff0,
                in_stack_memory: true,
            }
        );
        assert!(value.initialized);
        let contents = value.contents(&frame).unwrap();
        assert_eq!(contents.bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(contents.is_complete());

        let extent = Extent { offset: 4, size: 4 };
        let value = evaluate_location(&frame, unwinder, &expr, extent).unwrap();
        assert_eq!(value.contents(&frame).unwrap().bytes, [5, 6, 7, 8]);

        // the memory behind the pointer is gone, the pointer is not
        let expr = [DW_OP_breg0 + 7, 0x10];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(4)).unwrap();
        assert_eq!(
            value.location,
            ValueLocation::Memory {
                address: 0x8010,
                in_stack_memory: false,
            }
        );
        assert_eq!(value.contents(&frame).unwrap().unavailable, [0..32]);
    });
}

#[test]
fn register_locations() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        let expr = [DW_OP_reg0 + 3];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(4)).unwrap();
        assert_eq!(value.location, ValueLocation::Register(X86_64::RBX));
        assert_eq!(value.contents(&frame).unwrap().bytes, [0x88, 0x77, 0x66, 0x55]);

        let too_big = evaluate_location(&frame, unwinder, &expr, Extent::whole(16)).unwrap();
        assert_eq!(
            too_big.contents(&frame).unwrap_err().kind(),
            ErrorKind::Unsupported
        );

        let err = evaluate_location(&frame, unwinder, &expr, Extent { offset: 2, size: 2 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let missing = FakeFrame::new(0x1004);
        let value = evaluate_location(&missing, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.contents(&missing).unwrap().unavailable, [0..64]);
    });
}

#[test]
fn implicit_values() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        let expr = [DW_OP_lit0 + 5, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![5, 0, 0, 0, 0, 0, 0, 0]));

        let err = evaluate_location(&frame, unwinder, &expr, Extent { offset: 4, size: 8 }).unwrap_err();
        assert_eq!(err, Error::InvalidSyntheticPointer);

        let expr = [DW_OP_implicit_value, 3, 0xa, 0xb, 0xc];
        let value = evaluate_location(&frame, unwinder, &expr, Extent { offset: 1, size: 2 }).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![0xb, 0xc]));
        assert_eq!(value.contents(&frame).unwrap().bytes, [0xb, 0xc]);
    });
}

#[test]
fn values_that_cannot_be_shown() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        let value = evaluate_location(&frame, unwinder, &[], Extent::whole(4)).unwrap();
        assert_eq!(value.location, ValueLocation::OptimizedOut);
        assert_eq!(value.contents(&frame).unwrap().optimized_out, [0..32]);

        let err = evaluate_location(&frame, unwinder, &[], Extent { offset: -1, size: 4 }).unwrap_err();
        assert_eq!(err, Error::InvalidSyntheticPointer);

        // r12 is not known in this frame
        let expr = [DW_OP_breg0 + 12, 0];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.location, ValueLocation::Unavailable);
        assert_eq!(value.contents(&frame).unwrap().unavailable, [0..64]);

        // there is no caller to take the entry value from
        let expr = [DW_OP_entry_value, 1, DW_OP_reg0 + 5, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.location, ValueLocation::OptimizedOut);

        // malformed expressions are still errors
        let err = evaluate_location(&frame, unwinder, &[DW_OP_dup], Extent::whole(8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    });
}

#[test]
fn uninitialized() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        let expr = [DW_OP_breg0 + 7, 0, DW_OP_GNU_uninit];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(4)).unwrap();
        assert!(!value.initialized);
        assert_eq!(value.contents(&frame).unwrap().bytes, [1, 2, 3, 4]);
    });
}

#[test]
fn composite_locations() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        let expr = [DW_OP_reg0, DW_OP_piece, 4, DW_OP_breg0 + 7, 0, DW_OP_piece, 4];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        let contents = value.contents(&frame).unwrap();
        assert_eq!(contents.bytes, [0xdd, 0xcc, 0xbb, 0xaa, 1, 2, 3, 4]);
        assert_eq!(value.implicit_pointer().unwrap(), None);

        let value = evaluate_location(&frame, unwinder, &expr, Extent { offset: 3, size: 2 }).unwrap();
        assert_eq!(value.contents(&frame).unwrap().bytes, [0xaa, 1]);

        let err = evaluate_location(&frame, unwinder, &expr, Extent { offset: 6, size: 4 }).unwrap_err();
        assert_eq!(err, Error::InvalidSyntheticPointer);
    });
}

#[test]
fn oversized_pieces() {
    let debug = debug();
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        // two pieces of 2^60 bytes each
        let size = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x10];
        let mut expr = vec![DW_OP_reg0, DW_OP_piece];
        expr.extend(size);
        expr.extend([DW_OP_reg0 + 1, DW_OP_piece]);
        expr.extend(size);
        let err = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        // a single piece whose size in bits does not fit in 64 bits
        let expr = [DW_OP_reg0, DW_OP_piece, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x40];
        let err = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let err = evaluate_location(&frame, unwinder, &[DW_OP_reg0, DW_OP_piece, 8], Extent::whole(u64::MAX))
            .unwrap_err();
        assert_eq!(err, Error::InvalidSyntheticPointer);
    });
}

#[test]
fn implicit_pointers() {
    let mut debug = debug();
    debug.die_constants.insert(0x40, vec![1, 2, 3, 4]);
    debug.die_locations.insert(0x50, vec![DW_OP_breg0 + 7, 0]);
    with_unwinder(&debug, |unwinder| {
        let frame = frame();
        // DW_OP_implicit_pointer <0x40> +2
        let expr = [DW_OP_implicit_pointer, 0x40, 0, 0, 0, 2];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        let (die, offset) = value.implicit_pointer().unwrap().unwrap();
        assert_eq!((die, offset), (0x40, 2));
        // the pointer itself reads as zeros
        assert_eq!(value.contents(&frame).unwrap().bytes, [0; 8]);

        let target = indirect_implicit_pointer(&frame, unwinder, die, offset, 2).unwrap();
        assert_eq!(target.location, ValueLocation::Bytes(vec![3, 4]));

        let target = indirect_implicit_pointer(&frame, unwinder, 0x50, 2, 2).unwrap();
        assert_eq!(target.contents(&frame).unwrap().bytes, [3, 4]);

        let target = indirect_implicit_pointer(&frame, unwinder, 0x60, 0, 4).unwrap();
        assert_eq!(target.location, ValueLocation::OptimizedOut);

        let err = indirect_implicit_pointer(&frame, unwinder, 0x40, 3, 2).unwrap_err();
        assert_eq!(err, Error::InvalidSyntheticPointer);
    });
}

#[test]
fn needs() {
    let debug = debug();
    let needs = |expr: &[u8]| symbol_needs(expr, &debug, EvalOptions::default()).unwrap();

    assert_eq!(needs(&[]), SymbolNeeds::None);
    let mut addr: Vec<u8> = vec![DW_OP_addr];
    addr.extend_from_slice(&0x4000u64.to_le_bytes());
    assert_eq!(needs(&addr), SymbolNeeds::None);
    assert_eq!(needs(&[DW_OP_breg0 + 7, 8, DW_OP_deref]), SymbolNeeds::Registers);
    assert_eq!(needs(&[DW_OP_reg0 + 3]), SymbolNeeds::Frame);
    assert_eq!(needs(&[DW_OP_fbreg, 0x70]), SymbolNeeds::Frame);
    assert_eq!(
        needs(&[DW_OP_lit0, DW_OP_piece, 4, DW_OP_reg0, DW_OP_piece, 4]),
        SymbolNeeds::Frame
    );
}
