use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};

use super::{
    call_site_to_target_addr, entry_parameter, entry_parameter_to_value, find_chain,
    value_of_block_entry, verify_no_self_tail_call, CallSite, CallSiteParameter, CallSiteTarget,
    ParameterKind,
};
use crate::{
    arch::X86_64,
    complaint::Complaints,
    dwarf::{
        expr::op::*,
        parse::{CfiOptions, CfiTable},
        unwind::Unwinder,
        value::{evaluate_location, Extent, ValueLocation},
    },
    error::{Error, ErrorKind},
    testing::{FakeDebugInfo, FakeFrame},
};

fn with_unwinder(debug: &FakeDebugInfo, f: impl FnOnce(&Unwinder<'_>)) {
    let complaints = Complaints::default();
    let table = CfiTable::build(None, None, &CfiOptions::default(), &complaints);
    f(&Unwinder::new(&table, debug, &complaints));
}

fn call(pc: u64, target: u64) -> CallSite {
    CallSite {
        pc,
        target: CallSiteTarget::PhysAddr(target),
        parameters: Vec::new(),
    }
}

fn no_entry_value_message(err: Error) -> String {
    match err {
        Error::NoEntryValue(msg) => msg,
        err => panic!("expected no entry value, got {err:?}"),
    }
}

const CALLEE: u64 = 0x1000;
const CALLER_PC: u64 = 0x2005;

/// `main` at 0x2000 calls the function at 0x1000 with rdi = rbx and
/// [rsp+8] = 42.
fn debug_info() -> FakeDebugInfo {
    let mut site = call(CALLER_PC, CALLEE);
    site.parameters = vec![
        CallSiteParameter {
            kind: ParameterKind::DwarfReg(5),
            value: vec![DW_OP_breg0 + 3, 0],
            data_value: Some(vec![DW_OP_lit0 + 9]),
        },
        CallSiteParameter {
            kind: ParameterKind::FbOffset(8),
            value: vec![DW_OP_const1u, 42],
            data_value: None,
        },
        CallSiteParameter {
            kind: ParameterKind::ParamOffset(0x30),
            value: vec![DW_OP_lit0 + 7],
            data_value: None,
        },
    ];
    FakeDebugInfo {
        functions: vec![(CALLEE, 0x1100), (0x2000, 0x2100)],
        call_sites: vec![site],
        ..FakeDebugInfo::default()
    }
}

fn callee_frame() -> FakeFrame {
    let caller = FakeFrame::new(CALLER_PC).with_register(X86_64::RBX, 0x33);
    let mut frame = FakeFrame::new(0x1008).with_caller(caller);
    frame.function_start = Some(CALLEE);
    frame
}

#[test]
fn entry_values_from_the_caller() {
    let debug = debug_info();
    with_unwinder(&debug, |unwinder| {
        let frame = callee_frame();
        let (parameter, caller) = entry_parameter(&frame, unwinder, ParameterKind::DwarfReg(5)).unwrap();
        assert_eq!(parameter.value, [DW_OP_breg0 + 3, 0]);
        assert_eq!(caller.pc(), CALLER_PC);

        let value = entry_parameter_to_value(parameter, false, caller, unwinder, 8).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![0x33, 0, 0, 0, 0, 0, 0, 0]));
        let value = entry_parameter_to_value(parameter, true, caller, unwinder, 4).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![9, 0, 0, 0]));

        // through the evaluator
        let expr = [DW_OP_entry_value, 1, DW_OP_reg0 + 5, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![0x33, 0, 0, 0, 0, 0, 0, 0]));
        let expr = [DW_OP_entry_value, 3, DW_OP_breg0 + 5, 0, DW_OP_deref, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(1)).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![9]));
        let expr = [DW_OP_GNU_parameter_ref, 0x30, 0, 0, 0, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(1)).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![7]));
    });
}

#[test]
fn block_entry_values() {
    let debug = debug_info();
    with_unwinder(&debug, |unwinder| {
        let frame = callee_frame();
        let value = value_of_block_entry(&frame, unwinder, &[DW_OP_reg0 + 5], 8).unwrap();
        assert_eq!(value.contents(&frame).unwrap().bytes, [0x33, 0, 0, 0, 0, 0, 0, 0]);
        let value = value_of_block_entry(&frame, unwinder, &[DW_OP_fbreg, 8], 1).unwrap();
        assert_eq!(value.location, ValueLocation::Bytes(vec![42]));

        let err = value_of_block_entry(&frame, unwinder, &[DW_OP_lit0], 8).unwrap_err();
        assert_eq!(
            no_entry_value_message(err),
            "DWARF-2 expression error: DW_OP_entry_value is supported only for single \
             DW_OP_reg* or for DW_OP_fbreg(*)"
        );
    });
}

#[test]
fn inline_frames_use_the_outer_function() {
    let debug = debug_info();
    with_unwinder(&debug, |unwinder| {
        let mut inline = FakeFrame::new(0x1008).with_caller(callee_frame());
        inline.inline = true;
        inline.function_start = Some(0x1040);
        let (parameter, _) = entry_parameter(&inline, unwinder, ParameterKind::DwarfReg(5)).unwrap();
        assert_eq!(parameter.data_value.as_deref(), Some(&[DW_OP_lit0 + 9][..]));
    });
}

#[test]
fn missing_entry_values() {
    let debug = debug_info();
    with_unwinder(&debug, |unwinder| {
        let frame = callee_frame();
        let err = entry_parameter(&frame, unwinder, ParameterKind::DwarfReg(4)).err().unwrap();
        assert_eq!(
            no_entry_value_message(err),
            "Cannot find matching parameter at DW_TAG_call_site 0x2005"
        );

        let (parameter, caller) = entry_parameter(&frame, unwinder, ParameterKind::FbOffset(8)).unwrap();
        let err = entry_parameter_to_value(parameter, true, caller, unwinder, 8).unwrap_err();
        assert_eq!(no_entry_value_message(err), "Cannot resolve DW_AT_call_data_value");

        // no caller
        let mut outermost = FakeFrame::new(0x1008);
        outermost.function_start = Some(CALLEE);
        let err = entry_parameter(&outermost, unwinder, ParameterKind::DwarfReg(5)).err().unwrap();
        assert_eq!(
            no_entry_value_message(err),
            "DW_OP_entry_value resolving requires caller of 0x1000"
        );

        // the caller is not stopped at a call site
        let mut frame = FakeFrame::new(0x1008).with_caller(FakeFrame::new(0x2010));
        frame.function_start = Some(CALLEE);
        let err = entry_parameter(&frame, unwinder, ParameterKind::DwarfReg(5)).err().unwrap();
        assert_eq!(
            no_entry_value_message(err),
            "DW_OP_entry_value resolving cannot find DW_TAG_call_site 0x2010"
        );

        // the call site calls someone else, so the caller tail called us
        let mut frame = FakeFrame::new(0x3008).with_caller(FakeFrame::new(CALLER_PC));
        frame.function_start = Some(0x3000);
        let err = entry_parameter(&frame, unwinder, ParameterKind::DwarfReg(5)).err().unwrap();
        assert_eq!(
            no_entry_value_message(err),
            "DW_OP_entry_value resolving expects callee at 0x1000 but the called frame is for 0x3000"
        );
    });
}

#[test]
fn self_tail_calls_have_no_entry_values() {
    let mut debug = debug_info();
    debug.tail_calls.insert(CALLEE, vec![call(0x1010, CALLEE)]);
    with_unwinder(&debug, |unwinder| {
        let frame = callee_frame();
        let err = entry_parameter(&frame, unwinder, ParameterKind::DwarfReg(5)).err().unwrap();
        assert!(no_entry_value_message(err).contains("can call itself via tail calls"));

        let expr = [DW_OP_entry_value, 1, DW_OP_reg0 + 5, DW_OP_stack_value];
        let value = evaluate_location(&frame, unwinder, &expr, Extent::whole(8)).unwrap();
        assert_eq!(value.location, ValueLocation::OptimizedOut);
    });

    // through another function
    let mut debug = debug_info();
    debug.functions.push((0x3000, 0x3100));
    debug.tail_calls.insert(CALLEE, vec![call(0x1010, 0x3000)]);
    debug.tail_calls.insert(0x3000, vec![call(0x3010, CALLEE)]);
    with_unwinder(&debug, |unwinder| {
        let err = verify_no_self_tail_call(unwinder, CALLEE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEntryValue);
        verify_no_self_tail_call(unwinder, 0x2000).unwrap();
    });

    // tail calls into unknown code cannot be followed
    let mut debug = debug_info();
    debug.tail_calls.insert(CALLEE, vec![call(0x1010, 0x9000)]);
    with_unwinder(&debug, |unwinder| {
        let err = verify_no_self_tail_call(unwinder, CALLEE).unwrap_err();
        assert_eq!(
            no_entry_value_message(err),
            "DW_TAG_call_site resolving failed to find function name for address 0x9000"
        );
    });
}

#[test]
fn call_site_targets() {
    let debug = FakeDebugInfo {
        symbols: BTreeMap::from([("callee", 0x1000)]),
        ..FakeDebugInfo::default()
    };
    with_unwinder(&debug, |unwinder| {
        let caller = FakeFrame::new(CALLER_PC).with_register(X86_64::RAX, 0x4000);
        let site = |target| CallSite {
            pc: CALLER_PC,
            target,
            parameters: Vec::new(),
        };

        let target = site(CallSiteTarget::PhysName("callee".into()));
        assert_eq!(call_site_to_target_addr(&target, None, unwinder).unwrap(), 0x1000);
        let target = site(CallSiteTarget::PhysName("nope".into()));
        assert_eq!(
            no_entry_value_message(call_site_to_target_addr(&target, None, unwinder).unwrap_err()),
            "Cannot find function \"nope\" for a call site target at 0x2005"
        );
        let target = site(CallSiteTarget::Unspecified);
        assert_eq!(
            call_site_to_target_addr(&target, Some(&caller), unwinder)
                .unwrap_err()
                .kind(),
            ErrorKind::NoEntryValue
        );

        // an indirect call through rax
        let target = site(CallSiteTarget::Block(vec![DW_OP_breg0, 0]));
        assert_eq!(
            call_site_to_target_addr(&target, Some(&caller), unwinder).unwrap(),
            0x4000
        );
        assert_eq!(
            call_site_to_target_addr(&target, None, unwinder)
                .unwrap_err()
                .kind(),
            ErrorKind::NoEntryValue
        );
        let target = site(CallSiteTarget::Block(vec![DW_OP_reg0]));
        assert_eq!(
            call_site_to_target_addr(&target, Some(&caller), unwinder).unwrap(),
            0x4000
        );
    });
}

const A: u64 = 0x1000;
const B: u64 = 0x2000;
const C: u64 = 0x3000;
const D: u64 = 0x4000;
const E: u64 = 0x6000;

/// `tail_calls` holds `(function, pc, target)` triples.
fn chain_debug_info(tail_calls: &[(u64, u64, u64)]) -> FakeDebugInfo {
    let mut debug = FakeDebugInfo {
        functions: [A, B, C, D, E, 0x5000]
            .iter()
            .map(|&start| (start, start + 0x100))
            .collect(),
        call_sites: vec![call(0x5005, A)],
        ..FakeDebugInfo::default()
    };
    for &(function, pc, target) in tail_calls {
        debug.tail_calls.entry(function).or_default().push(call(pc, target));
    }
    debug
}

fn pcs(chain: &super::CallSiteChain<'_>) -> Vec<u64> {
    chain.call_sites.iter().map(|site| site.pc).collect()
}

#[test]
fn tail_call_chains() {
    // main -> A -(tail)-> B -(tail)-> C
    let debug = chain_debug_info(&[(A, 0x1010, B), (B, 0x2010, C)]);
    with_unwinder(&debug, |unwinder| {
        let chain = find_chain(unwinder, 0x5005, 0x3004).unwrap().unwrap();
        assert_eq!(pcs(&chain), [0x1010, 0x2010]);
        assert_eq!((chain.callers, chain.callees), (2, 2));

        // a direct call
        let chain = find_chain(unwinder, 0x5005, 0x1004).unwrap().unwrap();
        assert!(chain.call_sites.is_empty());

        // no function at the callee pc
        assert_eq!(find_chain(unwinder, 0x5005, 0x9000).unwrap(), None);
        // no call site at the caller pc
        assert_eq!(find_chain(unwinder, 0x5010, 0x3004).unwrap(), None);
    });

    // A reaches C through either B or D
    let debug = chain_debug_info(&[(A, 0x1010, B), (A, 0x1020, D), (B, 0x2010, C), (D, 0x4010, C)]);
    with_unwinder(&debug, |unwinder| {
        assert_eq!(find_chain(unwinder, 0x5005, 0x3004).unwrap(), None);
    });

    // ... but both paths end in E -> C
    let debug = chain_debug_info(&[
        (A, 0x1010, B),
        (A, 0x1020, D),
        (B, 0x2010, E),
        (D, 0x4010, E),
        (E, 0x6010, C),
    ]);
    with_unwinder(&debug, |unwinder| {
        let chain = find_chain(unwinder, 0x5005, 0x3004).unwrap().unwrap();
        assert_eq!(pcs(&chain), [0x1010, 0x2010, 0x6010]);
        assert_eq!((chain.callers, chain.callees), (0, 1));
    });

    // a cycle that never reaches C
    let debug = chain_debug_info(&[(A, 0x1010, B), (B, 0x2010, A)]);
    with_unwinder(&debug, |unwinder| {
        assert_eq!(find_chain(unwinder, 0x5005, 0x3004).unwrap(), None);
    });
}
