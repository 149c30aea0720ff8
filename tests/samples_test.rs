//! End-to-end tests for the small sample functions and the fragment registry.
//!
//! Every test builds functions, finalizes them and calls the generated code.

#![cfg(all(target_arch = "x86_64", unix))]

use bumpalo::Bump;
use lirjit::{AbiKind, ArgType, BuildError, JitConfig, JitContext, JitError, LOpcode, TypeSig};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_ret0() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("ret0", true);
    let zero = fb.immi(0);
    fb.reti(zero);
    let entry = fb.finalize().unwrap().expect("ret0 has an entry point");

    let f: extern "C" fn() -> i32 = unsafe { entry.as_fn() };
    assert_eq!(f(), 0);
    assert_eq!(jit.function_by_name("ret0"), Some(entry));
}

#[test]
fn test_add2() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("add2", true);
    let x = fb.insert_parameter().unwrap();
    let x = fb.q2i(x);
    let two = fb.immi(2);
    let sum = fb.addi(x, two);
    fb.reti(sum);
    fb.finalize().unwrap();

    let f: extern "C" fn(i64) -> i32 = unsafe { jit.function_by_name("add2").unwrap().as_fn() };
    assert_eq!(f(5), 7);
    assert_eq!(f(-2), 0);
}

#[test]
fn test_sum_of_two_parameters() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("sum", true);
    let x = fb.insert_parameter().unwrap();
    let y = fb.insert_parameter().unwrap();
    let sum = fb.addq(x, y);
    fb.retq(sum);
    fb.finalize().unwrap();

    let f: extern "C" fn(i64, i64) -> i64 = unsafe { jit.function_by_name("sum").unwrap().as_fn() };
    assert_eq!(f(100, 200), 300);
    assert_eq!(f(-7, 7), 0);
}

#[test]
fn test_mult() {
    init();
    for optimize in [false, true] {
        let arena = Bump::new();
        let mut jit = JitContext::new(&arena, JitConfig::default());

        let mut fb = jit.builder("mult", optimize);
        let x = fb.insert_parameter().unwrap();
        let y = fb.insert_parameter().unwrap();
        let product = fb.mulq(x, y);
        let eight = fb.immq(8);
        let scaled = fb.mulq(product, eight);
        fb.retq(scaled);
        fb.finalize().unwrap();

        let f: extern "C" fn(i64, i64) -> i64 =
            unsafe { jit.function_by_name("mult").unwrap().as_fn() };
        assert_eq!(f(100, 200), 160000, "optimize={}", optimize);
    }
}

#[test]
fn test_call_chain_between_fragments() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("sum", true);
    let x = fb.insert_parameter().unwrap();
    let y = fb.insert_parameter().unwrap();
    let s = fb.addq(x, y);
    fb.retq(s);
    fb.finalize().unwrap();

    let mut fb = jit.builder("double_sum", true);
    let x = fb.insert_parameter().unwrap();
    let y = fb.insert_parameter().unwrap();
    let s = fb.call("sum", LOpcode::CallQ, AbiKind::Cdecl, &[x, y]).unwrap();
    let t = fb.call("sum", LOpcode::CallQ, AbiKind::Cdecl, &[s, s]).unwrap();
    fb.retq(t);
    fb.finalize().unwrap();

    let f: extern "C" fn(i64, i64) -> i64 =
        unsafe { jit.function_by_name("double_sum").unwrap().as_fn() };
    assert_eq!(f(3, 4), 14);
    assert_eq!(jit.stats().total_calls, 2);
}

#[test]
fn test_fragment_signature_after_finalize() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("first", false);
    let x = fb.insert_parameter().unwrap();
    let _ = fb.insert_parameter().unwrap();
    let x = fb.q2d(x);
    fb.retd(x);
    fb.finalize().unwrap();

    let fragment = jit.fragment("first").unwrap();
    assert_eq!(fragment.return_type, Some(ArgType::D));
    assert_eq!(
        fragment.sig,
        TypeSig::new(ArgType::D, &[ArgType::Q, ArgType::Q])
    );
    assert!(fragment.is_callable());
    assert_eq!(fragment.exits.len(), 1);
}

#[test]
fn test_unknown_function_is_an_error() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("caller", true);
    let x = fb.immq(1);
    let err = fb
        .call("nowhere", LOpcode::CallQ, AbiKind::Cdecl, &[x])
        .unwrap_err();
    assert_eq!(err, BuildError::UnknownFunction { name: "nowhere".into() });
}

#[test]
fn test_self_call_is_not_callable() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("recurse", true);
    let err = fb.call("recurse", LOpcode::CallQ, AbiKind::Cdecl, &[]).unwrap_err();
    assert_eq!(err, BuildError::NotCallable { name: "recurse".into() });
}

#[test]
fn test_foreign_operand_rejected_without_validation() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default().with_validate(false));

    let foreign = {
        let mut other = jit.builder("other", false);
        other.immq(1);
        other.immq(2);
        other.immq(40)
    };

    let mut fb = jit.builder("f", false);
    let p = fb.insert_parameter().unwrap();
    fb.immq(5);
    let seven = fb.immq(7);
    // Same position as the foreign handle in its own buffer.
    assert_eq!(seven.index(), foreign.index());
    let before = fb.buffer().len();
    let sum = fb.addq(p, foreign);
    assert_eq!(sum, foreign);
    assert_eq!(fb.buffer().len(), before);
    fb.retq(p);

    match fb.finalize() {
        Err(JitError::Build(BuildError::ForeignInstruction { ins })) => assert_eq!(ins, foreign),
        other => panic!("expected ForeignInstruction, got {:?}", other),
    }
    assert!(jit.function_by_name("f").is_none());
    assert!(jit.fragment("f").is_none());
}

#[test]
fn test_abandoned_redefinition_keeps_old_entry() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("leaf", true);
    let v = fb.immq(11);
    fb.retq(v);
    let old = fb.finalize().unwrap().unwrap();

    {
        let mut fb = jit.builder("leaf", true);
        let v = fb.immq(12);
        fb.retq(v);
    }
    assert_eq!(jit.function_by_name("leaf"), Some(old));

    // Other functions still resolve the finalized version.
    let mut fb = jit.builder("caller", true);
    let r = fb.call("leaf", LOpcode::CallQ, AbiKind::Cdecl, &[]).unwrap();
    fb.retq(r);
    fb.finalize().unwrap();
    let f: extern "C" fn() -> i64 = unsafe { jit.function_by_name("caller").unwrap().as_fn() };
    assert_eq!(f(), 11);
}

#[test]
fn test_conflicting_return_types() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("confused", true);
    let c = fb.insert_parameter().unwrap();
    let c = fb.q2i(c);
    let branch = fb.jt(c, None);
    let one = fb.immi(1);
    fb.reti(one);
    let l = fb.label();
    fb.set_target(branch, l).unwrap();
    let two = fb.immq(2);
    fb.retq(two);

    assert_eq!(fb.finalize().unwrap(), None);
    assert!(jit.function_by_name("confused").is_none());
    let fragment = jit.fragment("confused").expect("fragment stays registered");
    assert!(fragment.buffer.is_some());
    assert!(fragment.code.is_none());

    // Calls to it are rejected rather than jumping to nothing.
    let mut fb = jit.builder("caller", true);
    let err = fb.call("confused", LOpcode::CallI, AbiKind::Cdecl, &[]).unwrap_err();
    assert_eq!(err, BuildError::NotCallable { name: "confused".into() });
}

#[test]
fn test_no_return_compiles_without_entry() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("sink", true);
    let p = fb.insert_parameter().unwrap();
    let v = fb.immq(42);
    fb.stq(v, p, 0);
    assert_eq!(fb.finalize().unwrap(), None);

    let fragment = jit.fragment("sink").unwrap();
    assert!(fragment.code.is_some());
    assert!(fragment.entry.is_none());
    assert_eq!(jit.stats().functions_compiled, 1);
}

#[test]
fn test_void_return_goes_through_exit_guard() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("store_and_leave", true);
    let p = fb.insert_parameter().unwrap();
    let v = fb.immq(7);
    fb.stq(v, p, 0);
    fb.ret();
    let entry = fb.finalize().unwrap().expect("void functions are callable");

    let mut cell: i64 = 0;
    let f: extern "C" fn(*mut i64) -> usize = unsafe { entry.as_fn() };
    let record = f(&mut cell);
    assert_eq!(cell, 7);

    let fragment = jit.fragment("store_and_leave").unwrap();
    assert_eq!(fragment.return_type, Some(ArgType::V));
    let guard = fragment.exits[0];
    assert_eq!(record, guard.record_address());
    let code = fragment.code.as_ref().unwrap();
    assert!(code.contains(guard.address.get().unwrap()));
    assert_eq!(
        guard.address.get().unwrap() - code.start() as usize,
        guard.code_offset.get().unwrap() as usize
    );
}

#[test]
fn test_redefinition_replaces_registry_entry() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("version", true);
    let one = fb.immi(1);
    fb.reti(one);
    let old = fb.finalize().unwrap().unwrap();

    let mut fb = jit.builder("version", true);
    let two = fb.immi(2);
    fb.reti(two);
    let new = fb.finalize().unwrap().unwrap();

    assert_ne!(old, new);
    assert_eq!(jit.function_by_name("version"), Some(new));
    assert_eq!(jit.registry().fragment_count(), 1);

    // Each function gets its own pages in the shared chunk.
    let page = jit.code_alloc().page_size();
    assert_eq!(jit.code_alloc().chunk_count(), 1);
    assert_ne!(old.addr() / page, new.addr() / page);

    // The old code stays allocated.
    let old_fn: extern "C" fn() -> i32 = unsafe { old.as_fn() };
    let new_fn: extern "C" fn() -> i32 = unsafe { new.as_fn() };
    assert_eq!(old_fn(), 1);
    assert_eq!(new_fn(), 2);
}

fn build_constant(jit: &mut JitContext<'_>, value: i64) {
    let mut fb = jit.builder("value", true);
    let v = fb.immq(value);
    fb.retq(v);
    fb.finalize().unwrap();
}

#[test]
fn test_independent_contexts() {
    init();
    let arena_a = Bump::new();
    let arena_b = Bump::new();
    let mut a = JitContext::new(&arena_a, JitConfig::default());
    let mut b = JitContext::new(&arena_b, JitConfig::default());
    build_constant(&mut a, 10);
    build_constant(&mut b, 20);

    let fa: extern "C" fn() -> i64 = unsafe { a.function_by_name("value").unwrap().as_fn() };
    let fb: extern "C" fn() -> i64 = unsafe { b.function_by_name("value").unwrap().as_fn() };
    assert_eq!(fa(), 10);
    assert_eq!(fb(), 20);
}

#[test]
fn test_verbose_context_compiles() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default().with_verbose(true));

    let mut fb = jit.builder("traced", true);
    fb.comment("x * 3 + 1");
    let x = fb.insert_parameter().unwrap();
    let three = fb.immq(3);
    let one = fb.immq(1);
    let m = fb.mulq(x, three);
    let r = fb.addq(m, one);
    fb.retq(r);
    fb.finalize().unwrap();

    let f: extern "C" fn(i64) -> i64 = unsafe { jit.function_by_name("traced").unwrap().as_fn() };
    assert_eq!(f(4), 13);
}
