//! Integer, floating-point, comparison, conversion and select instructions,
//! executed natively with and without the optimizing writer stages.

#![cfg(all(target_arch = "x86_64", unix))]

use bumpalo::Bump;
use lirjit::{FunctionBuilder, JitConfig, JitContext, LIns};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build `name(a, b) -> i64` with `body` in both pipeline modes and check
/// each against `expected` over `inputs`.
fn check_binary_q<B, E>(name: &str, body: B, expected: E, inputs: &[(i64, i64)])
where
    B: for<'c, 'a> Fn(&mut FunctionBuilder<'c, 'a>, LIns, LIns) -> LIns,
    E: Fn(i64, i64) -> i64,
{
    for optimize in [false, true] {
        let arena = Bump::new();
        let mut jit = JitContext::new(&arena, JitConfig::default());
        let mut fb = jit.builder(name, optimize);
        let a = fb.insert_parameter().unwrap();
        let b = fb.insert_parameter().unwrap();
        let r = body(&mut fb, a, b);
        fb.retq(r);
        let entry = fb.finalize().unwrap().unwrap();
        let f: extern "C" fn(i64, i64) -> i64 = unsafe { entry.as_fn() };
        for &(x, y) in inputs {
            assert_eq!(
                f(x, y),
                expected(x, y),
                "{}({}, {}) optimize={}",
                name,
                x,
                y,
                optimize
            );
        }
    }
}

/// Same as [`check_binary_q`] for 32-bit operations on the low halves.
fn check_binary_i<B, E>(name: &str, body: B, expected: E, inputs: &[(i32, i32)])
where
    B: for<'c, 'a> Fn(&mut FunctionBuilder<'c, 'a>, LIns, LIns) -> LIns,
    E: Fn(i32, i32) -> i32,
{
    for optimize in [false, true] {
        let arena = Bump::new();
        let mut jit = JitContext::new(&arena, JitConfig::default());
        let mut fb = jit.builder(name, optimize);
        let a = fb.insert_parameter().unwrap();
        let b = fb.insert_parameter().unwrap();
        let a = fb.q2i(a);
        let b = fb.q2i(b);
        let r = body(&mut fb, a, b);
        fb.reti(r);
        let entry = fb.finalize().unwrap().unwrap();
        let f: extern "C" fn(i64, i64) -> i32 = unsafe { entry.as_fn() };
        for &(x, y) in inputs {
            assert_eq!(
                f(x as i64, y as i64),
                expected(x, y),
                "{}({}, {}) optimize={}",
                name,
                x,
                y,
                optimize
            );
        }
    }
}

const PAIRS_Q: &[(i64, i64)] = &[(0, 1), (7, 3), (-7, 3), (100, -9), (i64::MAX, 2), (-1, -1)];
const PAIRS_I: &[(i32, i32)] = &[(0, 1), (7, 3), (-7, 3), (100, -9), (i32::MAX, 2), (-1, -1)];

#[test]
fn test_int64_arithmetic() {
    init();
    check_binary_q("addq", |fb, a, b| fb.addq(a, b), |a, b| a.wrapping_add(b), PAIRS_Q);
    check_binary_q("subq", |fb, a, b| fb.subq(a, b), |a, b| a.wrapping_sub(b), PAIRS_Q);
    check_binary_q("mulq", |fb, a, b| fb.mulq(a, b), |a, b| a.wrapping_mul(b), PAIRS_Q);
    check_binary_q("andq", |fb, a, b| fb.andq(a, b), |a, b| a & b, PAIRS_Q);
    check_binary_q("orq", |fb, a, b| fb.orq(a, b), |a, b| a | b, PAIRS_Q);
    check_binary_q("xorq", |fb, a, b| fb.xorq(a, b), |a, b| a ^ b, PAIRS_Q);
    check_binary_q(
        "negnotq",
        |fb, a, b| {
            let n = fb.negq(a);
            let m = fb.notq(b);
            fb.addq(n, m)
        },
        |a, b| a.wrapping_neg().wrapping_add(!b),
        PAIRS_Q,
    );
}

#[test]
fn test_int32_arithmetic() {
    init();
    check_binary_i("addi", |fb, a, b| fb.addi(a, b), |a, b| a.wrapping_add(b), PAIRS_I);
    check_binary_i("subi", |fb, a, b| fb.subi(a, b), |a, b| a.wrapping_sub(b), PAIRS_I);
    check_binary_i("muli", |fb, a, b| fb.muli(a, b), |a, b| a.wrapping_mul(b), PAIRS_I);
    check_binary_i("andi", |fb, a, b| fb.andi(a, b), |a, b| a & b, PAIRS_I);
    check_binary_i("ori", |fb, a, b| fb.ori(a, b), |a, b| a | b, PAIRS_I);
    check_binary_i("xori", |fb, a, b| fb.xori(a, b), |a, b| a ^ b, PAIRS_I);
    check_binary_i(
        "negnoti",
        |fb, a, b| {
            let n = fb.negi(a);
            let m = fb.noti(b);
            fb.subi(n, m)
        },
        |a, b| a.wrapping_neg().wrapping_sub(!b),
        PAIRS_I,
    );
}

#[test]
fn test_division_and_remainder() {
    init();
    let pairs_q = [(7i64, 3i64), (-7, 3), (7, -3), (-7, -3), (1_000_000_000_000, 7)];
    check_binary_q("divq", |fb, a, b| fb.divq(a, b), |a, b| a / b, &pairs_q);
    check_binary_q("modq", |fb, a, b| fb.modq(a, b), |a, b| a % b, &pairs_q);

    let pairs_i = [(7i32, 3i32), (-7, 3), (7, -3), (-7, -3), (i32::MAX, 10)];
    check_binary_i("divi", |fb, a, b| fb.divi(a, b), |a, b| a / b, &pairs_i);
    check_binary_i("modi", |fb, a, b| fb.modi(a, b), |a, b| a % b, &pairs_i);

    // Both results of the same operands in one function.
    check_binary_q(
        "divmod",
        |fb, a, b| {
            let q = fb.divq(a, b);
            let r = fb.modq(a, b);
            let hundred = fb.immq(100);
            let q = fb.mulq(q, hundred);
            fb.addq(q, r)
        },
        |a, b| (a / b) * 100 + a % b,
        &pairs_q,
    );
}

#[test]
fn test_division_by_constant_zero_is_not_folded() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("div0", true);
    let a = fb.immi(10);
    let z = fb.immi(0);
    let q = fb.divi(a, z);
    fb.reti(q);
    // Compiles; executing it would trap like native code.
    assert!(fb.finalize().unwrap().is_some());
    assert_eq!(jit.stats().instruction_counts.get("divi"), Some(&1));
}

#[test]
fn test_shifts() {
    init();
    let pairs = [(1i64, 3i64), (-16, 2), (i64::MIN, 63), (12345, 0), (-1, 40)];
    check_binary_q(
        "lshq",
        |fb, a, b| {
            let b = fb.q2i(b);
            fb.lshq(a, b)
        },
        |a, b| a.wrapping_shl(b as u32),
        &pairs,
    );
    check_binary_q(
        "rshq",
        |fb, a, b| {
            let b = fb.q2i(b);
            fb.rshq(a, b)
        },
        |a, b| a.wrapping_shr(b as u32),
        &pairs,
    );
    check_binary_q(
        "rshuq",
        |fb, a, b| {
            let b = fb.q2i(b);
            fb.rshuq(a, b)
        },
        |a, b| ((a as u64).wrapping_shr(b as u32)) as i64,
        &pairs,
    );

    let pairs_i = [(1i32, 3i32), (-16, 2), (i32::MIN, 31), (12345, 0), (-1, 20)];
    check_binary_i("lshi", |fb, a, b| fb.lshi(a, b), |a, b| a.wrapping_shl(b as u32), &pairs_i);
    check_binary_i("rshi", |fb, a, b| fb.rshi(a, b), |a, b| a.wrapping_shr(b as u32), &pairs_i);
    check_binary_i(
        "rshui",
        |fb, a, b| fb.rshui(a, b),
        |a, b| ((a as u32).wrapping_shr(b as u32)) as i32,
        &pairs_i,
    );

    // Constant shift counts take the immediate form.
    check_binary_q(
        "shift_imm",
        |fb, a, _| {
            let k = fb.immi(5);
            let l = fb.lshq(a, k);
            fb.rshq(l, k)
        },
        |a, _| a.wrapping_shl(5).wrapping_shr(5),
        PAIRS_Q,
    );
}

#[test]
fn test_integer_identities_match_unoptimized() {
    init();
    check_binary_q(
        "identities",
        |fb, a, b| {
            let zero = fb.immq(0);
            let one = fb.immq(1);
            let minus_one = fb.immq(-1);
            let t = fb.addq(a, zero);
            let t = fb.mulq(t, one);
            let d = fb.subq(b, b);
            let t = fb.subq(t, d);
            let t = fb.andq(t, minus_one);
            let t = fb.orq(t, zero);
            let t = fb.xorq(t, zero);
            let t = fb.negq(t);
            let t = fb.negq(t);
            let four = fb.immq(4);
            let t = fb.mulq(t, four);
            let x = fb.xorq(b, b);
            fb.addq(t, x)
        },
        |a, _| a.wrapping_mul(4),
        PAIRS_Q,
    );

    check_binary_i(
        "compare_self",
        |fb, a, b| {
            let eq = fb.eqi(a, a);
            let lt = fb.lti(b, b);
            let ge = fb.geui(a, a);
            let s = fb.addi(eq, lt);
            fb.addi(s, ge)
        },
        |_, _| 2,
        PAIRS_I,
    );
}

#[test]
fn test_identities_are_simplified() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("simplified", true);
    let a = fb.insert_parameter().unwrap();
    let zero = fb.immq(0);
    let t = fb.addq(a, zero);
    assert_eq!(t, a);
    let one = fb.immq(1);
    let t = fb.mulq(t, one);
    assert_eq!(t, a);
    fb.retq(t);
    fb.finalize().unwrap();
    assert!(jit.stats().simplifications >= 2);
}

#[test]
fn test_cse_shares_pure_instructions() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("shared", true);
    let a = fb.insert_parameter().unwrap();
    let b = fb.insert_parameter().unwrap();
    let s1 = fb.addq(a, b);
    let s2 = fb.addq(a, b);
    assert_eq!(s1, s2);
    let r = fb.mulq(s1, s2);
    fb.retq(r);
    fb.finalize().unwrap();
    assert!(jit.stats().cse_hits >= 1);

    let f: extern "C" fn(i64, i64) -> i64 =
        unsafe { jit.function_by_name("shared").unwrap().as_fn() };
    assert_eq!(f(2, 3), 25);
}

#[test]
fn test_constant_folding() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("folded", true);
    let a = fb.immi(i32::MAX);
    let b = fb.immi(1);
    let s = fb.addi(a, b);
    assert_eq!(fb.buffer().get(s).imm_i(), Some(i32::MIN));
    fb.reti(s);
    let entry = fb.finalize().unwrap().unwrap();
    let f: extern "C" fn() -> i32 = unsafe { entry.as_fn() };
    assert_eq!(f(), i32::MIN);
}

#[test]
fn test_integer_comparisons() {
    init();
    let pairs = [(1i64, 2i64), (2, 1), (5, 5), (-1, 1), (i64::MIN, i64::MAX)];
    type Cmp = fn(i64, i64) -> bool;
    let cases: [(&str, Cmp); 9] = [
        ("eqq", |a, b| a == b),
        ("ltq", |a, b| a < b),
        ("gtq", |a, b| a > b),
        ("leq", |a, b| a <= b),
        ("geq", |a, b| a >= b),
        ("ltuq", |a, b| (a as u64) < (b as u64)),
        ("gtuq", |a, b| (a as u64) > (b as u64)),
        ("leuq", |a, b| (a as u64) <= (b as u64)),
        ("geuq", |a, b| (a as u64) >= (b as u64)),
    ];
    for (name, expected) in cases {
        check_binary_q(
            name,
            |fb, a, b| {
                let c = match name {
                    "eqq" => fb.eqq(a, b),
                    "ltq" => fb.ltq(a, b),
                    "gtq" => fb.gtq(a, b),
                    "leq" => fb.leq(a, b),
                    "geq" => fb.geq(a, b),
                    "ltuq" => fb.ltuq(a, b),
                    "gtuq" => fb.gtuq(a, b),
                    "leuq" => fb.leuq(a, b),
                    _ => fb.geuq(a, b),
                };
                fb.i2q(c)
            },
            |a, b| expected(a, b) as i64,
            &pairs,
        );
    }

    let pairs_i = [(1i32, 2i32), (2, 1), (5, 5), (-1, 1)];
    check_binary_i("lti", |fb, a, b| fb.lti(a, b), |a, b| (a < b) as i32, &pairs_i);
    check_binary_i("ltui", |fb, a, b| fb.ltui(a, b), |a, b| ((a as u32) < (b as u32)) as i32, &pairs_i);
    check_binary_i("gei", |fb, a, b| fb.gei(a, b), |a, b| (a >= b) as i32, &pairs_i);
}

#[test]
fn test_double_arithmetic_from_memory() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("poly", true);
    let p = fb.insert_parameter().unwrap();
    let x = fb.ldd(p, 0);
    let y = fb.ldd(p, 8);
    let s = fb.addd(x, y);
    let d = fb.subd(x, y);
    let m = fb.muld(s, d);
    let two = fb.immd(2.0);
    let q = fb.divd(m, two);
    let r = fb.negd(q);
    fb.retd(r);
    fb.finalize().unwrap();

    let f: extern "C" fn(*const f64) -> f64 = unsafe { jit.function_by_name("poly").unwrap().as_fn() };
    let input = [3.0f64, 1.5];
    assert_eq!(f(input.as_ptr()), -((3.0 + 1.5) * (3.0 - 1.5) / 2.0));
}

#[test]
fn test_float_arithmetic() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("floats", true);
    let p = fb.insert_parameter().unwrap();
    let x = fb.ldf(p, 0);
    let y = fb.ldf(p, 4);
    let s = fb.mulf(x, y);
    let h = fb.immf(0.5);
    let s = fb.addf(s, h);
    let s = fb.subf(s, y);
    let s = fb.divf(s, y);
    let s = fb.negf(s);
    fb.retf(s);
    fb.finalize().unwrap();

    let f: extern "C" fn(*const f32) -> f32 =
        unsafe { jit.function_by_name("floats").unwrap().as_fn() };
    let input = [3.0f32, 2.0];
    assert_eq!(f(input.as_ptr()), -(((3.0f32 * 2.0 + 0.5) - 2.0) / 2.0));
}

#[test]
fn test_nan_times_zero_is_not_folded() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("nan_mul", true);
    let p = fb.insert_parameter().unwrap();
    let x = fb.ldd(p, 0);
    let zero = fb.immd(0.0);
    let r = fb.muld(x, zero);
    assert_ne!(r, zero);
    fb.retd(r);
    fb.finalize().unwrap();

    let f: extern "C" fn(*const f64) -> f64 =
        unsafe { jit.function_by_name("nan_mul").unwrap().as_fn() };
    assert!(f(&f64::NAN).is_nan());
    assert_eq!(f(&3.0), 0.0);
    assert!(f(&-3.0).is_sign_negative());
}

#[test]
fn test_float_comparisons_with_nan() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("fcmp", true);
    let p = fb.insert_parameter().unwrap();
    let x = fb.ldd(p, 0);
    let y = fb.ldd(p, 8);
    // Pack the five relations into bits 0..4.
    let mut acc = fb.immi(0);
    let relations = [
        fb.eqd(x, y),
        fb.ltd(x, y),
        fb.gtd(x, y),
        fb.led(x, y),
        fb.ged(x, y),
    ];
    for (bit, rel) in relations.into_iter().enumerate() {
        let k = fb.immi(bit as i32);
        let shifted = fb.lshi(rel, k);
        acc = fb.ori(acc, shifted);
    }
    fb.reti(acc);
    fb.finalize().unwrap();

    let f: extern "C" fn(*const f64) -> i32 = unsafe { jit.function_by_name("fcmp").unwrap().as_fn() };
    let bits = |x: f64, y: f64| {
        (x == y) as i32
            | ((x < y) as i32) << 1
            | ((x > y) as i32) << 2
            | ((x <= y) as i32) << 3
            | ((x >= y) as i32) << 4
    };
    for (x, y) in [(1.0, 2.0), (2.0, 1.0), (1.5, 1.5), (f64::NAN, 1.0), (1.0, f64::NAN)] {
        assert_eq!(f([x, y].as_ptr()), bits(x, y), "fcmp({}, {})", x, y);
    }
}

#[test]
fn test_single_precision_comparisons() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());
    let mut fb = jit.builder("fcmpf", false);
    let p = fb.insert_parameter().unwrap();
    let x = fb.ldf(p, 0);
    let y = fb.ldf(p, 4);
    let lt = fb.ltf(x, y);
    let eq = fb.eqf(x, y);
    let two = fb.immi(2);
    let eq = fb.muli(eq, two);
    let r = fb.addi(lt, eq);
    fb.reti(r);
    fb.finalize().unwrap();

    let f: extern "C" fn(*const f32) -> i32 = unsafe { jit.function_by_name("fcmpf").unwrap().as_fn() };
    assert_eq!(f([1.0f32, 2.0].as_ptr()), 1);
    assert_eq!(f([2.0f32, 2.0].as_ptr()), 2);
    assert_eq!(f([f32::NAN, 2.0].as_ptr()), 0);
}

#[test]
fn test_conversions() {
    init();
    let arena = Bump::new();
    let mut jit = JitContext::new(&arena, JitConfig::default());

    let mut fb = jit.builder("i2d_d2i", true);
    let x = fb.insert_parameter().unwrap();
    let xi = fb.q2i(x);
    let d = fb.i2d(xi);
    let half = fb.immd(0.5);
    let d = fb.addd(d, half);
    let three = fb.immd(3.0);
    let d = fb.muld(d, three);
    let back = fb.d2q(d);
    fb.retq(back);
    fb.finalize().unwrap();

    let mut fb = jit.builder("unsigned", true);
    let x = fb.insert_parameter().unwrap();
    let xi = fb.q2i(x);
    let wide = fb.ui2uq(xi);
    let as_d = fb.ui2d(xi);
    let as_q = fb.d2q(as_d);
    let r = fb.subq(wide, as_q);
    let signed = fb.i2q(xi);
    let r = fb.addq(r, signed);
    fb.retq(r);
    fb.finalize().unwrap();

    let mut fb = jit.builder("singles", true);
    let x = fb.insert_parameter().unwrap();
    let xi = fb.q2i(x);
    let f = fb.i2f(xi);
    let d = fb.f2d(f);
    let third = fb.immd(1.0 / 3.0);
    let d = fb.muld(d, third);
    let f = fb.d2f(d);
    let u = fb.ui2f(xi);
    let f = fb.addf(f, u);
    let i = fb.f2i(f);
    fb.reti(i);
    fb.finalize().unwrap();

    let to_d: extern "C" fn(i64) -> i64 = unsafe { jit.function_by_name("i2d_d2i").unwrap().as_fn() };
    assert_eq!(to_d(3), 10); // (3 + 0.5) * 3 = 10.5, truncated
    assert_eq!(to_d(-3), -7);

    let unsigned: extern "C" fn(i64) -> i64 =
        unsafe { jit.function_by_name("unsigned").unwrap().as_fn() };
    assert_eq!(unsigned(-1), -1); // 0xffffffff - 4294967295.0 + (-1)
    assert_eq!(unsigned(7), 7);

    let singles: extern "C" fn(i64) -> i32 = unsafe { jit.function_by_name("singles").unwrap().as_fn() };
    assert_eq!(singles(9), 12);
}

#[test]
fn test_select() {
    init();
    check_binary_q(
        "maxq",
        |fb, a, b| {
            let c = fb.gtq(a, b);
            fb.cmovq(c, a, b)
        },
        |a, b| a.max(b),
        PAIRS_Q,
    );
    check_binary_i(
        "mini",
        |fb, a, b| {
            let c = fb.lti(a, b);
            fb.cmovi(c, a, b)
        },
        |a, b| a.min(b),
        PAIRS_I,
    );
    check_binary_q(
        "selectd",
        |fb, a, b| {
            let c = fb.ltq(a, b);
            let x = fb.immd(1.25);
            let y = fb.immd(-2.5);
            let d = fb.cmovd(c, x, y);
            let four = fb.immd(4.0);
            let d = fb.muld(d, four);
            fb.d2q(d)
        },
        |a, b| if a < b { 5 } else { -10 },
        PAIRS_Q,
    );
    check_binary_q(
        "selectf",
        |fb, a, b| {
            let c = fb.eqq(a, b);
            let x = fb.immf(3.0);
            let y = fb.immf(8.0);
            let f = fb.cmovf(c, x, y);
            let d = fb.f2d(f);
            fb.d2q(d)
        },
        |a, b| if a == b { 3 } else { 8 },
        PAIRS_Q,
    );
}
