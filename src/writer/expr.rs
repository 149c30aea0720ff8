// This module implements the algebraic simplification filter. It folds integer constants
// with the wrapping semantics of the target (division and remainder by zero and the
// MIN / -1 overflow are left to trap at run time), canonicalises constants to the right-hand
// side of commutative operations and applies integer identities such as x+0, x*1, x*2^k,
// x-x and compare-with-self. Instructions that read or produce floating-point values are
// passed through untouched: identities like x*0 == 0 do not hold for NaN or signed zero.

//! Algebraic simplification of integer instructions.

use super::{Downstream, LirFilter};
use crate::core::session::CompilationSession;
use crate::lir::{LIns, LInsData, LOpcode, LTy, LirBuffer, Payload};

/// Outcome of a rewrite.
enum Rewrite<'a> {
    /// The instruction is equivalent to an existing value.
    Existing(LIns),
    /// The instruction is replaced by a different one.
    New(LInsData<'a>),
}

/// Peephole filter for integer identities and constant folding.
#[derive(Debug, Default)]
pub struct ExprFilter {
    rewrites: usize,
}

impl ExprFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions rewritten so far.
    pub fn rewrites(&self) -> usize {
        self.rewrites
    }
}

impl<'a> LirFilter<'a> for ExprFilter {
    fn name(&self) -> &'static str {
        "expr"
    }

    fn ins(&mut self, mut data: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns {
        if !is_integer_op(data.opcode) {
            return out.ins(data);
        }
        match simplify(&mut data, out) {
            Some(Rewrite::Existing(ins)) => {
                self.rewrites += 1;
                log::trace!("expr: {} folded to {}", data.opcode, ins);
                ins
            }
            Some(Rewrite::New(replacement)) => {
                self.rewrites += 1;
                log::trace!("expr: {} rewritten as {}", data.opcode, replacement.opcode);
                out.ins(replacement)
            }
            None => out.ins(data),
        }
    }

    fn report(&self, session: &CompilationSession<'_>) {
        session.record_simplifications(self.rewrites);
    }
}

/// Pure, non-immediate, with integer result and integer operands only.
fn is_integer_op(op: LOpcode) -> bool {
    let info = op.info();
    op.is_cse_able()
        && !op.is_immediate()
        && info.ret.is_int()
        && info.operands.iter().all(|ty| ty.is_int())
}

fn int_const(buf: &LirBuffer<'_>, ins: LIns) -> Option<i64> {
    match buf.try_get(ins)?.payload {
        Payload::ImmI(v) => Some(v as i64),
        Payload::ImmQ(v) => Some(v),
        _ => None,
    }
}

fn imm<'a>(ty: LTy, value: i64) -> LInsData<'a> {
    match ty {
        LTy::I => LInsData::immi(value as i32),
        _ => LInsData::immq(value),
    }
}

fn simplify<'a>(data: &mut LInsData<'a>, out: &mut Downstream<'_, 'a>) -> Option<Rewrite<'a>> {
    match data.opcode.arity() {
        1 => simplify_unary(data, out.buffer()),
        2 => simplify_binary(data, out),
        3 => simplify_select(data, out.buffer()),
        _ => None,
    }
}

fn simplify_unary<'a>(data: &LInsData<'a>, buf: &LirBuffer<'a>) -> Option<Rewrite<'a>> {
    use LOpcode::*;
    let op = data.opcode;
    let x = data.oprnd(0)?;

    if let Some(c) = int_const(buf, x) {
        let folded = match op {
            NegI => LInsData::immi((c as i32).wrapping_neg()),
            NotI => LInsData::immi(!(c as i32)),
            NegQ => LInsData::immq(c.wrapping_neg()),
            NotQ => LInsData::immq(!c),
            I2Q => LInsData::immq(c as i32 as i64),
            UI2UQ => LInsData::immq(c as i32 as u32 as i64),
            Q2I => LInsData::immi(c as i32),
            _ => return None,
        };
        return Some(Rewrite::New(folded));
    }

    let inner = buf.get(x);
    match (op, inner.opcode) {
        (NegI, NegI) | (NotI, NotI) | (NegQ, NegQ) | (NotQ, NotQ) => {
            inner.oprnd(0).map(Rewrite::Existing)
        }
        (Q2I, I2Q) | (Q2I, UI2UQ) => inner.oprnd(0).map(Rewrite::Existing),
        _ => None,
    }
}

fn simplify_binary<'a>(data: &mut LInsData<'a>, out: &mut Downstream<'_, 'a>) -> Option<Rewrite<'a>> {
    use LOpcode::*;
    let op = data.opcode;
    let ty = op.ret_type();
    let mut a = data.oprnd(0)?;
    let mut b = data.oprnd(1)?;
    let mut ca = int_const(out.buffer(), a);
    let mut cb = int_const(out.buffer(), b);

    if op.is_commutative() && ca.is_some() && cb.is_none() {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut ca, &mut cb);
        data.operands = [Some(a), Some(b), None];
    }

    if let (Some(x), Some(y)) = (ca, cb) {
        if let Some(r) = fold_binary(op, x, y) {
            return Some(Rewrite::New(imm(ty, r)));
        }
    }

    if a == b {
        let same = match op {
            SubI | SubQ | XorI | XorQ => Some(Rewrite::New(imm(ty, 0))),
            AndI | AndQ | OrI | OrQ => Some(Rewrite::Existing(a)),
            EqI | LeI | GeI | LeUI | GeUI | EqQ | LeQ | GeQ | LeUQ | GeUQ => {
                Some(Rewrite::New(LInsData::immi(1)))
            }
            LtI | GtI | LtUI | GtUI | LtQ | GtQ | LtUQ | GtUQ => Some(Rewrite::New(LInsData::immi(0))),
            _ => None,
        };
        if same.is_some() {
            return same;
        }
    }

    if let Some(c) = cb {
        match (op, c) {
            (AddI | AddQ | SubI | SubQ | OrI | OrQ | XorI | XorQ, 0) => {
                return Some(Rewrite::Existing(a))
            }
            (LshI | LshQ | RshI | RshQ | RshUI | RshUQ, 0) => return Some(Rewrite::Existing(a)),
            (MulI | MulQ | AndI | AndQ, 0) => return Some(Rewrite::Existing(b)),
            (MulI | MulQ | DivI | DivQ, 1) => return Some(Rewrite::Existing(a)),
            (ModI | ModQ, 1) => return Some(Rewrite::New(imm(ty, 0))),
            (AndI | AndQ, -1) => return Some(Rewrite::Existing(a)),
            (OrI | OrQ, -1) => return Some(Rewrite::Existing(b)),
            (MulI | MulQ, c) if c > 1 && (c as u64).is_power_of_two() => {
                let shift = if op == MulI { LshI } else { LshQ };
                let k = out.ins(LInsData::immi(c.trailing_zeros() as i32));
                return Some(Rewrite::New(LInsData::op2(shift, a, k)));
            }
            _ => {}
        }
    }

    if ca == Some(0) {
        match op {
            SubI => return Some(Rewrite::New(LInsData::op1(NegI, b))),
            SubQ => return Some(Rewrite::New(LInsData::op1(NegQ, b))),
            LshI | LshQ | RshI | RshQ | RshUI | RshUQ => return Some(Rewrite::Existing(a)),
            _ => {}
        }
    }

    None
}

fn simplify_select<'a>(data: &LInsData<'a>, buf: &LirBuffer<'a>) -> Option<Rewrite<'a>> {
    let cond = data.oprnd(0)?;
    let iftrue = data.oprnd(1)?;
    let iffalse = data.oprnd(2)?;
    if let Some(c) = int_const(buf, cond) {
        return Some(Rewrite::Existing(if c != 0 { iftrue } else { iffalse }));
    }
    if iftrue == iffalse {
        return Some(Rewrite::Existing(iftrue));
    }
    None
}

/// Fold a binary integer operation on sign-extended constants.
///
/// Returns `None` for operations that must trap at run time.
fn fold_binary(op: LOpcode, a: i64, b: i64) -> Option<i64> {
    use LOpcode::*;
    let (a32, b32) = (a as i32, b as i32);
    let r = match op {
        AddI => a32.wrapping_add(b32) as i64,
        SubI => a32.wrapping_sub(b32) as i64,
        MulI => a32.wrapping_mul(b32) as i64,
        DivI => a32.checked_div(b32)? as i64,
        ModI => a32.checked_rem(b32)? as i64,
        AndI => (a32 & b32) as i64,
        OrI => (a32 | b32) as i64,
        XorI => (a32 ^ b32) as i64,
        LshI => a32.wrapping_shl(b32 as u32) as i64,
        RshI => a32.wrapping_shr(b32 as u32) as i64,
        RshUI => (a32 as u32).wrapping_shr(b32 as u32) as i32 as i64,

        AddQ => a.wrapping_add(b),
        SubQ => a.wrapping_sub(b),
        MulQ => a.wrapping_mul(b),
        DivQ => a.checked_div(b)?,
        ModQ => a.checked_rem(b)?,
        AndQ => a & b,
        OrQ => a | b,
        XorQ => a ^ b,
        LshQ => a.wrapping_shl(b32 as u32),
        RshQ => a.wrapping_shr(b32 as u32),
        RshUQ => (a as u64).wrapping_shr(b32 as u32) as i64,

        EqI => (a32 == b32) as i64,
        LtI => (a32 < b32) as i64,
        GtI => (a32 > b32) as i64,
        LeI => (a32 <= b32) as i64,
        GeI => (a32 >= b32) as i64,
        LtUI => ((a32 as u32) < (b32 as u32)) as i64,
        GtUI => ((a32 as u32) > (b32 as u32)) as i64,
        LeUI => ((a32 as u32) <= (b32 as u32)) as i64,
        GeUI => ((a32 as u32) >= (b32 as u32)) as i64,
        EqQ => (a == b) as i64,
        LtQ => (a < b) as i64,
        GtQ => (a > b) as i64,
        LeQ => (a <= b) as i64,
        GeQ => (a >= b) as i64,
        LtUQ => ((a as u64) < (b as u64)) as i64,
        GtUQ => ((a as u64) > (b as u64)) as i64,
        LeUQ => ((a as u64) <= (b as u64)) as i64,
        GeUQ => ((a as u64) >= (b as u64)) as i64,
        _ => return None,
    };
    Some(r)
}
