//! Instruction handles and instruction records.

use std::cell::Cell;
use std::fmt;

use super::call::CallSite;
use super::guard::GuardRecord;
use super::opcode::{LOpcode, LTy, PayloadKind};

/// Handle to an instruction inside one [`LirBuffer`](super::LirBuffer).
///
/// Handles are plain indices tagged with the owning buffer's id so that a
/// handle from another function can be detected instead of silently
/// aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LIns {
    index: u32,
    buffer: u32,
}

impl LIns {
    pub(crate) const fn new(buffer: u32, index: u32) -> Self {
        Self { index, buffer }
    }

    /// Position in the owning buffer.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Id of the owning buffer.
    pub fn buffer_id(self) -> u32 {
        self.buffer
    }
}

impl fmt::Display for LIns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ins{}", self.index)
    }
}

/// Opcode-specific data attached to an instruction.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    None,
    ImmI(i32),
    ImmQ(i64),
    ImmD(f64),
    ImmF(f32),
    /// Byte displacement of a load or store.
    Disp(i32),
    /// Parameter position.
    Param(u8),
    /// Stack area size in bytes.
    Alloc(u32),
    /// Branch target label, filled in later for forward branches.
    Target(Option<LIns>),
    /// Jump table targets.
    Table(&'a [Cell<Option<LIns>>]),
    Call(&'a CallSite<'a>),
    Guard(&'a GuardRecord<'a>),
    Comment(&'a str),
}

impl Payload<'_> {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::None => PayloadKind::None,
            Payload::ImmI(_) | Payload::ImmQ(_) | Payload::ImmD(_) | Payload::ImmF(_) => {
                PayloadKind::Imm
            }
            Payload::Disp(_) => PayloadKind::Disp,
            Payload::Param(_) => PayloadKind::Param,
            Payload::Alloc(_) => PayloadKind::Alloc,
            Payload::Target(_) => PayloadKind::Target,
            Payload::Table(_) => PayloadKind::Table,
            Payload::Call(_) => PayloadKind::Call,
            Payload::Guard(_) => PayloadKind::Guard,
            Payload::Comment(_) => PayloadKind::Comment,
        }
    }

    /// Bit pattern of an immediate, used for hashing and identity tests.
    pub fn imm_bits(&self) -> u64 {
        match *self {
            Payload::ImmI(v) => v as u32 as u64,
            Payload::ImmQ(v) => v as u64,
            Payload::ImmD(v) => v.to_bits(),
            Payload::ImmF(v) => v.to_bits() as u64,
            Payload::Disp(d) => d as u32 as u64,
            Payload::Param(p) => p as u64,
            Payload::Alloc(s) => s as u64,
            _ => 0,
        }
    }

    /// Value type of an immediate payload.
    pub fn imm_type(&self) -> Option<LTy> {
        match self {
            Payload::ImmI(_) => Some(LTy::I),
            Payload::ImmQ(_) => Some(LTy::Q),
            Payload::ImmD(_) => Some(LTy::D),
            Payload::ImmF(_) => Some(LTy::F),
            _ => None,
        }
    }
}

/// One instruction: opcode, up to three operands and a payload.
#[derive(Debug, Clone, Copy)]
pub struct LInsData<'a> {
    pub opcode: LOpcode,
    pub operands: [Option<LIns>; 3],
    pub payload: Payload<'a>,
}

impl<'a> LInsData<'a> {
    pub fn new(opcode: LOpcode, operands: &[LIns], payload: Payload<'a>) -> Self {
        let mut slots = [None; 3];
        for (slot, &op) in slots.iter_mut().zip(operands) {
            *slot = Some(op);
        }
        Self {
            opcode,
            operands: slots,
            payload,
        }
    }

    pub fn op0(opcode: LOpcode) -> Self {
        Self::new(opcode, &[], Payload::None)
    }

    pub fn op1(opcode: LOpcode, a: LIns) -> Self {
        Self::new(opcode, &[a], Payload::None)
    }

    pub fn op2(opcode: LOpcode, a: LIns, b: LIns) -> Self {
        Self::new(opcode, &[a, b], Payload::None)
    }

    pub fn op3(opcode: LOpcode, a: LIns, b: LIns, c: LIns) -> Self {
        Self::new(opcode, &[a, b, c], Payload::None)
    }

    pub fn immi(v: i32) -> Self {
        Self::new(LOpcode::ImmI, &[], Payload::ImmI(v))
    }

    pub fn immq(v: i64) -> Self {
        Self::new(LOpcode::ImmQ, &[], Payload::ImmQ(v))
    }

    pub fn immd(v: f64) -> Self {
        Self::new(LOpcode::ImmD, &[], Payload::ImmD(v))
    }

    pub fn immf(v: f32) -> Self {
        Self::new(LOpcode::ImmF, &[], Payload::ImmF(v))
    }

    /// Operand at position `i`.
    pub fn oprnd(&self, i: usize) -> Option<LIns> {
        self.operands.get(i).copied().flatten()
    }

    /// Present operands, in order.
    pub fn operand_list(&self) -> impl Iterator<Item = LIns> + '_ {
        self.operands.iter().filter_map(|o| *o)
    }

    pub fn ret_type(&self) -> LTy {
        self.opcode.ret_type()
    }

    pub fn imm_i(&self) -> Option<i32> {
        match self.payload {
            Payload::ImmI(v) => Some(v),
            _ => None,
        }
    }

    pub fn disp(&self) -> i32 {
        match self.payload {
            Payload::Disp(d) => d,
            _ => 0,
        }
    }

    pub fn target(&self) -> Option<LIns> {
        match self.payload {
            Payload::Target(t) => t,
            _ => None,
        }
    }

    pub fn call_site(&self) -> Option<&'a CallSite<'a>> {
        match self.payload {
            Payload::Call(site) => Some(site),
            _ => None,
        }
    }

    pub fn guard(&self) -> Option<&'a GuardRecord<'a>> {
        match self.payload {
            Payload::Guard(g) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display_and_identity() {
        let a = LIns::new(3, 7);
        assert_eq!(a.to_string(), "ins7");
        assert_eq!(a.index(), 7);
        assert_eq!(a.buffer_id(), 3);
        assert_ne!(a, LIns::new(4, 7));
    }

    #[test]
    fn test_operand_packing() {
        let a = LIns::new(0, 1);
        let b = LIns::new(0, 2);
        let data = LInsData::op2(LOpcode::AddI, a, b);
        assert_eq!(data.oprnd(0), Some(a));
        assert_eq!(data.oprnd(1), Some(b));
        assert_eq!(data.oprnd(2), None);
        assert_eq!(data.operand_list().count(), 2);
        assert_eq!(data.ret_type(), LTy::I);
    }

    #[test]
    fn test_immediate_bits() {
        assert_eq!(LInsData::immi(-1).payload.imm_bits(), 0xffff_ffff);
        assert_eq!(LInsData::immq(-1).payload.imm_bits(), u64::MAX);
        assert_eq!(
            LInsData::immd(1.5).payload.imm_bits(),
            1.5f64.to_bits()
        );
        assert_ne!(
            LInsData::immd(0.0).payload.imm_bits(),
            LInsData::immd(-0.0).payload.imm_bits()
        );
        assert_eq!(LInsData::immf(2.0).payload.imm_type(), Some(LTy::F));
        assert_eq!(Payload::Disp(8).kind(), PayloadKind::Disp);
    }
}
