// This module describes call targets. A CallInfo is the arena-resident descriptor of one
// callee: its name, native address, packed type signature, calling-convention tag and a
// summary of which memory it may touch. A CallSite pairs a descriptor with the argument
// handles of one call instruction. Arguments are kept in reverse source order inside the
// call site; consumers that need ABI order go through args_abi_order().

//! Call descriptors and packed type signatures.

use std::fmt;

use super::ins::LIns;
use super::opcode::LTy;

/// Maximum number of arguments of a call.
pub const MAX_ARGS: usize = 8;

/// Argument and return kinds used in type signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArgType {
    V = 0,
    I = 1,
    UI = 2,
    Q = 3,
    D = 4,
    F = 5,
}

impl ArgType {
    /// Pointer-sized argument.
    pub const P: ArgType = ArgType::Q;

    fn from_bits(bits: u32) -> Option<ArgType> {
        match bits {
            0 => Some(ArgType::V),
            1 => Some(ArgType::I),
            2 => Some(ArgType::UI),
            3 => Some(ArgType::Q),
            4 => Some(ArgType::D),
            5 => Some(ArgType::F),
            _ => None,
        }
    }

    pub fn from_lty(ty: LTy) -> ArgType {
        match ty {
            LTy::V => ArgType::V,
            LTy::I => ArgType::I,
            LTy::Q => ArgType::Q,
            LTy::D => ArgType::D,
            LTy::F => ArgType::F,
        }
    }

    pub fn to_lty(self) -> LTy {
        match self {
            ArgType::V => LTy::V,
            ArgType::I | ArgType::UI => LTy::I,
            ArgType::Q => LTy::Q,
            ArgType::D => LTy::D,
            ArgType::F => LTy::F,
        }
    }

    /// Kind as seen by the calling convention (signedness erased).
    fn abi_class(self) -> ArgType {
        match self {
            ArgType::UI => ArgType::I,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArgType::V => "void",
            ArgType::I => "int32",
            ArgType::UI => "uint32",
            ArgType::Q => "int64",
            ArgType::D => "float64",
            ArgType::F => "float32",
        }
    }
}

const KIND_BITS: u32 = 3;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;
const ARGC_SHIFT: u32 = KIND_BITS * (MAX_ARGS as u32 + 1);

/// Packed return kind plus argument kinds.
///
/// Bits 0..3 hold the return kind, argument `i` (source order) sits at
/// `3 * (i + 1)`, the argument count occupies the bits above the last
/// argument.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeSig(u32);

impl TypeSig {
    /// Build a signature. Returns `None` for more than [`MAX_ARGS`] arguments.
    pub fn new(ret: ArgType, args: &[ArgType]) -> Option<TypeSig> {
        if args.len() > MAX_ARGS {
            return None;
        }
        let mut bits = ret as u32;
        for (i, &arg) in args.iter().enumerate() {
            bits |= (arg as u32) << (KIND_BITS * (i as u32 + 1));
        }
        bits |= (args.len() as u32) << ARGC_SHIFT;
        Some(TypeSig(bits))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn ret(self) -> ArgType {
        ArgType::from_bits(self.0 & KIND_MASK).unwrap_or(ArgType::V)
    }

    pub fn arg_count(self) -> usize {
        (self.0 >> ARGC_SHIFT) as usize
    }

    /// Argument kind `i` in source order.
    pub fn arg(self, i: usize) -> Option<ArgType> {
        if i >= self.arg_count() {
            return None;
        }
        ArgType::from_bits((self.0 >> (KIND_BITS * (i as u32 + 1))) & KIND_MASK)
    }

    pub fn args(self) -> impl Iterator<Item = ArgType> {
        (0..self.arg_count()).filter_map(move |i| self.arg(i))
    }

    /// Same register/stack layout at the ABI boundary.
    pub fn abi_compatible(self, other: TypeSig) -> bool {
        self.arg_count() == other.arg_count()
            && self.ret().abi_class() == other.ret().abi_class()
            && self
                .args()
                .zip(other.args())
                .all(|(a, b)| a.abi_class() == b.abi_class())
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret().name())?;
        for (i, arg) in self.args().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg.name())?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeSig({})", self)
    }
}

/// Calling-convention tag. All four lower to System V on x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Cdecl,
    Fastcall,
    Stdcall,
    Thiscall,
}

impl fmt::Display for AbiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbiKind::Cdecl => "cdecl",
            AbiKind::Fastcall => "fastcall",
            AbiKind::Stdcall => "stdcall",
            AbiKind::Thiscall => "thiscall",
        };
        f.write_str(s)
    }
}

/// Which memory a callee may read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessSet(u8);

impl AccessSet {
    pub const NONE: AccessSet = AccessSet(0);
    pub const LOAD: AccessSet = AccessSet(1);
    pub const STORE: AccessSet = AccessSet(2);
    pub const ALL: AccessSet = AccessSet(3);

    pub fn may_load(self) -> bool {
        self.0 & Self::LOAD.0 != 0
    }

    pub fn may_store(self) -> bool {
        self.0 & Self::STORE.0 != 0
    }
}

impl fmt::Display for AccessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match (self.may_load(), self.may_store()) {
            (false, false) => "pure",
            (true, false) => "load",
            (false, true) => "store",
            (true, true) => "load store",
        };
        f.write_str(s)
    }
}

/// Descriptor of a call target.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo<'a> {
    pub name: &'a str,
    pub address: usize,
    pub sig: TypeSig,
    pub abi: AbiKind,
    /// Memory the callee may touch.
    pub access: AccessSet,
}

impl CallInfo<'_> {
    /// A callee that stores nothing has no effect besides its result, so a
    /// call whose result is unused is dead code.
    pub fn has_side_effects(&self) -> bool {
        self.access.may_store()
    }
}

/// One call instruction's target and arguments.
#[derive(Debug)]
pub struct CallSite<'a> {
    pub info: &'a CallInfo<'a>,
    /// Arguments in reverse source order.
    pub args: &'a [LIns],
}

impl<'a> CallSite<'a> {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Arguments in source (and ABI) order.
    pub fn args_abi_order(&self) -> impl Iterator<Item = LIns> + '_ {
        self.args.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_packing() {
        let sig = TypeSig::new(ArgType::I, &[ArgType::Q, ArgType::D, ArgType::F]).unwrap();
        assert_eq!(sig.ret(), ArgType::I);
        assert_eq!(sig.arg_count(), 3);
        assert_eq!(sig.arg(0), Some(ArgType::Q));
        assert_eq!(sig.arg(2), Some(ArgType::F));
        assert_eq!(sig.arg(3), None);
        assert_eq!(sig.to_string(), "int32 (int64, float64, float32)");
    }

    #[test]
    fn test_signature_limits() {
        let eight = [ArgType::Q; MAX_ARGS];
        let sig = TypeSig::new(ArgType::D, &eight).unwrap();
        assert_eq!(sig.arg_count(), 8);
        assert!(sig.args().all(|a| a == ArgType::Q));
        assert!(TypeSig::new(ArgType::V, &[ArgType::I; 9]).is_none());
        assert_eq!(TypeSig::new(ArgType::V, &[]).unwrap().to_string(), "void ()");
    }

    #[test]
    fn test_argument_order_matters() {
        let a = TypeSig::new(ArgType::Q, &[ArgType::I, ArgType::D]).unwrap();
        let b = TypeSig::new(ArgType::Q, &[ArgType::D, ArgType::I]).unwrap();
        assert_ne!(a, b);
        assert!(!a.abi_compatible(b));
    }

    #[test]
    fn test_unsigned_is_abi_compatible() {
        let signed = TypeSig::new(ArgType::I, &[ArgType::I]).unwrap();
        let unsigned = TypeSig::new(ArgType::UI, &[ArgType::UI]).unwrap();
        assert_ne!(signed, unsigned);
        assert!(signed.abi_compatible(unsigned));
    }

    #[test]
    fn test_call_site_order() {
        let info = CallInfo {
            name: "f",
            address: 0x1000,
            sig: TypeSig::new(ArgType::V, &[ArgType::Q, ArgType::Q]).unwrap(),
            abi: AbiKind::Cdecl,
            access: AccessSet::STORE,
        };
        let a = LIns::new(0, 1);
        let b = LIns::new(0, 2);
        let reversed = [b, a];
        let site = CallSite {
            info: &info,
            args: &reversed,
        };
        assert_eq!(site.args_abi_order().collect::<Vec<_>>(), vec![a, b]);
        assert!(info.has_side_effects());
    }

    #[test]
    fn test_access_summary() {
        assert!(!AccessSet::NONE.may_load() && !AccessSet::NONE.may_store());
        assert!(AccessSet::LOAD.may_load() && !AccessSet::LOAD.may_store());
        assert!(AccessSet::ALL.may_load() && AccessSet::ALL.may_store());
        assert_eq!(AccessSet::NONE.to_string(), "pure");
        assert_eq!(AccessSet::ALL.to_string(), "load store");
    }
}
