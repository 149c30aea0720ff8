//! LIR opcode table.
//!
//! Every opcode carries a static [`OpInfo`]: its printed name, result type,
//! operand types, which payload it expects and how the optimizer may treat
//! it. The validator, the CSE filter, dead-code elimination and the printer
//! all read this one table.

use std::fmt;

/// Result and operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LTy {
    /// No value.
    V,
    /// 32-bit integer.
    I,
    /// 64-bit integer.
    Q,
    /// 64-bit float.
    D,
    /// 32-bit float.
    F,
}

impl LTy {
    /// Pointers are 64-bit integers.
    pub const P: LTy = LTy::Q;

    pub fn is_float(self) -> bool {
        matches!(self, LTy::D | LTy::F)
    }

    pub fn is_int(self) -> bool {
        matches!(self, LTy::I | LTy::Q)
    }

    pub fn size_bytes(self) -> u32 {
        match self {
            LTy::V => 0,
            LTy::I | LTy::F => 4,
            LTy::Q | LTy::D => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LTy::V => "void",
            LTy::I => "int32",
            LTy::Q => "int64",
            LTy::D => "float64",
            LTy::F => "float32",
        }
    }
}

impl fmt::Display for LTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which payload variant an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    None,
    Imm,
    Disp,
    Param,
    Alloc,
    Target,
    Table,
    Call,
    Guard,
    Comment,
}

/// How the optimizer may treat an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Side-effect free: deduplicated by CSE, removed when unused.
    Pure,
    /// Reads memory: removed when unused, never deduplicated.
    Load,
    /// Reserves a stack area: removed when unused, never deduplicated.
    Alloc,
    /// Observable effect or control flow: always kept, in order.
    Effect,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub ret: LTy,
    pub operands: &'static [LTy],
    pub payload: PayloadKind,
    pub class: OpClass,
}

macro_rules! lir_opcodes {
    ($($variant:ident = $name:literal : $ret:ident [$($op:ident),*] $payload:ident $class:ident;)*) => {
        /// LIR opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum LOpcode {
            $($variant,)*
        }

        impl LOpcode {
            /// Every opcode, in table order.
            pub const ALL: &'static [LOpcode] = &[$(LOpcode::$variant,)*];

            pub const fn info(self) -> OpInfo {
                match self {
                    $(LOpcode::$variant => OpInfo {
                        name: $name,
                        ret: LTy::$ret,
                        operands: &[$(LTy::$op),*],
                        payload: PayloadKind::$payload,
                        class: OpClass::$class,
                    },)*
                }
            }
        }
    };
}

lir_opcodes! {
    // ==== STRUCTURE ====
    Start = "start": V [] None Effect;
    Param = "paramq": Q [] Param Effect;
    Label = "label": V [] None Effect;
    Comment = "comment": V [] Comment Effect;
    LiveI = "livei": V [I] None Effect;
    LiveQ = "liveq": V [Q] None Effect;
    LiveD = "lived": V [D] None Effect;
    LiveF = "livef": V [F] None Effect;
    Alloc = "allocp": Q [] Alloc Alloc;
    X = "x": V [] Guard Effect;

    // ==== IMMEDIATES ====
    ImmI = "immi": I [] Imm Pure;
    ImmQ = "immq": Q [] Imm Pure;
    ImmD = "immd": D [] Imm Pure;
    ImmF = "immf": F [] Imm Pure;

    // ==== LOADS (base pointer + displacement) ====
    LdC2I = "ldc2i": I [Q] Disp Load;
    LdUC2UI = "lduc2ui": I [Q] Disp Load;
    LdS2I = "lds2i": I [Q] Disp Load;
    LdUS2UI = "ldus2ui": I [Q] Disp Load;
    LdI = "ldi": I [Q] Disp Load;
    LdQ = "ldq": Q [Q] Disp Load;
    LdD = "ldd": D [Q] Disp Load;
    LdF = "ldf": F [Q] Disp Load;
    LdF2D = "ldf2d": D [Q] Disp Load;

    // ==== STORES (value, base pointer + displacement) ====
    StI2C = "sti2c": V [I, Q] Disp Effect;
    StI2S = "sti2s": V [I, Q] Disp Effect;
    StI = "sti": V [I, Q] Disp Effect;
    StQ = "stq": V [Q, Q] Disp Effect;
    StD = "std": V [D, Q] Disp Effect;
    StF = "stf": V [F, Q] Disp Effect;

    // ==== CALLS (arguments live in the call site) ====
    CallV = "callv": V [] Call Effect;
    CallI = "calli": I [] Call Effect;
    CallQ = "callq": Q [] Call Effect;
    CallD = "calld": D [] Call Effect;
    CallF = "callf": F [] Call Effect;

    // ==== CONTROL FLOW ====
    J = "j": V [] Target Effect;
    JT = "jt": V [I] Target Effect;
    JF = "jf": V [I] Target Effect;
    JTbl = "jtbl": V [I] Table Effect;
    RetI = "reti": V [I] None Effect;
    RetQ = "retq": V [Q] None Effect;
    RetD = "retd": V [D] None Effect;
    RetF = "retf": V [F] None Effect;

    // ==== INT32 ARITHMETIC ====
    AddI = "addi": I [I, I] None Pure;
    SubI = "subi": I [I, I] None Pure;
    MulI = "muli": I [I, I] None Pure;
    DivI = "divi": I [I, I] None Pure;
    ModI = "modi": I [I, I] None Pure;
    AndI = "andi": I [I, I] None Pure;
    OrI = "ori": I [I, I] None Pure;
    XorI = "xori": I [I, I] None Pure;
    LshI = "lshi": I [I, I] None Pure;
    RshI = "rshi": I [I, I] None Pure;
    RshUI = "rshui": I [I, I] None Pure;
    NegI = "negi": I [I] None Pure;
    NotI = "noti": I [I] None Pure;

    // ==== INT64 ARITHMETIC (shift counts are int32) ====
    AddQ = "addq": Q [Q, Q] None Pure;
    SubQ = "subq": Q [Q, Q] None Pure;
    MulQ = "mulq": Q [Q, Q] None Pure;
    DivQ = "divq": Q [Q, Q] None Pure;
    ModQ = "modq": Q [Q, Q] None Pure;
    AndQ = "andq": Q [Q, Q] None Pure;
    OrQ = "orq": Q [Q, Q] None Pure;
    XorQ = "xorq": Q [Q, Q] None Pure;
    LshQ = "lshq": Q [Q, I] None Pure;
    RshQ = "rshq": Q [Q, I] None Pure;
    RshUQ = "rshuq": Q [Q, I] None Pure;
    NegQ = "negq": Q [Q] None Pure;
    NotQ = "notq": Q [Q] None Pure;

    // ==== FLOAT ARITHMETIC ====
    AddD = "addd": D [D, D] None Pure;
    SubD = "subd": D [D, D] None Pure;
    MulD = "muld": D [D, D] None Pure;
    DivD = "divd": D [D, D] None Pure;
    NegD = "negd": D [D] None Pure;
    AddF = "addf": F [F, F] None Pure;
    SubF = "subf": F [F, F] None Pure;
    MulF = "mulf": F [F, F] None Pure;
    DivF = "divf": F [F, F] None Pure;
    NegF = "negf": F [F] None Pure;

    // ==== COMPARISONS (int32 0/1 result) ====
    EqI = "eqi": I [I, I] None Pure;
    LtI = "lti": I [I, I] None Pure;
    GtI = "gti": I [I, I] None Pure;
    LeI = "lei": I [I, I] None Pure;
    GeI = "gei": I [I, I] None Pure;
    LtUI = "ltui": I [I, I] None Pure;
    GtUI = "gtui": I [I, I] None Pure;
    LeUI = "leui": I [I, I] None Pure;
    GeUI = "geui": I [I, I] None Pure;
    EqQ = "eqq": I [Q, Q] None Pure;
    LtQ = "ltq": I [Q, Q] None Pure;
    GtQ = "gtq": I [Q, Q] None Pure;
    LeQ = "leq": I [Q, Q] None Pure;
    GeQ = "geq": I [Q, Q] None Pure;
    LtUQ = "ltuq": I [Q, Q] None Pure;
    GtUQ = "gtuq": I [Q, Q] None Pure;
    LeUQ = "leuq": I [Q, Q] None Pure;
    GeUQ = "geuq": I [Q, Q] None Pure;
    EqD = "eqd": I [D, D] None Pure;
    LtD = "ltd": I [D, D] None Pure;
    GtD = "gtd": I [D, D] None Pure;
    LeD = "led": I [D, D] None Pure;
    GeD = "ged": I [D, D] None Pure;
    EqF = "eqf": I [F, F] None Pure;
    LtF = "ltf": I [F, F] None Pure;
    GtF = "gtf": I [F, F] None Pure;
    LeF = "lef": I [F, F] None Pure;
    GeF = "gef": I [F, F] None Pure;

    // ==== CONVERSIONS ====
    I2Q = "i2q": Q [I] None Pure;
    UI2UQ = "ui2uq": Q [I] None Pure;
    Q2I = "q2i": I [Q] None Pure;
    I2D = "i2d": D [I] None Pure;
    UI2D = "ui2d": D [I] None Pure;
    Q2D = "q2d": D [Q] None Pure;
    D2I = "d2i": I [D] None Pure;
    D2Q = "d2q": Q [D] None Pure;
    I2F = "i2f": F [I] None Pure;
    UI2F = "ui2f": F [I] None Pure;
    F2D = "f2d": D [F] None Pure;
    D2F = "d2f": F [D] None Pure;
    F2I = "f2i": I [F] None Pure;

    // ==== SELECT (cond, iftrue, iffalse) ====
    CmovI = "cmovi": I [I, I, I] None Pure;
    CmovQ = "cmovq": Q [I, Q, Q] None Pure;
    CmovD = "cmovd": D [I, D, D] None Pure;
    CmovF = "cmovf": F [I, F, F] None Pure;
}

impl LOpcode {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Result type.
    pub fn ret_type(self) -> LTy {
        self.info().ret
    }

    pub fn arity(self) -> usize {
        self.info().operands.len()
    }

    /// Participates in common-subexpression elimination.
    pub fn is_cse_able(self) -> bool {
        self.info().class == OpClass::Pure
    }

    /// May be dropped when its result is never used.
    pub fn is_removable(self) -> bool {
        self.info().class != OpClass::Effect
    }

    pub fn is_immediate(self) -> bool {
        matches!(self, LOpcode::ImmI | LOpcode::ImmQ | LOpcode::ImmD | LOpcode::ImmF)
    }

    /// Branches with a single label target.
    pub fn is_branch(self) -> bool {
        matches!(self, LOpcode::J | LOpcode::JT | LOpcode::JF)
    }

    pub fn is_commutative(self) -> bool {
        use LOpcode::*;
        matches!(
            self,
            AddI | MulI | AndI | OrI | XorI | EqI | AddQ | MulQ | AndQ | OrQ | XorQ | EqQ | AddD
                | MulD | AddF | MulF | EqD | EqF
        )
    }
}

impl fmt::Display for LOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
