// This module wraps the iced-x86 CodeAssembler as lirjit's machine-code emitter. X64Encoder
// converts AsmReg register references into iced registers of the right width and exposes
// one method per instruction form the assembler needs: integer moves, loads and stores of
// every width, two-address ALU operations with register or imm32 operands, shifts by CL or
// by an immediate, signed division, SETcc and CMOVcc, SSE scalar arithmetic, compares and
// conversions, and label-based jumps. Labels are created up front and bound where the LIR
// label sits; binding two labels at one position inserts a NOP because iced allows a single
// label per instruction. assemble() resolves all branches with iced's block encoder and
// reports the final offset of every bound label, which the assembler uses to locate guard
// exits. The frame helpers emit the fixed System V prologue and epilogue.

//! x86-64 instruction encoding using iced-x86.

use std::fmt;

use iced_x86::code_asm::{registers::cl, *};
use iced_x86::{BlockEncoderOptions, IcedError};

use crate::core::register_file::AsmReg;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// Label used before it was created, or bound twice.
    InvalidLabel,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidLabel => write!(f, "Invalid label"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

// ==== REGISTERS ====

pub const RAX: AsmReg = AsmReg::new(0, 0);
pub const RCX: AsmReg = AsmReg::new(0, 1);
pub const RDX: AsmReg = AsmReg::new(0, 2);
pub const RBX: AsmReg = AsmReg::new(0, 3);
pub const RSP: AsmReg = AsmReg::new(0, 4);
pub const RBP: AsmReg = AsmReg::new(0, 5);
pub const R11: AsmReg = AsmReg::new(0, 11);
pub const XMM0: AsmReg = AsmReg::new(1, 0);
pub const XMM15: AsmReg = AsmReg::new(1, 15);

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

fn to_gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP64_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn to_gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP32_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn to_gp16(reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP16_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn to_gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }
    GP8_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn to_xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
    if reg.bank != 1 {
        return Err(EncodingError::InvalidRegister);
    }
    XMM_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

// ==== OPERAND KINDS ====

/// Integer operation width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    S32,
    S64,
}

/// Scalar float width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSize {
    F32,
    F64,
}

/// Memory access width for integer loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    B8,
    B16,
    B32,
    B64,
}

/// Two-address integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Sar,
    Shr,
}

/// SSE scalar arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Condition codes for SETcc and Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    Np,
}

/// Handle for a jump target inside one encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Output of [`X64Encoder::assemble`].
#[derive(Debug)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    label_offsets: Vec<Option<u32>>,
}

impl AssembledCode {
    /// Byte offset of a bound label.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.label_offsets.get(label.0).copied().flatten()
    }
}

macro_rules! alu_dispatch {
    ($asm:expr, $op:expr, $a:expr, $b:expr) => {
        match $op {
            AluOp::Add => $asm.add($a, $b),
            AluOp::Sub => $asm.sub($a, $b),
            AluOp::And => $asm.and($a, $b),
            AluOp::Or => $asm.or($a, $b),
            AluOp::Xor => $asm.xor($a, $b),
            AluOp::Cmp => $asm.cmp($a, $b),
        }
    };
}

macro_rules! shift_dispatch {
    ($asm:expr, $op:expr, $a:expr, $b:expr) => {
        match $op {
            ShiftOp::Shl => $asm.shl($a, $b),
            ShiftOp::Sar => $asm.sar($a, $b),
            ShiftOp::Shr => $asm.shr($a, $b),
        }
    };
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Labels with a flag telling whether they have been bound.
    labels: Vec<(CodeLabel, bool)>,
    /// Instruction count at the most recent label binding.
    last_bound_at: Option<usize>,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64)?;
        Ok(Self {
            assembler,
            labels: Vec::new(),
            last_bound_at: None,
        })
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    // ==== LABELS ====

    /// Create a label that can be jumped to before it is bound.
    pub fn new_label(&mut self) -> Label {
        let label = self.assembler.create_label();
        self.labels.push((label, false));
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> Result<(), EncodingError> {
        let here = self.instruction_count();
        if self.last_bound_at == Some(here) {
            self.assembler.nop()?;
        }
        let entry = self.labels.get_mut(label.0).ok_or(EncodingError::InvalidLabel)?;
        if entry.1 {
            return Err(EncodingError::InvalidLabel);
        }
        self.assembler.set_label(&mut entry.0)?;
        entry.1 = true;
        self.last_bound_at = Some(self.assembler.instructions().len());
        Ok(())
    }

    fn code_label(&self, label: Label) -> Result<CodeLabel, EncodingError> {
        self.labels
            .get(label.0)
            .map(|(l, _)| *l)
            .ok_or(EncodingError::InvalidLabel)
    }

    // ==== INTEGER MOVES ====

    /// Register to register move. A 32-bit move zero-extends into the full register.
    pub fn mov_rr(&mut self, size: OpSize, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.mov(to_gp32(dst)?, to_gp32(src)?)?,
            OpSize::S64 => self.assembler.mov(to_gp64(dst)?, to_gp64(src)?)?,
        }
        Ok(())
    }

    pub fn mov_ri32(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        self.assembler.mov(to_gp32(dst)?, imm)?;
        Ok(())
    }

    pub fn mov_ri64(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        self.assembler.mov(to_gp64(dst)?, imm)?;
        Ok(())
    }

    /// Sign-extend a 32-bit register into a 64-bit one.
    pub fn movsxd(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.movsxd(to_gp64(dst)?, to_gp32(src)?)?;
        Ok(())
    }

    /// Zero-extend the low byte of `src` into the 32-bit `dst`.
    pub fn movzx_r8(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.movzx(to_gp32(dst)?, to_gp8(src)?)?;
        Ok(())
    }

    /// Integer load from `[base + disp]`. Narrow loads extend into 32 bits.
    pub fn load(
        &mut self,
        width: MemWidth,
        signed: bool,
        dst: AsmReg,
        base: AsmReg,
        disp: i32,
    ) -> Result<(), EncodingError> {
        let base = to_gp64(base)?;
        match (width, signed) {
            (MemWidth::B8, true) => self.assembler.movsx(to_gp32(dst)?, byte_ptr(base + disp))?,
            (MemWidth::B8, false) => self.assembler.movzx(to_gp32(dst)?, byte_ptr(base + disp))?,
            (MemWidth::B16, true) => self.assembler.movsx(to_gp32(dst)?, word_ptr(base + disp))?,
            (MemWidth::B16, false) => self.assembler.movzx(to_gp32(dst)?, word_ptr(base + disp))?,
            (MemWidth::B32, _) => self.assembler.mov(to_gp32(dst)?, dword_ptr(base + disp))?,
            (MemWidth::B64, _) => self.assembler.mov(to_gp64(dst)?, qword_ptr(base + disp))?,
        }
        Ok(())
    }

    /// Integer store of the low `width` bits of `src` to `[base + disp]`.
    pub fn store(
        &mut self,
        width: MemWidth,
        base: AsmReg,
        disp: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base = to_gp64(base)?;
        match width {
            MemWidth::B8 => self.assembler.mov(byte_ptr(base + disp), to_gp8(src)?)?,
            MemWidth::B16 => self.assembler.mov(word_ptr(base + disp), to_gp16(src)?)?,
            MemWidth::B32 => self.assembler.mov(dword_ptr(base + disp), to_gp32(src)?)?,
            MemWidth::B64 => self.assembler.mov(qword_ptr(base + disp), to_gp64(src)?)?,
        }
        Ok(())
    }

    /// `lea dst, [base + disp]`.
    pub fn lea(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        self.assembler.lea(to_gp64(dst)?, qword_ptr(to_gp64(base)? + disp))?;
        Ok(())
    }

    // ==== INTEGER ARITHMETIC ====

    /// `dst = dst op src`; `Cmp` only sets flags.
    pub fn alu_rr(
        &mut self,
        op: AluOp,
        size: OpSize,
        dst: AsmReg,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => alu_dispatch!(self.assembler, op, to_gp32(dst)?, to_gp32(src)?)?,
            OpSize::S64 => alu_dispatch!(self.assembler, op, to_gp64(dst)?, to_gp64(src)?)?,
        }
        Ok(())
    }

    /// `dst = dst op imm`; the 64-bit form sign-extends `imm`.
    pub fn alu_ri(
        &mut self,
        op: AluOp,
        size: OpSize,
        dst: AsmReg,
        imm: i32,
    ) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => alu_dispatch!(self.assembler, op, to_gp32(dst)?, imm)?,
            OpSize::S64 => alu_dispatch!(self.assembler, op, to_gp64(dst)?, imm)?,
        }
        Ok(())
    }

    pub fn imul_rr(&mut self, size: OpSize, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.imul_2(to_gp32(dst)?, to_gp32(src)?)?,
            OpSize::S64 => self.assembler.imul_2(to_gp64(dst)?, to_gp64(src)?)?,
        }
        Ok(())
    }

    /// `dst = src * imm`.
    pub fn imul_rri(
        &mut self,
        size: OpSize,
        dst: AsmReg,
        src: AsmReg,
        imm: i32,
    ) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.imul_3(to_gp32(dst)?, to_gp32(src)?, imm)?,
            OpSize::S64 => self.assembler.imul_3(to_gp64(dst)?, to_gp64(src)?, imm)?,
        }
        Ok(())
    }

    pub fn neg(&mut self, size: OpSize, dst: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.neg(to_gp32(dst)?)?,
            OpSize::S64 => self.assembler.neg(to_gp64(dst)?)?,
        }
        Ok(())
    }

    pub fn not(&mut self, size: OpSize, dst: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.not(to_gp32(dst)?)?,
            OpSize::S64 => self.assembler.not(to_gp64(dst)?)?,
        }
        Ok(())
    }

    /// Shift `dst` by CL.
    pub fn shift_cl(&mut self, op: ShiftOp, size: OpSize, dst: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => shift_dispatch!(self.assembler, op, to_gp32(dst)?, cl)?,
            OpSize::S64 => shift_dispatch!(self.assembler, op, to_gp64(dst)?, cl)?,
        }
        Ok(())
    }

    /// Shift `dst` by a constant, masked to the operand width as the hardware does.
    pub fn shift_ri(
        &mut self,
        op: ShiftOp,
        size: OpSize,
        dst: AsmReg,
        amount: u8,
    ) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => shift_dispatch!(self.assembler, op, to_gp32(dst)?, (amount & 31) as u32)?,
            OpSize::S64 => shift_dispatch!(self.assembler, op, to_gp64(dst)?, (amount & 63) as u32)?,
        }
        Ok(())
    }

    /// Sign-extend RAX/EAX into RDX:RAX or EDX:EAX, then divide by `divisor`.
    pub fn sign_extend_and_idiv(&mut self, size: OpSize, divisor: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => {
                self.assembler.cdq()?;
                self.assembler.idiv(to_gp32(divisor)?)?;
            }
            OpSize::S64 => {
                self.assembler.cqo()?;
                self.assembler.idiv(to_gp64(divisor)?)?;
            }
        }
        Ok(())
    }

    pub fn test_rr(&mut self, size: OpSize, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.test(to_gp32(a)?, to_gp32(b)?)?,
            OpSize::S64 => self.assembler.test(to_gp64(a)?, to_gp64(b)?)?,
        }
        Ok(())
    }

    /// Set the low byte of `dst` to the condition.
    pub fn setcc(&mut self, cond: Condition, dst: AsmReg) -> Result<(), EncodingError> {
        let r = to_gp8(dst)?;
        match cond {
            Condition::E => self.assembler.sete(r)?,
            Condition::Ne => self.assembler.setne(r)?,
            Condition::L => self.assembler.setl(r)?,
            Condition::Le => self.assembler.setle(r)?,
            Condition::G => self.assembler.setg(r)?,
            Condition::Ge => self.assembler.setge(r)?,
            Condition::B => self.assembler.setb(r)?,
            Condition::Be => self.assembler.setbe(r)?,
            Condition::A => self.assembler.seta(r)?,
            Condition::Ae => self.assembler.setae(r)?,
            Condition::Np => self.assembler.setnp(r)?,
        }
        Ok(())
    }

    /// `and dst8, src8`.
    pub fn and8(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.and(to_gp8(dst)?, to_gp8(src)?)?;
        Ok(())
    }

    /// `cmovne dst, src`.
    pub fn cmovne(&mut self, size: OpSize, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.cmovne(to_gp32(dst)?, to_gp32(src)?)?,
            OpSize::S64 => self.assembler.cmovne(to_gp64(dst)?, to_gp64(src)?)?,
        }
        Ok(())
    }

    // ==== SSE ====

    /// Full-register XMM copy.
    pub fn movaps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.movaps(to_xmm(dst)?, to_xmm(src)?)?;
        Ok(())
    }

    pub fn xorps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.xorps(to_xmm(dst)?, to_xmm(src)?)?;
        Ok(())
    }

    /// Scalar float load from `[base + disp]`.
    pub fn load_float(
        &mut self,
        size: FloatSize,
        dst: AsmReg,
        base: AsmReg,
        disp: i32,
    ) -> Result<(), EncodingError> {
        let base = to_gp64(base)?;
        match size {
            FloatSize::F32 => self.assembler.movss(to_xmm(dst)?, dword_ptr(base + disp))?,
            FloatSize::F64 => self.assembler.movsd_2(to_xmm(dst)?, qword_ptr(base + disp))?,
        }
        Ok(())
    }

    /// Scalar float store to `[base + disp]`.
    pub fn store_float(
        &mut self,
        size: FloatSize,
        base: AsmReg,
        disp: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base = to_gp64(base)?;
        match size {
            FloatSize::F32 => self.assembler.movss(dword_ptr(base + disp), to_xmm(src)?)?,
            FloatSize::F64 => self.assembler.movsd_2(qword_ptr(base + disp), to_xmm(src)?)?,
        }
        Ok(())
    }

    pub fn sse_arith(
        &mut self,
        op: SseOp,
        size: FloatSize,
        dst: AsmReg,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let (d, s) = (to_xmm(dst)?, to_xmm(src)?);
        match (op, size) {
            (SseOp::Add, FloatSize::F64) => self.assembler.addsd(d, s)?,
            (SseOp::Sub, FloatSize::F64) => self.assembler.subsd(d, s)?,
            (SseOp::Mul, FloatSize::F64) => self.assembler.mulsd(d, s)?,
            (SseOp::Div, FloatSize::F64) => self.assembler.divsd(d, s)?,
            (SseOp::Add, FloatSize::F32) => self.assembler.addss(d, s)?,
            (SseOp::Sub, FloatSize::F32) => self.assembler.subss(d, s)?,
            (SseOp::Mul, FloatSize::F32) => self.assembler.mulss(d, s)?,
            (SseOp::Div, FloatSize::F32) => self.assembler.divss(d, s)?,
        }
        Ok(())
    }

    /// Unordered compare; sets ZF, PF and CF.
    pub fn ucomis(&mut self, size: FloatSize, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        match size {
            FloatSize::F32 => self.assembler.ucomiss(to_xmm(a)?, to_xmm(b)?)?,
            FloatSize::F64 => self.assembler.ucomisd(to_xmm(a)?, to_xmm(b)?)?,
        }
        Ok(())
    }

    /// Signed integer to float.
    pub fn cvtsi2s(
        &mut self,
        to: FloatSize,
        from: OpSize,
        dst: AsmReg,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let d = to_xmm(dst)?;
        match (to, from) {
            (FloatSize::F64, OpSize::S32) => self.assembler.cvtsi2sd(d, to_gp32(src)?)?,
            (FloatSize::F64, OpSize::S64) => self.assembler.cvtsi2sd(d, to_gp64(src)?)?,
            (FloatSize::F32, OpSize::S32) => self.assembler.cvtsi2ss(d, to_gp32(src)?)?,
            (FloatSize::F32, OpSize::S64) => self.assembler.cvtsi2ss(d, to_gp64(src)?)?,
        }
        Ok(())
    }

    /// Float to signed integer, truncating toward zero.
    pub fn cvtts2si(
        &mut self,
        to: OpSize,
        from: FloatSize,
        dst: AsmReg,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let s = to_xmm(src)?;
        match (to, from) {
            (OpSize::S32, FloatSize::F64) => self.assembler.cvttsd2si(to_gp32(dst)?, s)?,
            (OpSize::S64, FloatSize::F64) => self.assembler.cvttsd2si(to_gp64(dst)?, s)?,
            (OpSize::S32, FloatSize::F32) => self.assembler.cvttss2si(to_gp32(dst)?, s)?,
            (OpSize::S64, FloatSize::F32) => self.assembler.cvttss2si(to_gp64(dst)?, s)?,
        }
        Ok(())
    }

    pub fn cvtss2sd(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.cvtss2sd(to_xmm(dst)?, to_xmm(src)?)?;
        Ok(())
    }

    pub fn cvtsd2ss(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.cvtsd2ss(to_xmm(dst)?, to_xmm(src)?)?;
        Ok(())
    }

    /// Move raw bits from a GP register into an XMM register.
    pub fn mov_gp_to_xmm(&mut self, size: OpSize, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match size {
            OpSize::S32 => self.assembler.movd(to_xmm(dst)?, to_gp32(src)?)?,
            OpSize::S64 => self.assembler.movq(to_xmm(dst)?, to_gp64(src)?)?,
        }
        Ok(())
    }

    // ==== CONTROL FLOW ====

    pub fn jmp(&mut self, label: Label) -> Result<(), EncodingError> {
        let target = self.code_label(label)?;
        self.assembler.jmp(target)?;
        Ok(())
    }

    pub fn jcc(&mut self, cond: Condition, label: Label) -> Result<(), EncodingError> {
        let t = self.code_label(label)?;
        match cond {
            Condition::E => self.assembler.je(t)?,
            Condition::Ne => self.assembler.jne(t)?,
            Condition::L => self.assembler.jl(t)?,
            Condition::Le => self.assembler.jle(t)?,
            Condition::G => self.assembler.jg(t)?,
            Condition::Ge => self.assembler.jge(t)?,
            Condition::B => self.assembler.jb(t)?,
            Condition::Be => self.assembler.jbe(t)?,
            Condition::A => self.assembler.ja(t)?,
            Condition::Ae => self.assembler.jae(t)?,
            Condition::Np => self.assembler.jnp(t)?,
        }
        Ok(())
    }

    /// Indirect call through a register.
    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.call(to_gp64(reg)?)?;
        Ok(())
    }

    pub fn push(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.push(to_gp64(reg)?)?;
        Ok(())
    }

    pub fn pop(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.pop(to_gp64(reg)?)?;
        Ok(())
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret()?;
        Ok(())
    }

    pub fn ud2(&mut self) -> Result<(), EncodingError> {
        self.assembler.ud2()?;
        Ok(())
    }

    // ==== FRAME ====

    /// `push rbp; mov rbp, rsp`, push `saved`, then reserve `frame_size` bytes.
    pub fn emit_prologue(&mut self, saved: &[AsmReg], frame_size: u32) -> Result<(), EncodingError> {
        self.push(RBP)?;
        self.mov_rr(OpSize::S64, RBP, RSP)?;
        for &reg in saved {
            self.push(reg)?;
        }
        if frame_size > 0 {
            let size = i32::try_from(frame_size).map_err(|_| EncodingError::UnsupportedInstruction)?;
            self.alu_ri(AluOp::Sub, OpSize::S64, RSP, size)?;
        }
        Ok(())
    }

    /// Restore rsp from rbp, pop `saved` in reverse, pop rbp and return.
    pub fn emit_epilogue(&mut self, saved: &[AsmReg]) -> Result<(), EncodingError> {
        let pushed = (saved.len() * 8) as i32;
        self.lea(RSP, RBP, -pushed)?;
        for &reg in saved.iter().rev() {
            self.pop(reg)?;
        }
        self.pop(RBP)?;
        self.ret()
    }

    // ==== OUTPUT ====

    /// Resolve branches and produce position-independent machine code.
    pub fn assemble(mut self) -> Result<AssembledCode, EncodingError> {
        if self.last_bound_at == Some(self.instruction_count()) {
            self.assembler.nop()?;
        }
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;

        let mut label_offsets = Vec::with_capacity(self.labels.len());
        for (label, bound) in &self.labels {
            let offset = if *bound {
                let ip = result.label_ip(label)?;
                Some(u32::try_from(ip).map_err(|_| EncodingError::UnsupportedInstruction)?)
            } else {
                None
            };
            label_offsets.push(offset);
        }

        Ok(AssembledCode {
            code: result.inner.code_buffer,
            label_offsets,
        })
    }
}
