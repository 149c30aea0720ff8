// This module turns one finished LIR buffer into x86-64 machine code. A backward pre-pass
// removes unused side-effect-free instructions, counts the remaining uses of every value and
// checks that all branches point at labels. A forward pass then gives every value a home:
// immediates and stack-area addresses are rematerialised at each use, parameters beyond the
// sixth already live in the caller's frame, everything else gets an 8-byte slot below the
// saved registers. Code generation walks the buffer in order with a clock-based register
// file caching values in registers; a cached value is written to its home only when its
// register is taken for something else while uses remain, or at a control-flow boundary.
// Labels and calls start with an empty register file, branches write dirty registers back
// first, so every block entry sees all live values in their homes. Guards become exit stubs
// that load the guard record address into RAX and leave through the shared epilogue.

//! LIR to x86-64 code generation with local register allocation.

use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use super::calling_convention::{CCAssigner, CCAssignment, FunctionFrame, RegBank, SysVAssigner};
use super::encoder::{
    AluOp, Condition, FloatSize, Label, MemWidth, OpSize, ShiftOp, SseOp, X64Encoder, R11, RAX,
    RBP, RCX, RDX, RSP, XMM0, XMM15,
};
use crate::core::config::JitConfig;
use crate::core::error::AssemblerError;
use crate::core::register_file::{AsmReg, RegBitSet, RegisterFile};
use crate::core::session::CompilationSession;
use crate::core::value_assignment::{Remat, ValLocalIdx, ValueAssignment, ValueAssignmentManager};
use crate::lir::{CallSite, GuardRecord, LIns, LInsData, LOpcode, LTy, LirBuffer, Payload};

/// First caller-frame parameter slot, relative to rbp.
const STACK_PARAM_BASE: i32 = 16;

/// Machine code for one function plus where its guard exits landed.
#[derive(Debug)]
pub struct Assembly<'a> {
    pub code: Vec<u8>,
    /// Each guard with the byte offset of its exit stub.
    pub exits: Vec<(&'a GuardRecord<'a>, u32)>,
    /// Bytes reserved below the saved registers.
    pub frame_size: u32,
}

#[derive(Debug, Clone, Copy)]
enum Rhs {
    Imm(i32),
    Reg(AsmReg),
}

#[derive(Debug, Clone, Copy)]
enum FloatCmp {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Single-function code generator.
pub struct Assembler<'a, 'b> {
    buf: &'b LirBuffer<'a>,
    session: &'b CompilationSession<'a>,
    enc: X64Encoder,
    regs: RegisterFile,
    values: ValueAssignmentManager,
    frame: FunctionFrame<'a>,
    /// Instructions that survive dead-code elimination.
    live: Vec<bool>,
    /// Encoder label for each LIR label, by instruction index.
    labels: HashMap<usize, Label>,
    /// Registers locked for the instruction being emitted.
    pinned: Vec<AsmReg>,
    exits: Vec<(&'a GuardRecord<'a>, Label)>,
    epilogue: Label,
}

impl<'a, 'b> Assembler<'a, 'b> {
    /// Compile `buf` into position-independent machine code.
    pub fn compile(
        buf: &'b LirBuffer<'a>,
        config: &JitConfig,
        session: &'b CompilationSession<'a>,
    ) -> Result<Assembly<'a>, AssemblerError> {
        let mut enc = X64Encoder::new()?;
        let epilogue = enc.new_label();
        let cc = SysVAssigner::new();
        let regs = RegisterFile::new(16, 2, cc.get_ccinfo().allocatable_regs.clone());

        let mut asm = Assembler {
            buf,
            session,
            enc,
            regs,
            values: ValueAssignmentManager::new(buf.len()),
            frame: FunctionFrame::new(buf.arena()),
            live: vec![false; buf.len()],
            labels: HashMap::new(),
            pinned: Vec::new(),
            exits: Vec::new(),
            epilogue,
        };

        asm.analyze(config.max_frame_size)?;
        asm.emit_entry()?;
        for idx in 0..buf.len() {
            if asm.live[idx] {
                asm.emit(idx)?;
                asm.session.record_instruction_compiled(buf.at(idx).opcode.name());
            }
        }
        asm.emit_exit_path()?;
        asm.finish(config)
    }

    // ==== ANALYSIS ====

    fn analyze(&mut self, max_frame_size: u32) -> Result<(), AssemblerError> {
        let buf = self.buf;
        let n = buf.len();
        let mut uses = vec![0u32; n];

        for idx in (0..n).rev() {
            let data = buf.at(idx);
            if uses[idx] == 0 && is_removable(data) {
                continue;
            }
            self.live[idx] = true;
            for_each_use(data, |op| uses[op.index()] += 1);
        }

        for idx in 0..n {
            if !self.live[idx] {
                continue;
            }
            let data = buf.at(idx);
            let at = buf.handle(idx);
            match data.payload {
                Payload::Target(target) => self.check_target(at, target)?,
                Payload::Table(cells) => {
                    for cell in cells {
                        self.check_target(at, cell.get())?;
                    }
                }
                Payload::Call(site) => {
                    let mut cc = SysVAssigner::for_abi(site.info.abi);
                    for arg in site.args_abi_order() {
                        let mut slot = CCAssignment::for_type(buf.get(arg).ret_type());
                        cc.assign_arg(&mut slot);
                    }
                    self.frame.reserve_outgoing(cc.get_stack_size());
                }
                _ => {}
            }
            if data.opcode == LOpcode::Label {
                let label = self.enc.new_label();
                self.labels.insert(idx, label);
            }

            let ty = data.ret_type();
            if ty == LTy::V {
                continue;
            }
            let refs = uses[idx];
            let va = match data.payload {
                Payload::ImmI(v) => ValueAssignment::remat(ty, Remat::ImmI(v), refs),
                Payload::ImmQ(v) => ValueAssignment::remat(ty, Remat::ImmQ(v), refs),
                Payload::ImmD(v) => ValueAssignment::remat(ty, Remat::ImmD(v.to_bits()), refs),
                Payload::ImmF(v) => ValueAssignment::remat(ty, Remat::ImmF(v.to_bits()), refs),
                Payload::Alloc(size) => {
                    let offset = self.frame.allocate_area(size);
                    ValueAssignment::remat(ty, Remat::FrameAddr(offset), refs)
                }
                Payload::Param(i) if i as usize >= SysVAssigner::GP_ARG_REGS.len() => {
                    let slot = i as i32 - SysVAssigner::GP_ARG_REGS.len() as i32;
                    ValueAssignment::in_slot(ty, STACK_PARAM_BASE + 8 * slot, refs)
                }
                _ => ValueAssignment::in_slot(ty, self.frame.allocate_spill_slot(8), refs),
            };
            self.values.create_assignment(idx, va);
        }

        self.frame.calculate_frame_size();
        let required = self.frame.total_size();
        if required > max_frame_size {
            return Err(AssemblerError::StackFull {
                required,
                limit: max_frame_size,
            });
        }
        log::trace!(
            "{} live of {} instructions, frame {} bytes",
            self.live.iter().filter(|l| **l).count(),
            n,
            required
        );
        Ok(())
    }

    fn check_target(&self, at: LIns, target: Option<LIns>) -> Result<(), AssemblerError> {
        match target {
            Some(t) if self.buf.try_get(t).is_some_and(|d| d.opcode == LOpcode::Label) => Ok(()),
            _ => Err(AssemblerError::UnknownBranch { at }),
        }
    }

    fn label_of(&self, target: Option<LIns>, at: usize) -> Result<Label, AssemblerError> {
        target
            .and_then(|t| self.labels.get(&t.index()).copied())
            .ok_or(AssemblerError::UnknownBranch {
                at: self.buf.handle(at),
            })
    }

    // ==== VALUE TRACKING ====

    fn va(&self, idx: ValLocalIdx) -> Result<ValueAssignment, AssemblerError> {
        self.values
            .get(idx)
            .copied()
            .ok_or_else(|| AssemblerError::RegisterAllocation {
                reason: format!("ins{idx} has no value"),
            })
    }

    fn va_mut(&mut self, idx: ValLocalIdx) -> Result<&mut ValueAssignment, AssemblerError> {
        self.values
            .get_mut(idx)
            .ok_or_else(|| AssemblerError::RegisterAllocation {
                reason: format!("ins{idx} has no value"),
            })
    }

    fn load_home(&mut self, ty: LTy, offset: i32, reg: AsmReg) -> Result<(), AssemblerError> {
        match ty {
            LTy::I => self.enc.load(MemWidth::B32, false, reg, RBP, offset)?,
            LTy::Q => self.enc.load(MemWidth::B64, false, reg, RBP, offset)?,
            LTy::D => self.enc.load_float(FloatSize::F64, reg, RBP, offset)?,
            LTy::F => self.enc.load_float(FloatSize::F32, reg, RBP, offset)?,
            LTy::V => {}
        }
        Ok(())
    }

    fn store_to(&mut self, ty: LTy, base: AsmReg, offset: i32, reg: AsmReg) -> Result<(), AssemblerError> {
        match ty {
            LTy::I => self.enc.store(MemWidth::B32, base, offset, reg)?,
            LTy::Q => self.enc.store(MemWidth::B64, base, offset, reg)?,
            LTy::D => self.enc.store_float(FloatSize::F64, base, offset, reg)?,
            LTy::F => self.enc.store_float(FloatSize::F32, base, offset, reg)?,
            LTy::V => {}
        }
        Ok(())
    }

    /// Put the current value of `idx` into `reg` without registering it.
    fn fill(&mut self, idx: ValLocalIdx, reg: AsmReg) -> Result<(), AssemblerError> {
        let va = self.va(idx)?;
        if let Some(cached) = va.reg {
            if cached != reg {
                if va.ty.is_float() {
                    self.enc.movaps(reg, cached)?;
                } else {
                    self.enc.mov_rr(OpSize::S64, reg, cached)?;
                }
            }
            return Ok(());
        }
        match (va.remat, va.stack_offset()) {
            (Some(Remat::ImmI(v)), _) => self.enc.mov_ri32(reg, v)?,
            (Some(Remat::ImmQ(v)), _) => self.enc.mov_ri64(reg, v)?,
            (Some(Remat::ImmD(bits)), _) => {
                self.enc.mov_ri64(R11, bits as i64)?;
                self.enc.mov_gp_to_xmm(OpSize::S64, reg, R11)?;
            }
            (Some(Remat::ImmF(bits)), _) => {
                self.enc.mov_ri32(R11, bits as i32)?;
                self.enc.mov_gp_to_xmm(OpSize::S32, reg, R11)?;
            }
            (Some(Remat::FrameAddr(offset)), _) => self.enc.lea(reg, RBP, offset)?,
            (None, Some(offset)) => self.load_home(va.ty, offset, reg)?,
            (None, None) => {
                return Err(AssemblerError::RegisterAllocation {
                    reason: format!("ins{idx} has neither a home nor a constant"),
                })
            }
        }
        Ok(())
    }

    /// Write a register-cached value to its home if the home is stale.
    fn write_back(&mut self, idx: ValLocalIdx, reg: AsmReg) -> Result<(), AssemblerError> {
        let va = self.va(idx)?;
        if va.needs_writeback() {
            if let Some(offset) = va.stack_offset() {
                self.store_to(va.ty, RBP, offset, reg)?;
                self.session.record_spill_generated();
            }
        }
        self.va_mut(idx)?.modified = false;
        Ok(())
    }

    fn alloc_reg(
        &mut self,
        ty: LTy,
        idx: ValLocalIdx,
        exclude: &RegBitSet,
    ) -> Result<AsmReg, AssemblerError> {
        let bank = RegBank::for_type(ty).index();
        let alloc = self.regs.allocate_reg(bank, idx, Some(exclude))?;
        if let Some(evicted) = alloc.evicted {
            self.write_back(evicted.local_idx, alloc.reg)?;
            self.va_mut(evicted.local_idx)?.reg = None;
        }
        self.session.record_register_allocated();
        Ok(alloc.reg)
    }

    /// Empty a specific register, writing its value back if needed.
    fn evict(&mut self, reg: AsmReg) -> Result<(), AssemblerError> {
        if let Some(owner) = self.regs.get_assignment(reg) {
            self.write_back(owner.local_idx, reg)?;
            self.va_mut(owner.local_idx)?.reg = None;
            self.regs.free_register(reg)?;
        }
        Ok(())
    }

    /// Register holding operand `ins`, locked until [`Self::finish_uses`].
    fn use_reg(&mut self, ins: LIns, exclude: &RegBitSet) -> Result<AsmReg, AssemblerError> {
        let idx = ins.index();
        let va = self.va(idx)?;
        let reg = match va.reg {
            Some(reg) => reg,
            None => {
                let reg = self.alloc_reg(va.ty, idx, exclude)?;
                self.fill(idx, reg)?;
                let va = self.va_mut(idx)?;
                va.reg = Some(reg);
                va.modified = false;
                reg
            }
        };
        self.regs.lock_register(reg)?;
        self.pinned.push(reg);
        Ok(reg)
    }

    fn use_any(&mut self, ins: LIns) -> Result<AsmReg, AssemblerError> {
        self.use_reg(ins, &RegBitSet::new())
    }

    /// Unlock this instruction's operands and retire one use of each.
    fn finish_uses(&mut self, ops: &[LIns]) -> Result<(), AssemblerError> {
        for reg in std::mem::take(&mut self.pinned) {
            self.regs.unlock_register(reg)?;
        }
        for op in ops {
            if let Some(reg) = self.values.consume(op.index()) {
                self.regs.free_register(reg)?;
            }
        }
        Ok(())
    }

    /// Register for the result of `idx`.
    fn def_reg(&mut self, idx: ValLocalIdx, exclude: &RegBitSet) -> Result<AsmReg, AssemblerError> {
        let ty = self.va(idx)?.ty;
        self.alloc_reg(ty, idx, exclude)
    }

    /// Record that `reg` now holds the freshly computed value of `idx`.
    fn define(&mut self, idx: ValLocalIdx, reg: AsmReg) -> Result<(), AssemblerError> {
        let va = self.va_mut(idx)?;
        if va.references_left == 0 {
            va.reg = None;
            va.modified = false;
            self.regs.free_register(reg)?;
        } else {
            va.reg = Some(reg);
            va.modified = true;
        }
        Ok(())
    }

    /// Write every dirty register back; registers stay valid.
    fn sync_all(&mut self) -> Result<(), AssemblerError> {
        for (reg, owner) in self.regs.occupied() {
            self.write_back(owner.local_idx, reg)?;
        }
        Ok(())
    }

    /// Forget all register contents. Homes must be current.
    fn clear_all(&mut self) -> Result<(), AssemblerError> {
        for (_, owner) in self.regs.occupied() {
            let va = self.va_mut(owner.local_idx)?;
            va.reg = None;
            va.modified = false;
        }
        self.regs.reset();
        Ok(())
    }

    fn imm32_of(&self, ins: LIns) -> Option<i32> {
        match self.buf.get(ins).payload {
            Payload::ImmI(v) => Some(v),
            Payload::ImmQ(v) => i32::try_from(v).ok(),
            _ => None,
        }
    }

    // ==== FUNCTION ENTRY AND EXIT ====

    fn emit_entry(&mut self) -> Result<(), AssemblerError> {
        let saved: Vec<AsmReg> = self.frame.saved_registers.iter().copied().collect();
        self.enc.emit_prologue(&saved, self.frame.frame_size)?;

        let buf = self.buf;
        for param in buf.params() {
            let Payload::Param(i) = buf.get(param).payload else {
                continue;
            };
            let Some(&arg_reg) = SysVAssigner::GP_ARG_REGS.get(i as usize) else {
                continue;
            };
            let Some(va) = self.values.get(param.index()).copied() else {
                continue;
            };
            if let Some(offset) = va.stack_offset() {
                self.store_to(LTy::Q, RBP, offset, arg_reg)?;
            }
        }
        Ok(())
    }

    fn emit_exit_path(&mut self) -> Result<(), AssemblerError> {
        self.enc.bind(self.epilogue)?;
        let saved: Vec<AsmReg> = self.frame.saved_registers.iter().copied().collect();
        self.enc.emit_epilogue(&saved)?;
        Ok(())
    }

    fn finish(self, config: &JitConfig) -> Result<Assembly<'a>, AssemblerError> {
        let frame_size = self.frame.frame_size;
        let exits = self.exits;
        let assembled = self.enc.assemble()?;

        if assembled.code.len() > i32::MAX as usize {
            return Err(AssemblerError::BranchTooFar {
                size: assembled.code.len(),
            });
        }

        let mut placed = Vec::with_capacity(exits.len());
        for (guard, label) in exits {
            let offset = assembled
                .label_offset(label)
                .ok_or(super::encoder::EncodingError::InvalidLabel)?;
            placed.push((guard, offset));
        }

        if config.verbose && log::log_enabled!(log::Level::Debug) {
            log_disassembly(&assembled.code);
        }

        Ok(Assembly {
            code: assembled.code,
            exits: placed,
            frame_size,
        })
    }

    // ==== INSTRUCTION SELECTION ====

    fn emit(&mut self, idx: usize) -> Result<(), AssemblerError> {
        use LOpcode::*;

        let buf = self.buf;
        let data = buf.at(idx);

        match data.opcode {
            Start | Param | Comment | Alloc | ImmI | ImmQ | ImmD | ImmF => Ok(()),
            LiveI | LiveQ | LiveD | LiveF => self.finish_uses(&operands(data)),

            Label => {
                self.sync_all()?;
                self.clear_all()?;
                let label = self.label_of(Some(buf.handle(idx)), idx)?;
                self.enc.bind(label)?;
                Ok(())
            }
            X => self.emit_guard_exit(data),

            LdC2I | LdUC2UI | LdS2I | LdUS2UI | LdI | LdQ | LdD | LdF | LdF2D => {
                self.emit_load(idx, data)
            }
            StI2C | StI2S | StI | StQ | StD | StF => self.emit_store(data),

            CallV | CallI | CallQ | CallD | CallF => match data.call_site() {
                Some(site) => self.emit_call(idx, site),
                None => Err(AssemblerError::RegisterAllocation {
                    reason: format!("ins{idx} is a call without a call site"),
                }),
            },

            J => {
                let target = self.label_of(data.target(), idx)?;
                self.sync_all()?;
                self.enc.jmp(target)?;
                self.clear_all()
            }
            JT | JF => {
                let target = self.label_of(data.target(), idx)?;
                let ops = operands(data);
                let cond = self.use_any(ops[0])?;
                self.sync_all()?;
                self.enc.test_rr(OpSize::S32, cond, cond)?;
                let cc = if data.opcode == JT { Condition::Ne } else { Condition::E };
                self.enc.jcc(cc, target)?;
                self.finish_uses(&ops)
            }
            JTbl => self.emit_table(idx, data),
            RetI | RetQ | RetD | RetF => self.emit_return(data),

            AddI | SubI | AndI | OrI | XorI => {
                self.emit_alu(idx, alu_op(data.opcode), OpSize::S32, &operands(data))
            }
            AddQ | SubQ | AndQ | OrQ | XorQ => {
                self.emit_alu(idx, alu_op(data.opcode), OpSize::S64, &operands(data))
            }
            MulI => self.emit_mul(idx, OpSize::S32, &operands(data)),
            MulQ => self.emit_mul(idx, OpSize::S64, &operands(data)),
            DivI => self.emit_div(idx, OpSize::S32, false, &operands(data)),
            ModI => self.emit_div(idx, OpSize::S32, true, &operands(data)),
            DivQ => self.emit_div(idx, OpSize::S64, false, &operands(data)),
            ModQ => self.emit_div(idx, OpSize::S64, true, &operands(data)),
            LshI => self.emit_shift(idx, ShiftOp::Shl, OpSize::S32, &operands(data)),
            RshI => self.emit_shift(idx, ShiftOp::Sar, OpSize::S32, &operands(data)),
            RshUI => self.emit_shift(idx, ShiftOp::Shr, OpSize::S32, &operands(data)),
            LshQ => self.emit_shift(idx, ShiftOp::Shl, OpSize::S64, &operands(data)),
            RshQ => self.emit_shift(idx, ShiftOp::Sar, OpSize::S64, &operands(data)),
            RshUQ => self.emit_shift(idx, ShiftOp::Shr, OpSize::S64, &operands(data)),
            NegI | NotI | NegQ | NotQ => self.emit_unary(idx, data),

            AddD | SubD | MulD | DivD => {
                self.emit_sse(idx, sse_op(data.opcode), FloatSize::F64, &operands(data))
            }
            AddF | SubF | MulF | DivF => {
                self.emit_sse(idx, sse_op(data.opcode), FloatSize::F32, &operands(data))
            }
            NegD => self.emit_fneg(idx, FloatSize::F64, &operands(data)),
            NegF => self.emit_fneg(idx, FloatSize::F32, &operands(data)),

            EqI | LtI | GtI | LeI | GeI | LtUI | GtUI | LeUI | GeUI => {
                self.emit_icmp(idx, int_cond(data.opcode), OpSize::S32, &operands(data))
            }
            EqQ | LtQ | GtQ | LeQ | GeQ | LtUQ | GtUQ | LeUQ | GeUQ => {
                self.emit_icmp(idx, int_cond(data.opcode), OpSize::S64, &operands(data))
            }
            EqD | LtD | GtD | LeD | GeD => {
                self.emit_fcmp(idx, float_cmp(data.opcode), FloatSize::F64, &operands(data))
            }
            EqF | LtF | GtF | LeF | GeF => {
                self.emit_fcmp(idx, float_cmp(data.opcode), FloatSize::F32, &operands(data))
            }

            I2Q | UI2UQ | Q2I | I2D | UI2D | Q2D | D2I | D2Q | I2F | UI2F | F2D | D2F | F2I => {
                self.emit_convert(idx, data.opcode, &operands(data))
            }

            CmovI | CmovQ | CmovD | CmovF => self.emit_cmov(idx, data.ret_type(), &operands(data)),
        }
    }

    /// Right-hand operand: an imm32 when the value is a small constant.
    fn use_rhs(&mut self, ins: LIns) -> Result<Rhs, AssemblerError> {
        match self.imm32_of(ins) {
            Some(k) => Ok(Rhs::Imm(k)),
            None => Ok(Rhs::Reg(self.use_any(ins)?)),
        }
    }

    fn emit_alu(
        &mut self,
        idx: usize,
        op: AluOp,
        size: OpSize,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        let rhs = self.use_rhs(ops[1])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        self.enc.mov_rr(size, rd, ra)?;
        match rhs {
            Rhs::Imm(k) => self.enc.alu_ri(op, size, rd, k)?,
            Rhs::Reg(rb) => self.enc.alu_rr(op, size, rd, rb)?,
        }
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_mul(&mut self, idx: usize, size: OpSize, ops: &[LIns]) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        if let Some(k) = self.imm32_of(ops[1]) {
            let rd = self.def_reg(idx, &RegBitSet::new())?;
            self.enc.imul_rri(size, rd, ra, k)?;
            self.finish_uses(ops)?;
            return self.define(idx, rd);
        }
        let rb = self.use_any(ops[1])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        self.enc.mov_rr(size, rd, ra)?;
        self.enc.imul_rr(size, rd, rb)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    /// Signed division through RDX:RAX.
    fn emit_div(
        &mut self,
        idx: usize,
        size: OpSize,
        remainder: bool,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        self.evict(RAX)?;
        self.evict(RDX)?;
        let fixed = RegBitSet::from_regs(&[RAX, RDX]);
        let ra = self.use_reg(ops[0], &fixed)?;
        let rb = self.use_reg(ops[1], &fixed)?;
        self.enc.mov_rr(size, RAX, ra)?;
        self.enc.sign_extend_and_idiv(size, rb)?;
        self.finish_uses(ops)?;

        let result = if remainder { RDX } else { RAX };
        self.regs.assign_specific(result, idx)?;
        self.session.record_register_allocated();
        self.define(idx, result)
    }

    fn emit_shift(
        &mut self,
        idx: usize,
        op: ShiftOp,
        size: OpSize,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        if let Some(k) = self.imm32_of(ops[1]) {
            let ra = self.use_any(ops[0])?;
            let rd = self.def_reg(idx, &RegBitSet::new())?;
            self.enc.mov_rr(size, rd, ra)?;
            self.enc.shift_ri(op, size, rd, k as u8)?;
            self.finish_uses(ops)?;
            return self.define(idx, rd);
        }

        self.evict(RCX)?;
        let fixed = RegBitSet::from_regs(&[RCX]);
        let ra = self.use_reg(ops[0], &fixed)?;
        let rb = self.use_reg(ops[1], &fixed)?;
        self.enc.mov_rr(OpSize::S32, RCX, rb)?;
        let rd = self.def_reg(idx, &fixed)?;
        self.enc.mov_rr(size, rd, ra)?;
        self.enc.shift_cl(op, size, rd)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_unary(&mut self, idx: usize, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        let ops = operands(data);
        let size = if data.ret_type() == LTy::Q { OpSize::S64 } else { OpSize::S32 };
        let ra = self.use_any(ops[0])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        self.enc.mov_rr(size, rd, ra)?;
        match data.opcode {
            LOpcode::NegI | LOpcode::NegQ => self.enc.neg(size, rd)?,
            _ => self.enc.not(size, rd)?,
        }
        self.finish_uses(&ops)?;
        self.define(idx, rd)
    }

    fn emit_sse(
        &mut self,
        idx: usize,
        op: SseOp,
        size: FloatSize,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        let rb = self.use_any(ops[1])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        self.enc.movaps(rd, ra)?;
        self.enc.sse_arith(op, size, rd, rb)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    /// Flip the sign bit with a mask built in the scratch registers.
    fn emit_fneg(&mut self, idx: usize, size: FloatSize, ops: &[LIns]) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        self.enc.movaps(rd, ra)?;
        match size {
            FloatSize::F64 => {
                self.enc.mov_ri64(R11, i64::MIN)?;
                self.enc.mov_gp_to_xmm(OpSize::S64, XMM15, R11)?;
            }
            FloatSize::F32 => {
                self.enc.mov_ri32(R11, i32::MIN)?;
                self.enc.mov_gp_to_xmm(OpSize::S32, XMM15, R11)?;
            }
        }
        self.enc.xorps(rd, XMM15)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_icmp(
        &mut self,
        idx: usize,
        cond: Condition,
        size: OpSize,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        let rhs = self.use_rhs(ops[1])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        match rhs {
            Rhs::Imm(k) => self.enc.alu_ri(AluOp::Cmp, size, ra, k)?,
            Rhs::Reg(rb) => self.enc.alu_rr(AluOp::Cmp, size, ra, rb)?,
        }
        self.enc.setcc(cond, rd)?;
        self.enc.movzx_r8(rd, rd)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    /// Ordered float compares: NaN operands make every relation false.
    fn emit_fcmp(
        &mut self,
        idx: usize,
        cmp: FloatCmp,
        size: FloatSize,
        ops: &[LIns],
    ) -> Result<(), AssemblerError> {
        let ra = self.use_any(ops[0])?;
        let rb = self.use_any(ops[1])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        match cmp {
            FloatCmp::Eq => {
                self.enc.ucomis(size, ra, rb)?;
                self.enc.setcc(Condition::E, rd)?;
                self.enc.setcc(Condition::Np, R11)?;
                self.enc.and8(rd, R11)?;
            }
            FloatCmp::Gt => {
                self.enc.ucomis(size, ra, rb)?;
                self.enc.setcc(Condition::A, rd)?;
            }
            FloatCmp::Ge => {
                self.enc.ucomis(size, ra, rb)?;
                self.enc.setcc(Condition::Ae, rd)?;
            }
            FloatCmp::Lt => {
                self.enc.ucomis(size, rb, ra)?;
                self.enc.setcc(Condition::A, rd)?;
            }
            FloatCmp::Le => {
                self.enc.ucomis(size, rb, ra)?;
                self.enc.setcc(Condition::Ae, rd)?;
            }
        }
        self.enc.movzx_r8(rd, rd)?;
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_convert(&mut self, idx: usize, op: LOpcode, ops: &[LIns]) -> Result<(), AssemblerError> {
        use LOpcode::*;

        let ra = self.use_any(ops[0])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        match op {
            I2Q => self.enc.movsxd(rd, ra)?,
            UI2UQ | Q2I => self.enc.mov_rr(OpSize::S32, rd, ra)?,
            I2D | Q2D | I2F => {
                let from = if op == Q2D { OpSize::S64 } else { OpSize::S32 };
                let to = if op == I2F { FloatSize::F32 } else { FloatSize::F64 };
                self.enc.xorps(rd, rd)?;
                self.enc.cvtsi2s(to, from, rd, ra)?;
            }
            UI2D | UI2F => {
                // Zero-extend to 64 bits so the signed conversion sees the full range.
                let to = if op == UI2F { FloatSize::F32 } else { FloatSize::F64 };
                self.enc.mov_rr(OpSize::S32, R11, ra)?;
                self.enc.xorps(rd, rd)?;
                self.enc.cvtsi2s(to, OpSize::S64, rd, R11)?;
            }
            D2I => self.enc.cvtts2si(OpSize::S32, FloatSize::F64, rd, ra)?,
            D2Q => self.enc.cvtts2si(OpSize::S64, FloatSize::F64, rd, ra)?,
            F2I => self.enc.cvtts2si(OpSize::S32, FloatSize::F32, rd, ra)?,
            F2D => self.enc.cvtss2sd(rd, ra)?,
            D2F => self.enc.cvtsd2ss(rd, ra)?,
            other => {
                return Err(AssemblerError::RegisterAllocation {
                    reason: format!("{other} is not a conversion"),
                })
            }
        }
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_cmov(&mut self, idx: usize, ty: LTy, ops: &[LIns]) -> Result<(), AssemblerError> {
        let rc = self.use_any(ops[0])?;
        let rt = self.use_any(ops[1])?;
        let rf = self.use_any(ops[2])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        if ty.is_float() {
            let skip = self.enc.new_label();
            self.enc.movaps(rd, rf)?;
            self.enc.test_rr(OpSize::S32, rc, rc)?;
            self.enc.jcc(Condition::E, skip)?;
            self.enc.movaps(rd, rt)?;
            self.enc.bind(skip)?;
        } else {
            let size = if ty == LTy::Q { OpSize::S64 } else { OpSize::S32 };
            self.enc.mov_rr(size, rd, rf)?;
            self.enc.test_rr(OpSize::S32, rc, rc)?;
            self.enc.cmovne(size, rd, rt)?;
        }
        self.finish_uses(ops)?;
        self.define(idx, rd)
    }

    fn emit_load(&mut self, idx: usize, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        use LOpcode::*;

        let ops = operands(data);
        let disp = data.disp();
        let base = self.use_any(ops[0])?;
        let rd = self.def_reg(idx, &RegBitSet::new())?;
        match data.opcode {
            LdC2I => self.enc.load(MemWidth::B8, true, rd, base, disp)?,
            LdUC2UI => self.enc.load(MemWidth::B8, false, rd, base, disp)?,
            LdS2I => self.enc.load(MemWidth::B16, true, rd, base, disp)?,
            LdUS2UI => self.enc.load(MemWidth::B16, false, rd, base, disp)?,
            LdI => self.enc.load(MemWidth::B32, false, rd, base, disp)?,
            LdQ => self.enc.load(MemWidth::B64, false, rd, base, disp)?,
            LdD => self.enc.load_float(FloatSize::F64, rd, base, disp)?,
            LdF => self.enc.load_float(FloatSize::F32, rd, base, disp)?,
            _ => {
                self.enc.load_float(FloatSize::F32, rd, base, disp)?;
                self.enc.cvtss2sd(rd, rd)?;
            }
        }
        self.finish_uses(&ops)?;
        self.define(idx, rd)
    }

    fn emit_store(&mut self, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        use LOpcode::*;

        let ops = operands(data);
        let disp = data.disp();
        let value = self.use_any(ops[0])?;
        let base = self.use_any(ops[1])?;
        match data.opcode {
            StI2C => self.enc.store(MemWidth::B8, base, disp, value)?,
            StI2S => self.enc.store(MemWidth::B16, base, disp, value)?,
            StI => self.enc.store(MemWidth::B32, base, disp, value)?,
            StQ => self.enc.store(MemWidth::B64, base, disp, value)?,
            StD => self.enc.store_float(FloatSize::F64, base, disp, value)?,
            _ => self.enc.store_float(FloatSize::F32, base, disp, value)?,
        }
        self.finish_uses(&ops)
    }

    fn emit_call(&mut self, idx: usize, site: &'a CallSite<'a>) -> Result<(), AssemblerError> {
        self.sync_all()?;
        self.clear_all()?;

        let mut cc = SysVAssigner::for_abi(site.info.abi);
        let args: Vec<LIns> = site.args_abi_order().collect();
        for &arg in &args {
            let ty = self.va(arg.index())?.ty;
            let mut slot = CCAssignment::for_type(ty);
            cc.assign_arg(&mut slot);
            match (slot.reg, slot.stack_off) {
                (Some(reg), _) => self.fill(arg.index(), reg)?,
                (None, Some(offset)) => {
                    let scratch = if ty.is_float() { XMM15 } else { R11 };
                    self.fill(arg.index(), scratch)?;
                    self.store_to(ty, RSP, offset, scratch)?;
                }
                (None, None) => {
                    return Err(AssemblerError::RegisterAllocation {
                        reason: format!("no location for argument {arg} of {}", site.info.name),
                    })
                }
            }
        }

        self.enc.mov_ri64(R11, site.info.address as i64)?;
        self.enc.call_reg(R11)?;
        self.finish_uses(&args)?;
        self.session.record_call_site(site.info.name);

        let ret = self.buf.at(idx).ret_type();
        if ret == LTy::V {
            return Ok(());
        }
        let mut result = CCAssignment::for_type(ret);
        cc.assign_ret(&mut result);
        let reg = result.reg.unwrap_or(if ret.is_float() { XMM0 } else { RAX });
        self.regs.assign_specific(reg, idx)?;
        self.define(idx, reg)
    }

    fn emit_return(&mut self, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        let ops = operands(data);
        let value = self.use_any(ops[0])?;
        // Homes first: the move below may overwrite a cached value.
        self.sync_all()?;
        match data.opcode {
            LOpcode::RetI => self.enc.mov_rr(OpSize::S32, RAX, value)?,
            LOpcode::RetQ => self.enc.mov_rr(OpSize::S64, RAX, value)?,
            _ if value != XMM0 => self.enc.movaps(XMM0, value)?,
            _ => {}
        }
        self.finish_uses(&ops)?;
        self.enc.jmp(self.epilogue)?;
        self.clear_all()
    }

    /// Compare-and-branch chain; an index outside the table traps.
    fn emit_table(&mut self, idx: usize, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        let Payload::Table(cells) = data.payload else {
            return Err(AssemblerError::UnknownBranch {
                at: self.buf.handle(idx),
            });
        };
        let ops = operands(data);
        let index = self.use_any(ops[0])?;
        self.sync_all()?;
        for (i, cell) in cells.iter().enumerate() {
            let target = self.label_of(cell.get(), idx)?;
            self.enc.alu_ri(AluOp::Cmp, OpSize::S32, index, i as i32)?;
            self.enc.jcc(Condition::E, target)?;
        }
        self.enc.ud2()?;
        self.finish_uses(&ops)?;
        self.clear_all()
    }

    fn emit_guard_exit(&mut self, data: &LInsData<'a>) -> Result<(), AssemblerError> {
        let Some(guard) = data.guard() else {
            return Ok(());
        };
        self.sync_all()?;
        let stub = self.enc.new_label();
        self.enc.bind(stub)?;
        self.enc.mov_ri64(RAX, guard.record_address() as i64)?;
        self.enc.jmp(self.epilogue)?;
        self.exits.push((guard, stub));
        self.clear_all()
    }
}

/// Every value `data` reads, call arguments included.
/// Whether an unused instruction can be dropped.
fn is_removable(data: &LInsData<'_>) -> bool {
    match data.call_site() {
        Some(site) => !site.info.has_side_effects(),
        None => data.opcode.is_removable(),
    }
}

fn for_each_use(data: &LInsData<'_>, mut f: impl FnMut(LIns)) {
    for op in data.operand_list() {
        f(op);
    }
    if let Some(site) = data.call_site() {
        for &arg in site.args {
            f(arg);
        }
    }
}

fn operands(data: &LInsData<'_>) -> Vec<LIns> {
    data.operand_list().collect()
}

fn alu_op(op: LOpcode) -> AluOp {
    match op {
        LOpcode::AddI | LOpcode::AddQ => AluOp::Add,
        LOpcode::SubI | LOpcode::SubQ => AluOp::Sub,
        LOpcode::AndI | LOpcode::AndQ => AluOp::And,
        LOpcode::OrI | LOpcode::OrQ => AluOp::Or,
        _ => AluOp::Xor,
    }
}

fn sse_op(op: LOpcode) -> SseOp {
    match op {
        LOpcode::AddD | LOpcode::AddF => SseOp::Add,
        LOpcode::SubD | LOpcode::SubF => SseOp::Sub,
        LOpcode::MulD | LOpcode::MulF => SseOp::Mul,
        _ => SseOp::Div,
    }
}

fn int_cond(op: LOpcode) -> Condition {
    use LOpcode::*;
    match op {
        EqI | EqQ => Condition::E,
        LtI | LtQ => Condition::L,
        GtI | GtQ => Condition::G,
        LeI | LeQ => Condition::Le,
        GeI | GeQ => Condition::Ge,
        LtUI | LtUQ => Condition::B,
        GtUI | GtUQ => Condition::A,
        LeUI | LeUQ => Condition::Be,
        _ => Condition::Ae,
    }
}

fn float_cmp(op: LOpcode) -> FloatCmp {
    use LOpcode::*;
    match op {
        EqD | EqF => FloatCmp::Eq,
        LtD | LtF => FloatCmp::Lt,
        GtD | GtF => FloatCmp::Gt,
        LeD | LeF => FloatCmp::Le,
        _ => FloatCmp::Ge,
    }
}

fn log_disassembly(code: &[u8]) {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut line = String::new();
    for instruction in &mut decoder {
        line.clear();
        formatter.format(&instruction, &mut line);
        log::debug!("  {:04x}  {}", instruction.ip(), line);
    }
}
