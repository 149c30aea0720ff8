// This module holds the function builder: the only way instructions enter a buffer. Every
// append goes through the writer pipeline chosen at creation, so optimizing builders see CSE
// and algebraic rewrites while plain ones append verbatim. The builder also performs call
// lowering (name resolution against the context's registry, signature deduction from the
// argument instructions, mismatch policy) and tracks which return kinds were used so that
// finalize can decide whether the function gets a callable entry point.

//! Function construction and finalization.

use std::cell::Cell;
use std::fmt;

use crate::core::config::MismatchPolicy;
use crate::core::error::{BuildError, JitError};
use crate::jit::context::JitContext;
use crate::jit::registry::CodePtr;
use crate::lir::{
    AbiKind, AccessSet, ArgType, CallInfo, CallSite, GuardRecord, LIns, LInsData, LOpcode, LirBuffer,
    Payload, SideExit, TypeSig, MAX_ARGS, MAX_PARAMS,
};
use crate::writer::WriterPipeline;
use crate::x64::Assembler;

/// Return kinds a function has used so far.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnTypes(u32);

/// Outcome of the return kinds at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    NoReturn,
    Single(ArgType),
    Conflicting,
}

impl ReturnTypes {
    pub const INT: u32 = 1;
    pub const QUAD: u32 = 2;
    pub const DOUBLE: u32 = 4;
    pub const FLOAT: u32 = 8;
    pub const VOID: u32 = 16;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn shape(self) -> ReturnShape {
        match self.0 {
            0 => ReturnShape::NoReturn,
            Self::INT => ReturnShape::Single(ArgType::I),
            Self::QUAD => ReturnShape::Single(ArgType::Q),
            Self::DOUBLE => ReturnShape::Single(ArgType::D),
            Self::FLOAT => ReturnShape::Single(ArgType::F),
            Self::VOID => ReturnShape::Single(ArgType::V),
            _ => ReturnShape::Conflicting,
        }
    }
}

impl fmt::Debug for ReturnTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReturnTypes({:#07b})", self.0)
    }
}

/// Return type produced by a call opcode.
fn call_return_type(opcode: LOpcode) -> Option<ArgType> {
    match opcode {
        LOpcode::CallV => Some(ArgType::V),
        LOpcode::CallI => Some(ArgType::I),
        LOpcode::CallQ => Some(ArgType::Q),
        LOpcode::CallD => Some(ArgType::D),
        LOpcode::CallF => Some(ArgType::F),
        _ => None,
    }
}

macro_rules! unary_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, a: LIns) -> LIns {
                self.ins(LInsData::op1(LOpcode::$op, a))
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, a: LIns, b: LIns) -> LIns {
                self.ins(LInsData::op2(LOpcode::$op, a, b))
            }
        )*
    };
}

macro_rules! load_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, base: LIns, disp: i32) -> LIns {
                self.ins(LInsData::new(LOpcode::$op, &[base], Payload::Disp(disp)))
            }
        )*
    };
}

macro_rules! store_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, value: LIns, base: LIns, disp: i32) -> LIns {
                self.ins(LInsData::new(LOpcode::$op, &[value, base], Payload::Disp(disp)))
            }
        )*
    };
}

macro_rules! select_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, cond: LIns, iftrue: LIns, iffalse: LIns) -> LIns {
                self.ins(LInsData::op3(LOpcode::$op, cond, iftrue, iffalse))
            }
        )*
    };
}

/// Appends instructions to one function and compiles it on `finalize`.
pub struct FunctionBuilder<'c, 'a> {
    ctx: &'c mut JitContext<'a>,
    name: &'a str,
    optimize: bool,
    pipeline: WriterPipeline<'a>,
    buffer: LirBuffer<'a>,
    return_types: ReturnTypes,
    param_count: usize,
    guard_count: u32,
    error: Option<BuildError>,
}

impl<'c, 'a> FunctionBuilder<'c, 'a> {
    pub(crate) fn new(
        ctx: &'c mut JitContext<'a>,
        name: &'a str,
        optimize: bool,
        buffer: LirBuffer<'a>,
    ) -> Self {
        let pipeline = WriterPipeline::build(&ctx.config, optimize);
        log::debug!(
            "building {} (optimize={}, stages={:?})",
            name,
            optimize,
            pipeline.stage_names()
        );
        let mut builder = Self {
            ctx,
            name,
            optimize,
            pipeline,
            buffer,
            return_types: ReturnTypes::default(),
            param_count: 0,
            guard_count: 0,
            error: None,
        };
        builder.ins(LInsData::op0(LOpcode::Start));
        builder
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimize
    }

    pub fn buffer(&self) -> &LirBuffer<'a> {
        &self.buffer
    }

    pub fn return_types(&self) -> ReturnTypes {
        self.return_types
    }

    /// Append through the writer pipeline. The handle returned may name an
    /// earlier equivalent instruction or a simplified one.
    ///
    /// An instruction that references a handle of another function is not
    /// appended; the foreign handle is returned instead and `finalize` fails
    /// with the first such error.
    pub fn ins(&mut self, data: LInsData<'a>) -> LIns {
        if let Some(foreign) = self.buffer.foreign_operand(&data) {
            let err = BuildError::ForeignInstruction { ins: foreign };
            log::error!("{}: {} rejected, {}", self.name, data.opcode.name(), err);
            self.error.get_or_insert(err);
            return foreign;
        }
        self.pipeline.ins(&mut self.buffer, data)
    }

    // ==== PARAMETERS AND IMMEDIATES ====

    /// Declare the next 64-bit parameter.
    pub fn insert_parameter(&mut self) -> Result<LIns, BuildError> {
        let index = self.param_count;
        if index >= MAX_PARAMS {
            return Err(BuildError::TooManyParameters {
                index,
                max: MAX_PARAMS,
            });
        }
        self.param_count += 1;
        Ok(self.ins(LInsData::new(
            LOpcode::Param,
            &[],
            Payload::Param(index as u8),
        )))
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn immi(&mut self, value: i32) -> LIns {
        self.ins(LInsData::immi(value))
    }

    pub fn immq(&mut self, value: i64) -> LIns {
        self.ins(LInsData::immq(value))
    }

    pub fn immd(&mut self, value: f64) -> LIns {
        self.ins(LInsData::immd(value))
    }

    pub fn immf(&mut self, value: f32) -> LIns {
        self.ins(LInsData::immf(value))
    }

    /// Reserve `size` bytes of frame memory and return its address.
    pub fn alloc(&mut self, size: u32) -> LIns {
        self.ins(LInsData::new(LOpcode::Alloc, &[], Payload::Alloc(size)))
    }

    pub fn comment(&mut self, text: &str) -> LIns {
        let text = self.ctx.session.intern_str(text);
        self.ins(LInsData::new(LOpcode::Comment, &[], Payload::Comment(text)))
    }

    // ==== ARITHMETIC ====

    binary_ops! {
        addi => AddI; subi => SubI; muli => MulI; divi => DivI; modi => ModI;
        andi => AndI; ori => OrI; xori => XorI;
        lshi => LshI; rshi => RshI; rshui => RshUI;
        addq => AddQ; subq => SubQ; mulq => MulQ; divq => DivQ; modq => ModQ;
        andq => AndQ; orq => OrQ; xorq => XorQ;
        lshq => LshQ; rshq => RshQ; rshuq => RshUQ;
        addd => AddD; subd => SubD; muld => MulD; divd => DivD;
        addf => AddF; subf => SubF; mulf => MulF; divf => DivF;
    }

    binary_ops! {
        eqi => EqI; lti => LtI; gti => GtI; lei => LeI; gei => GeI;
        ltui => LtUI; gtui => GtUI; leui => LeUI; geui => GeUI;
        eqq => EqQ; ltq => LtQ; gtq => GtQ; leq => LeQ; geq => GeQ;
        ltuq => LtUQ; gtuq => GtUQ; leuq => LeUQ; geuq => GeUQ;
        eqd => EqD; ltd => LtD; gtd => GtD; led => LeD; ged => GeD;
        eqf => EqF; ltf => LtF; gtf => GtF; lef => LeF; gef => GeF;
    }

    unary_ops! {
        negi => NegI; noti => NotI; negq => NegQ; notq => NotQ;
        negd => NegD; negf => NegF;
        i2q => I2Q; ui2uq => UI2UQ; q2i => Q2I;
        i2d => I2D; ui2d => UI2D; q2d => Q2D; d2i => D2I; d2q => D2Q;
        i2f => I2F; ui2f => UI2F; f2d => F2D; d2f => D2F; f2i => F2I;
    }

    select_ops! {
        cmovi => CmovI; cmovq => CmovQ; cmovd => CmovD; cmovf => CmovF;
    }

    // ==== MEMORY ====

    load_ops! {
        ldc2i => LdC2I; lduc2ui => LdUC2UI; lds2i => LdS2I; ldus2ui => LdUS2UI;
        ldi => LdI; ldq => LdQ; ldd => LdD; ldf => LdF; ldf2d => LdF2D;
    }

    store_ops! {
        sti2c => StI2C; sti2s => StI2S; sti => StI; stq => StQ; std => StD; stf => StF;
    }

    // ==== CONTROL FLOW ====

    pub fn label(&mut self) -> LIns {
        self.ins(LInsData::op0(LOpcode::Label))
    }

    /// Unconditional jump. The target may be bound later with `set_target`.
    pub fn j(&mut self, target: Option<LIns>) -> LIns {
        self.ins(LInsData::new(LOpcode::J, &[], Payload::Target(target)))
    }

    /// Jump if `cond` is non-zero.
    pub fn jt(&mut self, cond: LIns, target: Option<LIns>) -> LIns {
        self.ins(LInsData::new(LOpcode::JT, &[cond], Payload::Target(target)))
    }

    /// Jump if `cond` is zero.
    pub fn jf(&mut self, cond: LIns, target: Option<LIns>) -> LIns {
        self.ins(LInsData::new(LOpcode::JF, &[cond], Payload::Target(target)))
    }

    /// Indexed jump over `size` entries, bound with `set_table_target`.
    pub fn jtbl(&mut self, index: LIns, size: usize) -> LIns {
        let cells = self
            .ctx
            .session
            .arena()
            .alloc_slice_fill_with(size, |_| Cell::new(None));
        self.ins(LInsData::new(LOpcode::JTbl, &[index], Payload::Table(cells)))
    }

    pub fn set_target(&mut self, branch: LIns, label: LIns) -> Result<(), BuildError> {
        self.buffer.set_target(branch, label)
    }

    pub fn set_table_target(
        &mut self,
        jtbl: LIns,
        index: usize,
        label: LIns,
    ) -> Result<(), BuildError> {
        self.buffer.set_table_target(jtbl, index, label)
    }

    // ==== RETURNS ====

    pub fn reti(&mut self, value: LIns) -> LIns {
        self.return_types.insert(ReturnTypes::INT);
        self.ins(LInsData::op1(LOpcode::RetI, value))
    }

    pub fn retq(&mut self, value: LIns) -> LIns {
        self.return_types.insert(ReturnTypes::QUAD);
        self.ins(LInsData::op1(LOpcode::RetQ, value))
    }

    pub fn retd(&mut self, value: LIns) -> LIns {
        self.return_types.insert(ReturnTypes::DOUBLE);
        self.ins(LInsData::op1(LOpcode::RetD, value))
    }

    pub fn retf(&mut self, value: LIns) -> LIns {
        self.return_types.insert(ReturnTypes::FLOAT);
        self.ins(LInsData::op1(LOpcode::RetF, value))
    }

    /// Leave the function without a value through an exit guard.
    pub fn ret(&mut self) -> LIns {
        self.return_types.insert(ReturnTypes::VOID);
        let record = self.new_guard();
        self.ins(LInsData::new(LOpcode::X, &[], Payload::Guard(record)))
    }

    fn new_guard(&mut self) -> &'a GuardRecord<'a> {
        let session = &self.ctx.session;
        let exit: &'a SideExit<'a> = session.alloc(SideExit::new(self.name));
        let record: &'a GuardRecord<'a> = session.alloc(GuardRecord::new(exit, self.guard_count));
        exit.add_guard(record);
        self.guard_count += 1;
        record
    }

    // ==== CALLS ====

    /// Call the fragment or extern `name`.
    ///
    /// `opcode` selects the result type and must be one of the call opcodes.
    /// The signature seen at this call site is deduced from the result types
    /// of `args` and compared with the callee's declared signature.
    pub fn call(
        &mut self,
        name: &str,
        opcode: LOpcode,
        abi: AbiKind,
        args: &[LIns],
    ) -> Result<LIns, BuildError> {
        if args.len() > MAX_ARGS {
            return Err(BuildError::TooManyArguments {
                name: name.to_string(),
                count: args.len(),
                max: MAX_ARGS,
            });
        }
        let ret = call_return_type(opcode).ok_or(BuildError::NotACallOpcode {
            opcode: opcode.name(),
        })?;
        if name == self.name {
            return Err(BuildError::NotCallable {
                name: name.to_string(),
            });
        }
        let callee = self.ctx.registry.resolve(name)?;

        let mut kinds = [ArgType::V; MAX_ARGS];
        for (kind, &arg) in kinds.iter_mut().zip(args) {
            let data = self
                .buffer
                .try_get(arg)
                .ok_or(BuildError::ForeignInstruction { ins: arg })?;
            *kind = ArgType::from_lty(data.ret_type());
        }
        let deduced = TypeSig::new(ret, &kinds[..args.len()]).ok_or_else(|| {
            BuildError::TooManyArguments {
                name: name.to_string(),
                count: args.len(),
                max: MAX_ARGS,
            }
        })?;

        if !deduced.abi_compatible(callee.sig) {
            match self.ctx.config.signature_mismatch {
                MismatchPolicy::Abort => {
                    log::error!(
                        "signature mismatch calling {}: declared {}, call site uses {}",
                        name,
                        callee.sig,
                        deduced
                    );
                    std::process::abort();
                }
                MismatchPolicy::Error => {
                    return Err(BuildError::SignatureMismatch {
                        name: name.to_string(),
                        declared: callee.sig,
                        deduced,
                    });
                }
            }
        }

        let session = &self.ctx.session;
        let info: &'a CallInfo<'a> = session.alloc(CallInfo {
            name: callee.name,
            address: callee.address,
            sig: deduced,
            abi,
            access: callee.access,
        });
        let reversed = session
            .arena()
            .alloc_slice_fill_iter(args.iter().rev().copied());
        let site: &'a CallSite<'a> = session.alloc(CallSite {
            info,
            args: reversed,
        });
        Ok(self.ins(LInsData::new(opcode, &[], Payload::Call(site))))
    }

    // ==== FINALIZE ====

    /// Close the function and generate code for it.
    ///
    /// Returns the entry point when exactly one return kind was used,
    /// `Ok(None)` when the return kinds conflict (no code is generated) or
    /// when the function never returns a value (code is generated but not
    /// exposed). The fragment stays registered in every case.
    pub fn finalize(mut self) -> Result<Option<CodePtr>, JitError> {
        if let Some(err) = self.error.take() {
            self.ctx.session.set_current_function(None);
            return Err(err.into());
        }
        for index in 0..self.param_count {
            if let Some(param) = self.buffer.param(index) {
                self.ins(LInsData::op1(LOpcode::LiveQ, param));
            }
        }
        let terminal = self.new_guard();
        self.ins(LInsData::new(LOpcode::X, &[], Payload::Guard(terminal)));

        let Self {
            ctx,
            name,
            pipeline,
            buffer,
            return_types,
            param_count,
            ..
        } = self;

        pipeline.report(&ctx.session);
        ctx.session.set_current_function(None);

        let buffer: &'a LirBuffer<'a> = ctx.session.alloc(buffer);
        ctx.registry.declare(name);
        if let Some(fragment) = ctx.registry.fragment_mut(name) {
            fragment.buffer = Some(buffer);
        }
        if ctx.config.verbose {
            log::debug!("{}:\n{}", name, buffer);
        }

        let ret = match return_types.shape() {
            ReturnShape::Conflicting => {
                log::warn!(
                    "function {} has multiple return types {:?}, not compiling",
                    name,
                    return_types
                );
                return Ok(None);
            }
            ReturnShape::NoReturn => {
                log::warn!("function {} has no return type", name);
                None
            }
            ReturnShape::Single(ret) => Some(ret),
        };

        let assembly = Assembler::compile(buffer, &ctx.config, &ctx.session).map_err(|e| {
            log::error!("error during assembly of {}: {}", name, e);
            e
        })?;
        let block = ctx.code_alloc.install(&assembly.code)?;
        let base = block.start() as usize;
        for &(guard, offset) in &assembly.exits {
            guard.code_offset.set(Some(offset));
            guard.address.set(Some(base + offset as usize));
        }
        ctx.session.record_function_compiled(name, assembly.code.len());
        log::info!(
            "compiled {}: {} bytes at {:#x}, frame {} bytes",
            name,
            assembly.code.len(),
            base,
            assembly.frame_size
        );

        let quads = [ArgType::Q; MAX_PARAMS];
        let sig = ret.and_then(|r| TypeSig::new(r, &quads[..param_count]));
        let entry = ret.and_then(|_| CodePtr::new(block.start()));
        let call_info = match (entry, sig) {
            (Some(entry), Some(sig)) => {
                let info: &'a CallInfo<'a> = ctx.session.alloc(CallInfo {
                    name,
                    address: entry.addr(),
                    sig,
                    abi: AbiKind::Cdecl,
                    access: AccessSet::ALL,
                });
                Some(info)
            }
            _ => None,
        };

        if let Some(fragment) = ctx.registry.fragment_mut(name) {
            fragment.code = Some(block);
            fragment.entry = entry;
            fragment.return_type = ret;
            fragment.sig = sig;
            fragment.call_info = call_info;
            fragment.exits = assembly.exits.iter().map(|&(g, _)| g).collect();
        }
        Ok(entry)
    }
}

impl fmt::Debug for FunctionBuilder<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBuilder")
            .field("name", &self.name)
            .field("optimize", &self.optimize)
            .field("instructions", &self.buffer.len())
            .field("return_types", &self.return_types)
            .finish()
    }
}
