//! lirjit - a small JIT backend for a typed low-level IR.
//!
//! Functions are written one instruction at a time through a
//! [`FunctionBuilder`]. Each append passes a writer pipeline (validation,
//! algebraic simplification, common-subexpression elimination, tracing)
//! before it lands in an arena-backed [`LirBuffer`](lir::LirBuffer).
//! `finalize` hands the buffer to the x86-64 assembler and installs the
//! result in executable memory owned by the [`JitContext`].
//!
//! # Primary Usage
//!
//! ```no_run
//! use bumpalo::Bump;
//! use lirjit::{JitConfig, JitContext};
//!
//! let arena = Bump::new();
//! let mut jit = JitContext::new(&arena, JitConfig::default());
//!
//! let mut fb = jit.builder("add2", true);
//! let x = fb.insert_parameter().unwrap();
//! let x = fb.q2i(x);
//! let two = fb.immi(2);
//! let sum = fb.addi(x, two);
//! fb.reti(sum);
//! let entry = fb.finalize().unwrap().unwrap();
//!
//! let add2: extern "C" fn(i64) -> i32 = unsafe { entry.as_fn() };
//! assert_eq!(add2(5), 7);
//! ```
//!
//! # Architecture
//!
//! - [`core`] - session, options, errors, code memory, register state
//! - [`lir`] - opcodes, instructions, buffers, call and guard descriptors
//! - [`writer`] - the filter pipeline in front of every buffer
//! - [`x64`] - encoder, calling convention and assembler
//! - [`jit`] - contexts, builders and the fragment registry

pub mod core;
pub mod jit;
pub mod lir;
pub mod writer;
pub mod x64;

pub use crate::core::{
    AssemblerError, BuildError, CodeAllocError, CompilationSession, JitConfig, JitError,
    JitResult, MismatchPolicy, SessionStats,
};
pub use jit::{CodePtr, Fragment, FunctionBuilder, JitContext, ReturnShape, ReturnTypes};
pub use lir::{AbiKind, AccessSet, ArgType, LIns, LOpcode, LTy, TypeSig};
