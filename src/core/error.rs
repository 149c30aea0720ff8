// This module defines the error types for lirjit using the thiserror crate. JitError is the
// top-level error returned by finalize and groups the three failure families: caller-contract
// violations while building a function (BuildError), code-generation failures reported by the
// assembler (AssemblerError, including the BranchTooFar / StackFull / UnknownBranch family),
// and executable-memory failures from the code allocator (CodeAllocError). Each variant carries
// the context needed to explain the failure (names, indices, sizes, errno values). JitResult<T>
// is the convenience alias used across the crate.

//! Error types for lirjit.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

use crate::core::register_file::RegAllocError;
use crate::lir::{LIns, TypeSig};
use crate::x64::encoder::EncodingError;

/// Top-level error type returned by function finalization.
#[derive(Error, Debug)]
pub enum JitError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("error during assembly: {0}")]
    Assembly(#[from] AssemblerError),

    #[error(transparent)]
    CodeAlloc(#[from] CodeAllocError),
}

/// Caller-contract violations detected while appending instructions.
///
/// All of these are recoverable: the offending instruction is not appended
/// and the builder stays usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("parameter index {index} exceeds the maximum of {max} parameters")]
    TooManyParameters { index: usize, max: usize },

    #[error("call to '{name}' passes {count} arguments, at most {max} are supported")]
    TooManyArguments {
        name: String,
        count: usize,
        max: usize,
    },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function '{name}' has no callable entry point")]
    NotCallable { name: String },

    #[error("{opcode} is not a call opcode")]
    NotACallOpcode { opcode: &'static str },

    #[error("signature mismatch calling '{name}': declared {declared}, call site uses {deduced}")]
    SignatureMismatch {
        name: String,
        declared: TypeSig,
        deduced: TypeSig,
    },

    #[error("{ins} does not belong to this function")]
    ForeignInstruction { ins: LIns },

    #[error("{ins} is not a branch")]
    NotABranch { ins: LIns },

    #[error("{ins} is not a label")]
    NotALabel { ins: LIns },

    #[error("jump table {ins} has no entry {index}")]
    TableIndexOutOfRange { ins: LIns, index: usize },
}

/// Failures reported by the assembler after a compile attempt.
#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("BranchTooFar: {size} bytes of code exceed the rel32 branch range")]
    BranchTooFar { size: usize },

    #[error("StackFull: frame needs {required} bytes, limit is {limit}")]
    StackFull { required: u32, limit: u32 },

    #[error("UnknownBranch: {at} has no label target")]
    UnknownBranch { at: LIns },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

impl From<RegAllocError> for AssemblerError {
    fn from(e: RegAllocError) -> Self {
        AssemblerError::RegisterAllocation {
            reason: e.to_string(),
        }
    }
}

/// Executable memory failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeAllocError {
    #[error("mmap of {size} bytes failed (errno {errno})")]
    MapFailed { size: usize, errno: i32 },

    #[error("mprotect of chunk at {addr:#x} failed (errno {errno})")]
    ProtectFailed { addr: usize, errno: i32 },

    #[error("cannot allocate an empty code block")]
    EmptyBlock,
}

/// Result type alias for finalize and friends.
pub type JitResult<T> = Result<T, JitError>;
