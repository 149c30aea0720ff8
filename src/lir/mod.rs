// This module holds the low-level intermediate representation: a register-free, linear,
// typed instruction stream with explicit loads, stores, calls, branches and guards. Values are
// referenced by LIns handles (dense indices into the owning buffer). Opcode metadata comes
// from one static table so that the writer stages, the assembler and the printer agree on
// operand shapes, result types and which instructions may be deduplicated or dropped.

//! Low-level intermediate representation.

pub mod buffer;
pub mod call;
pub mod guard;
pub mod ins;
pub mod opcode;
pub mod printer;

pub use buffer::{LirBuffer, MAX_PARAMS};
pub use call::{AbiKind, AccessSet, ArgType, CallInfo, CallSite, TypeSig, MAX_ARGS};
pub use guard::{GuardRecord, SideExit};
pub use ins::{LIns, LInsData, Payload};
pub use opcode::{LOpcode, LTy, OpClass, OpInfo, PayloadKind};
