// This module is the hub for lirjit's target-independent infrastructure: the arena-backed
// compilation session and its statistics, the options bundle, the error taxonomy, the
// executable memory manager, the clock-based register file and the per-value assignment
// state the assembler drives. Everything here is shared by the LIR layer, the writer
// pipeline and the x86-64 backend.

//! Core lirjit infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Compilation statistics and name interning
//!
//! ## Executable Memory (`code_alloc`)
//! - Page-aligned chunks from `mmap`, carved into code blocks
//! - Free-block coalescing, W^X protection switching
//!
//! ## Register Allocation (`register_file`, `value_assignment`)
//! - Clock-based register eviction with bitset tracking
//! - Home slots, rematerialisation and use counts per value

pub mod code_alloc;
pub mod config;
pub mod error;
pub mod register_file;
pub mod session;
pub mod test_utils;
pub mod value_assignment;

pub use code_alloc::{CodeAlloc, CodeBlock};
pub use config::{JitConfig, MismatchPolicy};
pub use error::{AssemblerError, BuildError, CodeAllocError, JitError, JitResult};
pub use register_file::{AsmReg, Allocation, Assignment, RegAllocError, RegBitSet, RegisterFile};
pub use session::{CompilationSession, SessionStats};
pub use value_assignment::{Remat, StorageLocation, ValLocalIdx, ValueAssignment, ValueAssignmentManager};
