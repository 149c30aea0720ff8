//! x86-64 backend.
//!
//! - `encoder`: instruction encoding on top of iced-x86
//! - `calling_convention`: System V argument placement and frame layout
//! - `assembler`: LIR to machine code with local register allocation

pub mod assembler;
pub mod calling_convention;
pub mod encoder;

pub use assembler::{Assembler, Assembly};
pub use calling_convention::{CCAssigner, CCAssignment, CCInfo, FunctionFrame, RegBank, SysVAssigner};
pub use encoder::{EncodingError, X64Encoder};
