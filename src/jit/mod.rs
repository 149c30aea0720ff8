//! Embedding API: contexts, function builders and the fragment registry.

pub mod builder;
pub mod context;
pub mod registry;

pub use builder::{FunctionBuilder, ReturnShape, ReturnTypes};
pub use context::JitContext;
pub use registry::{CodePtr, Fragment, FragmentRegistry};
