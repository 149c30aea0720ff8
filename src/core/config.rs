//! Compilation options.
//!
//! A [`JitConfig`] is handed to [`crate::jit::JitContext::new`] once and is
//! read-only afterwards. Optimizing stages are only installed for builders
//! created with `optimize = true`; the flags here can switch them off
//! individually.

use std::env;

/// What to do when a call site disagrees with the callee's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Log and abort the process.
    Abort,
    /// Return `BuildError::SignatureMismatch` from the call.
    Error,
}

/// Options bundle fixed at context creation.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Install the common-subexpression filter in optimizing builders.
    pub cse: bool,
    /// Install the algebraic simplification filter in optimizing builders.
    pub expr_filter: bool,
    /// Trace every appended instruction and the emitted machine code.
    pub verbose: bool,
    /// Bracket the pipeline with validating stages.
    pub validate: bool,
    pub signature_mismatch: MismatchPolicy,
    /// Granularity of executable memory chunks in bytes.
    pub chunk_size: usize,
    /// Largest native frame a function may use.
    pub max_frame_size: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            cse: true,
            expr_filter: true,
            verbose: false,
            validate: cfg!(debug_assertions),
            signature_mismatch: MismatchPolicy::Abort,
            chunk_size: 64 * 1024,
            max_frame_size: 32 * 1024,
        }
    }
}

impl JitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `LIRJIT_VERBOSE`, `LIRJIT_NO_CSE` and
    /// `LIRJIT_NO_EXPR`. A variable counts as set unless it is empty or "0".
    pub fn from_env() -> Self {
        let flag = |name: &str| matches!(env::var(name), Ok(v) if !v.is_empty() && v != "0");

        let mut config = Self::default();
        if flag("LIRJIT_VERBOSE") {
            config.verbose = true;
        }
        if flag("LIRJIT_NO_CSE") {
            config.cse = false;
        }
        if flag("LIRJIT_NO_EXPR") {
            config.expr_filter = false;
        }
        config
    }

    pub fn with_cse(mut self, enabled: bool) -> Self {
        self.cse = enabled;
        self
    }

    pub fn with_expr_filter(mut self, enabled: bool) -> Self {
        self.expr_filter = enabled;
        self
    }

    pub fn with_verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    pub fn with_validate(mut self, enabled: bool) -> Self {
        self.validate = enabled;
        self
    }

    pub fn with_signature_mismatch(mut self, policy: MismatchPolicy) -> Self {
        self.signature_mismatch = policy;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.cse);
        assert!(config.expr_filter);
        assert!(!config.verbose);
        assert_eq!(config.signature_mismatch, MismatchPolicy::Abort);
        assert_eq!(config.validate, cfg!(debug_assertions));
    }

    #[test]
    fn test_builder_setters() {
        let config = JitConfig::new()
            .with_cse(false)
            .with_expr_filter(false)
            .with_verbose(true)
            .with_signature_mismatch(MismatchPolicy::Error)
            .with_max_frame_size(128);

        assert!(!config.cse);
        assert!(!config.expr_filter);
        assert!(config.verbose);
        assert_eq!(config.signature_mismatch, MismatchPolicy::Error);
        assert_eq!(config.max_frame_size, 128);
    }
}
