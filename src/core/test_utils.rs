//! Test utilities for arena-based testing.
//!
//! Every test gets its own arena so compiled code and LIR never leak across
//! tests.

#[cfg(test)]
pub mod test {
    use crate::core::config::JitConfig;
    use crate::jit::JitContext;
    use bumpalo::Bump;

    /// Test context that owns the arena a `JitContext` borrows.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self { arena: Bump::new() }
        }

        pub fn arena(&self) -> &Bump {
            &self.arena
        }

        /// Create a JIT context borrowing this test context's arena.
        pub fn create_jit(&self, config: JitConfig) -> JitContext<'_> {
            JitContext::new(&self.arena, config)
        }

        pub fn memory_used(&self) -> usize {
            self.arena.allocated_bytes()
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Run a test with a temporary arena context.
    pub fn with_test_context<F, R>(f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = TestContext::new();
        f(&ctx)
    }
}
