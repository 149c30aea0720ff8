// This module holds the compilation context: the object an embedder creates once and keeps
// alive for as long as any generated code may run. It owns the session (arena handle and
// statistics), the executable memory manager and the fragment registry, and hands out one
// FunctionBuilder at a time. The arena is borrowed, so every LIR buffer, call descriptor and
// guard record built through the context lives exactly as long as the caller's Bump.

//! Compilation context.

use bumpalo::Bump;

use crate::core::code_alloc::CodeAlloc;
use crate::core::config::JitConfig;
use crate::core::session::{CompilationSession, SessionStats};
use crate::jit::builder::FunctionBuilder;
use crate::jit::registry::{CodePtr, Fragment, FragmentRegistry};
use crate::lir::{AbiKind, AccessSet, CallInfo, LirBuffer, TypeSig};

/// Owner of generated code and of every function built in it.
///
/// Code obtained from `function_by_name` stays valid until the context is
/// dropped.
pub struct JitContext<'a> {
    pub(crate) session: CompilationSession<'a>,
    pub(crate) config: JitConfig,
    pub(crate) code_alloc: CodeAlloc,
    pub(crate) registry: FragmentRegistry<'a>,
    next_buffer: u32,
}

impl<'a> JitContext<'a> {
    pub fn new(arena: &'a Bump, config: JitConfig) -> Self {
        log::debug!(
            "jit context: cse={} expr={} validate={} verbose={}",
            config.cse,
            config.expr_filter,
            config.validate,
            config.verbose
        );
        Self {
            session: CompilationSession::new(arena),
            code_alloc: CodeAlloc::new(config.chunk_size),
            config,
            registry: FragmentRegistry::new(),
            next_buffer: 0,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn session(&self) -> &CompilationSession<'a> {
        &self.session
    }

    pub fn code_alloc(&self) -> &CodeAlloc {
        &self.code_alloc
    }

    /// Start building the function `name`.
    ///
    /// An earlier fragment of the same name stays callable until the new one
    /// is finalized and replaces it. With `optimize` the CSE and algebraic
    /// stages join the writer pipeline.
    pub fn builder(&mut self, name: &str, optimize: bool) -> FunctionBuilder<'_, 'a> {
        let name = self.session.intern_str(name);
        self.session.set_current_function(Some(name));

        let id = self.next_buffer;
        self.next_buffer += 1;
        let buffer = LirBuffer::new(self.session.arena(), id);
        FunctionBuilder::new(self, name, optimize, buffer)
    }

    /// Entry point of a finalized function with a single return type.
    pub fn function_by_name(&self, name: &str) -> Option<CodePtr> {
        self.registry.fragment(name).and_then(|f| f.entry)
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment<'a>> {
        self.registry.fragment(name)
    }

    pub fn registry(&self) -> &FragmentRegistry<'a> {
        &self.registry
    }

    /// Make a native function callable by name from generated code.
    ///
    /// The callee is assumed to read and write arbitrary memory. Returns
    /// false if `name` was already registered; the first registration stays
    /// in effect.
    ///
    /// # Safety
    /// `address` must be the entry of a function that follows the System V
    /// calling convention with signature `sig`, and it must stay valid for
    /// the lifetime of this context.
    pub unsafe fn register_extern(
        &mut self,
        name: &str,
        address: usize,
        sig: TypeSig,
        abi: AbiKind,
    ) -> bool {
        self.register_extern_with_access(name, address, sig, abi, AccessSet::ALL)
    }

    /// Like `register_extern`, with an explicit summary of the memory the
    /// callee touches. Calls to a callee that stores nothing are dropped
    /// when their result is unused.
    ///
    /// # Safety
    /// As for `register_extern`; `access` must also cover everything the
    /// callee does.
    pub unsafe fn register_extern_with_access(
        &mut self,
        name: &str,
        address: usize,
        sig: TypeSig,
        abi: AbiKind,
        access: AccessSet,
    ) -> bool {
        let info: &'a CallInfo<'a> = self.session.alloc(CallInfo {
            name: self.session.intern_str(name),
            address,
            sig,
            abi,
            access,
        });
        log::debug!("register extern {} {} at {:#x} ({})", name, sig, address, access);
        self.registry.register_extern(info)
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }
}

impl std::fmt::Debug for JitContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitContext")
            .field("config", &self.config)
            .field("fragments", &self.registry.fragment_count())
            .field("code", &self.code_alloc)
            .finish()
    }
}
