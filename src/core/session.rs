// This module provides the arena-based compilation session used by every lirjit context. The
// session borrows a bumpalo arena owned by the caller and hands out arena allocations for the
// transient compiler objects (instruction buffers, call descriptors, call-site argument lists,
// guard records and side exits). None of these objects have destructors; the arena reclaims
// them wholesale when the caller drops it. The session also interns function names so call
// descriptors and registry keys can share one arena string, and collects SessionStats:
// functions and instructions compiled, code size, registers allocated, spills, call sites,
// and how many instructions the CSE and algebraic filters removed or rewrote.

//! Arena-based compilation session management.
//!
//! All compilation objects are tied to the session lifetime, which is the
//! lifetime of the borrowed arena.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
///
/// State lives behind `RefCell`s so the assembler and the writer stages can
/// record statistics through a shared reference.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and optimization.
    stats: RefCell<SessionStats>,

    /// String interning for function names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Function currently being built or compiled.
    current_function: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_function: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    ///
    /// The arena never runs `Drop`, so only plain data belongs here.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Set the function currently being built.
    pub fn set_current_function(&self, name: Option<&'arena str>) {
        *self.current_function.borrow_mut() = name;
    }

    pub fn current_function(&self) -> Option<&'arena str> {
        *self.current_function.borrow()
    }

    /// Record that a function was compiled.
    pub fn record_function_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record an instruction compilation.
    pub fn record_instruction_compiled(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_compiled += 1;
        *stats
            .instruction_counts
            .entry(opcode.to_string())
            .or_insert(0) += 1;
    }

    /// Record register allocation.
    pub fn record_register_allocated(&self) {
        self.stats.borrow_mut().registers_allocated += 1;
    }

    /// Record spill generation.
    pub fn record_spill_generated(&self) {
        self.stats.borrow_mut().spills_generated += 1;
    }

    /// Record a lowered call site.
    pub fn record_call_site(&self, function_name: &str) {
        self.stats.borrow_mut().total_calls += 1;
        log::debug!("Call site lowered: {}", function_name);
    }

    /// Record instructions answered from the CSE table.
    pub fn record_cse_hits(&self, count: usize) {
        self.stats.borrow_mut().cse_hits += count;
    }

    /// Record instructions rewritten by the algebraic filter.
    pub fn record_simplifications(&self, count: usize) {
        self.stats.borrow_mut().simplifications += count;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of functions compiled.
    pub functions_compiled: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    /// Number of LIR instructions compiled.
    pub instructions_compiled: usize,

    /// Count of each opcode compiled.
    pub instruction_counts: std::collections::HashMap<String, usize>,

    /// Largest function compiled.
    pub largest_function_size: usize,

    /// Name of largest function.
    pub largest_function_name: String,

    /// Registers allocated.
    pub registers_allocated: usize,

    /// Spills generated.
    pub spills_generated: usize,

    /// Total function calls compiled.
    pub total_calls: usize,

    /// Instructions deduplicated by CSE.
    pub cse_hits: usize,

    /// Instructions rewritten by the algebraic filter.
    pub simplifications: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Function calls compiled: {}", self.total_calls)?;
        writeln!(f, "  CSE hits: {}", self.cse_hits)?;
        writeln!(f, "  Simplifications: {}", self.simplifications)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}
