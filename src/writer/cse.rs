//! Common-subexpression elimination.
//!
//! Pure instructions are keyed by opcode, operand handles and immediate
//! bits; a repeated key is answered with the first handle. Each label starts
//! a new region: computed values are forgotten there, immediates stay shared
//! because they are rematerialised at every use.
//!
//! Loads are never entries, so stores have nothing to invalidate. This is a
//! known unsound simplification for code that reloads memory it stored to
//! through a pure expression chain; it is kept deliberately.

use hashbrown::HashMap;

use super::{Downstream, LirFilter};
use crate::core::session::CompilationSession;
use crate::lir::{LIns, LInsData, LOpcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CseKey {
    opcode: LOpcode,
    operands: [Option<LIns>; 3],
    imm: u64,
}

impl CseKey {
    fn of(data: &LInsData<'_>) -> Self {
        Self {
            opcode: data.opcode,
            operands: data.operands,
            imm: data.payload.imm_bits(),
        }
    }
}

/// Deduplicates structurally identical pure instructions.
#[derive(Debug, Default)]
pub struct CseFilter {
    table: HashMap<CseKey, LIns>,
    hits: usize,
}

impl CseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions answered from the table so far.
    pub fn hits(&self) -> usize {
        self.hits
    }

    fn clear_region(&mut self) {
        self.table.retain(|key, _| key.opcode.is_immediate());
    }
}

impl<'a> LirFilter<'a> for CseFilter {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn ins(&mut self, data: LInsData<'a>, out: &mut Downstream<'_, 'a>) -> LIns {
        if data.opcode == LOpcode::Label {
            self.clear_region();
            return out.ins(data);
        }
        if !data.opcode.is_cse_able() {
            return out.ins(data);
        }

        let key = CseKey::of(&data);
        if let Some(&prior) = self.table.get(&key) {
            self.hits += 1;
            log::trace!("cse: {} reuses {}", data.opcode, prior);
            return prior;
        }

        let ins = out.ins(data);
        self.table.insert(key, ins);
        ins
    }

    fn report(&self, session: &CompilationSession<'_>) {
        session.record_cse_hits(self.hits);
    }
}
