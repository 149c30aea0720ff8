// This module implements the ValueAssignment system that tracks where each LIR value lives
// while the assembler walks a function: its home location in the frame (an 8-byte spill slot
// below the saved registers, or a caller-frame slot for stack-passed parameters), whether it
// can be rematerialised instead of reloaded (immediates and stack-allocation addresses), the
// register currently caching it, whether that register is newer than the home slot, and how
// many uses are still ahead. The reference count drives register release: when the last use
// has been emitted the register goes back to the register file.

//! Value assignment system for tracking register and stack locations.

use crate::core::register_file::AsmReg;
use crate::lir::LTy;

/// Index type for local values within a function (the instruction index).
pub type ValLocalIdx = usize;

/// Storage location for a value assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    /// Value stored at the given rbp-relative offset.
    Stack(i32),
}

/// Values that are recomputed at each use instead of being stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Remat {
    ImmI(i32),
    ImmQ(i64),
    /// Raw bits of a double.
    ImmD(u64),
    /// Raw bits of a float.
    ImmF(u32),
    /// Address of a stack area, rbp-relative.
    FrameAddr(i32),
}

/// Where one value lives and how long it stays alive.
#[derive(Debug, Clone, Copy)]
pub struct ValueAssignment {
    pub ty: LTy,
    /// Home slot (absent for rematerialisable values).
    pub location: Option<StorageLocation>,
    pub remat: Option<Remat>,
    /// Register currently holding the value.
    pub reg: Option<AsmReg>,
    /// Register contents are newer than the home slot.
    pub modified: bool,
    /// Uses not yet emitted.
    pub references_left: u32,
}

impl ValueAssignment {
    /// A value with a home slot.
    pub fn in_slot(ty: LTy, offset: i32, references: u32) -> Self {
        Self {
            ty,
            location: Some(StorageLocation::Stack(offset)),
            remat: None,
            reg: None,
            modified: false,
            references_left: references,
        }
    }

    /// A value recomputed at every use.
    pub fn remat(ty: LTy, remat: Remat, references: u32) -> Self {
        Self {
            ty,
            location: None,
            remat: Some(remat),
            reg: None,
            modified: false,
            references_left: references,
        }
    }

    /// Whether the register copy has to be written to the home slot before
    /// the register is reused.
    pub fn needs_writeback(&self) -> bool {
        self.modified && self.references_left > 0 && self.location.is_some()
    }

    pub fn stack_offset(&self) -> Option<i32> {
        match self.location {
            Some(StorageLocation::Stack(off)) => Some(off),
            None => None,
        }
    }
}

/// Maps local value indices to assignments.
#[derive(Debug, Default)]
pub struct ValueAssignmentManager {
    assignments: Vec<Option<ValueAssignment>>,
}

impl ValueAssignmentManager {
    pub fn new(value_count: usize) -> Self {
        Self {
            assignments: vec![None; value_count],
        }
    }

    pub fn create_assignment(&mut self, idx: ValLocalIdx, assignment: ValueAssignment) {
        if idx >= self.assignments.len() {
            self.assignments.resize(idx + 1, None);
        }
        self.assignments[idx] = Some(assignment);
    }

    pub fn get(&self, idx: ValLocalIdx) -> Option<&ValueAssignment> {
        self.assignments.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: ValLocalIdx) -> Option<&mut ValueAssignment> {
        self.assignments.get_mut(idx).and_then(Option::as_mut)
    }

    /// Decrement the use count; returns the register to release when the
    /// value just died.
    pub fn consume(&mut self, idx: ValLocalIdx) -> Option<AsmReg> {
        let va = self.get_mut(idx)?;
        va.references_left = va.references_left.saturating_sub(1);
        if va.references_left == 0 {
            va.modified = false;
            va.reg.take()
        } else {
            None
        }
    }

    /// Number of tracked values.
    pub fn len(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
