//! Side exits and guard records.
//!
//! Every finalized function ends in one exit guard. The guard record learns
//! its code offset and absolute address once the function is installed, and
//! the generated code hands the record's address back in `rax` when control
//! reaches the exit.

use std::cell::Cell;
use std::fmt;

/// A point where control leaves a fragment.
pub struct SideExit<'a> {
    /// Fragment the exit belongs to.
    pub from: &'a str,
    /// Fragment control continues in, if any.
    pub target: Option<&'a str>,
    /// First guard attached to this exit.
    guard: Cell<Option<&'a GuardRecord<'a>>>,
}

impl<'a> SideExit<'a> {
    pub fn new(from: &'a str) -> Self {
        Self {
            from,
            target: None,
            guard: Cell::new(None),
        }
    }

    pub fn add_guard(&self, record: &'a GuardRecord<'a>) {
        if self.guard.get().is_none() {
            self.guard.set(Some(record));
        }
    }

    pub fn guard(&self) -> Option<&'a GuardRecord<'a>> {
        self.guard.get()
    }
}

impl fmt::Debug for SideExit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideExit")
            .field("from", &self.from)
            .field("target", &self.target)
            .field("guard", &self.guard.get().map(|g| g.id))
            .finish()
    }
}

/// One guard instruction's record.
#[derive(Debug)]
pub struct GuardRecord<'a> {
    pub exit: &'a SideExit<'a>,
    pub id: u32,
    /// Byte offset of the exit code inside the function.
    pub code_offset: Cell<Option<u32>>,
    /// Absolute address of the exit code once installed.
    pub address: Cell<Option<usize>>,
}

impl<'a> GuardRecord<'a> {
    pub fn new(exit: &'a SideExit<'a>, id: u32) -> Self {
        Self {
            exit,
            id,
            code_offset: Cell::new(None),
            address: Cell::new(None),
        }
    }

    /// Address of this record, as loaded into `rax` by the exit code.
    pub fn record_address(&self) -> usize {
        self as *const GuardRecord<'a> as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_exit_keeps_first_guard() {
        let arena = Bump::new();
        let exit: &SideExit = arena.alloc(SideExit::new("f"));
        let first: &GuardRecord = arena.alloc(GuardRecord::new(exit, 0));
        let second: &GuardRecord = arena.alloc(GuardRecord::new(exit, 1));

        exit.add_guard(first);
        exit.add_guard(second);
        assert_eq!(exit.guard().map(|g| g.id), Some(0));
        assert_eq!(first.exit.from, "f");
        assert!(first.code_offset.get().is_none());
        assert_ne!(first.record_address(), second.record_address());
    }
}
