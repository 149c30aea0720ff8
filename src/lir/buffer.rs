// This module implements the instruction buffer of one function. Instructions are stored in
// program order in an arena-backed bumpalo vector and addressed by dense LIns handles that
// carry the buffer id. The buffer indexes parameter instructions by position, counts call
// sites and guards, and lets branch and jump-table targets be bound after the branch was
// appended, which is how forward jumps are expressed. The buffer never reorders or removes
// anything; all filtering happens in the writer pipeline in front of it.

//! Arena-backed LIR instruction buffer.

use std::fmt;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use super::ins::{LIns, LInsData, Payload};
use super::opcode::LOpcode;
use super::printer;
use crate::core::error::BuildError;

/// Maximum number of function parameters.
pub const MAX_PARAMS: usize = 8;

/// Ordered instruction store for one function.
pub struct LirBuffer<'a> {
    id: u32,
    arena: &'a Bump,
    insns: BumpVec<'a, LInsData<'a>>,
    params: [Option<LIns>; MAX_PARAMS],
    call_count: usize,
    guard_count: usize,
}

impl<'a> LirBuffer<'a> {
    pub fn new(arena: &'a Bump, id: u32) -> Self {
        Self {
            id,
            arena,
            insns: BumpVec::new_in(arena),
            params: [None; MAX_PARAMS],
            call_count: 0,
            guard_count: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn arena(&self) -> &'a Bump {
        self.arena
    }

    /// Append an instruction and return its handle.
    pub fn append(&mut self, data: LInsData<'a>) -> LIns {
        let ins = LIns::new(self.id, self.insns.len() as u32);
        match data.payload {
            Payload::Param(i) if (i as usize) < MAX_PARAMS => {
                self.params[i as usize] = Some(ins);
            }
            Payload::Call(_) => self.call_count += 1,
            Payload::Guard(_) => self.guard_count += 1,
            _ => {}
        }
        self.insns.push(data);
        ins
    }

    /// Whether `ins` is a handle into this buffer.
    pub fn contains(&self, ins: LIns) -> bool {
        ins.buffer_id() == self.id && ins.index() < self.insns.len()
    }

    /// Instruction behind a handle of this buffer.
    ///
    /// # Panics
    /// Panics if the handle does not belong to this buffer.
    pub fn get(&self, ins: LIns) -> &LInsData<'a> {
        assert_eq!(ins.buffer_id(), self.id, "{} belongs to another buffer", ins);
        &self.insns[ins.index()]
    }

    /// First handle referenced by `data` that is not an instruction of this
    /// buffer: an operand, a bound branch target or a call argument.
    pub fn foreign_operand(&self, data: &LInsData<'a>) -> Option<LIns> {
        let call_args = data.call_site().map(|site| site.args).unwrap_or(&[]);
        data.operand_list()
            .chain(data.target())
            .chain(call_args.iter().copied())
            .find(|&op| !self.contains(op))
    }

    pub fn try_get(&self, ins: LIns) -> Option<&LInsData<'a>> {
        if ins.buffer_id() != self.id {
            return None;
        }
        self.insns.get(ins.index())
    }

    /// Instruction at a position.
    pub fn at(&self, index: usize) -> &LInsData<'a> {
        &self.insns[index]
    }

    /// Handle for a position.
    pub fn handle(&self, index: usize) -> LIns {
        LIns::new(self.id, index as u32)
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Instructions in program order.
    pub fn iter(&self) -> impl Iterator<Item = (LIns, &LInsData<'a>)> + '_ {
        self.insns
            .iter()
            .enumerate()
            .map(move |(i, data)| (LIns::new(self.id, i as u32), data))
    }

    pub fn last(&self) -> Option<LIns> {
        self.insns.len().checked_sub(1).map(|i| self.handle(i))
    }

    /// Parameter instructions, in position order.
    pub fn params(&self) -> impl Iterator<Item = LIns> + '_ {
        self.params.iter().map_while(|p| *p)
    }

    pub fn param(&self, index: usize) -> Option<LIns> {
        self.params.get(index).copied().flatten()
    }

    pub fn call_count(&self) -> usize {
        self.call_count
    }

    pub fn guard_count(&self) -> usize {
        self.guard_count
    }

    fn check_own(&self, ins: LIns) -> Result<(), BuildError> {
        if self.contains(ins) {
            Ok(())
        } else {
            Err(BuildError::ForeignInstruction { ins })
        }
    }

    fn check_label(&self, label: LIns) -> Result<(), BuildError> {
        self.check_own(label)?;
        if self.get(label).opcode != LOpcode::Label {
            return Err(BuildError::NotALabel { ins: label });
        }
        Ok(())
    }

    /// Bind the target of a `j`, `jt` or `jf` branch.
    pub fn set_target(&mut self, branch: LIns, label: LIns) -> Result<(), BuildError> {
        self.check_own(branch)?;
        self.check_label(label)?;
        let data = &mut self.insns[branch.index()];
        if !data.opcode.is_branch() {
            return Err(BuildError::NotABranch { ins: branch });
        }
        data.payload = Payload::Target(Some(label));
        Ok(())
    }

    /// Bind entry `index` of a jump table.
    pub fn set_table_target(&self, jtbl: LIns, index: usize, label: LIns) -> Result<(), BuildError> {
        self.check_own(jtbl)?;
        self.check_label(label)?;
        match self.get(jtbl).payload {
            Payload::Table(cells) => {
                let cell = cells
                    .get(index)
                    .ok_or(BuildError::TableIndexOutOfRange { ins: jtbl, index })?;
                cell.set(Some(label));
                Ok(())
            }
            _ => Err(BuildError::NotABranch { ins: jtbl }),
        }
    }
}

impl fmt::Display for LirBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ins, _) in self.iter() {
            writeln!(f, "{}", printer::format_ins(self, ins))?;
        }
        Ok(())
    }
}

impl fmt::Debug for LirBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LirBuffer")
            .field("id", &self.id)
            .field("len", &self.insns.len())
            .field("calls", &self.call_count)
            .field("guards", &self.guard_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_append_and_lookup() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 1);
        let start = buf.append(LInsData::op0(LOpcode::Start));
        let a = buf.append(LInsData::immi(3));
        let b = buf.append(LInsData::immi(4));
        let sum = buf.append(LInsData::op2(LOpcode::AddI, a, b));

        assert_eq!(start.index(), 0);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.get(sum).oprnd(1), Some(b));
        assert_eq!(buf.last(), Some(sum));
        assert!(buf.contains(a));
        assert!(!buf.contains(LIns::new(2, 1)));
        assert!(buf.try_get(LIns::new(2, 1)).is_none());
    }

    #[test]
    fn test_foreign_operand_detection() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 1);
        let a = buf.append(LInsData::immq(7));
        let stranger = LIns::new(2, 0);
        let unborn = LIns::new(1, 5);

        assert_eq!(buf.foreign_operand(&LInsData::op2(LOpcode::AddQ, a, a)), None);
        assert_eq!(buf.foreign_operand(&LInsData::op2(LOpcode::AddQ, a, stranger)), Some(stranger));
        assert_eq!(buf.foreign_operand(&LInsData::op1(LOpcode::RetQ, unborn)), Some(unborn));
        let jump = LInsData::new(LOpcode::J, &[], Payload::Target(Some(stranger)));
        assert_eq!(buf.foreign_operand(&jump), Some(stranger));
    }

    #[test]
    #[should_panic(expected = "belongs to another buffer")]
    fn test_get_rejects_foreign_handle() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 1);
        buf.append(LInsData::immq(7));
        buf.get(LIns::new(2, 0));
    }

    #[test]
    fn test_params_are_indexed() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        buf.append(LInsData::op0(LOpcode::Start));
        let p0 = buf.append(LInsData::new(LOpcode::Param, &[], Payload::Param(0)));
        let p1 = buf.append(LInsData::new(LOpcode::Param, &[], Payload::Param(1)));

        assert_eq!(buf.params().collect::<Vec<_>>(), vec![p0, p1]);
        assert_eq!(buf.param(1), Some(p1));
        assert_eq!(buf.param(2), None);
    }

    #[test]
    fn test_forward_branch_binding() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let j = buf.append(LInsData::new(LOpcode::J, &[], Payload::Target(None)));
        let value = buf.append(LInsData::immi(1));
        let label = buf.append(LInsData::op0(LOpcode::Label));

        assert_eq!(
            buf.set_target(j, value),
            Err(BuildError::NotALabel { ins: value })
        );
        assert_eq!(
            buf.set_target(value, label),
            Err(BuildError::NotABranch { ins: value })
        );
        buf.set_target(j, label).unwrap();
        assert_eq!(buf.get(j).target(), Some(label));
    }

    #[test]
    fn test_jump_table_binding() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new(&arena, 0);
        let index = buf.append(LInsData::immi(0));
        let cells: &[Cell<Option<LIns>>] = arena.alloc_slice_fill_with(2, |_| Cell::new(None));
        let jtbl = buf.append(LInsData::new(LOpcode::JTbl, &[index], Payload::Table(cells)));
        let label = buf.append(LInsData::op0(LOpcode::Label));

        buf.set_table_target(jtbl, 1, label).unwrap();
        assert_eq!(cells[1].get(), Some(label));
        assert_eq!(
            buf.set_table_target(jtbl, 2, label),
            Err(BuildError::TableIndexOutOfRange { ins: jtbl, index: 2 })
        );
    }
}
