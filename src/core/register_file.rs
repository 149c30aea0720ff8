//! Register allocation and management.
//!
//! This module implements the RegisterFile that tracks which LIR value owns
//! each physical register, using a clock-based eviction algorithm. Eviction
//! is reported back to the caller, which emits the write-back code; the
//! register file itself never touches the instruction stream.

use std::fmt;

use super::value_assignment::ValLocalIdx;

/// Maximum number of register banks supported (GP, XMM).
pub const MAX_REGISTER_BANKS: usize = 4;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 64;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// Get the linear register index for array indexing.
    pub fn linear_index(&self, regs_per_bank: usize) -> usize {
        (self.bank as usize) * regs_per_bank + (self.id as usize)
    }

    /// Create from linear index.
    pub fn from_linear_index(index: usize, regs_per_bank: usize) -> Self {
        let bank = (index / regs_per_bank) as RegBank;
        let id = (index % regs_per_bank) as RegId;
        Self { bank, id }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    /// Build a set from a list of registers.
    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    /// Find first set register in the given bank, excluding specified registers.
    pub fn find_first_in_bank(&self, bank: RegBank, exclude: &RegBitSet) -> Option<RegId> {
        if bank as usize >= MAX_REGISTER_BANKS {
            return None;
        }

        let available = self.banks[bank as usize] & !exclude.banks[bank as usize];
        if available == 0 {
            return None;
        }

        Some(available.trailing_zeros() as RegId)
    }

    /// Clear all registers.
    pub fn clear_all(&mut self) {
        self.banks.fill(0);
    }
}

/// Assignment tracking which value owns a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// Local value index that owns this register.
    pub local_idx: ValLocalIdx,
}

impl Assignment {
    pub fn new(local_idx: ValLocalIdx) -> Self {
        Self { local_idx }
    }
}

/// Error types for register allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    /// No registers available in the requested bank.
    NoRegistersAvailable,
    /// Register is not allocated.
    RegisterNotAllocated,
    /// Register is already owned by another value.
    RegisterInUse,
    /// Invalid register bank or ID.
    InvalidRegister,
    /// Lock count underflow (too many unlocks).
    LockCountUnderflow,
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::NoRegistersAvailable => write!(f, "no registers available"),
            RegAllocError::RegisterNotAllocated => write!(f, "register is not allocated"),
            RegAllocError::RegisterInUse => write!(f, "register is already in use"),
            RegAllocError::InvalidRegister => write!(f, "invalid register"),
            RegAllocError::LockCountUnderflow => write!(f, "register lock count underflow"),
        }
    }
}

impl std::error::Error for RegAllocError {}

/// Result of an allocation: the register and the value it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub reg: AsmReg,
    /// Previous owner that must be written back by the caller.
    pub evicted: Option<Assignment>,
}

/// RegisterFile manages register ownership for a single function.
///
/// Uses a clock-based algorithm to pick eviction victims once a bank is
/// full. Locked registers are never chosen.
pub struct RegisterFile {
    /// Number of registers per bank (must be ≤ 64).
    regs_per_bank: usize,
    /// Total number of registers across all banks.
    total_regs: usize,

    /// Registers available for allocation (excludes SP, BP, scratch).
    allocatable: RegBitSet,
    /// Currently allocated registers.
    used: RegBitSet,
    /// Registers that cannot be evicted (locked).
    fixed: RegBitSet,

    /// Clock position for allocation in each bank.
    clocks: [RegId; MAX_REGISTER_BANKS],
    /// Which value owns each register.
    assignments: Vec<Option<Assignment>>,
    /// Lock count for each register (prevents eviction).
    lock_counts: Vec<u8>,
}

impl RegisterFile {
    /// Create a new register file with the given configuration.
    ///
    /// # Arguments
    /// * `regs_per_bank` - Number of registers per bank (max 64)
    /// * `num_banks` - Number of register banks (max 4)
    /// * `allocatable_regs` - Which registers are available for allocation
    pub fn new(regs_per_bank: usize, num_banks: usize, allocatable_regs: RegBitSet) -> Self {
        assert!(regs_per_bank <= MAX_REGISTERS_PER_BANK, "Too many registers per bank");
        assert!(num_banks <= MAX_REGISTER_BANKS, "Too many register banks");

        let total_regs = regs_per_bank * num_banks;

        Self {
            regs_per_bank,
            total_regs,
            allocatable: allocatable_regs,
            used: RegBitSet::new(),
            fixed: RegBitSet::new(),
            clocks: [0; MAX_REGISTER_BANKS],
            assignments: vec![None; total_regs],
            lock_counts: vec![0; total_regs],
        }
    }

    fn linear(&self, reg: AsmReg) -> Result<usize, RegAllocError> {
        let idx = reg.linear_index(self.regs_per_bank);
        if (reg.id as usize) >= self.regs_per_bank || idx >= self.total_regs {
            return Err(RegAllocError::InvalidRegister);
        }
        Ok(idx)
    }

    /// Allocate a register from the specified bank.
    ///
    /// First tries to find a free register, then uses the clock algorithm
    /// to pick a victim. The victim's assignment is returned so the caller
    /// can write the value back before the register is overwritten.
    pub fn allocate_reg(
        &mut self,
        bank: RegBank,
        local_idx: ValLocalIdx,
        exclude: Option<&RegBitSet>,
    ) -> Result<Allocation, RegAllocError> {
        let default_exclude = RegBitSet::new();
        let exclude = exclude.unwrap_or(&default_exclude);

        if let Some(reg_id) = self.find_first_free_in_bank(bank, exclude) {
            let reg = AsmReg::new(bank, reg_id);
            self.assign_register(reg, local_idx)?;
            return Ok(Allocation { reg, evicted: None });
        }

        if let Some(reg) = self.find_clocked_evictable(bank, exclude) {
            let evicted = self.get_assignment(reg);
            self.free_register(reg)?;
            self.assign_register(reg, local_idx)?;
            log::trace!("evicting {:?} from {:?} for value {}", evicted, reg, local_idx);
            return Ok(Allocation { reg, evicted });
        }

        Err(RegAllocError::NoRegistersAvailable)
    }

    /// Assign a specific register that the caller has already emptied.
    pub fn assign_specific(&mut self, reg: AsmReg, local_idx: ValLocalIdx) -> Result<(), RegAllocError> {
        if self.used.contains(reg) {
            return Err(RegAllocError::RegisterInUse);
        }
        self.assign_register(reg, local_idx)
    }

    /// Find first free register in bank, excluding specified registers.
    fn find_first_free_in_bank(&self, bank: RegBank, exclude: &RegBitSet) -> Option<RegId> {
        let mut unavailable = self.used.clone();
        unavailable.union(exclude);
        self.allocatable.find_first_in_bank(bank, &unavailable)
    }

    /// Find evictable register using clock algorithm.
    fn find_clocked_evictable(&mut self, bank: RegBank, exclude: &RegBitSet) -> Option<AsmReg> {
        if bank as usize >= MAX_REGISTER_BANKS {
            return None;
        }

        for _ in 0..self.regs_per_bank {
            let reg = AsmReg::new(bank, self.clocks[bank as usize]);

            // Advance clock for next allocation
            self.clocks[bank as usize] =
                (self.clocks[bank as usize] + 1) % (self.regs_per_bank as RegId);

            if self.allocatable.contains(reg)
                && self.used.contains(reg)
                && !self.fixed.contains(reg)
                && !exclude.contains(reg)
            {
                return Some(reg);
            }
        }

        None
    }

    /// Assign a register to a value.
    fn assign_register(&mut self, reg: AsmReg, local_idx: ValLocalIdx) -> Result<(), RegAllocError> {
        let linear_idx = self.linear(reg)?;
        self.used.set(reg);
        self.assignments[linear_idx] = Some(Assignment::new(local_idx));
        Ok(())
    }

    /// Free a register without spilling.
    pub fn free_register(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        let linear_idx = self.linear(reg)?;

        if !self.used.contains(reg) {
            return Err(RegAllocError::RegisterNotAllocated);
        }

        self.used.clear(reg);
        self.fixed.clear(reg);
        self.assignments[linear_idx] = None;
        self.lock_counts[linear_idx] = 0;
        Ok(())
    }

    /// Lock a register to prevent eviction.
    pub fn lock_register(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        let linear_idx = self.linear(reg)?;

        if !self.used.contains(reg) {
            return Err(RegAllocError::RegisterNotAllocated);
        }

        self.lock_counts[linear_idx] += 1;
        self.fixed.set(reg);
        Ok(())
    }

    /// Unlock a register, allowing eviction when lock count reaches zero.
    pub fn unlock_register(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        let linear_idx = self.linear(reg)?;

        if self.lock_counts[linear_idx] == 0 {
            return Err(RegAllocError::LockCountUnderflow);
        }

        self.lock_counts[linear_idx] -= 1;
        if self.lock_counts[linear_idx] == 0 {
            self.fixed.clear(reg);
        }
        Ok(())
    }

    /// Get the assignment for a register.
    pub fn get_assignment(&self, reg: AsmReg) -> Option<Assignment> {
        let linear_idx = reg.linear_index(self.regs_per_bank);
        if linear_idx < self.total_regs {
            self.assignments[linear_idx]
        } else {
            None
        }
    }

    /// All registers currently owned by a value.
    pub fn occupied(&self) -> Vec<(AsmReg, Assignment)> {
        self.assignments
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.map(|a| (AsmReg::from_linear_index(i, self.regs_per_bank), a)))
            .collect()
    }

    /// Drop every assignment.
    pub fn reset(&mut self) {
        self.used.clear_all();
        self.fixed.clear_all();
        self.clocks.fill(0);
        self.assignments.fill(None);
        self.lock_counts.fill(0);
    }
}
