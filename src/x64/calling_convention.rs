// This module implements the System V AMD64 calling convention used for every call lirjit
// emits and for the functions it generates. CCAssigner / SysVAssigner place arguments the
// way the ABI does: integer arguments in RDI, RSI, RDX, RCX, R8, R9, floating-point arguments
// in XMM0-XMM7, the rest in 8-byte stack slots, results in RAX or XMM0. The cdecl, fastcall,
// stdcall and thiscall tags carried by call descriptors all lower to this convention on
// x86-64. FunctionFrame describes the generated functions' stack layout: saved RBP, the five
// callee-saved registers RBX and R12-R15, 8-byte home slots and stack areas below them, and
// the outgoing argument area at the bottom, with RSP kept 16-byte aligned at every call.

//! System V x86-64 calling convention implementation.

use bumpalo::{collections::Vec as BumpVec, Bump};

use super::encoder::{R11, RBP, RSP, XMM15};
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::lir::{AbiKind, LTy};

/// Register banks for different register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

impl RegBank {
    /// Bank that holds values of type `ty`.
    pub fn for_type(ty: LTy) -> RegBank {
        if ty.is_float() {
            RegBank::Xmm
        } else {
            RegBank::GeneralPurpose
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy)]
pub struct CCAssignment {
    /// Register bank this argument belongs to.
    pub bank: RegBank,
    /// Size of the argument in bytes.
    pub size: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Offset from the stack pointer at the call (if assigned to stack).
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(bank: RegBank, size: u32) -> Self {
        Self {
            bank,
            size,
            reg: None,
            stack_off: None,
        }
    }

    /// Assignment for a LIR value of type `ty`.
    pub fn for_type(ty: LTy) -> Self {
        Self::new(RegBank::for_type(ty), ty.size_bytes().max(4))
    }
}

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers available for allocation.
    pub allocatable_regs: RegBitSet,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Get calling convention information.
    fn get_ccinfo(&self) -> &CCInfo;

    /// Assign an argument according to the calling convention.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value according to the calling convention.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new call.
    fn reset(&mut self);

    /// Total stack space needed for arguments, 16-byte aligned.
    fn get_stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
pub struct SysVAssigner {
    cc_info: CCInfo,
    gp_cnt: usize,
    xmm_cnt: usize,
    stack: u32,
    ret_gp_cnt: usize,
    ret_xmm_cnt: usize,
}

impl Default for SysVAssigner {
    fn default() -> Self {
        // Everything except RSP, RBP and the R11 / XMM15 scratch pair.
        let mut allocatable = RegBitSet::new();
        for i in 0..16 {
            let reg = AsmReg::new(0, i);
            if reg != RSP && reg != RBP && reg != R11 {
                allocatable.set(reg);
            }
        }
        for i in 0..16 {
            let reg = AsmReg::new(1, i);
            if reg != XMM15 {
                allocatable.set(reg);
            }
        }

        Self {
            cc_info: CCInfo {
                allocatable_regs: allocatable,
            },
            gp_cnt: 0,
            xmm_cnt: 0,
            stack: 0,
            ret_gp_cnt: 0,
            ret_xmm_cnt: 0,
        }
    }
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::new(0, 7), // RDI
        AsmReg::new(0, 6), // RSI
        AsmReg::new(0, 2), // RDX
        AsmReg::new(0, 1), // RCX
        AsmReg::new(0, 8), // R8
        AsmReg::new(0, 9), // R9
    ];

    /// System V x86-64 XMM argument registers.
    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::new(1, 0),
        AsmReg::new(1, 1),
        AsmReg::new(1, 2),
        AsmReg::new(1, 3),
        AsmReg::new(1, 4),
        AsmReg::new(1, 5),
        AsmReg::new(1, 6),
        AsmReg::new(1, 7),
    ];

    /// Callee-saved registers: RBX, R12-R15.
    pub const CALLEE_SAVED: [AsmReg; 5] = [
        AsmReg::new(0, 3),
        AsmReg::new(0, 12),
        AsmReg::new(0, 13),
        AsmReg::new(0, 14),
        AsmReg::new(0, 15),
    ];

    const RET_GP_REGS: [AsmReg; 2] = [
        AsmReg::new(0, 0), // RAX
        AsmReg::new(0, 2), // RDX
    ];

    const RET_XMM_REGS: [AsmReg; 2] = [
        AsmReg::new(1, 0), // XMM0
        AsmReg::new(1, 1), // XMM1
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Assigner for a call carrying `abi`. Every tag maps to System V here.
    pub fn for_abi(abi: AbiKind) -> Self {
        log::trace!("{} call lowered with the System V convention", abi);
        Self::new()
    }

    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }
}

impl CCAssigner for SysVAssigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        let (regs, cnt): (&[AsmReg], &mut usize) = match arg.bank {
            RegBank::GeneralPurpose => (&Self::GP_ARG_REGS, &mut self.gp_cnt),
            RegBank::Xmm => (&Self::XMM_ARG_REGS, &mut self.xmm_cnt),
        };
        if *cnt < regs.len() {
            arg.reg = Some(regs[*cnt]);
            *cnt += 1;
        } else {
            // Each stack slot is 8 bytes in System V.
            self.stack = Self::align_up(self.stack, 8);
            arg.stack_off = Some(self.stack as i32);
            self.stack += 8;
        }
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        match arg.bank {
            RegBank::GeneralPurpose => {
                if self.ret_gp_cnt < Self::RET_GP_REGS.len() {
                    arg.reg = Some(Self::RET_GP_REGS[self.ret_gp_cnt]);
                    self.ret_gp_cnt += 1;
                }
            }
            RegBank::Xmm => {
                if self.ret_xmm_cnt < Self::RET_XMM_REGS.len() {
                    arg.reg = Some(Self::RET_XMM_REGS[self.ret_xmm_cnt]);
                    self.ret_xmm_cnt += 1;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
        self.stack = 0;
        self.ret_gp_cnt = 0;
        self.ret_xmm_cnt = 0;
    }

    fn get_stack_size(&self) -> u32 {
        Self::align_up(self.stack, 16)
    }
}

/// Stack frame of one generated function.
///
/// ```text
/// rbp + 16   stack-passed parameters 6 and 7
/// rbp + 8    return address
/// rbp        saved rbp
/// rbp - 40   rbx, r12..r15
/// rbp - 48   first home slot, then stack areas, growing down
/// rsp        outgoing call arguments
/// ```
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Callee-saved registers pushed after rbp, in push order.
    pub saved_registers: BumpVec<'a, AsmReg>,
    /// Bytes subtracted from rsp after the pushes.
    pub frame_size: u32,
    /// Lowest rbp-relative offset in use.
    pub spill_offset: i32,
    /// Largest outgoing argument area of any call.
    pub outgoing_size: u32,
}

impl<'a> FunctionFrame<'a> {
    /// Frame with the System V callee-saved registers already reserved.
    pub fn new(arena: &'a Bump) -> Self {
        let mut frame = Self {
            saved_registers: BumpVec::new_in(arena),
            frame_size: 0,
            spill_offset: 0,
            outgoing_size: 0,
        };
        for reg in SysVAssigner::CALLEE_SAVED {
            frame.add_saved_register(reg);
        }
        frame
    }

    /// Add a callee-saved register that needs preservation.
    fn add_saved_register(&mut self, reg: AsmReg) {
        if !self.saved_registers.contains(&reg) {
            self.saved_registers.push(reg);
            self.spill_offset -= 8;
        }
    }

    /// Allocate a new spill slot and return its offset.
    pub fn allocate_spill_slot(&mut self, size: u32) -> i32 {
        let aligned_size = size.max(1).div_ceil(8) * 8;
        self.spill_offset -= aligned_size as i32;
        self.spill_offset
    }

    /// Reserve a stack area of `size` bytes; returns the offset of its lowest byte.
    pub fn allocate_area(&mut self, size: u32) -> i32 {
        let aligned_size = size.max(1).div_ceil(8) * 8;
        self.spill_offset -= aligned_size as i32;
        self.spill_offset
    }

    /// Make room for a call's stack arguments.
    pub fn reserve_outgoing(&mut self, bytes: u32) {
        self.outgoing_size = self.outgoing_size.max(bytes);
    }

    /// Bytes between rbp and rsp once the frame is set up.
    pub fn total_size(&self) -> u32 {
        let used = (-self.spill_offset) as u32 + self.outgoing_size;
        used.div_ceil(16) * 16
    }

    /// Compute the final rsp adjustment.
    pub fn calculate_frame_size(&mut self) {
        let pushed = self.saved_registers.len() as u32 * 8;
        self.frame_size = self.total_size() - pushed;
    }
}
