// This module implements the System V AMD64 calling convention as far as generated code needs
// it. SysVAssigner hands out argument registers in declaration order: integer and pointer
// arguments take RDI, RSI, RDX, RCX, R8, R9 and floating-point arguments take XMM0-XMM7, each
// class counting independently. Generated code never passes arguments on the stack, so an
// argument that finds its class exhausted gets no register and the caller reports it.
// Integer results come back in RAX and doubles in XMM0; variadic callees also expect AL to
// hold the number of vector registers used. FunctionFrame lays out the rbp-relative stack
// slots of one function and keeps the frame 16-byte aligned.

//! System V x86-64 calling convention.

use bumpalo::{collections::Vec as BumpVec, Bump};

use super::register::{AsmReg, RegBank};

/// Assigns argument and return registers.
pub trait CCAssigner {
    /// Register for the next argument of `bank`, or `None` when the bank is
    /// exhausted.
    fn assign_arg(&mut self, bank: RegBank) -> Option<AsmReg>;

    /// Register holding a return value of `bank`.
    fn ret_reg(&self, bank: RegBank) -> AsmReg;

    /// Start a new argument list.
    fn reset(&mut self);

    fn gp_used(&self) -> usize;

    fn xmm_used(&self) -> usize;
}

/// System V x86-64 register assignment.
#[derive(Debug, Default, Clone)]
pub struct SysVAssigner {
    gp_cnt: usize,
    xmm_cnt: usize,
}

impl SysVAssigner {
    pub const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::RDI,
        AsmReg::RSI,
        AsmReg::RDX,
        AsmReg::RCX,
        AsmReg::R8,
        AsmReg::R9,
    ];

    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::xmm(0),
        AsmReg::xmm(1),
        AsmReg::xmm(2),
        AsmReg::xmm(3),
        AsmReg::xmm(4),
        AsmReg::xmm(5),
        AsmReg::xmm(6),
        AsmReg::xmm(7),
    ];

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, bank: RegBank) -> Option<AsmReg> {
        match bank {
            RegBank::GeneralPurpose => {
                let reg = Self::GP_ARG_REGS.get(self.gp_cnt).copied()?;
                self.gp_cnt += 1;
                Some(reg)
            }
            RegBank::Xmm => {
                let reg = Self::XMM_ARG_REGS.get(self.xmm_cnt).copied()?;
                self.xmm_cnt += 1;
                Some(reg)
            }
        }
    }

    fn ret_reg(&self, bank: RegBank) -> AsmReg {
        match bank {
            RegBank::GeneralPurpose => AsmReg::RAX,
            RegBank::Xmm => AsmReg::XMM0,
        }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
    }

    fn gp_used(&self) -> usize {
        self.gp_cnt
    }

    fn xmm_used(&self) -> usize {
        self.xmm_cnt
    }
}

/// Largest frame, rounded to 16 bytes, that still fits a signed 32-bit displacement.
pub const MAX_FRAME_SIZE: u32 = (i32::MAX as u32) & !15;

/// Stack frame of one function, addressed relative to RBP.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Offset of each allocated slot, in allocation order.
    slots: BumpVec<'a, i32>,
    /// Bytes used below RBP.
    used: u32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            slots: BumpVec::new_in(arena),
            used: 0,
        }
    }

    /// Allocate a slot and return its (negative) RBP offset.
    ///
    /// Returns `None` once the frame would no longer be addressable with a
    /// 32-bit displacement; the frame is left unchanged in that case.
    pub fn allocate_slot(&mut self, size: usize, align: usize) -> Option<i32> {
        let align = u32::try_from(align.max(1)).ok()?;
        let size = u32::try_from(size.max(1)).ok()?;
        let used = self
            .used
            .checked_add(size)?
            .checked_add(align - 1)?
            & !(align - 1);
        if used > MAX_FRAME_SIZE {
            return None;
        }
        self.used = used;
        let offset = -i32::try_from(used).ok()?;
        self.slots.push(offset);
        Some(offset)
    }

    /// Offset of the `index`-th allocated slot.
    pub fn slot(&self, index: usize) -> Option<i32> {
        self.slots.get(index).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Size to subtract from RSP after `push rbp; mov rbp, rsp`.
    pub fn frame_size(&self) -> u32 {
        (self.used + 15) & !15
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_count_independently() {
        let mut cc = SysVAssigner::new();
        assert_eq!(cc.assign_arg(RegBank::GeneralPurpose), Some(AsmReg::RDI));
        assert_eq!(cc.assign_arg(RegBank::Xmm), Some(AsmReg::XMM0));
        assert_eq!(cc.assign_arg(RegBank::GeneralPurpose), Some(AsmReg::RSI));
        assert_eq!(cc.assign_arg(RegBank::Xmm), Some(AsmReg::XMM1));
        assert_eq!(cc.gp_used(), 2);
        assert_eq!(cc.xmm_used(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut cc = SysVAssigner::new();
        for _ in 0..6 {
            assert!(cc.assign_arg(RegBank::GeneralPurpose).is_some());
        }
        assert_eq!(cc.assign_arg(RegBank::GeneralPurpose), None);
        cc.reset();
        assert_eq!(cc.assign_arg(RegBank::GeneralPurpose), Some(AsmReg::RDI));
    }

    #[test]
    fn test_frame_layout() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);
        assert_eq!(frame.allocate_slot(4, 4), Some(-4));
        assert_eq!(frame.allocate_slot(8, 8), Some(-16));
        assert_eq!(frame.allocate_slot(1, 1), Some(-17));
        assert_eq!(frame.slot(1), Some(-16));
        assert_eq!(frame.slot_count(), 3);
        assert_eq!(frame.frame_size(), 32);
    }

    #[test]
    fn test_frame_limit() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);
        assert!(frame.allocate_slot(2_000_000_000, 1).is_some());
        assert_eq!(frame.allocate_slot(2_000_000_000, 1), None);
        assert_eq!(frame.allocate_slot(u32::MAX as usize, 1), None);
        assert_eq!(frame.allocate_slot(1 << 40, 1), None);
        assert_eq!(frame.slot_count(), 1);
        assert!(frame.frame_size() <= MAX_FRAME_SIZE);
        assert_eq!(frame.allocate_slot(8, 8), Some(-2_000_000_008));
    }
}
