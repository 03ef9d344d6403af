// Register model for the x86-64 backend. AsmReg names a register as a (bank, id) pair the way
// the hardware numbers them: bank GeneralPurpose ids 0..16 are rax, rcx, rdx, rbx, rsp, rbp,
// rsi, rdi, r8..r15 and bank Xmm ids 0..16 are xmm0..xmm15. The encoder maps an AsmReg to the
// iced-x86 operand of the width an instruction needs through the const tables below, so code
// generation can talk about "the first argument register" without committing to an operand
// size until it emits.

//! x86-64 register identifiers.

use iced_x86::code_asm::*;
use std::fmt;

use super::encoder::EncodingError;

/// Register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

/// A machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: u8,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: u8) -> Self {
        Self::new(RegBank::GeneralPurpose, id)
    }

    pub const fn xmm(id: u8) -> Self {
        Self::new(RegBank::Xmm, id)
    }

    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);

    pub const XMM0: AsmReg = AsmReg::xmm(0);
    pub const XMM1: AsmReg = AsmReg::xmm(1);
    pub const XMM2: AsmReg = AsmReg::xmm(2);

    pub fn is_gp(self) -> bool {
        self.bank == RegBank::GeneralPurpose
    }

    pub fn is_xmm(self) -> bool {
        self.bank == RegBank::Xmm
    }
}

const GP64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            RegBank::GeneralPurpose => match GP64_NAMES.get(self.id as usize) {
                Some(name) => f.write_str(name),
                None => write!(f, "gp{}", self.id),
            },
            RegBank::Xmm => write!(f, "xmm{}", self.id),
        }
    }
}

/// Operand width of an integer access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    B8,
    B16,
    B32,
    B64,
}

impl Width {
    /// Width for an access of `size` bytes.
    pub fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Width::B8),
            2 => Some(Width::B16),
            4 => Some(Width::B32),
            8 => Some(Width::B64),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::B8 => 1,
            Width::B16 => 2,
            Width::B32 => 4,
            Width::B64 => 8,
        }
    }
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
    r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi,
    r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di,
    r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil,
    r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
    xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
];

fn gp_index(reg: AsmReg) -> Result<usize, EncodingError> {
    if reg.bank != RegBank::GeneralPurpose || reg.id as usize >= GP64_REGS.len() {
        return Err(EncodingError::InvalidRegister(reg));
    }
    Ok(reg.id as usize)
}

pub(crate) fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    gp_index(reg).map(|i| GP64_REGS[i])
}

pub(crate) fn gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
    gp_index(reg).map(|i| GP32_REGS[i])
}

pub(crate) fn gp16(reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
    gp_index(reg).map(|i| GP16_REGS[i])
}

pub(crate) fn gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    gp_index(reg).map(|i| GP8_REGS[i])
}

pub(crate) fn xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
    if reg.bank != RegBank::Xmm {
        return Err(EncodingError::InvalidRegister(reg));
    }
    XMM_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_tables() {
        assert_eq!(gp64(AsmReg::RDI).unwrap(), rdi);
        assert_eq!(gp32(AsmReg::R9).unwrap(), r9d);
        assert_eq!(gp8(AsmReg::RSI).unwrap(), sil);
        assert_eq!(xmm(AsmReg::xmm(7)).unwrap(), xmm7);
        assert!(gp64(AsmReg::XMM0).is_err());
        assert!(xmm(AsmReg::RAX).is_err());
    }

    #[test]
    fn test_display_and_width() {
        assert_eq!(AsmReg::R10.to_string(), "r10");
        assert_eq!(AsmReg::XMM1.to_string(), "xmm1");
        assert_eq!(Width::from_size(4), Some(Width::B32));
        assert_eq!(Width::from_size(3), None);
        assert_eq!(Width::B16.bytes(), 2);
    }
}
