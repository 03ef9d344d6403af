// This module provides x86-64 instruction encoding on top of the iced-x86 CodeAssembler, the
// machine code layer under function code generation. X64Encoder turns AsmReg references into
// real instructions: moves and width-aware loads and stores with sign or zero extension,
// integer ALU operations, shifts, division, comparisons with SETcc, SSE2 double arithmetic and
// conversions, stack manipulation, and control flow through labels. Labels are identified by
// index so callers can create them before they are placed, and the encoder inserts a NOP when
// two labels would land on one instruction. Instructions whose bytes the linker will patch
// (absolute address loads and external calls) are emitted as fixed raw encodings and returned
// as FixupSites, which resolve to byte offsets once the whole block has been assembled with
// instruction offset tracking. The module also encodes the linker's absolute jump stubs and
// disassembles code for inspection.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Decoder, DecoderOptions, Formatter, IcedError, Instruction, NasmFormatter};
use thiserror::Error;

use super::register::{gp16, gp32, gp64, gp8, xmm, AsmReg, Width};

/// Size of one linker jump stub: `jmp [rip+0]`, the 8-byte target, padding.
pub const JUMP_STUB_SIZE: usize = 16;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid register for operation: {0}")]
    InvalidRegister(AsmReg),

    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),

    #[error("assembly error: {0}")]
    AssemblyError(String),

    #[error("label #{0} is used but never placed")]
    UnboundLabel(usize),

    #[error("label #{0} placed twice")]
    LabelRebound(usize),
}

fn asm_error(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Condition codes for SETcc and Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
    Parity,
    NoParity,
    Sign,
}

/// Two-operand integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Imul,
}

/// Shifts by CL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

/// Scalar double operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Handle to a label owned by an [`X64Encoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Bytes of an emitted instruction that the linker patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupSite {
    instruction: usize,
    offset: usize,
}

/// Result of [`X64Encoder::finish`].
#[derive(Debug, Clone)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    instruction_offsets: Vec<u32>,
    label_offsets: Vec<Option<usize>>,
}

impl AssembledCode {
    /// Byte offset of a placed label.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.label_offsets.get(label.0).copied().flatten()
    }

    /// Byte offset of the patched field of a fixup site.
    pub fn site_offset(&self, site: FixupSite) -> Option<usize> {
        let start = *self.instruction_offsets.get(site.instruction)?;
        if start == u32::MAX {
            return None;
        }
        Some(start as usize + site.offset)
    }
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    labels: Vec<CodeLabel>,
    bound: Vec<bool>,
    /// Instruction index the most recent label was bound to.
    label_at: Option<usize>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_error)?;
        Ok(Self {
            assembler,
            labels: Vec::new(),
            bound: Vec::new(),
            label_at: None,
        })
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    // ==== LABELS ====

    pub fn new_label(&mut self) -> Label {
        self.labels.push(self.assembler.create_label());
        self.bound.push(false);
        Label(self.labels.len() - 1)
    }

    fn code_label(&self, label: Label) -> Result<CodeLabel, EncodingError> {
        self.labels
            .get(label.0)
            .copied()
            .ok_or(EncodingError::UnboundLabel(label.0))
    }

    /// Place `label` at the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> Result<(), EncodingError> {
        if self.bound.get(label.0).copied().unwrap_or(false) {
            return Err(EncodingError::LabelRebound(label.0));
        }
        let here = self.instruction_count();
        if self.label_at == Some(here) {
            // iced-x86 allows one label per instruction.
            self.assembler.nop().map_err(asm_error)?;
        }
        let mut code_label = self.code_label(label)?;
        self.assembler.set_label(&mut code_label).map_err(asm_error)?;
        self.labels[label.0] = code_label;
        self.bound[label.0] = true;
        self.label_at = Some(self.instruction_count());
        Ok(())
    }

    // ==== MOVES ====

    /// Register to register move. Handles GP, XMM and cross-bank moves.
    pub fn mov(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        match (dst.is_gp(), src.is_gp()) {
            (true, true) => self.assembler.mov(gp64(dst)?, gp64(src)?),
            (false, false) => self.assembler.movapd(xmm(dst)?, xmm(src)?),
            (false, true) => self.assembler.movq(xmm(dst)?, gp64(src)?),
            (true, false) => self.assembler.movq(gp64(dst)?, xmm(src)?),
        }
        .map_err(asm_error)
    }

    pub fn mov_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        if imm == 0 {
            let dst32 = gp32(dst)?;
            return self.assembler.xor(dst32, dst32).map_err(asm_error);
        }
        self.assembler.mov(gp64(dst)?, imm).map_err(asm_error)
    }

    /// Load `width` bytes at `[base + disp]` into `dst`, extending to 64 bits.
    pub fn load(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        disp: i32,
        width: Width,
        signed: bool,
    ) -> Result<(), EncodingError> {
        let base = gp64(base)?;
        let a = &mut self.assembler;
        match (width, signed) {
            (Width::B8, true) => a.movsx(gp64(dst)?, byte_ptr(base + disp)),
            (Width::B8, false) => a.movzx(gp32(dst)?, byte_ptr(base + disp)),
            (Width::B16, true) => a.movsx(gp64(dst)?, word_ptr(base + disp)),
            (Width::B16, false) => a.movzx(gp32(dst)?, word_ptr(base + disp)),
            (Width::B32, true) => a.movsxd(gp64(dst)?, dword_ptr(base + disp)),
            (Width::B32, false) => a.mov(gp32(dst)?, dword_ptr(base + disp)),
            (Width::B64, _) => a.mov(gp64(dst)?, qword_ptr(base + disp)),
        }
        .map_err(asm_error)
    }

    pub fn load_f64(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        self.assembler
            .movq(xmm(dst)?, qword_ptr(gp64(base)? + disp))
            .map_err(asm_error)
    }

    /// Store the low `width` bytes of `src` to `[base + disp]`.
    pub fn store(
        &mut self,
        base: AsmReg,
        disp: i32,
        src: AsmReg,
        width: Width,
    ) -> Result<(), EncodingError> {
        let base = gp64(base)?;
        let a = &mut self.assembler;
        match width {
            Width::B8 => a.mov(byte_ptr(base + disp), gp8(src)?),
            Width::B16 => a.mov(word_ptr(base + disp), gp16(src)?),
            Width::B32 => a.mov(dword_ptr(base + disp), gp32(src)?),
            Width::B64 => a.mov(qword_ptr(base + disp), gp64(src)?),
        }
        .map_err(asm_error)
    }

    pub fn store_f64(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler
            .movq(qword_ptr(gp64(base)? + disp), xmm(src)?)
            .map_err(asm_error)
    }

    pub fn lea(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        self.assembler
            .lea(gp64(dst)?, gp64(base)? + disp)
            .map_err(asm_error)
    }

    /// Re-extend the low `width` bits of `reg` to 64 bits.
    pub fn extend(&mut self, reg: AsmReg, width: Width, signed: bool) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match (width, signed) {
            (Width::B8, true) => a.movsx(gp64(reg)?, gp8(reg)?),
            (Width::B8, false) => a.movzx(gp32(reg)?, gp8(reg)?),
            (Width::B16, true) => a.movsx(gp64(reg)?, gp16(reg)?),
            (Width::B16, false) => a.movzx(gp32(reg)?, gp16(reg)?),
            (Width::B32, true) => a.movsxd(gp64(reg)?, gp32(reg)?),
            (Width::B32, false) => a.mov(gp32(reg)?, gp32(reg)?),
            (Width::B64, _) => return Ok(()),
        }
        .map_err(asm_error)
    }

    // ==== INTEGER ARITHMETIC ====

    pub fn alu(&mut self, op: AluOp, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (dst, src) = (gp64(dst)?, gp64(src)?);
        let a = &mut self.assembler;
        match op {
            AluOp::Add => a.add(dst, src),
            AluOp::Sub => a.sub(dst, src),
            AluOp::And => a.and(dst, src),
            AluOp::Or => a.or(dst, src),
            AluOp::Xor => a.xor(dst, src),
            AluOp::Imul => a.imul_2(dst, src),
        }
        .map_err(asm_error)
    }

    pub fn alu_imm(&mut self, op: AluOp, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        let a = &mut self.assembler;
        match op {
            AluOp::Add => a.add(dst, imm),
            AluOp::Sub => a.sub(dst, imm),
            AluOp::And => a.and(dst, imm),
            AluOp::Or => a.or(dst, imm),
            AluOp::Xor => a.xor(dst, imm),
            AluOp::Imul => a.imul_3(dst, dst, imm),
        }
        .map_err(asm_error)
    }

    /// Shift `dst` by CL.
    pub fn shift(&mut self, op: ShiftOp, dst: AsmReg) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        let a = &mut self.assembler;
        match op {
            ShiftOp::Shl => a.shl(dst, cl),
            ShiftOp::Shr => a.shr(dst, cl),
            ShiftOp::Sar => a.sar(dst, cl),
        }
        .map_err(asm_error)
    }

    pub fn shift_imm(&mut self, op: ShiftOp, dst: AsmReg, count: u32) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        let count = count as i32;
        let a = &mut self.assembler;
        match op {
            ShiftOp::Shl => a.shl(dst, count),
            ShiftOp::Shr => a.shr(dst, count),
            ShiftOp::Sar => a.sar(dst, count),
        }
        .map_err(asm_error)
    }

    /// Divide RAX by `divisor`: quotient in RAX, remainder in RDX.
    pub fn divide(&mut self, divisor: AsmReg, signed: bool) -> Result<(), EncodingError> {
        if divisor == AsmReg::RAX || divisor == AsmReg::RDX {
            return Err(EncodingError::InvalidRegister(divisor));
        }
        let divisor = gp64(divisor)?;
        if signed {
            self.assembler.cqo().map_err(asm_error)?;
            self.assembler.idiv(divisor).map_err(asm_error)
        } else {
            self.assembler.xor(edx, edx).map_err(asm_error)?;
            self.assembler.div(divisor).map_err(asm_error)
        }
    }

    pub fn neg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.neg(gp64(reg)?).map_err(asm_error)
    }

    pub fn not(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.not(gp64(reg)?).map_err(asm_error)
    }

    /// Complement bit `bit` of `reg`.
    pub fn flip_bit(&mut self, reg: AsmReg, bit: u32) -> Result<(), EncodingError> {
        self.assembler.btc(gp64(reg)?, bit as i32).map_err(asm_error)
    }

    pub fn cmp(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        self.assembler.cmp(gp64(left)?, gp64(right)?).map_err(asm_error)
    }

    pub fn test(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        self.assembler.test(gp64(left)?, gp64(right)?).map_err(asm_error)
    }

    /// Materialize `cond` as 0 or 1 in `dst`.
    pub fn set(&mut self, cond: Condition, dst: AsmReg) -> Result<(), EncodingError> {
        let low = gp8(dst)?;
        let a = &mut self.assembler;
        match cond {
            Condition::Equal => a.sete(low),
            Condition::NotEqual => a.setne(low),
            Condition::Less => a.setl(low),
            Condition::LessEqual => a.setle(low),
            Condition::Greater => a.setg(low),
            Condition::GreaterEqual => a.setge(low),
            Condition::Below => a.setb(low),
            Condition::BelowEqual => a.setbe(low),
            Condition::Above => a.seta(low),
            Condition::AboveEqual => a.setae(low),
            Condition::Parity => a.setp(low),
            Condition::NoParity => a.setnp(low),
            Condition::Sign => a.sets(low),
        }
        .map_err(asm_error)?;
        self.assembler.movzx(gp32(dst)?, low).map_err(asm_error)
    }

    // ==== SSE2 ====

    pub fn sse(&mut self, op: SseOp, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (dst, src) = (xmm(dst)?, xmm(src)?);
        let a = &mut self.assembler;
        match op {
            SseOp::Add => a.addsd(dst, src),
            SseOp::Sub => a.subsd(dst, src),
            SseOp::Mul => a.mulsd(dst, src),
            SseOp::Div => a.divsd(dst, src),
        }
        .map_err(asm_error)
    }

    pub fn ucomisd(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        self.assembler.ucomisd(xmm(left)?, xmm(right)?).map_err(asm_error)
    }

    /// Signed 64-bit integer to double.
    pub fn cvt_int_to_f64(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.cvtsi2sd(xmm(dst)?, gp64(src)?).map_err(asm_error)
    }

    /// Double to signed 64-bit integer, truncating.
    pub fn cvt_f64_to_int(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.assembler.cvttsd2si(gp64(dst)?, xmm(src)?).map_err(asm_error)
    }

    // ==== STACK AND CONTROL FLOW ====

    pub fn push(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.push(gp64(reg)?).map_err(asm_error)
    }

    pub fn pop(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.assembler.pop(gp64(reg)?).map_err(asm_error)
    }

    pub fn jmp(&mut self, target: Label) -> Result<(), EncodingError> {
        let label = self.code_label(target)?;
        self.assembler.jmp(label).map_err(asm_error)
    }

    pub fn jcc(&mut self, cond: Condition, target: Label) -> Result<(), EncodingError> {
        let label = self.code_label(target)?;
        let a = &mut self.assembler;
        match cond {
            Condition::Equal => a.je(label),
            Condition::NotEqual => a.jne(label),
            Condition::Less => a.jl(label),
            Condition::LessEqual => a.jle(label),
            Condition::Greater => a.jg(label),
            Condition::GreaterEqual => a.jge(label),
            Condition::Below => a.jb(label),
            Condition::BelowEqual => a.jbe(label),
            Condition::Above => a.ja(label),
            Condition::AboveEqual => a.jae(label),
            Condition::Parity => a.jp(label),
            Condition::NoParity => a.jnp(label),
            Condition::Sign => a.js(label),
        }
        .map_err(asm_error)
    }

    /// Direct call to a label in this block.
    pub fn call(&mut self, target: Label) -> Result<(), EncodingError> {
        let label = self.code_label(target)?;
        self.assembler.call(label).map_err(asm_error)
    }

    pub fn call_indirect(&mut self, target: AsmReg) -> Result<(), EncodingError> {
        self.assembler.call(gp64(target)?).map_err(asm_error)
    }

    /// `call rel32` with a zero displacement for the linker to patch.
    pub fn call_external(&mut self) -> Result<FixupSite, EncodingError> {
        let instruction = self.instruction_count();
        self.assembler.db(&[0xE8, 0, 0, 0, 0]).map_err(asm_error)?;
        Ok(FixupSite {
            instruction,
            offset: 1,
        })
    }

    /// `movabs dst, imm64` with a zero immediate for the linker to patch.
    pub fn mov_abs(&mut self, dst: AsmReg) -> Result<FixupSite, EncodingError> {
        let id = gp64(dst).map(|_| dst.id)?;
        let rex = 0x48 | (id >> 3);
        let opcode = 0xB8 | (id & 7);
        let instruction = self.instruction_count();
        self.assembler
            .db(&[rex, opcode, 0, 0, 0, 0, 0, 0, 0, 0])
            .map_err(asm_error)?;
        Ok(FixupSite {
            instruction,
            offset: 2,
        })
    }

    /// `rep stosb`: fill RCX bytes at RDI with AL.
    pub fn rep_stosb(&mut self) -> Result<(), EncodingError> {
        self.assembler.rep().stosb().map_err(asm_error)
    }

    /// Set AL to the number of vector registers used by a call.
    pub fn set_vector_count(&mut self, count: usize) -> Result<(), EncodingError> {
        self.assembler.mov(eax, count as i32).map_err(asm_error)
    }

    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push(AsmReg::RBP)?;
        self.mov(AsmReg::RBP, AsmReg::RSP)?;
        if frame_size > 0 {
            self.alu_imm(AluOp::Sub, AsmReg::RSP, frame_size as i32)?;
        }
        Ok(())
    }

    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.assembler.leave().map_err(asm_error)?;
        self.assembler.ret().map_err(asm_error)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_error)
    }

    pub fn nop(&mut self) -> Result<(), EncodingError> {
        self.assembler.nop().map_err(asm_error)
    }

    /// Assemble everything emitted so far at offset 0.
    pub fn finish(mut self) -> Result<AssembledCode, EncodingError> {
        if let Some(index) = self.bound.iter().position(|b| !b) {
            return Err(EncodingError::UnboundLabel(index));
        }
        if self.label_at == Some(self.instruction_count()) {
            self.assembler.int3().map_err(asm_error)?;
        }

        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_error)?;

        let mut label_offsets = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            let ip = result.label_ip(label).map_err(asm_error)?;
            label_offsets.push(Some(ip as usize));
        }

        Ok(AssembledCode {
            code: result.inner.code_buffer,
            instruction_offsets: result.inner.new_instruction_offsets,
            label_offsets,
        })
    }
}

/// Encode a linker jump stub that transfers control to `target`.
pub fn encode_jump_stub(target: u64) -> Result<Vec<u8>, EncodingError> {
    let mut a = CodeAssembler::new(64).map_err(asm_error)?;
    // jmp qword ptr [rip+0], followed by the target it reads.
    a.db(&[0xFF, 0x25, 0, 0, 0, 0]).map_err(asm_error)?;
    a.dq(&[target]).map_err(asm_error)?;
    a.db(&[0xCC, 0xCC]).map_err(asm_error)?;
    let bytes = a.assemble(0).map_err(asm_error)?;
    debug_assert_eq!(bytes.len(), JUMP_STUB_SIZE);
    Ok(bytes)
}

/// Disassemble `code` as if loaded at `ip`, one NASM-syntax line per
/// instruction prefixed with its address.
pub fn disassemble(code: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut instruction = Instruction::default();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let mut text = String::new();
        formatter.format(&instruction, &mut text);
        lines.push(format!("{:016x}  {}", instruction.ip(), text));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(code: &[u8]) -> Vec<String> {
        disassemble(code, 0)
            .into_iter()
            .map(|line| line[18..].to_string())
            .collect()
    }

    #[test]
    fn test_basic_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.mov(AsmReg::RAX, AsmReg::RCX).unwrap();
        encoder.alu(AluOp::Add, AsmReg::RAX, AsmReg::RDX).unwrap();
        encoder.ret().unwrap();
        let code = encoder.finish().unwrap().code;
        assert_eq!(decode(&code), vec!["mov rax,rcx", "add rax,rdx", "ret"]);
    }

    #[test]
    fn test_loads_extend() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.load(AsmReg::RAX, AsmReg::RBP, -4, Width::B32, true).unwrap();
        encoder.load(AsmReg::RAX, AsmReg::RAX, 0, Width::B8, false).unwrap();
        encoder.extend(AsmReg::RAX, Width::B16, true).unwrap();
        let code = encoder.finish().unwrap().code;
        let lines = decode(&code);
        assert!(lines[0].starts_with("movsxd rax,"));
        assert!(lines[1].starts_with("movzx eax,byte"));
        assert_eq!(lines[2], "movsx rax,ax");
    }

    #[test]
    fn test_labels_and_jumps() {
        let mut encoder = X64Encoder::new().unwrap();
        let top = encoder.new_label();
        let exit = encoder.new_label();
        encoder.bind(top).unwrap();
        encoder.test(AsmReg::RAX, AsmReg::RAX).unwrap();
        encoder.jcc(Condition::Equal, exit).unwrap();
        encoder.alu_imm(AluOp::Sub, AsmReg::RAX, 1).unwrap();
        encoder.jmp(top).unwrap();
        encoder.bind(exit).unwrap();
        encoder.ret().unwrap();

        let assembled = encoder.finish().unwrap();
        assert_eq!(assembled.label_offset(top), Some(0));
        let exit_offset = assembled.label_offset(exit).unwrap();
        assert_eq!(assembled.code[exit_offset], 0xC3);
    }

    #[test]
    fn test_two_labels_one_position() {
        let mut encoder = X64Encoder::new().unwrap();
        let a = encoder.new_label();
        let b = encoder.new_label();
        encoder.bind(a).unwrap();
        encoder.bind(b).unwrap();
        encoder.ret().unwrap();
        let assembled = encoder.finish().unwrap();
        assert_eq!(assembled.label_offset(a), Some(0));
        assert_eq!(assembled.label_offset(b), Some(1));
    }

    #[test]
    fn test_unbound_label_rejected() {
        let mut encoder = X64Encoder::new().unwrap();
        let never = encoder.new_label();
        encoder.jmp(never).unwrap();
        assert!(matches!(encoder.finish(), Err(EncodingError::UnboundLabel(0))));
    }

    #[test]
    fn test_fixup_sites() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.push(AsmReg::RBP).unwrap();
        let load = encoder.mov_abs(AsmReg::RAX).unwrap();
        let call = encoder.call_external().unwrap();
        let load_r11 = encoder.mov_abs(AsmReg::R11).unwrap();
        let assembled = encoder.finish().unwrap();

        assert_eq!(assembled.site_offset(load), Some(3));
        assert_eq!(assembled.site_offset(call), Some(12));
        assert_eq!(assembled.site_offset(load_r11), Some(18));
        assert_eq!(&assembled.code[1..3], &[0x48, 0xB8]);
        assert_eq!(&assembled.code[16..18], &[0x49, 0xBB]);
        let lines = decode(&assembled.code);
        assert_eq!(lines[1], "mov rax,0");
        assert!(lines[2].starts_with("call "));
    }

    #[test]
    fn test_jump_stub() {
        let stub = encode_jump_stub(0x1122_3344_5566_7788).unwrap();
        assert_eq!(stub.len(), JUMP_STUB_SIZE);
        assert_eq!(&stub[..2], &[0xFF, 0x25]);
        assert_eq!(
            u64::from_le_bytes(stub[6..14].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
        let lines = decode(&stub[..6]);
        assert!(lines[0].starts_with("jmp qword"));
    }

    #[test]
    fn test_prologue_epilogue() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.emit_prologue(32).unwrap();
        encoder.emit_epilogue().unwrap();
        let code = encoder.finish().unwrap().code;
        assert_eq!(
            decode(&code),
            vec!["push rbp", "mov rbp,rsp", "sub rsp,20h", "leave", "ret"]
        );
    }
}
