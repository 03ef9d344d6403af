// Function code generation for the typed C AST. The generator is a simple stack machine over
// the System V frame: every expression leaves its value in RAX (integers and pointers,
// canonically sign- or zero-extended to 64 bits) or XMM0 (doubles), and binary operators
// spill the left operand with a push while the right one is computed. The number of
// outstanding pushes is tracked so calls can pad RSP to the 16-byte boundary the ABI
// requires. Locals live in rbp-relative slots handed out by FunctionFrame; incoming
// arguments assigned by SysVAssigner are spilled to their slots in the prologue. Every
// address the code needs that is only known at link time (other functions of the unit,
// globals, string literals, host symbols) is emitted as a fixup site and recorded as a
// PendingReloc, which the backend turns into object relocations once the text section is
// assembled and label offsets are final.

//! Per-function x86-64 code generation.

use bumpalo::Bump;
use hashbrown::HashMap;
use thiserror::Error;

use super::calling_convention::{CCAssigner, FunctionFrame, SysVAssigner, MAX_FRAME_SIZE};
use super::encoder::{
    AluOp, Condition, EncodingError, FixupSite, Label, ShiftOp, SseOp, X64Encoder,
};
use super::register::{AsmReg, RegBank, Width};
use crate::cfront::ast::{
    BinOp, Callee, CmpOp, Expr, ExprKind, Function, Stmt, TranslationUnit, UnOp,
};
use crate::cfront::types::Type;
use crate::core::object::{RelocKind, SectionId};
use crate::core::registry::SymbolKind;

/// Errors raised while generating a function.
#[derive(Debug, Error)]
pub enum FunctionCodegenError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    #[error("stack frame exceeds {limit} bytes at local '{local}'")]
    FrameTooLarge { local: String, limit: u32 },
}

type Result<T> = std::result::Result<T, FunctionCodegenError>;

/// Where a pending relocation points before section offsets are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingTarget {
    /// A function of this unit, by its text label.
    Label(Label),
    /// A byte offset inside a data section of this unit.
    Section(SectionId, usize),
    /// A symbol the host must provide.
    External(String),
}

/// A relocation whose site is still an instruction-relative fixup.
#[derive(Debug, Clone)]
pub struct PendingReloc {
    pub site: FixupSite,
    pub kind: RelocKind,
    pub target: PendingTarget,
    pub addend: i64,
    pub expected: Option<SymbolKind>,
}

/// Unit-wide addresses shared by all functions.
pub struct UnitLayout<'a> {
    pub functions: HashMap<&'a str, Label>,
    pub data: HashMap<&'a str, (SectionId, usize)>,
    pub strings: Vec<(SectionId, usize)>,
}

impl<'a> UnitLayout<'a> {
    /// Relocation target for the address of global `name`.
    pub fn global_target(&self, name: &str) -> PendingTarget {
        if let Some(label) = self.functions.get(name) {
            PendingTarget::Label(*label)
        } else if let Some((section, offset)) = self.data.get(name) {
            PendingTarget::Section(*section, *offset)
        } else {
            PendingTarget::External(name.to_string())
        }
    }
}

/// Result location of an lvalue.
#[derive(Debug, Clone, Copy)]
enum Place {
    /// `[rbp + disp]`.
    Frame(i32),
    /// Address held in RAX.
    Rax,
}

fn width_of(ty: Type<'_>) -> Width {
    Width::from_size(ty.size()).unwrap_or(Width::B64)
}

fn is_signed(ty: Type<'_>) -> bool {
    ty.int_type().is_some_and(|int| int.signed)
}

/// Generates one function into a shared encoder.
pub struct FunctionCodegen<'a, 'u> {
    encoder: &'u mut X64Encoder,
    layout: &'u UnitLayout<'a>,
    relocs: &'u mut Vec<PendingReloc>,
    function: &'u Function<'a>,
    frame: FunctionFrame<'u>,
    local_offsets: Vec<i32>,
    /// Pushes currently outstanding on the machine stack.
    depth: usize,
    /// (continue, break) targets of the enclosing loops.
    loops: Vec<(Label, Label)>,
    ret_label: Label,
}

impl<'a, 'u> FunctionCodegen<'a, 'u> {
    pub fn new(
        arena: &'u Bump,
        encoder: &'u mut X64Encoder,
        layout: &'u UnitLayout<'a>,
        relocs: &'u mut Vec<PendingReloc>,
        function: &'u Function<'a>,
    ) -> Result<Self> {
        let ret_label = encoder.new_label();
        let mut frame = FunctionFrame::new(arena);
        let params = function.signature.params.len();
        let local_offsets = function
            .locals
            .iter()
            .enumerate()
            .map(|(i, local)| {
                let slot = if i < params {
                    frame.allocate_slot(8, 8)
                } else {
                    frame.allocate_slot(local.ty.size(), local.ty.align())
                };
                slot.ok_or_else(|| {
                    FunctionCodegenError::FrameTooLarge {
                        local: local.name.to_string(),
                        limit: MAX_FRAME_SIZE,
                    }
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            encoder,
            layout,
            relocs,
            function,
            frame,
            local_offsets,
            depth: 0,
            loops: Vec::new(),
            ret_label,
        })
    }

    /// Emit the whole function at `entry`.
    pub fn generate(mut self, entry: Label) -> Result<()> {
        log::trace!(
            "generating {} ({} locals, frame {} bytes)",
            self.function.name,
            self.frame.slot_count(),
            self.frame.frame_size()
        );
        self.encoder.bind(entry)?;
        self.encoder.emit_prologue(self.frame.frame_size())?;
        self.spill_params()?;

        for stmt in self.function.body {
            self.stmt(stmt)?;
        }

        // Falling off the end returns 0.
        self.encoder.mov_imm(AsmReg::RAX, 0)?;
        self.encoder.bind(self.ret_label)?;
        self.encoder.emit_epilogue()?;
        Ok(())
    }

    fn spill_params(&mut self) -> Result<()> {
        let mut cc = SysVAssigner::new();
        for (i, param) in self.function.signature.params.iter().enumerate() {
            let bank = if param.is_double() {
                RegBank::Xmm
            } else {
                RegBank::GeneralPurpose
            };
            let reg = cc.assign_arg(bank).ok_or_else(|| {
                FunctionCodegenError::Unsupported("stack-passed parameters".to_string())
            })?;
            let offset = self.local_offsets[i];
            if param.is_double() {
                self.encoder.store_f64(AsmReg::RBP, offset, reg)?;
            } else {
                self.encoder.store(AsmReg::RBP, offset, reg, Width::B64)?;
            }
        }
        Ok(())
    }

    // ==== STACK ====

    fn push(&mut self, reg: AsmReg) -> Result<()> {
        self.encoder.push(reg)?;
        self.depth += 1;
        Ok(())
    }

    fn pop(&mut self, reg: AsmReg) -> Result<()> {
        self.encoder.pop(reg)?;
        self.depth -= 1;
        Ok(())
    }

    /// Push the current value of type `ty`.
    fn push_value(&mut self, ty: Type<'a>) -> Result<()> {
        if ty.is_double() {
            self.encoder.mov(AsmReg::RAX, AsmReg::XMM0)?;
        }
        self.push(AsmReg::RAX)
    }

    // ==== LOADS AND STORES ====

    fn load_value(&mut self, ty: Type<'a>, base: AsmReg, disp: i32) -> Result<()> {
        match ty {
            Type::Double => self.encoder.load_f64(AsmReg::XMM0, base, disp)?,
            Type::Int(_) | Type::Pointer(_) => {
                self.encoder
                    .load(AsmReg::RAX, base, disp, width_of(ty), is_signed(ty))?;
            }
            Type::Array(..) | Type::Function(_) => {
                if base != AsmReg::RAX || disp != 0 {
                    self.encoder.lea(AsmReg::RAX, base, disp)?;
                }
            }
            Type::Void => {}
        }
        Ok(())
    }

    fn store_value(&mut self, ty: Type<'a>, base: AsmReg, disp: i32) -> Result<()> {
        match ty {
            Type::Double => self.encoder.store_f64(base, disp, AsmReg::XMM0)?,
            Type::Int(_) | Type::Pointer(_) => {
                self.encoder.store(base, disp, AsmReg::RAX, width_of(ty))?;
            }
            other => {
                return Err(FunctionCodegenError::Unsupported(format!(
                    "store of type '{other}'"
                )))
            }
        }
        Ok(())
    }

    // ==== ADDRESSES ====

    fn address_reloc(&mut self, target: PendingTarget, expected: Option<SymbolKind>) -> Result<()> {
        let site = self.encoder.mov_abs(AsmReg::RAX)?;
        self.relocs.push(PendingReloc {
            site,
            kind: RelocKind::Abs64,
            target,
            addend: 0,
            expected,
        });
        Ok(())
    }

    fn global_address(&mut self, name: &str, ty: Type<'a>) -> Result<()> {
        let target = self.layout.global_target(name);
        let expected = match target {
            PendingTarget::External(_) => Some(if ty.is_function() {
                SymbolKind::Function
            } else {
                SymbolKind::Data
            }),
            _ => None,
        };
        self.address_reloc(target, expected)
    }

    fn string_address(&mut self, id: usize) -> Result<()> {
        let (section, offset) = self.layout.strings.get(id).copied().ok_or_else(|| {
            FunctionCodegenError::Unsupported(format!("unknown string literal #{id}"))
        })?;
        self.address_reloc(PendingTarget::Section(section, offset), None)
    }

    fn place(&mut self, e: &Expr<'a>) -> Result<Place> {
        match e.kind {
            ExprKind::Local(id) => Ok(Place::Frame(self.local_offsets[id])),
            ExprKind::Global(name) => {
                self.global_address(name, e.ty)?;
                Ok(Place::Rax)
            }
            ExprKind::Deref(pointer) => {
                self.expr(pointer)?;
                Ok(Place::Rax)
            }
            ExprKind::StrLit(id) => {
                self.string_address(id)?;
                Ok(Place::Rax)
            }
            _ => Err(FunctionCodegenError::Unsupported(
                "address of a non-lvalue".to_string(),
            )),
        }
    }

    fn address_into_rax(&mut self, e: &Expr<'a>) -> Result<()> {
        if let Place::Frame(disp) = self.place(e)? {
            self.encoder.lea(AsmReg::RAX, AsmReg::RBP, disp)?;
        }
        Ok(())
    }

    // ==== CONVERSIONS ====

    /// Convert the current value from `from` to `to` in place.
    fn convert(&mut self, from: Type<'a>, to: Type<'a>) -> Result<()> {
        if to.is_void() || from == to {
            return Ok(());
        }
        match (from.is_double(), to.is_double()) {
            (false, false) => {
                self.encoder.extend(AsmReg::RAX, width_of(to), is_signed(to))?;
            }
            (false, true) => {
                let unsigned64 = from.size() == 8 && !is_signed(from);
                if !unsigned64 {
                    self.encoder.cvt_int_to_f64(AsmReg::XMM0, AsmReg::RAX)?;
                    return Ok(());
                }
                // Halve values with the top bit set, keeping the low bit for
                // rounding, then double the result.
                let big = self.encoder.new_label();
                let done = self.encoder.new_label();
                self.encoder.test(AsmReg::RAX, AsmReg::RAX)?;
                self.encoder.jcc(Condition::Sign, big)?;
                self.encoder.cvt_int_to_f64(AsmReg::XMM0, AsmReg::RAX)?;
                self.encoder.jmp(done)?;
                self.encoder.bind(big)?;
                self.encoder.mov(AsmReg::RCX, AsmReg::RAX)?;
                self.encoder.shift_imm(ShiftOp::Shr, AsmReg::RCX, 1)?;
                self.encoder.alu_imm(AluOp::And, AsmReg::RAX, 1)?;
                self.encoder.alu(AluOp::Or, AsmReg::RCX, AsmReg::RAX)?;
                self.encoder.cvt_int_to_f64(AsmReg::XMM0, AsmReg::RCX)?;
                self.encoder.sse(SseOp::Add, AsmReg::XMM0, AsmReg::XMM0)?;
                self.encoder.bind(done)?;
            }
            (true, false) => {
                self.encoder.cvt_f64_to_int(AsmReg::RAX, AsmReg::XMM0)?;
                self.encoder.extend(AsmReg::RAX, width_of(to), is_signed(to))?;
            }
            (true, true) => {}
        }
        Ok(())
    }

    // ==== OPERATORS ====

    /// `RAX = RAX op RCX` in type `ty`.
    fn int_op(&mut self, op: BinOp, ty: Type<'a>) -> Result<()> {
        let signed = is_signed(ty);
        let (rax, rcx) = (AsmReg::RAX, AsmReg::RCX);
        match op {
            BinOp::Add => self.encoder.alu(AluOp::Add, rax, rcx)?,
            BinOp::Sub => self.encoder.alu(AluOp::Sub, rax, rcx)?,
            BinOp::Mul => self.encoder.alu(AluOp::Imul, rax, rcx)?,
            BinOp::BitAnd => self.encoder.alu(AluOp::And, rax, rcx)?,
            BinOp::BitOr => self.encoder.alu(AluOp::Or, rax, rcx)?,
            BinOp::BitXor => self.encoder.alu(AluOp::Xor, rax, rcx)?,
            BinOp::Div => self.encoder.divide(rcx, signed)?,
            BinOp::Rem => {
                self.encoder.divide(rcx, signed)?;
                self.encoder.mov(rax, AsmReg::RDX)?;
            }
            BinOp::Shl => self.encoder.shift(ShiftOp::Shl, rax)?,
            BinOp::Shr => {
                let op = if signed { ShiftOp::Sar } else { ShiftOp::Shr };
                self.encoder.shift(op, rax)?;
            }
        }
        self.encoder.extend(rax, width_of(ty), signed)?;
        Ok(())
    }

    /// `XMM0 = XMM0 op XMM1`.
    fn float_op(&mut self, op: BinOp) -> Result<()> {
        let op = match op {
            BinOp::Add => SseOp::Add,
            BinOp::Sub => SseOp::Sub,
            BinOp::Mul => SseOp::Mul,
            BinOp::Div => SseOp::Div,
            other => {
                return Err(FunctionCodegenError::Unsupported(format!(
                    "{other:?} on double operands"
                )))
            }
        };
        self.encoder.sse(op, AsmReg::XMM0, AsmReg::XMM1)?;
        Ok(())
    }

    /// Evaluate `l` then `r`, leaving `l` in RAX/XMM0 and `r` in RCX/XMM1.
    fn operands(&mut self, l: &Expr<'a>, r: &Expr<'a>) -> Result<()> {
        self.expr(l)?;
        self.push_value(l.ty)?;
        self.expr(r)?;
        if r.ty.is_double() {
            self.encoder.mov(AsmReg::XMM1, AsmReg::XMM0)?;
            self.pop(AsmReg::RAX)?;
            self.encoder.mov(AsmReg::XMM0, AsmReg::RAX)?;
        } else {
            self.encoder.mov(AsmReg::RCX, AsmReg::RAX)?;
            self.pop(AsmReg::RAX)?;
        }
        Ok(())
    }

    fn compare(&mut self, op: CmpOp, l: &Expr<'a>, r: &Expr<'a>) -> Result<()> {
        self.operands(l, r)?;
        if l.ty.is_double() {
            let (x0, x1) = (AsmReg::XMM0, AsmReg::XMM1);
            match op {
                CmpOp::Gt => {
                    self.encoder.ucomisd(x0, x1)?;
                    self.encoder.set(Condition::Above, AsmReg::RAX)?;
                }
                CmpOp::Ge => {
                    self.encoder.ucomisd(x0, x1)?;
                    self.encoder.set(Condition::AboveEqual, AsmReg::RAX)?;
                }
                CmpOp::Lt => {
                    self.encoder.ucomisd(x1, x0)?;
                    self.encoder.set(Condition::Above, AsmReg::RAX)?;
                }
                CmpOp::Le => {
                    self.encoder.ucomisd(x1, x0)?;
                    self.encoder.set(Condition::AboveEqual, AsmReg::RAX)?;
                }
                CmpOp::Eq => {
                    self.encoder.ucomisd(x0, x1)?;
                    self.encoder.set(Condition::Equal, AsmReg::RAX)?;
                    self.encoder.set(Condition::NoParity, AsmReg::RCX)?;
                    self.encoder.alu(AluOp::And, AsmReg::RAX, AsmReg::RCX)?;
                }
                CmpOp::Ne => {
                    self.encoder.ucomisd(x0, x1)?;
                    self.encoder.set(Condition::NotEqual, AsmReg::RAX)?;
                    self.encoder.set(Condition::Parity, AsmReg::RCX)?;
                    self.encoder.alu(AluOp::Or, AsmReg::RAX, AsmReg::RCX)?;
                }
            }
            return Ok(());
        }

        let signed = is_signed(l.ty);
        let cond = match (op, signed) {
            (CmpOp::Eq, _) => Condition::Equal,
            (CmpOp::Ne, _) => Condition::NotEqual,
            (CmpOp::Lt, true) => Condition::Less,
            (CmpOp::Le, true) => Condition::LessEqual,
            (CmpOp::Gt, true) => Condition::Greater,
            (CmpOp::Ge, true) => Condition::GreaterEqual,
            (CmpOp::Lt, false) => Condition::Below,
            (CmpOp::Le, false) => Condition::BelowEqual,
            (CmpOp::Gt, false) => Condition::Above,
            (CmpOp::Ge, false) => Condition::AboveEqual,
        };
        self.encoder.cmp(AsmReg::RAX, AsmReg::RCX)?;
        self.encoder.set(cond, AsmReg::RAX)?;
        Ok(())
    }

    fn compound_assign(
        &mut self,
        op: BinOp,
        target: &Expr<'a>,
        rhs: &Expr<'a>,
        op_ty: Type<'a>,
    ) -> Result<()> {
        self.address_into_rax(target)?;
        self.push(AsmReg::RAX)?;
        self.expr(rhs)?;
        self.push_value(rhs.ty)?;

        self.encoder
            .load(AsmReg::RDX, AsmReg::RSP, 8, Width::B64, false)?;
        self.load_value(target.ty, AsmReg::RDX, 0)?;
        self.convert(target.ty, op_ty)?;

        self.pop(AsmReg::RCX)?;
        if op_ty.is_double() {
            self.encoder.mov(AsmReg::XMM1, AsmReg::RCX)?;
            self.float_op(op)?;
        } else {
            self.int_op(op, op_ty)?;
        }
        self.convert(op_ty, target.ty)?;

        self.pop(AsmReg::RDX)?;
        self.store_value(target.ty, AsmReg::RDX, 0)
    }

    fn inc_dec(&mut self, target: &Expr<'a>, delta: i64, prefix: bool) -> Result<()> {
        self.address_into_rax(target)?;
        self.encoder.mov(AsmReg::RDX, AsmReg::RAX)?;
        self.load_value(target.ty, AsmReg::RDX, 0)?;

        if target.ty.is_double() {
            self.encoder.mov(AsmReg::XMM2, AsmReg::XMM0)?;
            self.encoder
                .mov_imm(AsmReg::RCX, (delta as f64).to_bits() as i64)?;
            self.encoder.mov(AsmReg::XMM1, AsmReg::RCX)?;
            self.encoder.sse(SseOp::Add, AsmReg::XMM0, AsmReg::XMM1)?;
            self.encoder.store_f64(AsmReg::RDX, 0, AsmReg::XMM0)?;
            if !prefix {
                self.encoder.mov(AsmReg::XMM0, AsmReg::XMM2)?;
            }
            return Ok(());
        }

        let width = width_of(target.ty);
        self.encoder.mov(AsmReg::RCX, AsmReg::RAX)?;
        let delta = i32::try_from(delta).map_err(|_| {
            FunctionCodegenError::Unsupported(format!("increment by {delta}"))
        })?;
        self.encoder.alu_imm(AluOp::Add, AsmReg::RAX, delta)?;
        self.encoder.extend(AsmReg::RAX, width, is_signed(target.ty))?;
        self.encoder.store(AsmReg::RDX, 0, AsmReg::RAX, width)?;
        if !prefix {
            self.encoder.mov(AsmReg::RAX, AsmReg::RCX)?;
        }
        Ok(())
    }

    fn call(
        &mut self,
        callee: Callee<'a>,
        args: &[&Expr<'a>],
        variadic: bool,
        ret: Type<'a>,
    ) -> Result<()> {
        for arg in args {
            self.expr(arg)?;
            self.push_value(arg.ty)?;
        }
        if let Callee::Indirect(pointer) = callee {
            self.expr(pointer)?;
            self.encoder.mov(AsmReg::R11, AsmReg::RAX)?;
        }

        let mut cc = SysVAssigner::new();
        let mut regs = Vec::with_capacity(args.len());
        for arg in args {
            let bank = if arg.ty.is_double() {
                RegBank::Xmm
            } else {
                RegBank::GeneralPurpose
            };
            let reg = cc.assign_arg(bank).ok_or_else(|| {
                FunctionCodegenError::Unsupported("stack-passed arguments".to_string())
            })?;
            regs.push(reg);
        }
        for reg in regs.iter().rev() {
            if reg.is_xmm() {
                self.pop(AsmReg::RAX)?;
                self.encoder.mov(*reg, AsmReg::RAX)?;
            } else {
                self.pop(*reg)?;
            }
        }
        if variadic {
            self.encoder.set_vector_count(cc.xmm_used())?;
        }

        let pad = self.depth % 2 == 1;
        if pad {
            self.encoder.alu_imm(AluOp::Sub, AsmReg::RSP, 8)?;
        }
        match callee {
            Callee::Direct(name) => match self.layout.functions.get(name) {
                Some(label) => self.encoder.call(*label)?,
                None => {
                    let site = self.encoder.call_external()?;
                    self.relocs.push(PendingReloc {
                        site,
                        kind: RelocKind::Branch32,
                        target: PendingTarget::External(name.to_string()),
                        addend: -4,
                        expected: Some(SymbolKind::Function),
                    });
                }
            },
            Callee::Indirect(_) => self.encoder.call_indirect(AsmReg::R11)?,
        }
        if pad {
            self.encoder.alu_imm(AluOp::Add, AsmReg::RSP, 8)?;
        }

        if matches!(ret, Type::Int(_) | Type::Pointer(_)) {
            self.encoder.extend(AsmReg::RAX, width_of(ret), is_signed(ret))?;
        }
        Ok(())
    }

    // ==== EXPRESSIONS ====

    fn expr(&mut self, e: &Expr<'a>) -> Result<()> {
        match e.kind {
            ExprKind::IntLit(value) => self.encoder.mov_imm(AsmReg::RAX, value)?,
            ExprKind::FloatLit(value) => {
                self.encoder.mov_imm(AsmReg::RAX, value.to_bits() as i64)?;
                self.encoder.mov(AsmReg::XMM0, AsmReg::RAX)?;
            }
            ExprKind::StrLit(id) => self.string_address(id)?,
            ExprKind::Local(_) | ExprKind::Global(_) | ExprKind::Deref(_) => {
                if e.ty.is_function() {
                    return self.address_into_rax(e);
                }
                match self.place(e)? {
                    Place::Frame(disp) => self.load_value(e.ty, AsmReg::RBP, disp)?,
                    Place::Rax => self.load_value(e.ty, AsmReg::RAX, 0)?,
                }
            }
            ExprKind::AddrOf(inner) => match inner.kind {
                ExprKind::Deref(pointer) => self.expr(pointer)?,
                _ => self.address_into_rax(inner)?,
            },
            ExprKind::Unary(op, operand) => {
                self.expr(operand)?;
                match (op, e.ty.is_double()) {
                    (UnOp::Neg, true) => {
                        self.encoder.mov(AsmReg::RAX, AsmReg::XMM0)?;
                        self.encoder.flip_bit(AsmReg::RAX, 63)?;
                        self.encoder.mov(AsmReg::XMM0, AsmReg::RAX)?;
                    }
                    (UnOp::Neg, false) => {
                        self.encoder.neg(AsmReg::RAX)?;
                        self.encoder.extend(AsmReg::RAX, width_of(e.ty), is_signed(e.ty))?;
                    }
                    (UnOp::BitNot, _) => {
                        self.encoder.not(AsmReg::RAX)?;
                        self.encoder.extend(AsmReg::RAX, width_of(e.ty), is_signed(e.ty))?;
                    }
                }
            }
            ExprKind::Binary(op, l, r) => {
                self.operands(l, r)?;
                if e.ty.is_double() {
                    self.float_op(op)?;
                } else {
                    self.int_op(op, e.ty)?;
                }
            }
            ExprKind::Compare(op, l, r) => self.compare(op, l, r)?,
            ExprKind::LogAnd(l, r) | ExprKind::LogOr(l, r) => {
                // Both operands are already 0 or 1.
                let end = self.encoder.new_label();
                self.expr(l)?;
                self.encoder.test(AsmReg::RAX, AsmReg::RAX)?;
                let short = if matches!(e.kind, ExprKind::LogAnd(..)) {
                    Condition::Equal
                } else {
                    Condition::NotEqual
                };
                self.encoder.jcc(short, end)?;
                self.expr(r)?;
                self.encoder.bind(end)?;
            }
            ExprKind::Assign(target, value) => {
                if let ExprKind::Local(id) = target.kind {
                    self.expr(value)?;
                    return self.store_value(target.ty, AsmReg::RBP, self.local_offsets[id]);
                }
                self.address_into_rax(target)?;
                self.push(AsmReg::RAX)?;
                self.expr(value)?;
                self.pop(AsmReg::RDX)?;
                self.store_value(target.ty, AsmReg::RDX, 0)?;
            }
            ExprKind::CompoundAssign {
                op,
                target,
                rhs,
                op_ty,
            } => self.compound_assign(op, target, rhs, op_ty)?,
            ExprKind::IncDec {
                target,
                delta,
                prefix,
            } => self.inc_dec(target, delta, prefix)?,
            ExprKind::Cond(cond, then, otherwise) => {
                let else_label = self.encoder.new_label();
                let end = self.encoder.new_label();
                self.expr(cond)?;
                self.encoder.test(AsmReg::RAX, AsmReg::RAX)?;
                self.encoder.jcc(Condition::Equal, else_label)?;
                self.expr(then)?;
                self.encoder.jmp(end)?;
                self.encoder.bind(else_label)?;
                self.expr(otherwise)?;
                self.encoder.bind(end)?;
            }
            ExprKind::Cast(inner) => {
                self.expr(inner)?;
                self.convert(inner.ty, e.ty)?;
            }
            ExprKind::Call {
                callee,
                args,
                signature,
            } => self.call(
                callee,
                args,
                signature.variadic || signature.unspecified,
                signature.ret,
            )?,
            ExprKind::Comma(first, second) => {
                self.expr(first)?;
                self.expr(second)?;
            }
        }
        Ok(())
    }

    // ==== STATEMENTS ====

    fn condition(&mut self, cond: &Expr<'a>, if_false: Label) -> Result<()> {
        self.expr(cond)?;
        self.encoder.test(AsmReg::RAX, AsmReg::RAX)?;
        self.encoder.jcc(Condition::Equal, if_false)?;
        Ok(())
    }

    fn loop_body(&mut self, body: &Stmt<'a>, cont: Label, brk: Label) -> Result<()> {
        self.loops.push((cont, brk));
        let result = self.stmt(body);
        self.loops.pop();
        result
    }

    fn stmt(&mut self, stmt: &Stmt<'a>) -> Result<()> {
        debug_assert_eq!(self.depth, 0);
        match *stmt {
            Stmt::Expr(e) => self.expr(e)?,
            Stmt::InitLocal { local, zero, stores } => {
                let base = self.local_offsets[local];
                if zero {
                    let size = self.function.locals[local].ty.size();
                    self.encoder.lea(AsmReg::RDI, AsmReg::RBP, base)?;
                    self.encoder.mov_imm(AsmReg::RCX, size as i64)?;
                    self.encoder.mov_imm(AsmReg::RAX, 0)?;
                    self.encoder.rep_stosb()?;
                }
                for store in stores {
                    self.expr(store.value)?;
                    self.store_value(store.value.ty, AsmReg::RBP, base + store.offset as i32)?;
                }
            }
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
            }
            Stmt::If(cond, then, otherwise) => {
                let else_label = self.encoder.new_label();
                self.condition(cond, else_label)?;
                self.stmt(then)?;
                match otherwise {
                    Some(otherwise) => {
                        let end = self.encoder.new_label();
                        self.encoder.jmp(end)?;
                        self.encoder.bind(else_label)?;
                        self.stmt(otherwise)?;
                        self.encoder.bind(end)?;
                    }
                    None => self.encoder.bind(else_label)?,
                }
            }
            Stmt::While(cond, body) => {
                let top = self.encoder.new_label();
                let end = self.encoder.new_label();
                self.encoder.bind(top)?;
                self.condition(cond, end)?;
                self.loop_body(body, top, end)?;
                self.encoder.jmp(top)?;
                self.encoder.bind(end)?;
            }
            Stmt::DoWhile(body, cond) => {
                let top = self.encoder.new_label();
                let cont = self.encoder.new_label();
                let end = self.encoder.new_label();
                self.encoder.bind(top)?;
                self.loop_body(body, cont, end)?;
                self.encoder.bind(cont)?;
                self.expr(cond)?;
                self.encoder.test(AsmReg::RAX, AsmReg::RAX)?;
                self.encoder.jcc(Condition::NotEqual, top)?;
                self.encoder.bind(end)?;
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let top = self.encoder.new_label();
                let cont = self.encoder.new_label();
                let end = self.encoder.new_label();
                self.encoder.bind(top)?;
                if let Some(cond) = cond {
                    self.condition(cond, end)?;
                }
                self.loop_body(body, cont, end)?;
                self.encoder.bind(cont)?;
                if let Some(step) = step {
                    self.expr(step)?;
                }
                self.encoder.jmp(top)?;
                self.encoder.bind(end)?;
            }
            Stmt::Break | Stmt::Continue => {
                let (cont, brk) = self.loops.last().copied().ok_or_else(|| {
                    FunctionCodegenError::Unsupported("jump outside of a loop".to_string())
                })?;
                let target = if matches!(stmt, Stmt::Break) { brk } else { cont };
                self.encoder.jmp(target)?;
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
                self.encoder.jmp(self.ret_label)?;
            }
            Stmt::Empty => {}
        }
        Ok(())
    }
}

/// Allocate entry labels for every function of `unit`.
pub fn function_labels<'a>(
    encoder: &mut X64Encoder,
    unit: &TranslationUnit<'a>,
) -> HashMap<&'a str, Label> {
    unit.functions
        .iter()
        .map(|f| (f.name, encoder.new_label()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfront;

    fn generate(src: &str) -> (Vec<u8>, Vec<PendingReloc>) {
        let arena = Bump::new();
        let (unit, _) = cfront::parse_source(&arena, src, &[]).unwrap();
        let mut encoder = X64Encoder::new().unwrap();
        let layout = UnitLayout {
            functions: function_labels(&mut encoder, &unit),
            data: HashMap::new(),
            strings: Vec::new(),
        };
        let mut relocs = Vec::new();
        for function in &unit.functions {
            let entry = layout.functions[function.name];
            FunctionCodegen::new(&arena, &mut encoder, &layout, &mut relocs, function)
                .unwrap()
                .generate(entry)
                .unwrap();
        }
        (encoder.finish().unwrap().code, relocs)
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let (code, relocs) = generate("int one(void) { return 1; }");
        // push rbp; mov rbp, rsp
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        // leave; ret
        assert_eq!(&code[code.len() - 2..], &[0xC9, 0xC3]);
        assert!(relocs.is_empty());
    }

    #[test]
    fn test_external_call_records_branch_reloc() {
        let (_, relocs) = generate("int host(int);\nint f(void) { return host(2); }");
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, RelocKind::Branch32);
        assert_eq!(relocs[0].addend, -4);
        assert_eq!(relocs[0].target, PendingTarget::External("host".to_string()));
        assert_eq!(relocs[0].expected, Some(SymbolKind::Function));
    }

    #[test]
    fn test_internal_call_needs_no_reloc() {
        let (_, relocs) = generate(
            "static int sq(int x) { return x * x; }\nint f(void) { return sq(3); }",
        );
        assert!(relocs.is_empty());
    }

    #[test]
    fn test_external_data_reference() {
        let (_, relocs) = generate("extern int counter;\nint f(void) { return counter; }");
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, RelocKind::Abs64);
        assert_eq!(relocs[0].expected, Some(SymbolKind::Data));
    }

    #[test]
    fn test_all_statement_forms_assemble() {
        let (code, _) = generate(
            "double avg(double a, double b) { return (a + b) / 2; }\n\
             long loops(long n) {\n\
               long s = 0; int i; int arr[4] = {1, 2};\n\
               for (i = 0; i < n; i++) { if (i == 3) continue; s += i; }\n\
               while (s > 100) s -= 7;\n\
               do { s <<= 1; } while (s < 10 && s != 0);\n\
               s = s > 5 ? s : -s;\n\
               return s + arr[1] + (unsigned long)avg(1.0, 2.5);\n\
             }",
        );
        assert!(code.len() > 64);
    }
}
