// Typed syntax tree produced by the parser. Semantic analysis happens while parsing, so every
// expression already carries its final type, implicit conversions appear as explicit Cast
// nodes, array and function designators have been decayed to addresses, subscripts and
// pointer arithmetic are lowered to scaled additions, and conditions are boolean-valued.
// Code generation can therefore walk the tree without consulting any symbol table beyond
// the per-function list of locals and the unit's global symbol map. All nodes live in the
// compilation arena.

//! Typed AST for the C subset.

use hashbrown::HashMap;

use super::types::{FunctionType, Type};
use crate::core::diagnostic::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Target of a call.
#[derive(Debug, Clone, Copy)]
pub enum Callee<'a> {
    /// A named function, defined here or provided by the host.
    Direct(&'a str),
    /// A function pointer value.
    Indirect(&'a Expr<'a>),
}

#[derive(Debug, Clone, Copy)]
pub enum ExprKind<'a> {
    IntLit(i64),
    FloatLit(f64),
    /// Address of string literal `n` of the unit.
    StrLit(usize),
    /// A local variable (lvalue).
    Local(usize),
    /// A global variable or function (lvalue or designator).
    Global(&'a str),
    Unary(UnOp, &'a Expr<'a>),
    /// Operands already converted to the result type (or scaled, for
    /// pointer arithmetic).
    Binary(BinOp, &'a Expr<'a>, &'a Expr<'a>),
    /// Operands converted to a common type; result is `int` 0 or 1.
    Compare(CmpOp, &'a Expr<'a>, &'a Expr<'a>),
    LogAnd(&'a Expr<'a>, &'a Expr<'a>),
    LogOr(&'a Expr<'a>, &'a Expr<'a>),
    /// Store a value converted to the target's type.
    Assign(&'a Expr<'a>, &'a Expr<'a>),
    /// `target op= rhs`, computed in `op_ty`.
    CompoundAssign {
        op: BinOp,
        target: &'a Expr<'a>,
        rhs: &'a Expr<'a>,
        op_ty: Type<'a>,
    },
    /// `++`/`--` with the step already scaled for pointers.
    IncDec {
        target: &'a Expr<'a>,
        delta: i64,
        prefix: bool,
    },
    Cond(&'a Expr<'a>, &'a Expr<'a>, &'a Expr<'a>),
    /// Convert the operand to this node's type.
    Cast(&'a Expr<'a>),
    /// Object designated by a pointer (lvalue).
    Deref(&'a Expr<'a>),
    /// Address of an lvalue or designator.
    AddrOf(&'a Expr<'a>),
    Call {
        callee: Callee<'a>,
        args: &'a [&'a Expr<'a>],
        signature: &'a FunctionType<'a>,
    },
    Comma(&'a Expr<'a>, &'a Expr<'a>),
}

impl<'a> ExprKind<'a> {
    /// Depth of the deepest operand; 0 for leaves.
    pub fn operand_depth(&self) -> u32 {
        let depth = |e: &Expr<'a>| e.depth;
        match *self {
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::StrLit(_)
            | ExprKind::Local(_)
            | ExprKind::Global(_) => 0,
            ExprKind::Unary(_, e)
            | ExprKind::IncDec { target: e, .. }
            | ExprKind::Cast(e)
            | ExprKind::Deref(e)
            | ExprKind::AddrOf(e) => depth(e),
            ExprKind::Binary(_, l, r)
            | ExprKind::Compare(_, l, r)
            | ExprKind::LogAnd(l, r)
            | ExprKind::LogOr(l, r)
            | ExprKind::Assign(l, r)
            | ExprKind::CompoundAssign { target: l, rhs: r, .. }
            | ExprKind::Comma(l, r) => depth(l).max(depth(r)),
            ExprKind::Cond(c, t, f) => depth(c).max(depth(t)).max(depth(f)),
            ExprKind::Call { callee, args, .. } => {
                let callee = match callee {
                    Callee::Direct(_) => 0,
                    Callee::Indirect(e) => depth(e),
                };
                args.iter().map(|a| depth(a)).fold(callee, u32::max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Expr<'a> {
    pub kind: ExprKind<'a>,
    pub ty: Type<'a>,
    pub loc: Location,
    /// Height of this node's tree; leaves are 1.
    pub depth: u32,
}

impl<'a> Expr<'a> {
    pub fn is_lvalue(&self) -> bool {
        match self.kind {
            ExprKind::Local(_) | ExprKind::Deref(_) => true,
            ExprKind::Global(_) => !self.ty.is_function(),
            _ => false,
        }
    }

    /// Whether the value is already 0 or 1.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Compare(..) | ExprKind::LogAnd(..) | ExprKind::LogOr(..)
        )
    }

    pub fn int_value(&self) -> Option<i64> {
        match self.kind {
            ExprKind::IntLit(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Stmt<'a> {
    Expr(&'a Expr<'a>),
    /// Initialise local `local`; arrays are zeroed before the stores run.
    InitLocal {
        local: usize,
        zero: bool,
        stores: &'a [InitStore<'a>],
    },
    Block(&'a [Stmt<'a>]),
    If(&'a Expr<'a>, &'a Stmt<'a>, Option<&'a Stmt<'a>>),
    While(&'a Expr<'a>, &'a Stmt<'a>),
    DoWhile(&'a Stmt<'a>, &'a Expr<'a>),
    For {
        init: Option<&'a Stmt<'a>>,
        cond: Option<&'a Expr<'a>>,
        step: Option<&'a Expr<'a>>,
        body: &'a Stmt<'a>,
    },
    Break,
    Continue,
    Return(Option<&'a Expr<'a>>),
    Empty,
}

/// One scalar store into a local being initialised.
#[derive(Debug, Clone, Copy)]
pub struct InitStore<'a> {
    pub offset: usize,
    pub value: &'a Expr<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalVar<'a> {
    pub name: &'a str,
    pub ty: Type<'a>,
}

#[derive(Debug, Clone)]
pub struct Function<'a> {
    pub name: &'a str,
    pub signature: &'a FunctionType<'a>,
    /// Parameters are locals `0..signature.params.len()`.
    pub locals: Vec<LocalVar<'a>>,
    pub body: &'a [Stmt<'a>],
    pub is_static: bool,
    pub loc: Location,
}

/// Where a constant address in a global initialiser points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressTarget<'a> {
    Symbol(&'a str),
    Str(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitValue<'a> {
    Int { value: i64, size: usize },
    Float(f64),
    Bytes(Vec<u8>),
    Address { target: AddressTarget<'a>, addend: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitItem<'a> {
    pub offset: usize,
    pub value: InitValue<'a>,
}

#[derive(Debug, Clone)]
pub struct GlobalVar<'a> {
    pub name: &'a str,
    pub ty: Type<'a>,
    pub is_static: bool,
    pub is_const: bool,
    /// `None` for tentative definitions (zero-filled).
    pub init: Option<Vec<InitItem<'a>>>,
    pub loc: Location,
}

/// How a file-scope name is bound.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSymbol<'a> {
    pub ty: Type<'a>,
    /// Defined in this unit (as opposed to provided by the host).
    pub defined: bool,
    pub is_static: bool,
}

/// Result of parsing one source text.
#[derive(Debug, Default)]
pub struct TranslationUnit<'a> {
    pub functions: Vec<Function<'a>>,
    pub globals: Vec<GlobalVar<'a>>,
    /// String literal contents including the terminating NUL.
    pub strings: Vec<Vec<u8>>,
    pub symbols: HashMap<&'a str, GlobalSymbol<'a>>,
}

impl<'a> TranslationUnit<'a> {
    pub fn symbol(&self, name: &str) -> Option<&GlobalSymbol<'a>> {
        self.symbols.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Function<'a>> {
        self.functions.iter().find(|f| f.name == name)
    }
}
