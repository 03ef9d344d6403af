// Recursive-descent parser with integrated semantic analysis for the C subset. Declarations
// go through decl_specifiers and a declarator that handles pointers, arrays, function
// suffixes and parenthesized (function pointer) declarators. Expressions are parsed by
// precedence climbing and typed as they are built: rvalue conversion decays arrays and
// function designators, the usual arithmetic conversions insert Cast nodes, subscripts and
// pointer arithmetic become scaled additions, and constant operands are folded so array
// sizes and global initialisers can be evaluated at compile time. Syntax errors are Parse
// diagnostics, type errors are Compile diagnostics; both carry the offending token's
// location. After an error the parser resynchronises at the next statement or declaration,
// so one compile reports as many independent problems as possible.

//! Parser and semantic analysis.

use bumpalo::Bump;
use hashbrown::HashMap;

use super::ast::{
    AddressTarget, BinOp, Callee, CmpOp, Expr, ExprKind, Function, GlobalSymbol, GlobalVar,
    InitItem, InitStore, InitValue, LocalVar, Stmt, TranslationUnit, UnOp,
};
use super::lexer::{Token, TokenKind};
use super::types::{promote, usual_arithmetic, FunctionType, IntType, Type, MAX_OBJECT_SIZE};
use crate::core::diagnostic::{Diagnostic, Location, Stage};
use crate::core::executor::{MAX_FLOAT_ARGS, MAX_INT_ARGS};

type PResult<T> = Result<T, Diagnostic>;

fn syntax_error(loc: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(Stage::Parse, message).at(loc)
}

fn semantic_error(loc: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(Stage::Compile, message).at(loc)
}

/// Limit on open recursive productions (parentheses, casts, unary
/// operators, declarators, initializer braces and statements).
pub const MAX_NESTING: usize = 128;

/// Limit on the height of an expression tree, which code generation
/// walks recursively.
pub const MAX_EXPR_DEPTH: u32 = 256;

fn bounded<'a>(expr: &'a Expr<'a>) -> PResult<&'a Expr<'a>> {
    if expr.depth > MAX_EXPR_DEPTH {
        return Err(syntax_error(expr.loc, "expression is nested too deeply"));
    }
    Ok(expr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    None,
    Typedef,
    Extern,
    Static,
}

#[derive(Debug, Clone, Copy)]
struct DeclSpec<'a> {
    ty: Type<'a>,
    storage: Storage,
    is_const: bool,
}

#[derive(Debug, Clone, Copy)]
struct Param<'a> {
    name: Option<&'a str>,
    ty: Type<'a>,
    loc: Location,
}

#[derive(Debug, Clone)]
struct Declarator<'a> {
    name: Option<(&'a str, Location)>,
    ty: Type<'a>,
    /// Parameters of a function declarator applied directly to the name.
    params: Option<Vec<Param<'a>>>,
}

#[derive(Debug, Clone, Copy)]
enum Binding<'a> {
    Local(usize),
    Global(&'a str),
    Typedef(Type<'a>),
}

/// Parser state for one translation unit.
pub struct Parser<'a> {
    arena: &'a Bump,
    tokens: Vec<Token>,
    pos: usize,
    unit: TranslationUnit<'a>,
    scopes: Vec<HashMap<String, Binding<'a>>>,
    locals: Vec<LocalVar<'a>>,
    current: Option<(&'a str, Type<'a>)>,
    loop_depth: usize,
    /// Open recursive productions; see [`MAX_NESTING`].
    nesting: usize,
    static_locals: usize,
    warnings: Vec<Diagnostic>,
    errors: Vec<Diagnostic>,
}

/// Parse preprocessed `tokens` into a typed translation unit.
///
/// On success returns the unit plus any warnings; otherwise every error
/// found.
pub fn parse<'a>(
    arena: &'a Bump,
    tokens: Vec<Token>,
) -> Result<(TranslationUnit<'a>, Vec<Diagnostic>), Vec<Diagnostic>> {
    let mut parser = Parser::new(arena, tokens);
    parser.translation_unit();
    if parser.errors.is_empty() {
        log::debug!(
            "parsed {} functions, {} globals, {} strings",
            parser.unit.functions.len(),
            parser.unit.globals.len(),
            parser.unit.strings.len()
        );
        Ok((parser.unit, parser.warnings))
    } else {
        Err(parser.errors)
    }
}

impl<'a> Parser<'a> {
    fn new(arena: &'a Bump, mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Eof)) {
            let loc = tokens.last().map_or(Location::new(1, 1), |t| t.loc);
            tokens.push(Token {
                kind: TokenKind::Eof,
                loc,
            });
        }
        Self {
            arena,
            tokens,
            pos: 0,
            unit: TranslationUnit::default(),
            scopes: vec![HashMap::new()],
            locals: Vec::new(),
            current: None,
            loop_depth: 0,
            nesting: 0,
            static_locals: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    // ==== TOKEN HELPERS ====

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn loc(&self) -> Location {
        self.peek().loc
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn check(&self, punct: &str) -> bool {
        self.peek().is_punct(punct)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.check(punct) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_keyword(keyword) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> PResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(syntax_error(
                self.loc(),
                format!("expected '{punct}' before {}", self.peek().describe()),
            ))
        }
    }

    fn warn(&mut self, loc: Location, message: impl Into<String>) {
        self.warnings
            .push(Diagnostic::warning(Stage::Compile, message).at(loc));
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.nesting >= MAX_NESTING {
            return Err(syntax_error(self.loc(), "code is nested too deeply"));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn name(&self, name: &str) -> &'a str {
        self.arena.alloc_str(name)
    }

    fn mk(&self, kind: ExprKind<'a>, ty: Type<'a>, loc: Location) -> &'a Expr<'a> {
        self.arena.alloc(Expr {
            kind,
            ty,
            loc,
            depth: kind.operand_depth() + 1,
        })
    }

    fn ptr(&self, ty: Type<'a>) -> Type<'a> {
        Type::pointer_to(self.arena, ty)
    }

    // ==== SCOPES ====

    fn lookup(&self, name: &str) -> Option<Binding<'a>> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn bind(&mut self, name: &str, binding: Binding<'a>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), binding);
        }
    }

    fn bind_file_scope(&mut self, name: &str, binding: Binding<'a>) {
        self.scopes[0].insert(name.to_string(), binding);
    }

    fn is_typedef_name(&self, token: &Token) -> bool {
        match &token.kind {
            TokenKind::Ident(name) => matches!(self.lookup(name), Some(Binding::Typedef(_))),
            _ => false,
        }
    }

    fn is_type_start(&self, token: &Token) -> bool {
        match &token.kind {
            TokenKind::Keyword(k) => matches!(
                *k,
                "void" | "char" | "short" | "int" | "long" | "signed" | "unsigned" | "double"
                    | "float" | "_Bool" | "const" | "volatile" | "restrict" | "__restrict"
                    | "struct" | "union" | "enum" | "__attribute__" | "__declspec"
            ),
            _ => self.is_typedef_name(token),
        }
    }

    fn is_declaration_start(&self, token: &Token) -> bool {
        self.is_type_start(token)
            || matches!(
                &token.kind,
                TokenKind::Keyword(
                    "typedef" | "extern" | "static" | "inline" | "__inline" | "register" | "auto"
                )
            )
    }

    // ==== RECOVERY ====

    /// Skip to the end of the current declaration or statement.
    fn synchronize(&mut self, stop_at_brace: bool) {
        let mut depth = 0usize;
        while !self.at_eof() {
            if self.check("{") {
                depth += 1;
            } else if self.check("}") {
                if depth == 0 {
                    if !stop_at_brace {
                        self.bump();
                    }
                    return;
                }
                depth -= 1;
                if depth == 0 && !stop_at_brace {
                    self.bump();
                    return;
                }
            } else if self.check(";") && depth == 0 {
                self.bump();
                return;
            }
            self.bump();
        }
    }

    // ==== DECLARATIONS ====

    fn translation_unit(&mut self) {
        while !self.at_eof() {
            if let Err(diag) = self.external_declaration() {
                self.errors.push(diag);
                self.scopes.truncate(1);
                self.locals.clear();
                self.current = None;
                self.loop_depth = 0;
                self.synchronize(false);
            }
        }
    }

    fn skip_attribute(&mut self) -> PResult<()> {
        self.expect("(")?;
        let mut depth = 1usize;
        while depth > 0 {
            if self.at_eof() {
                return Err(syntax_error(self.loc(), "unterminated attribute"));
            }
            if self.check("(") {
                depth += 1;
            } else if self.check(")") {
                depth -= 1;
            }
            self.bump();
        }
        Ok(())
    }

    fn skip_attributes(&mut self) -> PResult<()> {
        while self.eat_keyword("__attribute__") || self.eat_keyword("__declspec") {
            self.skip_attribute()?;
        }
        Ok(())
    }

    fn decl_specifiers(&mut self) -> PResult<DeclSpec<'a>> {
        let start = self.loc();
        let mut storage = Storage::None;
        let mut is_const = false;
        let (mut void, mut char, mut short, mut int, mut long) = (0, 0, 0, 0, 0);
        let (mut signed, mut unsigned, mut double, mut boolean) = (0, 0, 0, 0);
        let mut typedef_ty = None;
        let mut any = false;

        loop {
            let token = self.peek().clone();
            let keyword = match &token.kind {
                TokenKind::Keyword(k) => *k,
                TokenKind::Ident(name) => {
                    let no_type_yet = void + char + short + int + long + signed + unsigned
                        + double
                        + boolean
                        == 0
                        && typedef_ty.is_none();
                    match self.lookup(name) {
                        Some(Binding::Typedef(ty)) if no_type_yet => {
                            self.bump();
                            typedef_ty = Some(ty);
                            any = true;
                            continue;
                        }
                        _ => break,
                    }
                }
                _ => break,
            };
            let new_storage = match keyword {
                "typedef" => Some(Storage::Typedef),
                "extern" => Some(Storage::Extern),
                "static" => Some(Storage::Static),
                _ => None,
            };
            if let Some(new_storage) = new_storage {
                if storage != Storage::None {
                    return Err(semantic_error(
                        token.loc,
                        "multiple storage classes in declaration specifiers",
                    ));
                }
                storage = new_storage;
                self.bump();
                any = true;
                continue;
            }
            match keyword {
                "inline" | "__inline" | "register" | "auto" | "volatile" | "restrict"
                | "__restrict" => {}
                "const" => is_const = true,
                "void" => void += 1,
                "char" => char += 1,
                "short" => short += 1,
                "int" => int += 1,
                "long" => long += 1,
                "signed" => signed += 1,
                "unsigned" => unsigned += 1,
                "double" => double += 1,
                "_Bool" => boolean += 1,
                "float" => {
                    return Err(semantic_error(
                        token.loc,
                        "'float' is not supported; use 'double'",
                    ))
                }
                "struct" | "union" | "enum" => {
                    return Err(semantic_error(
                        token.loc,
                        format!("'{keyword}' types are not supported"),
                    ))
                }
                "__attribute__" | "__declspec" => {
                    self.bump();
                    self.skip_attribute()?;
                    any = true;
                    continue;
                }
                _ => break,
            }
            self.bump();
            any = true;
        }

        if !any {
            return Err(syntax_error(
                start,
                format!("expected declaration specifiers before {}", self.peek().describe()),
            ));
        }

        let invalid = || semantic_error(start, "invalid combination of type specifiers");
        if signed > 0 && unsigned > 0 {
            return Err(invalid());
        }
        let ty = if let Some(ty) = typedef_ty {
            if void + char + short + int + long + signed + unsigned + double + boolean > 0 {
                return Err(invalid());
            }
            ty
        } else if void > 0 {
            if char + short + int + long + signed + unsigned + double + boolean > 0 {
                return Err(invalid());
            }
            Type::Void
        } else if double > 0 {
            if char + short + int + signed + unsigned + boolean > 0 || long > 1 {
                return Err(invalid());
            }
            Type::Double
        } else if boolean > 0 {
            Type::Int(IntType::UCHAR)
        } else if char > 0 {
            if short + int + long > 0 {
                return Err(invalid());
            }
            Type::Int(if unsigned > 0 {
                IntType::UCHAR
            } else {
                IntType::CHAR
            })
        } else if short > 0 {
            if long > 0 {
                return Err(invalid());
            }
            Type::Int(IntType::new(2, unsigned == 0))
        } else if long > 0 {
            if long > 2 {
                return Err(invalid());
            }
            Type::Int(IntType::new(8, unsigned == 0))
        } else if int + signed + unsigned > 0 {
            Type::Int(IntType::new(4, unsigned == 0))
        } else {
            self.warn(start, "type specifier missing, defaults to 'int'");
            Type::INT
        };

        Ok(DeclSpec {
            ty,
            storage,
            is_const,
        })
    }

    /// Whether the `(` at the cursor opens a nested declarator rather than a
    /// parameter list.
    fn is_nested_declarator(&self) -> bool {
        let next = self.peek_at(1);
        next.is_punct("*")
            || next.is_punct("(")
            || (matches!(next.kind, TokenKind::Ident(_)) && !self.is_typedef_name(next))
    }

    fn declarator(&mut self, base: Type<'a>, abstract_ok: bool) -> PResult<Declarator<'a>> {
        self.nested(|p| p.declarator_inner(base, abstract_ok))
    }

    fn declarator_inner(&mut self, base: Type<'a>, abstract_ok: bool) -> PResult<Declarator<'a>> {
        let mut ty = base;
        while self.eat("*") {
            ty = self.ptr(ty);
            while self.eat_keyword("const")
                || self.eat_keyword("volatile")
                || self.eat_keyword("restrict")
                || self.eat_keyword("__restrict")
            {}
            self.skip_attributes()?;
        }
        self.skip_attributes()?;

        if self.check("(") && self.is_nested_declarator() {
            self.bump();
            let inner_start = self.pos;
            let mut depth = 1usize;
            while depth > 0 {
                if self.at_eof() {
                    return Err(syntax_error(self.loc(), "unbalanced parentheses in declarator"));
                }
                if self.check("(") {
                    depth += 1;
                } else if self.check(")") {
                    depth -= 1;
                }
                self.bump();
            }
            let (outer, _) = self.suffixes(ty)?;
            let after = self.pos;
            self.pos = inner_start;
            let inner = self.declarator(outer, abstract_ok)?;
            self.expect(")")?;
            self.pos = after;
            return Ok(inner);
        }

        let name = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = self.name(name);
                let loc = self.bump().loc;
                Some((name, loc))
            }
            _ if abstract_ok => None,
            _ => {
                return Err(syntax_error(
                    self.loc(),
                    format!("expected identifier before {}", self.peek().describe()),
                ))
            }
        };
        let (ty, params) = self.suffixes(ty)?;
        Ok(Declarator { name, ty, params })
    }

    fn suffixes(&mut self, base: Type<'a>) -> PResult<(Type<'a>, Option<Vec<Param<'a>>>)> {
        self.nested(|p| p.suffixes_inner(base))
    }

    fn suffixes_inner(&mut self, base: Type<'a>) -> PResult<(Type<'a>, Option<Vec<Param<'a>>>)> {
        let loc = self.loc();
        if self.eat("[") {
            let len = if self.eat("]") {
                None
            } else {
                let size = self.conditional()?;
                let size = self.constant_int(size)?;
                self.expect("]")?;
                if size <= 0 {
                    return Err(semantic_error(loc, "array size must be positive"));
                }
                Some(size as usize)
            };
            let (element, _) = self.suffixes(base)?;
            if !element.is_complete() {
                return Err(semantic_error(loc, "array has incomplete element type"));
            }
            let ty = Type::array_of(self.arena, element, len);
            if ty.checked_size().map_or(true, |size| size > MAX_OBJECT_SIZE) {
                return Err(semantic_error(
                    loc,
                    format!("array of type '{ty}' is too large (limit {MAX_OBJECT_SIZE} bytes)"),
                ));
            }
            return Ok((ty, None));
        }
        if self.eat("(") {
            let (params, variadic, unspecified) = self.parameter_list()?;
            let (ret, _) = self.suffixes(base)?;
            if ret.is_array() || ret.is_function() {
                return Err(semantic_error(
                    loc,
                    format!("function cannot return '{ret}'"),
                ));
            }
            let types = self
                .arena
                .alloc_slice_fill_iter(params.iter().map(|p| p.ty));
            let function = Type::function(
                self.arena,
                FunctionType {
                    ret,
                    params: types,
                    variadic,
                    unspecified,
                },
            );
            return Ok((function, Some(params)));
        }
        Ok((base, None))
    }

    fn parameter_list(&mut self) -> PResult<(Vec<Param<'a>>, bool, bool)> {
        if self.eat(")") {
            return Ok((Vec::new(), false, true));
        }
        if self.peek().is_keyword("void") && self.peek_at(1).is_punct(")") {
            self.bump();
            self.bump();
            return Ok((Vec::new(), false, false));
        }

        let mut params = Vec::new();
        let mut variadic = false;
        loop {
            if self.eat("...") {
                variadic = true;
                self.expect(")")?;
                break;
            }
            let loc = self.loc();
            if !self.is_type_start(self.peek()) {
                return Err(syntax_error(
                    loc,
                    format!("expected parameter declaration before {}", self.peek().describe()),
                ));
            }
            let spec = self.decl_specifiers()?;
            let decl = self.declarator(spec.ty, true)?;
            let ty = match decl.ty {
                Type::Array(element, _) => self.ptr(*element),
                Type::Function(_) => self.ptr(decl.ty),
                Type::Void => {
                    return Err(semantic_error(loc, "parameter has type 'void'"));
                }
                other => other,
            };
            params.push(Param {
                name: decl.name.map(|(name, _)| name),
                ty,
                loc,
            });
            if self.eat(",") {
                continue;
            }
            self.expect(")")?;
            break;
        }
        Ok((params, variadic, false))
    }

    fn type_name(&mut self) -> PResult<Type<'a>> {
        let loc = self.loc();
        let spec = self.decl_specifiers()?;
        if spec.storage != Storage::None {
            return Err(semantic_error(loc, "storage class in type name"));
        }
        let decl = self.declarator(spec.ty, true)?;
        if let Some((name, loc)) = decl.name {
            return Err(syntax_error(loc, format!("unexpected identifier '{name}' in type name")));
        }
        Ok(decl.ty)
    }

    fn external_declaration(&mut self) -> PResult<()> {
        if self.eat(";") {
            return Ok(());
        }
        let spec = self.decl_specifiers()?;
        if self.eat(";") {
            return Ok(());
        }
        let mut first = true;
        loop {
            let decl = self.declarator(spec.ty, false)?;
            self.skip_attributes()?;
            if first && decl.ty.is_function() && self.check("{") {
                return self.function_definition(spec, decl);
            }
            first = false;
            self.file_scope_declaration(spec, decl)?;
            if self.eat(",") {
                continue;
            }
            self.expect(";")?;
            return Ok(());
        }
    }

    fn declare_function(
        &mut self,
        name: &'a str,
        ty: Type<'a>,
        is_static: bool,
        loc: Location,
    ) -> PResult<()> {
        match self.unit.symbols.get(name).copied() {
            Some(existing) if !existing.ty.is_function() => Err(semantic_error(
                loc,
                format!("'{name}' redeclared as a different kind of symbol"),
            )),
            Some(existing) => {
                if !compatible_functions(existing.ty, ty) {
                    return Err(semantic_error(loc, format!("conflicting types for '{name}'")));
                }
                // A prototype refines an earlier `()` declaration.
                if !existing.defined
                    && existing.ty.as_function().is_some_and(|f| f.unspecified)
                {
                    if let Some(symbol) = self.unit.symbols.get_mut(name) {
                        symbol.ty = ty;
                    }
                }
                Ok(())
            }
            None => {
                self.unit.symbols.insert(
                    name,
                    GlobalSymbol {
                        ty,
                        defined: false,
                        is_static,
                    },
                );
                Ok(())
            }
        }
    }

    fn file_scope_declaration(&mut self, spec: DeclSpec<'a>, decl: Declarator<'a>) -> PResult<()> {
        let Some((name, loc)) = decl.name else {
            return Err(syntax_error(self.loc(), "declaration does not declare anything"));
        };

        if spec.storage == Storage::Typedef {
            self.bind_file_scope(name, Binding::Typedef(decl.ty));
            return Ok(());
        }

        if decl.ty.is_function() {
            self.declare_function(name, decl.ty, spec.storage == Storage::Static, loc)?;
            self.bind_file_scope(name, Binding::Global(name));
            return Ok(());
        }

        if decl.ty.is_void() {
            return Err(semantic_error(loc, format!("variable '{name}' has type 'void'")));
        }

        let existing = self.unit.symbols.get(name).copied();
        if let Some(existing) = existing {
            if existing.ty.is_function() {
                return Err(semantic_error(
                    loc,
                    format!("'{name}' redeclared as a different kind of symbol"),
                ));
            }
        }

        let has_init = self.check("=");
        if spec.storage == Storage::Extern && !has_init {
            if existing.is_none() {
                self.unit.symbols.insert(
                    name,
                    GlobalSymbol {
                        ty: decl.ty,
                        defined: false,
                        is_static: false,
                    },
                );
            }
            self.bind_file_scope(name, Binding::Global(name));
            return Ok(());
        }

        let (ty, init) = if self.eat("=") {
            let (ty, items) = self.constant_initializer(decl.ty)?;
            (ty, Some(items))
        } else {
            (decl.ty, None)
        };
        if !ty.is_complete() {
            return Err(semantic_error(
                loc,
                format!("storage size of '{name}' is not known"),
            ));
        }

        if let Some(existing) = existing {
            if existing.defined {
                let redefined = self
                    .unit
                    .globals
                    .iter()
                    .any(|g| g.name == name && g.init.is_some());
                if init.is_some() && redefined {
                    return Err(semantic_error(loc, format!("redefinition of '{name}'")));
                }
                if init.is_none() {
                    // Repeated tentative definition.
                    self.bind_file_scope(name, Binding::Global(name));
                    return Ok(());
                }
                self.unit.globals.retain(|g| g.name != name);
            }
        }

        let is_static = spec.storage == Storage::Static
            || existing.is_some_and(|e| e.is_static);
        self.unit.symbols.insert(
            name,
            GlobalSymbol {
                ty,
                defined: true,
                is_static,
            },
        );
        self.unit.globals.push(GlobalVar {
            name,
            ty,
            is_static,
            is_const: spec.is_const && !ty.is_pointer(),
            init,
            loc,
        });
        self.bind_file_scope(name, Binding::Global(name));
        Ok(())
    }

    fn function_definition(&mut self, spec: DeclSpec<'a>, decl: Declarator<'a>) -> PResult<()> {
        let Some((name, loc)) = decl.name else {
            return Err(syntax_error(self.loc(), "function definition without a name"));
        };
        let Some(signature) = decl.ty.as_function() else {
            return Err(syntax_error(loc, "expected a function declarator"));
        };
        if spec.storage == Storage::Typedef {
            return Err(syntax_error(loc, "function definition declared 'typedef'"));
        }
        if signature.variadic {
            return Err(semantic_error(
                loc,
                format!("variadic function definition '{name}' is not supported"),
            ));
        }
        let params = decl.params.unwrap_or_default();
        let floats = params.iter().filter(|p| p.ty.is_double()).count();
        if params.len() - floats > MAX_INT_ARGS || floats > MAX_FLOAT_ARGS {
            return Err(semantic_error(
                loc,
                format!(
                    "'{name}' takes more than {MAX_INT_ARGS} integer or {MAX_FLOAT_ARGS} floating parameters"
                ),
            ));
        }
        if let Some(existing) = self.unit.symbols.get(name) {
            if existing.defined {
                return Err(semantic_error(loc, format!("redefinition of '{name}'")));
            }
        }
        self.declare_function(name, decl.ty, spec.storage == Storage::Static, loc)?;
        let is_static = spec.storage == Storage::Static
            || self.unit.symbols.get(name).is_some_and(|s| s.is_static);
        self.unit.symbols.insert(
            name,
            GlobalSymbol {
                ty: decl.ty,
                defined: true,
                is_static,
            },
        );
        self.bind_file_scope(name, Binding::Global(name));

        self.locals.clear();
        self.current = Some((name, signature.ret));
        self.scopes.push(HashMap::new());
        for param in &params {
            let Some(param_name) = param.name else {
                return Err(semantic_error(param.loc, "parameter name omitted"));
            };
            let id = self.locals.len();
            self.locals.push(LocalVar {
                name: param_name,
                ty: param.ty,
            });
            self.bind(param_name, Binding::Local(id));
        }

        self.expect("{")?;
        let body = self.block_items()?;
        self.scopes.pop();
        self.current = None;

        log::trace!("parsed function {} with {} locals", name, self.locals.len());
        self.unit.functions.push(Function {
            name,
            signature,
            locals: std::mem::take(&mut self.locals),
            body,
            is_static,
            loc,
        });
        Ok(())
    }

    // ==== INITIALISERS ====

    /// Parse a global initialiser; returns the completed type (for `T[]`)
    /// and the constant items.
    fn constant_initializer(&mut self, ty: Type<'a>) -> PResult<(Type<'a>, Vec<InitItem<'a>>)> {
        let mut items = Vec::new();
        let ty = self.constant_init_into(ty, 0, &mut items)?;
        Ok((ty, items))
    }

    fn constant_init_into(
        &mut self,
        ty: Type<'a>,
        offset: usize,
        items: &mut Vec<InitItem<'a>>,
    ) -> PResult<Type<'a>> {
        self.nested(|p| p.constant_init_inner(ty, offset, items))
    }

    fn constant_init_inner(
        &mut self,
        ty: Type<'a>,
        offset: usize,
        items: &mut Vec<InitItem<'a>>,
    ) -> PResult<Type<'a>> {
        let loc = self.loc();
        if let Type::Array(element, len) = ty {
            let element = *element;
            if let Some(bytes) = self.string_for_array(element)? {
                let (bytes, len) = fit_string(bytes, len);
                items.push(InitItem {
                    offset,
                    value: InitValue::Bytes(bytes),
                });
                return Ok(Type::array_of(self.arena, element, Some(len)));
            }
            if !self.eat("{") {
                return Err(semantic_error(loc, "array initializer must be a brace-enclosed list"));
            }
            let mut count = 0usize;
            while !self.check("}") {
                if len.is_some_and(|len| count >= len) {
                    return Err(semantic_error(self.loc(), "excess elements in array initializer"));
                }
                self.constant_init_into(element, offset + count * element.size(), items)?;
                count += 1;
                if !self.eat(",") {
                    break;
                }
            }
            self.expect("}")?;
            return Ok(Type::array_of(self.arena, element, Some(len.unwrap_or(count))));
        }

        let braced = self.eat("{");
        let expr = self.assignment()?;
        if braced {
            self.eat(",");
            self.expect("}")?;
        }
        let value = self.assign_convert(expr, ty, loc)?;
        match constant_value(value, ty) {
            Some(value) => {
                items.push(InitItem { offset, value });
                Ok(ty)
            }
            None => Err(semantic_error(loc, "initializer element is not a compile-time constant")),
        }
    }

    /// String literal initialising a character array, if present.
    fn string_for_array(&mut self, element: Type<'a>) -> PResult<Option<Vec<u8>>> {
        let is_char = matches!(element, Type::Int(IntType { size: 1, .. }));
        let braced_string = self.check("{") && matches!(self.peek_at(1).kind, TokenKind::Str(_));
        if !is_char || !(matches!(self.peek().kind, TokenKind::Str(_)) || braced_string) {
            return Ok(None);
        }
        let braced = self.eat("{");
        let mut bytes = Vec::new();
        while let TokenKind::Str(part) = &self.peek().kind {
            bytes.extend_from_slice(part);
            self.bump();
        }
        if braced {
            self.expect("}")?;
        }
        Ok(Some(bytes))
    }

    fn local_init_into(
        &mut self,
        ty: Type<'a>,
        offset: usize,
        stores: &mut Vec<InitStore<'a>>,
    ) -> PResult<Type<'a>> {
        self.nested(|p| p.local_init_inner(ty, offset, stores))
    }

    fn local_init_inner(
        &mut self,
        ty: Type<'a>,
        offset: usize,
        stores: &mut Vec<InitStore<'a>>,
    ) -> PResult<Type<'a>> {
        let loc = self.loc();
        if let Type::Array(element, len) = ty {
            let element = *element;
            if let Some(bytes) = self.string_for_array(element)? {
                let (bytes, len) = fit_string(bytes, len);
                for (i, byte) in bytes.iter().enumerate().filter(|(_, b)| **b != 0) {
                    let value = element
                        .int_type()
                        .map_or(i64::from(*byte), |int| int.wrap(i64::from(*byte)));
                    stores.push(InitStore {
                        offset: offset + i,
                        value: self.mk(ExprKind::IntLit(value), element, loc),
                    });
                }
                return Ok(Type::array_of(self.arena, element, Some(len)));
            }
            if !self.eat("{") {
                return Err(semantic_error(loc, "array initializer must be a brace-enclosed list"));
            }
            let mut count = 0usize;
            while !self.check("}") {
                if len.is_some_and(|len| count >= len) {
                    return Err(semantic_error(self.loc(), "excess elements in array initializer"));
                }
                self.local_init_into(element, offset + count * element.size(), stores)?;
                count += 1;
                if !self.eat(",") {
                    break;
                }
            }
            self.expect("}")?;
            return Ok(Type::array_of(self.arena, element, Some(len.unwrap_or(count))));
        }

        let braced = self.eat("{");
        let expr = self.assignment()?;
        if braced {
            self.eat(",");
            self.expect("}")?;
        }
        let value = self.assign_convert(expr, ty, loc)?;
        stores.push(InitStore { offset, value });
        Ok(ty)
    }

    // ==== STATEMENTS ====

    /// Items up to and including the closing `}`.
    fn block_items(&mut self) -> PResult<&'a [Stmt<'a>]> {
        let mut stmts = Vec::new();
        while !self.check("}") {
            if self.at_eof() {
                return Err(syntax_error(self.loc(), "expected '}' at end of input"));
            }
            let result = if self.is_declaration_start(self.peek()) {
                self.local_declaration(&mut stmts)
            } else {
                self.statement().map(|stmt| stmts.push(stmt))
            };
            if let Err(diag) = result {
                self.errors.push(diag);
                self.synchronize(true);
            }
        }
        self.expect("}")?;
        Ok(self.arena.alloc_slice_copy(&stmts))
    }

    fn compound(&mut self) -> PResult<Stmt<'a>> {
        self.expect("{")?;
        self.scopes.push(HashMap::new());
        let body = self.block_items();
        self.scopes.pop();
        Ok(Stmt::Block(body?))
    }

    fn local_declaration(&mut self, stmts: &mut Vec<Stmt<'a>>) -> PResult<()> {
        let spec = self.decl_specifiers()?;
        if self.eat(";") {
            return Ok(());
        }
        loop {
            let decl = self.declarator(spec.ty, false)?;
            self.skip_attributes()?;
            let Some((name, loc)) = decl.name else {
                return Err(syntax_error(self.loc(), "expected identifier"));
            };

            if spec.storage == Storage::Typedef {
                self.bind(name, Binding::Typedef(decl.ty));
            } else if decl.ty.is_function() {
                self.declare_function(name, decl.ty, false, loc)?;
                self.bind(name, Binding::Global(name));
            } else if spec.storage == Storage::Extern {
                if !self.unit.symbols.contains_key(name) {
                    self.unit.symbols.insert(
                        name,
                        GlobalSymbol {
                            ty: decl.ty,
                            defined: false,
                            is_static: false,
                        },
                    );
                }
                self.bind(name, Binding::Global(name));
            } else if spec.storage == Storage::Static {
                self.static_local(name, decl.ty, spec.is_const, loc)?;
            } else {
                if decl.ty.is_void() {
                    return Err(semantic_error(loc, format!("variable '{name}' has type 'void'")));
                }
                let id = self.locals.len();
                let mut ty = decl.ty;
                let stmt = if self.eat("=") {
                    let mut stores = Vec::new();
                    ty = self.local_init_into(decl.ty, 0, &mut stores)?;
                    Some(Stmt::InitLocal {
                        local: id,
                        zero: ty.is_array(),
                        stores: self.arena.alloc_slice_copy(&stores),
                    })
                } else {
                    None
                };
                if !ty.is_complete() {
                    return Err(semantic_error(
                        loc,
                        format!("storage size of '{name}' is not known"),
                    ));
                }
                self.locals.push(LocalVar { name, ty });
                self.bind(name, Binding::Local(id));
                stmts.extend(stmt);
            }

            if self.eat(",") {
                continue;
            }
            self.expect(";")?;
            return Ok(());
        }
    }

    fn static_local(
        &mut self,
        name: &'a str,
        ty: Type<'a>,
        is_const: bool,
        loc: Location,
    ) -> PResult<()> {
        let function = self.current.map_or("", |(f, _)| f);
        self.static_locals += 1;
        let mangled = self.name(&format!("{function}.{name}.{}", self.static_locals));
        let (ty, init) = if self.eat("=") {
            let (ty, items) = self.constant_initializer(ty)?;
            (ty, Some(items))
        } else {
            (ty, None)
        };
        if !ty.is_complete() {
            return Err(semantic_error(loc, format!("storage size of '{name}' is not known")));
        }
        self.unit.symbols.insert(
            mangled,
            GlobalSymbol {
                ty,
                defined: true,
                is_static: true,
            },
        );
        self.unit.globals.push(GlobalVar {
            name: mangled,
            ty,
            is_static: true,
            is_const: is_const && !ty.is_pointer(),
            init,
            loc,
        });
        self.bind(name, Binding::Global(mangled));
        Ok(())
    }

    fn statement(&mut self) -> PResult<Stmt<'a>> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> PResult<Stmt<'a>> {
        let loc = self.loc();
        let keyword = match &self.peek().kind {
            TokenKind::Keyword(k) => Some(*k),
            _ => None,
        };
        match keyword {
            Some("if") => {
                self.bump();
                self.expect("(")?;
                let cond = self.expression()?;
                let cond = self.condition(cond)?;
                self.expect(")")?;
                let then = self.statement()?;
                let otherwise = if self.eat_keyword("else") {
                    let stmt = self.statement()?;
                    Some(&*self.arena.alloc(stmt))
                } else {
                    None
                };
                Ok(Stmt::If(cond, self.arena.alloc(then), otherwise))
            }
            Some("while") => {
                self.bump();
                self.expect("(")?;
                let cond = self.expression()?;
                let cond = self.condition(cond)?;
                self.expect(")")?;
                let body = self.loop_body()?;
                Ok(Stmt::While(cond, body))
            }
            Some("do") => {
                self.bump();
                let body = self.loop_body()?;
                if !self.eat_keyword("while") {
                    return Err(syntax_error(
                        self.loc(),
                        format!("expected 'while' before {}", self.peek().describe()),
                    ));
                }
                self.expect("(")?;
                let cond = self.expression()?;
                let cond = self.condition(cond)?;
                self.expect(")")?;
                self.expect(";")?;
                Ok(Stmt::DoWhile(body, cond))
            }
            Some("for") => {
                self.bump();
                self.scopes.push(HashMap::new());
                let result = self.for_statement();
                self.scopes.pop();
                result
            }
            Some("break") | Some("continue") => {
                self.bump();
                if self.loop_depth == 0 {
                    return Err(semantic_error(
                        loc,
                        format!("'{}' statement not in loop", keyword.unwrap_or_default()),
                    ));
                }
                self.expect(";")?;
                Ok(if keyword == Some("break") {
                    Stmt::Break
                } else {
                    Stmt::Continue
                })
            }
            Some("return") => {
                self.bump();
                let ret = self.current.map_or(Type::INT, |(_, ret)| ret);
                if self.eat(";") {
                    if !ret.is_void() {
                        self.warn(loc, "non-void function should return a value");
                    }
                    return Ok(Stmt::Return(None));
                }
                let value = self.expression()?;
                self.expect(";")?;
                if ret.is_void() {
                    if !value.ty.is_void() {
                        self.warn(loc, "void function should not return a value");
                    }
                    return Ok(Stmt::Return(Some(value)));
                }
                let value = self.assign_convert(value, ret, loc)?;
                Ok(Stmt::Return(Some(value)))
            }
            Some("switch") | Some("goto") | Some("case") | Some("default") => Err(semantic_error(
                loc,
                format!("'{}' statements are not supported", keyword.unwrap_or_default()),
            )),
            _ if self.check("{") => self.compound(),
            _ if self.eat(";") => Ok(Stmt::Empty),
            _ => {
                let expr = self.expression()?;
                self.expect(";")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn loop_body(&mut self) -> PResult<&'a Stmt<'a>> {
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        Ok(self.arena.alloc(body?))
    }

    fn for_statement(&mut self) -> PResult<Stmt<'a>> {
        self.expect("(")?;
        let init = if self.eat(";") {
            None
        } else if self.is_declaration_start(self.peek()) {
            let mut stmts = Vec::new();
            self.local_declaration(&mut stmts)?;
            Some(&*self.arena.alloc(Stmt::Block(self.arena.alloc_slice_copy(&stmts))))
        } else {
            let expr = self.expression()?;
            self.expect(";")?;
            Some(&*self.arena.alloc(Stmt::Expr(expr)))
        };
        let cond = if self.check(";") {
            None
        } else {
            let cond = self.expression()?;
            Some(self.condition(cond)?)
        };
        self.expect(";")?;
        let step = if self.check(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(")")?;
        let body = self.loop_body()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    // ==== CONVERSIONS ====

    /// Decay arrays and function designators to pointers.
    fn rvalue(&self, expr: &'a Expr<'a>) -> &'a Expr<'a> {
        match expr.ty {
            Type::Array(element, _) => {
                self.mk(ExprKind::AddrOf(expr), self.ptr(*element), expr.loc)
            }
            Type::Function(_) => self.mk(ExprKind::AddrOf(expr), self.ptr(expr.ty), expr.loc),
            _ => expr,
        }
    }

    /// Convert a scalar rvalue to `to`, folding constants.
    fn convert(&self, expr: &'a Expr<'a>, to: Type<'a>) -> &'a Expr<'a> {
        if expr.ty == to {
            return expr;
        }
        let folded = match (expr.kind, to) {
            (ExprKind::IntLit(value), Type::Int(int)) => Some(ExprKind::IntLit(int.wrap(value))),
            (ExprKind::IntLit(value), Type::Pointer(_)) => Some(ExprKind::IntLit(value)),
            (ExprKind::IntLit(value), Type::Double) => {
                let unsigned = expr.ty.int_type().is_some_and(|i| !i.signed);
                Some(ExprKind::FloatLit(if unsigned {
                    value as u64 as f64
                } else {
                    value as f64
                }))
            }
            (ExprKind::FloatLit(value), Type::Int(int)) => {
                Some(ExprKind::IntLit(int.wrap(value as i64)))
            }
            _ => None,
        };
        match folded {
            Some(kind) => self.mk(kind, to, expr.loc),
            None => self.mk(ExprKind::Cast(expr), to, expr.loc),
        }
    }

    /// Convert for assignment, parameter passing or return.
    fn assign_convert(
        &mut self,
        expr: &'a Expr<'a>,
        to: Type<'a>,
        loc: Location,
    ) -> PResult<&'a Expr<'a>> {
        let expr = self.rvalue(expr);
        let from = expr.ty;
        match (from, to) {
            (_, _) if from.is_arithmetic() && to.is_arithmetic() => {}
            (Type::Pointer(a), Type::Pointer(b)) => {
                if a != b && !a.is_void() && !b.is_void() {
                    self.warn(
                        loc,
                        format!("incompatible pointer types converting '{from}' to '{to}'"),
                    );
                }
            }
            (Type::Int(_), Type::Pointer(_)) => {
                if expr.int_value() != Some(0) {
                    self.warn(loc, "conversion makes pointer from integer without a cast");
                }
            }
            (Type::Pointer(_), Type::Int(_)) => {
                self.warn(loc, "conversion makes integer from pointer without a cast");
            }
            _ => {
                return Err(semantic_error(
                    loc,
                    format!("incompatible types converting '{from}' to '{to}'"),
                ))
            }
        }
        Ok(self.convert(expr, to))
    }

    /// Boolean-valued form of a controlling expression.
    fn condition(&mut self, expr: &'a Expr<'a>) -> PResult<&'a Expr<'a>> {
        let expr = self.rvalue(expr);
        if !expr.ty.is_scalar() {
            return Err(semantic_error(
                expr.loc,
                format!("used type '{}' where a scalar is required", expr.ty),
            ));
        }
        if expr.is_boolean() {
            return Ok(expr);
        }
        let zero = self.zero(expr.ty, expr.loc);
        Ok(self.build_compare(CmpOp::Ne, expr, zero))
    }

    fn zero(&self, ty: Type<'a>, loc: Location) -> &'a Expr<'a> {
        match ty {
            Type::Double => self.mk(ExprKind::FloatLit(0.0), ty, loc),
            _ => self.mk(ExprKind::IntLit(0), ty, loc),
        }
    }

    fn constant_int(&self, expr: &'a Expr<'a>) -> PResult<i64> {
        match expr.kind {
            ExprKind::IntLit(value) if expr.ty.is_integer() => Ok(value),
            _ => Err(semantic_error(expr.loc, "expected an integer constant expression")),
        }
    }

    // ==== EXPRESSIONS ====

    fn expression(&mut self) -> PResult<&'a Expr<'a>> {
        let mut expr = self.assignment()?;
        while self.check(",") {
            let loc = self.bump().loc;
            let rhs = self.assignment()?;
            let rhs = self.rvalue(rhs);
            expr = bounded(self.mk(ExprKind::Comma(expr, rhs), rhs.ty, loc))?;
        }
        Ok(expr)
    }

    fn assignment(&mut self) -> PResult<&'a Expr<'a>> {
        self.nested(Self::assignment_inner)
    }

    fn assignment_inner(&mut self) -> PResult<&'a Expr<'a>> {
        let target = self.conditional()?;
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "=" => None,
                "+=" => Some(BinOp::Add),
                "-=" => Some(BinOp::Sub),
                "*=" => Some(BinOp::Mul),
                "/=" => Some(BinOp::Div),
                "%=" => Some(BinOp::Rem),
                "<<=" => Some(BinOp::Shl),
                ">>=" => Some(BinOp::Shr),
                "&=" => Some(BinOp::BitAnd),
                "|=" => Some(BinOp::BitOr),
                "^=" => Some(BinOp::BitXor),
                _ => return Ok(target),
            },
            _ => return Ok(target),
        };
        let loc = self.bump().loc;
        if !target.is_lvalue() || target.ty.is_array() {
            return Err(semantic_error(loc, "expression is not assignable"));
        }
        let rhs = self.assignment()?;

        let Some(op) = op else {
            let value = self.assign_convert(rhs, target.ty, loc)?;
            return Ok(self.mk(ExprKind::Assign(target, value), target.ty, loc));
        };

        let rhs = self.rvalue(rhs);
        let (rhs, op_ty) = if target.ty.is_pointer() && matches!(op, BinOp::Add | BinOp::Sub) {
            if !rhs.ty.is_integer() {
                return Err(self.invalid_operands(op, target.ty, rhs.ty, loc));
            }
            (self.scale_index(rhs, target.ty), target.ty)
        } else {
            self.check_operands(op, target.ty, rhs.ty, loc)?;
            let op_ty = if matches!(op, BinOp::Shl | BinOp::Shr) {
                promote(target.ty)
            } else {
                usual_arithmetic(target.ty, rhs.ty)
            };
            (self.convert(rhs, op_ty), op_ty)
        };
        Ok(self.mk(
            ExprKind::CompoundAssign {
                op,
                target,
                rhs,
                op_ty,
            },
            target.ty,
            loc,
        ))
    }

    fn conditional(&mut self) -> PResult<&'a Expr<'a>> {
        let cond = self.binary(1)?;
        if !self.check("?") {
            return Ok(cond);
        }
        let loc = self.bump().loc;
        let then = self.expression()?;
        self.expect(":")?;
        let otherwise = self.nested(Self::conditional)?;
        let cond = self.condition(cond)?;
        let then = self.rvalue(then);
        let otherwise = self.rvalue(otherwise);

        let ty = match (then.ty, otherwise.ty) {
            (a, b) if a.is_arithmetic() && b.is_arithmetic() => usual_arithmetic(a, b),
            (Type::Void, Type::Void) => Type::Void,
            (Type::Pointer(a), Type::Pointer(_)) if a.is_void() => then.ty,
            (Type::Pointer(_), Type::Pointer(b)) if b.is_void() => otherwise.ty,
            (Type::Pointer(_), Type::Pointer(_)) => then.ty,
            (Type::Pointer(_), Type::Int(_)) if otherwise.int_value() == Some(0) => then.ty,
            (Type::Int(_), Type::Pointer(_)) if then.int_value() == Some(0) => otherwise.ty,
            (a, b) => {
                return Err(semantic_error(
                    loc,
                    format!("incompatible operand types ('{a}' and '{b}')"),
                ))
            }
        };
        let (then, otherwise) = if ty.is_void() {
            (then, otherwise)
        } else {
            (self.convert(then, ty), self.convert(otherwise, ty))
        };
        if let (Some(c), true) = (cond.int_value(), !ty.is_void()) {
            return Ok(if c != 0 { then } else { otherwise });
        }
        Ok(self.mk(ExprKind::Cond(cond, then, otherwise), ty, loc))
    }

    fn binary(&mut self, min_prec: u8) -> PResult<&'a Expr<'a>> {
        let mut lhs = bounded(self.cast()?)?;
        loop {
            let (op, prec) = match &self.peek().kind {
                TokenKind::Punct(p) => match binary_precedence(p) {
                    Some(prec) => (*p, prec),
                    None => break,
                },
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            let loc = self.bump().loc;
            let rhs = self.binary(prec + 1)?;
            lhs = self.build_binary(op, lhs, rhs, loc)?;
            lhs = bounded(lhs)?;
        }
        Ok(lhs)
    }

    fn build_binary(
        &mut self,
        op: &str,
        lhs: &'a Expr<'a>,
        rhs: &'a Expr<'a>,
        loc: Location,
    ) -> PResult<&'a Expr<'a>> {
        let cmp = match op {
            "||" | "&&" => {
                let lhs = self.condition(lhs)?;
                let rhs = self.condition(rhs)?;
                if let (Some(l), Some(r)) = (lhs.int_value(), rhs.int_value()) {
                    let value = if op == "||" { l != 0 || r != 0 } else { l != 0 && r != 0 };
                    return Ok(self.mk(ExprKind::IntLit(i64::from(value)), Type::INT, loc));
                }
                let kind = if op == "||" {
                    ExprKind::LogOr(lhs, rhs)
                } else {
                    ExprKind::LogAnd(lhs, rhs)
                };
                return Ok(self.mk(kind, Type::INT, loc));
            }
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            _ => None,
        };
        let lhs = self.rvalue(lhs);
        let rhs = self.rvalue(rhs);
        if let Some(cmp) = cmp {
            return self.comparison(cmp, lhs, rhs, loc);
        }
        let op = match op {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Rem,
            "<<" => BinOp::Shl,
            ">>" => BinOp::Shr,
            "&" => BinOp::BitAnd,
            "|" => BinOp::BitOr,
            _ => BinOp::BitXor,
        };
        self.arithmetic(op, lhs, rhs, loc)
    }

    fn invalid_operands(&self, op: BinOp, l: Type<'a>, r: Type<'a>, loc: Location) -> Diagnostic {
        semantic_error(
            loc,
            format!("invalid operands to binary {} ('{l}' and '{r}')", binop_symbol(op)),
        )
    }

    fn check_operands(&self, op: BinOp, l: Type<'a>, r: Type<'a>, loc: Location) -> PResult<()> {
        let ok = match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                l.is_arithmetic() && r.is_arithmetic()
            }
            _ => l.is_integer() && r.is_integer(),
        };
        if ok {
            Ok(())
        } else {
            Err(self.invalid_operands(op, l, r, loc))
        }
    }

    /// `index * sizeof(*pointer)` as a `long`.
    fn scale_index(&self, index: &'a Expr<'a>, pointer: Type<'a>) -> &'a Expr<'a> {
        let index = self.convert(index, Type::LONG);
        let size = pointer.pointee().map_or(1, |p| p.size()) as i64;
        if size == 1 {
            return index;
        }
        let scale = self.mk(ExprKind::IntLit(size), Type::LONG, index.loc);
        self.fold(BinOp::Mul, index, scale, Type::LONG, index.loc)
    }

    fn pointer_offset(
        &self,
        op: BinOp,
        pointer: &'a Expr<'a>,
        index: &'a Expr<'a>,
        loc: Location,
    ) -> &'a Expr<'a> {
        let scaled = self.scale_index(index, pointer.ty);
        self.mk(ExprKind::Binary(op, pointer, scaled), pointer.ty, loc)
    }

    fn arithmetic(
        &mut self,
        op: BinOp,
        lhs: &'a Expr<'a>,
        rhs: &'a Expr<'a>,
        loc: Location,
    ) -> PResult<&'a Expr<'a>> {
        match (op, lhs.ty, rhs.ty) {
            (BinOp::Add | BinOp::Sub, Type::Pointer(p), Type::Int(_)) => {
                if !p.is_complete() && !p.is_void() {
                    return Err(semantic_error(loc, "arithmetic on a pointer to an incomplete type"));
                }
                return Ok(self.pointer_offset(op, lhs, rhs, loc));
            }
            (BinOp::Add, Type::Int(_), Type::Pointer(_)) => {
                return Ok(self.pointer_offset(op, rhs, lhs, loc));
            }
            (BinOp::Sub, Type::Pointer(a), Type::Pointer(b)) => {
                if a != b {
                    return Err(semantic_error(
                        loc,
                        format!("'{}' and '{}' are not pointers to compatible types", lhs.ty, rhs.ty),
                    ));
                }
                let l = self.convert(lhs, Type::LONG);
                let r = self.convert(rhs, Type::LONG);
                let diff = self.mk(ExprKind::Binary(BinOp::Sub, l, r), Type::LONG, loc);
                let size = a.size() as i64;
                if size == 1 {
                    return Ok(diff);
                }
                let size = self.mk(ExprKind::IntLit(size), Type::LONG, loc);
                return Ok(self.mk(ExprKind::Binary(BinOp::Div, diff, size), Type::LONG, loc));
            }
            _ => {}
        }

        self.check_operands(op, lhs.ty, rhs.ty, loc)?;
        let ty = if matches!(op, BinOp::Shl | BinOp::Shr) {
            promote(lhs.ty)
        } else {
            usual_arithmetic(lhs.ty, rhs.ty)
        };
        let l = self.convert(lhs, ty);
        let r = self.convert(rhs, ty);
        if matches!(op, BinOp::Div | BinOp::Rem) && r.int_value() == Some(0) {
            self.warn(loc, "division by zero");
        }
        Ok(self.fold(op, l, r, ty, loc))
    }

    fn fold(
        &self,
        op: BinOp,
        l: &'a Expr<'a>,
        r: &'a Expr<'a>,
        ty: Type<'a>,
        loc: Location,
    ) -> &'a Expr<'a> {
        match (l.kind, r.kind, ty) {
            (ExprKind::IntLit(a), ExprKind::IntLit(b), Type::Int(int)) => {
                if let Some(value) = fold_int(op, a, b, int) {
                    return self.mk(ExprKind::IntLit(value), ty, loc);
                }
            }
            (ExprKind::FloatLit(a), ExprKind::FloatLit(b), Type::Double) => {
                let value = match op {
                    BinOp::Add => Some(a + b),
                    BinOp::Sub => Some(a - b),
                    BinOp::Mul => Some(a * b),
                    BinOp::Div => Some(a / b),
                    _ => None,
                };
                if let Some(value) = value {
                    return self.mk(ExprKind::FloatLit(value), ty, loc);
                }
            }
            _ => {}
        }
        self.mk(ExprKind::Binary(op, l, r), ty, loc)
    }

    fn build_compare(&self, op: CmpOp, l: &'a Expr<'a>, r: &'a Expr<'a>) -> &'a Expr<'a> {
        let loc = l.loc;
        if let (Some(a), Some(b)) = (l.int_value(), r.int_value()) {
            let signed = l.ty.int_type().is_some_and(|i| i.signed);
            let ordering = if signed {
                a.cmp(&b)
            } else {
                (a as u64).cmp(&(b as u64))
            };
            let value = match op {
                CmpOp::Eq => ordering.is_eq(),
                CmpOp::Ne => ordering.is_ne(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
            };
            return self.mk(ExprKind::IntLit(i64::from(value)), Type::INT, loc);
        }
        self.mk(ExprKind::Compare(op, l, r), Type::INT, loc)
    }

    fn comparison(
        &mut self,
        op: CmpOp,
        lhs: &'a Expr<'a>,
        rhs: &'a Expr<'a>,
        loc: Location,
    ) -> PResult<&'a Expr<'a>> {
        let (l, r) = match (lhs.ty, rhs.ty) {
            (a, b) if a.is_arithmetic() && b.is_arithmetic() => {
                let ty = usual_arithmetic(a, b);
                (self.convert(lhs, ty), self.convert(rhs, ty))
            }
            (Type::Pointer(_), Type::Pointer(_)) => (lhs, rhs),
            (Type::Pointer(_), Type::Int(_)) => {
                if rhs.int_value() != Some(0) {
                    self.warn(loc, "comparison between pointer and integer");
                }
                (lhs, self.convert(rhs, lhs.ty))
            }
            (Type::Int(_), Type::Pointer(_)) => {
                if lhs.int_value() != Some(0) {
                    self.warn(loc, "comparison between pointer and integer");
                }
                (self.convert(lhs, rhs.ty), rhs)
            }
            (a, b) => {
                return Err(semantic_error(
                    loc,
                    format!("invalid operands to comparison ('{a}' and '{b}')"),
                ))
            }
        };
        let cmp = self.build_compare(op, l, r);
        Ok(self.mk(cmp.kind, cmp.ty, loc))
    }

    fn cast(&mut self) -> PResult<&'a Expr<'a>> {
        self.nested(Self::cast_inner)
    }

    fn cast_inner(&mut self) -> PResult<&'a Expr<'a>> {
        if self.check("(") && self.is_type_start(self.peek_at(1)) {
            let loc = self.bump().loc;
            let ty = self.type_name()?;
            self.expect(")")?;
            let operand = self.cast()?;
            let operand = self.rvalue(operand);
            let ok = ty.is_void()
                || (ty.is_scalar()
                    && operand.ty.is_scalar()
                    && !(ty.is_double() && operand.ty.is_pointer())
                    && !(ty.is_pointer() && operand.ty.is_double()));
            if !ok {
                return Err(semantic_error(
                    loc,
                    format!("cannot cast '{}' to '{ty}'", operand.ty),
                ));
            }
            let converted = self.convert(operand, ty);
            return Ok(self.mk(converted.kind, converted.ty, loc));
        }
        self.unary()
    }

    fn unary(&mut self) -> PResult<&'a Expr<'a>> {
        let loc = self.loc();
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => *p,
            TokenKind::Keyword("sizeof") => {
                self.bump();
                return self.sizeof(loc);
            }
            _ => return self.postfix(),
        };
        match op {
            "++" | "--" => {
                self.bump();
                let target = self.nested(Self::unary)?;
                self.inc_dec(target, op == "++", true, loc)
            }
            "&" => {
                self.bump();
                let operand = self.cast()?;
                let addressable = operand.is_lvalue()
                    || operand.ty.is_function()
                    || matches!(operand.kind, ExprKind::StrLit(_));
                if !addressable {
                    return Err(semantic_error(loc, "cannot take the address of an rvalue"));
                }
                if let ExprKind::Deref(inner) = operand.kind {
                    return Ok(self.mk(inner.kind, self.ptr(operand.ty), loc));
                }
                Ok(self.mk(ExprKind::AddrOf(operand), self.ptr(operand.ty), loc))
            }
            "*" => {
                self.bump();
                let operand = self.cast()?;
                let operand = self.rvalue(operand);
                match operand.ty {
                    Type::Pointer(pointee) if pointee.is_void() => {
                        Err(semantic_error(loc, "dereferencing a 'void *' pointer"))
                    }
                    Type::Pointer(pointee) => {
                        if let ExprKind::AddrOf(inner) = operand.kind {
                            if inner.ty == *pointee {
                                return Ok(inner);
                            }
                        }
                        Ok(self.mk(ExprKind::Deref(operand), *pointee, loc))
                    }
                    other => Err(semantic_error(
                        loc,
                        format!("indirection requires a pointer operand ('{other}' invalid)"),
                    )),
                }
            }
            "+" | "-" | "~" => {
                self.bump();
                let operand = self.cast()?;
                let operand = self.rvalue(operand);
                let valid = if op == "~" {
                    operand.ty.is_integer()
                } else {
                    operand.ty.is_arithmetic()
                };
                if !valid {
                    return Err(semantic_error(
                        loc,
                        format!("invalid argument type '{}' to unary '{op}'", operand.ty),
                    ));
                }
                let ty = promote(operand.ty);
                let operand = self.convert(operand, ty);
                match (op, operand.kind, ty) {
                    ("+", _, _) => Ok(operand),
                    ("-", ExprKind::IntLit(v), Type::Int(int)) => {
                        Ok(self.mk(ExprKind::IntLit(int.wrap(v.wrapping_neg())), ty, loc))
                    }
                    ("-", ExprKind::FloatLit(v), _) => Ok(self.mk(ExprKind::FloatLit(-v), ty, loc)),
                    ("~", ExprKind::IntLit(v), Type::Int(int)) => {
                        Ok(self.mk(ExprKind::IntLit(int.wrap(!v)), ty, loc))
                    }
                    ("-", _, _) => Ok(self.mk(ExprKind::Unary(UnOp::Neg, operand), ty, loc)),
                    _ => Ok(self.mk(ExprKind::Unary(UnOp::BitNot, operand), ty, loc)),
                }
            }
            "!" => {
                self.bump();
                let operand = self.cast()?;
                let operand = self.rvalue(operand);
                if !operand.ty.is_scalar() {
                    return Err(semantic_error(
                        loc,
                        format!("invalid argument type '{}' to unary '!'", operand.ty),
                    ));
                }
                let zero = self.zero(operand.ty, loc);
                let cmp = self.build_compare(CmpOp::Eq, operand, zero);
                Ok(self.mk(cmp.kind, cmp.ty, loc))
            }
            _ => self.postfix(),
        }
    }

    fn sizeof(&mut self, loc: Location) -> PResult<&'a Expr<'a>> {
        let ty = if self.check("(") && self.is_type_start(self.peek_at(1)) {
            self.bump();
            let ty = self.type_name()?;
            self.expect(")")?;
            ty
        } else {
            self.nested(Self::unary)?.ty
        };
        if !ty.is_complete() {
            return Err(semantic_error(
                loc,
                format!("invalid application of 'sizeof' to incomplete type '{ty}'"),
            ));
        }
        Ok(self.mk(ExprKind::IntLit(ty.size() as i64), Type::ULONG, loc))
    }

    fn inc_dec(
        &mut self,
        target: &'a Expr<'a>,
        increment: bool,
        prefix: bool,
        loc: Location,
    ) -> PResult<&'a Expr<'a>> {
        if !target.is_lvalue() || !target.ty.is_scalar() {
            return Err(semantic_error(
                loc,
                format!(
                    "cannot {} value of type '{}'",
                    if increment { "increment" } else { "decrement" },
                    target.ty
                ),
            ));
        }
        let step = target.ty.pointee().map_or(1, |p| p.size()) as i64;
        let delta = if increment { step } else { -step };
        Ok(self.mk(
            ExprKind::IncDec {
                target,
                delta,
                prefix,
            },
            target.ty,
            loc,
        ))
    }

    fn postfix(&mut self) -> PResult<&'a Expr<'a>> {
        let mut expr = self.primary()?;
        loop {
            let loc = self.loc();
            if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                let base = self.rvalue(expr);
                let index = self.rvalue(index);
                let pointer = match (base.ty, index.ty) {
                    (Type::Pointer(_), Type::Int(_)) => self.pointer_offset(BinOp::Add, base, index, loc),
                    (Type::Int(_), Type::Pointer(_)) => self.pointer_offset(BinOp::Add, index, base, loc),
                    _ => {
                        return Err(semantic_error(
                            loc,
                            "subscripted value is not an array or pointer",
                        ))
                    }
                };
                let element = pointer.ty.pointee().unwrap_or(Type::Void);
                if element.is_void() || element.is_function() {
                    return Err(semantic_error(loc, format!("subscript of '{}'", pointer.ty)));
                }
                expr = self.mk(ExprKind::Deref(pointer), element, loc);
            } else if self.eat("(") {
                expr = self.call(expr, loc)?;
            } else if self.check("++") || self.check("--") {
                let increment = self.bump().is_punct("++");
                expr = self.inc_dec(expr, increment, false, loc)?;
            } else if self.check(".") || self.check("->") {
                return Err(semantic_error(loc, "member access is not supported"));
            } else {
                return Ok(expr);
            }
        }
    }

    fn call(&mut self, callee: &'a Expr<'a>, loc: Location) -> PResult<&'a Expr<'a>> {
        let (target, signature, name) = match (callee.kind, callee.ty) {
            (ExprKind::Global(name), Type::Function(signature)) => {
                (Callee::Direct(name), signature, name)
            }
            _ => {
                let pointer = self.rvalue(callee);
                match pointer.ty.pointee() {
                    Some(Type::Function(signature)) => {
                        (Callee::Indirect(pointer), signature, "function pointer")
                    }
                    _ => {
                        return Err(semantic_error(
                            loc,
                            format!("called object type '{}' is not a function", callee.ty),
                        ))
                    }
                }
            }
        };

        let mut args = Vec::new();
        if !self.eat(")") {
            loop {
                args.push((self.loc(), self.assignment()?));
                if self.eat(",") {
                    continue;
                }
                self.expect(")")?;
                break;
            }
        }

        let fixed = signature.params.len();
        if !signature.unspecified {
            if args.len() < fixed || (args.len() > fixed && !signature.variadic) {
                return Err(semantic_error(
                    loc,
                    format!(
                        "too {} arguments to '{name}' (expected {fixed}, got {})",
                        if args.len() < fixed { "few" } else { "many" },
                        args.len()
                    ),
                ));
            }
        }

        let mut converted = Vec::with_capacity(args.len());
        for (i, (arg_loc, arg)) in args.into_iter().enumerate() {
            let value = match signature.params.get(i) {
                Some(param) if !signature.unspecified => self.assign_convert(arg, *param, arg_loc)?,
                _ => {
                    let arg = self.rvalue(arg);
                    if !arg.ty.is_scalar() {
                        return Err(semantic_error(
                            arg_loc,
                            format!("cannot pass '{}' as an argument", arg.ty),
                        ));
                    }
                    self.convert(arg, promote(arg.ty))
                }
            };
            converted.push(value);
        }

        let floats = converted.iter().filter(|a| a.ty.is_double()).count();
        if converted.len() - floats > MAX_INT_ARGS || floats > MAX_FLOAT_ARGS {
            return Err(semantic_error(
                loc,
                format!(
                    "call passes more than {MAX_INT_ARGS} integer or {MAX_FLOAT_ARGS} floating arguments"
                ),
            ));
        }

        let args = self.arena.alloc_slice_copy(&converted);
        Ok(self.mk(
            ExprKind::Call {
                callee: target,
                args,
                signature,
            },
            signature.ret,
            loc,
        ))
    }

    fn primary(&mut self) -> PResult<&'a Expr<'a>> {
        let token = self.bump();
        let loc = token.loc;
        match token.kind {
            TokenKind::Int {
                value,
                unsigned,
                long,
                decimal,
            } => {
                let int = literal_type(value, unsigned, long, decimal);
                if !int.fits(value) {
                    self.warn(loc, "integer constant is so large that it is unsigned");
                }
                Ok(self.mk(ExprKind::IntLit(value as i64), Type::Int(int), loc))
            }
            TokenKind::Float(value) => Ok(self.mk(ExprKind::FloatLit(value), Type::Double, loc)),
            TokenKind::Char(value) => Ok(self.mk(ExprKind::IntLit(value), Type::INT, loc)),
            TokenKind::Str(first) => {
                let mut bytes = first;
                while let TokenKind::Str(next) = &self.peek().kind {
                    bytes.extend_from_slice(next);
                    self.bump();
                }
                bytes.push(0);
                let len = bytes.len();
                let id = self.unit.strings.len();
                self.unit.strings.push(bytes);
                let ty = Type::array_of(self.arena, Type::CHAR, Some(len));
                Ok(self.mk(ExprKind::StrLit(id), ty, loc))
            }
            TokenKind::Punct("(") => {
                let expr = self.expression()?;
                self.expect(")")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => match self.lookup(&name) {
                Some(Binding::Local(id)) => Ok(self.mk(ExprKind::Local(id), self.locals[id].ty, loc)),
                Some(Binding::Global(global)) => {
                    let ty = self
                        .unit
                        .symbols
                        .get(global)
                        .map(|s| s.ty)
                        .ok_or_else(|| semantic_error(loc, format!("unknown symbol '{name}'")))?;
                    Ok(self.mk(ExprKind::Global(global), ty, loc))
                }
                Some(Binding::Typedef(_)) => Err(syntax_error(
                    loc,
                    format!("unexpected type name '{name}'"),
                )),
                None if self.check("(") => {
                    let name = self.name(&name);
                    self.warn(
                        loc,
                        format!("implicit declaration of function '{name}'"),
                    );
                    let ty = Type::function(
                        self.arena,
                        FunctionType {
                            ret: Type::INT,
                            params: &[],
                            variadic: false,
                            unspecified: true,
                        },
                    );
                    self.declare_function(name, ty, false, loc)?;
                    self.bind_file_scope(name, Binding::Global(name));
                    Ok(self.mk(ExprKind::Global(name), ty, loc))
                }
                None => Err(semantic_error(
                    loc,
                    format!("use of undeclared identifier '{name}'"),
                )),
            },
            _ => Err(syntax_error(
                loc,
                format!("expected expression before {}", token.describe()),
            )),
        }
    }
}

fn binary_precedence(op: &str) -> Option<u8> {
    Some(match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | ">" | "<=" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => return None,
    })
}

fn binop_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::BitAnd => "&",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^",
    }
}

/// Type of an integer literal: the first candidate that can hold it.
fn literal_type(value: u64, unsigned: bool, long: bool, decimal: bool) -> IntType {
    let candidates: &[IntType] = match (unsigned, long, decimal) {
        (false, false, true) => &[IntType::INT, IntType::LONG],
        (false, false, false) => &[IntType::INT, IntType::UINT, IntType::LONG, IntType::ULONG],
        (true, false, _) => &[IntType::UINT, IntType::ULONG],
        (false, true, true) => &[IntType::LONG],
        (false, true, false) => &[IntType::LONG, IntType::ULONG],
        (true, true, _) => &[IntType::ULONG],
    };
    candidates
        .iter()
        .copied()
        .find(|ty| ty.fits(value))
        .unwrap_or(IntType::ULONG)
}

fn fold_int(op: BinOp, a: i64, b: i64, ty: IntType) -> Option<i64> {
    let value = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div | BinOp::Rem if b == 0 => return None,
        BinOp::Div if ty.signed => a.wrapping_div(b),
        BinOp::Div => ((a as u64) / (b as u64)) as i64,
        BinOp::Rem if ty.signed => a.wrapping_rem(b),
        BinOp::Rem => ((a as u64) % (b as u64)) as i64,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr if ty.signed => a.wrapping_shr(b as u32),
        BinOp::Shr => (a as u64).wrapping_shr(b as u32) as i64,
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
    };
    Some(ty.wrap(value))
}

/// Bytes of a string initialising `char[len]`, and the array length.
fn fit_string(mut bytes: Vec<u8>, len: Option<usize>) -> (Vec<u8>, usize) {
    match len {
        Some(len) => {
            bytes.resize(len, 0);
            (bytes, len)
        }
        None => {
            bytes.push(0);
            let len = bytes.len();
            (bytes, len)
        }
    }
}

fn compatible_functions(a: Type<'_>, b: Type<'_>) -> bool {
    match (a.as_function(), b.as_function()) {
        (Some(a), Some(b)) => {
            a.ret == b.ret
                && (a.unspecified
                    || b.unspecified
                    || (a.params == b.params && a.variadic == b.variadic))
        }
        _ => false,
    }
}

/// Constant value of a converted initialiser expression.
fn constant_value<'a>(expr: &Expr<'a>, ty: Type<'a>) -> Option<InitValue<'a>> {
    match expr.kind {
        ExprKind::IntLit(value) => Some(InitValue::Int {
            value,
            size: ty.size(),
        }),
        ExprKind::FloatLit(value) if ty.is_double() => Some(InitValue::Float(value)),
        _ if ty.is_pointer() => {
            let (target, addend) = constant_address(expr)?;
            Some(InitValue::Address { target, addend })
        }
        _ => None,
    }
}

fn constant_address<'a>(expr: &Expr<'a>) -> Option<(AddressTarget<'a>, i64)> {
    match expr.kind {
        ExprKind::AddrOf(inner) => match inner.kind {
            ExprKind::Global(name) => Some((AddressTarget::Symbol(name), 0)),
            ExprKind::StrLit(id) => Some((AddressTarget::Str(id), 0)),
            ExprKind::Deref(pointer) => constant_address(pointer),
            _ => None,
        },
        ExprKind::Cast(inner) if inner.ty.is_pointer() => constant_address(inner),
        ExprKind::Binary(op @ (BinOp::Add | BinOp::Sub), base, offset) => {
            let (target, addend) = constant_address(base)?;
            let offset = offset.int_value()?;
            let offset = if op == BinOp::Add { offset } else { -offset };
            Some((target, addend + offset))
        }
        _ => None,
    }
}
