// Tokenizer and preprocessor for the C subset. Scanning and preprocessing happen in one pass:
// the Scanner turns bytes into tokens with one-based line/column locations, and the
// Preprocessor drives it, handling directives that start a line. Object-like macros come
// from #define or from the compile options and are expanded with a set of macros currently
// being expanded, so self-referential definitions terminate. Conditional blocks
// (#if/#ifdef/#ifndef/#elif/#else/#endif) suppress tokens, #include and #pragma produce a
// warning, and function-like macros are rejected. Lexical problems become Parse diagnostics
// and scanning continues, so one run reports every bad token.

//! Lexer and preprocessor.

use hashbrown::HashMap;

use crate::core::diagnostic::{Diagnostic, Location, Stage};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Keyword(&'static str),
    Int {
        value: u64,
        unsigned: bool,
        long: bool,
        decimal: bool,
    },
    Float(f64),
    /// Character constant, already sign-extended as `char`.
    Char(i64),
    Str(Vec<u8>),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(p) if *p == punct)
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Keyword(k) if *k == keyword)
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Keyword(k) | TokenKind::Punct(k) => format!("'{k}'"),
            TokenKind::Int { value, .. } => format!("'{value}'"),
            TokenKind::Float(value) => format!("'{value}'"),
            TokenKind::Char(_) => "character constant".to_string(),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

const KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "_Bool", "__inline", "__restrict",
    "__attribute__", "__declspec",
];

// Longest first so that maximal munch is a linear search.
const PUNCTUATORS: &[&str] = &[
    "<<=", ">>=", "...", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "+", "-", "*", "/", "%", "&", "|", "^",
    "~", "!", "<", ">", "=", "?", ":", ";", ",", ".", "(", ")", "[", "]", "{", "}", "#",
];

fn lex_error(loc: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(Stage::Parse, message).at(loc)
}

/// Byte scanner with position tracking.
struct Scanner<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'s> Scanner<'s> {
    fn new(src: &'s str) -> Self {
        Self::at(src, Location::new(1, 1))
    }

    fn at(src: &'s str, loc: Location) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: loc.line,
            column: loc.column,
        }
    }

    fn loc(&self) -> Location {
        Location::new(self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Skip whitespace and comments. Returns whether a newline was crossed.
    fn skip_trivia(&mut self) -> Result<bool, Diagnostic> {
        let mut newline = false;
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(b'\n'), _) => {
                    newline = true;
                    self.bump();
                }
                (Some(b' ' | b'\t' | b'\r' | b'\x0c' | b'\x0b'), _) => {
                    self.bump();
                }
                (Some(b'\\'), Some(b'\n')) => {
                    self.bump();
                    self.bump();
                }
                (Some(b'/'), Some(b'/')) => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.loc();
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(lex_error(start, "unterminated comment")),
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(b'\n') => newline = true,
                            Some(_) => {}
                        }
                    }
                }
                _ => return Ok(newline),
            }
        }
    }

    /// Rest of the current line, joining backslash continuations. The
    /// newline itself is left in place.
    fn rest_of_line(&mut self) -> String {
        let mut text = Vec::new();
        while let Some(c) = self.peek() {
            if c == b'\n' {
                break;
            }
            if c == b'\\' && self.peek_at(1) == Some(b'\n') {
                self.bump();
                self.bump();
                text.push(b' ');
                continue;
            }
            text.push(c);
            self.bump();
        }
        String::from_utf8_lossy(&text).into_owned()
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.bump();
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    /// Scan one token. Always consumes at least one byte.
    fn token(&mut self) -> Result<Token, Diagnostic> {
        let loc = self.loc();
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                loc,
            });
        };

        let kind = if c.is_ascii_alphabetic() || c == b'_' {
            let name = self.ident();
            match KEYWORDS.iter().find(|k| **k == name) {
                Some(keyword) => TokenKind::Keyword(keyword),
                None => TokenKind::Ident(name),
            }
        } else if c.is_ascii_digit()
            || (c == b'.' && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()))
        {
            self.number(loc)?
        } else if c == b'\'' {
            self.char_constant(loc)?
        } else if c == b'"' {
            self.string(loc)?
        } else {
            let rest = &self.src[self.pos..];
            match PUNCTUATORS.iter().find(|p| rest.starts_with(p.as_bytes())) {
                Some(punct) => {
                    for _ in 0..punct.len() {
                        self.bump();
                    }
                    TokenKind::Punct(punct)
                }
                None => {
                    self.bump();
                    return Err(lex_error(
                        loc,
                        format!("unexpected character '{}'", char::from(c).escape_default()),
                    ));
                }
            }
        };
        Ok(Token { kind, loc })
    }

    fn number(&mut self, loc: Location) -> Result<TokenKind, Diagnostic> {
        let start = self.pos;
        let hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X'));
        while let Some(c) = self.peek() {
            let exponent_sign = !hex
                && matches!(c, b'+' | b'-')
                && matches!(self.src.get(self.pos.wrapping_sub(1)), Some(b'e' | b'E'));
            if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || exponent_sign {
                self.bump();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        let is_float = !hex && (text.contains('.') || text.contains(['e', 'E']));
        if is_float {
            let digits = text.trim_end_matches(['f', 'F', 'l', 'L']);
            return digits
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| lex_error(loc, format!("invalid floating constant '{text}'")));
        }

        let body_end = text
            .find(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'))
            .unwrap_or(text.len());
        let (body, suffix) = text.split_at(body_end);
        let suffix = suffix.to_ascii_lowercase();
        let (unsigned, long) = match suffix.as_str() {
            "" => (false, false),
            "u" => (true, false),
            "l" | "ll" => (false, true),
            "ul" | "lu" | "ull" | "llu" => (true, true),
            _ => return Err(lex_error(loc, format!("invalid suffix on integer constant '{text}'"))),
        };

        let (digits, radix) = if hex {
            (&body[2..], 16)
        } else if body.len() > 1 && body.starts_with('0') {
            (&body[1..], 8)
        } else {
            (body, 10)
        };
        if digits.is_empty() {
            return Err(lex_error(loc, format!("invalid integer constant '{text}'")));
        }
        let value = u64::from_str_radix(digits, radix).map_err(|e| {
            use std::num::IntErrorKind;
            match e.kind() {
                IntErrorKind::PosOverflow => {
                    lex_error(loc, format!("integer constant '{text}' is too large"))
                }
                _ => lex_error(loc, format!("invalid integer constant '{text}'")),
            }
        })?;
        Ok(TokenKind::Int {
            value,
            unsigned,
            long,
            decimal: radix == 10,
        })
    }

    fn escape(&mut self, loc: Location) -> Result<u8, Diagnostic> {
        let Some(c) = self.bump() else {
            return Err(lex_error(loc, "unterminated escape sequence"));
        };
        Ok(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'\\' | b'\'' | b'"' | b'?' => c,
            b'0'..=b'7' => {
                let mut value = u32::from(c - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            self.bump();
                            value = value * 8 + u32::from(d - b'0');
                        }
                        _ => break,
                    }
                }
                (value & 0xFF) as u8
            }
            b'x' => {
                let mut value = 0u32;
                let mut any = false;
                while let Some(d) = self.peek().and_then(|d| char::from(d).to_digit(16)) {
                    self.bump();
                    value = (value << 4) | d;
                    any = true;
                }
                if !any {
                    return Err(lex_error(loc, "\\x used with no following hex digits"));
                }
                (value & 0xFF) as u8
            }
            other => {
                return Err(lex_error(
                    loc,
                    format!("unknown escape sequence '\\{}'", char::from(other)),
                ))
            }
        })
    }

    fn char_constant(&mut self, loc: Location) -> Result<TokenKind, Diagnostic> {
        self.bump();
        let value = match self.bump() {
            None | Some(b'\n') => return Err(lex_error(loc, "unterminated character constant")),
            Some(b'\'') => return Err(lex_error(loc, "empty character constant")),
            Some(b'\\') => self.escape(loc)?,
            Some(c) => c,
        };
        if !self.eat(b'\'') {
            while !matches!(self.peek(), None | Some(b'\n' | b'\'')) {
                self.bump();
            }
            self.eat(b'\'');
            return Err(lex_error(loc, "multi-character constant"));
        }
        Ok(TokenKind::Char(i64::from(value as i8)))
    }

    fn string(&mut self, loc: Location) -> Result<TokenKind, Diagnostic> {
        self.bump();
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(lex_error(loc, "unterminated string literal")),
                Some(b'"') => break,
                Some(b'\\') => bytes.push(self.escape(loc)?),
                Some(c) => bytes.push(c),
            }
        }
        Ok(TokenKind::Str(bytes))
    }
}

/// One level of `#if` nesting.
#[derive(Debug, Clone, Copy)]
struct Conditional {
    parent_active: bool,
    active: bool,
    /// Some branch of this group has been taken.
    taken: bool,
    seen_else: bool,
}

/// Tokens of a preprocessed source plus the warnings raised on the way.
#[derive(Debug, Default)]
pub struct Preprocessed {
    pub tokens: Vec<Token>,
    pub warnings: Vec<Diagnostic>,
}

struct Preprocessor {
    macros: HashMap<String, Vec<Token>>,
    conditionals: Vec<Conditional>,
    tokens: Vec<Token>,
    warnings: Vec<Diagnostic>,
    errors: Vec<Diagnostic>,
}

/// Tokenize `source`, applying preprocessor directives and the given
/// object-like `defines`.
pub fn tokenize(
    source: &str,
    defines: &[(String, String)],
) -> Result<Preprocessed, Vec<Diagnostic>> {
    let mut pp = Preprocessor {
        macros: HashMap::new(),
        conditionals: Vec::new(),
        tokens: Vec::new(),
        warnings: Vec::new(),
        errors: Vec::new(),
    };

    for (name, body) in defines {
        let body = pp.lex_line(body, Location::new(1, 1));
        pp.macros.insert(name.clone(), body);
    }

    pp.run(source);

    if pp.errors.is_empty() {
        log::trace!("tokenized {} tokens, {} macros", pp.tokens.len(), pp.macros.len());
        Ok(Preprocessed {
            tokens: pp.tokens,
            warnings: pp.warnings,
        })
    } else {
        Err(pp.errors)
    }
}

impl Preprocessor {
    fn active(&self) -> bool {
        self.conditionals.last().map_or(true, |c| c.active)
    }

    fn run(&mut self, source: &str) {
        let mut scanner = Scanner::new(source);
        let mut line_start = true;
        loop {
            match scanner.skip_trivia() {
                Ok(newline) => line_start |= newline,
                Err(diag) => {
                    if self.active() {
                        self.errors.push(diag);
                    }
                    break;
                }
            }
            let Some(c) = scanner.peek() else { break };
            if c == b'#' && line_start {
                let loc = scanner.loc();
                scanner.bump();
                let line = scanner.rest_of_line();
                self.directive(&line, loc);
                continue;
            }
            line_start = false;

            match scanner.token() {
                Ok(token) if self.active() => self.emit(token),
                Ok(_) => {}
                Err(diag) => {
                    if self.active() {
                        self.errors.push(diag);
                    }
                }
            }
        }

        if !self.conditionals.is_empty() {
            self.errors.push(lex_error(
                scanner.loc(),
                "unterminated conditional directive",
            ));
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            loc: scanner.loc(),
        });
    }

    /// Lex a directive body or macro definition.
    fn lex_line(&mut self, text: &str, loc: Location) -> Vec<Token> {
        let mut scanner = Scanner::at(text, loc);
        let mut tokens = Vec::new();
        loop {
            if let Err(diag) = scanner.skip_trivia() {
                self.errors.push(diag);
                break;
            }
            match scanner.token() {
                Ok(Token {
                    kind: TokenKind::Eof,
                    ..
                }) => break,
                Ok(token) => tokens.push(token),
                Err(diag) => self.errors.push(diag),
            }
        }
        tokens
    }

    fn emit(&mut self, token: Token) {
        match &token.kind {
            TokenKind::Ident(name) if self.macros.contains_key(name) => {
                let name = name.clone();
                let mut expanding = Vec::new();
                self.expand(&name, token.loc, &mut expanding);
            }
            _ => self.tokens.push(token),
        }
    }

    fn expand(&mut self, name: &str, loc: Location, expanding: &mut Vec<String>) {
        let body = self.macros.get(name).cloned().unwrap_or_default();
        expanding.push(name.to_string());
        for mut token in body {
            token.loc = loc;
            if let TokenKind::Ident(inner) = &token.kind {
                if self.macros.contains_key(inner) && !expanding.iter().any(|e| e == inner) {
                    let inner = inner.clone();
                    self.expand(&inner, loc, expanding);
                    continue;
                }
            }
            self.tokens.push(token);
        }
        expanding.pop();
    }

    fn directive(&mut self, line: &str, loc: Location) {
        let trimmed = line.trim_start();
        let name_len = trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(trimmed.len());
        let (name, rest) = trimmed.split_at(name_len);
        let rest_loc = Location::new(loc.line, loc.column + 1 + (line.len() - rest.len()) as u32);

        match name {
            "ifdef" | "ifndef" => {
                let tokens = self.lex_line(rest, rest_loc);
                let defined = match tokens.first().map(|t| &t.kind) {
                    Some(TokenKind::Ident(macro_name)) => self.macros.contains_key(macro_name),
                    _ => {
                        if self.active() {
                            self.errors
                                .push(lex_error(loc, format!("#{name} expects a macro name")));
                        }
                        false
                    }
                };
                self.push_conditional(defined == (name == "ifdef"));
            }
            "if" => {
                let value = if self.active() {
                    self.condition(rest, rest_loc)
                } else {
                    false
                };
                self.push_conditional(value);
            }
            "elif" => {
                let Some(top) = self.conditionals.last().copied() else {
                    self.errors.push(lex_error(loc, "#elif without #if"));
                    return;
                };
                if top.seen_else {
                    self.errors.push(lex_error(loc, "#elif after #else"));
                    return;
                }
                let value = if top.parent_active && !top.taken {
                    self.condition(rest, rest_loc)
                } else {
                    false
                };
                if let Some(frame) = self.conditionals.last_mut() {
                    frame.active = top.parent_active && !top.taken && value;
                    frame.taken |= frame.active;
                }
            }
            "else" => match self.conditionals.last_mut() {
                Some(frame) if !frame.seen_else => {
                    frame.active = frame.parent_active && !frame.taken;
                    frame.taken = true;
                    frame.seen_else = true;
                }
                Some(_) => self.errors.push(lex_error(loc, "#else after #else")),
                None => self.errors.push(lex_error(loc, "#else without #if")),
            },
            "endif" => {
                if self.conditionals.pop().is_none() {
                    self.errors.push(lex_error(loc, "#endif without #if"));
                }
            }
            _ if !self.active() => {}
            "" => {}
            "define" => self.define(rest, rest_loc),
            "undef" => {
                let macro_name = rest.trim();
                self.macros.remove(macro_name);
            }
            "include" => self.warnings.push(
                Diagnostic::warning(
                    Stage::Parse,
                    format!(
                        "#include {} ignored; declare host functions explicitly",
                        rest.trim()
                    ),
                )
                .at(loc),
            ),
            "pragma" => self.warnings.push(
                Diagnostic::warning(Stage::Parse, format!("#pragma {} ignored", rest.trim()))
                    .at(loc),
            ),
            "error" => self
                .errors
                .push(lex_error(loc, format!("#error {}", rest.trim()))),
            other => self
                .errors
                .push(lex_error(loc, format!("unknown directive #{other}"))),
        }
    }

    fn push_conditional(&mut self, value: bool) {
        let parent_active = self.active();
        self.conditionals.push(Conditional {
            parent_active,
            active: parent_active && value,
            taken: value,
            seen_else: false,
        });
    }

    fn define(&mut self, rest: &str, loc: Location) {
        let body = rest.trim_start();
        let name_len = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(body.len());
        let (name, definition) = body.split_at(name_len);
        if name.is_empty() || name.as_bytes()[0].is_ascii_digit() {
            self.errors.push(lex_error(loc, "macro name must be an identifier"));
            return;
        }
        if definition.starts_with('(') {
            self.errors.push(lex_error(
                loc,
                format!("function-like macro '{name}' is not supported"),
            ));
            return;
        }
        let offset = (rest.len() - definition.len()) as u32;
        let tokens = self.lex_line(definition, Location::new(loc.line, loc.column + offset));
        self.macros.insert(name.to_string(), tokens);
    }

    /// Evaluate an `#if` condition: an integer, a macro expanding to one,
    /// or `defined NAME`, optionally negated with `!`.
    fn condition(&mut self, text: &str, loc: Location) -> bool {
        let tokens = self.lex_line(text, loc);
        let mut iter = tokens.iter().peekable();
        let mut negate = false;
        while iter.next_if(|t| t.is_punct("!")).is_some() {
            negate = !negate;
        }

        let value = match iter.next().map(|t| &t.kind) {
            Some(TokenKind::Int { value, .. }) => *value != 0,
            Some(TokenKind::Char(value)) => *value != 0,
            Some(TokenKind::Ident(name)) if name == "defined" => {
                let parenthesized = iter.next_if(|t| t.is_punct("(")).is_some();
                let value = match iter.next().map(|t| &t.kind) {
                    Some(TokenKind::Ident(macro_name)) => self.macros.contains_key(macro_name),
                    _ => {
                        self.errors.push(lex_error(loc, "'defined' expects a macro name"));
                        false
                    }
                };
                if parenthesized && iter.next_if(|t| t.is_punct(")")).is_none() {
                    self.errors.push(lex_error(loc, "missing ')' after 'defined'"));
                }
                value
            }
            Some(TokenKind::Ident(name)) => match self.macros.get(name).and_then(|b| b.first()) {
                Some(Token {
                    kind: TokenKind::Int { value, .. },
                    ..
                }) => *value != 0,
                _ => false,
            },
            _ => {
                self.errors
                    .push(lex_error(loc, "#if expects an integer constant or 'defined'"));
                false
            }
        };
        if let Some(extra) = iter.next() {
            self.errors.push(lex_error(
                extra.loc,
                format!("unsupported #if expression near {}", extra.describe()),
            ));
        }
        value != negate
    }
}
