//! Parser: Ed.Py source text to three-address IR
//!
//! A hand-written indentation-aware lexer and recursive-descent parser
//! build a small AST, and a converter lowers each statement into numbered
//! temp assignments (left-to-right, result of a top-level expression in
//! temp 0). Control constructs become ControlMarker triples; `for` loops
//! get a loop-control temp that pre-increments each iteration.
//!
//! The same machinery parses the embedded `Ed` library source; its
//! `Ed_`-prefixed functions are renamed to `Ed.` and marked internal.

use edc_core::diag::{DiagSink, Kind};
use edc_core::program::{
    BinOp, BoolCheckOp, ControlEnd, ControlKind, ForIter, Function, LoopModKind, Op, Program,
    StageError, Temp, UnaryOp, Value, VarName, MAIN,
};

// ===========================================================================
// Lexer
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Newline,
    Indent,
    Dedent,
    Name(String),
    Int(i64),
    /// Kept as text so the "must be an integer" diagnostic can cite it.
    Float(String),
    Str(String),
    Sym(&'static str),
    EndMarker,
}

#[derive(Debug, Clone)]
struct SpannedTok {
    tok: Tok,
    line: u32,
    col: u32,
}

const SYMBOLS: &[&str] = &[
    "**=", "//=", "<<=", ">>=", "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", ":",
    ",", ".", "|", "&", "^", "~", "@",
];

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    paren_depth: u32,
    indents: Vec<u32>,
    at_line_start: bool,
    pending_dedents: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 0,
            paren_depth: 0,
            indents: vec![0],
            at_line_start: true,
            pending_dedents: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<SpannedTok>, (String, u32, u32)> {
        let mut out = Vec::new();
        loop {
            let t = self.next_token()?;
            let end = t.tok == Tok::EndMarker;
            out.push(t);
            if end {
                return Ok(out);
            }
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn error<T>(&self, msg: &str) -> Result<T, (String, u32, u32)> {
        Err((msg.to_string(), self.line, self.col))
    }

    fn next_token(&mut self) -> Result<SpannedTok, (String, u32, u32)> {
        if self.pending_dedents > 0 {
            self.pending_dedents -= 1;
            return Ok(SpannedTok {
                tok: Tok::Dedent,
                line: self.line,
                col: self.col,
            });
        }

        if self.at_line_start && self.paren_depth == 0 {
            if let Some(t) = self.handle_indentation()? {
                return Ok(t);
            }
        }

        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b'\\') if self.src.get(self.pos + 1) == Some(&b'\n') => {
                    self.bump();
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let col = self.col;

        let b = match self.peek_byte() {
            None => {
                // close any open indentation, then finish
                if self.indents.len() > 1 {
                    self.indents.pop();
                    return Ok(SpannedTok { tok: Tok::Dedent, line, col });
                }
                return Ok(SpannedTok { tok: Tok::EndMarker, line, col });
            }
            Some(b) => b,
        };

        if b == b'\n' {
            self.bump();
            if self.paren_depth > 0 {
                return self.next_token();
            }
            self.at_line_start = true;
            return Ok(SpannedTok { tok: Tok::Newline, line, col });
        }

        if b.is_ascii_digit() {
            return Ok(SpannedTok { tok: self.lex_number()?, line, col });
        }

        if b == b'"' || b == b'\'' {
            return Ok(SpannedTok { tok: self.lex_string()?, line, col });
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let mut name = String::new();
            while let Some(c) = self.peek_byte() {
                if c.is_ascii_alphanumeric() || c == b'_' {
                    name.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            return Ok(SpannedTok { tok: Tok::Name(name), line, col });
        }

        for sym in SYMBOLS {
            if self.src[self.pos..].starts_with(sym.as_bytes()) {
                for _ in 0..sym.len() {
                    self.bump();
                }
                match *sym {
                    "(" | "[" => self.paren_depth += 1,
                    ")" | "]" => self.paren_depth = self.paren_depth.saturating_sub(1),
                    _ => {}
                }
                return Ok(SpannedTok { tok: Tok::Sym(sym), line, col });
            }
        }

        self.error(&format!("unexpected character '{}'", b as char))
    }

    fn handle_indentation(&mut self) -> Result<Option<SpannedTok>, (String, u32, u32)> {
        // measure leading whitespace of the next non-blank line
        loop {
            let line_start = self.pos;
            let mut width = 0u32;
            let mut p = self.pos;
            while let Some(b) = self.src.get(p) {
                match b {
                    b' ' => width += 1,
                    b'\t' => width = (width / 8 + 1) * 8,
                    _ => break,
                }
                p += 1;
            }
            match self.src.get(p) {
                None => {
                    // consume trailing blanks, EOF handling happens later
                    self.pos = p;
                    self.col += (p - line_start) as u32;
                    self.at_line_start = false;
                    return Ok(None);
                }
                Some(b'\n') | Some(b'\r') | Some(b'#') => {
                    // blank or comment-only line produces no tokens
                    self.pos = p;
                    self.col += (p - line_start) as u32;
                    while let Some(b) = self.peek_byte() {
                        self.bump();
                        if b == b'\n' {
                            break;
                        }
                    }
                    if self.peek_byte().is_none() {
                        self.at_line_start = false;
                        return Ok(None);
                    }
                    continue;
                }
                Some(_) => {
                    self.pos = p;
                    self.col += (p - line_start) as u32;
                    self.at_line_start = false;
                    let current = *self.indents.last().expect("indent stack never empty");
                    if width > current {
                        self.indents.push(width);
                        return Ok(Some(SpannedTok {
                            tok: Tok::Indent,
                            line: self.line,
                            col: self.col,
                        }));
                    }
                    if width < current {
                        // queue every level closed by this line
                        while width < *self.indents.last().expect("indent stack never empty") {
                            self.indents.pop();
                            self.pending_dedents += 1;
                        }
                        if width != *self.indents.last().expect("indent stack never empty") {
                            return self
                                .error("unindent does not match any outer indentation level");
                        }
                        self.pending_dedents -= 1;
                        return Ok(Some(SpannedTok {
                            tok: Tok::Dedent,
                            line: self.line,
                            col: self.col,
                        }));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<Tok, (String, u32, u32)> {
        let mut text = String::new();
        if self.peek_byte() == Some(b'0')
            && matches!(self.src.get(self.pos + 1), Some(b'x') | Some(b'X'))
        {
            self.bump();
            self.bump();
            while let Some(c) = self.peek_byte() {
                if c.is_ascii_hexdigit() {
                    text.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            return match i64::from_str_radix(&text, 16) {
                Ok(n) => Ok(Tok::Int(n)),
                Err(_) => self.error("bad hex literal"),
            };
        }

        let mut is_float = false;
        while let Some(c) = self.peek_byte() {
            if c.is_ascii_digit() {
                text.push(c as char);
                self.bump();
            } else if c == b'.' && !is_float
                && self.src.get(self.pos + 1).is_some_and(|d| d.is_ascii_digit())
            {
                is_float = true;
                text.push('.');
                self.bump();
            } else {
                break;
            }
        }
        if is_float {
            Ok(Tok::Float(text))
        } else {
            match text.parse::<i64>() {
                Ok(n) => Ok(Tok::Int(n)),
                Err(_) => self.error("integer literal too large"),
            }
        }
    }

    fn lex_string(&mut self) -> Result<Tok, (String, u32, u32)> {
        let quote = self.bump().expect("caller checked the quote");
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return self.error("unterminated string literal"),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'r') => s.push('\r'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'\'') => s.push('\''),
                    Some(b'"') => s.push('"'),
                    Some(b'0') => s.push('\0'),
                    Some(c) => {
                        s.push('\\');
                        s.push(c as char);
                    }
                    None => return self.error("unterminated string escape"),
                },
                Some(b'\n') => return self.error("newline inside string literal"),
                Some(c) if c == quote => return Ok(Tok::Str(s)),
                Some(c) => s.push(c as char),
            }
        }
    }
}

// ===========================================================================
// AST
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    LtE,
    Gt,
    GtE,
    Eq,
    NotEq,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone)]
struct Expr {
    kind: ExprKind,
    line: u32,
    col: u32,
}

#[derive(Debug, Clone)]
enum ExprKind {
    Int(i64),
    Float(String),
    Str(String),
    Name(String),
    /// True / False / None
    NameConstant(String),
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    List(Vec<Expr>),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    Bool { op: ControlKind, values: Vec<Expr> },
    Compare { left: Box<Expr>, ops: Vec<(CmpOp, Expr)> },
    Call { func: Box<Expr>, args: Vec<Expr> },
}

#[derive(Debug, Clone)]
struct Stmt {
    kind: StmtKind,
    line: u32,
    col: u32,
}

#[derive(Debug, Clone)]
enum StmtKind {
    Expr(Expr),
    Assign { targets: Vec<Expr>, value: Expr },
    AugAssign { target: Expr, op: BinOp, value: Expr },
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    While { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    FuncDef { name: String, args: Vec<String>, body: Vec<Stmt> },
    ClassDef { name: String, bases: Vec<Expr>, body: Vec<Stmt> },
    Import { names: Vec<(String, Option<String>)> },
    Global { names: Vec<String> },
    Return { value: Option<Expr> },
    Pass,
    Break,
    Continue,
}

// ===========================================================================
// Parser
// ===========================================================================

struct Parser<'d> {
    toks: Vec<SpannedTok>,
    pos: usize,
    diag: &'d mut DiagSink,
}

type PResult<T> = Result<T, StageError>;

impl<'d> Parser<'d> {
    fn new(toks: Vec<SpannedTok>, diag: &'d mut DiagSink) -> Self {
        Parser { toks, pos: 0, diag }
    }

    fn here(&self) -> (u32, u32) {
        let t = &self.toks[self.pos.min(self.toks.len() - 1)];
        (t.line, t.col)
    }

    fn syntax_error<T>(&mut self) -> PResult<T> {
        let (line, col) = self.here();
        self.diag.error(Kind::ParseSyntaxError, &[&line, &col]);
        Err(StageError::Parse)
    }

    fn not_supported<T>(&mut self, what: &str) -> PResult<T> {
        let (line, col) = self.here();
        self.diag.error(Kind::ParseNotSupported, &[&line, &col, &what]);
        Err(StageError::Parse)
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos.min(self.toks.len() - 1)].tok
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos.min(self.toks.len() - 1)].tok.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_sym(&mut self, sym: &str) -> PResult<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            self.syntax_error()
        }
    }

    fn eat_name(&mut self, name: &str) -> bool {
        if matches!(self.peek(), Tok::Name(n) if n == name) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_any_name(&mut self) -> PResult<String> {
        match self.advance() {
            Tok::Name(n) => Ok(n),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                self.syntax_error()
            }
        }
    }

    fn eat_newline(&mut self) -> PResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::EndMarker | Tok::Dedent => Ok(()),
            _ => self.syntax_error(),
        }
    }

    fn parse_module(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::EndMarker => return Ok(stmts),
                Tok::Newline => {
                    self.advance();
                }
                Tok::Dedent | Tok::Indent => return self.syntax_error(),
                _ => stmts.push(self.parse_statement()?),
            }
        }
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();

        if let Tok::Sym("@") = self.peek() {
            return self.not_supported("DECORATORS ");
        }

        let kind = match self.peek().clone() {
            Tok::Name(n) => match n.as_str() {
                "if" => return self.parse_if(),
                "while" => return self.parse_while(),
                "for" => return self.parse_for(),
                "def" => return self.parse_def(),
                "class" => return self.parse_class(),
                "import" => self.parse_import()?,
                "from" => return self.not_supported("FROM IMPORTS "),
                "global" => self.parse_global()?,
                "return" => self.parse_return()?,
                "pass" => {
                    self.advance();
                    self.eat_newline()?;
                    StmtKind::Pass
                }
                "break" => {
                    self.advance();
                    self.eat_newline()?;
                    StmtKind::Break
                }
                "continue" => {
                    self.advance();
                    self.eat_newline()?;
                    StmtKind::Continue
                }
                "try" | "raise" | "except" | "finally" => {
                    return self.not_supported("EXCEPTIONS ");
                }
                _ => self.parse_expr_statement()?,
            },
            _ => self.parse_expr_statement()?,
        };
        Ok(Stmt { kind, line, col })
    }

    fn parse_expr_statement(&mut self) -> PResult<StmtKind> {
        let first = self.parse_expr()?;

        // augmented assignment?
        for (sym, op) in [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mult),
            ("/=", BinOp::Div),
            ("//=", BinOp::FloorDiv),
            ("%=", BinOp::Mod),
            ("<<=", BinOp::LShift),
            (">>=", BinOp::RShift),
            ("&=", BinOp::BitAnd),
            ("|=", BinOp::BitOr),
            ("^=", BinOp::BitXor),
            ("**=", BinOp::Pow),
        ] {
            if self.eat_sym(sym) {
                let value = self.parse_expr()?;
                self.eat_newline()?;
                return Ok(StmtKind::AugAssign { target: first, op, value });
            }
        }

        if self.eat_sym("=") {
            let mut targets = vec![first];
            let mut value = self.parse_expr()?;
            while self.eat_sym("=") {
                targets.push(value);
                value = self.parse_expr()?;
            }
            self.eat_newline()?;
            return Ok(StmtKind::Assign { targets, value });
        }

        self.eat_newline()?;
        Ok(StmtKind::Expr(first))
    }

    fn parse_suite(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_sym(":")?;
        if matches!(self.peek(), Tok::Newline) {
            self.advance();
            if !matches!(self.peek(), Tok::Indent) {
                return self.syntax_error();
            }
            self.advance();
            let mut body = Vec::new();
            loop {
                match self.peek() {
                    Tok::Dedent => {
                        self.advance();
                        break;
                    }
                    Tok::EndMarker => break,
                    Tok::Newline => {
                        self.advance();
                    }
                    _ => body.push(self.parse_statement()?),
                }
            }
            if body.is_empty() {
                return self.syntax_error();
            }
            Ok(body)
        } else {
            // single inline statement
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();
        self.advance(); // if / elif
        let test = self.parse_expr()?;
        let body = self.parse_suite()?;
        let mut orelse = Vec::new();
        if matches!(self.peek(), Tok::Name(n) if n == "elif") {
            orelse.push(self.parse_if()?);
        } else if self.eat_name("else") {
            orelse = self.parse_suite()?;
        }
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
            col,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();
        self.advance();
        let test = self.parse_expr()?;
        let body = self.parse_suite()?;
        let mut orelse = Vec::new();
        if self.eat_name("else") {
            orelse = self.parse_suite()?;
        }
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            line,
            col,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();
        self.advance();
        let target = self.parse_expr()?;
        if !self.eat_name("in") {
            return self.syntax_error();
        }
        let iter = self.parse_expr()?;
        let body = self.parse_suite()?;
        let mut orelse = Vec::new();
        if self.eat_name("else") {
            orelse = self.parse_suite()?;
        }
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body, orelse },
            line,
            col,
        })
    }

    fn parse_def(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();
        self.advance();
        let name = self.expect_any_name()?;
        self.expect_sym("(")?;
        let mut args = Vec::new();
        if !self.eat_sym(")") {
            loop {
                if matches!(self.peek(), Tok::Sym("*")) {
                    let (l, c) = self.here();
                    self.diag.error(Kind::ParseTooComplex, &[&l, &c, &"FUNCTION"]);
                    return Err(StageError::Parse);
                }
                let arg = self.expect_any_name()?;
                if self.eat_sym("=") {
                    let (l, c) = self.here();
                    self.diag.error(Kind::ParseTooComplex, &[&l, &c, &"FUNCTION"]);
                    return Err(StageError::Parse);
                }
                args.push(arg);
                if self.eat_sym(")") {
                    break;
                }
                self.expect_sym(",")?;
            }
        }
        let body = self.parse_suite()?;
        Ok(Stmt {
            kind: StmtKind::FuncDef { name, args, body },
            line,
            col,
        })
    }

    fn parse_class(&mut self) -> PResult<Stmt> {
        let (line, col) = self.here();
        self.advance();
        let name = self.expect_any_name()?;
        let mut bases = Vec::new();
        if self.eat_sym("(") {
            if !self.eat_sym(")") {
                loop {
                    bases.push(self.parse_expr()?);
                    if self.eat_sym(")") {
                        break;
                    }
                    self.expect_sym(",")?;
                }
            }
        }
        let body = self.parse_suite()?;
        Ok(Stmt {
            kind: StmtKind::ClassDef { name, bases, body },
            line,
            col,
        })
    }

    fn parse_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = Vec::new();
        loop {
            let name = self.expect_any_name()?;
            let alias = if self.eat_name("as") {
                Some(self.expect_any_name()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_sym(",") {
                break;
            }
        }
        self.eat_newline()?;
        Ok(StmtKind::Import { names })
    }

    fn parse_global(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = vec![self.expect_any_name()?];
        while self.eat_sym(",") {
            names.push(self.expect_any_name()?);
        }
        self.eat_newline()?;
        Ok(StmtKind::Global { names })
    }

    fn parse_return(&mut self) -> PResult<StmtKind> {
        self.advance();
        if matches!(self.peek(), Tok::Newline | Tok::Dedent | Tok::EndMarker) {
            self.eat_newline()?;
            return Ok(StmtKind::Return { value: None });
        }
        let value = self.parse_expr()?;
        self.eat_newline()?;
        Ok(StmtKind::Return { value: Some(value) })
    }

    // ----- expressions, by descending precedence -------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        let first = self.parse_and()?;
        if !matches!(self.peek(), Tok::Name(n) if n == "or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_name("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr {
            kind: ExprKind::Bool { op: ControlKind::Or, values },
            line,
            col,
        })
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        let first = self.parse_not()?;
        if !matches!(self.peek(), Tok::Name(n) if n == "and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_name("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr {
            kind: ExprKind::Bool { op: ControlKind::And, values },
            line,
            col,
        })
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        if self.eat_name("not") {
            let operand = self.parse_not()?;
            return Ok(Expr {
                kind: ExprKind::Unary { op: UnaryOp::Not, operand: Box::new(operand) },
                line,
                col,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        loop {
            let op = if self.eat_sym("<") {
                CmpOp::Lt
            } else if self.eat_sym("<=") {
                CmpOp::LtE
            } else if self.eat_sym(">") {
                CmpOp::Gt
            } else if self.eat_sym(">=") {
                CmpOp::GtE
            } else if self.eat_sym("==") {
                CmpOp::Eq
            } else if self.eat_sym("!=") {
                CmpOp::NotEq
            } else if matches!(self.peek(), Tok::Name(n) if n == "in") {
                self.advance();
                CmpOp::In
            } else if matches!(self.peek(), Tok::Name(n) if n == "is") {
                self.advance();
                if self.eat_name("not") {
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            } else if matches!(self.peek(), Tok::Name(n) if n == "not") {
                // "not in"
                self.advance();
                if !self.eat_name("in") {
                    return self.syntax_error();
                }
                CmpOp::NotIn
            } else {
                break;
            };
            let rhs = self.parse_bitor()?;
            ops.push((op, rhs));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr {
            kind: ExprKind::Compare { left: Box::new(left), ops },
            line,
            col,
        })
    }

    fn binary_chain(
        &mut self,
        next: fn(&mut Self) -> PResult<Expr>,
        table: &[(&str, BinOp)],
    ) -> PResult<Expr> {
        let (line, col) = self.here();
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in table {
                if self.eat_sym(sym) {
                    let right = next(self)?;
                    left = Expr {
                        kind: ExprKind::Binary {
                            left: Box::new(left),
                            op: *op,
                            right: Box::new(right),
                        },
                        line,
                        col,
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.binary_chain(Self::parse_bitxor, &[("|", BinOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.binary_chain(Self::parse_bitand, &[("^", BinOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.binary_chain(Self::parse_shift, &[("&", BinOp::BitAnd)])
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.binary_chain(
            Self::parse_arith,
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
        )
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        self.binary_chain(Self::parse_term, &[("+", BinOp::Add), ("-", BinOp::Sub)])
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        self.binary_chain(
            Self::parse_factor,
            &[
                ("*", BinOp::Mult),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
        )
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        let op = if self.eat_sym("-") {
            Some(UnaryOp::USub)
        } else if self.eat_sym("+") {
            Some(UnaryOp::UAdd)
        } else if self.eat_sym("~") {
            Some(UnaryOp::Invert)
        } else {
            None
        };
        if let Some(op) = op {
            let operand = self.parse_factor()?;
            // fold an immediate negative literal so -5 is a constant
            if op == UnaryOp::USub {
                if let ExprKind::Int(n) = operand.kind {
                    return Ok(Expr { kind: ExprKind::Int(-n), line, col });
                }
            }
            return Ok(Expr {
                kind: ExprKind::Unary { op, operand: Box::new(operand) },
                line,
                col,
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        let base = self.parse_atom_trailer()?;
        if self.eat_sym("**") {
            let exp = self.parse_factor()?;
            return Ok(Expr {
                kind: ExprKind::Binary {
                    left: Box::new(base),
                    op: BinOp::Pow,
                    right: Box::new(exp),
                },
                line,
                col,
            });
        }
        Ok(base)
    }

    fn parse_atom_trailer(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            let (line, col) = (expr.line, expr.col);
            if self.eat_sym("(") {
                let mut args = Vec::new();
                if !self.eat_sym(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat_sym(")") {
                            break;
                        }
                        self.expect_sym(",")?;
                    }
                }
                expr = Expr {
                    kind: ExprKind::Call { func: Box::new(expr), args },
                    line,
                    col,
                };
            } else if self.eat_sym("[") {
                let index = self.parse_expr()?;
                self.expect_sym("]")?;
                expr = Expr {
                    kind: ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                    col,
                };
            } else if self.eat_sym(".") {
                let attr = self.expect_any_name()?;
                expr = Expr {
                    kind: ExprKind::Attribute { value: Box::new(expr), attr },
                    line,
                    col,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let (line, col) = self.here();
        match self.peek().clone() {
            Tok::Int(n) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Int(n), line, col })
            }
            Tok::Float(text) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Float(text), line, col })
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Str(s), line, col })
            }
            Tok::Name(n) => {
                self.advance();
                if n == "True" || n == "False" || n == "None" {
                    Ok(Expr { kind: ExprKind::NameConstant(n), line, col })
                } else {
                    Ok(Expr { kind: ExprKind::Name(n), line, col })
                }
            }
            Tok::Sym("(") => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Tok::Sym("[") => {
                self.advance();
                let mut elts = Vec::new();
                if !self.eat_sym("]") {
                    loop {
                        elts.push(self.parse_expr()?);
                        if self.eat_sym("]") {
                            break;
                        }
                        self.expect_sym(",")?;
                    }
                }
                Ok(Expr { kind: ExprKind::List(elts), line, col })
            }
            _ => self.syntax_error(),
        }
    }
}

// ===========================================================================
// Converter: AST -> three-address IR
// ===========================================================================

struct Converter<'d> {
    diag: &'d mut DiagSink,
    ctl_marker: i64,
    loop_stack: Vec<(ControlKind, u32)>,
    /// loop-control temps, pre-incremented per for loop
    for_index: u32,
}

impl<'d> Converter<'d> {
    fn new(diag: &'d mut DiagSink) -> Self {
        Converter {
            diag,
            ctl_marker: -1,
            loop_stack: Vec::new(),
            for_index: 0,
        }
    }

    fn next_marker(&mut self) -> u32 {
        self.ctl_marker += 1;
        self.ctl_marker as u32
    }

    fn too_complex(&mut self, line: u32, col: u32, what: &str) -> StageError {
        self.diag.error(Kind::ParseTooComplex, &[&line, &col, &what]);
        StageError::Parse
    }

    fn not_supported(&mut self, line: u32, col: u32, what: &str) -> StageError {
        self.diag.error(Kind::ParseNotSupported, &[&line, &col, &what]);
        StageError::Parse
    }

    /// Walk a user program module.
    fn walk_program(&mut self, program: &mut Program, stmts: &[Stmt]) -> PResult<()> {
        for s in stmts {
            match &s.kind {
                StmtKind::FuncDef { name, args, body } => {
                    self.add_function(program, s, name, args, body, "", false)?;
                }
                StmtKind::Import { names } => self.add_import(program, s, names)?,
                StmtKind::ClassDef { name, bases, body } => {
                    self.add_class(program, s, name, bases, body)?;
                }
                _ => {
                    let main = program
                        .functions
                        .get_mut(MAIN)
                        .expect("main function always exists");
                    self.add_function_statement(main, s)?;
                }
            }
        }
        Ok(())
    }

    /// Walk the embedded `Ed` library module: `Ed_` names become `Ed.`,
    /// functions are marked internal, anything else is ignored.
    fn walk_ed_routines(&mut self, program: &mut Program, stmts: &[Stmt]) -> PResult<()> {
        for s in stmts {
            match &s.kind {
                StmtKind::FuncDef { name, args, body } => {
                    let renamed = match name.strip_prefix("Ed_") {
                        Some(rest) => format!("Ed.{}", rest),
                        None => name.clone(),
                    };
                    self.add_function(program, s, &renamed, args, body, "", true)?;
                }
                StmtKind::Import { .. } => {}
                StmtKind::ClassDef { .. } => {
                    self.diag
                        .error_raw("Ed internal functions must not have classes");
                    self.diag.error(Kind::CmpInternalError, &[&701]);
                    return Err(StageError::Parse);
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_function(
        &mut self,
        program: &mut Program,
        stmt: &Stmt,
        name: &str,
        args: &[String],
        body: &[Stmt],
        class_name: &str,
        internal: bool,
    ) -> PResult<()> {
        let full_name = if class_name.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", class_name, name)
        };

        if program.functions.contains_key(&full_name) {
            self.diag
                .error(Kind::ParseNameReused, &[&stmt.line, &stmt.col, &"FUNCTIONS"]);
            return Err(StageError::Parse);
        }

        let mut function = Function::new(&full_name, internal);
        function.args.extend(args.iter().cloned());

        // methods always take self first; good style and simpler passes
        if !class_name.is_empty() && function.args.first().map(String::as_str) != Some("self") {
            self.diag
                .error(Kind::ParseClassArg0NotSelf, &[&stmt.line, &stmt.col]);
            return Err(StageError::Parse);
        }

        self.loop_stack.clear();
        for s in body {
            self.add_function_statement(&mut function, s)?;
        }

        program.functions.insert(full_name, function);
        Ok(())
    }

    fn add_class(
        &mut self,
        program: &mut Program,
        stmt: &Stmt,
        name: &str,
        bases: &[Expr],
        body: &[Stmt],
    ) -> PResult<()> {
        if program.classes.contains_key(name) {
            self.diag
                .error(Kind::ParseNameReused, &[&stmt.line, &stmt.col, &"CLASSES"]);
            return Err(StageError::Parse);
        }
        if !bases.is_empty() {
            self.diag
                .error(Kind::ParseClassNoBasesAllowed, &[&stmt.line, &stmt.col]);
            return Err(StageError::Parse);
        }

        let mut class = edc_core::program::Class::new(name);
        for s in body {
            match &s.kind {
                StmtKind::FuncDef { name: fname, args, body: fbody } => {
                    self.add_function(program, s, fname, args, fbody, name, false)?;
                    class.func_names.push(fname.clone());
                }
                StmtKind::Expr(Expr { kind: ExprKind::Str(doc), .. }) => {
                    class.doc_string = doc.clone();
                }
                _ => {
                    self.diag.error(
                        Kind::ParseClassAllStatementsInFunctions,
                        &[&s.line, &s.col],
                    );
                    return Err(StageError::Parse);
                }
            }
        }
        program.classes.insert(name.to_string(), class);
        Ok(())
    }

    fn add_import(
        &mut self,
        program: &mut Program,
        stmt: &Stmt,
        names: &[(String, Option<String>)],
    ) -> PResult<()> {
        if names.len() != 1 || names[0].1.is_some() {
            return Err(self.not_supported(stmt.line, stmt.col, "AS "));
        }

        let past_main = program.functions.len() > 1 || !program.functions.contains_key(MAIN);
        if past_main || !program.classes.is_empty() {
            self.diag
                .error(Kind::ParseImportOrder, &[&stmt.line, &stmt.col]);
            return Err(StageError::Parse);
        }

        if names[0].0 != "Ed" {
            self.diag
                .error(Kind::ParseImportNotEd, &[&stmt.line, &stmt.col]);
            return Err(StageError::Parse);
        }

        program.imports.push(names[0].0.clone());
        Ok(())
    }

    fn add_function_statement(&mut self, function: &mut Function, stmt: &Stmt) -> PResult<()> {
        match &stmt.kind {
            StmtKind::Assign { .. } | StmtKind::AugAssign { .. } => {
                self.add_assign_statement(function, stmt)
            }
            StmtKind::Expr(expr) => match &expr.kind {
                ExprKind::Call { .. } => self.add_call_statement(function, stmt, expr),
                ExprKind::Str(doc) => {
                    function.doc_string = doc.clone();
                    Ok(())
                }
                _ => {
                    self.diag
                        .error(Kind::ParseInvalidStatement, &[&stmt.line, &stmt.col]);
                    Err(StageError::Parse)
                }
            },
            StmtKind::While { test, body, orelse } => {
                if !orelse.is_empty() {
                    return Err(self.too_complex(stmt.line, stmt.col, "WHILE"));
                }
                self.add_control(function, stmt, ControlKind::While, test, body, &[])
            }
            StmtKind::If { test, body, orelse } => {
                self.add_control(function, stmt, ControlKind::If, test, body, orelse)
            }
            StmtKind::For { target, iter, body, orelse } => {
                self.add_for(function, stmt, target, iter, body, orelse)
            }
            StmtKind::Global { names } => {
                // globals must come before any executable statement, so the
                // body may only hold Markers so far
                let ok = function.name != MAIN && function.body.iter().all(Op::is_marker);
                if !ok {
                    self.diag
                        .error(Kind::ParseGlobalOrder, &[&stmt.line, &stmt.col]);
                    return Err(StageError::Parse);
                }
                function.body.push(Op::marker(stmt.line, stmt.col));
                for n in names {
                    if !function.global_access.contains(n) {
                        function.global_access.push(n.clone());
                    }
                }
                Ok(())
            }
            StmtKind::Return { value } => self.add_return(function, stmt, value.as_ref()),
            StmtKind::Pass => Ok(()),
            StmtKind::Break => self.add_loop_modifier(function, stmt, LoopModKind::Break),
            StmtKind::Continue => self.add_loop_modifier(function, stmt, LoopModKind::Continue),
            StmtKind::FuncDef { .. } | StmtKind::ClassDef { .. } | StmtKind::Import { .. } => {
                self.diag
                    .error(Kind::ParseInvalidStatement, &[&stmt.line, &stmt.col]);
                Err(StageError::Parse)
            }
        }
    }

    fn add_loop_modifier(
        &mut self,
        function: &mut Function,
        stmt: &Stmt,
        kind: LoopModKind,
    ) -> PResult<()> {
        let num = match self.loop_stack.last() {
            Some((_, num)) => *num,
            None => {
                self.diag
                    .error(Kind::ParseNotInLoop, &[&stmt.line, &stmt.col]);
                return Err(StageError::Parse);
            }
        };
        function.body.push(Op::marker(stmt.line, stmt.col));
        function.body.push(Op::LoopModifier { num, kind });
        Ok(())
    }

    fn add_control(
        &mut self,
        function: &mut Function,
        stmt: &Stmt,
        kind: ControlKind,
        test: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> PResult<()> {
        function.body.push(Op::marker(stmt.line, stmt.col));
        let num = self.next_marker();

        if kind == ControlKind::While {
            self.loop_stack.push((kind, num));
        }

        function.body.push(Op::ControlMarker { num, kind, end: ControlEnd::Start });

        // evaluate the test into temp 0, then branch on it
        let mut statements = Vec::new();
        self.handle_expr(test, &mut statements, 0, stmt.line)?;
        function.body.append(&mut statements);
        function.body.push(Op::LoopControl {
            num,
            kind,
            test: Value::temp(0),
        });

        for s in body {
            self.add_function_statement(function, s)?;
        }
        if !orelse.is_empty() {
            function.body.push(Op::ControlMarker { num, kind, end: ControlEnd::Else });
            for s in orelse {
                self.add_function_statement(function, s)?;
            }
        }
        function.body.push(Op::ControlMarker { num, kind, end: ControlEnd::End });

        if kind == ControlKind::While {
            self.loop_stack.pop();
        }
        Ok(())
    }

    fn add_for(
        &mut self,
        function: &mut Function,
        stmt: &Stmt,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> PResult<()> {
        if !orelse.is_empty() {
            return Err(self.too_complex(stmt.line, stmt.col, "FOR"));
        }
        let target_name = match &target.kind {
            ExprKind::Name(n) => n.clone(),
            _ => return Err(self.too_complex(stmt.line, stmt.col, "FOR")),
        };

        // iteration source: a named array, or range(limit)
        enum ForKind {
            Array(String),
            Range(Value),
        }
        let for_kind = match &iter.kind {
            ExprKind::Name(n) => ForKind::Array(n.clone()),
            ExprKind::Call { func, args } => {
                let fname = self.call_name(func, stmt.line, stmt.col)?;
                if fname != "range" || args.len() != 1 {
                    return Err(self.too_complex(stmt.line, stmt.col, "FOR"));
                }
                let limit = match &args[0].kind {
                    ExprKind::Int(n) => Value::int(*n),
                    ExprKind::Name(n) => Value::var(n),
                    ExprKind::Attribute { value, attr } => match &value.kind {
                        ExprKind::Name(obj) => Value::var(&format!("{}.{}", obj, attr)),
                        _ => return Err(self.too_complex(stmt.line, stmt.col, "FOR")),
                    },
                    _ => return Err(self.too_complex(stmt.line, stmt.col, "FOR")),
                };
                ForKind::Range(limit)
            }
            _ => return Err(self.too_complex(stmt.line, stmt.col, "FOR")),
        };

        function.body.push(Op::marker(stmt.line, stmt.col));
        let num = self.next_marker();
        self.loop_stack.push((ControlKind::For, num));

        self.for_index += 1;
        let index_temp = self.for_index;
        let index_value = Value::loop_temp(index_temp);

        // the control temp starts at -1; each iteration pre-increments
        function.body.push(Op::UAssign {
            target: index_value.clone(),
            op: UnaryOp::UAdd,
            operand: Value::int(-1),
        });
        function.body.push(Op::ControlMarker {
            num,
            kind: ControlKind::For,
            end: ControlEnd::Start,
        });
        function.body.push(Op::BAssign {
            target: index_value.clone(),
            left: index_value.clone(),
            op: BinOp::Add,
            right: Value::int(1),
        });

        match for_kind {
            ForKind::Range(limit) => {
                function.body.push(Op::ForControl {
                    num,
                    iter: ForIter::Range {
                        limit,
                        current: index_value.clone(),
                    },
                });
                function.body.push(Op::UAssign {
                    target: Value::var(&target_name),
                    op: UnaryOp::UAdd,
                    operand: index_value,
                });
            }
            ForKind::Array(array_name) => {
                let element =
                    Value::slice_var(&array_name, VarName::Temp(Temp::LoopCtl(index_temp)));
                function.body.push(Op::ForControl {
                    num,
                    iter: ForIter::Array(element.clone()),
                });
                function.body.push(Op::UAssign {
                    target: Value::var(&target_name),
                    op: UnaryOp::UAdd,
                    operand: element,
                });
            }
        }

        for s in body {
            self.add_function_statement(function, s)?;
        }

        // the For end marker jumps back to the start
        function.body.push(Op::ControlMarker {
            num,
            kind: ControlKind::For,
            end: ControlEnd::End,
        });
        self.loop_stack.pop();
        Ok(())
    }

    fn add_return(
        &mut self,
        function: &mut Function,
        stmt: &Stmt,
        value: Option<&Expr>,
    ) -> PResult<()> {
        function.body.push(Op::marker(stmt.line, stmt.col));
        match value {
            None => {
                if function.returns_value {
                    self.diag
                        .error(Kind::ParseMixedReturns, &[&stmt.line, &stmt.col]);
                    return Err(StageError::Parse);
                }
                function.body.push(Op::Return { value: None });
                function.returns_none = true;
            }
            Some(expr) => {
                if function.returns_none {
                    self.diag
                        .error(Kind::ParseMixedReturns, &[&stmt.line, &stmt.col]);
                    return Err(StageError::Parse);
                }
                let mut statements = Vec::new();
                self.handle_expr(expr, &mut statements, 0, stmt.line)?;
                function.body.append(&mut statements);
                function.body.push(Op::Return {
                    value: Some(Value::temp(0)),
                });
                function.returns_value = true;
            }
        }
        Ok(())
    }

    fn add_assign_statement(&mut self, function: &mut Function, stmt: &Stmt) -> PResult<()> {
        function.body.push(Op::marker(stmt.line, stmt.col));

        let (target_expr, value_expr, aug_op) = match &stmt.kind {
            StmtKind::Assign { targets, value } => {
                if targets.len() != 1 {
                    self.diag
                        .error(Kind::ParseSyntaxError, &[&stmt.line, &stmt.col]);
                    return Err(StageError::Parse);
                }
                (&targets[0], value, None)
            }
            StmtKind::AugAssign { target, op, value } => (target, value, Some(*op)),
            _ => unreachable!("caller matched on assignment statements"),
        };

        let mut statements = Vec::new();

        // evaluate the right hand side into temp 0
        let mut temp_count = self.handle_expr(value_expr, &mut statements, 0, stmt.line)?;
        let rhs_statements = statements.len();

        // then the target, in case there is subscripting to evaluate; the
        // last op must be `UAssign temp := UAdd <lvalue>`
        temp_count = self.handle_expr(target_expr, &mut statements, temp_count, stmt.line)?;
        let _ = temp_count;

        let target = match statements.last() {
            Some(Op::UAssign { op: UnaryOp::UAdd, operand, .. })
                if statements.len() > rhs_statements && !operand.is_constant() =>
            {
                operand.clone()
            }
            _ => {
                self.diag
                    .error(Kind::ParseSyntaxError, &[&stmt.line, &stmt.col]);
                return Err(StageError::Parse);
            }
        };

        let last = statements.len() - 1;
        statements[last] = match aug_op {
            Some(op) => Op::BAssign {
                target: target.clone(),
                left: target,
                op,
                right: Value::temp(0),
            },
            None => Op::UAssign {
                target,
                op: UnaryOp::UAdd,
                operand: Value::temp(0),
            },
        };

        function.body.append(&mut statements);
        Ok(())
    }

    fn add_call_statement(
        &mut self,
        function: &mut Function,
        stmt: &Stmt,
        expr: &Expr,
    ) -> PResult<()> {
        function.body.push(Op::marker(stmt.line, stmt.col));

        let mut statements = Vec::new();
        self.handle_expr(expr, &mut statements, 0, stmt.line)?;

        // the last op is the call assigned to temp 0; the return value is
        // discarded at statement level
        match statements.last_mut() {
            Some(Op::Call { target, .. }) => *target = None,
            _ => {
                self.diag
                    .error(Kind::ParseSyntaxError, &[&stmt.line, &stmt.col]);
                return Err(StageError::Parse);
            }
        }

        function.body.append(&mut statements);
        Ok(())
    }

    /// A callable's name: a plain name or `obj.attr`.
    fn call_name(&mut self, func: &Expr, line: u32, col: u32) -> PResult<String> {
        match &func.kind {
            ExprKind::Name(n) => Ok(n.clone()),
            ExprKind::Attribute { value, attr } => match &value.kind {
                ExprKind::Name(obj) => Ok(format!("{}.{}", obj, attr)),
                _ => {
                    self.diag.error(Kind::ParseTooComplex, &[&line, &col, &"CALL"]);
                    Err(StageError::Parse)
                }
            },
            _ => {
                self.diag.error(Kind::ParseTooComplex, &[&line, &col, &"CALL"]);
                Err(StageError::Parse)
            }
        }
    }

    /// Reduce an expression to assignments into `temp_count`; the result of
    /// the expression lands in that temp. Returns the highest temp used.
    fn handle_expr(
        &mut self,
        expr: &Expr,
        statements: &mut Vec<Op>,
        temp_count: u32,
        line: u32,
    ) -> PResult<u32> {
        let target = Value::temp(temp_count);
        let mut temp_count = temp_count;

        match &expr.kind {
            ExprKind::Int(n) => {
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand: Value::int(*n),
                });
            }
            ExprKind::Float(text) => {
                self.diag
                    .error(Kind::ParseConstNotInt, &[&expr.line, &expr.col, text]);
                return Err(StageError::Parse);
            }
            ExprKind::Name(n) => {
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand: Value::var(n),
                });
            }
            ExprKind::NameConstant(n) => {
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand: Value::var(n),
                });
            }
            ExprKind::Attribute { value, attr } => match &value.kind {
                ExprKind::Name(obj) => {
                    statements.push(Op::UAssign {
                        target,
                        op: UnaryOp::UAdd,
                        operand: Value::var(&format!("{}.{}", obj, attr)),
                    });
                }
                _ => return Err(self.not_supported(line, 0, "nested classes ")),
            },
            ExprKind::Str(s) => {
                // only valid in Ed.TuneString() or ord(); the optimiser
                // rejects other uses
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand: Value::Str(s.clone()),
                });
            }
            ExprKind::List(elts) => {
                // list literals are Ed.List initialisers; elements must be
                // plain numbers
                let mut init = Vec::with_capacity(elts.len());
                for e in elts {
                    match &e.kind {
                        ExprKind::Int(n) => init.push(*n),
                        ExprKind::Float(text) => {
                            self.diag
                                .error(Kind::ParseConstNotInt, &[&e.line, &e.col, text]);
                            return Err(StageError::Parse);
                        }
                        _ => return Err(self.too_complex(expr.line, expr.col, "LIST INIT")),
                    }
                }
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand: Value::IntList(init),
                });
            }
            ExprKind::Subscript { value, index } => {
                let name = match &value.kind {
                    ExprKind::Name(n) => n.clone(),
                    _ => return Err(self.too_complex(expr.line, expr.col, "ARRAY")),
                };
                temp_count += 1;
                let operand = Value::slice_var(&name, VarName::Temp(Temp::Simple(temp_count)));
                temp_count = self.handle_expr(index, statements, temp_count, line)?;
                statements.push(Op::UAssign {
                    target,
                    op: UnaryOp::UAdd,
                    operand,
                });
            }
            ExprKind::Unary { op, operand } => {
                temp_count += 1;
                let inner = Value::temp(temp_count);
                temp_count = self.handle_expr(operand, statements, temp_count, line)?;
                statements.push(Op::UAssign {
                    target,
                    op: *op,
                    operand: inner,
                });
            }
            ExprKind::Binary { left, op, right } => {
                if *op == BinOp::Pow {
                    return Err(self.not_supported(line, 0, "POWER "));
                }
                temp_count += 1;
                let lhs = Value::temp(temp_count);
                temp_count = self.handle_expr(left, statements, temp_count, line)?;
                temp_count += 1;
                let rhs = Value::temp(temp_count);
                temp_count = self.handle_expr(right, statements, temp_count, line)?;
                statements.push(Op::BAssign {
                    target,
                    left: lhs,
                    op: *op,
                    right: rhs,
                });
            }
            ExprKind::Bool { op, values } => {
                // short-circuit chains bracket their checks with a marker
                // pair; each operand gets a BoolCheck, then Done stores the
                // non-short-circuit default
                let kind = *op;
                let bool_op = match kind {
                    ControlKind::Or => BoolCheckOp::Or,
                    _ => BoolCheckOp::And,
                };
                let num = self.next_marker();
                let result_temp = Value::temp(temp_count);

                statements.push(Op::ControlMarker { num, kind, end: ControlEnd::Start });

                for v in values {
                    temp_count += 1;
                    let check = Op::BoolCheck {
                        num,
                        op: bool_op,
                        value: Value::temp(temp_count),
                        target: result_temp.clone(),
                    };
                    temp_count = self.handle_expr(v, statements, temp_count, line)?;
                    statements.push(check);
                }

                let default = match kind {
                    ControlKind::Or => Value::int(0),
                    _ => Value::int(1),
                };
                statements.push(Op::BoolCheck {
                    num,
                    op: BoolCheckOp::Done,
                    value: default,
                    target: result_temp,
                });
                statements.push(Op::ControlMarker { num, kind, end: ControlEnd::End });
            }
            ExprKind::Call { func, args } => {
                let name = self.call_name(func, expr.line, expr.col)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for a in args {
                    temp_count += 1;
                    arg_values.push(Value::temp(temp_count));
                    temp_count = self.handle_expr(a, statements, temp_count, line)?;
                }
                statements.push(Op::Call {
                    target: Some(target),
                    name,
                    args: arg_values,
                });
            }
            ExprKind::Compare { left, ops } => {
                if ops.len() != 1 {
                    return Err(self.too_complex(expr.line, expr.col, "COMPARE"));
                }
                let (cmp, rhs_expr) = &ops[0];
                let op = match cmp {
                    CmpOp::Lt => BinOp::Lt,
                    CmpOp::LtE => BinOp::LtE,
                    CmpOp::Gt => BinOp::Gt,
                    CmpOp::GtE => BinOp::GtE,
                    CmpOp::Eq => BinOp::Eq,
                    CmpOp::NotEq => BinOp::NotEq,
                    CmpOp::In | CmpOp::NotIn | CmpOp::Is | CmpOp::IsNot => {
                        return Err(self.not_supported(expr.line, expr.col, "In/Is "));
                    }
                };
                temp_count += 1;
                let lhs = Value::temp(temp_count);
                temp_count = self.handle_expr(left, statements, temp_count, line)?;
                temp_count += 1;
                let rhs = Value::temp(temp_count);
                temp_count = self.handle_expr(rhs_expr, statements, temp_count, line)?;
                statements.push(Op::BAssign {
                    target,
                    left: lhs,
                    op,
                    right: rhs,
                });
            }
        }

        Ok(temp_count)
    }
}

// ===========================================================================
// Entry points
// ===========================================================================

fn parse_to_ast(source: &str, diag: &mut DiagSink) -> PResult<Vec<Stmt>> {
    let toks = match Lexer::new(source).tokenize() {
        Ok(t) => t,
        Err((msg, line, col)) => {
            diag.debug_raw(&msg);
            diag.error(Kind::ParseSyntaxError, &[&line, &col]);
            return Err(StageError::Parse);
        }
    };
    Parser::new(toks, diag).parse_module()
}

/// Parse a source string plus the embedded `Ed` library into `program`.
pub fn parse_string(
    source: &str,
    filename: &str,
    program: &mut Program,
    diag: &mut DiagSink,
) -> Result<(), StageError> {
    diag.top(Kind::ParseStart, &[&filename]);

    let user_ast = parse_to_ast(source, diag)?;

    let internal_ast = match parse_to_ast(crate::stdlib_embed::ed_library_source(), diag) {
        Ok(ast) => ast,
        Err(_) => {
            // the embedded library must always parse
            diag.error(Kind::CmpInternalError, &[&701]);
            return Err(StageError::Parse);
        }
    };

    let mut converter = Converter::new(diag);
    converter.walk_program(program, &user_ast)?;
    converter.walk_ed_routines(program, &internal_ast)?;

    if diag.dump_mask() & edc_core::diag::dump::PARSER != 0 {
        program.dump(true);
    }
    Ok(())
}

/// Parse a source file (front-end convenience).
pub fn parse_file(
    path: &std::path::Path,
    program: &mut Program,
    diag: &mut DiagSink,
) -> Result<(), StageError> {
    let source = std::fs::read_to_string(path).map_err(|_| {
        diag.error(Kind::FileOpenError, &[&path.display()]);
        StageError::Parse
    })?;
    parse_string(&source, &path.display().to_string(), program, diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edc_core::diag::Level;

    fn parse_ok(src: &str) -> Program {
        let mut d = DiagSink::new();
        d.set_max_level(Level::Error);
        let mut p = Program::new();
        parse_string(src, "test.py", &mut p, &mut d).expect("parse should succeed");
        p
    }

    fn parse_err(src: &str) -> DiagSink {
        let mut d = DiagSink::new();
        d.set_sink(edc_core::diag::SinkKind::Test);
        d.set_max_level(Level::Error);
        let mut p = Program::new();
        assert!(parse_string(src, "test.py", &mut p, &mut d).is_err());
        d
    }

    fn first_kind(d: &DiagSink) -> u32 {
        d.test_lines()[0]
            .split(',')
            .nth(1)
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn simple_assign_desugars_to_temps() {
        let p = parse_ok("x = 1 + 2\n");
        let body = &p.functions[MAIN].body;
        // Marker, t1 := 1, t2 := 2, t0 := t1 + t2, x := t0
        assert_eq!(body.len(), 5);
        assert!(matches!(body[0], Op::Marker { line: 1, .. }));
        assert_eq!(
            body[1],
            Op::UAssign {
                target: Value::temp(1),
                op: UnaryOp::UAdd,
                operand: Value::int(1)
            }
        );
        assert_eq!(
            body[3],
            Op::BAssign {
                target: Value::temp(0),
                left: Value::temp(1),
                op: BinOp::Add,
                right: Value::temp(2)
            }
        );
        assert_eq!(
            body[4],
            Op::UAssign {
                target: Value::var("x"),
                op: UnaryOp::UAdd,
                operand: Value::temp(0)
            }
        );
    }

    #[test]
    fn internal_library_functions_are_renamed() {
        let p = parse_ok("import Ed\n");
        assert!(p.functions.contains_key("Ed.LeftLed"));
        assert!(p.functions["Ed.LeftLed"].internal);
        assert!(p.functions.contains_key("abs"));
        assert!(!p.functions.contains_key("Ed_LeftLed"));
    }

    #[test]
    fn while_emits_control_markers() {
        let p = parse_ok("i = 0\nwhile i < 5:\n    i = i + 1\n");
        let body = &p.functions[MAIN].body;
        let starts: Vec<_> = body
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    Op::ControlMarker { kind: ControlKind::While, end: ControlEnd::Start, .. }
                )
            })
            .collect();
        assert_eq!(starts.len(), 1);
        assert!(body.iter().any(|op| matches!(
            op,
            Op::LoopControl { kind: ControlKind::While, test: Value::Var(VarName::Temp(Temp::Simple(0))), .. }
        )));
    }

    #[test]
    fn break_binds_to_enclosing_while_not_if() {
        let p = parse_ok(
            "i = 0\nwhile i < 5:\n    i = i + 1\n    if i == 3:\n        break\n",
        );
        let body = &p.functions[MAIN].body;
        let while_num = body
            .iter()
            .find_map(|op| match op {
                Op::ControlMarker { num, kind: ControlKind::While, end: ControlEnd::Start } => {
                    Some(*num)
                }
                _ => None,
            })
            .unwrap();
        let break_num = body
            .iter()
            .find_map(|op| match op {
                Op::LoopModifier { num, kind: LoopModKind::Break } => Some(*num),
                _ => None,
            })
            .unwrap();
        assert_eq!(while_num, break_num);
    }

    #[test]
    fn for_range_uses_loop_control_temp() {
        let p = parse_ok("for i in range(4):\n    pass\n");
        let body = &p.functions[MAIN].body;
        assert!(body.iter().any(|op| matches!(
            op,
            Op::UAssign { target: Value::Var(VarName::Temp(Temp::LoopCtl(1))), operand: Value::Int(-1), .. }
        )));
        assert!(body.iter().any(|op| matches!(
            op,
            Op::ForControl { iter: ForIter::Range { limit: Value::Int(4), .. }, .. }
        )));
    }

    #[test]
    fn for_array_uses_slice_iteration() {
        let p = parse_ok("import Ed\ndata = Ed.List(3)\nfor x in data:\n    pass\n");
        let body = &p.functions[MAIN].body;
        assert!(body.iter().any(|op| matches!(
            op,
            Op::ForControl { iter: ForIter::Array(Value::Slice { .. }), .. }
        )));
    }

    #[test]
    fn bool_op_emits_checks_and_done() {
        let p = parse_ok("x = 1\ny = 2\nz = x and y\n");
        let body = &p.functions[MAIN].body;
        let checks: Vec<_> = body
            .iter()
            .filter(|op| matches!(op, Op::BoolCheck { .. }))
            .collect();
        // one per operand plus the final Done
        assert_eq!(checks.len(), 3);
        assert!(matches!(
            checks[2],
            Op::BoolCheck { op: BoolCheckOp::Done, value: Value::Int(1), .. }
        ));
    }

    #[test]
    fn mixed_returns_are_rejected() {
        let d = parse_err("def f(x):\n    if x:\n        return 1\n    return\n");
        assert_eq!(first_kind(&d), Kind::ParseMixedReturns as u32);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let d = parse_err("break\n");
        assert_eq!(first_kind(&d), Kind::ParseNotInLoop as u32);
    }

    #[test]
    fn import_rules() {
        let d = parse_err("import sys\n");
        assert_eq!(first_kind(&d), Kind::ParseImportNotEd as u32);

        let d = parse_err("def f():\n    pass\nimport Ed\n");
        assert_eq!(first_kind(&d), Kind::ParseImportOrder as u32);

        let d = parse_err("import Ed as robot\n");
        assert_eq!(first_kind(&d), Kind::ParseNotSupported as u32);
    }

    #[test]
    fn float_constants_are_rejected() {
        let d = parse_err("x = 1.5\n");
        assert_eq!(first_kind(&d), Kind::ParseConstNotInt as u32);
    }

    #[test]
    fn chained_comparisons_are_rejected() {
        let d = parse_err("x = 1\ny = 1 < x < 3\n");
        assert_eq!(first_kind(&d), Kind::ParseTooComplex as u32);
    }

    #[test]
    fn in_operator_is_rejected() {
        let d = parse_err("x = 1\ny = x in [1, 2]\n");
        assert_eq!(first_kind(&d), Kind::ParseNotSupported as u32);
    }

    #[test]
    fn power_operator_is_rejected() {
        let d = parse_err("x = 2 ** 3\n");
        assert_eq!(first_kind(&d), Kind::ParseNotSupported as u32);
    }

    #[test]
    fn class_bases_are_rejected() {
        let d = parse_err("class A(object):\n    def __init__(self):\n        pass\n");
        assert_eq!(first_kind(&d), Kind::ParseClassNoBasesAllowed as u32);
    }

    #[test]
    fn method_without_self_is_rejected() {
        let d = parse_err("class A:\n    def m(x):\n        pass\n");
        assert_eq!(first_kind(&d), Kind::ParseClassArg0NotSelf as u32);
    }

    #[test]
    fn duplicate_function_names_are_rejected() {
        let d = parse_err("def f():\n    pass\ndef f():\n    pass\n");
        assert_eq!(first_kind(&d), Kind::ParseNameReused as u32);
    }

    #[test]
    fn global_must_lead_the_function() {
        let d = parse_err("def f():\n    x = 1\n    global g\n");
        assert_eq!(first_kind(&d), Kind::ParseGlobalOrder as u32);

        // two leading globals are fine
        let p = parse_ok("def f():\n    global a\n    global b\n    a = 1\nf()\n");
        assert_eq!(p.functions["f"].global_access, vec!["a", "b"]);
    }

    #[test]
    fn subscript_target_keeps_index_statements() {
        let p = parse_ok("import Ed\nd = Ed.List(5)\nd[2] = 9\n");
        let body = &p.functions[MAIN].body;
        // the final op of the last line stores temp0 into the slice
        let store = body
            .iter()
            .rev()
            .find(|op| matches!(op, Op::UAssign { target: Value::Slice { .. }, .. }))
            .unwrap();
        assert!(matches!(
            store,
            Op::UAssign { operand: Value::Var(VarName::Temp(Temp::Simple(0))), .. }
        ));
    }

    #[test]
    fn call_statement_discards_target() {
        let p = parse_ok("import Ed\nEd.PlayBeep()\n");
        let body = &p.functions[MAIN].body;
        assert!(body
            .iter()
            .any(|op| matches!(op, Op::Call { target: None, name, .. } if name == "Ed.PlayBeep")));
    }

    #[test]
    fn docstrings_are_captured() {
        let p = parse_ok("def f():\n    \"does nothing\"\n    pass\n");
        assert_eq!(p.functions["f"].doc_string, "does nothing");
    }

    #[test]
    fn paren_continuation_joins_lines() {
        let p = parse_ok("x = (1 +\n     2)\n");
        let body = &p.functions[MAIN].body;
        assert!(body
            .iter()
            .any(|op| matches!(op, Op::BAssign { op: BinOp::Add, .. })));
    }
}
