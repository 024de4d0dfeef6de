//! Line-by-line token assembly
//!
//! Each listing line becomes at most one token (DAT directives may emit
//! several). Mnemonics ending in `b`/`w` pick the byte or word variant of
//! the operation. Bare numeric operands are raw variable addresses; `$`
//! constants are immediates.

use crate::lexer::{LineLexer, Word};
use crate::tokens::{
    self, Section, Token, TokenKind, TokenStream, MAX_SBYTE, MAX_WORD, MIN_SBYTE,
};
use edc_core::diag::{DiagSink, Kind};
use edc_core::program::StageError;
use std::path::{Path, PathBuf};

fn err(diag: &mut DiagSink, number: u32, detail: &str) -> StageError {
    tokens::asm_error(diag, number, detail)
}

pub struct Assembler {
    pub stream: TokenStream,
    pub lexer: LineLexer,
    /// Directory INSERT BINARY paths resolve against.
    pub base_dir: PathBuf,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            stream: TokenStream::new(),
            lexer: LineLexer::new(),
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_base_dir(dir: &Path) -> Self {
        Assembler {
            base_dir: dir.to_path_buf(),
            ..Self::new()
        }
    }

    /// Assemble one listing line.
    pub fn assemble_line(&mut self, line: &str, diag: &mut DiagSink) -> Result<(), StageError> {
        diag.set_error_context(3, line);

        let words = match self.lexer.chop_line(line) {
            Ok(w) => w,
            Err(e) => return Err(err(diag, 2, &e)),
        };
        if words.is_empty() {
            return Ok(());
        }

        match &words[0] {
            Word::Label(name) => self.spec_label(name.clone(), &words[1..], diag),
            Word::Op(op) => self.dispatch(op.clone(), &words[1..], diag),
            other => Err(err(diag, 2, &format!("Unknown line start: {:?}", other))),
        }
    }

    fn dispatch(&mut self, op: String, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        // Sized operations first: a trailing b/w selects byte or word.
        if let Some(base) = op.strip_suffix('b').or_else(|| op.strip_suffix('w')) {
            let size: u32 = if op.ends_with('w') { 1 } else { 0 };
            match base {
                "mov" => return self.mov(size, words, diag),
                "not" | "dec" | "inc" => return self.uni_math(base, size, words, diag),
                "add" | "sub" | "mul" | "cmp" => return self.basic_math(base, size, words, diag),
                "shl" | "shr" | "div" | "mod" | "or" | "and" | "xor" => {
                    return self.other_math(base, size, words, diag);
                }
                "push" | "pop" | "stra" | "stwa" => return self.stack(base, size, words, diag),
                _ => {}
            }
        }

        match op.as_str() {
            "conv" | "convl" | "convm" | "cmptime" => self.conv(&op, words, diag),
            "disable" | "enable" | "error" => self.event(&op, words, diag),
            "ret" | "dbnz" | "dsnz" => self.jump(&op, "", words, diag),
            "bra" | "bre" | "brne" | "brgr" | "brge" | "brl" | "brle" | "brz" | "brnz" => {
                self.jump("branch", &op[2..], words, diag)
            }
            "suba" | "sube" | "subne" | "subgr" | "subge" | "subl" | "suble" | "subz" | "subnz" => {
                self.jump("sub", &op[3..], words, diag)
            }
            "stop" | "bitset" | "bitclr" => self.misc(&op, words, diag),
            "or" | "and" | "xor" => self.other_math(&op, 0, words, diag),
            "stinc" | "stdec" | "push" => self.stack_math(&op, words, diag),
            "DATB" => self.spec_data(tokens::SPACE_BYTE, words, diag),
            "DATW" => self.spec_data(tokens::SPACE_WORD, words, diag),
            "BINB" => self.spec_binary(words, diag),
            "RESERVB" => self.spec_reserve(tokens::SPACE_BYTE, words, diag),
            "RESERVW" => self.spec_reserve(tokens::SPACE_WORD, words, diag),
            "BEGIN" | "END" => self.spec_begin_end(&op, words, diag),
            "VERSION" => self.spec_version(words, diag),
            "LIMITS" => self.spec_limits(words, diag),
            "DEVICE" => self.spec_device(words, diag),
            "INSERT" => self.spec_insert(words, diag),
            "FINISH" => self.spec_finish(words, diag),
            _ => Err(err(diag, 2, &format!("Unknown operator:{}", op))),
        }
    }

    // ----- moves ---------------------------------------------------------

    fn mov(&mut self, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 2 {
            return Err(err(diag, 3, "Move needs 2 arguments"));
        }
        if matches!(words[0], Word::ModReg(0xf0)) {
            self.mov_from_acc(size, words, diag)
        } else {
            self.mov_not_from_acc(size, words, diag)
        }
    }

    fn mov_from_acc(&mut self, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut token = Token::new(TokenKind::Misc);
        token.add_bits(0, 4, 0xf, 0x3);

        match &words[1] {
            Word::ModReg(m) => {
                token.add_bits(0, 0, 0xf, if size == 0 { 0x2 } else { 0x3 });
                token.add_byte(1, *m as i64, diag)?;
            }
            Word::Var(name) => {
                token.add_bits(0, 0, 0xf, size);
                token.add_byte(1, 0, diag)?;
                token.add_vname(1, size as usize, name);
            }
            Word::Num(n) => {
                token.add_bits(0, 0, 0xf, size);
                token.add_byte(1, *n, diag)?;
            }
            _ => return Err(err(diag, 6, "Destination must be a mod/reg or variable")),
        }
        self.stream.add_token(token, diag)
    }

    fn mov_not_from_acc(&mut self, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut token = Token::new(TokenKind::Move);
        token.add_bits(0, 6, 3, 1);
        let mut sdindex = 1usize;

        match &words[0] {
            Word::Const(c) => {
                if (0..=3).contains(c) {
                    // small constants pack into the primary byte
                    token.add_bits(0, 3, 0x3, *c as u32);
                    token.add_bits(0, 2, 0x1, size);
                } else if size == 0 {
                    token.add_bits(0, 2, 0xf, 0xa);
                    token.add_byte(sdindex, *c, diag)?;
                    sdindex += 1;
                } else {
                    token.add_bits(0, 2, 0xf, 0xb);
                    token.add_word(sdindex, *c, diag)?;
                    sdindex += 2;
                }
            }
            Word::ModReg(m) => {
                token.add_bits(0, 2, 0xf, if size == 0 { 0x8 } else { 0x9 });
                token.add_byte(sdindex, *m as i64, diag)?;
                sdindex += 1;
            }
            Word::Var(name) => {
                token.add_bits(0, 2, 0xf, if size == 0 { 0xc } else { 0xd });
                token.add_byte(sdindex, 0, diag)?;
                token.add_vname(sdindex, size as usize, name);
                sdindex += 1;
            }
            Word::Num(n) => {
                token.add_bits(0, 2, 0xf, if size == 0 { 0xc } else { 0xd });
                token.add_byte(sdindex, *n, diag)?;
                sdindex += 1;
            }
            other => return Err(err(diag, 7, &format!("Bad move source: {:?}", other))),
        }

        match &words[1] {
            Word::ModReg(m) => {
                if *m == 0xf0 {
                    token.add_bits(0, 0, 0x3, 0x3);
                } else {
                    token.add_bits(0, 0, 0x3, 0x0);
                    token.add_byte(sdindex, *m as i64, diag)?;
                }
            }
            Word::Var(name) => {
                token.add_bits(0, 0, 0x3, if size == 0 { 0x1 } else { 0x2 });
                token.add_byte(sdindex, 0, diag)?;
                token.add_vname(sdindex, size as usize, name);
            }
            Word::Num(n) => {
                token.add_bits(0, 0, 0x3, if size == 0 { 0x1 } else { 0x2 });
                token.add_byte(sdindex, *n, diag)?;
            }
            other => return Err(err(diag, 9, &format!("Bad move destination: {:?}", other))),
        }

        self.stream.add_token(token, diag)
    }

    // ----- arithmetic ----------------------------------------------------

    fn uni_math(&mut self, op: &str, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() > 1 {
            return Err(err(diag, 15, "Unary Math has at most one argument"));
        }
        let code = match op {
            "not" => 0,
            "inc" => 1,
            _ => 2,
        };
        let mut token = Token::new(TokenKind::UniMath);
        token.add_bits(0, 6, 3, 2);
        token.add_bits(0, 3, 1, size);
        token.add_bits(0, 0, 3, code);

        match words.first() {
            None | Some(Word::ModReg(0xf0)) => {
                token.add_bits(0, 2, 1, 0);
            }
            Some(Word::Var(name)) => {
                token.add_bits(0, 2, 1, 1);
                token.add_byte(1, 0, diag)?;
                token.add_vname(1, size as usize, name);
            }
            Some(Word::Num(n)) => {
                token.add_bits(0, 2, 1, 1);
                token.add_byte(1, *n, diag)?;
            }
            _ => return Err(err(diag, 16, "Unary Math - invalid argument type")),
        }
        self.stream.add_token(token, diag)
    }

    fn basic_math(&mut self, op: &str, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 1 {
            return Err(err(diag, 17, "Basic Math needs one argument"));
        }
        let code = match op {
            "add" => 0,
            "sub" => 1,
            "mul" => 2,
            _ => 3, // cmp
        };
        let mut token = Token::new(TokenKind::BasicMath);
        token.add_bits(0, 6, 3, 2);
        token.add_bits(0, 4, 3, 1);
        token.add_bits(0, 3, 1, size);
        token.add_bits(0, 0, 3, code);

        match &words[0] {
            Word::Var(name) => {
                token.add_bits(0, 2, 1, 0);
                token.add_byte(1, 0, diag)?;
                token.add_vname(1, size as usize, name);
            }
            Word::Num(n) => {
                token.add_bits(0, 2, 1, 0);
                token.add_byte(1, *n, diag)?;
            }
            Word::Const(c) => {
                token.add_bits(0, 2, 1, 1);
                if size == 0 {
                    token.add_byte(1, *c, diag)?;
                } else {
                    token.add_word(1, *c, diag)?;
                }
            }
            _ => return Err(err(diag, 18, "Basic Math - invalid argument type")),
        }
        self.stream.add_token(token, diag)
    }

    fn other_math(&mut self, op: &str, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 1 {
            return Err(err(diag, 19, "Logic Math needs one argument"));
        }
        let mut token = Token::new(TokenKind::LogMath);
        token.add_bits(0, 6, 3, 2);
        token.add_bits(0, 3, 1, size);

        match op {
            "shl" | "shr" | "div" | "mod" => {
                let code = match op {
                    "shl" => 0,
                    "shr" => 1,
                    "div" => 2,
                    _ => 3,
                };
                token.add_bits(0, 4, 3, 2);
                token.add_bits(0, 0, 3, code);
            }
            _ => {
                let code = match op {
                    "or" => 0,
                    "and" => 1,
                    _ => 2, // xor
                };
                token.add_bits(0, 4, 3, 3);
                token.add_bits(0, 0, 3, code);
            }
        }

        match &words[0] {
            Word::Var(name) => {
                token.add_bits(0, 2, 1, 0);
                token.add_byte(1, 0, diag)?;
                token.add_vname(1, size as usize, name);
            }
            Word::Num(n) => {
                token.add_bits(0, 2, 1, 0);
                token.add_byte(1, *n, diag)?;
            }
            Word::Const(c) => {
                token.add_bits(0, 2, 1, 1);
                // shifts only ever need a byte of count
                if size == 0 || op == "shl" || op == "shr" {
                    token.add_byte(1, *c, diag)?;
                } else {
                    token.add_word(1, *c, diag)?;
                }
            }
            _ => return Err(err(diag, 21, "Logic Math - invalid argument type")),
        }
        self.stream.add_token(token, diag)
    }

    fn conv(&mut self, op: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut token = Token::new(TokenKind::Conv);
        if op == "cmptime" {
            if words.len() != 1 {
                return Err(err(diag, 22, "Cmptime needs one argument"));
            }
            token.add_bits(0, 6, 3, 2);
            token.add_bits(0, 3, 1, 0);
            token.add_bits(0, 0, 7, 7);
            match &words[0] {
                Word::Num(n) => token.add_byte(1, *n, diag)?,
                Word::Var(name) => {
                    token.add_byte(1, 0, diag)?;
                    token.add_vname(1, 0, name);
                }
                _ => return Err(err(diag, 23, "Cmptime takes a variable as it's argument")),
            }
        } else {
            if !words.is_empty() {
                return Err(err(diag, 24, "Conversions don't take arguments"));
            }
            token.add_bits(0, 6, 3, 2);
            token.add_bits(0, 0, 7, 3);
            if op == "convm" {
                token.add_bits(0, 3, 1, 1);
            }
        }
        self.stream.add_token(token, diag)
    }

    // ----- stack ---------------------------------------------------------

    fn stack(&mut self, op: &str, size: u32, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 1 {
            return Err(err(diag, 25, "Stack ops need 1 argument"));
        }
        let mut token = Token::new(TokenKind::Stack);
        token.add_bits(0, 6, 3, 3);
        token.add_bits(0, 5, 1, 1);
        token.add_bits(0, 4, 1, size);

        match op {
            "push" => match &words[0] {
                Word::Const(c) => {
                    if size == 0 {
                        token.add_byte(1, *c, diag)?;
                    } else {
                        token.add_word(1, *c, diag)?;
                    }
                }
                Word::ModReg(m) => {
                    token.add_bits(0, 0, 0xf, 2);
                    token.add_byte(1, *m as i64, diag)?;
                }
                Word::Var(name) => {
                    token.add_bits(0, 0, 0xf, 1);
                    token.add_byte(1, 0, diag)?;
                    token.add_vname(1, size as usize, name);
                }
                Word::Num(n) => {
                    token.add_bits(0, 0, 0xf, 1);
                    token.add_byte(1, *n, diag)?;
                }
                other => return Err(err(diag, 26, &format!("Push - invalid operand: {:?}", other))),
            },
            "pop" => match &words[0] {
                Word::ModReg(0xf0) => {
                    token.add_bits(0, 0, 0xf, 0x4);
                }
                Word::ModReg(m) => {
                    token.add_bits(0, 0, 0xf, 6);
                    token.add_byte(1, *m as i64, diag)?;
                }
                Word::Var(name) => {
                    token.add_bits(0, 0, 0xf, 5);
                    token.add_byte(1, 0, diag)?;
                    token.add_vname(1, size as usize, name);
                }
                Word::Num(n) => {
                    token.add_bits(0, 0, 0xf, 5);
                    token.add_byte(1, *n, diag)?;
                }
                other => return Err(err(diag, 27, &format!("Pop - invalid operand: {:?}", other))),
            },
            "stra" => {
                // read from stack into acc
                token.add_bits(0, 0, 0xf, 9);
                match &words[0] {
                    Word::Const(c) | Word::Num(c) => token.add_byte(1, *c, diag)?,
                    other => return Err(err(diag, 28, &format!("Stra - invalid operand: {:?}", other))),
                }
            }
            _ => {
                // stwa: write from acc into stack
                token.add_bits(0, 0, 0xf, 0xc);
                match &words[0] {
                    Word::Const(c) | Word::Num(c) => token.add_byte(1, *c, diag)?,
                    other => return Err(err(diag, 29, &format!("Stwa - invalid operand: {:?}", other))),
                }
            }
        }
        self.stream.add_token(token, diag)
    }

    fn stack_math(&mut self, op: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 1 {
            return Err(err(diag, 32, "Stack ops need 1 argument"));
        }
        let mut token = Token::new(TokenKind::Stack);
        token.add_bits(0, 4, 0xf, 0xe);

        match op {
            "push" => match &words[0] {
                Word::ModReg(0xf0) => token.add_bits(0, 0, 0xf, 0x3),
                other => return Err(err(diag, 33, &format!("Push with no size - invalid operand: {:?}", other))),
            },
            "stinc" => {
                token.add_bits(0, 0, 0xf, 0xa);
                match &words[0] {
                    Word::Const(c) | Word::Num(c) => token.add_byte(1, *c, diag)?,
                    other => return Err(err(diag, 35, &format!("Stinc - invalid operand: {:?}", other))),
                }
            }
            _ => {
                token.add_bits(0, 0, 0xf, 0xb);
                match &words[0] {
                    Word::Const(c) | Word::Num(c) => token.add_byte(1, *c, diag)?,
                    other => return Err(err(diag, 36, &format!("Stdec - invalid operand: {:?}", other))),
                }
            }
        }
        self.stream.add_token(token, diag)
    }

    // ----- events, jumps, misc ------------------------------------------

    fn event(&mut self, op: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut token = Token::new(TokenKind::Event);
        if op == "error" {
            if words.len() != 1 {
                return Err(err(diag, 37, "Error needs 1 argument"));
            }
            token.add_byte(0, 0xef, diag)?;
            match &words[0] {
                Word::Const(c) | Word::Num(c) => token.add_byte(1, *c, diag)?,
                other => return Err(err(diag, 38, &format!("Error - invalid operand: {:?}", other))),
            }
        } else {
            if !words.is_empty() {
                return Err(err(diag, 39, "Enable/disable don't take arguments"));
            }
            token.add_bits(0, 6, 3, 2);
            token.add_bits(0, 4, 3, 3);
            token.add_bits(0, 0, 3, 3);
            token.add_bits(0, 2, 1, if op == "enable" { 1 } else { 0 });
        }
        self.stream.add_token(token, diag)
    }

    fn jump(&mut self, op: &str, cond: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut token = Token::new(TokenKind::Jump);
        token.add_bits(0, 6, 3, 3);

        if op == "ret" {
            if !words.is_empty() {
                return Err(err(diag, 40, "Ret doesn't take an argument"));
            }
            token.add_bits(0, 0, 0x3f, 0x28);
            return self.stream.add_token(token, diag);
        }
        if words.len() != 1 {
            return Err(err(diag, 41, "Jumps need a target to jump to"));
        }

        // sub and dsnz push a return frame
        token.add_bits(0, 3, 1, if op.starts_with("su") || op.starts_with("ds") { 1 } else { 0 });

        let cond_code = match cond {
            "" => 7, // dbnz / dsnz
            "a" => 0,
            "e" | "z" => 1,
            "ne" | "nz" => 2,
            "gr" => 3,
            "ge" => 4,
            "l" => 5,
            "le" => 6,
            _ => return Err(err(diag, 41, &format!("Unknown jump condition: {}", cond))),
        };
        token.add_bits(0, 0, 7, cond_code);

        match &words[0] {
            Word::Const(offset) => {
                if (MIN_SBYTE..=MAX_SBYTE).contains(offset) {
                    let mut o = *offset;
                    if o < 0 {
                        o += 256;
                    }
                    token.add_byte(1, o, diag)?;
                } else if (tokens::MIN_WORD..=MAX_WORD).contains(offset) {
                    token.add_bits(0, 4, 1, 1);
                    token.add_word(1, *offset, diag)?;
                } else {
                    return Err(err(diag, 42, &format!("Jump offset out of range: {}", offset)));
                }
            }
            Word::Label(name) => {
                if name.starts_with(':') {
                    // globals are always long jumps
                    token.add_bits(0, 4, 1, 1);
                    token.set_jump_label(1, name, true);
                    token.add_word(1, 0, diag)?; // placeholder
                } else {
                    token.set_jump_label(1, name, false);
                    token.add_byte(1, 0, diag)?; // placeholder
                }
            }
            other => {
                return Err(err(
                    diag,
                    42,
                    &format!("Jumps need either a constant or a label as argument, not a: {:?}", other),
                ));
            }
        }
        self.stream.add_token(token, diag)
    }

    fn misc(&mut self, op: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if op == "stop" {
            if !words.is_empty() {
                return Err(err(diag, 43, "Stop doesn't take arguments"));
            }
            let mut token = Token::new(TokenKind::Misc);
            token.add_bits(0, 0, 0xff, 0xff);
            return self.stream.add_token(token, diag);
        }

        // bitset / bitclr
        if words.len() != 2 {
            return Err(err(diag, 44, "Bitset/bitclr needs 2 arguments: bit and mod/reg"));
        }
        let bit = words[0].as_num().map_err(|e| err(diag, 45, &e))?;
        if !(0..=7).contains(&bit) {
            return Err(err(
                diag,
                45,
                &format!("Bitset/bitclr bit must be between 0 and 7 (not {})", bit),
            ));
        }
        let modreg = words[1].as_modreg().map_err(|e| err(diag, 44, &e))?;

        let mut token = Token::new(TokenKind::Misc);
        token.add_bits(0, 4, 0xf, 0x0);
        token.add_bits(0, 3, 0x1, if op == "bitset" { 1 } else { 0 });
        token.add_bits(0, 0, 0x7, bit as u32);
        token.add_byte(1, modreg as i64, diag)?;
        self.stream.add_token(token, diag)
    }

    // ----- directives ----------------------------------------------------

    fn spec_label(&mut self, name: String, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if !words.is_empty() {
            return Err(err(diag, 47, "A label doesn't take any arguments"));
        }
        self.stream.add_label(&name, diag)
    }

    fn spec_data(&mut self, space: usize, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() < 2 {
            return Err(err(diag, 48, "DAT[BW] needs at least 2 arguments: name, start"));
        }

        let name = if words[0].is_star() {
            "*".to_string()
        } else {
            words[0].as_str().map_err(|e| err(diag, 48, &e))?.to_string()
        };

        let start = if words[1].is_star() {
            if name == "*" {
                return Err(err(diag, 49, "DAT[BW] both name and loc can't both be '*'"));
            }
            -1
        } else {
            words[1].as_num().map_err(|e| err(diag, 48, &e))?
        };

        let mut rest = &words[2..];
        let mut length = 1i64;
        if let Some(first) = rest.first() {
            length = if first.is_star() {
                -1
            } else {
                first.as_num().map_err(|e| err(diag, 48, &e))?
            };
            rest = &rest[1..];
        }

        let mut values: Vec<i64> = Vec::new();
        for w in rest {
            match w {
                Word::Str(s) => values.extend(s.bytes().map(|b| b as i64)),
                Word::Num(n) | Word::Const(n) => values.push(*n),
                other => return Err(err(diag, 50, &format!("Word should have been an argument or string! ({:?})", other))),
            }
        }

        if length > 0 && values.len() as i64 > length {
            return Err(err(
                diag,
                51,
                &format!("Data has length of {} but more values ({}) then length", length, values.len()),
            ));
        }

        let real_length = if length > 0 { length } else { values.len() as i64 };
        let test = if start > 0 { start + real_length } else { real_length };
        if test <= 0 {
            return Err(err(diag, 52, "There is no data for the space"));
        }
        if test >= 255 {
            let which = if space == tokens::SPACE_BYTE { "B" } else { "W" };
            diag.error(Kind::AsmMemOverflow, &[&which]);
            return Err(StageError::Assemble);
        }

        // Unnamed fixed areas zero-fill out to the declared length.
        if name == "*" && length > 0 {
            while (values.len() as i64) < length {
                values.push(0);
            }
        }

        self.emit_data_tokens(space, &name, start, &values, diag)?;

        if name != "*" {
            self.stream.add_variable(space, &name, start, real_length, diag)?;
        }
        Ok(())
    }

    /// Emit DAT tokens carrying up to 15 values each.
    fn emit_data_tokens(
        &mut self,
        space: usize,
        name: &str,
        start: i64,
        values: &[i64],
        diag: &mut DiagSink,
    ) -> Result<(), StageError> {
        if values.is_empty() {
            return Ok(());
        }
        let tokens_to_create = (values.len() + 14) / 15;
        let last = values.len() % 15;

        let mut val_index = 0usize;
        for i in 0..tokens_to_create {
            let mut token = Token::new(TokenKind::Data);
            token.add_bits(0, 4, 3, space as u32 + 1);
            let val_count = if i < tokens_to_create - 1 || last == 0 { 15 } else { last };
            token.add_bits(0, 0, 0xf, val_count as u32);

            if name != "*" {
                token.add_byte(1, (i * 15) as i64, diag)?;
                token.add_vname(1, space, name);
            } else {
                token.add_byte(1, start + (i as i64 * 15), diag)?;
            }

            let mut token_index = 2usize;
            for _ in 0..val_count {
                let v = values[val_index];
                if space == tokens::SPACE_BYTE {
                    token.add_byte(token_index, v, diag)?;
                    token_index += 1;
                } else {
                    if v > MAX_WORD {
                        token.add_uword(token_index, v, diag)?;
                    } else {
                        token.add_word(token_index, v, diag)?;
                    }
                    token_index += 2;
                }
                val_index += 1;
            }
            self.stream.add_token(token, diag)?;
        }
        Ok(())
    }

    fn spec_binary(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let mut bytes: Vec<u8> = Vec::new();
        for w in words {
            match w {
                Word::Str(s) => bytes.extend(s.bytes()),
                Word::Num(n) | Word::Const(n) => {
                    if !(0..=255).contains(n) {
                        return Err(err(diag, 58, &format!("Binary byte out of range: {}", n)));
                    }
                    bytes.push(*n as u8);
                }
                other => return Err(err(diag, 58, &format!("Word should have been an argument or string! ({:?})", other))),
            }
        }
        let mut token = Token::new(TokenKind::Binary);
        token.add_binary(bytes);
        self.stream.add_token(token, diag)
    }

    fn spec_reserve(&mut self, space: usize, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 2 {
            return Err(err(diag, 59, "RESERV[BW] needs 2 arguments: start, length"));
        }
        let start = words[0].as_num().map_err(|e| err(diag, 59, &e))?;
        let length = words[1].as_num().map_err(|e| err(diag, 59, &e))?;
        self.stream.reserve_name_space(space, start, length, diag)
    }

    fn spec_version(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 2 {
            return Err(err(diag, 60, "VERSION needs 2 arguments: major, minor"));
        }
        let major = words[0].as_num().map_err(|e| err(diag, 60, &e))?;
        let minor = words[1].as_num().map_err(|e| err(diag, 60, &e))?;
        if !(0..=15).contains(&major) {
            return Err(err(diag, 61, &format!("major version must be between 0 and 15 (not {})", major)));
        }
        if !(0..=15).contains(&minor) {
            return Err(err(diag, 62, &format!("minor version must be between 0 and 15 (not {})", minor)));
        }
        self.stream.add_version(major as u8, minor as u8, diag)
    }

    fn spec_begin_end(&mut self, op: &str, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.is_empty() {
            return Err(err(diag, 63, "BEGIN/END need a type argument"));
        }
        let which = words[0].as_str().map_err(|e| err(diag, 63, &e))?;
        match which {
            "FIRMWARE" => {
                if op == "BEGIN" {
                    if words.len() != 1 {
                        return Err(err(diag, 64, "FIRMWARE doesn't take any arguments."));
                    }
                    self.stream.add_begin(Section::Firmware, (-1, -1, -1), diag)
                } else {
                    self.stream.add_end(Section::Firmware, diag)
                }
            }
            "EVENT" => {
                if op == "BEGIN" {
                    if words.len() != 4 {
                        return Err(err(diag, 65, "EVENT needs 3 arguments: mod/reg, mask, value"));
                    }
                    let modreg = words[1].as_modreg().map_err(|e| err(diag, 65, &e))?;
                    let mask = words[2].as_num().map_err(|e| err(diag, 65, &e))?;
                    let value = words[3].as_num().map_err(|e| err(diag, 65, &e))?;
                    self.stream.add_begin(Section::Event, (modreg as i64, mask, value), diag)
                } else {
                    self.stream.add_end(Section::Event, diag)
                }
            }
            "MAIN" => {
                if op == "BEGIN" {
                    if words.len() != 1 {
                        return Err(err(diag, 66, "MAIN doesn't take any arguments."));
                    }
                    self.stream.add_begin(Section::Main, (-1, -1, -1), diag)
                } else {
                    self.stream.add_end(Section::Main, diag)
                }
            }
            _ => Err(err(diag, 67, "BEGIN/END needs one of: MAIN, EVENT, FIRMWARE")),
        }
    }

    fn spec_limits(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 5 {
            return Err(err(diag, 68, "LIMITS needs exactly 5 arguments"));
        }
        let b = words[0].as_num().map_err(|e| err(diag, 68, &e))?;
        let w = words[1].as_num().map_err(|e| err(diag, 68, &e))?;
        // no LCD in this token stream
        let handlers = words[3].as_num().map_err(|e| err(diag, 68, &e))?;
        let t_bytes = words[4].as_num().map_err(|e| err(diag, 68, &e))?;
        self.stream.set_limits([b, w, 0, handlers, t_bytes], diag)
    }

    fn spec_device(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        let name = match words.len() {
            2 => "",
            3 => words[2].as_str().map_err(|e| err(diag, 69, &e))?,
            _ => return Err(err(diag, 69, "DEVICE needs 2 or 3 arguments")),
        };
        let type_name = words[0].as_str().map_err(|e| err(diag, 69, &e))?.to_string();
        let location = words[1].as_num().map_err(|e| err(diag, 69, &e))?;
        if !(0..=15).contains(&location) {
            return Err(err(diag, 69, &format!("DEVICE location must be 0..15 (not {})", location)));
        }

        let name = name.to_string();
        let dev = match self.lexer.add_device(&type_name, location as u8, &name) {
            Some(d) => d,
            None => return Err(err(diag, 69, &format!("Unknown device type: {}", type_name))),
        };
        self.stream.add_device(dev.code, location as u8, dev.registers.len() as u8, diag)
    }

    fn spec_insert(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if words.len() != 2 {
            return Err(err(diag, 70, "INSERT needs type and filename arguments"));
        }
        let kind = words[0].as_str().map_err(|e| err(diag, 70, &e))?.to_lowercase();
        let f_name = words[1].as_str().map_err(|e| err(diag, 70, &e))?;

        match kind.as_str() {
            "tokens" => Err(err(diag, 72, "INSERT TOKENS should have been consumed higher up! Eek!")),
            "binary" => {
                let path = self.base_dir.join(f_name);
                let bytes = std::fs::read(&path).map_err(|_| {
                    err(
                        diag,
                        73,
                        &format!("INSERT BINARY file:{} doesn't exist or isn't readable", path.display()),
                    )
                })?;
                let mut token = Token::new(TokenKind::Binary);
                token.add_binary(bytes);
                self.stream.add_token(token, diag)
            }
            _ => Err(err(diag, 71, "INSERT type must be one of: 'tokens', 'binary'")),
        }
    }

    fn spec_finish(&mut self, words: &[Word], diag: &mut DiagSink) -> Result<(), StageError> {
        if !words.is_empty() {
            return Err(err(diag, 75, "FINISH doesn't have any arguments"));
        }
        if self.stream.in_open_section() {
            return Err(err(diag, 100, "FINISH must be after all sections."));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edc_core::diag::Level;

    fn diag() -> DiagSink {
        let mut d = DiagSink::new();
        d.set_max_level(Level::Error);
        d
    }

    fn assemble(lines: &[&str]) -> (Assembler, DiagSink) {
        let mut d = diag();
        let mut asm = Assembler::new();
        for l in lines {
            asm.assemble_line(l, &mut d).unwrap();
        }
        (asm, d)
    }

    fn one_token_bits(body: &str) -> Vec<u8> {
        let (mut asm, _) = assemble(&["VERSION 6, 0", "BEGIN MAIN", body, "END MAIN", "FINISH"]);
        assert_eq!(asm.stream.tokens.len(), 1);
        asm.stream.tokens[0].bits().to_vec()
    }

    #[test]
    fn stop_is_ff() {
        assert_eq!(one_token_bits("stop"), vec![0xff]);
    }

    #[test]
    fn ret_is_e8() {
        assert_eq!(one_token_bits("ret"), vec![0xe8]);
    }

    #[test]
    fn small_constant_move_packs_inline() {
        // movw $1 %_cpu:acc: move primary 01, inline const 1, word, acc dest
        assert_eq!(one_token_bits("movw $1 %_cpu:acc"), vec![0x4f]);
    }

    #[test]
    fn word_constant_move_to_acc() {
        // source nibble 0xb (word const), dest acc (0x3)
        assert_eq!(one_token_bits("movw $500 %_cpu:acc"), vec![0x6f, 0x01, 0xf4]);
    }

    #[test]
    fn move_from_acc_to_modreg() {
        assert_eq!(one_token_bits("movb %_cpu:acc %b1"), vec![0x32, 0xb1]);
        assert_eq!(one_token_bits("movw %_cpu:acc %68"), vec![0x33, 0x68]);
    }

    #[test]
    fn stack_access_forms() {
        assert_eq!(one_token_bits("straw $2"), vec![0xf9, 0x02]);
        assert_eq!(one_token_bits("stwaw $0"), vec![0xfc, 0x00]);
        assert_eq!(one_token_bits("stinc $4"), vec![0xea, 0x04]);
        assert_eq!(one_token_bits("stdec $4"), vec![0xeb, 0x04]);
    }

    #[test]
    fn bitset_packs_bit_and_modreg() {
        assert_eq!(one_token_bits("bitset $2 %_index:action"), vec![0x0a, 0xc1]);
        assert_eq!(one_token_bits("bitclr $1 %b0"), vec![0x01, 0xb0]);
    }

    #[test]
    fn short_branch_resolves_backwards() {
        let (mut asm, mut d) = assemble(&[
            "VERSION 6, 0",
            "BEGIN MAIN",
            ":loop",
            "decw",
            "brnz :loop",
            "stop",
            "END MAIN",
            "FINISH",
        ]);
        let mut analysis = crate::tokens::TokenAnalyser::new(std::mem::take(&mut asm.stream));
        analysis.map_all_variables(&mut d).unwrap();
        analysis.fixup_jumps(&mut d).unwrap();
        // decw = 1 byte, brnz = 2 bytes; target offset is -3 from next PC
        let bits = analysis.stream.tokens[1].bits().to_vec();
        assert_eq!(bits, vec![0xc2, 0xfd]);
    }

    #[test]
    fn global_labels_are_long_jumps() {
        let (mut asm, mut d) = assemble(&[
            "VERSION 6, 0",
            "BEGIN MAIN",
            "::top",
            "bra ::top",
            "stop",
            "END MAIN",
            "FINISH",
        ]);
        let mut analysis = crate::tokens::TokenAnalyser::new(std::mem::take(&mut asm.stream));
        analysis.map_all_variables(&mut d).unwrap();
        analysis.fixup_jumps(&mut d).unwrap();
        let bits = analysis.stream.tokens[0].bits().to_vec();
        // long form: bit4 set, word offset -3
        assert_eq!(bits, vec![0xd0, 0xff, 0xfd]);
    }

    #[test]
    fn datw_emits_variable_and_tokens() {
        let (mut asm, mut d) = assemble(&[
            "VERSION 6, 0",
            "BEGIN MAIN",
            "DATW counter, 3, 1, 42",
            "END MAIN",
            "FINISH",
        ]);
        assert_eq!(asm.stream.name_space[crate::tokens::SPACE_WORD].len(), 1);
        let mut analysis = crate::tokens::TokenAnalyser::new(std::mem::take(&mut asm.stream));
        analysis.map_all_variables(&mut d).unwrap();
        // data token: word space (2<<4), 1 value, address 3, value 42
        let bits = analysis.stream.tokens[0].bits().to_vec();
        assert_eq!(bits, vec![0x21, 0x03, 0x00, 0x2a]);
    }

    #[test]
    fn dat_splits_past_fifteen_values() {
        let values: Vec<String> = (0..17).map(|i| i.to_string()).collect();
        let line = format!("DATB big, 0, 17, {}", values.join(", "));
        let (mut asm, _) = assemble(&["VERSION 6, 0", "BEGIN MAIN", &line, "END MAIN", "FINISH"]);
        assert_eq!(asm.stream.tokens.len(), 2);
        assert_eq!(asm.stream.tokens[0].bits()[0], 0x1f); // byte space, 15 values
        assert_eq!(asm.stream.tokens[1].bits()[0], 0x12); // byte space, 2 values
        assert_eq!(asm.stream.tokens[1].bits()[1], 15); // second chunk offset
    }

    #[test]
    fn tokens_outside_sections_are_rejected() {
        let mut d = diag();
        let mut asm = Assembler::new();
        asm.assemble_line("VERSION 6, 0", &mut d).unwrap();
        assert!(asm.assemble_line("stop", &mut d).is_err());
    }

    #[test]
    fn labels_scope_to_their_section() {
        let (asm, _) = assemble(&[
            "VERSION 6, 0",
            "DEVICE beeper, 6, SOUNDER1",
            "BEGIN MAIN",
            ":here",
            "stop",
            "END MAIN",
            "BEGIN EVENT %SOUNDER1:status, 4, 4",
            ":here",
            "stop",
            "END EVENT",
            "FINISH",
        ]);
        assert!(asm.stream.labels.contains_key("here_1"));
        assert!(asm.stream.labels.contains_key("here_2"));
    }
}
