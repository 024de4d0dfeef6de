//! Listing line lexer
//!
//! Chops one assembler line into words: `[label] opcode [operands]`.
//! Operands are `$const`, `@variable`, `%module:register`, `:jumplabel`,
//! quoted strings, bare numbers or bare names. Constants accept decimal,
//! hex (`0xNN`), char literals (`'a'`) and a simple quotient (`a/b`).
//!
//! Module/register operands resolve against the built-in modules and the
//! devices declared by DEVICE directives, so the lexer carries that
//! registry.

use edc_core::values::{self, DeviceType};
use indexmap::IndexMap;

/// One word of a listing line.
#[derive(Debug, Clone, PartialEq)]
pub enum Word {
    /// Line label or jump target. One leading `:` is stripped, so a global
    /// label (`::name`) still starts with `:`.
    Label(String),
    /// The operation mnemonic (first bare word of a line).
    Op(String),
    /// `$`-prefixed constant
    Const(i64),
    /// `@`-prefixed variable reference
    Var(String),
    /// Resolved `(module << 4) | register`
    ModReg(u8),
    /// Bare number
    Num(i64),
    /// Bare name
    Name(String),
    /// Quoted string
    Str(String),
    /// `*` placeholder in data directives
    Star,
}

impl Word {
    /// The word as a number, however it was spelled.
    pub fn as_num(&self) -> Result<i64, String> {
        match self {
            Word::Const(n) | Word::Num(n) => Ok(*n),
            Word::ModReg(m) => Ok(*m as i64),
            other => Err(format!("expected a number, found {:?}", other)),
        }
    }

    /// The word as a bare string (name or quoted).
    pub fn as_str(&self) -> Result<&str, String> {
        match self {
            Word::Name(s) | Word::Str(s) => Ok(s),
            other => Err(format!("expected a name, found {:?}", other)),
        }
    }

    /// The word as a mod/reg byte; bare hex names ("f3") are accepted.
    pub fn as_modreg(&self) -> Result<u8, String> {
        match self {
            Word::ModReg(m) => Ok(*m),
            Word::Num(n) if (0..=255).contains(n) => Ok(*n as u8),
            Word::Name(s) => u8::from_str_radix(s, 16)
                .map_err(|_| format!("'{}' is not a mod/reg byte", s)),
            other => Err(format!("expected a mod/reg, found {:?}", other)),
        }
    }

    pub fn is_star(&self) -> bool {
        matches!(self, Word::Star)
    }
}

/// The lexer with its device registry.
pub struct LineLexer {
    /// device name -> (location, type)
    devices: IndexMap<String, (u8, &'static DeviceType)>,
}

impl Default for LineLexer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineLexer {
    pub fn new() -> Self {
        LineLexer {
            devices: IndexMap::new(),
        }
    }

    /// Register a named device at a module slot. Returns false when the
    /// type is unknown (callers report the error).
    pub fn add_device(&mut self, type_name: &str, location: u8, name: &str) -> Option<&'static DeviceType> {
        let dev = values::device_type(type_name)?;
        if !name.is_empty() {
            self.devices.insert(name.to_string(), (location, dev));
        }
        Some(dev)
    }

    pub fn clear_devices(&mut self) {
        self.devices.clear();
    }

    /// Dump the device/register help tables (the `-r` front-end option).
    pub fn dump_reg_help(&self) {
        println!("Device types:");
        for d in values::DEVICE_TYPES {
            println!("  {:10} (code {})", d.name, d.code);
            for (reg, num) in d.registers {
                println!("      {:12} = {}", reg, num);
            }
        }
        println!("Built-in modules:");
        for (name, loc, regs) in values::BUILTIN_MODULES {
            println!("  {:10} at slot {}", name, loc);
            for (reg, num) in *regs {
                println!("      {:12} = {}", reg, num);
            }
        }
    }

    /// Chop a source line into words. Empty and comment-only lines yield an
    /// empty list.
    pub fn chop_line(&self, line: &str) -> Result<Vec<Word>, String> {
        let mut words = Vec::new();
        for (i, raw) in split_raw(line)?.into_iter().enumerate() {
            words.push(self.classify(&raw, i == 0)?);
        }
        Ok(words)
    }

    fn classify(&self, raw: &RawWord, first: bool) -> Result<Word, String> {
        match raw {
            RawWord::Quoted(s) => Ok(Word::Str(s.clone())),
            RawWord::Plain(text) => {
                let text = text.as_str();
                if let Some(rest) = text.strip_prefix(':') {
                    return Ok(Word::Label(rest.to_string()));
                }
                if let Some(rest) = text.strip_prefix('$') {
                    return Ok(Word::Const(parse_number(rest)?));
                }
                if let Some(rest) = text.strip_prefix('@') {
                    return Ok(Word::Var(rest.to_string()));
                }
                if let Some(rest) = text.strip_prefix('%') {
                    return Ok(Word::ModReg(self.resolve_modreg(rest)?));
                }
                if text == "*" {
                    return Ok(Word::Star);
                }
                if first {
                    return Ok(Word::Op(text.to_string()));
                }
                if let Ok(n) = parse_number(text) {
                    return Ok(Word::Num(n));
                }
                Ok(Word::Name(text.to_string()))
            }
        }
    }

    /// Resolve the text after `%` into `(module << 4) | register`.
    fn resolve_modreg(&self, text: &str) -> Result<u8, String> {
        if let Some((module, register)) = text.split_once(':') {
            let location = self.resolve_module(module)?;
            let reg = self.resolve_register(module, register)?;
            if reg > 15 {
                return Err(format!("register {} out of range in %{}", reg, text));
            }
            return Ok((location << 4) | reg);
        }
        // two bare hex digits
        u8::from_str_radix(text, 16).map_err(|_| format!("unknown mod/reg: %{}", text))
    }

    fn resolve_module(&self, module: &str) -> Result<u8, String> {
        if let Some((_, loc, _)) = values::BUILTIN_MODULES.iter().find(|(n, _, _)| *n == module) {
            return Ok(*loc);
        }
        if let Some((loc, _)) = self.devices.get(module) {
            return Ok(*loc);
        }
        if let Ok(n) = parse_number(module) {
            if (0..=15).contains(&n) {
                return Ok(n as u8);
            }
        }
        Err(format!("unknown module: {}", module))
    }

    fn resolve_register(&self, module: &str, register: &str) -> Result<u8, String> {
        let table: Option<&[(&str, u8)]> = if let Some((_, _, regs)) =
            values::BUILTIN_MODULES.iter().find(|(n, _, _)| *n == module)
        {
            Some(regs)
        } else {
            self.devices.get(module).map(|(_, dev)| dev.registers)
        };

        if let Some(regs) = table {
            if let Some((_, num)) = regs.iter().find(|(n, _)| *n == register) {
                return Ok(*num);
            }
        }
        if let Ok(n) = parse_number(register) {
            if (0..=15).contains(&n) {
                return Ok(n as u8);
            }
        }
        Err(format!("unknown register '{}' of module '{}'", register, module))
    }
}

enum RawWord {
    Plain(String),
    Quoted(String),
}

/// Split on whitespace and commas, honouring quotes and `#` comments.
fn split_raw(line: &str) -> Result<Vec<RawWord>, String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '#' => break,
            '"' => {
                if !cur.is_empty() {
                    out.push(RawWord::Plain(std::mem::take(&mut cur)));
                }
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(e) => s.push(e),
                            None => return Err("unterminated string escape".to_string()),
                        },
                        Some('"') => break,
                        Some(q) => s.push(q),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                out.push(RawWord::Quoted(s));
            }
            c if c.is_whitespace() || c == ',' => {
                if !cur.is_empty() {
                    out.push(RawWord::Plain(std::mem::take(&mut cur)));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(RawWord::Plain(cur));
    }
    Ok(out)
}

/// Parse a constant: decimal, hex, char literal, or a quotient `a/b`.
pub fn parse_number(text: &str) -> Result<i64, String> {
    if let Some((lhs, rhs)) = text.split_once('/') {
        let a = parse_number(lhs)?;
        let b = parse_number(rhs)?;
        if b == 0 {
            return Err(format!("division by zero in constant '{}'", text));
        }
        return Ok(a / b);
    }

    let t = text.trim();
    if t.len() >= 3 && t.starts_with('\'') && t.ends_with('\'') {
        let inner: Vec<char> = t[1..t.len() - 1].chars().collect();
        if inner.len() == 1 {
            return Ok(inner[0] as i64);
        }
        return Err(format!("bad char literal: {}", t));
    }

    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).map_err(|_| format!("bad hex constant: {}", t))?
    } else {
        body.parse::<i64>().map_err(|_| format!("bad constant: {}", t))?
    };
    Ok(if neg { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chops_basic_statement() {
        let lex = LineLexer::new();
        let words = lex.chop_line("movw $1 %_cpu:acc").unwrap();
        assert_eq!(words[0], Word::Op("movw".to_string()));
        assert_eq!(words[1], Word::Const(1));
        assert_eq!(words[2], Word::ModReg(0xf0));
    }

    #[test]
    fn commas_and_comments() {
        let lex = LineLexer::new();
        let words = lex.chop_line("DATW name, 3, 1, 42  # trailing note").unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[4], Word::Num(42));
        assert!(lex.chop_line("   # only a comment").unwrap().is_empty());
    }

    #[test]
    fn labels_keep_global_marker() {
        let lex = LineLexer::new();
        assert_eq!(
            lex.chop_line("::_fun_main").unwrap()[0],
            Word::Label(":_fun_main".to_string())
        );
        assert_eq!(
            lex.chop_line("bra :_int_0001").unwrap()[1],
            Word::Label("_int_0001".to_string())
        );
    }

    #[test]
    fn number_forms() {
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number("-3").unwrap(), -3);
        assert_eq!(parse_number("'a'").unwrap(), 97);
        assert_eq!(parse_number("1024/16").unwrap(), 64);
        assert!(parse_number("12.5").is_err());
    }

    #[test]
    fn device_names_resolve_after_registration() {
        let mut lex = LineLexer::new();
        assert!(lex.chop_line("bitclr $0 %Left_Motor:status").is_err());
        lex.add_device("motor-b", 8, "Left_Motor").unwrap();
        let words = lex.chop_line("bitclr $0 %Left_Motor:status").unwrap();
        assert_eq!(words[2], Word::ModReg(0x80));
        // control register of the same motor
        let words = lex.chop_line("movb $5 %Left_Motor:control").unwrap();
        assert_eq!(words[2], Word::ModReg(0x81));
    }

    #[test]
    fn raw_hex_modreg() {
        let lex = LineLexer::new();
        assert_eq!(lex.chop_line("movb $1 %b1").unwrap()[2], Word::ModReg(0xb1));
        assert_eq!(lex.chop_line("movw $9 %68").unwrap()[2], Word::ModReg(0x68));
    }

    #[test]
    fn quoted_strings_with_escapes() {
        let lex = LineLexer::new();
        let words = lex
            .chop_line("DATB msg, 0, 9, \"say \\\"hi\\\"\"")
            .unwrap();
        assert_eq!(words[4], Word::Str("say \"hi\"".to_string()));
    }
}
