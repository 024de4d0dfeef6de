//! Diagnostics: numbered message kinds, levels and output sinks
//!
//! Every user-visible message is a numbered kind with a format string; the
//! language file can override the format string per kind, the kind number is
//! what test oracles compare. The sink is an explicit context object passed
//! to each pass (not a process global).

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;

/// Output verbosity. Ordering matters: a sink configured at level L emits
/// everything at L or more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Top = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl Level {
    pub fn prefix(&self) -> &'static str {
        match self {
            Level::Error => "ERR",
            Level::Warn => "WARN",
            Level::Top => "TOP",
            Level::Info => "INFO",
            Level::Verbose => "VERB",
            Level::Debug => "DBG",
        }
    }
}

/// Where messages go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Console,
    Json,
    Both,
    /// Machine-readable `level,kind[,arg...]` lines for the test oracles.
    Test,
}

/// Bit mask selecting internal dumps after each stage.
pub mod dump {
    pub const PARSER: u32 = 0x01;
    pub const OPTIMISER: u32 = 0x02;
    pub const COMPILER: u32 = 0x04;
    pub const ASSEMBLY: u32 = 0x08;
    pub const BINARY: u32 = 0x10;
}

macro_rules! diag_kinds {
    ($( $variant:ident = $num:literal, $name:literal, $fmt:literal; )*) => {
        /// Numbered diagnostic kinds. The numbers are part of the test
        /// interface; never renumber.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Kind {
            $( $variant = $num, )*
        }

        impl Kind {
            /// Stable SCREAMING_SNAKE name, used as the language-file key.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Kind::$variant => $name, )*
                }
            }

            /// Built-in English format string (`{0}`-style placeholders).
            pub fn raw_format(&self) -> &'static str {
                match self {
                    $( Kind::$variant => $fmt, )*
                }
            }

            pub fn from_name(name: &str) -> Option<Kind> {
                match name {
                    $( $name => Some(Kind::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

diag_kinds! {
    SpecialFail = 0, "ELPY_SPECIAL_FAIL", "Debug Error";
    TopPrefix = 1, "TOP_PREFIX", "TOP";
    ErrorPrefix = 2, "ERROR_PREFIX", "ERR";
    WarnPrefix = 3, "WARN_PREFIX", "WARN";
    InfoPrefix = 4, "INFO_PREFIX", "INFO";
    VerbosePrefix = 5, "VERBOSE_PREFIX", "VERB";
    DebugPrefix = 6, "DEBUG_PREFIX", "DBG";
    FileOpenError = 7, "FILE_OPEN_ERROR", "file:0: Could not access file {0}";
    BadInputChars = 8, "BAD_INPUT_CHARS", "file:0: Illegal character in {0}";

    ParseStart = 9, "PARSE_START", "Starting parse of file:{0}";
    ParseError = 10, "PARSE_ERROR", "file:0: There was an error parsing {0}";
    ParseNameReused = 11, "PARSE_NAME_REUSED", "file:{0}:{1}: Syntax Error, two {2} with the same name";
    ParseInvalidStatement = 12, "PARSE_INVALID_STATEMENT", "file:{0}:{1}: Syntax error, statement not valid here";
    ParseGlobalOrder = 13, "PARSE_GLOBAL_ORDER", "file:{0}:{1}: Syntax error, globals must be first in functions";
    ParseImportNotEd = 14, "PARSE_IMPORT_NOT_ED", "file:{0}:{1}: Syntax error, only the Ed module can be imported";
    ParseImportOrder = 15, "PARSE_IMPORT_ORDER", "file:{0}:{1}: Syntax error, imports must be before functions and classes";
    ParseSyntaxError = 16, "PARSE_SYNTAX_ERROR", "file:{0}:{1}: Syntax error";
    ParseNotSupported = 17, "PARSE_NOT_SUPPORTED", "file:{0}:{1}: Syntax Error, {2}not supported in Ed.Py";
    ParseTooComplex = 18, "PARSE_TOO_COMPLEX", "file:{0}:{1}: Syntax Error, {2} code too complex for Ed.Py";
    ParseNotInLoop = 19, "PARSE_NOT_IN_LOOP", "file:{0}:{1}: Syntax error, statement must be inside a loop";
    ParseClassArg0NotSelf = 20, "PARSE_CLASS_ARG0_NOT_SELF", "file:{0}:{1}: Syntax Error, first method arg must be 'self'";
    ParseMixedReturns = 21, "PARSE_MIXED_RETURNS", "file:{0}:{1}: Syntax Error, all returns in a function must return a value or return nothing";
    ParseClassAllStatementsInFunctions = 22, "PARSE_CLASS_ALL_STATEMENTS_IN_FUNCTIONS", "file:{0}:{1}: Syntax Error, in classes all statements must be in methods";
    ParseClassNoBasesAllowed = 23, "PARSE_CLASS_NO_BASES_ALLOWED", "file:{0}:{1}: Syntax Error, base classes are not allowed in Ed.Py";
    ParseConstNotInt = 24, "PARSE_CONST_NOT_INT", "file:{0}:{1}: Syntax Error, constant {2} must be an integer value";

    OptStart = 25, "OPT_START", "Starting optimisation passes";
    OptReservedName = 26, "OPT_RESERVED_NAME", "file:{0}:: Syntax Error, {1} is a reserved name";
    OptIncorrectArgUse = 27, "OPT_INCORRECT_ARG_USE", "file:{0}:: Syntax Error, incorrect arguments used in {1} call";
    OptIncorrectArgDefine = 28, "OPT_INCORRECT_ARG_DEFINE", "file:{0}:: Syntax Error, in function {1} argument definition doesn't match callers use";
    OptVarNotBound = 29, "OPT_VAR_NOT_BOUND", "file:{0}:: Syntax Error, Variable {1} doesn't have a value yet";
    OptVarNotInt = 30, "OPT_VAR_NOT_INT", "file:{0}:: Syntax Error, Variable {1} is not an integer value";
    OptVarTypeChanged = 31, "OPT_VAR_TYPE_CHANGED", "file:{0}:: Syntax Error, Variable {1} changed it's type";
    OptStringNotAllowed = 32, "OPT_STRING_NOT_ALLOWED", "file:{0}:: Syntax Error, String not allowed here";
    OptListNotAllowed = 33, "OPT_LIST_NOT_ALLOWED", "file:{0}:: Syntax Error, List not allowed here";
    OptClassInitError = 34, "OPT_CLASS_INIT_ERROR", "file:0:: SyntaxError, Class {0} missing __init__ method";
    OptClassDataError = 35, "OPT_CLASS_DATA_ERROR", "file:0:: SyntaxError, Function {0}.{1} used {2} which was not created in {0}.__init__";
    OptNotClassRef = 36, "OPT_NOT_CLASS_REF", "file:{0}:: Syntax Error, Variable {1} does not refer to a class";
    OptNotAssignable = 37, "OPT_NOT_ASSIGNABLE", "file:{0}:: Syntax Error, no assignable variable";
    OptSliceNotAllowed = 38, "OPT_SLICE_NOT_ALLOWED", "file:{0}:: Syntax Error, Variable {1} can't be sliced";
    OptLclHidesGlb = 39, "OPT_LCL_HIDES_GLB", "file:{0}:: Syntax Error, Variable {1} hides a global variable";
    OptNotAGlobalVar = 40, "OPT_NOT_A_GLOBAL_VAR", "file:{0}:: Syntax Error, {1} is not a global variable";
    OptWriteToEdPyConstant = 41, "OPT_WRITE_TO_ED_PY_CONSTANT", "file:{0}:: Syntax Error, Ed.Py constant {1} can not be written";
    OptFunctionNotDefined = 42, "OPT_FUNCTION_NOT_DEFINED", "file::: Syntax Error, called function {0} not defined";
    OptNotSupported = 43, "OPT_NOT_SUPPORTED", "file:{0}:: Syntax Error, {1} not supported in Ed.py";
    OptVarMustBeTsOrList = 44, "OPT_VAR_MUST_BE_TS_OR_LIST", "file:{0}:: Syntax Error, variable {1} not a tunestring or list";
    OptOnlyAtTopLevel = 45, "OPT_ONLY_AT_TOP_LEVEL", "file:{0}:: Syntax Error, {1} only allowed at the top level";
    OptSelfNotInMethod = 46, "OPT_SELF_NOT_IN_METHOD", "file:0:: SyntaxError, Function {0} not a method so can't use self in {1}";
    OptUnknownFunction = 47, "OPT_UNKNOWN_FUNCTION", "file:{0}:: Syntax Error, Unknown function {1}";
    OptUnknownEdFunction = 48, "OPT_UNKNOWN_ED_FUNCTION", "file:{0}:: Syntax Error, Unknown Ed function {1}";
    OptMissingEdImport = 49, "OPT_MISSING_ED_IMPORT", "file:{0}:: Syntax Error, Ed function {1} not known. Are you missing 'import Ed'?";
    OptConstantTooNegative = 50, "OPT_CONSTANT_TOO_NEGATIVE", "file:{0}:: Syntax Error, constant {1} is out of range";
    OptConstantTooPositive = 51, "OPT_CONSTANT_TOO_POSITIVE", "file:{0}:: Syntax Error, constant {1} is out of range";
    OptEdAssignNotConstant = 52, "OPT_ED_ASSIGN_NOT_CONSTANT", "file:{0}:: Syntax Error, {1} can only be set to an integer constant";
    OptEdAssignAgain = 53, "OPT_ED_ASSIGN_AGAIN", "file:{0}:: Syntax Error, {1} can only be set once. It was already set.";
    OptEdAssignBadValue = 54, "OPT_ED_ASSIGN_BAD_VALUE", "file:{0}:: Syntax Error, set {1} to an invalid value";
    OptEdAssignNotSet = 55, "OPT_ED_ASSIGN_NOT_SET", "file:{0}:: Syntax Error, {1} was not set in __main__";
    OptEdAssignInFunction = 56, "OPT_ED_ASSIGN_IN_FUNCTION", "file:{0}:: Syntax Error, {1} can only be set in __main__";
    OptEdFunctionNotAvailable = 57, "OPT_ED_FUNCTION_NOT_AVAILABLE", "file:{0}:: Syntax Error, {1} is not available in Edison Version {2}";
    OptEdFunctionNotUseful = 58, "OPT_ED_FUNCTION_NOT_USEFUL", "file:{0}:: Syntax Error, {1} is not useful with setting {2}";
    OptEdWarnTunestringEnd = 59, "OPT_ED_WARN_TUNESTRING_END", "file:{0}:: Warning, TuneString doesn't end with 'z'";
    OptEdListTooLong = 60, "OPT_ED_LIST_TOO_LONG", "file:{0}:: Syntax Error, {1} initial value larger then first argument {2}";
    OptBadEventNumber = 61, "OPT_BAD_EVENT_NUMBER", "file:{0}:: Syntax Error, event not a constant or out of range";

    CmpStart = 62, "CMP_START", "Starting compiler passes";
    CmpInternalError = 63, "CMP_INTERNAL_ERROR", "file::: Compiler internal error {0}";
    CmpVarNotBound = 64, "CMP_VAR_NOT_BOUND", "file::: Syntax Error, Problem with variable {0} ({1})";

    AsmStart = 65, "ASM_START", "Starting assembler";
    AsmMemOverflow = 66, "ASM_MEM_OVERFLOW", "file::: Overflowed {0} memory";
    AsmInternalError = 67, "ASM_INTERNAL_ERROR", "file::: Assembler internal error {0}";
}

/// Accumulated output for the JSON sink.
#[derive(Debug, Clone, Serialize)]
pub struct JsonOutput {
    pub error: bool,
    pub messages: Vec<String>,
    #[serde(rename = "wavFilename")]
    pub wav_filename: Option<String>,
}

/// The diagnostic sink. Append-only; collects messages until the process
/// exits. Passed by `&mut` to every pass.
pub struct DiagSink {
    sink: SinkKind,
    max_level: Level,
    dump_mask: u32,
    reraise: bool,
    error_raised: bool,
    output_string: String,
    /// Test-sink lines, also kept for in-process assertions.
    test_lines: Vec<String>,
    json: JsonOutput,
    /// Per-kind format overrides from the language file.
    overrides: HashMap<Kind, String>,
    /// Context strings shown before raw errors (most general first).
    context: Vec<String>,
}

impl Default for DiagSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagSink {
    pub fn new() -> Self {
        DiagSink {
            sink: SinkKind::Console,
            max_level: Level::Verbose,
            dump_mask: 0,
            reraise: false,
            error_raised: false,
            output_string: String::new(),
            test_lines: Vec::new(),
            json: JsonOutput {
                error: false,
                messages: Vec::new(),
                wav_filename: None,
            },
            overrides: HashMap::new(),
            context: Vec::new(),
        }
    }

    pub fn set_sink(&mut self, sink: SinkKind) {
        self.sink = sink;
    }

    pub fn set_max_level(&mut self, level: Level) {
        self.max_level = level;
    }

    pub fn set_dump_mask(&mut self, mask: u32) {
        self.dump_mask = mask;
    }

    pub fn dump_mask(&self) -> u32 {
        self.dump_mask
    }

    pub fn set_reraise(&mut self, reraise: bool) {
        self.reraise = reraise;
    }

    pub fn reraise(&self) -> bool {
        self.reraise
    }

    pub fn was_error_raised(&self) -> bool {
        self.error_raised
    }

    pub fn output_as_string(&self) -> &str {
        &self.output_string
    }

    pub fn test_lines(&self) -> &[String] {
        &self.test_lines
    }

    pub fn force_json_error(&mut self, error: bool) {
        self.json.error = error;
    }

    pub fn set_wav_filename(&mut self, name: &str) {
        self.json.wav_filename = Some(name.to_string());
    }

    /// Load per-kind format overrides from a TOML language file body.
    /// Unknown keys are ignored (newer language files stay loadable).
    pub fn load_language(&mut self, body: &str) -> Result<(), String> {
        let table: toml::Table = body
            .parse()
            .map_err(|e| format!("bad language file: {}", e))?;
        for (key, value) in table {
            if let (Some(kind), Some(text)) = (Kind::from_name(&key), value.as_str()) {
                self.overrides.insert(kind, text.to_string());
            }
        }
        Ok(())
    }

    /// Set one level of raw-error context (1-based; more specific levels
    /// replace their slot, shallower levels drop deeper ones).
    pub fn set_error_context(&mut self, level: usize, text: &str) {
        if level == 0 {
            return;
        }
        self.context.truncate(level - 1);
        while self.context.len() < level - 1 {
            self.context.push(String::new());
        }
        self.context.push(text.to_string());
    }

    pub fn error(&mut self, kind: Kind, args: &[&dyn Display]) {
        self.error_raised = true;
        self.emit(Level::Error, kind, args);
    }

    pub fn warning(&mut self, kind: Kind, args: &[&dyn Display]) {
        self.emit(Level::Warn, kind, args);
    }

    pub fn top(&mut self, kind: Kind, args: &[&dyn Display]) {
        self.emit(Level::Top, kind, args);
    }

    pub fn info(&mut self, kind: Kind, args: &[&dyn Display]) {
        self.emit(Level::Info, kind, args);
    }

    pub fn verbose(&mut self, kind: Kind, args: &[&dyn Display]) {
        self.emit(Level::Verbose, kind, args);
    }

    /// Untranslated debug text, console only.
    pub fn debug_raw(&mut self, text: &str) {
        if self.max_level >= Level::Debug
            && matches!(self.sink, SinkKind::Console | SinkKind::Both)
        {
            println!("**DebugRaw**: {}", text);
        }
    }

    /// Untranslated error text (internal problems), console only, with the
    /// recorded context chain.
    pub fn error_raw(&mut self, text: &str) {
        self.error_raised = true;
        if matches!(self.sink, SinkKind::Console | SinkKind::Both) {
            for (i, ctx) in self.context.iter().enumerate() {
                if !ctx.is_empty() {
                    eprintln!("**ErrorRaw** - Context: {} {}", i, ctx);
                }
            }
            eprintln!("**ErrorRaw**: {}", text);
        }
    }

    fn emit(&mut self, level: Level, kind: Kind, args: &[&dyn Display]) {
        if level > self.max_level {
            return;
        }

        let format = self
            .overrides
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.raw_format());
        let text = format!("{}: {}", level.prefix(), substitute(format, args));

        if self.output_string.is_empty() {
            self.output_string.push('|');
        }
        self.output_string.push_str(&text);
        self.output_string.push('|');

        match self.sink {
            SinkKind::Console => println!("{}", text),
            SinkKind::Json => self.json_out(level, text),
            SinkKind::Both => {
                println!("{}", text);
                self.json_out(level, text);
            }
            SinkKind::Test => {
                let mut line = format!("{},{}", level as u8, kind as u32);
                for a in args {
                    line.push(',');
                    line.push_str(&a.to_string());
                }
                println!("{}", line);
                self.test_lines.push(line);
            }
        }
    }

    fn json_out(&mut self, level: Level, text: String) {
        if level == Level::Error {
            self.json.error = true;
        }
        self.json.messages.push(text);
    }

    /// Print the accumulated JSON object, for the JSON/BOTH sinks.
    pub fn flush(&self) {
        if matches!(self.sink, SinkKind::Json | SinkKind::Both) {
            println!("{}", self.to_json());
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.json).expect("json output is always serializable")
    }
}

/// Substitute `{0}`-style placeholders. `{{` escapes a literal brace.
fn substitute(format: &str, args: &[&dyn Display]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            out.push('{');
            continue;
        }
        let mut num = String::new();
        for d in chars.by_ref() {
            if d == '}' {
                break;
            }
            num.push(d);
        }
        match num.parse::<usize>() {
            Ok(i) if i < args.len() => out.push_str(&args[i].to_string()),
            _ => {
                out.push('{');
                out.push_str(&num);
                out.push('}');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_numbers_are_stable() {
        assert_eq!(Kind::SpecialFail as u32, 0);
        assert_eq!(Kind::ParseStart as u32, 9);
        assert_eq!(Kind::OptStart as u32, 25);
        assert_eq!(Kind::OptVarTypeChanged as u32, 31);
        assert_eq!(Kind::OptEdListTooLong as u32, 60);
        assert_eq!(Kind::AsmInternalError as u32, 67);
    }

    #[test]
    fn substitute_fills_positionals() {
        assert_eq!(
            substitute("file:{0}:{1}: Syntax error", &[&3, &"7"]),
            "file:3:7: Syntax error"
        );
        assert_eq!(substitute("{{literal}}", &[]), "{literal}");
    }

    #[test]
    fn test_sink_records_kind_numbers() {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Test);
        d.error(Kind::OptVarTypeChanged, &[&4, &"x"]);
        assert_eq!(d.test_lines(), &["0,31,4,x".to_string()]);
        assert!(d.was_error_raised());
    }

    #[test]
    fn json_sink_accumulates() {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Json);
        d.error(Kind::OptStringNotAllowed, &[&12]);
        d.set_wav_filename("tok123.wav");
        let json = d.to_json();
        assert!(json.contains("\"error\":true"));
        assert!(json.contains("tok123.wav"));
    }

    #[test]
    fn levels_filter() {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Test);
        d.set_max_level(Level::Error);
        d.top(Kind::OptStart, &[]);
        assert!(d.test_lines().is_empty());
    }

    #[test]
    fn language_override_applies() {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Json);
        d.load_language("OPT_STRING_NOT_ALLOWED = \"ligne {0}: chaine interdite\"\n")
            .unwrap();
        d.error(Kind::OptStringNotAllowed, &[&5]);
        assert!(d.to_json().contains("ligne 5: chaine interdite"));
    }
}
