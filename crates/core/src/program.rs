//! Intermediate representation for Ed.Py programs
//!
//! The parser lowers source text into this three-address form; the optimiser
//! rewrites it in place and the code generator consumes it. Functions refer
//! to each other by name (no back-pointers), so reachability is a name
//! traversal over `calls_to`.

use indexmap::IndexMap;
use std::fmt;

/// Marker returned by a stage that has already reported its diagnostics.
///
/// The message content lives in the `DiagSink`; this only says which stage
/// gave up so the pipeline can stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageError {
    Parse,
    Optimise,
    Compile,
    Assemble,
}

/// Signed word range accepted by the target VM.
pub const MIN_WORD: i64 = -0x7fff;
pub const MAX_WORD: i64 = 0x7fff;

/// Single-letter type tag attached to variables and signature slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Integer
    Int,
    /// String constant (extra carries the length)
    Str,
    /// Integer-list constant (vector)
    Vector,
    /// Tune-string reference
    Tune,
    /// List reference
    List,
    /// Object reference (extra carries the class name)
    Object,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            TypeTag::Int => 'I',
            TypeTag::Str => 'S',
            TypeTag::Vector => 'V',
            TypeTag::Tune => 'T',
            TypeTag::List => 'L',
            TypeTag::Object => 'O',
        };
        write!(f, "{}", c)
    }
}

/// Extra payload carried next to a type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TypeExtra {
    #[default]
    None,
    /// String length (for `S`)
    Len(i64),
    /// Class name (for `O`)
    Class(String),
}

/// A type tag plus its extra payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub tag: TypeTag,
    pub extra: TypeExtra,
}

impl TypeInfo {
    pub fn plain(tag: TypeTag) -> Self {
        TypeInfo {
            tag,
            extra: TypeExtra::None,
        }
    }

    pub fn int() -> Self {
        Self::plain(TypeTag::Int)
    }

    pub fn str_of_len(len: i64) -> Self {
        TypeInfo {
            tag: TypeTag::Str,
            extra: TypeExtra::Len(len),
        }
    }

    pub fn object_of(class: &str) -> Self {
        TypeInfo {
            tag: TypeTag::Object,
            extra: TypeExtra::Class(class.to_string()),
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.extra {
            TypeExtra::None => write!(f, "{}", self.tag),
            TypeExtra::Len(n) => write!(f, "{}({})", self.tag, n),
            TypeExtra::Class(c) => write!(f, "{}({})", self.tag, c),
        }
    }
}

/// One slot of a function signature.
#[derive(Debug, Clone, PartialEq)]
pub enum SigParam {
    /// Must match this tag; the extra is compared only when present.
    Exact(TypeInfo),
    /// Any of the listed tags is acceptable (`len` is the one user).
    AnyOf(&'static [TypeTag]),
}

impl SigParam {
    pub fn int() -> Self {
        SigParam::Exact(TypeInfo::int())
    }

    /// Does a concrete argument type satisfy this slot?
    pub fn accepts(&self, arg: &TypeInfo) -> bool {
        match self {
            SigParam::Exact(want) => match &want.extra {
                TypeExtra::None => want.tag == arg.tag,
                _ => want == arg,
            },
            SigParam::AnyOf(tags) => tags.contains(&arg.tag),
        }
    }
}

/// Numbered temporaries. Simple temps live within one source line (Marker
/// region); loop-control temps live across a single control construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Temp {
    Simple(u32),
    LoopCtl(u32),
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Temp::Simple(n) => write!(f, "TEMP-{}", n),
            Temp::LoopCtl(n) => write!(f, "LTEMP-{}", n),
        }
    }
}

/// The name part of a simple variable: a user identifier (possibly dotted,
/// e.g. `obj.field`) or a numbered temporary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarName {
    User(String),
    Temp(Temp),
}

impl VarName {
    pub fn user(name: &str) -> Self {
        VarName::User(name.to_string())
    }

    pub fn as_user(&self) -> Option<&str> {
        match self {
            VarName::User(s) => Some(s),
            VarName::Temp(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, VarName::Temp(_))
    }

    pub fn is_simple_temp(&self) -> bool {
        matches!(self, VarName::Temp(Temp::Simple(_)))
    }
}

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarName::User(s) => write!(f, "{}", s),
            VarName::Temp(t) => write!(f, "{}", t),
        }
    }
}

/// Index of a slice access: a constant or a variable (possibly a temp).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SliceIndex {
    Const(i64),
    Var(VarName),
}

/// The universal rvalue/lvalue token. Exactly one shape is populated by
/// construction; a `Value` used as a STORE can not be a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer constant
    Int(i64),
    /// String constant (length 1 is also a "character")
    Str(String),
    /// Integer-list constant
    IntList(Vec<i64>),
    /// Reference to a tune-string variable
    TuneRef(String),
    /// Reference to a list variable
    ListRef(String),
    /// Reference to an object variable
    ObjRef(String),
    /// Simple variable
    Var(VarName),
    /// Slice access `name[index]`
    Slice { name: String, index: SliceIndex },
}

impl Value {
    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn var(name: &str) -> Self {
        Value::Var(VarName::user(name))
    }

    pub fn temp(n: u32) -> Self {
        Value::Var(VarName::Temp(Temp::Simple(n)))
    }

    pub fn loop_temp(n: u32) -> Self {
        Value::Var(VarName::Temp(Temp::LoopCtl(n)))
    }

    pub fn slice_const(name: &str, index: i64) -> Self {
        Value::Slice {
            name: name.to_string(),
            index: SliceIndex::Const(index),
        }
    }

    pub fn slice_var(name: &str, index: VarName) -> Self {
        Value::Slice {
            name: name.to_string(),
            index: SliceIndex::Var(index),
        }
    }

    pub fn is_int_const(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_str_const(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn as_str_const(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_list_const(&self) -> bool {
        matches!(self, Value::IntList(_))
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Value::TuneRef(_) | Value::ListRef(_) | Value::ObjRef(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Str(_) | Value::IntList(_))
    }

    pub fn is_simple_var(&self) -> bool {
        matches!(self, Value::Var(_))
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, Value::Slice { .. })
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Value::Var(VarName::Temp(_)))
    }

    pub fn is_simple_temp(&self) -> bool {
        matches!(self, Value::Var(VarName::Temp(Temp::Simple(_))))
    }

    pub fn is_slice_with_simple_temp_index(&self) -> bool {
        matches!(
            self,
            Value::Slice {
                index: SliceIndex::Var(VarName::Temp(Temp::Simple(_))),
                ..
            }
        )
    }

    pub fn is_slice_with_var_index(&self) -> bool {
        matches!(
            self,
            Value::Slice {
                index: SliceIndex::Var(VarName::User(_)),
                ..
            }
        )
    }

    /// Can this value appear as the target of an assignment?
    pub fn is_assignable(&self) -> bool {
        !(self.is_ref() || self.is_constant())
    }

    /// The variable name, for diagnostics. Constants render as `????` like
    /// an unknown.
    pub fn display_name(&self) -> String {
        match self {
            Value::Int(_) | Value::Str(_) | Value::IntList(_) => "????".to_string(),
            Value::TuneRef(n) | Value::ListRef(n) | Value::ObjRef(n) => n.clone(),
            Value::Var(n) => n.to_string(),
            Value::Slice { name, index } => match index {
                SliceIndex::Const(c) => format!("{}[{}]", name, c),
                SliceIndex::Var(v) => format!("{}[{}]", name, v),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Identity
    UAdd,
    USub,
    Invert,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitAnd,
    BitXor,
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtE | BinOp::Gt | BinOp::GtE
        )
    }
}

/// Which control construct a marker pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    If,
    While,
    For,
    And,
    Or,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlKind::If => "If",
            ControlKind::While => "While",
            ControlKind::For => "For",
            ControlKind::And => "And",
            ControlKind::Or => "Or",
        };
        write!(f, "{}", s)
    }
}

/// Which edge of a control region a ControlMarker marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEnd {
    Start,
    Else,
    End,
}

impl fmt::Display for ControlEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlEnd::Start => "start",
            ControlEnd::Else => "else",
            ControlEnd::End => "end",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopModKind {
    Pass,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolCheckOp {
    And,
    Or,
    /// Finalise: store the non-short-circuit default into the target.
    Done,
}

/// Iteration source of a `ForControl`.
#[derive(Debug, Clone, PartialEq)]
pub enum ForIter {
    /// `for x in array` — the value is a slice of the array indexed by the
    /// loop-control temp.
    Array(Value),
    /// `for i in range(limit)`
    Range { limit: Value, current: Value },
}

/// One record of a function body.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Boundary between source statements; anchors diagnostics and scopes
    /// simple temps.
    Marker { line: u32, col: u32 },
    ControlMarker {
        num: u32,
        kind: ControlKind,
        end: ControlEnd,
    },
    LoopControl {
        num: u32,
        kind: ControlKind,
        test: Value,
    },
    LoopModifier {
        num: u32,
        kind: LoopModKind,
    },
    ForControl {
        num: u32,
        iter: ForIter,
    },
    BoolCheck {
        num: u32,
        op: BoolCheckOp,
        value: Value,
        target: Value,
    },
    UAssign {
        target: Value,
        op: UnaryOp,
        operand: Value,
    },
    BAssign {
        target: Value,
        left: Value,
        op: BinOp,
        right: Value,
    },
    Call {
        target: Option<Value>,
        name: String,
        args: Vec<Value>,
    },
    Return { value: Option<Value> },
}

impl Op {
    pub fn marker(line: u32, col: u32) -> Self {
        Op::Marker { line, col }
    }

    /// All values this op reads.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Op::Marker { .. } | Op::ControlMarker { .. } | Op::LoopModifier { .. } => vec![],
            Op::LoopControl { test, .. } => vec![test],
            Op::ForControl { iter, .. } => match iter {
                ForIter::Array(v) => vec![v],
                ForIter::Range { limit, current } => vec![limit, current],
            },
            Op::BoolCheck { value, .. } => vec![value],
            Op::UAssign { operand, .. } => vec![operand],
            Op::BAssign { left, right, .. } => vec![left, right],
            Op::Call { args, .. } => args.iter().collect(),
            Op::Return { value } => value.iter().collect(),
        }
    }

    /// The value this op writes, if any.
    pub fn target(&self) -> Option<&Value> {
        match self {
            Op::BoolCheck { target, .. } => Some(target),
            Op::UAssign { target, .. } => Some(target),
            Op::BAssign { target, .. } => Some(target),
            Op::Call { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Op::Marker { .. })
    }
}

/// A single function (or class method, named `"Class.method"`).
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub doc_string: String,
    /// True for compiled-in `Ed.*` implementations.
    pub internal: bool,
    /// Global variable names this function may write.
    pub global_access: Vec<String>,
    /// Local variable types (including temps).
    pub local_var: IndexMap<VarName, TypeInfo>,
    pub args: Vec<String>,
    /// Functions called from this function.
    pub calls_to: Vec<String>,
    /// Simple temps needed, numbered `0..max_simple_temps`.
    pub max_simple_temps: u32,
    pub body: Vec<Op>,
    /// Explicit `return <value>` seen.
    pub returns_value: bool,
    /// Explicit bare `return` seen.
    pub returns_none: bool,
}

impl Function {
    pub fn new(name: &str, internal: bool) -> Self {
        Function {
            name: name.to_string(),
            doc_string: String::new(),
            internal,
            global_access: Vec::new(),
            local_var: IndexMap::new(),
            args: Vec::new(),
            calls_to: Vec::new(),
            max_simple_temps: 0,
            body: Vec::new(),
            returns_value: false,
            returns_none: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub doc_string: String,
    /// Method names in definition order.
    pub func_names: Vec<String>,
}

impl Class {
    pub fn new(name: &str) -> Self {
        Class {
            name: name.to_string(),
            doc_string: String::new(),
            func_names: Vec::new(),
        }
    }
}

/// The entry function name.
pub const MAIN: &str = "__main__";

/// The whole program. All maps iterate in insertion order so that pass
/// output and emitted offsets are stable across runs.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: IndexMap<String, Function>,
    pub classes: IndexMap<String, Class>,
    pub imports: Vec<String>,
    pub global_var: IndexMap<String, TypeInfo>,
    pub signatures: IndexMap<String, Vec<SigParam>>,
    /// handler function name -> event code
    pub event_handlers: IndexMap<String, i64>,
    /// `Ed.*` program variable -> its verified constant
    pub ed_variables: IndexMap<String, i64>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        let mut functions = IndexMap::new();
        functions.insert(MAIN.to_string(), Function::new(MAIN, false));
        Program {
            functions,
            classes: IndexMap::new(),
            imports: Vec::new(),
            global_var: IndexMap::new(),
            signatures: IndexMap::new(),
            event_handlers: IndexMap::new(),
            ed_variables: IndexMap::new(),
        }
    }

    pub fn main(&mut self) -> &mut Function {
        self.functions.get_mut(MAIN).expect("main function always exists")
    }

    /// Dump the full program to stdout, for the `-d` debug masks.
    pub fn dump(&self, filter_out_internals: bool) {
        println!("Program");
        println!("  Edison variables: {:?}", self.ed_variables);
        println!("  Imports: {:?}", self.imports);
        println!("  Globals: {:?}", self.global_var);
        println!("  Classes: {:?}", self.classes.keys().collect::<Vec<_>>());
        println!("  Event handlers: {:?}", self.event_handlers);
        for (name, f) in &self.functions {
            if filter_out_internals && f.internal {
                continue;
            }
            println!("\n  {}", name);
            println!("    Args: {:?}", f.args);
            if let Some(sig) = self.signatures.get(name) {
                println!("    Signature: {:?}", sig);
            }
            println!("    Globals can write: {:?}", f.global_access);
            println!("    Local vars: {:?}", f.local_var);
            println!("    Max simple temps: {}", f.max_simple_temps);
            println!("    Functions called: {:?}", f.calls_to);
            for op in &f.body {
                if op.is_marker() {
                    println!();
                }
                println!("      {:?}", op);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_shapes_are_disjoint() {
        let c = Value::int(7);
        assert!(c.is_int_const() && c.is_constant());
        assert!(!c.is_simple_var() && !c.is_slice() && !c.is_ref());
        assert!(!c.is_assignable());

        let v = Value::var("speed");
        assert!(v.is_simple_var() && v.is_assignable());
        assert!(!v.is_temp());

        let t = Value::temp(3);
        assert!(t.is_simple_temp() && t.is_temp());

        let lt = Value::loop_temp(1);
        assert!(lt.is_temp() && !lt.is_simple_temp());
    }

    #[test]
    fn slice_index_predicates() {
        let s = Value::slice_var("data", VarName::Temp(Temp::Simple(0)));
        assert!(s.is_slice());
        assert!(s.is_slice_with_simple_temp_index());
        assert!(!s.is_slice_with_var_index());

        let s = Value::slice_var("data", VarName::user("i"));
        assert!(s.is_slice_with_var_index());

        let s = Value::slice_const("data", 4);
        assert!(!s.is_slice_with_var_index());
        assert_eq!(s.display_name(), "data[4]");
    }

    #[test]
    fn op_values_and_target() {
        let op = Op::BAssign {
            target: Value::temp(0),
            left: Value::var("a"),
            op: BinOp::Add,
            right: Value::int(1),
        };
        assert_eq!(op.values().len(), 2);
        assert_eq!(op.target(), Some(&Value::temp(0)));

        let ret = Op::Return { value: None };
        assert!(ret.values().is_empty());
        assert!(ret.target().is_none());
    }

    #[test]
    fn sig_param_matching() {
        let exact = SigParam::Exact(TypeInfo::str_of_len(1));
        assert!(exact.accepts(&TypeInfo::str_of_len(1)));
        assert!(!exact.accepts(&TypeInfo::str_of_len(2)));

        let loose = SigParam::int();
        assert!(loose.accepts(&TypeInfo::int()));

        let any = SigParam::AnyOf(&[TypeTag::Vector, TypeTag::Str, TypeTag::Tune, TypeTag::List]);
        assert!(any.accepts(&TypeInfo::plain(TypeTag::Tune)));
        assert!(!any.accepts(&TypeInfo::int()));
    }

    #[test]
    fn program_starts_with_main() {
        let p = Program::new();
        assert!(p.functions.contains_key(MAIN));
        assert!(!p.functions[MAIN].internal);
    }
}
