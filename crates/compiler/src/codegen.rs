//! Code generator: validated IR to assembler listing
//!
//! Layout first (class records, function frames, global data), then a
//! linear lowering of each function into stack-machine assembler text,
//! then a peephole pass over the listing. The target ABI: callers push a
//! 3-slot return frame, so stack offsets inside a callee shift by +3;
//! comparisons use the negated jump condition because the VM compares
//! operands in the reverse sense; list and tune-string access goes through
//! the index module's cursor/window registers.

use edc_core::diag::{self, DiagSink, Kind};
use edc_core::program::{
    BinOp, BoolCheckOp, ControlEnd, ControlKind, ForIter, LoopModKind, Op, Program, StageError,
    Temp, TypeExtra, TypeInfo, TypeTag, UnaryOp, Value, VarName, MAIN,
};
use edc_core::values::{
    self, CONTROL_INDEX_READ_16BIT, CONTROL_INDEX_READ_8BIT, CONTROL_INDEX_WRITE_16BIT,
    CONTROL_INDEX_WRITE_8BIT,
};
use indexmap::IndexMap;

/// Calls push a 3-slot return frame; locals sit above it inside a callee.
const RETURN_FRAME_OFFSET: i64 = 3;

/// Emit `#`-comment breadcrumbs into the listing.
const VERBOSE: bool = true;

/// Calls lowered inline by the generator; they never become `suba` and
/// their library bodies are never compiled.
const SPECIALLY_HANDLED_FUNCTIONS: &[&str] = &[
    "Ed.List1",
    "Ed.List2",
    "Ed.TuneString1",
    "Ed.TuneString2",
    "ord",
    "chr",
    "len",
    "Ed.ReadModuleRegister8Bit",
    "Ed.ReadModuleRegister16Bit",
    "Ed.WriteModuleRegister8Bit",
    "Ed.WriteModuleRegister16Bit",
    "Ed.ClearModuleRegisterBit",
    "Ed.SetModuleRegisterBit",
    "Ed.AndModuleRegisterBit",
    "Ed.ObjectAddr",
    "Ed.CreateObject",
    "Ed.RegisterEventHandler",
    "Ed.SimpleDriveForwardRight",
    "Ed.SimpleDriveForwardLeft",
    "Ed.SimpleDriveForward",
    "Ed.SimpleDriveBackward",
    "Ed.SimpleDriveBackwardRight",
    "Ed.SimpleDriveBackwardLeft",
    "Ed.SimpleDriveStop",
    "Ed.Drive_INLINE_UNLIMITED",
    "Ed.DriveLeftMotor_INLINE_UNLIMITED",
    "Ed.DriveRightMotor_INLINE_UNLIMITED",
];

type CResult<T> = Result<T, StageError>;

fn compile_error(diag: &mut DiagSink, number: u32, internal: &str) -> StageError {
    if !internal.is_empty() {
        diag.error_raw(internal);
    }
    diag.error(Kind::CmpInternalError, &[&number]);
    StageError::Compile
}

fn bad_variable(diag: &mut DiagSink, variable: &str, problem: &str) -> StageError {
    diag.error(Kind::CmpVarNotBound, &[&variable, &problem]);
    StageError::Compile
}

fn temp_name(t: Temp) -> String {
    match t {
        Temp::Simple(n) => format!("temp-{}", n),
        Temp::LoopCtl(n) => format!("lctl-{}", n),
    }
}

fn var_name_string(vn: &VarName) -> String {
    match vn {
        VarName::User(n) => n.clone(),
        VarName::Temp(t) => temp_name(*t),
    }
}

fn function_label(name: &str) -> String {
    format!("::_fun_{}", name)
}

fn function_end_label(name: &str) -> String {
    format!(":_end_{}", name)
}

fn control_label(num: u32, end: &str) -> String {
    format!(":_Control_{}_{}", num, end)
}

/// Where a value lives and how to address it.
#[derive(Debug, Clone)]
enum VarInfo {
    /// On the stack.
    Local { offset: i64 },
    /// A simple global word.
    Global { name: String },
    /// Global slice indexed by a constant.
    GlobalConst { name: String, size: i64, index: i64 },
    /// Global slice indexed by a variable.
    GlobalVar { name: String, size: i64, index: IndexLoc },
    /// Local slice reference indexed by a constant.
    LocalConst { offset: i64, index: i64 },
    /// Local slice reference indexed by a variable.
    LocalVar { offset: i64, index: IndexLoc },
    /// `self.field` inside a method.
    LocalObj { field_offset: i64 },
    /// `obj.field` through a global object variable.
    GlobalObj { name: String, field_offset: i64 },
}

#[derive(Debug, Clone)]
enum IndexLoc {
    Local { offset: i64 },
    Global { name: String },
}

/// Everything accumulated while lowering: the listing plus the layout maps.
pub struct CompileState {
    pub statements: Vec<String>,
    next_label: u32,
    /// global name -> (slot, type)
    global_var: IndexMap<String, (i64, TypeInfo)>,
    bytes_used: i64,
    words_used: i64,
    /// slice/object name -> element count
    object_size: IndexMap<String, i64>,
    /// event code -> handler name, in registration order
    event_handler: IndexMap<i64, String>,
    /// class -> (words, field -> slot)
    class_layout: IndexMap<String, (i64, IndexMap<String, i64>)>,
    fun_arg_layout: IndexMap<String, Vec<(String, i64)>>,
    fun_var_layout: IndexMap<String, IndexMap<String, i64>>,
    fun_var_info: IndexMap<String, IndexMap<VarName, TypeInfo>>,
    fun_stack_size: IndexMap<String, i64>,
    fun_returns_value: IndexMap<String, bool>,
    control_labels: Vec<String>,
}

impl CompileState {
    fn new() -> Self {
        CompileState {
            statements: Vec::new(),
            next_label: 0,
            global_var: IndexMap::new(),
            bytes_used: 0,
            words_used: 0,
            object_size: IndexMap::new(),
            event_handler: IndexMap::new(),
            class_layout: IndexMap::new(),
            fun_arg_layout: IndexMap::new(),
            fun_var_layout: IndexMap::new(),
            fun_var_info: IndexMap::new(),
            fun_stack_size: IndexMap::new(),
            fun_returns_value: IndexMap::new(),
            control_labels: Vec::new(),
        }
    }

    fn add(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    fn comment(&mut self, text: String) {
        if VERBOSE {
            self.statements.push(format!("# {}", text));
        }
    }

    fn next_internal_label(&mut self) -> String {
        let label = format!(":_int_{:04}", self.next_label);
        self.next_label += 1;
        label
    }

    fn record_control_label(&mut self, label: &str) {
        if !self.control_labels.iter().any(|l| l == label) {
            self.control_labels.push(label.to_string());
        }
    }

    fn dump(&self) {
        println!("CompileState");
        println!("  GlobalVars: {:?}", self.global_var);
        println!("  Internal labels used: {}", self.next_label);
        println!("  Event handlers: {:?}", self.event_handler);
        println!("  Byte data used: {}", self.bytes_used);
        println!("  Word data used: {}", self.words_used);
        println!("  Object size: {:?}", self.object_size);
        println!("  Class layout: {:?}", self.class_layout);
        println!("  Function stack sizes: {:?}", self.fun_stack_size);
        println!("  Statements:");
        for s in &self.statements {
            println!("{}", s);
        }
    }
}

// ===========================================================================
// Layout
// ===========================================================================

/// One word per `self.*` field, in the order `__init__` introduces them.
fn layout_classes(program: &Program, state: &mut CompileState) {
    for (func_name, function) in &program.functions {
        let class_name = match func_name.strip_suffix(".__init__") {
            Some(c) => c.to_string(),
            None => continue,
        };
        let mut words = 0i64;
        let mut layout: IndexMap<String, i64> = IndexMap::new();
        for key in function.local_var.keys() {
            if let Some(name) = key.as_user() {
                if name != "self" && name.starts_with("self.") {
                    layout.insert(name.to_string(), words);
                    words += 1;
                }
            }
        }
        state.class_layout.insert(class_name, (words, layout));
    }
}

/// Frame layout: arguments at 0..k, then named locals, then simple temps;
/// everything shifts by the 3-slot return frame inside a real callee.
fn layout_function_vars(program: &Program, state: &mut CompileState) {
    for (func_name, function) in &program.functions {
        let special = SPECIALLY_HANDLED_FUNCTIONS.contains(&func_name.as_str());
        let frame_shift = if special || func_name == MAIN {
            0
        } else {
            RETURN_FRAME_OFFSET
        };

        let class_fields: Option<&IndexMap<String, i64>> = func_name
            .split_once('.')
            .and_then(|(class, _)| state.class_layout.get(class))
            .map(|(_, fields)| fields);

        let mut arg_layout = Vec::new();
        let mut var_layout: IndexMap<String, i64> = IndexMap::new();
        let mut offset = 0i64;

        for a in &function.args {
            arg_layout.push((a.clone(), offset));
            var_layout.insert(a.clone(), offset + frame_shift);
            offset += 1;
        }

        for key in function.local_var.keys() {
            match key {
                VarName::Temp(Temp::Simple(_)) => continue, // numbered below
                VarName::Temp(t @ Temp::LoopCtl(_)) => {
                    var_layout.insert(temp_name(*t), offset + frame_shift);
                    offset += 1;
                }
                VarName::User(name) => {
                    if function.args.iter().any(|a| a == name) {
                        continue;
                    }
                    if class_fields.is_some_and(|f| f.contains_key(name)) {
                        continue;
                    }
                    if name.contains('.') {
                        continue;
                    }
                    var_layout.insert(name.clone(), offset + frame_shift);
                    offset += 1;
                }
            }
        }

        for t in 0..function.max_simple_temps {
            var_layout.insert(temp_name(Temp::Simple(t)), offset + frame_shift);
            offset += 1;
        }

        // a value-returning leaf still needs one slot for the return
        if offset == 0 && function.returns_value {
            offset = 1;
        }

        state.fun_arg_layout.insert(func_name.clone(), arg_layout);
        state.fun_var_layout.insert(func_name.clone(), var_layout);
        state
            .fun_var_info
            .insert(func_name.clone(), function.local_var.clone());
        state.fun_stack_size.insert(func_name.clone(), offset);
        state
            .fun_returns_value
            .insert(func_name.clone(), function.returns_value);
    }
}

/// Find what main first assigns to a global slice/object, following simple
/// aliases, so its data area can be sized.
fn find_first_assignment(
    program: &Program,
    name: &str,
    tag: TypeTag,
    diag: &mut DiagSink,
) -> CResult<(Value, Option<Value>)> {
    let main = &program.functions[MAIN];

    for op in &main.body {
        if let Op::Call { target: Some(t), name: func, args } = op {
            if let Value::Var(VarName::User(n)) = t {
                if n == name {
                    return match (tag, func.as_str()) {
                        (TypeTag::List, "Ed.List1") => Ok((args[0].clone(), None)),
                        (TypeTag::List, "Ed.List2") => {
                            Ok((args[0].clone(), Some(args[1].clone())))
                        }
                        (TypeTag::Tune, "Ed.TuneString1") => Ok((args[0].clone(), None)),
                        (TypeTag::Tune, "Ed.TuneString2") => {
                            Ok((args[0].clone(), Some(args[1].clone())))
                        }
                        (TypeTag::Object, "Ed.CreateObject") => Ok((args[0].clone(), None)),
                        _ => Err(compile_error(
                            diag,
                            24,
                            &format!("FirstAssignment for {} found strange call: {}", name, func),
                        )),
                    };
                }
            }
        }
    }

    for op in &main.body {
        if let Op::UAssign { target: Value::Var(VarName::User(n)), operand, .. } = op {
            if n == name {
                if let Value::Var(VarName::User(alias)) = operand {
                    return find_first_assignment(program, alias, tag, diag);
                }
            }
        }
    }

    Err(compile_error(
        diag,
        28,
        &format!("FirstAssignment search for name:{} failed!", name),
    ))
}

/// Emit the DATW/DATB lines for every global and record their slots.
/// `_CALC` always takes word slot 0 as compiler scratch.
fn setup_global_vars(
    program: &Program,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.add("DATW _CALC 0 1");
    state.words_used = 1;
    state.bytes_used = 0;

    for (name, info) in &program.global_var {
        let internal_name = format!("{}-object", name);
        match info.tag {
            TypeTag::Int => {
                state
                    .global_var
                    .insert(name.clone(), (state.words_used, info.clone()));
                if values::is_ed_variable(name) {
                    let init = program.ed_variables[name.as_str()];
                    state.add(format!("DATW {} {} 1 {}", name, state.words_used, init));
                } else {
                    state.add(format!("DATW {} {} 1", name, state.words_used));
                }
                state.words_used += 1;
            }
            TypeTag::Tune => {
                let (size_value, init) =
                    find_first_assignment(program, name, TypeTag::Tune, diag)?;
                let size = size_value
                    .as_int()
                    .ok_or_else(|| compile_error(diag, 25, "tune string size not a constant"))?;
                let start = state.bytes_used;

                match init {
                    Some(Value::Str(s)) => state.add(format!(
                        "DATB {}, {}, {}, \"{}\"",
                        internal_name, start, size, s
                    )),
                    _ => state.add(format!("DATB {}, {}, {}", internal_name, start, size)),
                }
                state.bytes_used += size;

                state
                    .global_var
                    .insert(name.clone(), (state.words_used, info.clone()));
                state.add(format!(
                    "DATW {}, {}, 1, {}",
                    name,
                    state.words_used,
                    start + (size << 8)
                ));
                state.words_used += 1;
                state.object_size.insert(name.clone(), size);
            }
            TypeTag::List => {
                let (size_value, init) =
                    find_first_assignment(program, name, TypeTag::List, diag)?;
                let size = size_value
                    .as_int()
                    .ok_or_else(|| compile_error(diag, 23, "list size not a constant"))?;
                let start = state.words_used;

                match init {
                    Some(Value::IntList(vals)) => {
                        let rendered: Vec<String> =
                            vals.iter().map(|v| v.to_string()).collect();
                        state.add(format!(
                            "DATW {}, {}, {}, {}",
                            internal_name,
                            start,
                            size,
                            rendered.join(", ")
                        ));
                    }
                    _ => state.add(format!("DATW {}, {}, {}", internal_name, start, size)),
                }
                state.words_used += size;

                state
                    .global_var
                    .insert(name.clone(), (state.words_used, info.clone()));
                state.add(format!(
                    "DATW {}, {}, 1, {}",
                    name,
                    state.words_used,
                    start + (size << 8)
                ));
                state.words_used += 1;
                state.object_size.insert(name.clone(), size);
            }
            TypeTag::Object => {
                let (class_value, _) =
                    find_first_assignment(program, name, TypeTag::Object, diag)?;
                let class_name = match class_value {
                    Value::Str(s) => s,
                    _ => return Err(compile_error(diag, 27, "object class not a constant")),
                };
                let size = state
                    .class_layout
                    .get(&class_name)
                    .map(|(words, _)| (*words).max(1))
                    .unwrap_or(1);

                let start = state.words_used;
                state.add(format!(
                    "DATW {}.{}, {}, {}",
                    internal_name, class_name, start, size
                ));
                state.words_used += size;

                state
                    .global_var
                    .insert(name.clone(), (state.words_used, info.clone()));
                state.add(format!("DATW {}, {}, 1, {}", name, state.words_used, start));
                state.words_used += 1;
                state.object_size.insert(name.clone(), size);
            }
            _ => {
                // S and V only exist as call arguments
                return Err(compile_error(
                    diag,
                    29,
                    &format!("Impossible global type - {}", info),
                ));
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Variable access
// ===========================================================================

fn get_variable_info(
    func_name: &str,
    value: &Value,
    state: &CompileState,
    diag: &mut DiagSink,
) -> CResult<VarInfo> {
    let var_name = match value {
        Value::Var(vn) => var_name_string(vn),
        Value::Slice { name, .. } => name.clone(),
        _ => return Err(compile_error(diag, 2, "constant used as a variable")),
    };
    let var_layout = &state.fun_var_layout[func_name];
    let class_name = func_name.split_once('.').map(|(c, _)| c);

    // a dotted name that isn't Ed or self refers into a global object
    if let Some((base, member)) = var_name.split_once('.') {
        if base != "Ed" && base != "self" && !member.is_empty() {
            let (_, info) = state
                .global_var
                .get(base)
                .ok_or_else(|| bad_variable(diag, &var_name, "unknown class"))?;
            if info.tag != TypeTag::Object {
                return Err(bad_variable(diag, &var_name, "not an object"));
            }
            let obj_class = match &info.extra {
                TypeExtra::Class(c) => c.clone(),
                _ => return Err(bad_variable(diag, &var_name, "not an object")),
            };
            let (_, fields) = state
                .class_layout
                .get(&obj_class)
                .ok_or_else(|| bad_variable(diag, &var_name, "unknown class"))?;
            let field_key = format!("self.{}", member);
            let field_offset = *fields
                .get(&field_key)
                .ok_or_else(|| bad_variable(diag, member, "not in the class"))?;
            return Ok(VarInfo::GlobalObj {
                name: base.to_string(),
                field_offset,
            });
        }
    }

    if var_name.starts_with("self.") {
        let class = class_name.ok_or_else(|| bad_variable(diag, &var_name, "not in a method"))?;
        let (_, fields) = state
            .class_layout
            .get(class)
            .ok_or_else(|| bad_variable(diag, &var_name, "unknown class"))?;
        let field_offset = *fields
            .get(&var_name)
            .ok_or_else(|| bad_variable(diag, &var_name, "not in the class"))?;
        return Ok(VarInfo::LocalObj { field_offset });
    }

    if let Some(offset) = var_layout.get(&var_name) {
        let offset = *offset;
        return match value {
            Value::Slice { index, .. } => match index {
                edc_core::program::SliceIndex::Const(c) => {
                    Ok(VarInfo::LocalConst { offset, index: *c })
                }
                edc_core::program::SliceIndex::Var(ivn) => {
                    let index_name = var_name_string(ivn);
                    if let Some(i_offset) = var_layout.get(&index_name) {
                        Ok(VarInfo::LocalVar {
                            offset,
                            index: IndexLoc::Local { offset: *i_offset },
                        })
                    } else if state.global_var.contains_key(&index_name) {
                        Ok(VarInfo::LocalVar {
                            offset,
                            index: IndexLoc::Global { name: index_name },
                        })
                    } else {
                        Err(bad_variable(diag, &index_name, "bad index"))
                    }
                }
            },
            _ => Ok(VarInfo::Local { offset }),
        };
    }

    if state.global_var.contains_key(&var_name) {
        return match value {
            Value::Slice { index, .. } => {
                let size = state.object_size.get(&var_name).copied().unwrap_or(1);
                match index {
                    edc_core::program::SliceIndex::Const(c) => Ok(VarInfo::GlobalConst {
                        name: var_name,
                        size,
                        index: *c,
                    }),
                    edc_core::program::SliceIndex::Var(ivn) => {
                        let index_name = var_name_string(ivn);
                        if let Some(i_offset) = var_layout.get(&index_name) {
                            Ok(VarInfo::GlobalVar {
                                name: var_name,
                                size,
                                index: IndexLoc::Local { offset: *i_offset },
                            })
                        } else if state.global_var.contains_key(&index_name) {
                            Ok(VarInfo::GlobalVar {
                                name: var_name,
                                size,
                                index: IndexLoc::Global { name: index_name },
                            })
                        } else {
                            Err(bad_variable(diag, &index_name, "bad index"))
                        }
                    }
                }
            }
            _ => Ok(VarInfo::Global { name: var_name }),
        };
    }

    Err(bad_variable(diag, &var_name, "unknown variable"))
}

/// Compute a slice element address into the index-module cursor: base plus
/// index, narrowed to a byte.
fn index_cursor_sequence(state: &mut CompileState, cursor: &str) {
    state.add("convl");
    state.add(format!("movb %_cpu:acc %_index:{}", cursor));
}

fn load_word_variable_into_acc(
    value: &Value,
    func_name: &str,
    state: &mut CompileState,
    stack_offset: i64,
    diag: &mut DiagSink,
) -> CResult<()> {
    let info = get_variable_info(func_name, value, state, diag)?;
    match info {
        VarInfo::Local { offset } => {
            state.add(format!("straw ${}", offset + stack_offset));
        }
        VarInfo::Global { name } => {
            state.add(format!("movw @{} %_cpu:acc", name));
        }
        VarInfo::GlobalConst { name, index, .. } => {
            state.add(format!("movw @{} %_cpu:acc", name));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
        VarInfo::GlobalVar { name, index, .. } => {
            match index {
                IndexLoc::Local { offset } => {
                    state.add(format!("straw ${}", offset + stack_offset));
                }
                IndexLoc::Global { name } => {
                    state.add(format!("movw @{} %_cpu:acc", name));
                }
            }
            state.add(format!("addw @{}", name));
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
        VarInfo::LocalConst { offset, index } => {
            state.add(format!("straw ${}", offset + stack_offset));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
        VarInfo::LocalVar { offset, index } => {
            match index {
                IndexLoc::Local { offset } => {
                    state.add(format!("straw ${}", offset + stack_offset));
                }
                IndexLoc::Global { name } => {
                    state.add(format!("movw @{} %_cpu:acc", name));
                }
            }
            state.add("movw %_cpu:acc @_CALC");
            state.add(format!("straw ${}", offset + stack_offset));
            state.add("addw @_CALC");
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
        VarInfo::LocalObj { field_offset } => {
            // self holds the object's base address
            let self_offset = *state.fun_var_layout[func_name]
                .get("self")
                .ok_or_else(|| compile_error(diag, 4, "method frame without self"))?;
            state.add(format!("straw ${}", self_offset + stack_offset));
            if field_offset > 0 {
                state.add(format!("addw ${}", field_offset));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
        VarInfo::GlobalObj { name, field_offset } => {
            state.add(format!("movw @{} %_cpu:acc", name));
            if field_offset > 0 {
                state.add(format!("addw ${}", field_offset));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT));
            state.add("movw %_index:16b1window %_cpu:acc");
        }
    }
    Ok(())
}

fn store_acc_into_word_variable(
    value: &Value,
    func_name: &str,
    state: &mut CompileState,
    stack_offset: i64,
    diag: &mut DiagSink,
) -> CResult<()> {
    let info = get_variable_info(func_name, value, state, diag)?;
    match info {
        VarInfo::Local { offset } => {
            state.add(format!("stwaw ${}", offset + stack_offset));
        }
        VarInfo::Global { name } => {
            state.add(format!("movw %_cpu:acc @{}", name));
        }
        VarInfo::GlobalConst { name, index, .. } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            state.add(format!("movw @{} %_cpu:acc", name));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
        VarInfo::GlobalVar { name, index, .. } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            match index {
                IndexLoc::Local { offset } => {
                    state.add(format!("straw ${}", offset + stack_offset));
                }
                IndexLoc::Global { name } => {
                    state.add(format!("movw @{} %_cpu:acc", name));
                }
            }
            state.add(format!("addw @{}", name));
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
        VarInfo::LocalConst { offset, index } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            state.add(format!("straw ${}", offset + stack_offset));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
        VarInfo::LocalVar { offset, index } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            match index {
                IndexLoc::Local { offset } => {
                    state.add(format!("straw ${}", offset + stack_offset));
                }
                IndexLoc::Global { name } => {
                    state.add(format!("movw @{} %_cpu:acc", name));
                }
            }
            state.add("movw %_cpu:acc @_CALC");
            state.add(format!("straw ${}", offset + stack_offset));
            state.add("addw @_CALC");
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
        VarInfo::LocalObj { field_offset } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            let self_offset = *state.fun_var_layout[func_name]
                .get("self")
                .ok_or_else(|| compile_error(diag, 4, "method frame without self"))?;
            state.add(format!("straw ${}", self_offset + stack_offset));
            if field_offset > 0 {
                state.add(format!("addw ${}", field_offset));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
        VarInfo::GlobalObj { name, field_offset } => {
            state.add("movw %_cpu:acc %_index:16b1window");
            state.add(format!("movw @{} %_cpu:acc", name));
            if field_offset > 0 {
                state.add(format!("addw ${}", field_offset));
            }
            index_cursor_sequence(state, "16b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_16BIT));
        }
    }
    Ok(())
}

/// Byte-wide access is only for tune-string elements (and char constants).
fn load_byte_variable_into_acc(
    value: &Value,
    func_name: &str,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    if let Value::Str(s) = value {
        let c = s.bytes().next().unwrap_or(0);
        state.add(format!("movb ${} %_cpu:acc", c));
        return Ok(());
    }

    let info = get_variable_info(func_name, value, state, diag)?;
    match info {
        VarInfo::GlobalConst { name, index, .. } => {
            state.add(format!("movw @{} %_cpu:acc", name));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_8BIT));
            state.add("movb %_index:8b1window %_cpu:acc");
        }
        VarInfo::GlobalVar { name, index, .. } => {
            match index {
                IndexLoc::Local { offset } => state.add(format!("straw ${}", offset)),
                IndexLoc::Global { name } => state.add(format!("movw @{} %_cpu:acc", name)),
            }
            state.add(format!("addw @{}", name));
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_8BIT));
            state.add("movb %_index:8b1window %_cpu:acc");
        }
        VarInfo::LocalConst { offset, index } => {
            state.add(format!("straw ${}", offset));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_8BIT));
            state.add("movb %_index:8b1window %_cpu:acc");
        }
        VarInfo::LocalVar { offset, index } => {
            match index {
                IndexLoc::Local { offset } => state.add(format!("straw ${}", offset)),
                IndexLoc::Global { name } => state.add(format!("movw @{} %_cpu:acc", name)),
            }
            state.add("movw %_cpu:acc @_CALC");
            state.add(format!("straw ${}", offset));
            state.add("addw @_CALC");
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_READ_8BIT));
            state.add("movb %_index:8b1window %_cpu:acc");
        }
        _ => {
            return Err(compile_error(diag, 17, "Invalid byte variable to load into ACC"));
        }
    }
    Ok(())
}

fn store_acc_into_byte_variable(
    value: &Value,
    func_name: &str,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    let info = get_variable_info(func_name, value, state, diag)?;
    match info {
        VarInfo::Local { offset } => {
            state.add(format!("stwab ${}", offset));
        }
        VarInfo::Global { name } => {
            state.add(format!("movb %_cpu:acc @{}", name));
        }
        VarInfo::GlobalConst { name, index, .. } => {
            state.add("movb %_cpu:acc %_index:8b1window");
            state.add(format!("movw @{} %_cpu:acc", name));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_8BIT));
        }
        VarInfo::GlobalVar { name, index, .. } => {
            state.add("movb %_cpu:acc %_index:8b1window");
            match index {
                IndexLoc::Local { offset } => state.add(format!("straw ${}", offset)),
                IndexLoc::Global { name } => state.add(format!("movw @{} %_cpu:acc", name)),
            }
            state.add(format!("addw @{}", name));
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_8BIT));
        }
        VarInfo::LocalConst { offset, index } => {
            state.add("movb %_cpu:acc %_index:8b1window");
            state.add(format!("straw ${}", offset));
            if index != 0 {
                state.add(format!("addw ${}", index));
            }
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_8BIT));
        }
        VarInfo::LocalVar { offset, index } => {
            state.add("movb %_cpu:acc %_index:8b1window");
            match index {
                IndexLoc::Local { offset } => state.add(format!("straw ${}", offset)),
                IndexLoc::Global { name } => state.add(format!("movw @{} %_cpu:acc", name)),
            }
            state.add("movw %_cpu:acc @_CALC");
            state.add(format!("straw ${}", offset));
            state.add("addw @_CALC");
            index_cursor_sequence(state, "8b1cursor");
            state.add(format!("bitset ${} %_index:action", CONTROL_INDEX_WRITE_8BIT));
        }
        _ => {
            return Err(compile_error(diag, 18, "Invalid byte variable to store ACC into"));
        }
    }
    Ok(())
}

// ===========================================================================
// Op lowering
// ===========================================================================

/// Tune-string element writes move bytes, not words.
fn check_special_uadd(
    program: &Program,
    func_name: &str,
    target: &Value,
    operand: &Value,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<bool> {
    if !target.is_slice() {
        return Ok(false);
    }
    let array_name = match target {
        Value::Slice { name, .. } => name.clone(),
        _ => unreachable!("checked above"),
    };

    let tag = state.fun_var_info[func_name]
        .get(&VarName::user(&array_name))
        .map(|t| t.tag)
        .or_else(|| program.global_var.get(&array_name).map(|t| t.tag));

    if tag != Some(TypeTag::Tune) {
        return Ok(false);
    }

    if let Value::Str(s) = operand {
        if s.len() == 1 {
            let c = s.bytes().next().unwrap_or(0);
            state.add(format!("movb ${} %_cpu:acc", c));
            store_acc_into_byte_variable(target, func_name, state, diag)?;
            return Ok(true);
        }
        return Err(compile_error(
            diag,
            31,
            "1 character string constant or tune string element needed here",
        ));
    }

    if let Value::Slice { name, .. } = operand {
        let operand_tag = state.fun_var_info[func_name]
            .get(&VarName::user(name))
            .map(|t| t.tag)
            .or_else(|| program.global_var.get(name).map(|t| t.tag));
        if operand_tag == Some(TypeTag::Tune) {
            load_byte_variable_into_acc(operand, func_name, state, diag)?;
            store_acc_into_byte_variable(target, func_name, state, diag)?;
            return Ok(true);
        }
        return Err(compile_error(
            diag,
            33,
            "1 character string constant or tune string element needed here",
        ));
    }

    Err(compile_error(
        diag,
        31,
        "1 character string constant or tune string element needed here",
    ))
}

fn compile_uassign(
    program: &Program,
    func_name: &str,
    target: &Value,
    op: UnaryOp,
    operand: &Value,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment(format!("UAssign: {} = {:?} {}", target.display_name(), op, operand.display_name()));

    if op == UnaryOp::UAdd {
        if check_special_uadd(program, func_name, target, operand, state, diag)? {
            return Ok(());
        }

        // global-to-global and constant-to-global moves skip the ACC
        let t_info = get_variable_info(func_name, target, state, diag)?;
        if let VarInfo::Global { name: t_name } = &t_info {
            if let Value::Int(c) = operand {
                state.add(format!("movw ${} @{}", c, t_name));
                return Ok(());
            }
            if operand.is_simple_var() {
                if let VarInfo::Global { name: o_name } =
                    get_variable_info(func_name, operand, state, diag)?
                {
                    state.add(format!("movw @{} @{}", o_name, t_name));
                    return Ok(());
                }
            }
        }
    }

    match operand {
        Value::Int(c) => state.add(format!("movw ${} %_cpu:acc", c)),
        Value::Str(_) => {
            return Err(compile_error(diag, 32, "StrConstant not allowed here"));
        }
        _ => load_word_variable_into_acc(operand, func_name, state, 0, diag)?,
    }

    match op {
        UnaryOp::UAdd => {}
        UnaryOp::USub => state.add("mulw $-1"),
        UnaryOp::Not => {
            let was_zero = state.next_internal_label();
            let end = state.next_internal_label();
            state.add(format!("brz {}", was_zero));
            state.add("movw $0 %_cpu:acc");
            state.add(format!("bra {}", end));
            state.add(was_zero);
            state.add("movw $1 %_cpu:acc");
            state.add(end);
        }
        UnaryOp::Invert => state.add("notw %_cpu:acc"),
    }

    store_acc_into_word_variable(target, func_name, state, 0, diag)
}

fn arithmetic_mnemonic(op: BinOp) -> Option<&'static str> {
    Some(match op {
        BinOp::Add => "addw",
        BinOp::Sub => "subw",
        BinOp::Mult => "mulw",
        BinOp::Div | BinOp::FloorDiv => "divw",
        BinOp::Mod => "modw",
        BinOp::LShift => "shlw",
        BinOp::RShift => "shrw",
        BinOp::BitOr => "orw",
        BinOp::BitXor => "xorw",
        BinOp::BitAnd => "andw",
        _ => return None,
    })
}

/// Materialise the 0/1 result of a comparison. The jump taken is the
/// negation of the requested comparison, and < / <= swap sense because the
/// VM compares right-to-left.
fn finish_compare(op: BinOp, state: &mut CompileState) {
    let no_label = state.next_internal_label();
    let end_label = state.next_internal_label();

    let branch = match op {
        BinOp::Lt => "brle",
        BinOp::LtE => "brl",
        BinOp::Gt => "brge",
        BinOp::GtE => "brgr",
        BinOp::Eq => "brne",
        BinOp::NotEq => "bre",
        _ => unreachable!("comparison ops only"),
    };
    state.add(format!("{} {}", branch, no_label));
    state.add("movw $1 %_cpu:acc");
    state.add(format!("bra {}", end_label));
    state.add(no_label);
    state.add("movw $0 %_cpu:acc");
    state.add(end_label);
}

#[allow(clippy::too_many_arguments)]
fn compile_bassign(
    func_name: &str,
    target: &Value,
    left: &Value,
    op: BinOp,
    right: &Value,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment(format!(
        "BAssign: {} = {} {:?} {}",
        target.display_name(),
        left.display_name(),
        op,
        right.display_name()
    ));

    if let Value::Int(r) = right {
        match left {
            Value::Int(l) => state.add(format!("movw ${} %_cpu:acc", l)),
            _ => load_word_variable_into_acc(left, func_name, state, 0, diag)?,
        }
        if op.is_comparison() {
            state.add(format!("cmpw ${}", r));
            finish_compare(op, state);
        } else {
            let mnemonic = arithmetic_mnemonic(op)
                .ok_or_else(|| compile_error(diag, 6, "Unknown binary op"))?;
            state.add(format!("{} ${}", mnemonic, r));
        }
    } else {
        load_word_variable_into_acc(right, func_name, state, 0, diag)?;
        state.add("movw %_cpu:acc @_CALC");
        match left {
            Value::Int(l) => state.add(format!("movw ${} %_cpu:acc", l)),
            _ => load_word_variable_into_acc(left, func_name, state, 0, diag)?,
        }
        if op.is_comparison() {
            state.add("cmpw @_CALC");
            finish_compare(op, state);
        } else {
            let mnemonic = arithmetic_mnemonic(op)
                .ok_or_else(|| compile_error(diag, 7, "Unknown binary op"))?;
            state.add(format!("{} @_CALC", mnemonic));
        }
    }

    store_acc_into_word_variable(target, func_name, state, 0, diag)
}

// ===========================================================================
// Specially handled (inline) calls
// ===========================================================================

fn modreg_hex(mod_arg: &Value, reg_arg: &Value, diag: &mut DiagSink) -> CResult<String> {
    let (module, register) = match (mod_arg.as_int(), reg_arg.as_int()) {
        (Some(m), Some(r)) => (m, r),
        _ => {
            return Err(compile_error(
                diag,
                12,
                "Can only use constants when reading/writing to module regs",
            ));
        }
    };
    if !(0..=15).contains(&module) {
        return Err(compile_error(diag, 13, "Module constant is out of range"));
    }
    if !(0..=15).contains(&register) {
        return Err(compile_error(diag, 14, "Register constant is out of range"));
    }
    Ok(format!("{:02x}", (module << 4) | register))
}

const LEFT_MOTOR_CONTROL: &str = "%81";
const LEFT_MOTOR_DISTANCE: &str = "%82";
const RIGHT_MOTOR_CONTROL: &str = "%31";
const RIGHT_MOTOR_DISTANCE: &str = "%32";

fn add_inline_drive(
    callee: &str,
    args: &[Value],
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<bool> {
    let motor_stop = values::CONSTANTS["Ed.MOTOR_STOP_CODE"];
    let motor_forward = values::CONSTANTS["Ed.MOTOR_FOR_CODE"];
    let motor_backward = values::CONSTANTS["Ed.MOTOR_BACK_CODE"];

    let direction = args
        .first()
        .and_then(Value::as_int)
        .ok_or_else(|| compile_error(diag, 34, "inline drive needs constant args"))?;
    let speed = args
        .get(1)
        .and_then(Value::as_int)
        .ok_or_else(|| compile_error(diag, 34, "inline drive needs constant args"))?
        .clamp(0, 10);

    let c = &values::CONSTANTS;
    match callee {
        "Ed.Drive_INLINE_UNLIMITED" => {
            let mut left = motor_stop;
            let mut right = motor_stop;
            if direction == c["Ed.FORWARD"] {
                left = motor_forward | speed;
                right = motor_forward | speed;
            } else if direction == c["Ed.BACKWARD"] {
                left = motor_backward | speed;
                right = motor_backward | speed;
            } else if direction == c["Ed.FORWARD_RIGHT"] {
                left = motor_forward | speed;
            } else if direction == c["Ed.BACKWARD_RIGHT"] {
                left = motor_backward | speed;
            } else if direction == c["Ed.FORWARD_LEFT"] {
                right = motor_forward | speed;
            } else if direction == c["Ed.BACKWARD_LEFT"] {
                right = motor_backward | speed;
            } else if direction == c["Ed.SPIN_RIGHT"] {
                left = motor_forward | speed;
                right = motor_backward | speed;
            } else if direction == c["Ed.SPIN_LEFT"] {
                left = motor_backward | speed;
                right = motor_forward | speed;
            }
            state.add(format!("movb ${} {}", left, LEFT_MOTOR_CONTROL));
            state.add(format!("movb ${} {}", right, RIGHT_MOTOR_CONTROL));
            Ok(true)
        }
        "Ed.DriveLeftMotor_INLINE_UNLIMITED" => {
            let mut left = motor_stop;
            if direction == c["Ed.FORWARD"] {
                left = motor_forward | speed;
            } else if direction == c["Ed.BACKWARD"] {
                left = motor_backward | speed;
            }
            state.add(format!("movb ${} {}", left, LEFT_MOTOR_CONTROL));
            Ok(true)
        }
        "Ed.DriveRightMotor_INLINE_UNLIMITED" => {
            let mut right = motor_stop;
            if direction == c["Ed.FORWARD"] {
                right = motor_forward | speed;
            } else if direction == c["Ed.BACKWARD"] {
                right = motor_backward | speed;
            }
            state.add(format!("movb ${} {}", right, RIGHT_MOTOR_CONTROL));
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn add_simple_drive(callee: &str, state: &mut CompileState) -> bool {
    let stop = 0xc0;
    let forward = 0x81;
    let backward = 0x41;

    let pair = match callee {
        "Ed.SimpleDriveStop" => {
            state.add(format!("movb ${} {}", stop, LEFT_MOTOR_CONTROL));
            state.add(format!("movb ${} {}", stop, RIGHT_MOTOR_CONTROL));
            // distances cleared so a later limited drive starts clean
            state.add(format!("movw $0 {}", LEFT_MOTOR_DISTANCE));
            state.add(format!("movw $0 {}", RIGHT_MOTOR_DISTANCE));
            return true;
        }
        "Ed.SimpleDriveForward" => (forward, forward),
        "Ed.SimpleDriveForwardRight" => (forward, stop),
        "Ed.SimpleDriveForwardLeft" => (stop, forward),
        "Ed.SimpleDriveBackward" => (backward, backward),
        "Ed.SimpleDriveBackwardRight" => (backward, stop),
        "Ed.SimpleDriveBackwardLeft" => (stop, backward),
        _ => return false,
    };
    state.add(format!("movb ${} {}", pair.0, LEFT_MOTOR_CONTROL));
    state.add(format!("movb ${} {}", pair.1, RIGHT_MOTOR_CONTROL));
    true
}

#[allow(clippy::too_many_arguments)]
fn handle_special_call(
    caller: &str,
    callee: &str,
    target: &Option<Value>,
    args: &[Value],
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<bool> {
    match callee {
        // data declarations handled entirely by layout
        "Ed.List1" | "Ed.List2" | "Ed.TuneString1" | "Ed.TuneString2" | "Ed.CreateObject" => {
            return Ok(true);
        }
        "ord" => {
            if let Some(t) = target {
                state.comment(format!("ORD into {}", t.display_name()));
                load_byte_variable_into_acc(&args[0], caller, state, diag)?;
                state.add("conv");
                store_acc_into_word_variable(t, caller, state, 0, diag)?;
            }
            return Ok(true);
        }
        "chr" => {
            if let Some(t) = target {
                state.comment(format!("CHR into {}", t.display_name()));
                match &args[0] {
                    Value::Int(c) => state.add(format!("movb ${} %_cpu:acc", c)),
                    other => {
                        load_word_variable_into_acc(other, caller, state, 0, diag)?;
                        state.add("convl");
                    }
                }
                store_acc_into_byte_variable(t, caller, state, diag)?;
            }
            return Ok(true);
        }
        "len" => {
            // the element count lives in the top byte of the slice header
            if let Some(t) = target {
                state.comment(format!("LEN into {}", t.display_name()));
                load_word_variable_into_acc(&args[0], caller, state, 0, diag)?;
                state.add("shrw $8");
                store_acc_into_word_variable(t, caller, state, 0, diag)?;
            }
            return Ok(true);
        }
        "Ed.ReadModuleRegister16Bit" => {
            state.comment(format!("{}", callee));
            let modreg = modreg_hex(&args[0], &args[1], diag)?;
            if let Some(t) = target {
                state.add(format!("movw %{} %_cpu:acc", modreg));
                store_acc_into_word_variable(t, caller, state, 0, diag)?;
            }
            return Ok(true);
        }
        "Ed.ReadModuleRegister8Bit" => {
            state.comment(format!("{}", callee));
            let modreg = modreg_hex(&args[0], &args[1], diag)?;
            if let Some(t) = target {
                state.add(format!("movb %{} %_cpu:acc", modreg));
                state.add("conv");
                store_acc_into_word_variable(t, caller, state, 0, diag)?;
            }
            return Ok(true);
        }
        "Ed.ClearModuleRegisterBit" | "Ed.SetModuleRegisterBit" => {
            state.comment(format!("{}", callee));
            let modreg = modreg_hex(&args[0], &args[1], diag)?;
            let bit = args[2].as_int().ok_or_else(|| {
                compile_error(diag, 8, "Can only use constants when setting/clearing module reg bit")
            })?;
            if !(0..=7).contains(&bit) {
                return Err(compile_error(diag, 9, "Bit constant is out of range"));
            }
            let op = if callee == "Ed.SetModuleRegisterBit" {
                "bitset"
            } else {
                "bitclr"
            };
            state.add(format!("{} ${} %{}", op, bit, modreg));
            return Ok(true);
        }
        "Ed.WriteModuleRegister16Bit" => {
            state.comment(format!("{}", callee));
            let modreg = modreg_hex(&args[0], &args[1], diag)?;
            match &args[2] {
                Value::Int(c) => state.add(format!("movw ${} %{}", c, modreg)),
                other => {
                    load_word_variable_into_acc(other, caller, state, 0, diag)?;
                    state.add(format!("movw %_cpu:acc %{}", modreg));
                }
            }
            return Ok(true);
        }
        "Ed.WriteModuleRegister8Bit" => {
            state.comment(format!("{}", callee));
            let modreg = modreg_hex(&args[0], &args[1], diag)?;
            match &args[2] {
                Value::Int(c) => state.add(format!("movb ${} %{}", c, modreg)),
                other => {
                    load_word_variable_into_acc(other, caller, state, 0, diag)?;
                    state.add("conv");
                    state.add(format!("movb %_cpu:acc %{}", modreg));
                }
            }
            return Ok(true);
        }
        "Ed.ObjectAddr" => {
            state.comment(format!("{}", callee));
            if let Some(t) = target {
                load_word_variable_into_acc(&args[0], caller, state, 0, diag)?;
                state.add("andw $255");
                store_acc_into_word_variable(t, caller, state, 0, diag)?;
            }
            return Ok(true);
        }
        "Ed.RegisterEventHandler" => {
            state.comment(format!("{}", callee));
            if let (Some(code), Some(Value::Str(handler))) = (args[0].as_int(), args.get(1)) {
                state.event_handler.insert(code, handler.clone());
            }
            return Ok(true);
        }
        _ => {}
    }

    if callee.starts_with("Ed.SimpleDrive") {
        state.comment(format!("Inline {}", callee));
        return Ok(add_simple_drive(callee, state));
    }
    if callee.ends_with("_INLINE_UNLIMITED") {
        state.comment(format!("Inline {}", callee));
        return add_inline_drive(callee, args, state, diag);
    }

    Ok(false)
}

// ===========================================================================
// Calls, returns, control flow
// ===========================================================================

fn setup_function_stack(state: &mut CompileState, func_name: &str) -> i64 {
    let stack_size = state.fun_stack_size[func_name];
    if stack_size > 0 {
        state.add(format!("stinc ${}", stack_size));
    }
    stack_size
}

fn take_down_function_stack(state: &mut CompileState, func_name: &str) {
    let stack_size = state.fun_stack_size[func_name];
    if stack_size > 0 {
        state.add(format!("stdec ${}", stack_size));
    }
}

fn compile_call(
    program: &Program,
    func_name: &str,
    target: &Option<Value>,
    callee: &str,
    args: &[Value],
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    let _ = program;
    if handle_special_call(func_name, callee, target, args, state, diag)? {
        return Ok(());
    }

    state.comment(format!("CALL {}", callee));

    let callee_depth = setup_function_stack(state, callee);

    for (index, from) in args.iter().enumerate() {
        let offset = state.fun_arg_layout[callee][index].1;
        match from {
            Value::Int(c) => {
                state.add(format!("movw ${} %_cpu:acc", c));
                state.add(format!("stwaw ${}", offset));
            }
            Value::Str(s) => {
                // a single character passes as its code
                if s.len() != 1 {
                    return Err(compile_error(
                        diag,
                        19,
                        "String constant should have length of 1",
                    ));
                }
                let c = s.bytes().next().unwrap_or(0);
                state.add(format!("movw ${} %_cpu:acc", c));
                state.add(format!("stwaw ${}", offset));
            }
            Value::IntList(_) => {
                return Err(compile_error(diag, 20, "Should not be a list constant here"));
            }
            other => {
                load_word_variable_into_acc(other, func_name, state, callee_depth, diag)?;
                state.add(format!("stwaw ${}", offset));
            }
        }
    }

    state.add(format!("suba {}", function_label(callee)));

    if let Some(t) = target {
        if state.fun_returns_value.get(callee).copied().unwrap_or(false) {
            state.add("straw $0");
            store_acc_into_word_variable(t, func_name, state, callee_depth, diag)?;
        }
    }

    take_down_function_stack(state, callee);
    Ok(())
}

fn compile_return(
    func_name: &str,
    value: &Option<Value>,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment("RETURN".to_string());
    if let Some(v) = value {
        match v {
            Value::Int(c) => state.add(format!("movw ${} %_cpu:acc", c)),
            other => load_word_variable_into_acc(other, func_name, state, 0, diag)?,
        }
        // the caller's return slot is just past the return frame
        state.add("stwaw $3");
    }
    state.add("ret");
    Ok(())
}

fn compile_control_marker(
    num: u32,
    kind: ControlKind,
    end: ControlEnd,
    state: &mut CompileState,
) {
    state.comment(format!("CTRL {} {} {}", num, kind, end));

    if matches!(kind, ControlKind::While | ControlKind::For) && end == ControlEnd::End {
        state.add(format!("bra {}", control_label(num, "start")));
    }

    match end {
        ControlEnd::Else => {
            // route the taken branch around the else body
            state.add(format!("bra {}", control_label(num, "end")));
        }
        ControlEnd::End => {
            let else_label = control_label(num, "else");
            if !state.control_labels.iter().any(|l| l == &else_label) {
                state.record_control_label(&else_label);
                state.add(else_label);
            }
        }
        ControlEnd::Start => {}
    }

    let label = control_label(
        num,
        match end {
            ControlEnd::Start => "start",
            ControlEnd::Else => "else",
            ControlEnd::End => "end",
        },
    );
    state.record_control_label(&label);
    state.add(label);
}

fn compile_for_control(
    func_name: &str,
    num: u32,
    iter: &ForIter,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment(format!("FOR_CTRL {}", num));

    match iter {
        ForIter::Array(array_value) => {
            let info = get_variable_info(func_name, array_value, state, diag)?;
            match info {
                VarInfo::GlobalVar { size, index: IndexLoc::Local { offset }, .. } => {
                    state.add(format!("straw ${}", offset));
                    state.add(format!("cmpw ${}", size));
                }
                VarInfo::LocalVar { offset, index: IndexLoc::Local { offset: i_offset } } => {
                    // the element count sits in the top byte of the header
                    state.add(format!("straw ${}", offset));
                    state.add("shrw $8");
                    state.add("movw %_cpu:acc @_CALC");
                    state.add(format!("straw ${}", i_offset));
                    state.add("cmpw @_CALC");
                }
                _ => {
                    return Err(compile_error(diag, 21, "for-loop array must be indexed by a temp"));
                }
            }
            state.add(format!("brle {}", control_label(num, "end")));
        }
        ForIter::Range { limit, current } => {
            match limit {
                Value::Int(c) => state.add(format!("movw ${} %_cpu:acc", c)),
                other => load_word_variable_into_acc(other, func_name, state, 0, diag)?,
            }
            let info = get_variable_info(func_name, current, state, diag)?;
            let offset = match info {
                VarInfo::Local { offset } => offset,
                _ => {
                    return Err(compile_error(diag, 21, "for-loop counter must be a local temp"));
                }
            };
            state.add("movw %_cpu:acc @_CALC");
            state.add(format!("straw ${}", offset));
            state.add("cmpw @_CALC");
            // exit once the limit is no longer above the counter
            state.add(format!("brle {}", control_label(num, "end")));
        }
    }
    Ok(())
}

fn compile_loop_control(
    func_name: &str,
    num: u32,
    test: &Value,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment(format!("LOOP_CTRL {}", num));
    match test {
        Value::Int(c) => state.add(format!("movw ${} %_cpu:acc", c)),
        other => load_word_variable_into_acc(other, func_name, state, 0, diag)?,
    }
    state.add(format!("brz {}", control_label(num, "else")));
    Ok(())
}

fn compile_loop_modifier(
    num: u32,
    kind: LoopModKind,
    state: &mut CompileState,
) {
    state.comment(format!("LOOP_MOD {:?}", kind));
    match kind {
        LoopModKind::Pass => {}
        LoopModKind::Break => state.add(format!("bra {}", control_label(num, "else"))),
        LoopModKind::Continue => state.add(format!("bra {}", control_label(num, "start"))),
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_bool_check(
    func_name: &str,
    num: u32,
    op: BoolCheckOp,
    value: &Value,
    target: &Value,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.comment(format!("BOOL_CHK {:?}", op));

    match value {
        Value::Int(c) => state.add(format!("movw ${} %_cpu:acc", c)),
        other => load_word_variable_into_acc(other, func_name, state, 0, diag)?,
    }

    if op == BoolCheckOp::Done {
        return store_acc_into_word_variable(target, func_name, state, 0, diag);
    }

    let continue_label = state.next_internal_label();
    if op == BoolCheckOp::Or {
        // zero means keep evaluating; anything else short-circuits true
        state.add(format!("brz {}", continue_label));
        state.add("movw $1 %_cpu:acc");
        store_acc_into_word_variable(target, func_name, state, 0, diag)?;
    } else {
        state.add(format!("brnz {}", continue_label));
        state.add("movw $0 %_cpu:acc");
        store_acc_into_word_variable(target, func_name, state, 0, diag)?;
    }
    state.add(format!("bra {}", control_label(num, "end")));
    state.add(continue_label);
    Ok(())
}

// ===========================================================================
// Functions and events
// ===========================================================================

fn compile_function(
    program: &Program,
    func_name: &str,
    state: &mut CompileState,
    diag: &mut DiagSink,
) -> CResult<()> {
    let function = &program.functions[func_name];
    state.add("");
    state.comment(format!("FUNCTION {}", func_name));
    state.add(function_label(func_name));

    if func_name == MAIN {
        let tempo = program.ed_variables["Ed.Tempo"];
        state.comment("Set initial tempo".to_string());
        state.add(format!("movw ${} %68", tempo));
    }

    for op in &function.body {
        match op {
            Op::Marker { .. } => {}
            Op::UAssign { target, op, operand } => {
                compile_uassign(program, func_name, target, *op, operand, state, diag)?;
            }
            Op::BAssign { target, left, op, right } => {
                compile_bassign(func_name, target, left, *op, right, state, diag)?;
            }
            Op::Call { target, name, args } => {
                compile_call(program, func_name, target, name, args, state, diag)?;
            }
            Op::Return { value } => {
                compile_return(func_name, value, state, diag)?;
            }
            Op::ControlMarker { num, kind, end } => {
                compile_control_marker(*num, *kind, *end, state);
            }
            Op::ForControl { num, iter } => {
                compile_for_control(func_name, *num, iter, state, diag)?;
            }
            Op::LoopControl { num, test, .. } => {
                compile_loop_control(func_name, *num, test, state, diag)?;
            }
            Op::LoopModifier { num, kind } => {
                compile_loop_modifier(*num, *kind, state);
            }
            Op::BoolCheck { num, op, value, target } => {
                compile_bool_check(func_name, *num, *op, value, target, state, diag)?;
            }
        }
    }

    if func_name == MAIN {
        state.add("stop");
    } else {
        state.add("ret");
    }
    state.add(function_end_label(func_name));
    Ok(())
}

fn start_event_call(
    state: &mut CompileState,
    module: &str,
    bit: u32,
    override_mask: Option<i64>,
    override_value: Option<i64>,
    leave_bit_set: bool,
) {
    let mask = override_mask.unwrap_or(1 << bit);
    let value = override_value.unwrap_or(1 << bit);
    state.add(format!("BEGIN EVENT %{}:status, {}, {}", module, mask, value));
    if !leave_bit_set {
        state.add(format!("bitclr ${} %{}:status", bit, module));
    }
}

fn finish_event_call(state: &mut CompileState, label: &str, stack_elements: i64) {
    // scratch survives the handler; nothing is returned from an event
    state.add("pushw @_CALC");
    if stack_elements > 0 {
        state.add(format!("stinc ${}", stack_elements));
    }
    state.add(format!("suba {}", label));
    if stack_elements > 0 {
        state.add(format!("stdec ${}", stack_elements));
    }
    state.add("popw @_CALC");
    state.add("stop");
    state.add("END EVENT");
}

fn add_event_handler_wrappers(state: &mut CompileState, diag: &mut DiagSink) -> CResult<()> {
    let handlers: Vec<(i64, String)> = state
        .event_handler
        .iter()
        .map(|(k, v)| (*k, v.clone()))
        .collect();

    for (code, fun_name) in handlers {
        let fun_label = function_label(&fun_name);
        let stack_elements = state.fun_stack_size.get(&fun_name).copied().unwrap_or(0);
        let c = &values::CONSTANTS;

        if code == c["Ed.EVENT_TIMER_FINISHED"] {
            start_event_call(state, "_timers", 0, None, None, false);
        } else if code == c["Ed.EVENT_REMOTE_CODE"] {
            // the handler's Ed.ReadRemote() clears the bit; clearing it
            // here would re-trigger immediately
            start_event_call(state, "IR_RECEIVER1", 1, None, None, true);
        } else if code == c["Ed.EVENT_IR_DATA"] {
            start_event_call(state, "IR_RECEIVER1", 0, None, None, false);
        } else if code == c["Ed.EVENT_CLAP_DETECTED"] {
            start_event_call(state, "SOUNDER1", 2, None, None, false);
        } else if code == c["Ed.EVENT_OBSTACLE_ANY"] {
            start_event_call(state, "IR_RECEIVER1", 6, None, None, false);
        } else if code == c["Ed.EVENT_OBSTACLE_LEFT"] {
            start_event_call(state, "IR_RECEIVER1", 5, None, None, false);
        } else if code == c["Ed.EVENT_OBSTACLE_RIGHT"] {
            start_event_call(state, "IR_RECEIVER1", 3, None, None, false);
        } else if code == c["Ed.EVENT_OBSTACLE_AHEAD"] {
            start_event_call(state, "IR_RECEIVER1", 4, None, None, false);
        } else if code == c["Ed.EVENT_DRIVE_STRAIN"] {
            // both motors can strain, so the handler installs twice
            start_event_call(state, "Left_Motor", 0, None, None, false);
            finish_event_call(state, &fun_label, stack_elements);
            start_event_call(state, "Right_Motor", 0, None, None, false);
        } else if code == c["Ed.EVENT_KEYPAD_TRIANGLE"] {
            start_event_call(state, "_devices", 0, None, None, false);
        } else if code == c["Ed.EVENT_KEYPAD_ROUND"] {
            start_event_call(state, "_devices", 2, None, None, false);
        } else if code == c["Ed.EVENT_LINE_TRACKER_ON_WHITE"] {
            start_event_call(state, "LINE_TRACKER1", 1, Some(3), Some(3), false);
        } else if code == c["Ed.EVENT_LINE_TRACKER_ON_BLACK"] {
            start_event_call(state, "LINE_TRACKER1", 1, Some(3), Some(2), false);
        } else if code == c["Ed.EVENT_LINE_TRACKER_SURFACE_CHANGE"] {
            start_event_call(state, "LINE_TRACKER1", 1, None, None, false);
        } else if code == c["Ed.EVENT_TUNE_FINISHED"] {
            start_event_call(state, "SOUNDER1", 0, None, None, false);
        } else {
            return Err(compile_error(diag, 30, &format!("Invalid Event code {}", code)));
        }

        finish_event_call(state, &fun_label, stack_elements);
    }
    Ok(())
}

// ===========================================================================
// Peephole optimisation on the listing
// ===========================================================================

fn is_comment(line: &str) -> bool {
    line.starts_with('#')
}

fn is_label(line: &str) -> bool {
    line.starts_with(':')
}

fn branch_target(line: &str) -> Option<&str> {
    line.strip_prefix("bra ").map(str::trim).filter(|t| t.starts_with(':'))
}

fn stack_write_operand(line: &str) -> Option<&str> {
    line.strip_prefix("stwaw ").map(str::trim)
}

fn stack_read_operand(line: &str) -> Option<&str> {
    line.strip_prefix("straw ").map(str::trim)
}

fn stack_delta(line: &str) -> Option<i64> {
    if let Some(rest) = line.strip_prefix("stinc $") {
        return rest.trim().parse::<i64>().ok();
    }
    if let Some(rest) = line.strip_prefix("stdec $") {
        return rest.trim().parse::<i64>().ok().map(|n| -n);
    }
    None
}

fn stack_slot(operand: &str) -> Option<i64> {
    operand.strip_prefix('$')?.parse::<i64>().ok()
}

impl CompileState {
    /// Drop a `bra L` when `L:` is the next executable statement.
    fn optimise_jumps(&mut self) -> usize {
        let mut saved = 0;
        let mut out: Vec<String> = Vec::with_capacity(self.statements.len());
        let mut pass_list: Vec<String> = Vec::new();
        let mut fail_list: Vec<String> = Vec::new();
        let mut target = String::new();
        let mut candidate = false;

        for line in std::mem::take(&mut self.statements) {
            if candidate {
                if is_comment(&line) {
                    pass_list.push(line.clone());
                    fail_list.push(line);
                } else if is_label(&line) {
                    if line.trim() == target {
                        out.append(&mut pass_list);
                        out.push(line);
                        fail_list.clear();
                        saved += 1;
                        candidate = false;
                    } else {
                        pass_list.push(line.clone());
                        fail_list.push(line);
                    }
                } else {
                    out.append(&mut fail_list);
                    out.push(line);
                    pass_list.clear();
                    candidate = false;
                }
            } else if let Some(t) = branch_target(&line) {
                candidate = true;
                target = t.to_string();
                pass_list.push(format!("# OPTIMISED OUT (JUMP): {}", line));
                fail_list.push(line);
            } else {
                out.push(line);
            }
        }
        out.append(&mut fail_list);
        self.statements = out;
        saved
    }

    /// `stwaw $k` directly followed by `straw $k`: the value is already in
    /// the accumulator.
    fn optimise_reads_from_stack(&mut self) -> usize {
        let mut saved = 0;
        let mut out: Vec<String> = Vec::with_capacity(self.statements.len());
        let mut target = String::new();
        let mut candidate = false;

        for line in std::mem::take(&mut self.statements) {
            if candidate {
                if is_comment(&line) {
                    out.push(line);
                    continue;
                }
                if stack_read_operand(&line) == Some(target.as_str()) {
                    out.push(format!("# OPTIMISED OUT (STACK_READ): {}", line));
                    saved += 1;
                } else {
                    out.push(line);
                }
                candidate = false;
            } else {
                if let Some(t) = stack_write_operand(&line) {
                    candidate = true;
                    target = t.to_string();
                }
                out.push(line);
            }
        }
        self.statements = out;
        saved
    }

    /// Remove stack writes whose slot is never read again in the function.
    /// Slot 0..2 relative reads matter; the callee-side return slot (3) of
    /// a value-returning function counts as read.
    fn optimise_writes_to_stack(&mut self) -> usize {
        use std::collections::{HashMap, HashSet};

        let mut removable: HashMap<String, HashSet<i64>> = HashMap::new();
        let mut function: Option<String> = None;
        let mut stack_offset = 0i64;
        let mut reads: HashSet<i64> = HashSet::new();
        let mut writes: HashSet<i64> = HashSet::new();

        for line in &self.statements {
            if let Some(name) = line.strip_prefix("::_fun_") {
                function = Some(name.to_string());
                stack_offset = 0;
                reads.clear();
                writes.clear();
                if self.fun_returns_value.get(name).copied().unwrap_or(false) {
                    reads.insert(3);
                }
            } else if let Some(name) = line.strip_prefix(":_end_") {
                if function.is_some() {
                    let dead: HashSet<i64> = writes.difference(&reads).copied().collect();
                    removable.insert(name.to_string(), dead);
                    function = None;
                }
            } else if function.is_some() {
                if let Some(delta) = stack_delta(line) {
                    stack_offset += delta;
                } else if let Some(op) = stack_read_operand(line) {
                    if let Some(slot) = stack_slot(op) {
                        let location = slot - stack_offset;
                        if location >= 0 {
                            reads.insert(location);
                        }
                    }
                } else if let Some(op) = stack_write_operand(line) {
                    if let Some(slot) = stack_slot(op) {
                        let location = slot - stack_offset;
                        if location >= 0 {
                            writes.insert(location);
                        }
                    }
                }
            }
        }

        let mut saved = 0;
        let mut out: Vec<String> = Vec::with_capacity(self.statements.len());
        let mut current: Option<String> = None;
        stack_offset = 0;

        for line in std::mem::take(&mut self.statements) {
            if let Some(name) = line.strip_prefix("::_fun_") {
                current = Some(name.to_string());
                stack_offset = 0;
                out.push(line);
            } else if line.starts_with(":_end_") {
                current = None;
                out.push(line);
            } else if let Some(name) = &current {
                if let Some(delta) = stack_delta(&line) {
                    stack_offset += delta;
                    out.push(line);
                } else if stack_offset == 0 {
                    let dead = stack_write_operand(&line)
                        .and_then(stack_slot)
                        .filter(|slot| {
                            removable
                                .get(name)
                                .is_some_and(|set| set.contains(slot))
                        })
                        .is_some();
                    if dead {
                        out.push(format!("# OPTIMISED OUT (STACK_WRITE): {}", line));
                        saved += 1;
                    } else {
                        out.push(line);
                    }
                } else {
                    out.push(line);
                }
            } else {
                out.push(line);
            }
        }
        self.statements = out;
        saved
    }

    /// A `ret` with no label since the previous `ret` is unreachable.
    fn optimise_double_returns(&mut self) -> usize {
        let mut saved = 0;
        let mut last_was_return = false;
        for line in self.statements.iter_mut() {
            if is_label(line) {
                last_was_return = false;
            }
            if line.trim() == "ret" {
                if last_was_return {
                    *line = format!("# OPTIMISED OUT (DBL-RET): {}", line);
                    saved += 1;
                } else {
                    last_was_return = true;
                }
            }
        }
        saved
    }

    /// `straw $k` directly followed by `stwaw $k` did nothing at all.
    fn optimise_useless_stack_ops(&mut self) -> usize {
        let mut saved = 0;
        let mut out: Vec<String> = Vec::with_capacity(self.statements.len());
        let mut pass_list: Vec<String> = Vec::new();
        let mut fail_list: Vec<String> = Vec::new();
        let mut target = String::new();
        let mut candidate = false;

        for line in std::mem::take(&mut self.statements) {
            if candidate {
                if is_comment(&line) {
                    pass_list.push(line.clone());
                    fail_list.push(line);
                    continue;
                }
                if is_label(&line) {
                    out.append(&mut fail_list);
                    out.push(line);
                    pass_list.clear();
                    candidate = false;
                    continue;
                }
                if stack_write_operand(&line) == Some(target.as_str()) {
                    pass_list.push(format!("# OPTIMISED OUT (USELESS_STACK_OP): {}", line));
                    out.append(&mut pass_list);
                    fail_list.clear();
                    saved += 2;
                } else {
                    out.append(&mut fail_list);
                    out.push(line);
                    pass_list.clear();
                }
                candidate = false;
            } else if let Some(t) = stack_read_operand(&line) {
                candidate = true;
                target = t.to_string();
                pass_list.push(format!("# OPTIMISED OUT (USELESS_STACK_OP): {}", line));
                fail_list.push(line);
            } else {
                out.push(line);
            }
        }
        out.append(&mut fail_list);
        self.statements = out;
        saved
    }

    fn optimise(&mut self) -> usize {
        let mut saved = 0;
        saved += self.optimise_jumps();
        saved += self.optimise_reads_from_stack();
        saved += self.optimise_writes_to_stack();
        saved += self.optimise_double_returns();
        saved += self.optimise_useless_stack_ops();
        saved
    }
}

// ===========================================================================
// Entry point
// ===========================================================================

/// Lower a validated program into an assembler listing.
pub fn compile(
    program: &Program,
    do_opts: bool,
    diag: &mut DiagSink,
) -> Result<Vec<String>, StageError> {
    diag.top(Kind::CmpStart, &[]);

    let mut state = CompileState::new();
    let result = compile_program(program, &mut state, do_opts, diag);

    if diag.dump_mask() & diag::dump::COMPILER != 0 {
        state.dump();
    }
    if diag.dump_mask() & diag::dump::ASSEMBLY != 0 {
        for s in &state.statements {
            println!("{}", s);
        }
    }

    result.map(|_| state.statements)
}

fn compile_program(
    program: &Program,
    state: &mut CompileState,
    do_opts: bool,
    diag: &mut DiagSink,
) -> CResult<()> {
    state.add(values::VERSION_STATEMENT);

    layout_classes(program, state);
    layout_function_vars(program, state);

    for device in values::MODULE_STATEMENTS {
        state.add(*device);
    }

    state.add("BEGIN MAIN");
    setup_global_vars(program, state, diag)?;

    // main's frame exists for the whole program; callees manage their own
    setup_function_stack(state, MAIN);
    compile_function(program, MAIN, state, diag)?;

    for name in program.functions.keys() {
        if name == MAIN || SPECIALLY_HANDLED_FUNCTIONS.contains(&name.as_str()) {
            continue;
        }
        compile_function(program, name, state, diag)?;
    }

    state.add("stop");
    state.add("END MAIN");

    add_event_handler_wrappers(state, diag)?;

    state.add("FINISH");

    if do_opts {
        state.optimise();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{optimiser, parser};
    use edc_core::diag::{Level, SinkKind};

    const PREAMBLE: &str = "import Ed\n\
                            Ed.EdisonVersion = Ed.V2\n\
                            Ed.DistanceUnits = Ed.CM\n\
                            Ed.Tempo = Ed.TEMPO_MEDIUM\n";

    fn listing(src: &str, do_opts: bool) -> Vec<String> {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Test);
        d.set_max_level(Level::Error);
        let mut p = Program::new();
        parser::parse_string(src, "test.py", &mut p, &mut d).expect("parse should succeed");
        optimiser::optimise(&mut p, &mut d).expect("optimise should succeed");
        compile(&p, do_opts, &mut d).expect("compile should succeed")
    }

    fn code_lines(listing: &[String]) -> Vec<&str> {
        listing
            .iter()
            .map(String::as_str)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect()
    }

    #[test]
    fn empty_main_shape() {
        let lines = listing(&format!("{}pass\n", PREAMBLE), true);
        let code = code_lines(&lines);
        assert_eq!(code[0], "VERSION 6, 0");
        assert!(code.iter().any(|l| l.starts_with("DEVICE tracker, 0")));
        assert!(code.contains(&"BEGIN MAIN"));
        assert!(code.contains(&"DATW _CALC 0 1"));
        // the three program variables are initialised data
        assert!(code.iter().any(|l| l.starts_with("DATW Ed.EdisonVersion 1 1 2")));
        assert!(code.iter().any(|l| l.starts_with("DATW Ed.Tempo 3 1 250")));
        // main sets the tempo then stops
        assert!(code.contains(&"movw $250 %68"));
        assert!(code.contains(&"::_fun___main__"));
        assert!(code.contains(&"stop"));
        assert!(code.last() == Some(&"FINISH"));
    }

    #[test]
    fn global_constant_store_is_direct() {
        let lines = listing(&format!("{}x = 9\nEd.PlayBeep()\n", PREAMBLE), false);
        assert!(lines.iter().any(|l| l == "movw $9 @x"));
    }

    #[test]
    fn register_write_becomes_modreg_move() {
        let lines = listing(&format!("{}Ed.LeftLed(Ed.ON)\n", PREAMBLE), true);
        // inside Ed.LeftLed the inline register write hits module 11 reg 1
        assert!(lines.iter().any(|l| l == "movb %_cpu:acc %b1"));
    }

    #[test]
    fn while_loop_emits_back_edge_and_break_label() {
        let src = format!(
            "{}i = 0\nwhile i < 5:\n    i = i + 1\n    if i == 3:\n        break\n",
            PREAMBLE
        );
        let lines = listing(&src, false);
        let while_start = lines
            .iter()
            .position(|l| l.starts_with(":_Control_") && l.ends_with("_start"))
            .expect("loop start label");
        let while_label = lines[while_start].trim_start_matches(':');
        let back_edge = format!("bra :{}", while_label);
        assert!(lines.iter().any(|l| *l == back_edge));

        // break jumps to the While else label, not the If end label
        let while_num: String = while_label
            .trim_start_matches("_Control_")
            .trim_end_matches("_start")
            .to_string();
        assert!(lines
            .iter()
            .any(|l| *l == format!("bra :_Control_{}_else", while_num)));
    }

    #[test]
    fn for_range_compares_against_limit() {
        let lines = listing(&format!("{}for i in range(4):\n    pass\n", PREAMBLE), false);
        assert!(lines.iter().any(|l| l == "movw $4 %_cpu:acc"));
        assert!(lines.iter().any(|l| l == "cmpw @_CALC"));
        assert!(lines.iter().any(|l| l.starts_with("brle :_Control_")));
    }

    #[test]
    fn call_pushes_frame_and_copies_args() {
        let src = format!("{}def double(n):\n    return n + n\nx = double(4)\n", PREAMBLE);
        let lines = listing(&src, false);
        assert!(lines.iter().any(|l| l == "suba ::_fun_double"));
        // the frame gets set up before the call and torn down after
        let suba = lines.iter().position(|l| l == "suba ::_fun_double").unwrap();
        assert!(lines[..suba].iter().any(|l| l.starts_with("stinc $")));
        assert!(lines[suba..].iter().any(|l| l.starts_with("stdec $")));
        // return value read from the callee frame top
        assert_eq!(lines[suba + 1], "straw $0");
    }

    #[test]
    fn return_value_lands_in_slot_three() {
        let src = format!("{}def five():\n    return 5\nx = five()\n", PREAMBLE);
        let lines = listing(&src, false);
        let label = lines.iter().position(|l| l == "::_fun_five").unwrap();
        let body = &lines[label..];
        assert!(body.iter().any(|l| l == "stwaw $3"));
        assert!(body.iter().any(|l| l == "ret"));
    }

    #[test]
    fn tune_string_data_is_emitted() {
        let src = format!("{}t = Ed.TuneString(4, \"abcz\")\nEd.PlayTune(t)\n", PREAMBLE);
        let lines = listing(&src, false);
        assert!(lines.iter().any(|l| l.starts_with("DATB t-object, 0, 4, \"abcz\"")));
        // the header word is (size << 8) | start
        assert!(lines.iter().any(|l| l.contains("DATW t,") && l.ends_with(&format!("{}", 4 << 8))));
    }

    #[test]
    fn list_access_uses_index_module() {
        let src = format!("{}d = Ed.List(3, [7, 8, 9])\nx = d[1]\n", PREAMBLE);
        let lines = listing(&src, false);
        assert!(lines.iter().any(|l| l == "movb %_cpu:acc %_index:16b1cursor"));
        assert!(lines
            .iter()
            .any(|l| *l == format!("bitset ${} %_index:action", CONTROL_INDEX_READ_16BIT)));
        assert!(lines.iter().any(|l| l == "movw %_index:16b1window %_cpu:acc"));
    }

    #[test]
    fn event_wrapper_for_clap_detection() {
        let src = format!(
            "{}def onClap():\n    Ed.LeftLed(1)\nEd.RegisterEventHandler(Ed.EVENT_CLAP_DETECTED, \"onClap\")\n",
            PREAMBLE
        );
        let lines = listing(&src, false);
        // sounder module is slot 6; clap is status bit 2 (mask/value 4)
        assert!(lines.iter().any(|l| l == "BEGIN EVENT %SOUNDER1:status, 4, 4"));
        assert!(lines.iter().any(|l| l == "bitclr $2 %SOUNDER1:status"));
        assert!(lines.iter().any(|l| l == "suba ::_fun_onClap"));
        assert!(lines.iter().any(|l| l == "END EVENT"));
    }

    #[test]
    fn drive_strain_installs_two_wrappers() {
        let src = format!(
            "{}def onStrain():\n    Ed.PlayBeep()\nEd.RegisterEventHandler(Ed.EVENT_DRIVE_STRAIN, \"onStrain\")\n",
            PREAMBLE
        );
        let lines = listing(&src, false);
        assert!(lines.iter().any(|l| l == "BEGIN EVENT %Left_Motor:status, 1, 1"));
        assert!(lines.iter().any(|l| l == "BEGIN EVENT %Right_Motor:status, 1, 1"));
        assert_eq!(lines.iter().filter(|l| *l == "suba ::_fun_onStrain").count(), 2);
    }

    #[test]
    fn inline_unlimited_drive_writes_motor_controls() {
        let src = format!("{}Ed.Drive(Ed.FORWARD, 5, Ed.DISTANCE_UNLIMITED)\n", PREAMBLE);
        let lines = listing(&src, false);
        // forward at speed 5: 0x80 | 5 on both motor control registers
        assert!(lines.iter().any(|l| l == "movb $133 %81"));
        assert!(lines.iter().any(|l| l == "movb $133 %31"));
        // no call frame for the inlined variant
        assert!(!lines.iter().any(|l| l.contains("suba ::_fun_Ed.Drive")));
    }

    #[test]
    fn peephole_removes_write_then_read() {
        let mut state = CompileState::new();
        state.statements = vec![
            "::_fun_f".to_string(),
            "stwaw $2".to_string(),
            "straw $2".to_string(),
            "ret".to_string(),
            ":_end_f".to_string(),
        ];
        state.fun_returns_value.insert("f".to_string(), false);
        state.optimise_reads_from_stack();
        assert!(state.statements[2].starts_with("# OPTIMISED OUT (STACK_READ)"));
    }

    #[test]
    fn peephole_removes_branch_to_next_label() {
        let mut state = CompileState::new();
        state.statements = vec![
            "bra :_int_0001".to_string(),
            "# note".to_string(),
            ":_int_0001".to_string(),
            "ret".to_string(),
        ];
        state.optimise_jumps();
        assert!(state.statements[0].starts_with("# OPTIMISED OUT (JUMP)"));
        assert_eq!(state.statements[2], ":_int_0001");
    }

    #[test]
    fn peephole_drops_unreachable_ret() {
        let mut state = CompileState::new();
        state.statements = vec![
            "ret".to_string(),
            "ret".to_string(),
            ":_next".to_string(),
            "ret".to_string(),
        ];
        state.optimise_double_returns();
        assert!(state.statements[1].starts_with("# OPTIMISED OUT (DBL-RET)"));
        assert_eq!(state.statements[3], "ret");
    }

    #[test]
    fn peephole_keeps_return_slot_write() {
        let mut state = CompileState::new();
        state.statements = vec![
            "::_fun_f".to_string(),
            "stwaw $3".to_string(),
            "ret".to_string(),
            ":_end_f".to_string(),
        ];
        state.fun_returns_value.insert("f".to_string(), true);
        state.optimise_writes_to_stack();
        assert_eq!(state.statements[1], "stwaw $3");
    }

    #[test]
    fn listing_is_deterministic() {
        let src = format!(
            "{}a = 1\nb = 2\ndef f(x):\n    return x + 1\nc = f(a)\nEd.PlayBeep()\n",
            PREAMBLE
        );
        assert_eq!(listing(&src, true), listing(&src, true));
    }
}
