//! Optimiser and semantic validator
//!
//! A sequence of rewrite passes over the IR, run before code generation.
//! Constant propagation and simple-variable removal iterate to fixpoint;
//! the later passes do call fix-up, the Edison program-variable rules,
//! type/shape inference with signature checking, class validation,
//! constant-range checks, dead-function removal and per-line temp
//! compaction. Nearly every user-visible diagnostic originates here.
//!
//! Rewrite rules live in small per-pass lists: a rule maps a value to its
//! known replacement and dies on the next write to its target. Simple-temp
//! rules expire at source-line Markers; non-temp rules expire on entry to
//! any control region (the region may re-enter via a back edge).

use edc_core::diag::{self, DiagSink, Kind};
use edc_core::program::{
    BinOp, ControlEnd, ForIter, Function, Op, Program, SigParam, StageError, TypeExtra, TypeInfo,
    TypeTag, UnaryOp, Value, VarName, MAIN, MAX_WORD, MIN_WORD,
};
use edc_core::values;
use indexmap::IndexMap;

type OResult<T> = Result<T, StageError>;

fn opt_err(diag: &mut DiagSink, kind: Kind, args: &[&dyn std::fmt::Display]) -> StageError {
    diag.error(kind, args);
    StageError::Optimise
}

fn internal_err(diag: &mut DiagSink, number: u32) -> StageError {
    diag.error(Kind::CmpInternalError, &[&number]);
    StageError::Optimise
}

// ===========================================================================
// Rewrite rules
// ===========================================================================

type RewriteList = Vec<(Value, Value)>;

fn update_rewrite(rules: &mut RewriteList, target: &Value, new_value: Value) {
    for entry in rules.iter_mut() {
        if entry.0 == *target {
            entry.1 = new_value;
            return;
        }
    }
    rules.push((target.clone(), new_value));
}

fn delete_rewrite(rules: &mut RewriteList, target: &Value) {
    rules.retain(|(t, _)| t != target);
}

fn get_rewrite(rules: &RewriteList, key: &Value) -> Option<Value> {
    rules.iter().find(|(t, _)| t == key).map(|(_, v)| v.clone())
}

fn clear_simple_temp_rules(rules: &mut RewriteList) {
    rules.retain(|(t, _)| !t.is_simple_temp());
}

fn clear_non_temp_rules(rules: &mut RewriteList) {
    rules.retain(|(t, _)| t.is_simple_temp());
}

/// If this value is a slice whose index has a known replacement, build the
/// rewritten slice.
fn replace_slice_index(value: &Value, rules: &RewriteList) -> Option<Value> {
    let (name, index) = match value {
        Value::Slice { name, index: edc_core::program::SliceIndex::Var(vn) } => (name, vn),
        _ => return None,
    };
    let rule = get_rewrite(rules, &Value::Var(index.clone()))?;
    match rule {
        Value::Int(c) => Some(Value::slice_const(name, c)),
        Value::Var(vn) => Some(Value::slice_var(name, vn)),
        _ => None,
    }
}

/// Apply slice-index and direct rules to a read slot.
fn rewrite_read(value: &mut Value, rules: &RewriteList, changed: &mut bool) {
    if let Some(nv) = replace_slice_index(value, rules) {
        *value = nv;
        *changed = true;
    }
    if !value.is_constant() {
        if let Some(v) = get_rewrite(rules, value) {
            if v != *value {
                *value = v;
                *changed = true;
            }
        }
    }
}

fn rewrite_target_slice(value: &mut Value, rules: &RewriteList, changed: &mut bool) {
    if let Some(nv) = replace_slice_index(value, rules) {
        *value = nv;
        *changed = true;
    }
}

// ===========================================================================
// Constant folding helpers
// ===========================================================================

/// Fold a unary op over a constant operand. String/list constants only pass
/// through the identity.
fn uassign_with_constant(
    op: UnaryOp,
    operand: &Value,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<Value> {
    let value = match operand {
        Value::Int(n) => *n,
        Value::Str(_) => {
            if op != UnaryOp::UAdd {
                return Err(opt_err(diag, Kind::OptStringNotAllowed, &[&line]));
            }
            return Ok(operand.clone());
        }
        _ => {
            if op != UnaryOp::UAdd {
                return Err(opt_err(diag, Kind::OptListNotAllowed, &[&line]));
            }
            return Ok(operand.clone());
        }
    };

    let folded = match op {
        UnaryOp::UAdd => value,
        UnaryOp::USub => -value,
        UnaryOp::Invert => -(1 + value),
        UnaryOp::Not => {
            if value != 0 {
                0
            } else {
                1
            }
        }
    };
    Ok(Value::int(folded))
}

/// Fold a binary op over two integer constants. Integer division truncates;
/// comparisons yield 0/1.
fn bassign_with_constants(
    op: BinOp,
    left: i64,
    right: i64,
    diag: &mut DiagSink,
) -> OResult<Value> {
    let bool_to_int = |b: bool| if b { 1 } else { 0 };
    let value = match op {
        BinOp::Add => left.saturating_add(right),
        BinOp::Sub => left.saturating_sub(right),
        BinOp::Mult => left.saturating_mul(right),
        BinOp::Div | BinOp::FloorDiv => {
            if right == 0 {
                return Err(internal_err(diag, 700));
            }
            left / right
        }
        BinOp::Mod => {
            if right == 0 {
                return Err(internal_err(diag, 700));
            }
            left % right
        }
        BinOp::LShift => {
            if right < 0 {
                return Err(internal_err(diag, 700));
            }
            left.saturating_mul(1i64.checked_shl(right.min(62) as u32).unwrap_or(i64::MAX))
        }
        BinOp::RShift => {
            if right < 0 {
                return Err(internal_err(diag, 700));
            }
            left >> right.min(63)
        }
        BinOp::BitOr => left | right,
        BinOp::BitAnd => left & right,
        BinOp::BitXor => left ^ right,
        BinOp::Eq => bool_to_int(left == right),
        BinOp::NotEq => bool_to_int(left != right),
        BinOp::Lt => bool_to_int(left < right),
        BinOp::LtE => bool_to_int(left <= right),
        BinOp::Gt => bool_to_int(left > right),
        BinOp::GtE => bool_to_int(left >= right),
        BinOp::Pow => return Err(internal_err(diag, 700)),
    };
    Ok(Value::int(value))
}

// ===========================================================================
// Pass: Ed constant replacement
// ===========================================================================

fn query_constant_use(
    value: &Value,
    constants: &dyn Fn(&str) -> Option<i64>,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<Option<Value>> {
    if let Value::Var(VarName::User(name)) = value {
        if name == "None" {
            return Err(opt_err(diag, Kind::OptNotSupported, &[&line, name]));
        }
        if let Some(c) = constants(name) {
            return Ok(Some(Value::int(c)));
        }
    }
    Ok(None)
}

/// Replace `Ed.*` constant names (plus True/False) with their values;
/// writing to one is an error, and so is any use of `None`.
fn ed_constant_replacement(program: &mut Program, diag: &mut DiagSink) -> OResult<()> {
    let ed_imported = program.imports.iter().any(|i| i == "Ed");
    let lookup = move |name: &str| -> Option<i64> {
        match name {
            "True" => Some(1),
            "False" => Some(0),
            _ if ed_imported => values::CONSTANTS.get(name).copied(),
            _ => None,
        }
    };

    for function in program.functions.values_mut() {
        let mut line = 0u32;
        for op in function.body.iter_mut() {
            if let Some(target) = op.target() {
                if let Value::Var(VarName::User(name)) = target {
                    if lookup(name).is_some() {
                        return Err(opt_err(
                            diag,
                            Kind::OptWriteToEdPyConstant,
                            &[&line, name],
                        ));
                    }
                }
            }

            match op {
                Op::Marker { line: l, .. } => line = *l,
                Op::LoopControl { test, .. } => {
                    if let Some(nv) = query_constant_use(test, &lookup, line, diag)? {
                        *test = nv;
                    }
                }
                Op::ForControl { iter, .. } => match iter {
                    ForIter::Array(v) => {
                        if let Some(nv) = query_constant_use(v, &lookup, line, diag)? {
                            *v = nv;
                        }
                    }
                    ForIter::Range { limit, current } => {
                        if let Some(nv) = query_constant_use(limit, &lookup, line, diag)? {
                            *limit = nv;
                        }
                        if let Some(nv) = query_constant_use(current, &lookup, line, diag)? {
                            *current = nv;
                        }
                    }
                },
                Op::BoolCheck { value, .. } => {
                    if let Some(nv) = query_constant_use(value, &lookup, line, diag)? {
                        *value = nv;
                    }
                }
                Op::UAssign { operand, .. } => {
                    if let Some(nv) = query_constant_use(operand, &lookup, line, diag)? {
                        *operand = nv;
                    }
                }
                Op::BAssign { left, right, .. } => {
                    if let Some(nv) = query_constant_use(left, &lookup, line, diag)? {
                        *left = nv;
                    }
                    if let Some(nv) = query_constant_use(right, &lookup, line, diag)? {
                        *right = nv;
                    }
                }
                Op::Call { args, .. } => {
                    for a in args.iter_mut() {
                        if let Some(nv) = query_constant_use(a, &lookup, line, diag)? {
                            *a = nv;
                        }
                    }
                }
                Op::Return { value: Some(v) } => {
                    if let Some(nv) = query_constant_use(v, &lookup, line, diag)? {
                        *v = nv;
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Pass: constant removal & folding
// ===========================================================================

fn constant_removal(program: &mut Program, diag: &mut DiagSink) -> OResult<bool> {
    let mut changed = false;

    for function in program.functions.values_mut() {
        let body = std::mem::take(&mut function.body);
        let mut new_body = Vec::with_capacity(body.len());
        let mut rules: RewriteList = Vec::new();
        let mut line = 0u32;
        let mut control_level = 0i32;

        for mut op in body {
            match &mut op {
                Op::Marker { line: l, .. } => {
                    line = *l;
                    clear_simple_temp_rules(&mut rules);
                    new_body.push(op);
                }
                Op::ControlMarker { end, .. } => {
                    match end {
                        ControlEnd::Start => {
                            control_level += 1;
                            // a region may re-enter; forget non-temp facts
                            clear_non_temp_rules(&mut rules);
                        }
                        ControlEnd::End => control_level -= 1,
                        ControlEnd::Else => {}
                    }
                    new_body.push(op);
                }
                Op::UAssign { target, op: uop, operand } => {
                    rewrite_target_slice(target, &rules, &mut changed);
                    rewrite_read(operand, &rules, &mut changed);

                    if operand.is_constant() {
                        if target.is_simple_temp() {
                            let value = uassign_with_constant(*uop, operand, line, diag)?;
                            update_rewrite(&mut rules, target, value);
                            changed = true;
                            // dropped: uses are rewritten from the rule
                        } else {
                            if control_level == 0 && target.is_simple_var() && operand.is_int_const()
                            {
                                let value = uassign_with_constant(*uop, operand, line, diag)?;
                                update_rewrite(&mut rules, target, value);
                            } else {
                                delete_rewrite(&mut rules, target);
                            }
                            new_body.push(op);
                        }
                    } else {
                        delete_rewrite(&mut rules, target);
                        new_body.push(op);
                    }
                }
                Op::BAssign { target, left, op: bop, right } => {
                    if left.is_str_const() || right.is_str_const() {
                        return Err(opt_err(diag, Kind::OptStringNotAllowed, &[&line]));
                    }
                    if left.is_list_const() || right.is_list_const() {
                        return Err(opt_err(diag, Kind::OptListNotAllowed, &[&line]));
                    }

                    rewrite_target_slice(target, &rules, &mut changed);
                    rewrite_read(left, &rules, &mut changed);
                    rewrite_read(right, &rules, &mut changed);

                    if let (Some(l), Some(r)) = (left.as_int(), right.as_int()) {
                        let value = bassign_with_constants(*bop, l, r, diag)?;
                        if target.is_simple_temp() || control_level == 0 {
                            update_rewrite(&mut rules, target, value.clone());
                        } else {
                            delete_rewrite(&mut rules, target);
                        }
                        changed = true;
                        if !target.is_simple_temp() {
                            new_body.push(Op::UAssign {
                                target: target.clone(),
                                op: UnaryOp::UAdd,
                                operand: value,
                            });
                        }
                    } else {
                        delete_rewrite(&mut rules, target);
                        new_body.push(op);
                    }
                }
                Op::BoolCheck { value, target, .. } => {
                    rewrite_target_slice(target, &rules, &mut changed);
                    rewrite_read(value, &rules, &mut changed);
                    new_body.push(op);
                }
                Op::Call { target, args, .. } => {
                    for a in args.iter_mut() {
                        rewrite_read(a, &rules, &mut changed);
                    }
                    if let Some(t) = target {
                        rewrite_target_slice(t, &rules, &mut changed);
                        delete_rewrite(&mut rules, t);
                    }
                    new_body.push(op);
                }
                Op::LoopControl { test, .. } => {
                    rewrite_read(test, &rules, &mut changed);
                    new_body.push(op);
                }
                Op::Return { value: Some(v) } => {
                    rewrite_read(v, &rules, &mut changed);
                    new_body.push(op);
                }
                _ => new_body.push(op),
            }
        }
        function.body = new_body;
    }

    Ok(changed)
}

// ===========================================================================
// Pass: simple variable removal
// ===========================================================================

/// Identity assignments into simple temps become rewrite rules and vanish;
/// subsequent reads of the temp use the original value directly.
fn simple_var_removal(program: &mut Program, diag: &mut DiagSink) -> OResult<bool> {
    let _ = diag;
    let mut changed = false;

    for function in program.functions.values_mut() {
        let body = std::mem::take(&mut function.body);
        let mut new_body = Vec::with_capacity(body.len());
        let mut rules: RewriteList = Vec::new();

        for mut op in body {
            match &mut op {
                Op::Marker { .. } => {
                    clear_simple_temp_rules(&mut rules);
                    new_body.push(op);
                }
                Op::UAssign { target, op: uop, operand } => {
                    rewrite_target_slice(target, &rules, &mut changed);
                    if !operand.is_constant() {
                        rewrite_read(operand, &rules, &mut changed);
                        if *uop == UnaryOp::UAdd && target.is_simple_temp() {
                            update_rewrite(&mut rules, target, operand.clone());
                            changed = true;
                            // dropped
                        } else {
                            delete_rewrite(&mut rules, target);
                            new_body.push(op);
                        }
                    } else {
                        delete_rewrite(&mut rules, target);
                        new_body.push(op);
                    }
                }
                Op::BAssign { target, left, right, .. } => {
                    rewrite_target_slice(target, &rules, &mut changed);
                    rewrite_read(left, &rules, &mut changed);
                    rewrite_read(right, &rules, &mut changed);
                    delete_rewrite(&mut rules, target);
                    new_body.push(op);
                }
                Op::BoolCheck { value, target, .. } => {
                    rewrite_target_slice(target, &rules, &mut changed);
                    rewrite_read(value, &rules, &mut changed);
                    new_body.push(op);
                }
                Op::Call { target, args, .. } => {
                    for a in args.iter_mut() {
                        rewrite_read(a, &rules, &mut changed);
                    }
                    if let Some(t) = target {
                        rewrite_target_slice(t, &rules, &mut changed);
                        delete_rewrite(&mut rules, t);
                    }
                    new_body.push(op);
                }
                Op::LoopControl { test, .. } => {
                    rewrite_read(test, &rules, &mut changed);
                    new_body.push(op);
                }
                Op::Return { value: Some(v) } => {
                    rewrite_read(v, &rules, &mut changed);
                    new_body.push(op);
                }
                _ => new_body.push(op),
            }
        }
        function.body = new_body;
    }

    Ok(changed)
}

// ===========================================================================
// Pass: marker cleanup and call collapse
// ===========================================================================

/// A line optimised down to nothing leaves its Marker behind; drop markers
/// directly followed by another marker.
fn remove_useless_markers(program: &mut Program) {
    for function in program.functions.values_mut() {
        let body = std::mem::take(&mut function.body);
        let mut new_body = Vec::with_capacity(body.len());
        for i in 0..body.len() {
            if i + 1 < body.len() && body[i].is_marker() && body[i + 1].is_marker() {
                continue;
            }
            new_body.push(body[i].clone());
        }
        function.body = new_body;
    }
}

/// `Call -> temp; target := temp` collapses to `Call -> target`.
fn simple_call_collapse(program: &mut Program) -> bool {
    let mut changed = false;
    for function in program.functions.values_mut() {
        let body = std::mem::take(&mut function.body);
        let mut new_body = Vec::with_capacity(body.len());
        let mut skip_next_uassign = false;

        for i in 0..body.len() {
            let mut op = body[i].clone();
            match &mut op {
                Op::UAssign { .. } if skip_next_uassign => {
                    skip_next_uassign = false;
                    continue;
                }
                Op::Call { target: Some(t), .. } if t.is_simple_temp() => {
                    if let Some(Op::UAssign {
                        target: next_target,
                        op: UnaryOp::UAdd,
                        operand,
                    }) = body.get(i + 1)
                    {
                        if *operand == *t {
                            *t = next_target.clone();
                            skip_next_uassign = true;
                            changed = true;
                        }
                    }
                    new_body.push(op);
                    continue;
                }
                _ => {}
            }
            new_body.push(op);
        }
        function.body = new_body;
    }
    changed
}

// ===========================================================================
// Pass: call fix-up (Ed.List / Ed.TuneString / constructors)
// ===========================================================================

fn fix_up_calls(program: &mut Program, diag: &mut DiagSink) -> OResult<()> {
    program.signatures.insert(MAIN.to_string(), Vec::new());

    let ed_imported = program.imports.iter().any(|i| i == "Ed");
    if ed_imported {
        if program.classes.contains_key("Ed") {
            return Err(opt_err(diag, Kind::OptReservedName, &[&0, &"Ed"]));
        }
        for (name, sig) in values::SIGNATURES.iter() {
            program.signatures.insert(name.to_string(), sig.clone());
        }
    }

    // object creation and List/TuneString calls are only allowed in main
    let class_names: Vec<String> = program.classes.keys().cloned().collect();
    let function = program
        .functions
        .get_mut(MAIN)
        .expect("main function always exists");
    let body = std::mem::take(&mut function.body);
    let mut new_body = Vec::with_capacity(body.len());
    let mut line = 0u32;

    for mut op in body {
        match &mut op {
            Op::Marker { line: l, .. } => {
                line = *l;
                new_body.push(op);
            }
            Op::UAssign { operand, .. } => {
                if operand.is_list_const() {
                    return Err(opt_err(diag, Kind::OptListNotAllowed, &[&line]));
                }
                new_body.push(op);
            }
            Op::Call { target, name, args } => {
                if name.as_str() == "Ed.List" {
                    match args.len() {
                        1 => *name = "Ed.List1".to_string(),
                        2 => {
                            *name = "Ed.List2".to_string();
                            let size = match args[0].as_int() {
                                Some(s) => s,
                                None => {
                                    return Err(opt_err(
                                        diag,
                                        Kind::OptIncorrectArgUse,
                                        &[&line, &"Ed.List"],
                                    ));
                                }
                            };
                            let init_len = match &args[1] {
                                Value::IntList(init) => init.len() as i64,
                                _ => {
                                    return Err(opt_err(
                                        diag,
                                        Kind::OptIncorrectArgUse,
                                        &[&line, &"Ed.List"],
                                    ));
                                }
                            };
                            if init_len > size {
                                return Err(opt_err(
                                    diag,
                                    Kind::OptEdListTooLong,
                                    &[&line, &"Ed.List", &size],
                                ));
                            }
                        }
                        _ => {
                            return Err(opt_err(
                                diag,
                                Kind::OptIncorrectArgUse,
                                &[&line, &"Ed.List"],
                            ));
                        }
                    }
                    if !target.as_ref().is_some_and(Value::is_simple_var) {
                        return Err(opt_err(diag, Kind::ParseSyntaxError, &[&line, &""]));
                    }
                } else if name.as_str() == "Ed.TuneString" {
                    match args.len() {
                        1 => *name = "Ed.TuneString1".to_string(),
                        2 => {
                            *name = "Ed.TuneString2".to_string();
                            let size = match args[0].as_int() {
                                Some(s) => s,
                                None => {
                                    return Err(opt_err(
                                        diag,
                                        Kind::OptIncorrectArgUse,
                                        &[&line, &"Ed.TuneString"],
                                    ));
                                }
                            };
                            let init = match args[1].as_str_const() {
                                Some(s) => s.to_string(),
                                None => {
                                    return Err(opt_err(
                                        diag,
                                        Kind::OptIncorrectArgUse,
                                        &[&line, &"Ed.TuneString"],
                                    ));
                                }
                            };
                            if init.len() as i64 > size {
                                return Err(opt_err(
                                    diag,
                                    Kind::OptEdListTooLong,
                                    &[&line, &"Ed.TuneString", &size],
                                ));
                            }
                            if !init.is_empty() && !init.ends_with('z') {
                                diag.warning(Kind::OptEdWarnTunestringEnd, &[&line]);
                            }
                        }
                        _ => {
                            return Err(opt_err(
                                diag,
                                Kind::OptIncorrectArgUse,
                                &[&line, &"Ed.TuneString"],
                            ));
                        }
                    }
                    if !target.as_ref().is_some_and(Value::is_simple_var) {
                        return Err(opt_err(diag, Kind::ParseSyntaxError, &[&line, &""]));
                    }
                } else if class_names.iter().any(|c| c == name.as_str()) {
                    // constructor: create the object first, then call
                    // Class.__init__(obj, args)
                    let obj = match target.take() {
                        Some(t) if t.is_simple_var() => t,
                        _ => {
                            return Err(opt_err(diag, Kind::ParseSyntaxError, &[&line, &""]));
                        }
                    };
                    new_body.push(Op::Call {
                        target: Some(obj.clone()),
                        name: "Ed.CreateObject".to_string(),
                        args: vec![Value::Str(name.clone())],
                    });
                    *name = format!("{}.__init__", name);
                    args.insert(0, obj);
                }

                if name.starts_with("Ed.") {
                    if !ed_imported {
                        return Err(opt_err(diag, Kind::OptMissingEdImport, &[&line, &*name]));
                    }
                    if !values::SIGNATURES.contains_key(name.as_str()) {
                        return Err(opt_err(diag, Kind::OptUnknownEdFunction, &[&0, &*name]));
                    }
                }
                new_body.push(op);
            }
            _ => new_body.push(op),
        }
    }
    function.body = new_body;
    Ok(())
}

// ===========================================================================
// Pass: Edison program-variable verification
// ===========================================================================

fn verify_edison_variables(program: &mut Program, diag: &mut DiagSink) -> OResult<()> {
    let mut var_values: IndexMap<String, i64> = IndexMap::new();
    let mut var_lines: IndexMap<String, u32> = IndexMap::new();

    // collect (and remove) the writes in main
    let function = program
        .functions
        .get_mut(MAIN)
        .expect("main function always exists");
    let body = std::mem::take(&mut function.body);
    let mut new_body = Vec::with_capacity(body.len());
    let mut line = 0u32;

    for op in body {
        if let Op::Marker { line: l, .. } = &op {
            line = *l;
            new_body.push(op);
            continue;
        }
        let target_name = op.target().and_then(|t| match t {
            Value::Var(VarName::User(n)) if values::is_ed_variable(n) => Some(n.clone()),
            _ => None,
        });
        if let Some(name) = target_name {
            if var_values.contains_key(&name) {
                return Err(opt_err(diag, Kind::OptEdAssignAgain, &[&line, &name]));
            }
            let constant = match &op {
                Op::UAssign { op: UnaryOp::UAdd, operand: Value::Int(c), .. } => *c,
                _ => {
                    return Err(opt_err(diag, Kind::OptEdAssignNotConstant, &[&line, &name]));
                }
            };
            let allowed = values::ed_variable_allowed(&name).expect("checked ed variable name");
            if !allowed.contains(&constant) {
                return Err(opt_err(diag, Kind::OptEdAssignBadValue, &[&line, &name]));
            }
            var_values.insert(name.clone(), constant);
            var_lines.insert(name, line);
            continue; // the write op is discarded
        }
        new_body.push(op);
    }
    function.body = new_body;

    for (name, _) in values::ED_VARIABLES.iter() {
        if !var_values.contains_key(*name) {
            return Err(opt_err(diag, Kind::OptEdAssignNotSet, &[&0, name]));
        }
    }

    let version = var_values["Ed.EdisonVersion"];
    let distance = var_values["Ed.DistanceUnits"];

    // version 1 has no wheel encoders, so only TIME units work
    if version == values::CONSTANTS["Ed.V1"] && distance != values::CONSTANTS["Ed.TIME"] {
        let at = var_lines["Ed.DistanceUnits"];
        return Err(opt_err(
            diag,
            Kind::OptEdFunctionNotAvailable,
            &[&at, &"drive by distance", &version],
        ));
    }

    // no other function may write the program variables
    for (fname, function) in &program.functions {
        if fname == MAIN {
            continue;
        }
        let mut line = 0u32;
        for op in &function.body {
            if let Op::Marker { line: l, .. } = op {
                line = *l;
                continue;
            }
            if let Some(Value::Var(VarName::User(n))) = op.target() {
                if values::is_ed_variable(n) {
                    return Err(opt_err(diag, Kind::OptEdAssignInFunction, &[&line, n]));
                }
            }
        }
    }

    program.ed_variables = var_values;

    let bad_functions = values::not_available_functions(version);
    let not_used_with_time = ["Ed.ResetDistance", "Ed.SetDistance", "Ed.ReadDistance"];
    let suffix = match distance {
        0 => "_CM",
        1 => "_INCH",
        _ => "_TIME",
    };
    let possible_inline = ["Ed.Drive", "Ed.DriveLeftMotor", "Ed.DriveRightMotor"];
    let rewrite_functions = [
        "Ed.Drive",
        "Ed.DriveLeftMotor",
        "Ed.DriveRightMotor",
        "Ed.SetDistance",
        "Ed.ReadDistance",
    ];
    let time_units = distance == values::CONSTANTS["Ed.TIME"];

    for function in program.functions.values_mut() {
        let mut line = 0u32;
        for op in function.body.iter_mut() {
            match op {
                Op::Marker { line: l, .. } => line = *l,
                Op::Call { name, args, .. } => {
                    if bad_functions.contains(&name.as_str()) {
                        return Err(opt_err(
                            diag,
                            Kind::OptEdFunctionNotAvailable,
                            &[&line, &*name, &version],
                        ));
                    }
                    if time_units && not_used_with_time.contains(&name.as_str()) {
                        return Err(opt_err(
                            diag,
                            Kind::OptEdFunctionNotUseful,
                            &[&line, &*name, &"Ed.TIME"],
                        ));
                    }

                    if possible_inline.contains(&name.as_str()) && args.len() == 3 {
                        let all_const = args.iter().all(Value::is_int_const);
                        if all_const {
                            let unlimited = args[2].as_int()
                                == Some(values::CONSTANTS["Ed.DISTANCE_UNLIMITED"]);
                            let stopping =
                                args[0].as_int() == Some(values::CONSTANTS["Ed.STOP"]);
                            if unlimited || stopping {
                                name.push_str("_INLINE_UNLIMITED");
                            }
                        }
                    }

                    if rewrite_functions.contains(&name.as_str()) {
                        name.push_str(suffix);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Pass: type and shape inference
// ===========================================================================

fn var_name_str(value: &Value) -> Option<&str> {
    match value {
        Value::Var(VarName::User(n)) => Some(n),
        Value::Slice { name, .. } => Some(name),
        _ => None,
    }
}

/// Look up a read variable: local first, then global, then a dotted object
/// member (whose type is an integer slot in the object).
fn read_var_type(
    name: &VarName,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<TypeInfo> {
    if let Some(t) = lcl.get(name) {
        return Ok(t.clone());
    }
    if let VarName::User(n) = name {
        if let Some(t) = glb.get(n) {
            return Ok(t.clone());
        }
        if let Some((obj, member)) = n.split_once('.') {
            if !member.is_empty() {
                let obj_key = VarName::user(obj);
                if let Some(t) = lcl.get(&obj_key).or_else(|| glb.get(obj)) {
                    return Ok(TypeInfo {
                        tag: TypeTag::Int,
                        extra: t.extra.clone(),
                    });
                }
            }
        }
    }
    Err(opt_err(diag, Kind::OptVarNotBound, &[&line, &name.to_string()]))
}

fn verify_value_is_int(
    value: &Value,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<()> {
    if value.is_int_const() || value.is_temp() {
        return Ok(());
    }
    if let Value::Var(vn) = value {
        let info = read_var_type(vn, lcl, glb, line, diag)?;
        if info.tag != TypeTag::Int {
            return Err(opt_err(diag, Kind::OptVarNotInt, &[&line, &vn.to_string()]));
        }
    }
    Ok(())
}

/// Does this value (slice or plain variable) name a tune string the writer
/// can see?
fn is_tune_string_element(
    value: &Value,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    glb_access: &[String],
) -> bool {
    let name = match var_name_str(value) {
        Some(n) => n,
        None => return false,
    };
    if name.contains('.') {
        return false;
    }
    let existing = if let Some(t) = lcl.get(&VarName::user(name)) {
        Some(t)
    } else if glb.contains_key(name) && glb_access.iter().any(|g| g == name) {
        glb.get(name)
    } else {
        None
    };
    matches!(existing, Some(t) if t.tag == TypeTag::Tune)
}

fn verify_target_is_tune_string_element(
    value: &Value,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    glb_access: &[String],
    line: u32,
    diag: &mut DiagSink,
) -> OResult<()> {
    if !value.is_assignable() {
        return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
    }
    if !is_tune_string_element(value, lcl, glb, glb_access) {
        return Err(opt_err(
            diag,
            Kind::OptVarTypeChanged,
            &[&line, &value.display_name()],
        ));
    }
    Ok(())
}

/// A sliced target must be a known tune string or list.
fn verify_valid_slice_target(
    target: Option<&Value>,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<()> {
    let target = match target {
        Some(t) => t,
        None => return Ok(()),
    };
    if let Value::Slice { name, .. } = target {
        let local = lcl.get(&VarName::user(name));
        let global = glb.get(name.as_str());
        if local.is_none() && global.is_none() {
            return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
        }
        for info in [local, global].into_iter().flatten() {
            if !matches!(info.tag, TypeTag::Tune | TypeTag::List) {
                return Err(opt_err(diag, Kind::OptVarMustBeTsOrList, &[&line, name]));
            }
        }
    }
    Ok(())
}

/// Record (or verify) the type written into a target. Writes may not change
/// a binding's type, with two widenings allowed: a tune string accepts a
/// one-character string, and a list slot accepts anything (a reference is
/// just a word).
#[allow(clippy::too_many_arguments)]
fn check_write_var_type(
    value: &Value,
    type_info: TypeInfo,
    lcl: &mut IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    glb_access: &[String],
    internal: bool,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<()> {
    if !value.is_assignable() {
        return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
    }

    // the key under which this binding lives
    let key: VarName = match value {
        Value::Var(vn) => vn.clone(),
        Value::Slice { name, .. } => VarName::user(name),
        _ => return Err(opt_err(diag, Kind::OptNotAssignable, &[&line])),
    };

    if let VarName::User(name) = &key {
        if let Some((class_part, member)) = name.split_once('.') {
            if !member.is_empty() {
                if class_part == "Ed" {
                    if values::is_ed_variable(name) {
                        if type_info.tag != TypeTag::Int {
                            return Err(opt_err(diag, Kind::OptVarTypeChanged, &[&line, name]));
                        }
                        return Ok(());
                    }
                    return Err(opt_err(diag, Kind::OptReservedName, &[&line, name]));
                }

                // a member write: the base must be an object in scope
                let class_info = if let Some(t) = lcl.get(&VarName::user(class_part)) {
                    Some(t.clone())
                } else if glb.contains_key(class_part) {
                    if glb_access.iter().any(|g| g == class_part || g == name) {
                        glb.get(class_part).cloned()
                    } else {
                        return Err(opt_err(diag, Kind::OptLclHidesGlb, &[&line, name]));
                    }
                } else if class_part == "self" {
                    None // methods introduce self.* members below
                } else {
                    return Err(opt_err(diag, Kind::OptLclHidesGlb, &[&line, name]));
                };
                if let Some(info) = class_info {
                    if info.tag != TypeTag::Object {
                        return Err(opt_err(diag, Kind::OptLclHidesGlb, &[&line, name]));
                    }
                }
            }
        }
    }

    let existing = if let Some(t) = lcl.get(&key) {
        Some(t.clone())
    } else if let VarName::User(name) = &key {
        if let Some(t) = glb.get(name) {
            if glb_access.iter().any(|g| g == name) {
                Some(t.clone())
            } else if !internal {
                return Err(opt_err(diag, Kind::OptLclHidesGlb, &[&line, name]));
            } else {
                None
            }
        } else {
            None
        }
    } else {
        None
    };

    match existing {
        Some(existing) => {
            let widening_to_tune =
                existing.tag == TypeTag::Tune && type_info == TypeInfo::str_of_len(1);
            let widening_to_list = existing.tag == TypeTag::List && type_info.tag != TypeTag::List;
            if type_info != existing && !widening_to_tune && !widening_to_list {
                return Err(opt_err(
                    diag,
                    Kind::OptVarTypeChanged,
                    &[&line, &value.display_name()],
                ));
            }
        }
        None => {
            if !value.is_simple_var() {
                return Err(opt_err(
                    diag,
                    Kind::OptVarNotBound,
                    &[&line, &value.display_name()],
                ));
            }
            lcl.insert(key, type_info);
        }
    }
    Ok(())
}

fn clear_simple_temps_from_vars(lcl: &mut IndexMap<VarName, TypeInfo>) -> bool {
    let before = lcl.len();
    lcl.retain(|k, _| !k.is_simple_temp());
    before != lcl.len()
}

fn verify_signature(
    new_args: &[TypeInfo],
    old: &[SigParam],
    call_name: &str,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<()> {
    if new_args.len() != old.len() {
        return Err(opt_err(diag, Kind::OptIncorrectArgUse, &[&line, &call_name]));
    }
    for (arg, param) in new_args.iter().zip(old) {
        if !param.accepts(arg) {
            return Err(opt_err(diag, Kind::OptIncorrectArgUse, &[&line, &call_name]));
        }
    }
    Ok(())
}

/// The argument-type tuple of a call, as seen at the call site.
fn derive_arg_type(
    arg: &Value,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
    line: u32,
    diag: &mut DiagSink,
) -> OResult<TypeInfo> {
    match arg {
        Value::Var(vn) => read_var_type(vn, lcl, glb, line, diag),
        Value::Str(s) => Ok(TypeInfo::str_of_len(s.len() as i64)),
        Value::IntList(_) => Ok(TypeInfo::plain(TypeTag::Vector)),
        Value::TuneRef(_) => Ok(TypeInfo::plain(TypeTag::Tune)),
        Value::ListRef(_) => Ok(TypeInfo::plain(TypeTag::List)),
        Value::ObjRef(_) => Ok(TypeInfo::plain(TypeTag::Object)),
        Value::Slice { name, .. } => {
            let info = read_var_type(&VarName::user(name), lcl, glb, line, diag)?;
            match info.tag {
                TypeTag::List => Ok(TypeInfo::int()),
                TypeTag::Tune => Ok(TypeInfo::str_of_len(1)),
                _ => Err(opt_err(diag, Kind::OptSliceNotAllowed, &[&line, name])),
            }
        }
        _ => Ok(TypeInfo::int()),
    }
}

/// Infer variable types through one function, verify its argument count,
/// and record or check the signatures of everything it calls.
fn type_variables_by_func(
    program: &mut Program,
    func_name: &str,
    call_list: &mut Vec<(String, String)>,
    diag: &mut DiagSink,
) -> OResult<()> {
    if !program.functions.contains_key(func_name) {
        return Err(opt_err(diag, Kind::OptUnknownFunction, &[&0, &func_name]));
    }

    let mut function = program
        .functions
        .get(func_name)
        .expect("checked above")
        .clone();
    let mut lcl: IndexMap<VarName, TypeInfo> = IndexMap::new();
    let mut simple_temps_used = false;
    let mut line = 0u32;
    let internal = function.internal;

    let sig_len = program
        .signatures
        .get(func_name)
        .map(Vec::len)
        .unwrap_or(0);
    if function.args.len() != sig_len {
        return Err(opt_err(diag, Kind::OptIncorrectArgDefine, &[&line, &func_name]));
    }

    for g in &function.global_access {
        if !program.global_var.contains_key(g) {
            return Err(opt_err(diag, Kind::OptNotAGlobalVar, &[&line, g]));
        }
    }

    // seed the locals from the signature
    let params = program.signatures[func_name].clone();
    for (arg, param) in function.args.iter().zip(&params) {
        let info = match param {
            SigParam::Exact(t) => t.clone(),
            SigParam::AnyOf(tags) => TypeInfo::plain(tags[0]),
        };
        lcl.insert(VarName::user(arg), info);
    }

    let body = function.body.clone();
    for op in &body {
        match op {
            Op::Marker { line: l, .. } => {
                line = *l;
                if clear_simple_temps_from_vars(&mut lcl) {
                    simple_temps_used = true;
                }
            }
            Op::UAssign { target, operand, .. } => {
                if !target.is_assignable() {
                    return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
                }
                verify_valid_slice_target(Some(target), &lcl, &program.global_var, line, diag)?;

                if let Value::Str(s) = operand {
                    // a character may only land in a tune-string element;
                    // a string over an existing binding is a type change,
                    // anywhere else strings are simply not allowed
                    if s.len() == 1 && target.is_slice() {
                        verify_target_is_tune_string_element(
                            target,
                            &lcl,
                            &program.global_var,
                            &function.global_access,
                            line,
                            diag,
                        )?;
                    } else {
                        let bound = match target {
                            Value::Var(vn) => {
                                lcl.contains_key(vn)
                                    || vn
                                        .as_user()
                                        .is_some_and(|n| program.global_var.contains_key(n))
                            }
                            _ => false,
                        };
                        if bound {
                            return Err(opt_err(
                                diag,
                                Kind::OptVarTypeChanged,
                                &[&line, &target.display_name()],
                            ));
                        }
                        return Err(opt_err(diag, Kind::OptStringNotAllowed, &[&line]));
                    }
                } else if operand.is_slice()
                    && is_tune_string_element(
                        operand,
                        &lcl,
                        &program.global_var,
                        &function.global_access,
                    )
                {
                    if target.is_slice() {
                        verify_target_is_tune_string_element(
                            target,
                            &lcl,
                            &program.global_var,
                            &function.global_access,
                            line,
                            diag,
                        )?;
                    } else {
                        return Err(opt_err(diag, Kind::OptStringNotAllowed, &[&line]));
                    }
                } else {
                    let info = match operand {
                        Value::IntList(_) => {
                            return Err(opt_err(diag, Kind::OptListNotAllowed, &[&line]));
                        }
                        Value::TuneRef(_) => TypeInfo::plain(TypeTag::Tune),
                        Value::ListRef(_) => TypeInfo::plain(TypeTag::List),
                        Value::ObjRef(_) => TypeInfo::plain(TypeTag::Object),
                        Value::Var(vn) => read_var_type(vn, &lcl, &program.global_var, line, diag)?,
                        _ => TypeInfo::int(),
                    };
                    check_write_var_type(
                        target,
                        info,
                        &mut lcl,
                        &program.global_var,
                        &function.global_access,
                        internal,
                        line,
                        diag,
                    )?;
                }
            }
            Op::BAssign { target, left, right, .. } => {
                if !target.is_assignable() {
                    return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
                }
                verify_valid_slice_target(Some(target), &lcl, &program.global_var, line, diag)?;
                if left.is_simple_var() {
                    verify_value_is_int(left, &lcl, &program.global_var, line, diag)?;
                }
                if right.is_simple_var() {
                    verify_value_is_int(right, &lcl, &program.global_var, line, diag)?;
                }
                check_write_var_type(
                    target,
                    TypeInfo::int(),
                    &mut lcl,
                    &program.global_var,
                    &function.global_access,
                    internal,
                    line,
                    diag,
                )?;
            }
            Op::BoolCheck { target, .. } => {
                if !target.is_assignable() {
                    return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
                }
                verify_valid_slice_target(Some(target), &lcl, &program.global_var, line, diag)?;
                check_write_var_type(
                    target,
                    TypeInfo::int(),
                    &mut lcl,
                    &program.global_var,
                    &function.global_access,
                    internal,
                    line,
                    diag,
                )?;
            }
            Op::LoopControl { test, .. } => {
                if let Value::Var(vn) = test {
                    if !vn.is_temp() {
                        read_var_type(vn, &lcl, &program.global_var, line, diag)?;
                    }
                }
            }
            Op::ForControl { iter, .. } => match iter {
                ForIter::Array(value) => {
                    let name = var_name_str(value).unwrap_or("");
                    let info =
                        read_var_type(&VarName::user(name), &lcl, &program.global_var, line, diag)?;
                    if !matches!(info.tag, TypeTag::Tune | TypeTag::List) {
                        return Err(opt_err(diag, Kind::OptIncorrectArgUse, &[&line, &"range"]));
                    }
                }
                ForIter::Range { limit, current } => {
                    verify_value_is_int(current, &lcl, &program.global_var, line, diag)?;
                    verify_value_is_int(limit, &lcl, &program.global_var, line, diag)?;
                }
            },
            Op::Call { target, name, args } => {
                if let Some(t) = target {
                    if !t.is_assignable() {
                        return Err(opt_err(diag, Kind::OptNotAssignable, &[&line]));
                    }
                }
                verify_valid_slice_target(target.as_ref(), &lcl, &program.global_var, line, diag)?;

                let mut call_name = name.clone();
                let mut call_args = args.clone();

                // a method call on an object variable becomes
                // Class.method(obj, args)
                let (base, method) = match call_name.split_once('.') {
                    Some((b, m)) => (b.to_string(), m.to_string()),
                    None => (call_name.clone(), String::new()),
                };
                if base != "Ed" && !method.is_empty() && !program.classes.contains_key(&base) {
                    let info =
                        read_var_type(&VarName::user(&base), &lcl, &program.global_var, line, diag)?;
                    match (&info.tag, &info.extra) {
                        (TypeTag::Object, TypeExtra::Class(class)) => {
                            call_name = format!("{}.{}", class, method);
                            call_args.insert(0, Value::var(&base));
                        }
                        _ => {
                            return Err(opt_err(diag, Kind::OptNotClassRef, &[&line, &base]));
                        }
                    }
                }

                let mut arg_types = Vec::with_capacity(call_args.len());
                for a in &call_args {
                    arg_types.push(derive_arg_type(a, &lcl, &program.global_var, line, diag)?);
                }

                match program.signatures.get(&call_name) {
                    None => {
                        let recorded: Vec<SigParam> =
                            arg_types.iter().cloned().map(SigParam::Exact).collect();
                        program.signatures.insert(call_name.clone(), recorded);
                    }
                    Some(old) => {
                        verify_signature(&arg_types, old, &call_name, line, diag)?;
                    }
                }

                call_list.push((func_name.to_string(), call_name.clone()));
                if !function.calls_to.contains(&call_name) {
                    function.calls_to.push(call_name.clone());
                }

                if call_name == "Ed.RegisterEventHandler" {
                    let handler = match call_args.get(1) {
                        Some(Value::Str(s)) => s.clone(),
                        _ => {
                            return Err(opt_err(
                                diag,
                                Kind::OptIncorrectArgUse,
                                &[&line, &"Ed.RegisterEventHandler"],
                            ));
                        }
                    };
                    call_list.push((func_name.to_string(), handler.clone()));
                    if !function.calls_to.contains(&handler) {
                        function.calls_to.push(handler.clone());
                    }

                    let code = call_args.first().and_then(Value::as_int);
                    let last = values::CONSTANTS["Ed.EVENT_LAST_EVENT"];
                    let code = match code {
                        Some(c) if (0..=last).contains(&c) => c,
                        _ => {
                            return Err(opt_err(diag, Kind::OptBadEventNumber, &[&line]));
                        }
                    };
                    program.event_handlers.insert(handler.clone(), code);

                    // the handler takes no arguments
                    match program.signatures.get(&handler) {
                        None => {
                            program.signatures.insert(handler, Vec::new());
                        }
                        Some(old) => verify_signature(&[], old, &handler, line, diag)?,
                    }
                }

                if let Some(t) = target {
                    let top_level_only = |diag: &mut DiagSink| -> OResult<()> {
                        if func_name != MAIN || t.is_temp() || !t.is_simple_var() {
                            return Err(opt_err(
                                diag,
                                Kind::OptOnlyAtTopLevel,
                                &[&0, &call_name],
                            ));
                        }
                        Ok(())
                    };

                    let info = if program.classes.contains_key(&base) {
                        if method == "__init__" {
                            top_level_only(diag)?;
                            Some(TypeInfo::object_of(&base))
                        } else {
                            // all methods return an int or nothing
                            Some(TypeInfo::int())
                        }
                    } else if call_name.starts_with("Ed.List") {
                        top_level_only(diag)?;
                        Some(TypeInfo::plain(TypeTag::List))
                    } else if call_name.starts_with("Ed.TuneString") {
                        top_level_only(diag)?;
                        Some(TypeInfo::plain(TypeTag::Tune))
                    } else if call_name == "Ed.CreateObject" {
                        top_level_only(diag)?;
                        let class = match call_args.first() {
                            Some(Value::Str(s)) => s.clone(),
                            _ => String::new(),
                        };
                        Some(TypeInfo::object_of(&class))
                    } else if call_name == "Ed.RegisterEventHandler" {
                        if func_name != MAIN {
                            return Err(opt_err(
                                diag,
                                Kind::OptOnlyAtTopLevel,
                                &[&0, &call_name],
                            ));
                        }
                        None
                    } else if call_name == "chr" {
                        Some(TypeInfo::str_of_len(1))
                    } else {
                        Some(TypeInfo::int())
                    };

                    if let Some(info) = info {
                        check_write_var_type(
                            t,
                            info,
                            &mut lcl,
                            &program.global_var,
                            &function.global_access,
                            internal,
                            line,
                            diag,
                        )?;
                    }
                }

                // persist the rewritten call
                let _ = (call_name, call_args);
            }
            _ => {}
        }
    }

    // apply method-call rewrites discovered above to the stored body
    rewrite_method_calls(&mut function, &lcl, &program.global_var);

    if clear_simple_temps_from_vars(&mut lcl) {
        simple_temps_used = true;
    }
    function.local_var = lcl;
    function.max_simple_temps = if simple_temps_used { 1 } else { 0 };

    program.functions.insert(func_name.to_string(), function);
    Ok(())
}

/// Rewrite `obj.m(args)` into `Class.m(obj, args)` in the stored body, for
/// every object variable known in this function's scope.
fn rewrite_method_calls(
    function: &mut Function,
    lcl: &IndexMap<VarName, TypeInfo>,
    glb: &IndexMap<String, TypeInfo>,
) {
    for op in function.body.iter_mut() {
        if let Op::Call { name, args, .. } = op {
            let (base, method) = match name.split_once('.') {
                Some((b, m)) => (b.to_string(), m.to_string()),
                None => continue,
            };
            if base == "Ed" || method.is_empty() {
                continue;
            }
            let info = lcl
                .get(&VarName::user(&base))
                .cloned()
                .or_else(|| glb.get(&base).cloned());
            if let Some(TypeInfo { tag: TypeTag::Object, extra: TypeExtra::Class(class) }) = info {
                *name = format!("{}.{}", class, method);
                args.insert(0, Value::var(&base));
            }
        }
    }
}

/// Drop main locals that are members of known objects (the object itself
/// carries them).
fn clean_out_object_variables(program: &mut Program, func_name: &str) {
    let glb_names: Vec<String> = program.global_var.keys().cloned().collect();
    let function = match program.functions.get_mut(func_name) {
        Some(f) => f,
        None => return,
    };
    let old = std::mem::take(&mut function.local_var);
    let mut kept: IndexMap<VarName, TypeInfo> = IndexMap::new();

    for (name, info) in old {
        let keep = match &name {
            VarName::Temp(_) => true,
            VarName::User(n) => match n.split_once('.') {
                Some((obj, member)) if !member.is_empty() => {
                    let known = kept.contains_key(&VarName::user(obj))
                        || glb_names.iter().any(|g| g == obj);
                    !known
                }
                _ => true,
            },
        };
        if keep {
            kept.insert(name, info);
        }
    }
    function.local_var = kept;
}

/// Main's named locals become globals; temps stay on main's frame.
fn move_main_locals_to_globals(program: &mut Program) {
    let function = program
        .functions
        .get_mut(MAIN)
        .expect("main function always exists");
    let old = std::mem::take(&mut function.local_var);
    let mut kept: IndexMap<VarName, TypeInfo> = IndexMap::new();

    for (name, info) in old {
        match name {
            VarName::Temp(_) => {
                kept.insert(name, info);
            }
            VarName::User(n) => {
                program.global_var.insert(n, info);
            }
        }
    }
    function.local_var = kept;

    for name in program.global_var.keys() {
        function.global_access.push(name.clone());
    }
}

/// Worklist from `__main__`: type main, promote its locals, do `__init__`
/// methods, then everything reachable.
fn type_variables(program: &mut Program, diag: &mut DiagSink) -> OResult<()> {
    let mut call_list: Vec<(String, String)> = Vec::new();
    let mut processed: Vec<String> = vec![MAIN.to_string()];

    program.signatures.insert(MAIN.to_string(), Vec::new());
    program.global_var.clear();

    if program.imports.iter().any(|i| i == "Ed") {
        for (name, _) in values::ED_VARIABLES.iter() {
            program.global_var.insert(name.to_string(), TypeInfo::int());
        }
    }

    type_variables_by_func(program, MAIN, &mut call_list, diag)?;
    clean_out_object_variables(program, MAIN);
    move_main_locals_to_globals(program);

    // constructors introduce the class data, so do them first
    let init_callees: Vec<String> = call_list
        .iter()
        .map(|(_, callee)| callee.clone())
        .filter(|c| c.ends_with(".__init__"))
        .collect();
    for callee in init_callees {
        if !processed.contains(&callee) {
            type_variables_by_func(program, &callee, &mut call_list, diag)?;
            processed.push(callee);
        }
    }

    let mut old_len = 0usize;
    while call_list.len() > old_len {
        old_len = call_list.len();
        let snapshot: Vec<String> = call_list.iter().map(|(_, c)| c.clone()).collect();
        for callee in snapshot {
            if processed.contains(&callee) {
                continue;
            }
            type_variables_by_func(program, &callee, &mut call_list, diag)?;
            processed.push(callee);
        }
    }

    // every registered event handler must exist and take no arguments
    let handlers: Vec<(String, i64)> = program
        .event_handlers
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    for (handler, at) in handlers {
        if !program.functions.contains_key(&handler) {
            return Err(opt_err(
                diag,
                Kind::OptIncorrectArgUse,
                &[&at, &"Ed.RegisterEventHandler"],
            ));
        }
        let sig = program.signatures[&handler].clone();
        verify_signature(&[], &sig, &handler, at as u32, diag)?;
    }

    Ok(())
}

// ===========================================================================
// Pass: class data validation
// ===========================================================================

fn verify_class_data(program: &Program, diag: &mut DiagSink) -> OResult<()> {
    for (class_name, class) in &program.classes {
        if !class.func_names.iter().any(|f| f == "__init__") {
            return Err(opt_err(diag, Kind::OptClassInitError, &[class_name]));
        }

        let init = &program.functions.get(&format!("{}.__init__", class_name));
        let ok_self_vars: Vec<String> = match init {
            Some(f) => f
                .local_var
                .keys()
                .filter_map(|k| k.as_user())
                .filter(|n| n.starts_with("self."))
                .map(String::from)
                .collect(),
            None => Vec::new(),
        };

        for method in &class.func_names {
            if method == "__init__" {
                continue;
            }
            let full = format!("{}.{}", class_name, method);
            let function = match program.functions.get(&full) {
                Some(f) => f,
                None => continue, // removed as unreachable
            };
            for key in function.local_var.keys() {
                if let Some(name) = key.as_user() {
                    if name.starts_with("self.") && !ok_self_vars.iter().any(|v| v == name) {
                        return Err(opt_err(
                            diag,
                            Kind::OptClassDataError,
                            &[class_name, method, &name],
                        ));
                    }
                }
            }
        }
    }

    // every dotted local must be Ed, self-in-a-method, or a global object
    for (func_name, function) in &program.functions {
        for key in function.local_var.keys() {
            let name = match key.as_user() {
                Some(n) => n,
                None => continue,
            };
            let (obj, member) = match name.split_once('.') {
                Some(p) => p,
                None => continue,
            };
            if member.is_empty() || obj == "Ed" {
                continue;
            }
            if obj == "self" {
                if !func_name.contains('.') {
                    return Err(opt_err(
                        diag,
                        Kind::OptSelfNotInMethod,
                        &[&func_name, &name],
                    ));
                }
            } else if !program.global_var.contains_key(obj) {
                return Err(opt_err(diag, Kind::OptNotClassRef, &[&0, &name]));
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Pass: constant range validation
// ===========================================================================

fn verify_constant_range(program: &Program, diag: &mut DiagSink) -> OResult<()> {
    for function in program.functions.values() {
        let mut line = 0u32;
        for op in &function.body {
            if let Op::Marker { line: l, .. } = op {
                line = *l;
                continue;
            }
            for v in op.values() {
                if let Value::Int(c) = v {
                    if *c < MIN_WORD {
                        return Err(opt_err(diag, Kind::OptConstantTooNegative, &[&line, c]));
                    }
                    if *c > MAX_WORD {
                        return Err(opt_err(diag, Kind::OptConstantTooPositive, &[&line, c]));
                    }
                }
            }
        }
    }
    Ok(())
}

// ===========================================================================
// Pass: unreachable function removal
// ===========================================================================

fn remove_uncalled_functions(program: &mut Program, diag: &mut DiagSink) -> OResult<()> {
    let mut call_list: Vec<String> = vec![MAIN.to_string()];
    let mut processed: Vec<String> = Vec::new();
    let mut old_len = 0usize;

    while call_list.len() > old_len {
        old_len = call_list.len();
        let snapshot = call_list.clone();
        for name in snapshot {
            if processed.contains(&name) {
                continue;
            }
            match program.functions.get(&name) {
                Some(f) => {
                    for callee in &f.calls_to {
                        if !call_list.contains(callee) {
                            call_list.push(callee.clone());
                        }
                    }
                }
                None => {
                    return Err(opt_err(diag, Kind::OptFunctionNotDefined, &[&name]));
                }
            }
            processed.push(name);
        }
    }

    program.functions.retain(|name, _| call_list.contains(name));
    Ok(())
}

// ===========================================================================
// Pass: temp compaction
// ===========================================================================

fn renumber_value(value: &Value, map: &IndexMap<u32, u32>) -> Value {
    match value {
        Value::Var(VarName::Temp(edc_core::program::Temp::Simple(n))) => {
            Value::temp(*map.get(n).unwrap_or(n))
        }
        Value::Slice {
            name,
            index: edc_core::program::SliceIndex::Var(VarName::Temp(edc_core::program::Temp::Simple(n))),
        } => Value::slice_var(
            name,
            VarName::Temp(edc_core::program::Temp::Simple(*map.get(n).unwrap_or(n))),
        ),
        other => other.clone(),
    }
}

/// Renumber the simple temps of one source line to be contiguous from 0.
fn compact_line(ops: &mut [Op]) -> u32 {
    let mut map: IndexMap<u32, u32> = IndexMap::new();
    let mut next = 0u32;
    let mut note = |v: &Value| {
        let n = match v {
            Value::Var(VarName::Temp(edc_core::program::Temp::Simple(n))) => *n,
            Value::Slice {
                index: edc_core::program::SliceIndex::Var(VarName::Temp(edc_core::program::Temp::Simple(n))),
                ..
            } => *n,
            _ => return,
        };
        if !map.contains_key(&n) {
            map.insert(n, next);
            next += 1;
        }
    };

    for op in ops.iter() {
        for v in op.values() {
            note(v);
        }
        if let Some(t) = op.target() {
            note(t);
        }
    }

    if map.is_empty() {
        return 0;
    }

    for op in ops.iter_mut() {
        match op {
            Op::LoopControl { test, .. } => *test = renumber_value(test, &map),
            Op::ForControl { iter, .. } => match iter {
                ForIter::Array(v) => *v = renumber_value(v, &map),
                ForIter::Range { limit, current } => {
                    *limit = renumber_value(limit, &map);
                    *current = renumber_value(current, &map);
                }
            },
            Op::BoolCheck { value, target, .. } => {
                *value = renumber_value(value, &map);
                *target = renumber_value(target, &map);
            }
            Op::UAssign { target, operand, .. } => {
                *target = renumber_value(target, &map);
                *operand = renumber_value(operand, &map);
            }
            Op::BAssign { target, left, right, .. } => {
                *target = renumber_value(target, &map);
                *left = renumber_value(left, &map);
                *right = renumber_value(right, &map);
            }
            Op::Call { target, args, .. } => {
                if let Some(t) = target {
                    *t = renumber_value(t, &map);
                }
                for a in args.iter_mut() {
                    *a = renumber_value(a, &map);
                }
            }
            Op::Return { value: Some(v) } => *v = renumber_value(v, &map),
            _ => {}
        }
    }

    map.len() as u32
}

fn temp_collapsing(program: &mut Program) {
    for function in program.functions.values_mut() {
        if function.max_simple_temps == 0 {
            continue;
        }

        let body = std::mem::take(&mut function.body);
        let mut new_body: Vec<Op> = Vec::with_capacity(body.len());
        let mut buffer: Vec<Op> = Vec::new();
        let mut max_used = 0u32;

        for op in body {
            if op.is_marker() {
                if !buffer.is_empty() {
                    max_used = max_used.max(compact_line(&mut buffer));
                    new_body.append(&mut buffer);
                }
                new_body.push(op);
            } else {
                buffer.push(op);
            }
        }
        if !buffer.is_empty() {
            max_used = max_used.max(compact_line(&mut buffer));
            new_body.append(&mut buffer);
        }

        function.body = new_body;
        function.max_simple_temps = max_used;
    }
}

// ===========================================================================
// Driver
// ===========================================================================

/// Run the full pass sequence over a parsed program.
pub fn optimise(program: &mut Program, diag: &mut DiagSink) -> Result<(), StageError> {
    diag.top(Kind::OptStart, &[]);

    let result = (|| -> OResult<()> {
        ed_constant_replacement(program, diag)?;

        loop {
            let mut changed = constant_removal(program, diag)?;
            changed |= simple_var_removal(program, diag)?;
            if !changed {
                break;
            }
        }

        remove_useless_markers(program);
        simple_call_collapse(program);
        fix_up_calls(program, diag)?;
        verify_edison_variables(program, diag)?;
        type_variables(program, diag)?;
        verify_class_data(program, diag)?;
        verify_constant_range(program, diag)?;
        remove_uncalled_functions(program, diag)?;
        temp_collapsing(program);
        Ok(())
    })();

    if diag.dump_mask() & diag::dump::OPTIMISER != 0 {
        program.dump(true);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use edc_core::diag::{Level, SinkKind};

    const PREAMBLE: &str = "import Ed\n\
                            Ed.EdisonVersion = Ed.V2\n\
                            Ed.DistanceUnits = Ed.CM\n\
                            Ed.Tempo = Ed.TEMPO_MEDIUM\n";

    fn build(src: &str) -> (Program, DiagSink) {
        let mut d = DiagSink::new();
        d.set_sink(SinkKind::Test);
        d.set_max_level(Level::Error);
        let mut p = Program::new();
        parser::parse_string(src, "test.py", &mut p, &mut d).expect("parse should succeed");
        (p, d)
    }

    fn optimise_ok(src: &str) -> Program {
        let (mut p, mut d) = build(src);
        optimise(&mut p, &mut d).expect("optimise should succeed");
        p
    }

    fn optimise_err(src: &str) -> u32 {
        let (mut p, mut d) = build(src);
        assert!(optimise(&mut p, &mut d).is_err());
        d.test_lines()
            .last()
            .unwrap()
            .split(',')
            .nth(1)
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn constants_fold_through_lines() {
        let p = optimise_ok(&format!("{}x = 2 + 3 * 4\n", PREAMBLE));
        let body = &p.functions[MAIN].body;
        assert!(body.iter().any(|op| matches!(
            op,
            Op::UAssign { target: Value::Var(VarName::User(n)), operand: Value::Int(14), .. } if n == "x"
        )));
        // no BAssign survives the folding
        assert!(!body.iter().any(|op| matches!(op, Op::BAssign { .. })));
    }

    #[test]
    fn comparisons_fold_to_zero_or_one() {
        let p = optimise_ok(&format!("{}x = 3 < 4\n", PREAMBLE));
        assert!(p.functions[MAIN].body.iter().any(|op| matches!(
            op,
            Op::UAssign { operand: Value::Int(1), .. }
        )));
    }

    #[test]
    fn division_truncates() {
        let p = optimise_ok(&format!("{}x = 0 - 7\ny = x / 2\n", PREAMBLE));
        assert!(p.functions[MAIN].body.iter().any(|op| matches!(
            op,
            Op::UAssign { operand: Value::Int(-3), .. }
        )));
    }

    #[test]
    fn ed_variables_recorded_and_removed() {
        let p = optimise_ok(&format!("{}Ed.PlayBeep()\n", PREAMBLE));
        assert_eq!(p.ed_variables["Ed.EdisonVersion"], 2);
        assert_eq!(p.ed_variables["Ed.DistanceUnits"], 0);
        assert_eq!(p.ed_variables["Ed.Tempo"], 250);
        // the writes were removed from the body
        assert!(!p.functions[MAIN].body.iter().any(|op| matches!(
            op.target(),
            Some(Value::Var(VarName::User(n))) if n.starts_with("Ed.")
        )));
    }

    #[test]
    fn ed_variable_set_twice_is_an_error() {
        let kind = optimise_err(&format!("{}Ed.Tempo = Ed.TEMPO_FAST\n", PREAMBLE));
        assert_eq!(kind, Kind::OptEdAssignAgain as u32);
    }

    #[test]
    fn ed_variable_missing_is_an_error() {
        let kind = optimise_err("import Ed\nEd.EdisonVersion = Ed.V2\nEd.Tempo = Ed.TEMPO_MEDIUM\n");
        assert_eq!(kind, Kind::OptEdAssignNotSet as u32);
    }

    #[test]
    fn v1_requires_time_units() {
        let kind = optimise_err(
            "import Ed\nEd.EdisonVersion = Ed.V1\nEd.DistanceUnits = Ed.CM\nEd.Tempo = Ed.TEMPO_MEDIUM\n",
        );
        assert_eq!(kind, Kind::OptEdFunctionNotAvailable as u32);
    }

    #[test]
    fn drive_calls_get_unit_suffixes() {
        let p = optimise_ok(&format!("{}x = 1\nEd.Drive(Ed.FORWARD, 5, x)\n", PREAMBLE));
        assert!(p.functions[MAIN]
            .calls_to
            .iter()
            .any(|c| c == "Ed.Drive_CM"));
    }

    #[test]
    fn unlimited_constant_drive_is_marked_inline() {
        let p = optimise_ok(&format!(
            "{}Ed.Drive(Ed.FORWARD, 5, Ed.DISTANCE_UNLIMITED)\n",
            PREAMBLE
        ));
        assert!(p.functions[MAIN]
            .calls_to
            .iter()
            .any(|c| c == "Ed.Drive_INLINE_UNLIMITED"));
    }

    #[test]
    fn type_change_is_rejected() {
        let kind = optimise_err(&format!("{}x = 1\nx = \"ab\"\n", PREAMBLE));
        assert_eq!(kind, Kind::OptVarTypeChanged as u32);

        let kind = optimise_err(&format!(
            "{}t = Ed.TuneString(4, \"abz\")\nx = 1\nt = x\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptVarTypeChanged as u32);
    }

    #[test]
    fn tune_string_too_long_is_rejected() {
        let kind = optimise_err(&format!("{}t = Ed.TuneString(4, \"abcdef\")\n", PREAMBLE));
        assert_eq!(kind, Kind::OptEdListTooLong as u32);
    }

    #[test]
    fn unknown_ed_function_is_rejected() {
        let kind = optimise_err(&format!("{}Ed.Bogus()\n", PREAMBLE));
        assert_eq!(kind, Kind::OptUnknownEdFunction as u32);
    }

    #[test]
    fn write_to_constant_is_rejected() {
        let kind = optimise_err(&format!("{}Ed.ON = 2\n", PREAMBLE));
        assert_eq!(kind, Kind::OptWriteToEdPyConstant as u32);
    }

    #[test]
    fn none_is_rejected() {
        let kind = optimise_err(&format!("{}x = None\n", PREAMBLE));
        assert_eq!(kind, Kind::OptNotSupported as u32);
    }

    #[test]
    fn constant_out_of_range_is_rejected() {
        let kind = optimise_err(&format!("{}x = 40000\n", PREAMBLE));
        assert_eq!(kind, Kind::OptConstantTooPositive as u32);
    }

    #[test]
    fn uncalled_functions_are_removed() {
        let p = optimise_ok(&format!("{}def unused():\n    return 1\nEd.PlayBeep()\n", PREAMBLE));
        assert!(!p.functions.contains_key("unused"));
        assert!(p.functions.contains_key("Ed.PlayBeep"));
    }

    #[test]
    fn called_functions_survive_with_signatures() {
        let p = optimise_ok(&format!(
            "{}def double(n):\n    return n + n\nx = double(4)\n",
            PREAMBLE
        ));
        assert!(p.functions.contains_key("double"));
        assert_eq!(p.signatures["double"].len(), 1);
    }

    #[test]
    fn wrong_arg_count_is_rejected() {
        // a single call records the one-arg signature; the definition then
        // fails to match it
        let kind = optimise_err(&format!(
            "{}def f(a, b):\n    return a + b\nx = f(1)\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptIncorrectArgDefine as u32);

        // a second, different call fails at the call site
        let kind = optimise_err(&format!(
            "{}def f(a, b):\n    return a + b\nx = f(1, 2)\ny = f(3)\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptIncorrectArgUse as u32);
    }

    #[test]
    fn event_registration_builds_the_table() {
        let p = optimise_ok(&format!(
            "{}def onClap():\n    Ed.LeftLed(1)\nEd.RegisterEventHandler(Ed.EVENT_CLAP_DETECTED, \"onClap\")\n",
            PREAMBLE
        ));
        assert_eq!(p.event_handlers["onClap"], 3);
        assert!(p.functions.contains_key("onClap"));
    }

    #[test]
    fn bad_event_number_is_rejected() {
        let kind = optimise_err(&format!(
            "{}def h():\n    pass\nEd.RegisterEventHandler(99, \"h\")\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptBadEventNumber as u32);
    }

    #[test]
    fn event_handler_with_args_is_rejected() {
        let kind = optimise_err(&format!(
            "{}def h(x):\n    return x\ny = h(1)\nEd.RegisterEventHandler(3, \"h\")\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptIncorrectArgUse as u32);
    }

    #[test]
    fn class_without_init_is_rejected() {
        let kind = optimise_err(&format!(
            "{}class A:\n    def m(self):\n        return 1\na = A()\n",
            PREAMBLE
        ));
        // the rewritten constructor call targets A.__init__, which is missing
        assert_eq!(kind, Kind::OptUnknownFunction as u32);
    }

    #[test]
    fn class_methods_and_fields_type_check() {
        let p = optimise_ok(&format!(
            "{}class Counter:\n    def __init__(self):\n        self.count = 0\n    def bump(self):\n        self.count = self.count + 1\n        return self.count\nc = Counter()\nx = c.bump()\n",
            PREAMBLE
        ));
        assert!(p.functions.contains_key("Counter.__init__"));
        assert!(p.functions.contains_key("Counter.bump"));
        // the method call was rewritten to pass the object
        assert!(p.functions[MAIN]
            .calls_to
            .iter()
            .any(|c| c == "Counter.bump"));
    }

    #[test]
    fn class_field_created_outside_init_is_rejected() {
        let kind = optimise_err(&format!(
            "{}class A:\n    def __init__(self):\n        self.x = 0\n    def m(self):\n        self.y = 1\na = A()\na.m()\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptClassDataError as u32);
    }

    #[test]
    fn main_locals_are_promoted_to_globals() {
        let p = optimise_ok(&format!("{}speed = 5\nEd.PlayBeep()\n", PREAMBLE));
        assert!(p.global_var.contains_key("speed"));
        // Ed variables come first in layout order
        let first: Vec<&String> = p.global_var.keys().take(3).collect();
        assert_eq!(first[0], "Ed.EdisonVersion");
        assert_eq!(first[2], "Ed.Tempo");
    }

    #[test]
    fn temps_are_compacted_per_line() {
        let p = optimise_ok(&format!("{}x = 1\ny = 2\nz = x + y * x\n", PREAMBLE));
        let main = &p.functions[MAIN];
        assert!(main.max_simple_temps >= 1);
        // every referenced simple temp is below the recorded maximum
        for op in &main.body {
            for v in op.values() {
                if let Value::Var(VarName::Temp(edc_core::program::Temp::Simple(n))) = v {
                    assert!(*n < main.max_simple_temps);
                }
            }
        }
    }

    #[test]
    fn loop_variable_hiding_global_is_rejected() {
        let kind = optimise_err(&format!(
            "{}x = 1\ndef f():\n    x = 2\nf()\n",
            PREAMBLE
        ));
        assert_eq!(kind, Kind::OptLclHidesGlb as u32);
    }

    #[test]
    fn global_declaration_allows_the_write() {
        let p = optimise_ok(&format!(
            "{}x = 1\ndef f():\n    global x\n    x = 2\nf()\n",
            PREAMBLE
        ));
        assert!(p.functions.contains_key("f"));
    }
}
