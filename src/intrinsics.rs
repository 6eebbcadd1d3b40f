/// SONA INTRINSICS — statically linked standard library.
///
/// Every builtin is a plain `fn(&mut Heap, &[Value])` installed as a
/// pointer-boxed native under a global id at VM startup. The built-in
/// modules (math, string, array, io, json, time, os, http) are export
/// tables aliasing these same globals (see modules.rs).
///
/// Generic names (len, min, max, contains, join, concat, count) dispatch
/// on the argument type so the string and array surfaces can share them.

use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};

use crate::compiler::GlobalTable;
use crate::errors::VmError;
use crate::heap::{Heap, NativeObj, Obj};
use crate::value::Value;

// ==================== INSTALLATION ====================

pub fn install(globals: &mut GlobalTable, heap: &mut Heap, slots: &mut Vec<Value>) {
    let mut def = |name: &'static str, arity: u8, func: crate::heap::NativeFn| {
        let id = globals.intern(name) as usize;
        if slots.len() <= id {
            slots.resize(id + 1, Value::nil());
        }
        let idx = heap.alloc(Obj::Native(NativeObj { name, arity, func }));
        slots[id] = Value::obj(idx);
    };

    // math
    def("abs", 1, math_abs);
    def("sqrt", 1, math_sqrt);
    def("floor", 1, math_floor);
    def("ceil", 1, math_ceil);
    def("round", 1, math_round);
    def("pow", 2, math_pow);
    def("min", 1, generic_min);
    def("max", 1, generic_max);
    def("sin", 1, math_sin);
    def("cos", 1, math_cos);
    def("tan", 1, math_tan);
    def("log", 1, math_log);
    def("exp", 1, math_exp);
    def("random", 0, math_random);

    // string
    def("upper", 1, str_upper);
    def("lower", 1, str_lower);
    def("trim", 1, str_trim);
    def("split", 2, str_split);
    def("replace", 3, str_replace);
    def("starts_with", 2, str_starts_with);
    def("ends_with", 2, str_ends_with);
    def("substring", 2, str_substring);
    def("char_at", 2, str_char_at);

    // generic (string + array)
    def("len", 1, generic_len);
    def("contains", 2, generic_contains);
    def("join", 2, generic_join);
    def("concat", 2, generic_concat);
    def("index_of", 2, generic_index_of);

    // array
    def("push", 2, arr_push);
    def("pop", 1, arr_pop);
    def("sort", 1, arr_sort);
    def("reverse", 1, arr_reverse);
    def("slice", 3, arr_slice);
    def("remove", 2, arr_remove);
    def("insert", 3, arr_insert);
    def("first", 1, arr_first);
    def("last", 1, arr_last);
    def("sum", 1, arr_sum);
    def("avg", 1, arr_avg);
    def("unique", 1, arr_unique);
    def("flatten", 1, arr_flatten);
    def("zip", 2, arr_zip);
    def("enumerate", 1, arr_enumerate);
    def("count", 2, arr_count);
    def("fill", 2, arr_fill);
    def("range", 1, arr_range);

    // maps / types
    def("keys", 1, map_keys);
    def("haskey", 2, map_haskey);
    def("typeof", 1, type_of);
    def("type", 1, type_of);

    // io
    def("read_file", 1, io_read_file);
    def("write_file", 2, io_write_file);
    def("file_exists", 1, io_file_exists);
    def("list_dir", 1, io_list_dir);
    def("mkdir", 1, io_mkdir);
    def("remove_file", 1, io_remove_file);
    def("rename_file", 2, io_rename_file);
    def("file_stat", 1, io_file_stat);
    def("append_file", 2, io_append_file);

    // json
    def("encode", 1, json_encode);
    def("decode", 1, json_decode);
    def("stringify", 1, json_encode);
    def("parse", 1, json_decode);

    // time
    def("timestamp", 0, time_timestamp);
    def("date", 0, time_date);
    def("datetime", 0, time_datetime);
    def("sleep", 1, time_sleep);
    def("format_timestamp", 2, time_format_timestamp);

    // os
    def("getenv", 1, os_getenv);
    def("setenv", 2, os_setenv);
    def("exit", 1, os_exit);
    def("cwd", 0, os_cwd);
    def("chdir", 1, os_chdir);
    def("os_args", 0, os_args);
    def("hostname", 0, os_hostname);
    def("os_platform", 0, os_platform);

    // http
    def("get", 1, http_get);
    def("post", 2, http_post);
    def("request", 3, http_request);
    def("download", 2, http_download);
    def("json", 1, http_json);
}

// ==================== ARGUMENT HELPERS ====================

fn want_number(heap: &Heap, args: &[Value], i: usize, fname: &str) -> Result<f64, VmError> {
    match args.get(i) {
        Some(v) if v.is_number() => Ok(v.as_number()),
        Some(v) => Err(VmError::Type(format!(
            "{} expects a number, got {}",
            fname,
            heap.type_name(*v)
        ))),
        None => Err(VmError::Type(format!("{} expects a number argument", fname))),
    }
}

fn want_int(heap: &Heap, args: &[Value], i: usize, fname: &str) -> Result<i64, VmError> {
    let n = want_number(heap, args, i, fname)?;
    Ok(n as i64)
}

fn want_str(heap: &Heap, args: &[Value], i: usize, fname: &str) -> Result<String, VmError> {
    match args.get(i).and_then(|&v| heap.as_str(v)) {
        Some(s) => Ok(s.to_string()),
        None => Err(VmError::Type(format!("{} expects a string argument", fname))),
    }
}

fn want_array(heap: &Heap, args: &[Value], i: usize, fname: &str) -> Result<Vec<Value>, VmError> {
    match args.get(i).and_then(|&v| heap.as_array(v)) {
        Some(items) => Ok(items.clone()),
        None => Err(VmError::Type(format!("{} expects an array argument", fname))),
    }
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::nil())
}

// ==================== MATH ====================

fn math_abs(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let v = arg(args, 0);
    if v.is_int() {
        return Ok(Value::int_or_float(v.as_int().abs()));
    }
    if v.is_float() {
        return Ok(Value::number(v.as_f64().abs()));
    }
    Err(VmError::Type(format!("abs expects a number, got {}", heap.type_name(v))))
}

fn math_sqrt(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "sqrt")?.sqrt()))
}

fn math_floor(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::int_or_float(want_number(heap, args, 0, "floor")?.floor() as i64))
}

fn math_ceil(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::int_or_float(want_number(heap, args, 0, "ceil")?.ceil() as i64))
}

fn math_round(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::int_or_float(want_number(heap, args, 0, "round")?.round() as i64))
}

fn math_pow(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let b = want_number(heap, args, 0, "pow")?;
    let e = want_number(heap, args, 1, "pow")?;
    Ok(Value::number(b.powf(e)))
}

fn math_sin(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "sin")?.sin()))
}

fn math_cos(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "cos")?.cos()))
}

fn math_tan(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "tan")?.tan()))
}

fn math_log(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "log")?.ln()))
}

fn math_exp(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(want_number(heap, args, 0, "exp")?.exp()))
}

fn math_random(_heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::number(rand::random::<f64>()))
}

/// min(a, b, ...) over numbers, or min(array).
fn generic_min(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    fold_extreme(heap, args, "min", |a, b| if b < a { b } else { a })
}

fn generic_max(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    fold_extreme(heap, args, "max", |a, b| if b > a { b } else { a })
}

fn fold_extreme(
    heap: &Heap,
    args: &[Value],
    fname: &str,
    pick: fn(f64, f64) -> f64,
) -> Result<Value, VmError> {
    let values: Vec<Value> = if args.len() == 1 {
        match heap.as_array(arg(args, 0)) {
            Some(items) => items.clone(),
            None => args.to_vec(),
        }
    } else {
        args.to_vec()
    };
    let mut best: Option<f64> = None;
    let mut all_int = true;
    for v in &values {
        if !v.is_number() {
            return Err(VmError::Type(format!(
                "{} expects numbers, got {}",
                fname,
                heap.type_name(*v)
            )));
        }
        if !v.is_int() {
            all_int = false;
        }
        let n = v.as_number();
        best = Some(match best {
            Some(b) => pick(b, n),
            None => n,
        });
    }
    match best {
        Some(n) if all_int => Ok(Value::int_or_float(n as i64)),
        Some(n) => Ok(Value::number(n)),
        None => Ok(Value::nil()),
    }
}

// ==================== STRING ====================

fn str_upper(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "upper")?.to_uppercase();
    Ok(heap.str_value(&s))
}

fn str_lower(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "lower")?.to_lowercase();
    Ok(heap.str_value(&s))
}

fn str_trim(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "trim")?.trim().to_string();
    Ok(heap.str_value(&s))
}

fn str_split(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "split")?;
    let sep = want_str(heap, args, 1, "split")?;
    let parts: Vec<String> = if sep.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(&sep).map(|p| p.to_string()).collect()
    };
    let vals: Vec<Value> = parts.iter().map(|p| heap.str_value(p)).collect();
    Ok(heap.new_array(vals))
}

fn str_replace(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "replace")?;
    let from = want_str(heap, args, 1, "replace")?;
    let to = want_str(heap, args, 2, "replace")?;
    let out = s.replace(&from, &to);
    Ok(heap.str_value(&out))
}

fn str_starts_with(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "starts_with")?;
    let n = want_str(heap, args, 1, "starts_with")?;
    Ok(Value::bool_val(s.starts_with(&n)))
}

fn str_ends_with(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "ends_with")?;
    let n = want_str(heap, args, 1, "ends_with")?;
    Ok(Value::bool_val(s.ends_with(&n)))
}

/// substring(s, start[, end]) — byte offsets, clamped.
fn str_substring(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "substring")?;
    let bytes = s.as_bytes();
    let start = want_int(heap, args, 1, "substring")?.max(0) as usize;
    let end = if args.len() > 2 {
        want_int(heap, args, 2, "substring")?.max(0) as usize
    } else {
        bytes.len()
    };
    let start = start.min(bytes.len());
    let end = end.clamp(start, bytes.len());
    let out = String::from_utf8_lossy(&bytes[start..end]).into_owned();
    Ok(heap.str_value(&out))
}

fn str_char_at(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "char_at")?;
    let i = want_int(heap, args, 1, "char_at")?;
    if i < 0 {
        return Ok(Value::nil());
    }
    match s.chars().nth(i as usize) {
        Some(c) => {
            let cs = c.to_string();
            Ok(heap.str_value(&cs))
        }
        None => Ok(Value::nil()),
    }
}

// ==================== GENERIC (STRING + ARRAY) ====================

fn generic_len(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let v = arg(args, 0);
    let n = match heap.obj(v) {
        Some(Obj::Str(s)) => s.len(),
        Some(Obj::Array(items)) => items.len(),
        Some(Obj::Map(m)) => m.len(),
        _ => {
            return Err(VmError::Type(format!(
                "len expects a string, array, or map, got {}",
                heap.type_name(v)
            )))
        }
    };
    Ok(Value::int(n as i64))
}

fn generic_contains(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let hay = arg(args, 0);
    let needle = arg(args, 1);
    let out = match heap.obj(hay) {
        Some(Obj::Str(s)) => match heap.as_str(needle) {
            Some(n) => s.contains(n.as_ref()),
            None => false,
        },
        Some(Obj::Array(items)) => items.iter().any(|&e| heap.eq_values(e, needle)),
        Some(Obj::Map(m)) => m.contains_key(&heap.key_string(needle)),
        _ => {
            return Err(VmError::Type(format!(
                "contains expects a string, array, or map, got {}",
                heap.type_name(hay)
            )))
        }
    };
    Ok(Value::bool_val(out))
}

fn generic_join(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "join")?;
    let sep = want_str(heap, args, 1, "join")?;
    let parts: Vec<String> = items.iter().map(|&e| heap.render(e)).collect();
    let out = parts.join(&sep);
    Ok(heap.str_value(&out))
}

fn generic_concat(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    let b = arg(args, 1);
    match (heap.obj(a), heap.obj(b)) {
        (Some(Obj::Array(x)), Some(Obj::Array(y))) => {
            let mut out = x.clone();
            out.extend_from_slice(y);
            Ok(heap.new_array(out))
        }
        (Some(Obj::Str(x)), Some(Obj::Str(y))) => {
            let s = format!("{}{}", x, y);
            Ok(heap.str_value(&s))
        }
        _ => Err(VmError::Type("concat expects two arrays or two strings".into())),
    }
}

fn generic_index_of(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let hay = arg(args, 0);
    let needle = arg(args, 1);
    let idx = match heap.obj(hay) {
        Some(Obj::Str(s)) => match heap.as_str(needle) {
            Some(n) => s.find(n.as_ref()).map(|i| i as i64).unwrap_or(-1),
            None => -1,
        },
        Some(Obj::Array(items)) => items
            .iter()
            .position(|&e| heap.eq_values(e, needle))
            .map(|i| i as i64)
            .unwrap_or(-1),
        _ => {
            return Err(VmError::Type("index_of expects a string or array".into()));
        }
    };
    Ok(Value::int(idx))
}

// ==================== ARRAY ====================

fn arr_push(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    let v = arg(args, 1);
    match heap.array_mut(a) {
        Some(items) => {
            items.push(v);
            Ok(a)
        }
        None => Err(VmError::Type("push expects an array".into())),
    }
}

fn arr_pop(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    match heap.array_mut(arg(args, 0)) {
        Some(items) => Ok(items.pop().unwrap_or(Value::nil())),
        None => Err(VmError::Type("pop expects an array".into())),
    }
}

fn arr_sort(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    let mut items = match heap.array_mut(a) {
        Some(items) => std::mem::take(items),
        None => return Err(VmError::Type("sort expects an array".into())),
    };
    items.sort_by(|&x, &y| sort_key(heap, x).partial_cmp(&sort_key(heap, y)).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(slot) = heap.array_mut(a) {
        *slot = items;
    }
    Ok(a)
}

/// Sort rank: numbers by value, then strings lexicographically, then
/// everything else by type name.
fn sort_key(heap: &Heap, v: Value) -> (u8, f64, String) {
    if v.is_number() {
        return (0, v.as_number(), String::new());
    }
    if let Some(s) = heap.as_str(v) {
        return (1, 0.0, s.to_string());
    }
    (2, 0.0, heap.type_name(v).to_string())
}

fn arr_reverse(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    match heap.array_mut(a) {
        Some(items) => {
            items.reverse();
            Ok(a)
        }
        None => Err(VmError::Type("reverse expects an array".into())),
    }
}

fn arr_slice(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "slice")?;
    let len = items.len() as i64;
    let norm = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let start = norm(want_int(heap, args, 1, "slice")?);
    let end = norm(if args.len() > 2 { want_int(heap, args, 2, "slice")? } else { len });
    let out = if start < end { items[start..end].to_vec() } else { Vec::new() };
    Ok(heap.new_array(out))
}

fn arr_remove(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let i = want_int(heap, args, 1, "remove")?;
    match heap.array_mut(arg(args, 0)) {
        Some(items) => {
            if i >= 0 && (i as usize) < items.len() {
                Ok(items.remove(i as usize))
            } else {
                Ok(Value::nil())
            }
        }
        None => Err(VmError::Type("remove expects an array".into())),
    }
}

fn arr_insert(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    let i = want_int(heap, args, 1, "insert")?.max(0) as usize;
    let v = arg(args, 2);
    match heap.array_mut(a) {
        Some(items) => {
            let i = i.min(items.len());
            items.insert(i, v);
            Ok(a)
        }
        None => Err(VmError::Type("insert expects an array".into())),
    }
}

fn arr_first(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "first")?;
    Ok(items.first().copied().unwrap_or(Value::nil()))
}

fn arr_last(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "last")?;
    Ok(items.last().copied().unwrap_or(Value::nil()))
}

fn arr_sum(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "sum")?;
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0f64;
    for v in &items {
        if !v.is_number() {
            return Err(VmError::Type(format!(
                "sum expects numbers, got {}",
                heap.type_name(*v)
            )));
        }
        float_sum += v.as_number();
        int_sum = match (int_sum, v.is_int()) {
            (Some(s), true) => s.checked_add(v.as_int()),
            _ => None,
        };
    }
    match int_sum {
        Some(s) => Ok(Value::int_or_float(s)),
        None => Ok(Value::number(float_sum)),
    }
}

fn arr_avg(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "avg")?;
    if items.is_empty() {
        return Ok(Value::nil());
    }
    let mut total = 0.0f64;
    for v in &items {
        if !v.is_number() {
            return Err(VmError::Type("avg expects numbers".into()));
        }
        total += v.as_number();
    }
    Ok(Value::number(total / items.len() as f64))
}

fn arr_unique(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "unique")?;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for v in items {
        if seen.insert(v.raw()) {
            out.push(v);
        }
    }
    Ok(heap.new_array(out))
}

fn arr_flatten(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "flatten")?;
    let mut out = Vec::new();
    for v in items {
        match heap.as_array(v) {
            Some(sub) => out.extend_from_slice(sub),
            None => out.push(v),
        }
    }
    Ok(heap.new_array(out))
}

fn arr_zip(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = want_array(heap, args, 0, "zip")?;
    let b = want_array(heap, args, 1, "zip")?;
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    for (x, y) in a.into_iter().zip(b.into_iter()) {
        out.push(heap.new_array(vec![x, y]));
    }
    Ok(heap.new_array(out))
}

fn arr_enumerate(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "enumerate")?;
    let mut out = Vec::with_capacity(items.len());
    for (i, v) in items.into_iter().enumerate() {
        out.push(heap.new_array(vec![Value::int(i as i64), v]));
    }
    Ok(heap.new_array(out))
}

fn arr_count(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let items = want_array(heap, args, 0, "count")?;
    let target = arg(args, 1);
    let n = items.iter().filter(|&&e| heap.eq_values(e, target)).count();
    Ok(Value::int(n as i64))
}

/// fill(array, value) — overwrite every element in place.
fn arr_fill(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let a = arg(args, 0);
    let v = arg(args, 1);
    match heap.array_mut(a) {
        Some(items) => {
            for slot in items.iter_mut() {
                *slot = v;
            }
            Ok(a)
        }
        None => Err(VmError::Type("fill expects an array".into())),
    }
}

/// range(n) → [0..n), range(a, b) → [a..b).
fn arr_range(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let (start, end) = if args.len() >= 2 {
        (want_int(heap, args, 0, "range")?, want_int(heap, args, 1, "range")?)
    } else {
        (0, want_int(heap, args, 0, "range")?)
    };
    let mut out = Vec::new();
    let mut i = start;
    while i < end {
        out.push(Value::int_or_float(i));
        i += 1;
    }
    Ok(heap.new_array(out))
}

// ==================== MAPS / TYPES ====================

fn map_keys(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let keys: Vec<String> = match heap.as_map(arg(args, 0)) {
        Some(m) => m.keys().cloned().collect(),
        None => return Err(VmError::Type("keys expects a map".into())),
    };
    let vals: Vec<Value> = keys.iter().map(|k| heap.str_value(k)).collect();
    Ok(heap.new_array(vals))
}

fn map_haskey(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let key = heap.key_string(arg(args, 1));
    match heap.as_map(arg(args, 0)) {
        Some(m) => Ok(Value::bool_val(m.contains_key(&key))),
        None => Err(VmError::Type("haskey expects a map".into())),
    }
}

fn type_of(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let name = heap.type_name(arg(args, 0));
    Ok(heap.str_value(name))
}

// ==================== IO ====================

fn io_err(e: std::io::Error) -> VmError {
    VmError::Io(e.to_string())
}

fn io_read_file(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "read_file")?;
    let bytes = std::fs::read(&path).map_err(io_err)?;
    let s = String::from_utf8_lossy(&bytes).into_owned();
    Ok(heap.str_value(&s))
}

fn io_write_file(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "write_file")?;
    let content = heap.render(arg(args, 1));
    std::fs::write(&path, content).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn io_append_file(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    use std::io::Write;
    let path = want_str(heap, args, 0, "append_file")?;
    let content = heap.render(arg(args, 1));
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err)?;
    f.write_all(content.as_bytes()).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn io_file_exists(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "file_exists")?;
    Ok(Value::bool_val(std::path::Path::new(&path).exists()))
}

fn io_list_dir(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "list_dir")?;
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    let vals: Vec<Value> = names.iter().map(|n| heap.str_value(n)).collect();
    Ok(heap.new_array(vals))
}

fn io_mkdir(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "mkdir")?;
    std::fs::create_dir_all(&path).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn io_remove_file(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "remove_file")?;
    std::fs::remove_file(&path).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn io_rename_file(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let from = want_str(heap, args, 0, "rename_file")?;
    let to = want_str(heap, args, 1, "rename_file")?;
    std::fs::rename(&from, &to).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn io_file_stat(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "file_stat")?;
    let meta = std::fs::metadata(&path).map_err(io_err)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut m = HashMap::new();
    m.insert("size".to_string(), Value::int_or_float(meta.len() as i64));
    m.insert("is_dir".to_string(), Value::bool_val(meta.is_dir()));
    m.insert("is_file".to_string(), Value::bool_val(meta.is_file()));
    m.insert("modified".to_string(), Value::int_or_float(modified));
    Ok(Value::obj(heap.alloc(Obj::Map(m))))
}

// ==================== JSON ====================

fn to_json(heap: &Heap, v: Value, depth: usize) -> serde_json::Value {
    use serde_json::Value as J;
    if depth > 32 {
        return J::Null;
    }
    if v.is_nil() {
        return J::Null;
    }
    if v.is_bool() {
        return J::Bool(v.as_bool());
    }
    if v.is_int() {
        return J::from(v.as_int());
    }
    if v.is_float() {
        return serde_json::Number::from_f64(v.as_f64()).map(J::Number).unwrap_or(J::Null);
    }
    match heap.obj(v) {
        Some(Obj::Str(s)) => J::String(s.to_string()),
        Some(Obj::Array(items)) => {
            J::Array(items.iter().map(|&e| to_json(heap, e, depth + 1)).collect())
        }
        Some(Obj::Map(m)) => {
            let obj: serde_json::Map<String, J> = m
                .iter()
                .map(|(k, &val)| (k.clone(), to_json(heap, val, depth + 1)))
                .collect();
            J::Object(obj)
        }
        _ => J::String(heap.render(v)),
    }
}

fn from_json(heap: &mut Heap, j: &serde_json::Value) -> Value {
    use serde_json::Value as J;
    match j {
        J::Null => Value::nil(),
        J::Bool(b) => Value::bool_val(*b),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int_or_float(i)
            } else {
                Value::number(n.as_f64().unwrap_or(0.0))
            }
        }
        J::String(s) => heap.str_value(s),
        J::Array(items) => {
            let vals: Vec<Value> = items.iter().map(|e| from_json(heap, e)).collect();
            heap.new_array(vals)
        }
        J::Object(obj) => {
            let mut m = HashMap::new();
            for (k, val) in obj {
                let v = from_json(heap, val);
                m.insert(k.clone(), v);
            }
            Value::obj(heap.alloc(Obj::Map(m)))
        }
    }
}

fn json_encode(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let j = to_json(heap, arg(args, 0), 0);
    let s = serde_json::to_string(&j).map_err(|e| VmError::Io(e.to_string()))?;
    Ok(heap.str_value(&s))
}

fn json_decode(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let s = want_str(heap, args, 0, "decode")?;
    let j: serde_json::Value =
        serde_json::from_str(&s).map_err(|e| VmError::Type(format!("invalid json: {}", e)))?;
    Ok(from_json(heap, &j))
}

// ==================== TIME ====================

fn time_timestamp(_heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::int_or_float(Utc::now().timestamp()))
}

fn time_date(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    let s = Local::now().format("%Y-%m-%d").to_string();
    Ok(heap.str_value(&s))
}

fn time_datetime(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    let s = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    Ok(heap.str_value(&s))
}

fn time_sleep(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let secs = want_number(heap, args, 0, "sleep")?.max(0.0);
    std::thread::sleep(std::time::Duration::from_secs_f64(secs));
    Ok(Value::nil())
}

fn time_format_timestamp(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let ts = want_int(heap, args, 0, "format_timestamp")?;
    let fmt = want_str(heap, args, 1, "format_timestamp")?;
    let dt: DateTime<Utc> = DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| VmError::Type("timestamp out of range".into()))?;
    let s = dt.format(&fmt).to_string();
    Ok(heap.str_value(&s))
}

// ==================== OS ====================

fn os_getenv(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let name = want_str(heap, args, 0, "getenv")?;
    match std::env::var(&name) {
        Ok(v) => Ok(heap.str_value(&v)),
        Err(_) => Ok(Value::nil()),
    }
}

fn os_setenv(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let name = want_str(heap, args, 0, "setenv")?;
    let val = heap.render(arg(args, 1));
    std::env::set_var(name, val);
    Ok(Value::nil())
}

fn os_exit(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let code = if args.is_empty() { 0 } else { want_int(heap, args, 0, "exit")? };
    std::process::exit(code as i32)
}

fn os_cwd(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    let cwd = std::env::current_dir().map_err(io_err)?;
    let s = cwd.to_string_lossy().into_owned();
    Ok(heap.str_value(&s))
}

fn os_chdir(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let path = want_str(heap, args, 0, "chdir")?;
    std::env::set_current_dir(&path).map_err(io_err)?;
    Ok(Value::nil())
}

fn os_args(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    let argv: Vec<String> = std::env::args().collect();
    let vals: Vec<Value> = argv.iter().map(|a| heap.str_value(a)).collect();
    Ok(heap.new_array(vals))
}

fn os_hostname(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    let name = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    Ok(heap.str_value(&name))
}

fn os_platform(heap: &mut Heap, _args: &[Value]) -> Result<Value, VmError> {
    Ok(heap.str_value(std::env::consts::OS))
}

// ==================== HTTP ====================

fn http_err(e: reqwest::Error) -> VmError {
    VmError::Io(format!("http: {}", e))
}

fn http_get(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let url = want_str(heap, args, 0, "get")?;
    let body = reqwest::blocking::get(&url)
        .and_then(|r| r.text())
        .map_err(http_err)?;
    Ok(heap.str_value(&body))
}

fn http_post(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let url = want_str(heap, args, 0, "post")?;
    let payload = heap.render(arg(args, 1));
    let client = reqwest::blocking::Client::new();
    let body = client
        .post(&url)
        .body(payload)
        .send()
        .and_then(|r| r.text())
        .map_err(http_err)?;
    Ok(heap.str_value(&body))
}

/// request(method, url[, body]) → {status, body}
fn http_request(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let method = want_str(heap, args, 0, "request")?.to_uppercase();
    let url = want_str(heap, args, 1, "request")?;
    let client = reqwest::blocking::Client::new();
    let m = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| VmError::Type(format!("invalid http method '{}'", method)))?;
    let mut req = client.request(m, &url);
    if args.len() > 2 && !arg(args, 2).is_nil() {
        req = req.body(heap.render(arg(args, 2)));
    }
    let resp = req.send().map_err(http_err)?;
    let status = resp.status().as_u16() as i64;
    let body = resp.text().map_err(http_err)?;
    let body_v = heap.str_value(&body);
    let mut m = HashMap::new();
    m.insert("status".to_string(), Value::int(status));
    m.insert("body".to_string(), body_v);
    Ok(Value::obj(heap.alloc(Obj::Map(m))))
}

fn http_download(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let url = want_str(heap, args, 0, "download")?;
    let path = want_str(heap, args, 1, "download")?;
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.bytes())
        .map_err(http_err)?;
    std::fs::write(&path, &bytes).map_err(io_err)?;
    Ok(Value::bool_val(true))
}

fn http_json(heap: &mut Heap, args: &[Value]) -> Result<Value, VmError> {
    let url = want_str(heap, args, 0, "json")?;
    let body = reqwest::blocking::get(&url)
        .and_then(|r| r.text())
        .map_err(http_err)?;
    let j: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| VmError::Type(format!("invalid json: {}", e)))?;
    Ok(from_json(heap, &j))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (GlobalTable, Heap, Vec<Value>) {
        let mut globals = GlobalTable::new();
        let mut heap = Heap::new();
        let mut slots = Vec::new();
        install(&mut globals, &mut heap, &mut slots);
        (globals, heap, slots)
    }

    #[test]
    fn test_install_registers_stdlib() {
        let (globals, heap, slots) = setup();
        for name in ["abs", "push", "read_file", "encode", "timestamp", "getenv", "get"] {
            let id = globals.get(name).expect(name) as usize;
            assert!(
                matches!(heap.obj(slots[id]), Some(Obj::Native(_))),
                "{} must install a native",
                name
            );
        }
    }

    #[test]
    fn test_math_abs_and_min() {
        let (_, mut heap, _) = setup();
        let v = math_abs(&mut heap, &[Value::int(-5)]).unwrap();
        assert_eq!(v.as_int(), 5);
        let v = generic_min(&mut heap, &[Value::int(3), Value::int(1), Value::int(2)]).unwrap();
        assert_eq!(v.as_int(), 1);
        let arr = heap.new_array(vec![Value::int(9), Value::int(4)]);
        let v = generic_min(&mut heap, &[arr]).unwrap();
        assert_eq!(v.as_int(), 4);
    }

    #[test]
    fn test_array_ops() {
        let (_, mut heap, _) = setup();
        let arr = heap.new_array(vec![Value::int(3), Value::int(1), Value::int(2)]);
        arr_push(&mut heap, &[arr, Value::int(0)]).unwrap();
        arr_sort(&mut heap, &[arr]).unwrap();
        let items = heap.as_array(arr).unwrap().clone();
        let got: Vec<i64> = items.iter().map(|v| v.as_int()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        let s = arr_sum(&mut heap, &[arr]).unwrap();
        assert_eq!(s.as_int(), 6);
    }

    #[test]
    fn test_range_and_slice() {
        let (_, mut heap, _) = setup();
        let r = arr_range(&mut heap, &[Value::int(5)]).unwrap();
        assert_eq!(heap.as_array(r).unwrap().len(), 5);
        let s = arr_slice(&mut heap, &[r, Value::int(1), Value::int(3)]).unwrap();
        let items = heap.as_array(s).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_int(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let (_, mut heap, _) = setup();
        let arr = heap.new_array(vec![Value::int(1), Value::bool_val(true), Value::nil()]);
        let encoded = json_encode(&mut heap, &[arr]).unwrap();
        assert_eq!(heap.as_str(encoded).unwrap().as_ref(), "[1,true,null]");
        let decoded = json_decode(&mut heap, &[encoded]).unwrap();
        let items = heap.as_array(decoded).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_int(), 1);
    }

    #[test]
    fn test_string_ops() {
        let (_, mut heap, _) = setup();
        let s = heap.str_value("hello world");
        let up = str_upper(&mut heap, &[s]).unwrap();
        assert_eq!(heap.as_str(up).unwrap().as_ref(), "HELLO WORLD");
        let space = heap.str_value(" ");
        let parts = str_split(&mut heap, &[s, space]).unwrap();
        assert_eq!(heap.as_array(parts).unwrap().len(), 2);
        let sub = str_substring(&mut heap, &[s, Value::int(6)]).unwrap();
        assert_eq!(heap.as_str(sub).unwrap().as_ref(), "world");
    }
}
