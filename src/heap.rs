/// Heap object model.
///
/// All heap objects live in a single arena owned by the VM; a `Value`
/// heap handle is the index of the object's slot. Objects are appended
/// and never reclaimed — the arena is the root list, and everything in
/// it stays reachable for the VM's lifetime. There is no garbage
/// collector; embedders that churn objects should recycle the VM.
///
/// Strings are interned: equal contents share one slot, which makes
/// string equality a bit-pattern comparison on the boxed handle.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::Proto;
use crate::errors::VmError;
use crate::value::{TypeTag, Value};
use crate::vm::ExecState;

/// Host-provided builtin: receives the heap (for allocating results and
/// reading arguments' objects) and the argument slice.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, VmError>;

#[derive(Debug)]
pub enum Obj {
    Str(Rc<str>),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
    Proto(Rc<Proto>),
    Closure(Closure),
    /// Closed upvalue cell: captures hold the value at capture time.
    Upvalue(Value),
    /// Instance method with its receiver pre-bound.
    Bound { receiver: Value, method: Value },
    Class(ClassObj),
    Instance(InstanceObj),
    Iter(IterObj),
    Module(ModuleObj),
    Native(NativeObj),
    Fiber(Box<FiberObj>),
}

#[derive(Debug, Clone)]
pub struct Closure {
    pub proto: Rc<Proto>,
    /// Arena indices of the captured upvalue cells.
    pub upvals: Vec<u32>,
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: Rc<str>,
    pub methods: HashMap<String, Value>,
    pub props: HashMap<String, Value>,
    pub parent: Option<u32>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: u32,
    pub fields: HashMap<String, Value>,
}

#[derive(Debug)]
pub struct IterObj {
    pub target: Value,
    pub index: usize,
    /// Map iteration walks a key list snapshotted at ITERINIT so later
    /// mutation cannot reorder it.
    pub keys: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct ModuleObj {
    pub name: String,
    pub path: String,
    pub exports: HashMap<String, Value>,
    pub loaded: bool,
}

pub struct NativeObj {
    pub name: &'static str,
    pub arity: u8,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native:{}/{}", self.name, self.arity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Suspended,
    Running,
    Dead,
}

#[derive(Debug)]
pub struct FiberObj {
    pub state: FiberState,
    /// Entry closure value.
    pub entry: Value,
    /// Full suspended execution context (registers, frames, try stack,
    /// iterator table). Present only while suspended.
    pub ctx: Option<ExecState>,
    /// Absolute register (within the fiber's own context) that receives
    /// the next resume argument.
    pub resume_reg: usize,
    pub resume_want: bool,
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

pub struct Heap {
    objects: Vec<Obj>,
    interned: HashMap<Rc<str>, u32>,
}

const RENDER_DEPTH: usize = 8;

impl Heap {
    pub fn new() -> Self {
        Heap { objects: Vec::with_capacity(256), interned: HashMap::new() }
    }

    pub fn alloc(&mut self, obj: Obj) -> u32 {
        let idx = self.objects.len() as u32;
        self.objects.push(obj);
        idx
    }

    #[inline]
    pub fn get(&self, idx: u32) -> &Obj {
        &self.objects[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> &mut Obj {
        &mut self.objects[idx as usize]
    }

    #[inline]
    pub fn obj(&self, v: Value) -> Option<&Obj> {
        if v.is_obj() {
            self.objects.get(v.as_obj() as usize)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // ── Strings ──────────────────────────────────────────────────────────────

    /// Intern a string and return its boxed handle.
    pub fn str_value(&mut self, s: &str) -> Value {
        if let Some(&idx) = self.interned.get(s) {
            return Value::obj(idx);
        }
        let rc: Rc<str> = Rc::from(s);
        let idx = self.alloc(Obj::Str(rc.clone()));
        self.interned.insert(rc, idx);
        Value::obj(idx)
    }

    pub fn as_str(&self, v: Value) -> Option<Rc<str>> {
        match self.obj(v) {
            Some(Obj::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn is_str(&self, v: Value) -> bool {
        matches!(self.obj(v), Some(Obj::Str(_)))
    }

    // ── Collections ──────────────────────────────────────────────────────────

    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        Value::obj(self.alloc(Obj::Array(items)))
    }

    pub fn new_map(&mut self) -> Value {
        Value::obj(self.alloc(Obj::Map(HashMap::new())))
    }

    pub fn as_array(&self, v: Value) -> Option<&Vec<Value>> {
        match self.obj(v) {
            Some(Obj::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, v: Value) -> Option<&mut Vec<Value>> {
        if !v.is_obj() {
            return None;
        }
        match self.get_mut(v.as_obj()) {
            Obj::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self, v: Value) -> Option<&HashMap<String, Value>> {
        match self.obj(v) {
            Some(Obj::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self, v: Value) -> Option<&mut HashMap<String, Value>> {
        if !v.is_obj() {
            return None;
        }
        match self.get_mut(v.as_obj()) {
            Obj::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Map keys are strings; anything else is coerced to its rendering.
    pub fn key_string(&self, v: Value) -> String {
        match self.obj(v) {
            Some(Obj::Str(s)) => s.to_string(),
            _ => self.render(v),
        }
    }

    // ── Typing ───────────────────────────────────────────────────────────────

    pub fn type_tag(&self, v: Value) -> TypeTag {
        if v.is_nil() {
            TypeTag::Nil
        } else if v.is_bool() {
            TypeTag::Bool
        } else if v.is_int() {
            TypeTag::Int
        } else if v.is_float() {
            TypeTag::Number
        } else {
            match self.obj(v) {
                Some(Obj::Str(_)) => TypeTag::Str,
                Some(Obj::Array(_)) => TypeTag::Array,
                Some(Obj::Map(_)) => TypeTag::Map,
                Some(Obj::Closure(_)) | Some(Obj::Native(_)) | Some(Obj::Bound { .. })
                | Some(Obj::Proto(_)) => TypeTag::Function,
                Some(Obj::Class(_)) => TypeTag::Class,
                Some(Obj::Instance(_)) => TypeTag::Instance,
                Some(Obj::Iter(_)) => TypeTag::Iterator,
                Some(Obj::Upvalue(_)) => TypeTag::Function,
                Some(Obj::Module(_)) => TypeTag::Module,
                Some(Obj::Fiber(_)) => TypeTag::Fiber,
                None => TypeTag::Nil,
            }
        }
    }

    pub fn type_name(&self, v: Value) -> &'static str {
        self.type_tag(v).name()
    }

    // ── Rendering (PRINT / string coercion) ──────────────────────────────────

    /// Human-readable rendering: ints without a decimal point, integral
    /// floats as integers, booleans as true/false, nil as null, strings
    /// verbatim, arrays and maps as delimited element lists.
    pub fn render(&self, v: Value) -> String {
        self.render_depth(v, 0)
    }

    fn render_depth(&self, v: Value, depth: usize) -> String {
        if depth > RENDER_DEPTH {
            return "...".into();
        }
        if v.is_nil() {
            return "null".into();
        }
        if v.is_bool() {
            return v.as_bool().to_string();
        }
        if v.is_int() {
            return v.as_int().to_string();
        }
        if v.is_float() {
            let n = v.as_f64();
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                return format!("{}", n as i64);
            }
            return format!("{}", n);
        }
        match self.obj(v) {
            Some(Obj::Str(s)) => s.to_string(),
            Some(Obj::Array(items)) => {
                let parts: Vec<String> =
                    items.iter().map(|e| self.render_depth(*e, depth + 1)).collect();
                format!("[{}]", parts.join(", "))
            }
            Some(Obj::Map(m)) => {
                let parts: Vec<String> = m
                    .iter()
                    .map(|(k, val)| format!("{}: {}", k, self.render_depth(*val, depth + 1)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Some(Obj::Closure(c)) => format!("<fn {}>", c.proto.name),
            Some(Obj::Native(n)) => format!("<native {}>", n.name),
            Some(Obj::Bound { method, .. }) => self.render_depth(*method, depth + 1),
            Some(Obj::Class(c)) => format!("<class {}>", c.name),
            Some(Obj::Instance(i)) => match self.get(i.class) {
                Obj::Class(c) => format!("<{} instance>", c.name),
                _ => "<instance>".into(),
            },
            Some(Obj::Iter(_)) => "<iterator>".into(),
            Some(Obj::Module(m)) => format!("<module {}>", m.name),
            Some(Obj::Proto(p)) => format!("<proto {}>", p.name),
            Some(Obj::Upvalue(_)) => "<upvalue>".into(),
            Some(Obj::Fiber(_)) => "<fiber>".into(),
            None => "<invalid>".into(),
        }
    }

    // ── Equality / ordering ──────────────────────────────────────────────────

    /// EQ/NEQ semantics: identical bit patterns (covers singletons, interned
    /// strings, and object identity), or numeric equality with promotion.
    pub fn eq_values(&self, a: Value, b: Value) -> bool {
        if a.raw() == b.raw() {
            return true;
        }
        if a.is_number() && b.is_number() {
            return a.as_number() == b.as_number();
        }
        false
    }

    /// Ordered comparison. Numbers follow the promotion rules; strings are
    /// byte-wise lexicographic. Anything else is a non-catchable type error.
    pub fn lt_values(&self, a: Value, b: Value) -> Result<bool, VmError> {
        if a.is_number() && b.is_number() {
            return Ok(a.as_number() < b.as_number());
        }
        if let (Some(Obj::Str(x)), Some(Obj::Str(y))) = (self.obj(a), self.obj(b)) {
            return Ok(x.as_bytes() < y.as_bytes());
        }
        Err(VmError::BadCompare(format!(
            "cannot order {} and {}",
            self.type_name(a),
            self.type_name(b)
        )))
    }

    pub fn le_values(&self, a: Value, b: Value) -> Result<bool, VmError> {
        if a.is_number() && b.is_number() {
            return Ok(a.as_number() <= b.as_number());
        }
        if let (Some(Obj::Str(x)), Some(Obj::Str(y))) = (self.obj(a), self.obj(b)) {
            return Ok(x.as_bytes() <= y.as_bytes());
        }
        Err(VmError::BadCompare(format!(
            "cannot order {} and {}",
            self.type_name(a),
            self.type_name(b)
        )))
    }

    // ── Indexing ─────────────────────────────────────────────────────────────

    /// GETTABLE semantics. Out-of-range array reads yield nil; missing map
    /// keys yield nil; strings are not indexable.
    pub fn index_get(&self, container: Value, key: Value) -> Result<Value, VmError> {
        match self.obj(container) {
            Some(Obj::Array(items)) => {
                let i = int_index(key).ok_or_else(|| {
                    VmError::Type(format!("array index must be an int, got {}", self.type_name(key)))
                })?;
                if i < 0 {
                    return Ok(Value::nil());
                }
                Ok(items.get(i as usize).copied().unwrap_or(Value::nil()))
            }
            Some(Obj::Map(m)) => Ok(m.get(&self.key_string(key)).copied().unwrap_or(Value::nil())),
            Some(Obj::Module(m)) => {
                Ok(m.exports.get(&self.key_string(key)).copied().unwrap_or(Value::nil()))
            }
            Some(Obj::Instance(inst)) => {
                Ok(inst.fields.get(&self.key_string(key)).copied().unwrap_or(Value::nil()))
            }
            Some(Obj::Str(_)) => Err(VmError::Type("string is not indexable".into())),
            _ => Err(VmError::Type(format!("cannot index a {} value", self.type_name(container)))),
        }
    }

    /// SETTABLE semantics. Array writes past the end auto-grow, padding
    /// with nil.
    pub fn index_set(&mut self, container: Value, key: Value, val: Value) -> Result<(), VmError> {
        let key_s = if !matches!(self.obj(container), Some(Obj::Array(_))) {
            Some(self.key_string(key))
        } else {
            None
        };
        if !container.is_obj() {
            return Err(VmError::Type(format!(
                "cannot index a {} value",
                self.type_name(container)
            )));
        }
        let tname = self.type_name(key);
        match self.get_mut(container.as_obj()) {
            Obj::Array(items) => {
                let i = int_index(key)
                    .ok_or_else(|| VmError::Type(format!("array index must be an int, got {}", tname)))?;
                if i < 0 {
                    return Err(VmError::Type("negative array index".into()));
                }
                let i = i as usize;
                if i >= items.len() {
                    items.resize(i + 1, Value::nil());
                }
                items[i] = val;
                Ok(())
            }
            Obj::Map(m) => {
                m.insert(key_s.unwrap_or_default(), val);
                Ok(())
            }
            Obj::Instance(inst) => {
                inst.fields.insert(key_s.unwrap_or_default(), val);
                Ok(())
            }
            other => Err(VmError::Type(format!("cannot index into {:?}", other))),
        }
    }

    // ── Classes ──────────────────────────────────────────────────────────────

    /// Walk the class chain looking for a method.
    pub fn find_method(&self, class_idx: u32, name: &str) -> Option<Value> {
        let mut cur = Some(class_idx);
        while let Some(idx) = cur {
            match self.get(idx) {
                Obj::Class(c) => {
                    if let Some(&m) = c.methods.get(name) {
                        return Some(m);
                    }
                    cur = c.parent;
                }
                _ => return None,
            }
        }
        None
    }

    /// Collect class-level property defaults, parent first so subclasses
    /// override.
    pub fn collect_props(&self, class_idx: u32) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut cur = Some(class_idx);
        while let Some(idx) = cur {
            match self.get(idx) {
                Obj::Class(c) => {
                    chain.push(idx);
                    cur = c.parent;
                }
                _ => break,
            }
        }
        let mut fields = HashMap::new();
        for idx in chain.into_iter().rev() {
            if let Obj::Class(c) = self.get(idx) {
                for (k, v) in &c.props {
                    fields.insert(k.clone(), *v);
                }
            }
        }
        fields
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

/// Array index coercion: tagged ints directly, integral floats allowed.
fn int_index(v: Value) -> Option<i64> {
    if v.is_int() {
        return Some(v.as_int());
    }
    if v.is_float() {
        let f = v.as_f64();
        if f.fract() == 0.0 && f.is_finite() {
            return Some(f as i64);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let mut h = Heap::new();
        let a = h.str_value("hello");
        let b = h.str_value("hello");
        let c = h.str_value("world");
        assert_eq!(a.raw(), b.raw());
        assert_ne!(a.raw(), c.raw());
        assert_eq!(h.as_str(a).unwrap().as_ref(), "hello");
    }

    #[test]
    fn test_array_autogrow() {
        let mut h = Heap::new();
        let arr = h.new_array(vec![Value::int(1)]);
        h.index_set(arr, Value::int(3), Value::int(9)).unwrap();
        let items = h.as_array(arr).unwrap();
        assert_eq!(items.len(), 4);
        assert!(items[1].is_nil() && items[2].is_nil());
        assert_eq!(items[3].as_int(), 9);
        // out-of-range read is nil, not an error
        assert!(h.index_get(arr, Value::int(100)).unwrap().is_nil());
    }

    #[test]
    fn test_map_key_coercion() {
        let mut h = Heap::new();
        let m = h.new_map();
        h.index_set(m, Value::int(7), Value::int(1)).unwrap();
        let k = h.str_value("7");
        assert_eq!(h.index_get(m, k).unwrap().as_int(), 1);
    }

    #[test]
    fn test_string_not_indexable() {
        let mut h = Heap::new();
        let s = h.str_value("abc");
        let err = h.index_get(s, Value::int(0)).unwrap_err();
        assert!(err.catchable());
    }

    #[test]
    fn test_render_formats() {
        let mut h = Heap::new();
        assert_eq!(h.render(Value::int(42)), "42");
        assert_eq!(h.render(Value::number(3.0)), "3");
        assert_eq!(h.render(Value::number(3.5)), "3.5");
        assert_eq!(h.render(Value::bool_val(true)), "true");
        assert_eq!(h.render(Value::nil()), "null");
        let s = h.str_value("hi");
        assert_eq!(h.render(s), "hi");
        let arr = h.new_array(vec![Value::int(1), s]);
        assert_eq!(h.render(arr), "[1, hi]");
    }

    #[test]
    fn test_ordering_errors_are_fatal() {
        let mut h = Heap::new();
        let s = h.str_value("x");
        let err = h.lt_values(s, Value::int(1)).unwrap_err();
        assert!(!err.catchable());
    }
}
