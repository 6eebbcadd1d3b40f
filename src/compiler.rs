/// Sona Bytecode Compiler
///
/// Compiles the AST (Stmt/Expr tree) into a register-based Proto.
///
/// REGISTER ALLOCATION:
///   A monotone next-register counter plus a LIFO free list and a lock
///   set. Locals stay locked for their scope's lifetime; expression
///   temporaries are freed as soon as they are consumed. Call argument
///   windows come from `find_consecutive`, which always carves fresh
///   top-of-frame slots. Max 255 registers per frame.
///
/// PASSES:
///   1. Compile statements/expressions → emit instructions
///   2. Peephole: fuse compare+test+jump triples into the *J/*JK forms
///      (bytecode::fuse_compare_jumps, applied per finished function)

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::ast::{BinOp, Expr, LambdaBody, Lit, LogOp, MethodDef, Pattern, Stmt, StrPart, UnOp};
use crate::bytecode::{fuse_compare_jumps, Instr, Op, Proto, ProtoBuilder, UpvalDesc};
use crate::errors::CompileError;
use crate::heap::{Heap, Obj};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Global table
// ---------------------------------------------------------------------------

/// Dense global name → u16 id table, shared between the compiler and the VM.
pub struct GlobalTable {
    pub names: Vec<String>,
    idx: HashMap<String, u16>,
}

impl GlobalTable {
    pub fn new() -> Self {
        GlobalTable { names: Vec::new(), idx: HashMap::new() }
    }

    pub fn intern(&mut self, name: &str) -> u16 {
        if let Some(&i) = self.idx.get(name) {
            return i;
        }
        let i = self.names.len() as u16;
        self.names.push(name.to_string());
        self.idx.insert(name.to_string(), i);
        i
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.idx.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        self.names.get(id as usize).map(|s| s.as_str())
    }
}

impl Default for GlobalTable {
    fn default() -> Self {
        GlobalTable::new()
    }
}

// ---------------------------------------------------------------------------
// Register allocator
// ---------------------------------------------------------------------------

struct RegAlloc {
    next: u8,
    free: Vec<u8>,
    locked: [bool; 256],
    max: u8,
}

impl RegAlloc {
    fn new() -> Self {
        RegAlloc { next: 0, free: Vec::new(), locked: [false; 256], max: 0 }
    }

    fn alloc(&mut self, fname: &str) -> Result<u8, CompileError> {
        while let Some(r) = self.free.pop() {
            if !self.locked[r as usize] {
                return Ok(r);
            }
        }
        if self.next == u8::MAX {
            return Err(CompileError::RegisterOverflow(fname.to_string()));
        }
        let r = self.next;
        self.next += 1;
        if self.next > self.max {
            self.max = self.next;
        }
        Ok(r)
    }

    fn free(&mut self, r: u8) {
        if !self.locked[r as usize] {
            self.free.push(r);
        }
    }

    /// Returns true when this call actually locked the register, so the
    /// caller knows whether it may unlock it again.
    fn lock(&mut self, r: u8) -> bool {
        let was = self.locked[r as usize];
        self.locked[r as usize] = true;
        !was
    }

    fn unlock(&mut self, r: u8) {
        self.locked[r as usize] = false;
    }

    /// Base index for `n` contiguous non-locked slots (fresh top-of-frame
    /// registers, used for call argument packing).
    fn find_consecutive(&mut self, n: u8, fname: &str) -> Result<u8, CompileError> {
        if self.next as u16 + n as u16 > 255 {
            return Err(CompileError::RegisterOverflow(fname.to_string()));
        }
        let base = self.next;
        self.next += n;
        if self.next > self.max {
            self.max = self.next;
        }
        Ok(base)
    }
}

// ---------------------------------------------------------------------------
// Per-function compile state
// ---------------------------------------------------------------------------

struct LoopCtx {
    start: usize,
    breaks: Vec<usize>,
}

struct FuncState {
    b: ProtoBuilder,
    regs: RegAlloc,
    scopes: Vec<Vec<(String, u8)>>,
    /// Captured names, parallel to `b.upvals`.
    upval_names: Vec<String>,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(name: impl Into<String>, arity: u8) -> Self {
        FuncState {
            b: ProtoBuilder::new(name, arity),
            regs: RegAlloc::new(),
            scopes: vec![Vec::new()],
            upval_names: Vec::new(),
            loops: Vec::new(),
        }
    }
}

enum Binding {
    Local(u8),
    Upval(u8),
    Global(u16),
}

/// Builtin calls lowered to dedicated opcodes at call position.
static BUILTIN_OPS: Lazy<HashMap<&'static str, (Op, usize)>> = Lazy::new(|| {
    HashMap::from([
        ("len", (Op::Len, 1)),
        ("keys", (Op::Keys, 1)),
        ("haskey", (Op::HasKey, 2)),
        ("typeof", (Op::TypeOf, 1)),
        ("type", (Op::TypeOf, 1)),
        ("upper", (Op::Upper, 1)),
        ("lower", (Op::Lower, 1)),
        ("trim", (Op::Trim, 1)),
        ("contains", (Op::Contains, 2)),
        ("starts_with", (Op::StartsWith, 2)),
        ("ends_with", (Op::EndsWith, 2)),
        ("index_of", (Op::IndexOf, 2)),
        ("split", (Op::Split, 2)),
        ("join", (Op::Join, 2)),
        ("substr", (Op::SubStr, 2)),
    ])
});

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

pub struct Compiler<'a> {
    funcs: Vec<FuncState>,
    globals: &'a mut GlobalTable,
    heap: &'a mut Heap,
}

/// Compile a top-level program into a prototype with arity 0. String and
/// prototype constants are interned into `heap`; global names are assigned
/// ids in `globals`.
pub fn compile_program(
    stmts: &[Stmt],
    globals: &mut GlobalTable,
    heap: &mut Heap,
) -> Result<Rc<Proto>, CompileError> {
    let mut c = Compiler { funcs: vec![FuncState::new("main", 0)], globals, heap };
    for s in stmts {
        c.compile_stmt(s)?;
    }
    Ok(Rc::new(c.finish_current()?))
}

impl<'a> Compiler<'a> {
    // ── Small helpers ────────────────────────────────────────────────────────

    fn cur(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn emit(&mut self, i: Instr) -> usize {
        self.cur().b.emit(i)
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.cur().b.emit_jump(op, 0)
    }

    fn patch(&mut self, at: usize) -> Result<(), CompileError> {
        self.cur().b.patch_jump(at)
    }

    fn alloc(&mut self) -> Result<u8, CompileError> {
        let f = self.funcs.last_mut().unwrap();
        f.regs.alloc(&f.b.name)
    }

    fn free(&mut self, r: u8) {
        self.cur().regs.free(r);
    }

    fn kval(&mut self, v: Value) -> Result<u16, CompileError> {
        self.cur().b.add_const(v)
    }

    fn kstr(&mut self, s: &str) -> Result<u16, CompileError> {
        let v = self.heap.str_value(s);
        self.cur().b.add_const(v)
    }

    fn bind_local(&mut self, name: &str, r: u8) {
        let f = self.funcs.last_mut().unwrap();
        f.regs.lock(r);
        if let Some(scope) = f.scopes.last_mut() {
            scope.push((name.to_string(), r));
        }
    }

    fn push_scope(&mut self) {
        self.cur().scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        let f = self.funcs.last_mut().unwrap();
        if let Some(scope) = f.scopes.pop() {
            for (_, r) in scope.into_iter().rev() {
                f.regs.unlock(r);
                f.regs.free(r);
            }
        }
    }

    fn at_top_level(&self) -> bool {
        self.funcs.len() == 1 && self.funcs[0].scopes.len() == 1
    }

    // ── Name resolution ──────────────────────────────────────────────────────

    fn local_at(&self, fi: usize, name: &str) -> Option<u8> {
        for scope in self.funcs[fi].scopes.iter().rev() {
            for (n, r) in scope.iter().rev() {
                if n == name {
                    return Some(*r);
                }
            }
        }
        None
    }

    fn add_upval(&mut self, fi: usize, name: &str, desc: UpvalDesc) -> Result<u8, CompileError> {
        let f = &mut self.funcs[fi];
        if f.b.upvals.len() >= u8::MAX as usize {
            return Err(CompileError::UpvalueOverflow(f.b.name.clone()));
        }
        f.b.upvals.push(desc);
        f.upval_names.push(name.to_string());
        Ok((f.b.upvals.len() - 1) as u8)
    }

    fn upvalue_at(&mut self, fi: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if fi == 0 {
            return Ok(None);
        }
        if let Some(i) = self.funcs[fi].upval_names.iter().position(|n| n == name) {
            return Ok(Some(i as u8));
        }
        if let Some(reg) = self.local_at(fi - 1, name) {
            let i = self.add_upval(fi, name, UpvalDesc { is_local: true, index: reg })?;
            return Ok(Some(i));
        }
        if let Some(outer) = self.upvalue_at(fi - 1, name)? {
            let i = self.add_upval(fi, name, UpvalDesc { is_local: false, index: outer })?;
            return Ok(Some(i));
        }
        Ok(None)
    }

    fn resolve(&mut self, name: &str) -> Result<Binding, CompileError> {
        let top = self.funcs.len() - 1;
        if let Some(r) = self.local_at(top, name) {
            return Ok(Binding::Local(r));
        }
        if let Some(u) = self.upvalue_at(top, name)? {
            return Ok(Binding::Upval(u));
        }
        Ok(Binding::Global(self.globals.intern(name)))
    }

    fn shadows_builtin(&mut self, name: &str) -> Result<bool, CompileError> {
        let top = self.funcs.len() - 1;
        if self.local_at(top, name).is_some() {
            return Ok(true);
        }
        Ok(self.upvalue_at(top, name)?.is_some())
    }

    // ── Operands ─────────────────────────────────────────────────────────────

    /// Compile an expression as an operand. Locals are used in place; any
    /// other expression goes into a fresh temporary. The bool says whether
    /// the caller must free the register.
    fn compile_operand(&mut self, e: &Expr) -> Result<(u8, bool), CompileError> {
        if let Expr::Variable(name) = e {
            if let Binding::Local(r) = self.resolve(name)? {
                return Ok((r, false));
            }
        }
        let t = self.alloc()?;
        let r = self.compile_expr(e, t)?;
        if r != t {
            // result landed in a local register
            self.free(t);
            return Ok((r, false));
        }
        Ok((t, true))
    }

    fn free_operand(&mut self, op: (u8, bool)) {
        if op.1 {
            self.free(op.0);
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    /// Compile `e` with `dst` as the suggested destination. Returns the
    /// register holding the result: either `dst`, or a live local register
    /// (which the caller must not free).
    pub fn compile_expr(&mut self, e: &Expr, dst: u8) -> Result<u8, CompileError> {
        match e {
            Expr::Literal(lit) => {
                self.compile_literal(lit, dst)?;
                Ok(dst)
            }

            Expr::Variable(name) => match self.resolve(name)? {
                Binding::Local(r) => Ok(r),
                Binding::Upval(u) => {
                    self.emit(Instr::abc(Op::GetUpval, dst, u, 0));
                    Ok(dst)
                }
                Binding::Global(g) => {
                    self.emit(Instr::abx(Op::GetGlobal, dst, g));
                    Ok(dst)
                }
            },

            Expr::Unary { op, operand } => {
                let o = self.compile_operand(operand)?;
                let code = match op {
                    UnOp::Neg => Op::Unm,
                    UnOp::Not => Op::Not,
                };
                self.emit(Instr::abc(code, dst, o.0, 0));
                self.free_operand(o);
                Ok(dst)
            }

            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs, dst),

            Expr::Logical { op, lhs, rhs } => {
                let r = self.compile_expr(lhs, dst)?;
                if r != dst {
                    self.emit(Instr::abc(Op::Move, dst, r, 0));
                }
                let c = match op {
                    LogOp::And => 0,
                    LogOp::Or => 1,
                };
                self.emit(Instr::abc(Op::Test, dst, 0, c));
                let over = self.emit_jump(Op::Jmp);
                let r2 = self.compile_expr(rhs, dst)?;
                if r2 != dst {
                    self.emit(Instr::abc(Op::Move, dst, r2, 0));
                }
                self.patch(over)?;
                Ok(dst)
            }

            Expr::Call { callee, args } => self.compile_call(callee, args, dst),

            Expr::Array(items) => {
                self.emit(Instr::abc(Op::NewArray, dst, items.len().min(255) as u8, 0));
                for item in items {
                    let r = self.compile_operand(item)?;
                    self.emit(Instr::abc(Op::Append, dst, r.0, 0));
                    self.free_operand(r);
                }
                Ok(dst)
            }

            Expr::Map(pairs) => {
                self.emit(Instr::abc(Op::NewTable, dst, 0, 0));
                for (k, v) in pairs {
                    if let Expr::Literal(Lit::Str(s)) = k {
                        let ki = self.kstr(s)?;
                        if ki <= u8::MAX as u16 {
                            let vr = self.compile_operand(v)?;
                            self.emit(Instr::abc(Op::SetTableK, dst, ki as u8, vr.0));
                            self.free_operand(vr);
                            continue;
                        }
                    }
                    let kr = self.compile_operand(k)?;
                    let klocked = self.cur().regs.lock(kr.0);
                    let vr = self.compile_operand(v)?;
                    if klocked {
                        self.cur().regs.unlock(kr.0);
                    }
                    self.emit(Instr::abc(Op::SetTable, dst, kr.0, vr.0));
                    self.free_operand(vr);
                    self.free_operand(kr);
                }
                Ok(dst)
            }

            Expr::Index { object, index } => {
                if let Expr::Literal(Lit::Str(s)) = index.as_ref() {
                    let ki = self.kstr(s)?;
                    if ki <= u8::MAX as u16 {
                        let o = self.compile_operand(object)?;
                        self.emit(Instr::abc(Op::GetTableK, dst, o.0, ki as u8));
                        self.free_operand(o);
                        return Ok(dst);
                    }
                }
                let o = self.compile_operand(object)?;
                let olocked = self.cur().regs.lock(o.0);
                let i = self.compile_operand(index)?;
                if olocked {
                    self.cur().regs.unlock(o.0);
                }
                self.emit(Instr::abc(Op::GetTable, dst, o.0, i.0));
                self.free_operand(i);
                self.free_operand(o);
                Ok(dst)
            }

            Expr::Property { object, name } => {
                let o = self.compile_operand(object)?;
                let ki = self.kstr(name)?;
                if ki <= u8::MAX as u16 {
                    self.emit(Instr::abc(Op::GetProp, dst, o.0, ki as u8));
                } else {
                    let t = self.alloc()?;
                    self.emit(Instr::abx(Op::LoadK, t, ki));
                    self.emit(Instr::abc(Op::GetTable, dst, o.0, t));
                    self.free(t);
                }
                self.free_operand(o);
                Ok(dst)
            }

            Expr::Lambda { params, body } => {
                let stmts: Vec<Stmt> = match body {
                    LambdaBody::Expr(e) => vec![Stmt::Return(Some((**e).clone()))],
                    LambdaBody::Block(b) => b.clone(),
                };
                let params: Vec<String> = params.clone();
                let k = self.compile_function_proto("lambda", &params, &stmts)?;
                self.emit(Instr::abx(Op::Closure, dst, k));
                Ok(dst)
            }

            Expr::Assign { target, value } => {
                let r = self.compile_expr(value, dst)?;
                match target.as_ref() {
                    Expr::Variable(name) => match self.resolve(name)? {
                        Binding::Local(l) => {
                            if l != r {
                                self.emit(Instr::abc(Op::Move, l, r, 0));
                            }
                        }
                        Binding::Upval(u) => {
                            self.emit(Instr::abc(Op::SetUpval, r, u, 0));
                        }
                        Binding::Global(g) => {
                            self.emit(Instr::abx(Op::SetGlobal, r, g));
                        }
                    },
                    Expr::Index { object, index } => {
                        let o = self.compile_operand(object)?;
                        let olocked = self.cur().regs.lock(o.0);
                        let i = self.compile_operand(index)?;
                        if olocked {
                            self.cur().regs.unlock(o.0);
                        }
                        self.emit(Instr::abc(Op::SetTable, o.0, i.0, r));
                        self.free_operand(i);
                        self.free_operand(o);
                    }
                    Expr::Property { object, name } => {
                        let o = self.compile_operand(object)?;
                        let ki = self.kstr(name)?;
                        if ki > u8::MAX as u16 {
                            return Err(CompileError::ConstantOverflow(
                                self.funcs.last().map(|f| f.b.name.clone()).unwrap_or_default(),
                            ));
                        }
                        self.emit(Instr::abc(Op::SetProp, o.0, ki as u8, r));
                        self.free_operand(o);
                    }
                    _ => return Err(CompileError::BadAssignTarget),
                }
                Ok(r)
            }

            Expr::If { cond, then_expr, else_expr } => {
                let c = self.compile_operand(cond)?;
                self.emit(Instr::abc(Op::Test, c.0, 0, 0));
                let over_then = self.emit_jump(Op::Jmp);
                self.free_operand(c);
                let r = self.compile_expr(then_expr, dst)?;
                if r != dst {
                    self.emit(Instr::abc(Op::Move, dst, r, 0));
                }
                let over_else = self.emit_jump(Op::Jmp);
                self.patch(over_then)?;
                let r2 = self.compile_expr(else_expr, dst)?;
                if r2 != dst {
                    self.emit(Instr::abc(Op::Move, dst, r2, 0));
                }
                self.patch(over_else)?;
                Ok(dst)
            }

            Expr::Interpolation(parts) => {
                if parts.is_empty() {
                    let k = self.kstr("")?;
                    self.emit(Instr::abx(Op::LoadK, dst, k));
                    return Ok(dst);
                }
                let mut first = true;
                for part in parts {
                    if first {
                        match part {
                            StrPart::Lit(s) => {
                                let k = self.kstr(s)?;
                                self.emit(Instr::abx(Op::LoadK, dst, k));
                            }
                            StrPart::Expr(e) => {
                                let r = self.compile_expr(e, dst)?;
                                if r != dst {
                                    self.emit(Instr::abc(Op::Move, dst, r, 0));
                                }
                            }
                        }
                        first = false;
                        continue;
                    }
                    let r = match part {
                        StrPart::Lit(s) => {
                            let k = self.kstr(s)?;
                            let t = self.alloc()?;
                            self.emit(Instr::abx(Op::LoadK, t, k));
                            (t, true)
                        }
                        StrPart::Expr(e) => self.compile_operand(e)?,
                    };
                    self.emit(Instr::abc(Op::Concat, dst, dst, r.0));
                    self.free_operand(r);
                }
                Ok(dst)
            }

            Expr::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                self.emit(Instr::abc(Op::LoadNil, dst, 0, 0));
                Ok(dst)
            }
        }
    }

    fn compile_literal(&mut self, lit: &Lit, dst: u8) -> Result<(), CompileError> {
        match lit {
            Lit::Nil => {
                self.emit(Instr::abc(Op::LoadNil, dst, 0, 0));
            }
            Lit::Bool(b) => {
                self.emit(Instr::abc(Op::LoadBool, dst, *b as u8, 0));
            }
            Lit::Int(n) => {
                let k = self.kval(Value::int_or_float(*n))?;
                self.emit(Instr::abx(Op::LoadK, dst, k));
            }
            Lit::Float(f) => {
                let k = self.kval(Value::number(*f))?;
                self.emit(Instr::abx(Op::LoadK, dst, k));
            }
            Lit::Str(s) => {
                let s = s.clone();
                let k = self.kstr(&s)?;
                self.emit(Instr::abx(Op::LoadK, dst, k));
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
    ) -> Result<u8, CompileError> {
        // Immediate / constant right operand fusion.
        if let Expr::Literal(lit) = rhs {
            match (op, lit) {
                (BinOp::Add, Lit::Int(n)) if i8::try_from(*n).is_ok() => {
                    let l = self.compile_operand(lhs)?;
                    self.emit(Instr::absc(Op::AddI, dst, l.0, *n as i8));
                    self.free_operand(l);
                    return Ok(dst);
                }
                (BinOp::Sub, Lit::Int(n)) if i8::try_from(*n).is_ok() => {
                    let l = self.compile_operand(lhs)?;
                    self.emit(Instr::absc(Op::SubI, dst, l.0, *n as i8));
                    self.free_operand(l);
                    return Ok(dst);
                }
                (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div, Lit::Int(_) | Lit::Float(_)) => {
                    let v = match lit {
                        Lit::Int(n) => Value::int_or_float(*n),
                        Lit::Float(f) => Value::number(*f),
                        _ => unreachable!(),
                    };
                    let k = self.kval(v)?;
                    if k <= u8::MAX as u16 {
                        let code = match op {
                            BinOp::Add => Op::AddK,
                            BinOp::Sub => Op::SubK,
                            BinOp::Mul => Op::MulK,
                            BinOp::Div => Op::DivK,
                            _ => unreachable!(),
                        };
                        let l = self.compile_operand(lhs)?;
                        self.emit(Instr::abc(code, dst, l.0, k as u8));
                        self.free_operand(l);
                        return Ok(dst);
                    }
                }
                _ => {}
            }
        }

        let l = self.compile_operand(lhs)?;
        let llocked = self.cur().regs.lock(l.0);
        let r = self.compile_operand(rhs)?;
        if llocked {
            self.cur().regs.unlock(l.0);
        }
        let code = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Mod => Op::Mod,
            BinOp::Pow => Op::Pow,
            BinOp::Eq => Op::Eq,
            BinOp::Ne => Op::Neq,
            BinOp::Lt => Op::Lt,
            BinOp::Le => Op::Le,
            BinOp::Gt => Op::Gt,
            BinOp::Ge => Op::Ge,
        };
        self.emit(Instr::abc(code, dst, l.0, r.0));
        self.free_operand(r);
        self.free_operand(l);
        Ok(dst)
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], dst: u8) -> Result<u8, CompileError> {
        if args.len() > 250 {
            let fname = self.funcs.last().map(|f| f.b.name.clone()).unwrap_or_default();
            return Err(CompileError::RegisterOverflow(fname));
        }
        // Builtin lowering: known names at call position compile straight
        // to their opcode when not shadowed by a local or upvalue.
        if let Expr::Variable(name) = callee {
            if let Some(&(op, arity)) = BUILTIN_OPS.get(name.as_str()) {
                if args.len() == arity && !self.shadows_builtin(name)? {
                    return self.compile_builtin(op, args, dst);
                }
            }
        }

        // Arguments first, locked so the callee cannot clobber them.
        let mut argtmps: Vec<(u8, bool, bool)> = Vec::with_capacity(args.len());
        for a in args {
            let (r, owned) = self.compile_operand(a)?;
            let locked = self.cur().regs.lock(r);
            argtmps.push((r, owned, locked));
        }

        // Callee. Member callees go through GETMETHOD so instance methods
        // arrive with their receiver bound.
        let (fr, fowned) = match callee {
            Expr::Property { object, name } => {
                let o = self.compile_operand(object)?;
                let ki = self.kstr(name)?;
                let t = self.alloc()?;
                if ki <= u8::MAX as u16 {
                    self.emit(Instr::abc(Op::GetMethod, t, o.0, ki as u8));
                } else {
                    let kt = self.alloc()?;
                    self.emit(Instr::abx(Op::LoadK, kt, ki));
                    self.emit(Instr::abc(Op::GetTable, t, o.0, kt));
                    self.free(kt);
                }
                self.free_operand(o);
                (t, true)
            }
            _ => self.compile_operand(callee)?,
        };

        // Contiguous window: callee + args.
        let argc = args.len();
        let base = {
            let f = self.funcs.last_mut().unwrap();
            f.regs.find_consecutive(argc as u8 + 1, &f.b.name.clone())
        };
        let base = base?;
        self.emit(Instr::abc(Op::Move, base, fr, 0));
        if fowned {
            self.free(fr);
        }
        for (i, (r, _, _)) in argtmps.iter().enumerate() {
            self.emit(Instr::abc(Op::Move, base + 1 + i as u8, *r, 0));
        }
        for (r, owned, locked) in argtmps.into_iter().rev() {
            if locked {
                self.cur().regs.unlock(r);
            }
            if owned {
                self.free(r);
            }
        }
        self.emit(Instr::abc(Op::Call, base, argc as u8 + 1, 2));
        if dst != base {
            self.emit(Instr::abc(Op::Move, dst, base, 0));
        }
        for i in (0..=argc as u8).rev() {
            self.free(base + i);
        }
        Ok(dst)
    }

    fn compile_builtin(&mut self, op: Op, args: &[Expr], dst: u8) -> Result<u8, CompileError> {
        match args {
            [a] => {
                let r = self.compile_operand(a)?;
                self.emit(Instr::abc(op, dst, r.0, 0));
                self.free_operand(r);
            }
            [a, b] => {
                let ra = self.compile_operand(a)?;
                let alocked = self.cur().regs.lock(ra.0);
                let rb = self.compile_operand(b)?;
                if alocked {
                    self.cur().regs.unlock(ra.0);
                }
                self.emit(Instr::abc(op, dst, ra.0, rb.0));
                self.free_operand(rb);
                self.free_operand(ra);
            }
            _ => {}
        }
        Ok(dst)
    }

    // ── Statements ───────────────────────────────────────────────────────────

    pub fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, value } => self.compile_let(name, value.as_ref()),

            Stmt::Assign { name, value } => self.compile_assign(name, value),

            Stmt::IndexAssign { object, index, value } => {
                if let Expr::Literal(Lit::Str(s)) = index {
                    let ki = self.kstr(s)?;
                    if ki <= u8::MAX as u16 {
                        let o = self.compile_operand(object)?;
                        let olocked = self.cur().regs.lock(o.0);
                        let v = self.compile_operand(value)?;
                        if olocked {
                            self.cur().regs.unlock(o.0);
                        }
                        self.emit(Instr::abc(Op::SetTableK, o.0, ki as u8, v.0));
                        self.free_operand(v);
                        self.free_operand(o);
                        return Ok(());
                    }
                }
                let o = self.compile_operand(object)?;
                let olocked = self.cur().regs.lock(o.0);
                let i = self.compile_operand(index)?;
                let ilocked = self.cur().regs.lock(i.0);
                let v = self.compile_operand(value)?;
                if ilocked {
                    self.cur().regs.unlock(i.0);
                }
                if olocked {
                    self.cur().regs.unlock(o.0);
                }
                self.emit(Instr::abc(Op::SetTable, o.0, i.0, v.0));
                self.free_operand(v);
                self.free_operand(i);
                self.free_operand(o);
                Ok(())
            }

            Stmt::Expr(e) => {
                let t = self.alloc()?;
                self.compile_expr(e, t)?;
                self.free(t);
                Ok(())
            }

            Stmt::Print(e) => {
                let r = self.compile_operand(e)?;
                self.emit(Instr::abc(Op::Print, r.0, 0, 0));
                self.free_operand(r);
                Ok(())
            }

            Stmt::Function { name, params, body } => {
                let k = self.compile_function_proto(name, params, body)?;
                if self.at_top_level() {
                    let t = self.alloc()?;
                    self.emit(Instr::abx(Op::Closure, t, k));
                    let g = self.globals.intern(name);
                    self.emit(Instr::abx(Op::SetGlobal, t, g));
                    self.free(t);
                } else {
                    let t = self.alloc()?;
                    self.emit(Instr::abx(Op::Closure, t, k));
                    self.bind_local(name, t);
                }
                Ok(())
            }

            Stmt::Return(value) => {
                match value {
                    Some(e) => {
                        let r = self.compile_operand(e)?;
                        self.emit(Instr::abc(Op::Return, r.0, 2, 0));
                        self.free_operand(r);
                    }
                    None => {
                        self.emit(Instr::abc(Op::Return, 0, 1, 0));
                    }
                }
                Ok(())
            }

            Stmt::If { cond, then_body, else_body } => {
                let c = self.compile_operand(cond)?;
                self.emit(Instr::abc(Op::Test, c.0, 0, 0));
                let over_then = self.emit_jump(Op::Jmp);
                self.free_operand(c);
                self.push_scope();
                for s in then_body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                if let Some(else_stmts) = else_body {
                    let over_else = self.emit_jump(Op::Jmp);
                    self.patch(over_then)?;
                    self.push_scope();
                    for s in else_stmts {
                        self.compile_stmt(s)?;
                    }
                    self.pop_scope();
                    self.patch(over_else)?;
                } else {
                    self.patch(over_then)?;
                }
                Ok(())
            }

            Stmt::While { cond, body } => {
                let loop_start = self.cur().b.code.len();
                self.cur().loops.push(LoopCtx { start: loop_start, breaks: Vec::new() });
                let c = self.compile_operand(cond)?;
                self.emit(Instr::abc(Op::Test, c.0, 0, 0));
                let exit = self.emit_jump(Op::Jmp);
                self.free_operand(c);
                self.push_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                let off = self.cur().b.jump_back_offset(loop_start)?;
                self.emit(Instr::asbx(Op::Jmp, 0, off));
                self.patch(exit)?;
                let ctx = self.cur().loops.pop().unwrap();
                for bj in ctx.breaks {
                    self.patch(bj)?;
                }
                Ok(())
            }

            Stmt::For { init, cond, update, body } => {
                self.push_scope();
                if let Some(i) = init {
                    self.compile_stmt(i)?;
                }
                let loop_start = self.cur().b.code.len();
                self.cur().loops.push(LoopCtx { start: loop_start, breaks: Vec::new() });
                let exit = match cond {
                    Some(cexpr) => {
                        let c = self.compile_operand(cexpr)?;
                        self.emit(Instr::abc(Op::Test, c.0, 0, 0));
                        let j = self.emit_jump(Op::Jmp);
                        self.free_operand(c);
                        Some(j)
                    }
                    None => None,
                };
                self.push_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                if let Some(u) = update {
                    let t = self.alloc()?;
                    self.compile_expr(u, t)?;
                    self.free(t);
                }
                let off = self.cur().b.jump_back_offset(loop_start)?;
                self.emit(Instr::asbx(Op::Jmp, 0, off));
                if let Some(exit) = exit {
                    self.patch(exit)?;
                }
                let ctx = self.cur().loops.pop().unwrap();
                for bj in ctx.breaks {
                    self.patch(bj)?;
                }
                self.pop_scope();
                Ok(())
            }

            Stmt::ForIn { var, iterable, body } => {
                let win = {
                    let f = self.funcs.last_mut().unwrap();
                    let name = f.b.name.clone();
                    f.regs.find_consecutive(4, &name)?
                };
                for i in 0..4 {
                    self.cur().regs.lock(win + i);
                }
                let c = self.compile_operand(iterable)?;
                self.emit(Instr::abc(Op::IterInit, win, c.0, 0));
                self.free_operand(c);
                self.push_scope();
                self.bind_local(var, win + 2);
                let loop_start = self.cur().b.code.len();
                self.cur().loops.push(LoopCtx { start: loop_start, breaks: Vec::new() });
                let inext = self.emit(Instr::asbx(Op::IterNext, win, 0));
                self.push_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                let off = self.cur().b.jump_back_offset(loop_start)?;
                self.emit(Instr::asbx(Op::Jmp, 0, off));
                self.patch(inext)?;
                let ctx = self.cur().loops.pop().unwrap();
                for bj in ctx.breaks {
                    self.patch(bj)?;
                }
                self.pop_scope();
                for i in [3u8, 1, 0] {
                    self.cur().regs.unlock(win + i);
                    self.free(win + i);
                }
                Ok(())
            }

            Stmt::Break => {
                if self.cur().loops.is_empty() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let j = self.emit_jump(Op::Jmp);
                self.cur().loops.last_mut().unwrap().breaks.push(j);
                Ok(())
            }

            Stmt::Continue => {
                let start = match self.cur().loops.last() {
                    Some(l) => l.start,
                    None => return Err(CompileError::ContinueOutsideLoop),
                };
                let off = self.cur().b.jump_back_offset(start)?;
                self.emit(Instr::asbx(Op::Jmp, 0, off));
                Ok(())
            }

            Stmt::Import { path, alias } => {
                let k = self.kstr(path)?;
                let t = self.alloc()?;
                self.emit(Instr::abx(Op::Import, t, k));
                let bound = match alias {
                    Some(a) => a.clone(),
                    None => path
                        .rsplit('/')
                        .next()
                        .unwrap_or(path.as_str())
                        .trim_end_matches(".sn")
                        .to_string(),
                };
                let g = self.globals.intern(&bound);
                self.emit(Instr::abx(Op::SetGlobal, t, g));
                self.free(t);
                Ok(())
            }

            Stmt::Export(inner) => {
                let name = match inner.as_ref() {
                    Stmt::Let { name, .. } | Stmt::Function { name, .. } => name.clone(),
                    _ => return Err(CompileError::BadExport),
                };
                self.compile_stmt(inner)?;
                let t = self.alloc()?;
                let g = self.globals.intern(&name);
                self.emit(Instr::abx(Op::GetGlobal, t, g));
                let k = self.kstr(&name)?;
                if k > u8::MAX as u16 {
                    return Err(CompileError::ConstantOverflow("main".into()));
                }
                self.emit(Instr::abc(Op::Export, k as u8, t, 0));
                self.free(t);
                Ok(())
            }

            Stmt::Try { body, catch_var, catch_body, finally } => {
                let try_pc = self.emit(Instr::asbx(Op::Try, 0, 0));
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.emit(Instr::abc(Op::EndTry, 0, 0, 0));
                let over = self.emit_jump(Op::Jmp);
                self.patch(try_pc)?;
                self.push_scope();
                let r = self.alloc()?;
                self.bind_local(catch_var, r);
                self.emit(Instr::abc(Op::GetError, r, 0, 0));
                for s in catch_body {
                    self.compile_stmt(s)?;
                }
                self.pop_scope();
                self.patch(over)?;
                if let Some(fin) = finally {
                    for s in fin {
                        self.compile_stmt(s)?;
                    }
                }
                Ok(())
            }

            Stmt::Throw(e) => {
                let r = self.compile_operand(e)?;
                self.emit(Instr::abc(Op::Throw, r.0, 0, 0));
                self.free_operand(r);
                Ok(())
            }

            Stmt::Class { name, parent, fields, methods } => {
                self.compile_class(name, parent.as_deref(), fields, methods)
            }

            Stmt::Match { expr, arms } => {
                let v = self.compile_operand(expr)?;
                let vlocked = self.cur().regs.lock(v.0);
                let mut ends = Vec::new();
                for arm in arms {
                    match &arm.pattern {
                        Pattern::Wildcard => {
                            self.push_scope();
                            for s in &arm.body {
                                self.compile_stmt(s)?;
                            }
                            self.pop_scope();
                            let e = self.emit_jump(Op::Jmp);
                            ends.push(e);
                        }
                        Pattern::Literal(lit) => {
                            let t = self.alloc()?;
                            self.compile_literal(lit, t)?;
                            let c = self.alloc()?;
                            self.emit(Instr::abc(Op::Eq, c, v.0, t));
                            self.emit(Instr::abc(Op::Test, c, 0, 0));
                            let skip = self.emit_jump(Op::Jmp);
                            self.free(c);
                            self.free(t);
                            self.push_scope();
                            for s in &arm.body {
                                self.compile_stmt(s)?;
                            }
                            self.pop_scope();
                            let e = self.emit_jump(Op::Jmp);
                            ends.push(e);
                            self.patch(skip)?;
                        }
                    }
                }
                for e in ends {
                    self.patch(e)?;
                }
                if vlocked {
                    self.cur().regs.unlock(v.0);
                }
                self.free_operand(v);
                Ok(())
            }
        }
    }

    fn compile_let(&mut self, name: &str, value: Option<&Expr>) -> Result<(), CompileError> {
        if self.at_top_level() {
            let g = self.globals.intern(name);
            let r = match value {
                Some(e) => self.compile_operand(e)?,
                None => {
                    let t = self.alloc()?;
                    self.emit(Instr::abc(Op::LoadNil, t, 0, 0));
                    (t, true)
                }
            };
            self.emit(Instr::abx(Op::SetGlobal, r.0, g));
            self.free_operand(r);
            return Ok(());
        }
        let t = self.alloc()?;
        match value {
            Some(e) => {
                let r = self.compile_expr(e, t)?;
                if r != t {
                    self.emit(Instr::abc(Op::Move, t, r, 0));
                }
            }
            None => {
                self.emit(Instr::abc(Op::LoadNil, t, 0, 0));
            }
        }
        self.bind_local(name, t);
        Ok(())
    }

    fn compile_assign(&mut self, name: &str, value: &Expr) -> Result<(), CompileError> {
        match self.resolve(name)? {
            Binding::Local(reg) => {
                // counter peepholes: x = x + 1 / x = x - 1
                if let Some(op) = incr_shape(name, value) {
                    self.emit(Instr::abc(op, reg, 0, 0));
                    return Ok(());
                }
                let r = self.compile_expr(value, reg)?;
                if r != reg {
                    self.emit(Instr::abc(Op::Move, reg, r, 0));
                }
                Ok(())
            }
            Binding::Upval(u) => {
                let r = self.compile_operand(value)?;
                self.emit(Instr::abc(Op::SetUpval, r.0, u, 0));
                self.free_operand(r);
                Ok(())
            }
            Binding::Global(g) => {
                // accumulator peepholes: g = g + 1 → INCRG, g = g + e → ADDG
                if let Some(op) = incr_shape(name, value) {
                    let gop = if op == Op::Incr { Op::IncrG } else { Op::DecrG };
                    self.emit(Instr::abx(gop, 0, g));
                    return Ok(());
                }
                if let Expr::Binary { op, lhs, rhs } = value {
                    if matches!(op, BinOp::Add | BinOp::Sub) {
                        if let Expr::Variable(lname) = lhs.as_ref() {
                            if lname == name {
                                let r = self.compile_operand(rhs)?;
                                let gop = if *op == BinOp::Add { Op::AddG } else { Op::SubG };
                                self.emit(Instr::abx(gop, r.0, g));
                                self.free_operand(r);
                                return Ok(());
                            }
                        }
                    }
                }
                let r = self.compile_operand(value)?;
                self.emit(Instr::abx(Op::SetGlobal, r.0, g));
                self.free_operand(r);
                Ok(())
            }
        }
    }

    fn compile_class(
        &mut self,
        name: &str,
        parent: Option<&str>,
        fields: &[(String, Expr)],
        methods: &[MethodDef],
    ) -> Result<(), CompileError> {
        let kname = self.kstr(name)?;
        let t = self.alloc()?;
        self.emit(Instr::abx(Op::Class, t, kname));
        self.cur().regs.lock(t);
        if let Some(p) = parent {
            let pr = self.compile_operand(&Expr::var(p))?;
            self.emit(Instr::abc(Op::Inherit, t, pr.0, 0));
            self.free_operand(pr);
        }
        for (fname, fexpr) in fields {
            let kf = self.kstr(fname)?;
            if kf > u8::MAX as u16 {
                return Err(CompileError::ConstantOverflow(name.to_string()));
            }
            let r = self.compile_operand(fexpr)?;
            self.emit(Instr::abc(Op::SetProp, t, kf as u8, r.0));
            self.free_operand(r);
        }
        for m in methods {
            let mut params = vec!["self".to_string()];
            params.extend(m.params.iter().cloned());
            let k = self.compile_function_proto(&m.name, &params, &m.body)?;
            let mt = self.alloc()?;
            self.emit(Instr::abx(Op::Closure, mt, k));
            let km = self.kstr(&m.name)?;
            if km > u8::MAX as u16 {
                return Err(CompileError::ConstantOverflow(name.to_string()));
            }
            self.emit(Instr::abc(Op::SetMethod, t, km as u8, mt));
            self.free(mt);
        }
        self.cur().regs.unlock(t);
        if self.at_top_level() {
            let g = self.globals.intern(name);
            self.emit(Instr::abx(Op::SetGlobal, t, g));
            self.free(t);
        } else {
            self.bind_local(name, t);
        }
        Ok(())
    }

    /// Compile a nested function body into its own prototype; returns the
    /// constant-pool index of the prototype in the enclosing function.
    fn compile_function_proto(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
    ) -> Result<u16, CompileError> {
        self.funcs.push(FuncState::new(name, params.len() as u8));
        for p in params {
            let r = self.alloc()?;
            self.bind_local(p, r);
        }
        for s in body {
            self.compile_stmt(s)?;
        }
        let needs_return = !matches!(
            self.cur().b.code.last().map(|i| i.op()),
            Some(Op::Return)
        );
        if needs_return {
            self.emit(Instr::abc(Op::Return, 0, 1, 0));
        }
        let mut fs = self.funcs.pop().unwrap();
        fs.b.nregs = fs.regs.max.max(params.len() as u8).max(1);
        fuse_compare_jumps(&mut fs.b.code);
        let proto = Rc::new(fs.b.finish());
        let pv = Value::obj(self.heap.alloc(Obj::Proto(proto)));
        self.cur().b.add_const(pv)
    }

    fn finish_current(&mut self) -> Result<Proto, CompileError> {
        let needs_return = !matches!(
            self.cur().b.code.last().map(|i| i.op()),
            Some(Op::Return)
        );
        if needs_return {
            self.emit(Instr::abc(Op::Return, 0, 1, 0));
        }
        let mut fs = self.funcs.pop().unwrap();
        fs.b.nregs = fs.regs.max.max(1);
        fuse_compare_jumps(&mut fs.b.code);
        Ok(fs.b.finish())
    }
}

/// Recognize `name = name + 1` / `name = name - 1`.
fn incr_shape(name: &str, value: &Expr) -> Option<Op> {
    if let Expr::Binary { op, lhs, rhs } = value {
        if let (Expr::Variable(lname), Expr::Literal(Lit::Int(1))) = (lhs.as_ref(), rhs.as_ref()) {
            if lname == name {
                return match op {
                    BinOp::Add => Some(Op::Incr),
                    BinOp::Sub => Some(Op::Decr),
                    _ => None,
                };
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;

    fn compile(stmts: &[Stmt]) -> (Rc<Proto>, GlobalTable, Heap) {
        let mut globals = GlobalTable::new();
        let mut heap = Heap::new();
        let proto = compile_program(stmts, &mut globals, &mut heap).expect("compile");
        (proto, globals, heap)
    }

    fn ops(proto: &Proto) -> Vec<Op> {
        proto.code.iter().map(|c| c.get().op()).collect()
    }

    #[test]
    fn test_top_level_let_is_global() {
        let (proto, globals, _) = compile(&[Stmt::let_("x", Expr::int(1))]);
        assert!(ops(&proto).contains(&Op::SetGlobal));
        assert!(globals.get("x").is_some());
    }

    #[test]
    fn test_local_counter_peephole() {
        // while body assigning i = i + 1 on a local must emit INCR
        let program = [Stmt::func(
            "f",
            &[],
            vec![
                Stmt::let_("i", Expr::int(0)),
                Stmt::while_(
                    Expr::bin(BinOp::Lt, Expr::var("i"), Expr::int(10)),
                    vec![Stmt::assign("i", Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)))],
                ),
                Stmt::ret(Expr::var("i")),
            ],
        )];
        let (proto, _, heap) = compile(&program);
        // the function proto is a constant of main
        let fproto = proto
            .consts
            .iter()
            .find_map(|v| match heap.obj(*v) {
                Some(Obj::Proto(p)) => Some(p.clone()),
                _ => None,
            })
            .expect("function proto constant");
        let fops = ops(&fproto);
        assert!(fops.contains(&Op::Incr), "expected INCR, got {:?}", fops);
        // compare against a small int constant fuses into GEJK
        assert!(fops.contains(&Op::GeJk), "expected fused GEJK, got {:?}", fops);
    }

    #[test]
    fn test_global_accumulator_peephole() {
        let program = [
            Stmt::let_("s", Expr::int(0)),
            Stmt::assign("s", Expr::bin(BinOp::Add, Expr::var("s"), Expr::int(300))),
        ];
        let (proto, _, _) = compile(&program);
        assert!(ops(&proto).contains(&Op::AddG));
    }

    #[test]
    fn test_incrg_peephole() {
        let program = [
            Stmt::let_("c", Expr::int(0)),
            Stmt::assign("c", Expr::bin(BinOp::Add, Expr::var("c"), Expr::int(1))),
        ];
        let (proto, _, _) = compile(&program);
        assert!(ops(&proto).contains(&Op::IncrG));
    }

    #[test]
    fn test_upvalue_descriptors() {
        // fn outer() { let x = 1; fn inner() { return x; } return inner; }
        let program = [Stmt::func(
            "outer",
            &[],
            vec![
                Stmt::let_("x", Expr::int(1)),
                Stmt::func("inner", &[], vec![Stmt::ret(Expr::var("x"))]),
                Stmt::ret(Expr::var("inner")),
            ],
        )];
        let (proto, _, heap) = compile(&program);
        let outer = proto
            .consts
            .iter()
            .find_map(|v| match heap.obj(*v) {
                Some(Obj::Proto(p)) => Some(p.clone()),
                _ => None,
            })
            .expect("outer proto");
        let inner = outer
            .consts
            .iter()
            .find_map(|v| match heap.obj(*v) {
                Some(Obj::Proto(p)) => Some(p.clone()),
                _ => None,
            })
            .expect("inner proto");
        assert_eq!(inner.upvals.len(), 1);
        assert!(inner.upvals[0].is_local);
        let iops = ops(&inner);
        assert!(iops.contains(&Op::GetUpval));
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        let mut globals = GlobalTable::new();
        let mut heap = Heap::new();
        let err = compile_program(&[Stmt::Break], &mut globals, &mut heap).unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop));
    }

    #[test]
    fn test_builtin_call_lowering() {
        let program = [
            Stmt::let_("m", Expr::Map(vec![])),
            Stmt::print(Expr::call_named("keys", vec![Expr::var("m")])),
        ];
        let (proto, _, _) = compile(&program);
        assert!(ops(&proto).contains(&Op::Keys));
    }

    #[test]
    fn test_call_packs_window() {
        let program = [
            Stmt::func("f", &["a", "b"], vec![Stmt::ret(Expr::var("a"))]),
            Stmt::print(Expr::call_named("f", vec![Expr::int(1), Expr::int(2)])),
        ];
        let (proto, _, _) = compile(&program);
        let o = ops(&proto);
        assert!(o.contains(&Op::Call));
        // callee + 2 args moved into the window
        let calls = proto
            .code
            .iter()
            .map(|c| c.get())
            .find(|i| i.op() == Op::Call)
            .unwrap();
        assert_eq!(calls.b(), 3, "B encodes argc + 1");
        assert_eq!(calls.c(), 2, "C requests one result");
    }
}
