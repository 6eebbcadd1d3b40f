/// Sona Register VM
///
/// ARCHITECTURE
/// ────────────
/// • 32-bit fixed-width instructions (Op/A/B/C, Op/A/Bx, Op/A/sBx)
/// • One flat register file per execution context; frames carve windows
///   out of it (frame N+1's base starts at frame N's top)
/// • NaN-boxed values: integer fast paths never touch the heap
/// • Call frames on a Vec with a hard ceiling (no Rust-stack recursion)
/// • Globals indexed by u16 in a flat Vec<Value> (no string lookup)
/// • pc / base / proto are cached in locals across the dispatch loop and
///   written back to the frame only on control-flow changes
///
/// Exception handling is an explicit unwind over a try stack — no host
/// panics. Fibers each own a full ExecState; RESUME/YIELD swap contexts.
/// Backward jumps feed the hot-loop JIT (see jit.rs), which rewrites
/// JMP → JMP_HOT in place and runs native templates under type guards.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bytecode::{Instr, Op, Proto};
use crate::compiler::GlobalTable;
use crate::errors::VmError;
use crate::heap::{
    Closure, FiberObj, FiberState, Heap, InstanceObj, IterObj, ModuleObj, Obj,
};
use crate::jit::{self, Jit};
use crate::modules::{self, ModuleLoader};
use crate::value::Value;

/// Initial register-file size for the main context (grown on demand).
pub const REG_FILE_INIT: usize = 64 * 1024;
/// Initial register-file size for fiber contexts.
pub const FIBER_REG_INIT: usize = 1024;
/// Call-depth ceiling; exceeding it is a non-catchable stack overflow.
pub const FRAMES_MAX: usize = 2048;

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Frame {
    pub proto: Rc<Proto>,
    pub closure: Option<u32>,
    /// Saved pc, written back on calls and context switches.
    pub pc: usize,
    pub base: usize,
    pub top: usize,
    /// Absolute register receiving the return value.
    pub ret_reg: usize,
    pub want_result: bool,
    /// Set for module-executing frames: (module handle, previous file).
    pub module: Option<(u32, Option<PathBuf>)>,
}

#[derive(Debug)]
pub struct TryFrame {
    pub catch_pc: usize,
    pub frame_depth: usize,
    pub proto: Rc<Proto>,
}

/// Everything a suspended fiber needs to resume: register file, frame
/// stack, try stack, and live iterators. Globals, heap, modules, and the
/// JIT tables stay on the VM and are shared by all fibers.
#[derive(Debug)]
pub struct ExecState {
    pub regs: Vec<Value>,
    pub frames: Vec<Frame>,
    pub tries: Vec<TryFrame>,
    pub iters: HashMap<(usize, u8), u32>,
    pub reg_top: usize,
}

impl ExecState {
    fn new(reg_init: usize) -> Self {
        ExecState {
            regs: vec![Value::nil(); reg_init],
            frames: Vec::with_capacity(64),
            tries: Vec::new(),
            iters: HashMap::new(),
            reg_top: 0,
        }
    }
}

struct ResumeEntry {
    fiber: u32,
    saved: ExecState,
    ret_reg: usize,
    want: bool,
}

enum CallFlow {
    Pushed,
    Done,
}

enum ReturnFlow {
    Exit(Value),
    Continue,
}

pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

// ---------------------------------------------------------------------------
// Vm
// ---------------------------------------------------------------------------

pub struct Vm {
    pub heap: Heap,
    pub names: GlobalTable,
    pub globals: Vec<Value>,
    state: ExecState,
    resume_chain: Vec<ResumeEntry>,
    modules: HashMap<String, u32>,
    module_stack: Vec<u32>,
    pub module_paths: Vec<PathBuf>,
    pub current_file: Option<PathBuf>,
    loader: Option<ModuleLoader>,
    jit: Jit,
    last_error: Value,
    out: OutputSink,
    counters: Option<Box<[u64; 256]>>,
}

macro_rules! vm_try {
    ($self:expr, $proto:ident, $pc:ident, $base:ident, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => {
                $self.handle_error(err, &mut $proto, &mut $pc, &mut $base)?;
                continue;
            }
        }
    };
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut names = GlobalTable::new();
        let mut globals = Vec::new();
        crate::intrinsics::install(&mut names, &mut heap, &mut globals);
        let mut state = ExecState::new(REG_FILE_INIT);
        state.frames.reserve(FRAMES_MAX.min(256));
        Vm {
            heap,
            names,
            globals,
            state,
            resume_chain: Vec::new(),
            modules: HashMap::new(),
            module_stack: Vec::new(),
            module_paths: modules::default_search_paths(),
            current_file: None,
            loader: None,
            jit: Jit::new(),
            last_error: Value::nil(),
            out: Arc::new(Mutex::new(std::io::stdout())),
            counters: None,
        }
    }

    // ── Embedder surface ─────────────────────────────────────────────────────

    pub fn set_output(&mut self, out: OutputSink) {
        self.out = out;
    }

    /// Redirect PRINT into a byte buffer and return it (test harness hook).
    pub fn capture_output(&mut self) -> Arc<Mutex<Vec<u8>>> {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        self.out = buf.clone();
        buf
    }

    pub fn set_module_loader(&mut self, loader: ModuleLoader) {
        self.loader = Some(loader);
    }

    /// Install a named native function as a global.
    pub fn define_native(&mut self, name: &'static str, arity: u8, func: crate::heap::NativeFn) {
        let id = self.names.intern(name) as usize;
        if self.globals.len() <= id {
            self.globals.resize(id + 1, Value::nil());
        }
        let idx = self.heap.alloc(Obj::Native(crate::heap::NativeObj { name, arity, func }));
        self.globals[id] = Value::obj(idx);
    }

    pub fn global_by_name(&self, name: &str) -> Option<Value> {
        let id = self.names.get(name)? as usize;
        self.globals.get(id).copied()
    }

    pub fn enable_op_stats(&mut self) {
        self.counters = Some(Box::new([0u64; 256]));
    }

    pub fn op_stats(&self) -> Vec<(Op, u64)> {
        let Some(c) = self.counters.as_ref() else { return Vec::new() };
        let mut out: Vec<(Op, u64)> = (0u8..=255)
            .filter_map(|i| {
                let op = Op::try_from(i).ok()?;
                let n = c[i as usize];
                if n > 0 { Some((op, n)) } else { None }
            })
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    /// Write the opcode frequency table to the output sink.
    pub fn print_op_stats(&self) {
        let stats = self.op_stats();
        let mut out = self.out.lock();
        let total: u64 = stats.iter().map(|(_, n)| n).sum();
        let _ = writeln!(out, "=== opcode frequency ===");
        for (op, n) in &stats {
            let pct = if total > 0 { *n as f64 / total as f64 * 100.0 } else { 0.0 };
            let _ = writeln!(out, "  {:<12?} {:>12}  {:>6.2}%", op, n, pct);
        }
        let _ = writeln!(out, "  {:<12} {:>12}", "TOTAL", total);
    }

    /// Number of loops currently specialized to JMP_HOT.
    pub fn hot_loop_count(&self) -> usize {
        self.jit.patched_count()
    }

    pub fn deopt_count(&self) -> usize {
        self.jit.deopt_count()
    }

    fn sync_globals(&mut self) {
        if self.globals.len() < self.names.len() {
            self.globals.resize(self.names.len(), Value::nil());
        }
    }

    fn ensure_regs(&mut self, n: usize) {
        if self.state.regs.len() < n {
            self.state.regs.resize(n, Value::nil());
        }
    }

    // ── Entry point ──────────────────────────────────────────────────────────

    /// Execute a top-level prototype to completion.
    pub fn run(&mut self, proto: Rc<Proto>) -> Result<Value, VmError> {
        self.sync_globals();
        self.state.frames.clear();
        self.state.tries.clear();
        self.state.iters.clear();
        self.resume_chain.clear();
        self.module_stack.clear();
        self.last_error = Value::nil();
        if self.state.regs.len() < REG_FILE_INIT {
            self.state.regs.resize(REG_FILE_INIT, Value::nil());
        }
        let top = proto.nregs as usize;
        self.ensure_regs(top);
        self.state.frames.push(Frame {
            proto,
            closure: None,
            pc: 0,
            base: 0,
            top,
            ret_reg: 0,
            want_result: false,
            module: None,
        });
        self.state.reg_top = top;
        self.dispatch()
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self) -> Result<Value, VmError> {
        let (mut proto, mut pc, mut base) = {
            let f = self
                .state
                .frames
                .last()
                .ok_or_else(|| VmError::Internal("dispatch with no frame".into()))?;
            (f.proto.clone(), f.pc, f.base)
        };

        loop {
            let instr = proto.fetch(pc);
            pc += 1;
            if let Some(c) = self.counters.as_mut() {
                c[(instr.0 & 0xFF) as usize] += 1;
            }
            let a = instr.a() as usize;

            match instr.op() {
                // ── Loads / moves ──────────────────────────────────────────
                Op::Move => {
                    let v = self.state.regs[base + instr.b() as usize];
                    self.state.regs[base + a] = v;
                }
                Op::LoadK => {
                    self.state.regs[base + a] = proto.consts[instr.bx() as usize];
                }
                Op::LoadBool => {
                    self.state.regs[base + a] = Value::bool_val(instr.b() != 0);
                    if instr.c() != 0 {
                        pc += 1;
                    }
                }
                Op::LoadNil => {
                    for i in 0..=instr.b() as usize {
                        self.state.regs[base + a + i] = Value::nil();
                    }
                }

                // ── Globals ────────────────────────────────────────────────
                Op::GetGlobal => {
                    let v = self.globals.get(instr.bx() as usize).copied().unwrap_or(Value::nil());
                    self.state.regs[base + a] = v;
                }
                Op::SetGlobal => {
                    let bx = instr.bx() as usize;
                    if bx >= self.globals.len() {
                        self.globals.resize(bx + 1, Value::nil());
                    }
                    self.globals[bx] = self.state.regs[base + a];
                }

                // ── Arithmetic ─────────────────────────────────────────────
                Op::Add => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    // both-int fast path: single tag test, no heap traffic
                    let v = if Value::both_int(l, r) {
                        Value::int_or_float(l.as_int() + r.as_int())
                    } else {
                        vm_try!(self, proto, pc, base, arith_add(&mut self.heap, l, r))
                    };
                    self.state.regs[base + a] = v;
                }
                Op::Sub => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = if Value::both_int(l, r) {
                        Value::int_or_float(l.as_int() - r.as_int())
                    } else {
                        vm_try!(self, proto, pc, base, arith_sub(&self.heap, l, r))
                    };
                    self.state.regs[base + a] = v;
                }
                Op::Mul => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_mul(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::Div => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_div(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::Mod => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_mod(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::Pow => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_pow(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::Unm => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let out = if v.is_int() {
                        Value::int_or_float(-v.as_int())
                    } else if v.is_float() {
                        Value::number(-v.as_f64())
                    } else {
                        vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type(format!(
                                "cannot negate a {} value",
                                self.heap.type_name(v)
                            )))
                        )
                    };
                    self.state.regs[base + a] = out;
                }
                Op::AddK => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = proto.consts[instr.c() as usize];
                    let v = if Value::both_int(l, r) {
                        Value::int_or_float(l.as_int() + r.as_int())
                    } else {
                        vm_try!(self, proto, pc, base, arith_add(&mut self.heap, l, r))
                    };
                    self.state.regs[base + a] = v;
                }
                Op::SubK => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = proto.consts[instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_sub(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::MulK => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = proto.consts[instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_mul(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::DivK => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = proto.consts[instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, arith_div(&self.heap, l, r));
                    self.state.regs[base + a] = v;
                }
                Op::AddI => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let imm = instr.sc() as i64;
                    let v = if l.is_int() {
                        Value::int_or_float(l.as_int() + imm)
                    } else if l.is_float() {
                        Value::number(l.as_f64() + imm as f64)
                    } else {
                        vm_try!(self, proto, pc, base, arith_add(&mut self.heap, l, Value::int(imm)))
                    };
                    self.state.regs[base + a] = v;
                }
                Op::SubI => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let imm = instr.sc() as i64;
                    let v = if l.is_int() {
                        Value::int_or_float(l.as_int() - imm)
                    } else if l.is_float() {
                        Value::number(l.as_f64() - imm as f64)
                    } else {
                        vm_try!(self, proto, pc, base, arith_sub(&self.heap, l, Value::int(imm)))
                    };
                    self.state.regs[base + a] = v;
                }

                // ── Fused local/global updates ─────────────────────────────
                Op::Incr => {
                    let v = self.state.regs[base + a];
                    let out = vm_try!(self, proto, pc, base, bump(&self.heap, v, 1));
                    self.state.regs[base + a] = out;
                }
                Op::Decr => {
                    let v = self.state.regs[base + a];
                    let out = vm_try!(self, proto, pc, base, bump(&self.heap, v, -1));
                    self.state.regs[base + a] = out;
                }
                Op::IncrG => {
                    let bx = instr.bx() as usize;
                    let g = self.globals.get(bx).copied().unwrap_or(Value::nil());
                    let out = vm_try!(self, proto, pc, base, bump(&self.heap, g, 1));
                    self.globals[bx] = out;
                }
                Op::DecrG => {
                    let bx = instr.bx() as usize;
                    let g = self.globals.get(bx).copied().unwrap_or(Value::nil());
                    let out = vm_try!(self, proto, pc, base, bump(&self.heap, g, -1));
                    self.globals[bx] = out;
                }
                Op::AddG => {
                    let bx = instr.bx() as usize;
                    let g = self.globals.get(bx).copied().unwrap_or(Value::nil());
                    let r = self.state.regs[base + a];
                    let out = vm_try!(self, proto, pc, base, arith_add(&mut self.heap, g, r));
                    if bx >= self.globals.len() {
                        self.globals.resize(bx + 1, Value::nil());
                    }
                    self.globals[bx] = out;
                }
                Op::SubG => {
                    let bx = instr.bx() as usize;
                    let g = self.globals.get(bx).copied().unwrap_or(Value::nil());
                    let r = self.state.regs[base + a];
                    let out = vm_try!(self, proto, pc, base, arith_sub(&self.heap, g, r));
                    if bx >= self.globals.len() {
                        self.globals.resize(bx + 1, Value::nil());
                    }
                    self.globals[bx] = out;
                }

                // ── Comparison ─────────────────────────────────────────────
                Op::Eq => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    self.state.regs[base + a] = Value::bool_val(self.heap.eq_values(l, r));
                }
                Op::Neq => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    self.state.regs[base + a] = Value::bool_val(!self.heap.eq_values(l, r));
                }
                Op::Lt => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.lt_values(l, r));
                    self.state.regs[base + a] = Value::bool_val(v);
                }
                Op::Le => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.le_values(l, r));
                    self.state.regs[base + a] = Value::bool_val(v);
                }
                Op::Gt => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.lt_values(r, l));
                    self.state.regs[base + a] = Value::bool_val(v);
                }
                Op::Ge => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.le_values(r, l));
                    self.state.regs[base + a] = Value::bool_val(v);
                }

                // ── Compare-and-branch ─────────────────────────────────────
                Op::EqJ => {
                    let l = self.state.regs[base + a];
                    let r = self.state.regs[base + instr.b() as usize];
                    if self.heap.eq_values(l, r) {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::NeJ => {
                    let l = self.state.regs[base + a];
                    let r = self.state.regs[base + instr.b() as usize];
                    if !self.heap.eq_values(l, r) {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::LtJ => {
                    let l = self.state.regs[base + a];
                    let r = self.state.regs[base + instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.lt_values(l, r));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::LeJ => {
                    let l = self.state.regs[base + a];
                    let r = self.state.regs[base + instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.le_values(l, r));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::EqJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    if self.heap.eq_values(l, r) {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::NeJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    if !self.heap.eq_values(l, r) {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::LtJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.lt_values(l, r));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::LeJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.le_values(l, r));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::GtJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.lt_values(r, l));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }
                Op::GeJk => {
                    let l = self.state.regs[base + a];
                    let r = proto.consts[instr.b() as usize];
                    let cond = vm_try!(self, proto, pc, base, self.heap.le_values(r, l));
                    if cond {
                        pc = (pc as i64 + instr.sc() as i64) as usize;
                    }
                }

                // ── Logic ──────────────────────────────────────────────────
                Op::Not => {
                    let v = self.state.regs[base + instr.b() as usize];
                    self.state.regs[base + a] = Value::bool_val(!v.is_truthy());
                }
                Op::And => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    self.state.regs[base + a] = if l.is_truthy() { r } else { l };
                }
                Op::Or => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    self.state.regs[base + a] = if l.is_truthy() { l } else { r };
                }
                Op::Test => {
                    let v = self.state.regs[base + a];
                    if v.is_truthy() != (instr.c() != 0) {
                        pc += 1;
                    }
                }
                Op::TestSet => {
                    let v = self.state.regs[base + instr.b() as usize];
                    if v.is_truthy() == (instr.c() != 0) {
                        self.state.regs[base + a] = v;
                    } else {
                        pc += 1;
                    }
                }

                // ── Control flow ───────────────────────────────────────────
                Op::Jmp => {
                    let sbx = instr.sbx();
                    if sbx < 0 {
                        self.jit.profile_backjump(&proto, pc - 1, sbx);
                    }
                    pc = (pc as i64 + sbx as i64) as usize;
                }
                Op::JmpHot => {
                    let sbx = instr.sbx();
                    if !self.run_hot_loop(a, base, &proto, pc - 1, sbx) {
                        // guard failure or mid-loop bail: take the jump normally
                        pc = (pc as i64 + sbx as i64) as usize;
                    }
                }
                Op::ForPrep => {
                    let init = self.state.regs[base + a];
                    let step = self.state.regs[base + a + 2];
                    let v = vm_try!(self, proto, pc, base, arith_sub(&self.heap, init, step));
                    self.state.regs[base + a] = v;
                    pc = (pc as i64 + instr.sbx() as i64) as usize;
                }
                Op::ForLoop => {
                    let cur = self.state.regs[base + a];
                    let limit = self.state.regs[base + a + 1];
                    let step = self.state.regs[base + a + 2];
                    let next = vm_try!(self, proto, pc, base, arith_add(&mut self.heap, cur, step));
                    self.state.regs[base + a] = next;
                    let cont = if step.as_number() > 0.0 {
                        vm_try!(self, proto, pc, base, self.heap.le_values(next, limit))
                    } else {
                        vm_try!(self, proto, pc, base, self.heap.le_values(limit, next))
                    };
                    if cont {
                        self.state.regs[base + a + 3] = next;
                        pc = (pc as i64 + instr.sbx() as i64) as usize;
                    }
                }

                // ── Arrays / tables ────────────────────────────────────────
                Op::NewArray => {
                    let v = self.heap.new_array(Vec::with_capacity(instr.b() as usize));
                    self.state.regs[base + a] = v;
                }
                Op::NewTable => {
                    let v = self.heap.new_map();
                    self.state.regs[base + a] = v;
                }
                Op::GetTable => {
                    let o = self.state.regs[base + instr.b() as usize];
                    let k = self.state.regs[base + instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.index_get(o, k));
                    self.state.regs[base + a] = v;
                    // quicken: array + int observations rewrite to the typed form
                    if k.is_int() && matches!(self.heap.obj(o), Some(Obj::Array(_))) {
                        proto.code[pc - 1].set(Instr::abc(Op::GetArrayI, instr.a(), instr.b(), instr.c()));
                    }
                }
                Op::SetTable => {
                    let o = self.state.regs[base + a];
                    let k = self.state.regs[base + instr.b() as usize];
                    let v = self.state.regs[base + instr.c() as usize];
                    vm_try!(self, proto, pc, base, self.heap.index_set(o, k, v));
                    if k.is_int() && matches!(self.heap.obj(o), Some(Obj::Array(_))) {
                        proto.code[pc - 1].set(Instr::abc(Op::SetArrayI, instr.a(), instr.b(), instr.c()));
                    }
                }
                Op::GetTableK => {
                    let o = self.state.regs[base + instr.b() as usize];
                    let k = proto.consts[instr.c() as usize];
                    let v = vm_try!(self, proto, pc, base, self.heap.index_get(o, k));
                    self.state.regs[base + a] = v;
                }
                Op::SetTableK => {
                    let o = self.state.regs[base + a];
                    let k = proto.consts[instr.b() as usize];
                    let v = self.state.regs[base + instr.c() as usize];
                    vm_try!(self, proto, pc, base, self.heap.index_set(o, k, v));
                }
                Op::GetArrayI => {
                    let o = self.state.regs[base + instr.b() as usize];
                    let k = self.state.regs[base + instr.c() as usize];
                    let fast = if k.is_int() {
                        self.heap.as_array(o).map(|items| {
                            let i = k.as_int();
                            if i >= 0 {
                                items.get(i as usize).copied().unwrap_or(Value::nil())
                            } else {
                                Value::nil()
                            }
                        })
                    } else {
                        None
                    };
                    match fast {
                        Some(v) => self.state.regs[base + a] = v,
                        None => {
                            // deopt back to the generic form and re-execute
                            proto.code[pc - 1].set(Instr::abc(Op::GetTable, instr.a(), instr.b(), instr.c()));
                            pc -= 1;
                        }
                    }
                }
                Op::SetArrayI => {
                    let o = self.state.regs[base + a];
                    let k = self.state.regs[base + instr.b() as usize];
                    let v = self.state.regs[base + instr.c() as usize];
                    let mut fast = false;
                    if k.is_int() && k.as_int() >= 0 {
                        let i = k.as_int() as usize;
                        if let Some(items) = self.heap.array_mut(o) {
                            if i < items.len() {
                                items[i] = v;
                                fast = true;
                            }
                        }
                    }
                    if !fast {
                        proto.code[pc - 1].set(Instr::abc(Op::SetTable, instr.a(), instr.b(), instr.c()));
                        pc -= 1;
                    }
                }
                Op::Append => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let arr = self.state.regs[base + a];
                    match self.heap.array_mut(arr) {
                        Some(items) => items.push(v),
                        None => {
                            let t = self.heap.type_name(arr);
                            vm_try!(
                                self,
                                proto,
                                pc,
                                base,
                                Err::<(), _>(VmError::Type(format!("cannot append to a {} value", t)))
                            );
                        }
                    }
                }
                Op::ArrPop => {
                    let arr = self.state.regs[base + instr.b() as usize];
                    let v = match self.heap.array_mut(arr) {
                        Some(items) => items.pop().unwrap_or(Value::nil()),
                        None => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("pop expects an array".into()))
                        ),
                    };
                    self.state.regs[base + a] = v;
                }
                Op::ArrShift => {
                    let arr = self.state.regs[base + instr.b() as usize];
                    let v = match self.heap.array_mut(arr) {
                        Some(items) => {
                            if items.is_empty() {
                                Value::nil()
                            } else {
                                items.remove(0)
                            }
                        }
                        None => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("shift expects an array".into()))
                        ),
                    };
                    self.state.regs[base + a] = v;
                }
                Op::ArrUnshift => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let arr = self.state.regs[base + a];
                    match self.heap.array_mut(arr) {
                        Some(items) => items.insert(0, v),
                        None => {
                            vm_try!(
                                self,
                                proto,
                                pc,
                                base,
                                Err::<(), _>(VmError::Type("unshift expects an array".into()))
                            );
                        }
                    }
                }
                Op::Len => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let n = match self.heap.obj(v) {
                        Some(Obj::Str(s)) => {
                            proto.code[pc - 1].set(Instr::abc(Op::StrLen, instr.a(), instr.b(), 0));
                            s.len() as i64
                        }
                        Some(Obj::Array(items)) => {
                            proto.code[pc - 1].set(Instr::abc(Op::ArrLen, instr.a(), instr.b(), 0));
                            items.len() as i64
                        }
                        Some(Obj::Map(m)) => m.len() as i64,
                        _ => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type(format!(
                                "len expects a string, array, or map, got {}",
                                self.heap.type_name(v)
                            )))
                        ),
                    };
                    self.state.regs[base + a] = Value::int(n);
                }
                Op::ArrLen => {
                    let v = self.state.regs[base + instr.b() as usize];
                    match self.heap.as_array(v) {
                        Some(items) => self.state.regs[base + a] = Value::int(items.len() as i64),
                        None => {
                            proto.code[pc - 1].set(Instr::abc(Op::Len, instr.a(), instr.b(), 0));
                            pc -= 1;
                        }
                    }
                }
                Op::StrLen => {
                    let v = self.state.regs[base + instr.b() as usize];
                    match self.heap.as_str(v) {
                        Some(s) => self.state.regs[base + a] = Value::int(s.len() as i64),
                        None => {
                            proto.code[pc - 1].set(Instr::abc(Op::Len, instr.a(), instr.b(), 0));
                            pc -= 1;
                        }
                    }
                }

                // ── Strings ────────────────────────────────────────────────
                Op::Concat => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    if self.heap.is_str(l) && self.heap.is_str(r) {
                        proto.code[pc - 1].set(Instr::abc(Op::StrCat, instr.a(), instr.b(), instr.c()));
                    }
                    let s = format!("{}{}", self.heap.render(l), self.heap.render(r));
                    self.state.regs[base + a] = self.heap.str_value(&s);
                }
                Op::StrCat => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    match (self.heap.as_str(l), self.heap.as_str(r)) {
                        (Some(x), Some(y)) => {
                            let s = format!("{}{}", x, y);
                            self.state.regs[base + a] = self.heap.str_value(&s);
                        }
                        _ => {
                            proto.code[pc - 1].set(Instr::abc(Op::Concat, instr.a(), instr.b(), instr.c()));
                            pc -= 1;
                        }
                    }
                }
                Op::Upper => {
                    let v = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "upper"));
                    let s = v.to_uppercase();
                    self.state.regs[base + a] = self.heap.str_value(&s);
                }
                Op::Lower => {
                    let v = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "lower"));
                    let s = v.to_lowercase();
                    self.state.regs[base + a] = self.heap.str_value(&s);
                }
                Op::Trim => {
                    let v = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "trim"));
                    let s = v.trim().to_string();
                    self.state.regs[base + a] = self.heap.str_value(&s);
                }
                Op::Contains => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let out = match (self.heap.obj(l), self.heap.as_str(r)) {
                        (Some(Obj::Str(s)), Some(n)) => s.contains(n.as_ref()),
                        (Some(Obj::Array(items)), _) => {
                            items.iter().any(|&e| self.heap.eq_values(e, r))
                        }
                        _ => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("contains expects a string or array".into()))
                        ),
                    };
                    self.state.regs[base + a] = Value::bool_val(out);
                }
                Op::StartsWith => {
                    let s = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "starts_with"));
                    let n = vm_try!(self, proto, pc, base, self.str_arg(base, instr.c(), "starts_with"));
                    self.state.regs[base + a] = Value::bool_val(s.starts_with(n.as_ref()));
                }
                Op::EndsWith => {
                    let s = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "ends_with"));
                    let n = vm_try!(self, proto, pc, base, self.str_arg(base, instr.c(), "ends_with"));
                    self.state.regs[base + a] = Value::bool_val(s.ends_with(n.as_ref()));
                }
                Op::IndexOf => {
                    let l = self.state.regs[base + instr.b() as usize];
                    let r = self.state.regs[base + instr.c() as usize];
                    let idx = match self.heap.obj(l) {
                        Some(Obj::Str(s)) => match self.heap.as_str(r) {
                            Some(n) => s.find(n.as_ref()).map(|i| i as i64).unwrap_or(-1),
                            None => -1,
                        },
                        Some(Obj::Array(items)) => items
                            .iter()
                            .position(|&e| self.heap.eq_values(e, r))
                            .map(|i| i as i64)
                            .unwrap_or(-1),
                        _ => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("index_of expects a string or array".into()))
                        ),
                    };
                    self.state.regs[base + a] = Value::int(idx);
                }
                Op::Split => {
                    let s = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "split"));
                    let sep = vm_try!(self, proto, pc, base, self.str_arg(base, instr.c(), "split"));
                    let parts: Vec<String> = if sep.is_empty() {
                        s.chars().map(|c| c.to_string()).collect()
                    } else {
                        s.split(sep.as_ref()).map(|p| p.to_string()).collect()
                    };
                    let vals: Vec<Value> = parts.iter().map(|p| self.heap.str_value(p)).collect();
                    self.state.regs[base + a] = self.heap.new_array(vals);
                }
                Op::Join => {
                    let arr = self.state.regs[base + instr.b() as usize];
                    let sep = vm_try!(self, proto, pc, base, self.str_arg(base, instr.c(), "join"));
                    let items = match self.heap.as_array(arr) {
                        Some(items) => items.clone(),
                        None => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("join expects an array".into()))
                        ),
                    };
                    let parts: Vec<String> = items.iter().map(|&e| self.heap.render(e)).collect();
                    let s = parts.join(sep.as_ref());
                    self.state.regs[base + a] = self.heap.str_value(&s);
                }
                Op::SubStr => {
                    let s = vm_try!(self, proto, pc, base, self.str_arg(base, instr.b(), "substr"));
                    let start = self.state.regs[base + instr.c() as usize];
                    let start = if start.is_number() { start.as_number().max(0.0) as usize } else { 0 };
                    let bytes = s.as_bytes();
                    let start = start.min(bytes.len());
                    let out = String::from_utf8_lossy(&bytes[start..]).into_owned();
                    self.state.regs[base + a] = self.heap.str_value(&out);
                }

                // ── Maps / types ───────────────────────────────────────────
                Op::Keys => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let keys: Vec<String> = match self.heap.as_map(v) {
                        Some(m) => m.keys().cloned().collect(),
                        None => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type(format!(
                                "keys expects a map, got {}",
                                self.heap.type_name(v)
                            )))
                        ),
                    };
                    let vals: Vec<Value> = keys.iter().map(|k| self.heap.str_value(k)).collect();
                    self.state.regs[base + a] = self.heap.new_array(vals);
                }
                Op::HasKey => {
                    let m = self.state.regs[base + instr.b() as usize];
                    let k = self.state.regs[base + instr.c() as usize];
                    let key = self.heap.key_string(k);
                    let out = match self.heap.as_map(m) {
                        Some(map) => map.contains_key(&key),
                        None => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type("haskey expects a map".into()))
                        ),
                    };
                    self.state.regs[base + a] = Value::bool_val(out);
                }
                Op::TypeOf => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let name = self.heap.type_name(v);
                    self.state.regs[base + a] = self.heap.str_value(name);
                }
                Op::IsType => {
                    let v = self.state.regs[base + instr.b() as usize];
                    let tag = self.heap.type_tag(v) as u8;
                    self.state.regs[base + a] = Value::bool_val(tag == instr.c());
                }

                // ── Calls ──────────────────────────────────────────────────
                Op::Call => {
                    let b = instr.b() as usize;
                    let c = instr.c() as usize;
                    let callee = self.state.regs[base + a];
                    let argc = b.saturating_sub(1);
                    if let Some(f) = self.state.frames.last_mut() {
                        f.pc = pc;
                    }
                    let flow = vm_try!(
                        self,
                        proto,
                        pc,
                        base,
                        self.call_value(callee, base + a, argc, c > 1)
                    );
                    if matches!(flow, CallFlow::Pushed) {
                        let f = self.state.frames.last().unwrap();
                        proto = f.proto.clone();
                        pc = f.pc;
                        base = f.base;
                    }
                }
                Op::TailCall => {
                    let b = instr.b() as usize;
                    let callee = self.state.regs[base + a];
                    let argc = b.saturating_sub(1);
                    match self.tail_call(callee, base, base + a, argc) {
                        Ok(Some(ret)) => match self.do_return(ret)? {
                            ReturnFlow::Exit(v) => return Ok(v),
                            ReturnFlow::Continue => {
                                let f = self.state.frames.last().unwrap();
                                proto = f.proto.clone();
                                pc = f.pc;
                                base = f.base;
                            }
                        },
                        Ok(None) => {
                            let f = self.state.frames.last().unwrap();
                            proto = f.proto.clone();
                            pc = f.pc;
                            base = f.base;
                        }
                        Err(e) => {
                            vm_try!(self, proto, pc, base, Err::<(), VmError>(e));
                        }
                    }
                }
                Op::Return => {
                    let b = instr.b() as usize;
                    let val = if b >= 2 { self.state.regs[base + a] } else { Value::nil() };
                    match self.do_return(val)? {
                        ReturnFlow::Exit(v) => return Ok(v),
                        ReturnFlow::Continue => {
                            let f = self.state.frames.last().unwrap();
                            proto = f.proto.clone();
                            pc = f.pc;
                            base = f.base;
                        }
                    }
                }

                // ── Closures / upvalues ────────────────────────────────────
                Op::Closure => {
                    let pv = proto.consts[instr.bx() as usize];
                    let sub = match self.heap.obj(pv) {
                        Some(Obj::Proto(p)) => p.clone(),
                        _ => {
                            return Err(VmError::Internal("CLOSURE constant is not a prototype".into()))
                        }
                    };
                    let mut ups = Vec::with_capacity(sub.upvals.len());
                    for d in sub.upvals.iter() {
                        let cell = if d.is_local {
                            // closed on capture: snapshot the local now
                            let v = self.state.regs[base + d.index as usize];
                            self.heap.alloc(Obj::Upvalue(v))
                        } else {
                            let cur = self
                                .state
                                .frames
                                .last()
                                .and_then(|f| f.closure)
                                .ok_or_else(|| {
                                    VmError::Internal("upvalue capture outside a closure".into())
                                })?;
                            match self.heap.get(cur) {
                                Obj::Closure(c) => c.upvals[d.index as usize],
                                _ => {
                                    return Err(VmError::Internal(
                                        "enclosing frame is not a closure".into(),
                                    ))
                                }
                            }
                        };
                        ups.push(cell);
                    }
                    let idx = self.heap.alloc(Obj::Closure(Closure { proto: sub, upvals: ups }));
                    self.state.regs[base + a] = Value::obj(idx);
                }
                Op::GetUpval => {
                    let cur = self.state.frames.last().and_then(|f| f.closure);
                    let v = match cur {
                        Some(ci) => match self.heap.get(ci) {
                            Obj::Closure(c) => {
                                let cell = c.upvals[instr.b() as usize];
                                match self.heap.get(cell) {
                                    Obj::Upvalue(v) => *v,
                                    _ => return Err(VmError::Internal("bad upvalue cell".into())),
                                }
                            }
                            _ => return Err(VmError::Internal("frame closure is not a closure".into())),
                        },
                        None => return Err(VmError::Internal("GETUPVAL outside a closure".into())),
                    };
                    self.state.regs[base + a] = v;
                }
                Op::SetUpval => {
                    let v = self.state.regs[base + a];
                    let cur = self.state.frames.last().and_then(|f| f.closure);
                    match cur {
                        Some(ci) => {
                            let cell = match self.heap.get(ci) {
                                Obj::Closure(c) => c.upvals[instr.b() as usize],
                                _ => return Err(VmError::Internal("frame closure is not a closure".into())),
                            };
                            match self.heap.get_mut(cell) {
                                Obj::Upvalue(slot) => *slot = v,
                                _ => return Err(VmError::Internal("bad upvalue cell".into())),
                            }
                        }
                        None => return Err(VmError::Internal("SETUPVAL outside a closure".into())),
                    }
                }

                // ── Iterators ──────────────────────────────────────────────
                Op::IterInit => {
                    let target = self.state.regs[base + instr.b() as usize];
                    let keys = match self.heap.obj(target) {
                        Some(Obj::Array(_)) => None,
                        Some(Obj::Map(m)) => Some(m.keys().cloned().collect::<Vec<String>>()),
                        _ => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type(format!(
                                "cannot iterate over a {} value",
                                self.heap.type_name(target)
                            )))
                        ),
                    };
                    let iidx = self.heap.alloc(Obj::Iter(IterObj { target, index: 0, keys }));
                    self.state.iters.insert((self.state.frames.len(), instr.a()), iidx);
                    self.state.regs[base + a] = target;
                    self.state.regs[base + a + 1] = Value::int(0);
                }
                Op::IterNext => {
                    let key = (self.state.frames.len(), instr.a());
                    let iidx = match self.state.iters.get(&key) {
                        Some(&i) => i,
                        None => {
                            return Err(VmError::Internal(format!(
                                "no iterator registered for frame {} register {}",
                                key.0, key.1
                            )))
                        }
                    };
                    enum Step {
                        Done,
                        Arr(Value, i64),
                        Map(String, Value),
                    }
                    let step = match self.heap.get(iidx) {
                        Obj::Iter(it) => match self.heap.obj(it.target) {
                            Some(Obj::Array(items)) => {
                                if it.index >= items.len() {
                                    Step::Done
                                } else {
                                    Step::Arr(items[it.index], it.index as i64)
                                }
                            }
                            Some(Obj::Map(m)) => {
                                let keys = it.keys.as_deref().unwrap_or(&[]);
                                if it.index >= keys.len() {
                                    Step::Done
                                } else {
                                    let k = keys[it.index].clone();
                                    let v = m.get(&k).copied().unwrap_or(Value::nil());
                                    Step::Map(k, v)
                                }
                            }
                            _ => return Err(VmError::Internal("iterator target vanished".into())),
                        },
                        _ => return Err(VmError::Internal("iterator slot is not an iterator".into())),
                    };
                    match step {
                        Step::Done => {
                            self.state.iters.remove(&key);
                            pc = (pc as i64 + instr.sbx() as i64) as usize;
                        }
                        Step::Arr(v, i) => {
                            self.state.regs[base + a + 2] = v;
                            self.state.regs[base + a + 3] = Value::int(i);
                            self.state.regs[base + a + 1] = Value::int(i + 1);
                            if let Obj::Iter(it) = self.heap.get_mut(iidx) {
                                it.index += 1;
                            }
                        }
                        Step::Map(k, v) => {
                            let ks = self.heap.str_value(&k);
                            self.state.regs[base + a + 2] = ks;
                            self.state.regs[base + a + 3] = v;
                            if let Obj::Iter(it) = self.heap.get_mut(iidx) {
                                it.index += 1;
                                self.state.regs[base + a + 1] = Value::int(it.index as i64);
                            }
                        }
                    }
                }

                // ── OOP ────────────────────────────────────────────────────
                Op::Class => {
                    let name = match self.heap.as_str(proto.consts[instr.bx() as usize]) {
                        Some(s) => s,
                        None => return Err(VmError::Internal("CLASS name constant is not a string".into())),
                    };
                    let idx = self.heap.alloc(Obj::Class(crate::heap::ClassObj {
                        name,
                        methods: HashMap::new(),
                        props: HashMap::new(),
                        parent: None,
                    }));
                    self.state.regs[base + a] = Value::obj(idx);
                }
                Op::Instance => {
                    let cls = self.state.regs[base + instr.b() as usize];
                    let cls_idx = match self.heap.obj(cls) {
                        Some(Obj::Class(_)) => cls.as_obj(),
                        _ => vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            Err(VmError::Type(format!(
                                "cannot instantiate a {} value",
                                self.heap.type_name(cls)
                            )))
                        ),
                    };
                    let fields = self.heap.collect_props(cls_idx);
                    let idx = self.heap.alloc(Obj::Instance(InstanceObj { class: cls_idx, fields }));
                    self.state.regs[base + a] = Value::obj(idx);
                }
                Op::GetMethod => {
                    let obj = self.state.regs[base + instr.b() as usize];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.c() as u16));
                    let v = vm_try!(self, proto, pc, base, self.get_member(obj, &name, true));
                    self.state.regs[base + a] = v;
                }
                Op::SetMethod => {
                    let cls = self.state.regs[base + a];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.b() as u16));
                    let m = self.state.regs[base + instr.c() as usize];
                    if !cls.is_obj() {
                        vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("SETMETHOD expects a class".into())));
                    }
                    match self.heap.get_mut(cls.as_obj()) {
                        Obj::Class(c) => {
                            c.methods.insert(name.to_string(), m);
                        }
                        _ => {
                            vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("SETMETHOD expects a class".into())));
                        }
                    }
                }
                Op::GetProp => {
                    let obj = self.state.regs[base + instr.b() as usize];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.c() as u16));
                    let v = vm_try!(self, proto, pc, base, self.get_member(obj, &name, false));
                    self.state.regs[base + a] = v;
                }
                Op::SetProp => {
                    let obj = self.state.regs[base + a];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.b() as u16));
                    let v = self.state.regs[base + instr.c() as usize];
                    vm_try!(self, proto, pc, base, self.set_member(obj, &name, v));
                }
                Op::Inherit => {
                    let child = self.state.regs[base + a];
                    let parent = self.state.regs[base + instr.b() as usize];
                    let ok = matches!(self.heap.obj(child), Some(Obj::Class(_)))
                        && matches!(self.heap.obj(parent), Some(Obj::Class(_)));
                    if !ok {
                        vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("INHERIT expects two classes".into())));
                    }
                    let pidx = parent.as_obj();
                    if let Obj::Class(c) = self.heap.get_mut(child.as_obj()) {
                        c.parent = Some(pidx);
                    }
                }
                Op::Super => {
                    let recv = self.state.regs[base + instr.b() as usize];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.c() as u16));
                    let v = vm_try!(self, proto, pc, base, self.super_method(recv, &name));
                    self.state.regs[base + a] = v;
                }
                Op::SelfPrep => {
                    let recv = self.state.regs[base + instr.b() as usize];
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.c() as u16));
                    self.state.regs[base + a + 1] = recv;
                    let member = vm_try!(self, proto, pc, base, self.raw_member(recv, &name));
                    self.state.regs[base + a] = member;
                }

                // ── Exceptions ─────────────────────────────────────────────
                Op::Try => {
                    let catch_pc = (pc as i64 + instr.sbx() as i64) as usize;
                    self.state.tries.push(TryFrame {
                        catch_pc,
                        frame_depth: self.state.frames.len(),
                        proto: proto.clone(),
                    });
                }
                Op::EndTry => {
                    if self.state.tries.pop().is_none() {
                        return Err(VmError::Internal("ENDTRY with empty try stack".into()));
                    }
                }
                Op::Throw => {
                    let v = self.state.regs[base + a];
                    vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Thrown(v)));
                }
                Op::GetError => {
                    self.state.regs[base + a] = self.last_error;
                }

                // ── Fibers ─────────────────────────────────────────────────
                Op::Fiber => {
                    let entry = self.state.regs[base + instr.b() as usize];
                    if !matches!(self.heap.obj(entry), Some(Obj::Closure(_))) {
                        vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("fiber expects a function".into())));
                    }
                    let idx = self.heap.alloc(Obj::Fiber(Box::new(FiberObj {
                        state: FiberState::New,
                        entry,
                        ctx: None,
                        resume_reg: 0,
                        resume_want: false,
                    })));
                    self.state.regs[base + a] = Value::obj(idx);
                }
                Op::Resume => {
                    let b = instr.b() as usize;
                    let c = instr.c() as usize;
                    let fv = self.state.regs[base + b];
                    let arg = if c >= 2 { self.state.regs[base + b + 1] } else { Value::nil() };
                    let fidx = match self.heap.obj(fv) {
                        Some(Obj::Fiber(_)) => fv.as_obj(),
                        _ => vm_try!(self, proto, pc, base, Err(VmError::Type("resume expects a fiber".into()))),
                    };
                    let fstate = match self.heap.get(fidx) {
                        Obj::Fiber(f) => f.state,
                        _ => unreachable!(),
                    };
                    match fstate {
                        FiberState::New => {
                            let entry = match self.heap.get(fidx) {
                                Obj::Fiber(f) => f.entry,
                                _ => unreachable!(),
                            };
                            let (cl_idx, cl_proto) = match self.heap.obj(entry) {
                                Some(Obj::Closure(c)) => (entry.as_obj(), c.proto.clone()),
                                _ => vm_try!(self, proto, pc, base, Err(VmError::Type("fiber entry is not a function".into()))),
                            };
                            let mut child = ExecState::new(FIBER_REG_INIT.max(cl_proto.nregs as usize));
                            if cl_proto.arity >= 1 {
                                child.regs[0] = arg;
                            }
                            let top = cl_proto.nregs as usize;
                            child.reg_top = top;
                            child.frames.push(Frame {
                                proto: cl_proto,
                                closure: Some(cl_idx),
                                pc: 0,
                                base: 0,
                                top,
                                ret_reg: 0,
                                want_result: false,
                                module: None,
                            });
                            if let Some(f) = self.state.frames.last_mut() {
                                f.pc = pc;
                            }
                            let old = std::mem::replace(&mut self.state, child);
                            self.resume_chain.push(ResumeEntry {
                                fiber: fidx,
                                saved: old,
                                ret_reg: base + a,
                                want: true,
                            });
                            if let Obj::Fiber(f) = self.heap.get_mut(fidx) {
                                f.state = FiberState::Running;
                            }
                            let f = self.state.frames.last().unwrap();
                            proto = f.proto.clone();
                            pc = f.pc;
                            base = f.base;
                        }
                        FiberState::Suspended => {
                            let (mut ctx, rreg, rwant) = match self.heap.get_mut(fidx) {
                                Obj::Fiber(f) => {
                                    let ctx = f.ctx.take().ok_or_else(|| {
                                        VmError::Internal("suspended fiber has no context".into())
                                    })?;
                                    (ctx, f.resume_reg, f.resume_want)
                                }
                                _ => unreachable!(),
                            };
                            if rwant {
                                ctx.regs[rreg] = arg;
                            }
                            if let Some(f) = self.state.frames.last_mut() {
                                f.pc = pc;
                            }
                            let old = std::mem::replace(&mut self.state, ctx);
                            self.resume_chain.push(ResumeEntry {
                                fiber: fidx,
                                saved: old,
                                ret_reg: base + a,
                                want: true,
                            });
                            if let Obj::Fiber(f) = self.heap.get_mut(fidx) {
                                f.state = FiberState::Running;
                            }
                            let f = self.state.frames.last().unwrap();
                            proto = f.proto.clone();
                            pc = f.pc;
                            base = f.base;
                        }
                        FiberState::Running => {
                            vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("fiber is already running".into())));
                        }
                        FiberState::Dead => {
                            vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("cannot resume a dead fiber".into())));
                        }
                    }
                }
                Op::Yield => {
                    let bb = instr.b() as usize;
                    let val = if bb >= 2 { self.state.regs[base + a] } else { Value::nil() };
                    if self.resume_chain.is_empty() {
                        vm_try!(self, proto, pc, base, Err::<(), _>(VmError::Type("yield outside a fiber".into())));
                    }
                    let entry = self.resume_chain.pop().unwrap();
                    if let Some(f) = self.state.frames.last_mut() {
                        f.pc = pc;
                    }
                    let resume_reg = base + a;
                    let fiber_ctx = std::mem::replace(&mut self.state, entry.saved);
                    if let Obj::Fiber(f) = self.heap.get_mut(entry.fiber) {
                        f.ctx = Some(fiber_ctx);
                        f.state = FiberState::Suspended;
                        f.resume_reg = resume_reg;
                        f.resume_want = true;
                    }
                    if entry.want {
                        self.state.regs[entry.ret_reg] = val;
                    }
                    let f = self.state.frames.last().unwrap();
                    proto = f.proto.clone();
                    pc = f.pc;
                    base = f.base;
                }

                // ── Modules ────────────────────────────────────────────────
                Op::Import => {
                    let path = match self.heap.as_str(proto.consts[instr.bx() as usize]) {
                        Some(s) => s.to_string(),
                        None => return Err(VmError::Internal("IMPORT path constant is not a string".into())),
                    };
                    if let Some(&m) = self.modules.get(&path) {
                        self.state.regs[base + a] = Value::obj(m);
                    } else if modules::is_builtin(&path) {
                        let v = self.make_builtin_module(&path);
                        self.state.regs[base + a] = v;
                    } else {
                        let resolved = match modules::resolve(
                            &path,
                            self.current_file.as_deref(),
                            &self.module_paths,
                        ) {
                            Some(p) => p,
                            None => vm_try!(self, proto, pc, base, Err(VmError::Import(format!("cannot resolve module '{}'", path)))),
                        };
                        let mut loader = match self.loader.take() {
                            Some(l) => l,
                            None => vm_try!(self, proto, pc, base, Err(VmError::Import(format!("no module loader installed for '{}'", path)))),
                        };
                        let res = loader(&mut self.names, &mut self.heap, &resolved);
                        self.loader = Some(loader);
                        let mproto = match res {
                            Ok(p) => p,
                            Err(e) => vm_try!(self, proto, pc, base, Err(VmError::Import(e))),
                        };
                        self.sync_globals();
                        let stem = resolved
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.clone());
                        let midx = self.heap.alloc(Obj::Module(ModuleObj {
                            name: stem,
                            path: resolved.to_string_lossy().into_owned(),
                            exports: HashMap::new(),
                            loaded: false,
                        }));
                        // publish before executing so circular imports resolve
                        self.modules.insert(path.clone(), midx);
                        self.state.regs[base + a] = Value::obj(midx);
                        if let Some(f) = self.state.frames.last_mut() {
                            f.pc = pc;
                        }
                        let prev_file = self.current_file.replace(resolved);
                        let module_mark = Some((midx, prev_file));
                        vm_try!(
                            self,
                            proto,
                            pc,
                            base,
                            self.push_frame(mproto, None, 0, 0, base + a, false, None, module_mark)
                        );
                        self.module_stack.push(midx);
                        let f = self.state.frames.last().unwrap();
                        proto = f.proto.clone();
                        pc = f.pc;
                        base = f.base;
                    }
                }
                Op::Export => {
                    let name = vm_try!(self, proto, pc, base, self.const_str(&proto, instr.a() as u16));
                    let v = self.state.regs[base + instr.b() as usize];
                    if let Some(&m) = self.module_stack.last() {
                        if let Obj::Module(mo) = self.heap.get_mut(m) {
                            mo.exports.insert(name.to_string(), v);
                        }
                    }
                }

                // ── Misc ───────────────────────────────────────────────────
                Op::Print => {
                    let s = self.heap.render(self.state.regs[base + a]);
                    let mut out = self.out.lock();
                    let _ = writeln!(out, "{}", s);
                }
                Op::Nop => {}
            }
        }
    }

    // ── Error unwinding ──────────────────────────────────────────────────────

    /// Unwind a runtime error to the nearest try frame, restoring code,
    /// constants, pc, and the register window. Non-catchable errors (and
    /// catchable ones with no handler) propagate out of the dispatch loop.
    fn handle_error(
        &mut self,
        err: VmError,
        proto: &mut Rc<Proto>,
        pc: &mut usize,
        base: &mut usize,
    ) -> Result<(), VmError> {
        let val = match &err {
            VmError::Thrown(v) => *v,
            e if e.catchable() => {
                let s = e.to_string();
                self.heap.str_value(&s)
            }
            _ => return Err(err),
        };
        let tf = match self.state.tries.pop() {
            Some(tf) => tf,
            None => return Err(VmError::Uncaught(self.heap.render(val))),
        };
        self.last_error = val;
        self.state.frames.truncate(tf.frame_depth);
        let keep = tf.frame_depth;
        self.state.iters.retain(|(d, _), _| *d <= keep);
        let top = match self.state.frames.last() {
            Some(f) => f,
            None => return Err(VmError::Internal("try frame with no live frame".into())),
        };
        *base = top.base;
        self.state.reg_top = top.top;
        *proto = tf.proto.clone();
        *pc = tf.catch_pc;
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn push_frame(
        &mut self,
        proto: Rc<Proto>,
        closure: Option<u32>,
        arg_src: usize,
        argc: usize,
        ret_reg: usize,
        want: bool,
        receiver: Option<Value>,
        module: Option<(u32, Option<PathBuf>)>,
    ) -> Result<(), VmError> {
        if self.state.frames.len() >= FRAMES_MAX {
            return Err(VmError::StackOverflow);
        }
        let new_base = self.state.frames.last().map(|f| f.top).unwrap_or(0);
        let nregs = proto.nregs as usize;
        let arity = proto.arity as usize;
        self.ensure_regs(new_base + nregs.max(arity) + 1);
        let shift = usize::from(receiver.is_some());
        if let Some(r) = receiver {
            self.state.regs[new_base] = r;
        }
        let ncopy = argc.min(arity.saturating_sub(shift));
        for i in 0..ncopy {
            self.state.regs[new_base + shift + i] = self.state.regs[arg_src + 1 + i];
        }
        // missing parameters are nil-initialized; extra arguments are dropped
        for i in (shift + ncopy)..arity {
            self.state.regs[new_base + i] = Value::nil();
        }
        let top = new_base + nregs;
        self.state.frames.push(Frame {
            proto,
            closure,
            pc: 0,
            base: new_base,
            top,
            ret_reg,
            want_result: want,
            module,
        });
        self.state.reg_top = top;
        Ok(())
    }

    fn call_value(
        &mut self,
        callee: Value,
        abs_a: usize,
        argc: usize,
        want: bool,
    ) -> Result<CallFlow, VmError> {
        let kind = match self.heap.obj(callee) {
            Some(Obj::Closure(c)) => {
                let cl_proto = c.proto.clone();
                let cl_idx = callee.as_obj();
                // function-level specialization: well-known recursive shapes
                // get a native fast path after enough calls
                let calls = cl_proto.calls.get().saturating_add(1);
                cl_proto.calls.set(calls);
                if calls == jit::NATIVE_CALL_THRESHOLD && cl_proto.native.get().is_none() {
                    if let Some(shape) = jit::detect_native_shape(&cl_proto, callee, &self.globals) {
                        cl_proto.native.set(Some(shape));
                    }
                }
                if let Some(shape) = cl_proto.native.get() {
                    if argc == 1 {
                        let arg = self.state.regs[abs_a + 1];
                        if arg.is_int() {
                            if let Some(v) = jit::run_native_shape(shape, arg.as_int()) {
                                if want {
                                    self.state.regs[abs_a] = v;
                                }
                                return Ok(CallFlow::Done);
                            }
                        }
                    }
                }
                self.push_frame(cl_proto, Some(cl_idx), abs_a, argc, abs_a, want, None, None)?;
                return Ok(CallFlow::Pushed);
            }
            Some(Obj::Bound { receiver, method }) => Some((*receiver, *method)),
            Some(Obj::Native(n)) => {
                let func = n.func;
                let result = self.call_native(func, abs_a, argc, None)?;
                if want {
                    self.state.regs[abs_a] = result;
                }
                return Ok(CallFlow::Done);
            }
            Some(Obj::Class(_)) => None,
            _ => {
                return Err(VmError::NotCallable(self.heap.type_name(callee)));
            }
        };

        if let Some((receiver, method)) = kind {
            return match self.heap.obj(method) {
                Some(Obj::Closure(c)) => {
                    let cl_proto = c.proto.clone();
                    let cl_idx = method.as_obj();
                    self.push_frame(cl_proto, Some(cl_idx), abs_a, argc, abs_a, want, Some(receiver), None)?;
                    Ok(CallFlow::Pushed)
                }
                Some(Obj::Native(n)) => {
                    let func = n.func;
                    let result = self.call_native(func, abs_a, argc, Some(receiver))?;
                    if want {
                        self.state.regs[abs_a] = result;
                    }
                    Ok(CallFlow::Done)
                }
                _ => Err(VmError::NotCallable(self.heap.type_name(method))),
            };
        }

        // class call: instantiate and run init when present
        let cls_idx = callee.as_obj();
        let fields = self.heap.collect_props(cls_idx);
        let inst_idx = self.heap.alloc(Obj::Instance(InstanceObj { class: cls_idx, fields }));
        let inst = Value::obj(inst_idx);
        self.state.regs[abs_a] = inst;
        if let Some(init) = self.heap.find_method(cls_idx, "init") {
            if let Some(Obj::Closure(c)) = self.heap.obj(init) {
                let cl_proto = c.proto.clone();
                let cl_idx = init.as_obj();
                self.push_frame(cl_proto, Some(cl_idx), abs_a, argc, abs_a, false, Some(inst), None)?;
                return Ok(CallFlow::Pushed);
            }
        }
        Ok(CallFlow::Done)
    }

    /// Invoke a native with a pre-sized argument buffer (16 slots, no heap
    /// allocation for typical calls).
    fn call_native(
        &mut self,
        func: crate::heap::NativeFn,
        abs_a: usize,
        argc: usize,
        receiver: Option<Value>,
    ) -> Result<Value, VmError> {
        let shift = usize::from(receiver.is_some());
        let total = argc + shift;
        if total <= 16 {
            let mut buf = [Value::nil(); 16];
            if let Some(r) = receiver {
                buf[0] = r;
            }
            for i in 0..argc {
                buf[shift + i] = self.state.regs[abs_a + 1 + i];
            }
            func(&mut self.heap, &buf[..total])
        } else {
            let mut args = Vec::with_capacity(total);
            if let Some(r) = receiver {
                args.push(r);
            }
            args.extend_from_slice(&self.state.regs[abs_a + 1..abs_a + 1 + argc]);
            func(&mut self.heap, &args)
        }
    }

    /// TAILCALL: reuse the current frame for closures; natives degenerate
    /// into an ordinary call followed by an immediate return (Some(result)).
    fn tail_call(
        &mut self,
        callee: Value,
        base: usize,
        abs_a: usize,
        argc: usize,
    ) -> Result<Option<Value>, VmError> {
        match self.heap.obj(callee) {
            Some(Obj::Closure(c)) => {
                let cl_proto = c.proto.clone();
                let cl_idx = callee.as_obj();
                let arity = cl_proto.arity as usize;
                let ncopy = argc.min(arity);
                for i in 0..ncopy {
                    self.state.regs[base + i] = self.state.regs[abs_a + 1 + i];
                }
                for i in ncopy..arity {
                    self.state.regs[base + i] = Value::nil();
                }
                let top = base + cl_proto.nregs as usize;
                self.ensure_regs(top + 1);
                let f = self
                    .state
                    .frames
                    .last_mut()
                    .ok_or_else(|| VmError::Internal("TAILCALL with no frame".into()))?;
                f.proto = cl_proto;
                f.closure = Some(cl_idx);
                f.pc = 0;
                f.top = top;
                self.state.reg_top = top;
                Ok(None)
            }
            Some(Obj::Native(n)) => {
                let func = n.func;
                let result = self.call_native(func, abs_a, argc, None)?;
                Ok(Some(result))
            }
            _ => Err(VmError::NotCallable(self.heap.type_name(callee))),
        }
    }

    fn do_return(&mut self, val: Value) -> Result<ReturnFlow, VmError> {
        let popped = self
            .state
            .frames
            .pop()
            .ok_or_else(|| VmError::Internal("RETURN with no frame".into()))?;
        let depth = self.state.frames.len();
        self.state.iters.retain(|(d, _), _| *d <= depth);
        if let Some((midx, prev_file)) = popped.module {
            if let Obj::Module(m) = self.heap.get_mut(midx) {
                m.loaded = true;
            }
            self.module_stack.pop();
            self.current_file = prev_file;
        }
        if self.state.frames.is_empty() {
            if let Some(entry) = self.resume_chain.pop() {
                // fiber ran to completion
                if let Obj::Fiber(f) = self.heap.get_mut(entry.fiber) {
                    f.state = FiberState::Dead;
                    f.ctx = None;
                }
                self.state = entry.saved;
                if entry.want {
                    self.state.regs[entry.ret_reg] = val;
                }
                return Ok(ReturnFlow::Continue);
            }
            return Ok(ReturnFlow::Exit(val));
        }
        let top = self.state.frames.last().unwrap();
        self.state.reg_top = top.top;
        if popped.want_result {
            self.state.regs[popped.ret_reg] = val;
        }
        Ok(ReturnFlow::Continue)
    }

    // ── Member access ────────────────────────────────────────────────────────

    fn const_str(&self, proto: &Proto, idx: u16) -> Result<Rc<str>, VmError> {
        self.heap
            .as_str(proto.consts[idx as usize])
            .ok_or_else(|| VmError::Internal("name constant is not a string".into()))
    }

    /// Member lookup shared by GETPROP and GETMETHOD. `methods_first`
    /// controls the instance search order.
    fn get_member(&mut self, obj: Value, name: &str, methods_first: bool) -> Result<Value, VmError> {
        let looked: Result<Value, Option<u32>> = match self.heap.obj(obj) {
            Some(Obj::Instance(inst)) => {
                if methods_first {
                    Err(Some(inst.class))
                } else {
                    match inst.fields.get(name) {
                        Some(&v) => Ok(v),
                        None => Err(Some(inst.class)),
                    }
                }
            }
            Some(Obj::Module(m)) => Ok(m.exports.get(name).copied().unwrap_or(Value::nil())),
            Some(Obj::Map(m)) => Ok(m.get(name).copied().unwrap_or(Value::nil())),
            Some(Obj::Class(c)) => Ok(c
                .props
                .get(name)
                .copied()
                .or_else(|| c.methods.get(name).copied())
                .unwrap_or(Value::nil())),
            _ => Err(None),
        };
        match looked {
            Ok(v) => Ok(v),
            Err(Some(cls)) => {
                if let Some(m) = self.heap.find_method(cls, name) {
                    let b = self.heap.alloc(Obj::Bound { receiver: obj, method: m });
                    return Ok(Value::obj(b));
                }
                if methods_first {
                    // fall back to fields for GETMETHOD on an instance
                    if let Some(Obj::Instance(inst)) = self.heap.obj(obj) {
                        if let Some(&v) = inst.fields.get(name) {
                            return Ok(v);
                        }
                    }
                }
                Ok(Value::nil())
            }
            Err(None) => Err(VmError::Type(format!(
                "cannot read property '{}' of a {} value",
                name,
                self.heap.type_name(obj)
            ))),
        }
    }

    /// Unbound member lookup used by SELF: the receiver is passed in a
    /// register, so instance methods are not wrapped.
    fn raw_member(&mut self, obj: Value, name: &str) -> Result<Value, VmError> {
        match self.heap.obj(obj) {
            Some(Obj::Instance(inst)) => {
                let cls = inst.class;
                if let Some(&v) = inst.fields.get(name) {
                    return Ok(v);
                }
                Ok(self.heap.find_method(cls, name).unwrap_or(Value::nil()))
            }
            Some(Obj::Module(m)) => Ok(m.exports.get(name).copied().unwrap_or(Value::nil())),
            Some(Obj::Map(m)) => Ok(m.get(name).copied().unwrap_or(Value::nil())),
            Some(Obj::Class(c)) => Ok(c.methods.get(name).copied().unwrap_or(Value::nil())),
            _ => Err(VmError::Type(format!(
                "cannot read member '{}' of a {} value",
                name,
                self.heap.type_name(obj)
            ))),
        }
    }

    fn set_member(&mut self, obj: Value, name: &str, val: Value) -> Result<(), VmError> {
        if !obj.is_obj() {
            return Err(VmError::Type(format!(
                "cannot set property '{}' on a {} value",
                name,
                self.heap.type_name(obj)
            )));
        }
        match self.heap.get_mut(obj.as_obj()) {
            Obj::Instance(inst) => {
                inst.fields.insert(name.to_string(), val);
                Ok(())
            }
            Obj::Map(m) => {
                m.insert(name.to_string(), val);
                Ok(())
            }
            Obj::Class(c) => {
                c.props.insert(name.to_string(), val);
                Ok(())
            }
            Obj::Module(m) => {
                m.exports.insert(name.to_string(), val);
                Ok(())
            }
            _ => Err(VmError::Type(format!("cannot set property '{}'", name))),
        }
    }

    fn super_method(&mut self, recv: Value, name: &str) -> Result<Value, VmError> {
        let parent = match self.heap.obj(recv) {
            Some(Obj::Instance(inst)) => match self.heap.get(inst.class) {
                Obj::Class(c) => c.parent,
                _ => None,
            },
            _ => {
                return Err(VmError::Type("super expects an instance receiver".into()));
            }
        };
        let parent = parent.ok_or_else(|| VmError::Type("class has no parent".into()))?;
        match self.heap.find_method(parent, name) {
            Some(m) => {
                let b = self.heap.alloc(Obj::Bound { receiver: recv, method: m });
                Ok(Value::obj(b))
            }
            None => Ok(Value::nil()),
        }
    }

    fn str_arg(&self, base: usize, reg: u8, what: &str) -> Result<Rc<str>, VmError> {
        let v = self.state.regs[base + reg as usize];
        self.heap.as_str(v).ok_or_else(|| {
            VmError::Type(format!("{} expects a string, got {}", what, self.heap.type_name(v)))
        })
    }

    // ── Modules ──────────────────────────────────────────────────────────────

    fn make_builtin_module(&mut self, name: &str) -> Value {
        let mut exports = HashMap::new();
        if let Some(list) = modules::builtin_exports(name) {
            for &e in list {
                if let Some(id) = self.names.get(e) {
                    let v = self.globals.get(id as usize).copied().unwrap_or(Value::nil());
                    exports.insert(e.to_string(), v);
                }
            }
        }
        for (k, v) in modules::builtin_consts(name) {
            exports.insert(k.to_string(), v);
        }
        let idx = self.heap.alloc(Obj::Module(ModuleObj {
            name: name.to_string(),
            path: name.to_string(),
            exports,
            loaded: true,
        }));
        self.modules.insert(name.to_string(), idx);
        Value::obj(idx)
    }

    // ── Hot loops ────────────────────────────────────────────────────────────

    /// Execute the native template behind a JMP_HOT. Returns true when the
    /// loop ran to completion (fall through to the exit); false means the
    /// jump must be taken normally (guard failure → deopt, or a mid-loop
    /// bail at an iteration boundary).
    fn run_hot_loop(
        &mut self,
        loop_id: usize,
        base: usize,
        proto: &Rc<Proto>,
        jmp_pc: usize,
        sbx: i16,
    ) -> bool {
        let Some(an) = self.jit.analysis(loop_id) else {
            self.jit.deopt(loop_id, proto, jmp_pc, sbx);
            return false;
        };
        let counter_abs = base + an.counter as usize;
        let cv = self.state.regs[counter_abs];
        if !cv.is_int() {
            self.jit.deopt(loop_id, proto, jmp_pc, sbx);
            return false;
        }
        let limit = match an.limit {
            jit::LimitSrc::Const(k) => k,
            jit::LimitSrc::Reg(r) => {
                let v = self.state.regs[base + r as usize];
                if !v.is_int() {
                    self.jit.deopt(loop_id, proto, jmp_pc, sbx);
                    return false;
                }
                v.as_int()
            }
        };
        let acc0 = match an.acc {
            None => None,
            Some(jit::AccSite::Reg(r)) => {
                let v = self.state.regs[base + r as usize];
                if !v.is_int() {
                    self.jit.deopt(loop_id, proto, jmp_pc, sbx);
                    return false;
                }
                Some(v.as_int())
            }
            Some(jit::AccSite::Global(g)) => {
                let v = self.globals.get(g as usize).copied().unwrap_or(Value::nil());
                if !v.is_int() {
                    self.jit.deopt(loop_id, proto, jmp_pc, sbx);
                    return false;
                }
                Some(v.as_int())
            }
        };

        let mut cnt = cv.as_int();
        let mut acc = acc0;
        let finished = jit::run_template(&an, &mut cnt, &mut acc, limit);

        self.state.regs[counter_abs] = Value::int_or_float(cnt);
        if let Some(av) = acc {
            match an.acc {
                Some(jit::AccSite::Reg(r)) => {
                    self.state.regs[base + r as usize] = Value::int_or_float(av);
                }
                Some(jit::AccSite::Global(g)) => {
                    let gi = g as usize;
                    if gi >= self.globals.len() {
                        self.globals.resize(gi + 1, Value::nil());
                    }
                    self.globals[gi] = Value::int_or_float(av);
                }
                None => {}
            }
        }
        finished
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

// ---------------------------------------------------------------------------
// Arithmetic helpers — inline-able, branch-predictable
// ---------------------------------------------------------------------------

#[inline(always)]
pub fn arith_add(heap: &mut Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if Value::both_int(l, r) {
        return Ok(Value::int_or_float(l.as_int() + r.as_int()));
    }
    if l.is_number() && r.is_number() {
        return Ok(Value::number(l.as_number() + r.as_number()));
    }
    if heap.is_str(l) || heap.is_str(r) {
        let s = format!("{}{}", heap.render(l), heap.render(r));
        return Ok(heap.str_value(&s));
    }
    Err(VmError::Type(format!(
        "cannot add {} and {}",
        heap.type_name(l),
        heap.type_name(r)
    )))
}

#[inline(always)]
pub fn arith_sub(heap: &Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if Value::both_int(l, r) {
        return Ok(Value::int_or_float(l.as_int() - r.as_int()));
    }
    if l.is_number() && r.is_number() {
        return Ok(Value::number(l.as_number() - r.as_number()));
    }
    Err(VmError::Type(format!(
        "cannot subtract {} from {}",
        heap.type_name(r),
        heap.type_name(l)
    )))
}

#[inline(always)]
pub fn arith_mul(heap: &Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if Value::both_int(l, r) {
        return Ok(match l.as_int().checked_mul(r.as_int()) {
            Some(p) => Value::int_or_float(p),
            None => Value::number(l.as_int() as f64 * r.as_int() as f64),
        });
    }
    if l.is_number() && r.is_number() {
        return Ok(Value::number(l.as_number() * r.as_number()));
    }
    Err(VmError::Type(format!(
        "cannot multiply {} and {}",
        heap.type_name(l),
        heap.type_name(r)
    )))
}

/// DIV always produces a number; division by zero is catchable.
#[inline(always)]
pub fn arith_div(heap: &Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if l.is_number() && r.is_number() {
        let d = r.as_number();
        if d == 0.0 {
            return Err(VmError::DivisionByZero);
        }
        return Ok(Value::number(l.as_number() / d));
    }
    Err(VmError::Type(format!(
        "cannot divide {} by {}",
        heap.type_name(l),
        heap.type_name(r)
    )))
}

#[inline(always)]
pub fn arith_mod(heap: &Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if Value::both_int(l, r) {
        let d = r.as_int();
        if d == 0 {
            return Err(VmError::ModuloByZero);
        }
        return Ok(Value::int(l.as_int() % d));
    }
    if l.is_number() && r.is_number() {
        let d = r.as_number();
        if d == 0.0 {
            return Err(VmError::ModuloByZero);
        }
        return Ok(Value::number(l.as_number() % d));
    }
    Err(VmError::Type(format!(
        "cannot take {} modulo {}",
        heap.type_name(l),
        heap.type_name(r)
    )))
}

#[inline(always)]
pub fn arith_pow(heap: &Heap, l: Value, r: Value) -> Result<Value, VmError> {
    if l.is_number() && r.is_number() {
        return Ok(Value::number(l.as_number().powf(r.as_number())));
    }
    Err(VmError::Type(format!(
        "cannot raise {} to {}",
        heap.type_name(l),
        heap.type_name(r)
    )))
}

#[inline(always)]
fn bump(heap: &Heap, v: Value, delta: i64) -> Result<Value, VmError> {
    if v.is_int() {
        return Ok(Value::int_or_float(v.as_int() + delta));
    }
    if v.is_float() {
        return Ok(Value::number(v.as_f64() + delta as f64));
    }
    Err(VmError::Type(format!(
        "cannot increment a {} value",
        heap.type_name(v)
    )))
}
