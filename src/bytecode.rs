/// Bytecode Instruction Set — Register-Based, 32-bit Fixed-Width
///
/// INSTRUCTION FORMATS (Lua 5.x inspired):
///
///   iABC:  |  C: 8  |  B: 8  |  A: 8  | OP: 8  |  — 3 register operands
///   iABx:  |     Bx: 16      |  A: 8  | OP: 8  |  — 1 reg + 16-bit unsigned
///   iAsBx: |    sBx: 16      |  A: 8  | OP: 8  |  — 1 reg + 16-bit signed
///
/// Registers are frame-relative (0..255). Constants index the prototype's
/// pool. Jumps are PC-relative: effective target = pc_after_fetch + sBx.
/// sBx is stored with a +32768 bias; the sC immediates (ADDI/SUBI and the
/// *JK compare family) are the C byte reinterpreted as i8.
///
/// FUSED OPCODES (compiler peephole, mined from hot patterns):
///   INCR/DECR            — local counter bump
///   INCRG/DECRG/ADDG/SUBG — global-accumulator update
///   EQJ..LEJ, EQJK..GEJK — compare-and-branch (loop exits, if-false arms)
///   ADDI/SUBI, ADDK..DIVK — immediate / constant right operand
///
/// QUICKENED OPCODES (rewritten in place by the VM on type observation):
///   GETTABLE → GETARRAY_I, SETTABLE → SETARRAY_I,
///   LEN → ARRLEN / STRLEN, CONCAT → STRCAT
/// A failed guard rewrites the generic form back (deopt).

use std::cell::Cell;
use std::collections::HashSet;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum Op {
    // ── Loads / moves ────────────────────────────────────────────────────────
    Move = 0,    // A B      → R[A] = R[B]
    LoadK,       // A Bx     → R[A] = K[Bx]
    LoadBool,    // A B C    → R[A] = bool(B); if C != 0 skip next
    LoadNil,     // A B      → R[A..=A+B] = nil
    // ── Globals ──────────────────────────────────────────────────────────────
    GetGlobal,   // A Bx     → R[A] = G[Bx]
    SetGlobal,   // A Bx     → G[Bx] = R[A]
    // ── Arithmetic ───────────────────────────────────────────────────────────
    Add,         // A B C    → R[A] = R[B] + R[C]   (string operand → concat)
    Sub,
    Mul,
    Div,         // always produces a number; /0 raises
    Mod,
    Pow,
    Unm,         // A B      → R[A] = -R[B]
    AddK,        // A B C    → R[A] = R[B] + K[C]
    SubK,
    MulK,
    DivK,
    AddI,        // A B sC   → R[A] = R[B] + sC  (signed 8-bit immediate)
    SubI,
    // ── Fused local/global updates ───────────────────────────────────────────
    Incr,        // A        → R[A] += 1
    Decr,        // A        → R[A] -= 1
    IncrG,       // Bx       → G[Bx] += 1
    DecrG,       // Bx       → G[Bx] -= 1
    AddG,        // A Bx     → G[Bx] = G[Bx] + R[A]
    SubG,        // A Bx     → G[Bx] = G[Bx] - R[A]
    // ── Comparison (store boolean) ───────────────────────────────────────────
    Eq,          // A B C    → R[A] = R[B] == R[C]
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    // ── Compare-and-branch (jump when the comparison holds) ──────────────────
    EqJ,         // A B sC   → if R[A] == R[B]: pc += sC
    NeJ,
    LtJ,
    LeJ,
    EqJk,        // A B sC   → if R[A] == K[B]: pc += sC
    NeJk,
    LtJk,
    LeJk,
    GtJk,
    GeJk,
    // ── Logic ────────────────────────────────────────────────────────────────
    Not,         // A B      → R[A] = !truthy(R[B])
    And,         // A B C    → R[A] = truthy(R[B]) ? R[C] : R[B]
    Or,          // A B C    → R[A] = truthy(R[B]) ? R[B] : R[C]
    Test,        // A C      → if truthy(R[A]) != (C != 0) skip next
    TestSet,     // A B C    → if truthy(R[B]) == (C != 0) R[A] = R[B] else skip next
    // ── Control flow ─────────────────────────────────────────────────────────
    Jmp,         // sBx      → pc += sBx  (backward jumps are JIT-profiled)
    JmpHot,      // A sBx    → specialized back-jump; A = loop id
    ForPrep,     // A sBx    → R[A] -= R[A+2]; pc += sBx
    ForLoop,     // A sBx    → R[A] += R[A+2]; while in range: R[A+3] = R[A], pc += sBx
    // ── Tables / arrays ──────────────────────────────────────────────────────
    NewArray,    // A B      → R[A] = array with capacity B
    NewTable,    // A        → R[A] = {}
    GetTable,    // A B C    → R[A] = R[B][R[C]]
    SetTable,    // A B C    → R[A][R[B]] = R[C]
    GetTableK,   // A B C    → R[A] = R[B][K[C]]
    SetTableK,   // A B C    → R[A][K[B]] = R[C]
    Append,      // A B      → R[A].push(R[B])
    ArrPop,      // A B      → R[A] = R[B].pop()
    ArrShift,    // A B      → R[A] = R[B].remove(0)
    ArrUnshift,  // A B      → R[A].insert(0, R[B])
    Len,         // A B      → R[A] = len(R[B])
    SelfPrep,    // A B C    → R[A+1] = R[B]; R[A] = member K[C] of R[B]
    ArrLen,      // A B      → quickened LEN for arrays
    GetArrayI,   // A B C    → quickened GETTABLE (array + int index)
    SetArrayI,   // A B C    → quickened SETTABLE
    // ── Strings ──────────────────────────────────────────────────────────────
    Concat,      // A B C    → R[A] = str(R[B]) + str(R[C])
    Upper,       // A B
    Lower,
    Trim,
    Contains,    // A B C    → R[A] = R[C] substring of R[B]
    StartsWith,
    EndsWith,
    IndexOf,     // A B C    → byte index or -1
    Split,       // A B C    → array of pieces of R[B] split by R[C]
    Join,        // A B C    → join array R[B] with separator R[C]
    StrCat,      // A B C    → quickened CONCAT (both strings)
    StrLen,      // A B      → quickened LEN for strings
    SubStr,      // A B C    → R[A] = R[B][R[C]..]
    // ── Maps / types ─────────────────────────────────────────────────────────
    Keys,        // A B      → R[A] = array of keys of map R[B]
    HasKey,      // A B C    → R[A] = map R[B] has key R[C]
    TypeOf,      // A B      → R[A] = type name string
    IsType,      // A B C    → R[A] = type tag of R[B] == C
    // ── Calls ────────────────────────────────────────────────────────────────
    Call,        // A B C    → callee R[A], B-1 args at R[A+1..], C-1 results
    TailCall,    // A B C    → reuse current frame
    Return,      // A B      → B >= 2 returns R[A], else nil
    // ── Closures / upvalues ──────────────────────────────────────────────────
    Closure,     // A Bx     → R[A] = closure of prototype constant K[Bx]
    GetUpval,    // A B      → R[A] = upvalue B
    SetUpval,    // A B      → upvalue B = R[A]
    // ── Iterators ────────────────────────────────────────────────────────────
    IterInit,    // A B      → iterator over R[B]; R[A] = collection, R[A+1] = 0
    IterNext,    // A sBx    → advance or jump sBx when exhausted
    // ── OOP ──────────────────────────────────────────────────────────────────
    Class,       // A Bx     → R[A] = new class named K[Bx]
    Instance,    // A B      → R[A] = instance of class R[B] (no init call)
    GetMethod,   // A B C    → R[A] = member K[C] of R[B]; instance methods bind
    SetMethod,   // A B C    → class R[A].methods[K[B]] = R[C]
    GetProp,     // A B C    → R[A] = property K[C] of R[B]
    SetProp,     // A B C    → R[A].K[B] = R[C]
    Inherit,     // A B      → class R[A] inherits class R[B]
    Super,       // A B C    → R[A] = method K[C] from parent of R[B]'s class
    // ── Exceptions ───────────────────────────────────────────────────────────
    Try,         // sBx      → push try frame; catch pc = pc_after_fetch + sBx
    EndTry,      //          → pop try frame
    Throw,       // A        → throw R[A]
    GetError,    // A        → R[A] = last caught error
    // ── Fibers ───────────────────────────────────────────────────────────────
    Fiber,       // A B      → R[A] = fiber wrapping closure R[B]
    Yield,       // A B      → suspend; B >= 2 yields R[A]; R[A] = resume arg
    Resume,      // A B C    → resume fiber R[B]; C >= 2 passes R[B+1]; R[A] = yield
    // ── Modules ──────────────────────────────────────────────────────────────
    Import,      // A Bx     → R[A] = module K[Bx]
    Export,      // A B      → current module exports K[A] = R[B]
    // ── Misc ─────────────────────────────────────────────────────────────────
    Print,       // A        → write rendering of R[A] plus newline
    Nop,
}

// ---------------------------------------------------------------------------
// Instruction encoding — 32 bits, fixed width
// ---------------------------------------------------------------------------

/// A 32-bit instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Instr(pub u32);

impl Instr {
    #[inline]
    pub fn abc(op: Op, a: u8, b: u8, c: u8) -> Self {
        Instr(u8::from(op) as u32 | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24)
    }

    #[inline]
    pub fn abx(op: Op, a: u8, bx: u16) -> Self {
        Instr(u8::from(op) as u32 | (a as u32) << 8 | (bx as u32) << 16)
    }

    /// sBx is stored biased by +32768.
    #[inline]
    pub fn asbx(op: Op, a: u8, sbx: i16) -> Self {
        let biased = (sbx as i32 + 32768) as u16;
        Instr(u8::from(op) as u32 | (a as u32) << 8 | (biased as u32) << 16)
    }

    /// A-B-sC shape: C carries a signed 8-bit immediate.
    #[inline]
    pub fn absc(op: Op, a: u8, b: u8, sc: i8) -> Self {
        Instr::abc(op, a, b, sc as u8)
    }

    #[inline]
    pub fn op(self) -> Op {
        Op::try_from((self.0 & 0xFF) as u8).unwrap_or(Op::Nop)
    }

    #[inline]
    pub fn a(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn b(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub fn c(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub fn bx(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub fn sbx(self) -> i16 {
        (((self.0 >> 16) as u16) as i32 - 32768) as i16
    }

    #[inline]
    pub fn sc(self) -> i8 {
        (self.0 >> 24) as u8 as i8
    }

    #[inline]
    pub fn with_sbx(self, sbx: i16) -> Instr {
        let biased = (sbx as i32 + 32768) as u16;
        Instr(self.0 & 0x0000_FFFF | (biased as u32) << 16)
    }
}

impl std::fmt::Debug for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<10?} A={:3} B={:3} C={:3} | Bx={:5} sBx={:6}",
            self.op(),
            self.a(),
            self.b(),
            self.c(),
            self.bx(),
            self.sbx()
        )
    }
}

// ---------------------------------------------------------------------------
// Prototype — compiled function metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalDesc {
    /// true = captured from an enclosing local, false = from an outer upvalue
    pub is_local: bool,
    pub index: u8,
}

/// Well-known function shapes eligible for native specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeShape {
    Fib,
    Fact,
}

/// A compiled function. The instruction stream is `Cell`-wrapped so the
/// JIT can rewrite single words through a shared `Rc<Proto>`; any future
/// plan for read-only code pages must gate that patching.
#[derive(Debug)]
pub struct Proto {
    pub name: String,
    pub arity: u8,
    pub code: Box<[Cell<Instr>]>,
    pub consts: Box<[Value]>,
    pub upvals: Box<[UpvalDesc]>,
    /// Register slots used by the frame (locals + temporaries).
    pub nregs: u8,
    /// Native specialization hook, set after the call-count threshold.
    pub native: Cell<Option<NativeShape>>,
    pub calls: Cell<u32>,
}

impl Proto {
    #[inline]
    pub fn fetch(&self, pc: usize) -> Instr {
        self.code[pc].get()
    }

    /// Pretty-print a disassembly listing.
    pub fn disassemble(&self, heap: &crate::heap::Heap) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "=== {} ({} regs, {} params) ===", self.name, self.nregs, self.arity);
        for (i, cell) in self.code.iter().enumerate() {
            let _ = writeln!(out, "  {:4}  {:?}", i, cell.get());
        }
        for (i, k) in self.consts.iter().enumerate() {
            let _ = writeln!(out, "  K[{:3}] = {}", i, heap.render(*k));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ProtoBuilder — mutable compile-time form of a prototype
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use crate::errors::CompileError;

pub struct ProtoBuilder {
    pub name: String,
    pub arity: u8,
    pub code: Vec<Instr>,
    pub consts: Vec<Value>,
    pub upvals: Vec<UpvalDesc>,
    pub nregs: u8,
    /// Constant dedup by raw bit pattern (ints, floats, bools, interned strings).
    const_map: HashMap<u64, u16>,
}

impl ProtoBuilder {
    pub fn new(name: impl Into<String>, arity: u8) -> Self {
        ProtoBuilder {
            name: name.into(),
            arity,
            code: Vec::new(),
            consts: Vec::new(),
            upvals: Vec::new(),
            nregs: 0,
            const_map: HashMap::new(),
        }
    }

    /// Emit an instruction, return its index.
    pub fn emit(&mut self, instr: Instr) -> usize {
        let idx = self.code.len();
        self.code.push(instr);
        idx
    }

    /// Emit a placeholder jump (returns the index to back-patch).
    pub fn emit_jump(&mut self, op: Op, a: u8) -> usize {
        self.emit(Instr::asbx(op, a, 0))
    }

    /// Patch a previously emitted jump so its target is the current end of code.
    pub fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let offset = self.code.len() as i64 - at as i64 - 1;
        if offset > i16::MAX as i64 || offset < i16::MIN as i64 {
            return Err(CompileError::JumpTooFar(self.name.clone()));
        }
        self.code[at] = self.code[at].with_sbx(offset as i16);
        Ok(())
    }

    /// Signed offset from the instruction about to be emitted back to `target`.
    pub fn jump_back_offset(&self, target: usize) -> Result<i16, CompileError> {
        let offset = target as i64 - self.code.len() as i64 - 1;
        if offset < i16::MIN as i64 {
            return Err(CompileError::JumpTooFar(self.name.clone()));
        }
        Ok(offset as i16)
    }

    /// Add a constant, deduplicating by bit pattern.
    pub fn add_const(&mut self, v: Value) -> Result<u16, CompileError> {
        if let Some(&i) = self.const_map.get(&v.raw()) {
            return Ok(i);
        }
        if self.consts.len() > u16::MAX as usize {
            return Err(CompileError::ConstantOverflow(self.name.clone()));
        }
        let i = self.consts.len() as u16;
        self.consts.push(v);
        self.const_map.insert(v.raw(), i);
        Ok(i)
    }

    pub fn finish(self) -> Proto {
        Proto {
            name: self.name,
            arity: self.arity,
            code: self.code.into_iter().map(Cell::new).collect(),
            consts: self.consts.into_boxed_slice(),
            upvals: self.upvals.into_boxed_slice(),
            nregs: self.nregs.max(1),
            native: Cell::new(None),
            calls: Cell::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Compare-and-branch fusion (peephole over a finished instruction stream)
// ---------------------------------------------------------------------------

/// Positions that some instruction can transfer control to. Fusion must not
/// disturb an instruction that is a jump target.
fn jump_targets(code: &[Instr]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for (pc, instr) in code.iter().enumerate() {
        match instr.op() {
            Op::Jmp | Op::JmpHot | Op::ForPrep | Op::ForLoop | Op::IterNext | Op::Try => {
                targets.insert((pc as i64 + 1 + instr.sbx() as i64) as usize);
            }
            Op::EqJ | Op::NeJ | Op::LtJ | Op::LeJ
            | Op::EqJk | Op::NeJk | Op::LtJk | Op::LeJk | Op::GtJk | Op::GeJk => {
                targets.insert((pc as i64 + 1 + instr.sc() as i64) as usize);
            }
            Op::Test | Op::TestSet => {
                targets.insert(pc + 2);
            }
            Op::LoadBool if instr.c() != 0 => {
                targets.insert(pc + 2);
            }
            _ => {}
        }
    }
    targets
}

/// Encode the compare-and-branch forms: A and B are registers (or a register
/// and a constant index for the *JK family), the jump offset lives in the C
/// byte as a signed 8-bit displacement.
pub fn cmp_jump(op: Op, a: u8, b: u8, off: i8) -> Instr {
    Instr::absc(op, a, b, off)
}

/// Fuse `[CMP t,b,c][TEST t,0][JMP off]` and
/// `[LOADK t2,k][CMP t,b,t2][TEST t,0][JMP off]` windows in place,
/// preserving instruction count (NOP padding) so no offsets move.
pub fn fuse_compare_jumps(code: &mut [Instr]) {
    let targets = jump_targets(code);
    let len = code.len();
    let mut i = 0;
    while i + 2 < len {
        // reg/reg window
        let c0 = code[i];
        let c1 = code[i + 1];
        let c2 = code[i + 2];
        let is_cmp = matches!(c0.op(), Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge);
        if is_cmp
            && c1.op() == Op::Test
            && c1.c() == 0
            && c1.a() == c0.a()
            && c2.op() == Op::Jmp
            && !targets.contains(&(i + 1))
            && !targets.contains(&(i + 2))
        {
            let off = c2.sbx() as i64 + 2;
            if off >= i8::MIN as i64 && off <= i8::MAX as i64 {
                let (op, ra, rb) = match c0.op() {
                    Op::Eq => (Op::NeJ, c0.b(), c0.c()),
                    Op::Neq => (Op::EqJ, c0.b(), c0.c()),
                    Op::Lt => (Op::LeJ, c0.c(), c0.b()),
                    Op::Le => (Op::LtJ, c0.c(), c0.b()),
                    Op::Gt => (Op::LeJ, c0.b(), c0.c()),
                    Op::Ge => (Op::LtJ, c0.b(), c0.c()),
                    _ => unreachable!(),
                };
                code[i] = cmp_jump(op, ra, rb, off as i8);
                code[i + 1] = Instr::abc(Op::Nop, 0, 0, 0);
                code[i + 2] = Instr::abc(Op::Nop, 0, 0, 0);
                i += 3;
                continue;
            }
        }
        // LOADK + reg/const window
        if i + 3 < len {
            let k0 = code[i];
            let k1 = code[i + 1];
            let k2 = code[i + 2];
            let k3 = code[i + 3];
            let is_cmp = matches!(k1.op(), Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge);
            if k0.op() == Op::LoadK
                && is_cmp
                && k1.c() == k0.a()
                && k1.b() != k0.a()
                && k2.op() == Op::Test
                && k2.c() == 0
                && k2.a() == k1.a()
                && k3.op() == Op::Jmp
                && k0.bx() <= u8::MAX as u16
                && !targets.contains(&(i + 1))
                && !targets.contains(&(i + 2))
                && !targets.contains(&(i + 3))
            {
                let off = k3.sbx() as i64 + 3;
                if off >= i8::MIN as i64 && off <= i8::MAX as i64 {
                    let op = match k1.op() {
                        Op::Eq => Op::NeJk,
                        Op::Neq => Op::EqJk,
                        Op::Lt => Op::GeJk,
                        Op::Le => Op::GtJk,
                        Op::Gt => Op::LeJk,
                        Op::Ge => Op::LtJk,
                        _ => unreachable!(),
                    };
                    code[i] = Instr::absc(op, k1.b(), k0.bx() as u8, off as i8);
                    code[i + 1] = Instr::abc(Op::Nop, 0, 0, 0);
                    code[i + 2] = Instr::abc(Op::Nop, 0, 0, 0);
                    code[i + 3] = Instr::abc(Op::Nop, 0, 0, 0);
                    i += 4;
                    continue;
                }
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abc_round_trip() {
        let i = Instr::abc(Op::Add, 1, 2, 3);
        assert_eq!(i.op(), Op::Add);
        assert_eq!(i.a(), 1);
        assert_eq!(i.b(), 2);
        assert_eq!(i.c(), 3);
    }

    #[test]
    fn test_sbx_bias() {
        for off in [0i16, 1, -1, 100, -100, i16::MAX, i16::MIN] {
            let i = Instr::asbx(Op::Jmp, 0, off);
            assert_eq!(i.op(), Op::Jmp);
            assert_eq!(i.sbx(), off, "offset {} must round-trip", off);
        }
    }

    #[test]
    fn test_sc_immediate() {
        for imm in [0i8, 1, -1, i8::MAX, i8::MIN] {
            let i = Instr::absc(Op::AddI, 3, 4, imm);
            assert_eq!(i.sc(), imm);
        }
    }

    #[test]
    fn test_patch_jump() {
        let mut b = ProtoBuilder::new("t", 0);
        let j = b.emit_jump(Op::Jmp, 0);
        b.emit(Instr::abc(Op::Nop, 0, 0, 0));
        b.emit(Instr::abc(Op::Nop, 0, 0, 0));
        b.patch_jump(j).unwrap();
        // target = j + 1 + sbx = 3 (the current end)
        assert_eq!(b.code[j].sbx(), 2);
    }

    #[test]
    fn test_const_dedup() {
        let mut b = ProtoBuilder::new("t", 0);
        let a = b.add_const(Value::int(42)).unwrap();
        let c = b.add_const(Value::int(42)).unwrap();
        let d = b.add_const(Value::int(43)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_fuse_lt_test_jmp() {
        // LT t, r1, r2 ; TEST t, 0 ; JMP +5  →  LEJ r2, r1, +7 ; NOP ; NOP
        let mut code = vec![
            Instr::abc(Op::Lt, 9, 1, 2),
            Instr::abc(Op::Test, 9, 0, 0),
            Instr::asbx(Op::Jmp, 0, 5),
        ];
        fuse_compare_jumps(&mut code);
        assert_eq!(code[0].op(), Op::LeJ);
        assert_eq!(code[0].a(), 2);
        assert_eq!(code[0].b(), 1);
        assert_eq!(code[0].sc(), 7);
        assert_eq!(code[1].op(), Op::Nop);
        assert_eq!(code[2].op(), Op::Nop);
    }

    #[test]
    fn test_fuse_const_compare() {
        // LOADK t2, K5 ; LT t, r1, t2 ; TEST t, 0 ; JMP +4  →  GEJK r1, 5, +7
        let mut code = vec![
            Instr::abx(Op::LoadK, 10, 5),
            Instr::abc(Op::Lt, 9, 1, 10),
            Instr::abc(Op::Test, 9, 0, 0),
            Instr::asbx(Op::Jmp, 0, 4),
        ];
        fuse_compare_jumps(&mut code);
        assert_eq!(code[0].op(), Op::GeJk);
        assert_eq!(code[0].a(), 1);
        assert_eq!(code[0].b(), 5);
        assert_eq!(code[0].sc(), 7);
        assert_eq!(code[1].op(), Op::Nop);
    }

    #[test]
    fn test_no_fuse_when_jump_target_in_window() {
        let mut code = vec![
            Instr::asbx(Op::Jmp, 0, 1), // targets index 2 (the TEST)
            Instr::abc(Op::Lt, 9, 1, 2),
            Instr::abc(Op::Test, 9, 0, 0),
            Instr::asbx(Op::Jmp, 0, 5),
        ];
        fuse_compare_jumps(&mut code);
        assert_eq!(code[1].op(), Op::Lt, "fusion must respect jump targets");
    }
}
