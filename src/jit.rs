/// Hot-Loop JIT — profile-driven bytecode specialization.
///
/// PIPELINE
///   1. Profile: every backward JMP bumps a counter keyed by
///      (code identity, jump pc).
///   2. Analyze: at the threshold, the loop window is matched against the
///      template family (count-up, sum, product, count-down).
///   3. Patch: the JMP is overwritten in place with JMP_HOT carrying a
///      fresh loop id; the analysis lands in a fixed 256-slot table.
///   4. Execute: JMP_HOT runs the template natively under type guards
///      (counter/limit/accumulator must be tagged ints).
///   5. Deoptimize: a failed guard rewrites the original JMP back and
///      clears the slot; loops that fail analysis are marked do-not-retry.
///
/// Templates run in i64 and stop at an iteration boundary if a step would
/// leave the 47-bit tagged range; the interpreter then resumes at the
/// loop head and continues with its float fallback, so observable
/// semantics match the generic path exactly.
///
/// A second tier specializes whole closures: prototypes matching the
/// classic recursive fibonacci / factorial shapes get a native fast path
/// on their CALL edge after NATIVE_CALL_THRESHOLD invocations.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bytecode::{Instr, NativeShape, Op, Proto};
use crate::value::Value;

/// Back-edge executions before a loop is analyzed.
pub const HOT_LOOP_THRESHOLD: u32 = 50;
/// Hot loops per VM lifetime; excess loops are never retried.
pub const MAX_HOT_LOOPS: usize = 256;
/// Calls before a closure is considered for shape specialization.
pub const NATIVE_CALL_THRESHOLD: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    CountUp,
    Sum,
    Product,
    CountDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSrc {
    Reg(u8),
    Const(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccSite {
    Reg(u8),
    Global(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct LoopAnalysis {
    pub kind: LoopKind,
    pub counter: u8,
    pub limit: LimitSrc,
    pub acc: Option<AccSite>,
    /// Loop continues while counter <= limit (vs strictly <) for upward
    /// loops, or counter >= limit for downward ones.
    pub inclusive: bool,
}

pub struct Jit {
    counts: HashMap<(usize, usize), u32>,
    loops: Vec<Option<LoopAnalysis>>,
    originals: Vec<i16>,
    next_id: usize,
    denied: HashSet<(usize, usize)>,
    patched: usize,
    deopts: usize,
}

impl Jit {
    pub fn new() -> Self {
        Jit {
            counts: HashMap::new(),
            loops: vec![None; MAX_HOT_LOOPS],
            originals: vec![0; MAX_HOT_LOOPS],
            next_id: 0,
            denied: HashSet::new(),
            patched: 0,
            deopts: 0,
        }
    }

    pub fn patched_count(&self) -> usize {
        self.patched
    }

    pub fn deopt_count(&self) -> usize {
        self.deopts
    }

    pub fn analysis(&self, id: usize) -> Option<LoopAnalysis> {
        self.loops.get(id).copied().flatten()
    }

    /// Record one execution of a backward JMP; at the threshold, analyze
    /// the loop and patch the jump to JMP_HOT in place. Returns true when
    /// the instruction was rewritten.
    pub fn profile_backjump(&mut self, proto: &Rc<Proto>, jmp_pc: usize, sbx: i16) -> bool {
        let key = (Rc::as_ptr(proto) as usize, jmp_pc);
        if self.denied.contains(&key) {
            return false;
        }
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count < HOT_LOOP_THRESHOLD {
            return false;
        }
        self.counts.remove(&key);
        if self.next_id >= MAX_HOT_LOOPS {
            self.denied.insert(key);
            return false;
        }
        let start = (jmp_pc as i64 + 1 + sbx as i64) as usize;
        match analyze_loop(proto, start, jmp_pc) {
            Some(an) => {
                let id = self.next_id;
                self.next_id += 1;
                self.loops[id] = Some(an);
                self.originals[id] = sbx;
                proto.code[jmp_pc].set(Instr::asbx(Op::JmpHot, id as u8, sbx));
                self.patched += 1;
                true
            }
            None => {
                self.denied.insert(key);
                false
            }
        }
    }

    /// Revert JMP_HOT to the original JMP and clear the slot.
    pub fn deopt(&mut self, id: usize, proto: &Rc<Proto>, jmp_pc: usize, sbx: i16) {
        let original = self.originals.get(id).copied().unwrap_or(sbx);
        proto.code[jmp_pc].set(Instr::asbx(Op::Jmp, 0, original));
        if let Some(slot) = self.loops.get_mut(id) {
            *slot = None;
        }
        self.patched = self.patched.saturating_sub(1);
        self.deopts += 1;
    }
}

impl Default for Jit {
    fn default() -> Self {
        Jit::new()
    }
}

// ---------------------------------------------------------------------------
// Loop-shape analysis
// ---------------------------------------------------------------------------

/// Match the loop window [start, end) against the template family. The
/// window starts with a fused compare-and-branch (the loop condition) and
/// ends just before the backward jump; NOPs from fusion are skipped.
fn analyze_loop(proto: &Proto, start: usize, end: usize) -> Option<LoopAnalysis> {
    if start >= end || end > proto.code.len() {
        return None;
    }
    let window: Vec<Instr> = (start..end)
        .map(|i| proto.code[i].get())
        .filter(|ins| ins.op() != Op::Nop)
        .collect();
    if window.len() < 2 || window.len() > 3 {
        return None;
    }

    // Condition: the exit branch at the loop head.
    let cond = window[0];
    let (counter, limit, inclusive, down) = match cond.op() {
        // `cnt < lim` fuses to LEJ lim, cnt (exit when lim <= cnt)
        Op::LeJ => (cond.b(), LimitSrc::Reg(cond.a()), false, false),
        // `cnt <= lim` fuses to LTJ lim, cnt
        Op::LtJ => (cond.b(), LimitSrc::Reg(cond.a()), true, false),
        // `cnt < K` fuses to GEJK cnt, K
        Op::GeJk => (cond.a(), const_int(proto, cond.b())?, false, false),
        // `cnt <= K` fuses to GTJK cnt, K
        Op::GtJk => (cond.a(), const_int(proto, cond.b())?, true, false),
        // `cnt > K` fuses to LEJK cnt, K — downward loop
        Op::LeJk => (cond.a(), const_int(proto, cond.b())?, false, true),
        // `cnt >= K` fuses to LTJK cnt, K
        Op::LtJk => (cond.a(), const_int(proto, cond.b())?, true, true),
        _ => return None,
    };

    // Body: bare counter update, or accumulator + counter update.
    let step_of = |ins: Instr, cnt: u8| -> Option<bool> {
        // returns Some(is_decrement)
        match ins.op() {
            Op::Incr if ins.a() == cnt => Some(false),
            Op::Decr if ins.a() == cnt => Some(true),
            Op::AddI if ins.a() == cnt && ins.b() == cnt && ins.sc() == 1 => Some(false),
            Op::SubI if ins.a() == cnt && ins.b() == cnt && ins.sc() == 1 => Some(true),
            _ => None,
        }
    };

    if window.len() == 2 {
        let dec = step_of(window[1], counter)?;
        if dec != down {
            return None;
        }
        let kind = if dec { LoopKind::CountDown } else { LoopKind::CountUp };
        return Some(LoopAnalysis { kind, counter, limit, acc: None, inclusive });
    }

    // Three-instruction body: accumulator op then counter bump.
    let accum = window[1];
    let dec = step_of(window[2], counter)?;
    if dec || down {
        // downward accumulations are left to the interpreter
        return None;
    }
    let (kind, acc) = match accum.op() {
        Op::Add
            if accum.a() == accum.b() && accum.c() == counter && accum.a() != counter =>
        {
            (LoopKind::Sum, AccSite::Reg(accum.a()))
        }
        Op::AddG if accum.a() == counter => (LoopKind::Sum, AccSite::Global(accum.bx())),
        Op::Mul
            if accum.a() == accum.b() && accum.c() == counter && accum.a() != counter =>
        {
            (LoopKind::Product, AccSite::Reg(accum.a()))
        }
        _ => return None,
    };
    // the limit register must not alias the accumulator or counter
    if let (LimitSrc::Reg(lr), AccSite::Reg(ar)) = (limit, acc) {
        if lr == ar || lr == counter {
            return None;
        }
    }
    Some(LoopAnalysis { kind, counter, limit, acc: Some(acc), inclusive })
}

fn const_int(proto: &Proto, idx: u8) -> Option<LimitSrc> {
    let v = *proto.consts.get(idx as usize)?;
    if v.is_int() {
        Some(LimitSrc::Const(v.as_int()))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Template execution
// ---------------------------------------------------------------------------

/// Run a matched loop natively. `cnt` and `acc` are updated in place;
/// returns true when the loop ran to completion (the caller falls through
/// to the exit), false when it bailed at an iteration boundary (the
/// caller re-enters the interpreter at the loop head).
pub fn run_template(an: &LoopAnalysis, cnt: &mut i64, acc: &mut Option<i64>, limit: i64) -> bool {
    let fits = Value::fits_int;
    match an.kind {
        LoopKind::CountUp => {
            let last = if an.inclusive { limit } else { limit - 1 };
            if *cnt <= last {
                *cnt = last + 1;
            }
            true
        }
        LoopKind::CountDown => {
            let last = if an.inclusive { limit } else { limit + 1 };
            if *cnt >= last {
                *cnt = last - 1;
            }
            true
        }
        LoopKind::Sum => {
            let mut a = match *acc {
                Some(a) => a,
                None => return false,
            };
            loop {
                let go = if an.inclusive { *cnt <= limit } else { *cnt < limit };
                if !go {
                    *acc = Some(a);
                    return true;
                }
                let next = a.checked_add(*cnt);
                match next {
                    Some(n) if fits(n) => {
                        a = n;
                        *cnt += 1;
                    }
                    _ => {
                        // 47-bit overflow: hand the iteration back to the
                        // interpreter, which continues in floats
                        *acc = Some(a);
                        return false;
                    }
                }
            }
        }
        LoopKind::Product => {
            let mut a = match *acc {
                Some(a) => a,
                None => return false,
            };
            loop {
                let go = if an.inclusive { *cnt <= limit } else { *cnt < limit };
                if !go {
                    *acc = Some(a);
                    return true;
                }
                match a.checked_mul(*cnt) {
                    Some(n) if fits(n) => {
                        a = n;
                        *cnt += 1;
                    }
                    _ => {
                        *acc = Some(a);
                        return false;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Function-level specialization
// ---------------------------------------------------------------------------

/// Recognize the classic recursive shapes. Conservative on purpose: the
/// prototype must take one parameter, recurse through its own global slot
/// with n-1/n-2 (fib) or n-1 (fact) arguments, and carry the canonical
/// `n <= 1` base case, verified down to the base block's instructions.
pub fn detect_native_shape(proto: &Proto, self_val: Value, globals: &[Value]) -> Option<NativeShape> {
    if proto.arity != 1 {
        return None;
    }
    let code: Vec<Instr> = proto.code.iter().map(|c| c.get()).collect();
    let mut self_calls = 0usize;
    let mut has_add = false;
    let mut has_mul = false;
    let mut sub1 = false;
    let mut sub2 = false;
    let mut base_guard = None;
    for (i, ins) in code.iter().enumerate() {
        match ins.op() {
            Op::GetGlobal => {
                let g = ins.bx() as usize;
                if globals.get(g).map(|v| v.raw()) == Some(self_val.raw()) {
                    self_calls += 1;
                }
            }
            Op::Add => has_add = true,
            Op::Mul | Op::MulK => has_mul = true,
            Op::SubI if ins.sc() == 1 => sub1 = true,
            Op::SubI if ins.sc() == 2 => sub2 = true,
            Op::GtJk => {
                if let Some(k) = proto.consts.get(ins.b() as usize) {
                    if k.is_int() && k.as_int() == 1 {
                        base_guard = Some(i);
                    }
                }
            }
            _ => {}
        }
    }
    let base_at = base_guard?;
    // the base block follows the guard (skipping fusion NOPs)
    let mut j = base_at + 1;
    while j < code.len() && code[j].op() == Op::Nop {
        j += 1;
    }
    if self_calls == 2 && has_add && sub1 && sub2 {
        // fib base: `return n` — RETURN of parameter register 0
        if j < code.len() && code[j].op() == Op::Return && code[j].a() == 0 && code[j].b() >= 2 {
            return Some(NativeShape::Fib);
        }
        return None;
    }
    if self_calls == 1 && has_mul && sub1 {
        // fact base: `return 1` — LOADK of the int 1 then RETURN
        if j + 1 < code.len() && code[j].op() == Op::LoadK && code[j + 1].op() == Op::Return {
            let k = proto.consts.get(code[j].bx() as usize);
            if k.map(|v| v.is_int() && v.as_int() == 1).unwrap_or(false) {
                return Some(NativeShape::Fact);
            }
        }
        return None;
    }
    None
}

/// Mirror of the interpreter's int→float promotion for the iterative
/// equivalents of the specialized shapes.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => {
                let s = a + b;
                if Value::fits_int(s) {
                    Num::Int(s)
                } else {
                    Num::Float(a as f64 + b as f64)
                }
            }
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => match a.checked_mul(b) {
                Some(p) if Value::fits_int(p) => Num::Int(p),
                _ => Num::Float(a as f64 * b as f64),
            },
            (a, b) => Num::Float(a.as_f64() * b.as_f64()),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(n) => Value::int(n),
            Num::Float(f) => Value::number(f),
        }
    }
}

/// Execute a specialized shape natively. Base cases (n <= 1) and inputs
/// outside the guarded range return None and fall back to the generic
/// call path, so base-case semantics always come from the bytecode.
pub fn run_native_shape(shape: NativeShape, n: i64) -> Option<Value> {
    match shape {
        NativeShape::Fib => {
            if !(2..=92).contains(&n) {
                return None;
            }
            let mut a = Num::Int(0);
            let mut b = Num::Int(1);
            for _ in 2..=n {
                let c = a.add(b);
                a = b;
                b = c;
            }
            Some(b.into_value())
        }
        NativeShape::Fact => {
            if !(2..=170).contains(&n) {
                return None;
            }
            let mut acc = Num::Int(1);
            for i in 2..=n {
                acc = acc.mul(Num::Int(i));
            }
            Some(acc.into_value())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{cmp_jump, ProtoBuilder};

    fn proto_of(code: Vec<Instr>, consts: Vec<Value>) -> Proto {
        let mut b = ProtoBuilder::new("loop", 0);
        for k in consts {
            b.add_const(k).unwrap();
        }
        for i in code {
            b.emit(i);
        }
        b.nregs = 8;
        b.finish()
    }

    #[test]
    fn test_analyze_sum_with_const_limit() {
        // 0: GEJK r1, K0(100), +3   (exit when i >= 100)
        // 1: ADD r0, r0, r1
        // 2: INCR r1
        // 3: JMP -4                  (back edge; excluded from the window)
        let code = vec![
            cmp_jump(Op::GeJk, 1, 0, 3),
            Instr::abc(Op::Add, 0, 0, 1),
            Instr::abc(Op::Incr, 1, 0, 0),
            Instr::asbx(Op::Jmp, 0, -4),
        ];
        let p = proto_of(code, vec![Value::int(100)]);
        let an = analyze_loop(&p, 0, 3).expect("sum loop should match");
        assert_eq!(an.kind, LoopKind::Sum);
        assert_eq!(an.counter, 1);
        assert_eq!(an.limit, LimitSrc::Const(100));
        assert_eq!(an.acc, Some(AccSite::Reg(0)));
        assert!(!an.inclusive);
    }

    #[test]
    fn test_analyze_count_up_reg_limit() {
        // LEJ r2, r1 = exit when r2 <= r1, i.e. loop while r1 < r2
        let code = vec![
            cmp_jump(Op::LeJ, 2, 1, 2),
            Instr::abc(Op::Incr, 1, 0, 0),
            Instr::asbx(Op::Jmp, 0, -3),
        ];
        let p = proto_of(code, vec![]);
        let an = analyze_loop(&p, 0, 2).expect("count-up loop should match");
        assert_eq!(an.kind, LoopKind::CountUp);
        assert_eq!(an.counter, 1);
        assert_eq!(an.limit, LimitSrc::Reg(2));
    }

    #[test]
    fn test_analyze_rejects_stray_body() {
        let code = vec![
            cmp_jump(Op::GeJk, 1, 0, 4),
            Instr::abc(Op::Add, 0, 0, 1),
            Instr::abc(Op::Print, 0, 0, 0),
            Instr::abc(Op::Incr, 1, 0, 0),
            Instr::asbx(Op::Jmp, 0, -5),
        ];
        let p = proto_of(code, vec![Value::int(10)]);
        assert!(analyze_loop(&p, 0, 4).is_none());
    }

    #[test]
    fn test_sum_template_matches_interpreter() {
        let an = LoopAnalysis {
            kind: LoopKind::Sum,
            counter: 1,
            limit: LimitSrc::Const(10),
            acc: Some(AccSite::Reg(0)),
            inclusive: false,
        };
        let mut cnt = 0i64;
        let mut acc = Some(0i64);
        assert!(run_template(&an, &mut cnt, &mut acc, 10));
        assert_eq!(acc, Some(45));
        assert_eq!(cnt, 10);
    }

    #[test]
    fn test_sum_template_bails_on_overflow() {
        let an = LoopAnalysis {
            kind: LoopKind::Sum,
            counter: 1,
            limit: LimitSrc::Const(i64::MAX),
            acc: Some(AccSite::Reg(0)),
            inclusive: false,
        };
        let mut cnt = crate::value::INT_MAX - 1;
        let mut acc = Some(crate::value::INT_MAX - 1);
        let finished = run_template(&an, &mut cnt, &mut acc, crate::value::INT_MAX);
        assert!(!finished, "overflow must bail back to the interpreter");
    }

    #[test]
    fn test_native_fib() {
        assert!(run_native_shape(NativeShape::Fib, 0).is_none());
        assert!(run_native_shape(NativeShape::Fib, 1).is_none());
        assert_eq!(run_native_shape(NativeShape::Fib, 10).unwrap().as_int(), 55);
        assert_eq!(run_native_shape(NativeShape::Fib, 2).unwrap().as_int(), 1);
    }

    #[test]
    fn test_native_fact() {
        assert_eq!(run_native_shape(NativeShape::Fact, 5).unwrap().as_int(), 120);
        assert!(run_native_shape(NativeShape::Fact, 1).is_none());
        // 25! exceeds the 47-bit range and promotes to float
        let v = run_native_shape(NativeShape::Fact, 25).unwrap();
        assert!(v.is_float());
    }
}
