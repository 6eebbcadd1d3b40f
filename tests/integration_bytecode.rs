/// Bytecode-level tests: programs assembled directly with ProtoBuilder,
/// exercising opcodes the AST surface has no syntax for (numeric FOR
/// loops, TESTSET, SELF, SUPER, INSTANCE, fibers, TAILCALL, the array
/// mutators, ISTYPE, AND/OR).
use std::rc::Rc;

use sona::bytecode::{Instr, Op, Proto, ProtoBuilder};
use sona::value::{TypeTag, Value};
use sona::Vm;

struct Asm {
    b: ProtoBuilder,
}

impl Asm {
    fn new(nregs: u8) -> Self {
        let mut b = ProtoBuilder::new("asm", 0);
        b.nregs = nregs;
        Asm { b }
    }

    fn with_arity(name: &str, arity: u8, nregs: u8) -> Self {
        let mut b = ProtoBuilder::new(name, arity);
        b.nregs = nregs;
        Asm { b }
    }

    fn k(&mut self, v: Value) -> u16 {
        self.b.add_const(v).expect("const")
    }

    fn emit(&mut self, i: Instr) -> &mut Self {
        self.b.emit(i);
        self
    }

    fn finish(self) -> Rc<Proto> {
        Rc::new(self.b.finish())
    }
}

fn run_proto(vm: &mut Vm, proto: Rc<Proto>) -> String {
    let out = vm.capture_output();
    vm.run(proto).expect("run should succeed");
    let bytes = out.lock().clone();
    String::from_utf8(bytes).expect("utf8")
}

#[test]
fn test_forprep_forloop_numeric_loop() {
    // for r3 = 1, 3, 1 { r4 += r3 } ; print r4
    let mut a = Asm::new(8);
    let k1 = a.k(Value::int(1)) as u16;
    let k3 = a.k(Value::int(3)) as u16;
    let k0 = a.k(Value::int(0)) as u16;
    a.emit(Instr::abx(Op::LoadK, 0, k1)) // init
        .emit(Instr::abx(Op::LoadK, 1, k3)) // limit
        .emit(Instr::abx(Op::LoadK, 2, k1)) // step
        .emit(Instr::abx(Op::LoadK, 4, k0)) // acc
        .emit(Instr::asbx(Op::ForPrep, 0, 1)) // → pc 6 (the FORLOOP)
        .emit(Instr::abc(Op::Add, 4, 4, 3)) // body: acc += var
        .emit(Instr::asbx(Op::ForLoop, 0, -2))
        .emit(Instr::abc(Op::Print, 4, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "6\n");
}

#[test]
fn test_testset_selects_or_skips() {
    // r0 = nil → TESTSET falls through its skip and the MOVE assigns r2
    let mut a = Asm::new(8);
    let k42 = a.k(Value::int(42));
    a.emit(Instr::abc(Op::LoadNil, 0, 0, 0))
        .emit(Instr::abx(Op::LoadK, 1, k42))
        .emit(Instr::abc(Op::TestSet, 2, 0, 1)) // truthy(r0) != 1 → skip next
        .emit(Instr::asbx(Op::Jmp, 0, 1)) // (skipped)
        .emit(Instr::abc(Op::Move, 2, 1, 0))
        .emit(Instr::abc(Op::Print, 2, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "42\n");

    // truthy source: TESTSET assigns and the JMP skips the MOVE
    let mut a = Asm::new(8);
    let k7 = a.k(Value::int(7));
    let k42 = a.k(Value::int(42));
    a.emit(Instr::abx(Op::LoadK, 0, k7))
        .emit(Instr::abx(Op::LoadK, 1, k42))
        .emit(Instr::abc(Op::TestSet, 2, 0, 1)) // truthy(r0) == 1 → r2 = r0
        .emit(Instr::asbx(Op::Jmp, 0, 1))
        .emit(Instr::abc(Op::Move, 2, 1, 0))
        .emit(Instr::abc(Op::Print, 2, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "7\n");
}

#[test]
fn test_and_or_value_select() {
    let mut a = Asm::new(8);
    let k0 = a.k(Value::int(0));
    let k7 = a.k(Value::int(7));
    a.emit(Instr::abx(Op::LoadK, 0, k0))
        .emit(Instr::abx(Op::LoadK, 1, k7))
        .emit(Instr::abc(Op::And, 2, 0, 1)) // 0 falsy → r2 = 0
        .emit(Instr::abc(Op::Or, 3, 0, 1)) // 0 falsy → r3 = 7
        .emit(Instr::abc(Op::Print, 2, 0, 0))
        .emit(Instr::abc(Op::Print, 3, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "0\n7\n");
}

#[test]
fn test_array_mutator_opcodes() {
    let mut a = Asm::new(8);
    let k1 = a.k(Value::int(1));
    let k2 = a.k(Value::int(2));
    a.emit(Instr::abc(Op::NewArray, 0, 0, 0))
        .emit(Instr::abx(Op::LoadK, 1, k1))
        .emit(Instr::abc(Op::Append, 0, 1, 0))
        .emit(Instr::abx(Op::LoadK, 1, k2))
        .emit(Instr::abc(Op::Append, 0, 1, 0)) // [1, 2]
        .emit(Instr::abc(Op::ArrPop, 2, 0, 0)) // → 2, [1]
        .emit(Instr::abc(Op::Print, 2, 0, 0))
        .emit(Instr::abc(Op::ArrUnshift, 0, 2, 0)) // [2, 1]
        .emit(Instr::abc(Op::ArrShift, 3, 0, 0)) // → 2, [1]
        .emit(Instr::abc(Op::Print, 3, 0, 0))
        .emit(Instr::abc(Op::IsType, 4, 0, TypeTag::Array as u8))
        .emit(Instr::abc(Op::Print, 4, 0, 0))
        .emit(Instr::abc(Op::ArrLen, 5, 0, 0))
        .emit(Instr::abc(Op::Print, 5, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "2\n2\ntrue\n1\n");
}

#[test]
fn test_self_prepped_method_call() {
    let mut vm = Vm::new();

    // method proto: fn m(self) { return 7 }
    let mut m = Asm::with_arity("m", 1, 2);
    let k7 = m.k(Value::int(7));
    m.emit(Instr::abx(Op::LoadK, 1, k7))
        .emit(Instr::abc(Op::Return, 1, 2, 0));
    let m_proto = m.finish();

    let mut a = Asm::new(12);
    let kname = a.k(vm.heap.str_value("Box"));
    let km = a.k(vm.heap.str_value("m"));
    let kproto = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(m_proto))));
    a.emit(Instr::abx(Op::Class, 0, kname))
        .emit(Instr::abx(Op::Closure, 1, kproto))
        .emit(Instr::abc(Op::SetMethod, 0, km as u8, 1))
        .emit(Instr::abc(Op::Instance, 2, 0, 0))
        .emit(Instr::abc(Op::SelfPrep, 3, 2, km as u8)) // r3 = method, r4 = receiver
        .emit(Instr::abc(Op::Call, 3, 2, 2)) // callee r3, 1 arg (receiver)
        .emit(Instr::abc(Op::Print, 3, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    assert_eq!(run_proto(&mut vm, a.finish()), "7\n");
}

#[test]
fn test_super_reaches_parent_method() {
    let mut vm = Vm::new();

    let mut ma = Asm::with_arity("m", 1, 2);
    let k1 = ma.k(Value::int(1));
    ma.emit(Instr::abx(Op::LoadK, 1, k1))
        .emit(Instr::abc(Op::Return, 1, 2, 0));
    let parent_m = ma.finish();

    let mut mb = Asm::with_arity("m", 1, 2);
    let k2 = mb.k(Value::int(2));
    mb.emit(Instr::abx(Op::LoadK, 1, k2))
        .emit(Instr::abc(Op::Return, 1, 2, 0));
    let child_m = mb.finish();

    let mut a = Asm::new(12);
    let ka = a.k(vm.heap.str_value("A"));
    let kb = a.k(vm.heap.str_value("B"));
    let km = a.k(vm.heap.str_value("m"));
    let kpa = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(parent_m))));
    let kpb = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(child_m))));
    a.emit(Instr::abx(Op::Class, 0, ka))
        .emit(Instr::abx(Op::Closure, 1, kpa))
        .emit(Instr::abc(Op::SetMethod, 0, km as u8, 1))
        .emit(Instr::abx(Op::Class, 2, kb))
        .emit(Instr::abc(Op::Inherit, 2, 0, 0))
        .emit(Instr::abx(Op::Closure, 3, kpb))
        .emit(Instr::abc(Op::SetMethod, 2, km as u8, 3))
        .emit(Instr::abc(Op::Instance, 4, 2, 0))
        // own method resolves to the override
        .emit(Instr::abc(Op::GetMethod, 5, 4, km as u8))
        .emit(Instr::abc(Op::Call, 5, 1, 2))
        .emit(Instr::abc(Op::Print, 5, 0, 0))
        // SUPER reaches the parent's version
        .emit(Instr::abc(Op::Super, 6, 4, km as u8))
        .emit(Instr::abc(Op::Call, 6, 1, 2))
        .emit(Instr::abc(Op::Print, 6, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    assert_eq!(run_proto(&mut vm, a.finish()), "2\n1\n");
}

#[test]
fn test_tailcall_reuses_frame() {
    let mut vm = Vm::new();

    let mut g = Asm::with_arity("g", 0, 2);
    let k99 = g.k(Value::int(99));
    g.emit(Instr::abx(Op::LoadK, 0, k99))
        .emit(Instr::abc(Op::Return, 0, 2, 0));
    let g_proto = g.finish();

    let mut f = Asm::with_arity("f", 0, 4);
    let kg = f.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(g_proto))));
    f.emit(Instr::abx(Op::Closure, 0, kg))
        .emit(Instr::abc(Op::TailCall, 0, 1, 0));
    let f_proto = f.finish();

    let mut a = Asm::new(4);
    let kf = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(f_proto))));
    a.emit(Instr::abx(Op::Closure, 0, kf))
        .emit(Instr::abc(Op::Call, 0, 1, 2))
        .emit(Instr::abc(Op::Print, 0, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    assert_eq!(run_proto(&mut vm, a.finish()), "99\n");
}

#[test]
fn test_fiber_yield_resume_round_trip() {
    let mut vm = Vm::new();

    // entry(arg): r1 = arg + 1; yield r1 (resume arg lands back in r1);
    //             r2 = r1 + 10; return r2
    let mut e = Asm::with_arity("entry", 1, 4);
    e.emit(Instr::absc(Op::AddI, 1, 0, 1))
        .emit(Instr::abc(Op::Yield, 1, 2, 0))
        .emit(Instr::absc(Op::AddI, 2, 1, 10))
        .emit(Instr::abc(Op::Return, 2, 2, 0));
    let entry = e.finish();

    let mut a = Asm::new(12);
    let kentry = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(entry))));
    let k5 = a.k(Value::int(5));
    let k100 = a.k(Value::int(100));
    a.emit(Instr::abx(Op::Closure, 0, kentry))
        .emit(Instr::abc(Op::Fiber, 3, 0, 0))
        .emit(Instr::abx(Op::LoadK, 4, k5))
        .emit(Instr::abc(Op::Resume, 5, 3, 2)) // start with arg 5 → yields 6
        .emit(Instr::abc(Op::Print, 5, 0, 0))
        .emit(Instr::abx(Op::LoadK, 4, k100))
        .emit(Instr::abc(Op::Resume, 6, 3, 2)) // resume with 100 → returns 110
        .emit(Instr::abc(Op::Print, 6, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    assert_eq!(run_proto(&mut vm, a.finish()), "6\n110\n");
}

#[test]
fn test_resume_dead_fiber_is_catchable() {
    let mut vm = Vm::new();

    let mut e = Asm::with_arity("entry", 1, 2);
    e.emit(Instr::abc(Op::Return, 0, 2, 0));
    let entry = e.finish();

    // try { resume; resume } catch e { print e }
    let mut a = Asm::new(12);
    let kentry = a.k(Value::obj(vm.heap.alloc(sona::Obj::Proto(entry))));
    a.emit(Instr::abx(Op::Closure, 0, kentry))
        .emit(Instr::abc(Op::Fiber, 1, 0, 0))
        .emit(Instr::asbx(Op::Try, 0, 5)) // catch at pc 8
        .emit(Instr::abc(Op::Resume, 2, 1, 1)) // completes → dead
        .emit(Instr::abc(Op::Resume, 3, 1, 1)) // throws
        .emit(Instr::abc(Op::EndTry, 0, 0, 0))
        .emit(Instr::asbx(Op::Jmp, 0, 3)) // over catch
        .emit(Instr::abc(Op::Nop, 0, 0, 0))
        .emit(Instr::abc(Op::GetError, 4, 0, 0))
        .emit(Instr::abc(Op::Print, 4, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let out = run_proto(&mut vm, a.finish());
    assert_eq!(out, "cannot resume a dead fiber\n");
}

#[test]
fn test_yield_outside_fiber_is_catchable() {
    let mut vm = Vm::new();
    let mut a = Asm::new(8);
    a.emit(Instr::asbx(Op::Try, 0, 3)) // catch at pc 4
        .emit(Instr::abc(Op::Yield, 0, 1, 0))
        .emit(Instr::abc(Op::EndTry, 0, 0, 0))
        .emit(Instr::asbx(Op::Jmp, 0, 2))
        .emit(Instr::abc(Op::GetError, 1, 0, 0))
        .emit(Instr::abc(Op::Print, 1, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    assert_eq!(run_proto(&mut vm, a.finish()), "yield outside a fiber\n");
}

#[test]
fn test_loadbool_skip_and_nop() {
    let mut a = Asm::new(4);
    a.emit(Instr::abc(Op::LoadBool, 0, 1, 1)) // r0 = true, skip next
        .emit(Instr::abc(Op::LoadBool, 0, 0, 0)) // (skipped)
        .emit(Instr::abc(Op::Nop, 0, 0, 0))
        .emit(Instr::abc(Op::Print, 0, 0, 0))
        .emit(Instr::abc(Op::Return, 0, 1, 0));
    let mut vm = Vm::new();
    assert_eq!(run_proto(&mut vm, a.finish()), "true\n");
}
