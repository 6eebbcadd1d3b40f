/// End-to-end tests for the Sona VM: programs are built as ASTs, compiled
/// against a fresh VM, and PRINT output is captured through the VM's
/// pluggable sink.
///
/// These cover:
///   • the arithmetic/comparison promotion rules and string coercion
///   • call/return, closures (closed-on-capture), recursion
///   • control flow: if/while/for/for-in, break/continue, match
///   • try/throw across frames, catchable vs fatal errors
///   • iterators over arrays and map-key snapshots
///   • classes, instances, methods, inheritance
///   • the fused global-accumulator opcodes vs their generic triples
use sona::ast::{BinOp, Expr, LambdaBody, Lit, LogOp, MatchArm, MethodDef, Pattern, Stmt, StrPart};
use sona::errors::{SonaError, VmError};
use sona::Vm;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run(program: &[Stmt]) -> (String, Result<sona::Value, SonaError>) {
    let mut vm = Vm::new();
    let out = vm.capture_output();
    let res = vm.eval(program);
    let text = String::from_utf8(out.lock().clone()).expect("utf8 output");
    (text, res)
}

fn run_ok(program: &[Stmt]) -> String {
    let (out, res) = run(program);
    res.expect("program should succeed");
    out
}

// ─── Scenario: sum to N ───────────────────────────────────────────────────────

#[test]
fn test_sum_to_n() {
    // let s = 0; for (let i = 0; i < 10; i = i + 1) { s = s + i; } print(s);
    let program = [
        Stmt::let_("s", Expr::int(0)),
        Stmt::For {
            init: Some(Box::new(Stmt::let_("i", Expr::int(0)))),
            cond: Some(Expr::bin(BinOp::Lt, Expr::var("i"), Expr::int(10))),
            update: Some(Expr::assign(
                Expr::var("i"),
                Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)),
            )),
            body: vec![Stmt::assign(
                "s",
                Expr::bin(BinOp::Add, Expr::var("s"), Expr::var("i")),
            )],
        },
        Stmt::print(Expr::var("s")),
    ];
    assert_eq!(run_ok(&program), "45\n");
}

// ─── Scenario: recursive fibonacci ────────────────────────────────────────────

fn fib_decl() -> Stmt {
    Stmt::func(
        "fib",
        &["n"],
        vec![
            Stmt::if_(
                Expr::bin(BinOp::Le, Expr::var("n"), Expr::int(1)),
                vec![Stmt::ret(Expr::var("n"))],
            ),
            Stmt::ret(Expr::bin(
                BinOp::Add,
                Expr::call_named("fib", vec![Expr::bin(BinOp::Sub, Expr::var("n"), Expr::int(1))]),
                Expr::call_named("fib", vec![Expr::bin(BinOp::Sub, Expr::var("n"), Expr::int(2))]),
            )),
        ],
    )
}

#[test]
fn test_recursive_fib() {
    let program = [fib_decl(), Stmt::print(Expr::call_named("fib", vec![Expr::int(10)]))];
    assert_eq!(run_ok(&program), "55\n");
}

// ─── Scenario: try/throw across a call ────────────────────────────────────────

#[test]
fn test_throw_across_call() {
    let program = [
        Stmt::func("bad", &[], vec![Stmt::Throw(Expr::str("oops"))]),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::call_named("bad", vec![]))],
            catch_var: "e".into(),
            catch_body: vec![Stmt::print(Expr::var("e"))],
            finally: None,
        },
    ];
    assert_eq!(run_ok(&program), "oops\n");
}

// ─── Scenario: for-in over map keys (stable snapshot) ─────────────────────────

#[test]
fn test_for_in_over_map_keys() {
    let program = [
        Stmt::let_(
            "m",
            Expr::Map(vec![
                (Expr::str("a"), Expr::int(1)),
                (Expr::str("b"), Expr::int(2)),
            ]),
        ),
        Stmt::ForIn {
            var: "k".into(),
            iterable: Expr::call_named("keys", vec![Expr::var("m")]),
            body: vec![Stmt::print(Expr::var("k"))],
        },
    ];
    let out = run_ok(&program);
    let mut lines: Vec<&str> = out.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["a", "b"], "each key exactly once, any order");
}

// ─── Scenario: closed-on-capture closures ─────────────────────────────────────

#[test]
fn test_closure_captures_value_at_capture_time() {
    // let x = 1; let f = fn() => x; x = 2; print(f());
    // Captures close immediately: the closure sees the value at capture
    // time, not later mutations of the outer local.
    let program = [
        Stmt::func(
            "demo",
            &[],
            vec![
                Stmt::let_("x", Expr::int(1)),
                Stmt::let_(
                    "f",
                    Expr::Lambda {
                        params: vec![],
                        body: LambdaBody::Expr(Box::new(Expr::var("x"))),
                    },
                ),
                Stmt::assign("x", Expr::int(2)),
                Stmt::ret(Expr::call(Expr::var("f"), vec![])),
            ],
        ),
        Stmt::print(Expr::call_named("demo", vec![])),
    ];
    assert_eq!(run_ok(&program), "1\n");
}

#[test]
fn test_closure_currying() {
    let program = [
        Stmt::func(
            "make_adder",
            &["x"],
            vec![Stmt::ret(Expr::Lambda {
                params: vec!["y".into()],
                body: LambdaBody::Expr(Box::new(Expr::bin(
                    BinOp::Add,
                    Expr::var("x"),
                    Expr::var("y"),
                ))),
            })],
        ),
        Stmt::let_("add5", Expr::call_named("make_adder", vec![Expr::int(5)])),
        Stmt::print(Expr::call(Expr::var("add5"), vec![Expr::int(10)])),
    ];
    assert_eq!(run_ok(&program), "15\n");
}

// ─── Scenario: string concatenation via ADD ───────────────────────────────────

#[test]
fn test_string_plus_int_concatenates() {
    let program = [Stmt::print(Expr::bin(BinOp::Add, Expr::str("x"), Expr::int(1)))];
    assert_eq!(run_ok(&program), "x1\n");
}

// ─── Arithmetic & print formats ───────────────────────────────────────────────

#[test]
fn test_arithmetic_promotion() {
    let program = [
        Stmt::print(Expr::bin(BinOp::Add, Expr::int(2), Expr::int(3))),
        Stmt::print(Expr::bin(BinOp::Add, Expr::int(2), Expr::float(0.5))),
        Stmt::print(Expr::bin(BinOp::Div, Expr::int(7), Expr::int(2))),
        Stmt::print(Expr::bin(BinOp::Mod, Expr::int(7), Expr::int(2))),
        Stmt::print(Expr::bin(BinOp::Pow, Expr::int(2), Expr::int(10))),
        Stmt::print(Expr::unary(sona::ast::UnOp::Neg, Expr::int(5))),
        Stmt::print(Expr::nil()),
        Stmt::print(Expr::boolean(true)),
    ];
    assert_eq!(run_ok(&program), "5\n2.5\n3.5\n1\n1024\n-5\nnull\ntrue\n");
}

#[test]
fn test_int_overflow_promotes_to_float() {
    // (2^46) * 4 leaves the 47-bit tagged range and becomes a double
    let program = [Stmt::print(Expr::bin(
        BinOp::Mul,
        Expr::int(1 << 46),
        Expr::int(4),
    ))];
    assert_eq!(run_ok(&program), "281474976710656\n");
}

// ─── Control flow ─────────────────────────────────────────────────────────────

#[test]
fn test_if_else_and_logical() {
    let program = [
        Stmt::let_("x", Expr::int(3)),
        Stmt::if_else(
            Expr::logical(
                LogOp::And,
                Expr::bin(BinOp::Gt, Expr::var("x"), Expr::int(0)),
                Expr::bin(BinOp::Lt, Expr::var("x"), Expr::int(10)),
            ),
            vec![Stmt::print(Expr::str("in range"))],
            vec![Stmt::print(Expr::str("out of range"))],
        ),
        // short-circuit: rhs must not run when lhs decides
        Stmt::print(Expr::logical(LogOp::Or, Expr::str("lhs"), Expr::var("undefined_global"))),
    ];
    assert_eq!(run_ok(&program), "in range\nlhs\n");
}

#[test]
fn test_while_break_continue() {
    let program = [
        Stmt::let_("out", Expr::int(0)),
        Stmt::func(
            "count",
            &[],
            vec![
                Stmt::let_("i", Expr::int(0)),
                Stmt::let_("hits", Expr::int(0)),
                Stmt::while_(
                    Expr::boolean(true),
                    vec![
                        Stmt::assign("i", Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1))),
                        Stmt::if_(
                            Expr::bin(BinOp::Gt, Expr::var("i"), Expr::int(10)),
                            vec![Stmt::Break],
                        ),
                        Stmt::if_(
                            Expr::bin(
                                BinOp::Eq,
                                Expr::bin(BinOp::Mod, Expr::var("i"), Expr::int(2)),
                                Expr::int(0),
                            ),
                            vec![Stmt::Continue],
                        ),
                        Stmt::assign("hits", Expr::bin(BinOp::Add, Expr::var("hits"), Expr::int(1))),
                    ],
                ),
                Stmt::ret(Expr::var("hits")),
            ],
        ),
        Stmt::print(Expr::call_named("count", vec![])),
    ];
    // odd numbers 1..=9 → 5 hits
    assert_eq!(run_ok(&program), "5\n");
}

#[test]
fn test_for_in_over_array() {
    let program = [Stmt::ForIn {
        var: "v".into(),
        iterable: Expr::Array(vec![Expr::int(10), Expr::int(20), Expr::int(30)]),
        body: vec![Stmt::print(Expr::var("v"))],
    }];
    assert_eq!(run_ok(&program), "10\n20\n30\n");
}

#[test]
fn test_match_statement() {
    let program = [
        Stmt::let_("x", Expr::int(2)),
        Stmt::Match {
            expr: Expr::var("x"),
            arms: vec![
                MatchArm { pattern: Pattern::Literal(Lit::Int(1)), body: vec![Stmt::print(Expr::str("one"))] },
                MatchArm { pattern: Pattern::Literal(Lit::Int(2)), body: vec![Stmt::print(Expr::str("two"))] },
                MatchArm { pattern: Pattern::Wildcard, body: vec![Stmt::print(Expr::str("many"))] },
            ],
        },
    ];
    assert_eq!(run_ok(&program), "two\n");
}

// ─── Collections ──────────────────────────────────────────────────────────────

#[test]
fn test_array_index_and_autogrow() {
    let program = [
        Stmt::let_("a", Expr::Array(vec![Expr::int(1), Expr::int(2)])),
        Stmt::print(Expr::index(Expr::var("a"), Expr::int(0))),
        // out-of-range read yields nil
        Stmt::print(Expr::index(Expr::var("a"), Expr::int(9))),
        // out-of-range write auto-grows with nil padding
        Stmt::IndexAssign {
            object: Expr::var("a"),
            index: Expr::int(4),
            value: Expr::int(99),
        },
        Stmt::print(Expr::call_named("len", vec![Expr::var("a")])),
        Stmt::print(Expr::index(Expr::var("a"), Expr::int(4))),
    ];
    assert_eq!(run_ok(&program), "1\nnull\n5\n99\n");
}

#[test]
fn test_map_literal_and_property() {
    let program = [
        Stmt::let_(
            "m",
            Expr::Map(vec![(Expr::str("name"), Expr::str("sona"))]),
        ),
        Stmt::print(Expr::prop(Expr::var("m"), "name")),
        Stmt::print(Expr::index(Expr::var("m"), Expr::str("name"))),
        Stmt::print(Expr::call_named("haskey", vec![Expr::var("m"), Expr::str("name")])),
        Stmt::print(Expr::call_named("typeof", vec![Expr::var("m")])),
    ];
    assert_eq!(run_ok(&program), "sona\nsona\ntrue\nmap\n");
}

#[test]
fn test_string_builtins_lowered_to_opcodes() {
    let program = [
        Stmt::print(Expr::call_named("upper", vec![Expr::str("abc")])),
        Stmt::print(Expr::call_named("contains", vec![Expr::str("hello"), Expr::str("ell")])),
        Stmt::print(Expr::call_named("split", vec![Expr::str("a,b"), Expr::str(",")])),
        Stmt::print(Expr::call_named("len", vec![Expr::str("hey")])),
    ];
    assert_eq!(run_ok(&program), "ABC\ntrue\n[a, b]\n3\n");
}

#[test]
fn test_interpolation() {
    let program = [
        Stmt::let_("n", Expr::int(7)),
        Stmt::print(Expr::Interpolation(vec![
            StrPart::Lit("n is ".into()),
            StrPart::Expr(Expr::var("n")),
            StrPart::Lit("!".into()),
        ])),
    ];
    assert_eq!(run_ok(&program), "n is 7!\n");
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[test]
fn test_division_by_zero_is_catchable() {
    let program = [Stmt::Try {
        body: vec![Stmt::Expr(Expr::bin(BinOp::Div, Expr::int(1), Expr::int(0)))],
        catch_var: "e".into(),
        catch_body: vec![Stmt::print(Expr::var("e"))],
        finally: Some(vec![Stmt::print(Expr::str("done"))]),
    }];
    assert_eq!(run_ok(&program), "division by zero\ndone\n");
}

#[test]
fn test_uncaught_throw_reports_value() {
    let program = [Stmt::Throw(Expr::str("boom"))];
    let (_, res) = run(&program);
    match res {
        Err(SonaError::Runtime(VmError::Uncaught(msg))) => assert_eq!(msg, "boom"),
        other => panic!("expected uncaught error, got {:?}", other),
    }
}

#[test]
fn test_ordered_compare_type_mismatch_is_fatal() {
    // non-catchable even inside try
    let program = [Stmt::Try {
        body: vec![Stmt::Expr(Expr::bin(BinOp::Lt, Expr::int(1), Expr::str("a")))],
        catch_var: "e".into(),
        catch_body: vec![Stmt::print(Expr::str("caught"))],
        finally: None,
    }];
    let (out, res) = run(&program);
    assert!(out.is_empty(), "catch must not run");
    assert!(matches!(res, Err(SonaError::Runtime(VmError::BadCompare(_)))));
}

#[test]
fn test_calling_nil_is_catchable() {
    let program = [
        Stmt::let_("f", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::call(Expr::var("f"), vec![]))],
            catch_var: "e".into(),
            catch_body: vec![Stmt::print(Expr::var("e"))],
            finally: None,
        },
    ];
    assert_eq!(run_ok(&program), "cannot call a nil value\n");
}

#[test]
fn test_stack_overflow_detected() {
    let program = [
        Stmt::func("inf", &[], vec![Stmt::ret(Expr::call_named("inf", vec![]))]),
        Stmt::Expr(Expr::call_named("inf", vec![])),
    ];
    let (_, res) = run(&program);
    assert!(matches!(res, Err(SonaError::Runtime(VmError::StackOverflow))));
}

#[test]
fn test_throw_unwinds_iterators() {
    // An iterator opened in a called frame must be discarded when a throw
    // unwinds that frame; the outer loop then still iterates cleanly.
    let program = [
        Stmt::func(
            "walk",
            &[],
            vec![Stmt::ForIn {
                var: "v".into(),
                iterable: Expr::Array(vec![Expr::int(1), Expr::int(2)]),
                body: vec![Stmt::Throw(Expr::str("stop"))],
            }],
        ),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::call_named("walk", vec![]))],
            catch_var: "e".into(),
            catch_body: vec![Stmt::print(Expr::var("e"))],
            finally: None,
        },
        Stmt::ForIn {
            var: "v".into(),
            iterable: Expr::Array(vec![Expr::int(7)]),
            body: vec![Stmt::print(Expr::var("v"))],
        },
    ];
    assert_eq!(run_ok(&program), "stop\n7\n");
}

// ─── Fused global accumulators ────────────────────────────────────────────────

#[test]
fn test_global_accumulator_equivalence() {
    // s (fused ADDG/INCRG) and t (generic GETGLOBAL/ADD/SETGLOBAL triple)
    // must agree after the same sequence of updates.
    let program = [
        Stmt::let_("s", Expr::int(0)),
        Stmt::let_("t", Expr::int(0)),
        Stmt::let_("c", Expr::int(0)),
        Stmt::func(
            "go",
            &[],
            vec![
                Stmt::let_("i", Expr::int(0)),
                Stmt::while_(
                    Expr::bin(BinOp::Lt, Expr::var("i"), Expr::int(50)),
                    vec![
                        // fused: s = s + i → ADDG
                        Stmt::assign("s", Expr::bin(BinOp::Add, Expr::var("s"), Expr::var("i"))),
                        // generic: t = i + t (lhs differs → triple)
                        Stmt::assign("t", Expr::bin(BinOp::Add, Expr::var("i"), Expr::var("t"))),
                        // fused: c = c + 1 → INCRG
                        Stmt::assign("c", Expr::bin(BinOp::Add, Expr::var("c"), Expr::int(1))),
                        Stmt::assign("i", Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1))),
                    ],
                ),
            ],
        ),
        Stmt::Expr(Expr::call_named("go", vec![])),
        Stmt::print(Expr::var("s")),
        Stmt::print(Expr::var("t")),
        Stmt::print(Expr::var("c")),
    ];
    assert_eq!(run_ok(&program), "1225\n1225\n50\n");
}

// ─── Classes ──────────────────────────────────────────────────────────────────

#[test]
fn test_class_instance_methods() {
    let program = [
        Stmt::Class {
            name: "Point".into(),
            parent: None,
            fields: vec![("x".into(), Expr::int(0))],
            methods: vec![
                MethodDef {
                    name: "init".into(),
                    params: vec!["x0".into()],
                    body: vec![Stmt::Expr(Expr::assign(
                        Expr::prop(Expr::var("self"), "x"),
                        Expr::var("x0"),
                    ))],
                },
                MethodDef {
                    name: "shifted".into(),
                    params: vec!["d".into()],
                    body: vec![Stmt::ret(Expr::bin(
                        BinOp::Add,
                        Expr::prop(Expr::var("self"), "x"),
                        Expr::var("d"),
                    ))],
                },
            ],
        },
        Stmt::let_("p", Expr::call_named("Point", vec![Expr::int(5)])),
        Stmt::print(Expr::prop(Expr::var("p"), "x")),
        Stmt::print(Expr::call(Expr::prop(Expr::var("p"), "shifted"), vec![Expr::int(3)])),
        Stmt::print(Expr::call_named("typeof", vec![Expr::var("p")])),
    ];
    assert_eq!(run_ok(&program), "5\n8\ninstance\n");
}

#[test]
fn test_class_inheritance() {
    let program = [
        Stmt::Class {
            name: "Animal".into(),
            parent: None,
            fields: vec![],
            methods: vec![MethodDef {
                name: "speak".into(),
                params: vec![],
                body: vec![Stmt::ret(Expr::str("..."))],
            }],
        },
        Stmt::Class {
            name: "Dog".into(),
            parent: Some("Animal".into()),
            fields: vec![],
            methods: vec![],
        },
        Stmt::let_("d", Expr::call_named("Dog", vec![])),
        Stmt::print(Expr::call(Expr::prop(Expr::var("d"), "speak"), vec![])),
    ];
    assert_eq!(run_ok(&program), "...\n");
}

// ─── Bound methods as values ──────────────────────────────────────────────────

#[test]
fn test_method_extracted_as_value_stays_bound() {
    let program = [
        Stmt::Class {
            name: "Counter".into(),
            parent: None,
            fields: vec![("n".into(), Expr::int(41))],
            methods: vec![MethodDef {
                name: "next".into(),
                params: vec![],
                body: vec![Stmt::ret(Expr::bin(
                    BinOp::Add,
                    Expr::prop(Expr::var("self"), "n"),
                    Expr::int(1),
                ))],
            }],
        },
        Stmt::let_("c", Expr::call_named("Counter", vec![])),
        Stmt::let_("f", Expr::prop(Expr::var("c"), "next")),
        Stmt::print(Expr::call(Expr::var("f"), vec![])),
    ];
    assert_eq!(run_ok(&program), "42\n");
}

// ─── Nil-filled missing arguments ─────────────────────────────────────────────

#[test]
fn test_missing_arguments_are_nil() {
    let program = [
        Stmt::func(
            "takes2",
            &["a", "b"],
            vec![Stmt::ret(Expr::call_named("typeof", vec![Expr::var("b")]))],
        ),
        Stmt::print(Expr::call_named("takes2", vec![Expr::int(1)])),
    ];
    assert_eq!(run_ok(&program), "nil\n");
}
