/// Module & import runtime: built-in modules aliasing stdlib globals,
/// loader-backed file modules with exports, and one-shot execution with
/// caching.
use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use sona::ast::{BinOp, Expr, Stmt};
use sona::{compile_program, Vm};

fn run_vm(vm: &mut Vm, program: &[Stmt]) -> String {
    let out = vm.capture_output();
    vm.eval(program).expect("program should succeed");
    let bytes = out.lock().clone();
    String::from_utf8(bytes).expect("utf8")
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sona-import-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[test]
fn test_import_math_builtin() {
    let mut vm = Vm::new();
    let program = [
        Stmt::Import { path: "math".into(), alias: None },
        Stmt::print(Expr::prop(Expr::var("math"), "PI")),
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("math"), "abs"),
            vec![Expr::int(-3)],
        )),
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("math"), "max"),
            vec![Expr::int(2), Expr::int(9)],
        )),
    ];
    assert_eq!(run_vm(&mut vm, &program), "3.141592653589793\n3\n9\n");
}

#[test]
fn test_import_json_builtin() {
    let mut vm = Vm::new();
    let program = [
        Stmt::Import { path: "json".into(), alias: Some("j".into()) },
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("j"), "encode"),
            vec![Expr::Array(vec![Expr::int(1), Expr::int(2)])],
        )),
    ];
    assert_eq!(run_vm(&mut vm, &program), "[1,2]\n");
}

#[test]
fn test_loader_module_with_exports() {
    let dir = scratch_dir("exports");
    fs::write(dir.join("mylib.sn"), "// compiled by the test loader\n").unwrap();

    let mut vm = Vm::new();
    vm.module_paths.push(dir);
    let loads = Rc::new(Cell::new(0usize));
    let loads_seen = loads.clone();
    vm.set_module_loader(Box::new(move |names, heap, _path| {
        loads_seen.set(loads_seen.get() + 1);
        let module = vec![
            Stmt::Export(Box::new(Stmt::let_("answer", Expr::int(42)))),
            Stmt::Export(Box::new(Stmt::func(
                "twice",
                &["x"],
                vec![Stmt::ret(Expr::bin(BinOp::Mul, Expr::var("x"), Expr::int(2)))],
            ))),
        ];
        compile_program(&module, names, heap).map_err(|e| e.to_string())
    }));

    let program = [
        Stmt::Import { path: "mylib".into(), alias: None },
        Stmt::print(Expr::prop(Expr::var("mylib"), "answer")),
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("mylib"), "twice"),
            vec![Expr::int(21)],
        )),
        // a second import under another alias must hit the cache
        Stmt::Import { path: "mylib".into(), alias: Some("again".into()) },
        Stmt::print(Expr::prop(Expr::var("again"), "answer")),
    ];
    assert_eq!(run_vm(&mut vm, &program), "42\n42\n42\n");
    assert_eq!(loads.get(), 1, "the module executes once and is cached");
}

#[test]
fn test_import_unresolvable_is_catchable() {
    let mut vm = Vm::new();
    let program = [Stmt::Try {
        body: vec![Stmt::Import { path: "definitely_missing_module".into(), alias: None }],
        catch_var: "e".into(),
        catch_body: vec![Stmt::print(Expr::str("import failed"))],
        finally: None,
    }];
    assert_eq!(run_vm(&mut vm, &program), "import failed\n");
}

#[test]
fn test_io_module_round_trip() {
    let dir = scratch_dir("io");
    let file = dir.join("note.txt").to_string_lossy().into_owned();
    let mut vm = Vm::new();
    let program = [
        Stmt::Import { path: "io".into(), alias: None },
        Stmt::Expr(Expr::call(
            Expr::prop(Expr::var("io"), "write_file"),
            vec![Expr::str(file.clone()), Expr::str("hello")],
        )),
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("io"), "read_file"),
            vec![Expr::str(file.clone())],
        )),
        Stmt::print(Expr::call(
            Expr::prop(Expr::var("io"), "file_exists"),
            vec![Expr::str(file)],
        )),
    ];
    assert_eq!(run_vm(&mut vm, &program), "hello\ntrue\n");
}

#[test]
fn test_time_and_os_globals() {
    let mut vm = Vm::new();
    let program = [
        Stmt::print(Expr::call_named("typeof", vec![Expr::call_named("timestamp", vec![])])),
        Stmt::print(Expr::call_named("typeof", vec![Expr::call_named("os_platform", vec![])])),
    ];
    assert_eq!(run_vm(&mut vm, &program), "int\nstring\n");
}
