/// Module & import runtime support.
///
/// Built-in modules are export tables aliasing the stdlib globals that
/// `intrinsics::install` registers at startup, plus a handful of
/// constants. Everything else goes through the host `ModuleLoader` hook
/// with a filesystem-resolved path; the VM publishes the module object
/// before executing it so circular imports resolve to the in-progress
/// module instead of recursing.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::bytecode::Proto;
use crate::compiler::GlobalTable;
use crate::heap::Heap;
use crate::value::Value;

/// Host-provided compiler hook: resolved script path → top-level
/// prototype. The loader gets the VM's global table and heap so the
/// compiled prototype shares ids and interned constants.
pub type ModuleLoader =
    Box<dyn FnMut(&mut GlobalTable, &mut Heap, &Path) -> Result<Rc<Proto>, String>>;

/// Script extension for Sona sources.
pub const SCRIPT_EXT: &str = "sn";

const BUILTIN_MATH: &[&str] = &[
    "abs", "sqrt", "floor", "ceil", "round", "pow", "min", "max", "sin", "cos", "tan", "log",
    "exp", "random",
];
const BUILTIN_STRING: &[&str] = &[
    "upper", "lower", "trim", "len", "split", "join", "replace", "contains", "starts_with",
    "ends_with", "substring", "char_at",
];
const BUILTIN_ARRAY: &[&str] = &[
    "push", "pop", "len", "sort", "reverse", "slice", "concat", "index_of", "contains", "join",
    "remove", "insert", "first", "last", "sum", "avg", "min", "max", "unique", "flatten", "zip",
    "enumerate", "count", "fill", "range",
];
const BUILTIN_IO: &[&str] = &[
    "read_file", "write_file", "file_exists", "list_dir", "mkdir", "remove_file", "rename_file",
    "file_stat", "append_file",
];
const BUILTIN_JSON: &[&str] = &["encode", "decode", "stringify", "parse"];
const BUILTIN_TIME: &[&str] = &["timestamp", "date", "datetime", "sleep", "format_timestamp"];
const BUILTIN_OS: &[&str] = &[
    "getenv", "setenv", "exit", "cwd", "chdir", "os_args", "hostname", "os_platform",
];
const BUILTIN_HTTP: &[&str] = &["get", "post", "request", "download", "json"];

pub fn is_builtin(name: &str) -> bool {
    builtin_exports(name).is_some()
}

/// Export names of a built-in module; each aliases the global of the
/// same name.
pub fn builtin_exports(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "math" => Some(BUILTIN_MATH),
        "string" => Some(BUILTIN_STRING),
        "array" => Some(BUILTIN_ARRAY),
        "io" => Some(BUILTIN_IO),
        "json" => Some(BUILTIN_JSON),
        "time" => Some(BUILTIN_TIME),
        "os" => Some(BUILTIN_OS),
        "http" => Some(BUILTIN_HTTP),
        _ => None,
    }
}

/// Constants exported by a built-in module in addition to its globals.
pub fn builtin_consts(name: &str) -> Vec<(&'static str, Value)> {
    match name {
        "math" => vec![
            ("PI", Value::number(std::f64::consts::PI)),
            ("E", Value::number(std::f64::consts::E)),
        ],
        _ => Vec::new(),
    }
}

pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".sona").join("lib"));
    }
    paths
}

/// Resolve an import path to a file on disk.
///
/// `./x` and `../x` resolve relative to the importing file's directory,
/// trying `x` then `x.sn`. Bare names try each search path as `p/x`,
/// `p/x.sn`, and `p/x/index.sn`, and finally the working directory.
pub fn resolve(path: &str, current_file: Option<&Path>, search: &[PathBuf]) -> Option<PathBuf> {
    if path.starts_with("./") || path.starts_with("../") {
        let dir = current_file
            .and_then(|f| f.parent().map(Path::to_path_buf))
            .or_else(|| std::env::current_dir().ok())?;
        let rel = path.strip_prefix("./").unwrap_or(path);
        return try_file(&dir.join(rel));
    }
    for p in search {
        if let Some(found) = try_module_dir(p, path) {
            return Some(found);
        }
    }
    let cwd = std::env::current_dir().ok()?;
    try_module_dir(&cwd, path)
}

fn try_module_dir(dir: &Path, name: &str) -> Option<PathBuf> {
    if let Some(found) = try_file(&dir.join(name)) {
        return Some(found);
    }
    let index = dir.join(name).join(format!("index.{}", SCRIPT_EXT));
    if index.is_file() {
        return Some(index);
    }
    None
}

fn try_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    // append (not replace) the script extension: `x` then `x.sn`
    let mut name = candidate.as_os_str().to_os_string();
    name.push(".");
    name.push(SCRIPT_EXT);
    let with_ext = PathBuf::from(name);
    if with_ext.is_file() {
        return Some(with_ext);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sona-modules-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn test_builtin_tables() {
        assert!(is_builtin("math"));
        assert!(is_builtin("http"));
        assert!(!is_builtin("nonsense"));
        assert!(builtin_exports("array").unwrap().contains(&"flatten"));
        let consts = builtin_consts("math");
        assert!(consts.iter().any(|(k, _)| *k == "PI"));
    }

    #[test]
    fn test_resolve_relative() {
        let dir = scratch_dir("rel");
        fs::write(dir.join("util.sn"), "").unwrap();
        let importer = dir.join("main.sn");
        fs::write(&importer, "").unwrap();
        let found = resolve("./util", Some(&importer), &[]).expect("resolve ./util");
        assert_eq!(found, dir.join("util.sn"));
    }

    #[test]
    fn test_resolve_search_path_and_index() {
        let dir = scratch_dir("search");
        fs::create_dir_all(dir.join("pkg")).unwrap();
        fs::write(dir.join("pkg").join("index.sn"), "").unwrap();
        let found = resolve("pkg", None, &[dir.clone()]).expect("resolve pkg");
        assert_eq!(found, dir.join("pkg").join("index.sn"));

        fs::write(dir.join("flat.sn"), "").unwrap();
        let found = resolve("flat", None, &[dir.clone()]).expect("resolve flat");
        assert_eq!(found, dir.join("flat.sn"));
    }
}
