/// Sona error types.
///
/// Runtime errors are partitioned into catchable kinds (unwound to the
/// nearest try frame) and non-catchable kinds (returned from `Vm::run`).
/// User `throw` carries an arbitrary value; everything else is stringified
/// when it reaches a catch handler.

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("cannot call a {0} value")]
    NotCallable(&'static str),

    #[error("import error: {0}")]
    Import(String),

    #[error("io error: {0}")]
    Io(String),

    /// User-thrown value; rendered only if it escapes uncaught.
    #[error("thrown value")]
    Thrown(Value),

    /// Ordered comparison across incompatible types. Unlike `Type`, this
    /// indicates broken program logic and does not unwind to a handler.
    #[error("type error: {0}")]
    BadCompare(String),

    #[error("stack overflow")]
    StackOverflow,

    #[error("uncaught exception: {0}")]
    Uncaught(String),

    /// Bytecode or VM invariant breakage (e.g. a missing iterator entry).
    #[error("vm invariant violated: {0}")]
    Internal(String),
}

impl VmError {
    /// Whether a `try` frame may intercept this error.
    pub fn catchable(&self) -> bool {
        !matches!(
            self,
            VmError::BadCompare(_)
                | VmError::StackOverflow
                | VmError::Uncaught(_)
                | VmError::Internal(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("'break' outside of a loop")]
    BreakOutsideLoop,

    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,

    #[error("function '{0}' uses too many registers")]
    RegisterOverflow(String),

    #[error("function '{0}' has too many constants")]
    ConstantOverflow(String),

    #[error("function '{0}' captures too many upvalues")]
    UpvalueOverflow(String),

    #[error("jump exceeds the encodable range in '{0}'")]
    JumpTooFar(String),

    #[error("'export' requires a let or function declaration")]
    BadExport,

    #[error("invalid assignment target")]
    BadAssignTarget,
}

/// Top-level wrapper returned by the compile-and-run entry points.
#[derive(Debug, Error)]
pub enum SonaError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("runtime error: {0}")]
    Runtime(#[from] VmError),
}
