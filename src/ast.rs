/// AST contract consumed by the bytecode compiler.
///
/// The lexer and parser live outside this crate; embedders hand the
/// compiler a `Vec<Stmt>` built from whatever front end they use. The
/// constructor helpers at the bottom keep programmatic construction
/// terse (they are what the integration tests use).

#[derive(Debug, Clone)]
pub enum Stmt {
    Let { name: String, value: Option<Expr> },
    Assign { name: String, value: Expr },
    IndexAssign { object: Expr, index: Expr, value: Expr },
    Expr(Expr),
    Print(Expr),
    Function { name: String, params: Vec<String>, body: Vec<Stmt> },
    Return(Option<Expr>),
    If { cond: Expr, then_body: Vec<Stmt>, else_body: Option<Vec<Stmt>> },
    While { cond: Expr, body: Vec<Stmt> },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForIn { var: String, iterable: Expr, body: Vec<Stmt> },
    Break,
    Continue,
    Import { path: String, alias: Option<String> },
    /// Wraps a `Let` or `Function`; the defined name is re-exported from
    /// the current module.
    Export(Box<Stmt>),
    Try {
        body: Vec<Stmt>,
        catch_var: String,
        catch_body: Vec<Stmt>,
        finally: Option<Vec<Stmt>>,
    },
    Throw(Expr),
    Class {
        name: String,
        parent: Option<String>,
        fields: Vec<(String, Expr)>,
        methods: Vec<MethodDef>,
    },
    Match { expr: Expr, arms: Vec<MatchArm> },
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(Lit),
    Wildcard,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Lit),
    Variable(String),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    Logical { op: LogOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Array(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Index { object: Box<Expr>, index: Box<Expr> },
    Property { object: Box<Expr>, name: String },
    Lambda { params: Vec<String>, body: LambdaBody },
    Assign { target: Box<Expr>, value: Box<Expr> },
    If { cond: Box<Expr>, then_expr: Box<Expr>, else_expr: Box<Expr> },
    Interpolation(Vec<StrPart>),
    /// A statement block in expression position; yields nil.
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone)]
pub enum LambdaBody {
    /// `fn(x) => expr` — the expression is the return value.
    Expr(Box<Expr>),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone)]
pub enum StrPart {
    Lit(String),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum Lit {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

impl Expr {
    pub fn int(n: i64) -> Expr {
        Expr::Literal(Lit::Int(n))
    }

    pub fn float(n: f64) -> Expr {
        Expr::Literal(Lit::Float(n))
    }

    pub fn str(s: impl Into<String>) -> Expr {
        Expr::Literal(Lit::Str(s.into()))
    }

    pub fn boolean(b: bool) -> Expr {
        Expr::Literal(Lit::Bool(b))
    }

    pub fn nil() -> Expr {
        Expr::Literal(Lit::Nil)
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Variable(name.into())
    }

    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn logical(op: LogOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Logical { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        Expr::Unary { op, operand: Box::new(operand) }
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call { callee: Box::new(callee), args }
    }

    /// Call a named global: `name(args...)`.
    pub fn call_named(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::call(Expr::var(name), args)
    }

    pub fn index(object: Expr, index: Expr) -> Expr {
        Expr::Index { object: Box::new(object), index: Box::new(index) }
    }

    pub fn prop(object: Expr, name: impl Into<String>) -> Expr {
        Expr::Property { object: Box::new(object), name: name.into() }
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        Expr::Assign { target: Box::new(target), value: Box::new(value) }
    }
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Stmt {
        Stmt::Let { name: name.into(), value: Some(value) }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Stmt {
        Stmt::Assign { name: name.into(), value }
    }

    pub fn print(e: Expr) -> Stmt {
        Stmt::Print(e)
    }

    pub fn func(name: impl Into<String>, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::Function {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        }
    }

    pub fn ret(e: Expr) -> Stmt {
        Stmt::Return(Some(e))
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::While { cond, body }
    }

    pub fn if_(cond: Expr, then_body: Vec<Stmt>) -> Stmt {
        Stmt::If { cond, then_body, else_body: None }
    }

    pub fn if_else(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
        Stmt::If { cond, then_body, else_body: Some(else_body) }
    }
}
