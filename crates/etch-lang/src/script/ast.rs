use std::sync::Arc;

use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Instanceof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Compound(BinaryOp),
    Logical(LogicalOp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: SmolStr,
    pub default: Option<Expr>,
    pub rest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<SmolStr>,
    pub params: Vec<Param>,
    pub body: FunctionBody,
    pub arrow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    Static(SmolStr),
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    KeyValue(PropertyKey, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSegment {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(SmolStr),
    Template(Vec<TemplateSegment>),
    Bool(bool),
    Null,
    Ident(SmolStr),
    Array(Vec<Expr>),
    Object(Vec<Property>),
    Spread(Box<Expr>),
    Member {
        object: Box<Expr>,
        property: SmolStr,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        optional: bool,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Function(Arc<FunctionDef>),
    Unary(UnaryOp, Box<Expr>),
    Await(Box<Expr>),
    Update {
        increment: bool,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Ident(_)
                | Expr::Member { optional: false, .. }
                | Expr::Index { optional: false, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForTarget {
    Declare(DeclKind, SmolStr),
    Assign(SmolStr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Declare(DeclKind, Vec<(SmolStr, Option<Expr>)>),
    Function(Arc<FunctionDef>),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    Block(Vec<Stmt>),
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ForOf {
        target: ForTarget,
        iterable: Expr,
        body: Box<Stmt>,
    },
    ForIn {
        target: ForTarget,
        object: Expr,
        body: Box<Stmt>,
    },
    While(Expr, Box<Stmt>),
    Break,
    Continue,
    Return(Option<Expr>),
    Throw(Expr),
    Empty,
    /// Append literal template text.
    Literal(String),
    /// Append the value of an output tag; `None` for an empty tag.
    Emit { expr: Option<Expr>, escape: bool },
    /// Record the template line for diagnostics.
    Line(u32),
}

/// Collects the names declared with `var` in `stmts`, not descending into
/// nested functions.
pub fn var_names(stmts: &[Stmt], names: &mut Vec<SmolStr>) {
    for stmt in stmts {
        match stmt {
            Stmt::Declare(DeclKind::Var, declarations) => {
                names.extend(declarations.iter().map(|(name, _)| name.clone()))
            }
            Stmt::If(_, consequent, alternate) => {
                var_names(std::slice::from_ref(consequent.as_ref()), names);
                if let Some(alternate) = alternate {
                    var_names(std::slice::from_ref(alternate.as_ref()), names);
                }
            }
            Stmt::Block(body) => var_names(body, names),
            Stmt::For { init, body, .. } => {
                if let Some(init) = init {
                    var_names(std::slice::from_ref(init.as_ref()), names);
                }
                var_names(std::slice::from_ref(body.as_ref()), names);
            }
            Stmt::ForOf { target, body, .. } | Stmt::ForIn { target, body, .. } => {
                if let ForTarget::Declare(DeclKind::Var, name) = target {
                    names.push(name.clone());
                }
                var_names(std::slice::from_ref(body.as_ref()), names);
            }
            Stmt::While(_, body) => var_names(std::slice::from_ref(body.as_ref()), names),
            _ => {}
        }
    }
}
