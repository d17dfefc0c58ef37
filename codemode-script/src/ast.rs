//! Syntax tree produced by the parser.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<Handler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    Raise(Option<Expr>),
    Return(Option<Expr>),
    FunctionDef(Arc<FunctionDef>),
    Import(Vec<(String, Option<String>)>),
    ImportFrom {
        module: String,
        names: Vec<(String, Option<String>)>,
    },
    Delete(Vec<Target>),
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Pass,
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Handler {
    pub types: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Name(String),
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Tuple(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

impl Expr {
    const fn placeholder() -> Self {
        Self {
            kind: ExprKind::Literal(Literal::None),
            line: 0,
        }
    }

    fn take(slot: &mut Self) -> Self {
        std::mem::replace(slot, Self::placeholder())
    }
}

// Operator and postfix chains nest one level per operand, so trees are torn
// down from a worklist instead of through recursive drop glue.
impl Drop for Expr {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.kind.take_children(&mut pending);
        while let Some(mut expr) = pending.pop() {
            expr.kind.take_children(&mut pending);
        }
    }
}

impl ExprKind {
    /// Moves every directly nested expression into `out`.
    fn take_children(&mut self, out: &mut Vec<Expr>) {
        let mut boxed = |slot: &mut Box<Expr>| out.push(Expr::take(slot));
        match self {
            Self::Literal(_) | Self::Name(_) | Self::Lambda(_) => {}
            Self::FString(parts) => {
                for part in parts.drain(..) {
                    if let FStringPart::Field { expr, .. } = part {
                        out.push(expr);
                    }
                }
            }
            Self::List(items) | Self::Tuple(items) => out.append(items),
            Self::Dict(pairs) => {
                for (key, value) in pairs.drain(..) {
                    out.push(key);
                    out.push(value);
                }
            }
            Self::ListComp { elt, generators } => {
                boxed(elt);
                take_generators(generators, out);
            }
            Self::DictComp {
                key,
                value,
                generators,
            } => {
                boxed(key);
                boxed(value);
                take_generators(generators, out);
            }
            Self::BinOp { left, right, .. } | Self::BoolOp { left, right, .. } => {
                boxed(left);
                boxed(right);
            }
            Self::Unary { operand, .. } => boxed(operand),
            Self::Await(inner) => boxed(inner),
            Self::Compare { left, ops } => {
                boxed(left);
                out.extend(ops.drain(..).map(|(_, expr)| expr));
            }
            Self::IfExp { test, body, orelse } => {
                boxed(test);
                boxed(body);
                boxed(orelse);
            }
            Self::Call { func, args } => {
                boxed(func);
                out.extend(args.drain(..).map(|arg| match arg {
                    Arg::Positional(expr)
                    | Arg::Keyword(_, expr)
                    | Arg::Star(expr)
                    | Arg::DoubleStar(expr) => expr,
                }));
            }
            Self::Attribute { value, .. } => boxed(value),
            Self::Subscript { value, index } => {
                boxed(value);
                boxed(index);
            }
            Self::Slice { lower, upper, step } => {
                for slot in [lower, upper, step].into_iter().flatten() {
                    boxed(slot);
                }
            }
        }
    }
}

fn take_generators(generators: &mut Vec<Comprehension>, out: &mut Vec<Expr>) {
    for generator in generators.drain(..) {
        let Comprehension {
            iter, conditions, ..
        } = generator;
        out.push(iter);
        out.extend(conditions);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FStringPart {
    Text(String),
    Field {
        expr: Expr,
        conversion: Option<char>,
        spec: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Comprehension {
    pub target: Target,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
    Star(Expr),
    DoubleStar(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExprKind {
    Literal(Literal),
    FString(Vec<FStringPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    ListComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Arg>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Await(Box<Expr>),
    Lambda(Arc<FunctionDef>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub(crate) const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub(crate) const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtE => "<=",
            Self::Gt => ">",
            Self::GtE => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
        }
    }
}
