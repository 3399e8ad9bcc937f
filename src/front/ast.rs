//! The abstract syntax tree.
//!
//! The parser lives outside this crate; hosts construct these nodes and feed
//! them to [`crate::middle::lower`]. Keywords are locale-neutral at this
//! level: `если`/`if` both arrive as an [`StmtKind::If`].

use derive_more::Display;

use crate::back::value::Value;
use crate::common::Pos;
use crate::names::NameId;

/// A statement together with its source position.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub pos: Pos,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(pos: Pos, kind: StmtKind) -> Self {
        Stmt { pos, kind }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// A bare expression; its value is computed and discarded.
    Expr(Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        /// `иначеесли` arms, in order.
        elifs: Vec<(Expr, Vec<Stmt>)>,
        els: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        catch: Vec<Stmt>,
    },
    /// `для каждого var из collection`
    ForEach {
        var: NameId,
        collection: Expr,
        body: Vec<Stmt>,
    },
    /// `для var = from по to`
    ForNum {
        var: NameId,
        from: Expr,
        to: Expr,
        body: Vec<Stmt>,
    },
    /// `пока cond` — condition re-evaluated before every iteration.
    Loop {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Vec<Expr>),
    Throw(Expr),
    Module {
        name: NameId,
        body: Vec<Stmt>,
    },
    Switch {
        subject: Expr,
        cases: Vec<(Expr, Vec<Stmt>)>,
        default: Option<Vec<Stmt>>,
    },
    /// Channel select; every non-default case must be an [`ExprKind::Chan`].
    Select {
        cases: Vec<(Expr, Vec<Stmt>)>,
        default: Option<Vec<Stmt>>,
    },
    /// Pairwise assignment `lhs₁, lhs₂ = rhs₁, rhs₂`.
    Assign {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    /// Declaration; each name is (re)bound to `Неопределено`.
    Var {
        names: Vec<NameId>,
    },
}

/// An expression together with its source position.
#[derive(Debug, Clone)]
pub struct Expr {
    pub pos: Pos,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(pos: Pos, kind: ExprKind) -> Self {
        Expr { pos, kind }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// An opaque, already-boxed host value.
    Native(Value),
    /// A numeric literal, still in its textual form.
    Num(String),
    Str(String),
    /// A constant name: `истина`, `ложь`, `null`, `неопределено`
    /// (case-insensitive).
    Const(String),
    Array(Vec<Expr>),
    /// String-keyed map constructor.
    MapLit(Vec<(String, Expr)>),
    Ident {
        id: NameId,
        /// Original source text; a dot marks a qualified name.
        text: String,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Addr(Box<Expr>),
    Deref(Box<Expr>),
    Paren(Box<Expr>),
    Binary {
        /// Textual operator, e.g. `"+"`, `"<>"`, `"или"`.
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// A named call; `name` is never [`crate::names::NO_NAME`] here.
    Call {
        name: NameId,
        args: Vec<Expr>,
        /// The single argument is a slice to be spread into the call.
        var_arg: bool,
        /// Execute the call as a new concurrent activation.
        go: bool,
    },
    /// A call through a function-valued expression.
    AnonCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
        var_arg: bool,
        go: bool,
    },
    Member {
        expr: Box<Expr>,
        name: NameId,
    },
    Item {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        expr: Box<Expr>,
        begin: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    /// Function literal.
    Func {
        name: NameId,
        params: Vec<NameId>,
        /// Trailing parameter collects the remaining arguments as a slice.
        var_arg: bool,
        body: Vec<Stmt>,
    },
    /// Type conversion; exactly one of `type_name`/`type_expr` is meaningful.
    Cast {
        expr: Box<Expr>,
        type_name: NameId,
        type_expr: Option<Box<Expr>>,
    },
    Make {
        type_name: NameId,
        type_expr: Option<Box<Expr>>,
    },
    MakeChan {
        /// Buffer capacity; absent means unbuffered.
        size: Option<Box<Expr>>,
    },
    MakeArr {
        len: Box<Expr>,
        cap: Option<Box<Expr>>,
    },
    /// `lhs <- rhs`: send when `lhs` is a channel, receive into `lhs`
    /// (or just receive, when absent) otherwise.
    Chan {
        lhs: Option<Box<Expr>>,
        rhs: Box<Expr>,
    },
    /// Key-value association; only valid where a construct consumes it.
    Assoc {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum UnaryOp {
    #[display("-")]
    Neg,
    #[display("!")]
    Not,
    #[display("^")]
    BitNot,
}
