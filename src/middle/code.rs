//! The register bytecode.
//!
//! A compilation unit is a flat instruction sequence. Registers are plain
//! indexes into a grow-on-demand register file; labels are symbolic jump
//! targets resolved to instruction indexes by [`Code::link`] before
//! execution. Nested units (module bodies, function literals) are separate,
//! already-linked [`Code`] values carried inside their defining instruction.

use derive_more::Display;
use std::fmt;
use std::sync::Arc;

use crate::back::value::Value;
use crate::common::{Map, Pos};
use crate::names::{self, NameId};

use super::lower::CompileError;

/// A register number within an activation frame.
pub type Reg = usize;

/// A label id, unique within a whole compilation (nested units included).
pub type Label = usize;

/// A literal payload of a `LOAD`.
#[derive(Debug, Clone)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// A type name to be resolved against the environment's type registry.
    TypeName(NameId),
    /// An opaque host value from a native AST literal.
    Native(Value),
}

/// One instruction, annotated with the source position it was lowered from.
#[derive(Debug, Clone)]
pub struct Instr {
    pub pos: Pos,
    pub op: Op,
}

/// The opcode set.
#[derive(Debug, Clone)]
pub enum Op {
    // data movement
    Load { reg: Reg, val: Literal },
    Mv { from: Reg, to: Reg },
    Get { reg: Reg, id: NameId, dotted: bool },
    Set { reg: Reg, id: NameId },
    CastNum { reg: Reg },
    CastType { reg: Reg, ty: Reg },
    /// Resolve a string value in `reg` to a type descriptor in place.
    SetName { reg: Reg },

    // arithmetic / logic
    Unary { reg: Reg, op: crate::front::ast::UnaryOp },
    Addr { reg: Reg },
    Unref { reg: Reg },
    /// `lhs ← lhs op rhs`
    Oper { lhs: Reg, rhs: Reg, op: BinOp },
    Equal { dst: Reg, lhs: Reg, rhs: Reg },

    // aggregate construction / access
    MakeSlice { reg: Reg, len: usize, cap: usize },
    MakeMap { reg: Reg, len: usize },
    MakeArr { reg: Reg, cap: Reg },
    MakeChan { reg: Reg },
    Make { reg: Reg },
    SetIdx { reg: Reg, index: usize, val: Reg },
    SetKey { reg: Reg, key: Arc<str>, val: Reg },
    /// Mirror of `GetIdx`: store through a computed index.
    SetItem { reg: Reg, index: Reg, val: Reg },
    GetIdx { reg: Reg, index: Reg },
    GetSubslice { reg: Reg, begin: Reg, end: Reg },
    GetMember { reg: Reg, name: NameId },
    /// Mirror of `GetMember`: store through the member protocol.
    SetMember { reg: Reg, name: NameId, val: Reg },

    // control flow
    Label(Label),
    Jmp(Label),
    JTrue { reg: Reg, to: Label },
    JFalse { reg: Reg, to: Label },

    // loop framing
    ForEach { reg: Reg, iter: Reg, brk: Label },
    Next { reg: Reg, iter: Reg, val: Reg, end: Label },
    ForNum { reg: Reg, from: Reg, to: Reg, brk: Label },
    NextNum { reg: Reg, end: Label },
    While { reg: Reg, brk: Label },
    PopFor { reg: Reg },
    Break,
    Continue,

    // exceptions
    Try { reg: Reg },
    Catch { reg: Reg, end: Label },
    PopTry { reg: Reg },
    Throw { reg: Reg },

    // calls / returns
    Call { name: NameId, num_args: usize, args: Reg, var_arg: bool, go: bool },
    Ret { reg: Reg },

    // modules / closures
    Module { name: NameId, code: Arc<Code> },
    Func {
        reg: Reg,
        name: NameId,
        code: Arc<Code>,
        params: Arc<[NameId]>,
        var_arg: bool,
        return_to: Label,
    },

    // channel select
    TrySend { chan: Reg, val: Reg, ok: Reg },
    TryRecv { chan: Reg, val: Reg, ok: Reg },
    GoShed,

    // diagnostics
    Error { message: String },
}

/// Strict (non-short-circuit) binary operators carried by `OPER`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum BinOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("%")]
    Mod,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("&")]
    BitAnd,
    #[display("|")]
    BitOr,
    #[display("^")]
    BitXor,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
}

/// A linked compilation unit: instructions plus the resolved label table and
/// the `TRY` → `CATCH` pairing.
#[derive(Debug)]
pub struct Code {
    pub instrs: Vec<Instr>,
    /// label id → instruction index of its `LABEL`
    pub labels: Map<Label, usize>,
    /// instruction index of a `TRY` → instruction index of its `CATCH`
    pub catches: Map<usize, usize>,
}

impl Code {
    /// Resolves labels and pairs try/catch. Fails when a label is emitted
    /// twice, a jump references a label the unit never emits, or the
    /// `TRY`/`CATCH` nesting is unbalanced.
    pub fn link(instrs: Vec<Instr>) -> Result<Code, CompileError> {
        let mut labels = Map::new();
        let mut catches = Map::new();
        let mut open_tries = Vec::new();
        for (ip, instr) in instrs.iter().enumerate() {
            match instr.op {
                Op::Label(l) => {
                    if labels.insert(l, ip).is_some() {
                        return Err(CompileError::DuplicateLabel(l));
                    }
                }
                Op::Try { .. } => open_tries.push(ip),
                Op::Catch { .. } => {
                    let try_ip = open_tries.pop().ok_or(CompileError::UnmatchedCatch)?;
                    catches.insert(try_ip, ip);
                }
                _ => {}
            }
        }
        if !open_tries.is_empty() {
            return Err(CompileError::UnmatchedTry);
        }
        for instr in &instrs {
            for l in instr.op.referenced_labels() {
                if !labels.contains_key(&l) {
                    return Err(CompileError::UnknownLabel(l));
                }
            }
        }
        Ok(Code { instrs, labels, catches })
    }
}

impl Op {
    /// Labels this instruction may transfer control to.
    pub fn referenced_labels(&self) -> Vec<Label> {
        use Op::*;
        match *self {
            Jmp(l) => vec![l],
            JTrue { to, .. } | JFalse { to, .. } => vec![to],
            ForEach { brk, .. } | ForNum { brk, .. } | While { brk, .. } => vec![brk],
            Next { end, .. } | NextNum { end, .. } => vec![end],
            Catch { end, .. } => vec![end],
            Func { return_to, .. } => vec![return_to],
            _ => vec![],
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Op::*;
        match self {
            Load { reg, val } => write!(f, "load r{reg}, {val:?}"),
            Mv { from, to } => write!(f, "mv r{from}, r{to}"),
            Get { reg, id, dotted } => {
                write!(f, "get r{reg}, {}{}", names::get(*id), if *dotted { " (.)" } else { "" })
            }
            Set { reg, id } => write!(f, "set r{reg}, {}", names::get(*id)),
            CastNum { reg } => write!(f, "castnum r{reg}"),
            CastType { reg, ty } => write!(f, "casttype r{reg}, r{ty}"),
            SetName { reg } => write!(f, "setname r{reg}"),
            Unary { reg, op } => write!(f, "unary r{reg}, {op}"),
            Addr { reg } => write!(f, "addr r{reg}"),
            Unref { reg } => write!(f, "unref r{reg}"),
            Oper { lhs, rhs, op } => write!(f, "oper r{lhs}, r{rhs}, {op}"),
            Equal { dst, lhs, rhs } => write!(f, "equal r{dst}, r{lhs}, r{rhs}"),
            MakeSlice { reg, len, cap } => write!(f, "makeslice r{reg}, {len}, {cap}"),
            MakeMap { reg, len } => write!(f, "makemap r{reg}, {len}"),
            MakeArr { reg, cap } => write!(f, "makearr r{reg}, r{cap}"),
            MakeChan { reg } => write!(f, "makechan r{reg}"),
            Make { reg } => write!(f, "make r{reg}"),
            SetIdx { reg, index, val } => write!(f, "setidx r{reg}[{index}], r{val}"),
            SetKey { reg, key, val } => write!(f, "setkey r{reg}[{key:?}], r{val}"),
            SetItem { reg, index, val } => write!(f, "setitem r{reg}[r{index}], r{val}"),
            GetIdx { reg, index } => write!(f, "getidx r{reg}, r{index}"),
            GetSubslice { reg, begin, end } => write!(f, "getsubslice r{reg}, r{begin}, r{end}"),
            GetMember { reg, name } => write!(f, "getmember r{reg}, {}", names::get(*name)),
            SetMember { reg, name, val } => {
                write!(f, "setmember r{reg}, {}, r{val}", names::get(*name))
            }
            Label(l) => write!(f, "L{l}:"),
            Jmp(l) => write!(f, "jmp L{l}"),
            JTrue { reg, to } => write!(f, "jtrue r{reg}, L{to}"),
            JFalse { reg, to } => write!(f, "jfalse r{reg}, L{to}"),
            ForEach { reg, iter, brk } => write!(f, "foreach r{reg}, r{iter}, L{brk}"),
            Next { reg, iter, val, end } => write!(f, "next r{reg}, r{iter}, r{val}, L{end}"),
            ForNum { reg, from, to, brk } => write!(f, "fornum r{reg}, r{from}, r{to}, L{brk}"),
            NextNum { reg, end } => write!(f, "nextnum r{reg}, L{end}"),
            While { reg, brk } => write!(f, "while r{reg}, L{brk}"),
            PopFor { reg } => write!(f, "popfor r{reg}"),
            Break => write!(f, "break"),
            Continue => write!(f, "continue"),
            Try { reg } => write!(f, "try r{reg}"),
            Catch { reg, end } => write!(f, "catch r{reg}, L{end}"),
            PopTry { reg } => write!(f, "poptry r{reg}"),
            Throw { reg } => write!(f, "throw r{reg}"),
            Call { name, num_args, args, var_arg, go } => write!(
                f,
                "call {}, {num_args}, r{args}{}{}",
                if *name == names::NO_NAME { "<анонимная>".into() } else { names::get(*name).to_string() },
                if *var_arg { ", vararg" } else { "" },
                if *go { ", go" } else { "" },
            ),
            Ret { reg } => write!(f, "ret r{reg}"),
            Module { name, code } => {
                write!(f, "module {}, <{} инстр.>", names::get(*name), code.instrs.len())
            }
            Func { reg, name, code, .. } => {
                write!(f, "func r{reg}, {}, <{} инстр.>", names::get(*name), code.instrs.len())
            }
            TrySend { chan, val, ok } => write!(f, "trysend r{chan}, r{val}, r{ok}"),
            TryRecv { chan, val, ok } => write!(f, "tryrecv r{chan}, r{val}, r{ok}"),
            GoShed => write!(f, "goshed"),
            Error { message } => write!(f, "error {message:?}"),
        }
    }
}
