//! Lowering from the AST to the register bytecode.
//!
//! The compiler is purely syntax-directed: no type inference, no constant
//! folding, no dead code elimination. Each statement receives a base
//! register and may clobber `reg`, `reg+1`, `reg+2`, …; nested statements
//! receive an incremented base. Labels come from a single monotonic counter
//! threaded through the whole compilation, so they are unique across nested
//! units as well.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::common::Pos;
use crate::front::ast::{Expr, ExprKind, Stmt, StmtKind};
use crate::names::{self, NameId};

use super::code::{BinOp, Code, Instr, Label, Literal, Op, Reg};

/// Errors detected while lowering or linking. These are returned
/// synchronously and prevent execution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("{0}: недопустимая цель присваивания")]
    UnsupportedAssignTarget(Pos),
    #[error("{0}: присваивание диапазону не поддерживается")]
    SliceAssign(Pos),
    #[error("{pos}: число выражений слева ({lhs}) и справа ({rhs}) не совпадает")]
    AssignArity { pos: Pos, lhs: usize, rhs: usize },
    #[error("{0}: при выборе вариантов из каналов допустимы только выражения с каналами")]
    SelectCase(Pos),
    #[error("{0}: выражение-ассоциация здесь недопустимо")]
    AssocExpr(Pos),
    #[error("{pos}: неизвестный оператор '{op}'")]
    UnknownOperator { pos: Pos, op: String },
    #[error("метка L{0} определена повторно")]
    DuplicateLabel(Label),
    #[error("метка L{0} не определена")]
    UnknownLabel(Label),
    #[error("обработчик исключения без начала попытки")]
    UnmatchedCatch,
    #[error("попытка без обработчика исключения")]
    UnmatchedTry,
}

/// Compiles a statement list into a linked compilation unit.
pub fn lower(stmts: &[Stmt]) -> Result<Code, CompileError> {
    let mut lid = 0;
    let instrs = lower_stmts(stmts, 0, &mut lid)?;
    let code = Code::link(instrs)?;
    debug!(instrs = code.instrs.len(), labels = code.labels.len(), "компиляция завершена");
    Ok(code)
}

fn fresh(lid: &mut Label) -> Label {
    *lid += 1;
    *lid
}

fn emit(out: &mut Vec<Instr>, pos: Pos, op: Op) {
    out.push(Instr { pos, op });
}

fn lower_stmts(stmts: &[Stmt], reg: Reg, lid: &mut Label) -> Result<Vec<Instr>, CompileError> {
    let mut out = Vec::new();
    for st in stmts {
        lower_stmt(st, reg, lid, &mut out)?;
    }
    Ok(out)
}

fn lower_stmt(
    st: &Stmt,
    reg: Reg,
    lid: &mut Label,
    out: &mut Vec<Instr>,
) -> Result<(), CompileError> {
    let pos = st.pos;
    match &st.kind {
        StmtKind::Expr(e) => lower_expr(e, reg, lid, out)?,

        StmtKind::If { cond, then, elifs, els } => {
            let lend = fresh(lid);
            lower_expr(cond, reg, lid, out)?;
            let lf = fresh(lid);
            emit(out, pos, Op::JFalse { reg, to: lf });
            out.extend(lower_stmts(then, reg, lid)?);
            emit(out, pos, Op::Jmp(lend));
            emit(out, pos, Op::Label(lf));
            for (cond, body) in elifs {
                lower_expr(cond, reg, lid, out)?;
                // condition failed, on to the next arm
                let li = fresh(lid);
                emit(out, pos, Op::JFalse { reg, to: li });
                out.extend(lower_stmts(body, reg, lid)?);
                emit(out, pos, Op::Jmp(lend));
                emit(out, pos, Op::Label(li));
            }
            out.extend(lower_stmts(els, reg, lid)?);
            emit(out, pos, Op::Label(lend));
        }

        StmtKind::Try { body, catch } => {
            // `reg` tracks the error for the whole protected region
            emit(out, pos, Op::Try { reg });
            // the body must not clobber the error register
            out.extend(lower_stmts(body, reg + 1, lid)?);
            let lend = fresh(lid);
            emit(out, pos, Op::Catch { reg, end: lend });
            out.extend(lower_stmts(catch, reg, lid)?);
            emit(out, pos, Op::Label(lend));
            emit(out, pos, Op::PopTry { reg });
        }

        StmtKind::ForEach { var, collection, body } => {
            lower_expr(collection, reg, lid, out)?;
            let lend = fresh(lid);
            let regiter = reg + 1;
            let regval = reg + 2;
            let regsub = reg + 3;
            emit(out, pos, Op::ForEach { reg, iter: regiter, brk: lend });
            let li = fresh(lid);
            // `continue` re-enters here
            emit(out, pos, Op::Label(li));
            emit(out, pos, Op::Next { reg, iter: regiter, val: regval, end: lend });
            emit(out, pos, Op::Set { reg: regval, id: *var });
            out.extend(lower_stmts(body, regsub, lid)?);
            emit(out, pos, Op::Jmp(li));
            emit(out, pos, Op::Label(lend));
            emit(out, pos, Op::PopFor { reg });
        }

        StmtKind::ForNum { var, from, to, body } => {
            let regfrom = reg + 1;
            let regto = reg + 2;
            let regsub = reg + 3;
            lower_expr(from, regfrom, lid, out)?;
            lower_expr(to, regto, lid, out)?;
            let lend = fresh(lid);
            emit(out, pos, Op::ForNum { reg, from: regfrom, to: regto, brk: lend });
            let li = fresh(lid);
            emit(out, pos, Op::Label(li));
            emit(out, pos, Op::NextNum { reg, end: lend });
            emit(out, pos, Op::Set { reg, id: *var });
            out.extend(lower_stmts(body, regsub, lid)?);
            emit(out, pos, Op::Jmp(li));
            emit(out, pos, Op::Label(lend));
            emit(out, pos, Op::PopFor { reg });
        }

        StmtKind::Loop { cond, body } => {
            let lend = fresh(lid);
            let li = fresh(lid);
            emit(out, pos, Op::While { reg, brk: lend });
            emit(out, pos, Op::Label(li));
            lower_expr(cond, reg, lid, out)?;
            emit(out, pos, Op::JFalse { reg, to: lend });
            out.extend(lower_stmts(body, reg + 1, lid)?);
            emit(out, pos, Op::Jmp(li));
            emit(out, pos, Op::Label(lend));
            emit(out, pos, Op::PopFor { reg });
        }

        StmtKind::Break => emit(out, pos, Op::Break),
        StmtKind::Continue => emit(out, pos, Op::Continue),

        StmtKind::Return(exprs) => {
            match exprs.len() {
                0 => emit(out, pos, Op::Load { reg, val: Literal::Nil }),
                1 => lower_expr(&exprs[0], reg, lid, out)?,
                n => {
                    emit(out, pos, Op::MakeSlice { reg, len: n, cap: n });
                    for (i, e) in exprs.iter().enumerate() {
                        lower_expr(e, reg + 1, lid, out)?;
                        emit(out, e.pos, Op::SetIdx { reg, index: i, val: reg + 1 });
                    }
                }
            }
            emit(out, pos, Op::Ret { reg });
        }

        StmtKind::Throw(e) => {
            lower_expr(e, reg, lid, out)?;
            emit(out, pos, Op::Throw { reg });
        }

        StmtKind::Module { name, body } => {
            let code = Code::link(lower_stmts(body, 0, lid)?)?;
            emit(out, pos, Op::Module { name: *name, code: Arc::new(code) });
        }

        StmtKind::Switch { subject, cases, default } => {
            lower_expr(subject, reg, lid, out)?;
            let lend = fresh(lid);
            for (case, body) in cases {
                let li = fresh(lid);
                lower_expr(case, reg + 1, lid, out)?;
                emit(out, case.pos, Op::Equal { dst: reg + 2, lhs: reg, rhs: reg + 1 });
                emit(out, case.pos, Op::JFalse { reg: reg + 2, to: li });
                out.extend(lower_stmts(body, reg, lid)?);
                emit(out, case.pos, Op::Jmp(lend));
                emit(out, case.pos, Op::Label(li));
            }
            if let Some(body) = default {
                out.extend(lower_stmts(body, reg, lid)?);
            }
            emit(out, pos, Op::Label(lend));
        }

        StmtKind::Select { cases, default } => {
            let lstart = fresh(lid);
            emit(out, pos, Op::Label(lstart));
            let lend = fresh(lid);
            for (case, body) in cases {
                let li = fresh(lid);
                let ExprKind::Chan { lhs, rhs } = &case.kind else {
                    return Err(CompileError::SelectCase(case.pos));
                };
                lower_expr(rhs, reg, lid, out)?;
                match lhs {
                    None => {
                        // plain receive, value discarded
                        emit(out, rhs.pos, Op::TryRecv { chan: reg, val: reg + 1, ok: reg + 2 });
                        emit(out, pos, Op::JFalse { reg: reg + 2, to: li });
                    }
                    Some(lhs) => {
                        lower_expr(lhs, reg + 1, lid, out)?;
                        // left side is a channel: send the right value into it
                        emit(out, lhs.pos, Op::TrySend { chan: reg + 1, val: reg, ok: reg + 2 });
                        let li2 = fresh(lid);
                        emit(out, pos, Op::JTrue { reg: reg + 2, to: li2 });
                        // otherwise the right side is the channel and the left
                        // side receives the value
                        emit(out, rhs.pos, Op::TryRecv { chan: reg, val: reg + 1, ok: reg + 2 });
                        emit(out, pos, Op::JFalse { reg: reg + 2, to: li });
                        lower_assign(lhs, reg + 1, lid, out)?;
                        emit(out, pos, Op::Label(li2));
                    }
                }
                out.extend(lower_stmts(body, reg, lid)?);
                emit(out, pos, Op::Jmp(lend));
                emit(out, pos, Op::Label(li));
            }
            match default {
                Some(body) => out.extend(lower_stmts(body, reg, lid)?),
                None => {
                    // nothing ready: let other activations run, then re-poll
                    emit(out, pos, Op::GoShed);
                    emit(out, pos, Op::Jmp(lstart));
                }
            }
            emit(out, pos, Op::Label(lend));
        }

        StmtKind::Assign { lhs, rhs } => {
            if lhs.len() != rhs.len() {
                return Err(CompileError::AssignArity { pos, lhs: lhs.len(), rhs: rhs.len() });
            }
            for (l, r) in lhs.iter().zip(rhs) {
                lower_expr(r, reg, lid, out)?;
                lower_assign(l, reg, lid, out)?;
            }
        }

        StmtKind::Var { names } => {
            for id in names {
                emit(out, pos, Op::Load { reg, val: Literal::Nil });
                emit(out, pos, Op::Set { reg, id: *id });
            }
        }
    }
    Ok(())
}

/// Stores the value held in `reg` through an assignment target.
fn lower_assign(
    target: &Expr,
    reg: Reg,
    lid: &mut Label,
    out: &mut Vec<Instr>,
) -> Result<(), CompileError> {
    let pos = target.pos;
    match &target.kind {
        ExprKind::Ident { id, .. } => emit(out, pos, Op::Set { reg, id: *id }),
        ExprKind::Paren(inner) => lower_assign(inner, reg, lid, out)?,
        ExprKind::Member { expr, name } => {
            lower_expr(expr, reg + 1, lid, out)?;
            emit(out, pos, Op::SetMember { reg: reg + 1, name: *name, val: reg });
        }
        ExprKind::Item { expr, index } => {
            lower_expr(expr, reg + 1, lid, out)?;
            lower_expr(index, reg + 2, lid, out)?;
            emit(out, pos, Op::SetItem { reg: reg + 1, index: reg + 2, val: reg });
        }
        ExprKind::Slice { .. } => return Err(CompileError::SliceAssign(pos)),
        _ => return Err(CompileError::UnsupportedAssignTarget(pos)),
    }
    Ok(())
}

fn binop_of(op: &str) -> Option<BinOp> {
    Some(match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Mod,
        "==" | "=" => BinOp::Eq,
        "!=" | "<>" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "&" => BinOp::BitAnd,
        "|" => BinOp::BitOr,
        "^" => BinOp::BitXor,
        "<<" => BinOp::Shl,
        ">>" => BinOp::Shr,
        _ => return None,
    })
}

fn lower_expr(
    expr: &Expr,
    reg: Reg,
    lid: &mut Label,
    out: &mut Vec<Instr>,
) -> Result<(), CompileError> {
    let pos = expr.pos;
    match &expr.kind {
        ExprKind::Native(v) => {
            emit(out, pos, Op::Load { reg, val: Literal::Native(v.clone()) });
        }
        ExprKind::Num(lit) => {
            // load the text, convert in place
            emit(out, pos, Op::Load { reg, val: Literal::Str(lit.as_str().into()) });
            emit(out, pos, Op::CastNum { reg });
        }
        ExprKind::Str(s) => {
            emit(out, pos, Op::Load { reg, val: Literal::Str(s.as_str().into()) });
        }
        ExprKind::Const(name) => {
            let val = match name.to_lowercase().as_str() {
                "истина" => Literal::Bool(true),
                "ложь" => Literal::Bool(false),
                _ => Literal::Nil,
            };
            emit(out, pos, Op::Load { reg, val });
        }
        ExprKind::Array(exprs) => {
            let n = exprs.len();
            emit(out, pos, Op::MakeSlice { reg, len: n, cap: n });
            for (i, e) in exprs.iter().enumerate() {
                // each element lands one register above the slice
                lower_expr(e, reg + 1, lid, out)?;
                emit(out, e.pos, Op::SetIdx { reg, index: i, val: reg + 1 });
            }
        }
        ExprKind::MapLit(entries) => {
            emit(out, pos, Op::MakeMap { reg, len: entries.len() });
            for (k, e) in entries {
                lower_expr(e, reg + 1, lid, out)?;
                emit(out, e.pos, Op::SetKey { reg, key: k.as_str().into(), val: reg + 1 });
            }
        }
        ExprKind::Ident { id, text } => {
            emit(out, pos, Op::Get { reg, id: *id, dotted: text.contains('.') });
        }
        ExprKind::Unary { op, expr } => {
            lower_expr(expr, reg, lid, out)?;
            emit(out, pos, Op::Unary { reg, op: *op });
        }
        ExprKind::Addr(e) => {
            lower_expr(e, reg, lid, out)?;
            emit(out, pos, Op::Addr { reg });
        }
        ExprKind::Deref(e) => {
            lower_expr(e, reg, lid, out)?;
            emit(out, pos, Op::Unref { reg });
        }
        ExprKind::Paren(e) => lower_expr(e, reg, lid, out)?,
        ExprKind::Binary { op, lhs, rhs } => {
            lower_expr(lhs, reg, lid, out)?;
            match op.to_lowercase().as_str() {
                "||" | "или" => {
                    // left is truthy: keep it, skip the right side
                    let lab = fresh(lid);
                    emit(out, pos, Op::JTrue { reg, to: lab });
                    lower_expr(rhs, reg, lid, out)?;
                    emit(out, pos, Op::Label(lab));
                }
                "&&" | "и" => {
                    // left is falsy: keep it, skip the right side
                    let lab = fresh(lid);
                    emit(out, pos, Op::JFalse { reg, to: lab });
                    lower_expr(rhs, reg, lid, out)?;
                    emit(out, pos, Op::Label(lab));
                }
                low => {
                    let Some(bin) = binop_of(low) else {
                        return Err(CompileError::UnknownOperator { pos, op: op.clone() });
                    };
                    lower_expr(rhs, reg + 1, lid, out)?;
                    emit(out, pos, Op::Oper { lhs: reg, rhs: reg + 1, op: bin });
                }
            }
        }
        ExprKind::Ternary { cond, then, els } => {
            lower_expr(cond, reg, lid, out)?;
            let lab = fresh(lid);
            emit(out, pos, Op::JFalse { reg, to: lab });
            lower_expr(then, reg, lid, out)?;
            let lend = fresh(lid);
            emit(out, pos, Op::Jmp(lend));
            emit(out, pos, Op::Label(lab));
            lower_expr(els, reg, lid, out)?;
            emit(out, pos, Op::Label(lend));
        }
        ExprKind::Call { name, args, var_arg, go } => {
            lower_call(pos, *name, args, *var_arg, *go, reg, 0, lid, out)?;
        }
        ExprKind::AnonCall { callee, args, var_arg, go } => {
            // the callee itself occupies the base register
            lower_expr(callee, reg, lid, out)?;
            lower_call(pos, names::NO_NAME, args, *var_arg, *go, reg, 1, lid, out)?;
        }
        ExprKind::Member { expr, name } => {
            lower_expr(expr, reg, lid, out)?;
            emit(out, pos, Op::GetMember { reg, name: *name });
        }
        ExprKind::Item { expr, index } => {
            lower_expr(expr, reg, lid, out)?;
            lower_expr(index, reg + 1, lid, out)?;
            emit(out, pos, Op::GetIdx { reg, index: reg + 1 });
        }
        ExprKind::Slice { expr, begin, end } => {
            lower_expr(expr, reg, lid, out)?;
            match begin {
                Some(b) => lower_expr(b, reg + 1, lid, out)?,
                None => emit(out, pos, Op::Load { reg: reg + 1, val: Literal::Nil }),
            }
            match end {
                Some(e) => lower_expr(e, reg + 2, lid, out)?,
                None => emit(out, pos, Op::Load { reg: reg + 2, val: Literal::Nil }),
            }
            emit(out, pos, Op::GetSubslice { reg, begin: reg + 1, end: reg + 2 });
        }
        ExprKind::Func { name, params, var_arg, body } => {
            let lend = fresh(lid);
            let code = Code::link(lower_stmts(body, 0, lid)?)?;
            emit(
                out,
                pos,
                Op::Func {
                    reg,
                    name: *name,
                    code: Arc::new(code),
                    params: params.as_slice().into(),
                    var_arg: *var_arg,
                    return_to: lend,
                },
            );
            emit(out, pos, Op::Label(lend));
        }
        ExprKind::Cast { expr, type_name, type_expr } => {
            lower_expr(expr, reg, lid, out)?;
            match type_expr {
                None => {
                    emit(out, pos, Op::Load { reg: reg + 1, val: Literal::TypeName(*type_name) })
                }
                Some(te) => {
                    lower_expr(te, reg + 1, lid, out)?;
                    emit(out, pos, Op::SetName { reg: reg + 1 });
                }
            }
            emit(out, pos, Op::CastType { reg, ty: reg + 1 });
        }
        ExprKind::Make { type_name, type_expr } => {
            match type_expr {
                None => emit(out, pos, Op::Load { reg, val: Literal::TypeName(*type_name) }),
                Some(te) => {
                    lower_expr(te, reg, lid, out)?;
                    emit(out, pos, Op::SetName { reg });
                }
            }
            emit(out, pos, Op::Make { reg });
        }
        ExprKind::MakeChan { size } => {
            match size {
                None => emit(out, pos, Op::Load { reg, val: Literal::Int(0) }),
                Some(sz) => lower_expr(sz, reg, lid, out)?,
            }
            emit(out, pos, Op::MakeChan { reg });
        }
        ExprKind::MakeArr { len, cap } => {
            lower_expr(len, reg, lid, out)?;
            match cap {
                None => emit(out, pos, Op::Mv { from: reg, to: reg + 1 }),
                Some(c) => lower_expr(c, reg + 1, lid, out)?,
            }
            emit(out, pos, Op::MakeArr { reg, cap: reg + 1 });
        }
        ExprKind::Chan { lhs, rhs } => match lhs {
            None => {
                // receive: poll until the channel completes the operation
                lower_expr(rhs, reg, lid, out)?;
                let lstart = fresh(lid);
                let ldone = fresh(lid);
                emit(out, pos, Op::Label(lstart));
                emit(out, pos, Op::TryRecv { chan: reg, val: reg + 1, ok: reg + 2 });
                emit(out, pos, Op::JTrue { reg: reg + 2, to: ldone });
                emit(out, pos, Op::GoShed);
                emit(out, pos, Op::Jmp(lstart));
                emit(out, pos, Op::Label(ldone));
                emit(out, pos, Op::Mv { from: reg + 1, to: reg });
            }
            Some(lhs) => {
                // send: value in `reg`, channel in `reg+1`
                lower_expr(rhs, reg, lid, out)?;
                lower_expr(lhs, reg + 1, lid, out)?;
                let lstart = fresh(lid);
                let ldone = fresh(lid);
                emit(out, pos, Op::Label(lstart));
                emit(out, pos, Op::TrySend { chan: reg + 1, val: reg, ok: reg + 2 });
                emit(out, pos, Op::JTrue { reg: reg + 2, to: ldone });
                emit(out, pos, Op::GoShed);
                emit(out, pos, Op::Jmp(lstart));
                emit(out, pos, Op::Label(ldone));
            }
        },
        ExprKind::Assoc { .. } => return Err(CompileError::AssocExpr(pos)),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn lower_call(
    pos: Pos,
    name: NameId,
    args: &[Expr],
    var_arg: bool,
    go: bool,
    reg: Reg,
    regoff: Reg,
    lid: &mut Label,
    out: &mut Vec<Instr>,
) -> Result<(), CompileError> {
    if args.len() <= 7 {
        // arguments go into a run of registers above the base
        for (i, a) in args.iter().enumerate() {
            lower_expr(a, reg + regoff + i, lid, out)?;
        }
    } else {
        // too many: pack them into a slice at the first argument register
        let n = args.len();
        emit(out, pos, Op::MakeSlice { reg: reg + regoff, len: n, cap: n });
        for (i, a) in args.iter().enumerate() {
            lower_expr(a, reg + regoff + 1, lid, out)?;
            emit(out, a.pos, Op::SetIdx { reg: reg + regoff, index: i, val: reg + regoff + 1 });
        }
    }
    emit(out, pos, Op::Call { name, num_args: args.len(), args: reg, var_arg, go });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::ast::UnaryOp;

    fn e(kind: ExprKind) -> Expr {
        Expr::new(Pos::default(), kind)
    }

    fn s(kind: StmtKind) -> Stmt {
        Stmt::new(Pos::default(), kind)
    }

    fn ident(name: &str) -> Expr {
        e(ExprKind::Ident { id: names::set(name), text: name.to_string() })
    }

    fn num(lit: &str) -> Expr {
        e(ExprKind::Num(lit.to_string()))
    }

    fn assign(name: &str, value: Expr) -> Stmt {
        s(StmtKind::Assign { lhs: vec![ident(name)], rhs: vec![value] })
    }

    fn count<F: Fn(&Op) -> bool>(code: &Code, f: F) -> usize {
        code.instrs.iter().filter(|i| f(&i.op)).count()
    }

    #[test]
    fn loops_are_balanced_by_popfor() {
        let prog = vec![s(StmtKind::ForNum {
            var: names::set("и"),
            from: num("1"),
            to: num("3"),
            body: vec![s(StmtKind::Loop {
                cond: e(ExprKind::Const("ложь".into())),
                body: vec![s(StmtKind::Break)],
            })],
        })];
        let code = lower(&prog).unwrap();
        let opened = count(&code, |op| {
            matches!(op, Op::ForNum { .. } | Op::ForEach { .. } | Op::While { .. })
        });
        assert_eq!(opened, 2);
        assert_eq!(count(&code, |op| matches!(op, Op::PopFor { .. })), opened);
    }

    #[test]
    fn try_is_balanced_by_poptry() {
        let prog = vec![s(StmtKind::Try {
            body: vec![s(StmtKind::Throw(e(ExprKind::Str("ошибка".into()))))],
            catch: vec![],
        })];
        let code = lower(&prog).unwrap();
        assert_eq!(count(&code, |op| matches!(op, Op::Try { .. })), 1);
        assert_eq!(count(&code, |op| matches!(op, Op::PopTry { .. })), 1);
        // the try/catch pairing survived linking
        assert_eq!(code.catches.len(), 1);
    }

    #[test]
    fn every_referenced_label_is_emitted_once() {
        let prog = vec![s(StmtKind::If {
            cond: e(ExprKind::Const("истина".into())),
            then: vec![assign("х", num("1"))],
            elifs: vec![(e(ExprKind::Const("ложь".into())), vec![assign("х", num("2"))])],
            els: vec![assign("х", num("3"))],
        })];
        let code = lower(&prog).unwrap();
        for instr in &code.instrs {
            for l in instr.op.referenced_labels() {
                assert!(code.labels.contains_key(&l), "нет метки L{l}");
            }
        }
    }

    #[test]
    fn or_short_circuits_with_jtrue() {
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Binary {
            op: "или".into(),
            lhs: Box::new(e(ExprKind::Const("истина".into()))),
            rhs: Box::new(ident("неважно")),
        })))];
        let code = lower(&prog).unwrap();
        assert_eq!(count(&code, |op| matches!(op, Op::JTrue { .. })), 1);
        assert_eq!(count(&code, |op| matches!(op, Op::Oper { .. })), 0);
    }

    #[test]
    fn numeric_literal_loads_then_casts() {
        let code = lower(&[s(StmtKind::Expr(num("42")))]).unwrap();
        assert!(matches!(code.instrs[0].op, Op::Load { .. }));
        assert!(matches!(code.instrs[1].op, Op::CastNum { .. }));
    }

    #[test]
    fn wide_calls_pack_arguments_into_a_slice() {
        let args: Vec<Expr> = (0..9).map(|i| num(&i.to_string())).collect();
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Call {
            name: names::set("сумма"),
            args,
            var_arg: false,
            go: false,
        })))];
        let code = lower(&prog).unwrap();
        assert_eq!(count(&code, |op| matches!(op, Op::MakeSlice { .. })), 1);
        assert_eq!(count(&code, |op| matches!(op, Op::SetIdx { .. })), 9);
    }

    #[test]
    fn narrow_calls_use_consecutive_registers() {
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Call {
            name: names::set("мин"),
            args: vec![num("1"), num("2")],
            var_arg: false,
            go: false,
        })))];
        let code = lower(&prog).unwrap();
        assert_eq!(count(&code, |op| matches!(op, Op::MakeSlice { .. })), 0);
    }

    #[test]
    fn select_rejects_non_channel_cases() {
        let prog = vec![s(StmtKind::Select {
            cases: vec![(num("1"), vec![])],
            default: None,
        })];
        assert!(matches!(lower(&prog), Err(CompileError::SelectCase(_))));
    }

    #[test]
    fn assoc_is_rejected_everywhere() {
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Assoc {
            lhs: Box::new(num("1")),
            rhs: Box::new(num("2")),
        })))];
        assert!(matches!(lower(&prog), Err(CompileError::AssocExpr(_))));
    }

    #[test]
    fn assignment_arity_must_match() {
        let prog = vec![s(StmtKind::Assign {
            lhs: vec![ident("а"), ident("б")],
            rhs: vec![num("1")],
        })];
        assert!(matches!(lower(&prog), Err(CompileError::AssignArity { .. })));
    }

    #[test]
    fn slice_lvalue_is_rejected() {
        let target = e(ExprKind::Slice {
            expr: Box::new(ident("а")),
            begin: None,
            end: None,
        });
        let prog = vec![s(StmtKind::Assign { lhs: vec![target], rhs: vec![num("1")] })];
        assert!(matches!(lower(&prog), Err(CompileError::SliceAssign(_))));
    }

    #[test]
    fn unary_lowering_appends_one_opcode() {
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(num("5")),
        })))];
        let code = lower(&prog).unwrap();
        assert!(matches!(code.instrs.last().unwrap().op, Op::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn link_rejects_duplicate_labels() {
        let instrs = vec![
            Instr { pos: Pos::default(), op: Op::Label(1) },
            Instr { pos: Pos::default(), op: Op::Label(1) },
        ];
        assert_eq!(Code::link(instrs).unwrap_err(), CompileError::DuplicateLabel(1));
    }

    #[test]
    fn link_rejects_jumps_out_of_the_unit() {
        let instrs = vec![Instr { pos: Pos::default(), op: Op::Jmp(7) }];
        assert_eq!(Code::link(instrs).unwrap_err(), CompileError::UnknownLabel(7));
    }

    #[test]
    fn unknown_operator_is_a_compile_error() {
        let prog = vec![s(StmtKind::Expr(e(ExprKind::Binary {
            op: "???".into(),
            lhs: Box::new(num("1")),
            rhs: Box::new(num("2")),
        })))];
        assert!(matches!(lower(&prog), Err(CompileError::UnknownOperator { .. })));
    }
}
