//! The virtual machine.
//!
//! Execution is a loop over instruction indexes against the current
//! activation: a register file, a stack of loop frames and a stack of try
//! frames. Script calls run a nested activation; `CALL` with the `go` flag
//! spawns one on its own OS thread. The interrupt flag of the environment
//! chain is checked between instructions.

use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

use crate::middle::code::{Code, Label, Literal, Op, Reg};
use crate::names::{self, NameId, NO_NAME};

use super::env::Env;
use super::ops;
use super::value::{Chan, Func, Native, Type, Value};

/// The script name of the function a `CATCH` makes available to read the
/// caught error's description.
pub const DESCRIBE_ERROR_NAME: &str = "ОписаниеОшибки";

/// Runtime errors. They propagate through activations until a live try
/// frame catches them or the host driver receives them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("Имя неопределено '{0}'")]
    UndefinedName(String),
    #[error("Тип неопределен '{0}'")]
    UndefinedType(String),
    #[error("Значение типа '{0}' не является функцией")]
    NotCallable(String),
    #[error("Значение типа '{0}' не поддерживает индексацию")]
    NotIndexable(String),
    #[error("Значение типа '{0}' не поддерживает перебор")]
    NotIterable(String),
    #[error("Член '{member}' не найден у '{on}'")]
    MemberNotFound { member: String, on: String },
    #[error("Поле '{0}' доступно только для чтения")]
    ReadOnlyField(String),
    #[error("Невозможно преобразовать '{from}' в '{to}'")]
    Conversion { from: String, to: String },
    #[error("Неверное число аргументов: ожидалось {want}, получено {got}")]
    Arity { want: usize, got: usize },
    #[error("Операция '{op}' не поддерживается для '{lhs}' и '{rhs}'")]
    UnsupportedOperand { op: String, lhs: String, rhs: String },
    #[error("Деление на ноль")]
    DivisionByZero,
    #[error("Индекс {index} вне диапазона (длина {len})")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("Операция с закрытым каналом")]
    ClosedChannel,
    #[error("Контекст исполнения уничтожен")]
    ScopeDestroyed,
    #[error("Выполнение прервано")]
    Interrupted,
    #[error("{0}")]
    Diagnostic(String),
    #[error("{0}")]
    Thrown(String),
    #[error("Ошибка вывода: {0}")]
    Output(String),
}

/// Runs a linked compilation unit against an environment and returns the
/// value of its `RET` (or `Неопределено` when it runs off the end).
pub fn run(code: &Code, env: Env) -> Result<Value, VmError> {
    execute(code, env)
}

enum Flow {
    Next,
    Goto(usize),
    Return(Value),
}

enum Iter {
    Items { items: Vec<Value>, pos: usize },
    Chan(Chan),
}

enum LoopKind {
    Iter(Iter),
    Num { to: i64 },
    While,
}

struct LoopFrame {
    brk: Label,
    /// Instruction index `CONTINUE` re-enters at: the label directly after
    /// the loop-opening opcode.
    cont: usize,
    kind: LoopKind,
}

struct TryFrame {
    catch_ip: usize,
    err_reg: Reg,
    loops_depth: usize,
}

#[derive(Default)]
struct Activation {
    regs: Vec<Value>,
    loops: Vec<LoopFrame>,
    tries: Vec<TryFrame>,
}

impl Activation {
    fn reg(&self, r: Reg) -> Value {
        self.regs.get(r).cloned().unwrap_or(Value::Nil)
    }

    fn set_reg(&mut self, r: Reg, v: Value) {
        if r >= self.regs.len() {
            self.regs.resize(r + 1, Value::Nil);
        }
        self.regs[r] = v;
    }
}

fn target(code: &Code, l: Label) -> Result<usize, VmError> {
    code.labels
        .get(&l)
        .copied()
        .ok_or_else(|| VmError::Diagnostic(format!("метка L{l} не найдена")))
}

fn execute(code: &Code, env: Env) -> Result<Value, VmError> {
    let mut act = Activation::default();
    let mut ip = 0usize;
    while ip < code.instrs.len() {
        let instr = &code.instrs[ip];
        let flow = if env.check_interrupt() {
            Err(VmError::Interrupted)
        } else {
            step(&mut act, code, env, ip, &instr.op)
        };
        match flow {
            Ok(Flow::Next) => ip += 1,
            Ok(Flow::Goto(i)) => ip = i,
            Ok(Flow::Return(v)) => return Ok(v),
            Err(e) => match act.tries.pop() {
                Some(tf) => {
                    act.loops.truncate(tf.loops_depth);
                    let msg = e.to_string();
                    debug!(pos = %instr.pos, error = %msg, "ошибка перехвачена");
                    act.set_reg(tf.err_reg, Value::Error(msg.as_str().into()));
                    let text = msg.clone();
                    env.define(
                        names::set(DESCRIBE_ERROR_NAME),
                        Value::Native(Native::new(DESCRIBE_ERROR_NAME, move |_args| {
                            Ok(Value::str(text.clone()))
                        })),
                    )?;
                    ip = tf.catch_ip;
                }
                None => return Err(e),
            },
        }
    }
    Ok(Value::Nil)
}

fn step(act: &mut Activation, code: &Code, env: Env, ip: usize, op: &Op) -> Result<Flow, VmError> {
    match op {
        Op::Load { reg, val } => {
            act.set_reg(*reg, literal_value(val));
        }
        Op::Mv { from, to } => {
            let v = act.reg(*from);
            act.set_reg(*to, v);
        }
        Op::Get { reg, id, dotted } => {
            let v = if *dotted {
                match env.get(*id) {
                    Ok(v) => v,
                    Err(_) => dotted_get(env, *id)?,
                }
            } else {
                env.get(*id)?
            };
            act.set_reg(*reg, v);
        }
        Op::Set { reg, id } => env.set(*id, act.reg(*reg))?,
        Op::SetMember { reg, name, val } => {
            member_set(&act.reg(*reg), *name, act.reg(*val))?;
        }
        Op::SetItem { reg, index, val } => {
            item_set(&act.reg(*reg), &act.reg(*index), act.reg(*val))?;
        }
        Op::CastNum { reg } => {
            let v = ops::cast_num(&act.reg(*reg))?;
            act.set_reg(*reg, v);
        }
        Op::CastType { reg, ty } => {
            let t = resolve_type(env, &act.reg(*ty))?;
            let v = ops::cast_type(&act.reg(*reg), t)?;
            act.set_reg(*reg, v);
        }
        Op::SetName { reg } => {
            let v = match act.reg(*reg) {
                Value::Str(s) => {
                    let id = names::set(&s);
                    env.type_of(id)?;
                    Value::TypeName(id)
                }
                v @ Value::TypeName(_) => v,
                v => {
                    return Err(VmError::Conversion {
                        from: v.type_of().to_string(),
                        to: "тип".to_string(),
                    })
                }
            };
            act.set_reg(*reg, v);
        }
        Op::Unary { reg, op } => {
            let v = ops::unary(*op, &act.reg(*reg))?;
            act.set_reg(*reg, v);
        }
        // aggregates are shared, so a value already behaves like a
        // reference; the address pair is kept for stream compatibility
        Op::Addr { .. } | Op::Unref { .. } => {}
        Op::Oper { lhs, rhs, op } => {
            let v = ops::binary(*op, &act.reg(*lhs), &act.reg(*rhs))?;
            act.set_reg(*lhs, v);
        }
        Op::Equal { dst, lhs, rhs } => {
            let eq = act.reg(*lhs).equal(&act.reg(*rhs));
            act.set_reg(*dst, Value::Bool(eq));
        }
        Op::MakeSlice { reg, len, cap } => {
            let mut items = Vec::with_capacity((*cap).max(*len));
            items.resize(*len, Value::Nil);
            act.set_reg(*reg, Value::slice(items));
        }
        Op::MakeMap { reg, .. } => act.set_reg(*reg, Value::map(Default::default())),
        Op::MakeArr { reg, cap } => {
            let len = ops::to_int(&act.reg(*reg))?;
            let cap = ops::to_int(&act.reg(*cap))?.max(len);
            if len < 0 {
                return Err(VmError::IndexOutOfRange { index: len, len: 0 });
            }
            let mut items = Vec::with_capacity(cap.max(0) as usize);
            items.resize(len as usize, Value::Nil);
            act.set_reg(*reg, Value::slice(items));
        }
        Op::MakeChan { reg } => {
            let cap = ops::to_int(&act.reg(*reg))?.max(0) as usize;
            act.set_reg(*reg, Value::Chan(Chan::new(cap)));
        }
        Op::Make { reg } => {
            let t = resolve_type(env, &act.reg(*reg))?;
            act.set_reg(*reg, ops::make_zero(t)?);
        }
        Op::SetIdx { reg, index, val } => match act.reg(*reg) {
            Value::Slice(items) => {
                let mut items = items.write();
                let len = items.len();
                let slot = items.get_mut(*index).ok_or(VmError::IndexOutOfRange {
                    index: *index as i64,
                    len,
                })?;
                *slot = act.reg(*val);
            }
            v => return Err(VmError::NotIndexable(v.type_of().to_string())),
        },
        Op::SetKey { reg, key, val } => match act.reg(*reg) {
            Value::Map(entries) => {
                entries.write().insert(key.to_string(), act.reg(*val));
            }
            v => return Err(VmError::NotIndexable(v.type_of().to_string())),
        },
        Op::GetIdx { reg, index } => {
            let v = item_get(&act.reg(*reg), &act.reg(*index))?;
            act.set_reg(*reg, v);
        }
        Op::GetSubslice { reg, begin, end } => {
            let v = subslice(&act.reg(*reg), &act.reg(*begin), &act.reg(*end))?;
            act.set_reg(*reg, v);
        }
        Op::GetMember { reg, name } => {
            let v = member_get(&act.reg(*reg), *name)?;
            act.set_reg(*reg, v);
        }
        Op::Label(_) => {}
        Op::Jmp(l) => return Ok(Flow::Goto(target(code, *l)?)),
        Op::JTrue { reg, to } => {
            if act.reg(*reg).truthy() {
                return Ok(Flow::Goto(target(code, *to)?));
            }
        }
        Op::JFalse { reg, to } => {
            if !act.reg(*reg).truthy() {
                return Ok(Flow::Goto(target(code, *to)?));
            }
        }
        Op::ForEach { reg, iter, brk } => {
            let it = make_iter(&act.reg(*reg))?;
            act.loops.push(LoopFrame { brk: *brk, cont: ip + 1, kind: LoopKind::Iter(it) });
            // the iterator state itself lives in the loop frame
            act.set_reg(*iter, Value::Nil);
        }
        Op::Next { val, end, .. } => {
            let next = match act.loops.last_mut() {
                Some(LoopFrame { kind: LoopKind::Iter(it), .. }) => advance(it),
                _ => return Err(VmError::Diagnostic("перебор вне цикла".to_string())),
            };
            match next {
                Some(v) => act.set_reg(*val, v),
                None => return Ok(Flow::Goto(target(code, *end)?)),
            }
        }
        Op::ForNum { reg, from, to, brk } => {
            let from = ops::to_int(&act.reg(*from))?;
            let to = ops::to_int(&act.reg(*to))?;
            act.loops.push(LoopFrame { brk: *brk, cont: ip + 1, kind: LoopKind::Num { to } });
            act.set_reg(*reg, Value::Int(from.wrapping_sub(1)));
        }
        Op::NextNum { reg, end } => {
            let bound = match act.loops.last() {
                Some(LoopFrame { kind: LoopKind::Num { to }, .. }) => *to,
                _ => return Err(VmError::Diagnostic("счетчик вне цикла".to_string())),
            };
            let cur = ops::to_int(&act.reg(*reg))? + 1;
            if cur > bound {
                return Ok(Flow::Goto(target(code, *end)?));
            }
            act.set_reg(*reg, Value::Int(cur));
        }
        Op::While { brk, .. } => {
            act.loops.push(LoopFrame { brk: *brk, cont: ip + 1, kind: LoopKind::While });
        }
        Op::PopFor { .. } => {
            act.loops.pop();
        }
        Op::Break => match act.loops.last() {
            Some(frame) => return Ok(Flow::Goto(target(code, frame.brk)?)),
            None => return Err(VmError::Diagnostic("прервать вне цикла".to_string())),
        },
        Op::Continue => match act.loops.last() {
            Some(frame) => return Ok(Flow::Goto(frame.cont)),
            None => return Err(VmError::Diagnostic("продолжить вне цикла".to_string())),
        },
        Op::Try { reg } => {
            let catch_ip = code
                .catches
                .get(&ip)
                .copied()
                .ok_or_else(|| VmError::Diagnostic("попытка без обработчика".to_string()))?;
            act.tries.push(TryFrame { catch_ip, err_reg: *reg, loops_depth: act.loops.len() });
            act.set_reg(*reg, Value::Nil);
        }
        Op::Catch { reg, end } => {
            if !act.reg(*reg).truthy() {
                return Ok(Flow::Goto(target(code, *end)?));
            }
        }
        Op::PopTry { .. } => {
            act.tries.pop();
        }
        Op::Throw { reg } => return Err(VmError::Thrown(act.reg(*reg).to_string())),
        Op::Call { name, num_args, args, var_arg, go } => {
            let v = do_call(act, env, *name, *num_args, *args, *var_arg, *go)?;
            act.set_reg(*args, v);
        }
        Op::Ret { reg } => return Ok(Flow::Return(act.reg(*reg))),
        Op::Module { name, code } => {
            let m = env.new_module(*name)?;
            debug!(name = %names::get(*name), "исполняется модуль");
            execute(code.as_ref(), m)?;
        }
        Op::Func { reg, name, code, params, var_arg, .. } => {
            act.set_reg(
                *reg,
                Value::Func(Func {
                    name: *name,
                    code: code.clone(),
                    params: params.clone(),
                    var_arg: *var_arg,
                    env,
                }),
            );
        }
        Op::TrySend { chan, val, ok } => match act.reg(*chan) {
            Value::Chan(c) => {
                let sent = c.try_send(act.reg(*val))?;
                act.set_reg(*ok, Value::Bool(sent));
            }
            // in a select the operand may legitimately be a variable side
            _ => act.set_reg(*ok, Value::Bool(false)),
        },
        Op::TryRecv { chan, val, ok } => match act.reg(*chan) {
            Value::Chan(c) => {
                let (v, done) = c.try_recv();
                act.set_reg(*val, v);
                act.set_reg(*ok, Value::Bool(done));
            }
            _ => {
                act.set_reg(*val, Value::Nil);
                act.set_reg(*ok, Value::Bool(false));
            }
        },
        Op::GoShed => thread::yield_now(),
        Op::Error { message } => return Err(VmError::Diagnostic(message.clone())),
    }
    Ok(Flow::Next)
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Nil => Value::Nil,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::TypeName(id) => Value::TypeName(*id),
        Literal::Native(v) => v.clone(),
    }
}

/// Resolves a qualified name segment by segment through the member
/// protocol, starting from the environment chain.
fn dotted_get(env: Env, id: NameId) -> Result<Value, VmError> {
    let full = names::lowercase(id);
    let mut parts = full.split('.');
    let head = parts.next().unwrap_or("");
    let mut cur = env.get(names::set(head))?;
    for part in parts {
        cur = member_get(&cur, names::set(part))?;
    }
    Ok(cur)
}

fn resolve_type(env: Env, v: &Value) -> Result<Type, VmError> {
    match v {
        Value::TypeName(id) => env.type_of(*id),
        Value::Str(s) => env.type_of(names::set(s)),
        _ => Err(VmError::Conversion { from: v.type_of().to_string(), to: "тип".to_string() }),
    }
}

fn member_get(v: &Value, name: NameId) -> Result<Value, VmError> {
    match v {
        Value::Module(m) => m.get(name),
        Value::Map(entries) => {
            let entries = entries.read();
            if let Some(v) = entries.get(names::get(name).as_str()) {
                return Ok(v.clone());
            }
            Ok(entries.get(names::lowercase(name).as_str()).cloned().unwrap_or(Value::Nil))
        }
        Value::Meta(obj) => {
            if obj.is_field(name) {
                return obj.get_field(name).ok_or_else(|| VmError::MemberNotFound {
                    member: names::get(name).to_string(),
                    on: obj.describe(),
                });
            }
            match obj.method(name) {
                Some(m) => Ok(Value::Native(m)),
                None => Err(VmError::MemberNotFound {
                    member: names::get(name).to_string(),
                    on: obj.describe(),
                }),
            }
        }
        other => Err(VmError::MemberNotFound {
            member: names::get(name).to_string(),
            on: other.type_of().to_string(),
        }),
    }
}

fn member_set(v: &Value, name: NameId, val: Value) -> Result<(), VmError> {
    match v {
        Value::Module(m) => m.define(name, val),
        Value::Map(entries) => {
            entries.write().insert(names::get(name).to_string(), val);
            Ok(())
        }
        Value::Meta(obj) => obj.set_field(name, val),
        other => Err(VmError::MemberNotFound {
            member: names::get(name).to_string(),
            on: other.type_of().to_string(),
        }),
    }
}

fn item_get(v: &Value, idx: &Value) -> Result<Value, VmError> {
    match v {
        Value::Slice(items) => {
            let items = items.read();
            let i = ops::to_int(idx)?;
            if i < 0 || i as usize >= items.len() {
                return Err(VmError::IndexOutOfRange { index: i, len: items.len() });
            }
            Ok(items[i as usize].clone())
        }
        Value::Map(entries) => match idx {
            Value::Str(k) => Ok(entries.read().get(k.as_ref()).cloned().unwrap_or(Value::Nil)),
            other => Err(VmError::Conversion {
                from: other.type_of().to_string(),
                to: "string".to_string(),
            }),
        },
        Value::Str(s) => {
            let i = ops::to_int(idx)?;
            let len = s.chars().count();
            if i < 0 || i as usize >= len {
                return Err(VmError::IndexOutOfRange { index: i, len });
            }
            let ch = s.chars().nth(i as usize).unwrap_or_default();
            Ok(Value::str(ch.to_string()))
        }
        other => Err(VmError::NotIndexable(other.type_of().to_string())),
    }
}

fn item_set(v: &Value, idx: &Value, val: Value) -> Result<(), VmError> {
    match v {
        Value::Slice(items) => {
            let mut items = items.write();
            let len = items.len();
            let i = ops::to_int(idx)?;
            if i < 0 || i as usize >= len {
                return Err(VmError::IndexOutOfRange { index: i, len });
            }
            items[i as usize] = val;
            Ok(())
        }
        Value::Map(entries) => match idx {
            Value::Str(k) => {
                entries.write().insert(k.to_string(), val);
                Ok(())
            }
            other => Err(VmError::Conversion {
                from: other.type_of().to_string(),
                to: "string".to_string(),
            }),
        },
        other => Err(VmError::NotIndexable(other.type_of().to_string())),
    }
}

fn subslice(v: &Value, begin: &Value, end: &Value) -> Result<Value, VmError> {
    let bounds = |len: usize| -> Result<(usize, usize), VmError> {
        let b = match begin {
            Value::Nil => 0,
            v => ops::to_int(v)?,
        };
        let e = match end {
            Value::Nil => len as i64,
            v => ops::to_int(v)?,
        };
        if b < 0 || e < b || e as usize > len {
            return Err(VmError::IndexOutOfRange { index: e.max(b), len });
        }
        Ok((b as usize, e as usize))
    };
    match v {
        Value::Slice(items) => {
            let items = items.read();
            let (b, e) = bounds(items.len())?;
            Ok(Value::slice(items[b..e].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (b, e) = bounds(chars.len())?;
            Ok(Value::str(chars[b..e].iter().collect::<String>()))
        }
        other => Err(VmError::NotIndexable(other.type_of().to_string())),
    }
}

fn make_iter(v: &Value) -> Result<Iter, VmError> {
    match v {
        Value::Slice(items) => Ok(Iter::Items { items: items.read().clone(), pos: 0 }),
        Value::Map(entries) => Ok(Iter::Items {
            items: entries.read().keys().map(|k| Value::str(k.clone())).collect(),
            pos: 0,
        }),
        Value::Str(s) => Ok(Iter::Items {
            items: s.chars().map(|c| Value::str(c.to_string())).collect(),
            pos: 0,
        }),
        Value::Chan(c) => Ok(Iter::Chan(c.clone())),
        other => Err(VmError::NotIterable(other.type_of().to_string())),
    }
}

fn advance(it: &mut Iter) -> Option<Value> {
    match it {
        Iter::Items { items, pos } => {
            if *pos < items.len() {
                *pos += 1;
                Some(items[*pos - 1].clone())
            } else {
                None
            }
        }
        Iter::Chan(c) => c.recv_next(),
    }
}

fn do_call(
    act: &mut Activation,
    env: Env,
    name: NameId,
    num_args: usize,
    args_reg: Reg,
    var_arg: bool,
    go: bool,
) -> Result<Value, VmError> {
    // anonymous calls keep the callee in the base register, so their
    // arguments start one register higher
    let regoff = if name == NO_NAME { 1 } else { 0 };
    let callee = if name == NO_NAME { act.reg(args_reg) } else { env.get(name)? };
    let mut argv: Vec<Value> = if num_args <= 7 {
        (0..num_args).map(|i| act.reg(args_reg + regoff + i)).collect()
    } else {
        match act.reg(args_reg + regoff) {
            Value::Slice(items) => items.read().clone(),
            v => return Err(VmError::NotIndexable(v.type_of().to_string())),
        }
    };
    if var_arg {
        match argv.as_slice() {
            [Value::Slice(items)] => {
                let items = items.read().clone();
                argv = items;
            }
            [v] => {
                return Err(VmError::Conversion {
                    from: v.type_of().to_string(),
                    to: "массив".to_string(),
                })
            }
            _ => return Err(VmError::Arity { want: 1, got: argv.len() }),
        }
    }
    match callee {
        Value::Func(f) => {
            if go {
                env.set_parallel();
                f.env.set_parallel();
                thread::spawn(move || {
                    if let Err(e) = call_script(&f, argv) {
                        warn!(error = %e, "ошибка в параллельной активации");
                    }
                });
                Ok(Value::Nil)
            } else {
                call_script(&f, argv)
            }
        }
        Value::Native(n) => {
            if go {
                env.set_parallel();
                thread::spawn(move || {
                    if let Err(e) = (n.func)(argv) {
                        warn!(error = %e, "ошибка в параллельной активации");
                    }
                });
                Ok(Value::Nil)
            } else {
                (n.func)(argv)
            }
        }
        other => Err(VmError::NotCallable(other.type_of().to_string())),
    }
}

/// Invokes a script closure: binds the formals in a fresh sub-scope of the
/// defining environment, runs the body, then unlinks the scope.
fn call_script(f: &Func, argv: Vec<Value>) -> Result<Value, VmError> {
    let sub = f.env.new_sub_env()?;
    let bound = bind_params(sub, f, argv);
    if let Err(e) = bound {
        sub.destroy();
        return Err(e);
    }
    let result = execute(&f.code, sub);
    sub.destroy();
    result
}

fn bind_params(sub: Env, f: &Func, argv: Vec<Value>) -> Result<(), VmError> {
    if f.var_arg {
        if f.params.is_empty() {
            return Ok(());
        }
        let fixed = f.params.len() - 1;
        if argv.len() < fixed {
            return Err(VmError::Arity { want: fixed, got: argv.len() });
        }
        for (p, a) in f.params[..fixed].iter().zip(&argv) {
            sub.define(*p, a.clone())?;
        }
        sub.define(f.params[fixed], Value::slice(argv[fixed..].to_vec()))
    } else {
        if argv.len() != f.params.len() {
            return Err(VmError::Arity { want: f.params.len(), got: argv.len() });
        }
        for (p, a) in f.params.iter().zip(argv) {
            sub.define(*p, a)?;
        }
        Ok(())
    }
}
