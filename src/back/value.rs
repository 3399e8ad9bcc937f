//! The runtime value domain.
//!
//! Values are cheap to clone: aggregates are shared behind `Arc`, so a
//! register file, an environment binding and a channel can all hold "the
//! same" slice. That sharing is also what gives the language its reference
//! semantics for mutable aggregates.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use derive_more::Display;
use parking_lot::RwLock;

use crate::common::Map;
use crate::middle::code::Code;
use crate::names::{self, NameId};

use super::env::Env;
use super::meta::MetaObject;
use super::vm::VmError;

/// A host function: boxed arguments in, one value (possibly a slice of
/// values) or an error out.
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, VmError> + Send + Sync>;

/// The tagged runtime value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Slice(Arc<RwLock<Vec<Value>>>),
    Map(Arc<RwLock<Map<String, Value>>>),
    Chan(Chan),
    Func(Func),
    Native(Native),
    Module(Env),
    Meta(Arc<dyn MetaObject>),
    Error(Arc<str>),
    /// A type descriptor, as produced by `SETNAME` and consumed by
    /// `CASTTYPE`/`MAKE`.
    TypeName(NameId),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn slice(items: Vec<Value>) -> Value {
        Value::Slice(Arc::new(RwLock::new(items)))
    }

    pub fn map(entries: Map<String, Value>) -> Value {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    /// The truthiness used by `JTRUE`/`JFALSE` and `CATCH`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Deep equality for primitives and aggregates, identity for channels,
    /// functions and host objects.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Slice(a), Value::Slice(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && va.equal(vb))
            }
            (Value::Chan(a), Value::Chan(b)) => a.same(b),
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(&a.code, &b.code) && a.env == b.env,
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Meta(a), Value::Meta(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::TypeName(a), Value::TypeName(b)) => a == b,
            _ => false,
        }
    }

    /// The escape hatch to the host object backing a meta value.
    pub fn interface(&self) -> Option<&dyn std::any::Any> {
        match self {
            Value::Meta(m) => Some(m.interface()),
            _ => None,
        }
    }

    /// Script-visible type name, matching the registered type names.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Nil => "неопределено",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::Float(_) => "float64",
            Value::Str(_) => "string",
            Value::Slice(_) => "массив",
            Value::Map(_) => "соответствие",
            Value::Chan(_) => "канал",
            Value::Func(_) | Value::Native(_) => "функция",
            Value::Module(_) => "модуль",
            Value::Meta(_) => "объект",
            Value::Error(_) => "ошибка",
            Value::TypeName(_) => "тип",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Неопределено"),
            Value::Bool(true) => write!(f, "Истина"),
            Value::Bool(false) => write!(f, "Ложь"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Slice(items) => {
                write!(f, "[")?;
                for (i, v) in items.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Chan(c) => write!(f, "канал({})", c.capacity()),
            Value::Func(func) => write!(f, "функция {}", names::get(func.name)),
            Value::Native(n) => write!(f, "функция {}", names::get(n.name)),
            Value::Module(env) => write!(f, "модуль {}", env.name_str()),
            Value::Meta(m) => write!(f, "{}", m.describe()),
            Value::Error(e) => write!(f, "{e}"),
            Value::TypeName(id) => write!(f, "тип {}", names::get(*id)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.equal(other)
    }
}

/// Built-in type descriptors, registered into environments by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Type {
    #[display("int64")]
    Int,
    #[display("float64")]
    Float,
    #[display("bool")]
    Bool,
    #[display("string")]
    Str,
    #[display("массив")]
    Slice,
    #[display("соответствие")]
    Map,
    #[display("канал")]
    Chan,
    #[display("функция")]
    Func,
}

/// A script closure: compiled body plus the scope it was created in. The
/// environment is referenced by id, so a destroyed defining scope turns a
/// call into a runtime error rather than a dangling pointer.
#[derive(Clone)]
pub struct Func {
    pub name: NameId,
    pub code: Arc<Code>,
    pub params: Arc<[NameId]>,
    pub var_arg: bool,
    pub env: Env,
}

/// A named host function.
#[derive(Clone)]
pub struct Native {
    pub name: NameId,
    pub func: HostFn,
}

impl Native {
    pub fn new<F>(name: &str, f: F) -> Native
    where
        F: Fn(Vec<Value>) -> Result<Value, VmError> + Send + Sync + 'static,
    {
        Native { name: names::set(name), func: Arc::new(f) }
    }
}

/// A conduit of values between activations.
///
/// `TRYSEND`/`TRYRECV` are the only operations the opcode vocabulary has, so
/// an unbuffered channel is backed by a one-slot buffer: a polling sender
/// and a polling receiver would otherwise never observe each other ready.
#[derive(Clone)]
pub struct Chan {
    tx: Sender<Value>,
    rx: Receiver<Value>,
    closed: Arc<AtomicBool>,
    cap: usize,
}

impl Chan {
    pub fn new(cap: usize) -> Chan {
        let (tx, rx) = bounded(cap.max(1));
        Chan { tx, rx, closed: Arc::new(AtomicBool::new(false)), cap }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn same(&self, other: &Chan) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    /// Non-blocking send. `Ok(false)` means "not ready, try again"; sending
    /// into a closed channel raises.
    pub fn try_send(&self, v: Value) -> Result<bool, VmError> {
        if self.is_closed() {
            return Err(VmError::ClosedChannel);
        }
        match self.tx.try_send(v) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(VmError::ClosedChannel),
        }
    }

    /// Non-blocking receive. The boolean reports completion: a closed,
    /// drained channel is always ready and completes with `Неопределено`.
    pub fn try_recv(&self) -> (Value, bool) {
        match self.rx.try_recv() {
            Ok(v) => (v, true),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                if self.is_closed() {
                    (Value::Nil, true)
                } else {
                    (Value::Nil, false)
                }
            }
        }
    }

    /// Receive for channel iteration: waits cooperatively for the next
    /// value, `None` once the channel is closed and drained.
    pub fn recv_next(&self) -> Option<Value> {
        loop {
            match self.rx.try_recv() {
                Ok(v) => return Some(v),
                Err(_) => {
                    if self.is_closed() {
                        return None;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::str("").truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::str("а").truthy());
        assert!(Value::Error("ошибка".into()).truthy());
    }

    #[test]
    fn deep_equality_on_slices() {
        let a = Value::slice(vec![Value::Int(1), Value::str("два")]);
        let b = Value::slice(vec![Value::Int(1), Value::str("два")]);
        let c = Value::slice(vec![Value::Int(1)]);
        assert!(a.equal(&b));
        assert!(!a.equal(&c));
    }

    #[test]
    fn mixed_numeric_equality() {
        assert!(Value::Int(2).equal(&Value::Float(2.0)));
        assert!(!Value::Int(2).equal(&Value::Float(2.5)));
    }

    #[test]
    fn channel_try_ops() {
        let c = Chan::new(1);
        assert!(c.try_send(Value::Int(1)).unwrap());
        // full
        assert!(!c.try_send(Value::Int(2)).unwrap());
        let (v, ok) = c.try_recv();
        assert!(ok);
        assert_eq!(v, Value::Int(1));
        let (_, ok) = c.try_recv();
        assert!(!ok);
        c.close();
        let (v, ok) = c.try_recv();
        assert!(ok);
        assert_eq!(v, Value::Nil);
        assert!(c.try_send(Value::Int(3)).is_err());
    }

    #[test]
    fn display_is_script_facing() {
        assert_eq!(Value::Nil.to_string(), "Неопределено");
        assert_eq!(Value::Bool(true).to_string(), "Истина");
        assert_eq!(Value::slice(vec![Value::Int(1), Value::Int(2)]).to_string(), "[1, 2]");
    }
}
