//! The meta-object protocol: how host objects expose fields and methods to
//! scripts.
//!
//! The VM dispatches `GETMEMBER`/`SETMEMBER` through [`MetaObject`] only; a
//! host type builds its member tables once, at construction time, with
//! [`MetaTable`] — name-id keyed trampolines instead of per-call reflection.

use std::any::Any;
use std::sync::Arc;

use crate::common::Map;
use crate::names::{self, NameId};

use super::value::{Native, Value};
use super::vm::VmError;

/// The capability set of a host object. Member names are matched through
/// the name table, so lookup is case-insensitive like everything else.
pub trait MetaObject: Send + Sync {
    /// The escape hatch back to the host object.
    fn interface(&self) -> &dyn Any;

    /// The script-facing string form.
    fn describe(&self) -> String;

    fn method(&self, name: NameId) -> Option<Native> {
        let _ = name;
        None
    }

    fn is_field(&self, name: NameId) -> bool {
        let _ = name;
        false
    }

    fn get_field(&self, name: NameId) -> Option<Value> {
        let _ = name;
        None
    }

    fn set_field(&self, name: NameId, val: Value) -> Result<(), VmError> {
        let _ = val;
        Err(VmError::MemberNotFound { member: names::get(name).to_string(), on: self.describe() })
    }
}

type Getter = Arc<dyn Fn() -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(Value) -> Result<(), VmError> + Send + Sync>;

/// A builder of member tables. Field accessors and method trampolines are
/// registered once and then shared by every dispatch.
pub struct MetaTable {
    name: String,
    methods: Map<NameId, Native>,
    getters: Map<NameId, Getter>,
    setters: Map<NameId, Setter>,
}

impl MetaTable {
    pub fn new(name: &str) -> MetaTable {
        MetaTable { name: name.to_string(), methods: Map::new(), getters: Map::new(), setters: Map::new() }
    }

    pub fn method(mut self, native: Native) -> MetaTable {
        self.methods.insert(native.name, native);
        self
    }

    /// A readable field; pass a setter to make it writable.
    pub fn field<G>(mut self, name: &str, get: G, set: Option<Setter>) -> MetaTable
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        let id = names::set(name);
        self.getters.insert(id, Arc::new(get));
        if let Some(set) = set {
            self.setters.insert(id, set);
        }
        self
    }

    pub fn setter<S>(f: S) -> Option<Setter>
    where
        S: Fn(Value) -> Result<(), VmError> + Send + Sync + 'static,
    {
        Some(Arc::new(f))
    }

    /// Finishes the table into a script value.
    pub fn value(self) -> Value {
        Value::Meta(Arc::new(TableObject { table: self }))
    }
}

/// A host object whose members are fully described by a [`MetaTable`].
pub struct TableObject {
    table: MetaTable,
}

impl MetaObject for TableObject {
    fn interface(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        self.table.name.clone()
    }

    fn method(&self, name: NameId) -> Option<Native> {
        self.table.methods.get(&name).cloned()
    }

    fn is_field(&self, name: NameId) -> bool {
        self.table.getters.contains_key(&name)
    }

    fn get_field(&self, name: NameId) -> Option<Value> {
        self.table.getters.get(&name).map(|g| g())
    }

    fn set_field(&self, name: NameId, val: Value) -> Result<(), VmError> {
        match self.table.setters.get(&name) {
            Some(s) => s(val),
            None if self.table.getters.contains_key(&name) => {
                Err(VmError::ReadOnlyField(names::get(name).to_string()))
            }
            None => Err(VmError::MemberNotFound {
                member: names::get(name).to_string(),
                on: self.describe(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn counter(start: i64) -> Value {
        let state = Arc::new(AtomicI64::new(start));
        let get_state = state.clone();
        let set_state = state.clone();
        let add_state = state.clone();
        MetaTable::new("Счетчик")
            .field(
                "Значение",
                move || Value::Int(get_state.load(Ordering::SeqCst)),
                MetaTable::setter(move |v| {
                    if let Value::Int(i) = v {
                        set_state.store(i, Ordering::SeqCst);
                        Ok(())
                    } else {
                        Err(VmError::Conversion { from: v.type_of().into(), to: "int64".into() })
                    }
                }),
            )
            .method(Native::new("Добавить", move |args| {
                let step = match args.first() {
                    Some(Value::Int(i)) => *i,
                    _ => 1,
                };
                Ok(Value::Int(add_state.fetch_add(step, Ordering::SeqCst) + step))
            }))
            .value()
    }

    #[test]
    fn fields_dispatch_case_insensitively() {
        let Value::Meta(obj) = counter(10) else { unreachable!() };
        let id = names::set("значение");
        assert!(obj.is_field(id));
        assert_eq!(obj.get_field(id), Some(Value::Int(10)));
        obj.set_field(id, Value::Int(3)).unwrap();
        assert_eq!(obj.get_field(id), Some(Value::Int(3)));
    }

    #[test]
    fn methods_are_trampolines() {
        let Value::Meta(obj) = counter(0) else { unreachable!() };
        let m = obj.method(names::set("добавить")).unwrap();
        assert_eq!((m.func)(vec![Value::Int(5)]).unwrap(), Value::Int(5));
        assert_eq!((m.func)(vec![]).unwrap(), Value::Int(6));
    }

    #[test]
    fn unknown_members_do_not_resolve() {
        let Value::Meta(obj) = counter(0) else { unreachable!() };
        let id = names::set("нет_такого_члена");
        assert!(!obj.is_field(id));
        assert!(obj.method(id).is_none());
        assert!(obj.set_field(id, Value::Nil).is_err());
    }
}
