//! Environments: the scope chain of the interpreter.
//!
//! Function values and environments reference each other, so environments
//! live in a process-wide arena and are addressed by stable ids; the public
//! [`Env`] handle is a `Copy` wrapper around the id. Destroying a scope
//! removes it from the arena and from its parent's bindings — a function
//! value still holding the id raises a runtime error when called.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::Map;
use crate::names::{self, NameId, NO_NAME};

use super::value::{Type, Value};
use super::vm::VmError;

/// Stable arena index of a scope.
pub type EnvId = usize;

/// The script name under which the global session id is published.
pub const SESSION_ID_NAME: &str = "ГлобальныйИдентификаторСессии";

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Sorted association of name ids to values, with a one-slot last-access
/// cache. Reads consult the cache; writes refill it.
struct Vars {
    ids: Vec<NameId>,
    vals: Vec<Value>,
    last: Option<(NameId, Value)>,
}

impl Vars {
    fn new() -> Vars {
        Vars { ids: Vec::with_capacity(16), vals: Vec::with_capacity(16), last: None }
    }

    fn get(&self, id: NameId) -> Option<Value> {
        if let Some((lid, v)) = &self.last {
            if *lid == id {
                return Some(v.clone());
            }
        }
        match self.ids.binary_search(&id) {
            Ok(i) => Some(self.vals[i].clone()),
            Err(_) => None,
        }
    }

    /// Updates an existing binding, or inserts one when `define` is set.
    /// Reports whether anything was written.
    fn put(&mut self, id: NameId, val: Value, define: bool) -> bool {
        match self.ids.binary_search(&id) {
            Ok(i) => {
                self.vals[i] = val.clone();
                self.last = Some((id, val));
                true
            }
            Err(i) => {
                if !define {
                    return false;
                }
                self.ids.insert(i, id);
                self.vals.insert(i, val.clone());
                self.last = Some((id, val));
                true
            }
        }
    }

    fn delete(&mut self, id: NameId) {
        if let Ok(i) = self.ids.binary_search(&id) {
            self.ids.remove(i);
            self.vals.remove(i);
            self.last = None;
        }
    }
}

struct Scope {
    name: RwLock<NameId>,
    parent: Option<EnvId>,
    vars: RwLock<Vars>,
    types: RwLock<Map<NameId, Type>>,
    interrupt: Arc<AtomicBool>,
    stdout: RwLock<Sink>,
    sid: RwLock<String>,
    parallel: AtomicBool,
    builtins_loaded: AtomicBool,
}

static SCOPES: Lazy<RwLock<Vec<Option<Arc<Scope>>>>> = Lazy::new(|| RwLock::new(Vec::new()));

fn alloc(scope: Scope) -> Env {
    let mut arena = SCOPES.write();
    let id = arena.len();
    arena.push(Some(Arc::new(scope)));
    Env { id }
}

/// A handle to a scope in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Env {
    id: EnvId,
}

impl Env {
    /// Creates a new global scope: the single root of an environment chain.
    pub fn new_global() -> Env {
        alloc(Scope {
            name: RwLock::new(NO_NAME),
            parent: None,
            vars: RwLock::new(Vars::new()),
            types: RwLock::new(Map::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
            stdout: RwLock::new(Arc::new(Mutex::new(Box::new(std::io::stdout())))),
            sid: RwLock::new(String::new()),
            parallel: AtomicBool::new(false),
            builtins_loaded: AtomicBool::new(false),
        })
    }

    fn scope(&self) -> Result<Arc<Scope>, VmError> {
        SCOPES
            .read()
            .get(self.id)
            .and_then(|s| s.clone())
            .ok_or(VmError::ScopeDestroyed)
    }

    fn spawn_child(&self) -> Result<Env, VmError> {
        let sc = self.scope()?;
        let stdout = sc.stdout.read().clone();
        Ok(alloc(Scope {
            name: RwLock::new(NO_NAME),
            parent: Some(self.id),
            vars: RwLock::new(Vars::new()),
            types: RwLock::new(Map::new()),
            interrupt: sc.interrupt.clone(),
            stdout: RwLock::new(stdout),
            sid: RwLock::new(String::new()),
            parallel: AtomicBool::new(false),
            builtins_loaded: AtomicBool::new(sc.builtins_loaded.load(Ordering::SeqCst)),
        }))
    }

    /// The root of this chain.
    pub fn global(&self) -> Result<Env, VmError> {
        let mut cur = *self;
        loop {
            let sc = cur.scope()?;
            match sc.parent {
                None => return Ok(cur),
                Some(p) => cur = Env { id: p },
            }
        }
    }

    /// A module-like scope attached directly under the global.
    pub fn new_child_of_global(&self) -> Result<Env, VmError> {
        self.global()?.spawn_child()
    }

    /// A closure scope attached directly under this one.
    pub fn new_sub_env(&self) -> Result<Env, VmError> {
        self.spawn_child()
    }

    /// Finds an existing module with this name, or creates one under the
    /// global scope and binds it there.
    pub fn new_module(&self, name: NameId) -> Result<Env, VmError> {
        if let Ok(Value::Module(m)) = self.get(name) {
            if m.scope().is_ok() {
                return Ok(m);
            }
        }
        let m = self.new_child_of_global()?;
        m.set_name(name)?;
        self.define_global(name, Value::Module(m))?;
        debug!(name = %names::get(name), "создан модуль");
        Ok(m)
    }

    /// Unlinks this scope: removes module bindings pointing at it from the
    /// parent and frees the arena slot. The global scope is never destroyed.
    pub fn destroy(&self) {
        let Ok(sc) = self.scope() else { return };
        let Some(parent) = sc.parent else { return };
        if let Ok(psc) = (Env { id: parent }).scope() {
            let mut vars = psc.vars.write();
            let stale: Vec<NameId> = vars
                .ids
                .iter()
                .zip(&vars.vals)
                .filter(|(_, v)| matches!(v, Value::Module(m) if m.id == self.id))
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                vars.delete(id);
            }
        }
        SCOPES.write()[self.id] = None;
    }

    /// Looks the name up through the scope chain.
    pub fn get(&self, id: NameId) -> Result<Value, VmError> {
        let mut cur = *self;
        loop {
            let sc = cur.scope()?;
            if let Some(v) = sc.vars.read().get(id) {
                return Ok(v);
            }
            match sc.parent {
                None => return Err(VmError::UndefinedName(names::get(id).to_string())),
                Some(p) => cur = Env { id: p },
            }
        }
    }

    /// Updates the closest scope that binds the name; an unbound name is
    /// defined in this scope (assignment doubles as declaration).
    pub fn set(&self, id: NameId, val: Value) -> Result<(), VmError> {
        let mut cur = *self;
        loop {
            let sc = cur.scope()?;
            if sc.vars.write().put(id, val.clone(), false) {
                return Ok(());
            }
            match sc.parent {
                None => return self.define(id, val),
                Some(p) => cur = Env { id: p },
            }
        }
    }

    /// Binds the name in this scope.
    pub fn define(&self, id: NameId, val: Value) -> Result<(), VmError> {
        self.scope()?.vars.write().put(id, val, true);
        Ok(())
    }

    pub fn define_str(&self, name: &str, val: Value) -> Result<(), VmError> {
        self.define(names::set(name), val)
    }

    pub fn define_global(&self, id: NameId, val: Value) -> Result<(), VmError> {
        self.global()?.define(id, val)
    }

    /// Looks a type up through the scope chain.
    pub fn type_of(&self, id: NameId) -> Result<Type, VmError> {
        let mut cur = *self;
        loop {
            let sc = cur.scope()?;
            if let Some(t) = sc.types.read().get(&id) {
                return Ok(*t);
            }
            match sc.parent {
                None => return Err(VmError::UndefinedType(names::get(id).to_string())),
                Some(p) => cur = Env { id: p },
            }
        }
    }

    /// Registers a type in the global scope.
    pub fn define_type(&self, id: NameId, t: Type) -> Result<(), VmError> {
        self.global()?.scope()?.types.write().insert(id, t);
        Ok(())
    }

    pub fn define_type_str(&self, name: &str, t: Type) -> Result<(), VmError> {
        self.define_type(names::set(name), t)
    }

    /// The name id a type is registered under, interning the default
    /// spelling when it was never registered.
    pub fn type_name(&self, t: Type) -> NameId {
        let mut cur = *self;
        while let Ok(sc) = cur.scope() {
            if let Some((id, _)) = sc.types.read().iter().find(|(_, v)| **v == t) {
                return *id;
            }
            match sc.parent {
                None => break,
                Some(p) => cur = Env { id: p },
            }
        }
        names::set(&t.to_string())
    }

    pub fn name(&self) -> NameId {
        self.scope().map(|sc| *sc.name.read()).unwrap_or(NO_NAME)
    }

    pub fn name_str(&self) -> String {
        match self.scope() {
            Ok(sc) => names::get(*sc.name.read()).to_string(),
            Err(_) => "<уничтожен>".to_string(),
        }
    }

    pub fn set_name(&self, name: NameId) -> Result<(), VmError> {
        *self.scope()?.name.write() = name;
        Ok(())
    }

    pub fn is_builtins_loaded(&self) -> bool {
        let mut cur = *self;
        while let Ok(sc) = cur.scope() {
            if sc.builtins_loaded.load(Ordering::SeqCst) {
                return true;
            }
            match sc.parent {
                None => break,
                Some(p) => cur = Env { id: p },
            }
        }
        false
    }

    pub fn set_builtins_loaded(&self) -> Result<(), VmError> {
        self.scope()?.builtins_loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Sets the session id on the global scope and publishes it under the
    /// canonical script name.
    pub fn set_sid(&self, sid: &str) -> Result<(), VmError> {
        let g = self.global()?;
        *g.scope()?.sid.write() = sid.to_string();
        g.define(names::set(SESSION_ID_NAME), Value::str(sid))
    }

    pub fn sid(&self) -> Result<String, VmError> {
        Ok(self.global()?.scope()?.sid.read().clone())
    }

    /// Requests cancellation of everything running on this chain.
    pub fn interrupt(&self) {
        if let Ok(sc) = self.scope() {
            sc.interrupt.store(true, Ordering::SeqCst);
        }
    }

    /// Consumes a pending interrupt.
    pub fn check_interrupt(&self) -> bool {
        match self.scope() {
            Ok(sc) => sc.interrupt.swap(false, Ordering::SeqCst),
            Err(_) => false,
        }
    }

    /// Marks this scope and all its ancestors as shared with a parallel
    /// activation.
    pub fn set_parallel(&self) {
        let mut cur = *self;
        while let Ok(sc) = cur.scope() {
            sc.parallel.store(true, Ordering::SeqCst);
            match sc.parent {
                None => break,
                Some(p) => cur = Env { id: p },
            }
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.scope().map(|sc| sc.parallel.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Replaces the output sink of this scope (descendants created later
    /// inherit it).
    pub fn set_stdout(&self, w: Box<dyn Write + Send>) -> Result<(), VmError> {
        *self.scope()?.stdout.write() = Arc::new(Mutex::new(w));
        Ok(())
    }

    pub fn write_str(&self, s: &str) -> Result<(), VmError> {
        let sink = self.scope()?.stdout.read().clone();
        let mut w = sink.lock();
        w.write_all(s.as_bytes()).map_err(|e| VmError::Output(e.to_string()))
    }

    pub fn println(&self, s: &str) -> Result<(), VmError> {
        self.write_str(s)?;
        self.write_str("\n")
    }

    /// A listing of the scope's bindings, for diagnostics.
    pub fn dump(&self) -> Result<String, VmError> {
        let sc = self.scope()?;
        let vars = sc.vars.read();
        let mut out = String::new();
        for (id, val) in vars.ids.iter().zip(&vars.vals) {
            out.push_str(&format!("{} {} = {}\n", id, names::get(*id), val));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_get_set_through_chain() {
        let g = Env::new_global();
        let m = g.new_child_of_global().unwrap();
        let sub = m.new_sub_env().unwrap();
        let x = names::set("тест_перем");
        g.define(x, Value::Int(1)).unwrap();
        assert_eq!(sub.get(x).unwrap(), Value::Int(1));
        // set walks up to the binding scope
        sub.set(x, Value::Int(2)).unwrap();
        assert_eq!(g.get(x).unwrap(), Value::Int(2));
    }

    #[test]
    fn set_defines_unbound_names_locally() {
        let g = Env::new_global();
        let sub = g.new_sub_env().unwrap();
        let x = names::set("тест_локал");
        sub.set(x, Value::Int(5)).unwrap();
        assert_eq!(sub.get(x).unwrap(), Value::Int(5));
        assert!(g.get(x).is_err());
    }

    #[test]
    fn module_is_found_or_created() {
        let g = Env::new_global();
        let name = names::set("ТестМодуль");
        let m1 = g.new_module(name).unwrap();
        let m2 = g.new_module(name).unwrap();
        assert_eq!(m1, m2);
        assert!(matches!(g.get(name).unwrap(), Value::Module(_)));
    }

    #[test]
    fn destroy_unbinds_and_invalidates() {
        let g = Env::new_global();
        let name = names::set("Временный");
        let m = g.new_module(name).unwrap();
        m.define_str("поле", Value::Int(1)).unwrap();
        m.destroy();
        assert!(g.get(name).is_err());
        assert!(matches!(m.get(names::set("поле")), Err(VmError::ScopeDestroyed)));
    }

    #[test]
    fn types_live_in_the_global_scope() {
        let g = Env::new_global();
        let sub = g.new_sub_env().unwrap();
        sub.define_type_str("тест_тип", Type::Int).unwrap();
        assert_eq!(sub.type_of(names::set("тест_тип")).unwrap(), Type::Int);
        assert_eq!(g.type_of(names::set("тест_тип")).unwrap(), Type::Int);
        assert!(g.type_of(names::set("нет_такого_типа")).is_err());
    }

    #[test]
    fn session_id_is_published() {
        let g = Env::new_global();
        g.set_sid("сеанс-1").unwrap();
        assert_eq!(g.sid().unwrap(), "сеанс-1");
        assert_eq!(g.get(names::set(SESSION_ID_NAME)).unwrap(), Value::str("сеанс-1"));
    }

    #[test]
    fn interrupt_is_shared_and_consumed() {
        let g = Env::new_global();
        let sub = g.new_sub_env().unwrap();
        g.interrupt();
        assert!(sub.check_interrupt());
        assert!(!sub.check_interrupt());
    }

    #[test]
    fn parallel_flag_propagates_up() {
        let g = Env::new_global();
        let sub = g.new_sub_env().unwrap();
        sub.set_parallel();
        assert!(g.is_parallel());
    }
}
