//! Builtin registration: the core package and the runtime package loader.
//!
//! Standard-library packages live outside this crate; they plug in through
//! [`register_package`] and are requested from scripts via `импорт`. The
//! core package defined here covers the names the language itself leans on.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::back::env::Env;
use crate::back::value::{Native, Type, Value};
use crate::back::vm::VmError;
use crate::common::Map;

/// A package loader: receives an environment, registers its symbols and
/// returns the package value (usually a module).
pub type PkgLoader = fn(Env) -> Result<Value, VmError>;

static PACKAGES: Lazy<RwLock<Map<String, PkgLoader>>> = Lazy::new(|| RwLock::new(Map::new()));

/// Makes a package available to `импорт` under `name` (case-insensitive).
pub fn register_package(name: &str, loader: PkgLoader) {
    PACKAGES.write().insert(name.to_lowercase(), loader);
}

fn want(args: &[Value], n: usize) -> Result<(), VmError> {
    if args.len() != n {
        return Err(VmError::Arity { want: n, got: args.len() });
    }
    Ok(())
}

fn joined(args: &[Value]) -> String {
    args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Loads the core package and the package-import function into the global
/// scope of `env`. Idempotent per environment chain.
pub fn load_all(env: Env) -> Result<(), VmError> {
    if env.is_builtins_loaded() {
        return Ok(());
    }
    load_core(env)?;
    env.define_str(
        "импорт",
        Value::Native(Native::new("импорт", move |args| {
            want(&args, 1)?;
            let name = match &args[0] {
                Value::Str(s) => s.to_lowercase(),
                v => {
                    return Err(VmError::Conversion {
                        from: v.type_of().to_string(),
                        to: "string".to_string(),
                    })
                }
            };
            let loader = PACKAGES
                .read()
                .get(&name)
                .copied()
                .ok_or_else(|| VmError::UndefinedName(name.clone()))?;
            debug!(package = %name, "импорт пакета");
            loader(env)
        })),
    )?;
    env.set_builtins_loaded()
}

/// The core names: aggregates, conversions and output.
pub fn load_core(env: Env) -> Result<(), VmError> {
    env.define_str(
        "len",
        Value::Native(Native::new("len", |args| {
            want(&args, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.len(),
                Value::Slice(items) => items.read().len(),
                Value::Map(entries) => entries.read().len(),
                v => {
                    return Err(VmError::Conversion {
                        from: v.type_of().to_string(),
                        to: "массив".to_string(),
                    })
                }
            };
            Ok(Value::Int(n as i64))
        })),
    )?;

    env.define_str(
        "keys",
        Value::Native(Native::new("keys", |args| {
            want(&args, 1)?;
            match &args[0] {
                Value::Map(entries) => Ok(Value::slice(
                    entries.read().keys().map(|k| Value::str(k.clone())).collect(),
                )),
                v => Err(VmError::Conversion {
                    from: v.type_of().to_string(),
                    to: "соответствие".to_string(),
                }),
            }
        })),
    )?;

    env.define_str(
        "range",
        Value::Native(Native::new("range", |args| {
            let (min, max) = match args.as_slice() {
                [Value::Int(n)] => (0, n - 1),
                [Value::Int(a), Value::Int(b)] => (*a, *b),
                _ => return Err(VmError::Arity { want: 2, got: args.len() }),
            };
            Ok(Value::slice((min..=max).map(Value::Int).collect()))
        })),
    )?;

    env.define_str(
        "toString",
        Value::Native(Native::new("toString", |args| {
            want(&args, 1)?;
            Ok(Value::str(args[0].to_string()))
        })),
    )?;

    env.define_str(
        "toInt",
        Value::Native(Native::new("toInt", |args| {
            want(&args, 1)?;
            Ok(match &args[0] {
                Value::Int(i) => Value::Int(*i),
                Value::Float(f) => Value::Int(*f as i64),
                Value::Bool(b) => Value::Int(*b as i64),
                Value::Str(s) => {
                    let t = s.trim();
                    if let Ok(i) = t.parse::<i64>() {
                        Value::Int(i)
                    } else if let Ok(f) = t.parse::<f64>() {
                        Value::Int(f as i64)
                    } else {
                        Value::Int(0)
                    }
                }
                _ => Value::Int(0),
            })
        })),
    )?;

    env.define_str(
        "toFloat",
        Value::Native(Native::new("toFloat", |args| {
            want(&args, 1)?;
            Ok(match &args[0] {
                Value::Int(i) => Value::Float(*i as f64),
                Value::Float(f) => Value::Float(*f),
                Value::Bool(b) => Value::Float(*b as i64 as f64),
                Value::Str(s) => Value::Float(s.trim().parse::<f64>().unwrap_or(0.0)),
                _ => Value::Float(0.0),
            })
        })),
    )?;

    env.define_str(
        "toBool",
        Value::Native(Native::new("toBool", |args| {
            want(&args, 1)?;
            Ok(Value::Bool(match &args[0] {
                Value::Str(s) => {
                    matches!(s.trim().to_lowercase().as_str(), "истина" | "да" | "true" | "1")
                }
                v => v.truthy(),
            }))
        })),
    )?;

    env.define_str(
        "typeOf",
        Value::Native(Native::new("typeOf", |args| {
            want(&args, 1)?;
            Ok(Value::str(args[0].type_of()))
        })),
    )?;

    env.define_str(
        "defined",
        Value::Native(Native::new("defined", move |args| {
            want(&args, 1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Bool(env.get(crate::names::set(s)).is_ok())),
                v => Err(VmError::Conversion {
                    from: v.type_of().to_string(),
                    to: "string".to_string(),
                }),
            }
        })),
    )?;

    env.define_str(
        "print",
        Value::Native(Native::new("print", move |args| {
            env.write_str(&joined(&args))?;
            Ok(Value::Nil)
        })),
    )?;

    for name in ["println", "сообщить"] {
        env.define_str(
            name,
            Value::Native(Native::new(name, move |args| {
                env.println(&joined(&args))?;
                Ok(Value::Nil)
            })),
        )?;
    }

    env.define_str(
        "close",
        Value::Native(Native::new("close", |args| {
            want(&args, 1)?;
            match &args[0] {
                Value::Chan(c) => {
                    c.close();
                    Ok(Value::Nil)
                }
                v => Err(VmError::Conversion {
                    from: v.type_of().to_string(),
                    to: "канал".to_string(),
                }),
            }
        })),
    )?;

    env.define_type_str("int64", Type::Int)?;
    env.define_type_str("float64", Type::Float)?;
    env.define_type_str("bool", Type::Bool)?;
    env.define_type_str("string", Type::Str)?;
    env.define_type_str("массив", Type::Slice)?;
    env.define_type_str("соответствие", Type::Map)?;
    env.define_type_str("канал", Type::Chan)?;
    env.define_type_str("функция", Type::Func)?;
    Ok(())
}
