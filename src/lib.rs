//! The execution core of a dynamically-typed scripting language with
//! Russian keywords: a register bytecode compiler over a host-supplied AST,
//! and the virtual machine that runs the result. See `src/front` for the
//! AST boundary and `src/builtins` for how hosts register their packages.

pub mod back;
pub mod builtins;
pub mod common;
pub mod front;
pub mod middle;
pub mod names;

use thiserror::Error;

pub use back::env::Env;
pub use back::value::Value;
pub use back::vm::{run, VmError};
pub use middle::lower::{lower, CompileError};

/// Either phase of the pipeline can fail; compile errors are reported
/// before anything executes.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Compiles a statement list and runs it in the given environment.
pub fn eval(stmts: &[front::ast::Stmt], env: Env) -> Result<Value, Error> {
    let code = lower(stmts)?;
    Ok(run(&code, env)?)
}
