//! The middle of the pipeline: the register bytecode and the compiler that
//! lowers the AST onto it.

pub mod code;
pub mod lower;

pub use code::*;
pub use lower::{lower, CompileError};
