//! A register-based bytecode VM and garbage collector, in the shape of
//! the teacher's `luars` crate but scoped to just the execution engine and
//! memory manager (spec.md §1): no compiler, no stdlib, no FFI/wasm
//! bindings, no debugger. Those live in sibling crates in the teacher's
//! workspace; here they are out of scope, so this is a single crate rather
//! than a workspace.

pub mod config;
pub mod error;
pub mod frame;
pub mod gc;
pub mod metamethod;
pub mod native;
pub mod opcode;
pub mod runtime;
pub mod value;

/// Bytecode-construction helper for tests (spec.md §2.4 "Test tooling");
/// exposed publicly so both in-crate unit tests and the `tests/` integration
/// suite can build `Proto`s without a compiler front end.
pub mod builder;

mod arith;
mod dispatch;

pub use config::{GcConfig, VmConfig};
pub use error::{ErrorKind, LuaError, LuaResult};
pub use frame::CallFrame;
pub use gc::{GcHooks, GcStats, Heap};
pub use native::{NativeFn, NativeRegistry};
pub use opcode::{Instruction, OpCode};
pub use runtime::Runtime;
pub use value::{GcRef, ObjKind, Value};
