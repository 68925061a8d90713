//! Native function dispatch (spec.md §6 "Native function dispatch").
//! Grounded on the `CFunction`/library-registration shape of
//! `lib_registry.rs` in the teacher, but scoped down: registering the
//! *standard library itself* (string/table/math/io/os/coroutine/debug) is
//! out of scope here, so this only provides the mechanism a host uses to
//! install its own natives and the lookup-by-id the dispatcher needs.
//!
//! The spec describes the contract as a single externally supplied
//! function `invoke(id, vm, func_reg, nargs, nresults)`. We realize that
//! as a concrete `Vec`-backed table of ids to function pointers rather
//! than a single opaque closure, since the runtime needs to hand out ids
//! when natives are registered (see DESIGN.md).

use crate::error::LuaResult;
use crate::runtime::Runtime;

/// A native function. Reads its arguments from `func_reg + 1 ..= func_reg
/// + nargs`, writes results starting at `func_reg`, and returns how many
/// results it actually produced (spec.md §6).
pub type NativeFn = fn(&mut Runtime, func_reg: usize, nargs: usize, nresults: i32) -> LuaResult<usize>;

#[derive(Default)]
pub struct NativeRegistry {
    fns: Vec<NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry { fns: Vec::new() }
    }

    /// Register a native function, returning the id scripted code will
    /// reference it by (stored in a `NativeClosure`).
    pub fn register(&mut self, f: NativeFn) -> u32 {
        self.fns.push(f);
        (self.fns.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<NativeFn> {
        self.fns.get(id as usize).copied()
    }
}
