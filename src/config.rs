//! Tuning knobs, in place of the teacher's global GC-parameter array and
//! `SafeOption` VM-construction struct (`gc/mod.rs`, `lua_vm/safe_option.rs`).
//! This crate is a library with no CLI, so there is no file/env config layer
//! (spec.md §6 "CLI / env: Outside scope") — just `Default`-able structs the
//! embedder passes to the constructors.

/// Collector tuning (spec.md §4.1.1, §4.1.3 "next_threshold").
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Collection never runs while `bytes_allocated` is below this, regardless
    /// of `growth_multiplier`.
    pub min_threshold: usize,
    /// `next_threshold = max(min_threshold, bytes_allocated * growth_multiplier)`.
    pub growth_multiplier: f64,
    /// Whether automatic collection starts enabled (`stop`/`restart`, §4.1.8).
    pub start_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            min_threshold: 64 * 1024,
            growth_multiplier: 2.0,
            start_enabled: true,
        }
    }
}

/// Execution-engine limits (spec.md §4.2.1 "Frames are stored in a bounded array").
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Maximum number of live call frames before `CallStackOverflow`.
    pub max_call_depth: usize,
    /// Initial register-stack capacity; grows as needed.
    pub initial_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 200,
            initial_stack_size: 256,
        }
    }
}
