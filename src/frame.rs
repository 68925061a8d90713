//! The call frame (spec.md §4.2.1), ~7% of the system. Grounded on
//! `lua_vm/call_info.rs` in the teacher's `CallInfo`, trimmed to what this
//! scope needs: no coroutine-yield bookkeeping (`CIST_YPCALL`, `CIST_RECST`,
//! pending-metamethod-resume slots), since yielding across native calls is
//! out of scope here (spec.md §5 "Suspension points").

use crate::value::GcRef;

/// Number of expected results from a call; `Fixed(n)` or "as many as
/// returned" (spec.md §4.2.3 "Calls and returns", C=0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantResults {
    Fixed(u32),
    Variable,
}

/// A single call-stack entry (spec.md §4.2.1). Frames live in a bounded
/// `Vec` owned by the runtime; the "previous-frame link" the spec calls
/// for is just the preceding element, so there is no explicit link field
/// here.
#[derive(Clone)]
pub struct CallFrame {
    /// The prototype being executed.
    pub proto: GcRef,
    /// The closure that owns this invocation, for upvalue access. `None`
    /// only for the reentrant-call API's synthetic top frame, which never
    /// reads an upvalue.
    pub closure: Option<GcRef>,
    /// Index of the next instruction to fetch.
    pub pc: u32,
    /// R[0] for this frame, an index into the shared register stack.
    pub base: usize,
    /// Where in the *caller's* frame results get copied back to.
    pub return_base: usize,
    /// How many results the caller asked for.
    pub want_results: WantResults,
    /// Index of the first vararg slot (set by `VARARGPREP`), and how many.
    pub vararg_base: usize,
    pub vararg_count: u32,
    /// To-be-closed registers, relative to `base`; bit `i` marks register
    /// `base + i` as needing `__close` on scope exit (spec.md §4.2.3
    /// "Close & to-be-closed"). 64 bits bounds `max_stack` the same way
    /// the teacher's prototype format does.
    pub tbc_bitmap: u64,
}

impl CallFrame {
    pub fn new(proto: GcRef, closure: Option<GcRef>, base: usize, return_base: usize, want_results: WantResults) -> Self {
        CallFrame {
            proto,
            closure,
            pc: 0,
            base,
            return_base,
            want_results,
            vararg_base: 0,
            vararg_count: 0,
            tbc_bitmap: 0,
        }
    }

    /// Mark register `base + offset` as to-be-closed (spec.md §4.2.3 "TBC").
    pub fn mark_tbc(&mut self, offset: u32) {
        debug_assert!(offset < 64, "to-be-closed register offset out of bitmap range");
        self.tbc_bitmap |= 1u64 << offset;
    }

    pub fn clear_tbc(&mut self, offset: u32) {
        self.tbc_bitmap &= !(1u64 << offset);
    }

    /// The highest-marked TBC register, in decreasing order, as the
    /// close protocol requires (spec.md §4.2.3, §5 "Scoped acquisition").
    pub fn highest_tbc(&self) -> Option<u32> {
        if self.tbc_bitmap == 0 {
            None
        } else {
            Some(63 - self.tbc_bitmap.leading_zeros())
        }
    }

    pub fn has_tbc_at_or_above(&self, offset: u32) -> bool {
        if offset >= 64 {
            false
        } else {
            (self.tbc_bitmap >> offset) != 0
        }
    }
}
