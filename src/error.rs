//! Error taxonomy (spec.md §7).
//!
//! Grounded on `lua_vm/lua_error.rs` in the teacher: a small `Copy` kind enum
//! plus a message. The teacher keeps the message in a side channel on the VM
//! to keep `Result<T, LuaError>` one byte wide on the hot path; this crate's
//! dispatch loop already allocates for concatenation and string building, so
//! we fold the message into the variant instead and accept the larger
//! `Result`.

use crate::value::Value;
use std::fmt;

/// The error kinds named in spec.md §7, used by hosts to branch on taxonomy
/// without parsing `Display` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out-of-range program counter, unknown opcode, missing EXTRAARG.
    BytecodeIntegrity,
    /// Frame overflow, or calling a non-callable value with no `__call`.
    CallStack,
    /// Type mismatch with no metamethod; divide/mod by zero; bad int conversion.
    Arithmetic,
    /// Order-comparison type mismatch with no metamethod.
    OrderComparison,
    /// Non-numeric for-loop parameters, or a zero step.
    ForLoop,
    /// Nil/NaN table key, or indexing a non-table with no `__index`.
    Table,
    /// `__metatable` present: `setmetatable` refused.
    MetatableProtection,
    /// Length of a value with no `__len` and no sequence meaning.
    Length,
    /// A value raised through the error primitive (any `Value`, not just a string).
    Raised,
    /// Allocation failed. Never caught by a protected frame (spec.md §4.2.5).
    OutOfMemory,
}

/// A raised runtime failure. Carries the taxonomy kind plus either a
/// formatted `"<source>:<line>: <text>"` message or, for [`ErrorKind::Raised`],
/// the raw value passed to the error primitive (protected callers receive it
/// verbatim per spec.md §7 "User-visible format").
#[derive(Debug, Clone)]
pub struct LuaError {
    kind: ErrorKind,
    message: String,
    raised: Option<Value>,
}

impl LuaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        LuaError {
            kind,
            message: message.into(),
            raised: None,
        }
    }

    /// Build a `"<source>:<line>: <text>"` message per spec.md §7.
    pub fn at(kind: ErrorKind, source: &str, line: u32, text: impl fmt::Display) -> Self {
        LuaError::new(kind, format!("{}:{}: {}", source, line, text))
    }

    /// A user-raised, non-string value (the error primitive may raise anything).
    pub fn raised(value: Value, message: impl Into<String>) -> Self {
        LuaError {
            kind: ErrorKind::Raised,
            message: message.into(),
            raised: Some(value),
        }
    }

    pub fn out_of_memory() -> Self {
        LuaError::new(ErrorKind::OutOfMemory, "not enough memory")
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw value a protected call should hand back as its second result.
    /// Defaults to a string value built from `message()` for non-`Raised` kinds;
    /// callers that need the real `Value` (string-interned) should build it from
    /// `message()` via the heap when the kind is not `Raised`.
    pub fn raised_value(&self) -> Option<&Value> {
        self.raised.as_ref()
    }

    /// Out-of-memory is the only kind a protected frame must not catch
    /// (spec.md §4.2.5, §7 "Propagation policy").
    #[inline]
    pub fn is_catchable(&self) -> bool {
        self.kind != ErrorKind::OutOfMemory
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;
