//! Arithmetic, bitwise, comparison and concatenation fast paths
//! (spec.md §4.2.3 "Arithmetic"/"Bitwise"/"Comparisons"/"Concatenation").
//! Each function here is the *fast path only*: a `None` return means the
//! type combination doesn't qualify and the caller (`dispatch.rs`) must
//! fall back to the corresponding metamethod (spec.md §4.3). Grounded on
//! the integer/double promotion rules in `lua_value/lua_value.rs`'s
//! arithmetic helpers in the teacher, reimplemented over the safe `Value`
//! enum instead of the unsafe tagged union.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::opcode::Instruction;
use crate::value::Value;
use std::cmp::Ordering;

/// Integer `+`/`-`/`*` promote to double on overflow (spec.md §4.2.3).
macro_rules! int_arith_or_promote {
    ($a:expr, $b:expr, $checked:ident, $float_op:tt) => {
        match $a.$checked($b) {
            Some(r) => Value::Int(r),
            None => Value::Num(($a as f64) $float_op ($b as f64)),
        }
    };
}

pub fn add(a: Value, b: Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(int_arith_or_promote!(x, y, checked_add, +)),
        _ => numeric_pair(a, b).map(|(x, y)| Value::Num(x + y)),
    }
}

pub fn sub(a: Value, b: Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(int_arith_or_promote!(x, y, checked_sub, -)),
        _ => numeric_pair(a, b).map(|(x, y)| Value::Num(x - y)),
    }
}

pub fn mul(a: Value, b: Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(int_arith_or_promote!(x, y, checked_mul, *)),
        _ => numeric_pair(a, b).map(|(x, y)| Value::Num(x * y)),
    }
}

/// `/` always produces a double (spec.md §4.2.3).
pub fn div(a: Value, b: Value) -> Option<Value> {
    numeric_pair(a, b).map(|(x, y)| Value::Num(x / y))
}

/// `^` always produces a double (spec.md §4.2.3).
pub fn pow(a: Value, b: Value) -> Option<Value> {
    numeric_pair(a, b).map(|(x, y)| Value::Num(x.powf(y)))
}

/// Floor division. Integer `MIN_INT / -1` promotes to double (spec.md §8
/// "Boundary behaviors"); integer division by zero fails, matching the
/// teacher's integer-division error but letting the float path follow
/// IEEE semantics (inf/nan) rather than erroring, since spec.md only
/// describes the integer case's failure explicitly (see DESIGN.md).
pub fn idiv(a: Value, b: Value) -> LuaResult<Option<Value>> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        if y == 0 {
            return Err(LuaError::new(ErrorKind::Arithmetic, "attempt to perform 'n//0'"));
        }
        return Ok(Some(match x.checked_div_euclid(y) {
            Some(q) => Value::Int(floor_div_i64(x, y, q)),
            None => Value::Num((x as f64 / y as f64).floor()),
        }));
    }
    Ok(numeric_pair(a, b).map(|(x, y)| Value::Num((x / y).floor())))
}

fn floor_div_i64(x: i64, y: i64, euclid_q: i64) -> i64 {
    // `checked_div_euclid` rounds toward negative infinity only when the
    // remainder's sign already matches; adjust the remaining case.
    let r = x - euclid_q * y;
    if r != 0 && (r < 0) != (y < 0) {
        euclid_q - 1
    } else {
        euclid_q
    }
}

/// `a - floor(a/b)*b` (spec.md §4.2.3); division by zero fails for the
/// integer path, same rationale as [`idiv`].
pub fn modulo(a: Value, b: Value) -> LuaResult<Option<Value>> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        if y == 0 {
            return Err(LuaError::new(ErrorKind::Arithmetic, "attempt to perform 'n%%0'"));
        }
        let r = x.wrapping_rem(y);
        let r = if r != 0 && (r < 0) != (y < 0) { r + y } else { r };
        return Ok(Some(Value::Int(r)));
    }
    Ok(numeric_pair(a, b).map(|(x, y)| {
        let r = x % y;
        Value::Num(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
    }))
}

/// Unary minus preserves integer typing, promoting only at the `MIN_INT`
/// boundary (spec.md §4.2.3 "For `-x`: preserve integer typing").
pub fn unm(a: Value) -> Option<Value> {
    match a {
        Value::Int(x) => Some(match x.checked_neg() {
            Some(r) => Value::Int(r),
            None => Value::Num(-(x as f64)),
        }),
        Value::Num(x) => Some(Value::Num(-x)),
        _ => None,
    }
}

fn numeric_pair(a: Value, b: Value) -> Option<(f64, f64)> {
    Some((a.as_number()?, b.as_number()?))
}

// ---------------------------------------------------------------------
// Bitwise (spec.md §4.2.3 "Bitwise")
// ---------------------------------------------------------------------

/// Integers or whole-number doubles convert; anything else signals the
/// caller to try a metamethod.
fn as_bitwise_int(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Num(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Some(f as i64)
        }
        _ => None,
    }
}

fn bitwise_pair(a: Value, b: Value) -> Option<(i64, i64)> {
    Some((as_bitwise_int(a)?, as_bitwise_int(b)?))
}

pub fn band(a: Value, b: Value) -> Option<Value> {
    bitwise_pair(a, b).map(|(x, y)| Value::Int(x & y))
}

pub fn bor(a: Value, b: Value) -> Option<Value> {
    bitwise_pair(a, b).map(|(x, y)| Value::Int(x | y))
}

pub fn bxor(a: Value, b: Value) -> Option<Value> {
    bitwise_pair(a, b).map(|(x, y)| Value::Int(x ^ y))
}

pub fn bnot(a: Value) -> Option<Value> {
    as_bitwise_int(a).map(|x| Value::Int(!x))
}

/// `<<`/`>>` saturate past 63 bits and reverse direction on a negative
/// count (spec.md §4.2.3).
pub fn shl(a: Value, b: Value) -> Option<Value> {
    let (x, n) = bitwise_pair(a, b)?;
    let (amount, reversed) = Instruction::normalize_shift(n);
    Some(Value::Int(shift_left(x, amount, reversed)))
}

pub fn shr(a: Value, b: Value) -> Option<Value> {
    let (x, n) = bitwise_pair(a, b)?;
    let (amount, reversed) = Instruction::normalize_shift(n);
    Some(Value::Int(shift_left(x, amount, !reversed)))
}

fn shift_left(x: i64, amount: u32, reversed: bool) -> i64 {
    if amount >= 64 {
        0
    } else if reversed {
        ((x as u64) >> amount) as i64
    } else {
        ((x as u64) << amount) as i64
    }
}

// ---------------------------------------------------------------------
// Comparisons (spec.md §4.2.3 "Comparisons")
// ---------------------------------------------------------------------

/// Numeric fast path across integer/double, then string lexicographic
/// byte order; `None` when neither applies (try `__eq`/`__lt`/`__le`).
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(_) | Value::Num(_), Value::Int(_) | Value::Num(_)) => {
            a.as_number()?.partial_cmp(&b.as_number()?)
        }
        (Value::Obj(ra), Value::Obj(rb))
            if ra.kind == crate::value::ObjKind::String && rb.kind == crate::value::ObjKind::String =>
        {
            None // byte comparison needs heap access; see `compare_strings`.
        }
        _ => None,
    }
}

pub fn compare_strings(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// Numbers compare across integer/double for raw equality (spec.md §3
/// "Equality"); strings/tables/etc. are handled by `Value::raw_equal`.
pub fn numeric_eq(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Int(_) | Value::Num(_), Value::Int(_) | Value::Num(_)) => {
            Some(a.as_number() == b.as_number())
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------
// Concatenation (spec.md §4.2.3 "Concatenation")
// ---------------------------------------------------------------------

/// Strings and numeric primitives concatenate by decimal textual form;
/// anything else returns `None` to signal `__concat` (spec.md §4.2.3).
/// Numbers are formatted with `itoa`/`ryu`-free manual float formatting
/// to match the teacher's dependency-light `tostring` path.
pub fn primitive_text(v: &Value, buf: &mut itoa::Buffer) -> Option<String> {
    match v {
        Value::Int(i) => Some(buf.format(*i).to_string()),
        Value::Num(f) => Some(format_float(*f)),
        _ => None,
    }
}

/// Lua's `%.14g`-style float formatting, approximated: integral doubles
/// print with a trailing `.0`, everything else uses Rust's shortest
/// round-trippable representation.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}
