//! Heap object payloads (spec.md §3: String, Table, Closure, Upvalue,
//! Prototype, Userdata, Thread). Grounded on `lua_value/lua_table.rs`,
//! `lua_value/lua_thread.rs` and `lua_vm/lua_call_frame.rs` in the teacher,
//! simplified from pointer-based GC objects to arena-owned structs addressed
//! by [`GcRef`](crate::value::GcRef).

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::value::{GcRef, Value};
use ahash::RandomState;
use std::cell::Cell;
use std::collections::HashMap;

/// Common header every heap object carries (spec.md §3 "Object header").
/// `mark` is the single bit compared against [`super::Heap::current_mark`];
/// `queued` tracks presence in the gray list so the write barrier and the
/// mark loop never push the same object twice; `fin_queued` is the
/// finalizer-queued flag (spec.md §4.1.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcHeader {
    pub mark: bool,
    pub queued: bool,
    pub fin_queued: bool,
}

impl GcHeader {
    pub fn born(current_mark: bool) -> Self {
        // Born-black: new allocations carry the current cycle's mark
        // (spec.md §4.1.1) so an allocation during marking can't be swept
        // out from under the mutator.
        GcHeader {
            mark: current_mark,
            queued: false,
            fin_queued: false,
        }
    }
}

/// FNV-1a over bytes, truncated to 32 bits (spec.md §3 "String").
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct LuaString {
    pub header: GcHeader,
    pub bytes: Box<str>,
    pub hash: u32,
}

impl LuaString {
    pub fn new(s: &str, current_mark: bool) -> Self {
        LuaString {
            header: GcHeader::born(current_mark),
            bytes: s.into(),
            hash: fnv1a_32(s.as_bytes()),
        }
    }
}

/// `__mode` cache (spec.md §4.1.6), re-read once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakMode {
    Strong,
    WeakKeys,
    WeakValues,
    WeakBoth,
}

/// A table key (spec.md §3 "Table"): nil and NaN are rejected before a
/// [`TableKey`] is ever constructed (spec.md §7 "Table operations").
/// Integer-valued floats normalize to `Int` so `t[1]` and `t[1.0]` are the
/// same slot, mirroring spec.md's integer/float numeric equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Obj(GcRef),
}

impl TableKey {
    pub fn from_value(v: &Value) -> LuaResult<Self> {
        match v {
            Value::Nil => Err(LuaError::new(ErrorKind::Table, "table index is nil")),
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Int(i) => Ok(TableKey::Int(*i)),
            Value::Num(f) => {
                if f.is_nan() {
                    return Err(LuaError::new(ErrorKind::Table, "table index is NaN"));
                }
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Ok(TableKey::Int(*f as i64))
                } else {
                    Ok(TableKey::FloatBits(f.to_bits()))
                }
            }
            Value::Obj(r) => Ok(TableKey::Obj(*r)),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            TableKey::Bool(b) => Value::Bool(b),
            TableKey::Int(i) => Value::Int(i),
            TableKey::FloatBits(bits) => Value::Num(f64::from_bits(bits)),
            TableKey::Obj(r) => Value::Obj(r),
        }
    }
}

/// spec.md §3 "Table": array part for the dense 1..N sequence plus a hash
/// part for everything else, with a metatable pointer and a cached weak mode.
pub struct LuaTable {
    pub header: GcHeader,
    array: Vec<Value>,
    map: HashMap<TableKey, Value, RandomState>,
    pub metatable: Option<GcRef>,
    pub weak_mode: Cell<Option<WeakMode>>,
}

impl LuaTable {
    pub fn new(current_mark: bool) -> Self {
        LuaTable {
            header: GcHeader::born(current_mark),
            array: Vec::new(),
            map: HashMap::default(),
            metatable: None,
            weak_mode: Cell::new(None),
        }
    }

    pub fn get(&self, key: &Value) -> Value {
        if let Value::Int(i) = key {
            if *i >= 1 && (*i as usize) <= self.array.len() {
                return self.array[*i as usize - 1];
            }
        }
        let Ok(k) = TableKey::from_value(key) else {
            return Value::Nil;
        };
        if let TableKey::Int(i) = k {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1];
            }
        }
        self.map.get(&k).copied().unwrap_or(Value::Nil)
    }

    pub fn get_str(&self, key: GcRef) -> Value {
        self.map
            .get(&TableKey::Obj(key))
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1];
        }
        self.map
            .get(&TableKey::Int(i))
            .copied()
            .unwrap_or(Value::Nil)
    }

    /// Raw set, bypassing `__newindex` (the dispatcher decides whether to
    /// delegate based on whether the key is already present, spec.md
    /// §4.3 "`__newindex` resolution").
    pub fn set(&mut self, key: &Value, value: Value) -> LuaResult<()> {
        let k = TableKey::from_value(key)?;
        if let TableKey::Int(i) = k {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                if value.is_nil() && i as usize == self.array.len() {
                    // shrink a trailing nil off the array part
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                }
                return Ok(());
            }
            if i as usize == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                // absorb any contiguous successors already sitting in the map
                let mut next = self.array.len() as i64 + 1;
                while let Some(v) = self.map.remove(&TableKey::Int(next)) {
                    self.array.push(v);
                    next += 1;
                }
                return Ok(());
            }
        }
        if value.is_nil() {
            self.map.remove(&k);
        } else {
            self.map.insert(k, value);
        }
        Ok(())
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        !self.get(key).is_nil()
    }

    /// Sequence length: "the largest N such that keys 1..N are all non-nil"
    /// (spec.md §3 "Table"). The dense array part already maintains this
    /// invariant by construction, so length is just its size, unless the map
    /// part happens to continue the sequence contiguously.
    pub fn length(&self) -> i64 {
        let mut n = self.array.len() as i64;
        while self.map.contains_key(&TableKey::Int(n + 1)) {
            n += 1;
        }
        n
    }

    /// `next(table, key)` for generic `for`/`pairs`: array part first, in
    /// order, then the hash part in iteration (unordered) order.
    pub fn next_key(&self, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        if key.is_nil() {
            if let Some(v) = self.array.first() {
                if !v.is_nil() {
                    return Ok(Some((Value::Int(1), *v)));
                }
            }
            return Ok(self.first_map_entry());
        }
        if let Value::Int(i) = key {
            if *i >= 1 && (*i as usize) < self.array.len() {
                let next_idx = *i as usize; // 0-based index of i+1
                if !self.array[next_idx].is_nil() {
                    return Ok(Some((Value::Int(*i + 1), self.array[next_idx])));
                }
            }
            if *i >= 1 && (*i as usize) == self.array.len() {
                return Ok(self.first_map_entry());
            }
        }
        let k = TableKey::from_value(key)?;
        let mut found = false;
        for (stored_key, stored_val) in self.map.iter() {
            if found {
                return Ok(Some((stored_key.to_value(), *stored_val)));
            }
            if *stored_key == k {
                found = true;
            }
        }
        if found {
            Ok(None)
        } else {
            Err(LuaError::new(
                ErrorKind::Table,
                "invalid key to 'next'",
            ))
        }
    }

    fn first_map_entry(&self) -> Option<(Value, Value)> {
        self.map.iter().next().map(|(k, v)| (k.to_value(), *v))
    }

    pub fn array_part(&self) -> &[Value] {
        &self.array
    }

    /// Used by the list-set bulk instruction (spec.md §4.2.3 "Tables") to
    /// write a contiguous run starting at a 1-based index directly into the
    /// array part without going through [`LuaTable::set`] per element.
    pub fn set_range(&mut self, start: i64, values: &[Value]) {
        for (i, v) in values.iter().enumerate() {
            let idx = start + i as i64;
            let _ = self.set(&Value::Int(idx), *v);
        }
    }

    /// Every key/value pair, for GC child scanning (spec.md §4.1.4).
    pub fn for_each_entry(&self, mut f: impl FnMut(Value, Value)) {
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                f(Value::Int(i as i64 + 1), *v);
            }
        }
        for (k, v) in self.map.iter() {
            f(k.to_value(), *v);
        }
    }

    /// Delete any entry whose weak side (per `mode`) is white, used by the
    /// post-sweep weak-table pass (spec.md §4.1.6).
    pub fn purge_weak(&mut self, mode: WeakMode, mut is_white: impl FnMut(Value) -> bool) {
        match mode {
            WeakMode::Strong => {}
            WeakMode::WeakValues => {
                for v in self.array.iter_mut() {
                    if !v.is_nil() && is_white(*v) {
                        *v = Value::Nil;
                    }
                }
                self.map.retain(|_, v| !is_white(*v));
            }
            WeakMode::WeakKeys => {
                // array-part keys (1..N) are immediate integers, never white.
                self.map
                    .retain(|k, _| !is_white(k.to_value()));
            }
            WeakMode::WeakBoth => {
                for v in self.array.iter_mut() {
                    if !v.is_nil() && is_white(*v) {
                        *v = Value::Nil;
                    }
                }
                self.map
                    .retain(|k, v| !is_white(k.to_value()) && !is_white(*v));
            }
        }
    }
}

/// Which parent register/upvalue a nested closure captures from
/// (spec.md §6 "Prototype object fields").
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub from_stack: bool,
    pub index: u8,
}

/// Immutable after materialization (spec.md §3 "Prototype").
pub struct Proto {
    pub header: GcHeader,
    pub constants: Vec<Value>,
    pub code: Vec<u32>,
    pub protos: Vec<GcRef>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub upvals: Vec<UpvalDesc>,
    /// Chunk name, cloned on every error-location lookup (`Runtime::location`);
    /// `SmolStr` keeps that clone free of a heap allocation for the common
    /// short-filename case.
    pub source: smol_str::SmolStr,
    pub lines: Vec<u32>,
}

impl Proto {
    pub fn line_at(&self, pc: u32) -> u32 {
        self.lines.get(pc as usize).copied().unwrap_or(0)
    }
}

/// A scripted closure: prototype + bound upvalues (spec.md §3 "Closure").
pub struct Closure {
    pub header: GcHeader,
    pub proto: GcRef,
    pub upvalues: Vec<GcRef>,
}

/// Identifies a native function in the host's dispatch table
/// (spec.md §6 "Native function dispatch").
pub struct NativeClosure {
    pub header: GcHeader,
    pub id: u32,
    /// Upvalues a native closure captured at creation time, for native
    /// functions that want closure-like state (e.g. a bound native iterator).
    pub upvalues: Vec<Value>,
}

/// Open while the captured stack slot is live; closed afterward
/// (spec.md §3 "Upvalue").
pub enum UpvalueState {
    /// Index into the owning frame's stack window.
    Open(usize),
    Closed(Value),
}

pub struct Upvalue {
    pub header: GcHeader,
    pub state: UpvalueState,
}

pub struct Userdata {
    pub header: GcHeader,
    pub bytes: Vec<u8>,
    pub user_values: Vec<Value>,
    pub metatable: Option<GcRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Running,
    Normal,
    Dead,
}

/// Cooperative coroutine wrapper (spec.md §3 "Thread"). The coroutine
/// library itself is out of scope (spec.md §1); this is the minimal shape
/// that lets the collector mark a thread's owned VM state via a callback
/// (spec.md §4.1.4 "thread") even though this crate only ever instantiates
/// the one main thread.
pub struct Thread {
    pub header: GcHeader,
    pub status: ThreadStatus,
}

impl Thread {
    pub fn main(current_mark: bool) -> Self {
        Thread {
            header: GcHeader::born(current_mark),
            status: ThreadStatus::Running,
        }
    }
}
