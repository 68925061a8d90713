//! Metamethod keys and resolution (spec.md §4.3), ~10% of the system.
//! Grounded on `TmKind` in `lua_vm/execute/metamethod.rs` in the teacher —
//! same enumeration of tag-method kinds and the "look up on p1, then p2"
//! binary-operator shape — adapted to intern the key strings through this
//! crate's own [`Heap`] rather than the teacher's static C-string table.
//!
//! Dispatch of the actual call (pushing a frame, running the nested
//! execute-until-return loop for synchronous comparisons) lives in
//! `dispatch.rs`/`runtime.rs`, which call back into the resolution helpers
//! here; this module only answers "what metamethod, if any, applies".

use crate::gc::{GcHooks, Heap, WeakMode};
use crate::value::{GcRef, ObjKind, Value};

/// Every metamethod key the engine interns once at startup and holds as a
/// root (spec.md §4.3 "Interned key strings for every metamethod").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    Band,
    Bor,
    Bxor,
    Shl,
    Shr,
    Unm,
    Bnot,
    Index,
    NewIndex,
    Call,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
    Gc,
    Close,
    ToString,
    Metatable,
    Name,
    Pairs,
    Mode,
}

impl MetaKey {
    const ALL: [MetaKey; 28] = [
        MetaKey::Add,
        MetaKey::Sub,
        MetaKey::Mul,
        MetaKey::Mod,
        MetaKey::Pow,
        MetaKey::Div,
        MetaKey::IDiv,
        MetaKey::Band,
        MetaKey::Bor,
        MetaKey::Bxor,
        MetaKey::Shl,
        MetaKey::Shr,
        MetaKey::Unm,
        MetaKey::Bnot,
        MetaKey::Index,
        MetaKey::NewIndex,
        MetaKey::Call,
        MetaKey::Len,
        MetaKey::Concat,
        MetaKey::Eq,
        MetaKey::Lt,
        MetaKey::Le,
        MetaKey::Gc,
        MetaKey::Close,
        MetaKey::ToString,
        MetaKey::Metatable,
        MetaKey::Name,
        MetaKey::Pairs,
        MetaKey::Mode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetaKey::Add => "__add",
            MetaKey::Sub => "__sub",
            MetaKey::Mul => "__mul",
            MetaKey::Mod => "__mod",
            MetaKey::Pow => "__pow",
            MetaKey::Div => "__div",
            MetaKey::IDiv => "__idiv",
            MetaKey::Band => "__band",
            MetaKey::Bor => "__bor",
            MetaKey::Bxor => "__bxor",
            MetaKey::Shl => "__shl",
            MetaKey::Shr => "__shr",
            MetaKey::Unm => "__unm",
            MetaKey::Bnot => "__bnot",
            MetaKey::Index => "__index",
            MetaKey::NewIndex => "__newindex",
            MetaKey::Call => "__call",
            MetaKey::Len => "__len",
            MetaKey::Concat => "__concat",
            MetaKey::Eq => "__eq",
            MetaKey::Lt => "__lt",
            MetaKey::Le => "__le",
            MetaKey::Gc => "__gc",
            MetaKey::Close => "__close",
            MetaKey::ToString => "__tostring",
            MetaKey::Metatable => "__metatable",
            MetaKey::Name => "__name",
            MetaKey::Pairs => "__pairs",
            MetaKey::Mode => "__mode",
        }
    }
}

/// The interned string for each [`MetaKey`], held as GC roots by the
/// runtime (spec.md §4.1.3 mark-phase step 4 "Mark ... interned metamethod
/// key strings").
pub struct MetaKeys {
    keys: [GcRef; MetaKey::ALL.len()],
}

impl MetaKeys {
    pub fn new(heap: &mut Heap) -> Self {
        let mut keys = [GcRef::new(ObjKind::String, 0); MetaKey::ALL.len()];
        for mk in MetaKey::ALL {
            keys[mk as usize] = heap.alloc_string(mk.name());
        }
        MetaKeys { keys }
    }

    pub fn get(&self, mk: MetaKey) -> GcRef {
        self.keys[mk as usize]
    }

    pub fn mark(&self, heap: &mut Heap) {
        for r in self.keys {
            heap.mark_ref(r);
        }
    }
}

/// Which shared metatable slot a non-table, non-userdata value uses
/// (spec.md §4.3 "primitives -> the shared metatable registered for that
/// primitive type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Nil,
    Boolean,
    Number,
    String,
    Function,
    Thread,
}

impl PrimitiveType {
    pub const COUNT: usize = 6;

    pub fn of(v: &Value) -> Option<Self> {
        match v {
            Value::Nil => Some(PrimitiveType::Nil),
            Value::Bool(_) => Some(PrimitiveType::Boolean),
            Value::Int(_) | Value::Num(_) => Some(PrimitiveType::Number),
            Value::Obj(r) => match r.kind {
                ObjKind::String => Some(PrimitiveType::String),
                ObjKind::Closure | ObjKind::NativeClosure => Some(PrimitiveType::Function),
                ObjKind::Thread => Some(PrimitiveType::Thread),
                ObjKind::Table | ObjKind::Userdata => None,
                ObjKind::Upvalue | ObjKind::Proto => None,
            },
        }
    }
}

/// Read a metamethod key out of a metatable, bypassing `__index`: `nil` if
/// absent (spec.md §4.3). Helper shared by every resolution function below.
pub fn raw_meta_get(heap: &Heap, metatable: GcRef, key: GcRef) -> Value {
    heap.tables.get(metatable.idx).get_str(key)
}

/// Look up `key` on `v`'s metatable, given a way to resolve a metatable for
/// tables/userdata/primitives. `shared` answers the primitive case; tables
/// and userdata carry their own metatable pointer directly.
pub fn lookup(
    heap: &Heap,
    v: &Value,
    key: MetaKey,
    keys: &MetaKeys,
    shared: &SharedMetatables,
) -> Option<Value> {
    let mt = metatable_of(heap, v, shared)?;
    let found = raw_meta_get(heap, mt, keys.get(key));
    if found.is_nil() { None } else { Some(found) }
}

pub fn metatable_of(heap: &Heap, v: &Value, shared: &SharedMetatables) -> Option<GcRef> {
    match v {
        Value::Obj(r) if r.kind == ObjKind::Table => heap.tables.get(r.idx).metatable,
        Value::Obj(r) if r.kind == ObjKind::Userdata => heap.userdata.get(r.idx).metatable,
        _ => PrimitiveType::of(v).and_then(|p| shared.get(p)),
    }
}

/// **Arithmetic/bitwise fast-then-slow** (spec.md §4.3): look up the
/// operator's metamethod on the first operand, then the second.
pub fn lookup_binop(
    heap: &Heap,
    a: &Value,
    b: &Value,
    key: MetaKey,
    keys: &MetaKeys,
    shared: &SharedMetatables,
) -> Option<Value> {
    lookup(heap, a, key, keys, shared).or_else(|| lookup(heap, b, key, keys, shared))
}

/// The shared primitive metatable registry (spec.md §4.3), owned by the
/// runtime. Tables and userdata are excluded since they carry their own.
#[derive(Default)]
pub struct SharedMetatables {
    slots: [Option<GcRef>; PrimitiveType::COUNT],
}

impl SharedMetatables {
    pub fn get(&self, p: PrimitiveType) -> Option<GcRef> {
        self.slots[p as usize]
    }

    pub fn set(&mut self, p: PrimitiveType, mt: Option<GcRef>) {
        self.slots[p as usize] = mt;
    }

    pub fn mark(&self, heap: &mut Heap) {
        for slot in self.slots.iter().flatten() {
            heap.mark_ref(*slot);
        }
    }
}

/// Implements [`GcHooks`] over a [`MetaKeys`] table, letting the collector
/// read `__mode`/`__gc` without knowing about metamethods itself. Built
/// fresh from borrowed references each cycle by the runtime (spec.md
/// §4.1.6, §4.1.7).
pub struct MetaHooks<'a> {
    pub keys: &'a MetaKeys,
}

impl<'a> GcHooks for MetaHooks<'a> {
    fn weak_mode(&self, heap: &Heap, metatable: GcRef) -> WeakMode {
        let mode_key = self.keys.get(MetaKey::Mode);
        let raw = raw_meta_get(heap, metatable, mode_key);
        let Value::Obj(r) = raw else {
            return WeakMode::Strong;
        };
        if r.kind != ObjKind::String {
            return WeakMode::Strong;
        }
        let s = &heap.strings.get(r.idx).bytes;
        let (k, v) = (s.contains('k'), s.contains('v'));
        match (k, v) {
            (true, true) => WeakMode::WeakBoth,
            (true, false) => WeakMode::WeakKeys,
            (false, true) => WeakMode::WeakValues,
            (false, false) => WeakMode::Strong,
        }
    }

    fn finalizer(&self, heap: &Heap, metatable: GcRef) -> Option<Value> {
        let gc_key = self.keys.get(MetaKey::Gc);
        let f = raw_meta_get(heap, metatable, gc_key);
        if f.is_nil() { None } else { Some(f) }
    }
}
