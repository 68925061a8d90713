//! The garbage collector (spec.md §4.1), ~25% of the system.
//!
//! A non-moving, tri-color, incremental-*capable* (stepped synchronously,
//! never interleaved with the mutator — spec.md §1 Non-goals) mark-and-sweep
//! collector. Grounded on `gc/mod.rs` in the teacher, but deliberately
//! simplified from its generational three-mode design down to the single
//! flip-mark incremental scheme spec.md §4.1.2 actually describes: one mark
//! bit per object, a single global "current mark" that flips each cycle so
//! every surviving object goes white for free, rather than the teacher's
//! explicit `GcColor`/`GcAge`/generational-barrier machinery. Objects live in
//! per-kind arenas addressed by index (spec.md §9 "Arena + indices vs.
//! pointers") instead of the teacher's raw pointers, so indices stay valid
//! across a cycle without `unsafe`.

mod intern;
mod object;

pub use intern::StringInterner;
pub use object::*;

use crate::config::GcConfig;
use crate::value::{GcRef, ObjKind, Value};

/// Lets the collector answer the questions child-scanning and finalizer
/// enqueue cannot answer from arena data alone: what a table's `__mode`
/// string says (spec.md §4.1.6), and whether a metatable carries a `__gc`
/// function (spec.md §4.1.7). Both require the interned metamethod key
/// strings and string-content table lookups, which live with the runtime
/// that owns this heap, not with `Heap` itself.
pub trait GcHooks {
    fn weak_mode(&self, heap: &Heap, metatable: GcRef) -> WeakMode;
    fn finalizer(&self, heap: &Heap, metatable: GcRef) -> Option<Value>;
}

/// A generic arena: stable indices, a free-list for reuse, and a
/// per-slot size so sweep can keep `bytes_allocated` exact.
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    sizes: Vec<u32>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            sizes: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn alloc(&mut self, value: T, size: u32) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(value);
            self.sizes[idx as usize] = size;
            idx
        } else {
            self.slots.push(Some(value));
            self.sizes.push(size);
            (self.slots.len() - 1) as u32
        }
    }

    pub fn get(&self, idx: u32) -> &T {
        self.slots[idx as usize]
            .as_ref()
            .expect("dangling GcRef: slot already freed")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize]
            .as_mut()
            .expect("dangling GcRef: slot already freed")
    }

    /// Sweep: calls `keep` for every live slot; if it returns `false` the
    /// slot is freed and its size returned to the caller for accounting.
    /// Returns `(bytes_freed, objects_freed)`.
    fn sweep(&mut self, mut keep: impl FnMut(u32, &mut T) -> bool) -> (usize, usize) {
        let mut freed_bytes = 0usize;
        let mut freed_objs = 0usize;
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_none() {
                continue;
            }
            let alive = keep(idx as u32, self.slots[idx].as_mut().unwrap());
            if !alive {
                freed_bytes += self.sizes[idx] as usize;
                freed_objs += 1;
                self.slots[idx] = None;
                self.free.push(idx as u32);
            }
        }
        (freed_bytes, freed_objs)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u32, v)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collection_count: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub objects_collected: usize,
}

/// The heap (spec.md §2 "Garbage collector").
pub struct Heap {
    pub strings: Arena<LuaString>,
    pub tables: Arena<LuaTable>,
    pub closures: Arena<Closure>,
    pub natives: Arena<NativeClosure>,
    pub upvalues: Arena<Upvalue>,
    pub userdata: Arena<Userdata>,
    pub protos: Arena<Proto>,
    pub threads: Arena<Thread>,

    interner: StringInterner,

    /// The reference bit: an object is marked iff its header's `mark`
    /// field equals this (spec.md §4.1.2).
    current_mark: bool,
    /// `true` for the duration of mark phase; the write barrier is a no-op
    /// outside it (spec.md §4.1.5).
    in_mark_phase: bool,
    gray: Vec<GcRef>,
    /// Tables recorded as weak (`__mode` containing `k` and/or `v`) during
    /// this cycle's child scanning (spec.md §4.1.6).
    weak_tables_seen: Vec<GcRef>,
    /// `(object, __gc function)` pairs enqueued this cycle, drained by the
    /// host at a safe point (spec.md §4.1.7).
    finalizer_queue: Vec<(GcRef, Value)>,

    bytes_allocated: usize,
    threshold: usize,
    config: GcConfig,
    auto_enabled: bool,
    inhibit_depth: u32,
    roots_ready: bool,
    stats: GcStats,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        let threshold = config.min_threshold;
        Heap {
            strings: Arena::default(),
            tables: Arena::default(),
            closures: Arena::default(),
            natives: Arena::default(),
            upvalues: Arena::default(),
            userdata: Arena::default(),
            protos: Arena::default(),
            threads: Arena::default(),
            interner: StringInterner::new(),
            current_mark: true,
            in_mark_phase: false,
            gray: Vec::with_capacity(128),
            weak_tables_seen: Vec::new(),
            finalizer_queue: Vec::new(),
            bytes_allocated: 0,
            threshold,
            auto_enabled: config.start_enabled,
            config,
            inhibit_depth: 0,
            roots_ready: false,
            stats: GcStats::default(),
        }
    }

    pub fn mark_roots_ready(&mut self) {
        self.roots_ready = true;
    }

    fn current_mark(&self) -> bool {
        self.current_mark
    }

    // ---------------------------------------------------------------
    // Allocation (spec.md §4.1.1)
    // ---------------------------------------------------------------

    /// Whether the caller should run a full cycle before the next
    /// allocation of `requested` bytes.
    pub fn should_auto_collect(&self, requested: usize) -> bool {
        self.auto_enabled
            && self.inhibit_depth == 0
            && self.roots_ready
            && self.bytes_allocated + requested > self.threshold
    }

    fn track_alloc(&mut self, size: usize) {
        self.bytes_allocated += size;
        self.stats.bytes_allocated += size;
    }

    pub fn alloc_string(&mut self, s: &str) -> GcRef {
        let hash = fnv1a_32(s.as_bytes());
        for &idx in self.interner.candidates(hash) {
            if self.strings.get(idx).bytes.as_ref() == s {
                // Resurrect if condemned but not yet swept.
                self.strings.get_mut(idx).header.mark = self.current_mark;
                return GcRef::new(ObjKind::String, idx);
            }
        }
        let size = (std::mem::size_of::<LuaString>() + s.len()) as u32;
        let idx = self.strings.alloc(LuaString::new(s, self.current_mark), size);
        self.interner.insert(hash, idx);
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::String, idx)
    }

    pub fn alloc_table(&mut self) -> GcRef {
        let size = std::mem::size_of::<LuaTable>() as u32;
        let idx = self.tables.alloc(LuaTable::new(self.current_mark), size);
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Table, idx)
    }

    pub fn alloc_closure(&mut self, proto: GcRef, upvalues: Vec<GcRef>) -> GcRef {
        let size = (std::mem::size_of::<Closure>() + upvalues.len() * 4) as u32;
        let idx = self.closures.alloc(
            Closure {
                header: GcHeader::born(self.current_mark),
                proto,
                upvalues,
            },
            size,
        );
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Closure, idx)
    }

    pub fn alloc_native(&mut self, id: u32, upvalues: Vec<Value>) -> GcRef {
        let size = std::mem::size_of::<NativeClosure>() as u32;
        let idx = self.natives.alloc(
            NativeClosure {
                header: GcHeader::born(self.current_mark),
                id,
                upvalues,
            },
            size,
        );
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::NativeClosure, idx)
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> GcRef {
        let size = std::mem::size_of::<Upvalue>() as u32;
        let idx = self.upvalues.alloc(
            Upvalue {
                header: GcHeader::born(self.current_mark),
                state,
            },
            size,
        );
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Upvalue, idx)
    }

    pub fn alloc_userdata(&mut self, bytes: Vec<u8>, nuservalues: usize) -> GcRef {
        let size = (std::mem::size_of::<Userdata>() + bytes.len()) as u32;
        let idx = self.userdata.alloc(
            Userdata {
                header: GcHeader::born(self.current_mark),
                bytes,
                user_values: vec![Value::Nil; nuservalues],
                metatable: None,
            },
            size,
        );
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Userdata, idx)
    }

    pub fn alloc_proto(&mut self, mut proto: Proto) -> GcRef {
        let size = (std::mem::size_of::<Proto>() + proto.code.len() * 4) as u32;
        proto.header = GcHeader::born(self.current_mark);
        let idx = self.protos.alloc(proto, size);
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Proto, idx)
    }

    pub fn alloc_main_thread(&mut self) -> GcRef {
        let size = std::mem::size_of::<Thread>() as u32;
        let idx = self.threads.alloc(Thread::main(self.current_mark), size);
        self.track_alloc(size as usize);
        GcRef::new(ObjKind::Thread, idx)
    }

    // ---------------------------------------------------------------
    // Mark phase (spec.md §4.1.3)
    // ---------------------------------------------------------------

    pub fn begin_mark_phase(&mut self) {
        self.current_mark = !self.current_mark;
        self.gray.clear();
        self.weak_tables_seen.clear();
        for t in self.tables.iter_mut() {
            t.1.weak_mode.set(None);
        }
        self.in_mark_phase = true;
    }

    /// Mark a value reachable, greying it if it was white
    /// (spec.md §4.1.3 step 3, and used throughout child scanning).
    pub fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.as_obj() {
            self.mark_ref(r);
        }
    }

    pub fn mark_ref(&mut self, r: GcRef) {
        let header = self.header_mut(r);
        if header.mark != self.current_mark {
            header.mark = self.current_mark;
            header.queued = true;
            self.gray.push(r);
        }
    }

    fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r.kind {
            ObjKind::String => &mut self.strings.get_mut(r.idx).header,
            ObjKind::Table => &mut self.tables.get_mut(r.idx).header,
            ObjKind::Closure => &mut self.closures.get_mut(r.idx).header,
            ObjKind::NativeClosure => &mut self.natives.get_mut(r.idx).header,
            ObjKind::Upvalue => &mut self.upvalues.get_mut(r.idx).header,
            ObjKind::Userdata => &mut self.userdata.get_mut(r.idx).header,
            ObjKind::Proto => &mut self.protos.get_mut(r.idx).header,
            ObjKind::Thread => &mut self.threads.get_mut(r.idx).header,
        }
    }

    pub fn is_white(&self, r: GcRef) -> bool {
        let mark = match r.kind {
            ObjKind::String => self.strings.get(r.idx).header.mark,
            ObjKind::Table => self.tables.get(r.idx).header.mark,
            ObjKind::Closure => self.closures.get(r.idx).header.mark,
            ObjKind::NativeClosure => self.natives.get(r.idx).header.mark,
            ObjKind::Upvalue => self.upvalues.get(r.idx).header.mark,
            ObjKind::Userdata => self.userdata.get(r.idx).header.mark,
            ObjKind::Proto => self.protos.get(r.idx).header.mark,
            ObjKind::Thread => self.threads.get(r.idx).header.mark,
        };
        mark != self.current_mark
    }

    pub fn value_is_white(&self, v: Value) -> bool {
        v.as_obj().map(|r| self.is_white(r)).unwrap_or(false)
    }

    /// Backward write barrier (spec.md §4.1.5): called whenever the mutator
    /// stores `child` into a field of `parent`. A no-op outside mark phase;
    /// otherwise, if `parent` is black, re-gray it so the next drain rescans
    /// it and picks up the new reference.
    pub fn write_barrier(&mut self, parent: GcRef, child: Value) {
        if !self.in_mark_phase {
            return;
        }
        if self.value_is_white(child) && !self.is_white(parent) {
            let header = self.header_mut(parent);
            if !header.queued {
                header.queued = true;
                self.gray.push(parent);
            }
        }
    }

    /// Drain the gray list: scan one object's children per pop, marking
    /// each gray, until empty (spec.md §4.1.3 step 5). `hooks` answers the
    /// one question child-scanning cannot answer from arena data alone:
    /// what a table's `__mode` string says (spec.md §4.1.6).
    pub fn drain_gray(&mut self, hooks: &dyn GcHooks) {
        while let Some(r) = self.gray.pop() {
            self.header_mut(r).queued = false;
            self.scan_children(r, hooks);
        }
    }

    fn scan_children(&mut self, r: GcRef, hooks: &dyn GcHooks) {
        match r.kind {
            ObjKind::String | ObjKind::NativeClosure => {
                // Native closures carry captured Values, not GcRefs alone
                // where applicable; mark those.
                if r.kind == ObjKind::NativeClosure {
                    let upvals = self.natives.get(r.idx).upvalues.clone();
                    for v in upvals {
                        self.mark_value(v);
                    }
                }
            }
            ObjKind::Table => {
                let mt = self.tables.get(r.idx).metatable;
                if let Some(mt) = mt {
                    self.mark_ref(mt);
                }
                let mode = self.table_weak_mode(r.idx, mt, hooks);
                match mode {
                    WeakMode::Strong => {
                        let entries: Vec<(Value, Value)> = {
                            let mut v = Vec::new();
                            self.tables.get(r.idx).for_each_entry(|k, val| v.push((k, val)));
                            v
                        };
                        for (k, v) in entries {
                            self.mark_value(k);
                            self.mark_value(v);
                        }
                    }
                    WeakMode::WeakValues => {
                        let keys: Vec<Value> = {
                            let mut v = Vec::new();
                            self.tables.get(r.idx).for_each_entry(|k, _| v.push(k));
                            v
                        };
                        for k in keys {
                            self.mark_value(k);
                        }
                        self.weak_tables_seen.push(r);
                    }
                    WeakMode::WeakKeys | WeakMode::WeakBoth => {
                        // deferred to the ephemeron pass
                        self.weak_tables_seen.push(r);
                    }
                }
            }
            ObjKind::Closure => {
                let c = self.closures.get(r.idx);
                let proto = c.proto;
                let upvalues = c.upvalues.clone();
                self.mark_ref(proto);
                for u in upvalues {
                    self.mark_ref(u);
                }
            }
            ObjKind::Upvalue => {
                // Open upvalues are rooted through the owning frame's stack
                // scan (spec.md §4.1.4); only closed upvalues own a value here.
                if let UpvalueState::Closed(v) = self.upvalues.get(r.idx).state {
                    self.mark_value(v);
                }
            }
            ObjKind::Userdata => {
                let u = self.userdata.get(r.idx);
                let mt = u.metatable;
                let uvs = u.user_values.clone();
                if let Some(mt) = mt {
                    self.mark_ref(mt);
                }
                for v in uvs {
                    self.mark_value(v);
                }
            }
            ObjKind::Proto => {
                let p = self.protos.get(r.idx);
                let consts = p.constants.clone();
                let nested = p.protos.clone();
                for c in consts {
                    self.mark_value(c);
                }
                for n in nested {
                    self.mark_ref(n);
                }
            }
            ObjKind::Thread => {
                // The owning VM's stack/frames are marked by the runtime's
                // root-marking pass directly (spec.md §4.1.4 "thread");
                // there is exactly one thread object in this crate's scope.
            }
        }
    }

    fn table_weak_mode(&mut self, idx: u32, metatable: Option<GcRef>, hooks: &dyn GcHooks) -> WeakMode {
        if let Some(cached) = self.tables.get(idx).weak_mode.get() {
            return cached;
        }
        let mode = match metatable {
            Some(mt) => hooks.weak_mode(self, mt),
            None => WeakMode::Strong,
        };
        self.tables.get(idx).weak_mode.set(Some(mode));
        mode
    }

    /// Ephemeron fixpoint pass (spec.md §4.1.3 step 6): for each recorded
    /// weak-keys/weak-both table, mark the value of every entry whose key
    /// is already marked. Returns whether anything changed, so the caller
    /// can interleave with `drain_gray` until a pass is a no-op.
    pub fn ephemeron_pass(&mut self) -> bool {
        let mut changed = false;
        let tables = self.weak_tables_seen.clone();
        for t in tables {
            let mode = self.tables.get(t.idx).weak_mode.get().unwrap_or(WeakMode::Strong);
            if !matches!(mode, WeakMode::WeakKeys | WeakMode::WeakBoth) {
                continue;
            }
            let entries: Vec<(Value, Value)> = {
                let mut v = Vec::new();
                self.tables.get(t.idx).for_each_entry(|k, val| v.push((k, val)));
                v
            };
            for (k, v) in entries {
                let key_reachable = k.as_obj().map(|r| !self.is_white(r)).unwrap_or(true);
                if key_reachable && self.value_is_white(v) {
                    self.mark_value(v);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Finalizer enqueue (spec.md §4.1.7). Scans tables and userdata only
    /// (the two kinds a `__gc` metamethod is meaningful on); objects that
    /// are still white, have a metatable with `__gc`, and are not already
    /// queued get appended to the finalizer queue and marked reachable
    /// (both the object and its `__gc` function) so they survive to run.
    pub fn enqueue_finalizers(&mut self, hooks: &dyn GcHooks) -> bool {
        let mut newly_queued = Vec::new();
        let table_idxs: Vec<u32> = self
            .tables
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect();
        for idx in table_idxs {
            let r = GcRef::new(ObjKind::Table, idx);
            let t = self.tables.get(idx);
            let mt = t.metatable;
            if self.is_white(r) && !t.header.fin_queued {
                if let Some(mt) = mt {
                    if let Some(f) = hooks.finalizer(self, mt) {
                        newly_queued.push((r, f));
                    }
                }
            }
        }
        let userdata_idxs: Vec<u32> = self
            .userdata
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect();
        for idx in userdata_idxs {
            let r = GcRef::new(ObjKind::Userdata, idx);
            let u = self.userdata.get(idx);
            let mt = u.metatable;
            if self.is_white(r) && !u.header.fin_queued {
                if let Some(mt) = mt {
                    if let Some(f) = hooks.finalizer(self, mt) {
                        newly_queued.push((r, f));
                    }
                }
            }
        }
        let any = !newly_queued.is_empty();
        for (r, f) in newly_queued {
            self.header_mut(r).fin_queued = true;
            self.mark_ref(r);
            self.mark_value(f);
            self.finalizer_queue.push((r, f));
        }
        any
    }

    pub fn take_finalizers(&mut self) -> Vec<(GcRef, Value)> {
        std::mem::take(&mut self.finalizer_queue)
    }

    /// Purge weak-table entries whose weak side is white. Must run while
    /// mark bits are still valid — i.e. before `sweep` reclaims slots
    /// (spec.md §4.1.6 resolved here as "before physical reclamation", see
    /// DESIGN.md for the ordering rationale).
    pub fn purge_weak_tables(&mut self) {
        let tables = std::mem::take(&mut self.weak_tables_seen);
        for t in &tables {
            let mode = self.tables.get(t.idx).weak_mode.get().unwrap_or(WeakMode::Strong);
            let whites: std::collections::HashSet<GcRef> = {
                let mut set = std::collections::HashSet::new();
                let entries: Vec<(Value, Value)> = {
                    let mut v = Vec::new();
                    self.tables.get(t.idx).for_each_entry(|k, val| v.push((k, val)));
                    v
                };
                for (k, v) in entries {
                    if let Some(r) = k.as_obj() {
                        if self.is_white(r) {
                            set.insert(r);
                        }
                    }
                    if let Some(r) = v.as_obj() {
                        if self.is_white(r) {
                            set.insert(r);
                        }
                    }
                }
                set
            };
            self.tables.get_mut(t.idx).purge_weak(mode, |v| {
                v.as_obj().map(|r| whites.contains(&r)).unwrap_or(false)
            });
        }
    }

    // ---------------------------------------------------------------
    // Sweep (spec.md §4.1.3 "Sweep phase")
    // ---------------------------------------------------------------

    pub fn sweep(&mut self) {
        self.in_mark_phase = false;
        let mark = self.current_mark;
        let mut freed = 0usize;
        let mut freed_objs = 0usize;

        let interner = &mut self.interner;
        let mut acc = |pair: (usize, usize)| {
            freed += pair.0;
            freed_objs += pair.1;
        };
        acc(self.strings.sweep(|_idx, s| {
            let alive = s.header.mark == mark;
            if !alive {
                interner.remove(s.hash, _idx);
            }
            alive
        }));
        acc(self.tables.sweep(|_, t| t.header.mark == mark));
        acc(self.closures.sweep(|_, c| c.header.mark == mark));
        acc(self.natives.sweep(|_, n| n.header.mark == mark));
        acc(self.upvalues.sweep(|_, u| u.header.mark == mark));
        acc(self.userdata.sweep(|_, u| u.header.mark == mark));
        acc(self.protos.sweep(|_, p| p.header.mark == mark));
        acc(self.threads.sweep(|_, t| t.header.mark == mark));

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.stats.bytes_freed += freed;
        self.stats.objects_collected += freed_objs;
        self.stats.collection_count += 1;
        self.threshold = (self.bytes_allocated as f64 * self.config.growth_multiplier)
            .max(self.config.min_threshold as f64) as usize;
    }

    // ---------------------------------------------------------------
    // Controls (spec.md §4.1.8)
    // ---------------------------------------------------------------

    pub fn stop(&mut self) {
        self.auto_enabled = false;
    }

    pub fn restart(&mut self) {
        self.auto_enabled = true;
    }

    pub fn inhibit(&mut self) {
        self.inhibit_depth += 1;
    }

    pub fn allow(&mut self) {
        self.inhibit_depth = self.inhibit_depth.saturating_sub(1);
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibit_depth > 0
    }

    pub fn track_external(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub fn untrack_external(&mut self, bytes: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
    }

    pub fn mem_kb_and_bytes(&self) -> (usize, usize) {
        (self.bytes_allocated / 1024, self.bytes_allocated % 1024)
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}
