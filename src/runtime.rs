//! The shared runtime state (spec.md §2 "Runtime state", §4.4 "Reentrant
//! Call API"), ~5%+5% of the system. Grounded on `lua_vm/lua_state.rs` in
//! the teacher: a growable register stack, a bounded call-frame array, and
//! an open-upvalue list ordered for the close protocol — simplified from
//! the teacher's hash-map-assisted lookup to the plain linear scan spec.md
//! §4.2.4 describes, since this crate does not need the teacher's O(1)
//! fast path.

use crate::config::{GcConfig, VmConfig};
use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::frame::{CallFrame, WantResults};
use crate::gc::{GcHooks, Heap, UpvalueState};
use crate::metamethod::{MetaHooks, MetaKeys, PrimitiveType, SharedMetatables};
use crate::native::NativeRegistry;
use crate::value::{GcRef, ObjKind, Value};

/// Every piece of state a single-VM embedding needs, laid out the way
/// spec.md §2 enumerates it: value/object layers live in [`Heap`], this
/// struct owns everything above it. Only one VM (thread) is instantiated
/// in this crate's scope (spec.md §5), so "root provider" is just this
/// struct's own [`Runtime::mark_roots`] rather than a registry of many.
pub struct Runtime {
    heap: Heap,
    meta_keys: MetaKeys,
    shared_metatables: SharedMetatables,
    globals: GcRef,
    registry: GcRef,
    main_thread: GcRef,
    natives: NativeRegistry,

    /// The shared register stack all frames index into (spec.md §4.2.1
    /// "stack base (R[0] for this frame)"). Grows as needed, never shrinks.
    stack: Vec<Value>,
    top: usize,
    frames: Vec<CallFrame>,
    vm_config: VmConfig,

    /// Open upvalues, ordered by descending stack address (spec.md §4.2.4).
    open_upvalues: Vec<GcRef>,

    /// Depth at which the currently-running reentrant call (if any) must
    /// stop (spec.md §4.4 step 3 "runs the dispatcher until the depth
    /// returns to the saved value").
    depth_floor: usize,
}

impl Runtime {
    pub fn new(gc_config: GcConfig, vm_config: VmConfig) -> Self {
        let mut heap = Heap::new(gc_config);
        let meta_keys = MetaKeys::new(&mut heap);
        let globals = heap.alloc_table();
        let registry = heap.alloc_table();
        let main_thread = heap.alloc_main_thread();
        heap.mark_roots_ready();
        let stack = vec![Value::Nil; vm_config.initial_stack_size];
        Runtime {
            heap,
            meta_keys,
            shared_metatables: SharedMetatables::default(),
            globals,
            registry,
            main_thread,
            natives: NativeRegistry::new(),
            stack,
            top: 0,
            frames: Vec::new(),
            vm_config,
            open_upvalues: Vec::new(),
            depth_floor: 0,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn globals(&self) -> GcRef {
        self.globals
    }

    pub fn registry(&self) -> GcRef {
        self.registry
    }

    pub fn main_thread(&self) -> GcRef {
        self.main_thread
    }

    pub fn meta_keys(&self) -> &MetaKeys {
        &self.meta_keys
    }

    pub fn shared_metatables(&self) -> &SharedMetatables {
        &self.shared_metatables
    }

    pub fn set_shared_metatable(&mut self, p: PrimitiveType, mt: Option<GcRef>) {
        self.shared_metatables.set(p, mt);
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// `"<source>:<line>"` for the currently executing instruction, the
    /// same location prefix engine errors are built from (spec.md §3
    /// "Runtime errors carry a source position"). Empty when there is no
    /// active frame.
    pub fn where_am_i(&self) -> String {
        let (source, line) = self.location();
        if source.is_empty() {
            String::new()
        } else {
            format!("{source}:{line}")
        }
    }

    /// `(source, line)` pair version of [`Self::where_am_i`], for callers
    /// building their own message format (e.g. [`crate::error::LuaError::at`]).
    pub fn location(&self) -> (String, u32) {
        let Some(frame) = self.current_frame() else {
            return (String::new(), 0);
        };
        let proto = self.heap().protos.get(frame.proto.idx);
        (proto.source.to_string(), proto.line_at(frame.pc.saturating_sub(1)))
    }

    // -----------------------------------------------------------------
    // Register stack
    // -----------------------------------------------------------------

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn set_top(&mut self, top: usize) {
        self.reserve(top);
        if top < self.top {
            for v in &mut self.stack[top..self.top] {
                *v = Value::Nil;
            }
        }
        self.top = top;
    }

    pub fn reserve(&mut self, upto: usize) {
        if upto > self.stack.len() {
            self.stack.resize(upto + 64, Value::Nil);
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Value {
        self.stack.get(idx).copied().unwrap_or(Value::Nil)
    }

    #[inline]
    pub fn set(&mut self, idx: usize, v: Value) {
        self.reserve(idx + 1);
        self.stack[idx] = v;
    }

    pub fn push(&mut self, v: Value) {
        self.reserve(self.top + 1);
        self.stack[self.top] = v;
        self.top += 1;
    }

    // -----------------------------------------------------------------
    // Call frames (spec.md §4.2.1)
    // -----------------------------------------------------------------

    pub fn push_frame(&mut self, frame: CallFrame) -> LuaResult<()> {
        if self.frames.len() >= self.vm_config.max_call_depth {
            return Err(LuaError::new(ErrorKind::CallStack, "stack overflow"));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    // -----------------------------------------------------------------
    // Open upvalues (spec.md §4.2.4)
    // -----------------------------------------------------------------

    /// Get or create an open upvalue for `stack_index`, scanning the
    /// descending-address list for an exact match or insertion point.
    pub fn find_or_create_upvalue(&mut self, stack_index: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            if let UpvalueState::Open(idx) = self.heap.upvalues.get(r.idx).state {
                if idx == stack_index {
                    return r;
                }
                if idx < stack_index {
                    insert_at = i;
                    break;
                }
            }
        }
        let r = self.heap.alloc_upvalue(UpvalueState::Open(stack_index));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    /// Close every open upvalue at or above `level` (spec.md §4.2.4).
    pub fn close_upvalues_from(&mut self, level: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|&r| {
            let keep = match self.heap.upvalues.get(r.idx).state {
                UpvalueState::Open(idx) => idx < level,
                UpvalueState::Closed(_) => true,
            };
            if !keep {
                if let UpvalueState::Open(idx) = self.heap.upvalues.get(r.idx).state {
                    let v = stack.get(idx).copied().unwrap_or(Value::Nil);
                    self.heap.upvalues.get_mut(r.idx).state = UpvalueState::Closed(v);
                }
            }
            keep
        });
    }

    pub fn read_upvalue(&self, r: GcRef) -> Value {
        match self.heap.upvalues.get(r.idx).state {
            UpvalueState::Open(idx) => self.get(idx),
            UpvalueState::Closed(v) => v,
        }
    }

    pub fn write_upvalue(&mut self, r: GcRef, v: Value) {
        match self.heap.upvalues.get(r.idx).state {
            UpvalueState::Open(idx) => self.set(idx, v),
            UpvalueState::Closed(_) => {
                self.heap.upvalues.get_mut(r.idx).state = UpvalueState::Closed(v);
            }
        }
        self.heap.write_barrier(r, v);
    }

    // -----------------------------------------------------------------
    // Garbage collection orchestration (spec.md §4.1.3)
    // -----------------------------------------------------------------

    pub fn maybe_collect(&mut self, requested: usize) {
        if self.heap.should_auto_collect(requested) {
            self.collect();
        }
    }

    /// Run a cycle immediately unless collection is inhibited (spec.md
    /// §4.1.8 `step()`), regardless of the threshold.
    pub fn step(&mut self) {
        if !self.heap.is_inhibited() {
            self.collect();
        }
    }

    /// Run one full mark/sweep cycle (spec.md §4.1.3). This crate is the
    /// sole root provider (see DESIGN.md "root-provider registry").
    pub fn collect(&mut self) {
        self.heap.begin_mark_phase();
        self.mark_roots();
        loop {
            let hooks = MetaHooks { keys: &self.meta_keys };
            self.heap.drain_gray(&hooks);
            let ephemeron_changed = self.heap.ephemeron_pass();
            let finalizers_changed = self.heap.enqueue_finalizers(&hooks);
            if !ephemeron_changed && !finalizers_changed {
                break;
            }
        }
        self.heap.purge_weak_tables();
        self.heap.sweep();
    }

    fn mark_roots(&mut self) {
        self.heap.mark_ref(self.globals);
        self.heap.mark_ref(self.registry);
        self.heap.mark_ref(self.main_thread);
        self.meta_keys.mark(&mut self.heap);
        self.shared_metatables.mark(&mut self.heap);
        for frame in &self.frames {
            self.heap.mark_ref(frame.proto);
            if let Some(c) = frame.closure {
                self.heap.mark_ref(c);
            }
        }
        for v in &self.stack[..self.top] {
            self.heap.mark_value(*v);
        }
        for &r in &self.open_upvalues {
            self.heap.mark_ref(r);
        }
    }

    /// Drain the finalizer queue at a safe point (spec.md §4.1.7): runs
    /// each `__gc` with automatic collection inhibited, swallowing errors.
    pub fn run_finalizers(&mut self) {
        let pending = self.heap.take_finalizers();
        if pending.is_empty() {
            return;
        }
        self.heap.inhibit();
        for (obj, f) in pending {
            let _ = self.call_value(f, &[Value::Obj(obj)]);
        }
        self.heap.allow();
    }

    // -----------------------------------------------------------------
    // Reentrant call API (spec.md §4.4)
    // -----------------------------------------------------------------

    /// Invoke `f` with `args`, synchronously, returning its first result
    /// (`nil` if it returned none). Used by natives, finalizers, and
    /// metamethod dispatch.
    pub fn call_value(&mut self, f: Value, args: &[Value]) -> LuaResult<Value> {
        let results = self.call_for_results(f, args, 1)?;
        Ok(results.into_iter().next().unwrap_or(Value::Nil))
    }

    /// Like [`Runtime::call_value`] but returns every result (used by
    /// generic-`for` iterator invocation, spec.md §4.2.3 "Generic for").
    pub fn call_for_results(&mut self, f: Value, args: &[Value], nresults: i32) -> LuaResult<Vec<Value>> {
        let saved_top = self.top;
        let saved_depth = self.frames.len();
        let saved_floor = self.depth_floor;

        let func_reg = self.top;
        self.set_top(func_reg + 1 + args.len());
        self.set(func_reg, f);
        for (i, a) in args.iter().enumerate() {
            self.set(func_reg + 1 + i, *a);
        }

        let result = self.dispatch_call(func_reg, args.len(), nresults, saved_depth, true);
        self.depth_floor = saved_floor;
        if result.is_err() {
            crate::dispatch::unwind_frames(self, saved_depth, None);
        }

        let out = result.map(|_| {
            let produced = self.top.saturating_sub(func_reg);
            (0..produced).map(|i| self.get(func_reg + i)).collect()
        });
        self.set_top(saved_top);
        out
    }

    /// Run `f(args)` under protection: failures are caught and translated
    /// to the `(false, raised_value)` convention instead of propagating
    /// (spec.md §4.2.3 "Protected call", §4.2.5). `pcall`-style natives are
    /// built on this rather than on an in-bytecode protected-call flag,
    /// since this crate's `CALL` encoding carries no such bit — the
    /// teacher's own `pcall` is likewise a native built over its C-call
    /// convention rather than a bytecode variant (see DESIGN.md).
    pub fn call_protected(&mut self, f: Value, args: &[Value]) -> LuaResult<(bool, Vec<Value>)> {
        let saved_top = self.top;
        match self.call_for_results(f, args, -1) {
            Ok(results) => Ok((true, results)),
            Err(e) if !e.is_catchable() => {
                // Out-of-memory propagates past any protected frame
                // (spec.md §4.2.5 "Propagation policy").
                Err(e)
            }
            Err(e) => {
                self.set_top(saved_top);
                let raised = e.raised_value().copied().unwrap_or_else(|| {
                    Value::Obj(self.heap.alloc_string(e.message()))
                });
                Ok((false, vec![raised]))
            }
        }
    }

    /// Dispatch by callee kind. When `drive` is set, a scripted callee is
    /// run to completion via a nested dispatcher loop before returning
    /// (used by reentrant call sites that have no enclosing instruction
    /// loop to pick the new frame back up); otherwise the frame is pushed
    /// and left for the caller's own loop to continue fetching from
    /// (used by the in-bytecode `CALL`/`TAILCALL` instructions).
    pub(crate) fn dispatch_call(
        &mut self,
        func_reg: usize,
        nargs: usize,
        nresults: i32,
        return_depth: usize,
        drive: bool,
    ) -> LuaResult<()> {
        let callee = self.get(func_reg);
        match callee {
            Value::Obj(r) if r.kind == ObjKind::NativeClosure => {
                let id = self.heap.natives.get(r.idx).id;
                let f = self
                    .natives
                    .get(id)
                    .unwrap_or_else(|| panic!("unknown native function id {id}: broken registration"));
                let produced = f(self, func_reg, nargs, nresults)?;
                self.finish_native_results(func_reg, produced, nresults);
                Ok(())
            }
            Value::Obj(r) if r.kind == ObjKind::Closure => {
                self.enter_closure(r, func_reg, nargs, nresults)?;
                if !drive {
                    return Ok(());
                }
                let prior_floor = self.depth_floor;
                self.depth_floor = return_depth;
                let result = crate::dispatch::run_until(self, return_depth);
                self.depth_floor = prior_floor;
                result
            }
            other => {
                let key = self.meta_keys.get(crate::metamethod::MetaKey::Call);
                let mt = crate::metamethod::metatable_of(&self.heap, &other, &self.shared_metatables);
                let call_mm = mt.map(|mt| crate::metamethod::raw_meta_get(&self.heap, mt, key));
                match call_mm {
                    Some(f) if !f.is_nil() => {
                        let args: Vec<Value> = (0..nargs).map(|i| self.get(func_reg + 1 + i)).collect();
                        let mut all = vec![other];
                        all.extend(args);
                        self.set(func_reg, f);
                        for (i, a) in all.into_iter().enumerate() {
                            self.set(func_reg + i, a);
                        }
                        self.dispatch_call(func_reg, nargs + 1, nresults, return_depth, drive)
                    }
                    _ => Err(LuaError::new(
                        ErrorKind::CallStack,
                        format!("attempt to call a {} value", other.type_name()),
                    )),
                }
            }
        }
    }

    pub(crate) fn finish_native_results(&mut self, func_reg: usize, produced: usize, nresults: i32) {
        let want = match nresults {
            n if n < 0 => produced,
            n => n as usize,
        };
        for i in produced..want {
            self.set(func_reg + i, Value::Nil);
        }
        self.set_top(func_reg + want);
    }

    /// Push a frame for a scripted closure, shifting arguments down,
    /// filling missing fixed parameters with nil, and stashing the rest
    /// as varargs (spec.md §4.2.3 "Calls and returns").
    pub(crate) fn enter_closure(
        &mut self,
        closure: GcRef,
        func_reg: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<()> {
        let proto_ref = self.heap.closures.get(closure.idx).proto;
        let proto = self.heap.protos.get(proto_ref.idx);
        let num_params = proto.num_params as usize;
        let is_vararg = proto.is_vararg;
        let max_stack = proto.max_stack as usize;

        let base = func_reg + 1;
        let (vararg_base, vararg_count, frame_base) = if is_vararg && nargs > num_params {
            let extra = nargs - num_params;
            let new_base = base + nargs;
            self.reserve(new_base + max_stack);
            for i in 0..num_params {
                let v = self.get(base + i);
                self.set(new_base + i, v);
            }
            // Fixed params are copied (not moved) to `new_base`, so the
            // excess args are still sitting untouched at base+num_params
            // (spec.md §4.2.3 "store excess as varargs").
            (base + num_params, extra as u32, new_base)
        } else {
            (base, 0, base)
        };
        for i in nargs..num_params {
            self.set(frame_base + i, Value::Nil);
        }
        self.reserve(frame_base + max_stack + 8);
        self.set_top(frame_base + max_stack.max(num_params));

        let want = match nresults {
            n if n < 0 => WantResults::Variable,
            n => WantResults::Fixed(n as u32),
        };
        let mut frame = CallFrame::new(proto_ref, Some(closure), frame_base, func_reg, want);
        if is_vararg && nargs > num_params {
            frame.vararg_base = vararg_base;
            frame.vararg_count = vararg_count;
        }
        self.push_frame(frame)
    }

    pub fn depth_floor(&self) -> usize {
        self.depth_floor
    }
}

impl GcHooks for Runtime {
    fn weak_mode(&self, heap: &Heap, metatable: GcRef) -> crate::gc::WeakMode {
        MetaHooks { keys: &self.meta_keys }.weak_mode(heap, metatable)
    }

    fn finalizer(&self, heap: &Heap, metatable: GcRef) -> Option<Value> {
        MetaHooks { keys: &self.meta_keys }.finalizer(heap, metatable)
    }
}
