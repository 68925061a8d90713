//! Cross-module scenarios exercising the public `Runtime` surface end to
//! end, without a compiler front end (spec.md §8 seed scenarios),
//! grounded on the teacher's own source-level integration tests, just
//! rebuilt at the bytecode layer since this crate has no parser.

use regvm_core::builder::ProtoBuilder;
use regvm_core::opcode::OpCode;
use regvm_core::{GcConfig, LuaResult, Runtime, Value, VmConfig};

fn fresh_runtime() -> Runtime {
    Runtime::new(GcConfig::default(), VmConfig::default())
}

fn closure(rt: &mut Runtime, b: ProtoBuilder) -> Value {
    let proto = b.build(rt.heap_mut());
    Value::Obj(rt.heap_mut().alloc_closure(proto, Vec::new()))
}

#[test]
fn index_chain_walks_through_nested_tables() {
    let mut rt = fresh_runtime();

    // base = { greeting = "hi" }; mid with __index = base; top with __index = mid.
    let base = rt.heap_mut().alloc_table();
    let greeting_key = rt.heap_mut().alloc_string("greeting");
    let greeting_val = rt.heap_mut().alloc_string("hi");
    rt.heap_mut()
        .tables
        .get_mut(base.idx)
        .set(&Value::Obj(greeting_key), Value::Obj(greeting_val))
        .unwrap();

    let mid = rt.heap_mut().alloc_table();
    let mid_mt = rt.heap_mut().alloc_table();
    let index_key = rt.heap_mut().alloc_string("__index");
    rt.heap_mut()
        .tables
        .get_mut(mid_mt.idx)
        .set(&Value::Obj(index_key), Value::Obj(base))
        .unwrap();
    rt.heap_mut().tables.get_mut(mid.idx).metatable = Some(mid_mt);

    let top = rt.heap_mut().alloc_table();
    let top_mt = rt.heap_mut().alloc_table();
    rt.heap_mut()
        .tables
        .get_mut(top_mt.idx)
        .set(&Value::Obj(index_key), Value::Obj(mid))
        .unwrap();
    rt.heap_mut().tables.get_mut(top.idx).metatable = Some(top_mt);

    let mut b = ProtoBuilder::new("=chain").max_stack(4);
    let top_const = b.konst(Value::Obj(top));
    let key_const = b.konst(Value::Obj(greeting_key));
    b.abc(OpCode::LoadK, 0, top_const, 0);
    b.abc(OpCode::GetField, 1, 0, key_const);
    b.abc(OpCode::Return1, 1, 0, 0);
    let f = closure(&mut rt, b);

    let v = rt.call_value(f, &[]).expect("index chain should resolve");
    let Value::Obj(r) = v else { panic!("expected a string result") };
    assert_eq!(rt.heap().strings.get(r.idx).bytes.as_ref(), "hi");
}

#[test]
fn pcall_reports_failure_without_unwinding_the_host() {
    let mut rt = fresh_runtime();

    let mut b = ProtoBuilder::new("=boom").max_stack(4);
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.abc(OpCode::Add, 2, 0, 1);
    b.abc(OpCode::Return1, 2, 0, 0);
    let f = closure(&mut rt, b);

    let (ok, _) = rt.call_protected(f, &[]).expect("out of memory should not occur here");
    assert!(!ok);

    // The host runtime is still usable after a caught failure.
    let mut b2 = ProtoBuilder::new("=after").max_stack(2);
    b2.asbx(OpCode::LoadI, 0, 7);
    b2.abc(OpCode::Return1, 0, 0, 0);
    let f2 = closure(&mut rt, b2);
    let v = rt.call_value(f2, &[]).expect("runtime should still work after a caught error");
    assert_eq!(v, Value::Int(7));
}

#[test]
fn weak_keyed_table_drops_entry_after_owner_is_collected() {
    let mut rt = fresh_runtime();

    let weak = rt.heap_mut().alloc_table();
    let weak_mt = rt.heap_mut().alloc_table();
    let mode_key = rt.heap_mut().alloc_string("__mode");
    let mode_val = rt.heap_mut().alloc_string("k");
    rt.heap_mut()
        .tables
        .get_mut(weak_mt.idx)
        .set(&Value::Obj(mode_key), Value::Obj(mode_val))
        .unwrap();
    rt.heap_mut().tables.get_mut(weak.idx).metatable = Some(weak_mt);

    let owner = rt.heap_mut().alloc_table();
    rt.heap_mut()
        .tables
        .get_mut(weak.idx)
        .set(&Value::Obj(owner), Value::Bool(true))
        .unwrap();
    assert!(rt
        .heap()
        .tables
        .get(weak.idx)
        .next_key(&Value::Nil)
        .unwrap()
        .is_some());

    // Root the weak table itself through globals so it survives, but let
    // `owner` become unreachable from anywhere else before collecting.
    let globals = rt.globals();
    let weak_key = rt.heap_mut().alloc_string("weak");
    rt.heap_mut()
        .tables
        .get_mut(globals.idx)
        .set(&Value::Obj(weak_key), Value::Obj(weak))
        .unwrap();
    let _ = owner;

    rt.collect();

    assert!(rt
        .heap()
        .tables
        .get(weak.idx)
        .next_key(&Value::Nil)
        .unwrap()
        .is_none());
}

/// A stateless counter iterator: `next = control + 1`; stops once `next`
/// exceeds the state (the upper bound), otherwise yields `(next, next * 10)`.
fn counter_next(rt: &mut Runtime, func_reg: usize, _nargs: usize, _nresults: i32) -> LuaResult<usize> {
    let limit = rt.get(func_reg + 1).as_integer().unwrap_or(0);
    let control = rt.get(func_reg + 2).as_integer().unwrap_or(0);
    let next = control + 1;
    if next > limit {
        Ok(0)
    } else {
        rt.set(func_reg, Value::Int(next));
        rt.set(func_reg + 1, Value::Int(next * 10));
        Ok(2)
    }
}

#[test]
fn generic_for_threads_the_control_variable_through_each_call() {
    let mut rt = fresh_runtime();
    let id = rt.natives_mut().register(counter_next);
    let iter = Value::Obj(rt.heap_mut().alloc_native(id, Vec::new()));

    // r0 = iterator, r1 = state (limit = 3), r2 = control, r5 = sum.
    // TFORCALL/TFORLOOP run three times in a row (no backward jump), each
    // time threading the control variable TFORLOOP writes back into r2
    // through to the next TFORCALL (spec.md §4.2.3 "Generic for").
    let mut b = ProtoBuilder::new("=forin").max_stack(6);
    let iter_const = b.konst(iter);
    b.abc(OpCode::LoadK, 0, iter_const, 0);
    b.asbx(OpCode::LoadI, 1, 3);
    b.asbx(OpCode::LoadI, 2, 0);
    b.asbx(OpCode::LoadI, 5, 0);
    for _ in 0..3 {
        b.abc(OpCode::TForCall, 0, 0, 1);
        b.abx(OpCode::TForLoop, 0, 0);
        b.abc(OpCode::Add, 5, 5, 3);
    }
    b.abc(OpCode::Return1, 5, 0, 0);
    let f = closure(&mut rt, b);

    let v = rt.call_value(f, &[]).expect("generic-for call should succeed");
    assert_eq!(v, Value::Int(1 + 2 + 3));
}
