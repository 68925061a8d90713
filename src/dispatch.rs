//! The instruction dispatcher (spec.md §4.2.2, §4.2.3), ~35% of the
//! system. Grounded on the fetch/decode/execute shape of the teacher's
//! `lua_vm/execute/` tree (one function per instruction family, a shared
//! `LuaState` threaded through), generalized over this crate's safe
//! arena-indexed [`Runtime`] instead of the teacher's raw-pointer state.
//!
//! `run_until` is the only entry point: it steps one instruction at a
//! time until the frame stack depth returns to `floor`. An ordinary
//! `CALL` just pushes a new frame and lets this same loop pick it back up
//! on the next iteration (the frame stack *is* the call stack); only
//! reentrant call sites with no enclosing loop (`Runtime::call_for_results`,
//! metamethod dispatch, generic-`for` iteration) ask [`Runtime::dispatch_call`]
//! to drive a nested copy of this loop to completion instead.

use crate::arith;
use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::frame::WantResults;
use crate::metamethod::{self, MetaKey};
use crate::opcode::{Instruction, OpCode};
use crate::runtime::Runtime;
use crate::value::{GcRef, ObjKind, Value};
use std::cmp::Ordering;

/// Drive the dispatcher until the frame stack depth drops to `floor`
/// (spec.md §2 "Instruction dispatcher ... returning a control-flow
/// token"; folded here into plain `LuaResult` since `Continue` needs no
/// data and `FrameChanged`/`TopLevelReturn` are just "depth changed").
pub fn run_until(rt: &mut Runtime, floor: usize) -> LuaResult<()> {
    while rt.frame_depth() > floor {
        step(rt)?;
    }
    Ok(())
}

fn located(rt: &Runtime, kind: ErrorKind, text: impl std::fmt::Display) -> LuaError {
    let (source, line) = rt.location();
    LuaError::at(kind, &source, line, text)
}

/// Fetch, decode, and execute exactly one instruction from the current
/// top frame (spec.md §4.2.2).
fn step(rt: &mut Runtime) -> LuaResult<()> {
    let frame = rt.current_frame().expect("step with no active frame");
    let proto_ref = frame.proto;
    let base = frame.base;
    let pc = frame.pc;

    let code_len = rt.heap().protos.get(proto_ref.idx).code.len();
    if pc as usize >= code_len {
        return Err(located(rt, ErrorKind::BytecodeIntegrity, "program counter out of range"));
    }
    let word = rt.heap().protos.get(proto_ref.idx).code[pc as usize];
    rt.current_frame_mut().unwrap().pc = pc + 1;

    let op = Instruction::get_op(word)
        .ok_or_else(|| located(rt, ErrorKind::BytecodeIntegrity, "unknown opcode"))?;
    let a = Instruction::get_a(word) as usize;
    let b = Instruction::get_b(word) as usize;
    let c = Instruction::get_c(word) as usize;
    let k = Instruction::get_k(word);
    let bx = Instruction::get_bx(word);
    let sbx = Instruction::get_sbx(word);
    let sj = Instruction::get_sj(word);

    execute(rt, proto_ref, base, op, a, b, c, k, bx, sbx, sj)
}

/// `C`/`B` used as a small signed immediate reuses the same signed-bias
/// convention `Bx`/`Ax` use elsewhere in this crate (offset = max >> 1),
/// in place of choosing between the source's sign- and zero-extended
/// drafts (spec.md §9 Open Questions) — see DESIGN.md.
fn sc(c: usize) -> i64 {
    c as i64 - (Instruction::MAX_C as i64 >> 1)
}

fn sb(b: usize) -> i64 {
    b as i64 - (Instruction::MAX_B as i64 >> 1)
}

fn constant(rt: &Runtime, proto_ref: GcRef, idx: usize) -> Value {
    rt.heap().protos.get(proto_ref.idx).constants[idx]
}

#[allow(clippy::too_many_arguments)]
fn execute(
    rt: &mut Runtime,
    proto_ref: GcRef,
    base: usize,
    op: OpCode,
    a: usize,
    b: usize,
    c: usize,
    k: bool,
    bx: u32,
    sbx: i32,
    sj: i32,
) -> LuaResult<()> {
    use OpCode::*;
    match op {
        Move => {
            let v = rt.get(base + b);
            rt.set(base + a, v);
        }
        LoadK => {
            let v = constant(rt, proto_ref, b);
            rt.set(base + a, v);
        }
        LoadKx => {
            let (ax, new_pc) = fetch_extra_arg(rt, proto_ref)?;
            rt.current_frame_mut().unwrap().pc = new_pc;
            let v = constant(rt, proto_ref, ax as usize);
            rt.set(base + a, v);
        }
        LoadI => {
            rt.set(base + a, Value::Int(sbx as i64));
        }
        LoadF => {
            rt.set(base + a, Value::Num(sbx as f64));
        }
        LoadTrue => rt.set(base + a, Value::Bool(true)),
        LoadFalse => rt.set(base + a, Value::Bool(false)),
        LFalseSkip => {
            rt.set(base + a, Value::Bool(false));
            rt.current_frame_mut().unwrap().pc += 1;
        }
        LoadNil => {
            for i in 0..=b {
                rt.set(base + a + i, Value::Nil);
            }
        }

        Add => arith_rr(rt, base, a, b, c, arith::add, MetaKey::Add)?,
        AddK => arith_rk(rt, proto_ref, base, a, b, c, arith::add, MetaKey::Add)?,
        AddI => arith_ri(rt, base, a, b, c, arith::add, MetaKey::Add)?,
        Sub => arith_rr(rt, base, a, b, c, arith::sub, MetaKey::Sub)?,
        SubK => arith_rk(rt, proto_ref, base, a, b, c, arith::sub, MetaKey::Sub)?,
        SubI => arith_ri(rt, base, a, b, c, arith::sub, MetaKey::Sub)?,
        Mul => arith_rr(rt, base, a, b, c, arith::mul, MetaKey::Mul)?,
        MulK => arith_rk(rt, proto_ref, base, a, b, c, arith::mul, MetaKey::Mul)?,
        MulI => arith_ri(rt, base, a, b, c, arith::mul, MetaKey::Mul)?,
        Div => arith_rr(rt, base, a, b, c, arith::div, MetaKey::Div)?,
        DivK => arith_rk(rt, proto_ref, base, a, b, c, arith::div, MetaKey::Div)?,
        DivI => arith_ri(rt, base, a, b, c, arith::div, MetaKey::Div)?,
        Pow => arith_rr(rt, base, a, b, c, arith::pow, MetaKey::Pow)?,
        PowK => arith_rk(rt, proto_ref, base, a, b, c, arith::pow, MetaKey::Pow)?,
        PowI => arith_ri(rt, base, a, b, c, arith::pow, MetaKey::Pow)?,
        Mod => arith_rr_fallible(rt, base, a, b, c, arith::modulo, MetaKey::Mod)?,
        ModK => arith_rk_fallible(rt, proto_ref, base, a, b, c, arith::modulo, MetaKey::Mod)?,
        ModI => arith_ri_fallible(rt, base, a, b, c, arith::modulo, MetaKey::Mod)?,
        IDiv => arith_rr_fallible(rt, base, a, b, c, arith::idiv, MetaKey::IDiv)?,
        IDivK => arith_rk_fallible(rt, proto_ref, base, a, b, c, arith::idiv, MetaKey::IDiv)?,
        IDivI => arith_ri_fallible(rt, base, a, b, c, arith::idiv, MetaKey::IDiv)?,
        Unm => {
            let x = rt.get(base + b);
            match arith::unm(x) {
                Some(v) => rt.set(base + a, v),
                None => meta_unop(rt, x, MetaKey::Unm, base + a)?,
            }
        }

        Band => bitwise_rr(rt, base, a, b, c, arith::band, MetaKey::Band)?,
        BandK => bitwise_rk(rt, proto_ref, base, a, b, c, arith::band, MetaKey::Band)?,
        Bor => bitwise_rr(rt, base, a, b, c, arith::bor, MetaKey::Bor)?,
        BorK => bitwise_rk(rt, proto_ref, base, a, b, c, arith::bor, MetaKey::Bor)?,
        Bxor => bitwise_rr(rt, base, a, b, c, arith::bxor, MetaKey::Bxor)?,
        BxorK => bitwise_rk(rt, proto_ref, base, a, b, c, arith::bxor, MetaKey::Bxor)?,
        Shl => bitwise_rr(rt, base, a, b, c, arith::shl, MetaKey::Shl)?,
        ShlI => {
            let x = rt.get(base + b);
            let n = Value::Int(sc(c));
            match arith::shl(x, n) {
                Some(v) => rt.set(base + a, v),
                None => meta_binop(rt, x, n, MetaKey::Shl, base + a)?,
            }
        }
        Shr => bitwise_rr(rt, base, a, b, c, arith::shr, MetaKey::Shr)?,
        ShrI => {
            let x = rt.get(base + b);
            let n = Value::Int(sc(c));
            match arith::shr(x, n) {
                Some(v) => rt.set(base + a, v),
                None => meta_binop(rt, x, n, MetaKey::Shr, base + a)?,
            }
        }
        Bnot => {
            let x = rt.get(base + b);
            match arith::bnot(x) {
                Some(v) => rt.set(base + a, v),
                None => meta_unop(rt, x, MetaKey::Bnot, base + a)?,
            }
        }

        Eq => {
            let (x, y) = (rt.get(base + a), rt.get(base + b));
            let cond = value_eq(rt, x, y)?;
            do_skip(rt, cond, k);
        }
        EqK => {
            let x = rt.get(base + a);
            let y = constant(rt, proto_ref, b);
            let cond = value_eq(rt, x, y)?;
            do_skip(rt, cond, k);
        }
        Lt => {
            let (x, y) = (rt.get(base + a), rt.get(base + b));
            let cond = value_lt(rt, x, y)?;
            do_skip(rt, cond, k);
        }
        Le => {
            let (x, y) = (rt.get(base + a), rt.get(base + b));
            let cond = value_le(rt, x, y)?;
            do_skip(rt, cond, k);
        }
        EqI => {
            let x = rt.get(base + a);
            let cond = x.raw_equal(&Value::Int(sb(b)));
            do_skip(rt, cond, k);
        }
        LtI => {
            let x = rt.get(base + a);
            let cond = cmp_imm(rt, x, sb(b))? == Ordering::Less;
            do_skip(rt, cond, k);
        }
        LeI => {
            let x = rt.get(base + a);
            let cond = cmp_imm(rt, x, sb(b))? != Ordering::Greater;
            do_skip(rt, cond, k);
        }
        GtI => {
            let x = rt.get(base + a);
            let cond = cmp_imm(rt, x, sb(b))? == Ordering::Greater;
            do_skip(rt, cond, k);
        }
        GeI => {
            let x = rt.get(base + a);
            let cond = cmp_imm(rt, x, sb(b))? != Ordering::Less;
            do_skip(rt, cond, k);
        }

        Jmp => {
            jump(rt, sj);
        }
        Test => {
            let v = rt.get(base + a);
            do_skip(rt, v.is_truthy(), k);
        }
        TestSet => {
            let v = rt.get(base + b);
            if v.is_truthy() == k {
                rt.set(base + a, v);
            } else {
                rt.current_frame_mut().unwrap().pc += 1;
            }
        }

        ForPrep => exec_for_prep(rt, base, a, bx)?,
        ForLoop => exec_for_loop(rt, base, a, bx),

        TForPrep => enter_loop(rt, bx),
        TForCall => exec_tforcall(rt, base, a, c)?,
        TForLoop => {
            // The loop continues iff the first value TFORCALL produced
            // (at A+3) is non-nil; that value becomes the new control
            // variable at A+2 for the next TFORCALL (spec.md §4.2.3
            // "Generic for").
            let first = rt.get(base + a + 3);
            if !first.is_nil() {
                rt.set(base + a + 2, first);
                loop_back(rt, bx);
            }
        }

        Call => {
            let nargs = if b == 0 { rt.top() - (base + a + 1) } else { b - 1 };
            let nresults = if c == 0 { -1 } else { (c as i32) - 1 };
            rt.dispatch_call(base + a, nargs, nresults, rt.frame_depth(), false)?;
        }
        TailCall => {
            // Approximated as call-then-return (no frame reuse); see
            // DESIGN.md for why true tail elimination is out of scope.
            let nargs = if b == 0 { rt.top() - (base + a + 1) } else { b - 1 };
            rt.dispatch_call(base + a, nargs, -1, rt.frame_depth(), false)?;
            run_until(rt, rt.frame_depth())?;
            let produced = rt.top().saturating_sub(base + a);
            let results: Vec<Value> = (0..produced).map(|i| rt.get(base + a + i)).collect();
            do_return(rt, results)?;
        }
        Return => {
            let results = if b == 0 {
                (base + a..rt.top()).map(|i| rt.get(i)).collect()
            } else {
                (0..b - 1).map(|i| rt.get(base + a + i)).collect()
            };
            do_return(rt, results)?;
        }
        Return0 => do_return(rt, Vec::new())?,
        Return1 => do_return(rt, vec![rt.get(base + a)])?,

        NewTable => {
            let t = rt.heap_mut().alloc_table();
            rt.set(base + a, Value::Obj(t));
            rt.maybe_collect(0);
        }
        GetTable => {
            let t = rt.get(base + b);
            let key = rt.get(base + c);
            let v = index_value(rt, t, key)?;
            rt.set(base + a, v);
        }
        GetI => {
            let t = rt.get(base + b);
            let v = index_value(rt, t, Value::Int(c as i64))?;
            rt.set(base + a, v);
        }
        GetField => {
            let t = rt.get(base + b);
            let key = constant(rt, proto_ref, c);
            let v = index_value(rt, t, key)?;
            rt.set(base + a, v);
        }
        SetTable => {
            let t = rt.get(base + a);
            let key = rt.get(base + b);
            let value = if k { constant(rt, proto_ref, c) } else { rt.get(base + c) };
            newindex_value(rt, t, key, value)?;
        }
        SetI => {
            let t = rt.get(base + a);
            let value = if k { constant(rt, proto_ref, c) } else { rt.get(base + c) };
            newindex_value(rt, t, Value::Int(b as i64), value)?;
        }
        SetField => {
            let t = rt.get(base + a);
            let key = constant(rt, proto_ref, b);
            let value = if k { constant(rt, proto_ref, c) } else { rt.get(base + c) };
            newindex_value(rt, t, key, value)?;
        }
        SetList => exec_setlist(rt, proto_ref, base, a, b, c, k)?,

        GetUpval => {
            let r = upvalue_ref(rt, base, b)?;
            let v = rt.read_upvalue(r);
            rt.set(base + a, v);
        }
        SetUpval => {
            let r = upvalue_ref(rt, base, b)?;
            let v = rt.get(base + a);
            rt.write_upvalue(r, v);
        }
        GetTabUp => {
            let env = upvalue_ref(rt, base, b)?;
            let table = rt.read_upvalue(env);
            let key = constant(rt, proto_ref, c);
            let v = index_value(rt, table, key)?;
            rt.set(base + a, v);
        }
        SetTabUp => {
            let env = upvalue_ref(rt, base, a)?;
            let table = rt.read_upvalue(env);
            let key = constant(rt, proto_ref, b);
            let value = if k { constant(rt, proto_ref, c) } else { rt.get(base + c) };
            newindex_value(rt, table, key, value)?;
        }
        Closure => exec_closure(rt, proto_ref, base, a, bx)?,

        Close => {
            close_tbc_down_to(rt, a as u32, None)?;
            rt.close_upvalues_from(base + a);
        }
        Tbc => rt.current_frame_mut().unwrap().mark_tbc(a as u32),

        Len => {
            let v = rt.get(base + b);
            let r = exec_len(rt, v)?;
            rt.set(base + a, r);
        }

        Concat => exec_concat(rt, base, a, b, c)?,

        VarargPrep => {
            // Vararg bookkeeping is done by `Runtime::enter_closure`
            // when the frame is pushed; this opcode is a no-op landing
            // pad matching the teacher's dedicated prep instruction.
        }
        Vararg => exec_vararg(rt, base, a, b)?,

        ExtraArg => {
            return Err(located(rt, ErrorKind::BytecodeIntegrity, "stray EXTRAARG"));
        }
    }
    Ok(())
}

// -------------------------------------------------------------------
// Jump helpers
// -------------------------------------------------------------------

fn jump(rt: &mut Runtime, offset: i32) {
    let frame = rt.current_frame_mut().unwrap();
    frame.pc = (frame.pc as i64 + offset as i64) as u32;
}

fn do_skip(rt: &mut Runtime, cond: bool, k: bool) {
    if cond != k {
        rt.current_frame_mut().unwrap().pc += 1;
    }
}

fn fetch_extra_arg(rt: &Runtime, proto_ref: GcRef) -> LuaResult<(u32, u32)> {
    let frame = rt.current_frame().unwrap();
    let pc = frame.pc;
    let code = &rt.heap().protos.get(proto_ref.idx).code;
    let word = *code.get(pc as usize).ok_or_else(|| {
        located(rt, ErrorKind::BytecodeIntegrity, "EXTRAARG expected but code ended")
    })?;
    if Instruction::get_op(word) != Some(OpCode::ExtraArg) {
        return Err(located(rt, ErrorKind::BytecodeIntegrity, "EXTRAARG expected"));
    }
    Ok((Instruction::get_ax(word), pc + 1))
}

// -------------------------------------------------------------------
// Arithmetic / bitwise dispatch helpers
// -------------------------------------------------------------------

fn arith_rr(
    rt: &mut Runtime,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> Option<Value>,
    mk: MetaKey,
) -> LuaResult<()> {
    let (x, y) = (rt.get(base + b), rt.get(base + c));
    match op(x, y) {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn arith_rk(
    rt: &mut Runtime,
    proto_ref: GcRef,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> Option<Value>,
    mk: MetaKey,
) -> LuaResult<()> {
    let x = rt.get(base + b);
    let y = constant(rt, proto_ref, c);
    match op(x, y) {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn arith_ri(
    rt: &mut Runtime,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> Option<Value>,
    mk: MetaKey,
) -> LuaResult<()> {
    let x = rt.get(base + b);
    let y = Value::Int(sc(c));
    match op(x, y) {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn arith_rr_fallible(
    rt: &mut Runtime,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> LuaResult<Option<Value>>,
    mk: MetaKey,
) -> LuaResult<()> {
    let (x, y) = (rt.get(base + b), rt.get(base + c));
    match op(x, y)? {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn arith_rk_fallible(
    rt: &mut Runtime,
    proto_ref: GcRef,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> LuaResult<Option<Value>>,
    mk: MetaKey,
) -> LuaResult<()> {
    let x = rt.get(base + b);
    let y = constant(rt, proto_ref, c);
    match op(x, y)? {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn arith_ri_fallible(
    rt: &mut Runtime,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> LuaResult<Option<Value>>,
    mk: MetaKey,
) -> LuaResult<()> {
    let x = rt.get(base + b);
    let y = Value::Int(sc(c));
    match op(x, y)? {
        Some(v) => rt.set(base + a, v),
        None => meta_binop(rt, x, y, mk, base + a)?,
    }
    Ok(())
}

fn bitwise_rr(
    rt: &mut Runtime,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> Option<Value>,
    mk: MetaKey,
) -> LuaResult<()> {
    arith_rr(rt, base, a, b, c, op, mk)
}

fn bitwise_rk(
    rt: &mut Runtime,
    proto_ref: GcRef,
    base: usize,
    a: usize,
    b: usize,
    c: usize,
    op: fn(Value, Value) -> Option<Value>,
    mk: MetaKey,
) -> LuaResult<()> {
    arith_rk(rt, proto_ref, base, a, b, c, op, mk)
}

fn meta_binop(rt: &mut Runtime, a: Value, b: Value, mk: MetaKey, dest: usize) -> LuaResult<()> {
    let f = metamethod::lookup_binop(rt.heap(), &a, &b, mk, rt.meta_keys(), rt.shared_metatables());
    match f {
        Some(f) => {
            let r = rt.call_value(f, &[a, b])?;
            rt.set(dest, r);
            Ok(())
        }
        None => {
            let bad = if a.as_number().is_none() { a } else { b };
            Err(located(
                rt,
                ErrorKind::Arithmetic,
                format!("attempt to perform arithmetic on a {} value", bad.type_name()),
            ))
        }
    }
}

fn meta_unop(rt: &mut Runtime, a: Value, mk: MetaKey, dest: usize) -> LuaResult<()> {
    let f = metamethod::lookup(rt.heap(), &a, mk, rt.meta_keys(), rt.shared_metatables());
    match f {
        Some(f) => {
            let r = rt.call_value(f, &[a, a])?;
            rt.set(dest, r);
            Ok(())
        }
        None => Err(located(
            rt,
            ErrorKind::Arithmetic,
            format!("attempt to perform arithmetic on a {} value", a.type_name()),
        )),
    }
}

// -------------------------------------------------------------------
// Comparisons
// -------------------------------------------------------------------

fn value_eq(rt: &mut Runtime, a: Value, b: Value) -> LuaResult<bool> {
    if a.raw_equal(&b) {
        return Ok(true);
    }
    let comparable = matches!(
        (a.as_obj(), b.as_obj()),
        (Some(ra), Some(rb)) if ra.kind == rb.kind && matches!(ra.kind, ObjKind::Table | ObjKind::Userdata)
    );
    if !comparable {
        return Ok(false);
    }
    let f = metamethod::lookup(rt.heap(), &a, MetaKey::Eq, rt.meta_keys(), rt.shared_metatables())
        .or_else(|| metamethod::lookup(rt.heap(), &b, MetaKey::Eq, rt.meta_keys(), rt.shared_metatables()));
    match f {
        Some(f) => Ok(rt.call_value(f, &[a, b])?.is_truthy()),
        None => Ok(false),
    }
}

fn value_lt(rt: &mut Runtime, a: Value, b: Value) -> LuaResult<bool> {
    if let Some(ord) = arith::compare(&a, &b) {
        return Ok(ord == Ordering::Less);
    }
    if let (Some(ra), Some(rb)) = (a.as_obj_of(ObjKind::String), b.as_obj_of(ObjKind::String)) {
        let (sa, sb) = (rt.heap().strings.get(ra.idx).bytes.clone(), rt.heap().strings.get(rb.idx).bytes.clone());
        return Ok(arith::compare_strings(&sa, &sb) == Ordering::Less);
    }
    let f = metamethod::lookup_binop(rt.heap(), &a, &b, MetaKey::Lt, rt.meta_keys(), rt.shared_metatables());
    match f {
        Some(f) => Ok(rt.call_value(f, &[a, b])?.is_truthy()),
        None => Err(located(
            rt,
            ErrorKind::OrderComparison,
            format!("attempt to compare {} with {}", a.type_name(), b.type_name()),
        )),
    }
}

fn value_le(rt: &mut Runtime, a: Value, b: Value) -> LuaResult<bool> {
    if let Some(ord) = arith::compare(&a, &b) {
        return Ok(ord != Ordering::Greater);
    }
    if let (Some(ra), Some(rb)) = (a.as_obj_of(ObjKind::String), b.as_obj_of(ObjKind::String)) {
        let (sa, sb) = (rt.heap().strings.get(ra.idx).bytes.clone(), rt.heap().strings.get(rb.idx).bytes.clone());
        return Ok(arith::compare_strings(&sa, &sb) != Ordering::Greater);
    }
    let f = metamethod::lookup_binop(rt.heap(), &a, &b, MetaKey::Le, rt.meta_keys(), rt.shared_metatables());
    if let Some(f) = f {
        return Ok(rt.call_value(f, &[a, b])?.is_truthy());
    }
    // No `__le`: fall back to `not (b < a)` (spec.md §4.3).
    value_lt(rt, b, a).map(|lt| !lt)
}

fn cmp_imm(rt: &Runtime, a: Value, imm: i64) -> LuaResult<Ordering> {
    arith::compare(&a, &Value::Int(imm)).ok_or_else(|| {
        located(rt, ErrorKind::OrderComparison, format!("attempt to compare {} with number", a.type_name()))
    })
}

// -------------------------------------------------------------------
// Table indexing (`__index` / `__newindex`, spec.md §4.3)
// -------------------------------------------------------------------

fn index_value(rt: &mut Runtime, target: Value, key: Value) -> LuaResult<Value> {
    if let Value::Obj(r) = target {
        if r.kind == ObjKind::Table {
            let raw = rt.heap().tables.get(r.idx).get(&key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let mt = rt.heap().tables.get(r.idx).metatable;
            return index_via_metatable(rt, target, key, mt);
        }
    }
    let mt = metamethod::metatable_of(rt.heap(), &target, rt.shared_metatables());
    index_via_metatable(rt, target, key, mt)
}

fn index_via_metatable(rt: &mut Runtime, target: Value, key: Value, mt: Option<GcRef>) -> LuaResult<Value> {
    let Some(mt) = mt else {
        return non_indexable(rt, target);
    };
    let handler = metamethod::raw_meta_get(rt.heap(), mt, rt.meta_keys().get(MetaKey::Index));
    match handler {
        Value::Nil => non_indexable_if_missing(rt, target),
        Value::Obj(r) if r.kind == ObjKind::Table => index_value(rt, handler, key),
        f => Ok(rt.call_value(f, &[target, key])?),
    }
}

fn non_indexable_if_missing(rt: &Runtime, target: Value) -> LuaResult<Value> {
    if target.is_kind(ObjKind::Table) {
        Ok(Value::Nil)
    } else {
        non_indexable(rt, target)
    }
}

fn non_indexable(rt: &Runtime, target: Value) -> LuaResult<Value> {
    Err(located(rt, ErrorKind::Table, format!("attempt to index a {} value", target.type_name())))
}

fn newindex_value(rt: &mut Runtime, target: Value, key: Value, value: Value) -> LuaResult<()> {
    if let Value::Obj(r) = target {
        if r.kind == ObjKind::Table {
            let existing = rt.heap().tables.get(r.idx).get(&key);
            if !existing.is_nil() {
                rt.heap_mut().tables.get_mut(r.idx).set(&key, value)?;
                rt.heap_mut().write_barrier(r, key);
                rt.heap_mut().write_barrier(r, value);
                return Ok(());
            }
            let mt = rt.heap().tables.get(r.idx).metatable;
            let handler = mt.map(|mt| metamethod::raw_meta_get(rt.heap(), mt, rt.meta_keys().get(MetaKey::NewIndex)));
            return match handler {
                None | Some(Value::Nil) => {
                    rt.heap_mut().tables.get_mut(r.idx).set(&key, value)?;
                    rt.heap_mut().write_barrier(r, key);
                    rt.heap_mut().write_barrier(r, value);
                    Ok(())
                }
                Some(Value::Obj(hr)) if hr.kind == ObjKind::Table => {
                    newindex_value(rt, Value::Obj(hr), key, value)
                }
                Some(f) => {
                    rt.call_value(f, &[target, key, value])?;
                    Ok(())
                }
            };
        }
    }
    let mt = metamethod::metatable_of(rt.heap(), &target, rt.shared_metatables());
    let handler = mt.map(|mt| metamethod::raw_meta_get(rt.heap(), mt, rt.meta_keys().get(MetaKey::NewIndex)));
    match handler {
        None | Some(Value::Nil) => Err(located(
            rt,
            ErrorKind::Table,
            format!("attempt to index a {} value", target.type_name()),
        )),
        Some(Value::Obj(hr)) if hr.kind == ObjKind::Table => newindex_value(rt, Value::Obj(hr), key, value),
        Some(f) => {
            rt.call_value(f, &[target, key, value])?;
            Ok(())
        }
    }
}

// -------------------------------------------------------------------
// Upvalues & closures
// -------------------------------------------------------------------

fn upvalue_ref(rt: &Runtime, base: usize, idx: usize) -> LuaResult<GcRef> {
    let _ = base;
    let closure = rt
        .current_frame()
        .and_then(|f| f.closure)
        .ok_or_else(|| located(rt, ErrorKind::BytecodeIntegrity, "no owning closure for upvalue access"))?;
    Ok(rt.heap().closures.get(closure.idx).upvalues[idx])
}

fn exec_closure(rt: &mut Runtime, proto_ref: GcRef, base: usize, a: usize, bx: u32) -> LuaResult<()> {
    let parent_proto = rt.heap().protos.get(proto_ref.idx).protos[bx as usize];
    let descs = rt.heap().protos.get(parent_proto.idx).upvals.clone();
    let parent_closure = rt.current_frame().and_then(|f| f.closure);
    let mut upvalues = Vec::with_capacity(descs.len());
    for d in descs {
        let r = if d.from_stack {
            rt.find_or_create_upvalue(base + d.index as usize)
        } else {
            let pc = parent_closure
                .ok_or_else(|| located(rt, ErrorKind::BytecodeIntegrity, "upvalue capture with no parent closure"))?;
            rt.heap().closures.get(pc.idx).upvalues[d.index as usize]
        };
        upvalues.push(r);
    }
    let closure = rt.heap_mut().alloc_closure(parent_proto, upvalues);
    rt.set(base + a, Value::Obj(closure));
    rt.maybe_collect(0);
    Ok(())
}

// -------------------------------------------------------------------
// Numeric / generic for (spec.md §4.2.3)
//
// Jump convention, pinned here since it differs from `JMP`: `JMP` encodes
// a signed offset in `sJ` (bias-subtracted `Ax`, forward or backward).
// The four loop opcodes below never use `sJ` — each encodes a plain
// forward distance in the unsigned `Bx` field and bakes its direction
// into the opcode itself:
//   - `FORPREP`/`TFORPREP` jump forward, via `skip_forward`/`enter_loop`.
//   - `FORLOOP`/`TFORLOOP` jump backward, via `loop_back`.
// `FORPREP`'s skip path adds one extra instruction (`bx + 1`) because an
// empty range must land *past* the matching `FORLOOP`, not on it;
// `TFORPREP` always lands exactly on `TFORCALL`, so it never adds one. A
// front end targeting this encoding emits both prep opcodes' `Bx` as the
// distance to their matching loop opcode.
// -------------------------------------------------------------------

/// `FORPREP`'s "range is empty" forward jump: lands one past `FORLOOP`.
fn skip_loop(rt: &mut Runtime, bx: u32) {
    rt.current_frame_mut().unwrap().pc += bx + 1;
}

/// `TFORPREP`'s unconditional forward jump: lands exactly on `TFORCALL`.
fn enter_loop(rt: &mut Runtime, bx: u32) {
    jump(rt, bx as i32);
}

/// `FORLOOP`/`TFORLOOP`'s backward jump to the loop body's first instruction.
fn loop_back(rt: &mut Runtime, bx: u32) {
    jump(rt, -(bx as i32));
}

fn exec_for_prep(rt: &mut Runtime, base: usize, a: usize, bx: u32) -> LuaResult<()> {
    let init = rt.get(base + a);
    let limit = rt.get(base + a + 1);
    let step = rt.get(base + a + 2);

    if let (Some(i0), Some(istep)) = (init.as_integer(), step.as_integer()) {
        if istep == 0 {
            return Err(located(rt, ErrorKind::ForLoop, "'for' step is zero"));
        }
        let ilimit = match limit {
            Value::Int(l) => l,
            Value::Num(f) => {
                if istep > 0 {
                    if f >= i64::MAX as f64 { i64::MAX } else { f.floor() as i64 }
                } else if f <= i64::MIN as f64 {
                    i64::MIN
                } else {
                    f.ceil() as i64
                }
            }
            _ => return Err(located(rt, ErrorKind::ForLoop, "'for' limit must be a number")),
        };
        let skip = if istep > 0 { i0 > ilimit } else { i0 < ilimit };
        if skip {
            skip_loop(rt, bx);
        } else {
            rt.set(base + a, Value::Int(i0));
            rt.set(base + a + 1, Value::Int(ilimit));
            rt.set(base + a + 2, Value::Int(istep));
            rt.set(base + a + 3, Value::Int(i0));
        }
        return Ok(());
    }

    let f0 = init.as_number().ok_or_else(|| located(rt, ErrorKind::ForLoop, "'for' initial value must be a number"))?;
    let flimit = limit.as_number().ok_or_else(|| located(rt, ErrorKind::ForLoop, "'for' limit must be a number"))?;
    let fstep = step.as_number().ok_or_else(|| located(rt, ErrorKind::ForLoop, "'for' step must be a number"))?;
    if fstep == 0.0 {
        return Err(located(rt, ErrorKind::ForLoop, "'for' step is zero"));
    }
    let skip = if fstep > 0.0 { f0 > flimit } else { f0 < flimit };
    if skip {
        skip_loop(rt, bx);
    } else {
        rt.set(base + a, Value::Num(f0));
        rt.set(base + a + 1, Value::Num(flimit));
        rt.set(base + a + 2, Value::Num(fstep));
        rt.set(base + a + 3, Value::Num(f0));
    }
    Ok(())
}

fn exec_for_loop(rt: &mut Runtime, base: usize, a: usize, bx: u32) {
    let cur = rt.get(base + a);
    let step = rt.get(base + a + 2);
    let limit = rt.get(base + a + 1);
    match (cur, step) {
        (Value::Int(c), Value::Int(s)) => {
            let (nc, overflow) = c.overflowing_add(s);
            let lim = limit.as_integer().unwrap_or(if s > 0 { i64::MAX } else { i64::MIN });
            let cont = !overflow && if s > 0 { nc <= lim } else { nc >= lim };
            if cont {
                rt.set(base + a, Value::Int(nc));
                rt.set(base + a + 3, Value::Int(nc));
                loop_back(rt, bx);
            }
        }
        _ => {
            let c = cur.as_number().unwrap_or(0.0);
            let s = step.as_number().unwrap_or(0.0);
            let lim = limit.as_number().unwrap_or(0.0);
            let nc = c + s;
            let cont = if s > 0.0 { nc <= lim } else { nc >= lim };
            if cont {
                rt.set(base + a, Value::Num(nc));
                rt.set(base + a + 3, Value::Num(nc));
                loop_back(rt, bx);
            }
        }
    }
}

fn exec_tforcall(rt: &mut Runtime, base: usize, a: usize, c: usize) -> LuaResult<()> {
    let iter = rt.get(base + a);
    let state = rt.get(base + a + 1);
    let control = rt.get(base + a + 2);
    let results = rt.call_for_results(iter, &[state, control], c as i32)?;
    for i in 0..c {
        let v = results.get(i).copied().unwrap_or(Value::Nil);
        rt.set(base + a + 3 + i, v);
    }
    Ok(())
}

// -------------------------------------------------------------------
// Tables: SETLIST (spec.md §4.2.3 "Tables")
// -------------------------------------------------------------------

/// Fields-per-flush batches of 50 (spec.md: "using Fields Per Flush = 50
/// batches by default"), mirroring the teacher's `LFIELDS_PER_FLUSH`.
const FIELDS_PER_FLUSH: u32 = 50;

fn exec_setlist(rt: &mut Runtime, proto_ref: GcRef, base: usize, a: usize, b: usize, c: usize, k: bool) -> LuaResult<()> {
    let _ = proto_ref;
    let batch = if k {
        let (ax, new_pc) = fetch_extra_arg(rt, proto_ref)?;
        rt.current_frame_mut().unwrap().pc = new_pc;
        ax
    } else {
        c as u32
    };
    let start = if batch == 0 { 1 } else { batch * FIELDS_PER_FLUSH + 1 };
    let count = if b == 0 { rt.top() - (base + a + 1) } else { b };
    let Value::Obj(t) = rt.get(base + a) else {
        return Err(located(rt, ErrorKind::Table, "SETLIST target is not a table"));
    };
    let values: Vec<Value> = (0..count).map(|i| rt.get(base + a + 1 + i)).collect();
    rt.heap_mut().tables.get_mut(t.idx).set_range(start as i64, &values);
    for v in &values {
        rt.heap_mut().write_barrier(t, *v);
    }
    Ok(())
}

// -------------------------------------------------------------------
// Length (spec.md §3 "Table" sequence-length definition, §4.3 "__len")
// -------------------------------------------------------------------

/// `__len` takes priority over the built-in definition for any value that
/// has it; strings use their byte length; tables without an override fall
/// back to the largest `N` with keys `1..N` all non-nil; anything else is
/// a `Length` error (spec.md §7 "Length: attempt to take length of an
/// ineligible value with no `__len`").
fn exec_len(rt: &mut Runtime, v: Value) -> LuaResult<Value> {
    if let Some(f) = metamethod::lookup(rt.heap(), &v, MetaKey::Len, rt.meta_keys(), rt.shared_metatables()) {
        return rt.call_value(f, &[v]);
    }
    match v {
        Value::Obj(r) if r.kind == ObjKind::String => {
            Ok(Value::Int(rt.heap().strings.get(r.idx).bytes.len() as i64))
        }
        Value::Obj(r) if r.kind == ObjKind::Table => Ok(Value::Int(rt.heap().tables.get(r.idx).length())),
        _ => Err(located(rt, ErrorKind::Length, format!("attempt to get length of a {} value", v.type_name()))),
    }
}

// -------------------------------------------------------------------
// Concatenation (spec.md §4.2.3 "Concatenation")
// -------------------------------------------------------------------

fn exec_concat(rt: &mut Runtime, base: usize, a: usize, b: usize, c: usize) -> LuaResult<()> {
    let mut acc = rt.get(base + c);
    let mut idx = c;
    while idx > b {
        let left = rt.get(base + idx - 1);
        acc = concat_pair(rt, left, acc)?;
        idx -= 1;
    }
    rt.set(base + a, acc);
    Ok(())
}

fn concat_pair(rt: &mut Runtime, left: Value, right: Value) -> LuaResult<Value> {
    if let (Some(ls), Some(rs)) = (primitive_or_string(rt, left), primitive_or_string(rt, right)) {
        let s = format!("{ls}{rs}");
        return Ok(Value::Obj(rt.heap_mut().alloc_string(&s)));
    }
    let f = metamethod::lookup_binop(rt.heap(), &left, &right, MetaKey::Concat, rt.meta_keys(), rt.shared_metatables());
    match f {
        Some(f) => rt.call_value(f, &[left, right]),
        None => {
            let bad = if primitive_or_string(rt, left).is_none() { left } else { right };
            Err(located(rt, ErrorKind::Arithmetic, format!("attempt to concatenate a {} value", bad.type_name())))
        }
    }
}

fn primitive_or_string(rt: &Runtime, v: Value) -> Option<String> {
    let mut buf = itoa::Buffer::new();
    if let Some(s) = arith::primitive_text(&v, &mut buf) {
        return Some(s);
    }
    if let Value::Obj(r) = v {
        if r.kind == ObjKind::String {
            return Some(rt.heap().strings.get(r.idx).bytes.to_string());
        }
    }
    None
}

// -------------------------------------------------------------------
// Varargs (spec.md §4.2.3 "Varargs")
// -------------------------------------------------------------------

fn exec_vararg(rt: &mut Runtime, base: usize, a: usize, b: usize) -> LuaResult<()> {
    let (vb, vc) = rt
        .current_frame()
        .map(|f| (f.vararg_base, f.vararg_count as usize))
        .unwrap_or((0, 0));
    let want = if b == 0 { vc } else { b - 1 };
    for i in 0..want {
        let v = if i < vc { rt.get(vb + i) } else { Value::Nil };
        rt.set(base + a + i, v);
    }
    if b == 0 {
        rt.set_top(base + a + want);
    }
    Ok(())
}

// -------------------------------------------------------------------
// Return (shared by RETURN/RETURN0/RETURN1/TAILCALL)
// -------------------------------------------------------------------

fn do_return(rt: &mut Runtime, results: Vec<Value>) -> LuaResult<()> {
    close_tbc_down_to(rt, 0, None)?;
    let Some(frame) = rt.pop_frame() else { return Ok(()) };
    rt.close_upvalues_from(frame.base);
    let dest = frame.return_base;
    let want = match frame.want_results {
        WantResults::Fixed(n) => n as usize,
        WantResults::Variable => results.len(),
    };
    for i in 0..want {
        let v = results.get(i).copied().unwrap_or(Value::Nil);
        rt.set(dest + i, v);
    }
    rt.set_top(dest + want);
    Ok(())
}

/// Pop frames down to `depth`, running each one's pending `__close`
/// handlers and closing its upvalues first (spec.md §4.2.5 "Failure
/// handling" unwinds through the same close protocol as a normal
/// return). Used by [`Runtime::call_for_results`]/[`Runtime::call_protected`]
/// when an error propagates past the reentrant call boundary. Errors
/// raised by a `__close` handler itself are swallowed so the original
/// error is what the caller sees.
pub(crate) fn unwind_frames(rt: &mut Runtime, depth: usize, err: Option<Value>) {
    while rt.frame_depth() > depth {
        let _ = close_tbc_down_to(rt, 0, err);
        if let Some(frame) = rt.pop_frame() {
            rt.close_upvalues_from(frame.base);
        }
    }
}

/// Run `__close` on every to-be-closed register at or above `offset`
/// (relative to the current frame's base), highest first (spec.md
/// §4.2.3 "Close & to-be-closed"). `err` is the error object passed to
/// the handler when unwinding due to a raised error, `None` otherwise.
fn close_tbc_down_to(rt: &mut Runtime, offset: u32, err: Option<Value>) -> LuaResult<()> {
    loop {
        let hi = match rt.current_frame().and_then(|f| f.highest_tbc()) {
            Some(hi) if hi >= offset => hi,
            _ => return Ok(()),
        };
        rt.current_frame_mut().unwrap().clear_tbc(hi);
        let base = rt.current_frame().unwrap().base;
        let value = rt.get(base + hi as usize);
        if value.is_nil() || matches!(value, Value::Bool(false)) {
            continue;
        }
        let f = metamethod::lookup(rt.heap(), &value, MetaKey::Close, rt.meta_keys(), rt.shared_metatables());
        if let Some(f) = f {
            rt.call_value(f, &[value, err.unwrap_or(Value::Nil)])?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProtoBuilder;
    use crate::config::{GcConfig, VmConfig};

    fn new_runtime() -> Runtime {
        Runtime::new(GcConfig::default(), VmConfig::default())
    }

    fn closure(rt: &mut Runtime, b: ProtoBuilder) -> Value {
        let proto = b.build(rt.heap_mut());
        Value::Obj(rt.heap_mut().alloc_closure(proto, Vec::new()))
    }

    #[test]
    fn add_registers_promotes_to_float_on_overflow() {
        let mut rt = new_runtime();
        let mut b = ProtoBuilder::new("=test").max_stack(4);
        b.asbx(OpCode::LoadI, 0, 19);
        b.asbx(OpCode::LoadI, 1, 23);
        b.abc(OpCode::Add, 2, 0, 1);
        b.abc(OpCode::Return1, 2, 0, 0);
        let f = closure(&mut rt, b);
        let v = rt.call_value(f, &[]).expect("call should succeed");
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn table_field_round_trip() {
        let mut rt = new_runtime();
        let mut b = ProtoBuilder::new("=test").max_stack(4);
        let key = b.konst(Value::Obj(rt.heap_mut().alloc_string("x")));
        let val = b.konst(Value::Int(7));
        b.abc(OpCode::NewTable, 0, 0, 0);
        b.abck(OpCode::SetField, 0, true, key, val);
        b.abc(OpCode::GetField, 1, 0, key);
        b.abc(OpCode::Return1, 1, 0, 0);
        let f = closure(&mut rt, b);
        let v = rt.call_value(f, &[]).expect("call should succeed");
        assert_eq!(v, Value::Int(7));
    }

    #[test]
    fn sequence_length_counts_contiguous_integer_keys() {
        let mut rt = new_runtime();
        let mut b = ProtoBuilder::new("=test").max_stack(4);
        let c1 = b.konst(Value::Int(10));
        let c2 = b.konst(Value::Int(20));
        let c3 = b.konst(Value::Int(30));
        b.abc(OpCode::NewTable, 0, 0, 0);
        b.abck(OpCode::SetI, 0, true, 1, c1);
        b.abck(OpCode::SetI, 0, true, 2, c2);
        b.abck(OpCode::SetI, 0, true, 3, c3);
        b.abc(OpCode::Len, 1, 0, 0);
        b.abc(OpCode::Return1, 1, 0, 0);
        let f = closure(&mut rt, b);
        let v = rt.call_value(f, &[]).expect("call should succeed");
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn closure_captures_outer_local_by_reference() {
        let mut rt = new_runtime();

        let mut inner = ProtoBuilder::new("=test:inner").max_stack(2).upval(true, 0);
        inner.abc(OpCode::GetUpval, 0, 0, 0);
        inner.abc(OpCode::Return1, 0, 0, 0);
        let inner_proto = inner.build(rt.heap_mut());

        let mut outer = ProtoBuilder::new("=test:outer").max_stack(3).child(inner_proto);
        outer.asbx(OpCode::LoadI, 0, 42);
        outer.abx(OpCode::Closure, 1, 0);
        outer.abc(OpCode::Return1, 1, 0, 0);
        let f = closure(&mut rt, outer);

        let made = rt.call_value(f, &[]).expect("outer call should succeed");
        let v = rt.call_value(made, &[]).expect("inner call should succeed");
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn protected_call_catches_arithmetic_type_error() {
        let mut rt = new_runtime();
        let mut b = ProtoBuilder::new("=test").max_stack(4);
        b.abc(OpCode::NewTable, 0, 0, 0);
        b.asbx(OpCode::LoadI, 1, 5);
        b.abc(OpCode::Add, 2, 0, 1);
        b.abc(OpCode::Return1, 2, 0, 0);
        let f = closure(&mut rt, b);

        let (ok, results) = rt.call_protected(f, &[]).expect("OOM should not occur");
        assert!(!ok);
        let Value::Obj(r) = results[0] else { panic!("expected a string error value") };
        assert_eq!(r.kind, ObjKind::String);
        assert!(rt.heap().strings.get(r.idx).bytes.contains("arithmetic"));
    }

    /// A `__close` handler: bumps the global `closed` flag to `true`.
    fn mark_closed(rt: &mut Runtime, _func_reg: usize, _nargs: usize, _nresults: i32) -> LuaResult<usize> {
        let globals = rt.globals();
        let key = rt.heap_mut().alloc_string("closed");
        rt.heap_mut().tables.get_mut(globals.idx).set(&Value::Obj(key), Value::Bool(true)).unwrap();
        Ok(0)
    }

    #[test]
    fn to_be_closed_runs_close_metamethod_on_scope_exit() {
        let mut rt = new_runtime();

        let globals = rt.globals();
        let marker_key = rt.heap_mut().alloc_string("closed");
        rt.heap_mut().tables.get_mut(globals.idx).set(&Value::Obj(marker_key), Value::Bool(false)).unwrap();

        let id = rt.natives_mut().register(mark_closed);
        let close_fn = Value::Obj(rt.heap_mut().alloc_native(id, Vec::new()));

        let mt = rt.heap_mut().alloc_table();
        let close_key = rt.heap_mut().alloc_string("__close");
        rt.heap_mut().tables.get_mut(mt.idx).set(&Value::Obj(close_key), close_fn).unwrap();
        let tbc_obj = rt.heap_mut().alloc_table();
        rt.heap_mut().tables.get_mut(tbc_obj.idx).metatable = Some(mt);

        let mut b = ProtoBuilder::new("=test").max_stack(4);
        let obj_const = b.konst(Value::Obj(tbc_obj));
        b.abc(OpCode::LoadK, 0, obj_const, 0);
        b.abc(OpCode::Tbc, 0, 0, 0);
        b.abc(OpCode::Return0, 0, 0, 0);
        let f = closure(&mut rt, b);

        rt.call_value(f, &[]).expect("call should succeed");

        let flag = rt.heap().tables.get(globals.idx).get_str(marker_key);
        assert_eq!(flag, Value::Bool(true));
    }
}
