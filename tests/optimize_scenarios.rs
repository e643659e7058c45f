//! End-to-end scenarios: record a loop, optimize it, and where a guard
//! survives, decode its resume data the way the runtime would after a
//! guard failure.

use std::rc::Rc;

use ember_jit::ir::descr::{DescrTable, EffectInfo, OopSpec};
use ember_jit::ir::snapshot::CodeId;
use ember_jit::ir::{BoxId, DescrRef, OpKind, TraceLoop, Value, ValueKind};
use ember_jit::opt::{optimize_loop, InvalidLoop, OptOptions};
use ember_jit::resume::{BoxRebuilder, RebuildStep, ResumeReader};

use ember_jit::ir::value::{ConstValue, RefConst};

fn kinds(tl: &TraceLoop) -> Vec<OpKind> {
    tl.ops.iter().map(|op| op.kind).collect()
}

fn run(descrs: &DescrTable, tl: TraceLoop) -> Result<TraceLoop, InvalidLoop> {
    optimize_loop(descrs, &OptOptions::default(), tl)
}

#[test]
fn test_constant_chain_leaves_bare_jump() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let sum = tl.emit(
        OpKind::IntAdd,
        [Value::int(2), Value::int(3)],
        ValueKind::Int,
    );
    let cond = tl.emit(OpKind::IntIsTrue, [Value::Box(sum)], ValueKind::Int);
    let snap = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let fi = tl.store.push_frame_info(None, CodeId(0), 0);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(cond)], snap, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::Jump]);
}

#[test]
fn test_surviving_guard_decodes_fail_args() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let i1 = tl.emit(
        OpKind::IntSub,
        [Value::Box(i0), Value::int(1)],
        ValueKind::Int,
    );
    let snap = tl
        .store
        .push_snapshot(None, vec![Value::Box(i0), Value::Box(i1)]);
    let fi = tl.store.push_frame_info(None, CodeId(3), 17);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i1), Value::int(4)], snap, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i1)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::IntSub, OpKind::GuardValue, OpKind::Jump]);
    let guard = out.ops[1].guard.as_ref().unwrap();
    assert_eq!(guard.fail_args, vec![Some(i0), Some(i1)]);

    // a guard failure rebuilds one frame with both locals as fresh boxes
    let resume = guard.resume.as_ref().unwrap();
    let mut target = BoxRebuilder::new(&guard.fail_args, out.num_boxes());
    ResumeReader::new(resume, &mut target).rebuild_frames(&out.store);
    assert_eq!(target.frames.len(), 1);
    assert_eq!(target.frames[0].code, CodeId(3));
    assert_eq!(target.frames[0].pc, 17);
    assert_eq!(target.frames[0].locals.len(), 2);
    assert_eq!(
        target.steps[0],
        RebuildStep::FromFailArg {
            index: 0,
            result: match target.frames[0].locals[0] {
                Value::Box(b) => b,
                _ => unreachable!(),
            },
        }
    );
}

#[test]
fn test_virtual_disappears_from_trace() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x1000);
    let node = descrs.add_type("Node", Some(vt), &[("value", ValueKind::Int)]);
    let value_field = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let p = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::Box(i0)],
        Some(DescrRef::Field(value_field)),
    );
    let v = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(value_field),
        ValueKind::Int,
    );
    let r = tl.emit(
        OpKind::IntAdd,
        [Value::Box(v), Value::int(1)],
        ValueKind::Int,
    );
    tl.emit_void(OpKind::Jump, [Value::Box(r)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::IntAdd, OpKind::Jump]);
    // the add reads the stored value directly
    assert_eq!(out.ops[0].arg(0), Value::Box(i0));
}

#[test]
fn test_virtual_in_fail_args_rebuilt_at_failure() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x2000);
    let node = descrs.add_type("Counter", Some(vt), &[("count", ValueKind::Int)]);
    let count_field = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let p = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::int(42)],
        Some(DescrRef::Field(count_field)),
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(p)]);
    let fi = tl.store.push_frame_info(None, CodeId(5), 9);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i0), Value::int(7)], snap, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    // the allocation never reaches the output
    assert_eq!(kinds(&out), vec![OpKind::GuardValue, OpKind::Jump]);
    let guard = out.ops[0].guard.as_ref().unwrap();
    let resume = guard.resume.as_ref().unwrap();
    assert_eq!(resume.virtuals.iter().filter(|v| v.is_some()).count(), 1);

    let mut target = BoxRebuilder::new(&guard.fail_args, out.num_boxes());
    ResumeReader::new(resume, &mut target).rebuild_frames(&out.store);
    assert!(matches!(
        target.steps[0],
        RebuildStep::AllocateWithVtable { ty, .. } if ty == node
    ));
    assert!(matches!(
        target.steps[1],
        RebuildStep::SetField {
            field,
            value: Value::Const(ConstValue::Int(42)),
            ..
        } if field == count_field
    ));
    assert!(matches!(
        target.frames[0].locals[0],
        Value::Box(b) if b.kind() == ValueKind::Ref
    ));
}

#[test]
fn test_aliasing_store_splits_reads() {
    let mut descrs = DescrTable::new();
    let node = descrs.add_type("Cell", None, &[("v", ValueKind::Int)]);
    let f = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Ref, ValueKind::Ref, ValueKind::Int]);
    let (p, q, i) = (tl.input_args[0], tl.input_args[1], tl.input_args[2]);
    let x = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(f),
        ValueKind::Int,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(q), Value::Box(i)],
        Some(DescrRef::Field(f)),
    );
    let y = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(f),
        ValueKind::Int,
    );
    let _ = (x, y);
    tl.emit_void(
        OpKind::Jump,
        [Value::Box(p), Value::Box(q), Value::Box(y)],
        None,
    );

    let out = run(&descrs, tl).unwrap();
    // q may alias p, so the second read must run after the store
    assert_eq!(
        kinds(&out),
        vec![
            OpKind::GetfieldGc,
            OpKind::SetfieldGc,
            OpKind::GetfieldGc,
            OpKind::Jump,
        ]
    );
}

#[test]
fn test_repeated_read_folds() {
    let mut descrs = DescrTable::new();
    let node = descrs.add_type("Cell", None, &[("v", ValueKind::Int)]);
    let f = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Ref]);
    let p = tl.input_args[0];
    let x = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(f),
        ValueKind::Int,
    );
    let y = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(f),
        ValueKind::Int,
    );
    let s = tl.emit(
        OpKind::IntAdd,
        [Value::Box(x), Value::Box(y)],
        ValueKind::Int,
    );
    let _ = s;
    tl.emit_void(OpKind::Jump, [Value::Box(p)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(
        kinds(&out),
        vec![OpKind::GetfieldGc, OpKind::IntAdd, OpKind::Jump]
    );
    // both operands of the add are the single surviving read
    assert_eq!(out.ops[1].arg(0), out.ops[1].arg(1));
}

#[test]
fn test_overwritten_store_emitted_once() {
    let mut descrs = DescrTable::new();
    let node = descrs.add_type("Cell", None, &[("v", ValueKind::Int)]);
    let f = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Ref]);
    let p = tl.input_args[0];
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::int(1)],
        Some(DescrRef::Field(f)),
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::int(2)],
        Some(DescrRef::Field(f)),
    );
    tl.emit_void(OpKind::Jump, [Value::Box(p)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::SetfieldGc, OpKind::Jump]);
    assert_eq!(out.ops[0].arg(1), Value::int(2));
}

#[test]
fn test_lazy_virtual_store_becomes_pending() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x3000);
    let node = descrs.add_type("Wrapper", Some(vt), &[("inner", ValueKind::Ref)]);
    let inner_field = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Ref, ValueKind::Int]);
    let (p, i0) = (tl.input_args[0], tl.input_args[1]);
    let q = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::Box(q)],
        Some(DescrRef::Field(inner_field)),
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let fi = tl.store.push_frame_info(None, CodeId(0), 0);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i0), Value::int(7)], snap, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(p), Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    // the store is deferred past the guard as a pending store, then hits
    // memory (forcing the virtual) before the back edge
    assert_eq!(
        kinds(&out),
        vec![
            OpKind::GuardValue,
            OpKind::NewWithVtable,
            OpKind::SetfieldGc,
            OpKind::Jump,
        ]
    );
    let guard = out.ops[0].guard.as_ref().unwrap();
    let resume = guard.resume.as_ref().unwrap();
    assert_eq!(resume.pending.len(), 1);
    // the guard keeps the store target alive
    assert!(guard.fail_args.contains(&Some(p)));
}

#[test]
fn test_forced_virtual_reencoded_as_plain_box() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x6000);
    let node = descrs.add_type("Acc", Some(vt), &[("value", ValueKind::Int)]);
    let value_field = descrs.fields_of(node)[0];
    let escape = descrs.add_call("escape", Some(ValueKind::Int), EffectInfo::opaque());

    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let p = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::Box(i0)],
        Some(DescrRef::Field(value_field)),
    );
    let c1 = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(10)],
        ValueKind::Int,
    );
    let s1 = tl
        .store
        .push_snapshot(None, vec![Value::Box(p), Value::Box(i0)]);
    let f1 = tl.store.push_frame_info(None, CodeId(0), 3);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(c1)], s1, f1);
    // the call forces p; the second guard chains to the first snapshot
    tl.emit_with_descr(
        OpKind::Call,
        [Value::Box(p)],
        DescrRef::Call(escape),
        ValueKind::Int,
    );
    let c2 = tl.emit(
        OpKind::IntGe,
        [Value::Box(i0), Value::int(0)],
        ValueKind::Int,
    );
    let s2 = tl.store.push_snapshot(Some(s1), vec![Value::Box(i0)]);
    let f2 = tl.store.push_frame_info(Some(f1), CodeId(1), 0);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(c2)], s2, f2);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(
        kinds(&out),
        vec![
            OpKind::IntLt,
            OpKind::GuardTrue,
            OpKind::NewWithVtable,
            OpKind::SetfieldGc,
            OpKind::Call,
            OpKind::IntGe,
            OpKind::GuardTrue,
            OpKind::Jump,
        ]
    );
    // the first guard still describes p symbolically
    let g1 = out.ops[1].guard.as_ref().unwrap();
    let r1 = g1.resume.as_ref().unwrap();
    assert_eq!(r1.virtuals.iter().filter(|v| v.is_some()).count(), 1);
    // after the force, the second guard carries p as a real pointer
    let g2 = out.ops[6].guard.as_ref().unwrap();
    let r2 = g2.resume.as_ref().unwrap();
    assert!(r2.virtuals.is_empty());
    assert!(g2.fail_args.contains(&Some(p)));

    let mut target = BoxRebuilder::new(&g2.fail_args, out.num_boxes());
    ResumeReader::new(r2, &mut target).rebuild_frames(&out.store);
    assert_eq!(target.frames.len(), 2);
    assert_eq!(target.frames[0].code, CodeId(0));
    assert_eq!(target.frames[1].code, CodeId(1));
}

#[test]
fn test_guard_value_on_comparison_narrows() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let lt10 = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(10)],
        ValueKind::Int,
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let fi = tl.store.push_frame_info(None, CodeId(0), 0);
    tl.emit_guard(
        OpKind::GuardValue,
        [Value::Box(lt10), Value::int(1)],
        snap,
        fi,
    );
    // implied by i0 < 10
    let lt100 = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(100)],
        ValueKind::Int,
    );
    let snap2 = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(lt100)], snap2, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    // the guard_value on the comparison result acts as guard_true
    assert_eq!(
        kinds(&out),
        vec![OpKind::IntLt, OpKind::GuardTrue, OpKind::Jump]
    );
}

#[test]
fn test_cyclic_virtuals_roundtrip_through_guard() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x7000);
    let node = descrs.add_type("Link", Some(vt), &[("next", ValueKind::Ref)]);
    let next_field = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let p1 = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    let p2 = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p1), Value::Box(p2)],
        Some(DescrRef::Field(next_field)),
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p2), Value::Box(p1)],
        Some(DescrRef::Field(next_field)),
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(p1)]);
    let fi = tl.store.push_frame_info(None, CodeId(2), 11);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i0), Value::int(7)], snap, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::GuardValue, OpKind::Jump]);
    let guard = out.ops[0].guard.as_ref().unwrap();
    let resume = guard.resume.as_ref().unwrap();
    assert_eq!(resume.virtuals.iter().filter(|v| v.is_some()).count(), 2);

    let mut target = BoxRebuilder::new(&guard.fail_args, out.num_boxes());
    ResumeReader::new(resume, &mut target).rebuild_frames(&out.store);
    let allocs = target
        .steps
        .iter()
        .filter(|s| matches!(s, RebuildStep::AllocateWithVtable { ty, .. } if *ty == node))
        .count();
    assert_eq!(allocs, 2);
    let stores: Vec<(Value, Value)> = target
        .steps
        .iter()
        .filter_map(|s| match s {
            RebuildStep::SetField { target, value, .. } => Some((*target, *value)),
            _ => None,
        })
        .collect();
    // the two stores point the rebuilt objects at each other
    assert_eq!(stores.len(), 2);
    assert_eq!(stores[0].0, stores[1].1);
    assert_eq!(stores[0].1, stores[1].0);
    assert_ne!(stores[0].0, stores[0].1);
}

#[test]
fn test_concat_length_computed_without_copying() {
    let mut descrs = DescrTable::new();
    let concat = descrs.add_call(
        "str_concat",
        Some(ValueKind::Ref),
        EffectInfo::oopspec(OopSpec::StrConcat),
    );

    let mut tl = TraceLoop::new(&[ValueKind::Ref, ValueKind::Ref]);
    let (a, b) = (tl.input_args[0], tl.input_args[1]);
    let c = tl.emit_with_descr(
        OpKind::Call,
        [Value::Box(a), Value::Box(b)],
        DescrRef::Call(concat),
        ValueKind::Ref,
    );
    let n = tl.emit(OpKind::StrLen, [Value::Box(c)], ValueKind::Int);
    let _ = n;
    tl.emit_void(OpKind::Jump, [Value::Box(a), Value::Box(b)], None);

    let out = run(&descrs, tl).unwrap();
    // the length is part lengths added up; the bytes are never copied
    assert_eq!(
        kinds(&out),
        vec![OpKind::StrLen, OpKind::StrLen, OpKind::IntAdd, OpKind::Jump]
    );
}

#[test]
fn test_guards_share_numbering_tails() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int, ValueKind::Int]);
    let (i0, i1) = (tl.input_args[0], tl.input_args[1]);
    let outer = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let s1 = tl.store.push_snapshot(Some(outer), vec![Value::Box(i1)]);
    let s2 = tl.store.push_snapshot(Some(outer), vec![Value::Box(i1)]);
    let fo = tl.store.push_frame_info(None, CodeId(1), 0);
    let f1 = tl.store.push_frame_info(Some(fo), CodeId(2), 4);
    let f2 = tl.store.push_frame_info(Some(fo), CodeId(2), 8);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i0), Value::int(1)], s1, f1);
    tl.emit_guard(OpKind::GuardValue, [Value::Box(i1), Value::int(2)], s2, f2);
    tl.emit_void(OpKind::Jump, [Value::Box(i0), Value::Box(i1)], None);

    let out = run(&descrs, tl).unwrap();
    let r1 = out.ops[0].guard.as_ref().unwrap().resume.as_ref().unwrap();
    let r2 = out.ops[1].guard.as_ref().unwrap().resume.as_ref().unwrap();
    assert!(Rc::ptr_eq(
        r1.numbering.prev.as_ref().unwrap(),
        r2.numbering.prev.as_ref().unwrap()
    ));
}

#[test]
fn test_string_length_folds_away_string() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let s = tl.emit(OpKind::NewStr, [Value::int(2)], ValueKind::Ref);
    tl.emit_void(
        OpKind::StrSetItem,
        [Value::Box(s), Value::int(0), Value::int(72)],
        None,
    );
    tl.emit_void(
        OpKind::StrSetItem,
        [Value::Box(s), Value::int(1), Value::int(105)],
        None,
    );
    let n = tl.emit(OpKind::StrLen, [Value::Box(s)], ValueKind::Int);
    tl.emit_void(OpKind::Jump, [Value::Box(n)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(kinds(&out), vec![OpKind::Jump]);
    assert_eq!(out.ops[0].arg(0), Value::int(2));
}

#[test]
fn test_concat_forced_at_back_edge() {
    let mut descrs = DescrTable::new();
    let concat = descrs.add_call(
        "str_concat",
        Some(ValueKind::Ref),
        EffectInfo::oopspec(OopSpec::StrConcat),
    );

    let mut tl = TraceLoop::new(&[ValueKind::Ref]);
    let s = tl.emit(OpKind::NewStr, [Value::int(1)], ValueKind::Ref);
    tl.emit_void(
        OpKind::StrSetItem,
        [Value::Box(s), Value::int(0), Value::int(65)],
        None,
    );
    let c = tl.emit_with_descr(
        OpKind::Call,
        [Value::Box(s), Value::Box(s)],
        DescrRef::Call(concat),
        ValueKind::Ref,
    );
    tl.emit_void(OpKind::Jump, [Value::Box(c)], None);

    let out = run(&descrs, tl).unwrap();
    // both lengths are known, so no strlen and no length arithmetic
    assert_eq!(
        kinds(&out),
        vec![
            OpKind::NewStr,
            OpKind::StrSetItem,
            OpKind::NewStr,
            OpKind::CopyStrContent,
            OpKind::CopyStrContent,
            OpKind::Jump,
        ]
    );
    assert_eq!(out.ops[2].arg(0), Value::int(2));
}

#[test]
fn test_optimization_is_idempotent() {
    let mut descrs = DescrTable::new();
    let vt = RefConst(0x1000);
    let node = descrs.add_type("Node", Some(vt), &[("value", ValueKind::Int)]);
    let value_field = descrs.fields_of(node)[0];

    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let p = tl.emit(
        OpKind::NewWithVtable,
        [Value::reference(vt)],
        ValueKind::Ref,
    );
    tl.emit_void(
        OpKind::SetfieldGc,
        [Value::Box(p), Value::Box(i0)],
        Some(DescrRef::Field(value_field)),
    );
    let v = tl.emit_with_descr(
        OpKind::GetfieldGc,
        [Value::Box(p)],
        DescrRef::Field(value_field),
        ValueKind::Int,
    );
    let r = tl.emit(
        OpKind::IntAdd,
        [Value::Box(v), Value::int(1)],
        ValueKind::Int,
    );
    tl.emit_void(OpKind::Jump, [Value::Box(r)], None);

    let once = run(&descrs, tl).unwrap();
    let first = kinds(&once);
    let twice = run(&descrs, once).unwrap();
    assert_eq!(kinds(&twice), first);
}

#[test]
fn test_bound_narrowing_kills_second_guard() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let lt10 = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(10)],
        ValueKind::Int,
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let fi = tl.store.push_frame_info(None, CodeId(0), 0);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(lt10)], snap, fi);
    // implied by i0 < 10
    let lt100 = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(100)],
        ValueKind::Int,
    );
    let snap2 = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(lt100)], snap2, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(i0)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(
        kinds(&out),
        vec![OpKind::IntLt, OpKind::GuardTrue, OpKind::Jump]
    );
}

#[test]
fn test_overflow_guard_dropped_when_in_range() {
    let descrs = DescrTable::new();
    let mut tl = TraceLoop::new(&[ValueKind::Int]);
    let i0 = tl.input_args[0];
    let lt = tl.emit(
        OpKind::IntLt,
        [Value::Box(i0), Value::int(1000)],
        ValueKind::Int,
    );
    let snap = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    let fi = tl.store.push_frame_info(None, CodeId(0), 0);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(lt)], snap, fi);
    let ge = tl.emit(
        OpKind::IntGe,
        [Value::Box(i0), Value::int(0)],
        ValueKind::Int,
    );
    let snap2 = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    tl.emit_guard(OpKind::GuardTrue, [Value::Box(ge)], snap2, fi);
    // 0 <= i0 < 1000, so i0 + 1 cannot overflow
    let r = tl.emit(
        OpKind::IntAddOvf,
        [Value::Box(i0), Value::int(1)],
        ValueKind::Int,
    );
    let snap3 = tl.store.push_snapshot(None, vec![Value::Box(i0)]);
    tl.emit_guard(OpKind::GuardNoOverflow, [], snap3, fi);
    tl.emit_void(OpKind::Jump, [Value::Box(r)], None);

    let out = run(&descrs, tl).unwrap();
    assert_eq!(
        kinds(&out),
        vec![
            OpKind::IntLt,
            OpKind::GuardTrue,
            OpKind::IntGe,
            OpKind::GuardTrue,
            OpKind::IntAdd,
            OpKind::Jump,
        ]
    );
}
