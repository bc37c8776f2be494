//! End-to-end JIT scenarios (§8 S1-S6), built directly against
//! `NodeArena`/`TypePool` since no parser exists in this crate.

use pretty_assertions::assert_eq;

use crystal_codegen::ast::{
    BlockSpec, DefId, IntrinsicBinOp, IntrinsicOp, Literal, Node, NodeArena, NumberKind, Param, RescueClause, VarKind,
};
use crystal_codegen::types::{TypeKind, TypePool};
use crystal_codegen::{run, ModuleCompiler, TypeRef};
use inkwell::context::Context;

fn i32_lit(arena: &mut NodeArena, ty: TypeRef, value: i64) -> crystal_codegen::NodeId {
    arena.push(
        Node::Literal(Literal::Number { bits: value as u64, kind: NumberKind::I32 }),
        Some(ty),
    )
}

/// S1: `1 + 2` → program exit value 3.
#[test]
fn arithmetic_literal_sum() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let mut arena = NodeArena::new();

    let one = i32_lit(&mut arena, i32_ty, 1);
    let two = i32_lit(&mut arena, i32_ty, 2);
    let sum = arena.push(
        Node::Intrinsic(IntrinsicBinOp { op: IntrinsicOp::IAdd, lhs: one, rhs: two }),
        Some(i32_ty),
    );
    let ret = arena.push(Node::Return(Some(sum)), None);

    let exit = run("s1_arithmetic", &[ret], &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 3);
}

/// S6: a constant whose initializer needs the deferred const-block chain is
/// computed exactly once; repeated reads observe the same value.
#[test]
fn constant_with_deferred_init_is_computed_once() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let mut arena = NodeArena::new();

    let forty = i32_lit(&mut arena, i32_ty, 40);
    let one = i32_lit(&mut arena, i32_ty, 1);
    let init = arena.push(
        Node::Intrinsic(IntrinsicBinOp { op: IntrinsicOp::IAdd, lhs: forty, rhs: one }),
        Some(i32_ty),
    );
    let const_def = arena.push(
        Node::ConstDef { name: "MAX".to_string(), ty: i32_ty, init, needs_const_block: true },
        None,
    );

    let read_a = arena.push(Node::Var { kind: VarKind::Constant, name: "MAX".to_string() }, Some(i32_ty));
    let read_b = arena.push(Node::Var { kind: VarKind::Constant, name: "MAX".to_string() }, Some(i32_ty));
    let sum = arena.push(
        Node::Intrinsic(IntrinsicBinOp { op: IntrinsicOp::IAdd, lhs: read_a, rhs: read_b }),
        Some(i32_ty),
    );
    let ret = arena.push(Node::Return(Some(sum)), None);

    let top_level = [const_def, ret];
    let exit = run("s6_deferred_const", &top_level, &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 82);
}

/// S2 (approximation): an `if` whose branches produce different concrete
/// members of a union keeps the correct runtime tag per branch.
#[test]
fn if_branches_into_union_preserves_tag() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let bool_ty = pool.intern(TypeKind::Bool);
    let union_ty = pool.union_of(vec![i32_ty, bool_ty]);
    let mut arena = NodeArena::new();

    let cond = arena.push(Node::Literal(Literal::Bool(true)), Some(bool_ty));
    let then_branch = i32_lit(&mut arena, i32_ty, 7);
    let else_branch = arena.push(Node::Literal(Literal::Bool(false)), Some(bool_ty));
    let if_node = arena.push(
        Node::If { cond, then_branch, else_branch: Some(else_branch) },
        Some(union_ty),
    );
    let is_int = arena.push(Node::IsA { value: if_node, target: i32_ty }, Some(bool_ty));
    let ret = arena.push(Node::Return(Some(is_int)), None);

    let exit = run("s2_union_tag", &[ret], &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 1);
}

/// S4 (approximation): a nilable read short-circuits to a default when nil.
#[test]
fn nilable_read_defaults_when_nil() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let nilable_ty = pool.intern(TypeKind::NilableOf(i32_ty));
    let mut arena = NodeArena::new();

    let nil_lit = arena.push(Node::Literal(Literal::Nil), Some(nilable_ty));
    let assign = arena.push(
        Node::Assign { kind: VarKind::Local, name: "x".to_string(), value: nil_lit },
        None,
    );
    let cond_read = arena.push(Node::Var { kind: VarKind::Local, name: "x".to_string() }, Some(nilable_ty));
    let zero = i32_lit(&mut arena, i32_ty, 0);
    let narrowed_read = arena.push(Node::Var { kind: VarKind::Local, name: "x".to_string() }, Some(nilable_ty));
    let casted = arena.push(Node::CastedVar { inner: narrowed_read, target: i32_ty }, Some(i32_ty));
    let if_node = arena.push(
        Node::If { cond: cond_read, then_branch: casted, else_branch: Some(zero) },
        Some(i32_ty),
    );
    let ret = arena.push(Node::Return(Some(if_node)), None);

    let top_level = [assign, ret];
    let exit = run("s4_nilable_default", &top_level, &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 0);
}

/// A `while` loop accumulating into a local, exited via the loop condition
/// (not part of S1-S6, covers §4.4 control flow not otherwise exercised).
#[test]
fn while_loop_accumulates_until_condition_false() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let bool_ty = pool.intern(TypeKind::Bool);
    let mut arena = NodeArena::new();

    let zero = i32_lit(&mut arena, i32_ty, 0);
    let init = arena.push(
        Node::Assign { kind: VarKind::Local, name: "n".to_string(), value: zero },
        None,
    );

    let n_read = arena.push(Node::Var { kind: VarKind::Local, name: "n".to_string() }, Some(i32_ty));
    let three = i32_lit(&mut arena, i32_ty, 3);
    let cond = arena.push(
        Node::Intrinsic(IntrinsicBinOp { op: IntrinsicOp::ICmpLt, lhs: n_read, rhs: three }),
        Some(bool_ty),
    );

    let n_read2 = arena.push(Node::Var { kind: VarKind::Local, name: "n".to_string() }, Some(i32_ty));
    let one = i32_lit(&mut arena, i32_ty, 1);
    let next = arena.push(
        Node::Intrinsic(IntrinsicBinOp { op: IntrinsicOp::IAdd, lhs: n_read2, rhs: one }),
        Some(i32_ty),
    );
    let body = arena.push(
        Node::Assign { kind: VarKind::Local, name: "n".to_string(), value: next },
        None,
    );

    let while_node = arena.push(Node::While { cond, body, run_once: false }, None);
    let n_final = arena.push(Node::Var { kind: VarKind::Local, name: "n".to_string() }, Some(i32_ty));
    let ret = arena.push(Node::Return(Some(n_final)), None);

    let top_level = [init, while_node, ret];
    let exit = run("while_accumulate", &top_level, &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 3);
}

/// S3: `return` from inside a block passed to a yielding method exits the
/// *enclosing method*, not just the yielding call — the statement after the
/// call never runs. Models `def outer; each(10) { |x| return 5 }; return 999; end`.
#[test]
fn return_inside_yielded_block_escapes_the_enclosing_method() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let mut arena = NodeArena::new();

    let n_read = arena.push(Node::Var { kind: VarKind::Local, name: "n".to_string() }, Some(i32_ty));
    let yield_args = arena.push_range(&[n_read]);
    let yield_node = arena.push(Node::Yield { args: yield_args }, None);
    let each_def = arena.push(
        Node::Def {
            id: DefId(1),
            name: "each".to_string(),
            owner: None,
            params: vec![Param { name: "n".to_string(), ty: i32_ty }],
            return_type: i32_ty,
            body: Some(yield_node),
            is_external: false,
            no_return: false,
        },
        None,
    );

    let five = i32_lit(&mut arena, i32_ty, 5);
    let early_return = arena.push(Node::Return(Some(five)), None);
    let ten = i32_lit(&mut arena, i32_ty, 10);
    let block_spec = BlockSpec { params: vec![Param { name: "x".to_string(), ty: i32_ty }], body: early_return };
    let ten_args = arena.push_range(&[ten]);
    let call_each = arena.push(
        Node::Call { def: DefId(1), receiver: None, args: ten_args, block: Some(block_spec) },
        Some(i32_ty),
    );
    let never_taken = i32_lit(&mut arena, i32_ty, 999);
    let late_return = arena.push(Node::Return(Some(never_taken)), None);
    let outer_body = arena.push(Node::Sequence(arena.push_range(&[call_each, late_return])), Some(i32_ty));
    let outer_def = arena.push(
        Node::Def {
            id: DefId(2),
            name: "outer".to_string(),
            owner: None,
            params: vec![],
            return_type: i32_ty,
            body: Some(outer_body),
            is_external: false,
            no_return: false,
        },
        None,
    );

    let call_outer = arena.push(Node::Call { def: DefId(2), receiver: None, args: crystal_codegen::NodeRange::EMPTY, block: None }, Some(i32_ty));
    let assign = arena.push(Node::Assign { kind: VarKind::Local, name: "r".to_string(), value: call_outer }, None);
    let read_r = arena.push(Node::Var { kind: VarKind::Local, name: "r".to_string() }, Some(i32_ty));
    let ret = arena.push(Node::Return(Some(read_r)), None);

    let top_level = [each_def, outer_def, assign, ret];
    let exit = run("s3_return_escapes_method", &top_level, &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 5, "return from inside the block must short-circuit outer(), not fall through to 999");
}

/// S3: `break` from inside a block exits only the yielding call — the
/// caller's own subsequent statements still run. Models
/// `def outer; each(20) { |y| break }; marker = 42; return marker; end`.
#[test]
fn break_inside_yielded_block_exits_only_the_call() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let void_ty = pool.intern(TypeKind::Void);
    let mut arena = NodeArena::new();

    let n_read = arena.push(Node::Var { kind: VarKind::Local, name: "n".to_string() }, Some(i32_ty));
    let yield_args = arena.push_range(&[n_read]);
    let yield_node = arena.push(Node::Yield { args: yield_args }, None);
    let each_def = arena.push(
        Node::Def {
            id: DefId(3),
            name: "each2".to_string(),
            owner: None,
            params: vec![Param { name: "n".to_string(), ty: i32_ty }],
            return_type: void_ty,
            body: Some(yield_node),
            is_external: false,
            no_return: false,
        },
        None,
    );

    let break_node = arena.push(Node::Break(None), None);
    let twenty = i32_lit(&mut arena, i32_ty, 20);
    let block_spec = BlockSpec { params: vec![Param { name: "y".to_string(), ty: i32_ty }], body: break_node };
    let twenty_args = arena.push_range(&[twenty]);
    let call_each = arena.push(Node::Call { def: DefId(3), receiver: None, args: twenty_args, block: Some(block_spec) }, None);

    let forty_two = i32_lit(&mut arena, i32_ty, 42);
    let assign_marker = arena.push(Node::Assign { kind: VarKind::Local, name: "marker".to_string(), value: forty_two }, None);
    let marker_read = arena.push(Node::Var { kind: VarKind::Local, name: "marker".to_string() }, Some(i32_ty));
    let return_marker = arena.push(Node::Return(Some(marker_read)), None);

    let outer_range = arena.push_range(&[call_each, assign_marker, return_marker]);
    let outer_body = arena.push(Node::Sequence(outer_range), Some(i32_ty));
    let outer_def = arena.push(
        Node::Def {
            id: DefId(4),
            name: "outer2".to_string(),
            owner: None,
            params: vec![],
            return_type: i32_ty,
            body: Some(outer_body),
            is_external: false,
            no_return: false,
        },
        None,
    );

    let call_outer = arena.push(Node::Call { def: DefId(4), receiver: None, args: crystal_codegen::NodeRange::EMPTY, block: None }, Some(i32_ty));
    let assign = arena.push(Node::Assign { kind: VarKind::Local, name: "r".to_string(), value: call_outer }, None);
    let read_r = arena.push(Node::Var { kind: VarKind::Local, name: "r".to_string() }, Some(i32_ty));
    let ret = arena.push(Node::Return(Some(read_r)), None);

    let top_level = [each_def, outer_def, assign, ret];
    let exit = run("s3_break_exits_call_only", &top_level, &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 42, "break must only exit each2's call, leaving outer2's later statements to run");
}

/// S5 (happy path): a `begin ... rescue ... end` whose body never raises
/// simply evaluates to the body's own value; the rescue arm is untouched.
#[test]
fn handler_without_a_raise_evaluates_to_the_body_value() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let mut arena = NodeArena::new();

    let body = i32_lit(&mut arena, i32_ty, 7);
    let rescue_value = i32_lit(&mut arena, i32_ty, -1);
    let handler = arena.push(
        Node::Handler {
            body,
            rescues: vec![RescueClause { matched_types: vec![i32_ty], bound_name: None, body: rescue_value }],
            ensure: None,
        },
        Some(i32_ty),
    );
    let ret = arena.push(Node::Return(Some(handler)), None);

    let exit = run("s5_handler_no_raise", &[ret], &arena, &pool).expect("module compiles and runs");
    assert_eq!(exit, 7);
}

/// S5: a `raise` lowers to `invoke` (with a landing-pad unwind edge) when
/// inside an active handler, and to a plain `call` otherwise (§4.7, §4.11).
/// Asserted on the generated IR directly rather than by actually unwinding —
/// `_Unwind_RaiseException`/`__crystal_personality` are external runtime
/// entry points this crate only declares, with no implementation linked into
/// the test binary to actually execute a real unwind against.
#[test]
fn raise_lowers_to_invoke_inside_a_handler_and_call_outside_one() {
    let mut pool = TypePool::new();
    let i32_ty = pool.intern(TypeKind::Int32);
    let mut arena = NodeArena::new();

    let exc = i32_lit(&mut arena, i32_ty, 1);
    let raise_in_handler = arena.push(Node::Raise(exc), None);
    let rescue_value = i32_lit(&mut arena, i32_ty, 2);
    let handler = arena.push(
        Node::Handler {
            body: raise_in_handler,
            rescues: vec![RescueClause { matched_types: vec![i32_ty], bound_name: None, body: rescue_value }],
            ensure: None,
        },
        Some(i32_ty),
    );

    let exc2 = i32_lit(&mut arena, i32_ty, 3);
    let raise_outside_handler = arena.push(Node::Raise(exc2), None);

    let top_level = [handler, raise_outside_handler];

    let context = Context::create();
    let compiler = ModuleCompiler::new(&context, "s5_raise_lowering", &pool);
    compiler.compile_module(&top_level, &arena).expect("module compiles and verifies");

    let ir = compiler.module().print_to_string().to_string();
    assert!(ir.contains("invoke void @_Unwind_RaiseException"), "raise inside the handler's body must invoke:\n{ir}");
    assert!(ir.contains("call void @_Unwind_RaiseException"), "raise outside any handler must still reach a plain call:\n{ir}");
}
