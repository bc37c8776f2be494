//! Block (iterator-closure) inlining (§4.8).
//!
//! A call with an attached block does not invoke the callee as a true
//! function call — its body is inlined at this call site, in the caller's
//! own function, with `yield` splicing the block body in and `break`/
//! `return` wired to the call's rendezvous blocks.

use inkwell::values::BasicValueEnum;

use crate::ast::{BlockSpec, NodeArena, NodeRange};
use crate::builder::Builder;
use crate::emit_context::{BlockActivation, EmitCx, ReturnTarget};
use crate::error::CodegenError;
use crate::types::TypeRef;

impl<'ll> Builder<'_, 'll, '_> {
    /// Push the block context for a call-with-block, run the callee body
    /// with `yield` able to splice in the block, then tear the activation
    /// down.
    #[allow(clippy::too_many_arguments, reason = "mirrors the call-lowering signature this helper is part of")]
    pub fn with_inlined_block<F>(
        &self,
        block: &BlockSpec,
        call_return_block: inkwell::basic_block::BasicBlock<'ll>,
        call_return_type: TypeRef,
        call_union_slot: Option<inkwell::values::PointerValue<'ll>>,
        ecx: &mut EmitCx<'ll>,
        run_callee_body: F,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError>
    where
        F: FnOnce(&Self, &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError>,
    {
        ecx.block_stack.push(BlockActivation {
            block_body: block.body,
            block_params: block.params.iter().map(|p| p.name.clone()).collect(),
            caller_vars: ecx.vars.child(),
            block_type: call_return_type,
            call_return_block,
            call_return_type,
            call_union_slot,
        });

        let result = run_callee_body(self, ecx)?;

        ecx.block_stack.pop();
        Ok(result)
    }

    /// `yield` (§4.8): pop the top block activation, bind its formal
    /// parameters from the yielded arguments, swap `return`/`break` targets
    /// to the caller's rendezvous, inline the block body, then restore.
    pub fn compile_yield(&self, args: NodeRange, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let activation = ecx
            .block_stack
            .pop()
            .ok_or_else(|| CodegenError::internal("yield with no active block", self))?;

        let mut block_vars = activation.caller_vars.clone();
        for (&arg_id, param_name) in arena.range(args).iter().zip(activation.block_params.iter()) {
            let arg_ty = arena
                .type_of(arg_id)
                .ok_or_else(|| CodegenError::internal("yielded argument has no type", self))?;
            let compiled = self
                .compile_expr(arg_id, arena, ecx)?
                .ok_or_else(|| CodegenError::internal("yielded argument produced no value", self))?;
            self.declare_local(&mut block_vars, param_name, arg_ty, false, compiled)?;
        }

        let saved_vars = std::mem::replace(&mut ecx.vars, block_vars);
        let saved_return_target = ecx.return_target.replace(ReturnTarget {
            block: activation.call_return_block,
            return_type: activation.call_return_type,
            union_slot: activation.call_union_slot,
        });
        let block_body = activation.block_body;

        let result = self.compile_expr(block_body, arena, ecx);

        ecx.vars = saved_vars;
        ecx.return_target = saved_return_target;
        // Restore the activation so a subsequent `yield` in the same call
        // can still find it.
        ecx.block_stack.push(activation);

        result
    }

    /// `break` from inside an inlined block (§4.8, §4.5 Invariant): exits the
    /// enclosing `yield`'s call, optionally carrying a value into its union
    /// slot.
    pub fn break_from_block(&self, value: Option<BasicValueEnum<'ll>>, value_ty: Option<TypeRef>, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let target = ecx
            .return_target
            .ok_or_else(|| CodegenError::internal("break inside a block with no active call rendezvous", self))?;

        if let (Some(slot), Some(v), Some(v_ty)) = (target.union_slot, value, value_ty) {
            self.assign_to_union(slot, target.return_type, v_ty, v)?;
        }
        self.br(target.block)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;
    use inkwell::values::FunctionValue;

    use super::*;
    use crate::context::CodegenCx;
    use crate::emit_context::ReturnTarget;
    use crate::types::{TypeKind, TypePool};

    fn make_fn<'ll>(cx: &CodegenCx<'ll, '_>, name: &str) -> (FunctionValue<'ll>, inkwell::basic_block::BasicBlock<'ll>) {
        let fn_type = cx.scx.type_void().fn_type(&[], false);
        let function = cx.scx.llmod.add_function(name, fn_type, None);
        let alloca_bb = cx.scx.llcx.append_basic_block(function, "alloca");
        (function, alloca_bb)
    }

    #[test]
    fn break_from_block_branches_to_call_return_block() {
        let context = Context::create();
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let target_bb = cx.scx.llcx.append_basic_block(function, "call.cont");

        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let mut ecx = EmitCx::new(None);
        ecx.return_target = Some(ReturnTarget { block: target_bb, return_type: i32_ty, union_slot: None });

        builder.break_from_block(None, None, &mut ecx).expect("break_from_block");

        let terminator = entry_bb.get_terminator().expect("break emits a terminator");
        assert_eq!(terminator.get_num_operands(), 1);
        assert_eq!(terminator.get_operand(0).and_then(|o| o.right()), Some(target_bb));
    }

    #[test]
    fn break_from_block_without_active_target_errs() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let mut ecx = EmitCx::new(None);
        assert!(builder.break_from_block(None, None, &mut ecx).is_err());
    }

    #[test]
    fn yield_without_active_block_errs() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let arena = NodeArena::new();
        let mut ecx = EmitCx::new(None);
        assert!(builder.compile_yield(NodeRange::EMPTY, &arena, &mut ecx).is_err());
    }

    #[test]
    fn with_inlined_block_pushes_activation_for_the_duration_of_the_callee_body() {
        use crate::ast::{Node, Param};

        let context = Context::create();
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let cont_bb = cx.scx.llcx.append_basic_block(function, "call.cont");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let mut arena = NodeArena::new();
        let body = arena.push(Node::Nop, None);
        let block_spec = BlockSpec { params: vec![Param { name: "x".to_string(), ty: i32_ty }], body };

        let mut ecx = EmitCx::new(None);
        assert_eq!(ecx.block_stack.len(), 0);
        builder
            .with_inlined_block(&block_spec, cont_bb, i32_ty, None, &mut ecx, |_b, ecx| {
                assert_eq!(ecx.block_stack.len(), 1);
                Ok(None)
            })
            .expect("with_inlined_block");
        assert_eq!(ecx.block_stack.len(), 0);
    }
}
