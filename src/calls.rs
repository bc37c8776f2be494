//! Call lowering & monomorphization (§4.7).

use inkwell::values::BasicValueEnum;

use crate::ast::{BlockSpec, DefId, Node, NodeArena, NodeId, NodeRange};
use crate::builder::Builder;
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

impl<'ll> Builder<'_, 'll, '_> {
    /// Lower a single-target call (§4.7): evaluate the receiver and
    /// arguments, then emit. If `block` is present the callee is inlined
    /// (§4.8) instead of truly invoked.
    pub fn compile_call(
        &self,
        def: DefId,
        receiver: Option<NodeId>,
        args: NodeRange,
        block: Option<&BlockSpec>,
        result_ty: Option<TypeRef>,
        arena: &NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let (mangled_name, owner, param_types, return_type) = self.def_signature(def, arena)?;

        let recv_val = match receiver {
            Some(r) => Some(self.prepare_receiver(r, owner, arena, ecx)?),
            None => None,
        };

        let mut arg_vals = Vec::new();
        if let Some(rv) = recv_val {
            arg_vals.push(rv);
        }
        for &arg_id in arena.range(args) {
            let v = self
                .compile_expr(arg_id, arena, ecx)?
                .ok_or_else(|| CodegenError::internal("call argument produced no value", self))?;
            arg_vals.push(v);
        }

        self.emit_resolved_call(&mangled_name, &param_types, return_type, &arg_vals, block, result_ty, def, arena, ecx)
    }

    /// Emit a call whose receiver/argument values are already materialized
    /// (§4.9 step 1: a dispatch cascade evaluates the receiver and arguments
    /// exactly once and reuses those values across every candidate, rather
    /// than re-running their source expressions per candidate).
    pub(crate) fn emit_resolved_call(
        &self,
        mangled_name: &str,
        param_types: &[TypeRef],
        return_type: Option<TypeRef>,
        arg_vals: &[BasicValueEnum<'ll>],
        block: Option<&BlockSpec>,
        result_ty: Option<TypeRef>,
        def: DefId,
        arena: &NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        if let Some(block_spec) = block {
            let union_slot = match result_ty {
                Some(t) if self.cx().types.is_union(t) => Some(self.alloca(self.cx().union_struct_type(t).into(), "call.union_slot")?),
                _ => None,
            };
            let continuation = self.append_block("call.block.cont");
            let result = self.with_inlined_block(block_spec, continuation, return_type.unwrap_or(self.cx().types.nil_type()), union_slot, ecx, |b, ecx| {
                b.codegen_fun_body_inline(def, arg_vals, arena, ecx)
            })?;
            if self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
                self.br(continuation)?;
            }
            self.position_at_end(continuation);
            if let Some(slot) = union_slot {
                let ty = return_type.expect("union slot implies return type");
                let loaded = self.load(self.cx().union_struct_type(ty).into(), slot, "call.block.result")?;
                return Ok(Some(loaded));
            }
            return Ok(result);
        }

        let callee = self.cx().declare_fn(mangled_name, param_types, return_type);
        let call_name = "call";

        let raw_result = if let Some(handler) = ecx.current_handler() {
            let normal = self.append_block("call.normal");
            let result = self.invoke(callee, arg_vals, normal, handler.catch_block, call_name)?;
            self.position_at_end(normal);
            result
        } else {
            self.call(callee, arg_vals, call_name)?
        };

        match (result_ty, raw_result) {
            (Some(t), Some(v)) if self.cx().types.is_union(t) => {
                // The call's own return slot already carries the union
                // representation, nothing further to promote.
                Ok(Some(v))
            }
            _ => Ok(raw_result),
        }
    }

    pub(crate) fn def_signature(&self, def: DefId, arena: &NodeArena) -> Result<(String, Option<TypeRef>, Vec<TypeRef>, Option<TypeRef>), CodegenError> {
        let id = arena.def_node(def).ok_or_else(|| CodegenError::internal(format!("no Def node for {def:?}"), self))?;
        match arena.get(id) {
            Node::Def { name, owner, params, return_type, .. } => {
                let mangled = crate::function_compiler::mangled_name(name, *owner, params);
                let param_types = crate::function_compiler::def_param_types(*owner, params);
                let ret = if matches!(self.cx().types.kind(*return_type), crate::types::TypeKind::Void) {
                    None
                } else {
                    Some(*return_type)
                };
                Ok((mangled, *owner, param_types, ret))
            }
            _ => Err(CodegenError::internal(format!("node for {def:?} is not a Def"), self)),
        }
    }

    /// Receiver lowering (§4.7): evaluate then box into hierarchy
    /// representation as needed.
    fn prepare_receiver(&self, receiver: NodeId, owner: Option<TypeRef>, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<BasicValueEnum<'ll>, CodegenError> {
        let compiled = self
            .compile_expr(receiver, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("receiver produced no value", self))?;
        let recv_ty = arena.type_of(receiver);
        self.box_receiver_for(compiled, recv_ty, owner)
    }

    /// Adjust an already-evaluated receiver value for a specific candidate's
    /// owner (§4.9): box into that owner's hierarchy representation when its
    /// static type differs, otherwise reuse the value unchanged. Split out
    /// of `prepare_receiver` so a dispatch cascade can re-box one
    /// already-evaluated receiver per candidate without re-evaluating the
    /// receiver expression itself.
    pub(crate) fn box_receiver_for(&self, compiled: BasicValueEnum<'ll>, recv_ty: Option<TypeRef>, owner: Option<TypeRef>) -> Result<BasicValueEnum<'ll>, CodegenError> {
        match (owner, recv_ty) {
            (Some(owner_ty), Some(rty)) if owner_ty != rty && self.cx().types.is_hierarchy(owner_ty) => {
                let boxed = self.alloca(self.cx().union_struct_type(owner_ty).into(), "recv.box")?;
                self.assign_to_union(boxed, owner_ty, rty, compiled)?;
                Ok(boxed.into())
            }
            _ => Ok(compiled),
        }
    }

    /// Inline the callee's own body directly (used for calls with a block,
    /// §4.8, in place of a true `call`/`invoke`).
    fn codegen_fun_body_inline(&self, def: DefId, arg_vals: &[BasicValueEnum<'ll>], arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let id = arena.def_node(def).ok_or_else(|| CodegenError::internal(format!("no Def node for {def:?}"), self))?;
        let (params, body) = match arena.get(id) {
            Node::Def { params, body, .. } => (params.clone(), *body),
            _ => return Err(CodegenError::internal(format!("node for {def:?} is not a Def"), self)),
        };
        let body = body.ok_or_else(|| CodegenError::internal("block-taking def has no body", self))?;
        let mut callee_vars = ecx.vars.child();
        for (param, &arg_val) in params.iter().zip(arg_vals.iter()) {
            self.declare_local(&mut callee_vars, &param.name, param.ty, false, arg_val)?;
        }
        let saved = std::mem::replace(&mut ecx.vars, callee_vars);
        let result = self.compile_expr(body, arena, ecx);
        ecx.vars = saved;
        result
    }
}
