//! Dynamic dispatch: a type-id cascade in place of vtables (§4.9).

use inkwell::values::BasicValueEnum;
use inkwell::IntPredicate;

use crate::ast::{DispatchTarget, NodeArena, NodeId, NodeRange};
use crate::builder::Builder;
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

impl<'ll> Builder<'_, 'll, '_> {
    /// Lower a call whose receiver's static type admits more than one
    /// concrete implementation (§4.9). Each candidate is tried in order;
    /// the chain ends in `unreachable` since type inference guarantees
    /// exhaustiveness.
    pub fn compile_dispatch(
        &self,
        targets: &[DispatchTarget],
        receiver: NodeId,
        args: NodeRange,
        result_ty: Option<TypeRef>,
        arena: &NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let recv_ty = arena.type_of(receiver).ok_or_else(|| CodegenError::internal("dispatch receiver has no type", self))?;
        let recv_val = self
            .compile_expr(receiver, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("dispatch receiver produced no value", self))?;

        let recv_tag = if self.cx().types.is_union(recv_ty) || self.cx().types.is_hierarchy(recv_ty) {
            Some(self.load_union_tag(recv_val.into_pointer_value(), recv_ty)?)
        } else {
            None
        };

        // §4.9 step 1: evaluate the arguments exactly once, up front, and
        // reuse those values (alongside `recv_val` above) across every
        // candidate instead of re-running their source expressions per arm.
        let arg_ids: Vec<NodeId> = arena.range(args).to_vec();
        let mut shared_args = Vec::with_capacity(arg_ids.len());
        for &arg_id in &arg_ids {
            let v = self
                .compile_expr(arg_id, arena, ecx)?
                .ok_or_else(|| CodegenError::internal("dispatch argument produced no value", self))?;
            shared_args.push(v);
        }

        let union_slot = match result_ty {
            Some(t) if self.cx().types.is_union(t) => Some(self.alloca(self.cx().union_struct_type(t).into(), "dispatch.union_slot")?),
            _ => None,
        };
        let merge_bb = self.append_block("dispatch.merge");
        let mut incoming = Vec::new();

        for (i, target) in targets.iter().enumerate() {
            let current_bb = self.append_block(&format!("dispatch.case{i}"));
            let next_bb = if i + 1 < targets.len() {
                self.append_block(&format!("dispatch.next{i}"))
            } else {
                self.append_block("dispatch.miss")
            };

            let matches = self.receiver_matches(recv_tag, target.owner)?;
            self.cond_br(matches, current_bb, next_bb)?;

            self.position_at_end(current_bb);
            let (mangled_name, owner, param_types, return_type) = self.def_signature(target.def, arena)?;
            let boxed_recv = self.box_receiver_for(recv_val, Some(recv_ty), owner)?;
            let mut candidate_args = Vec::with_capacity(shared_args.len() + 1);
            candidate_args.push(boxed_recv);
            candidate_args.extend(shared_args.iter().copied());
            let candidate_result = self.emit_resolved_call(&mangled_name, &param_types, return_type, &candidate_args, None, result_ty, target.def, arena, ecx)?;
            if let (Some(slot), Some(v), Some(ty)) = (union_slot, candidate_result, result_ty) {
                let v_ty = result_ty.unwrap_or(ty);
                self.assign_to_union(slot, ty, v_ty, v)?;
            }
            if self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
                if let Some(exit) = self.current_block() {
                    incoming.push((candidate_result, exit));
                }
                self.br(merge_bb)?;
            }

            self.position_at_end(next_bb);
        }

        // Guaranteed dead by exhaustive dispatch (§4.9 point 4).
        self.unreachable()?;

        self.position_at_end(merge_bb);
        if let Some(slot) = union_slot {
            let ty = result_ty.expect("union slot implies result type");
            let loaded = self.load(self.cx().union_struct_type(ty).into(), slot, "dispatch.result")?;
            return Ok(Some(loaded));
        }
        match result_ty {
            Some(ty) if !incoming.is_empty() => {
                let phi = self
                    .raw_builder()
                    .build_phi(self.cx().llvm_type(ty), "dispatch.phi")
                    .map_err(|e| CodegenError::internal(format!("phi failed: {e}"), self))?;
                for (v, bb) in incoming {
                    if let Some(v) = v {
                        phi.add_incoming(&[(&v, bb)]);
                    }
                }
                Ok(Some(phi.as_basic_value()))
            }
            _ => Ok(None),
        }
    }

    fn receiver_matches(&self, recv_tag: Option<inkwell::values::IntValue<'ll>>, owner: TypeRef) -> Result<inkwell::values::IntValue<'ll>, CodegenError> {
        let types = self.cx().types;
        match recv_tag {
            Some(tag) => {
                let members = types.concrete_types(owner);
                let mut acc = self.cx().scx.type_i1().const_int(0, false);
                for m in members {
                    let tag_const = self.cx().scx.type_i32().const_int(u64::from(types.type_id(m)), false);
                    let eq = self.icmp(IntPredicate::EQ, tag, tag_const, "dispatch.eq")?;
                    acc = self
                        .raw_builder()
                        .build_or(acc, eq, "dispatch.or")
                        .map_err(|e| CodegenError::internal(format!("or failed: {e}"), self))?;
                }
                Ok(acc)
            }
            None => Ok(self.cx().scx.type_i1().const_int(1, false)),
        }
    }
}
