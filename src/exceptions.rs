//! Exception handling via an Itanium-style landing pad (§4.11).

use inkwell::types::BasicType;
use inkwell::values::BasicValueEnum;
use inkwell::IntPredicate;

use crate::ast::{NodeArena, NodeId, RescueClause};
use crate::builder::Builder;
use crate::emit_context::{EmitCx, HandlerFrame};
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

const PERSONALITY_FN_NAME: &str = "__crystal_personality";
const UNWIND_RAISE_FN_NAME: &str = "_Unwind_RaiseException";

impl<'ll> Builder<'_, 'll, '_> {
    /// Ensure `__crystal_personality` is declared and attached to the
    /// current function (idempotent, §4.11).
    fn ensure_personality(&self) -> Result<(), CodegenError> {
        let personality = self.cx().declare_extern_fn(PERSONALITY_FN_NAME, &[], None);
        self.function().set_personality_function(personality);
        Ok(())
    }

    /// `begin ... rescue ... ensure ... end` (§4.11): push a handler frame,
    /// emit the protected body, then the landing pad with a flat-disjunction
    /// rescue cascade (§9 open question, resolved: each rescue's types are
    /// matched as a flat disjunction, not a subtype chain).
    pub fn compile_handler(
        &self,
        body: NodeId,
        rescues: &[RescueClause],
        ensure: Option<NodeId>,
        result_ty: Option<TypeRef>,
        arena: &NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        self.ensure_personality()?;

        let catch_bb = self.append_block("handler.catch");
        let merge_bb = self.append_block("handler.merge");

        ecx.handler_stack.push(HandlerFrame { catch_block: catch_bb });
        let union_slot = match result_ty {
            Some(t) if self.cx().types.is_union(t) => Some(self.alloca(self.cx().union_struct_type(t).into(), "handler.union_slot")?),
            _ => None,
        };

        let body_val = self.compile_expr(body, arena, ecx)?;
        ecx.handler_stack.pop();
        if let (Some(slot), Some(v), Some(ty)) = (union_slot, body_val, result_ty) {
            let body_ty = arena.type_of(body).unwrap_or(ty);
            self.assign_to_union(slot, ty, body_ty, v)?;
        }
        let body_exit = self.current_block();
        let body_diverges = body_exit.and_then(inkwell::basic_block::BasicBlock::get_terminator).is_some();
        if !body_diverges {
            self.br(merge_bb)?;
        }

        self.position_at_end(catch_bb);
        let landing_ty = self.cx().scx.type_struct(&[self.cx().scx.type_ptr().into(), self.cx().scx.type_i32().into()], false);
        let landingpad = self
            .raw_builder()
            .build_landing_pad(landing_ty, self.cx().get_declared_fn(PERSONALITY_FN_NAME).expect("ensure_personality ran above"), &[], false, "lp")
            .map_err(|e| CodegenError::internal(format!("landingpad failed: {e}"), self))?;
        let caught_type_id = self
            .raw_builder()
            .build_extract_value(landingpad.into_struct_value(), 1, "lp.type_id")
            .map_err(|e| CodegenError::internal(format!("extractvalue failed: {e}"), self))?
            .into_int_value();

        let mut rescue_exits = Vec::new();
        for (i, clause) in rescues.iter().enumerate() {
            let arm_bb = self.append_block(&format!("rescue.arm{i}"));
            let next_bb = self.append_block(&format!("rescue.next{i}"));

            if clause.matched_types.is_empty() {
                self.br(arm_bb)?;
            } else {
                let mut acc = self.cx().scx.type_i1().const_int(0, false);
                for &mt in &clause.matched_types {
                    let tag = self.cx().scx.type_i32().const_int(u64::from(self.cx().types.type_id(mt)), false);
                    let eq = self.icmp(IntPredicate::EQ, caught_type_id, tag, "rescue.eq")?;
                    acc = self
                        .raw_builder()
                        .build_or(acc, eq, "rescue.or")
                        .map_err(|e| CodegenError::internal(format!("or failed: {e}"), self))?;
                }
                self.cond_br(acc, arm_bb, next_bb)?;
            }

            self.position_at_end(arm_bb);
            let arm_val = self.compile_expr(clause.body, arena, ecx)?;
            if let (Some(slot), Some(v), Some(ty)) = (union_slot, arm_val, result_ty) {
                let arm_ty = arena.type_of(clause.body).unwrap_or(ty);
                self.assign_to_union(slot, ty, arm_ty, v)?;
            }
            let arm_exit = self.current_block();
            if arm_exit.and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
                rescue_exits.push((arm_val, arm_exit.expect("just positioned")));
                self.br(merge_bb)?;
            }

            self.position_at_end(next_bb);
        }

        // No rescue matched: re-raise. `handler_stack` no longer holds this
        // handler's own frame (popped above), so this correctly targets an
        // enclosing handler, if any.
        self.reraise(landingpad.into_struct_value(), ecx)?;

        self.position_at_end(merge_bb);
        if let Some(ens) = ensure {
            // ensure's value is discarded; the pre-ensure result is preserved.
            self.compile_expr(ens, arena, ecx)?;
        }

        if let Some(slot) = union_slot {
            let ty = result_ty.expect("union slot implies result type");
            let loaded = self.load(self.cx().union_struct_type(ty).into(), slot, "handler.result")?;
            return Ok(Some(loaded));
        }
        match (result_ty, body_val, body_exit) {
            (Some(ty), Some(bv), Some(be)) if !rescue_exits.is_empty() => {
                let phi = self
                    .raw_builder()
                    .build_phi(self.cx().llvm_type(ty), "handler.phi")
                    .map_err(|e| CodegenError::internal(format!("phi failed: {e}"), self))?;
                if !body_diverges {
                    phi.add_incoming(&[(&bv, be)]);
                }
                for (v, bb) in rescue_exits {
                    if let Some(v) = v {
                        phi.add_incoming(&[(&v, bb)]);
                    }
                }
                Ok(Some(phi.as_basic_value()))
            }
            _ => Ok(body_val),
        }
    }

    pub fn compile_raise(&self, value: NodeId, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let exc = self
            .compile_expr(value, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("raise operand produced no value", self))?;
        self.emit_raise_call(exc, ecx, "raise")?;
        Ok(None)
    }

    fn reraise(&self, landingpad: inkwell::values::StructValue<'ll>, ecx: &EmitCx<'ll>) -> Result<(), CodegenError> {
        let exc_ptr = self
            .raw_builder()
            .build_extract_value(landingpad, 0, "lp.exc_ptr")
            .map_err(|e| CodegenError::internal(format!("extractvalue failed: {e}"), self))?;
        self.emit_raise_call(exc_ptr, ecx, "reraise")
    }

    /// Emit the `_Unwind_RaiseException` call a raise or re-raise lowers to
    /// (§4.11). Per §4.7, any call whose callee can raise uses `invoke` under
    /// an active handler so the unwind edge reaches that handler's landing
    /// pad; `_Unwind_RaiseException` never returns normally, so the
    /// `invoke`'s normal-continuation block is always `unreachable`.
    fn emit_raise_call(&self, exc: BasicValueEnum<'ll>, ecx: &EmitCx<'ll>, name: &str) -> Result<(), CodegenError> {
        let raise_fn = self.cx().declare_extern_fn(UNWIND_RAISE_FN_NAME, &[], None);
        match ecx.current_handler() {
            Some(handler) => {
                let normal_bb = self.append_block(&format!("{name}.normal"));
                self.invoke(raise_fn, &[exc], normal_bb, handler.catch_block, name)?;
                self.position_at_end(normal_bb);
                self.unreachable()
            }
            None => {
                self.call(raise_fn, &[exc], name)?;
                self.unreachable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;
    use inkwell::values::FunctionValue;

    use super::*;
    use crate::context::CodegenCx;
    use crate::emit_context::HandlerFrame;
    use crate::types::TypePool;

    fn make_fn<'ll>(cx: &CodegenCx<'ll, '_>, name: &str) -> (FunctionValue<'ll>, inkwell::basic_block::BasicBlock<'ll>) {
        let fn_type = cx.scx.type_void().fn_type(&[], false);
        let function = cx.scx.llmod.add_function(name, fn_type, None);
        let alloca_bb = cx.scx.llcx.append_basic_block(function, "alloca");
        (function, alloca_bb)
    }

    /// §4.7: with no active handler, a raise has no landing pad to target,
    /// so it must lower to a plain `call`, never an `invoke`.
    #[test]
    fn raise_without_active_handler_emits_plain_call() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        cx.declare_runtime();
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let ecx = EmitCx::new(None);
        let exc = cx.scx.type_ptr().const_null().into();
        builder.emit_raise_call(exc, &ecx, "raise").expect("emit_raise_call");

        let ir = cx.module().print_to_string().to_string();
        assert!(ir.contains(&format!("call void @{UNWIND_RAISE_FN_NAME}")), "expected a plain call:\n{ir}");
        assert!(!ir.contains(&format!("invoke void @{UNWIND_RAISE_FN_NAME}")), "no handler is active, so no invoke should appear:\n{ir}");
        assert_eq!(entry_bb.get_terminator().map(|t| t.get_opcode()), Some(inkwell::values::InstructionOpcode::Unreachable));
    }

    /// §4.7/§4.11: with an active handler, the raise must reach its landing
    /// pad, so it lowers to `invoke` targeting the handler's catch block.
    #[test]
    fn raise_with_active_handler_emits_invoke_to_catch_block() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        cx.declare_runtime();
        let (function, alloca_bb) = make_fn(&cx, "f");
        let entry_bb = cx.scx.llcx.append_basic_block(function, "entry");
        let catch_bb = cx.scx.llcx.append_basic_block(function, "handler.catch");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let mut ecx = EmitCx::new(None);
        ecx.handler_stack.push(HandlerFrame { catch_block: catch_bb });
        let exc = cx.scx.type_ptr().const_null().into();
        builder.emit_raise_call(exc, &ecx, "raise").expect("emit_raise_call");

        let ir = cx.module().print_to_string().to_string();
        assert!(ir.contains(&format!("invoke void @{UNWIND_RAISE_FN_NAME}")), "expected an invoke:\n{ir}");
        assert!(ir.contains("unwind label %handler.catch"), "invoke must unwind to the active handler's catch block:\n{ir}");
        let terminator = entry_bb.get_terminator().expect("invoke is itself a terminator");
        assert_eq!(terminator.get_opcode(), inkwell::values::InstructionOpcode::Invoke);
    }
}
