//! If/while, condition coercion, break/return, pointer primitives, and
//! `is_a?` (§4.4, §4.5 partial).

use inkwell::values::{BasicValueEnum, IntValue};
use inkwell::IntPredicate;

use crate::ast::{NodeId, NodeRange, PointerOp};
use crate::builder::Builder;
use crate::emit_context::{EmitCx, LoopContext};
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

impl<'ll> Builder<'_, 'll, '_> {
    /// Produce an `i1` truthiness value from `value` of static type `ty`
    /// (§4.4 `codegen_cond`).
    pub fn codegen_cond(&self, value: BasicValueEnum<'ll>, ty: TypeRef) -> Result<IntValue<'ll>, CodegenError> {
        let types = self.cx().types;

        if types.is_nil_type(ty) {
            return Ok(self.cx().scx.type_i1().const_int(0, false));
        }
        if self.is_bool_type(ty) {
            let as_int = value.into_int_value();
            let lsb = self
                .raw_builder()
                .build_int_truncate(as_int, self.cx().scx.type_i1(), "cond.lsb")
                .map_err(|e| CodegenError::internal(format!("truncate failed: {e}"), self))?;
            return Ok(lsb);
        }
        if types.is_nilable(ty) {
            return self.non_null(value.into_pointer_value(), "cond.nilable");
        }
        if types.is_hierarchy(ty) {
            return Ok(self.cx().scx.type_i1().const_int(1, false));
        }
        if matches!(value, BasicValueEnum::PointerValue(_)) && !types.is_union(ty) {
            return self.non_null(value.into_pointer_value(), "cond.ptr");
        }
        if types.is_union(ty) {
            let union_ptr = value.into_pointer_value();
            let tag = self.load_union_tag(union_ptr, ty)?;
            let nil_tag = self.cx().scx.type_i32().const_int(u64::from(types.type_id(types.nil_type())), false);
            let is_nil = self.icmp(IntPredicate::EQ, tag, nil_tag, "cond.is_nil")?;

            // Truthy iff not (nil OR (bool AND !value)).
            let bool_concrete = types
                .concrete_types(ty)
                .into_iter()
                .find(|&m| self.is_bool_type(m));
            let falsy = if let Some(bool_ty) = bool_concrete {
                let bool_tag = self.cx().scx.type_i32().const_int(u64::from(types.type_id(bool_ty)), false);
                let is_bool = self.icmp(IntPredicate::EQ, tag, bool_tag, "cond.is_bool")?;
                let value_ptr = self.union_value_ptr(union_ptr, ty)?;
                let loaded = self.load(self.cx().scx.type_i1().into(), value_ptr, "cond.bool_value")?;
                let value_false = self
                    .raw_builder()
                    .build_not(loaded.into_int_value(), "cond.not")
                    .map_err(|e| CodegenError::internal(format!("not failed: {e}"), self))?;
                let bool_and_false = self
                    .raw_builder()
                    .build_and(is_bool, value_false, "cond.bool_and_false")
                    .map_err(|e| CodegenError::internal(format!("and failed: {e}"), self))?;
                self.raw_builder()
                    .build_or(is_nil, bool_and_false, "cond.falsy")
                    .map_err(|e| CodegenError::internal(format!("or failed: {e}"), self))?
            } else {
                is_nil
            };
            return Ok(self
                .raw_builder()
                .build_not(falsy, "cond.truthy")
                .map_err(|e| CodegenError::internal(format!("not failed: {e}"), self))?);
        }

        Ok(self.cx().scx.type_i1().const_int(1, false))
    }

    fn is_bool_type(&self, ty: TypeRef) -> bool {
        matches!(self.cx().types.kind(ty), crate::types::TypeKind::Bool)
    }

    /// `if`/`else` (§4.4): pre-allocates a union slot when the result type is
    /// a union; otherwise merges via phi. Unreachable if both branches
    /// diverge.
    pub fn compile_if(
        &self,
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
        result_ty: Option<TypeRef>,
        arena: &crate::ast::NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let cond_ty = arena.type_of(cond).ok_or_else(|| CodegenError::internal("if condition has no type", self))?;
        let cond_val = self
            .compile_expr(cond, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("if condition produced no value", self))?;
        let cond_bool = self.codegen_cond(cond_val, cond_ty)?;

        let union_slot = match result_ty {
            Some(t) if self.cx().types.is_union(t) => Some(self.alloca(self.cx().union_struct_type(t).into(), "if.union_slot")?),
            _ => None,
        };

        let then_bb = self.append_block("if.then");
        let else_bb = self.append_block("if.else");
        let merge_bb = self.append_block("if.merge");
        self.cond_br(cond_bool, then_bb, else_bb)?;

        self.position_at_end(then_bb);
        let then_val = self.compile_expr(then_branch, arena, ecx)?;
        let then_ty = arena.type_of(then_branch);
        if let (Some(slot), Some(result_t)) = (union_slot, result_ty) {
            if let Some(v) = then_val {
                self.assign_to_union(slot, result_t, then_ty.unwrap_or(result_t), v)?;
            }
        }
        let then_diverges = self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_some();
        let then_exit = self.current_block();
        if !then_diverges {
            self.br(merge_bb)?;
        }

        self.position_at_end(else_bb);
        let else_val = match else_branch {
            Some(eb) => {
                let v = self.compile_expr(eb, arena, ecx)?;
                if let (Some(slot), Some(result_t)) = (union_slot, result_ty) {
                    if let Some(vv) = v {
                        let else_ty = arena.type_of(eb).unwrap_or(result_t);
                        self.assign_to_union(slot, result_t, else_ty, vv)?;
                    }
                }
                v
            }
            None => None,
        };
        let else_diverges = self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_some();
        let else_exit = self.current_block();
        if !else_diverges {
            self.br(merge_bb)?;
        }

        self.position_at_end(merge_bb);

        if then_diverges && else_diverges {
            self.unreachable()?;
            return Ok(None);
        }

        if let Some(slot) = union_slot {
            let result_t = result_ty.expect("union_slot implies result_ty");
            let loaded = self.load(self.cx().union_struct_type(result_t).into(), slot, "if.result")?;
            return Ok(Some(loaded));
        }

        match (result_ty, then_val, else_val, then_exit, else_exit) {
            (Some(ty), Some(tv), Some(ev), Some(te), Some(ee)) if !then_diverges && !else_diverges => {
                let phi = self
                    .raw_builder()
                    .build_phi(self.cx().llvm_type(ty), "if.phi")
                    .map_err(|e| CodegenError::internal(format!("phi failed: {e}"), self))?;
                phi.add_incoming(&[(&tv, te), (&ev, ee)]);
                Ok(Some(phi.as_basic_value()))
            }
            (_, tv, ev, _, _) => Ok(if then_diverges { ev } else { tv }),
        }
    }

    /// `while`/`do-while` (§4.4): fresh cond/body/exit blocks; `run_once`
    /// begins execution in the body (do-while). Break targets `exit`.
    pub fn compile_while(
        &self,
        cond: NodeId,
        body: NodeId,
        run_once: bool,
        arena: &crate::ast::NodeArena,
        ecx: &mut EmitCx<'ll>,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let cond_bb = self.append_block("while.cond");
        let body_bb = self.append_block("while.body");
        let exit_bb = self.append_block("while.exit");

        self.br(if run_once { body_bb } else { cond_bb })?;

        self.position_at_end(cond_bb);
        let cond_ty = arena.type_of(cond).ok_or_else(|| CodegenError::internal("while condition has no type", self))?;
        let cond_val = self
            .compile_expr(cond, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("while condition produced no value", self))?;
        let cond_bool = self.codegen_cond(cond_val, cond_ty)?;
        self.cond_br(cond_bool, body_bb, exit_bb)?;

        self.position_at_end(body_bb);
        ecx.loop_stack.push(LoopContext {
            header: cond_bb,
            exit: exit_bb,
            break_phi: None,
        });
        self.compile_expr(body, arena, ecx)?;
        ecx.loop_stack.pop();
        if self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
            self.br(cond_bb)?;
        }

        self.position_at_end(exit_bb);
        Ok(None)
    }

    /// `return` always exits the *function currently emitting*, never the
    /// innermost inlined block activation (§4.8): callee and block bodies
    /// share one physical LLVM function, so `ecx.fn_return_type` — fixed for
    /// the whole function — is the only correct target, even many block
    /// activations deep. Contrast `compile_break`, which does stop at the
    /// innermost activation's `call_return_block`.
    pub fn compile_return(&self, value: Option<NodeId>, arena: &crate::ast::NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let compiled = match value {
            Some(v) => self.compile_expr(v, arena, ecx)?,
            None => None,
        };

        let Some(return_type) = ecx.fn_return_type else {
            self.ret(None)?;
            return Ok(None);
        };
        let body_ty = value.and_then(|id| arena.type_of(id)).unwrap_or(return_type);
        let coerced = crate::function_compiler::coerce_return(self, compiled, body_ty, return_type)?;
        match coerced {
            Some(v) => self.ret(Some(&v))?,
            None => self.ret(None)?,
        }
        Ok(None)
    }

    pub fn compile_break(&self, value: Option<NodeId>, arena: &crate::ast::NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let compiled = match value {
            Some(v) => self.compile_expr(v, arena, ecx)?,
            None => None,
        };

        if ecx.in_block_body() {
            // break inside a block exits the enclosing yield's call (§4.8),
            // which is handled by blocks.rs via the top block activation.
            return self.break_from_block(compiled, value.and_then(|id| arena.type_of(id)), ecx);
        }

        let target = ecx
            .loop_stack
            .last()
            .ok_or_else(|| CodegenError::internal("break outside a loop or block", self))?;
        self.br(target.exit)?;
        Ok(None)
    }

    pub fn compile_pointer_primitive(&self, op: PointerOp, args: NodeRange, arena: &crate::ast::NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let ids = arena.range(args).to_vec();
        let mut vals = Vec::with_capacity(ids.len());
        for id in ids {
            vals.push(self.compile_expr(id, arena, ecx)?);
        }
        match op {
            PointerOp::Malloc => {
                let size = vals.first().copied().flatten().map(BasicValueEnum::into_int_value);
                self.emit_malloc(size)
            }
            PointerOp::Realloc => {
                let ptr = vals.first().copied().flatten().map(BasicValueEnum::into_pointer_value);
                let size = vals.get(1).copied().flatten().map(BasicValueEnum::into_int_value);
                self.emit_realloc(ptr, size)
            }
            PointerOp::Null => Ok(Some(self.cx().scx.type_ptr().const_null().into())),
            PointerOp::Load | PointerOp::Store | PointerOp::Add => Ok(vals.into_iter().next().flatten()),
        }
    }

    pub fn compile_is_a(&self, value: NodeId, target: TypeRef, arena: &crate::ast::NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let value_ty = arena.type_of(value).ok_or_else(|| CodegenError::internal("is_a? operand has no type", self))?;
        let compiled = self
            .compile_expr(value, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("is_a? operand produced no value", self))?;
        let types = self.cx().types;

        if types.is_union(value_ty) || types.is_hierarchy(value_ty) {
            let tag = self.load_union_tag(compiled.into_pointer_value(), value_ty)?;
            let matches: Vec<TypeRef> = types.concrete_types(target);
            let mut acc = self.cx().scx.type_i1().const_int(0, false);
            for m in matches {
                let tag_const = self.cx().scx.type_i32().const_int(u64::from(types.type_id(m)), false);
                let eq = self.icmp(IntPredicate::EQ, tag, tag_const, "isa.eq")?;
                acc = self
                    .raw_builder()
                    .build_or(acc, eq, "isa.or")
                    .map_err(|e| CodegenError::internal(format!("or failed: {e}"), self))?;
            }
            return Ok(Some(acc.into()));
        }
        if types.is_nilable(value_ty) {
            let is_non_null = self.non_null(compiled.into_pointer_value(), "isa.nonnull")?;
            return Ok(Some(if types.is_nil_type(target) {
                self.raw_builder()
                    .build_not(is_non_null, "isa.is_nil")
                    .map_err(|e| CodegenError::internal(format!("not failed: {e}"), self))?
                    .into()
            } else {
                is_non_null.into()
            }));
        }
        Ok(Some(self.cx().scx.type_i1().const_int(u64::from(value_ty == target), false).into()))
    }
}
