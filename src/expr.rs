//! The expression emitter: the single dispatch point over the typed AST's
//! closed node set (§2 component 5, §4.4, §4.5).

use inkwell::values::BasicValueEnum;
use tracing::instrument;

use crate::ast::{IntrinsicBinOp, IntrinsicOp, Literal, Node, NodeArena, NodeId, VarKind};
use crate::builder::{Builder, VarBinding};
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

impl<'ll> Builder<'_, 'll, '_> {
    /// Emit one node, returning its value (`None` for void-typed nodes).
    #[instrument(skip(self, arena, ecx), level = "debug")]
    pub fn compile_expr(&self, id: NodeId, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        match arena.get(id).clone() {
            Node::Literal(lit) => self.compile_literal(&lit, arena.type_of(id)),
            Node::Var { kind, name } => self.compile_var_read(&kind, &name, arena.type_of(id), arena, ecx),
            Node::Assign { kind, name, value } => self.compile_assign(&kind, &name, value, arena, ecx),
            Node::CastedVar { inner, target } => self.compile_casted_var(inner, target, arena, ecx),
            Node::If { cond, then_branch, else_branch } => self.compile_if(cond, then_branch, else_branch, arena.type_of(id), arena, ecx),
            Node::While { cond, body, run_once } => self.compile_while(cond, body, run_once, arena, ecx),
            Node::Return(value) => self.compile_return(value, arena, ecx),
            Node::Break(value) => self.compile_break(value, arena, ecx),
            Node::Yield { args } => self.compile_yield(args, arena, ecx),
            Node::Call { def, receiver, args, block } => {
                self.compile_call(def, receiver, args, block.as_ref(), arena.type_of(id), arena, ecx)
            }
            Node::DispatchCall { targets, receiver, args } => {
                self.compile_dispatch(&targets, receiver, args, arena.type_of(id), arena, ecx)
            }
            Node::Def { .. } | Node::ConstDef { .. } => Err(CodegenError::internal(
                "Def/ConstDef nodes are compiled at module scope, not via compile_expr",
                self,
            )),
            Node::PointerPrimitive { op, args } => self.compile_pointer_primitive(op, args, arena, ecx),
            Node::IsA { value, target } => self.compile_is_a(value, target, arena, ecx),
            Node::Handler { body, rescues, ensure } => self.compile_handler(body, &rescues, ensure, arena.type_of(id), arena, ecx),
            Node::Raise(value) => self.compile_raise(value, arena, ecx),
            Node::SimpleOr { lhs, rhs } => self.compile_simple_or(lhs, rhs, arena.type_of(id), arena, ecx),
            Node::Sequence(range) => self.compile_sequence(range, arena, ecx),
            Node::Intrinsic(op) => self.compile_intrinsic(&op, arena, ecx),
            Node::Nop => Ok(None),
        }
    }

    fn compile_literal(&self, lit: &Literal, ty: Option<TypeRef>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let value = match lit {
            Literal::Nil => self.cx().scx.type_ptr().const_null().into(),
            Literal::Bool(b) => self.cx().scx.type_i1().const_int(u64::from(*b), false).into(),
            Literal::Number { bits, kind } => self.compile_number_literal(*bits, *kind),
            // Chars are lowered to i8 (§9 open question, resolved in DESIGN.md).
            Literal::Char(c) => self.cx().scx.type_i8().const_int(u64::from(*c as u8), false).into(),
            Literal::String(s) => {
                let global = self.cx().declare_global_string(s);
                global.as_pointer_value().into()
            }
            Literal::Symbol(s) => {
                let id = self.cx().symbol_id(s);
                self.cx().scx.type_i32().const_int(u64::from(id), false).into()
            }
        };
        let _ = ty;
        Ok(Some(value))
    }

    fn compile_number_literal(&self, bits: u64, kind: crate::ast::NumberKind) -> BasicValueEnum<'ll> {
        use crate::ast::NumberKind;
        match kind {
            NumberKind::I8 => self.cx().scx.type_i8().const_int(bits, false).into(),
            NumberKind::I16 => self.cx().scx.llcx.i16_type().const_int(bits, false).into(),
            NumberKind::I32 => self.cx().scx.type_i32().const_int(bits, false).into(),
            NumberKind::I64 => self.cx().scx.type_i64().const_int(bits, false).into(),
            NumberKind::F32 => self.cx().scx.type_f32().const_float(f64::from_bits(bits)).into(),
            NumberKind::F64 => self.cx().scx.type_f64().const_float(f64::from_bits(bits)).into(),
        }
    }

    /// Local read (§4.5): load the slot, narrowing through nilable/union
    /// representation when the requested type differs from the declared one.
    fn compile_var_read(&self, kind: &VarKind, name: &str, requested: Option<TypeRef>, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        if matches!(kind, VarKind::Constant) {
            let const_id = arena.const_node(name).ok_or_else(|| CodegenError::internal(format!("no ConstDef for `{name}`"), self))?;
            let (ty, init, needs_const_block) = match arena.get(const_id) {
                Node::ConstDef { ty, init, needs_const_block, .. } => (*ty, *init, *needs_const_block),
                _ => return Err(CodegenError::internal(format!("node for `{name}` is not a ConstDef"), self)),
            };
            return self.compile_const_read(name, ty, init, needs_const_block, arena, ecx);
        }
        let binding = ecx
            .vars
            .get(name)
            .ok_or_else(|| CodegenError::internal(format!("unbound variable `{name}`"), self))?;

        let types = self.cx().types;
        let requested = requested.unwrap_or(binding.declared_type);

        if binding.declared_type == requested {
            if binding.treated_as_pointer || types.is_union(requested) {
                return Ok(Some(binding.pointer.into()));
            }
            let loaded = self.load(self.cx().llvm_type(requested), binding.pointer, name)?;
            return Ok(Some(loaded));
        }

        if types.is_nilable(binding.declared_type) && types.is_nil_type(requested) {
            let loaded = self.load(self.cx().scx.type_ptr().into(), binding.pointer, name)?;
            return Ok(Some(self.non_null(loaded.into_pointer_value(), "nilcheck")?.into()));
        }

        if types.is_union(binding.declared_type) {
            let value_ptr = self.union_value_ptr(binding.pointer, binding.declared_type)?;
            let narrowed_ty = self.cx().llvm_type(requested);
            if types.passed_by_val(requested) {
                return Ok(Some(value_ptr.into()));
            }
            let loaded = self.load(narrowed_ty, value_ptr, name)?;
            return Ok(Some(loaded));
        }

        let loaded = self.load(self.cx().llvm_type(binding.declared_type), binding.pointer, name)?;
        Ok(Some(loaded))
    }

    /// Local/instance/class/global assignment (§4.5): always routed through
    /// `assign_to_union` so a union/nilable destination widens correctly.
    fn compile_assign(&self, kind: &VarKind, name: &str, value: NodeId, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let value_type = arena.type_of(value).ok_or_else(|| CodegenError::internal("assignment value has no type", self))?;
        let compiled = self
            .compile_expr(value, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("assignment value produced no IR value", self))?;

        match kind {
            VarKind::InstanceVar => {
                let self_binding = ecx.vars.get("self").ok_or_else(|| CodegenError::internal("instance-var assign outside a method", self))?;
                let owner = self_binding.declared_type;
                let idx = self
                    .cx()
                    .types
                    .index_of_instance_var(owner, name)
                    .ok_or_else(|| CodegenError::internal(format!("no instance var `{name}` on owner"), self))?;
                let struct_ty = self.cx().llvm_struct_type(owner);
                let field_ptr = self.gep(struct_ty.into(), self_binding.pointer, &[0, idx as u32], name)?;
                let field_ty = self.cx().types.lookup_instance_var(owner, name).expect("looked up above");
                self.assign_to_union(field_ptr, field_ty, value_type, compiled)?;
            }
            VarKind::ClassVar | VarKind::Global => {
                let global = self.cx().declare_global(name, self.cx().llvm_type(value_type));
                self.store(global.as_pointer_value(), compiled)?;
            }
            VarKind::Constant => {
                return Err(CodegenError::internal("constants are not reassignable", self));
            }
            VarKind::Local => {
                if let Some(existing) = ecx.vars.get(name) {
                    self.assign_to_union(existing.pointer, existing.declared_type, value_type, compiled)?;
                } else {
                    self.declare_local(&mut ecx.vars, name, value_type, false, compiled)?;
                }
            }
        }
        Ok(None)
    }

    fn compile_casted_var(&self, inner: NodeId, target: TypeRef, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let value = self.compile_expr(inner, arena, ecx)?;
        let inner_ty = arena.type_of(inner);
        match (value, inner_ty) {
            (Some(BasicValueEnum::PointerValue(p)), Some(src_ty)) if self.cx().types.is_union(src_ty) => {
                let value_ptr = self.union_value_ptr(p, src_ty)?;
                if self.cx().types.is_hierarchy(target) || self.cx().types.is_class(target) {
                    return Ok(Some(value_ptr.into()));
                }
                let narrowed = self.load(self.cx().llvm_type(target), value_ptr, "cast")?;
                Ok(Some(narrowed))
            }
            (other, _) => Ok(other),
        }
    }

    fn compile_sequence(&self, range: crate::ast::NodeRange, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let mut last = None;
        for &id in arena.range(range) {
            if self.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_some() {
                break;
            }
            last = self.compile_expr(id, arena, ecx)?;
        }
        Ok(last)
    }

    fn compile_intrinsic(&self, op: &IntrinsicBinOp, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let lhs = self
            .compile_expr(op.lhs, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("intrinsic lhs produced no value", self))?
            .into_int_value();
        let rhs = self
            .compile_expr(op.rhs, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("intrinsic rhs produced no value", self))?
            .into_int_value();
        let b = self.raw_builder();
        let result = match op.op {
            IntrinsicOp::IAdd => b.build_int_add(lhs, rhs, "iadd").map(BasicValueEnum::from),
            IntrinsicOp::ISub => b.build_int_sub(lhs, rhs, "isub").map(BasicValueEnum::from),
            IntrinsicOp::IMul => b.build_int_mul(lhs, rhs, "imul").map(BasicValueEnum::from),
            IntrinsicOp::ICmpEq => b
                .build_int_compare(inkwell::IntPredicate::EQ, lhs, rhs, "icmp_eq")
                .map(BasicValueEnum::from),
            IntrinsicOp::ICmpLt => b
                .build_int_compare(inkwell::IntPredicate::SLT, lhs, rhs, "icmp_lt")
                .map(BasicValueEnum::from),
        };
        result.map(Some).map_err(|e| CodegenError::internal(format!("intrinsic op failed: {e}"), self))
    }

    fn compile_simple_or(&self, lhs: NodeId, rhs: NodeId, result_ty: Option<TypeRef>, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let lhs_ty = arena.type_of(lhs).ok_or_else(|| CodegenError::internal("|| lhs has no type", self))?;
        let lhs_val = self
            .compile_expr(lhs, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("|| lhs produced no value", self))?;
        let truthy = self.codegen_cond(lhs_val, lhs_ty)?;

        let then_bb = self.append_block("or.lhs");
        let else_bb = self.append_block("or.rhs");
        let merge_bb = self.append_block("or.merge");
        self.cond_br(truthy, then_bb, else_bb)?;

        self.position_at_end(then_bb);
        let then_exit = self.current_block().expect("just positioned");
        self.br(merge_bb)?;

        self.position_at_end(else_bb);
        let rhs_val = self.compile_expr(rhs, arena, ecx)?;
        let else_exit = self.current_block().expect("just positioned");
        self.br(merge_bb)?;

        self.position_at_end(merge_bb);
        match (result_ty, rhs_val) {
            (Some(ty), Some(rv)) => {
                let phi = self
                    .raw_builder()
                    .build_phi(self.cx().llvm_type(ty), "or.phi")
                    .map_err(|e| CodegenError::internal(format!("phi failed: {e}"), self))?;
                phi.add_incoming(&[(&lhs_val, then_exit), (&rv, else_exit)]);
                Ok(Some(phi.as_basic_value()))
            }
            _ => Ok(None),
        }
    }
}
