//! Function materialization (§4.10 `codegen_fun`): turn a `Def` node into an
//! LLVM function with its dedicated alloca block, bind parameters (receiver
//! first), emit the body, and apply the return-coercion rules.

use inkwell::module::Linkage;
use inkwell::values::{BasicValue, FunctionValue};

use crate::ast::{DefId, Node, NodeArena, Param};
use crate::builder::Builder;
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::types::{TypeKind, TypeOracle};

/// Deterministic, collision-free name for a def: `owner#name` for methods,
/// bare `name` for free functions, with a `DefId`-keyed disambiguator so two
/// defs sharing a display name never collide (§4.10, §6 `__crystal_*` names
/// use this for everything except the handful of fixed entry points).
pub fn mangled_name(name: &str, owner: Option<crate::types::TypeRef>, params: &[Param]) -> String {
    let mut out = String::new();
    if let Some(o) = owner {
        out.push_str(&format!("T{}.", o.0));
    }
    out.push_str(name);
    if !params.is_empty() {
        out.push('#');
        out.push_str(&params.len().to_string());
    }
    out
}

impl<'ll> Builder<'_, 'll, '_> {
    /// Materialize `def`'s body into its already-declared `FunctionValue`
    /// (§4.10): entry/alloca blocks, parameter binding, body emission, and
    /// the fall-off-the-end return rule.
    pub fn codegen_fun(&self, def: DefId, function: FunctionValue<'ll>, arena: &NodeArena) -> Result<(), CodegenError> {
        let id = arena.def_node(def).ok_or_else(|| CodegenError::internal(format!("no Def node for {def:?}"), self))?;
        let (owner, params, return_type, body, is_external, no_return) = match arena.get(id) {
            Node::Def { owner, params, return_type, body, is_external, no_return, .. } => {
                (*owner, params.clone(), *return_type, *body, *is_external, *no_return)
            }
            _ => return Err(CodegenError::internal(format!("node for {def:?} is not a Def"), self)),
        };

        if is_external {
            function.set_linkage(Linkage::External);
            return Ok(());
        }
        let Some(body) = body else {
            return Err(CodegenError::internal("non-external def has no body", self));
        };
        if no_return {
            // `NoReturn` defs still get a body; the verifier enforces that
            // every path ends in `unreachable` or a propagated raise.
        }

        let alloca_bb = self.cx().scx.llcx.append_basic_block(function, "alloca");
        let entry_bb = self.cx().scx.llcx.append_basic_block(function, "entry");
        let fn_builder = Builder::new(self.cx(), function, alloca_bb);
        fn_builder.position_at_end(entry_bb);

        let void_return = matches!(self.cx().types.kind(return_type), TypeKind::Void | TypeKind::NoReturn);
        let mut ecx = EmitCx::new(if void_return { None } else { Some(return_type) });
        let mut param_index = 0usize;
        if owner.is_some() {
            let self_param = function
                .get_nth_param(0)
                .ok_or_else(|| CodegenError::internal("method missing self parameter", &fn_builder))?;
            let owner_ty = owner.expect("checked above");
            let treated_as_pointer = self.cx().types.passed_as_self(owner_ty);
            fn_builder.declare_local(&mut ecx.vars, "self", owner_ty, treated_as_pointer, self_param)?;
            param_index = 1;
        }
        for param in &params {
            let llvm_param = function
                .get_nth_param(param_index as u32)
                .ok_or_else(|| CodegenError::internal(format!("missing param {}", param.name), &fn_builder))?;
            let treated_as_pointer = self.cx().types.passed_by_val(param.ty);
            fn_builder.declare_local(&mut ecx.vars, &param.name, param.ty, treated_as_pointer, llvm_param)?;
            param_index += 1;
        }

        let result = fn_builder.compile_expr(body, arena, &mut ecx)?;

        if fn_builder.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
            if void_return {
                fn_builder.ret(None)?;
            } else {
                let body_ty = arena.type_of(body).unwrap_or(return_type);
                let coerced = coerce_return(&fn_builder, result, body_ty, return_type)?;
                match coerced {
                    Some(v) => fn_builder.ret(Some(&v as &dyn BasicValue<'ll>))?,
                    None => fn_builder.ret(None)?,
                }
            }
        }

        fn_builder.position_at_end(alloca_bb);
        fn_builder.br(entry_bb)?;
        Ok(())
    }
}

/// Widen the body's trailing value into the declared return type's
/// representation when they differ (union/nilable promotion, §4.2). Shared
/// by every real function exit: fall-off-the-end here, and explicit
/// `return` (including from inside an inlined block body) in control_flow.rs.
pub(crate) fn coerce_return<'ll>(
    builder: &Builder<'_, 'll, '_>,
    value: Option<inkwell::values::BasicValueEnum<'ll>>,
    body_ty: crate::types::TypeRef,
    return_type: crate::types::TypeRef,
) -> Result<Option<inkwell::values::BasicValueEnum<'ll>>, CodegenError> {
    let types = builder.cx().types;
    let Some(v) = value else { return Ok(None) };
    if body_ty == return_type || !types.is_union(return_type) {
        return Ok(Some(v));
    }
    let slot = builder.alloca(builder.cx().union_struct_type(return_type).into(), "ret.union_slot")?;
    builder.assign_to_union(slot, return_type, body_ty, v)?;
    let loaded = builder.load(builder.cx().union_struct_type(return_type).into(), slot, "ret.union")?;
    Ok(Some(loaded))
}

/// The declared parameter types for a def: receiver first (if any), then
/// formals — the shape `declare_fn` and `codegen_fun` must agree on (§4.10).
pub fn def_param_types(owner: Option<crate::types::TypeRef>, params: &[Param]) -> Vec<crate::types::TypeRef> {
    let mut out = Vec::with_capacity(params.len() + 1);
    out.extend(owner);
    out.extend(params.iter().map(|p| p.ty));
    out
}
