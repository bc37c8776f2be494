//! Module-level compilation (§4.12): two-phase predefine/define over every
//! top-level `Def`, synthesis of `__crystal_main`, then verification.

use std::cell::RefCell;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::BasicValue;

use crate::ast::{Node, NodeArena, NodeId};
use crate::builder::Builder;
use crate::context::CodegenCx;
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::runtime_decl::MAIN_FN_NAME;
use crate::types::{TypeKind, TypeOracle, TypePool, TypeRef};

const SCRATCH_FN_NAME: &str = "__crystal_module_scratch";

/// Drives whole-module compilation: declares the fixed runtime entry points,
/// predefines every top-level `Def` by its mangled name, defines each body,
/// synthesizes `__crystal_main` over the remaining top-level statements, and
/// verifies the result.
pub struct ModuleCompiler<'ll, 'tcx> {
    cx: CodegenCx<'ll, 'tcx>,
    /// `__crystal_main`'s actual return type, `None` for `void` — set once
    /// `build_main` runs, read back by the evaluator to pick a JIT call
    /// signature (§6).
    program_return_type: RefCell<Option<TypeRef>>,
}

impl<'ll, 'tcx> ModuleCompiler<'ll, 'tcx> {
    pub fn new(context: &'ll Context, module_name: &str, types: &'tcx TypePool) -> Self {
        let cx = CodegenCx::new(context, module_name, types);
        cx.declare_runtime();
        Self {
            cx,
            program_return_type: RefCell::new(None),
        }
    }

    pub fn cx(&self) -> &CodegenCx<'ll, 'tcx> {
        &self.cx
    }

    pub fn module(&self) -> &Module<'ll> {
        self.cx.module()
    }

    /// `__crystal_main`'s return type as computed by `compile_module`, `None`
    /// for `void`. Only meaningful after `compile_module` has run.
    pub fn program_return_type(&self) -> Option<TypeRef> {
        *self.program_return_type.borrow()
    }

    /// Compile every top-level `Def`/`ConstDef` plus the remaining top-level
    /// statements (folded into `__crystal_main`), in `top_level` order.
    pub fn compile_module(&self, top_level: &[NodeId], arena: &NodeArena) -> Result<(), CodegenError> {
        self.predefine(top_level, arena)?;
        self.define(top_level, arena)?;
        self.build_main(top_level, arena)?;
        self.cx.build_symbol_table();
        self.cleanup_scratch();
        self.verify()
    }

    /// Phase 1: declare every top-level def by its mangled name so forward
    /// references between defs resolve regardless of source order (§4.12).
    fn predefine(&self, top_level: &[NodeId], arena: &NodeArena) -> Result<(), CodegenError> {
        for &id in top_level {
            if let Node::Def { name, owner, params, return_type, .. } = arena.get(id) {
                let mangled = crate::function_compiler::mangled_name(name, *owner, params);
                let param_types = crate::function_compiler::def_param_types(*owner, params);
                let ret = if matches!(self.cx.types.kind(*return_type), crate::types::TypeKind::Void) {
                    None
                } else {
                    Some(*return_type)
                };
                self.cx.declare_fn(&mangled, &param_types, ret);
            }
        }
        Ok(())
    }

    /// Phase 2: emit each predefined def's body. A def whose body contains a
    /// bare `yield` is never called as a true function — every call site
    /// inlines it directly (§4.8) — so it's left as a bare declaration
    /// instead of being materialized standalone, where `yield` would have no
    /// active block activation to splice into.
    fn define(&self, top_level: &[NodeId], arena: &NodeArena) -> Result<(), CodegenError> {
        let scratch = self.scratch_builder();
        for &id in top_level {
            if let Node::Def { id: def_id, name, owner, params, body, .. } = arena.get(id) {
                if body.is_some_and(|b| Self::body_has_bare_yield(arena, b)) {
                    continue;
                }
                let mangled = crate::function_compiler::mangled_name(name, *owner, params);
                let function = self
                    .cx
                    .get_declared_fn(&mangled)
                    .ok_or_else(|| CodegenError::internal(format!("def `{mangled}` was not predefined"), &scratch))?;
                scratch.codegen_fun(*def_id, function, arena)?;
            }
        }
        Ok(())
    }

    /// Walk a def's own body looking for a `Yield` reachable without passing
    /// through another call's attached block (a block's body gets its own
    /// activation pushed when *that* call is compiled, so a `yield` nested in
    /// one is always safe standalone; a bare `yield` belonging to this def
    /// itself is not).
    fn body_has_bare_yield(arena: &NodeArena, id: NodeId) -> bool {
        let recurse = |id: NodeId| Self::body_has_bare_yield(arena, id);
        match arena.get(id) {
            Node::Yield { .. } => true,
            Node::Sequence(range) => arena.range(*range).iter().any(|&n| recurse(n)),
            Node::If { cond, then_branch, else_branch } => recurse(*cond) || recurse(*then_branch) || else_branch.is_some_and(|n| recurse(n)),
            Node::While { cond, body, .. } => recurse(*cond) || recurse(*body),
            Node::Handler { body, rescues, ensure } => recurse(*body) || rescues.iter().any(|r| recurse(r.body)) || ensure.is_some_and(|n| recurse(n)),
            Node::Assign { value, .. } => recurse(*value),
            Node::CastedVar { inner, .. } => recurse(*inner),
            Node::Raise(v) => recurse(*v),
            Node::SimpleOr { lhs, rhs } => recurse(*lhs) || recurse(*rhs),
            Node::Return(Some(v)) | Node::Break(Some(v)) => recurse(*v),
            Node::IsA { value, .. } => recurse(*value),
            Node::PointerPrimitive { args, .. } => arena.range(*args).iter().any(|&n| recurse(n)),
            Node::Intrinsic(op) => recurse(op.lhs) || recurse(op.rhs),
            Node::Call { receiver, args, .. } => receiver.is_some_and(|n| recurse(n)) || arena.range(*args).iter().any(|&n| recurse(n)),
            Node::DispatchCall { receiver, args, .. } => recurse(*receiver) || arena.range(*args).iter().any(|&n| recurse(n)),
            Node::Literal(_) | Node::Var { .. } | Node::Def { .. } | Node::ConstDef { .. } | Node::Return(None) | Node::Break(None) | Node::Nop => false,
        }
    }

    /// The program's return type (§6: `<program_type_or_void>`), inferred
    /// from the last executable top-level statement. A trailing explicit
    /// `Return(Some(v))` has no arena type of its own (it's recorded as a
    /// statement, §4.3) so it's special-cased to the type of its operand;
    /// any other trailing expression uses its own type directly.
    fn infer_program_type(&self, exec_ids: &[NodeId], arena: &NodeArena) -> Option<TypeRef> {
        let &last = exec_ids.last()?;
        match arena.get(last) {
            Node::Return(Some(v)) => arena.type_of(*v),
            _ => arena.type_of(last),
        }
    }

    /// Synthesize `__crystal_main`: alloca block, then every top-level
    /// statement that is neither a `Def` nor a `ConstDef`, in source order
    /// (§6, §4.12). Declared against the actual inferred program type (or
    /// `void`), mirroring `codegen_fun`'s fall-off-the-end coercion.
    fn build_main(&self, top_level: &[NodeId], arena: &NodeArena) -> Result<(), CodegenError> {
        let exec_ids: Vec<NodeId> = top_level
            .iter()
            .copied()
            .filter(|&id| !matches!(arena.get(id), Node::Def { .. } | Node::ConstDef { .. }))
            .collect();

        let program_ty = self.infer_program_type(&exec_ids, arena);
        let void_return = matches!(program_ty.map(|t| self.cx.types.kind(t)), None | Some(TypeKind::Void | TypeKind::NoReturn));

        let argc_argv: [inkwell::types::BasicMetadataTypeEnum; 2] = [self.cx.scx.type_i32().into(), self.cx.scx.type_ptr().into()];
        let fn_type = if void_return {
            self.cx.scx.type_void_func(&argc_argv)
        } else {
            self.cx.scx.type_func(&argc_argv, self.cx.llvm_type(program_ty.expect("checked above")))
        };
        let function = self.cx.scx.llmod.add_function(MAIN_FN_NAME, fn_type, None);
        let alloca_bb = self.cx.scx.llcx.append_basic_block(function, "alloca");
        let entry_bb = self.cx.scx.llcx.append_basic_block(function, "entry");
        let builder = Builder::new(&self.cx, function, alloca_bb);
        builder.position_at_end(entry_bb);

        let mut ecx = EmitCx::new(if void_return { None } else { program_ty });
        let mut last_value = None;
        let mut last_ty = None;
        for &id in &exec_ids {
            last_value = builder.compile_expr(id, arena, &mut ecx)?;
            last_ty = arena.type_of(id);
        }

        if builder.current_block().and_then(inkwell::basic_block::BasicBlock::get_terminator).is_none() {
            if void_return {
                builder.ret(None)?;
            } else {
                let return_type = program_ty.expect("checked above");
                let body_ty = last_ty.unwrap_or(return_type);
                let coerced = crate::function_compiler::coerce_return(&builder, last_value, body_ty, return_type)?;
                match coerced {
                    Some(v) => builder.ret(Some(&v as &dyn BasicValue))?,
                    None => builder.ret(None)?,
                }
            }
        }
        builder.position_at_end(alloca_bb);
        builder.br(entry_bb)?;
        *self.program_return_type.borrow_mut() = program_ty;
        Ok(())
    }

    /// A builder scoped to a throwaway function, used only during
    /// `predefine`/`define` where no real function-scoped builder exists yet
    /// but `CodegenError::internal` still needs one to dump the module.
    /// Deleted before the module is handed off for verification.
    fn scratch_builder(&self) -> Builder<'_, 'll, 'tcx> {
        let placeholder_ty = self.cx.scx.type_void().fn_type(&[], false);
        let placeholder = self
            .cx
            .get_declared_fn(SCRATCH_FN_NAME)
            .unwrap_or_else(|| self.cx.scx.llmod.add_function(SCRATCH_FN_NAME, placeholder_ty, None));
        let bb = placeholder.get_first_basic_block().unwrap_or_else(|| self.cx.scx.llcx.append_basic_block(placeholder, "scratch"));
        Builder::new(&self.cx, placeholder, bb)
    }

    fn cleanup_scratch(&self) {
        if let Some(scratch) = self.cx.get_declared_fn(SCRATCH_FN_NAME) {
            unsafe { scratch.delete() };
        }
    }

    fn verify(&self) -> Result<(), CodegenError> {
        match self.module().verify() {
            Ok(()) => Ok(()),
            Err(e) => Err(CodegenError::verification(e.to_string(), self.module().print_to_string().to_string())),
        }
    }
}
