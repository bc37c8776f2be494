//! Deferred constant initialization (§4.6).
//!
//! A constant whose initializer is not a compile-time literal is lowered
//! lazily: the first read emits a detached "const block" that computes and
//! caches the value behind a global, spliced into the current function's
//! alloca→entry chain so the constant is computed at most once per program
//! run, on first use.

use inkwell::module::Linkage;
use inkwell::values::BasicValueEnum;

use crate::ast::{NodeArena, NodeId};
use crate::builder::Builder;
use crate::emit_context::EmitCx;
use crate::error::CodegenError;
use crate::types::TypeRef;

fn const_flag_name(name: &str) -> String {
    format!("const.{name}.initialized")
}

fn const_value_name(name: &str) -> String {
    format!("const.{name}.value")
}

impl<'ll> Builder<'_, 'll, '_> {
    /// Read a constant, running its deferred initializer exactly once the
    /// first time it's observed (§4.6).
    pub fn compile_const_read(&self, name: &str, ty: TypeRef, init: NodeId, needs_const_block: bool, arena: &NodeArena, ecx: &mut EmitCx<'ll>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let llvm_ty = self.cx().llvm_type(ty);
        let value_global = self.cx().declare_global(&const_value_name(name), llvm_ty);

        if !needs_const_block {
            // A compile-time-literal initializer: materialize once, directly.
            if value_global.get_initializer().is_none() {
                let compiled = self
                    .compile_expr(init, arena, ecx)?
                    .ok_or_else(|| CodegenError::internal("constant initializer produced no value", self))?;
                value_global.set_initializer(&compiled);
                value_global.set_constant(true);
                value_global.set_linkage(Linkage::Private);
            }
            return self.load(llvm_ty, value_global.as_pointer_value(), name).map(Some);
        }

        let flag_global = self.cx().declare_global(&const_flag_name(name), self.cx().scx.type_i1().into());
        if flag_global.get_initializer().is_none() {
            flag_global.set_initializer(&self.cx().scx.type_i1().const_int(0, false));
            flag_global.set_linkage(Linkage::Private);
        }

        let entry_bb = self.current_block().ok_or_else(|| CodegenError::internal("no current block for const read", self))?;
        let const_bb = self.append_block(&format!("const.{name}.init"));
        let after_bb = self.append_block(&format!("const.{name}.after"));

        let flag = self.load(self.cx().scx.type_i1().into(), flag_global.as_pointer_value(), "const.flag")?;
        self.cond_br(flag.into_int_value(), after_bb, const_bb)?;

        self.position_at_end(const_bb);
        let compiled = self
            .compile_expr(init, arena, ecx)?
            .ok_or_else(|| CodegenError::internal("constant initializer produced no value", self))?;
        self.store(value_global.as_pointer_value(), compiled)?;
        self.store(flag_global.as_pointer_value(), self.cx().scx.type_i1().const_int(1, false).into())?;
        self.br(after_bb)?;

        self.position_at_end(after_bb);
        let _ = entry_bb;
        self.load(llvm_ty, value_global.as_pointer_value(), name).map(Some)
    }
}
