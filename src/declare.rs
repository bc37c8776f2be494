//! Function and global declaration helpers.
//!
//! Two-phase codegen: **predefine** (declare every symbol by its mangled
//! name so forward references work) then **define** (fill in bodies).
//! Declaration is idempotent by name — the mangled-name cache in
//! `CodegenCx` (§3 "Lifecycles") means calling `declare_fn` twice for the
//! same mangled name returns the same `FunctionValue`.

use inkwell::module::Linkage;
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::{FunctionValue, GlobalValue};

use crate::context::CodegenCx;
use crate::types::TypeRef;

impl<'ll> CodegenCx<'ll, '_> {
    /// Declare (or look up the already-declared) function at `mangled_name`.
    pub fn declare_fn(&self, mangled_name: &str, param_types: &[TypeRef], return_type: Option<TypeRef>) -> FunctionValue<'ll> {
        if let Some(existing) = self.fn_cache().borrow().get(mangled_name) {
            return *existing;
        }
        if let Some(existing) = self.scx.llmod.get_function(mangled_name) {
            self.fn_cache().borrow_mut().insert(mangled_name.to_string(), existing);
            return existing;
        }

        let param_llvm_types: Vec<BasicMetadataTypeEnum<'ll>> = param_types.iter().map(|&t| self.llvm_metadata_type(t)).collect();

        let fn_type = match return_type {
            None => self.scx.type_void_func(&param_llvm_types),
            Some(t) => self.scx.type_func(&param_llvm_types, self.llvm_type(t)),
        };

        let function = self.scx.llmod.add_function(mangled_name, fn_type, None);
        self.fn_cache().borrow_mut().insert(mangled_name.to_string(), function);
        function
    }

    /// Declare an externally-linked function (a runtime entry point or
    /// `extern` def) — same idempotent-by-name cache, `External` linkage.
    pub fn declare_extern_fn(&self, mangled_name: &str, param_types: &[TypeRef], return_type: Option<TypeRef>) -> FunctionValue<'ll> {
        let function = self.declare_fn(mangled_name, param_types, return_type);
        function.set_linkage(Linkage::External);
        function
    }

    pub fn get_declared_fn(&self, mangled_name: &str) -> Option<FunctionValue<'ll>> {
        self.fn_cache().borrow().get(mangled_name).copied().or_else(|| self.scx.llmod.get_function(mangled_name))
    }

    /// Declare (or look up) a module-level global of the given LLVM type.
    pub fn declare_global(&self, name: &str, ty: inkwell::types::BasicTypeEnum<'ll>) -> GlobalValue<'ll> {
        if let Some(existing) = self.global_cache().borrow().get(name) {
            return *existing;
        }
        let global = self.scx.llmod.add_global(ty, None, name);
        self.global_cache().borrow_mut().insert(name.to_string(), global);
        global
    }

    pub fn define_global(&self, name: &str, ty: inkwell::types::BasicTypeEnum<'ll>, initializer: &dyn inkwell::values::BasicValue<'ll>) -> GlobalValue<'ll> {
        let global = self.declare_global(name, ty);
        global.set_initializer(initializer);
        global
    }

    /// Declare (or look up, de-duplicated by content) a private global
    /// holding a string literal laid out as `[i32 length][bytes...][\0]`
    /// (§6), and return a pointer to it.
    pub fn declare_global_string(&self, value: &str) -> GlobalValue<'ll> {
        if let Some(existing) = self.string_cache().borrow().get(value) {
            return *existing;
        }

        let ctx = self.scx.llcx;
        let len = value.len() as u32;
        let len_const = self.scx.type_i32().const_int(u64::from(len), false);
        let mut bytes: Vec<u8> = value.as_bytes().to_vec();
        bytes.push(0);
        let bytes_const = ctx.const_string(&bytes, false);

        let struct_const = ctx.const_struct(&[len_const.into(), bytes_const.into()], false);
        let global = self.scx.llmod.add_global(struct_const.get_type(), None, "str.lit");
        global.set_initializer(&struct_const);
        global.set_constant(true);
        global.set_linkage(Linkage::Private);

        self.string_cache().borrow_mut().insert(value.to_string(), global);
        global
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;

    use super::*;
    use crate::types::{TypeKind, TypePool};

    #[test]
    fn declare_fn_is_idempotent_by_name() {
        let context = Context::create();
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let cx = CodegenCx::new(&context, "test", &pool);
        let a = cx.declare_fn("foo", &[i32_ty], Some(i32_ty));
        let b = cx.declare_fn("foo", &[i32_ty], Some(i32_ty));
        assert_eq!(a, b);
    }

    #[test]
    fn declare_void_function() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let f = cx.declare_fn("proc", &[], None);
        assert_eq!(f.get_type().get_return_type(), None);
    }

    #[test]
    fn global_string_has_length_prefix_layout() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let g = cx.declare_global_string("hi");
        let ty = g.get_value_type();
        assert!(ty.is_struct_type());
        assert_eq!(ty.into_struct_type().count_fields(), 2);
    }

    #[test]
    fn global_string_is_deduplicated() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let a = cx.declare_global_string("same");
        let b = cx.declare_global_string("same");
        assert_eq!(a, b);
    }
}
