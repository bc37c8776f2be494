//! Fixed runtime entry points and the symbol table global (§6).

use inkwell::module::Linkage;
use inkwell::types::BasicType;

use crate::context::CodegenCx;

pub const MALLOC_FN_NAME: &str = "__crystal_malloc";
pub const REALLOC_FN_NAME: &str = "__crystal_realloc";
pub const PERSONALITY_FN_NAME: &str = "__crystal_personality";
pub const UNWIND_RAISE_FN_NAME: &str = "_Unwind_RaiseException";
pub const MAIN_FN_NAME: &str = "__crystal_main";
pub const SYMBOL_TABLE_NAME: &str = "symbol_table";

impl<'ll> CodegenCx<'ll, '_> {
    /// Declare the fixed external runtime entry points a module may call
    /// into, regardless of whether the program actually uses each one —
    /// declaration is free and keeps call sites simple (§6).
    pub fn declare_runtime(&self) {
        let ptr = self.scx.type_ptr();
        let isize_ty = self.scx.isize_ty;

        let malloc_ty = ptr.fn_type(&[isize_ty.into()], false);
        self.module().add_function(MALLOC_FN_NAME, malloc_ty, Some(Linkage::External));

        let realloc_ty = ptr.fn_type(&[ptr.into(), isize_ty.into()], false);
        self.module().add_function(REALLOC_FN_NAME, realloc_ty, Some(Linkage::External));

        let personality_ty = self.scx.type_i32().fn_type(&[], true);
        self.module().add_function(PERSONALITY_FN_NAME, personality_ty, Some(Linkage::External));

        let raise_ty = self.scx.type_void().fn_type(&[ptr.into()], false);
        self.module().add_function(UNWIND_RAISE_FN_NAME, raise_ty, Some(Linkage::External));
    }

    /// Build the `symbol_table` global: a constant array of symbol-literal
    /// string globals, ordered by first-sight id (§6).
    pub fn build_symbol_table(&self) {
        let symbols = self.symbols_in_order();
        let entries: Vec<_> = symbols
            .iter()
            .map(|s| self.declare_global_string(s).as_pointer_value())
            .collect();
        let array_ty = self.scx.type_ptr().array_type(entries.len() as u32);
        let array_const = self.scx.type_ptr().const_array(&entries);
        self.define_global(SYMBOL_TABLE_NAME, array_ty.into(), &array_const);
    }
}
