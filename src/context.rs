//! LLVM codegen context.
//!
//! `SimpleCx` is a thin wrapper around LLVM's `Context` + `Module` and the
//! handful of scalar types used everywhere. `CodegenCx` sits on top of it
//! and owns the type-lowering cache and the runtime/global-symbol caches
//! that make function and constant materialization idempotent by name.

use std::cell::RefCell;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicType, BasicTypeEnum, PointerType, StructType};
use inkwell::values::{FunctionValue, GlobalValue};
use inkwell::AddressSpace;
use rustc_hash::FxHashMap;

use crate::types::{TypeKind, TypeOracle, TypePool, TypeRef};

/// Minimal LLVM context with the module and commonly-used types.
pub struct SimpleCx<'ll> {
    pub llcx: &'ll Context,
    pub llmod: Module<'ll>,
    pub ptr_type: PointerType<'ll>,
    pub isize_ty: inkwell::types::IntType<'ll>,
}

impl<'ll> SimpleCx<'ll> {
    #[must_use]
    pub fn new(context: &'ll Context, module_name: &str) -> Self {
        let llmod = context.create_module(module_name);
        let ptr_type = context.ptr_type(AddressSpace::default());
        let isize_ty = context.i64_type();

        Self {
            llcx: context,
            llmod,
            ptr_type,
            isize_ty,
        }
    }

    pub fn into_module(self) -> Module<'ll> {
        self.llmod
    }

    #[inline]
    pub fn type_i1(&self) -> inkwell::types::IntType<'ll> {
        self.llcx.bool_type()
    }
    #[inline]
    pub fn type_i8(&self) -> inkwell::types::IntType<'ll> {
        self.llcx.i8_type()
    }
    #[inline]
    pub fn type_i32(&self) -> inkwell::types::IntType<'ll> {
        self.llcx.i32_type()
    }
    #[inline]
    pub fn type_i64(&self) -> inkwell::types::IntType<'ll> {
        self.llcx.i64_type()
    }
    #[inline]
    pub fn type_f32(&self) -> inkwell::types::FloatType<'ll> {
        self.llcx.f32_type()
    }
    #[inline]
    pub fn type_f64(&self) -> inkwell::types::FloatType<'ll> {
        self.llcx.f64_type()
    }
    #[inline]
    pub fn type_void(&self) -> inkwell::types::VoidType<'ll> {
        self.llcx.void_type()
    }
    #[inline]
    pub fn type_ptr(&self) -> PointerType<'ll> {
        self.ptr_type
    }

    pub fn type_struct(&self, fields: &[BasicTypeEnum<'ll>], packed: bool) -> StructType<'ll> {
        self.llcx.struct_type(fields, packed)
    }

    pub fn type_named_struct(&self, name: &str) -> StructType<'ll> {
        self.llcx.opaque_struct_type(name)
    }

    pub fn set_struct_body(&self, ty: StructType<'ll>, fields: &[BasicTypeEnum<'ll>], packed: bool) {
        ty.set_body(fields, packed);
    }

    pub fn type_func(
        &self,
        args: &[inkwell::types::BasicMetadataTypeEnum<'ll>],
        ret: inkwell::types::BasicTypeEnum<'ll>,
    ) -> inkwell::types::FunctionType<'ll> {
        ret.fn_type(args, false)
    }

    pub fn type_void_func(
        &self,
        args: &[inkwell::types::BasicMetadataTypeEnum<'ll>],
    ) -> inkwell::types::FunctionType<'ll> {
        self.type_void().fn_type(args, false)
    }
}

/// The union/hierarchy struct layout: `{ i32 type_id, [N x i8] value }`.
pub const UNION_VALUE_BYTES: u32 = 16;

/// Per-type cache of already-lowered LLVM types, so a union/class struct is
/// built (and named) exactly once.
#[derive(Default)]
pub struct TypeCache<'ll> {
    scalar: RefCell<FxHashMap<TypeRef, BasicTypeEnum<'ll>>>,
    named_structs: RefCell<FxHashMap<TypeRef, StructType<'ll>>>,
}

/// The code generator's top-level context: LLVM plumbing plus the type
/// oracle and caches needed to lower the typed AST.
pub struct CodegenCx<'ll, 'tcx> {
    pub scx: SimpleCx<'ll>,
    pub types: &'tcx TypePool,
    type_cache: TypeCache<'ll>,
    fn_cache: RefCell<FxHashMap<String, FunctionValue<'ll>>>,
    global_cache: RefCell<FxHashMap<String, GlobalValue<'ll>>>,
    string_cache: RefCell<FxHashMap<String, GlobalValue<'ll>>>,
    symbol_ids: RefCell<FxHashMap<String, u32>>,
}

impl<'ll, 'tcx> CodegenCx<'ll, 'tcx> {
    pub fn new(context: &'ll Context, module_name: &str, types: &'tcx TypePool) -> Self {
        Self {
            scx: SimpleCx::new(context, module_name),
            types,
            type_cache: TypeCache::default(),
            fn_cache: RefCell::new(FxHashMap::default()),
            global_cache: RefCell::new(FxHashMap::default()),
            string_cache: RefCell::new(FxHashMap::default()),
            symbol_ids: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn module(&self) -> &Module<'ll> {
        &self.scx.llmod
    }

    /// Value-form lowering of a language type (§4.1 `llvm_type`).
    ///
    /// Unions and hierarchies lower to the tagged-union struct
    /// `{i32 type_id, [N x i8] value}`; nilables lower to the pointer type
    /// of their carrier.
    pub fn llvm_type(&self, t: TypeRef) -> BasicTypeEnum<'ll> {
        if let Some(cached) = self.type_cache.scalar.borrow().get(&t) {
            return *cached;
        }
        let lowered = self.lower_type(t);
        self.type_cache.scalar.borrow_mut().insert(t, lowered);
        lowered
    }

    fn lower_type(&self, t: TypeRef) -> BasicTypeEnum<'ll> {
        match self.types.kind(t) {
            TypeKind::Bool => self.scx.type_i1().into(),
            TypeKind::Int8 | TypeKind::Char => self.scx.type_i8().into(),
            TypeKind::Int16 => self.scx.llcx.i16_type().into(),
            TypeKind::Int32 => self.scx.type_i32().into(),
            TypeKind::Int64 => self.scx.type_i64().into(),
            TypeKind::Float32 => self.scx.type_f32().into(),
            TypeKind::Float64 => self.scx.type_f64().into(),
            TypeKind::Nil => self.scx.type_ptr().into(),
            TypeKind::Pointer(_) | TypeKind::Class { .. } => self.scx.type_ptr().into(),
            TypeKind::NilableOf(_) => self.scx.type_ptr().into(),
            TypeKind::Union { .. } | TypeKind::Hierarchy { .. } => self.union_struct_type(t).into(),
            TypeKind::CStruct { .. } | TypeKind::CUnion { .. } => self.llvm_struct_type(t).into(),
            TypeKind::Void | TypeKind::NoReturn => self.scx.type_i1().into(),
        }
    }

    /// The tagged-union struct type for a union or hierarchy type: one
    /// `type_id` tag plus a byte array sized to the largest member.
    pub fn union_struct_type(&self, t: TypeRef) -> StructType<'ll> {
        if let Some(cached) = self.type_cache.named_structs.borrow().get(&t) {
            return *cached;
        }
        let fields = [
            self.scx.type_i32().into(),
            self.scx.type_i8().array_type(UNION_VALUE_BYTES).into(),
        ];
        let ty = self.scx.type_struct(&fields, false);
        self.type_cache.named_structs.borrow_mut().insert(t, ty);
        ty
    }

    /// The struct contents for a C-struct/union object (§4.1 `llvm_struct_type`).
    pub fn llvm_struct_type(&self, t: TypeRef) -> StructType<'ll> {
        if let Some(cached) = self.type_cache.named_structs.borrow().get(&t) {
            return *cached;
        }
        let field_types: Vec<BasicTypeEnum<'ll>> = match self.types.kind(t) {
            TypeKind::CStruct { fields, .. } => fields.iter().map(|(_, fty)| self.llvm_type(*fty)).collect(),
            TypeKind::CUnion { fields, .. } => {
                let widest = fields
                    .iter()
                    .map(|(_, fty)| self.llvm_type(*fty))
                    .max_by_key(BasicTypeEnum::size_of_bits)
                    .unwrap_or_else(|| self.scx.type_i8().into());
                vec![widest]
            }
            TypeKind::Class { instance_vars, .. } => {
                instance_vars.iter().map(|(_, fty)| self.llvm_type(*fty)).collect()
            }
            _ => Vec::new(),
        };
        let ty = self.scx.type_struct(&field_types, false);
        self.type_cache.named_structs.borrow_mut().insert(t, ty);
        ty
    }

    /// ABI form of a type for a function parameter (§4.1 `llvm_arg_type`):
    /// pointer for by-value-struct arguments, value form otherwise.
    pub fn llvm_arg_type(&self, t: TypeRef) -> BasicTypeEnum<'ll> {
        if self.types.passed_by_val(t) {
            self.scx.type_ptr().into()
        } else {
            self.llvm_type(t)
        }
    }

    pub fn llvm_metadata_type(&self, t: TypeRef) -> inkwell::types::BasicMetadataTypeEnum<'ll> {
        self.llvm_arg_type(t).into()
    }

    pub(crate) fn fn_cache(&self) -> &RefCell<FxHashMap<String, FunctionValue<'ll>>> {
        &self.fn_cache
    }

    pub(crate) fn global_cache(&self) -> &RefCell<FxHashMap<String, GlobalValue<'ll>>> {
        &self.global_cache
    }

    pub(crate) fn string_cache(&self) -> &RefCell<FxHashMap<String, GlobalValue<'ll>>> {
        &self.string_cache
    }

    /// Assign (or look up) the stable 0-based id for a symbol literal,
    /// ordered by first-sight — the symbol table (§6) is built from this map
    /// once generation completes.
    pub fn symbol_id(&self, symbol: &str) -> u32 {
        let mut ids = self.symbol_ids.borrow_mut();
        let next = ids.len() as u32;
        *ids.entry(symbol.to_string()).or_insert(next)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_ids.borrow().len()
    }

    /// Symbols in assigned-id order, for building the `symbol_table` global.
    pub fn symbols_in_order(&self) -> Vec<String> {
        let ids = self.symbol_ids.borrow();
        let mut pairs: Vec<(&String, &u32)> = ids.iter().collect();
        pairs.sort_by_key(|(_, id)| **id);
        pairs.into_iter().map(|(s, _)| s.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    #[test]
    fn scalar_types_have_expected_width() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        assert_eq!(cx.scx.type_i64().get_bit_width(), 64);
        assert_eq!(cx.scx.type_i32().get_bit_width(), 32);
        assert_eq!(cx.scx.type_i1().get_bit_width(), 1);
    }

    #[test]
    fn union_lowers_to_tagged_struct() {
        let context = Context::create();
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let bool_ty = pool.intern(TypeKind::Bool);
        let union_ty = pool.union_of(vec![i32_ty, bool_ty]);
        let cx = CodegenCx::new(&context, "test", &pool);
        let lowered = cx.llvm_type(union_ty);
        assert!(lowered.is_struct_type());
        assert_eq!(lowered.into_struct_type().count_fields(), 2);
    }

    #[test]
    fn symbol_ids_are_first_sight_ordered() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        assert_eq!(cx.symbol_id("foo"), 0);
        assert_eq!(cx.symbol_id("bar"), 1);
        assert_eq!(cx.symbol_id("foo"), 0);
        assert_eq!(cx.symbols_in_order(), vec!["foo".to_string(), "bar".to_string()]);
    }
}
