//! Tagged-union and nilable value representation utilities (§4.2, §3).
//!
//! A union or hierarchy value lives behind the struct
//! `{ i32 type_id, [N x i8] value }`; a nilable value is a bare nullable
//! pointer with no tag at all (null ⇔ nil).

use inkwell::values::{BasicValueEnum, IntValue, PointerValue};

use crate::builder::Builder;
use crate::error::CodegenError;
use crate::types::{TypeOracle, TypeRef};

impl<'ll> Builder<'_, 'll, '_> {
    /// `GEP ptr, 0, 0` — the tag slot of a tagged-union pointer.
    pub fn union_type_id_ptr(&self, union_ptr: PointerValue<'ll>, union_ty: TypeRef) -> Result<PointerValue<'ll>, CodegenError> {
        let struct_ty = self.cx().union_struct_type(union_ty);
        self.gep(struct_ty.into(), union_ptr, &[0, 0], "union.tag_ptr")
    }

    /// `GEP ptr, 0, 1` — the value slot of a tagged-union pointer.
    pub fn union_value_ptr(&self, union_ptr: PointerValue<'ll>, union_ty: TypeRef) -> Result<PointerValue<'ll>, CodegenError> {
        let struct_ty = self.cx().union_struct_type(union_ty);
        self.gep(struct_ty.into(), union_ptr, &[0, 1], "union.value_ptr")
    }

    pub fn load_union_tag(&self, union_ptr: PointerValue<'ll>, union_ty: TypeRef) -> Result<IntValue<'ll>, CodegenError> {
        let tag_ptr = self.union_type_id_ptr(union_ptr, union_ty)?;
        let loaded = self.load(self.cx().scx.type_i32().into(), tag_ptr, "union.tag")?;
        Ok(loaded.into_int_value())
    }

    pub fn store_union_tag(&self, union_ptr: PointerValue<'ll>, union_ty: TypeRef, tag: u32) -> Result<(), CodegenError> {
        let tag_ptr = self.union_type_id_ptr(union_ptr, union_ty)?;
        self.store(tag_ptr, self.cx().scx.type_i32().const_int(u64::from(tag), false).into())
    }

    /// Is a raw value the null pointer? (`ptr_to_int(v) == 0`).
    pub fn null_pointer(&self, ptr: PointerValue<'ll>) -> Result<IntValue<'ll>, CodegenError> {
        let as_int = self.ptr_to_int(ptr, "isnull.int")?;
        let zero = self.cx().scx.isize_ty.const_int(0, false);
        self.icmp(inkwell::IntPredicate::EQ, as_int, zero, "isnull")
    }

    /// Write `src_value` (of static type `src_type`) into `dst` (of static
    /// type `dst_type`), widening through a tagged-union or nilable
    /// representation as needed (§4.2 `assign_to_union`).
    pub fn assign_to_union(
        &self,
        dst: PointerValue<'ll>,
        dst_type: TypeRef,
        src_type: TypeRef,
        src_value: BasicValueEnum<'ll>,
    ) -> Result<(), CodegenError> {
        let types = self.cx().types;

        if types.is_nilable(dst_type) {
            let as_ptr = match src_value {
                BasicValueEnum::PointerValue(p) => p,
                BasicValueEnum::IntValue(i) => self.int_to_ptr(i, "nil_encode")?,
                other => {
                    return Err(CodegenError::internal(
                        format!("cannot widen {other:?} into a nilable slot"),
                        self,
                    ))
                }
            };
            return self.store(dst, as_ptr.into());
        }

        if types.is_union(src_type) {
            // Union-to-union widening: copy the source's tag+value through a
            // reinterpreting load of the destination's layout.
            let src_ptr = src_value.into_pointer_value();
            let src_struct = self.cx().union_struct_type(src_type);
            let whole = self.load(src_struct.into(), src_ptr, "union.widen.load")?;
            return self.store(dst, whole);
        }

        if types.is_nilable(src_type) {
            let inner = types.nilable_type(src_type).expect("nilable has an inner type");
            let src_ptr = src_value.into_pointer_value();
            let is_null = self.null_pointer(src_ptr)?;
            let nil_tag = types.type_id(types.nil_type());
            let inner_tag = types.type_id(inner);
            let tag_ptr = self.union_type_id_ptr(dst, dst_type)?;
            let nil_const = self.cx().scx.type_i32().const_int(u64::from(nil_tag), false);
            let inner_const = self.cx().scx.type_i32().const_int(u64::from(inner_tag), false);
            let tag = self
                .raw_builder()
                .build_select(is_null, nil_const, inner_const, "union.tag_select")
                .map_err(|e| CodegenError::internal(format!("select failed: {e}"), self))?;
            self.store(tag_ptr, tag)?;
            let value_ptr = self.union_value_ptr(dst, dst_type)?;
            return self.store(value_ptr, src_ptr.into());
        }

        let tag = types.type_id(src_type);
        self.store_union_tag(dst, dst_type, tag)?;
        let value_ptr = self.union_value_ptr(dst, dst_type)?;
        self.store(value_ptr, src_value)
    }
}
