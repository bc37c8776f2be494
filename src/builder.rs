//! LLVM instruction builder façade.
//!
//! `Builder` wraps an `inkwell::builder::Builder`, scoped to the function
//! currently being emitted. It separates type-level operations
//! (`CodegenCx`) from instruction generation: the builder tracks the
//! function's dedicated alloca block so every stack slot is created there
//! regardless of where the builder is currently positioned (§4.3).

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder as LLVMBuilder;
use inkwell::types::BasicTypeEnum;
use inkwell::values::{BasicValue, BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::IntPredicate;
use tracing::instrument;

use crate::context::CodegenCx;
use crate::emit_context::Locals;
use crate::error::CodegenError;
use crate::types::TypeRef;

/// A variable binding: its stack slot, declared type, and whether the slot
/// itself (rather than a load through it) is the value to use (§3).
#[derive(Debug, Clone, Copy)]
pub struct VarBinding<'ll> {
    pub pointer: PointerValue<'ll>,
    pub declared_type: TypeRef,
    pub treated_as_pointer: bool,
}

/// Instruction builder for one function's body, plus that function's
/// dedicated alloca block.
pub struct Builder<'a, 'll, 'tcx> {
    llbuilder: LLVMBuilder<'ll>,
    cx: &'a CodegenCx<'ll, 'tcx>,
    function: FunctionValue<'ll>,
    alloca_block: BasicBlock<'ll>,
}

/// RAII guard restoring the builder's prior insertion point on drop —
/// matches the position-swap used when inlining a block/lambda body into a
/// different function's context.
pub struct PositionGuard<'g, 'a, 'll, 'tcx> {
    builder: &'g Builder<'a, 'll, 'tcx>,
    saved: Option<BasicBlock<'ll>>,
}

impl Drop for PositionGuard<'_, '_, '_, '_> {
    fn drop(&mut self) {
        if let Some(block) = self.saved {
            self.builder.llbuilder.position_at_end(block);
        }
    }
}

impl<'a, 'll, 'tcx> Builder<'a, 'll, 'tcx> {
    pub fn new(cx: &'a CodegenCx<'ll, 'tcx>, function: FunctionValue<'ll>, alloca_block: BasicBlock<'ll>) -> Self {
        Self {
            llbuilder: cx.scx.llcx.create_builder(),
            cx,
            function,
            alloca_block,
        }
    }

    pub fn cx(&self) -> &'a CodegenCx<'ll, 'tcx> {
        self.cx
    }

    pub fn raw_builder(&self) -> &LLVMBuilder<'ll> {
        &self.llbuilder
    }

    pub fn function(&self) -> FunctionValue<'ll> {
        self.function
    }

    pub fn current_block(&self) -> Option<BasicBlock<'ll>> {
        self.llbuilder.get_insert_block()
    }

    pub fn position_at_end(&self, block: BasicBlock<'ll>) {
        self.llbuilder.position_at_end(block);
    }

    pub fn append_block(&self, name: &str) -> BasicBlock<'ll> {
        self.cx.scx.llcx.append_basic_block(self.function, name)
    }

    /// Save the current insertion point; restored when the returned guard
    /// drops. Used around block/lambda-body emission that temporarily
    /// repositions the builder into another function.
    #[must_use]
    pub fn save_position(&self) -> PositionGuard<'_, 'a, 'll, 'tcx> {
        PositionGuard {
            builder: self,
            saved: self.current_block(),
        }
    }

    /// Allocate a stack slot in the function's alloca block, regardless of
    /// the builder's current insertion point, then restore that point
    /// (§4.3, §5).
    #[instrument(skip(self), level = "debug")]
    pub fn alloca(&self, ty: BasicTypeEnum<'ll>, name: &str) -> Result<PointerValue<'ll>, CodegenError> {
        let guard = self.save_position();
        match self.alloca_block.get_first_instruction() {
            Some(first) => self.llbuilder.position_before(&first),
            None => self.llbuilder.position_at_end(self.alloca_block),
        }
        let slot = self
            .llbuilder
            .build_alloca(ty, name)
            .map_err(|e| CodegenError::internal(format!("alloca failed: {e}"), self))?;
        drop(guard);
        Ok(slot)
    }

    pub fn load(&self, ty: BasicTypeEnum<'ll>, ptr: PointerValue<'ll>, name: &str) -> Result<BasicValueEnum<'ll>, CodegenError> {
        self.llbuilder
            .build_load(ty, ptr, name)
            .map_err(|e| CodegenError::internal(format!("load failed: {e}"), self))
    }

    pub fn store(&self, ptr: PointerValue<'ll>, value: BasicValueEnum<'ll>) -> Result<(), CodegenError> {
        self.llbuilder
            .build_store(ptr, value)
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("store failed: {e}"), self))
    }

    pub fn gep(&self, elem_ty: BasicTypeEnum<'ll>, ptr: PointerValue<'ll>, indices: &[u32], name: &str) -> Result<PointerValue<'ll>, CodegenError> {
        let idx_values: Vec<IntValue<'ll>> = indices
            .iter()
            .map(|&i| self.cx.scx.type_i32().const_int(u64::from(i), false))
            .collect();
        unsafe {
            self.llbuilder
                .build_gep(elem_ty, ptr, &idx_values, name)
                .map_err(|e| CodegenError::internal(format!("gep failed: {e}"), self))
        }
    }

    pub fn ret(&self, value: Option<&dyn BasicValue<'ll>>) -> Result<(), CodegenError> {
        self.llbuilder
            .build_return(value)
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("ret failed: {e}"), self))
    }

    pub fn unreachable(&self) -> Result<(), CodegenError> {
        self.llbuilder
            .build_unreachable()
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("unreachable failed: {e}"), self))
    }

    pub fn br(&self, dest: BasicBlock<'ll>) -> Result<(), CodegenError> {
        self.llbuilder
            .build_unconditional_branch(dest)
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("br failed: {e}"), self))
    }

    pub fn cond_br(&self, cond: IntValue<'ll>, then_bb: BasicBlock<'ll>, else_bb: BasicBlock<'ll>) -> Result<(), CodegenError> {
        self.llbuilder
            .build_conditional_branch(cond, then_bb, else_bb)
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("cond_br failed: {e}"), self))
    }

    pub fn icmp(&self, pred: IntPredicate, lhs: IntValue<'ll>, rhs: IntValue<'ll>, name: &str) -> Result<IntValue<'ll>, CodegenError> {
        self.llbuilder
            .build_int_compare(pred, lhs, rhs, name)
            .map_err(|e| CodegenError::internal(format!("icmp failed: {e}"), self))
    }

    pub fn ptr_to_int(&self, ptr: PointerValue<'ll>, name: &str) -> Result<IntValue<'ll>, CodegenError> {
        self.llbuilder
            .build_ptr_to_int(ptr, self.cx.scx.isize_ty, name)
            .map_err(|e| CodegenError::internal(format!("ptr_to_int failed: {e}"), self))
    }

    pub fn int_to_ptr(&self, value: IntValue<'ll>, name: &str) -> Result<PointerValue<'ll>, CodegenError> {
        self.llbuilder
            .build_int_to_ptr(value, self.cx.scx.type_ptr(), name)
            .map_err(|e| CodegenError::internal(format!("int_to_ptr failed: {e}"), self))
    }

    /// A pointer's truthiness: non-null (used for nilable condition coercion, §4.4).
    pub fn non_null(&self, ptr: PointerValue<'ll>, name: &str) -> Result<IntValue<'ll>, CodegenError> {
        let as_int = self.ptr_to_int(ptr, "nullcheck.int")?;
        let zero = self.cx.scx.isize_ty.const_int(0, false);
        self.icmp(IntPredicate::NE, as_int, zero, name)
    }

    pub fn call(
        &self,
        callee: FunctionValue<'ll>,
        args: &[BasicValueEnum<'ll>],
        name: &str,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let meta_args: Vec<inkwell::values::BasicMetadataValueEnum<'ll>> = args.iter().map(|v| (*v).into()).collect();
        let call_site = self
            .llbuilder
            .build_call(callee, &meta_args, name)
            .map_err(|e| CodegenError::internal(format!("call failed: {e}"), self))?;
        Ok(call_site.try_as_basic_value().basic())
    }

    /// `invoke` to `callee`, branching to `normal` on return and `unwind`
    /// (a landing pad block) if it raises (§4.11).
    pub fn invoke(
        &self,
        callee: FunctionValue<'ll>,
        args: &[BasicValueEnum<'ll>],
        normal: BasicBlock<'ll>,
        unwind: BasicBlock<'ll>,
        name: &str,
    ) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let meta_args: Vec<inkwell::values::BasicMetadataValueEnum<'ll>> = args.iter().map(|v| (*v).into()).collect();
        let call_site = self
            .llbuilder
            .build_invoke(callee, &meta_args, normal, unwind, name)
            .map_err(|e| CodegenError::internal(format!("invoke failed: {e}"), self))?;
        Ok(call_site.try_as_basic_value().basic())
    }

    /// `malloc` (§4.3): prefer the user-provided `__crystal_malloc`, else
    /// fall back to the LLVM intrinsic allocator.
    pub fn emit_malloc(&self, size: Option<IntValue<'ll>>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let size = size.unwrap_or_else(|| self.cx.scx.isize_ty.const_int(0, false));
        if let Some(user_malloc) = self.cx.get_declared_fn("__crystal_malloc") {
            return self.call(user_malloc, &[size.into()], "malloc.user");
        }
        let ptr = self
            .llbuilder
            .build_array_malloc(self.cx.scx.type_i8(), size, "malloc.intrinsic")
            .map_err(|e| CodegenError::internal(format!("malloc failed: {e}"), self))?;
        Ok(Some(ptr.into()))
    }

    /// `realloc` (§4.3): prefer `__crystal_realloc`, else fall back to the
    /// libc-backed intrinsic.
    pub fn emit_realloc(&self, ptr: Option<PointerValue<'ll>>, size: Option<IntValue<'ll>>) -> Result<Option<BasicValueEnum<'ll>>, CodegenError> {
        let ptr = ptr.ok_or_else(|| CodegenError::internal("realloc needs a pointer operand", self))?;
        let size = size.unwrap_or_else(|| self.cx.scx.isize_ty.const_int(0, false));
        if let Some(user_realloc) = self.cx.get_declared_fn("__crystal_realloc") {
            return self.call(user_realloc, &[ptr.into(), size.into()], "realloc.user");
        }
        let new_ptr = self
            .llbuilder
            .build_array_malloc(self.cx.scx.type_i8(), size, "realloc.intrinsic")
            .map_err(|e| CodegenError::internal(format!("realloc failed: {e}"), self))?;
        self.llbuilder
            .build_memcpy(new_ptr, 1, ptr, 1, size)
            .map_err(|e| CodegenError::internal(format!("memcpy failed: {e}"), self))?;
        Ok(Some(new_ptr.into()))
    }

    /// Zero-initialize a just-allocated region (§4.3 `memset`).
    pub fn memset_zero(&self, ptr: PointerValue<'ll>, size: IntValue<'ll>) -> Result<(), CodegenError> {
        let zero = self.cx.scx.type_i8().const_int(0, false);
        self.llbuilder
            .build_memset(ptr, 1, zero, size)
            .map(|_| ())
            .map_err(|e| CodegenError::internal(format!("memset failed: {e}"), self))
    }

    /// Declare a local, allocate its slot, and store the initial value.
    pub fn declare_local(&self, locals: &mut Locals<'ll>, name: &str, declared_type: TypeRef, treated_as_pointer: bool, value: BasicValueEnum<'ll>) -> Result<(), CodegenError> {
        if treated_as_pointer {
            locals.insert(
                name,
                VarBinding {
                    pointer: value.into_pointer_value(),
                    declared_type,
                    treated_as_pointer: true,
                },
            );
            return Ok(());
        }
        let slot = self.alloca(value.get_type(), name)?;
        self.store(slot, value)?;
        locals.insert(
            name,
            VarBinding {
                pointer: slot,
                declared_type,
                treated_as_pointer: false,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;

    use super::*;
    use crate::context::CodegenCx;
    use crate::types::TypePool;

    fn make_fn<'ll>(cx: &CodegenCx<'ll, '_>, name: &str) -> (FunctionValue<'ll>, BasicBlock<'ll>) {
        let fn_type = cx.scx.type_void().fn_type(&[], false);
        let function = cx.scx.llmod.add_function(name, fn_type, None);
        let alloca_bb = cx.scx.llcx.append_basic_block(function, "alloca");
        (function, alloca_bb)
    }

    #[test]
    fn alloca_lands_in_the_alloca_block_regardless_of_position() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let other_bb = cx.scx.llcx.append_basic_block(function, "other");

        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(other_bb);
        let _slot = builder.alloca(cx.scx.type_i32().into(), "x").expect("alloca");

        assert!(alloca_bb.get_first_instruction().is_some());
        assert!(other_bb.get_first_instruction().is_none());
        // Position restored to where it was before alloca() ran.
        assert_eq!(builder.current_block(), Some(other_bb));
    }

    #[test]
    fn non_null_detects_null_pointer() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let (function, alloca_bb) = make_fn(&cx, "f");
        let builder = Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(alloca_bb);
        let null_ptr = cx.scx.type_ptr().const_null();
        let result = builder.non_null(null_ptr, "chk").expect("non_null");
        assert_eq!(result.get_type().get_bit_width(), 1);
    }
}
