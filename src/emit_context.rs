//! Per-function emission state (§3 "Emission Context invariants", §4.4, §5).
//!
//! All of the "current function / current vars / handler stack" state the
//! teacher lineage keeps as ad hoc fields is collected here into one
//! explicit, stack-discipline value threaded through emission rather than
//! left as process-wide globals.

use inkwell::basic_block::BasicBlock;
use inkwell::values::PhiValue;
use rustc_hash::FxHashMap;

use crate::ast::NodeId;
use crate::builder::VarBinding;
use crate::types::TypeRef;

/// The variable environment for the function currently emitting. Block
/// inlining pushes a fresh snapshot (§4.8) rather than mutating the
/// enclosing method's environment in place.
#[derive(Clone, Default)]
pub struct Locals<'ll> {
    vars: FxHashMap<String, VarBinding<'ll>>,
}

impl<'ll> Locals<'ll> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, binding: VarBinding<'ll>) {
        self.vars.insert(name.to_string(), binding);
    }

    pub fn get(&self, name: &str) -> Option<VarBinding<'ll>> {
        self.vars.get(name).copied()
    }

    /// A fresh environment sharing nothing with `self` except by value copy —
    /// used when a block's formal parameters shadow the caller's names.
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// Targets for `break`/`continue` inside the innermost loop (§4.4 While/For).
pub struct LoopContext<'ll> {
    pub header: BasicBlock<'ll>,
    pub exit: BasicBlock<'ll>,
    pub break_phi: Option<PhiValue<'ll>>,
}

/// Rendezvous target for a `break` from inside an inlined block body, and
/// the union slot used if the yielding call's result type is a union (§4.4,
/// §4.8). `return` does NOT use this — it always exits the enclosing
/// function directly (see `EmitCx::fn_return_type`), regardless of how many
/// block activations are currently inlined around it.
#[derive(Clone, Copy)]
pub struct ReturnTarget<'ll> {
    pub block: BasicBlock<'ll>,
    pub return_type: TypeRef,
    pub union_slot: Option<inkwell::values::PointerValue<'ll>>,
}

/// One entry on the block-activation stack (§4.8): the state `yield` needs
/// to inline the caller-supplied block body at this call site.
pub struct BlockActivation<'ll> {
    pub block_body: NodeId,
    pub block_params: Vec<String>,
    pub caller_vars: Locals<'ll>,
    pub block_type: TypeRef,
    /// Where the *yielding call* rendezvous — `break` inside the block jumps
    /// here.
    pub call_return_block: BasicBlock<'ll>,
    pub call_return_type: TypeRef,
    pub call_union_slot: Option<inkwell::values::PointerValue<'ll>>,
}

/// One entry on the exception-handler stack (§4.11): the landing pad a
/// raising call inside this handler's protected region should `invoke` to.
#[derive(Clone, Copy)]
pub struct HandlerFrame<'ll> {
    pub catch_block: BasicBlock<'ll>,
}

/// The full per-function emission context (§3). Exactly one alloca block per
/// function; `return_target` is `Some` iff currently emitting an inlined
/// block body (§4.4 invariant).
pub struct EmitCx<'ll> {
    pub vars: Locals<'ll>,
    pub loop_stack: Vec<LoopContext<'ll>>,
    pub block_stack: Vec<BlockActivation<'ll>>,
    pub handler_stack: Vec<HandlerFrame<'ll>>,
    pub return_target: Option<ReturnTarget<'ll>>,
    /// The enclosing function's declared return type, `None` for a `void`
    /// return. `return` always targets this — constant across however many
    /// block activations are currently inlined on top of it (§4.8), since
    /// callee and block bodies are inlined into the same physical function.
    pub fn_return_type: Option<TypeRef>,
}

impl<'ll> EmitCx<'ll> {
    pub fn new(fn_return_type: Option<TypeRef>) -> Self {
        Self {
            vars: Locals::new(),
            loop_stack: Vec::new(),
            block_stack: Vec::new(),
            handler_stack: Vec::new(),
            return_target: None,
            fn_return_type,
        }
    }

    pub fn current_loop(&self) -> Option<&LoopContext<'ll>> {
        self.loop_stack.last()
    }

    pub fn current_handler(&self) -> Option<HandlerFrame<'ll>> {
        self.handler_stack.last().copied()
    }

    pub fn in_block_body(&self) -> bool {
        self.return_target.is_some()
    }
}

impl Default for EmitCx<'_> {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;

    use super::*;
    use crate::context::CodegenCx;
    use crate::types::TypePool;

    #[test]
    fn locals_child_is_independent_snapshot() {
        let context = Context::create();
        let pool = TypePool::new();
        let cx = CodegenCx::new(&context, "test", &pool);
        let fn_type = cx.scx.type_void().fn_type(&[], false);
        let function = cx.scx.llmod.add_function("f", fn_type, None);
        let alloca_bb = cx.scx.llcx.append_basic_block(function, "alloca");
        let builder = crate::builder::Builder::new(&cx, function, alloca_bb);
        builder.position_at_end(alloca_bb);
        let slot = builder.alloca(cx.scx.type_i32().into(), "x").expect("alloca");

        let mut locals: Locals = Locals::new();
        locals.insert(
            "x",
            VarBinding {
                pointer: slot,
                declared_type: TypeRef(0),
                treated_as_pointer: false,
            },
        );
        let mut child = locals.child();
        child.insert(
            "x",
            VarBinding {
                pointer: slot,
                declared_type: TypeRef(1),
                treated_as_pointer: false,
            },
        );
        // Mutating the child's binding must not affect the parent's.
        assert_eq!(locals.get("x").unwrap().declared_type, TypeRef(0));
        assert_eq!(child.get("x").unwrap().declared_type, TypeRef(1));
    }
}
