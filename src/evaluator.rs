//! JIT entry point: compile a module to LLVM IR and execute `__crystal_main`
//! natively (§4.12, §6).

use std::sync::Once;

use inkwell::context::Context;
use inkwell::execution_engine::JitFunction;
use inkwell::OptimizationLevel;

use crate::ast::{NodeArena, NodeId};
use crate::error::CodegenError;
use crate::module::ModuleCompiler;
use crate::runtime_decl::MAIN_FN_NAME;
use crate::types::{TypeKind, TypeOracle, TypePool};

static TRACING_INIT: Once = Once::new();

/// Install the `tracing` subscriber once per process, controlled by
/// `RUST_LOG` (defaulting to `info`), per §4.13.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    });
}

// `__crystal_main` always takes `(i32 argc, i8** argv)` (§6); its return
// varies with the program's inferred top-level type, so `run` picks one of
// these typed aliases at runtime instead of a single fixed signature.
type MainFnVoid = unsafe extern "C" fn(i32, *mut *mut i8);
type MainFnBool = unsafe extern "C" fn(i32, *mut *mut i8) -> bool;
type MainFnI8 = unsafe extern "C" fn(i32, *mut *mut i8) -> i8;
type MainFnI16 = unsafe extern "C" fn(i32, *mut *mut i8) -> i16;
type MainFnI32 = unsafe extern "C" fn(i32, *mut *mut i8) -> i32;
type MainFnI64 = unsafe extern "C" fn(i32, *mut *mut i8) -> i64;

fn resolve_main<'ctx, F: inkwell::execution_engine::UnsafeFunctionPointer>(
    engine: &inkwell::execution_engine::ExecutionEngine<'ctx>,
) -> Result<JitFunction<'ctx, F>, CodegenError> {
    // SAFETY: `__crystal_main` was just compiled and module-verified against
    // the return type `F` was chosen to match (§6).
    unsafe { engine.get_function(MAIN_FN_NAME) }.map_err(|e| CodegenError::internal_detached(format!("failed to resolve {MAIN_FN_NAME}: {e}")))
}

/// Compile `top_level` into a fresh module and JIT-execute `__crystal_main`,
/// returning a process-style exit code derived from whatever it returns.
pub fn run(module_name: &str, top_level: &[NodeId], arena: &NodeArena, types: &TypePool) -> Result<i32, CodegenError> {
    init_tracing();
    let context = Context::create();
    let compiler = ModuleCompiler::new(&context, module_name, types);
    compiler.compile_module(top_level, arena)?;

    let engine = compiler
        .module()
        .create_jit_execution_engine(OptimizationLevel::Less)
        .map_err(|e| CodegenError::verification(format!("failed to create JIT engine: {e}"), compiler.module().print_to_string().to_string()))?;

    let program_kind = compiler.program_return_type().map(|t| types.kind(t));
    match program_kind {
        None | Some(TypeKind::Void | TypeKind::NoReturn) => {
            let main_fn: JitFunction<MainFnVoid> = resolve_main(&engine)?;
            unsafe { main_fn.call(0, std::ptr::null_mut()) };
            Ok(0)
        }
        Some(TypeKind::Bool) => {
            let main_fn: JitFunction<MainFnBool> = resolve_main(&engine)?;
            Ok(i32::from(unsafe { main_fn.call(0, std::ptr::null_mut()) }))
        }
        Some(TypeKind::Int8 | TypeKind::Char) => {
            let main_fn: JitFunction<MainFnI8> = resolve_main(&engine)?;
            Ok(i32::from(unsafe { main_fn.call(0, std::ptr::null_mut()) }))
        }
        Some(TypeKind::Int16) => {
            let main_fn: JitFunction<MainFnI16> = resolve_main(&engine)?;
            Ok(i32::from(unsafe { main_fn.call(0, std::ptr::null_mut()) }))
        }
        Some(TypeKind::Int32) => {
            let main_fn: JitFunction<MainFnI32> = resolve_main(&engine)?;
            Ok(unsafe { main_fn.call(0, std::ptr::null_mut()) })
        }
        Some(TypeKind::Int64) => {
            let main_fn: JitFunction<MainFnI64> = resolve_main(&engine)?;
            let value = unsafe { main_fn.call(0, std::ptr::null_mut()) };
            Ok(i32::try_from(value).unwrap_or(i32::MAX))
        }
        Some(other) => Err(CodegenError::internal_detached(format!(
            "program's top-level type {other:?} has no JIT exit-code mapping"
        ))),
    }
}
