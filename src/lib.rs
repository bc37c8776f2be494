//! Native code generation via LLVM for a Crystal-family source language.
//!
//! The lexer, parser, and type checker are out of scope for this crate
//! (§10); it consumes an already-typed [`ast::NodeArena`] plus a
//! [`types::TypeOracle`] and lowers it to LLVM IR, JIT-executable via
//! [`evaluator::run`].
//!
//! # Architecture
//!
//! - **Context hierarchy** (`context.rs`): `SimpleCx` → `CodegenCx`
//! - **Builder** (`builder.rs`): instruction generation, separated from
//!   context and scoped to one function's dedicated alloca block
//! - **Declare** (`declare.rs`): two-phase codegen (predefine/define)
//! - **Module** (`module.rs`): whole-module compilation and verification
//!
//! # Debugging
//!
//! Enable tracing with `RUST_LOG=crystal_codegen=debug`.

#![allow(
    // LLVM uses u32 for struct/array indices, we use usize in Rust
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    // Codegen functions thread through context, arena, types, locals, etc.
    clippy::too_many_arguments,
    // Internal functions - panics are invariant violations
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::unnecessary_wraps,
)]

pub mod ast;
pub mod blocks;
pub mod builder;
pub mod calls;
pub mod constants;
pub mod context;
pub mod control_flow;
pub mod declare;
pub mod dispatch;
pub mod emit_context;
pub mod error;
pub mod evaluator;
pub mod exceptions;
pub mod expr;
pub mod function_compiler;
pub mod module;
pub mod runtime_decl;
pub mod types;
pub mod union_repr;

pub use ast::{DefId, Node, NodeArena, NodeId, NodeRange};
pub use builder::Builder;
pub use context::CodegenCx;
pub use error::CodegenError;
pub use evaluator::{init_tracing, run};
pub use module::ModuleCompiler;
pub use types::{TypeKind, TypeOracle, TypePool, TypeRef};
