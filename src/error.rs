//! Code generator error type.
//!
//! Follows the backend's existing hand-rolled `Display`/`Error` convention
//! rather than pulling in an error-derive crate. The two kinds mirror
//! §7: an internal assertion failure (unexpected type classification, a
//! missing cached binding — the core's own bug) versus a module that failed
//! LLVM verification. Both dump the partial module text as the diagnostic.

use std::fmt;

use crate::builder::Builder;

#[derive(Debug)]
pub enum CodegenError {
    /// An invariant the code generator itself is supposed to uphold was
    /// violated — a bug in this crate, not in the input program.
    Internal { message: String, dumped_ir: String },
    /// The emitted module failed `inkwell::module::Module::verify`.
    Verification { message: String, dumped_ir: String },
}

impl CodegenError {
    pub fn internal(message: impl Into<String>, builder: &Builder<'_, '_, '_>) -> Self {
        let dumped_ir = builder.cx().module().print_to_string().to_string();
        let message = message.into();
        tracing::error!(%message, "internal codegen assertion failed");
        CodegenError::Internal { message, dumped_ir }
    }

    /// Like [`Self::internal`], for call sites with no function-scoped
    /// `Builder` to dump IR from (e.g. JIT setup after compilation).
    pub fn internal_detached(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "internal codegen assertion failed");
        CodegenError::Internal { message, dumped_ir: String::new() }
    }

    pub fn verification(message: impl Into<String>, dumped_ir: impl Into<String>) -> Self {
        CodegenError::Verification {
            message: message.into(),
            dumped_ir: dumped_ir.into(),
        }
    }

    pub fn dumped_ir(&self) -> &str {
        match self {
            CodegenError::Internal { dumped_ir, .. } | CodegenError::Verification { dumped_ir, .. } => dumped_ir,
        }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Internal { message, .. } => write!(f, "internal codegen error: {message}"),
            CodegenError::Verification { message, .. } => write!(f, "module verification failed: {message}"),
        }
    }
}

impl std::error::Error for CodegenError {}
