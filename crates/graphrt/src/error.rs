//! Error types shared by the planner, the compile engine, and codegen.

use thiserror::Error;

pub type Result<T, E = CompileError> = std::result::Result<T, E>;

/// Fatal compilation failures. There is no recovery path; the enclosing
/// compile call aborts and partial planner/codegen state is discarded.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unsupported expression variant `{kind}` in {context}")]
    UnsupportedVariant {
        kind: &'static str,
        context: &'static str,
    },

    #[error("call target `{name}` is not a primitive fused function")]
    NonPrimitiveFunction { name: String },

    #[error("cannot size a tensor with symbolic dimension `{dim}`")]
    SymbolicShape { dim: String },

    #[error("cannot size a tensor with negative dimension {dim}")]
    NegativeShape { dim: i64 },

    #[error("no storage token recorded for `{kind}` expression")]
    MissingToken { kind: &'static str },

    #[error("storage tokens created twice for the same `{kind}` expression")]
    DuplicateToken { kind: &'static str },

    #[error(
        "{annotated} of {total} storage tokens carry device annotations; \
         either all or none of the expressions must be annotated"
    )]
    PartialDeviceAnnotation { annotated: usize, total: usize },

    #[error("no target configured for device `{device}` (device type {device_type})")]
    MissingTarget { device: String, device_type: i64 },

    #[error("tuple index {index} out of bounds for {len} fields")]
    TupleArityMismatch { index: usize, len: usize },

    #[error("tuple field must contribute exactly one storage token, got {tokens}")]
    TupleFieldArity { tokens: usize },

    #[error("multiple function parameters share the name `{name}`")]
    NameCollision { name: String },

    #[error("expression `{kind}` carries no checked type")]
    UntypedExpr { kind: &'static str },

    #[error("variable `{name}` is not bound")]
    UnboundVariable { name: String },

    #[error("external function is missing the `global_symbol` attribute")]
    MissingGlobalSymbol,

    #[error("external lowering failed: {0}")]
    Lowering(#[from] anyhow::Error),
}

/// Recovers a typed error that crossed an `anyhow` boundary (registry hooks),
/// falling back to the opaque lowering variant.
pub(crate) fn from_anyhow(err: anyhow::Error) -> CompileError {
    match err.downcast::<CompileError>() {
        Ok(err) => err,
        Err(err) => CompileError::Lowering(err),
    }
}
