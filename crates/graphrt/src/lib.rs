//! Storage planning and graph-runtime code generation for fused tensor
//! programs.
//!
//! Given an already-fused, type-checked functional IR, this crate assigns a
//! storage id to every tensor-valued expression so that tensors with
//! disjoint live ranges share backing memory, then translates the function
//! into the flat JSON graph description a graph runtime executes, lowering
//! each fused call through an external compile engine exactly once per
//! `(function, target)` pair.

pub mod codegen;
pub mod engine;
pub mod error;
mod hashing;
pub mod ir;
pub mod plan;
pub mod profiling;
pub mod registry;

pub use codegen::module::{register_globals, GraphCodegenModule};
pub use codegen::{GraphCodegen, LoweredOutput, Targets};
pub use engine::{CacheKey, CachedFunc, CompileEngine, IrModule, KernelLowerer, RuntimeModule, Target};
pub use error::CompileError;
pub use ir::{bind_params, DType, Dim, Expr, ExprKind, FnAttrs, TensorData, TensorType, Type};
pub use plan::{plan_memory, plan_memory_with, PlanOptions, StoragePlan};
