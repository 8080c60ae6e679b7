#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use graphrt::engine::{CachedFunc, IrModule, KernelLowerer, LoweredFunc, Target};
use graphrt::ir::{DType, Expr, FnAttrs, TensorData, TensorType, Type};
use graphrt::Targets;

pub fn tensor(dims: &[i64]) -> Type {
    Type::Tensor(TensorType::with_dims(dims, DType::f32()))
}

pub fn var(name: &str, dims: &[i64]) -> Expr {
    Expr::var(name, tensor(dims))
}

pub fn zeros(dims: &[i64]) -> TensorData {
    TensorData::zeroed(TensorType::with_dims(dims, DType::f32())).expect("static shape")
}

/// Fused single-op kernel `fn(a0, …) { op(a0, …) }`, marked primitive.
pub fn fused_fn(symbol: &str, op_name: &str, param_dims: &[&[i64]], out: Type) -> Expr {
    let params: Vec<Expr> = param_dims
        .iter()
        .enumerate()
        .map(|(index, dims)| var(&format!("a{index}"), dims))
        .collect();
    let body = Expr::call(Expr::op(op_name), params.clone(), out);
    Expr::function(
        params,
        body,
        FnAttrs {
            primitive: true,
            global_symbol: Some(symbol.to_string()),
            ..Default::default()
        },
    )
}

pub fn fused_call(kernel: &Expr, args: Vec<Expr>, out: Type) -> Expr {
    Expr::call(kernel.clone(), args, out)
}

pub fn single_target() -> Targets {
    let mut targets = Targets::new();
    targets.insert(1, Target::llvm());
    targets
}

/// Stub kernel compiler that counts invocations and names each kernel after
/// the fused function's `global_symbol`.
pub struct CountingLowerer {
    calls: AtomicUsize,
}

impl CountingLowerer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl KernelLowerer for CountingLowerer {
    fn lower(&self, func: &Expr, target: &Target) -> anyhow::Result<CachedFunc> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let func_name = func
            .as_function()
            .and_then(|function| function.attrs.global_symbol.clone())
            .unwrap_or_else(|| "fused_kernel".to_string());
        let mut module = IrModule::new();
        module.insert(LoweredFunc {
            symbol: func_name.clone(),
            artifact: Arc::from(func_name.as_bytes().to_vec()),
        });
        let mut funcs = BTreeMap::new();
        funcs.insert(target.as_str().to_string(), module);
        Ok(CachedFunc { func_name, funcs })
    }
}
