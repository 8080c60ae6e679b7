mod common;

use std::sync::Arc;

use anyhow::Result;

use graphrt::engine::{CacheKey, CompileEngine, Target};
use graphrt::ir::{Expr, FnAttrs};
use graphrt::profiling;
use graphrt::GraphCodegen;

use common::{fused_call, fused_fn, single_target, tensor, var, zeros, CountingLowerer};

#[test]
fn one_lowering_per_function_and_target() -> Result<()> {
    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);
    let relu = fused_fn("fused_relu", "nn.relu", &[&[2]], tensor(&[2]));

    let llvm_key = CacheKey::new(&relu, &Target::llvm())?;
    let hits_before = profiling::event_count("engine_cache_hit");
    let first = engine.lower(&llvm_key)?;
    let second = engine.lower(&llvm_key)?;
    assert_eq!(lowerer.calls(), 1);
    assert_eq!(first.func_name, second.func_name);
    assert!(profiling::event_count("engine_cache_hit") > hits_before);

    let cuda_key = CacheKey::new(&relu, &Target::new("cuda"))?;
    engine.lower(&cuda_key)?;
    assert_eq!(lowerer.calls(), 2);
    assert_eq!(engine.cached_count(), 2);
    Ok(())
}

#[test]
fn structurally_identical_functions_share_a_cache_entry() -> Result<()> {
    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);

    // Two distinct allocations of the same fused function.
    let first = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let second = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let key_a = CacheKey::new(&first, &Target::llvm())?;
    let key_b = CacheKey::new(&second, &Target::llvm())?;
    assert_eq!(key_a, key_b);

    engine.lower(&key_a)?;
    engine.lower(&key_b)?;
    assert_eq!(lowerer.calls(), 1);

    // A different shape is a different key.
    let other = fused_fn("fused_add", "add", &[&[4, 4], &[4, 4]], tensor(&[4, 4]));
    let key_c = CacheKey::new(&other, &Target::llvm())?;
    assert_ne!(key_a, key_c);
    engine.lower(&key_c)?;
    assert_eq!(lowerer.calls(), 2);
    Ok(())
}

#[test]
fn shared_call_targets_lower_once_during_codegen() -> Result<()> {
    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);

    let x = var("x", &[2]);
    let relu = fused_fn("fused_relu", "nn.relu", &[&[2]], tensor(&[2]));
    let first = fused_call(&relu, vec![x.clone()], tensor(&[2]));
    let second = fused_call(&relu, vec![first], tensor(&[2]));
    let third = fused_call(&relu, vec![second], tensor(&[2]));
    let func = Expr::function(vec![x], third, FnAttrs::default());

    let mut codegen = GraphCodegen::new(engine, single_target());
    codegen.codegen(&func)?;
    assert_eq!(lowerer.calls(), 1);
    Ok(())
}

#[test]
fn external_functions_bypass_targets_and_collect_constants() -> Result<()> {
    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);

    let inner = var("a0", &[2, 2]);
    let scale = Expr::constant(zeros(&[2, 2]));
    let body = Expr::call(
        Expr::op("ext.scale"),
        vec![inner.clone(), scale],
        tensor(&[2, 2]),
    );
    let external = Expr::function(
        vec![inner],
        body,
        FnAttrs {
            primitive: true,
            compiler: Some("mycodegen".to_string()),
            global_symbol: Some("ext_kernel".to_string()),
        },
    );

    let x = var("x", &[2, 2]);
    let call = fused_call(&external, vec![x.clone()], tensor(&[2, 2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let mut codegen = GraphCodegen::new(Arc::clone(&engine), single_target());
    let output = codegen.codegen(&func)?;

    assert_eq!(lowerer.calls(), 1);
    assert_eq!(output.external_mods.len(), 1);
    assert_eq!(output.external_mods[0].compiler, "mycodegen");
    assert_eq!(output.external_mods[0].symbol, "ext_kernel");
    // Constants embedded in the external function surface as params.
    assert!(output.params.contains_key("ext_kernel_const_0"));
    // Nothing lands in the per-target table for external kernels.
    assert!(output.lowered_funcs.is_empty());

    let doc: serde_json::Value = serde_json::from_str(&output.graph_json)?;
    assert_eq!(doc["nodes"][1]["name"], "ext_kernel");
    assert_eq!(doc["nodes"][1]["attrs"]["func_name"], "ext_kernel");
    Ok(())
}
