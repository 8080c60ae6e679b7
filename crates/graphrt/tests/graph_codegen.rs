mod common;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value as Json;

use graphrt::engine::CompileEngine;
use graphrt::ir::{Expr, FnAttrs};
use graphrt::{GraphCodegen, Targets};

use common::{fused_call, fused_fn, single_target, tensor, var, zeros, CountingLowerer};

fn codegen_with(targets: Targets, func: &Expr) -> Result<(graphrt::LoweredOutput, Arc<CountingLowerer>)> {
    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);
    let mut codegen = GraphCodegen::new(engine, targets);
    let output = codegen.codegen(func)?;
    Ok((output, lowerer))
}

#[test]
fn single_conv_call_emits_three_nodes() -> Result<()> {
    let x = var("x", &[1, 3, 4, 4]);
    let w = var("w", &[8, 3, 1, 1]);
    let conv = fused_fn(
        "fused_conv2d",
        "nn.conv2d",
        &[&[1, 3, 4, 4], &[8, 3, 1, 1]],
        tensor(&[1, 8, 4, 4]),
    );
    let call = fused_call(&conv, vec![x.clone(), w.clone()], tensor(&[1, 8, 4, 4]));
    let func = Expr::function(vec![x, w], call, FnAttrs::default());

    let (output, lowerer) = codegen_with(single_target(), &func)?;
    assert_eq!(lowerer.calls(), 1);

    let doc: Json = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes array");
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0]["op"], "null");
    assert_eq!(nodes[0]["name"], "x");
    assert_eq!(nodes[0]["inputs"], Json::Array(vec![]));
    assert_eq!(nodes[1]["name"], "w");
    assert_eq!(nodes[2]["op"], "tvm_op");
    assert_eq!(nodes[2]["name"], "fused_conv2d");
    assert_eq!(nodes[2]["attrs"]["func_name"], "fused_conv2d");
    assert_eq!(nodes[2]["attrs"]["flatten_data"], "0");
    assert_eq!(nodes[2]["attrs"]["num_inputs"], "2");
    assert_eq!(nodes[2]["attrs"]["num_outputs"], "1");
    assert_eq!(nodes[2]["inputs"], serde_json::json!([[0, 0, 0], [1, 0, 0]]));

    assert_eq!(doc["arg_nodes"], serde_json::json!([0, 1]));
    assert_eq!(doc["heads"], serde_json::json!([[2, 0, 0]]));
    assert_eq!(doc["attrs"]["storage_id"], serde_json::json!(["list_int", [0, 1, 2]]));
    assert_eq!(
        doc["attrs"]["shape"],
        serde_json::json!(["list_shape", [[1, 3, 4, 4], [8, 3, 1, 1], [1, 8, 4, 4]]])
    );
    assert_eq!(
        doc["attrs"]["dltype"],
        serde_json::json!(["list_str", ["float32", "float32", "float32"]])
    );
    assert_eq!(doc["node_row_ptr"], serde_json::json!([0, 1, 2, 3]));
    assert!(doc["attrs"].get("device_index").is_none());

    assert!(output.lowered_funcs.contains_key("llvm"));
    assert!(output.params.is_empty());
    Ok(())
}

#[test]
fn tuple_results_flatten_without_new_nodes() -> Result<()> {
    let x = var("x", &[2]);
    let pair = Expr::tuple(vec![x.clone(), x.clone()])?;
    let func = Expr::function(vec![x], pair, FnAttrs::default());

    let (output, lowerer) = codegen_with(single_target(), &func)?;
    assert_eq!(lowerer.calls(), 0);

    let doc: Json = serde_json::from_str(&output.graph_json)?;
    assert_eq!(doc["nodes"].as_array().expect("nodes").len(), 1);
    assert_eq!(doc["heads"], serde_json::json!([[0, 0, 0], [0, 0, 0]]));
    assert_eq!(doc["node_row_ptr"], serde_json::json!([0, 1]));
    Ok(())
}

#[test]
fn embedded_constants_become_numbered_params() -> Result<()> {
    let x = var("x", &[2, 2]);
    let weight = Expr::constant(zeros(&[2, 2]));
    let kernel = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let call = fused_call(&kernel, vec![x.clone(), weight], tensor(&[2, 2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let (output, _) = codegen_with(single_target(), &func)?;
    assert_eq!(output.params.keys().cloned().collect::<Vec<_>>(), vec!["p0"]);

    let doc: Json = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes");
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[1]["op"], "null");
    assert_eq!(nodes[1]["name"], "p0");
    assert_eq!(doc["arg_nodes"], serde_json::json!([0, 1]));
    Ok(())
}

#[test]
fn repeated_kernel_names_are_deduplicated() -> Result<()> {
    let x = var("x", &[2]);
    let relu = fused_fn("fused_relu", "nn.relu", &[&[2]], tensor(&[2]));
    let first = fused_call(&relu, vec![x.clone()], tensor(&[2]));
    let second = fused_call(&relu, vec![first], tensor(&[2]));
    let func = Expr::function(vec![x], second, FnAttrs::default());

    let (output, lowerer) = codegen_with(single_target(), &func)?;
    // Both call sites share one cache entry; only the display name differs.
    assert_eq!(lowerer.calls(), 1);

    let doc: Json = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes");
    assert_eq!(nodes[1]["name"], "fused_relu");
    assert_eq!(nodes[2]["name"], "fused_relu1");
    assert_eq!(nodes[1]["attrs"]["func_name"], "fused_relu");
    assert_eq!(nodes[2]["attrs"]["func_name"], "fused_relu");
    Ok(())
}

#[test]
fn op_node_inputs_reference_earlier_nodes_only() -> Result<()> {
    let x = var("x", &[2, 2]);
    let w = var("w", &[2, 2]);
    let mul = fused_fn("fused_mul", "multiply", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let add = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let product = fused_call(&mul, vec![x.clone(), w.clone()], tensor(&[2, 2]));
    let total = fused_call(&add, vec![product, w.clone()], tensor(&[2, 2]));
    let func = Expr::function(vec![x, w], total, FnAttrs::default());

    let (output, _) = codegen_with(single_target(), &func)?;
    let doc: Json = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes");
    for (index, node) in nodes.iter().enumerate() {
        let Some(inputs) = node["inputs"].as_array() else {
            continue;
        };
        for input in inputs {
            let source = input[0].as_u64().expect("node index") as usize;
            assert!(source < index, "inputs must be topologically earlier");
        }
    }
    let heads = doc["heads"].as_array().expect("heads");
    for head in heads {
        let source = head[0].as_u64().expect("node index") as usize;
        assert!(source < nodes.len());
    }
    Ok(())
}

#[test]
fn multi_output_calls_flatten_through_tuple_projection() -> Result<()> {
    let x = var("x", &[4]);
    let split_out = graphrt::Type::Tuple(vec![tensor(&[2]), tensor(&[2])]);
    let split = fused_fn("fused_split", "split", &[&[4]], split_out.clone());
    let call = fused_call(&split, vec![x.clone()], split_out);
    let second_half = Expr::tuple_get_item(call, 1)?;
    let func = Expr::function(vec![x], second_half, FnAttrs::default());

    let (output, _) = codegen_with(single_target(), &func)?;
    let doc: Json = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes");
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1]["attrs"]["num_outputs"], "2");
    assert_eq!(doc["heads"], serde_json::json!([[1, 1, 0]]));
    assert_eq!(doc["node_row_ptr"], serde_json::json!([0, 1, 3]));
    assert_eq!(
        doc["attrs"]["shape"],
        serde_json::json!(["list_shape", [[4], [2], [2]]])
    );
    let storage = doc["attrs"]["storage_id"][1].as_array().expect("ids");
    assert_eq!(storage.len(), 3);
    Ok(())
}

#[test]
fn codegen_is_deterministic_across_runs() -> Result<()> {
    let x = var("x", &[2, 2]);
    let weight = Expr::constant(zeros(&[2, 2]));
    let kernel = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let call = fused_call(&kernel, vec![x.clone(), weight], tensor(&[2, 2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(Arc::clone(&lowerer) as Arc<dyn graphrt::KernelLowerer>);
    let mut codegen = GraphCodegen::new(engine, single_target());
    let first = codegen.codegen(&func)?;
    let second = codegen.codegen(&func)?;
    assert_eq!(first.graph_json, second.graph_json);
    assert_eq!(
        first.params.keys().collect::<Vec<_>>(),
        second.params.keys().collect::<Vec<_>>()
    );
    // The engine cache absorbs the second run's lowering request.
    assert_eq!(lowerer.calls(), 1);
    Ok(())
}

#[test]
fn calls_to_raw_operators_are_rejected() {
    let x = var("x", &[2]);
    let call = Expr::call(Expr::op("nn.relu"), vec![x.clone()], tensor(&[2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(lowerer as Arc<dyn graphrt::KernelLowerer>);
    let mut codegen = GraphCodegen::new(engine, single_target());
    let err = codegen.codegen(&func).expect_err("raw op calls are rejected");
    assert!(matches!(
        err,
        graphrt::CompileError::UnsupportedVariant { kind: "Op", .. }
    ));
}

#[test]
fn non_primitive_fused_calls_are_rejected() {
    let x = var("x", &[2]);
    let inner_param = var("a0", &[2]);
    let body = Expr::call(Expr::op("nn.relu"), vec![inner_param.clone()], tensor(&[2]));
    let kernel = Expr::function(vec![inner_param], body, FnAttrs::default());
    let call = Expr::call(kernel, vec![x.clone()], tensor(&[2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(lowerer as Arc<dyn graphrt::KernelLowerer>);
    let mut codegen = GraphCodegen::new(engine, single_target());
    let err = codegen.codegen(&func).expect_err("non-primitive call");
    assert!(matches!(
        err,
        graphrt::CompileError::NonPrimitiveFunction { .. }
    ));
}
