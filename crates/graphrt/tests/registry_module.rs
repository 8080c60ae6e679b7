mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use graphrt::engine::{self, CompileEngine};
use graphrt::ir::{bind_params, Expr, FnAttrs};
use graphrt::registry::{self, Value};
use graphrt::{register_globals, CompileError, GraphCodegen};

use common::{fused_call, fused_fn, single_target, tensor, var, zeros, CountingLowerer};

#[test]
fn registry_round_trip() -> Result<()> {
    registry::register(
        "test.echo",
        Arc::new(|args: &[Value]| {
            let [Value::Str(text)] = args else {
                anyhow::bail!("expected a string");
            };
            Ok(Value::Str(text.clone()))
        }),
    )?;

    let err = registry::register("test.echo", Arc::new(|_args: &[Value]| Ok(Value::Null)));
    assert!(err.is_err(), "duplicate registration must fail");

    let echo = registry::get("test.echo").expect("registered");
    let Value::Str(reply) = echo(&[Value::Str("ping".to_string())])? else {
        panic!("expected a string reply");
    };
    assert_eq!(reply, "ping");

    assert!(registry::list_names().contains(&"test.echo".to_string()));
    assert!(registry::remove("test.echo"));
    assert!(!registry::remove("test.echo"));
    assert!(registry::get("test.echo").is_none());
    Ok(())
}

#[test]
fn module_commands_drive_codegen_end_to_end() -> Result<()> {
    register_globals();
    engine::set_global(CompileEngine::new(
        Arc::new(CountingLowerer::new()) as Arc<dyn graphrt::KernelLowerer>
    ));

    let x = var("x", &[2, 2]);
    let weight = Expr::constant(zeros(&[2, 2]));
    let kernel = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let call = fused_call(&kernel, vec![x.clone(), weight], tensor(&[2, 2]));
    let func = Expr::function(vec![x], call, FnAttrs::default());

    let factory = registry::get("_GraphRuntimeCodegen").expect("factory registered");
    let Value::Module(module) = factory(&[])? else {
        panic!("expected a codegen module");
    };

    let init = module.get_function("init").expect("init command");
    init(&[Value::Null, Value::Targets(single_target())])?;

    let codegen = module.get_function("codegen").expect("codegen command");
    codegen(&[Value::Function(func.clone())])?;

    let Value::Str(json) = module.get_function("get_graph_json").expect("command")(&[])? else {
        panic!("expected the graph json");
    };
    let doc: serde_json::Value = serde_json::from_str(&json)?;
    assert_eq!(doc["nodes"].as_array().expect("nodes").len(), 3);

    let Value::StrList(params) = module.get_function("list_params_name").expect("command")(&[])?
    else {
        panic!("expected parameter names");
    };
    assert_eq!(params, vec!["p0".to_string()]);

    let Value::Tensor(param) =
        module.get_function("get_param_by_name").expect("command")(&[Value::Str("p0".into())])?
    else {
        panic!("expected a tensor");
    };
    assert_eq!(param.byte_len(), 16);

    let Value::IrModules(modules) = module.get_function("get_irmodule").expect("command")(&[])?
    else {
        panic!("expected lowered modules");
    };
    assert!(modules.contains_key("llvm"));

    assert!(module.get_function("unknown_command").is_none());
    Ok(())
}

#[test]
fn planner_hook_is_registered_globally() -> Result<()> {
    register_globals();

    let x = var("x", &[1, 3, 4, 4]);
    let func = Expr::function(vec![x.clone()], x.clone(), FnAttrs::default());
    let hook = registry::get("GraphPlanMemory").expect("hook registered");
    let Value::StoragePlan(plan) = hook(&[Value::Function(func)])? else {
        panic!("expected a storage plan");
    };
    assert_eq!(plan.total_alloc_bytes, 192);
    Ok(())
}

#[test]
fn bound_params_become_embedded_constants() -> Result<()> {
    let x = var("x", &[2, 2]);
    let w = var("w", &[2, 2]);
    let kernel = fused_fn("fused_add", "add", &[&[2, 2], &[2, 2]], tensor(&[2, 2]));
    let call = fused_call(&kernel, vec![x.clone(), w.clone()], tensor(&[2, 2]));
    let func = Expr::function(vec![x, w], call, FnAttrs::default());

    let mut bindings = BTreeMap::new();
    bindings.insert("w".to_string(), zeros(&[2, 2]));
    let bound = bind_params(&func, &bindings)?;
    let function = bound.as_function().expect("function");
    assert_eq!(function.params.len(), 1);

    let lowerer = Arc::new(CountingLowerer::new());
    let engine = CompileEngine::new(lowerer as Arc<dyn graphrt::KernelLowerer>);
    let mut codegen = GraphCodegen::new(engine, single_target());
    let output = codegen.codegen(&bound)?;

    assert_eq!(output.params.keys().cloned().collect::<Vec<_>>(), vec!["p0"]);
    let doc: serde_json::Value = serde_json::from_str(&output.graph_json)?;
    let nodes = doc["nodes"].as_array().expect("nodes");
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0]["name"], "x");
    assert_eq!(nodes[1]["name"], "p0");
    Ok(())
}

#[test]
fn binding_repeated_parameter_names_is_rejected() {
    let first = var("w", &[2, 2]);
    let second = var("w", &[2, 2]);
    let pair = Expr::tuple(vec![first.clone(), second.clone()]).expect("typed tuple");
    let func = Expr::function(vec![first, second], pair, FnAttrs::default());

    let mut bindings = BTreeMap::new();
    bindings.insert("w".to_string(), zeros(&[2, 2]));
    let err = bind_params(&func, &bindings).expect_err("ambiguous binding");
    assert!(matches!(err, CompileError::NameCollision { .. }));
}
