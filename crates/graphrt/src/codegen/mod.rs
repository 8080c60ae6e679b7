//! Memoized translation from fused functions to runtime graph nodes.
//!
//! Codegen consumes the storage plan, lowers every fused call through the
//! compile engine, and assembles the JSON document the graph runtime loads.
//! Nodes appear in the order their expressions are first visited, which is
//! also the order the planner assigned storage ids in.

pub mod module;
mod node;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use smallvec::{smallvec, SmallVec};

use crate::engine::{device_name, CacheKey, CompileEngine, IrModule, RuntimeModule, Target};
use crate::error::{self, CompileError, Result};
use crate::ir::visit::{ExprVisitor, MemoTranslate};
use crate::ir::{Expr, ExprAddr, ExprKind, TensorData, Type};
use crate::plan::{self, StoragePlan};
use crate::registry::{self, Value};

pub use node::{GraphNode, InputNode, NodeAttrs, NodeRef, OpNode};

/// Configured targets, keyed by device type.
pub type Targets = BTreeMap<i64, Target>;

type NodeRefs = SmallVec<[NodeRef; 2]>;

/// Everything codegen produces for one function.
#[derive(Debug, Clone)]
pub struct LoweredOutput {
    pub graph_json: String,
    pub lowered_funcs: BTreeMap<String, IrModule>,
    pub external_mods: Vec<RuntimeModule>,
    pub params: BTreeMap<String, TensorData>,
}

pub struct GraphCodegen {
    engine: Arc<CompileEngine>,
    targets: Targets,
    plan_options: Option<plan::PlanOptions>,
    storage_plan: StoragePlan,
    nodes: Vec<GraphNode>,
    heads: Vec<NodeRef>,
    memo: HashMap<ExprAddr, NodeRefs>,
    var_map: HashMap<ExprAddr, NodeRefs>,
    params: BTreeMap<String, TensorData>,
    lowered_funcs: BTreeMap<String, IrModule>,
    name_map: HashMap<String, usize>,
}

impl GraphCodegen {
    pub fn new(engine: Arc<CompileEngine>, targets: Targets) -> Self {
        Self {
            engine,
            targets,
            plan_options: None,
            storage_plan: StoragePlan::default(),
            nodes: Vec::new(),
            heads: Vec::new(),
            memo: HashMap::new(),
            var_map: HashMap::new(),
            params: BTreeMap::new(),
            lowered_funcs: BTreeMap::new(),
            name_map: HashMap::new(),
        }
    }

    /// Overrides the options used when planning storage (device annotations,
    /// similarity window). Without this, the plan comes from the
    /// `GraphPlanMemory` registry hook when one is installed, or the built-in
    /// planner with defaults.
    pub fn set_plan_options(&mut self, options: plan::PlanOptions) {
        self.plan_options = Some(options);
    }

    /// Plans storage for `func` and translates it into a graph. Any state
    /// from a previous run is discarded, so repeated invocations are
    /// independent and deterministic.
    pub fn codegen(&mut self, func: &Expr) -> Result<LoweredOutput> {
        let function = func.as_function().ok_or(CompileError::UnsupportedVariant {
            kind: func.kind_name(),
            context: "graph codegen",
        })?;

        self.storage_plan = self.resolve_storage_plan(func)?;
        self.nodes.clear();
        self.heads.clear();
        self.memo.clear();
        self.var_map.clear();
        self.params.clear();
        self.lowered_funcs.clear();
        self.name_map.clear();

        for param in &function.params {
            let name = param.var_name().ok_or(CompileError::UnsupportedVariant {
                kind: param.kind_name(),
                context: "function parameter",
            })?;
            let refs = self.add_node(
                GraphNode::Input(InputNode {
                    name: name.to_string(),
                    attrs: NodeAttrs::default(),
                }),
                param,
            )?;
            self.var_map.insert(param.addr(), refs);
        }

        let heads = self.visit(&function.body)?;
        self.heads = heads.into_vec();

        Ok(LoweredOutput {
            graph_json: self.graph_json()?,
            lowered_funcs: self.lowered_funcs.clone(),
            external_mods: self.engine.lower_external_functions(),
            params: self.params.clone(),
        })
    }

    fn translate_call(&mut self, expr: &Expr, op: &Expr, args: &[Expr]) -> Result<NodeRefs> {
        let function = match op.kind() {
            ExprKind::Function(function) => function,
            ExprKind::Op { .. } => {
                return Err(CompileError::UnsupportedVariant {
                    kind: "Op",
                    context: "call target (operators must be fused away first)",
                })
            }
            ExprKind::GlobalVar { .. } => {
                return Err(CompileError::UnsupportedVariant {
                    kind: "GlobalVar",
                    context: "call target",
                })
            }
            _ => {
                return Err(CompileError::UnsupportedVariant {
                    kind: op.kind_name(),
                    context: "call target",
                })
            }
        };
        if !function.attrs.primitive {
            let name = function
                .attrs
                .global_symbol
                .clone()
                .unwrap_or_else(|| "anonymous".to_string());
            return Err(CompileError::NonPrimitiveFunction { name });
        }

        if function.attrs.compiler.is_some() {
            let target = Target::ext_dev();
            let key = CacheKey::new(op, &target)?;
            let lowered = self.engine.lower(&key)?;
            let symbol = function
                .attrs
                .global_symbol
                .clone()
                .ok_or(CompileError::MissingGlobalSymbol)?;
            self.collect_external_params(op, &symbol)?;
            // External kernels keep their symbol verbatim; no deduplication.
            let func_name = lowered.func_name.clone();
            return self.add_call_node(expr, args, func_name.clone(), func_name);
        }

        let storage = self
            .storage_plan
            .get(expr)
            .ok_or(CompileError::MissingToken {
                kind: expr.kind_name(),
            })?;
        let call_dev_type = storage
            .device_types
            .first()
            .copied()
            .ok_or(CompileError::MissingToken {
                kind: expr.kind_name(),
            })?;
        let target = if self.targets.len() == 1 {
            self.targets.values().next().cloned()
        } else {
            self.targets.get(&call_dev_type).cloned()
        };
        let target = target.ok_or_else(|| CompileError::MissingTarget {
            device: device_name(call_dev_type).to_string(),
            device_type: call_dev_type,
        })?;

        let key = CacheKey::new(op, &target)?;
        let lowered = self.engine.lower(&key)?;
        let entry = self
            .lowered_funcs
            .entry(target.as_str().to_string())
            .or_default();
        for module in lowered.funcs.values() {
            entry.update(module);
        }

        let name = self.unique_name(&lowered.func_name);
        self.add_call_node(expr, args, name, lowered.func_name.clone())
    }

    fn add_call_node(
        &mut self,
        expr: &Expr,
        args: &[Expr],
        name: String,
        func_name: String,
    ) -> Result<NodeRefs> {
        let mut inputs = Vec::new();
        for arg in args {
            inputs.extend(self.visit(arg)?);
        }
        self.add_node(
            GraphNode::Op(OpNode {
                name,
                op_name: func_name,
                inputs,
                attrs: NodeAttrs::default(),
            }),
            expr,
        )
    }

    /// Stamps storage and type attributes on `node`, appends it, and returns
    /// one reference per tensor output.
    fn add_node(&mut self, mut node: GraphNode, expr: &Expr) -> Result<NodeRefs> {
        let storage = self
            .storage_plan
            .get(expr)
            .ok_or(CompileError::MissingToken {
                kind: expr.kind_name(),
            })?;
        let attrs = node.attrs_mut();
        attrs.storage_ids = storage.storage_ids.clone();

        let total = storage.device_types.len();
        let unknown = storage
            .device_types
            .iter()
            .filter(|device| **device == 0)
            .count();
        if unknown != 0 && unknown != total {
            return Err(CompileError::PartialDeviceAnnotation {
                annotated: total - unknown,
                total,
            });
        }
        if unknown == 0 {
            attrs.device_index = Some(storage.device_types.clone());
        }

        let node_id = self.nodes.len();
        match expr.checked_type()? {
            Type::Tuple(fields) => {
                if !matches!(node, GraphNode::Op(_)) {
                    return Err(CompileError::UnsupportedVariant {
                        kind: "TupleType",
                        context: "input graph node",
                    });
                }
                let mut refs = NodeRefs::new();
                let attrs = node.attrs_mut();
                for (output, field) in fields.iter().enumerate() {
                    let Type::Tensor(ttype) = field else {
                        return Err(CompileError::UnsupportedVariant {
                            kind: "nested tuple type",
                            context: "graph node attributes",
                        });
                    };
                    refs.push(NodeRef::new(node_id, output));
                    attrs.shapes.push(ttype.static_dims()?);
                    attrs.dtypes.push(ttype.dtype.json_name());
                }
                self.nodes.push(node);
                Ok(refs)
            }
            Type::Tensor(ttype) => {
                let attrs = node.attrs_mut();
                attrs.shapes = vec![ttype.static_dims()?];
                attrs.dtypes = vec![ttype.dtype.json_name()];
                self.nodes.push(node);
                Ok(smallvec![NodeRef::new(node_id, 0)])
            }
        }
    }

    /// Collects constants embedded in an externally compiled function under
    /// `"{symbol}_const_{i}"` names, in first-visit order.
    fn collect_external_params(&mut self, func: &Expr, symbol: &str) -> Result<()> {
        struct ConstantCollector<'a> {
            visited: HashSet<ExprAddr>,
            symbol: &'a str,
            index: usize,
            params: &'a mut BTreeMap<String, TensorData>,
        }

        impl ExprVisitor for ConstantCollector<'_> {
            fn visited(&mut self) -> &mut HashSet<ExprAddr> {
                &mut self.visited
            }

            fn enter(&mut self, expr: &Expr) -> Result<()> {
                if let ExprKind::Constant(data) = expr.kind() {
                    let name = format!("{}_const_{}", self.symbol, self.index);
                    self.index += 1;
                    self.params.insert(name, data.clone());
                }
                Ok(())
            }
        }

        let mut collector = ConstantCollector {
            visited: HashSet::new(),
            symbol,
            index: 0,
            params: &mut self.params,
        };
        collector.walk(func)
    }

    /// Deduplicates display names: the first request returns the name
    /// unchanged, later ones append the occurrence count and retry.
    fn unique_name(&mut self, name: &str) -> String {
        if let Some(count) = self.name_map.get_mut(name) {
            let index = *count;
            *count += 1;
            let next = format!("{name}{index}");
            return self.unique_name(&next);
        }
        self.name_map.insert(name.to_string(), 1);
        name.to_string()
    }

    /// Resolves the storage plan: explicit options first, then the registry
    /// hook when one is installed, then the built-in planner.
    fn resolve_storage_plan(&self, func: &Expr) -> Result<StoragePlan> {
        if let Some(options) = &self.plan_options {
            return plan::plan_memory_with(func, options.clone());
        }
        match registry::get("GraphPlanMemory") {
            Some(hook) => {
                let value = hook(&[Value::Function(func.clone())]).map_err(error::from_anyhow)?;
                match value {
                    Value::StoragePlan(plan) => Ok(plan),
                    _ => Err(CompileError::Lowering(anyhow!(
                        "GraphPlanMemory hook returned an unexpected value"
                    ))),
                }
            }
            None => plan::plan_memory(func),
        }
    }

    fn graph_json(&self) -> Result<String> {
        let mut arg_nodes = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.is_input() {
                arg_nodes.push(index);
            }
        }

        let mut num_entry = 0usize;
        let mut shapes: Vec<Vec<i64>> = Vec::new();
        let mut storage_ids: Vec<i64> = Vec::new();
        let mut device_types: Vec<i64> = Vec::new();
        let mut dltypes: Vec<String> = Vec::new();
        let mut node_row_ptr = vec![0usize];
        for node in &self.nodes {
            let attrs = node.attrs();
            num_entry += node.num_outputs();
            shapes.extend(attrs.shapes.iter().cloned());
            storage_ids.extend(attrs.storage_ids.iter().copied());
            dltypes.extend(attrs.dtypes.iter().cloned());
            if let Some(devices) = &attrs.device_index {
                device_types.extend(devices.iter().copied());
            }
            node_row_ptr.push(num_entry);
        }

        let document = node::GraphJson {
            nodes: &self.nodes,
            arg_nodes,
            heads: &self.heads,
            attrs: node::GraphAttrsJson {
                shape: ("list_shape", shapes),
                storage_id: ("list_int", storage_ids),
                device_index: if device_types.is_empty() {
                    None
                } else {
                    Some(("list_int", device_types))
                },
                dltype: ("list_str", dltypes),
            },
            node_row_ptr,
        };
        serde_json::to_string(&document)
            .map_err(|err| CompileError::Lowering(anyhow!("graph serialization failed: {err}")))
    }
}

impl MemoTranslate for GraphCodegen {
    type Output = NodeRefs;

    fn memo(&mut self) -> &mut HashMap<ExprAddr, NodeRefs> {
        &mut self.memo
    }

    fn translate(&mut self, expr: &Expr) -> Result<NodeRefs> {
        match expr.kind() {
            ExprKind::Var { name } => {
                self.var_map
                    .get(&expr.addr())
                    .cloned()
                    .ok_or_else(|| CompileError::UnboundVariable { name: name.clone() })
            }
            ExprKind::Constant(data) => {
                let name = format!("p{}", self.params.len());
                self.params.insert(name.clone(), data.clone());
                self.add_node(
                    GraphNode::Input(InputNode {
                        name,
                        attrs: NodeAttrs::default(),
                    }),
                    expr,
                )
            }
            ExprKind::Tuple(fields) => {
                let mut refs = NodeRefs::new();
                for field in fields {
                    refs.extend(self.visit(field)?);
                }
                Ok(refs)
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let refs = self.visit(tuple)?;
                let picked = refs
                    .get(*index)
                    .copied()
                    .ok_or(CompileError::TupleArityMismatch {
                        index: *index,
                        len: refs.len(),
                    })?;
                Ok(smallvec![picked])
            }
            ExprKind::Let { var, value, body } => {
                if self.var_map.contains_key(&var.addr()) {
                    return Err(CompileError::NameCollision {
                        name: var.var_name().unwrap_or("<let>").to_string(),
                    });
                }
                let bound = self.visit(value)?;
                self.var_map.insert(var.addr(), bound);
                self.visit(body)
            }
            ExprKind::Call { op, args } => self.translate_call(expr, op, args),
            ExprKind::Function(function) => {
                if function.attrs.compiler.is_some() {
                    // Externally compiled functions surface through their
                    // call sites; the function node itself emits nothing.
                    Ok(NodeRefs::new())
                } else {
                    Err(CompileError::UnsupportedVariant {
                        kind: "Function",
                        context: "graph codegen (expected a fused call)",
                    })
                }
            }
            ExprKind::GlobalVar { .. }
            | ExprKind::Op { .. }
            | ExprKind::If { .. }
            | ExprKind::RefCreate { .. }
            | ExprKind::RefRead { .. }
            | ExprKind::RefWrite { .. }
            | ExprKind::Constructor { .. }
            | ExprKind::Match { .. } => Err(CompileError::UnsupportedVariant {
                kind: expr.kind_name(),
                context: "graph codegen",
            }),
        }
    }
}

