//! Command facade over [`GraphCodegen`], mirroring the interface the
//! embedding host drives by name.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};

use crate::engine::{self, CompileEngine};
use crate::ir::Expr;
use crate::plan;
use crate::registry::{self, PackedFn, Value};

use super::{GraphCodegen, LoweredOutput, Targets};

#[derive(Default)]
struct ModuleState {
    targets: Option<Targets>,
    output: Option<LoweredOutput>,
}

/// Stateful codegen module: `init` stores the target table, `codegen` runs
/// the pipeline, and the getters expose pieces of the stored output.
pub struct GraphCodegenModule {
    engine: Arc<CompileEngine>,
    state: Mutex<ModuleState>,
}

impl GraphCodegenModule {
    pub fn new(engine: Arc<CompileEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            state: Mutex::new(ModuleState::default()),
        })
    }

    pub fn init(&self, targets: Targets) {
        let mut state = self.state.lock().expect("codegen module state poisoned");
        state.targets = Some(targets);
        state.output = None;
    }

    pub fn codegen(&self, func: &Expr) -> Result<()> {
        let targets = {
            let state = self.state.lock().expect("codegen module state poisoned");
            state
                .targets
                .clone()
                .ok_or_else(|| anyhow!("codegen module is not initialised; call `init` first"))?
        };
        let mut codegen = GraphCodegen::new(Arc::clone(&self.engine), targets);
        let output = codegen.codegen(func)?;
        let mut state = self.state.lock().expect("codegen module state poisoned");
        state.output = Some(output);
        Ok(())
    }

    fn with_output<T>(&self, f: impl FnOnce(&LoweredOutput) -> T) -> Result<T> {
        let state = self.state.lock().expect("codegen module state poisoned");
        let output = state
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("no codegen output available; call `codegen` first"))?;
        Ok(f(output))
    }

    pub fn graph_json(&self) -> Result<String> {
        self.with_output(|output| output.graph_json.clone())
    }

    pub fn list_params_name(&self) -> Result<Vec<String>> {
        self.with_output(|output| output.params.keys().cloned().collect())
    }

    pub fn param_by_name(&self, name: &str) -> Result<crate::ir::TensorData> {
        let param = self.with_output(|output| output.params.get(name).cloned())?;
        param.ok_or_else(|| anyhow!("no parameter named `{name}` in the codegen output"))
    }

    pub fn irmodule(&self) -> Result<std::collections::BTreeMap<String, crate::engine::IrModule>> {
        self.with_output(|output| output.lowered_funcs.clone())
    }

    pub fn external_modules(&self) -> Result<Vec<crate::engine::RuntimeModule>> {
        self.with_output(|output| output.external_mods.clone())
    }

    /// Packed-function view of the module commands, for hosts that drive
    /// everything through the registry's value protocol.
    pub fn get_function(self: &Arc<Self>, name: &str) -> Option<PackedFn> {
        let module = Arc::clone(self);
        match name {
            "init" => Some(Arc::new(move |args: &[Value]| {
                let [_, Value::Targets(targets)] = args else {
                    bail!("init expects (module, targets) arguments");
                };
                module.init(targets.clone());
                Ok(Value::Null)
            })),
            "codegen" => Some(Arc::new(move |args: &[Value]| {
                let [Value::Function(func)] = args else {
                    bail!("codegen expects a function argument");
                };
                module.codegen(func)?;
                Ok(Value::Null)
            })),
            "get_graph_json" => Some(Arc::new(move |_args: &[Value]| {
                Ok(Value::Str(module.graph_json()?))
            })),
            "list_params_name" => Some(Arc::new(move |_args: &[Value]| {
                Ok(Value::StrList(module.list_params_name()?))
            })),
            "get_param_by_name" => Some(Arc::new(move |args: &[Value]| {
                let [Value::Str(name)] = args else {
                    bail!("get_param_by_name expects a parameter name");
                };
                Ok(Value::Tensor(module.param_by_name(name)?))
            })),
            "get_irmodule" => Some(Arc::new(move |_args: &[Value]| {
                Ok(Value::IrModules(module.irmodule()?))
            })),
            "get_external_modules" => Some(Arc::new(move |_args: &[Value]| {
                Ok(Value::Externals(module.external_modules()?))
            })),
            _ => None,
        }
    }
}

/// Installs the globally reachable entry points: the planner hook and the
/// codegen module factory.
pub fn register_globals() {
    registry::register_override(
        "GraphPlanMemory",
        Arc::new(|args: &[Value]| {
            let [Value::Function(func)] = args else {
                bail!("GraphPlanMemory expects a function argument");
            };
            let plan = plan::plan_memory(func).map_err(anyhow::Error::from)?;
            Ok(Value::StoragePlan(plan))
        }),
    );
    registry::register_override(
        "_GraphRuntimeCodegen",
        Arc::new(|_args: &[Value]| {
            Ok(Value::Module(GraphCodegenModule::new(engine::global())))
        }),
    );
}
