//! Process-wide registry of named packed functions.
//!
//! The registry is the cross-language glue surface: embedding hosts look up
//! entry points by name and invoke them over the loosely typed [`Value`]
//! payloads. The table initialises lazily on first access and its entries
//! live for the remainder of the process; callbacks may close over an
//! embedding runtime whose teardown order is not ours to control, so nothing
//! is dropped at exit. Entries only leave the table through [`remove`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Result};

use crate::codegen::module::GraphCodegenModule;
use crate::engine::{IrModule, RuntimeModule, Target};
use crate::ir::{Expr, TensorData};
use crate::plan::StoragePlan;

/// Argument and return payloads crossing the registry boundary.
#[derive(Clone)]
pub enum Value {
    Null,
    Str(String),
    StrList(Vec<String>),
    Function(Expr),
    Tensor(TensorData),
    Targets(BTreeMap<i64, Target>),
    IrModules(BTreeMap<String, IrModule>),
    Externals(Vec<RuntimeModule>),
    StoragePlan(StoragePlan),
    Module(Arc<GraphCodegenModule>),
}

pub type PackedFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

fn table() -> &'static Mutex<HashMap<String, PackedFn>> {
    static TABLE: OnceLock<Mutex<HashMap<String, PackedFn>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `func` under `name`, failing if the name is taken.
pub fn register(name: impl Into<String>, func: PackedFn) -> Result<()> {
    let name = name.into();
    let mut entries = table().lock().expect("function registry poisoned");
    if entries.contains_key(&name) {
        bail!("global function `{name}` is already registered");
    }
    entries.insert(name, func);
    Ok(())
}

/// Registers `func` under `name`, replacing any existing entry.
pub fn register_override(name: impl Into<String>, func: PackedFn) {
    let mut entries = table().lock().expect("function registry poisoned");
    entries.insert(name.into(), func);
}

pub fn get(name: &str) -> Option<PackedFn> {
    let entries = table().lock().expect("function registry poisoned");
    entries.get(name).cloned()
}

/// Removes an entry, reporting whether it existed.
pub fn remove(name: &str) -> bool {
    let mut entries = table().lock().expect("function registry poisoned");
    entries.remove(name).is_some()
}

/// Sorted snapshot of every registered name.
pub fn list_names() -> Vec<String> {
    let entries = table().lock().expect("function registry poisoned");
    let mut names: Vec<String> = entries.keys().cloned().collect();
    names.sort();
    names
}
