//! Compile engine facade: cache-keyed lowering of fused sub-functions.
//!
//! Tensor-kernel lowering itself is an external collaborator behind the
//! [`KernelLowerer`] trait. The engine's job is bookkeeping: a structural
//! cache guaranteeing each `(function, target)` pair is lowered at most
//! once, and a side table of modules produced by external code generators.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{CompileError, Result};
use crate::hashing::fnv1a_hash;
use crate::ir::{Expr, ExprAddr, ExprKind, Type};
use crate::profiling;

/// Compilation target description, compared and keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Target(String);

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn llvm() -> Self {
        Self::new("llvm")
    }

    /// Pseudo-target for functions claimed by an external code generator.
    pub fn ext_dev() -> Self {
        Self::new("ext_dev")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_external(&self) -> bool {
        self.0 == "ext_dev"
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Well-known device names for diagnostics and target selection.
pub fn device_name(device_type: i64) -> &'static str {
    match device_type {
        0 => "llvm",
        1 => "cpu",
        2 => "cuda",
        4 => "opencl",
        7 => "vulkan",
        8 => "metal",
        _ => "unknown",
    }
}

/// Opaque lowered kernel artifact handed back by the external compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunc {
    pub symbol: String,
    pub artifact: Arc<[u8]>,
}

/// Per-target collection of lowered kernels, keyed by symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrModule {
    funcs: BTreeMap<String, LoweredFunc>,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, func: LoweredFunc) {
        self.funcs.insert(func.symbol.clone(), func);
    }

    /// Merges `other` into `self`, overwriting on symbol collision.
    pub fn update(&mut self, other: &IrModule) {
        for func in other.funcs.values() {
            self.insert(func.clone());
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&LoweredFunc> {
        self.funcs.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn functions(&self) -> impl Iterator<Item = &LoweredFunc> {
        self.funcs.values()
    }
}

/// Module produced by an external (`Compiler`-attributed) code generator.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeModule {
    pub compiler: String,
    pub symbol: String,
    pub artifact: Arc<[u8]>,
}

/// Result of lowering one fused function under one target.
#[derive(Debug, Clone)]
pub struct CachedFunc {
    pub func_name: String,
    /// Lowered modules keyed by target string.
    pub funcs: BTreeMap<String, IrModule>,
}

/// External tensor-kernel compiler.
pub trait KernelLowerer: Send + Sync {
    fn lower(&self, func: &Expr, target: &Target) -> anyhow::Result<CachedFunc>;
}

/// Structural cache key: canonical encoding of the fused function plus the
/// target. Equality compares the canonical bytes, so a hash collision can
/// never alias two distinct functions.
#[derive(Clone)]
pub struct CacheKey {
    func: Expr,
    target: Target,
    hash: u64,
    signature: Arc<[u8]>,
}

impl CacheKey {
    pub fn new(func: &Expr, target: &Target) -> Result<Self> {
        let signature = canonical_signature(func)?;
        let hash = fnv1a_hash(&signature);
        Ok(Self {
            func: func.clone(),
            target: target.clone(),
            hash,
            signature: signature.into(),
        })
    }

    pub fn function(&self) -> &Expr {
        &self.func
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.hash == other.hash && self.signature == other.signature
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.target.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("target", &self.target)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

/// Canonical serializable mirror of an expression DAG. Nodes are numbered in
/// first-visit order, so two alpha-equivalent functions produce identical
/// bytes regardless of variable names or allocation addresses.
#[derive(Serialize)]
enum SigKind {
    Var,
    Constant { byte_len: usize, byte_hash: u64 },
    Tuple,
    TupleGetItem { index: usize },
    Call,
    Function {
        primitive: bool,
        compiler: Option<String>,
        global_symbol: Option<String>,
    },
    Let,
    GlobalVar { name: String },
    Op { name: String },
    Opaque { kind: &'static str },
}

#[derive(Serialize)]
struct SigNode {
    kind: SigKind,
    children: Vec<u32>,
    ty: Option<Type>,
}

struct Canonicalizer {
    index: HashMap<ExprAddr, u32>,
    nodes: Vec<SigNode>,
}

impl Canonicalizer {
    fn visit(&mut self, expr: &Expr) -> u32 {
        if let Some(index) = self.index.get(&expr.addr()) {
            return *index;
        }
        let (kind, children) = match expr.kind() {
            ExprKind::Var { .. } => (SigKind::Var, Vec::new()),
            ExprKind::Constant(data) => (
                SigKind::Constant {
                    byte_len: data.byte_len(),
                    byte_hash: fnv1a_hash(&data.bytes),
                },
                Vec::new(),
            ),
            ExprKind::Tuple(fields) => {
                (SigKind::Tuple, fields.iter().map(|f| self.visit(f)).collect())
            }
            ExprKind::TupleGetItem { tuple, index } => (
                SigKind::TupleGetItem { index: *index },
                vec![self.visit(tuple)],
            ),
            ExprKind::Call { op, args } => {
                let mut children = vec![self.visit(op)];
                children.extend(args.iter().map(|arg| self.visit(arg)));
                (SigKind::Call, children)
            }
            ExprKind::Function(function) => {
                let mut children: Vec<u32> =
                    function.params.iter().map(|p| self.visit(p)).collect();
                children.push(self.visit(&function.body));
                (
                    SigKind::Function {
                        primitive: function.attrs.primitive,
                        compiler: function.attrs.compiler.clone(),
                        global_symbol: function.attrs.global_symbol.clone(),
                    },
                    children,
                )
            }
            ExprKind::Let { var, value, body } => (
                SigKind::Let,
                vec![self.visit(var), self.visit(value), self.visit(body)],
            ),
            ExprKind::GlobalVar { name } => (SigKind::GlobalVar { name: name.clone() }, Vec::new()),
            ExprKind::Op { name } => (SigKind::Op { name: name.clone() }, Vec::new()),
            _ => (
                SigKind::Opaque {
                    kind: expr.kind_name(),
                },
                Vec::new(),
            ),
        };
        let index = self.nodes.len() as u32;
        self.nodes.push(SigNode {
            kind,
            children,
            ty: expr.ty().cloned(),
        });
        self.index.insert(expr.addr(), index);
        index
    }
}

fn canonical_signature(func: &Expr) -> Result<Vec<u8>> {
    let mut canon = Canonicalizer {
        index: HashMap::new(),
        nodes: Vec::new(),
    };
    let root = canon.visit(func);
    bincode::serialize(&(root, &canon.nodes))
        .map_err(|err| CompileError::Lowering(anyhow!("cache key encoding failed: {err}")))
}

/// Cache-keyed facade over the external kernel compiler.
pub struct CompileEngine {
    lowerer: Arc<dyn KernelLowerer>,
    cache: Mutex<HashMap<CacheKey, Arc<CachedFunc>>>,
    external: Mutex<Vec<RuntimeModule>>,
}

impl CompileEngine {
    pub fn new(lowerer: Arc<dyn KernelLowerer>) -> Arc<Self> {
        Arc::new(Self {
            lowerer,
            cache: Mutex::new(HashMap::new()),
            external: Mutex::new(Vec::new()),
        })
    }

    /// Lowers the key's function for its target, at most once per key. The
    /// lock spans the whole get-or-insert so concurrent callers never lower
    /// the same key twice.
    pub fn lower(&self, key: &CacheKey) -> Result<Arc<CachedFunc>> {
        let mut cache = self.cache.lock().expect("compile engine cache poisoned");
        if let Some(hit) = cache.get(key) {
            profiling::cache_event("engine_cache_hit");
            return Ok(Arc::clone(hit));
        }
        profiling::cache_event("engine_cache_miss");
        let lowered = Arc::new(self.lowerer.lower(key.function(), key.target())?);
        if key.target().is_external() {
            self.record_external(key, &lowered);
        }
        cache.insert(key.clone(), Arc::clone(&lowered));
        Ok(lowered)
    }

    fn record_external(&self, key: &CacheKey, lowered: &Arc<CachedFunc>) {
        let Some(function) = key.function().as_function() else {
            return;
        };
        let Some(compiler) = function.attrs.compiler.clone() else {
            return;
        };
        let artifact = lowered
            .funcs
            .values()
            .find_map(|module| module.get(&lowered.func_name))
            .map(|func| func.artifact.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        let mut external = self.external.lock().expect("external module list poisoned");
        external.push(RuntimeModule {
            compiler,
            symbol: lowered.func_name.clone(),
            artifact,
        });
    }

    /// All modules produced so far by external code generators.
    pub fn lower_external_functions(&self) -> Vec<RuntimeModule> {
        self.external
            .lock()
            .expect("external module list poisoned")
            .clone()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().expect("compile engine cache poisoned").len()
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .expect("compile engine cache poisoned")
            .clear();
        self.external
            .lock()
            .expect("external module list poisoned")
            .clear();
    }
}

struct UnconfiguredLowerer;

impl KernelLowerer for UnconfiguredLowerer {
    fn lower(&self, _func: &Expr, target: &Target) -> anyhow::Result<CachedFunc> {
        Err(anyhow!(
            "no kernel lowerer configured for target `{target}`; install one with engine::set_global"
        ))
    }
}

static GLOBAL_ENGINE: Lazy<Mutex<Arc<CompileEngine>>> =
    Lazy::new(|| Mutex::new(CompileEngine::new(Arc::new(UnconfiguredLowerer))));

/// The process-wide engine used by registry-created codegen modules.
pub fn global() -> Arc<CompileEngine> {
    Arc::clone(&GLOBAL_ENGINE.lock().expect("global engine poisoned"))
}

/// Replaces the process-wide engine.
pub fn set_global(engine: Arc<CompileEngine>) {
    *GLOBAL_ENGINE.lock().expect("global engine poisoned") = engine;
}
