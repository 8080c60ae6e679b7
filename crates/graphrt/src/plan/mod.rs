//! Storage planning for fused graph functions.
//!
//! Planning runs two traversals over the expression DAG. The first
//! ([`init`]) materialises a prototype token for every tensor output and
//! tallies how many readers each one has. The second ([`alloc`]) replays the
//! traversal in execution order and hands out storage ids from a best-fit
//! free list, recycling a token as soon as its last reader is done with it.
//! Expressions whose live ranges never overlap end up sharing a storage id.

mod alloc;
mod arena;
mod init;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::error::{CompileError, Result};
use crate::ir::{Expr, ExprAddr, ExprKind, TensorType};

use arena::TokenId;

/// Planner-local record of one memory region. Tokens are arena-allocated and
/// cross-reference each other by [`TokenId`]; the arena drops as a unit once
/// codegen has consumed the plan.
#[derive(Debug)]
pub(crate) struct StorageToken {
    /// Remaining readers; the token is recyclable at zero.
    pub(crate) ref_count: i64,
    /// High-water-mark byte size. Only grows while the token is live.
    pub(crate) max_bytes: u64,
    pub(crate) ttype: TensorType,
    /// 0 means unannotated / default device.
    pub(crate) device_type: i64,
    /// Index into the committed-token list; -1 until committed.
    pub(crate) storage_id: i64,
}

impl StorageToken {
    fn new(ttype: TensorType, device_type: i64) -> Self {
        Self {
            ref_count: 0,
            max_bytes: 0,
            ttype,
            device_type,
            storage_id: -1,
        }
    }
}

/// Token list of one expression; length equals its tensor-output count.
pub(crate) type Tokens = SmallVec<[TokenId; 1]>;

/// Shared traversal skeleton for the two planning passes. The passes differ
/// only in how tokens come into being (`create_tokens`) and how calls
/// manipulate reader counts (`visit_call`).
trait TokenVisitor {
    fn tokens(&self) -> &HashMap<ExprAddr, Tokens>;
    fn tokens_mut(&mut self) -> &mut HashMap<ExprAddr, Tokens>;
    fn create_tokens(&mut self, expr: &Expr, can_reuse: bool) -> Result<()>;
    fn visit_call(&mut self, expr: &Expr, args: &[Expr]) -> Result<()>;
    fn pin(&mut self, token: TokenId);

    fn run(&mut self, func: &Expr) -> Result<()> {
        let function = func.as_function().ok_or(CompileError::UnsupportedVariant {
            kind: func.kind_name(),
            context: "storage planning",
        })?;
        for param in &function.params {
            self.create_tokens(param, false)?;
        }
        // Function outputs stay live past the last call.
        let outputs = self.tokens_for(&function.body)?.clone();
        for token in outputs {
            self.pin(token);
        }
        Ok(())
    }

    /// Visit once and return the expression's tokens; absence is fatal.
    fn tokens_for(&mut self, expr: &Expr) -> Result<&Tokens> {
        self.visit(expr)?;
        self.tokens()
            .get(&expr.addr())
            .ok_or(CompileError::MissingToken {
                kind: expr.kind_name(),
            })
    }

    fn visit(&mut self, expr: &Expr) -> Result<()> {
        if self.tokens().contains_key(&expr.addr()) {
            return Ok(());
        }
        match expr.kind() {
            ExprKind::Constant(_) => self.create_tokens(expr, false),
            ExprKind::Call { args, .. } => self.visit_call(expr, args),
            ExprKind::Tuple(fields) => {
                let mut out = Tokens::new();
                for field in fields {
                    let field_tokens = self.tokens_for(field)?;
                    if field_tokens.len() != 1 {
                        return Err(CompileError::TupleFieldArity {
                            tokens: field_tokens.len(),
                        });
                    }
                    out.push(field_tokens[0]);
                }
                self.tokens_mut().insert(expr.addr(), out);
                Ok(())
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let tuple_tokens = self.tokens_for(tuple)?;
                let len = tuple_tokens.len();
                let token = tuple_tokens.get(*index).copied().ok_or(
                    CompileError::TupleArityMismatch { index: *index, len },
                )?;
                self.tokens_mut()
                    .insert(expr.addr(), SmallVec::from_slice(&[token]));
                Ok(())
            }
            ExprKind::Let { var, value, body } => {
                let value_tokens = self.tokens_for(value)?.clone();
                self.tokens_mut().insert(var.addr(), value_tokens);
                let body_tokens = self.tokens_for(body)?.clone();
                self.tokens_mut().insert(expr.addr(), body_tokens);
                Ok(())
            }
            // Variables resolve through the parameter pre-pass or `Let`
            // aliasing; operator references carry no storage.
            ExprKind::Var { .. }
            | ExprKind::GlobalVar { .. }
            | ExprKind::Op { .. }
            | ExprKind::Function(_) => Ok(()),
            ExprKind::If { .. }
            | ExprKind::RefCreate { .. }
            | ExprKind::RefRead { .. }
            | ExprKind::RefWrite { .. }
            | ExprKind::Constructor { .. }
            | ExprKind::Match { .. } => Err(CompileError::UnsupportedVariant {
                kind: expr.kind_name(),
                context: "storage planning",
            }),
        }
    }
}

/// Knobs for a planning run.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Device annotation per expression; absent entries default to 0.
    /// Produced by an upstream device-placement analysis.
    pub device_map: HashMap<ExprAddr, i64>,
    /// Best-fit similarity window: a request of `s` bytes may recycle free
    /// tokens in `[s / match_range, s * match_range]`. 0 disables recycling.
    pub match_range: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            device_map: HashMap::new(),
            match_range: 16,
        }
    }
}

/// Storage assignment for one expression. Both lists have one entry per
/// tensor output.
#[derive(Debug, Clone)]
pub struct ExprStorage {
    pub storage_ids: Vec<i64>,
    pub device_types: Vec<i64>,
}

/// Finished plan: per-expression storage/device assignments plus the total
/// byte high-water mark across all committed tokens.
#[derive(Debug, Clone, Default)]
pub struct StoragePlan {
    pub expr_storage: HashMap<ExprAddr, ExprStorage>,
    pub total_alloc_bytes: u64,
}

impl StoragePlan {
    pub fn get(&self, expr: &Expr) -> Option<&ExprStorage> {
        self.expr_storage.get(&expr.addr())
    }
}

/// Plans storage for `func` with default options.
pub fn plan_memory(func: &Expr) -> Result<StoragePlan> {
    plan_memory_with(func, PlanOptions::default())
}

/// Plans storage for `func`.
pub fn plan_memory_with(func: &Expr, options: PlanOptions) -> Result<StoragePlan> {
    let mut arena = arena::TokenArena::new();
    let prototype = init::LivenessInit::new(&mut arena, &options.device_map).run_init(func)?;
    alloc::StorageAllocator::new(arena, prototype, options.match_range).plan(func)
}
