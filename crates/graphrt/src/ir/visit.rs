//! Visitor utilities over the expression DAG.
//!
//! Both traversals memoize on node identity: the IR is a DAG, and a shared
//! subexpression must be processed exactly once no matter how many paths
//! reach it.

use std::collections::{HashMap, HashSet};

use crate::error::Result;

use super::{Expr, ExprAddr, ExprKind};

/// Side-effecting walk that reaches every distinct node once, parents before
/// children.
pub trait ExprVisitor {
    fn visited(&mut self) -> &mut HashSet<ExprAddr>;

    /// Per-node hook, invoked once per distinct node.
    fn enter(&mut self, expr: &Expr) -> Result<()>;

    fn walk(&mut self, expr: &Expr) -> Result<()> {
        if !self.visited().insert(expr.addr()) {
            return Ok(());
        }
        self.enter(expr)?;
        match expr.kind() {
            ExprKind::Var { .. }
            | ExprKind::Constant(_)
            | ExprKind::GlobalVar { .. }
            | ExprKind::Op { .. }
            | ExprKind::Constructor { .. } => {}
            ExprKind::Tuple(fields) => {
                for field in fields {
                    self.walk(field)?;
                }
            }
            ExprKind::TupleGetItem { tuple, .. } => self.walk(tuple)?,
            ExprKind::Call { op, args } => {
                self.walk(op)?;
                for arg in args {
                    self.walk(arg)?;
                }
            }
            ExprKind::Function(function) => {
                for param in &function.params {
                    self.walk(param)?;
                }
                self.walk(&function.body)?;
            }
            ExprKind::Let { var, value, body } => {
                self.walk(var)?;
                self.walk(value)?;
                self.walk(body)?;
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.walk(cond)?;
                self.walk(then_branch)?;
                self.walk(else_branch)?;
            }
            ExprKind::RefCreate { value } => self.walk(value)?,
            ExprKind::RefRead { reference } => self.walk(reference)?,
            ExprKind::RefWrite { reference, value } => {
                self.walk(reference)?;
                self.walk(value)?;
            }
            ExprKind::Match { data } => self.walk(data)?,
        }
        Ok(())
    }
}

/// Memoized translation from expressions to a clonable result.
///
/// `visit` consults the memo before dispatching to `translate`, so each
/// distinct node is translated exactly once and re-encounters return the
/// cached value.
pub trait MemoTranslate {
    type Output: Clone;

    fn memo(&mut self) -> &mut HashMap<ExprAddr, Self::Output>;

    /// Translate one node. Implementations recurse through `visit`.
    fn translate(&mut self, expr: &Expr) -> Result<Self::Output>;

    fn visit(&mut self, expr: &Expr) -> Result<Self::Output> {
        if let Some(cached) = self.memo().get(&expr.addr()) {
            return Ok(cached.clone());
        }
        let output = self.translate(expr)?;
        self.memo().insert(expr.addr(), output.clone());
        Ok(output)
    }
}
