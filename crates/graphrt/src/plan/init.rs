//! First planning pass: prototype tokens and reader counts.

use std::collections::HashMap;

use crate::error::{CompileError, Result};
use crate::ir::{Expr, ExprAddr, Type};

use super::arena::{TokenArena, TokenId};
use super::{StorageToken, TokenVisitor, Tokens};

pub(super) struct LivenessInit<'a> {
    arena: &'a mut TokenArena,
    device_map: &'a HashMap<ExprAddr, i64>,
    token_map: HashMap<ExprAddr, Tokens>,
}

impl<'a> LivenessInit<'a> {
    pub(super) fn new(arena: &'a mut TokenArena, device_map: &'a HashMap<ExprAddr, i64>) -> Self {
        Self {
            arena,
            device_map,
            token_map: HashMap::new(),
        }
    }

    /// Runs the pass and yields the prototype token map for `func`.
    pub(super) fn run_init(mut self, func: &Expr) -> Result<HashMap<ExprAddr, Tokens>> {
        self.run(func)?;
        Ok(self.token_map)
    }
}

impl TokenVisitor for LivenessInit<'_> {
    fn tokens(&self) -> &HashMap<ExprAddr, Tokens> {
        &self.token_map
    }

    fn tokens_mut(&mut self) -> &mut HashMap<ExprAddr, Tokens> {
        &mut self.token_map
    }

    fn create_tokens(&mut self, expr: &Expr, _can_reuse: bool) -> Result<()> {
        if self.token_map.contains_key(&expr.addr()) {
            return Err(CompileError::DuplicateToken {
                kind: expr.kind_name(),
            });
        }
        let device_type = self.device_map.get(&expr.addr()).copied().unwrap_or(0);
        let mut tokens = Tokens::new();
        match expr.checked_type()? {
            Type::Tuple(fields) => {
                for field in fields {
                    let Type::Tensor(ttype) = field else {
                        return Err(CompileError::UnsupportedVariant {
                            kind: "nested tuple type",
                            context: "token creation",
                        });
                    };
                    tokens.push(self.arena.alloc(StorageToken::new(ttype.clone(), device_type)));
                }
            }
            Type::Tensor(ttype) => {
                tokens.push(self.arena.alloc(StorageToken::new(ttype.clone(), device_type)));
            }
        }
        self.token_map.insert(expr.addr(), tokens);
        Ok(())
    }

    fn visit_call(&mut self, expr: &Expr, args: &[Expr]) -> Result<()> {
        self.create_tokens(expr, true)?;
        // Every argument gains one reader.
        for arg in args {
            let arg_tokens = self.tokens_for(arg)?.clone();
            for token in arg_tokens {
                self.arena[token].ref_count += 1;
            }
        }
        Ok(())
    }

    fn pin(&mut self, token: TokenId) {
        self.arena[token].ref_count += 1;
    }
}
