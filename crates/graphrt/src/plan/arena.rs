//! Bump arena backing the planner's storage tokens.
//!
//! Tokens form a dense web of cross-references (aliases through tuples and
//! lets, recycling through the free list), so they are addressed by opaque
//! index rather than owned pointers. Nothing is freed individually; the
//! arena is dropped whole when planning ends.

use std::ops::{Index, IndexMut};

use super::StorageToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TokenId(u32);

#[derive(Debug, Default)]
pub(crate) struct TokenArena {
    tokens: Vec<StorageToken>,
}

impl TokenArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, token: StorageToken) -> TokenId {
        let id = TokenId(self.tokens.len() as u32);
        self.tokens.push(token);
        id
    }
}

impl Index<TokenId> for TokenArena {
    type Output = StorageToken;

    fn index(&self, id: TokenId) -> &StorageToken {
        &self.tokens[id.0 as usize]
    }
}

impl IndexMut<TokenId> for TokenArena {
    fn index_mut(&mut self, id: TokenId) -> &mut StorageToken {
        &mut self.tokens[id.0 as usize]
    }
}
