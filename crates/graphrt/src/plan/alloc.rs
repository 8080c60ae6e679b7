//! Second planning pass: storage-id assignment with best-fit recycling.

use std::collections::{BTreeMap, HashMap};

use crate::error::{CompileError, Result};
use crate::ir::{Expr, ExprAddr};
use crate::profiling;

use super::arena::{TokenArena, TokenId};
use super::{ExprStorage, StoragePlan, TokenVisitor, Tokens};

pub(super) struct StorageAllocator {
    arena: TokenArena,
    prototype: HashMap<ExprAddr, Tokens>,
    token_map: HashMap<ExprAddr, Tokens>,
    /// Recyclable tokens (reader count zero), keyed by byte size.
    free: BTreeMap<u64, Vec<TokenId>>,
    /// Committed tokens in id-assignment order; a token's storage id is its
    /// index here.
    committed: Vec<TokenId>,
    match_range: u64,
}

impl StorageAllocator {
    pub(super) fn new(
        arena: TokenArena,
        prototype: HashMap<ExprAddr, Tokens>,
        match_range: u64,
    ) -> Self {
        Self {
            arena,
            prototype,
            token_map: HashMap::new(),
            free: BTreeMap::new(),
            committed: Vec::new(),
            match_range,
        }
    }

    pub(super) fn plan(mut self, func: &Expr) -> Result<StoragePlan> {
        self.run(func)?;

        let mut expr_storage = HashMap::with_capacity(self.token_map.len());
        let mut annotated = 0usize;
        let mut total = 0usize;
        for (addr, tokens) in &self.token_map {
            let mut storage_ids = Vec::with_capacity(tokens.len());
            let mut device_types = Vec::with_capacity(tokens.len());
            for id in tokens {
                let token = &self.arena[*id];
                if token.device_type != 0 {
                    annotated += 1;
                }
                total += 1;
                storage_ids.push(token.storage_id);
                device_types.push(token.device_type);
            }
            expr_storage.insert(*addr, ExprStorage {
                storage_ids,
                device_types,
            });
        }
        if annotated != 0 && annotated != total {
            return Err(CompileError::PartialDeviceAnnotation { annotated, total });
        }

        let total_alloc_bytes = self
            .committed
            .iter()
            .map(|id| self.arena[*id].max_bytes)
            .sum();
        Ok(StoragePlan {
            expr_storage,
            total_alloc_bytes,
        })
    }

    /// Best-fit lookup within the similarity window, falling back to a fresh
    /// allocation. A recycled token inherits the prototype's reader count.
    fn request(&mut self, prototype: TokenId) -> Result<TokenId> {
        let size = self.arena[prototype].ttype.byte_len()?;
        if self.match_range == 0 {
            return Ok(self.commit(prototype, size));
        }
        let lower = size / self.match_range;
        let upper = size.saturating_mul(self.match_range);
        let device_type = self.arena[prototype].device_type;
        if let Some(token) = self.recycle(lower, size, upper, device_type) {
            profiling::cache_event("storage_reuse_hit");
            let reader_count = self.arena[prototype].ref_count;
            let recycled = &mut self.arena[token];
            recycled.max_bytes = recycled.max_bytes.max(size);
            recycled.ref_count = reader_count;
            return Ok(token);
        }
        profiling::cache_event("storage_reuse_miss");
        Ok(self.commit(prototype, size))
    }

    /// Scans `[size, upper]` upward, then `[lower, size)` downward, for the
    /// first free token on the same device.
    fn recycle(&mut self, lower: u64, size: u64, upper: u64, device_type: i64) -> Option<TokenId> {
        let mut found: Option<(u64, usize)> = None;
        'upward: for (bucket_size, bucket) in self.free.range(size..=upper) {
            for (pos, id) in bucket.iter().enumerate() {
                let token = &self.arena[*id];
                if token.device_type != device_type {
                    continue;
                }
                debug_assert_eq!(token.ref_count, 0);
                found = Some((*bucket_size, pos));
                break 'upward;
            }
        }
        if found.is_none() {
            'downward: for (bucket_size, bucket) in self.free.range(lower..size).rev() {
                for (pos, id) in bucket.iter().enumerate() {
                    let token = &self.arena[*id];
                    if token.device_type != device_type {
                        continue;
                    }
                    debug_assert_eq!(token.ref_count, 0);
                    found = Some((*bucket_size, pos));
                    break 'downward;
                }
            }
        }
        let (bucket_size, pos) = found?;
        let bucket = self.free.get_mut(&bucket_size)?;
        let id = bucket.remove(pos);
        if bucket.is_empty() {
            self.free.remove(&bucket_size);
        }
        Some(id)
    }

    /// Commits the prototype itself: assigns the next dense storage id and
    /// records the byte size. The token keeps its identity across the passes.
    fn commit(&mut self, prototype: TokenId, size: u64) -> TokenId {
        let storage_id = self.committed.len() as i64;
        let token = &mut self.arena[prototype];
        token.max_bytes = size;
        token.storage_id = storage_id;
        self.committed.push(prototype);
        prototype
    }

    fn check_for_release(&mut self, id: TokenId) {
        let token = &self.arena[id];
        debug_assert!(token.storage_id >= 0);
        debug_assert!(token.ref_count >= 0);
        if token.ref_count == 0 {
            self.free.entry(token.max_bytes).or_default().push(id);
        }
    }
}

impl TokenVisitor for StorageAllocator {
    fn tokens(&self) -> &HashMap<ExprAddr, Tokens> {
        &self.token_map
    }

    fn tokens_mut(&mut self) -> &mut HashMap<ExprAddr, Tokens> {
        &mut self.token_map
    }

    fn create_tokens(&mut self, expr: &Expr, can_reuse: bool) -> Result<()> {
        if self.token_map.contains_key(&expr.addr()) {
            return Err(CompileError::DuplicateToken {
                kind: expr.kind_name(),
            });
        }
        let prototype = self
            .prototype
            .get(&expr.addr())
            .ok_or(CompileError::MissingToken {
                kind: expr.kind_name(),
            })?
            .clone();
        let mut tokens = Tokens::new();
        for proto in prototype {
            if can_reuse {
                tokens.push(self.request(proto)?);
            } else {
                // Parameters and constants are committed directly and gain a
                // synthetic reader so they are never recycled.
                let size = self.arena[proto].ttype.byte_len()?;
                let committed = self.commit(proto, size);
                self.arena[committed].ref_count += 1;
                tokens.push(committed);
            }
        }
        self.token_map.insert(expr.addr(), tokens);
        Ok(())
    }

    fn visit_call(&mut self, expr: &Expr, args: &[Expr]) -> Result<()> {
        let mut arg_tokens: Vec<TokenId> = Vec::new();
        for arg in args {
            arg_tokens.extend(self.tokens_for(arg)?.iter().copied());
        }
        self.create_tokens(expr, true)?;
        // Outputs nobody reads go straight back to the free list.
        let out_tokens = self.token_map[&expr.addr()].clone();
        for token in out_tokens {
            self.check_for_release(token);
        }
        for token in arg_tokens {
            self.arena[token].ref_count -= 1;
            self.check_for_release(token);
        }
        Ok(())
    }

    fn pin(&mut self, token: TokenId) {
        self.arena[token].ref_count += 1;
    }
}
