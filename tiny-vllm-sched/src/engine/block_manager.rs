//! Key/value cache block manager.
//!
//! This module maintains a pool of reusable blocks for the model KV cache.
//! Blocks are reference counted: a block returns to the free list only when no
//! block table references it and no in-flight batch still pins it. Full blocks
//! are hashed by content so that shared prefixes across sequences only occupy
//! memory once, and forked sequences share blocks copy-on-write.
//!
//! All mutation of the pool goes through [`BlockManager`]; nothing else holds
//! block state.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, error};
use xxhash_rust::xxh64::Xxh64;

use crate::engine::sequence::{RequestId, TokenId};
use crate::error::{Result, SchedulerError};

pub type BlockId = usize;

/// Compute a rolling 64-bit hash over a block of token IDs.
///
/// When `prefix` is provided it is hashed first using little endian byte order,
/// chaining each block's hash to everything before it.
pub fn compute_hash(token_ids: &[TokenId], prefix: Option<u64>) -> u64 {
    let mut hasher = Xxh64::new(0);
    if let Some(p) = prefix {
        hasher.update(&p.to_le_bytes());
    }
    for id in token_ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.digest()
}

/// A single block of cached tokens.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: BlockId,
    ref_count: usize,
    pinned: usize,
    hash: Option<u64>,
    token_ids: Vec<TokenId>,
}

impl Block {
    fn new(block_id: BlockId) -> Self {
        Self { block_id, ref_count: 0, pinned: 0, hash: None, token_ids: Vec::new() }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned > 0
    }

    fn add_ref(&mut self) -> Result<()> {
        self.ref_count = self.ref_count.checked_add(1).ok_or_else(|| {
            SchedulerError::AllocatorCorruption {
                block_id: self.block_id,
                detail: "reference count overflow".into(),
            }
        })?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.ref_count == 0 {
            return Err(SchedulerError::AllocatorCorruption {
                block_id: self.block_id,
                detail: "release on zero-ref block".into(),
            });
        }
        self.ref_count -= 1;
        Ok(())
    }
}

/// Ordered physical blocks backing one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    /// Chained content hash of each sealed leading block, whether or not the
    /// block itself is the one registered under that hash.
    #[serde(skip)]
    chain: Vec<u64>,
}

impl BlockTable {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Token slots covered by this table.
    pub fn capacity(&self, block_size: usize) -> usize {
        self.blocks.len() * block_size
    }
}

/// Result of a prefix-aware allocation.
#[derive(Debug, Clone)]
pub struct PrefixAllocation {
    pub table: BlockTable,
    /// Leading tokens whose KV already lives in shared blocks.
    pub cached_tokens: usize,
}

/// Block duplication the executor must perform before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockCopy {
    pub src: BlockId,
    pub dst: BlockId,
}

/// Memory manager for KV cache blocks.
#[derive(Debug)]
pub struct BlockManager {
    block_size: usize,
    blocks: Vec<Block>,
    hash_to_block: HashMap<u64, BlockId>,
    free_blocks: VecDeque<BlockId>,
    deferred: HashSet<BlockId>,
    tables: HashMap<RequestId, BlockTable>,
    in_flight: HashMap<u64, Vec<BlockId>>,
}

impl BlockManager {
    /// Create a new manager with the given number of blocks.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        assert!(num_blocks > 0 && block_size > 0);
        Self {
            block_size,
            blocks: (0..num_blocks).map(Block::new).collect(),
            hash_to_block: HashMap::new(),
            free_blocks: (0..num_blocks).collect(),
            deferred: HashSet::new(),
            tables: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    pub fn can_allocate(&self, n_blocks: usize) -> bool {
        self.free_blocks.len() >= n_blocks
    }

    pub fn get_block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn table(&self, seq: RequestId) -> Option<&BlockTable> {
        self.tables.get(&seq)
    }

    pub fn num_blocks_of(&self, seq: RequestId) -> usize {
        self.tables.get(&seq).map_or(0, BlockTable::len)
    }

    fn out_of_memory(&self, requested: usize) -> SchedulerError {
        SchedulerError::OutOfMemory { requested, available: self.free_blocks.len() }
    }

    /// First-fit: hand out the block at the head of the free list.
    fn take_free_block(&mut self) -> Result<BlockId> {
        let block_id = self.free_blocks.pop_front().ok_or_else(|| self.out_of_memory(1))?;
        let block = &mut self.blocks[block_id];
        if block.ref_count != 0 || block.pinned != 0 {
            return Err(SchedulerError::AllocatorCorruption {
                block_id,
                detail: format!("free-list block has ref_count {} pinned {}", block.ref_count, block.pinned),
            });
        }
        block.ref_count = 1;
        block.hash = None;
        block.token_ids.clear();
        Ok(block_id)
    }

    fn release_block(&mut self, block_id: BlockId) -> Result<()> {
        let block = &mut self.blocks[block_id];
        block.release()?;
        if block.ref_count > 0 {
            return Ok(());
        }
        if let Some(h) = block.hash.take() {
            if self.hash_to_block.get(&h) == Some(&block_id) {
                self.hash_to_block.remove(&h);
            }
            block.token_ids.clear();
        }
        if block.pinned > 0 {
            self.deferred.insert(block_id);
        } else {
            self.free_blocks.push_back(block_id);
        }
        Ok(())
    }

    /// Reserve `n_blocks` fresh blocks for a sequence that holds none yet.
    pub fn allocate(&mut self, seq: RequestId, n_blocks: usize) -> Result<BlockTable> {
        if self.tables.get(&seq).is_some_and(|t| !t.is_empty()) {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {seq} already holds a block table"
            )));
        }
        if !self.can_allocate(n_blocks) {
            return Err(self.out_of_memory(n_blocks));
        }
        let mut table = BlockTable::default();
        for _ in 0..n_blocks {
            table.blocks.push(self.take_free_block()?);
        }
        debug!(request_id = seq, blocks = n_blocks, "allocated block table");
        self.tables.insert(seq, table.clone());
        Ok(table)
    }

    /// Allocate a table covering `tokens`, sharing live blocks that hold the
    /// same prefix. The block holding the final token is always private.
    pub fn allocate_prefix(&mut self, seq: RequestId, tokens: &[TokenId]) -> Result<PrefixAllocation> {
        if self.tables.get(&seq).is_some_and(|t| !t.is_empty()) {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {seq} already holds a block table"
            )));
        }
        let needed = self.blocks_needed(tokens.len());
        let shareable = tokens.len().saturating_sub(1) / self.block_size;

        let mut hits = Vec::new();
        let mut chain = Vec::new();
        for chunk in tokens.chunks(self.block_size).take(shareable) {
            let h = compute_hash(chunk, chain.last().copied());
            match self.hash_to_block.get(&h) {
                // a hash match alone is not enough, the content must agree too
                Some(&id) if self.blocks[id].ref_count > 0 && self.blocks[id].token_ids == chunk => hits.push(id),
                _ => break,
            }
            chain.push(h);
        }

        let fresh = needed - hits.len();
        if !self.can_allocate(fresh) {
            return Err(self.out_of_memory(fresh));
        }

        let mut table = BlockTable::default();
        for &id in &hits {
            self.blocks[id].add_ref()?;
            table.blocks.push(id);
        }
        table.chain = chain;
        for _ in 0..fresh {
            table.blocks.push(self.take_free_block()?);
        }

        let cached_tokens = hits.len() * self.block_size;
        debug!(request_id = seq, blocks = needed, shared = hits.len(), "allocated prefix block table");
        self.tables.insert(seq, table.clone());
        Ok(PrefixAllocation { table, cached_tokens })
    }

    /// Append one block to a sequence's table.
    pub fn extend(&mut self, seq: RequestId) -> Result<BlockId> {
        if !self.tables.contains_key(&seq) {
            return Err(SchedulerError::UnknownRequest(seq));
        }
        let id = self.take_free_block()?;
        self.tables.entry(seq).or_default().blocks.push(id);
        Ok(id)
    }

    /// Grow a table so it covers `num_tokens` slots, in one all-or-nothing
    /// step. Returns the number of blocks appended.
    pub fn ensure_capacity(&mut self, seq: RequestId, num_tokens: usize) -> Result<usize> {
        let have = self.tables.get(&seq).ok_or(SchedulerError::UnknownRequest(seq))?.len();
        let want = self.blocks_needed(num_tokens);
        if want <= have {
            return Ok(0);
        }
        let missing = want - have;
        if !self.can_allocate(missing) {
            return Err(self.out_of_memory(missing));
        }
        let mut fresh = Vec::with_capacity(missing);
        for _ in 0..missing {
            fresh.push(self.take_free_block()?);
        }
        self.tables.entry(seq).or_default().blocks.extend(fresh);
        Ok(missing)
    }

    /// Blocks an `ensure_capacity(seq, num_tokens)` call would have to allocate.
    pub fn blocks_missing(&self, seq: RequestId, num_tokens: usize) -> usize {
        self.blocks_needed(num_tokens).saturating_sub(self.num_blocks_of(seq))
    }

    /// Release every block held by `seq`. Freeing an unknown or already freed
    /// sequence is a no-op. Returns how many blocks reached zero references.
    pub fn free(&mut self, seq: RequestId) -> Result<usize> {
        let Some(table) = self.tables.remove(&seq) else {
            return Ok(0);
        };
        let mut released = 0;
        for &id in table.blocks.iter().rev() {
            if let Err(e) = self.release_block(id) {
                error!(request_id = seq, block = id, "allocator corruption while freeing: {e}");
                return Err(e);
            }
            if self.blocks[id].ref_count == 0 {
                released += 1;
            }
        }
        debug!(request_id = seq, blocks = table.len(), released, "freed block table");
        Ok(released)
    }

    /// Give `child` the same blocks as `parent`, sharing them copy-on-write.
    pub fn fork(&mut self, parent: RequestId, child: RequestId) -> Result<BlockTable> {
        if self.tables.contains_key(&child) {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {child} already holds a block table"
            )));
        }
        let table = self.tables.get(&parent).ok_or(SchedulerError::UnknownRequest(parent))?.clone();
        for &id in &table.blocks {
            self.blocks[id].add_ref()?;
        }
        self.tables.insert(child, table.clone());
        Ok(table)
    }

    /// Make the blocks covering token positions `[start, end)` private to
    /// `seq`. Shared blocks in that range are swapped for fresh ones and the
    /// required copies are returned.
    pub fn prepare_write(&mut self, seq: RequestId, start: usize, end: usize) -> Result<Vec<BlockCopy>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let table = self.tables.get(&seq).ok_or(SchedulerError::UnknownRequest(seq))?;
        let last = ((end - 1) / self.block_size).min(table.len().saturating_sub(1));
        let shared: Vec<usize> = (start / self.block_size..=last)
            .filter(|&idx| idx < table.len() && self.blocks[table.blocks[idx]].ref_count > 1)
            .collect();
        if shared.is_empty() {
            return Ok(Vec::new());
        }
        if !self.can_allocate(shared.len()) {
            return Err(self.out_of_memory(shared.len()));
        }

        let mut copies = Vec::with_capacity(shared.len());
        for idx in shared {
            let dst = self.take_free_block()?;
            let table = self.tables.get_mut(&seq).ok_or(SchedulerError::UnknownRequest(seq))?;
            let src = std::mem::replace(&mut table.blocks[idx], dst);
            table.chain.truncate(idx);
            self.blocks[src].release()?;
            copies.push(BlockCopy { src, dst });
        }
        Ok(copies)
    }

    /// Register content hashes for blocks fully covered by the first
    /// `num_computed` tokens, so later requests can share them.
    pub fn seal_full_blocks(&mut self, seq: RequestId, tokens: &[TokenId], num_computed: usize) {
        let Some(table) = self.tables.get_mut(&seq) else {
            return;
        };
        let full = (num_computed.min(tokens.len()) / self.block_size).min(table.blocks.len());
        for idx in table.chain.len()..full {
            let chunk = &tokens[idx * self.block_size..(idx + 1) * self.block_size];
            let h = compute_hash(chunk, table.chain.last().copied());
            let block = &mut self.blocks[table.blocks[idx]];
            if block.hash.is_none() && !self.hash_to_block.contains_key(&h) {
                block.hash = Some(h);
                block.token_ids = chunk.to_vec();
                self.hash_to_block.insert(h, block.block_id);
            }
            table.chain.push(h);
        }
    }

    /// Drop every table, pin and cached hash and return all blocks to the
    /// free list. Used after corruption, once no live request holds blocks.
    pub fn reset(&mut self) {
        let num_blocks = self.blocks.len();
        self.blocks = (0..num_blocks).map(Block::new).collect();
        self.free_blocks = (0..num_blocks).collect();
        self.hash_to_block.clear();
        self.deferred.clear();
        self.tables.clear();
        self.in_flight.clear();
    }

    /// Pin the blocks of `seqs` for an in-flight batch.
    pub fn mark_in_use(&mut self, batch_id: u64, seqs: &[RequestId]) {
        let pinned: Vec<BlockId> = seqs
            .iter()
            .filter_map(|s| self.tables.get(s))
            .flat_map(|t| t.blocks.iter().copied())
            .collect();
        for &id in &pinned {
            self.blocks[id].pinned += 1;
        }
        self.in_flight.entry(batch_id).or_default().extend(pinned);
    }

    /// Drop the pins of a completed batch. Returns blocks moved to the free list.
    pub fn release_batch(&mut self, batch_id: u64) -> Result<usize> {
        let pinned = self.in_flight.remove(&batch_id).ok_or(SchedulerError::UnknownBatch(batch_id))?;
        let mut returned = 0;
        for id in pinned {
            let block = &mut self.blocks[id];
            if block.pinned == 0 {
                return Err(SchedulerError::AllocatorCorruption {
                    block_id: id,
                    detail: "unpin on block without pins".into(),
                });
            }
            block.pinned -= 1;
            if block.pinned == 0 && block.ref_count == 0 && self.deferred.remove(&id) {
                self.free_blocks.push_back(id);
                returned += 1;
            }
        }
        Ok(returned)
    }

    /// Blocks that freeing `seq` would return to the free list right away.
    pub fn reclaimable_blocks(&self, seq: RequestId) -> usize {
        self.tables.get(&seq).map_or(0, |t| {
            t.blocks
                .iter()
                .filter(|&&id| self.blocks[id].ref_count == 1 && self.blocks[id].pinned == 0)
                .count()
        })
    }

    /// Cross-check every block's reference count against the live tables.
    pub fn audit(&self) -> Result<()> {
        let mut expected = vec![0usize; self.blocks.len()];
        for table in self.tables.values() {
            for &id in &table.blocks {
                expected[id] += 1;
            }
        }
        for (block, &want) in self.blocks.iter().zip(&expected) {
            if block.ref_count != want {
                return Err(SchedulerError::AllocatorCorruption {
                    block_id: block.block_id,
                    detail: format!("ref_count {} but {} tables hold it", block.ref_count, want),
                });
            }
        }
        let idle = self.free_blocks.len() + self.deferred.len();
        let used = expected.iter().filter(|&&n| n > 0).count();
        if idle + used != self.blocks.len() {
            return Err(SchedulerError::AllocatorCorruption {
                block_id: 0,
                detail: format!("{idle} idle + {used} used != {} total", self.blocks.len()),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn bump_ref_count(&mut self, block_id: BlockId) {
        self.blocks[block_id].ref_count += 1;
    }

    pub fn get_stats(&self) -> BlockManagerStats {
        BlockManagerStats {
            total_blocks: self.blocks.len(),
            free_blocks: self.free_blocks.len(),
            deferred_blocks: self.deferred.len(),
            used_blocks: self.blocks.iter().filter(|b| b.ref_count > 0).count(),
            cached_blocks: self.hash_to_block.len(),
            block_size: self.block_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockManagerStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub deferred_blocks: usize,
    pub used_blocks: usize,
    pub cached_blocks: usize,
    pub block_size: usize,
}

impl BlockManagerStats {
    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 { 0.0 } else { self.used_blocks as f64 / self.total_blocks as f64 * 100.0 }
    }
}
