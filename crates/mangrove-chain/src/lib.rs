// SPDX-License-Identifier: MIT

//! The chain-store contract consumed by the block download scheduler.
//!
//! The scheduler doesn't care how blocks are validated or persisted, it only
//! needs a sink that either accepts a block at a height or rejects it
//! deterministically. [`UpdatableChain`] is that sink. [`MemoryChain`] is an
//! in-memory implementation, mostly useful for tests and simulations.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::Block;
use bitcoin::BlockHash;
use spin::RwLock;
use thiserror::Error;

/// Errors a chain store may report when a block is pushed into it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    #[error("a different block is already stored at height {0}")]
    Occupied(u32),
}

/// A sink for downloaded blocks.
///
/// `update` returns whether the block was persisted at the requested height.
/// Rejections must be deterministic: retrying the same block at the same
/// height yields the same answer, so callers may treat `false` as final.
pub trait UpdatableChain {
    fn update(&self, block: &Block, height: u32) -> bool;
}

impl<Chain: UpdatableChain> UpdatableChain for Arc<Chain> {
    fn update(&self, block: &Block, height: u32) -> bool {
        (**self).update(block, height)
    }
}

/// An in-memory block store, indexed by height.
///
/// Accepts blocks at any height in any order, which is what a parallel
/// download produces. Re-inserting the block already stored at a height is
/// accepted, a conflicting block for an occupied height is rejected.
#[derive(Debug, Default)]
pub struct MemoryChain {
    blocks: RwLock<BTreeMap<u32, Block>>,
}

impl MemoryChain {
    pub fn new() -> MemoryChain {
        MemoryChain::default()
    }

    /// Stores `block` at `height`, rejecting conflicts with what's there.
    pub fn push(&self, block: Block, height: u32) -> Result<(), ChainError> {
        let mut blocks = self.blocks.write();

        match blocks.get(&height) {
            Some(stored) if stored.block_hash() != block.block_hash() => {
                Err(ChainError::Occupied(height))
            }
            _ => {
                blocks.insert(height, block);
                Ok(())
            }
        }
    }

    pub fn get_block(&self, height: u32) -> Option<Block> {
        self.blocks.read().get(&height).cloned()
    }

    pub fn get_block_hash(&self, height: u32) -> Option<BlockHash> {
        self.blocks.read().get(&height).map(|block| block.block_hash())
    }

    /// How many blocks the store holds.
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// The highest stored height, if any.
    pub fn tip(&self) -> Option<u32> {
        self.blocks.read().last_key_value().map(|(height, _)| *height)
    }
}

impl UpdatableChain for MemoryChain {
    fn update(&self, block: &Block, height: u32) -> bool {
        self.push(block.clone(), height).is_ok()
    }
}
