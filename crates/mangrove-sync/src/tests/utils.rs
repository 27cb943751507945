//! Shared fixtures: deterministic blocks whose hashes are real, so `import`
//! can recompute them.

use std::collections::HashMap;
use std::ops::Range;

use bitcoin::block::Header;
use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::TxMerkleNode;

/// A batch of distinct blocks keyed both ways, standing in for the output
/// of header sync.
#[derive(Debug, Clone)]
pub struct Run {
    pub hashes: Vec<(BlockHash, u32)>,
    pub blocks: HashMap<BlockHash, Block>,
}

/// Builds a block that is unique per height. Nothing validates here, the
/// scheduler only cares that hashes are distinct and recomputable.
pub fn build_block(height: u32) -> Block {
    let header = Header {
        version: Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: height,
        bits: CompactTarget::from_consensus(0x1d00_ffff),
        nonce: height,
    };

    Block {
        header,
        txdata: Vec::new(),
    }
}

/// One block per height in the range.
pub fn build_run(heights: Range<u32>) -> Run {
    let mut hashes = Vec::new();
    let mut blocks = HashMap::new();

    for height in heights {
        let block = build_block(height);
        hashes.push((block.block_hash(), height));
        blocks.insert(block.block_hash(), block);
    }

    Run { hashes, blocks }
}
