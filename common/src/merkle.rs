//! Merkle root over a block's transaction ids.

use crate::crypto::blake2b_256_pair;
use crate::hash::{Hash, TxHash};

/// Compute the Merkle root of an ordered list of transaction ids.
///
/// Each level hashes `left || right` pairs; an odd trailing node is paired
/// with itself. The root of an empty list is the all-zero hash.
pub fn merkle_root(ids: &[TxHash]) -> Hash<32> {
    if ids.is_empty() {
        return Hash::zero();
    }

    // A lone leaf is paired with itself too
    let mut level: Vec<Hash<32>> = ids.to_vec();
    loop {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => blake2b_256_pair(left, right),
                [single] => blake2b_256_pair(single, single),
                _ => unreachable!(),
            })
            .collect();
        if level.len() == 1 {
            return level[0];
        }
    }
}
