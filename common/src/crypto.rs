//! Common cryptography helper functions for Stoa

use crate::hash::Hash;
use blake2::{digest::consts::U32, Blake2b, Digest};

/// Get a Blake2b-256 hash of some data
pub fn blake2b_256(data: &[u8]) -> Hash<32> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    finish(hasher)
}

/// Blake2b-256 over the concatenation of two hashes
pub fn blake2b_256_pair(left: &Hash<32>, right: &Hash<32>) -> Hash<32> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(left.as_ref());
    hasher.update(right.as_ref());
    finish(hasher)
}

fn finish(hasher: Blake2b<U32>) -> Hash<32> {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_hash_matches_concatenation() {
        let a = blake2b_256(b"a");
        let b = blake2b_256(b"b");
        let mut joined = a.to_vec();
        joined.extend_from_slice(b.as_ref());
        assert_eq!(blake2b_256_pair(&a, &b), blake2b_256(&joined));
    }

    #[test]
    fn empty_input_is_not_zero_hash() {
        assert!(!blake2b_256(&[]).is_zero());
    }
}
