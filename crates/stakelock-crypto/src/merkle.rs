//! Merkle commitments over reward allocations.
//!
//! Leaf:  keccak256(be32(account_index) ‖ account ‖ be32(amount) ‖ be32(window_index))
//! Node:  keccak256(min(a, b) ‖ max(a, b))
//!
//! Sorting each pair makes proofs position-free. An unpaired node is
//! promoted to the next level unchanged, so proofs may be shorter than the
//! tree height.

use stakelock_core::types::{AccountId, Balance, Hash32, WindowIndex};

use crate::hash::{be_word, keccak256};

/// Canonical leaf for one allocation.
pub fn claim_leaf(
    account_index: u64,
    account: &AccountId,
    amount: Balance,
    window_index: WindowIndex,
) -> Hash32 {
    let mut data = [0u8; 128];
    data[..32].copy_from_slice(&be_word(account_index as u128));
    data[32..64].copy_from_slice(account.as_bytes());
    data[64..96].copy_from_slice(&be_word(amount));
    data[96..].copy_from_slice(&be_word(window_index as u128));
    keccak256(&data)
}

pub fn hash_pair(a: &Hash32, b: &Hash32) -> Hash32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&lo.0);
    data[32..].copy_from_slice(&hi.0);
    keccak256(&data)
}

/// Fold `proof` onto `leaf` and compare with `root`.
pub fn verify_proof(proof: &[Hash32], root: &Hash32, leaf: &Hash32) -> bool {
    let computed = proof.iter().fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
    computed == *root
}

/// Full tree, kept level by level so proofs can be read off directly.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    /// Build from leaves in allocation order. An empty tree has a zero root.
    pub fn from_leaves(leaves: Vec<Hash32>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let current = &levels[levels.len() - 1];
            let next: Vec<Hash32> = current
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    [a] => *a,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn root(&self) -> Hash32 {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash32::ZERO)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Sibling path for the leaf at `index`, bottom-up.
    pub fn proof(&self, index: usize) -> Option<Vec<Hash32>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut proof = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if let Some(h) = level.get(sibling) {
                proof.push(*h);
            }
            idx /= 2;
        }
        Some(proof)
    }
}
