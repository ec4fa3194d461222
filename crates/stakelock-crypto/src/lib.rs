pub mod hash;
pub mod merkle;

pub use hash::keccak256;
pub use merkle::{claim_leaf, hash_pair, verify_proof, MerkleTree};
