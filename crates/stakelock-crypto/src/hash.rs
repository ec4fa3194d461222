use sha3::{Digest, Keccak256};
use stakelock_core::types::Hash32;

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> Hash32 {
    Hash32(Keccak256::digest(data).into())
}

/// Left-pad an unsigned integer to a 32-byte big-endian word.
pub fn be_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}
