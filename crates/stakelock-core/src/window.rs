use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Balance, Hash32, Timestamp, TokenId, WindowIndex};

/// One published round of reward allocation. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub index: WindowIndex,
    pub merkle_root: Hash32,
    pub total_allocated: Balance,
    pub reward_token: TokenId,
    /// Opaque pointer to the off-ledger allocation list (e.g. an IPFS hash).
    pub metadata: String,
    pub published_at: Timestamp,
}

/// A recipient's claim against one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub window_index: WindowIndex,
    pub amount: Balance,
    pub account_index: u64,
    pub account: AccountId,
    pub merkle_proof: Vec<Hash32>,
}
