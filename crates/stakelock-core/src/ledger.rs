//! Seams to the external token ledgers.
//!
//! The staking core moves funds only through these traits. Implementations
//! use interior mutability so a ledger handle can be shared between the
//! component that owns custody and whoever funds it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StakeError;
use crate::types::{AccountId, Balance, TokenId};

/// Fungible asset ledger (deposit token, reward tokens).
pub trait AssetLedger {
    fn token(&self) -> &TokenId;

    fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError>;

    /// Move `amount` out of `from`'s own balance.
    fn transfer(&self, from: &AccountId, to: &AccountId, amount: Balance)
        -> Result<(), StakeError>;

    /// Move `amount` from `from` to `to` on the strength of an allowance
    /// `from` granted to `spender`.
    fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), StakeError>;
}

/// Non-transferable share ledger. Minting and burning require the
/// capability handed out once by the ledger itself.
pub trait ShareLedger {
    fn token(&self) -> &TokenId;

    fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError>;

    fn total_supply(&self) -> Result<Balance, StakeError>;

    /// Fails unless `authority` is the capability this ledger granted.
    fn check_authority(&self, authority: &MintAuthority) -> Result<(), StakeError>;

    fn mint(&self, authority: &MintAuthority, to: &AccountId, amount: Balance)
        -> Result<(), StakeError>;

    fn burn(&self, authority: &MintAuthority, from: &AccountId, amount: Balance)
        -> Result<(), StakeError>;
}

/// Capability to mint and burn one share token.
///
/// Not `Clone`: whoever holds it is the single minter. The granting ledger
/// keeps only `digest()` of the secret, so an authority cannot be rebuilt
/// from the token and holder alone. Serializable so the holder can keep it
/// in a keyfile between runs.
#[derive(PartialEq, Eq, Serialize, Deserialize)]
pub struct MintAuthority {
    token: TokenId,
    holder: AccountId,
    secret: [u8; 32],
}

impl MintAuthority {
    /// Called by a share ledger implementation when it grants minting rights.
    pub fn issue(token: TokenId, holder: AccountId, secret: [u8; 32]) -> Self {
        Self { token, holder, secret }
    }

    pub fn token(&self) -> &TokenId {
        &self.token
    }

    pub fn holder(&self) -> &AccountId {
        &self.holder
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// BLAKE3 of the secret; what the granting ledger stores.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.secret).as_bytes()
    }
}

impl fmt::Debug for MintAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MintAuthority")
            .field("token", &self.token)
            .field("holder", &self.holder)
            .field("secret", &"<redacted>")
            .finish()
    }
}
