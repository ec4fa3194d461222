use sled::Transactional;
use tracing::debug;

use stakelock_core::error::StakeError;
use stakelock_core::ledger::{AssetLedger, MintAuthority, ShareLedger};
use stakelock_core::types::{AccountId, Balance, TokenId};

use crate::db::{abort, decode_u128, from_tx, storage};

/// Token ledger stored in the shared state database.
///
/// One handle per token; handles are cheap to clone and all clones see the
/// same balances. Serves both as a fungible asset and, once a minter has
/// been granted, as a share ledger.
#[derive(Clone)]
pub struct SledTokenLedger {
    token: TokenId,
    balances: sled::Tree,
    allowances: sled::Tree,
    meta: sled::Tree,
}

impl SledTokenLedger {
    pub(crate) fn new(
        token: TokenId,
        balances: sled::Tree,
        allowances: sled::Tree,
        meta: sled::Tree,
    ) -> Self {
        Self { token, balances, allowances, meta }
    }

    fn prefix(&self) -> Vec<u8> {
        let mut key = self.token.as_str().as_bytes().to_vec();
        key.push(0);
        key
    }

    fn balance_key(&self, who: &AccountId) -> Vec<u8> {
        let mut key = self.prefix();
        key.extend_from_slice(who.as_bytes());
        key
    }

    fn allowance_key(&self, owner: &AccountId, spender: &AccountId) -> Vec<u8> {
        let mut key = self.balance_key(owner);
        key.extend_from_slice(spender.as_bytes());
        key
    }

    fn supply_key(&self) -> String {
        format!("supply:{}", self.token)
    }

    fn minter_key(&self) -> String {
        format!("minter:{}", self.token)
    }

    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Result<Balance, StakeError> {
        decode_u128(self.allowances.get(self.allowance_key(owner, spender)).map_err(storage)?)
    }

    /// Set the amount `spender` may move out of `owner`'s balance.
    pub fn approve(&self, owner: &AccountId, spender: &AccountId, amount: Balance) -> Result<(), StakeError> {
        self.allowances
            .insert(self.allowance_key(owner, spender), &amount.to_be_bytes()[..])
            .map_err(storage)?;
        debug!(token = %self.token, %owner, %spender, amount, "approve");
        Ok(())
    }

    /// Create `amount` new units for `to`. Used to seed deposit and reward
    /// tokens. Refused once a minter has been granted: share tokens are only
    /// created through `ShareLedger::mint`.
    pub fn credit(&self, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
        if self.has_minter()? {
            return Err(StakeError::AuthorityMismatch(self.token.to_string()));
        }
        self.add_supply(to, amount)
    }

    /// Hand out the one and only minting capability for this token. The
    /// secret goes to the caller; only its digest is stored.
    pub fn grant_mint_authority(&self, holder: &AccountId) -> Result<MintAuthority, StakeError> {
        let supply = ShareLedger::total_supply(self)?;
        if supply > 0 {
            return Err(StakeError::InvalidConfig(format!(
                "token {} already has {supply} units outstanding",
                self.token
            )));
        }
        let authority = MintAuthority::issue(self.token.clone(), holder.clone(), rand::random());
        let mut record = holder.as_bytes().to_vec();
        record.extend_from_slice(&authority.digest());
        self.meta
            .compare_and_swap(self.minter_key().as_bytes(), None as Option<&[u8]>, Some(record))
            .map_err(storage)?
            .map_err(|_| StakeError::AlreadyInitialized)?;
        debug!(token = %self.token, %holder, "mint authority granted");
        Ok(authority)
    }

    fn has_minter(&self) -> Result<bool, StakeError> {
        self.meta.contains_key(self.minter_key().as_bytes()).map_err(storage)
    }

    fn add_supply(&self, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
        let key = self.balance_key(to);
        let supply_key = self.supply_key();
        (&self.balances, &self.meta)
            .transaction(|(balances, meta)| {
                let bal = match decode_u128(balances.get(&key)?) {
                    Ok(b) => b,
                    Err(e) => return abort(e),
                };
                let supply = match decode_u128(meta.get(supply_key.as_bytes())?) {
                    Ok(s) => s,
                    Err(e) => return abort(e),
                };
                let (Some(bal), Some(supply)) = (bal.checked_add(amount), supply.checked_add(amount)) else {
                    return abort(StakeError::Overflow);
                };
                balances.insert(key.as_slice(), &bal.to_be_bytes()[..])?;
                meta.insert(supply_key.as_bytes(), &supply.to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(from_tx)
    }

    fn remove_supply(&self, from: &AccountId, amount: Balance) -> Result<(), StakeError> {
        let key = self.balance_key(from);
        let supply_key = self.supply_key();
        (&self.balances, &self.meta)
            .transaction(|(balances, meta)| {
                let bal = match decode_u128(balances.get(&key)?) {
                    Ok(b) => b,
                    Err(e) => return abort(e),
                };
                if bal < amount {
                    return abort(StakeError::InsufficientBalance { need: amount, have: bal });
                }
                let supply = match decode_u128(meta.get(supply_key.as_bytes())?) {
                    Ok(s) => s,
                    Err(e) => return abort(e),
                };
                balances.insert(key.as_slice(), &(bal - amount).to_be_bytes()[..])?;
                meta.insert(supply_key.as_bytes(), &supply.saturating_sub(amount).to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(from_tx)
    }

    fn move_balance(
        &self,
        spender: Option<&AccountId>,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), StakeError> {
        if self.has_minter()? {
            return Err(StakeError::NonTransferable(self.token.to_string()));
        }
        let from_key = self.balance_key(from);
        let to_key = self.balance_key(to);
        let allowance_key = spender.map(|s| self.allowance_key(from, s));
        (&self.balances, &self.allowances)
            .transaction(|(balances, allowances)| {
                if let Some(akey) = &allowance_key {
                    let allowed = match decode_u128(allowances.get(akey)?) {
                        Ok(a) => a,
                        Err(e) => return abort(e),
                    };
                    if allowed < amount {
                        return abort(StakeError::InsufficientAllowance { need: amount, have: allowed });
                    }
                    allowances.insert(akey.as_slice(), &(allowed - amount).to_be_bytes()[..])?;
                }

                let from_bal = match decode_u128(balances.get(&from_key)?) {
                    Ok(b) => b,
                    Err(e) => return abort(e),
                };
                if from_bal < amount {
                    return abort(StakeError::InsufficientBalance { need: amount, have: from_bal });
                }
                balances.insert(from_key.as_slice(), &(from_bal - amount).to_be_bytes()[..])?;

                let to_bal = match decode_u128(balances.get(&to_key)?) {
                    Ok(b) => b,
                    Err(e) => return abort(e),
                };
                let Some(to_bal) = to_bal.checked_add(amount) else {
                    return abort(StakeError::Overflow);
                };
                balances.insert(to_key.as_slice(), &to_bal.to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(from_tx)?;
        debug!(token = %self.token, %from, %to, amount, "transfer");
        Ok(())
    }
}

impl AssetLedger for SledTokenLedger {
    fn token(&self) -> &TokenId {
        &self.token
    }

    fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError> {
        decode_u128(self.balances.get(self.balance_key(who)).map_err(storage)?)
    }

    fn transfer(&self, from: &AccountId, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
        self.move_balance(None, from, to, amount)
    }

    fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), StakeError> {
        self.move_balance(Some(spender), from, to, amount)
    }
}

impl ShareLedger for SledTokenLedger {
    fn token(&self) -> &TokenId {
        &self.token
    }

    fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError> {
        AssetLedger::balance_of(self, who)
    }

    fn total_supply(&self) -> Result<Balance, StakeError> {
        decode_u128(self.meta.get(self.supply_key().as_bytes()).map_err(storage)?)
    }

    fn check_authority(&self, authority: &MintAuthority) -> Result<(), StakeError> {
        let record = self.meta.get(self.minter_key().as_bytes()).map_err(storage)?;
        let mut expected = authority.holder().as_bytes().to_vec();
        expected.extend_from_slice(&authority.digest());
        if authority.token() == &self.token && record.as_deref() == Some(expected.as_slice()) {
            Ok(())
        } else {
            Err(StakeError::AuthorityMismatch(self.token.to_string()))
        }
    }

    fn mint(&self, authority: &MintAuthority, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
        self.check_authority(authority)?;
        self.add_supply(to, amount)
    }

    fn burn(&self, authority: &MintAuthority, from: &AccountId, amount: Balance) -> Result<(), StakeError> {
        self.check_authority(authority)?;
        self.remove_supply(from, amount)
    }
}
