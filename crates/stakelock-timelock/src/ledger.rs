use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use stakelock_core::config::LockLedgerConfig;
use stakelock_core::error::StakeError;
use stakelock_core::ledger::{AssetLedger, MintAuthority, ShareLedger};
use stakelock_core::lock::Lock;
use stakelock_core::types::{AccountId, Balance, LockId, Seconds, Timestamp};
use stakelock_state::StateDb;

use crate::multiplier::{multiplier, shares_for};
use crate::query::{LockPage, LockQuery};

/// Meta key holding the current `LockLedgerConfig`.
pub const LOCK_LEDGER_CONFIG_KEY: &str = "lock_ledger_config";

/// Snapshot of one account's position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingData {
    pub account: AccountId,
    pub share_balance: Balance,
    pub deposit_balance: Balance,
    pub locks: LockPage,
}

/// The lock ledger.
///
/// Holds deposits in the custody account, mints duration-scaled shares and
/// releases principal once a lock has matured. Every mutating call takes
/// `&mut self` and either completes or leaves storage and both token
/// ledgers as they were.
pub struct LockLedger<A: AssetLedger, S: ShareLedger> {
    db: Arc<StateDb>,
    deposit_token: A,
    shares: S,
    authority: MintAuthority,
    config: LockLedgerConfig,
}

impl<A: AssetLedger, S: ShareLedger> LockLedger<A, S> {
    /// One-time setup: binds the ledgers and stores the initial config.
    pub fn initialize(
        db: Arc<StateDb>,
        config: LockLedgerConfig,
        deposit_token: A,
        shares: S,
        authority: MintAuthority,
    ) -> Result<Self, StakeError> {
        config.validate()?;
        Self::check_bindings(&config, &deposit_token, &shares, &authority)?;
        db.init_meta(LOCK_LEDGER_CONFIG_KEY, &config)?;
        info!(
            admin = %config.admin,
            custody = %config.custody,
            min_lock = config.multiplier.min_lock_duration,
            max_lock = config.multiplier.max_lock_duration,
            "lock ledger initialized"
        );
        Ok(Self { db, deposit_token, shares, authority, config })
    }

    /// Reopen a ledger previously set up with `initialize`.
    pub fn open(
        db: Arc<StateDb>,
        deposit_token: A,
        shares: S,
        authority: MintAuthority,
    ) -> Result<Self, StakeError> {
        let config: LockLedgerConfig = db
            .get_meta(LOCK_LEDGER_CONFIG_KEY)?
            .ok_or(StakeError::NotInitialized)?;
        Self::check_bindings(&config, &deposit_token, &shares, &authority)?;
        Ok(Self { db, deposit_token, shares, authority, config })
    }

    fn check_bindings(
        config: &LockLedgerConfig,
        deposit_token: &A,
        shares: &S,
        authority: &MintAuthority,
    ) -> Result<(), StakeError> {
        if deposit_token.token() != &config.deposit_token {
            return Err(StakeError::InvalidConfig(format!(
                "deposit ledger is {}, config expects {}",
                deposit_token.token(),
                config.deposit_token
            )));
        }
        if shares.token() != &config.share_token {
            return Err(StakeError::InvalidConfig(format!(
                "share ledger is {}, config expects {}",
                shares.token(),
                config.share_token
            )));
        }
        if authority.token() != &config.share_token {
            return Err(StakeError::AuthorityMismatch(config.share_token.to_string()));
        }
        shares.check_authority(authority)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &LockLedgerConfig {
        &self.config
    }

    pub fn deposit_ledger(&self) -> &A {
        &self.deposit_token
    }

    pub fn share_ledger(&self) -> &S {
        &self.shares
    }

    pub fn query(&self) -> LockQuery<'_> {
        LockQuery::new(&self.db)
    }

    /// Current ratio for a lock of `duration` seconds.
    pub fn multiplier(&self, duration: Seconds) -> Result<u128, StakeError> {
        multiplier(duration, &self.config.multiplier)
    }

    pub fn locks_length(&self) -> Result<u64, StakeError> {
        self.db.lock_count()
    }

    pub fn lock(&self, id: LockId) -> Result<Lock, StakeError> {
        self.query().get(id)
    }

    pub fn locks_page(&self, offset: LockId, limit: usize) -> Result<LockPage, StakeError> {
        self.query().page(offset, limit)
    }

    /// Active locks owned by `owner` within one page of slots.
    pub fn locks_of(&self, owner: &AccountId, offset: LockId, limit: usize) -> Result<LockPage, StakeError> {
        self.query().page_of(owner, offset, limit)
    }

    pub fn staking_data(
        &self,
        account: &AccountId,
        offset: LockId,
        limit: usize,
    ) -> Result<StakingData, StakeError> {
        Ok(StakingData {
            account: account.clone(),
            share_balance: self.shares.balance_of(account)?,
            deposit_balance: self.deposit_token.balance_of(account)?,
            locks: self.locks_of(account, offset, limit)?,
        })
    }

    // ── Deposit ──────────────────────────────────────────────────────────────

    /// Lock `amount` for `duration` seconds and mint scaled shares to
    /// `recipient`. Returns the new lock id.
    pub fn deposit(
        &mut self,
        caller: &AccountId,
        amount: Balance,
        duration: Seconds,
        recipient: &AccountId,
        now: Timestamp,
    ) -> Result<LockId, StakeError> {
        if amount == 0 {
            return Err(StakeError::InvalidAmount("amount must be greater than zero".into()));
        }
        let min = self.config.multiplier.min_deposit_amount;
        if amount < min {
            return Err(StakeError::InvalidAmount(format!("amount {amount} below minimum {min}")));
        }
        let ratio = self.multiplier(duration)?;
        let shares = shares_for(amount, ratio)?;
        let custody = &self.config.custody;

        self.deposit_token
            .transfer_from(custody, caller, custody, amount)
            .map_err(|e| StakeError::TransferFailed(e.to_string()))?;

        if let Err(e) = self.shares.mint(&self.authority, recipient, shares) {
            self.refund(caller, amount);
            return Err(e);
        }

        let lock = Lock {
            amount,
            locked_at: now,
            lock_duration: duration,
            owner: caller.clone(),
            shares,
            share_holder: recipient.clone(),
        };
        let id = match self.db.append_lock(&lock) {
            Ok(id) => id,
            Err(e) => {
                if let Err(burn_err) = self.shares.burn(&self.authority, recipient, shares) {
                    error!(%recipient, shares, error = %burn_err, "could not unwind share mint");
                }
                self.refund(caller, amount);
                return Err(e);
            }
        };

        info!(lock_id = id, owner = %caller, %recipient, amount, duration, shares, "deposit");
        Ok(id)
    }

    /// `deposit` with the duration given in whole months.
    pub fn deposit_by_months(
        &mut self,
        caller: &AccountId,
        amount: Balance,
        months: u32,
        recipient: &AccountId,
        now: Timestamp,
    ) -> Result<LockId, StakeError> {
        let duration = (months as u64)
            .checked_mul(self.config.seconds_per_month)
            .ok_or(StakeError::Overflow)?;
        self.deposit(caller, amount, duration, recipient, now)
    }

    fn refund(&self, to: &AccountId, amount: Balance) {
        if let Err(e) = self.deposit_token.transfer(&self.config.custody, to, amount) {
            error!(%to, amount, error = %e, "could not refund deposit");
        }
    }

    // ── Withdraw / eject ─────────────────────────────────────────────────────

    fn active_lock(&self, id: LockId) -> Result<Lock, StakeError> {
        let lock = self.lock(id)?;
        if !lock.is_active() {
            return Err(StakeError::LockWithdrawn(id));
        }
        Ok(lock)
    }

    /// Release a matured lock back to its owner.
    pub fn withdraw(&mut self, caller: &AccountId, id: LockId, now: Timestamp) -> Result<(), StakeError> {
        let lock = self.active_lock(id)?;
        if &lock.owner != caller {
            return Err(StakeError::NotOwner);
        }
        if !lock.is_matured(now) {
            return Err(StakeError::NotExpired { unlock_at: lock.unlock_at() });
        }
        self.release(id, &lock)?;
        info!(lock_id = id, owner = %lock.owner, amount = lock.amount, shares = lock.shares, "withdraw");
        Ok(())
    }

    /// Admin release of matured locks on their owners' behalf. Each lock must
    /// have matured at least `eject_buffer` seconds ago. All ids, share
    /// balances and custody funds are checked before any lock is released,
    /// and a failure part way through puts back the locks already released.
    pub fn eject(&mut self, caller: &AccountId, ids: &[LockId], now: Timestamp) -> Result<Vec<LockId>, StakeError> {
        self.require_admin(caller)?;
        let buffer = i64::try_from(self.config.eject_buffer).map_err(|_| StakeError::Overflow)?;

        let mut seen = BTreeSet::new();
        let mut staged = Vec::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let lock = self.active_lock(id)?;
            let ejectable_at = lock.unlock_at().saturating_add(buffer);
            if now < ejectable_at {
                return Err(StakeError::NotExpired { unlock_at: ejectable_at });
            }
            staged.push((id, lock));
        }
        self.check_release_funds(&staged)?;

        for (n, (id, lock)) in staged.iter().enumerate() {
            if let Err(e) = self.release(*id, lock) {
                warn!(lock_id = id, released = n, error = %e, "eject failed, rolling back batch");
                for (done_id, done) in staged[..n].iter().rev() {
                    self.unrelease(*done_id, done);
                }
                return Err(e);
            }
        }
        for (id, lock) in &staged {
            info!(lock_id = id, owner = %lock.owner, amount = lock.amount, "eject");
        }
        Ok(staged.into_iter().map(|(id, _)| id).collect())
    }

    /// Every share holder must cover its burns and custody must cover the
    /// principal of the whole batch.
    fn check_release_funds(&self, staged: &[(LockId, Lock)]) -> Result<(), StakeError> {
        let mut burns: BTreeMap<&AccountId, Balance> = BTreeMap::new();
        let mut principal: Balance = 0;
        for (_, lock) in staged {
            let owed = burns.entry(&lock.share_holder).or_default();
            *owed = owed.checked_add(lock.shares).ok_or(StakeError::Overflow)?;
            principal = principal.checked_add(lock.amount).ok_or(StakeError::Overflow)?;
        }
        for (holder, need) in burns {
            let have = self.shares.balance_of(holder)?;
            if have < need {
                return Err(StakeError::InsufficientBalance { need, have });
            }
        }
        let held = self.deposit_token.balance_of(&self.config.custody)?;
        if held < principal {
            let short = StakeError::InsufficientBalance { need: principal, have: held };
            return Err(StakeError::TransferFailed(short.to_string()));
        }
        Ok(())
    }

    /// Clear the slot, burn the recorded shares, return principal. Undoes the
    /// earlier steps if a later one fails.
    fn release(&self, id: LockId, lock: &Lock) -> Result<(), StakeError> {
        self.db.put_lock(id, &Lock::cleared())?;

        if let Err(e) = self.shares.burn(&self.authority, &lock.share_holder, lock.shares) {
            self.restore(id, lock);
            return Err(e);
        }

        if let Err(e) = self.deposit_token.transfer(&self.config.custody, &lock.owner, lock.amount) {
            if let Err(mint_err) = self.shares.mint(&self.authority, &lock.share_holder, lock.shares) {
                error!(lock_id = id, error = %mint_err, "could not restore burned shares");
            }
            self.restore(id, lock);
            return Err(StakeError::TransferFailed(e.to_string()));
        }
        Ok(())
    }

    /// Reverse a completed `release`.
    fn unrelease(&self, id: LockId, lock: &Lock) {
        if let Err(e) = self.deposit_token.transfer(&lock.owner, &self.config.custody, lock.amount) {
            error!(lock_id = id, owner = %lock.owner, error = %e, "could not reclaim released principal");
        }
        if let Err(e) = self.shares.mint(&self.authority, &lock.share_holder, lock.shares) {
            error!(lock_id = id, error = %e, "could not restore burned shares");
        }
        self.restore(id, lock);
    }

    fn restore(&self, id: LockId, lock: &Lock) {
        if let Err(e) = self.db.put_lock(id, lock) {
            error!(lock_id = id, error = %e, "could not restore lock slot");
        }
    }

    // ── Boost ────────────────────────────────────────────────────────────────

    /// Re-lock at the maximum duration from `now`, topping shares up to the
    /// full 1.0 ratio. Returns the number of shares minted.
    pub fn boost_to_max(&mut self, caller: &AccountId, id: LockId, now: Timestamp) -> Result<Balance, StakeError> {
        let lock = self.active_lock(id)?;
        if &lock.owner != caller {
            return Err(StakeError::NotOwner);
        }
        let max = self.config.multiplier.max_lock_duration;
        let target = shares_for(lock.amount, self.multiplier(max)?)?;
        let extra = target.saturating_sub(lock.shares);

        let boosted = Lock {
            locked_at: now,
            lock_duration: max,
            shares: lock.shares + extra,
            ..lock.clone()
        };
        self.db.put_lock(id, &boosted)?;
        if extra > 0 {
            if let Err(e) = self.shares.mint(&self.authority, &lock.share_holder, extra) {
                self.restore(id, &lock);
                return Err(e);
            }
        }
        info!(lock_id = id, owner = %caller, extra, "boost to max");
        Ok(extra)
    }

    // ── Administration ───────────────────────────────────────────────────────

    fn require_admin(&self, caller: &AccountId) -> Result<(), StakeError> {
        if caller != &self.config.admin {
            warn!(%caller, "rejected admin call");
            return Err(StakeError::Unauthorized);
        }
        Ok(())
    }

    fn update_config<F>(&mut self, caller: &AccountId, update: F) -> Result<(), StakeError>
    where
        F: FnOnce(&mut LockLedgerConfig),
    {
        self.require_admin(caller)?;
        let next = self.config.next_version(update)?;
        self.db.put_meta(LOCK_LEDGER_CONFIG_KEY, &next)?;
        info!(version = next.version, "lock ledger config updated");
        self.config = next;
        Ok(())
    }

    pub fn set_min_lock_amount(&mut self, caller: &AccountId, amount: Balance) -> Result<(), StakeError> {
        self.update_config(caller, |c| c.multiplier.min_deposit_amount = amount)
    }

    pub fn set_min_lock_duration(&mut self, caller: &AccountId, secs: Seconds) -> Result<(), StakeError> {
        self.update_config(caller, |c| c.multiplier.min_lock_duration = secs)
    }

    pub fn set_max_lock_duration(&mut self, caller: &AccountId, secs: Seconds) -> Result<(), StakeError> {
        self.update_config(caller, |c| c.multiplier.max_lock_duration = secs)
    }

    pub fn set_seconds_per_month(&mut self, caller: &AccountId, secs: Seconds) -> Result<(), StakeError> {
        self.update_config(caller, |c| c.seconds_per_month = secs)
    }

    pub fn set_eject_buffer(&mut self, caller: &AccountId, secs: Seconds) -> Result<(), StakeError> {
        self.update_config(caller, |c| c.eject_buffer = secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakelock_core::config::MultiplierConfig;
    use stakelock_core::constants::{FIXED_POINT_UNIT, SECONDS_PER_DAY};
    use stakelock_core::types::TokenId;
    use stakelock_state::SledTokenLedger;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const D: u64 = SECONDS_PER_DAY;
    const UNIT: u128 = FIXED_POINT_UNIT;
    const NOW: Timestamp = 1_700_000_000;

    struct Fixture {
        ledger: LockLedger<SledTokenLedger, SledTokenLedger>,
        wallet: AccountId,
        admin: AccountId,
        custody: AccountId,
        receiver: AccountId,
        secret: [u8; 32],
    }

    fn setup() -> Fixture {
        let db = Arc::new(StateDb::open_temporary().unwrap());
        let admin = AccountId::derive(b"admin");
        let custody = AccountId::derive(b"timelock");
        let wallet = AccountId::derive(b"wallet");
        let receiver = AccountId::from_bytes({
            let mut b = [0u8; 32];
            b[31] = 1;
            b
        });

        let deposit = db.token_ledger(TokenId::new("DEP"));
        let shares = db.token_ledger(TokenId::new("dDEP"));
        deposit.credit(&wallet, 10 * UNIT).unwrap();
        deposit.approve(&wallet, &custody, 10 * UNIT).unwrap();
        let authority = shares.grant_mint_authority(&custody).unwrap();
        let secret = *authority.secret();

        let ledger = LockLedger::initialize(db, test_config(&admin, &custody), deposit, shares, authority).unwrap();
        Fixture { ledger, wallet, admin, custody, receiver, secret }
    }

    fn test_config(admin: &AccountId, custody: &AccountId) -> LockLedgerConfig {
        LockLedgerConfig::new(
            admin.clone(),
            custody.clone(),
            TokenId::new("DEP"),
            TokenId::new("dDEP"),
            MultiplierConfig::new(30 * D, 90 * D, 1).unwrap(),
        )
    }

    fn dep_balance(f: &Fixture, who: &AccountId) -> Balance {
        AssetLedger::balance_of(f.ledger.deposit_ledger(), who).unwrap()
    }

    fn share_balance(f: &Fixture, who: &AccountId) -> Balance {
        ShareLedger::balance_of(f.ledger.share_ledger(), who).unwrap()
    }

    // ── Setup ────────────────────────────────────────────────────────────────

    #[test]
    fn initialize_only_once() {
        let f = setup();
        let db = f.ledger.db.clone();
        let deposit = db.token_ledger(TokenId::new("DEP"));
        let shares = db.token_ledger(TokenId::new("dDEP"));
        let auth = MintAuthority::issue(TokenId::new("dDEP"), f.custody.clone(), f.secret);
        let err = LockLedger::initialize(db.clone(), f.ledger.config().clone(), deposit, shares, auth);
        assert!(matches!(err, Err(StakeError::AlreadyInitialized)));
    }

    #[test]
    fn open_rejects_forged_authority() {
        let f = setup();
        let db = f.ledger.db.clone();
        let forged = MintAuthority::issue(TokenId::new("dDEP"), f.custody.clone(), [9u8; 32]);
        let err = LockLedger::open(
            db.clone(),
            db.token_ledger(TokenId::new("DEP")),
            db.token_ledger(TokenId::new("dDEP")),
            forged,
        );
        assert!(matches!(err, Err(StakeError::AuthorityMismatch(_))));
    }

    #[test]
    fn reopen_keeps_config_and_locks() {
        let mut f = setup();
        f.ledger.deposit(&f.wallet, 5 * UNIT, 30 * D, &f.receiver, NOW).unwrap();
        let db = f.ledger.db.clone();
        let deposit = db.token_ledger(TokenId::new("DEP"));
        let shares = db.token_ledger(TokenId::new("dDEP"));
        let auth = MintAuthority::issue(TokenId::new("dDEP"), f.custody.clone(), f.secret);
        let reopened = LockLedger::open(db, deposit, shares, auth).unwrap();
        assert_eq!(reopened.config(), f.ledger.config());
        assert_eq!(reopened.locks_length().unwrap(), 1);
    }

    // ── Deposit ──────────────────────────────────────────────────────────────

    #[test]
    fn deposit_moves_funds_into_custody() {
        let mut f = setup();
        f.ledger.deposit(&f.wallet, 5 * UNIT, 30 * D, &f.receiver, NOW).unwrap();
        assert_eq!(dep_balance(&f, &f.custody), 5 * UNIT);
        f.ledger.deposit(&f.wallet, 5 * UNIT, 30 * D, &f.receiver, NOW).unwrap();
        assert_eq!(dep_balance(&f, &f.custody), 10 * UNIT);
        assert!(share_balance(&f, &f.receiver) > 0);
    }

    #[test]
    fn deposit_mints_amount_times_multiplier() {
        let mut f = setup();
        let wallet = f.wallet.clone();
        f.ledger.deposit(&wallet, 5 * UNIT, 30 * D, &wallet, NOW).unwrap();
        assert_eq!(share_balance(&f, &wallet), 1_666_666_666_666_666_665);
        f.ledger.deposit(&wallet, 5 * UNIT, 90 * D, &f.receiver, NOW).unwrap();
        assert_eq!(share_balance(&f, &f.receiver), 5 * UNIT);
    }

    #[test]
    fn deposit_pushes_lock_record() {
        let mut f = setup();
        let wallet = f.wallet.clone();
        let id = f.ledger.deposit(&wallet, 5 * UNIT, 30 * D, &wallet, NOW).unwrap();
        assert_eq!(id, 0);
        let lock = f.ledger.lock(0).unwrap();
        assert_eq!(lock.amount, 5 * UNIT);
        assert_eq!(lock.locked_at, NOW);
        assert_eq!(lock.lock_duration, 30 * D);
        assert_eq!(lock.owner, wallet);
        assert_eq!(f.ledger.locks_length().unwrap(), 1);
    }

    #[test]
    fn deposit_transfer_failure_leaves_no_trace() {
        let mut f = setup();
        let err = f.ledger.deposit(&f.wallet, 11 * UNIT, 30 * D, &f.receiver, NOW).unwrap_err();
        assert!(matches!(err, StakeError::TransferFailed(_)));
        assert!(err.to_string().contains("STF"));
        assert_eq!(f.ledger.locks_length().unwrap(), 0);
        assert_eq!(share_balance(&f, &f.receiver), 0);
        assert_eq!(dep_balance(&f, &f.wallet), 10 * UNIT);
    }

    #[test]
    fn deposit_rejects_bad_duration_and_amount() {
        let mut f = setup();
        let w = f.wallet.clone();
        let r = f.receiver.clone();
        assert!(matches!(
            f.ledger.deposit(&w, 10 * UNIT, 29 * D, &r, NOW),
            Err(StakeError::InvalidDuration { .. })
        ));
        assert!(matches!(
            f.ledger.deposit(&w, 10 * UNIT, 91 * D, &r, NOW),
            Err(StakeError::InvalidDuration { .. })
        ));
        assert!(matches!(f.ledger.deposit(&w, 0, 30 * D, &r, NOW), Err(StakeError::InvalidAmount(_))));

        let admin = f.admin.clone();
        f.ledger.set_min_lock_amount(&admin, UNIT).unwrap();
        assert!(matches!(
            f.ledger.deposit(&w, UNIT - 1, 30 * D, &r, NOW),
            Err(StakeError::InvalidAmount(_))
        ));
    }

    #[test]
    fn deposit_by_months_uses_month_length() {
        let mut f = setup();
        let w = f.wallet.clone();
        let r = f.receiver.clone();
        let id = f.ledger.deposit_by_months(&w, UNIT, 2, &r, NOW).unwrap();
        assert_eq!(f.ledger.lock(id).unwrap().lock_duration, 60 * D);
        assert!(matches!(
            f.ledger.deposit_by_months(&w, UNIT, 0, &r, NOW),
            Err(StakeError::InvalidDuration { .. })
        ));
        assert!(matches!(
            f.ledger.deposit_by_months(&w, UNIT, 4, &r, NOW),
            Err(StakeError::InvalidDuration { .. })
        ));
    }

    // ── Withdraw ─────────────────────────────────────────────────────────────

    #[test]
    fn withdraw_unknown_lock() {
        let mut f = setup();
        let w = f.wallet.clone();
        assert!(matches!(f.ledger.withdraw(&w, 1, NOW), Err(StakeError::NotFound(_))));
    }

    #[test]
    fn withdraw_by_non_owner_is_noop() {
        let mut f = setup();
        let w = f.wallet.clone();
        let r = f.receiver.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &r, NOW).unwrap();
        let before = f.ledger.lock(0).unwrap();
        let other = AccountId::derive(b"wallet1");
        assert_eq!(f.ledger.withdraw(&other, 0, NOW + 100 * D as i64), Err(StakeError::NotOwner));
        assert_eq!(f.ledger.lock(0).unwrap(), before);
        assert_eq!(dep_balance(&f, &f.custody), 5 * UNIT);
    }

    #[test]
    fn early_withdraw_rejected() {
        let mut f = setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        let err = f.ledger.withdraw(&w, 0, NOW + D as i64).unwrap_err();
        assert!(matches!(err, StakeError::NotExpired { .. }));
        assert!(err.to_string().starts_with("lock not expired"));
        assert!(f.ledger.lock(0).unwrap().is_active());
        assert_eq!(share_balance(&f, &w), 1_666_666_666_666_666_665);
        assert_eq!(dep_balance(&f, &f.custody), 5 * UNIT);
    }

    #[test]
    fn withdraw_round_trip() {
        let mut f = setup();
        let w = f.wallet.clone();
        let custody_before = dep_balance(&f, &f.custody);
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.withdraw(&w, 0, NOW + 100 * D as i64).unwrap();

        assert_eq!(share_balance(&f, &w), 0);
        assert_eq!(f.ledger.share_ledger().total_supply().unwrap(), 0);
        assert_eq!(dep_balance(&f, &w), 10 * UNIT);
        assert_eq!(dep_balance(&f, &f.custody), custody_before);
        assert_eq!(f.ledger.lock(0).unwrap(), Lock::cleared());
        assert_eq!(f.ledger.locks_length().unwrap(), 1);
    }

    #[test]
    fn withdraw_exactly_at_maturity() {
        let mut f = setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.withdraw(&w, 0, NOW + 30 * D as i64).unwrap();
    }

    #[test]
    fn withdraw_twice_fails() {
        let mut f = setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.withdraw(&w, 0, NOW + 30 * D as i64).unwrap();
        assert_eq!(f.ledger.withdraw(&w, 0, NOW + 31 * D as i64), Err(StakeError::LockWithdrawn(0)));
    }

    #[test]
    fn withdraw_burns_from_share_recipient() {
        let mut f = setup();
        let w = f.wallet.clone();
        let r = f.receiver.clone();
        f.ledger.deposit(&w, 5 * UNIT, 90 * D, &r, NOW).unwrap();
        f.ledger.withdraw(&w, 0, NOW + 90 * D as i64).unwrap();
        assert_eq!(share_balance(&f, &r), 0);
        assert_eq!(dep_balance(&f, &w), 10 * UNIT);
    }

    #[test]
    fn withdraw_burns_recorded_shares_after_config_change() {
        let mut f = setup();
        let w = f.wallet.clone();
        let admin = f.admin.clone();
        f.ledger.deposit(&w, 5 * UNIT, 60 * D, &w, NOW).unwrap();
        f.ledger.set_max_lock_duration(&admin, 120 * D).unwrap();
        f.ledger.withdraw(&w, 0, NOW + 60 * D as i64).unwrap();
        assert_eq!(share_balance(&f, &w), 0);
    }

    // ── Eject ────────────────────────────────────────────────────────────────

    #[test]
    fn eject_is_admin_only_and_respects_buffer() {
        let mut f = setup();
        let w = f.wallet.clone();
        let admin = f.admin.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.deposit(&w, UNIT, 90 * D, &w, NOW).unwrap();
        f.ledger.set_eject_buffer(&admin, D).unwrap();

        let matured = NOW + 30 * D as i64;
        assert_eq!(f.ledger.eject(&w, &[0], matured + D as i64), Err(StakeError::Unauthorized));
        assert!(matches!(f.ledger.eject(&admin, &[0], matured), Err(StakeError::NotExpired { .. })));
        // Lock 1 is not ejectable yet, so nothing in the batch is released.
        assert!(f.ledger.eject(&admin, &[0, 1], matured + D as i64).is_err());
        assert!(f.ledger.lock(0).unwrap().is_active());

        assert_eq!(f.ledger.eject(&admin, &[0, 0], matured + D as i64).unwrap(), vec![0]);
        assert!(!f.ledger.lock(0).unwrap().is_active());
        assert_eq!(dep_balance(&f, &w), 9 * UNIT);
    }

    #[test]
    fn eject_checks_custody_before_releasing() {
        let mut f = setup();
        let w = f.wallet.clone();
        let admin = f.admin.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        // Custody can only pay one of the two back.
        f.ledger.deposit_ledger().transfer(&f.custody, &admin, UNIT).unwrap();
        let shares_before = share_balance(&f, &w);

        let when = NOW + 30 * D as i64 + f.ledger.config().eject_buffer as i64;
        let err = f.ledger.eject(&admin, &[0, 1], when).unwrap_err();
        assert!(matches!(err, StakeError::TransferFailed(_)));
        assert!(f.ledger.lock(0).unwrap().is_active());
        assert!(f.ledger.lock(1).unwrap().is_active());
        assert_eq!(dep_balance(&f, &w), 8 * UNIT);
        assert_eq!(dep_balance(&f, &f.custody), UNIT);
        assert_eq!(share_balance(&f, &w), shares_before);
    }

    // ── Boost ────────────────────────────────────────────────────────────────

    #[test]
    fn boost_to_max_tops_up_shares() {
        let mut f = setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        let later = NOW + 10 * D as i64;
        let extra = f.ledger.boost_to_max(&w, 0, later).unwrap();
        assert_eq!(extra, 5 * UNIT - 1_666_666_666_666_666_665);
        assert_eq!(share_balance(&f, &w), 5 * UNIT);

        let lock = f.ledger.lock(0).unwrap();
        assert_eq!(lock.locked_at, later);
        assert_eq!(lock.lock_duration, 90 * D);
        assert_eq!(lock.shares, 5 * UNIT);
        assert!(matches!(f.ledger.withdraw(&w, 0, NOW + 90 * D as i64), Err(StakeError::NotExpired { .. })));
        f.ledger.withdraw(&w, 0, later + 90 * D as i64).unwrap();
        assert_eq!(share_balance(&f, &w), 0);
    }

    #[test]
    fn boost_by_non_owner_rejected() {
        let mut f = setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        let other = AccountId::derive(b"other");
        assert_eq!(f.ledger.boost_to_max(&other, 0, NOW), Err(StakeError::NotOwner));
    }

    // ── Administration ───────────────────────────────────────────────────────

    #[test]
    fn setters_are_admin_only_and_versioned() {
        let mut f = setup();
        let w = f.wallet.clone();
        let admin = f.admin.clone();
        assert_eq!(f.ledger.set_min_lock_amount(&w, 5), Err(StakeError::Unauthorized));
        f.ledger.set_min_lock_duration(&admin, 10 * D).unwrap();
        assert_eq!(f.ledger.config().version, 2);
        assert!(matches!(
            f.ledger.set_min_lock_duration(&admin, 90 * D),
            Err(StakeError::InvalidConfig(_))
        ));
        assert_eq!(f.ledger.config().multiplier.min_lock_duration, 10 * D);
        f.ledger.set_seconds_per_month(&admin, 31 * D).unwrap();
        assert_eq!(f.ledger.config().version, 3);
    }

    #[test]
    fn staking_data_reports_position() {
        let mut f = setup();
        let w = f.wallet.clone();
        let r = f.receiver.clone();
        f.ledger.deposit(&w, 2 * UNIT, 90 * D, &w, NOW).unwrap();
        f.ledger.deposit(&w, UNIT, 90 * D, &r, NOW).unwrap();
        let data = f.ledger.staking_data(&w, 0, 10).unwrap();
        assert_eq!(data.share_balance, 2 * UNIT);
        assert_eq!(data.deposit_balance, 7 * UNIT);
        assert_eq!(data.locks.locks.len(), 2);
    }

    // ── Partial failures ─────────────────────────────────────────────────────

    /// Switches shared between a ledger under test and the token doubles.
    #[derive(Default)]
    struct Faults {
        mint: Cell<bool>,
        burn_from: RefCell<Option<AccountId>>,
        transfer_to: RefCell<Option<AccountId>>,
    }

    fn injected() -> StakeError {
        StakeError::Storage("injected fault".into())
    }

    struct FaultyAsset {
        inner: SledTokenLedger,
        faults: Rc<Faults>,
    }

    impl AssetLedger for FaultyAsset {
        fn token(&self) -> &TokenId {
            AssetLedger::token(&self.inner)
        }

        fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError> {
            AssetLedger::balance_of(&self.inner, who)
        }

        fn transfer(&self, from: &AccountId, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
            if self.faults.transfer_to.borrow().as_ref() == Some(to) {
                return Err(injected());
            }
            self.inner.transfer(from, to, amount)
        }

        fn transfer_from(
            &self,
            spender: &AccountId,
            from: &AccountId,
            to: &AccountId,
            amount: Balance,
        ) -> Result<(), StakeError> {
            self.inner.transfer_from(spender, from, to, amount)
        }
    }

    struct FaultyShares {
        inner: SledTokenLedger,
        faults: Rc<Faults>,
    }

    impl ShareLedger for FaultyShares {
        fn token(&self) -> &TokenId {
            ShareLedger::token(&self.inner)
        }

        fn balance_of(&self, who: &AccountId) -> Result<Balance, StakeError> {
            ShareLedger::balance_of(&self.inner, who)
        }

        fn total_supply(&self) -> Result<Balance, StakeError> {
            self.inner.total_supply()
        }

        fn check_authority(&self, authority: &MintAuthority) -> Result<(), StakeError> {
            self.inner.check_authority(authority)
        }

        fn mint(&self, authority: &MintAuthority, to: &AccountId, amount: Balance) -> Result<(), StakeError> {
            if self.faults.mint.get() {
                return Err(injected());
            }
            self.inner.mint(authority, to, amount)
        }

        fn burn(&self, authority: &MintAuthority, from: &AccountId, amount: Balance) -> Result<(), StakeError> {
            if self.faults.burn_from.borrow().as_ref() == Some(from) {
                return Err(injected());
            }
            self.inner.burn(authority, from, amount)
        }
    }

    struct FaultyFixture {
        ledger: LockLedger<FaultyAsset, FaultyShares>,
        faults: Rc<Faults>,
        wallet: AccountId,
        other: AccountId,
        admin: AccountId,
        custody: AccountId,
    }

    impl FaultyFixture {
        fn deposits(&self, who: &AccountId) -> Balance {
            self.ledger.deposit_ledger().balance_of(who).unwrap()
        }

        fn shares(&self, who: &AccountId) -> Balance {
            self.ledger.share_ledger().balance_of(who).unwrap()
        }
    }

    fn faulty_setup() -> FaultyFixture {
        let db = Arc::new(StateDb::open_temporary().unwrap());
        let admin = AccountId::derive(b"admin");
        let custody = AccountId::derive(b"timelock");
        let wallet = AccountId::derive(b"wallet");
        let other = AccountId::derive(b"other");

        let deposit = db.token_ledger(TokenId::new("DEP"));
        let shares = db.token_ledger(TokenId::new("dDEP"));
        for who in [&wallet, &other] {
            deposit.credit(who, 10 * UNIT).unwrap();
            deposit.approve(who, &custody, 10 * UNIT).unwrap();
        }
        let authority = shares.grant_mint_authority(&custody).unwrap();

        let faults = Rc::new(Faults::default());
        let ledger = LockLedger::initialize(
            db,
            test_config(&admin, &custody),
            FaultyAsset { inner: deposit, faults: faults.clone() },
            FaultyShares { inner: shares, faults: faults.clone() },
            authority,
        )
        .unwrap();
        FaultyFixture { ledger, faults, wallet, other, admin, custody }
    }

    #[test]
    fn deposit_refunds_when_mint_fails() {
        let mut f = faulty_setup();
        let w = f.wallet.clone();
        f.faults.mint.set(true);
        assert_eq!(f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW), Err(injected()));
        assert_eq!(f.deposits(&w), 10 * UNIT);
        assert_eq!(f.deposits(&f.custody), 0);
        assert_eq!(f.shares(&w), 0);
        assert_eq!(f.ledger.locks_length().unwrap(), 0);
    }

    #[test]
    fn withdraw_restores_slot_when_burn_fails() {
        let mut f = faulty_setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        let before = f.ledger.lock(0).unwrap();
        let shares = f.shares(&w);

        *f.faults.burn_from.borrow_mut() = Some(w.clone());
        assert_eq!(f.ledger.withdraw(&w, 0, NOW + 30 * D as i64), Err(injected()));
        assert_eq!(f.ledger.lock(0).unwrap(), before);
        assert_eq!(f.shares(&w), shares);
        assert_eq!(f.deposits(&w), 5 * UNIT);
        assert_eq!(f.deposits(&f.custody), 5 * UNIT);
    }

    #[test]
    fn withdraw_remints_shares_when_payout_fails() {
        let mut f = faulty_setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        let before = f.ledger.lock(0).unwrap();
        let shares = f.shares(&w);
        let supply = f.ledger.share_ledger().total_supply().unwrap();

        *f.faults.transfer_to.borrow_mut() = Some(w.clone());
        let err = f.ledger.withdraw(&w, 0, NOW + 30 * D as i64).unwrap_err();
        assert!(matches!(err, StakeError::TransferFailed(_)));
        assert_eq!(f.ledger.lock(0).unwrap(), before);
        assert_eq!(f.shares(&w), shares);
        assert_eq!(f.ledger.share_ledger().total_supply().unwrap(), supply);
        assert_eq!(f.deposits(&f.custody), 5 * UNIT);

        // Once the payout path recovers the same lock withdraws normally.
        *f.faults.transfer_to.borrow_mut() = None;
        f.ledger.withdraw(&w, 0, NOW + 30 * D as i64).unwrap();
        assert_eq!(f.deposits(&w), 10 * UNIT);
    }

    #[test]
    fn boost_restores_lock_when_mint_fails() {
        let mut f = faulty_setup();
        let w = f.wallet.clone();
        f.ledger.deposit(&w, 5 * UNIT, 30 * D, &w, NOW).unwrap();
        let before = f.ledger.lock(0).unwrap();
        let shares = f.shares(&w);

        f.faults.mint.set(true);
        assert_eq!(f.ledger.boost_to_max(&w, 0, NOW + D as i64), Err(injected()));
        assert_eq!(f.ledger.lock(0).unwrap(), before);
        assert_eq!(f.shares(&w), shares);
    }

    #[test]
    fn eject_rolls_back_released_locks_on_later_failure() {
        let mut f = faulty_setup();
        let w = f.wallet.clone();
        let o = f.other.clone();
        let admin = f.admin.clone();
        f.ledger.deposit(&w, UNIT, 30 * D, &w, NOW).unwrap();
        f.ledger.deposit(&o, 2 * UNIT, 30 * D, &o, NOW).unwrap();
        let locks = [f.ledger.lock(0).unwrap(), f.ledger.lock(1).unwrap()];
        let supply = f.ledger.share_ledger().total_supply().unwrap();
        let wallet_shares = f.shares(&w);

        // Lock 0 releases, then the payout for lock 1 fails.
        *f.faults.transfer_to.borrow_mut() = Some(o.clone());
        let when = NOW + 30 * D as i64 + f.ledger.config().eject_buffer as i64;
        let err = f.ledger.eject(&admin, &[0, 1], when).unwrap_err();
        assert!(matches!(err, StakeError::TransferFailed(_)));

        assert_eq!(f.ledger.lock(0).unwrap(), locks[0]);
        assert_eq!(f.ledger.lock(1).unwrap(), locks[1]);
        assert_eq!(f.deposits(&w), 9 * UNIT);
        assert_eq!(f.deposits(&o), 8 * UNIT);
        assert_eq!(f.deposits(&f.custody), 3 * UNIT);
        assert_eq!(f.shares(&w), wallet_shares);
        assert_eq!(f.ledger.share_ledger().total_supply().unwrap(), supply);

        *f.faults.transfer_to.borrow_mut() = None;
        assert_eq!(f.ledger.eject(&admin, &[1, 0, 1], when).unwrap(), vec![1, 0]);
        assert_eq!(f.deposits(&f.custody), 0);
        assert_eq!(f.ledger.share_ledger().total_supply().unwrap(), 0);
    }
}
