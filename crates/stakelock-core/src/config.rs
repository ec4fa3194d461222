use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_EJECT_BUFFER_SECS, DEFAULT_MAX_LOCK_DURATION_SECS, DEFAULT_MIN_DEPOSIT_AMOUNT,
    DEFAULT_MIN_LOCK_DURATION_SECS, DEFAULT_SECONDS_PER_MONTH,
};
use crate::error::StakeError;
use crate::types::{AccountId, Balance, Seconds, TokenId};

// ── MultiplierConfig ─────────────────────────────────────────────────────────

/// Bounds on what a deposit may look like.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierConfig {
    pub min_lock_duration: Seconds,
    pub max_lock_duration: Seconds,
    pub min_deposit_amount: Balance,
}

impl MultiplierConfig {
    pub fn new(
        min_lock_duration: Seconds,
        max_lock_duration: Seconds,
        min_deposit_amount: Balance,
    ) -> Result<Self, StakeError> {
        let cfg = Self { min_lock_duration, max_lock_duration, min_deposit_amount };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), StakeError> {
        if self.min_lock_duration == 0 {
            return Err(StakeError::InvalidConfig("min lock duration must be > 0".into()));
        }
        if self.min_lock_duration >= self.max_lock_duration {
            return Err(StakeError::InvalidConfig("min>=max".into()));
        }
        Ok(())
    }
}

impl Default for MultiplierConfig {
    fn default() -> Self {
        Self {
            min_lock_duration: DEFAULT_MIN_LOCK_DURATION_SECS,
            max_lock_duration: DEFAULT_MAX_LOCK_DURATION_SECS,
            min_deposit_amount: DEFAULT_MIN_DEPOSIT_AMOUNT,
        }
    }
}

// ── LockLedgerConfig ─────────────────────────────────────────────────────────

/// Full lock-ledger configuration. Replaced as a whole on every admin update;
/// `version` increases by one each time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLedgerConfig {
    pub version: u32,
    pub admin: AccountId,
    /// Account that holds deposited principal.
    pub custody: AccountId,
    pub deposit_token: TokenId,
    pub share_token: TokenId,
    pub multiplier: MultiplierConfig,
    pub seconds_per_month: Seconds,
    pub eject_buffer: Seconds,
}

impl LockLedgerConfig {
    pub fn new(
        admin: AccountId,
        custody: AccountId,
        deposit_token: TokenId,
        share_token: TokenId,
        multiplier: MultiplierConfig,
    ) -> Self {
        Self {
            version: 1,
            admin,
            custody,
            deposit_token,
            share_token,
            multiplier,
            seconds_per_month: DEFAULT_SECONDS_PER_MONTH,
            eject_buffer: DEFAULT_EJECT_BUFFER_SECS,
        }
    }

    pub fn validate(&self) -> Result<(), StakeError> {
        self.multiplier.validate()?;
        if self.seconds_per_month == 0 {
            return Err(StakeError::InvalidConfig("seconds per month must be > 0".into()));
        }
        if self.custody.is_zero() {
            return Err(StakeError::InvalidConfig("custody account must be non-zero".into()));
        }
        if self.deposit_token == self.share_token {
            return Err(StakeError::InvalidConfig("deposit and share token must differ".into()));
        }
        Ok(())
    }

    /// Copy with `update` applied and the version bumped, validated as a whole.
    pub fn next_version<F>(&self, update: F) -> Result<Self, StakeError>
    where
        F: FnOnce(&mut Self),
    {
        let mut next = self.clone();
        update(&mut next);
        next.version = self.version.checked_add(1).ok_or(StakeError::Overflow)?;
        next.validate()?;
        Ok(next)
    }
}

// ── DistributorConfig ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorConfig {
    pub admin: AccountId,
    /// Account that holds reward tokens awaiting claims.
    pub custody: AccountId,
}

impl DistributorConfig {
    pub fn validate(&self) -> Result<(), StakeError> {
        if self.custody.is_zero() {
            return Err(StakeError::InvalidConfig("custody account must be non-zero".into()));
        }
        Ok(())
    }
}
